pub mod attendance;
pub mod cba;
pub mod core;
pub mod exams;
pub mod marks;
pub mod materials;
pub mod students;
pub mod subjects;
pub mod timetable;

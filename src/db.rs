use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("campus.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            code TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            enrollment_no TEXT,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            class INTEGER NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exams(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            class INTEGER NOT NULL,
            exam_type TEXT NOT NULL,
            total_marks INTEGER NOT NULL,
            timetable_link TEXT,
            start_date TEXT,
            end_date TEXT,
            created_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exams_class ON exams(class)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_schedules(
            exam_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            date TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            marks INTEGER NOT NULL,
            PRIMARY KEY(exam_id, subject_id),
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS ceilings(
            domain TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            class INTEGER NOT NULL,
            ceiling INTEGER NOT NULL,
            updated_at TEXT,
            PRIMARY KEY(domain, subject_id, class)
        )",
        [],
    )?;

    // exam_id is '' (not NULL) when the domain has no exam dimension, so the
    // unique index holds for attendance rows too.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS progress_records(
            id TEXT PRIMARY KEY,
            domain TEXT NOT NULL,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            class INTEGER NOT NULL,
            exam_id TEXT NOT NULL DEFAULT '',
            value INTEGER NOT NULL,
            ceiling INTEGER NOT NULL,
            updated_at TEXT,
            UNIQUE(domain, student_id, subject_id, class, exam_id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_progress_key ON progress_records(domain, subject_id, class)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_progress_student ON progress_records(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS cba_records(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            exam_id TEXT NOT NULL,
            class INTEGER NOT NULL,
            understanding TEXT NOT NULL,
            application TEXT NOT NULL,
            communication TEXT NOT NULL,
            participation TEXT NOT NULL,
            faculty_id TEXT NOT NULL,
            updated_at TEXT,
            UNIQUE(student_id, subject_id, exam_id, class),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_cba_student ON cba_records(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS materials(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            class INTEGER NOT NULL,
            material_type TEXT NOT NULL,
            link TEXT NOT NULL,
            faculty_id TEXT NOT NULL,
            created_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_materials_class ON materials(class)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS material_views(
            material_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            viewed_at TEXT NOT NULL,
            PRIMARY KEY(material_id, student_id),
            FOREIGN KEY(material_id) REFERENCES materials(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetables(
            class INTEGER PRIMARY KEY,
            link TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;

    // Early workspaces stored exams without a timetable link. Add if needed.
    ensure_exams_timetable_link(conn)?;

    Ok(())
}

fn ensure_exams_timetable_link(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "exams", "timetable_link")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE exams ADD COLUMN timetable_link TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

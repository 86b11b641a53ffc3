use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::progress::{self, BatchEntry, CounterKey, Domain};
use rusqlite::Connection;
use serde_json::json;
use std::collections::HashMap;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<progress::ProgressError> for HandlerErr {
    fn from(e: progress::ProgressError) -> Self {
        HandlerErr {
            code: e.code(),
            details: e.details(),
            message: e.to_string(),
        }
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn get_required_class(params: &serde_json::Value) -> Result<i64, HandlerErr> {
    params
        .get("class")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing class".to_string(),
            details: None,
        })
}

fn attendance_key<'a>(subject_id: &'a str, class: i64) -> CounterKey<'a> {
    CounterKey {
        domain: Domain::Attendance,
        subject_id,
        class,
        exam_id: None,
    }
}

fn set_total_classes(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    let class = get_required_class(params)?;
    let total = params
        .get("totalClasses")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing totalClasses".to_string(),
            details: None,
        })?;

    progress::set_ceiling(conn, Domain::Attendance, &subject_id, class, total)?;
    tracing::debug!(subject = %subject_id, class, total, "attendance ceiling set");

    Ok(json!({
        "subjectId": subject_id,
        "class": class,
        "totalClasses": total
    }))
}

fn get_total_classes(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    let class = get_required_class(params)?;

    let ceiling = progress::get_ceiling(conn, Domain::Attendance, &subject_id, class)?;
    Ok(json!({
        "subjectId": subject_id,
        "class": class,
        "totalClasses": ceiling.unwrap_or(0),
        "configured": ceiling.is_some()
    }))
}

fn update_bulk(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    let class = get_required_class(params)?;
    let Some(rows) = params.get("attendance").and_then(|v| v.as_array()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing attendance array".to_string(),
            details: None,
        });
    };

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let student_id = get_required_str(row, "studentId")?;
        let value = row
            .get("classesAttended")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| HandlerErr {
                code: "bad_params",
                message: format!("missing classesAttended for student {}", student_id),
                details: None,
            })?;
        entries.push(BatchEntry { student_id, value });
    }

    // Ceiling must be configured before any attendance is recorded.
    let ceiling = progress::require_ceiling(conn, Domain::Attendance, &subject_id, class)?;
    let key = attendance_key(&subject_id, class);
    let records = progress::reconcile(conn, &key, ceiling, &entries)?;

    let rows_json: Vec<serde_json::Value> = records
        .iter()
        .map(|r| {
            json!({
                "studentId": r.student_id,
                "classesAttended": r.value,
                "totalClasses": r.ceiling
            })
        })
        .collect();
    Ok(json!({ "records": rows_json }))
}

fn class_open(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    let class = get_required_class(params)?;

    let config_ceiling = progress::get_ceiling(conn, Domain::Attendance, &subject_id, class)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, enrollment_no, first_name, last_name FROM students
             WHERE class = ? ORDER BY last_name, first_name",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let students = stmt
        .query_map([class], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, Option<String>>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    let mut by_student: HashMap<String, (i64, i64)> = HashMap::new();
    let mut stmt = conn
        .prepare(
            "SELECT student_id, value, ceiling FROM progress_records
             WHERE domain = 'attendance' AND subject_id = ? AND class = ?",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let recs = stmt
        .query_map((&subject_id, class), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    for (student_id, value, ceiling) in recs {
        by_student.insert(student_id, (value, ceiling));
    }

    let rows_json: Vec<serde_json::Value> = students
        .iter()
        .map(|(id, enrollment_no, first, last)| {
            let (attended, total) = by_student
                .get(id)
                .copied()
                .unwrap_or((0, config_ceiling.unwrap_or(0)));
            json!({
                "studentId": id,
                "enrollmentNo": enrollment_no,
                "firstName": first,
                "lastName": last,
                "classesAttended": attended,
                "totalClasses": total
            })
        })
        .collect();

    Ok(json!({
        "totalClasses": config_ceiling.unwrap_or(0),
        "configured": config_ceiling.is_some(),
        "students": rows_json
    }))
}

fn student_view(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let class = get_required_class(params)?;

    let mut stmt = conn
        .prepare(
            "SELECT p.subject_id, s.name, p.value, p.ceiling
             FROM progress_records p
             LEFT JOIN subjects s ON s.id = p.subject_id
             WHERE p.domain = 'attendance' AND p.student_id = ? AND p.class = ?
             ORDER BY s.name",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows = stmt
        .query_map((&student_id, class), |r| {
            let subject_id: String = r.get(0)?;
            let subject_name: Option<String> = r.get(1)?;
            let value: i64 = r.get(2)?;
            let ceiling: i64 = r.get(3)?;
            Ok(json!({
                "subjectId": subject_id,
                "subjectName": subject_name,
                "classesAttended": value,
                "totalClasses": ceiling,
                "attendancePercentage": progress::percentage(value, ceiling)
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "attendance": rows }))
}

fn get_progress(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    let class = get_required_class(params)?;
    let student_id = get_required_str(params, "studentId")?;

    let key = attendance_key(&subject_id, class);
    let Some(rec) = progress::find_record(conn, &key, &student_id)? else {
        return Err(HandlerErr {
            code: "not_found",
            message: "no attendance record for that student".to_string(),
            details: Some(json!({ "studentId": student_id })),
        });
    };
    Ok(json!({
        "studentId": rec.student_id,
        "classesAttended": rec.value,
        "totalClasses": rec.ceiling,
        "attendancePercentage": progress::percentage(rec.value, rec.ceiling)
    }))
}

fn dispatch(
    state: &mut AppState,
    req: &Request,
    f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.setTotalClasses" => Some(dispatch(state, req, set_total_classes)),
        "attendance.getTotalClasses" => Some(dispatch(state, req, get_total_classes)),
        "attendance.updateBulk" => Some(dispatch(state, req, update_bulk)),
        "attendance.classOpen" => Some(dispatch(state, req, class_open)),
        "attendance.getProgress" => Some(dispatch(state, req, get_progress)),
        "attendance.studentView" => Some(dispatch(state, req, student_view)),
        _ => None,
    }
}

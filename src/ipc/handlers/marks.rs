use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::progress::{self, BatchEntry, CounterKey, Domain};
use rusqlite::{Connection, OptionalExtension};
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

    fn db(e: rusqlite::Error) -> Self {
        HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        }
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

/// The marks ceiling comes from the exam: the per-subject scheduled marks
/// when a schedule row exists, otherwise the exam's overall total.
fn exam_ceiling(
    conn: &Connection,
    exam_id: &str,
    subject_id: &str,
) -> Result<i64, HandlerErr> {
    let scheduled: Option<i64> = conn
        .query_row(
            "SELECT marks FROM exam_schedules WHERE exam_id = ? AND subject_id = ?",
            (exam_id, subject_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    if let Some(m) = scheduled {
        return Ok(m);
    }

    let total: Option<i64> = conn
        .query_row("SELECT total_marks FROM exams WHERE id = ?", [exam_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db)?;
    total.ok_or_else(|| HandlerErr {
        code: "precondition_failed",
        message: "exam total marks must be set before recording marks".to_string(),
        details: Some(json!({ "examId": exam_id })),
    })
}

fn bulk_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let class = get_required_class(params)?;
    let Some(rows) = params.get("marks").and_then(|v| v.as_array()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing marks array".to_string(),
            details: None,
        });
    };

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let student_id = get_required_str(row, "studentId")?;
        let value = row
            .get("obtainedMarks")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| HandlerErr {
                code: "bad_params",
                message: format!("missing obtainedMarks for student {}", student_id),
                details: None,
            })?;
        entries.push(BatchEntry { student_id, value });
    }

    let ceiling = exam_ceiling(conn, &exam_id, &subject_id)?;
    let key = CounterKey {
        domain: Domain::Marks,
        subject_id: &subject_id,
        class,
        exam_id: Some(&exam_id),
    };
    let records = progress::reconcile(conn, &key, ceiling, &entries)?;

    let rows_json: Vec<serde_json::Value> = records
        .iter()
        .map(|r| {
            json!({
                "recordId": r.id,
                "studentId": r.student_id,
                "obtainedMarks": r.value,
                "totalMarks": r.ceiling
            })
        })
        .collect();
    Ok(json!({ "records": rows_json }))
}

fn class_open(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let class = get_required_class(params)?;

    let ceiling = exam_ceiling(conn, &exam_id, &subject_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, enrollment_no, first_name, last_name FROM students
             WHERE class = ? ORDER BY last_name, first_name",
        )
        .map_err(HandlerErr::db)?;
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
        .map_err(HandlerErr::db)?;

    let mut by_student: HashMap<String, i64> = HashMap::new();
    let mut stmt = conn
        .prepare(
            "SELECT student_id, value FROM progress_records
             WHERE domain = 'marks' AND subject_id = ? AND class = ? AND exam_id = ?",
        )
        .map_err(HandlerErr::db)?;
    let recs = stmt
        .query_map((&subject_id, class, &exam_id), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    for (student_id, value) in recs {
        by_student.insert(student_id, value);
    }

    let rows_json: Vec<serde_json::Value> = students
        .iter()
        .map(|(id, enrollment_no, first, last)| {
            json!({
                "studentId": id,
                "enrollmentNo": enrollment_no,
                "firstName": first,
                "lastName": last,
                "obtainedMarks": by_student.get(id).copied().unwrap_or(0)
            })
        })
        .collect();

    Ok(json!({ "totalMarks": ceiling, "students": rows_json }))
}

fn student_view(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let class = get_required_class(params)?;

    let mut stmt = conn
        .prepare(
            "SELECT p.subject_id, s.name, p.exam_id, e.name, e.exam_type, p.value, p.ceiling
             FROM progress_records p
             LEFT JOIN subjects s ON s.id = p.subject_id
             LEFT JOIN exams e ON e.id = p.exam_id
             WHERE p.domain = 'marks' AND p.student_id = ? AND p.class = ?
             ORDER BY e.name, s.name",
        )
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map((&student_id, class), |r| {
            let subject_id: String = r.get(0)?;
            let subject_name: Option<String> = r.get(1)?;
            let exam_id: String = r.get(2)?;
            let exam_name: Option<String> = r.get(3)?;
            let exam_type: Option<String> = r.get(4)?;
            let value: i64 = r.get(5)?;
            let ceiling: i64 = r.get(6)?;
            let pct = progress::percentage(value, ceiling);
            Ok(json!({
                "subjectId": subject_id,
                "subjectName": subject_name,
                "examId": exam_id,
                "examName": exam_name,
                "examType": exam_type,
                "obtainedMarks": value,
                "totalMarks": ceiling,
                "percentage": pct,
                "grade": progress::grade_letter(pct)
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    Ok(json!({ "marks": rows }))
}

fn get_progress(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let class = get_required_class(params)?;
    let student_id = get_required_str(params, "studentId")?;

    let key = CounterKey {
        domain: Domain::Marks,
        subject_id: &subject_id,
        class,
        exam_id: Some(&exam_id),
    };
    let Some(rec) = progress::find_record(conn, &key, &student_id)? else {
        return Err(HandlerErr {
            code: "not_found",
            message: "no marks record for that student".to_string(),
            details: Some(json!({ "studentId": student_id })),
        });
    };
    let pct = progress::percentage(rec.value, rec.ceiling);
    Ok(json!({
        "studentId": rec.student_id,
        "obtainedMarks": rec.value,
        "totalMarks": rec.ceiling,
        "percentage": pct,
        "grade": progress::grade_letter(pct)
    }))
}

fn delete_record(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let record_id = get_required_str(params, "recordId")?;
    let n = conn
        .execute(
            "DELETE FROM progress_records WHERE id = ? AND domain = 'marks'",
            [&record_id],
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    if n == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "marks record not found".to_string(),
            details: None,
        });
    }
    Ok(json!({ "deleted": true }))
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
        "marks.bulkUpdate" => Some(dispatch(state, req, bulk_update)),
        "marks.classOpen" => Some(dispatch(state, req, class_open)),
        "marks.getProgress" => Some(dispatch(state, req, get_progress)),
        "marks.studentView" => Some(dispatch(state, req, student_view)),
        "marks.delete" => Some(dispatch(state, req, delete_record)),
        _ => None,
    }
}

use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::progress::{self, CounterKey, Domain};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

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

struct ScheduleRow {
    subject_id: String,
    date: NaiveDate,
    start_time: String,
    end_time: String,
    marks: i64,
}

fn parse_schedules(params: &serde_json::Value) -> Result<Vec<ScheduleRow>, HandlerErr> {
    let Some(rows) = params.get("schedules").and_then(|v| v.as_array()) else {
        return Ok(Vec::new());
    };
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let subject_id = get_required_str(row, "subjectId")?;
        let date_raw = get_required_str(row, "date")?;
        let date = NaiveDate::parse_from_str(&date_raw, "%Y-%m-%d").map_err(|_| HandlerErr {
            code: "bad_params",
            message: "schedule date must be YYYY-MM-DD".to_string(),
            details: Some(json!({ "date": date_raw })),
        })?;
        let start_time = get_required_str(row, "startTime")?;
        let end_time = get_required_str(row, "endTime")?;
        let marks = row
            .get("marks")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| HandlerErr {
                code: "bad_params",
                message: "provide marks for each scheduled subject".to_string(),
                details: Some(json!({ "subjectId": subject_id })),
            })?;
        if marks < 0 {
            return Err(HandlerErr {
                code: "bad_params",
                message: "scheduled marks cannot be negative".to_string(),
                details: Some(json!({ "subjectId": subject_id, "marks": marks })),
            });
        }
        out.push(ScheduleRow {
            subject_id,
            date,
            start_time,
            end_time,
            marks,
        });
    }
    Ok(out)
}

fn exams_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let Some(class) = params.get("class").and_then(|v| v.as_i64()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing class".to_string(),
            details: None,
        });
    };
    let exam_type = get_required_str(params, "examType")?;
    if exam_type != "mid" && exam_type != "end" {
        return Err(HandlerErr {
            code: "bad_params",
            message: "examType must be one of: mid, end".to_string(),
            details: Some(json!({ "examType": exam_type })),
        });
    }
    let total_marks = params
        .get("totalMarks")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing totalMarks".to_string(),
            details: None,
        })?;
    if total_marks < 0 {
        return Err(HandlerErr {
            code: "bad_params",
            message: "totalMarks cannot be negative".to_string(),
            details: Some(json!({ "totalMarks": total_marks })),
        });
    }
    let timetable_link = params
        .get("timetableLink")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let schedules = parse_schedules(params)?;

    // List views show the exam span; derive it from the schedule dates.
    let start_date = schedules.iter().map(|s| s.date).min();
    let end_date = schedules.iter().map(|s| s.date).max();

    let exam_id = Uuid::new_v4().to_string();
    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    tx.execute(
        "INSERT INTO exams(id, name, class, exam_type, total_marks, timetable_link,
                           start_date, end_date, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &exam_id,
            &name,
            class,
            &exam_type,
            total_marks,
            &timetable_link,
            start_date.map(|d| d.to_string()),
            end_date.map(|d| d.to_string()),
            chrono::Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "exams" })),
    })?;
    for s in &schedules {
        tx.execute(
            "INSERT INTO exam_schedules(exam_id, subject_id, date, start_time, end_time, marks)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                &exam_id,
                &s.subject_id,
                s.date.to_string(),
                &s.start_time,
                &s.end_time,
                s.marks,
            ),
        )
        .map_err(|e| HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "exam_schedules" })),
        })?;
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "examId": exam_id }))
}

fn exams_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class = params.get("class").and_then(|v| v.as_i64());
    let exam_type = params.get("examType").and_then(|v| v.as_str());

    let mut sql = String::from(
        "SELECT id, name, class, exam_type, total_marks, timetable_link, start_date, end_date
         FROM exams WHERE 1=1",
    );
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(c) = class {
        sql.push_str(" AND class = ?");
        binds.push(c.into());
    }
    if let Some(t) = exam_type {
        sql.push_str(" AND exam_type = ?");
        binds.push(t.to_string().into());
    }
    sql.push_str(" ORDER BY created_at DESC");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
    let exams = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "class": r.get::<_, i64>(2)?,
                "examType": r.get::<_, String>(3)?,
                "totalMarks": r.get::<_, i64>(4)?,
                "timetableLink": r.get::<_, Option<String>>(5)?,
                "startDate": r.get::<_, Option<String>>(6)?,
                "endDate": r.get::<_, Option<String>>(7)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    // Attach schedules per exam.
    let mut out = Vec::with_capacity(exams.len());
    for mut exam in exams {
        let exam_id = exam
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let mut stmt = conn
            .prepare(
                "SELECT es.subject_id, s.name, es.date, es.start_time, es.end_time, es.marks
                 FROM exam_schedules es
                 LEFT JOIN subjects s ON s.id = es.subject_id
                 WHERE es.exam_id = ? ORDER BY es.date",
            )
            .map_err(HandlerErr::db)?;
        let schedules = stmt
            .query_map([&exam_id], |r| {
                Ok(json!({
                    "subjectId": r.get::<_, String>(0)?,
                    "subjectName": r.get::<_, Option<String>>(1)?,
                    "date": r.get::<_, String>(2)?,
                    "startTime": r.get::<_, String>(3)?,
                    "endTime": r.get::<_, String>(4)?,
                    "marks": r.get::<_, i64>(5)?
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db)?;
        exam["schedules"] = json!(schedules);
        out.push(exam);
    }

    Ok(json!({ "exams": out }))
}

/// Change an exam's marks ceiling. Scoped to one subject when `subjectId` is
/// given (schedule row), otherwise the exam-wide total. Either way the new
/// ceiling is propagated onto existing marks records, values untouched.
fn exams_update_total_marks(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;
    let total_marks = params
        .get("totalMarks")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing totalMarks".to_string(),
            details: None,
        })?;
    if total_marks < 0 {
        return Err(HandlerErr {
            code: "bad_params",
            message: "totalMarks cannot be negative".to_string(),
            details: Some(json!({ "totalMarks": total_marks })),
        });
    }

    let class: Option<i64> = conn
        .query_row("SELECT class FROM exams WHERE id = ?", [&exam_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db)?;
    let Some(class) = class else {
        return Err(HandlerErr {
            code: "not_found",
            message: "exam not found".to_string(),
            details: None,
        });
    };

    match params.get("subjectId").and_then(|v| v.as_str()) {
        Some(subject_id) => {
            let n = conn
                .execute(
                    "UPDATE exam_schedules SET marks = ? WHERE exam_id = ? AND subject_id = ?",
                    (total_marks, &exam_id, subject_id),
                )
                .map_err(|e| HandlerErr {
                    code: "db_update_failed",
                    message: e.to_string(),
                    details: None,
                })?;
            if n == 0 {
                return Err(HandlerErr {
                    code: "not_found",
                    message: "no schedule for that subject".to_string(),
                    details: Some(json!({ "examId": exam_id, "subjectId": subject_id })),
                });
            }
            let key = CounterKey {
                domain: Domain::Marks,
                subject_id,
                class,
                exam_id: Some(&exam_id),
            };
            let updated = progress::propagate_ceiling(conn, &key, total_marks)?;
            Ok(json!({ "updatedRecords": updated }))
        }
        None => {
            conn.execute(
                "UPDATE exams SET total_marks = ? WHERE id = ?",
                (total_marks, &exam_id),
            )
            .map_err(|e| HandlerErr {
                code: "db_update_failed",
                message: e.to_string(),
                details: None,
            })?;
            // Only records whose ceiling derives from the exam-wide total,
            // i.e. subjects without a schedule row of their own.
            let updated = conn
                .execute(
                    "UPDATE progress_records SET ceiling = ?, updated_at = ?
                     WHERE domain = 'marks' AND exam_id = ?
                       AND subject_id NOT IN (
                         SELECT subject_id FROM exam_schedules WHERE exam_id = ?
                       )",
                    (
                        total_marks,
                        chrono::Utc::now().to_rfc3339(),
                        &exam_id,
                        &exam_id,
                    ),
                )
                .map_err(|e| HandlerErr {
                    code: "db_update_failed",
                    message: e.to_string(),
                    details: None,
                })?;
            Ok(json!({ "updatedRecords": updated }))
        }
    }
}

fn exams_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM exams WHERE id = ?", [&exam_id], |r| r.get(0))
        .optional()
        .map_err(HandlerErr::db)?;
    if exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "exam not found".to_string(),
            details: None,
        });
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    for sql in [
        "DELETE FROM progress_records WHERE domain = 'marks' AND exam_id = ?",
        "DELETE FROM cba_records WHERE exam_id = ?",
        "DELETE FROM exam_schedules WHERE exam_id = ?",
        "DELETE FROM exams WHERE id = ?",
    ] {
        tx.execute(sql, [&exam_id]).map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

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
        "exams.create" => Some(dispatch(state, req, exams_create)),
        "exams.list" => Some(dispatch(state, req, exams_list)),
        "exams.updateTotalMarks" => Some(dispatch(state, req, exams_update_total_marks)),
        "exams.delete" => Some(dispatch(state, req, exams_delete)),
        _ => None,
    }
}

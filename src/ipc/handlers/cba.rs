use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const COMPETENCY_LEVELS: [&str; 3] = [
    "Needs Improvement",
    "Approaching Expectations",
    "Meets Expectations",
];

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

struct Competencies {
    understanding: String,
    application: String,
    communication: String,
    participation: String,
}

fn competency_level(comp: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let value = get_required_str(comp, key)?;
    if !COMPETENCY_LEVELS.contains(&value.as_str()) {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("invalid competency value for {}", key),
            details: Some(json!({ "value": value, "allowed": COMPETENCY_LEVELS })),
        });
    }
    Ok(value)
}

fn parse_competencies(params: &serde_json::Value) -> Result<Competencies, HandlerErr> {
    let Some(comp) = params.get("competencies") else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing competencies".to_string(),
            details: None,
        });
    };
    Ok(Competencies {
        understanding: competency_level(comp, "understandingOfConcepts")?,
        application: competency_level(comp, "applicationReasoning")?,
        communication: competency_level(comp, "communication")?,
        participation: competency_level(comp, "participationEffortAttitude")?,
    })
}

fn cba_set(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let exam_id = get_required_str(params, "examId")?;
    let class = get_required_class(params)?;
    // The acting faculty member is an explicit parameter, not ambient state.
    let faculty_id = get_required_str(params, "facultyId")?;
    let comp = parse_competencies(params)?;

    conn.execute(
        "INSERT INTO cba_records(
           id, student_id, subject_id, exam_id, class,
           understanding, application, communication, participation,
           faculty_id, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, subject_id, exam_id, class) DO UPDATE SET
           understanding = excluded.understanding,
           application = excluded.application,
           communication = excluded.communication,
           participation = excluded.participation,
           faculty_id = excluded.faculty_id,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            &student_id,
            &subject_id,
            &exam_id,
            class,
            &comp.understanding,
            &comp.application,
            &comp.communication,
            &comp.participation,
            &faculty_id,
            chrono::Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "cba_records" })),
    })?;

    Ok(json!({ "saved": true }))
}

fn cba_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let exam_id = get_required_str(params, "examId")?;
    let class = get_required_class(params)?;

    // Absence is an answer here, not an error: graders poll this per
    // student before any score exists.
    let row = conn
        .query_row(
            "SELECT c.understanding, c.application, c.communication, c.participation,
                    c.faculty_id, c.updated_at,
                    st.enrollment_no, st.first_name, st.last_name
             FROM cba_records c
             LEFT JOIN students st ON st.id = c.student_id
             WHERE c.student_id = ? AND c.subject_id = ? AND c.exam_id = ? AND c.class = ?",
            (&student_id, &subject_id, &exam_id, class),
            |r| {
                Ok(json!({
                    "studentId": student_id,
                    "enrollmentNo": r.get::<_, Option<String>>(6)?,
                    "firstName": r.get::<_, Option<String>>(7)?,
                    "lastName": r.get::<_, Option<String>>(8)?,
                    "facultyId": r.get::<_, String>(4)?,
                    "updatedAt": r.get::<_, Option<String>>(5)?,
                    "competencies": {
                        "understandingOfConcepts": r.get::<_, String>(0)?,
                        "applicationReasoning": r.get::<_, String>(1)?,
                        "communication": r.get::<_, String>(2)?,
                        "participationEffortAttitude": r.get::<_, String>(3)?
                    }
                }))
            },
        )
        .optional()
        .map_err(HandlerErr::db)?;

    Ok(json!({ "cba": row }))
}

fn cba_get_bulk(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    let exam_id = get_required_str(params, "examId")?;
    let class = get_required_class(params)?;
    let Some(ids) = params.get("studentIds").and_then(|v| v.as_array()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing studentIds".to_string(),
            details: None,
        });
    };
    let mut student_ids = Vec::with_capacity(ids.len());
    for id in ids {
        let Some(s) = id.as_str() else {
            return Err(HandlerErr {
                code: "bad_params",
                message: "studentIds must be strings".to_string(),
                details: None,
            });
        };
        student_ids.push(s.to_string());
    }
    if student_ids.is_empty() {
        return Ok(json!({ "cba": [] }));
    }

    let placeholders = vec!["?"; student_ids.len()].join(", ");
    let sql = format!(
        "SELECT c.student_id, st.enrollment_no, st.first_name, st.last_name,
                c.understanding, c.application, c.communication, c.participation
         FROM cba_records c
         LEFT JOIN students st ON st.id = c.student_id
         WHERE c.subject_id = ? AND c.exam_id = ? AND c.class = ?
           AND c.student_id IN ({})
         ORDER BY st.last_name, st.first_name",
        placeholders
    );
    let mut binds: Vec<rusqlite::types::Value> =
        vec![subject_id.into(), exam_id.into(), class.into()];
    for id in student_ids {
        binds.push(id.into());
    }

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "enrollmentNo": r.get::<_, Option<String>>(1)?,
                "firstName": r.get::<_, Option<String>>(2)?,
                "lastName": r.get::<_, Option<String>>(3)?,
                "competencies": {
                    "understandingOfConcepts": r.get::<_, String>(4)?,
                    "applicationReasoning": r.get::<_, String>(5)?,
                    "communication": r.get::<_, String>(6)?,
                    "participationEffortAttitude": r.get::<_, String>(7)?
                }
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    Ok(json!({ "cba": rows }))
}

fn cba_student_view(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let class = get_required_class(params)?;

    let mut stmt = conn
        .prepare(
            "SELECT c.subject_id, s.name, c.exam_id, e.name,
                    c.understanding, c.application, c.communication, c.participation
             FROM cba_records c
             LEFT JOIN subjects s ON s.id = c.subject_id
             LEFT JOIN exams e ON e.id = c.exam_id
             WHERE c.student_id = ? AND c.class = ?
             ORDER BY e.name, s.name",
        )
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map((&student_id, class), |r| {
            Ok(json!({
                "subjectId": r.get::<_, String>(0)?,
                "subjectName": r.get::<_, Option<String>>(1)?,
                "examId": r.get::<_, String>(2)?,
                "examName": r.get::<_, Option<String>>(3)?,
                "competencies": {
                    "understandingOfConcepts": r.get::<_, String>(4)?,
                    "applicationReasoning": r.get::<_, String>(5)?,
                    "communication": r.get::<_, String>(6)?,
                    "participationEffortAttitude": r.get::<_, String>(7)?
                }
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    Ok(json!({ "cba": rows }))
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
        "cba.set" => Some(dispatch(state, req, cba_set)),
        "cba.get" => Some(dispatch(state, req, cba_get)),
        "cba.getBulk" => Some(dispatch(state, req, cba_get_bulk)),
        "cba.studentView" => Some(dispatch(state, req, cba_student_view)),
        _ => None,
    }
}

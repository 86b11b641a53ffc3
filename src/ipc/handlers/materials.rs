use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
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

fn materials_add(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let title = get_required_str(params, "title")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let Some(class) = params.get("class").and_then(|v| v.as_i64()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing class".to_string(),
            details: None,
        });
    };
    let material_type = get_required_str(params, "type")?;
    // Storage itself lives elsewhere; the link is opaque here.
    let link = get_required_str(params, "link")?;
    let faculty_id = get_required_str(params, "facultyId")?;

    let material_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO materials(id, title, subject_id, class, material_type, link,
                               faculty_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &material_id,
            &title,
            &subject_id,
            class,
            &material_type,
            &link,
            &faculty_id,
            chrono::Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "materials" })),
    })?;

    Ok(json!({ "materialId": material_id }))
}

fn materials_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut sql = String::from(
        "SELECT m.id, m.title, m.subject_id, s.name, m.class, m.material_type, m.link,
                m.faculty_id, m.created_at
         FROM materials m
         LEFT JOIN subjects s ON s.id = m.subject_id
         WHERE 1=1",
    );
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(v) = params.get("subjectId").and_then(|v| v.as_str()) {
        sql.push_str(" AND m.subject_id = ?");
        binds.push(v.to_string().into());
    }
    if let Some(v) = params.get("class").and_then(|v| v.as_i64()) {
        sql.push_str(" AND m.class = ?");
        binds.push(v.into());
    }
    if let Some(v) = params.get("facultyId").and_then(|v| v.as_str()) {
        sql.push_str(" AND m.faculty_id = ?");
        binds.push(v.to_string().into());
    }
    if let Some(v) = params.get("type").and_then(|v| v.as_str()) {
        sql.push_str(" AND m.material_type = ?");
        binds.push(v.to_string().into());
    }
    sql.push_str(" ORDER BY m.created_at DESC");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "subjectId": r.get::<_, String>(2)?,
                "subjectName": r.get::<_, Option<String>>(3)?,
                "class": r.get::<_, i64>(4)?,
                "type": r.get::<_, String>(5)?,
                "link": r.get::<_, String>(6)?,
                "facultyId": r.get::<_, String>(7)?,
                "createdAt": r.get::<_, Option<String>>(8)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    Ok(json!({ "materials": rows }))
}

fn materials_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let material_id = get_required_str(params, "materialId")?;

    let mut sets: Vec<&str> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(v) = params.get("title").and_then(|v| v.as_str()) {
        sets.push("title = ?");
        binds.push(v.to_string().into());
    }
    if let Some(v) = params.get("subjectId").and_then(|v| v.as_str()) {
        sets.push("subject_id = ?");
        binds.push(v.to_string().into());
    }
    if let Some(v) = params.get("class").and_then(|v| v.as_i64()) {
        sets.push("class = ?");
        binds.push(v.into());
    }
    if let Some(v) = params.get("type").and_then(|v| v.as_str()) {
        sets.push("material_type = ?");
        binds.push(v.to_string().into());
    }
    if let Some(v) = params.get("link").and_then(|v| v.as_str()) {
        sets.push("link = ?");
        binds.push(v.to_string().into());
    }
    if sets.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "no updatable fields given".to_string(),
            details: None,
        });
    }
    binds.push(material_id.clone().into());

    let sql = format!("UPDATE materials SET {} WHERE id = ?", sets.join(", "));
    let n = conn
        .execute(&sql, rusqlite::params_from_iter(binds))
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    if n == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "material not found".to_string(),
            details: None,
        });
    }

    let material = conn
        .query_row(
            "SELECT m.id, m.title, m.subject_id, s.name, m.class, m.material_type, m.link,
                    m.faculty_id, m.created_at
             FROM materials m
             LEFT JOIN subjects s ON s.id = m.subject_id
             WHERE m.id = ?",
            [&material_id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "title": r.get::<_, String>(1)?,
                    "subjectId": r.get::<_, String>(2)?,
                    "subjectName": r.get::<_, Option<String>>(3)?,
                    "class": r.get::<_, i64>(4)?,
                    "type": r.get::<_, String>(5)?,
                    "link": r.get::<_, String>(6)?,
                    "facultyId": r.get::<_, String>(7)?,
                    "createdAt": r.get::<_, Option<String>>(8)?
                }))
            },
        )
        .map_err(HandlerErr::db)?;

    Ok(json!({ "material": material }))
}

fn materials_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let material_id = get_required_str(params, "materialId")?;

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    tx.execute("DELETE FROM material_views WHERE material_id = ?", [
        &material_id,
    ])
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: None,
    })?;
    let n = tx
        .execute("DELETE FROM materials WHERE id = ?", [&material_id])
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    if n == 0 {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "not_found",
            message: "material not found".to_string(),
            details: None,
        });
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "deleted": true }))
}

fn materials_record_view(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let material_id = get_required_str(params, "materialId")?;
    let student_id = get_required_str(params, "studentId")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM materials WHERE id = ?", [&material_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db)?;
    if exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "material not found".to_string(),
            details: None,
        });
    }

    // One view row per student and material; the first view wins.
    conn.execute(
        "INSERT INTO material_views(material_id, student_id, viewed_at)
         VALUES(?, ?, ?)
         ON CONFLICT(material_id, student_id) DO NOTHING",
        (&material_id, &student_id, chrono::Utc::now().to_rfc3339()),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "material_views" })),
    })?;

    Ok(json!({ "recorded": true }))
}

fn materials_view_count(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let material_id = get_required_str(params, "materialId")?;
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM material_views WHERE material_id = ?",
            [&material_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db)?;
    Ok(json!({ "materialId": material_id, "viewCount": count }))
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
        "materials.add" => Some(dispatch(state, req, materials_add)),
        "materials.list" => Some(dispatch(state, req, materials_list)),
        "materials.update" => Some(dispatch(state, req, materials_update)),
        "materials.delete" => Some(dispatch(state, req, materials_delete)),
        "materials.recordView" => Some(dispatch(state, req, materials_record_view)),
        "materials.viewCount" => Some(dispatch(state, req, materials_view_count)),
        _ => None,
    }
}

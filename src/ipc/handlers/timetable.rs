use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

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

fn timetable_set(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class = get_required_class(params)?;
    let link = params
        .get("link")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing link".to_string(),
            details: None,
        })?;

    conn.execute(
        "INSERT INTO timetables(class, link, updated_at)
         VALUES(?, ?, ?)
         ON CONFLICT(class) DO UPDATE SET
           link = excluded.link,
           updated_at = excluded.updated_at",
        (class, &link, chrono::Utc::now().to_rfc3339()),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "timetables" })),
    })?;

    Ok(json!({ "class": class, "link": link }))
}

fn timetable_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class = get_required_class(params)?;

    let row: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT link, updated_at FROM timetables WHERE class = ?",
            [class],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    match row {
        Some((link, updated_at)) => Ok(json!({
            "class": class,
            "link": link,
            "updatedAt": updated_at
        })),
        None => Err(HandlerErr {
            code: "not_found",
            message: "no timetable for that class".to_string(),
            details: None,
        }),
    }
}

fn timetable_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class = get_required_class(params)?;

    let n = conn
        .execute("DELETE FROM timetables WHERE class = ?", [class])
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    if n == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "no timetable for that class".to_string(),
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
        "timetable.set" => Some(dispatch(state, req, timetable_set)),
        "timetable.get" => Some(dispatch(state, req, timetable_get)),
        "timetable.delete" => Some(dispatch(state, req, timetable_delete)),
        _ => None,
    }
}

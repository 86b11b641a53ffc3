//! Bounded-counter reconciliation shared by attendance and marks.
//!
//! Both features follow the same shape: a configured ceiling per
//! (subject, class), per-student counter records carrying a snapshot of the
//! ceiling they were validated against, and a bulk validate-and-upsert
//! operation. The snapshot is denormalized on purpose: reads never join
//! against the ceiling table, and a ceiling change re-propagates onto every
//! dependent record synchronously.

use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Attendance,
    Marks,
}

impl Domain {
    pub fn as_str(self) -> &'static str {
        match self {
            Domain::Attendance => "attendance",
            Domain::Marks => "marks",
        }
    }
}

/// Identifies one bounded-counter space. `exam_id` is `None` for domains
/// without an exam dimension; stored as '' so the unique index applies.
#[derive(Debug, Clone)]
pub struct CounterKey<'a> {
    pub domain: Domain,
    pub subject_id: &'a str,
    pub class: i64,
    pub exam_id: Option<&'a str>,
}

impl CounterKey<'_> {
    fn exam_col(&self) -> &str {
        self.exam_id.unwrap_or("")
    }
}

#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub student_id: String,
    pub value: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub id: String,
    pub student_id: String,
    pub value: i64,
    pub ceiling: i64,
}

#[derive(Debug)]
pub enum ProgressError {
    CeilingNotSet,
    NegativeCeiling { value: i64 },
    NegativeValue { student_id: String, value: i64 },
    ExceedsCeiling { student_id: String, value: i64, ceiling: i64 },
    Db(rusqlite::Error),
}

impl ProgressError {
    pub fn code(&self) -> &'static str {
        match self {
            ProgressError::CeilingNotSet => "precondition_failed",
            ProgressError::NegativeCeiling { .. }
            | ProgressError::NegativeValue { .. }
            | ProgressError::ExceedsCeiling { .. } => "bad_params",
            ProgressError::Db(_) => "db_update_failed",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            ProgressError::NegativeCeiling { value } => Some(json!({ "value": value })),
            ProgressError::NegativeValue { student_id, value } => {
                Some(json!({ "studentId": student_id, "value": value }))
            }
            ProgressError::ExceedsCeiling {
                student_id,
                value,
                ceiling,
            } => Some(json!({ "studentId": student_id, "value": value, "ceiling": ceiling })),
            _ => None,
        }
    }
}

impl fmt::Display for ProgressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressError::CeilingNotSet => {
                write!(f, "ceiling must be set before recording progress")
            }
            ProgressError::NegativeCeiling { value } => {
                write!(f, "ceiling must be a non-negative integer, got {}", value)
            }
            ProgressError::NegativeValue { student_id, value } => {
                write!(f, "value {} for student {} cannot be negative", value, student_id)
            }
            ProgressError::ExceedsCeiling {
                student_id,
                value,
                ceiling,
            } => write!(
                f,
                "value {} for student {} cannot exceed ceiling {}",
                value, student_id, ceiling
            ),
            ProgressError::Db(e) => write!(f, "{}", e),
        }
    }
}

impl From<rusqlite::Error> for ProgressError {
    fn from(e: rusqlite::Error) -> Self {
        ProgressError::Db(e)
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Upsert the ceiling for (domain, subject, class) and propagate the new
/// value onto every existing progress record in that space. Stored values
/// are left untouched, even if one now sits lower relative to a larger
/// ceiling.
pub fn set_ceiling(
    conn: &Connection,
    domain: Domain,
    subject_id: &str,
    class: i64,
    value: i64,
) -> Result<(), ProgressError> {
    if value < 0 {
        return Err(ProgressError::NegativeCeiling { value });
    }
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO ceilings(domain, subject_id, class, ceiling, updated_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(domain, subject_id, class) DO UPDATE SET
           ceiling = excluded.ceiling,
           updated_at = excluded.updated_at",
        (domain.as_str(), subject_id, class, value, now()),
    )?;
    tx.execute(
        "UPDATE progress_records SET ceiling = ?, updated_at = ?
         WHERE domain = ? AND subject_id = ? AND class = ?",
        (value, now(), domain.as_str(), subject_id, class),
    )?;
    tx.commit()?;
    Ok(())
}

/// `None` means not configured; a stored zero is a legitimate ceiling.
pub fn get_ceiling(
    conn: &Connection,
    domain: Domain,
    subject_id: &str,
    class: i64,
) -> Result<Option<i64>, ProgressError> {
    let v = conn
        .query_row(
            "SELECT ceiling FROM ceilings WHERE domain = ? AND subject_id = ? AND class = ?",
            (domain.as_str(), subject_id, class),
            |r| r.get(0),
        )
        .optional()?;
    Ok(v)
}

pub fn require_ceiling(
    conn: &Connection,
    domain: Domain,
    subject_id: &str,
    class: i64,
) -> Result<i64, ProgressError> {
    get_ceiling(conn, domain, subject_id, class)?.ok_or(ProgressError::CeilingNotSet)
}

/// Refresh the ceiling snapshot on existing records for a counter space
/// whose ceiling lives outside the ceilings table (exam total marks).
pub fn propagate_ceiling(
    conn: &Connection,
    key: &CounterKey<'_>,
    ceiling: i64,
) -> Result<usize, ProgressError> {
    let n = conn.execute(
        "UPDATE progress_records SET ceiling = ?, updated_at = ?
         WHERE domain = ? AND subject_id = ? AND class = ? AND exam_id = ?",
        (
            ceiling,
            now(),
            key.domain.as_str(),
            key.subject_id,
            key.class,
            key.exam_col(),
        ),
    )?;
    Ok(n)
}

/// Validate every entry against the bounds before anything is written.
pub fn validate_batch(ceiling: i64, entries: &[BatchEntry]) -> Result<(), ProgressError> {
    for e in entries {
        if e.value < 0 {
            return Err(ProgressError::NegativeValue {
                student_id: e.student_id.clone(),
                value: e.value,
            });
        }
        if e.value > ceiling {
            return Err(ProgressError::ExceedsCeiling {
                student_id: e.student_id.clone(),
                value: e.value,
                ceiling,
            });
        }
    }
    Ok(())
}

/// Bulk validate-and-upsert. The whole batch is checked first and written
/// inside one transaction, so a rejected batch leaves no rows behind.
/// Results come back in input order; re-submitting the same batch produces
/// identical stored records.
pub fn reconcile(
    conn: &Connection,
    key: &CounterKey<'_>,
    ceiling: i64,
    entries: &[BatchEntry],
) -> Result<Vec<ProgressRecord>, ProgressError> {
    validate_batch(ceiling, entries)?;

    let tx = conn.unchecked_transaction()?;
    let mut out = Vec::with_capacity(entries.len());
    for e in entries {
        tx.execute(
            "INSERT INTO progress_records(
               id, domain, student_id, subject_id, class, exam_id,
               value, ceiling, updated_at
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(domain, student_id, subject_id, class, exam_id) DO UPDATE SET
               value = excluded.value,
               ceiling = excluded.ceiling,
               updated_at = excluded.updated_at",
            (
                Uuid::new_v4().to_string(),
                key.domain.as_str(),
                &e.student_id,
                key.subject_id,
                key.class,
                key.exam_col(),
                e.value,
                ceiling,
                now(),
            ),
        )?;
        // The upsert keeps the original row id; read the row back.
        let rec = tx.query_row(
            "SELECT id, value, ceiling FROM progress_records
             WHERE domain = ? AND student_id = ? AND subject_id = ? AND class = ? AND exam_id = ?",
            (
                key.domain.as_str(),
                &e.student_id,
                key.subject_id,
                key.class,
                key.exam_col(),
            ),
            |r| {
                Ok(ProgressRecord {
                    id: r.get(0)?,
                    student_id: e.student_id.clone(),
                    value: r.get(1)?,
                    ceiling: r.get(2)?,
                })
            },
        )?;
        out.push(rec);
    }
    tx.commit()?;
    Ok(out)
}

pub fn find_record(
    conn: &Connection,
    key: &CounterKey<'_>,
    student_id: &str,
) -> Result<Option<ProgressRecord>, ProgressError> {
    let rec = conn
        .query_row(
            "SELECT id, value, ceiling FROM progress_records
             WHERE domain = ? AND student_id = ? AND subject_id = ? AND class = ? AND exam_id = ?",
            (
                key.domain.as_str(),
                student_id,
                key.subject_id,
                key.class,
                key.exam_col(),
            ),
            |r| {
                Ok(ProgressRecord {
                    id: r.get(0)?,
                    student_id: student_id.to_string(),
                    value: r.get(1)?,
                    ceiling: r.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(rec)
}

/// `value / ceiling * 100` rounded to two decimals; 0 when the ceiling is 0.
pub fn percentage(value: i64, ceiling: i64) -> f64 {
    if ceiling <= 0 {
        return 0.0;
    }
    let pct = (value as f64) / (ceiling as f64) * 100.0;
    (pct * 100.0).round() / 100.0
}

pub fn grade_letter(percent: f64) -> &'static str {
    if percent >= 90.0 {
        "A"
    } else if percent >= 80.0 {
        "B"
    } else if percent >= 60.0 {
        "C"
    } else {
        "D"
    }
}

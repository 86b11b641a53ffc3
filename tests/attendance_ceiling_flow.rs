use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_campusd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn campusd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().expect("error payload")
}

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    first: &str,
    last: &str,
    class: i64,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        id,
        "students.create",
        json!({ "firstName": first, "lastName": last, "class": class }),
    );
    created
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string()
}

#[test]
fn attendance_ceiling_and_bulk_reconcile_flow() {
    let workspace = temp_dir("campusd-attendance-flow");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "subjects.create",
        json!({ "name": "Mathematics", "code": "MATH" }),
    );
    let subject_id = subject
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();

    let s1 = create_student(&mut stdin, &mut reader, "3", "Asha", "Iyer", 10);
    let s2 = create_student(&mut stdin, &mut reader, "4", "Rohan", "Mehta", 10);

    // Recording attendance before the ceiling exists is a precondition error.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.updateBulk",
        json!({
            "subjectId": subject_id,
            "class": 10,
            "attendance": [{ "studentId": s1, "classesAttended": 5 }]
        }),
    );
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some("precondition_failed")
    );

    // Unconfigured ceiling reads back as 0 with an explicit flag.
    let unset = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.getTotalClasses",
        json!({ "subjectId": subject_id, "class": 10 }),
    );
    assert_eq!(unset.get("totalClasses").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(unset.get("configured").and_then(|v| v.as_bool()), Some(false));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attendance.setTotalClasses",
        json!({ "subjectId": subject_id, "class": 10, "totalClasses": 50 }),
    );
    let set = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "attendance.getTotalClasses",
        json!({ "subjectId": subject_id, "class": 10 }),
    );
    assert_eq!(set.get("totalClasses").and_then(|v| v.as_i64()), Some(50));
    assert_eq!(set.get("configured").and_then(|v| v.as_bool()), Some(true));

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "attendance.updateBulk",
        json!({
            "subjectId": subject_id,
            "class": 10,
            "attendance": [
                { "studentId": s1, "classesAttended": 45 },
                { "studentId": s2, "classesAttended": 50 }
            ]
        }),
    );
    let records = updated
        .get("records")
        .and_then(|v| v.as_array())
        .expect("records");
    assert_eq!(records.len(), 2);
    assert_eq!(
        records[0].get("totalClasses").and_then(|v| v.as_i64()),
        Some(50)
    );

    // A batch with one bad entry rejects atomically: nothing changes,
    // including entries listed before the violating one.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "10",
        "attendance.updateBulk",
        json!({
            "subjectId": subject_id,
            "class": 10,
            "attendance": [
                { "studentId": s1, "classesAttended": 1 },
                { "studentId": s2, "classesAttended": 51 }
            ]
        }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("bad_params"));
    let details = error.get("details").expect("details");
    assert_eq!(details.get("studentId").and_then(|v| v.as_str()), Some(s2.as_str()));
    assert_eq!(details.get("ceiling").and_then(|v| v.as_i64()), Some(50));

    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "attendance.classOpen",
        json!({ "subjectId": subject_id, "class": 10 }),
    );
    let rows = opened
        .get("students")
        .and_then(|v| v.as_array())
        .expect("students");
    let row_for = |id: &str| {
        rows.iter()
            .find(|r| r.get("studentId").and_then(|v| v.as_str()) == Some(id))
            .cloned()
            .expect("student row")
    };
    assert_eq!(
        row_for(&s1).get("classesAttended").and_then(|v| v.as_i64()),
        Some(45),
        "rejected batch must not have written its first entry"
    );
    assert_eq!(
        row_for(&s2).get("classesAttended").and_then(|v| v.as_i64()),
        Some(50)
    );

    // Raising the ceiling cascades onto stored records, values untouched.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "attendance.setTotalClasses",
        json!({ "subjectId": subject_id, "class": 10, "totalClasses": 60 }),
    );
    let view = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "attendance.studentView",
        json!({ "studentId": s1, "class": 10 }),
    );
    let att = view
        .get("attendance")
        .and_then(|v| v.as_array())
        .expect("attendance");
    assert_eq!(att.len(), 1);
    assert_eq!(att[0].get("classesAttended").and_then(|v| v.as_i64()), Some(45));
    assert_eq!(att[0].get("totalClasses").and_then(|v| v.as_i64()), Some(60));
    assert_eq!(
        att[0].get("attendancePercentage").and_then(|v| v.as_f64()),
        Some(75.0)
    );

    let prog = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "attendance.getProgress",
        json!({ "subjectId": subject_id, "class": 10, "studentId": s2 }),
    );
    assert_eq!(prog.get("classesAttended").and_then(|v| v.as_i64()), Some(50));
    assert_eq!(prog.get("totalClasses").and_then(|v| v.as_i64()), Some(60));
    assert_eq!(
        prog.get("attendancePercentage").and_then(|v| v.as_f64()),
        Some(83.33)
    );

    let error = request_err(
        &mut stdin,
        &mut reader,
        "15",
        "attendance.getProgress",
        json!({ "subjectId": subject_id, "class": 10, "studentId": "nobody" }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("not_found"));
}

#[test]
fn negative_attendance_rejected() {
    let workspace = temp_dir("campusd-attendance-negative");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "subjects.create",
        json!({ "name": "Physics" }),
    );
    let subject_id = subject
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();
    let s1 = create_student(&mut stdin, &mut reader, "3", "Meera", "Nair", 9);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.setTotalClasses",
        json!({ "subjectId": subject_id, "class": 9, "totalClasses": 30 }),
    );
    let error = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.updateBulk",
        json!({
            "subjectId": subject_id,
            "class": 9,
            "attendance": [{ "studentId": s1, "classesAttended": -1 }]
        }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("bad_params"));

    // A negative ceiling is rejected too.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.setTotalClasses",
        json!({ "subjectId": subject_id, "class": 9, "totalClasses": -5 }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("bad_params"));
}

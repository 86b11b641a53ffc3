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

#[test]
fn cba_set_validates_and_upserts() {
    let workspace = temp_dir("campusd-cba");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let subject_id = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "subjects.create",
        json!({ "name": "Biology" }),
    )
    .get("subjectId")
    .and_then(|v| v.as_str())
    .expect("subjectId")
    .to_string();
    let student_id = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "firstName": "Ira", "lastName": "Shah", "class": 8 }),
    )
    .get("studentId")
    .and_then(|v| v.as_str())
    .expect("studentId")
    .to_string();
    let exam_id = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "exams.create",
        json!({ "name": "End Term", "class": 8, "examType": "end", "totalMarks": 100 }),
    )
    .get("examId")
    .and_then(|v| v.as_str())
    .expect("examId")
    .to_string();

    let error = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "cba.set",
        json!({
            "studentId": student_id,
            "subjectId": subject_id,
            "examId": exam_id,
            "class": 8,
            "facultyId": "fac-1",
            "competencies": {
                "understandingOfConcepts": "Excellent",
                "applicationReasoning": "Meets Expectations",
                "communication": "Meets Expectations",
                "participationEffortAttitude": "Meets Expectations"
            }
        }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("bad_params"));

    let set = |stdin: &mut ChildStdin,
               reader: &mut BufReader<ChildStdout>,
               id: &str,
               understanding: &str| {
        request_ok(
            stdin,
            reader,
            id,
            "cba.set",
            json!({
                "studentId": student_id,
                "subjectId": subject_id,
                "examId": exam_id,
                "class": 8,
                "facultyId": "fac-1",
                "competencies": {
                    "understandingOfConcepts": understanding,
                    "applicationReasoning": "Approaching Expectations",
                    "communication": "Meets Expectations",
                    "participationEffortAttitude": "Needs Improvement"
                }
            }),
        )
    };
    let _ = set(&mut stdin, &mut reader, "6", "Meets Expectations");
    // Second write for the same key overwrites, no duplicate row.
    let _ = set(&mut stdin, &mut reader, "7", "Needs Improvement");

    let view = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "cba.studentView",
        json!({ "studentId": student_id, "class": 8 }),
    );
    let rows = view.get("cba").and_then(|v| v.as_array()).expect("cba rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0]
            .get("competencies")
            .and_then(|c| c.get("understandingOfConcepts"))
            .and_then(|v| v.as_str()),
        Some("Needs Improvement")
    );

    // Graders read a single score back by its full key.
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "cba.get",
        json!({
            "studentId": student_id,
            "subjectId": subject_id,
            "examId": exam_id,
            "class": 8
        }),
    );
    let record = got.get("cba").expect("cba field");
    assert_eq!(record.get("facultyId").and_then(|v| v.as_str()), Some("fac-1"));
    assert_eq!(
        record
            .get("competencies")
            .and_then(|c| c.get("participationEffortAttitude"))
            .and_then(|v| v.as_str()),
        Some("Needs Improvement")
    );

    // An ungraded student answers with a null score, not an error.
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "cba.get",
        json!({
            "studentId": "ungraded",
            "subjectId": subject_id,
            "examId": exam_id,
            "class": 8
        }),
    );
    assert!(got.get("cba").map(|v| v.is_null()).unwrap_or(false));

    let bulk = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "cba.getBulk",
        json!({
            "studentIds": [student_id, "ungraded"],
            "subjectId": subject_id,
            "examId": exam_id,
            "class": 8
        }),
    );
    let rows = bulk.get("cba").and_then(|v| v.as_array()).expect("cba rows");
    assert_eq!(rows.len(), 1, "only graded students come back");
    assert_eq!(
        rows[0].get("studentId").and_then(|v| v.as_str()),
        Some(student_id.as_str())
    );
}

#[test]
fn materials_views_and_timetable_upsert() {
    let workspace = temp_dir("campusd-materials");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let subject_id = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "subjects.create",
        json!({ "name": "History" }),
    )
    .get("subjectId")
    .and_then(|v| v.as_str())
    .expect("subjectId")
    .to_string();
    let student_id = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "firstName": "Kabir", "lastName": "Rao", "class": 7 }),
    )
    .get("studentId")
    .and_then(|v| v.as_str())
    .expect("studentId")
    .to_string();

    let material_id = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "materials.add",
        json!({
            "title": "Chapter 3 notes",
            "subjectId": subject_id,
            "class": 7,
            "type": "notes",
            "link": "https://files.example/ch3.pdf",
            "facultyId": "fac-9"
        }),
    )
    .get("materialId")
    .and_then(|v| v.as_str())
    .expect("materialId")
    .to_string();

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "materials.list",
        json!({ "class": 7, "type": "notes" }),
    );
    let materials = listed
        .get("materials")
        .and_then(|v| v.as_array())
        .expect("materials");
    assert_eq!(materials.len(), 1);
    assert_eq!(
        materials[0].get("subjectName").and_then(|v| v.as_str()),
        Some("History")
    );

    // Repeat views from the same student collapse into one row.
    for id in ["6", "7"] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "materials.recordView",
            json!({ "materialId": material_id, "studentId": student_id }),
        );
    }
    let count = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "materials.viewCount",
        json!({ "materialId": material_id }),
    );
    assert_eq!(count.get("viewCount").and_then(|v| v.as_i64()), Some(1));

    // Timetable is an idempotent per-class upsert.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "9",
        "timetable.get",
        json!({ "class": 7 }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("not_found"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "timetable.set",
        json!({ "class": 7, "link": "https://files.example/tt-v1.pdf" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "timetable.set",
        json!({ "class": 7, "link": "https://files.example/tt-v2.pdf" }),
    );
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "timetable.get",
        json!({ "class": 7 }),
    );
    assert_eq!(
        got.get("link").and_then(|v| v.as_str()),
        Some("https://files.example/tt-v2.pdf")
    );

    // Updating a material touches only the supplied fields.
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "materials.update",
        json!({
            "materialId": material_id,
            "title": "Chapter 3 notes (revised)",
            "type": "assignment"
        }),
    );
    let material = updated.get("material").expect("material");
    assert_eq!(
        material.get("title").and_then(|v| v.as_str()),
        Some("Chapter 3 notes (revised)")
    );
    assert_eq!(material.get("type").and_then(|v| v.as_str()), Some("assignment"));
    assert_eq!(
        material.get("link").and_then(|v| v.as_str()),
        Some("https://files.example/ch3.pdf"),
        "fields left out of the update keep their values"
    );
    let error = request_err(
        &mut stdin,
        &mut reader,
        "14",
        "materials.update",
        json!({ "materialId": "no-such-material", "title": "x" }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("not_found"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "materials.delete",
        json!({ "materialId": material_id }),
    );
    let count = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "materials.viewCount",
        json!({ "materialId": material_id }),
    );
    assert_eq!(
        count.get("viewCount").and_then(|v| v.as_i64()),
        Some(0),
        "deleting a material drops its view rows"
    );

    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "timetable.delete",
        json!({ "class": 7 }),
    );
    assert_eq!(deleted.get("deleted").and_then(|v| v.as_bool()), Some(true));
    let error = request_err(
        &mut stdin,
        &mut reader,
        "18",
        "timetable.get",
        json!({ "class": 7 }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("not_found"));
    let error = request_err(
        &mut stdin,
        &mut reader,
        "19",
        "timetable.delete",
        json!({ "class": 7 }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("not_found"));
}

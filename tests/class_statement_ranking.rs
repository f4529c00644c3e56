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
    let exe = env!("CARGO_BIN_EXE_schoold");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoold");
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

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    name: &str,
    grade: &str,
    roll: i64,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        id,
        "students.create",
        json!({
            "name": name,
            "grade": grade,
            "academicYear": "2026",
            "rollNumber": roll,
        }),
    );
    created
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string()
}

fn save_term_marks(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    student: &str,
    english: (f64, f64),
    maths: (f64, f64),
) {
    request_ok(
        stdin,
        reader,
        id,
        "marks.save",
        json!({
            "studentId": student,
            "examId": "term1",
            "examName": "First Terminal",
            "marks": [
                { "subject": "English", "examMarks": english.0, "activityMarks": english.1 },
                { "subject": "mathematics", "examMarks": maths.0, "activityMarks": maths.1 }
            ]
        }),
    );
}

fn row_for<'a>(statement: &'a serde_json::Value, student_id: &str) -> &'a serde_json::Value {
    statement
        .get("rows")
        .and_then(|v| v.as_array())
        .expect("rows")
        .iter()
        .find(|r| r.get("studentId").and_then(|v| v.as_str()) == Some(student_id))
        .expect("row for student")
}

#[test]
fn class_statement_totals_classifies_and_ranks_with_ties() {
    let workspace = temp_dir("schoold-class-statement");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.upsert",
        json!({
            "grade": "viii",
            "subjects": [
                { "name": "English", "examFullMarks": 80, "activityFullMarks": 20 },
                { "name": "Mathematics", "examFullMarks": 80, "activityFullMarks": 20 }
            ]
        }),
    );

    let asha = create_student(&mut stdin, &mut reader, "3", "Asha", "VIII", 1);
    let bina = create_student(&mut stdin, &mut reader, "4", "Bina", "VIII", 2);
    let chitra = create_student(&mut stdin, &mut reader, "5", "Chitra", "VIII", 3);

    save_term_marks(&mut stdin, &mut reader, "6", &asha, (78.0, 15.0), (60.0, 10.0));
    save_term_marks(&mut stdin, &mut reader, "7", &bina, (70.0, 10.0), (70.0, 13.0));
    save_term_marks(&mut stdin, &mut reader, "8", &chitra, (20.0, 5.0), (30.0, 5.0));

    let statement = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "reports.classStatement",
        json!({ "grade": "VIII", "examId": "term1", "sortBy": "total" }),
    );
    assert_eq!(statement.get("maxTotal").and_then(|v| v.as_f64()), Some(200.0));
    assert_eq!(statement.get("scheme").and_then(|v| v.as_str()), Some("standard"));

    let a = row_for(&statement, &asha);
    assert_eq!(
        a.pointer("/subjects/0/subjectTotal").and_then(|v| v.as_f64()),
        Some(93.0)
    );
    assert_eq!(a.get("grandTotal").and_then(|v| v.as_f64()), Some(163.0));
    assert_eq!(a.get("percentage").and_then(|v| v.as_f64()), Some(81.5));
    assert_eq!(a.get("result").and_then(|v| v.as_str()), Some("Pass"));
    assert_eq!(a.get("division").and_then(|v| v.as_str()), Some("I"));
    assert_eq!(a.get("academicGrade").and_then(|v| v.as_str()), Some("A"));
    assert_eq!(a.get("rank").and_then(|v| v.as_u64()), Some(1));

    let b = row_for(&statement, &bina);
    assert_eq!(b.get("grandTotal").and_then(|v| v.as_f64()), Some(163.0));
    assert_eq!(b.get("rank").and_then(|v| v.as_u64()), Some(1));

    let c = row_for(&statement, &chitra);
    assert_eq!(c.get("percentage").and_then(|v| v.as_f64()), Some(30.0));
    assert_eq!(c.get("result").and_then(|v| v.as_str()), Some("Fail"));
    assert_eq!(c.get("division").and_then(|v| v.as_str()), Some("Fail"));
    assert_eq!(c.get("academicGrade").and_then(|v| v.as_str()), Some("E"));
    assert_eq!(c.get("rank").and_then(|v| v.as_u64()), Some(3));

    // Sorted by rank, ties by roll number.
    let order: Vec<&str> = statement
        .get("rows")
        .and_then(|v| v.as_array())
        .expect("rows")
        .iter()
        .filter_map(|r| r.get("name").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(order, vec!["Asha", "Bina", "Chitra"]);

    let summary = statement.get("summary").expect("summary");
    assert_eq!(summary.get("passed").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(summary.get("failed").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(summary.get("firstDivision").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(
        summary.get("classAveragePercent").and_then(|v| v.as_f64()),
        Some(64.33)
    );
    assert_eq!(summary.get("highestTotal").and_then(|v| v.as_f64()), Some(163.0));

    request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "setup.update",
        json!({ "section": "grading", "patch": { "rankPolicy": "dense" } }),
    );
    let dense = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "reports.classStatement",
        json!({ "grade": "VIII", "examId": "term1" }),
    );
    assert_eq!(
        row_for(&dense, &chitra).get("rank").and_then(|v| v.as_u64()),
        Some(2)
    );
    // Default sort is by roll number.
    assert_eq!(
        dense.pointer("/rows/0/rollNumber").and_then(|v| v.as_i64()),
        Some(1)
    );
}

#[test]
fn board_exam_grades_use_hundred_mark_papers() {
    let workspace = temp_dir("schoold-board-exam");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.upsert",
        json!({
            "grade": "X",
            "scheme": "standard",
            "subjects": [
                { "name": "English", "examFullMarks": 80, "activityFullMarks": 20 },
                { "name": "Science", "examFullMarks": 80, "activityFullMarks": 20 }
            ]
        }),
    );

    let resolved = request_ok(&mut stdin, &mut reader, "3", "grades.get", json!({ "grade": "x" }));
    assert_eq!(resolved.get("scheme").and_then(|v| v.as_str()), Some("board_exam"));
    assert_eq!(
        resolved.pointer("/subjects/0/examFullMarks").and_then(|v| v.as_f64()),
        Some(100.0)
    );
    assert_eq!(
        resolved.pointer("/subjects/0/activityFullMarks").and_then(|v| v.as_f64()),
        Some(0.0)
    );
    assert_eq!(
        resolved.pointer("/stored/subjects/0/examFullMarks").and_then(|v| v.as_f64()),
        Some(80.0)
    );
    assert_eq!(resolved.get("maxTotal").and_then(|v| v.as_f64()), Some(200.0));

    let dev = create_student(&mut stdin, &mut reader, "4", "Dev", "X", 1);

    // No activity component on a board-exam paper.
    let rejected = request(
        &mut stdin,
        &mut reader,
        "5",
        "marks.save",
        json!({
            "studentId": dev,
            "examId": "final",
            "marks": [{ "subject": "English", "examMarks": 90, "activityMarks": 5 }]
        }),
    );
    assert_eq!(rejected.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        rejected.pointer("/error/code").and_then(|v| v.as_str()),
        Some("bad_params")
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "marks.save",
        json!({
            "studentId": dev,
            "examId": "final",
            "marks": [
                { "subject": "English", "examMarks": 95 },
                { "subject": "Science", "examMarks": 91 }
            ]
        }),
    );
    let report = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "reports.studentReport",
        json!({ "studentId": dev, "examId": "final" }),
    );
    assert_eq!(report.get("grandTotal").and_then(|v| v.as_f64()), Some(186.0));
    assert_eq!(report.get("maxTotal").and_then(|v| v.as_f64()), Some(200.0));
    assert_eq!(
        report.pointer("/classification/percentage").and_then(|v| v.as_f64()),
        Some(93.0)
    );
    assert_eq!(
        report.pointer("/classification/academicGrade").and_then(|v| v.as_str()),
        Some("A+")
    );
    assert_eq!(
        report.pointer("/classification/remark").and_then(|v| v.as_str()),
        Some("Outstanding")
    );
    assert_eq!(report.get("rank").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(report.get("classSize").and_then(|v| v.as_u64()), Some(1));
}

#[test]
fn status_scope_controls_which_students_are_listed() {
    let workspace = temp_dir("schoold-status-scope");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.upsert",
        json!({
            "grade": "V",
            "subjects": [{ "name": "EVS", "examFullMarks": 50 }]
        }),
    );
    let _ = create_student(&mut stdin, &mut reader, "3", "Esha", "V", 1);
    let left = create_student(&mut stdin, &mut reader, "4", "Farhan", "V", 2);
    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.setStatus",
        json!({ "studentId": left, "status": "withdrawn" }),
    );

    let active = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "reports.classStatement",
        json!({ "grade": "V", "examId": "t1" }),
    );
    assert_eq!(active.pointer("/summary/studentCount").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(active.pointer("/summary/appeared").and_then(|v| v.as_u64()), Some(0));

    let all = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "reports.classStatement",
        json!({ "grade": "V", "examId": "t1", "statusScope": "all" }),
    );
    assert_eq!(all.pointer("/summary/studentCount").and_then(|v| v.as_u64()), Some(2));

    let bad = request(
        &mut stdin,
        &mut reader,
        "8",
        "reports.classStatement",
        json!({ "grade": "V", "examId": "t1", "sortBy": "height" }),
    );
    assert_eq!(bad.pointer("/error/code").and_then(|v| v.as_str()), Some("bad_params"));

    // A grade with no definition still answers, with no subjects.
    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "reports.classStatement",
        json!({ "grade": "XII", "examId": "t1" }),
    );
    assert_eq!(empty.get("maxTotal").and_then(|v| v.as_f64()), Some(0.0));
    assert_eq!(
        empty.get("rows").and_then(|v| v.as_array()).map(|r| r.len()),
        Some(0)
    );
}

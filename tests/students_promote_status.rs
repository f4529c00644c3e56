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

fn error_code(value: &serde_json::Value) -> Option<&str> {
    value.pointer("/error/code").and_then(|v| v.as_str())
}

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    name: &str,
    grade: &str,
    roll: i64,
) -> String {
    request_ok(
        stdin,
        reader,
        id,
        "students.create",
        json!({ "name": name, "grade": grade, "academicYear": "2026", "rollNumber": roll }),
    )
    .get("studentId")
    .and_then(|v| v.as_str())
    .expect("studentId")
    .to_string()
}

fn list_len(value: &serde_json::Value, key: &str) -> usize {
    value
        .get(key)
        .and_then(|v| v.as_array())
        .map(|a| a.len())
        .unwrap_or(0)
}

#[test]
fn students_crud_and_roll_number_conflicts() {
    let workspace = temp_dir("schoold-students-crud");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let mira = create_student(&mut stdin, &mut reader, "2", "Mira", " vii ", 1);
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.get",
        json!({ "studentId": mira }),
    );
    assert_eq!(got.pointer("/student/grade").and_then(|v| v.as_str()), Some("VII"));
    assert_eq!(got.pointer("/student/status").and_then(|v| v.as_str()), Some("active"));

    let clash = request(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "name": "Nima", "grade": "VII", "academicYear": "2026", "rollNumber": 1 }),
    );
    assert_eq!(error_code(&clash), Some("conflict"));

    let bad_roll = request(
        &mut stdin,
        &mut reader,
        "5",
        "students.create",
        json!({ "name": "Nima", "grade": "VII", "academicYear": "2026", "rollNumber": 0 }),
    );
    assert_eq!(error_code(&bad_roll), Some("bad_params"));

    let nima = create_student(&mut stdin, &mut reader, "6", "Nima", "VII", 2);

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.update",
        json!({
            "studentId": nima,
            "patch": { "name": "Nima Sherpa", "guardianName": "P. Sherpa", "dateOfBirth": "2014-08-15" }
        }),
    );
    assert_eq!(
        updated.pointer("/student/name").and_then(|v| v.as_str()),
        Some("Nima Sherpa")
    );
    assert_eq!(
        updated.pointer("/student/dateOfBirth").and_then(|v| v.as_str()),
        Some("2014-08-15")
    );

    let roll_taken = request(
        &mut stdin,
        &mut reader,
        "8",
        "students.update",
        json!({ "studentId": nima, "patch": { "rollNumber": 1 } }),
    );
    assert_eq!(error_code(&roll_taken), Some("conflict"));

    let status_via_update = request(
        &mut stdin,
        &mut reader,
        "9",
        "students.update",
        json!({ "studentId": nima, "patch": { "status": "withdrawn" } }),
    );
    assert_eq!(error_code(&status_via_update), Some("bad_params"));

    let bad_status = request(
        &mut stdin,
        &mut reader,
        "10",
        "students.setStatus",
        json!({ "studentId": nima, "status": "expelled" }),
    );
    assert_eq!(error_code(&bad_status), Some("bad_params"));

    request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "students.setStatus",
        json!({ "studentId": mira, "status": "withdrawn" }),
    );
    // Mira's roll number is free again once she has left.
    let _ = create_student(&mut stdin, &mut reader, "12", "Omar", "VII", 1);
    let back = request(
        &mut stdin,
        &mut reader,
        "13",
        "students.setStatus",
        json!({ "studentId": mira, "status": "active" }),
    );
    assert_eq!(error_code(&back), Some("conflict"));

    let withdrawn = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "students.list",
        json!({ "status": "withdrawn" }),
    );
    assert_eq!(list_len(&withdrawn, "students"), 1);

    let missing = request(
        &mut stdin,
        &mut reader,
        "15",
        "students.get",
        json!({ "studentId": "nope" }),
    );
    assert_eq!(error_code(&missing), Some("not_found"));
}

#[test]
fn promote_moves_active_class_and_graduates_final_grade() {
    let workspace = temp_dir("schoold-students-promote");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let _ = create_student(&mut stdin, &mut reader, "2", "Pema", "VIII", 1);
    let _ = create_student(&mut stdin, &mut reader, "3", "Queen", "VIII", 2);
    let left = create_student(&mut stdin, &mut reader, "4", "Rahul", "VIII", 3);
    let senior = create_student(&mut stdin, &mut reader, "5", "Sara", "X", 1);
    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.setStatus",
        json!({ "studentId": left, "status": "withdrawn" }),
    );

    let promoted = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.promote",
        json!({ "fromGrade": "VIII", "fromYear": "2026", "toGrade": "IX", "toYear": "2027" }),
    );
    assert_eq!(promoted.get("moved").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(promoted.get("graduated").and_then(|v| v.as_bool()), Some(false));

    let ix = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.list",
        json!({ "grade": "ix", "academicYear": "2027" }),
    );
    assert_eq!(list_len(&ix, "students"), 2);

    // Withdrawn students stay where they were.
    let still = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "students.get",
        json!({ "studentId": left }),
    );
    assert_eq!(still.pointer("/student/grade").and_then(|v| v.as_str()), Some("VIII"));

    let graduated = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "students.promote",
        json!({ "fromGrade": "X", "fromYear": "2026", "toGrade": null, "toYear": "2027" }),
    );
    assert_eq!(graduated.get("moved").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(graduated.get("graduated").and_then(|v| v.as_bool()), Some(true));
    let sara = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "students.get",
        json!({ "studentId": senior }),
    );
    assert_eq!(
        sara.pointer("/student/status").and_then(|v| v.as_str()),
        Some("graduated")
    );

    let noop = request(
        &mut stdin,
        &mut reader,
        "12",
        "students.promote",
        json!({ "fromGrade": "IX", "fromYear": "2027", "toGrade": "IX", "toYear": "2027" }),
    );
    assert_eq!(error_code(&noop), Some("bad_params"));
}

#[test]
fn fee_payments_record_and_total() {
    let workspace = temp_dir("schoold-fees");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student = create_student(&mut stdin, &mut reader, "2", "Tashi", "III", 1);

    for (i, (period, amount)) in [("2026-04", 450.0), ("2026-05", 450.0), ("2026-05", 120.5)]
        .iter()
        .enumerate()
    {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("fee-{}", i),
            "fees.record",
            json!({
                "studentId": student,
                "period": period,
                "amount": amount,
                "paidOn": "2026-05-02",
                "receiptNo": format!("R-{}", i),
            }),
        );
    }

    let may = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "fees.list",
        json!({ "studentId": student, "period": "2026-05" }),
    );
    assert_eq!(list_len(&may, "payments"), 2);
    assert_eq!(may.get("total").and_then(|v| v.as_f64()), Some(570.5));

    let zero = request(
        &mut stdin,
        &mut reader,
        "4",
        "fees.record",
        json!({ "studentId": student, "period": "2026-06", "amount": 0, "paidOn": "2026-06-01" }),
    );
    assert_eq!(error_code(&zero), Some("bad_params"));

    let unknown = request(
        &mut stdin,
        &mut reader,
        "5",
        "fees.record",
        json!({ "studentId": "ghost", "period": "2026-06", "amount": 10, "paidOn": "2026-06-01" }),
    );
    assert_eq!(error_code(&unknown), Some("not_found"));
}

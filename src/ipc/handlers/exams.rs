use std::collections::{HashMap, HashSet};

use crate::calc::{resolve_subjects, subject_key, SubjectDefinition};
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{get_optional_i64, get_optional_str, get_required_str, with_conn};
use crate::ipc::types::{AppState, Request};
use crate::reports::{load_exam, load_grade_definition, Conduct};
use crate::settings;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

/// The student's current (grade, academic year).
fn student_placement(conn: &Connection, student_id: &str) -> Result<(String, String), HandlerErr> {
    conn.query_row(
        "SELECT grade, academic_year FROM students WHERE id = ?",
        [student_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )
    .optional()?
    .ok_or_else(|| {
        HandlerErr::new("not_found", "student not found")
            .with_details(json!({ "studentId": student_id }))
    })
}

fn subjects_for_grade(conn: &Connection, grade: &str) -> Result<Vec<SubjectDefinition>, HandlerErr> {
    let policy = settings::grading_policy(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", format!("{e:?}")))?;
    let mut defs = HashMap::new();
    if let Some(d) = load_grade_definition(conn, grade)? {
        defs.insert(crate::calc::normalize_grade(&d.grade), d);
    }
    Ok(resolve_subjects(grade, &defs, &policy))
}

fn marks_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let exam_id = get_required_str(params, "examId")?;
    let (current_grade, current_year) = student_placement(conn, &student_id)?;
    let academic_year = get_optional_str(params, "academicYear")?.unwrap_or(current_year);
    let exam = load_exam(conn, &student_id, &academic_year, &exam_id)?;
    // Past records are shown against the grade they were entered for.
    let grade = exam
        .as_ref()
        .map(|e| e.grade.clone())
        .filter(|g| !g.trim().is_empty())
        .unwrap_or(current_grade);
    let subjects = subjects_for_grade(conn, &grade)?;

    let by_key: HashMap<String, &crate::calc::SubjectMark> = exam
        .as_ref()
        .map(|e| e.marks.iter().map(|m| (subject_key(&m.subject), m)).collect())
        .unwrap_or_default();
    let rows = subjects
        .iter()
        .map(|s| {
            let entered = by_key.get(&subject_key(&s.name));
            json!({
                "subject": s.name,
                "examFullMarks": s.exam_full_marks,
                "activityFullMarks": s.activity_full_marks,
                "examMarks": entered.and_then(|m| m.exam_marks),
                "activityMarks": entered.and_then(|m| m.activity_marks),
            })
        })
        .collect::<Vec<_>>();

    Ok(json!({
        "studentId": student_id,
        "examId": exam_id,
        "academicYear": academic_year,
        "grade": grade,
        "exam": exam,
        "subjects": rows,
    }))
}

/// Null means "not entered"; anything else must be a number in `0..=ceiling`.
fn read_mark(
    entry: &serde_json::Value,
    key: &str,
    ceiling: f64,
    subject: &str,
) -> Result<Option<f64>, HandlerErr> {
    let v = match entry.get(key) {
        None => return Ok(None),
        Some(v) if v.is_null() => return Ok(None),
        Some(v) => v,
    };
    let Some(x) = v.as_f64() else {
        return Err(HandlerErr::bad_params(format!("{} must be a number or null", key))
            .with_details(json!({ "subject": subject })));
    };
    if !x.is_finite() || x < 0.0 {
        return Err(HandlerErr::bad_params(format!("{} must not be negative", key))
            .with_details(json!({ "subject": subject, key: x })));
    }
    if x > ceiling {
        return Err(HandlerErr::bad_params(format!("{} exceeds full marks", key))
            .with_details(json!({ "subject": subject, key: x, "fullMarks": ceiling })));
    }
    Ok(Some(x))
}

fn marks_save(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let exam_id = get_required_str(params, "examId")?;
    let exam_name = get_optional_str(params, "examName")?.unwrap_or_else(|| exam_id.clone());
    let remarks = get_optional_str(params, "remarks")?;
    let conduct = match get_optional_str(params, "conduct")? {
        None => None,
        Some(c) => Some(
            Conduct::parse(&c)
                .ok_or_else(|| HandlerErr::bad_params("conduct must be one of A, B, C, D, E"))?
                .as_str(),
        ),
    };
    let working_days = get_optional_i64(params, "workingDays")?;
    let days_present = get_optional_i64(params, "daysPresent")?;
    if working_days.is_some_and(|w| w < 0) || days_present.is_some_and(|d| d < 0) {
        return Err(HandlerErr::bad_params("attendance days must not be negative"));
    }
    match (working_days, days_present) {
        (Some(w), Some(d)) if d > w => {
            return Err(HandlerErr::bad_params("daysPresent must not exceed workingDays")
                .with_details(json!({ "workingDays": w, "daysPresent": d })));
        }
        (None, Some(_)) => {
            return Err(HandlerErr::bad_params("daysPresent requires workingDays"));
        }
        _ => {}
    }

    let (grade, academic_year) = student_placement(conn, &student_id)?;
    let subjects = subjects_for_grade(conn, &grade)?;
    if subjects.is_empty() {
        return Err(HandlerErr::new("conflict", "no subjects are configured for the student's grade"));
    }
    let ceilings: HashMap<String, &SubjectDefinition> =
        subjects.iter().map(|s| (subject_key(&s.name), s)).collect();

    let entries = match params.get("marks") {
        None => Vec::new(),
        Some(v) => v
            .as_array()
            .cloned()
            .ok_or_else(|| HandlerErr::bad_params("marks must be an array"))?,
    };
    let mut seen = HashSet::new();
    let mut rows: Vec<(String, Option<f64>, Option<f64>)> = Vec::with_capacity(entries.len());
    for entry in &entries {
        let subject = get_required_str(entry, "subject")?;
        let key = subject_key(&subject);
        let Some(def) = ceilings.get(&key) else {
            return Err(HandlerErr::bad_params(format!("unknown subject: {}", subject))
                .with_details(json!({ "subject": subject })));
        };
        if !seen.insert(key) {
            return Err(HandlerErr::bad_params(format!("duplicate subject: {}", subject)));
        }
        let exam_marks = read_mark(entry, "examMarks", def.exam_full_marks, &def.name)?;
        let activity_marks = read_mark(entry, "activityMarks", def.activity_full_marks, &def.name)?;
        rows.push((def.name.clone(), exam_marks, activity_marks));
    }

    let now = db::now_timestamp();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let existing: Option<String> = tx
        .query_row(
            "SELECT id FROM exams WHERE student_id = ? AND academic_year = ? AND exam_id = ?",
            (&student_id, &academic_year, &exam_id),
            |r| r.get(0),
        )
        .optional()?;
    let row_id = match existing {
        Some(id) => {
            tx.execute(
                "UPDATE exams
                 SET grade = ?, exam_name = ?, remarks = ?, conduct = ?, working_days = ?,
                     days_present = ?, updated_at = ?
                 WHERE id = ?",
                rusqlite::params![
                    &grade,
                    &exam_name,
                    &remarks,
                    conduct,
                    working_days,
                    days_present,
                    &now,
                    &id
                ],
            )
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
            tx.execute("DELETE FROM exam_marks WHERE exam_row_id = ?", [&id])
                .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
            id
        }
        None => {
            let id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO exams(id, student_id, academic_year, grade, exam_id, exam_name, remarks,
                                   conduct, working_days, days_present, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    &id,
                    &student_id,
                    &academic_year,
                    &grade,
                    &exam_id,
                    &exam_name,
                    &remarks,
                    conduct,
                    working_days,
                    days_present,
                    &now
                ],
            )
            .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
            id
        }
    };
    {
        let mut ins = tx
            .prepare(
                "INSERT INTO exam_marks(exam_row_id, subject, exam_marks, activity_marks)
                 VALUES(?, ?, ?, ?)",
            )
            .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
        for (subject, exam_marks, activity_marks) in &rows {
            ins.execute((&row_id, subject, exam_marks, activity_marks))
                .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    tracing::debug!(
        student_id = %student_id,
        exam_id = %exam_id,
        academic_year = %academic_year,
        subjects = rows.len(),
        "marks saved"
    );
    Ok(json!({
        "saved": rows.len(),
        "academicYear": academic_year,
        "grade": grade,
        "updatedAt": now,
    }))
}

fn marks_clear(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let exam_id = get_required_str(params, "examId")?;
    let (_, current_year) = student_placement(conn, &student_id)?;
    let academic_year = get_optional_str(params, "academicYear")?.unwrap_or(current_year);

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let existing: Option<String> = tx
        .query_row(
            "SELECT id FROM exams WHERE student_id = ? AND academic_year = ? AND exam_id = ?",
            (&student_id, &academic_year, &exam_id),
            |r| r.get(0),
        )
        .optional()?;
    let Some(row_id) = existing else {
        return Ok(json!({ "cleared": false }));
    };
    tx.execute("DELETE FROM exam_marks WHERE exam_row_id = ?", [&row_id])
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tx.execute("DELETE FROM exams WHERE id = ?", [&row_id])
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    Ok(json!({ "cleared": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "marks.get" => Some(with_conn(state, req, marks_get)),
        "marks.save" => Some(with_conn(state, req, marks_save)),
        "marks.clear" => Some(with_conn(state, req, marks_clear)),
        _ => None,
    }
}

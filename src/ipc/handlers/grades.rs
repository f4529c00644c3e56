use std::collections::HashSet;

use crate::calc::{normalize_grade, resolve_scheme, resolve_subjects, subject_key, GradingScheme};
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{get_optional_str, get_required_str, with_conn};
use crate::ipc::types::{AppState, Request};
use crate::reports::{load_grade_definition, load_grade_definitions};
use crate::settings;
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;

fn policy_of(conn: &Connection) -> Result<crate::calc::GradingPolicy, HandlerErr> {
    settings::grading_policy(conn).map_err(|e| HandlerErr::new("db_query_failed", format!("{e:?}")))
}

fn grades_list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let policy = policy_of(conn)?;
    let defs = load_grade_definitions(conn)?;
    let mut grades: Vec<_> = defs.into_values().collect();
    grades.sort_by(|a, b| a.grade.cmp(&b.grade));

    let rows = grades
        .iter()
        .map(|d| {
            json!({
                "grade": d.grade,
                "scheme": resolve_scheme(&d.grade, Some(d), &policy),
                "classTeacherId": d.class_teacher,
                "subjectCount": d.subjects.len(),
            })
        })
        .collect::<Vec<_>>();
    Ok(json!({ "grades": rows }))
}

fn grades_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let grade = normalize_grade(&get_required_str(params, "grade")?);
    let policy = policy_of(conn)?;
    let stored = load_grade_definition(conn, &grade)?;
    let mut defs = std::collections::HashMap::new();
    if let Some(d) = &stored {
        defs.insert(normalize_grade(&d.grade), d.clone());
    }
    let subjects = resolve_subjects(&grade, &defs, &policy);
    let max_total: f64 = subjects.iter().map(|s| s.full_marks()).sum();

    Ok(json!({
        "grade": grade,
        "stored": stored,
        "scheme": resolve_scheme(&grade, stored.as_ref(), &policy),
        "subjects": subjects,
        "maxTotal": max_total,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubjectInput {
    name: String,
    exam_full_marks: f64,
    #[serde(default)]
    activity_full_marks: f64,
}

fn grades_upsert(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let grade = normalize_grade(&get_required_str(params, "grade")?);
    let scheme = match get_optional_str(params, "scheme")? {
        None => GradingScheme::default(),
        Some(s) => GradingScheme::parse(&s)
            .ok_or_else(|| HandlerErr::bad_params("scheme must be standard or board_exam"))?,
    };
    let class_teacher_id = get_optional_str(params, "classTeacherId")?;
    let Some(raw_subjects) = params.get("subjects").filter(|v| v.is_array()) else {
        return Err(HandlerErr::bad_params("subjects must be an array"));
    };
    let subjects: Vec<SubjectInput> = serde_json::from_value(raw_subjects.clone())
        .map_err(|e| HandlerErr::bad_params(format!("invalid subjects: {}", e)))?;

    let mut seen = HashSet::new();
    for (i, s) in subjects.iter().enumerate() {
        let name = s.name.trim();
        if name.is_empty() {
            return Err(HandlerErr::bad_params("subject name must not be empty")
                .with_details(json!({ "index": i })));
        }
        if !seen.insert(subject_key(name)) {
            return Err(HandlerErr::bad_params(format!("duplicate subject: {}", name))
                .with_details(json!({ "index": i })));
        }
        if !s.exam_full_marks.is_finite() || s.exam_full_marks <= 0.0 {
            return Err(HandlerErr::bad_params("examFullMarks must be > 0")
                .with_details(json!({ "index": i, "subject": name })));
        }
        if !s.activity_full_marks.is_finite() || s.activity_full_marks < 0.0 {
            return Err(HandlerErr::bad_params("activityFullMarks must be >= 0")
                .with_details(json!({ "index": i, "subject": name })));
        }
    }

    if let Some(teacher) = &class_teacher_id {
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM staff WHERE id = ?", [teacher], |r| r.get(0))
            .optional()?;
        if found.is_none() {
            return Err(HandlerErr::new("not_found", "class teacher not found")
                .with_details(json!({ "classTeacherId": teacher })));
        }
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO grade_definitions(grade, scheme, class_teacher_id, updated_at)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(grade) DO UPDATE SET
           scheme = excluded.scheme,
           class_teacher_id = excluded.class_teacher_id,
           updated_at = excluded.updated_at",
        (&grade, scheme.as_str(), &class_teacher_id, db::now_timestamp()),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tx.execute("DELETE FROM grade_subjects WHERE grade = ?", [&grade])
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    {
        let mut ins = tx
            .prepare(
                "INSERT INTO grade_subjects(grade, sort_order, name, exam_full_marks, activity_full_marks)
                 VALUES(?, ?, ?, ?, ?)",
            )
            .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
        for (i, s) in subjects.iter().enumerate() {
            ins.execute((
                &grade,
                i as i64,
                s.name.trim(),
                s.exam_full_marks,
                s.activity_full_marks,
            ))
            .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    tracing::info!(grade = %grade, subjects = subjects.len(), scheme = scheme.as_str(), "grade definition saved");
    grades_get(conn, &json!({ "grade": grade }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.list" => Some(with_conn(state, req, grades_list)),
        "grades.get" => Some(with_conn(state, req, grades_get)),
        "grades.upsert" => Some(with_conn(state, req, grades_upsert)),
        _ => None,
    }
}

use crate::calc::{normalize_grade, GradingPolicy, SortBy};
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{get_optional_str, get_required_str, with_conn};
use crate::ipc::types::{AppState, Request};
use crate::reports::{self, StatementQuery, StatusScope};
use crate::settings;
use rusqlite::Connection;
use serde_json::json;

fn policy_of(conn: &Connection) -> Result<GradingPolicy, HandlerErr> {
    settings::grading_policy(conn).map_err(|e| HandlerErr::new("db_query_failed", format!("{e:?}")))
}

fn to_value<T: serde::Serialize>(v: &T) -> Result<serde_json::Value, HandlerErr> {
    serde_json::to_value(v).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn class_statement(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let grade = normalize_grade(&get_required_str(params, "grade")?);
    let exam_id = get_required_str(params, "examId")?;
    let academic_year = get_optional_str(params, "academicYear")?;
    let sort_by = match get_optional_str(params, "sortBy")? {
        None => SortBy::default(),
        Some(s) => SortBy::parse(&s)
            .ok_or_else(|| HandlerErr::bad_params("sortBy must be roll, name or total"))?,
    };
    let scope = match get_optional_str(params, "statusScope")? {
        None => StatusScope::default(),
        Some(s) => StatusScope::parse(&s)
            .ok_or_else(|| HandlerErr::bad_params("statusScope must be active or all"))?,
    };

    let policy = policy_of(conn)?;
    let statement = reports::compute_class_statement(
        conn,
        &policy,
        &StatementQuery {
            grade,
            exam_id,
            academic_year,
            sort_by,
            scope,
        },
    )?;
    to_value(&statement)
}

fn student_report(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let exam_id = get_required_str(params, "examId")?;
    let policy = policy_of(conn)?;
    let report = reports::compute_student_report(conn, &policy, &student_id, &exam_id)?;
    to_value(&report)
}

fn student_history(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let policy = policy_of(conn)?;
    let entries = reports::compute_student_history(conn, &policy, &student_id)?;
    Ok(json!({ "studentId": student_id, "exams": to_value(&entries)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.classStatement" => Some(with_conn(state, req, class_statement)),
        "reports.studentReport" => Some(with_conn(state, req, student_report)),
        "reports.studentHistory" => Some(with_conn(state, req, student_history)),
        _ => None,
    }
}

use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::json;

use super::error::{err, ok, HandlerErr};
use super::types::{AppState, Request};

type ConnHandler = fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>;

/// Runs a handler against the open workspace and wraps the outcome.
pub fn with_conn(state: &AppState, req: &Request, f: ConnHandler) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    tracing::debug!(request_id = %req.id, method = %req.method, "dispatch");
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let s = params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))?;
    if s.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(s)
}

/// Missing, null and blank all read as `None`; any other non-string is an error.
pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(HandlerErr::bad_params(format!("{} must be string or null", key)));
            };
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
    }
}

pub fn get_optional_i64(params: &serde_json::Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be integer", key))),
    }
}

pub fn get_optional_date(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    let Some(s) = get_optional_str(params, key)? else {
        return Ok(None);
    };
    parse_date(&s, key).map(Some)
}

pub fn parse_date(s: &str, key: &str) -> Result<String, HandlerErr> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map(|d| d.format("%Y-%m-%d").to_string())
        .map_err(|_| {
            HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key))
                .with_details(json!({ key: s }))
        })
}

/// Optional string that, when present, must be one of `allowed` (case-insensitive).
pub fn get_optional_choice(
    params: &serde_json::Value,
    key: &str,
    allowed: &[&str],
) -> Result<Option<String>, HandlerErr> {
    let Some(s) = get_optional_str(params, key)? else {
        return Ok(None);
    };
    let lower = s.to_ascii_lowercase();
    if allowed.contains(&lower.as_str()) {
        Ok(Some(lower))
    } else {
        Err(HandlerErr::bad_params(format!(
            "{} must be one of: {}",
            key,
            allowed.join(", ")
        )))
    }
}

use chrono::Datelike;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::certificates::{self, NumberingConfig, ServiceRequest, TcRequest};
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{get_optional_i64, get_required_str, with_conn};
use crate::ipc::types::{AppState, Request};
use crate::settings;
use rusqlite::Connection;

fn numbering_of(conn: &Connection) -> Result<NumberingConfig, HandlerErr> {
    settings::numbering_config(conn).map_err(|e| HandlerErr::new("db_query_failed", format!("{e:?}")))
}

fn parse_request<T: DeserializeOwned>(params: &serde_json::Value) -> Result<T, HandlerErr> {
    serde_json::from_value(params.clone()).map_err(|e| HandlerErr::bad_params(e.to_string()))
}

fn get_optional_year(params: &serde_json::Value) -> Result<Option<i32>, HandlerErr> {
    match get_optional_i64(params, "year")? {
        None => Ok(None),
        Some(y) => i32::try_from(y)
            .ok()
            .filter(|y| (1900..=9999).contains(y))
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params("year must be a four-digit year")),
    }
}

fn to_value<T: serde::Serialize>(v: &T) -> Result<serde_json::Value, HandlerErr> {
    serde_json::to_value(v).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn tc_issue(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: TcRequest = parse_request(params)?;
    let numbering = numbering_of(conn)?;
    let record = certificates::issue_transfer_certificate(conn, &numbering, &req)?;
    Ok(json!({ "refNo": record.ref_no.clone(), "record": to_value(&record)? }))
}

fn tc_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let year = get_optional_year(params)?;
    let records = certificates::list_transfer_certificates(conn, year)?;
    Ok(json!({ "records": to_value(&records)? }))
}

fn tc_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let key = params
        .get("refNo")
        .or_else(|| params.get("id"))
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params("missing refNo or id"))?;
    let record = certificates::get_transfer_certificate(conn, &key)?;
    Ok(json!({ "record": to_value(&record)? }))
}

fn service_issue(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let req: ServiceRequest = parse_request(params)?;
    let numbering = numbering_of(conn)?;
    let record = certificates::issue_service_certificate(conn, &numbering, &req)?;
    Ok(json!({ "refNo": record.ref_no.clone(), "record": to_value(&record)? }))
}

fn service_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let year = get_optional_year(params)?;
    let records = certificates::list_service_certificates(conn, year)?;
    Ok(json!({ "records": to_value(&records)? }))
}

fn preview(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let kind_raw = get_required_str(params, "kind")?;
    let kind = certificates::parse_kind(&kind_raw)
        .ok_or_else(|| HandlerErr::bad_params("kind must be tc or service"))?;
    let year = get_optional_year(params)?.unwrap_or_else(|| chrono::Local::now().year());
    let numbering = numbering_of(conn)?;
    let ref_no = certificates::preview_ref_number(conn, &numbering, kind, year)?;
    Ok(json!({ "refNo": ref_no, "year": year }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "tc.issue" => Some(with_conn(state, req, tc_issue)),
        "tc.list" => Some(with_conn(state, req, tc_list)),
        "tc.get" => Some(with_conn(state, req, tc_get)),
        "service.issue" => Some(with_conn(state, req, service_issue)),
        "service.list" => Some(with_conn(state, req, service_list)),
        "certificates.preview" => Some(with_conn(state, req, preview)),
        _ => None,
    }
}

use serde_json::json;

use crate::calc::CalcError;
use crate::certificates::CertError;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        tracing::warn!(request_id = id, code = self.code, message = %self.message, "request failed");
        err(id, self.code, self.message, self.details)
    }
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

/// Core-module errors carry owned codes; map them onto the static code set.
fn static_code(code: &str) -> &'static str {
    match code {
        "bad_params" => "bad_params",
        "not_found" => "not_found",
        "conflict" => "conflict",
        "db_insert_failed" => "db_insert_failed",
        "db_update_failed" => "db_update_failed",
        "db_tx_failed" => "db_tx_failed",
        _ => "db_query_failed",
    }
}

impl From<CalcError> for HandlerErr {
    fn from(e: CalcError) -> Self {
        Self {
            code: static_code(&e.code),
            message: e.message,
            details: e.details,
        }
    }
}

impl From<CertError> for HandlerErr {
    fn from(e: CertError) -> Self {
        Self {
            code: static_code(&e.code),
            message: e.message,
            details: e.details,
        }
    }
}

use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{get_optional_str, get_required_str, parse_date, with_conn};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn fees_record(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let period = get_required_str(params, "period")?;
    let amount = params
        .get("amount")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::bad_params("missing amount"))?;
    if !amount.is_finite() || amount <= 0.0 {
        return Err(HandlerErr::bad_params("amount must be > 0"));
    }
    let paid_on = parse_date(&get_required_str(params, "paidOn")?, "paidOn")?;
    let receipt_no = get_optional_str(params, "receiptNo")?;
    let note = get_optional_str(params, "note")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| r.get(0))
        .optional()?;
    if exists.is_none() {
        return Err(HandlerErr::new("not_found", "student not found"));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO fee_payments(id, student_id, period, amount, paid_on, receipt_no, note)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (&id, &student_id, &period, amount, &paid_on, &receipt_no, &note),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "fee_payments" }))
    })?;
    tracing::info!(student_id = %student_id, period = %period, amount, "fee payment recorded");

    Ok(json!({ "paymentId": id }))
}

fn fees_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_optional_str(params, "studentId")?;
    let period = get_optional_str(params, "period")?;

    let mut stmt = conn.prepare(
        "SELECT f.id, f.student_id, s.name, f.period, f.amount, f.paid_on, f.receipt_no, f.note
         FROM fee_payments f
         JOIN students s ON s.id = f.student_id
         WHERE (?1 IS NULL OR f.student_id = ?1)
           AND (?2 IS NULL OR f.period = ?2)
         ORDER BY f.paid_on, f.rowid",
    )?;
    let mut total = 0.0_f64;
    let payments = stmt
        .query_map((&student_id, &period), |r| {
            let amount: f64 = r.get(4)?;
            Ok((
                amount,
                json!({
                    "id": r.get::<_, String>(0)?,
                    "studentId": r.get::<_, String>(1)?,
                    "studentName": r.get::<_, String>(2)?,
                    "period": r.get::<_, String>(3)?,
                    "amount": amount,
                    "paidOn": r.get::<_, String>(5)?,
                    "receiptNo": r.get::<_, Option<String>>(6)?,
                    "note": r.get::<_, Option<String>>(7)?,
                }),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?
        .into_iter()
        .map(|(amount, row)| {
            total += amount;
            row
        })
        .collect::<Vec<_>>();

    Ok(json!({
        "payments": payments,
        "total": crate::calc::round_2(total),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "fees.record" => Some(with_conn(state, req, fees_record)),
        "fees.list" => Some(with_conn(state, req, fees_list)),
        _ => None,
    }
}

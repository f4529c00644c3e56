use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    get_optional_choice, get_optional_date, get_optional_str, get_required_str, with_conn,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const STAFF_STATUSES: &[&str] = &["active", "relieved"];

fn staff_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "designation": r.get::<_, String>(2)?,
        "joiningDate": r.get::<_, Option<String>>(3)?,
        "phone": r.get::<_, Option<String>>(4)?,
        "status": r.get::<_, String>(5)?,
        "createdAt": r.get::<_, String>(6)?,
        "updatedAt": r.get::<_, Option<String>>(7)?,
    }))
}

fn fetch_staff(conn: &Connection, id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        "SELECT id, name, designation, joining_date, phone, status, created_at, updated_at
         FROM staff WHERE id = ?",
        [id],
        staff_json,
    )
    .optional()?
    .ok_or_else(|| HandlerErr::new("not_found", "staff member not found"))
}

fn staff_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let status = get_optional_choice(params, "status", STAFF_STATUSES)?;
    let mut stmt = conn.prepare(
        "SELECT id, name, designation, joining_date, phone, status, created_at, updated_at
         FROM staff
         WHERE (?1 IS NULL OR status = ?1)
         ORDER BY name",
    )?;
    let staff = stmt
        .query_map([status], staff_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(json!({ "staff": staff }))
}

fn staff_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let designation = get_required_str(params, "designation")?;
    let joining_date = get_optional_date(params, "joiningDate")?;
    let phone = get_optional_str(params, "phone")?;

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO staff(id, name, designation, joining_date, phone, status, created_at)
         VALUES(?, ?, ?, ?, ?, 'active', ?)",
        (&id, &name, &designation, &joining_date, &phone, db::now_timestamp()),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "staff" })))?;

    Ok(json!({ "staffId": id, "staff": fetch_staff(conn, &id)? }))
}

fn staff_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "staffId")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    let patch_value = serde_json::Value::Object(patch.clone());
    let current = fetch_staff(conn, &id)?;

    let mut sets: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    for key in patch.keys() {
        let (column, value) = match key.as_str() {
            "name" => ("name = ?", Some(get_required_str(&patch_value, "name")?)),
            "designation" => (
                "designation = ?",
                Some(get_required_str(&patch_value, "designation")?),
            ),
            "joiningDate" => ("joining_date = ?", get_optional_date(&patch_value, "joiningDate")?),
            "phone" => ("phone = ?", get_optional_str(&patch_value, "phone")?),
            "status" => {
                return Err(HandlerErr::bad_params(
                    "staff are relieved by issuing a service certificate",
                ));
            }
            other => {
                return Err(HandlerErr::bad_params(format!("unknown staff field: {}", other)));
            }
        };
        sets.push(column);
        binds.push(value.map(Value::Text).unwrap_or(Value::Null));
    }
    if sets.is_empty() {
        return Ok(json!({ "staff": current }));
    }
    sets.push("updated_at = ?");
    binds.push(Value::Text(db::now_timestamp()));
    binds.push(Value::Text(id.clone()));

    let sql = format!("UPDATE staff SET {} WHERE id = ?", sets.join(", "));
    conn.execute(&sql, params_from_iter(binds))
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "staff": fetch_staff(conn, &id)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "staff.list" => Some(with_conn(state, req, staff_list)),
        "staff.create" => Some(with_conn(state, req, staff_create)),
        "staff.update" => Some(with_conn(state, req, staff_update)),
        _ => None,
    }
}

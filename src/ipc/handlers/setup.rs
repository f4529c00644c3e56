use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::settings::{self, Section, SettingsError};
use serde_json::json;

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let grading = match settings::load_section(conn, Section::Grading) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let certificates = match settings::load_section(conn, Section::Certificates) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "grading": grading,
            "certificates": certificates,
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = Section::parse(section_raw) else {
        return err(
            &req.id,
            "bad_params",
            "unknown section",
            Some(json!({ "section": section_raw })),
        );
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    match settings::update_section(conn, section, patch_obj) {
        Ok(current) => {
            tracing::info!(section = section_raw, "setup section updated");
            ok(&req.id, json!({ "section": section_raw, "value": current }))
        }
        Err(SettingsError::Invalid(msg)) => err(&req.id, "bad_params", msg, None),
        Err(SettingsError::Db(e)) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}

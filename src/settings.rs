//! Workspace configuration stored as JSON rows in `settings`.
//!
//! Each section has compiled-in defaults; saved values are merged over them
//! through the same validation used for `setup.update`, so a malformed
//! historical value falls back to the default instead of blocking reports.

use rusqlite::Connection;
use serde_json::{json, Map, Value};

use crate::calc::{GradeBand, GradingPolicy, RankPolicy};
use crate::certificates::NumberingConfig;
use crate::db;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Grading,
    Certificates,
}

impl Section {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "grading" => Some(Self::Grading),
            "certificates" => Some(Self::Certificates),
            _ => None,
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Self::Grading => "setup.grading",
            Self::Certificates => "setup.certificates",
        }
    }
}

fn default_section(section: Section) -> Value {
    match section {
        Section::Grading => json!(GradingPolicy::default()),
        Section::Certificates => json!(NumberingConfig::default()),
    }
}

fn parse_percent(v: &Value, key: &str) -> Result<f64, String> {
    let n = v
        .as_f64()
        .ok_or_else(|| format!("{} must be a number", key))?;
    if !(0.0..=100.0).contains(&n) {
        return Err(format!("{} must be in 0..=100", key));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.is_empty() {
        return Err(format!("{} must not be empty", key));
    }
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn parse_grade_bands(v: &Value) -> Result<Value, String> {
    let bands: Vec<GradeBand> = serde_json::from_value(v.clone())
        .map_err(|e| format!("gradeBands must be a list of {{minPercent, grade, remark}}: {}", e))?;
    Ok(json!(bands))
}

fn merge_section_patch(section: Section, current: &mut Value, patch: &Map<String, Value>) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            Section::Grading => match k.as_str() {
                "passPercent" => {
                    obj.insert(k.clone(), json!(parse_percent(v, k)?));
                }
                "subjectPassPercent" => {
                    let val = if v.is_null() {
                        Value::Null
                    } else {
                        json!(parse_percent(v, k)?)
                    };
                    obj.insert(k.clone(), val);
                }
                "divisions" => {
                    let Some(d) = v.as_object() else {
                        return Err("divisions must be an object".into());
                    };
                    let mut merged = obj.get("divisions").cloned().unwrap_or_else(|| json!({}));
                    for part in ["first", "second", "third"] {
                        if let Some(x) = d.get(part) {
                            merged[part] = json!(parse_percent(x, &format!("divisions.{}", part))?);
                        }
                    }
                    obj.insert(k.clone(), merged);
                }
                "gradeBands" => {
                    obj.insert(k.clone(), parse_grade_bands(v)?);
                }
                "rankPolicy" => {
                    let s = parse_string_max(v, k, 24)?;
                    let Some(policy) = RankPolicy::parse(&s) else {
                        return Err(
                            "rankPolicy must be one of: competition, dense, roll_tiebreak".into(),
                        );
                    };
                    obj.insert(k.clone(), json!(policy));
                }
                "boardExamGrades" => {
                    let Some(list) = v.as_array() else {
                        return Err("boardExamGrades must be a list of grade names".into());
                    };
                    let mut grades = Vec::with_capacity(list.len());
                    for g in list {
                        grades.push(parse_string_max(g, "boardExamGrades[]", 16)?);
                    }
                    obj.insert(k.clone(), json!(grades));
                }
                _ => return Err(format!("unknown grading field: {}", k)),
            },
            Section::Certificates => match k.as_str() {
                "tcPrefix" | "servicePrefix" => {
                    let s = parse_string_max(v, k, 24)?;
                    if s.contains('/') {
                        return Err(format!("{} must not contain '/'", k));
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                "padWidth" => {
                    let n = v
                        .as_i64()
                        .ok_or_else(|| format!("{} must be integer", k))?;
                    if !(1..=8).contains(&n) {
                        return Err(format!("{} must be in 1..=8", k));
                    }
                    obj.insert(k.clone(), Value::from(n));
                }
                _ => return Err(format!("unknown certificates field: {}", k)),
            },
        }
    }

    // Whole-section checks that single-field parsing cannot see.
    if section == Section::Grading {
        let policy: GradingPolicy = serde_json::from_value(current.clone())
            .map_err(|e| format!("invalid grading section: {}", e))?;
        policy.validate().map_err(|e| e.message)?;
    }
    Ok(())
}

pub fn load_section(conn: &Connection, section: Section) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            let mut candidate = current.clone();
            if merge_section_patch(section, &mut candidate, saved_obj).is_ok() {
                current = candidate;
            } else {
                tracing::warn!(key = section.key(), "ignoring invalid saved settings");
            }
        }
    }
    Ok(current)
}

/// Applies a validated patch and persists the merged section.
pub fn update_section(conn: &Connection, section: Section, patch: &Map<String, Value>) -> Result<Value, SettingsError> {
    let mut current = load_section(conn, section).map_err(SettingsError::Db)?;
    merge_section_patch(section, &mut current, patch).map_err(SettingsError::Invalid)?;
    db::settings_set_json(conn, section.key(), &current).map_err(SettingsError::Db)?;
    Ok(current)
}

#[derive(Debug)]
pub enum SettingsError {
    Invalid(String),
    Db(anyhow::Error),
}

pub fn grading_policy(conn: &Connection) -> anyhow::Result<GradingPolicy> {
    let v = load_section(conn, Section::Grading)?;
    Ok(serde_json::from_value(v)?)
}

pub fn numbering_config(conn: &Connection) -> anyhow::Result<NumberingConfig> {
    let v = load_section(conn, Section::Certificates)?;
    Ok(serde_json::from_value(v)?)
}

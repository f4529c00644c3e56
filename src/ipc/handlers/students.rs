use crate::calc::normalize_grade;
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    get_optional_choice, get_optional_date, get_optional_i64, get_optional_str, get_required_str,
    with_conn,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const STATUSES: &[&str] = &["active", "transferred", "graduated", "withdrawn"];

const STUDENT_COLUMNS: &str = "id, roll_number, name, grade, section, academic_year, status,
     admission_no, admission_date, gender, date_of_birth, guardian_name, address, phone,
     created_at, updated_at";

fn student_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "rollNumber": r.get::<_, i64>(1)?,
        "name": r.get::<_, String>(2)?,
        "grade": r.get::<_, String>(3)?,
        "section": r.get::<_, Option<String>>(4)?,
        "academicYear": r.get::<_, String>(5)?,
        "status": r.get::<_, String>(6)?,
        "admissionNo": r.get::<_, Option<String>>(7)?,
        "admissionDate": r.get::<_, Option<String>>(8)?,
        "gender": r.get::<_, Option<String>>(9)?,
        "dateOfBirth": r.get::<_, Option<String>>(10)?,
        "guardianName": r.get::<_, Option<String>>(11)?,
        "address": r.get::<_, Option<String>>(12)?,
        "phone": r.get::<_, Option<String>>(13)?,
        "createdAt": r.get::<_, String>(14)?,
        "updatedAt": r.get::<_, Option<String>>(15)?,
    }))
}

fn fetch_student(conn: &Connection, id: &str) -> Result<serde_json::Value, HandlerErr> {
    let sql = format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLUMNS);
    conn.query_row(&sql, [id], student_json)
        .optional()?
        .ok_or_else(|| HandlerErr::new("not_found", "student not found"))
}

fn get_roll_number(params: &serde_json::Value) -> Result<Option<i64>, HandlerErr> {
    let roll = get_optional_i64(params, "rollNumber")?;
    if let Some(n) = roll {
        if n < 1 {
            return Err(HandlerErr::bad_params("rollNumber must be >= 1"));
        }
    }
    Ok(roll)
}

/// Two active students in the same class cannot share a roll number.
fn ensure_roll_free(
    conn: &Connection,
    grade: &str,
    section: Option<&str>,
    academic_year: &str,
    roll_number: i64,
    except_id: Option<&str>,
) -> Result<(), HandlerErr> {
    let clash: Option<String> = conn
        .query_row(
            "SELECT id FROM students
             WHERE grade = ?1 AND academic_year = ?2 AND roll_number = ?3
               AND COALESCE(section, '') = COALESCE(?4, '')
               AND status = 'active'
               AND (?5 IS NULL OR id <> ?5)
             LIMIT 1",
            (grade, academic_year, roll_number, section, except_id),
            |r| r.get(0),
        )
        .optional()?;
    match clash {
        Some(other) => Err(HandlerErr::new("conflict", "roll number already in use")
            .with_details(json!({ "rollNumber": roll_number, "studentId": other }))),
        None => Ok(()),
    }
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let grade = get_optional_str(params, "grade")?.map(|g| normalize_grade(&g));
    let academic_year = get_optional_str(params, "academicYear")?;
    let status = get_optional_choice(params, "status", STATUSES)?;

    let sql = format!(
        "SELECT {} FROM students
         WHERE (?1 IS NULL OR grade = ?1)
           AND (?2 IS NULL OR academic_year = ?2)
           AND (?3 IS NULL OR status = ?3)
         ORDER BY grade, COALESCE(section, ''), roll_number, name",
        STUDENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let students = stmt
        .query_map((grade, academic_year, status), student_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(json!({ "students": students }))
}

fn students_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "studentId")?;
    Ok(json!({ "student": fetch_student(conn, &id)? }))
}

fn students_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let grade = normalize_grade(&get_required_str(params, "grade")?);
    let academic_year = get_required_str(params, "academicYear")?;
    let roll_number =
        get_roll_number(params)?.ok_or_else(|| HandlerErr::bad_params("missing rollNumber"))?;
    let section = get_optional_str(params, "section")?;
    let admission_no = get_optional_str(params, "admissionNo")?;
    let admission_date = get_optional_date(params, "admissionDate")?;
    let gender = get_optional_str(params, "gender")?;
    let date_of_birth = get_optional_date(params, "dateOfBirth")?;
    let guardian_name = get_optional_str(params, "guardianName")?;
    let address = get_optional_str(params, "address")?;
    let phone = get_optional_str(params, "phone")?;

    ensure_roll_free(conn, &grade, section.as_deref(), &academic_year, roll_number, None)?;

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(
            id, roll_number, name, grade, section, academic_year, status, admission_no,
            admission_date, gender, date_of_birth, guardian_name, address, phone, created_at)
         VALUES(?, ?, ?, ?, ?, ?, 'active', ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            roll_number,
            name,
            grade,
            section,
            academic_year,
            admission_no,
            admission_date,
            gender,
            date_of_birth,
            guardian_name,
            address,
            phone,
            db::now_timestamp(),
        ],
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "students" })))?;

    Ok(json!({ "studentId": id, "student": fetch_student(conn, &id)? }))
}

enum FieldKind {
    Text,
    Date,
}

const PATCHABLE: &[(&str, &str, FieldKind)] = &[
    ("name", "name", FieldKind::Text),
    ("section", "section", FieldKind::Text),
    ("admissionNo", "admission_no", FieldKind::Text),
    ("admissionDate", "admission_date", FieldKind::Date),
    ("gender", "gender", FieldKind::Text),
    ("dateOfBirth", "date_of_birth", FieldKind::Date),
    ("guardianName", "guardian_name", FieldKind::Text),
    ("address", "address", FieldKind::Text),
    ("phone", "phone", FieldKind::Text),
];

fn students_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "studentId")?;
    let Some(patch) = params.get("patch").filter(|v| v.is_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    let current = fetch_student(conn, &id)?;

    let mut sets: Vec<String> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();

    for key in patch.as_object().map(|o| o.keys().cloned().collect::<Vec<_>>()).unwrap_or_default() {
        if let Some((_, column, kind)) = PATCHABLE.iter().find(|(k, _, _)| *k == key) {
            let value = match kind {
                FieldKind::Text => get_optional_str(patch, &key)?,
                FieldKind::Date => get_optional_date(patch, &key)?,
            };
            if *column == "name" && value.is_none() {
                return Err(HandlerErr::bad_params("name must not be empty"));
            }
            sets.push(format!("{} = ?", column));
            binds.push(value.map(Value::Text).unwrap_or(Value::Null));
            continue;
        }
        match key.as_str() {
            "grade" => {
                let g = normalize_grade(&get_required_str(patch, "grade")?);
                sets.push("grade = ?".to_string());
                binds.push(Value::Text(g));
            }
            "academicYear" => {
                sets.push("academic_year = ?".to_string());
                binds.push(Value::Text(get_required_str(patch, "academicYear")?));
            }
            "rollNumber" => {
                let roll = get_roll_number(patch)?
                    .ok_or_else(|| HandlerErr::bad_params("rollNumber must not be null"))?;
                sets.push("roll_number = ?".to_string());
                binds.push(Value::Integer(roll));
            }
            "status" => {
                return Err(HandlerErr::bad_params("use students.setStatus to change status"));
            }
            other => {
                return Err(HandlerErr::bad_params(format!("unknown student field: {}", other)));
            }
        }
    }
    if sets.is_empty() {
        return Ok(json!({ "student": current }));
    }

    // Check the roll number against the row as it will look after the patch.
    let pick = |key: &str, fallback: &serde_json::Value| -> serde_json::Value {
        patch.get(key).cloned().unwrap_or_else(|| fallback.clone())
    };
    let grade = pick("grade", &current["grade"])
        .as_str()
        .map(normalize_grade)
        .unwrap_or_default();
    let year = pick("academicYear", &current["academicYear"])
        .as_str()
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let section = pick("section", &current["section"])
        .as_str()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let roll = pick("rollNumber", &current["rollNumber"]).as_i64().unwrap_or(0);
    if current["status"] == "active" {
        ensure_roll_free(conn, &grade, section.as_deref(), &year, roll, Some(id.as_str()))?;
    }

    sets.push("updated_at = ?".to_string());
    binds.push(Value::Text(db::now_timestamp()));
    binds.push(Value::Text(id.clone()));
    let sql = format!("UPDATE students SET {} WHERE id = ?", sets.join(", "));
    conn.execute(&sql, params_from_iter(binds))
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    Ok(json!({ "student": fetch_student(conn, &id)? }))
}

fn students_set_status(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "studentId")?;
    let status = get_optional_choice(params, "status", STATUSES)?
        .ok_or_else(|| HandlerErr::bad_params("missing status"))?;
    let current = fetch_student(conn, &id)?;
    if status == "active" && current["status"] != "active" {
        let grade = current["grade"].as_str().unwrap_or_default();
        let year = current["academicYear"].as_str().unwrap_or_default();
        let roll = current["rollNumber"].as_i64().unwrap_or(0);
        ensure_roll_free(conn, grade, current["section"].as_str(), year, roll, Some(id.as_str()))?;
    }
    conn.execute(
        "UPDATE students SET status = ?, updated_at = ? WHERE id = ?",
        (&status, db::now_timestamp(), &id),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tracing::info!(student_id = %id, from = %current["status"], to = %status, "student status changed");
    Ok(json!({ "student": fetch_student(conn, &id)? }))
}

/// Year rollover: every active student of `fromGrade`/`fromYear` moves to
/// `toGrade`/`toYear`. A null `toGrade` graduates the class instead.
/// Pairs of (moving student, student already in the target class) that would
/// end up sharing a roll number in the same section.
fn promotion_roll_clashes(
    conn: &Connection,
    from_grade: &str,
    from_year: &str,
    to_grade: &str,
    to_year: &str,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT m.id, t.id, m.roll_number
         FROM students m
         JOIN students t
           ON t.grade = ?3 AND t.academic_year = ?4 AND t.status = 'active'
          AND t.roll_number = m.roll_number
          AND COALESCE(t.section, '') = COALESCE(m.section, '')
          AND t.id <> m.id
         WHERE m.grade = ?1 AND m.academic_year = ?2 AND m.status = 'active'
         ORDER BY m.roll_number",
    )?;
    let rows = stmt
        .query_map((from_grade, from_year, to_grade, to_year), |r| {
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "existingStudentId": r.get::<_, String>(1)?,
                "rollNumber": r.get::<_, i64>(2)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn students_promote(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let from_grade = normalize_grade(&get_required_str(params, "fromGrade")?);
    let from_year = get_required_str(params, "fromYear")?;
    let to_grade = get_optional_str(params, "toGrade")?.map(|g| normalize_grade(&g));
    let to_year = get_required_str(params, "toYear")?;
    if to_year == from_year && to_grade.as_deref() == Some(from_grade.as_str()) {
        return Err(HandlerErr::bad_params("promotion must change grade or year"));
    }

    let now = db::now_timestamp();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    if let Some(g) = &to_grade {
        let clashes = promotion_roll_clashes(&tx, &from_grade, &from_year, g, &to_year)?;
        if !clashes.is_empty() {
            return Err(HandlerErr::new(
                "conflict",
                "promotion would duplicate roll numbers in the target class",
            )
            .with_details(json!({ "clashes": clashes })));
        }
    }
    let moved = match &to_grade {
        Some(g) => tx.execute(
            "UPDATE students SET grade = ?, academic_year = ?, updated_at = ?
             WHERE grade = ? AND academic_year = ? AND status = 'active'",
            (g, &to_year, &now, &from_grade, &from_year),
        ),
        None => tx.execute(
            "UPDATE students SET status = 'graduated', updated_at = ?
             WHERE grade = ? AND academic_year = ? AND status = 'active'",
            (&now, &from_grade, &from_year),
        ),
    }
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    tracing::info!(
        from_grade = %from_grade,
        to_grade = ?to_grade,
        count = moved,
        "students promoted"
    );
    Ok(json!({
        "moved": moved,
        "graduated": to_grade.is_none(),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(with_conn(state, req, students_list)),
        "students.get" => Some(with_conn(state, req, students_get)),
        "students.create" => Some(with_conn(state, req, students_create)),
        "students.update" => Some(with_conn(state, req, students_update)),
        "students.setStatus" => Some(with_conn(state, req, students_set_status)),
        "students.promote" => Some(with_conn(state, req, students_promote)),
        _ => None,
    }
}

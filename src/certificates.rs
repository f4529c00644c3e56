//! Transfer and service certificates.
//!
//! Reference numbers look like `TC/2026/007`: a prefix, the calendar year of
//! the issue date, and a per-year sequence. Sequences are allocated from the
//! `certificate_counters` row for (kind, year) inside the same IMMEDIATE
//! transaction that inserts the record, so two writers on one workspace can
//! never hand out the same number.

use chrono::{Datelike, NaiveDate};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db;

#[derive(Debug, Clone, Serialize)]
pub struct CertError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CertError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    fn db(code: &str, e: rusqlite::Error) -> Self {
        Self::new(code, e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateKind {
    Transfer,
    Service,
}

impl CertificateKind {
    fn key(self) -> &'static str {
        match self {
            Self::Transfer => "tc",
            Self::Service => "service",
        }
    }

    fn table(self) -> &'static str {
        match self {
            Self::Transfer => "tc_records",
            Self::Service => "service_certificates",
        }
    }
}

/// The `certificates` setup section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumberingConfig {
    pub tc_prefix: String,
    pub service_prefix: String,
    pub pad_width: usize,
}

impl Default for NumberingConfig {
    fn default() -> Self {
        Self {
            tc_prefix: "TC".to_string(),
            service_prefix: "SC".to_string(),
            pad_width: 3,
        }
    }
}

impl NumberingConfig {
    fn prefix(&self, kind: CertificateKind) -> &str {
        match kind {
            CertificateKind::Transfer => &self.tc_prefix,
            CertificateKind::Service => &self.service_prefix,
        }
    }
}

pub fn parse_issue_date(raw: &str) -> Result<NaiveDate, CertError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
        CertError::new("bad_params", "dates must be YYYY-MM-DD")
            .with_details(serde_json::json!({ "value": raw }))
    })
}

pub fn format_ref_number(prefix: &str, year: i32, seq: i64, pad_width: usize) -> String {
    format!("{}/{}/{:0width$}", prefix, year, seq, width = pad_width.max(1))
}

/// Count-based sequence for `year`: records already issued that year, plus one.
///
/// Only used to seed the counter for a year that has none yet.
pub fn next_sequence<'a, I>(year: i32, existing_issue_dates: I) -> i64
where
    I: IntoIterator<Item = &'a NaiveDate>,
{
    let count = existing_issue_dates
        .into_iter()
        .filter(|d| d.year() == year)
        .count();
    count as i64 + 1
}

fn allocate_sequence(tx: &Transaction<'_>, kind: CertificateKind, year: i32) -> Result<i64, CertError> {
    let current: Option<i64> = tx
        .query_row(
            "SELECT last_seq FROM certificate_counters WHERE kind = ? AND year = ?",
            (kind.key(), year),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| CertError::db("db_query_failed", e))?;

    let next = match current {
        Some(n) => n + 1,
        None => {
            let sql = format!("SELECT issue_date FROM {} WHERE issue_year = ?", kind.table());
            let mut stmt = tx
                .prepare(&sql)
                .map_err(|e| CertError::db("db_query_failed", e))?;
            let dates: Vec<NaiveDate> = stmt
                .query_map([year], |r| r.get::<_, String>(0))
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(|e| CertError::db("db_query_failed", e))?
                .iter()
                .filter_map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
                .collect();
            next_sequence(year, dates.iter())
        }
    };

    tx.execute(
        "INSERT INTO certificate_counters(kind, year, last_seq) VALUES(?, ?, ?)
         ON CONFLICT(kind, year) DO UPDATE SET last_seq = excluded.last_seq",
        (kind.key(), year, next),
    )
    .map_err(|e| CertError::db("db_update_failed", e))?;
    Ok(next)
}

fn begin_immediate(conn: &Connection) -> Result<Transaction<'_>, CertError> {
    Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .map_err(|e| CertError::db("db_tx_failed", e))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcRequest {
    pub student_id: String,
    pub issue_date: String,
    pub leaving_date: Option<String>,
    pub reason: String,
    #[serde(default)]
    pub conduct: Option<String>,
    #[serde(default)]
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TcRecord {
    pub id: String,
    pub ref_no: String,
    pub issue_date: String,
    pub student_id: String,
    pub student_name: String,
    pub roll_number: i64,
    pub grade: String,
    pub section: Option<String>,
    pub academic_year: String,
    pub admission_no: Option<String>,
    pub admission_date: Option<String>,
    pub date_of_birth: Option<String>,
    pub gender: Option<String>,
    pub guardian_name: Option<String>,
    pub leaving_date: String,
    pub reason: String,
    pub conduct: Option<String>,
    pub remarks: Option<String>,
    pub created_at: String,
}

const TC_COLUMNS: &str = "id, ref_no, issue_date, student_id, student_name, roll_number, grade,
     section, academic_year, admission_no, admission_date, date_of_birth, gender,
     guardian_name, leaving_date, reason, conduct, remarks, created_at";

fn tc_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<TcRecord> {
    Ok(TcRecord {
        id: r.get(0)?,
        ref_no: r.get(1)?,
        issue_date: r.get(2)?,
        student_id: r.get(3)?,
        student_name: r.get(4)?,
        roll_number: r.get(5)?,
        grade: r.get(6)?,
        section: r.get(7)?,
        academic_year: r.get(8)?,
        admission_no: r.get(9)?,
        admission_date: r.get(10)?,
        date_of_birth: r.get(11)?,
        gender: r.get(12)?,
        guardian_name: r.get(13)?,
        leaving_date: r.get(14)?,
        reason: r.get(15)?,
        conduct: r.get(16)?,
        remarks: r.get(17)?,
        created_at: r.get(18)?,
    })
}

/// Snapshots the student, allocates a reference number and marks the
/// student transferred, all in one transaction.
pub fn issue_transfer_certificate(
    conn: &Connection,
    numbering: &NumberingConfig,
    req: &TcRequest,
) -> Result<TcRecord, CertError> {
    let reason = req.reason.trim();
    if reason.is_empty() {
        return Err(CertError::new("bad_params", "reason must not be empty"));
    }
    let issue_date = parse_issue_date(&req.issue_date)?;
    let leaving_date = match req.leaving_date.as_deref() {
        Some(s) => parse_issue_date(s)?,
        None => issue_date,
    };

    let tx = begin_immediate(conn)?;

    #[allow(clippy::type_complexity)]
    let student: Option<(
        String,
        i64,
        String,
        Option<String>,
        String,
        String,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
    )> = tx
        .query_row(
            "SELECT name, roll_number, grade, section, academic_year, status, admission_no,
                    admission_date, date_of_birth, gender, guardian_name
             FROM students WHERE id = ?",
            [&req.student_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                    r.get(7)?,
                    r.get(8)?,
                    r.get(9)?,
                    r.get(10)?,
                ))
            },
        )
        .optional()
        .map_err(|e| CertError::db("db_query_failed", e))?;
    let Some((
        name,
        roll_number,
        grade,
        section,
        academic_year,
        status,
        admission_no,
        admission_date,
        date_of_birth,
        gender,
        guardian_name,
    )) = student
    else {
        return Err(CertError::new("not_found", "student not found"));
    };
    if status != "active" {
        return Err(CertError::new("conflict", "student is not active")
            .with_details(serde_json::json!({ "status": status })));
    }

    let year = issue_date.year();
    let seq = allocate_sequence(&tx, CertificateKind::Transfer, year)?;
    let record = TcRecord {
        id: Uuid::new_v4().to_string(),
        ref_no: format_ref_number(
            numbering.prefix(CertificateKind::Transfer),
            year,
            seq,
            numbering.pad_width,
        ),
        issue_date: issue_date.format("%Y-%m-%d").to_string(),
        student_id: req.student_id.clone(),
        student_name: name,
        roll_number,
        grade,
        section,
        academic_year,
        admission_no,
        admission_date,
        date_of_birth,
        gender,
        guardian_name,
        leaving_date: leaving_date.format("%Y-%m-%d").to_string(),
        reason: reason.to_string(),
        conduct: req.conduct.clone(),
        remarks: req.remarks.clone(),
        created_at: db::now_timestamp(),
    };

    tx.execute(
        "INSERT INTO tc_records(
            id, ref_no, issue_year, seq, issue_date, student_id, student_name, roll_number, grade,
            section, academic_year, admission_no, admission_date, date_of_birth, gender,
            guardian_name, leaving_date, reason, conduct, remarks, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            record.id,
            record.ref_no,
            year,
            seq,
            record.issue_date,
            record.student_id,
            record.student_name,
            record.roll_number,
            record.grade,
            record.section,
            record.academic_year,
            record.admission_no,
            record.admission_date,
            record.date_of_birth,
            record.gender,
            record.guardian_name,
            record.leaving_date,
            record.reason,
            record.conduct,
            record.remarks,
            record.created_at,
        ],
    )
    .map_err(|e| CertError::db("db_insert_failed", e))?;

    tx.execute(
        "UPDATE students SET status = 'transferred', updated_at = ? WHERE id = ?",
        (&record.created_at, &record.student_id),
    )
    .map_err(|e| CertError::db("db_update_failed", e))?;

    tx.commit().map_err(|e| CertError::db("db_tx_failed", e))?;

    tracing::info!(ref_no = %record.ref_no, student_id = %record.student_id, "transfer certificate issued");
    Ok(record)
}

pub fn list_transfer_certificates(
    conn: &Connection,
    year: Option<i32>,
) -> Result<Vec<TcRecord>, CertError> {
    let sql = format!(
        "SELECT {} FROM tc_records WHERE (?1 IS NULL OR issue_year = ?1) ORDER BY issue_year, seq, ref_no",
        TC_COLUMNS
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| CertError::db("db_query_failed", e))?;
    stmt.query_map([year], tc_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CertError::db("db_query_failed", e))
}

/// Lookup by record id or reference number.
pub fn get_transfer_certificate(conn: &Connection, key: &str) -> Result<TcRecord, CertError> {
    let sql = format!(
        "SELECT {} FROM tc_records WHERE id = ?1 OR ref_no = ?1",
        TC_COLUMNS
    );
    conn.query_row(&sql, [key], tc_from_row)
        .optional()
        .map_err(|e| CertError::db("db_query_failed", e))?
        .ok_or_else(|| CertError::new("not_found", "certificate not found"))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRequest {
    pub staff_id: String,
    pub issue_date: String,
    pub relieving_date: Option<String>,
    pub reason: String,
    #[serde(default)]
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCertificateRecord {
    pub id: String,
    pub ref_no: String,
    pub issue_date: String,
    pub staff_id: String,
    pub staff_name: String,
    pub designation: String,
    pub joining_date: Option<String>,
    pub relieving_date: String,
    pub reason: String,
    pub remarks: Option<String>,
    pub created_at: String,
}

pub fn issue_service_certificate(
    conn: &Connection,
    numbering: &NumberingConfig,
    req: &ServiceRequest,
) -> Result<ServiceCertificateRecord, CertError> {
    let reason = req.reason.trim();
    if reason.is_empty() {
        return Err(CertError::new("bad_params", "reason must not be empty"));
    }
    let issue_date = parse_issue_date(&req.issue_date)?;
    let relieving_date = match req.relieving_date.as_deref() {
        Some(s) => parse_issue_date(s)?,
        None => issue_date,
    };

    let tx = begin_immediate(conn)?;
    let staff: Option<(String, String, Option<String>, String)> = tx
        .query_row(
            "SELECT name, designation, joining_date, status FROM staff WHERE id = ?",
            [&req.staff_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(|e| CertError::db("db_query_failed", e))?;
    let Some((name, designation, joining_date, status)) = staff else {
        return Err(CertError::new("not_found", "staff member not found"));
    };
    if status != "active" {
        return Err(CertError::new("conflict", "staff member is not active")
            .with_details(serde_json::json!({ "status": status })));
    }

    let year = issue_date.year();
    let seq = allocate_sequence(&tx, CertificateKind::Service, year)?;
    let record = ServiceCertificateRecord {
        id: Uuid::new_v4().to_string(),
        ref_no: format_ref_number(
            numbering.prefix(CertificateKind::Service),
            year,
            seq,
            numbering.pad_width,
        ),
        issue_date: issue_date.format("%Y-%m-%d").to_string(),
        staff_id: req.staff_id.clone(),
        staff_name: name,
        designation,
        joining_date,
        relieving_date: relieving_date.format("%Y-%m-%d").to_string(),
        reason: reason.to_string(),
        remarks: req.remarks.clone(),
        created_at: db::now_timestamp(),
    };

    tx.execute(
        "INSERT INTO service_certificates(
            id, ref_no, issue_year, seq, issue_date, staff_id, staff_name, designation,
            joining_date, relieving_date, reason, remarks, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            record.id,
            record.ref_no,
            year,
            seq,
            record.issue_date,
            record.staff_id,
            record.staff_name,
            record.designation,
            record.joining_date,
            record.relieving_date,
            record.reason,
            record.remarks,
            record.created_at,
        ],
    )
    .map_err(|e| CertError::db("db_insert_failed", e))?;
    tx.execute(
        "UPDATE staff SET status = 'relieved', updated_at = ? WHERE id = ?",
        (&record.created_at, &record.staff_id),
    )
    .map_err(|e| CertError::db("db_update_failed", e))?;
    tx.commit().map_err(|e| CertError::db("db_tx_failed", e))?;

    tracing::info!(ref_no = %record.ref_no, staff_id = %record.staff_id, "service certificate issued");
    Ok(record)
}

pub fn list_service_certificates(
    conn: &Connection,
    year: Option<i32>,
) -> Result<Vec<ServiceCertificateRecord>, CertError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, ref_no, issue_date, staff_id, staff_name, designation, joining_date,
                    relieving_date, reason, remarks, created_at
             FROM service_certificates
             WHERE (?1 IS NULL OR issue_year = ?1)
             ORDER BY issue_year, seq, ref_no",
        )
        .map_err(|e| CertError::db("db_query_failed", e))?;
    stmt.query_map([year], |r| {
        Ok(ServiceCertificateRecord {
            id: r.get(0)?,
            ref_no: r.get(1)?,
            issue_date: r.get(2)?,
            staff_id: r.get(3)?,
            staff_name: r.get(4)?,
            designation: r.get(5)?,
            joining_date: r.get(6)?,
            relieving_date: r.get(7)?,
            reason: r.get(8)?,
            remarks: r.get(9)?,
            created_at: r.get(10)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| CertError::db("db_query_failed", e))
}

/// The number the next issuance for this year would get. Not reserved.
pub fn preview_ref_number(
    conn: &Connection,
    numbering: &NumberingConfig,
    kind: CertificateKind,
    year: i32,
) -> Result<String, CertError> {
    let current: Option<i64> = conn
        .query_row(
            "SELECT last_seq FROM certificate_counters WHERE kind = ? AND year = ?",
            (kind.key(), year),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| CertError::db("db_query_failed", e))?;
    let next = match current {
        Some(n) => n + 1,
        None => {
            let sql = format!("SELECT COUNT(*) FROM {} WHERE issue_year = ?", kind.table());
            let count: i64 = conn
                .query_row(&sql, [year], |r| r.get(0))
                .map_err(|e| CertError::db("db_query_failed", e))?;
            count + 1
        }
    };
    Ok(format_ref_number(
        numbering.prefix(kind),
        year,
        next,
        numbering.pad_width,
    ))
}

pub fn parse_kind(s: &str) -> Option<CertificateKind> {
    match s.trim().to_ascii_lowercase().as_str() {
        "tc" | "transfer" => Some(CertificateKind::Transfer),
        "service" | "sc" => Some(CertificateKind::Service),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn temp_workspace(prefix: &str) -> std::path::PathBuf {
        let p = std::env::temp_dir().join(format!("{}-{}", prefix, Uuid::new_v4()));
        std::fs::create_dir_all(&p).unwrap();
        p
    }

    fn seed_student(conn: &Connection, name: &str) -> String {
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO students(id, roll_number, name, grade, academic_year, status, created_at)
             VALUES(?, 1, ?, 'VIII', '2026', 'active', '2026-01-01T00:00:00Z')",
            (&id, name),
        )
        .unwrap();
        id
    }

    fn tc_req(student_id: &str, issue_date: &str) -> TcRequest {
        TcRequest {
            student_id: student_id.to_string(),
            issue_date: issue_date.to_string(),
            leaving_date: None,
            reason: "Family relocation".to_string(),
            conduct: Some("Good".to_string()),
            remarks: None,
        }
    }

    #[test]
    fn ref_number_is_zero_padded() {
        assert_eq!(format_ref_number("TC", 2026, 1, 3), "TC/2026/001");
        assert_eq!(format_ref_number("TC", 2026, 1234, 3), "TC/2026/1234");
    }

    #[test]
    fn count_based_sequence_is_per_year() {
        let existing = [date("2025-12-31"), date("2026-01-10"), date("2026-03-02")];
        assert_eq!(next_sequence(2026, existing.iter()), 3);
        assert_eq!(next_sequence(2027, existing.iter()), 1);
    }

    #[test]
    fn issuing_allocates_consecutive_numbers_and_resets_per_year() {
        let ws = temp_workspace("schoold-cert-unit");
        let conn = db::open_db(&ws).unwrap();
        let cfg = NumberingConfig::default();

        let a = seed_student(&conn, "Asha");
        let b = seed_student(&conn, "Bina");
        let c = seed_student(&conn, "Chitra");

        let first = issue_transfer_certificate(&conn, &cfg, &tc_req(&a, "2026-04-01")).unwrap();
        let second = issue_transfer_certificate(&conn, &cfg, &tc_req(&b, "2026-11-20")).unwrap();
        let next_year = issue_transfer_certificate(&conn, &cfg, &tc_req(&c, "2027-01-05")).unwrap();

        assert_eq!(first.ref_no, "TC/2026/001");
        assert_eq!(second.ref_no, "TC/2026/002");
        assert_eq!(next_year.ref_no, "TC/2027/001");

        let status: String = conn
            .query_row("SELECT status FROM students WHERE id = ?", [&a], |r| r.get(0))
            .unwrap();
        assert_eq!(status, "transferred");
    }

    #[test]
    fn second_tc_for_same_student_is_a_conflict() {
        let ws = temp_workspace("schoold-cert-conflict");
        let conn = db::open_db(&ws).unwrap();
        let cfg = NumberingConfig::default();
        let a = seed_student(&conn, "Asha");

        issue_transfer_certificate(&conn, &cfg, &tc_req(&a, "2026-04-01")).unwrap();
        let e = issue_transfer_certificate(&conn, &cfg, &tc_req(&a, "2026-04-02")).unwrap_err();
        assert_eq!(e.code, "conflict");

        let preview = preview_ref_number(&conn, &cfg, CertificateKind::Transfer, 2026).unwrap();
        assert_eq!(preview, "TC/2026/002");
    }

    #[test]
    fn two_connections_never_share_a_number() {
        let ws = temp_workspace("schoold-cert-two-conn");
        let conn_a = db::open_db(&ws).unwrap();
        let conn_b = db::open_db(&ws).unwrap();
        let cfg = NumberingConfig::default();

        let s1 = seed_student(&conn_a, "Asha");
        let s2 = seed_student(&conn_a, "Bina");

        let r1 = issue_transfer_certificate(&conn_a, &cfg, &tc_req(&s1, "2026-05-01")).unwrap();
        let r2 = issue_transfer_certificate(&conn_b, &cfg, &tc_req(&s2, "2026-05-01")).unwrap();
        assert_ne!(r1.ref_no, r2.ref_no);
        assert_eq!(r2.ref_no, "TC/2026/002");
    }

    #[test]
    fn listing_orders_by_sequence_past_the_pad_width() {
        let ws = temp_workspace("schoold-cert-wide");
        let conn = db::open_db(&ws).unwrap();
        let cfg = NumberingConfig::default();
        conn.execute(
            "INSERT INTO certificate_counters(kind, year, last_seq) VALUES('tc', 2026, 998)",
            [],
        )
        .unwrap();

        for name in ["Asha", "Bina", "Chitra"] {
            let id = seed_student(&conn, name);
            issue_transfer_certificate(&conn, &cfg, &tc_req(&id, "2026-06-01")).unwrap();
        }

        let refs: Vec<String> = list_transfer_certificates(&conn, Some(2026))
            .unwrap()
            .into_iter()
            .map(|r| r.ref_no)
            .collect();
        assert_eq!(refs, vec!["TC/2026/999", "TC/2026/1000", "TC/2026/1001"]);
    }
}

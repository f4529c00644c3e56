use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "school.sqlite3";

fn exams_table_sql(name: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {name}(
        id TEXT PRIMARY KEY,
        student_id TEXT NOT NULL,
        academic_year TEXT NOT NULL,
        grade TEXT NOT NULL,
        exam_id TEXT NOT NULL,
        exam_name TEXT NOT NULL,
        remarks TEXT,
        conduct TEXT,
        working_days INTEGER,
        days_present INTEGER,
        updated_at TEXT,
        FOREIGN KEY(student_id) REFERENCES students(id),
        UNIQUE(student_id, academic_year, exam_id)
    )"
    )
}

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    // Concurrent sessions on the same workspace wait for the writer instead of failing fast.
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            roll_number INTEGER NOT NULL,
            name TEXT NOT NULL,
            grade TEXT NOT NULL,
            section TEXT,
            academic_year TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            admission_no TEXT,
            admission_date TEXT,
            gender TEXT,
            date_of_birth TEXT,
            guardian_name TEXT,
            address TEXT,
            phone TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_grade ON students(grade, academic_year)",
        [],
    )?;
    ensure_students_section(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_payments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            period TEXT NOT NULL,
            amount REAL NOT NULL,
            paid_on TEXT NOT NULL,
            receipt_no TEXT,
            note TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_payments_student ON fee_payments(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS staff(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            designation TEXT NOT NULL,
            joining_date TEXT,
            phone TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_definitions(
            grade TEXT PRIMARY KEY,
            scheme TEXT NOT NULL DEFAULT 'standard',
            class_teacher_id TEXT,
            updated_at TEXT,
            FOREIGN KEY(class_teacher_id) REFERENCES staff(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_subjects(
            grade TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            name TEXT NOT NULL,
            exam_full_marks REAL NOT NULL,
            activity_full_marks REAL NOT NULL DEFAULT 0,
            PRIMARY KEY(grade, sort_order),
            FOREIGN KEY(grade) REFERENCES grade_definitions(grade)
        )",
        [],
    )?;

    conn.execute(&exams_table_sql("exams"), [])?;
    ensure_exams_scoped(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exams_exam ON exams(exam_id, academic_year)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_marks(
            exam_row_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            exam_marks REAL,
            activity_marks REAL,
            PRIMARY KEY(exam_row_id, subject),
            FOREIGN KEY(exam_row_id) REFERENCES exams(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS tc_records(
            id TEXT PRIMARY KEY,
            ref_no TEXT NOT NULL UNIQUE,
            issue_year INTEGER NOT NULL,
            seq INTEGER NOT NULL DEFAULT 0,
            issue_date TEXT NOT NULL,
            student_id TEXT NOT NULL,
            student_name TEXT NOT NULL,
            roll_number INTEGER NOT NULL,
            grade TEXT NOT NULL,
            section TEXT,
            academic_year TEXT NOT NULL,
            admission_no TEXT,
            admission_date TEXT,
            date_of_birth TEXT,
            gender TEXT,
            guardian_name TEXT,
            leaving_date TEXT NOT NULL,
            reason TEXT NOT NULL,
            conduct TEXT,
            remarks TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tc_records_year ON tc_records(issue_year)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS service_certificates(
            id TEXT PRIMARY KEY,
            ref_no TEXT NOT NULL UNIQUE,
            issue_year INTEGER NOT NULL,
            seq INTEGER NOT NULL DEFAULT 0,
            issue_date TEXT NOT NULL,
            staff_id TEXT NOT NULL,
            staff_name TEXT NOT NULL,
            designation TEXT NOT NULL,
            joining_date TEXT,
            relieving_date TEXT NOT NULL,
            reason TEXT NOT NULL,
            remarks TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(staff_id) REFERENCES staff(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_service_certificates_year ON service_certificates(issue_year)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS certificate_counters(
            kind TEXT NOT NULL,
            year INTEGER NOT NULL,
            last_seq INTEGER NOT NULL,
            PRIMARY KEY(kind, year)
        )",
        [],
    )?;

    ensure_certificate_seq(&conn, "tc_records")?;
    ensure_certificate_seq(&conn, "service_certificates")?;

    Ok(conn)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

/// Workspaces created before sections were tracked have no `section` column.
fn ensure_students_section(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "section")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN section TEXT", [])?;
    Ok(())
}

/// Exam rows used to be keyed by (student, exam) only. SQLite cannot change a
/// UNIQUE constraint in place, so the table is rebuilt and each row is stamped
/// with the student's grade and year as they stand at migration time.
fn ensure_exams_scoped(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "exams", "academic_year")? {
        return Ok(());
    }

    conn.execute_batch("PRAGMA foreign_keys = OFF")?;
    let rebuilt = conn.execute_batch(&format!(
        "BEGIN;
         {};
         INSERT INTO exams_scoped(id, student_id, academic_year, grade, exam_id, exam_name, remarks,
                           conduct, working_days, days_present, updated_at)
           SELECT e.id, e.student_id, COALESCE(s.academic_year, ''), COALESCE(s.grade, ''),
                  e.exam_id, e.exam_name, e.remarks, e.conduct, e.working_days,
                  e.days_present, e.updated_at
           FROM exams e
           LEFT JOIN students s ON s.id = e.student_id;
         DROP TABLE exams;
         ALTER TABLE exams_scoped RENAME TO exams;
         COMMIT;",
        exams_table_sql("exams_scoped")
    ));
    if rebuilt.is_err() {
        let _ = conn.execute_batch("ROLLBACK");
    }
    conn.execute_batch("PRAGMA foreign_keys = ON")?;
    rebuilt?;
    Ok(())
}

/// Older workspaces only have the formatted reference number; recover the
/// sequence from its last segment.
fn ensure_certificate_seq(conn: &Connection, table: &str) -> anyhow::Result<()> {
    if table_has_column(conn, table, "seq")? {
        return Ok(());
    }
    conn.execute(
        &format!("ALTER TABLE {} ADD COLUMN seq INTEGER NOT NULL DEFAULT 0", table),
        [],
    )?;

    let mut stmt = conn.prepare(&format!("SELECT id, ref_no FROM {}", table))?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    let update = format!("UPDATE {} SET seq = ? WHERE id = ?", table);
    for (id, ref_no) in rows {
        let seq = ref_no
            .rsplit('/')
            .next()
            .and_then(|tail| tail.trim().parse::<i64>().ok())
            .unwrap_or(0);
        conn.execute(&update, (seq, &id))?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_workspace(prefix: &str) -> std::path::PathBuf {
        let p = std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&p).unwrap();
        p
    }

    #[test]
    fn older_workspaces_gain_exam_years_and_certificate_sequences() {
        let ws = temp_workspace("schoold-db-migrate");
        {
            let old = Connection::open(ws.join(DB_FILE_NAME)).unwrap();
            old.execute_batch(
                "CREATE TABLE students(
                    id TEXT PRIMARY KEY, roll_number INTEGER NOT NULL, name TEXT NOT NULL,
                    grade TEXT NOT NULL, section TEXT, academic_year TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'active', admission_no TEXT, admission_date TEXT,
                    gender TEXT, date_of_birth TEXT, guardian_name TEXT, address TEXT, phone TEXT,
                    created_at TEXT NOT NULL, updated_at TEXT);
                 CREATE TABLE exams(
                    id TEXT PRIMARY KEY, student_id TEXT NOT NULL, exam_id TEXT NOT NULL,
                    exam_name TEXT NOT NULL, remarks TEXT, conduct TEXT, working_days INTEGER,
                    days_present INTEGER, updated_at TEXT,
                    FOREIGN KEY(student_id) REFERENCES students(id),
                    UNIQUE(student_id, exam_id));
                 CREATE TABLE exam_marks(
                    exam_row_id TEXT NOT NULL, subject TEXT NOT NULL, exam_marks REAL,
                    activity_marks REAL, PRIMARY KEY(exam_row_id, subject),
                    FOREIGN KEY(exam_row_id) REFERENCES exams(id));
                 CREATE TABLE tc_records(
                    id TEXT PRIMARY KEY, ref_no TEXT NOT NULL UNIQUE, issue_year INTEGER NOT NULL,
                    issue_date TEXT NOT NULL, student_id TEXT NOT NULL, student_name TEXT NOT NULL,
                    roll_number INTEGER NOT NULL, grade TEXT NOT NULL, section TEXT,
                    academic_year TEXT NOT NULL, admission_no TEXT, admission_date TEXT,
                    date_of_birth TEXT, gender TEXT, guardian_name TEXT, leaving_date TEXT NOT NULL,
                    reason TEXT NOT NULL, conduct TEXT, remarks TEXT, created_at TEXT NOT NULL);
                 INSERT INTO students(id, roll_number, name, grade, academic_year, created_at)
                    VALUES('s1', 1, 'Mira', 'VIII', '2026', '2026-01-01T00:00:00Z');
                 INSERT INTO exams(id, student_id, exam_id, exam_name)
                    VALUES('e1', 's1', 'final', 'Annual');
                 INSERT INTO exam_marks(exam_row_id, subject, exam_marks, activity_marks)
                    VALUES('e1', 'English', 78, 15);
                 INSERT INTO tc_records(id, ref_no, issue_year, issue_date, student_id, student_name,
                    roll_number, grade, academic_year, leaving_date, reason, created_at)
                    VALUES('t1', 'TC/2025/1204', 2025, '2025-03-01', 's1', 'Mira', 1, 'VII',
                           '2025', '2025-03-01', 'Moved', '2025-03-01T00:00:00Z');",
            )
            .unwrap();
        }

        let conn = open_db(&ws).unwrap();
        let (year, grade): (String, String) = conn
            .query_row("SELECT academic_year, grade FROM exams WHERE id = 'e1'", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!((year.as_str(), grade.as_str()), ("2026", "VIII"));

        let marks: f64 = conn
            .query_row(
                "SELECT m.exam_marks FROM exam_marks m JOIN exams e ON e.id = m.exam_row_id",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(marks, 78.0);
        let dangling: i64 = conn
            .query_row("SELECT COUNT(*) FROM pragma_foreign_key_check", [], |r| r.get(0))
            .unwrap();
        assert_eq!(dangling, 0);

        // The same exam id can now be saved again for a later year.
        conn.execute(
            "INSERT INTO exams(id, student_id, academic_year, grade, exam_id, exam_name)
             VALUES('e2', 's1', '2027', 'IX', 'final', 'Annual')",
            [],
        )
        .unwrap();

        let seq: i64 = conn
            .query_row("SELECT seq FROM tc_records WHERE id = 't1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(seq, 1204);
    }
}

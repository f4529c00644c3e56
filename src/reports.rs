//! Class mark statements and per-student report cards.
//!
//! Loads the current rows for a grade, runs them through the calc pipeline
//! (resolve subjects, aggregate, classify, rank) and returns view models.
//! Nothing computed here is written back.

use std::collections::HashMap;

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::calc::{
    self, aggregate_exam, assign_ranks, classify, normalize_grade, resolve_scheme,
    resolve_subjects, round_2, sort_rows, CalcError, GradeDefinition, GradingPolicy,
    GradingScheme, ProcessedStudent, ResultStatus, SortBy, SubjectBreakdown, SubjectDefinition,
    SubjectMark,
};

fn db_err(e: rusqlite::Error) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Conduct {
    A,
    B,
    C,
    D,
    E,
}

impl Conduct {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Some(Self::A),
            "B" => Some(Self::B),
            "C" => Some(Self::C),
            "D" => Some(Self::D),
            "E" => Some(Self::E),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
            Self::E => "E",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusScope {
    #[default]
    Active,
    All,
}

impl StatusScope {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "all" => Some(Self::All),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct RosterStudent {
    id: String,
    roll_number: i64,
    name: String,
    grade: String,
    section: Option<String>,
    academic_year: String,
    status: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamRecord {
    pub exam_id: String,
    pub exam_name: String,
    /// Academic year and grade the student was in when the marks were saved.
    pub academic_year: String,
    pub grade: String,
    pub marks: Vec<SubjectMark>,
    pub remarks: Option<String>,
    pub conduct: Option<String>,
    pub working_days: Option<i64>,
    pub days_present: Option<i64>,
    pub updated_at: Option<String>,
}

pub fn load_grade_definition(conn: &Connection, grade: &str) -> Result<Option<GradeDefinition>, CalcError> {
    let key = normalize_grade(grade);
    let head: Option<(String, String, Option<String>)> = conn
        .query_row(
            "SELECT grade, scheme, class_teacher_id FROM grade_definitions WHERE grade = ?",
            [&key],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(db_err)?;
    let Some((grade, scheme, class_teacher)) = head else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare(
            "SELECT name, exam_full_marks, activity_full_marks
             FROM grade_subjects
             WHERE grade = ?
             ORDER BY sort_order",
        )
        .map_err(db_err)?;
    let subjects = stmt
        .query_map([&grade], |r| {
            Ok(SubjectDefinition {
                name: r.get(0)?,
                exam_full_marks: r.get(1)?,
                activity_full_marks: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    Ok(Some(GradeDefinition {
        grade,
        scheme: GradingScheme::parse(&scheme).unwrap_or_default(),
        class_teacher,
        subjects,
    }))
}

pub fn load_grade_definitions(conn: &Connection) -> Result<HashMap<String, GradeDefinition>, CalcError> {
    let mut stmt = conn
        .prepare("SELECT grade FROM grade_definitions ORDER BY grade")
        .map_err(db_err)?;
    let grades = stmt
        .query_map([], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut out = HashMap::new();
    for g in grades {
        if let Some(def) = load_grade_definition(conn, &g)? {
            out.insert(normalize_grade(&def.grade), def);
        }
    }
    Ok(out)
}

/// Definitions for a single grade keyed the way `resolve_subjects` expects.
fn definitions_for(conn: &Connection, grade: &str) -> Result<HashMap<String, GradeDefinition>, CalcError> {
    let mut out = HashMap::new();
    if let Some(def) = load_grade_definition(conn, grade)? {
        out.insert(normalize_grade(&def.grade), def);
    }
    Ok(out)
}

/// The student's marks record for `exam_id` in `academic_year`.
pub fn load_exam(
    conn: &Connection,
    student_id: &str,
    academic_year: &str,
    exam_id: &str,
) -> Result<Option<ExamRecord>, CalcError> {
    #[allow(clippy::type_complexity)]
    let head: Option<(
        String,
        String,
        String,
        Option<String>,
        Option<String>,
        Option<i64>,
        Option<i64>,
        Option<String>,
    )> = conn
        .query_row(
            "SELECT id, exam_name, grade, remarks, conduct, working_days, days_present, updated_at
             FROM exams
             WHERE student_id = ? AND academic_year = ? AND exam_id = ?",
            (student_id, academic_year, exam_id),
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
                ))
            },
        )
        .optional()
        .map_err(db_err)?;
    let Some((row_id, exam_name, grade, remarks, conduct, working_days, days_present, updated_at)) =
        head
    else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare(
            "SELECT subject, exam_marks, activity_marks
             FROM exam_marks
             WHERE exam_row_id = ?
             ORDER BY rowid",
        )
        .map_err(db_err)?;
    let marks = stmt
        .query_map([&row_id], |r| {
            Ok(SubjectMark {
                subject: r.get(0)?,
                exam_marks: r.get(1)?,
                activity_marks: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    Ok(Some(ExamRecord {
        exam_id: exam_id.to_string(),
        exam_name,
        academic_year: academic_year.to_string(),
        grade,
        marks,
        remarks,
        conduct,
        working_days,
        days_present,
        updated_at,
    }))
}

fn load_roster(
    conn: &Connection,
    grade: &str,
    academic_year: Option<&str>,
    scope: StatusScope,
) -> Result<Vec<RosterStudent>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, roll_number, name, grade, section, academic_year, status
             FROM students
             WHERE UPPER(TRIM(grade)) = ?1
               AND (?2 IS NULL OR academic_year = ?2)
               AND (?3 = 'all' OR status = 'active')
             ORDER BY roll_number, name",
        )
        .map_err(db_err)?;
    let scope_key = match scope {
        StatusScope::Active => "active",
        StatusScope::All => "all",
    };
    stmt.query_map(
        (normalize_grade(grade), academic_year, scope_key),
        |r| {
            Ok(RosterStudent {
                id: r.get(0)?,
                roll_number: r.get(1)?,
                name: r.get(2)?,
                grade: r.get(3)?,
                section: r.get(4)?,
                academic_year: r.get(5)?,
                status: r.get(6)?,
            })
        },
    )
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_err)
}

fn load_student(conn: &Connection, student_id: &str) -> Result<RosterStudent, CalcError> {
    conn.query_row(
        "SELECT id, roll_number, name, grade, section, academic_year, status
         FROM students WHERE id = ?",
        [student_id],
        |r| {
            Ok(RosterStudent {
                id: r.get(0)?,
                roll_number: r.get(1)?,
                name: r.get(2)?,
                grade: r.get(3)?,
                section: r.get(4)?,
                academic_year: r.get(5)?,
                status: r.get(6)?,
            })
        },
    )
    .optional()
    .map_err(db_err)?
    .ok_or_else(|| {
        CalcError::new("not_found", "student not found")
            .with_details(serde_json::json!({ "studentId": student_id }))
    })
}

fn process_student(
    s: &RosterStudent,
    exam: Option<&ExamRecord>,
    subjects: &[SubjectDefinition],
    policy: &GradingPolicy,
) -> ProcessedStudent {
    let marks: &[SubjectMark] = exam.map(|e| e.marks.as_slice()).unwrap_or(&[]);
    let aggregate = aggregate_exam(marks, subjects);
    let classification = classify(&aggregate, policy);
    let mut row = ProcessedStudent::new(
        s.id.clone(),
        s.roll_number,
        s.name.clone(),
        s.grade.clone(),
        s.section.clone(),
        s.status.clone(),
        aggregate,
        classification,
    );
    if exam.is_none() {
        row.appeared = false;
        row.remark = "Absent".to_string();
    }
    row
}

#[derive(Debug, Clone)]
pub struct StatementQuery {
    pub grade: String,
    pub exam_id: String,
    pub academic_year: Option<String>,
    pub sort_by: SortBy,
    pub scope: StatusScope,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementSummary {
    pub student_count: usize,
    pub appeared: usize,
    pub passed: usize,
    pub failed: usize,
    pub first_division: usize,
    pub second_division: usize,
    pub third_division: usize,
    pub class_average_percent: f64,
    pub highest_total: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStatement {
    pub grade: String,
    pub exam_id: String,
    pub academic_year: Option<String>,
    pub scheme: GradingScheme,
    pub class_teacher: Option<String>,
    pub subjects: Vec<SubjectDefinition>,
    pub max_total: f64,
    pub rows: Vec<ProcessedStudent>,
    pub summary: StatementSummary,
}

/// Results, divisions and the average cover only students who sat the exam.
fn summarize(rows: &[ProcessedStudent]) -> StatementSummary {
    let sat: Vec<&ProcessedStudent> = rows.iter().filter(|r| r.appeared).collect();
    let mut summary = StatementSummary {
        student_count: rows.len(),
        appeared: sat.len(),
        ..StatementSummary::default()
    };
    for r in &sat {
        match r.result {
            ResultStatus::Pass => summary.passed += 1,
            ResultStatus::Fail => summary.failed += 1,
        }
        match r.division.as_str() {
            "I" => summary.first_division += 1,
            "II" => summary.second_division += 1,
            "III" => summary.third_division += 1,
            _ => {}
        }
        summary.highest_total = Some(match summary.highest_total {
            Some(h) if h >= r.grand_total => h,
            _ => r.grand_total,
        });
    }
    if !sat.is_empty() {
        let sum: f64 = sat.iter().map(|r| r.percentage).sum();
        summary.class_average_percent = round_2(sum / sat.len() as f64);
    }
    summary
}

pub fn compute_class_statement(
    conn: &Connection,
    policy: &GradingPolicy,
    q: &StatementQuery,
) -> Result<ClassStatement, CalcError> {
    let definitions = definitions_for(conn, &q.grade)?;
    let definition = definitions.values().next();
    let subjects = resolve_subjects(&q.grade, &definitions, policy);
    let scheme = resolve_scheme(&q.grade, definition, policy);
    let max_total: f64 = subjects.iter().map(|s| s.full_marks()).sum();

    let roster = load_roster(conn, &q.grade, q.academic_year.as_deref(), q.scope)?;
    let mut rows = Vec::with_capacity(roster.len());
    for s in &roster {
        let exam = load_exam(conn, &s.id, &s.academic_year, &q.exam_id)?;
        rows.push(process_student(s, exam.as_ref(), &subjects, policy));
    }

    assign_ranks(&mut rows, policy.rank_policy);
    sort_rows(&mut rows, q.sort_by);
    let summary = summarize(&rows);

    tracing::debug!(
        grade = %q.grade,
        exam_id = %q.exam_id,
        students = rows.len(),
        "class statement computed"
    );

    Ok(ClassStatement {
        grade: normalize_grade(&q.grade),
        exam_id: q.exam_id.clone(),
        academic_year: q.academic_year.clone(),
        scheme,
        class_teacher: definition.and_then(|d| d.class_teacher.clone()),
        subjects,
        max_total,
        rows,
        summary,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attendance {
    pub working_days: i64,
    pub days_present: i64,
    pub percent: f64,
}

fn attendance_of(exam: &ExamRecord) -> Option<Attendance> {
    let working_days = exam.working_days?;
    let days_present = exam.days_present.unwrap_or(0);
    let percent = if working_days > 0 {
        round_2(100.0 * days_present as f64 / working_days as f64)
    } else {
        0.0
    };
    Some(Attendance {
        working_days,
        days_present,
        percent,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentReport {
    pub student_id: String,
    pub name: String,
    pub roll_number: i64,
    pub grade: String,
    pub section: Option<String>,
    pub academic_year: String,
    pub exam_id: String,
    pub exam_name: Option<String>,
    pub subjects: Vec<SubjectBreakdown>,
    pub exam_total: f64,
    pub activity_total: f64,
    pub grand_total: f64,
    pub max_total: f64,
    pub classification: calc::Classification,
    pub rank: Option<u32>,
    pub class_size: usize,
    pub attendance: Option<Attendance>,
    pub conduct: Option<String>,
    pub remarks: Option<String>,
}

pub fn compute_student_report(
    conn: &Connection,
    policy: &GradingPolicy,
    student_id: &str,
    exam_id: &str,
) -> Result<StudentReport, CalcError> {
    let student = load_student(conn, student_id)?;
    let definitions = definitions_for(conn, &student.grade)?;
    let subjects = resolve_subjects(&student.grade, &definitions, policy);
    let exam = load_exam(conn, student_id, &student.academic_year, exam_id)?;

    let marks: &[SubjectMark] = exam.as_ref().map(|e| e.marks.as_slice()).unwrap_or(&[]);
    let aggregate = aggregate_exam(marks, &subjects);
    let classification = classify(&aggregate, policy);

    // Rank among the student's cohort; inactive students are ranked against everyone.
    let scope = if student.status == "active" {
        StatusScope::Active
    } else {
        StatusScope::All
    };
    let statement = compute_class_statement(
        conn,
        policy,
        &StatementQuery {
            grade: student.grade.clone(),
            exam_id: exam_id.to_string(),
            academic_year: Some(student.academic_year.clone()),
            sort_by: SortBy::Roll,
            scope,
        },
    )?;
    let rank = statement
        .rows
        .iter()
        .find(|r| r.student_id == student.id)
        .and_then(|r| r.rank);

    Ok(StudentReport {
        student_id: student.id,
        name: student.name,
        roll_number: student.roll_number,
        grade: student.grade,
        section: student.section,
        academic_year: student.academic_year,
        exam_id: exam_id.to_string(),
        exam_name: exam.as_ref().map(|e| e.exam_name.clone()),
        exam_total: aggregate.exam_total,
        activity_total: aggregate.activity_total,
        grand_total: aggregate.grand_total,
        max_total: aggregate.max_total,
        subjects: aggregate.subjects,
        classification,
        rank,
        class_size: statement.rows.len(),
        attendance: exam.as_ref().and_then(attendance_of),
        conduct: exam.as_ref().and_then(|e| e.conduct.clone()),
        remarks: exam.as_ref().and_then(|e| e.remarks.clone()),
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub exam_id: String,
    pub exam_name: String,
    pub academic_year: String,
    pub grade: String,
    pub grand_total: f64,
    pub max_total: f64,
    pub percentage: f64,
    pub result: ResultStatus,
    pub division: String,
    pub academic_grade: Option<String>,
}

/// Every stored exam for the student, by academic year, each scored against
/// the grade the student was in when it was taken.
pub fn compute_student_history(
    conn: &Connection,
    policy: &GradingPolicy,
    student_id: &str,
) -> Result<Vec<HistoryEntry>, CalcError> {
    let student = load_student(conn, student_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT academic_year, exam_id FROM exams
             WHERE student_id = ?
             ORDER BY academic_year, rowid",
        )
        .map_err(db_err)?;
    let keys = stmt
        .query_map([student_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut subjects_by_grade: HashMap<String, Vec<SubjectDefinition>> = HashMap::new();
    let mut out = Vec::with_capacity(keys.len());
    for (academic_year, exam_id) in keys {
        let Some(exam) = load_exam(conn, student_id, &academic_year, &exam_id)? else {
            continue;
        };
        let grade = if exam.grade.trim().is_empty() {
            student.grade.clone()
        } else {
            exam.grade.clone()
        };
        let key = normalize_grade(&grade);
        if !subjects_by_grade.contains_key(&key) {
            let definitions = definitions_for(conn, &grade)?;
            subjects_by_grade.insert(key.clone(), resolve_subjects(&grade, &definitions, policy));
        }
        let subjects = subjects_by_grade.get(&key).map(Vec::as_slice).unwrap_or(&[]);

        let aggregate = aggregate_exam(&exam.marks, subjects);
        let c = classify(&aggregate, policy);
        out.push(HistoryEntry {
            exam_id,
            exam_name: exam.exam_name,
            academic_year,
            grade: key,
            grand_total: aggregate.grand_total,
            max_total: aggregate.max_total,
            percentage: c.percentage,
            result: c.result,
            division: c.division,
            academic_grade: c.academic_grade,
        });
    }
    Ok(out)
}

use std::cmp::Ordering;

use serde::Serialize;

use super::{Classification, ExamAggregate, RankPolicy, ResultStatus, SubjectBreakdown};

const TIE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortBy {
    #[default]
    Roll,
    Name,
    Total,
}

impl SortBy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "roll" | "rollnumber" => Some(Self::Roll),
            "name" => Some(Self::Name),
            "total" | "totalmarks" => Some(Self::Total),
            _ => None,
        }
    }
}

/// One row of a class mark statement. Derived on every request, never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedStudent {
    pub student_id: String,
    pub roll_number: i64,
    pub name: String,
    pub grade: String,
    pub section: Option<String>,
    pub status: String,
    pub subjects: Vec<SubjectBreakdown>,
    pub exam_total: f64,
    pub activity_total: f64,
    pub grand_total: f64,
    pub max_total: f64,
    pub percentage: f64,
    pub result: ResultStatus,
    pub division: String,
    pub academic_grade: Option<String>,
    pub remark: String,
    /// False when the student has no marks record for the exam at all.
    pub appeared: bool,
    pub rank: Option<u32>,
}

impl ProcessedStudent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        student_id: String,
        roll_number: i64,
        name: String,
        grade: String,
        section: Option<String>,
        status: String,
        aggregate: ExamAggregate,
        classification: Classification,
    ) -> Self {
        Self {
            student_id,
            roll_number,
            name,
            grade,
            section,
            status,
            exam_total: aggregate.exam_total,
            activity_total: aggregate.activity_total,
            grand_total: aggregate.grand_total,
            max_total: aggregate.max_total,
            subjects: aggregate.subjects,
            percentage: classification.percentage,
            result: classification.result,
            division: classification.division,
            academic_grade: classification.academic_grade,
            remark: classification.remark,
            appeared: true,
            rank: None,
        }
    }
}

fn same_total(a: f64, b: f64) -> bool {
    (a - b).abs() < TIE_EPSILON
}

fn by_total_desc(a: &ProcessedStudent, b: &ProcessedStudent) -> Ordering {
    b.grand_total
        .partial_cmp(&a.grand_total)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.roll_number.cmp(&b.roll_number))
        .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
}

/// Annotates every row that appeared with its rank by grand total. Absent rows
/// keep `rank: None`. Row order is untouched.
pub fn assign_ranks(rows: &mut [ProcessedStudent], policy: RankPolicy) {
    for r in rows.iter_mut() {
        r.rank = None;
    }
    let mut order: Vec<usize> = (0..rows.len()).filter(|&i| rows[i].appeared).collect();
    order.sort_by(|&a, &b| by_total_desc(&rows[a], &rows[b]));

    let mut prev_total: Option<f64> = None;
    let mut prev_rank: u32 = 0;
    for (pos, &idx) in order.iter().enumerate() {
        let position = (pos + 1) as u32;
        let total = rows[idx].grand_total;
        let tied = prev_total.map(|p| same_total(p, total)).unwrap_or(false);
        let rank = match policy {
            RankPolicy::RollTiebreak => position,
            RankPolicy::Competition if tied => prev_rank,
            RankPolicy::Competition => position,
            RankPolicy::Dense if tied => prev_rank,
            RankPolicy::Dense => prev_rank + 1,
        };
        rows[idx].rank = Some(rank);
        prev_total = Some(total);
        prev_rank = rank;
    }
}

pub fn sort_rows(rows: &mut [ProcessedStudent], sort_by: SortBy) {
    match sort_by {
        SortBy::Roll => rows.sort_by(|a, b| {
            a.roll_number
                .cmp(&b.roll_number)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        }),
        SortBy::Name => rows.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.roll_number.cmp(&b.roll_number))
        }),
        // Unranked (absent) rows go last.
        SortBy::Total => rows.sort_by(|a, b| {
            a.rank
                .is_none()
                .cmp(&b.rank.is_none())
                .then_with(|| a.rank.cmp(&b.rank))
                .then_with(|| by_total_desc(a, b))
        }),
    }
}

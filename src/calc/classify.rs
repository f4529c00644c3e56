use serde::Serialize;

use super::{round_2, ExamAggregate, GradingPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResultStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub percentage: f64,
    pub result: ResultStatus,
    pub division: String,
    pub academic_grade: Option<String>,
    pub remark: String,
    /// Subjects below `subjectPassPercent`, in display order.
    pub failed_subjects: Vec<String>,
}

const DIVISION_FAIL: &str = "Fail";

fn percentage_of(total: f64, max_total: f64) -> f64 {
    if max_total <= 0.0 || !total.is_finite() {
        return 0.0;
    }
    round_2((100.0 * total / max_total).clamp(0.0, 100.0))
}

fn division_for(percentage: f64, policy: &GradingPolicy) -> &'static str {
    let d = &policy.divisions;
    if percentage >= d.first {
        "I"
    } else if percentage >= d.second {
        "II"
    } else if percentage >= d.third {
        "III"
    } else {
        DIVISION_FAIL
    }
}

pub fn classify(aggregate: &ExamAggregate, policy: &GradingPolicy) -> Classification {
    if aggregate.subjects.is_empty() {
        return Classification {
            percentage: 0.0,
            result: ResultStatus::Fail,
            division: DIVISION_FAIL.to_string(),
            academic_grade: None,
            remark: "No subjects configured".to_string(),
            failed_subjects: Vec::new(),
        };
    }

    let percentage = percentage_of(aggregate.grand_total, aggregate.max_total);

    let failed_subjects: Vec<String> = match policy.subject_pass_percent {
        Some(min) => aggregate
            .subjects
            .iter()
            .filter(|s| s.full_marks > 0.0 && s.percent() < min)
            .map(|s| s.subject.clone())
            .collect(),
        None => Vec::new(),
    };

    let result = if percentage < policy.pass_percent || !failed_subjects.is_empty() {
        ResultStatus::Fail
    } else {
        ResultStatus::Pass
    };

    let division = match result {
        ResultStatus::Fail => DIVISION_FAIL,
        ResultStatus::Pass => division_for(percentage, policy),
    };

    let band = policy
        .grade_bands
        .iter()
        .find(|b| percentage >= b.min_percent);

    Classification {
        percentage,
        result,
        division: division.to_string(),
        academic_grade: band.map(|b| b.grade.clone()),
        remark: band.map(|b| b.remark.clone()).unwrap_or_default(),
        failed_subjects,
    }
}

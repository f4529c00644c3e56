//! Academic record aggregation: subject resolution, mark totals, result
//! classification and class ranking. Everything here is a pure function of
//! its inputs; callers load rows from the workspace and recompute on every
//! request.

mod aggregate;
mod classify;
mod policy;
mod rank;
mod subjects;

use serde::{Deserialize, Serialize};

pub use aggregate::{aggregate_exam, ExamAggregate, SubjectBreakdown};
pub use classify::{classify, Classification, ResultStatus};
pub use policy::{
    normalize_grade, GradeBand, GradingPolicy, GradingScheme, RankPolicy,
};
pub use rank::{assign_ranks, sort_rows, ProcessedStudent, SortBy};
pub use subjects::{resolve_scheme, resolve_subjects};

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Entered vs not-yet-entered. A zero score is `Scored(0.0)`, not `NotEntered`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MarkState {
    NotEntered,
    Scored(f64),
}

impl MarkState {
    pub fn from_option(v: Option<f64>) -> Self {
        match v {
            Some(x) => MarkState::Scored(x),
            None => MarkState::NotEntered,
        }
    }

    pub fn value(self) -> Option<f64> {
        match self {
            MarkState::NotEntered => None,
            MarkState::Scored(v) => Some(v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectDefinition {
    pub name: String,
    pub exam_full_marks: f64,
    pub activity_full_marks: f64,
}

impl SubjectDefinition {
    pub fn full_marks(&self) -> f64 {
        self.exam_full_marks + self.activity_full_marks
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeDefinition {
    pub grade: String,
    #[serde(default)]
    pub scheme: GradingScheme,
    #[serde(default)]
    pub class_teacher: Option<String>,
    #[serde(default)]
    pub subjects: Vec<SubjectDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectMark {
    pub subject: String,
    #[serde(default)]
    pub exam_marks: Option<f64>,
    #[serde(default)]
    pub activity_marks: Option<f64>,
}

/// Round half up to two decimals for display values such as percentages.
pub fn round_2(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

/// Subject names are matched trimmed and case-insensitively.
pub fn subject_key(name: &str) -> String {
    name.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_2_rounds_half_up() {
        assert_eq!(round_2(77.5), 77.5);
        assert_eq!(round_2(66.666_666), 66.67);
        assert_eq!(round_2(0.0), 0.0);
        assert_eq!(round_2(12.344), 12.34);
    }

    #[test]
    fn mark_state_keeps_zero_distinct_from_missing() {
        assert_eq!(MarkState::from_option(Some(0.0)), MarkState::Scored(0.0));
        assert_eq!(MarkState::from_option(None), MarkState::NotEntered);
        assert_eq!(MarkState::NotEntered.value(), None);
    }
}

use serde::{Deserialize, Serialize};

use super::CalcError;

/// How a grade's subjects are weighted when resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradingScheme {
    /// Stored exam and activity ceilings are used as-is.
    #[default]
    Standard,
    /// Every subject is a pure 100-mark paper with no activity component.
    BoardExam,
}

impl GradingScheme {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Some(Self::Standard),
            "board_exam" | "boardexam" => Some(Self::BoardExam),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::BoardExam => "board_exam",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankPolicy {
    /// Ties share a rank; the next score resumes at previous rank + tie size (1, 1, 3).
    #[default]
    Competition,
    /// Ties share a rank; the next score takes the next integer (1, 1, 2).
    Dense,
    /// Ties broken by roll number; every row gets a distinct rank.
    RollTiebreak,
}

impl RankPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "competition" => Some(Self::Competition),
            "dense" => Some(Self::Dense),
            "roll_tiebreak" | "rolltiebreak" => Some(Self::RollTiebreak),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DivisionCutoffs {
    pub first: f64,
    pub second: f64,
    pub third: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBand {
    pub min_percent: f64,
    pub grade: String,
    pub remark: String,
}

/// School-wide grading rules. Persisted as the `grading` setup section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingPolicy {
    pub pass_percent: f64,
    pub subject_pass_percent: Option<f64>,
    pub divisions: DivisionCutoffs,
    /// Ordered from highest `min_percent` to lowest.
    pub grade_bands: Vec<GradeBand>,
    pub rank_policy: RankPolicy,
    pub board_exam_grades: Vec<String>,
}

impl Default for GradingPolicy {
    fn default() -> Self {
        let band = |min_percent: f64, grade: &str, remark: &str| GradeBand {
            min_percent,
            grade: grade.to_string(),
            remark: remark.to_string(),
        };
        Self {
            pass_percent: 33.0,
            subject_pass_percent: None,
            divisions: DivisionCutoffs {
                first: 60.0,
                second: 45.0,
                third: 33.0,
            },
            grade_bands: vec![
                band(90.0, "A+", "Outstanding"),
                band(80.0, "A", "Excellent"),
                band(70.0, "B+", "Very Good"),
                band(60.0, "B", "Good"),
                band(50.0, "C+", "Above Average"),
                band(40.0, "C", "Average"),
                band(33.0, "D", "Below Average"),
                band(0.0, "E", "Needs Improvement"),
            ],
            rank_policy: RankPolicy::Competition,
            board_exam_grades: vec!["IX".to_string(), "X".to_string()],
        }
    }
}

impl GradingPolicy {
    pub fn is_board_exam_grade(&self, grade: &str) -> bool {
        let g = normalize_grade(grade);
        self.board_exam_grades
            .iter()
            .any(|b| normalize_grade(b) == g)
    }

    /// Rejects policies that would make classification ambiguous.
    pub fn validate(&self) -> Result<(), CalcError> {
        let in_range = |v: f64| (0.0..=100.0).contains(&v);
        if !in_range(self.pass_percent) {
            return Err(CalcError::new("bad_params", "passPercent must be in 0..=100"));
        }
        if let Some(p) = self.subject_pass_percent {
            if !in_range(p) {
                return Err(CalcError::new(
                    "bad_params",
                    "subjectPassPercent must be in 0..=100",
                ));
            }
        }
        let d = &self.divisions;
        if !(in_range(d.first) && in_range(d.second) && in_range(d.third)) {
            return Err(CalcError::new("bad_params", "division cutoffs must be in 0..=100"));
        }
        if !(d.first >= d.second && d.second >= d.third) {
            return Err(CalcError::new(
                "bad_params",
                "division cutoffs must be ordered first >= second >= third",
            ));
        }
        if self.grade_bands.is_empty() {
            return Err(CalcError::new("bad_params", "gradeBands must not be empty"));
        }
        for pair in self.grade_bands.windows(2) {
            if pair[0].min_percent <= pair[1].min_percent {
                return Err(CalcError::new(
                    "bad_params",
                    "gradeBands must be ordered by strictly decreasing minPercent",
                ));
            }
        }
        for b in &self.grade_bands {
            if !in_range(b.min_percent) || b.grade.trim().is_empty() {
                return Err(CalcError::new(
                    "bad_params",
                    "each grade band needs a grade and minPercent in 0..=100",
                ));
            }
        }
        // Every percentage must land in some band.
        if self.grade_bands.last().map(|b| b.min_percent) != Some(0.0) {
            return Err(CalcError::new(
                "bad_params",
                "the last grade band must start at minPercent 0",
            ));
        }
        Ok(())
    }
}

/// Grade keys are matched trimmed and case-insensitively ("ix" == "IX").
pub fn normalize_grade(grade: &str) -> String {
    grade.trim().to_ascii_uppercase()
}

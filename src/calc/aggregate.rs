use std::collections::HashMap;

use serde::Serialize;

use super::{subject_key, MarkState, SubjectDefinition, SubjectMark};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectBreakdown {
    pub subject: String,
    pub exam_full_marks: f64,
    pub activity_full_marks: f64,
    /// `None` when not entered; the UI renders it blank, not "0".
    pub exam_marks: Option<f64>,
    pub activity_marks: Option<f64>,
    pub subject_total: f64,
    pub full_marks: f64,
    /// True when a stored mark fell outside `[0, fullMarks]` and was clamped.
    pub clamped: bool,
}

impl SubjectBreakdown {
    pub fn percent(&self) -> f64 {
        if self.full_marks > 0.0 {
            100.0 * self.subject_total / self.full_marks
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamAggregate {
    pub subjects: Vec<SubjectBreakdown>,
    pub exam_total: f64,
    pub activity_total: f64,
    pub grand_total: f64,
    pub max_total: f64,
    pub not_entered_count: usize,
}

fn clamp_component(state: MarkState, ceiling: f64) -> (f64, bool) {
    match state {
        MarkState::NotEntered => (0.0, false),
        MarkState::Scored(v) if !v.is_finite() || v < 0.0 => (0.0, true),
        MarkState::Scored(v) if v > ceiling => (ceiling, true),
        MarkState::Scored(v) => (v, false),
    }
}

/// Totals one exam's marks against the resolved subject list.
///
/// Output order follows `subjects`; marks are matched by subject name, so
/// stored order and missing entries do not affect the result.
pub fn aggregate_exam(marks: &[SubjectMark], subjects: &[SubjectDefinition]) -> ExamAggregate {
    let mut by_subject: HashMap<String, &SubjectMark> = HashMap::new();
    for m in marks {
        // First entry wins if a subject was stored twice.
        by_subject.entry(subject_key(&m.subject)).or_insert(m);
    }

    let mut out = ExamAggregate::default();
    for def in subjects {
        let mark = by_subject.get(&subject_key(&def.name));
        let exam_state = MarkState::from_option(mark.and_then(|m| m.exam_marks));
        let activity_state = if def.activity_full_marks > 0.0 {
            MarkState::from_option(mark.and_then(|m| m.activity_marks))
        } else {
            // No activity component: whatever was stored is ignored.
            MarkState::NotEntered
        };

        if exam_state == MarkState::NotEntered {
            out.not_entered_count += 1;
        }
        if def.activity_full_marks > 0.0 && activity_state == MarkState::NotEntered {
            out.not_entered_count += 1;
        }

        let (exam, exam_clamped) = clamp_component(exam_state, def.exam_full_marks);
        let (activity, activity_clamped) =
            clamp_component(activity_state, def.activity_full_marks);

        out.exam_total += exam;
        out.activity_total += activity;
        out.max_total += def.full_marks();
        out.subjects.push(SubjectBreakdown {
            subject: def.name.clone(),
            exam_full_marks: def.exam_full_marks,
            activity_full_marks: def.activity_full_marks,
            exam_marks: exam_state.value(),
            activity_marks: activity_state.value(),
            subject_total: exam + activity,
            full_marks: def.full_marks(),
            clamped: exam_clamped || activity_clamped,
        });
    }
    out.grand_total = out.exam_total + out.activity_total;
    out
}

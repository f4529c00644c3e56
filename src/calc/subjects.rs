use std::collections::HashMap;

use super::{normalize_grade, GradeDefinition, GradingPolicy, GradingScheme, SubjectDefinition};

const BOARD_EXAM_FULL_MARKS: f64 = 100.0;

/// Board-exam grades named by the policy always win over the stored scheme.
pub fn resolve_scheme(
    grade: &str,
    definition: Option<&GradeDefinition>,
    policy: &GradingPolicy,
) -> GradingScheme {
    if policy.is_board_exam_grade(grade) {
        return GradingScheme::BoardExam;
    }
    definition.map(|d| d.scheme).unwrap_or_default()
}

pub fn resolve_subjects(
    grade: &str,
    definitions: &HashMap<String, GradeDefinition>,
    policy: &GradingPolicy,
) -> Vec<SubjectDefinition> {
    let key = normalize_grade(grade);
    let definition = definitions
        .get(&key)
        .or_else(|| definitions.values().find(|d| normalize_grade(&d.grade) == key));
    let Some(definition) = definition else {
        return Vec::new();
    };

    match resolve_scheme(grade, Some(definition), policy) {
        GradingScheme::Standard => definition.subjects.clone(),
        GradingScheme::BoardExam => definition
            .subjects
            .iter()
            .map(|s| SubjectDefinition {
                name: s.name.clone(),
                exam_full_marks: BOARD_EXAM_FULL_MARKS,
                activity_full_marks: 0.0,
            })
            .collect(),
    }
}

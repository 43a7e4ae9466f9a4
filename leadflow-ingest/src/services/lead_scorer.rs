//! Lead Scoring Engine
//!
//! Pure, table-driven scoring: five qualification dimensions, each
//! contributing 0-4 points from a fixed lookup table, summed into a
//! 0-20 score and mapped to a quality tier. No I/O anywhere in this
//! module. An unrecognized answer is a validation error, never a
//! silent zero: scoring unknown input would corrupt the bid-
//! optimization feedback loop downstream.

use leadflow_common::{Error, Result};

use crate::models::{LeadScore, QualificationAnswers};

/// Bump when any answer table changes, so historical scores can be
/// traced to the table that produced them
pub const SCORING_TABLE_VERSION: &str = "2026-01";

/// (answer value, point contribution, human-readable label)
type AnswerTable = &'static [(&'static str, u8, &'static str)];

const STUDY_TIMELINE: AnswerTable = &[
    ("january-2026", 4, "January 2026 intake"),
    ("may-2026", 3, "May 2026 intake"),
    ("september-2026", 2, "September 2026 intake"),
    ("researching", 0, "Just researching"),
];

const PROGRAM_TYPE: AnswerTable = &[
    ("full-time-diploma", 4, "Full-time Diploma (2 years)"),
    ("professional-certificate", 3, "Professional Certificate (6-12 months)"),
    ("foundation-certificate", 2, "Foundation Certificate (3-6 months)"),
    ("weekend-parttime", 1, "Weekend/Part-time classes"),
];

const BUDGET_RANGE: AnswerTable = &[
    ("500k-plus", 4, "500,000+ KES"),
    ("300k-500k", 3, "300,000 - 500,000 KES"),
    ("100k-300k", 2, "100,000 - 300,000 KES"),
    ("need-discussion", 2, "Need to discuss payment options"),
    ("under-100k", 1, "Under 100,000 KES"),
];

const CAREER_GOAL: AnswerTable = &[
    ("career-change", 4, "Career change to creative industry"),
    ("start-business", 4, "Start my own creative business"),
    ("skill-upgrade", 3, "Upgrade skills in current role"),
    ("university-prep", 2, "Prepare for university studies"),
    ("personal-interest", 1, "Personal interest/hobby"),
];

const EXPERIENCE_LEVEL: AnswerTable = &[
    ("professional-upgrade", 4, "Professional looking to upgrade"),
    ("formal-training", 3, "Have formal training elsewhere"),
    ("intermediate", 2, "Intermediate level"),
    ("some-experience", 1, "Some basic experience"),
    ("complete-beginner", 0, "Complete beginner"),
];

fn dimension_points(table: AnswerTable, dimension: &str, answer: &str) -> Result<u8> {
    table
        .iter()
        .find(|(value, _, _)| *value == answer)
        .map(|(_, points, _)| *points)
        .ok_or_else(|| {
            Error::Validation(format!(
                "Unrecognized {} answer: {:?}",
                dimension, answer
            ))
        })
}

fn dimension_label(table: AnswerTable, answer: &str) -> Option<&'static str> {
    table
        .iter()
        .find(|(value, _, _)| *value == answer)
        .map(|(_, _, label)| *label)
}

/// Score a completed answer set
pub fn score(answers: &QualificationAnswers) -> Result<LeadScore> {
    let total = dimension_points(STUDY_TIMELINE, "study timeline", &answers.study_timeline)?
        + dimension_points(PROGRAM_TYPE, "program type", &answers.program_type)?
        + dimension_points(BUDGET_RANGE, "budget range", &answers.budget_range)?
        + dimension_points(CAREER_GOAL, "career goal", &answers.career_goal)?
        + dimension_points(EXPERIENCE_LEVEL, "experience level", &answers.experience_level)?;

    Ok(LeadScore::from_total(total))
}

/// Human-readable qualification summary pushed to the CRM
///
/// Validates every answer; an unrecognized value fails the same way
/// scoring does.
pub fn conversation_summary(answers: &QualificationAnswers) -> Result<String> {
    score(answers)?;
    let label = |table, answer: &str| dimension_label(table, answer).unwrap_or("Not specified");
    Ok(format!(
        "Timeline: {} | Program: {} | Investment: {} | Goals: {} | Experience: {}",
        label(STUDY_TIMELINE, &answers.study_timeline),
        label(PROGRAM_TYPE, &answers.program_type),
        label(BUDGET_RANGE, &answers.budget_range),
        label(CAREER_GOAL, &answers.career_goal),
        label(EXPERIENCE_LEVEL, &answers.experience_level),
    ))
}

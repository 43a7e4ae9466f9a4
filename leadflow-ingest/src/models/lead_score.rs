//! Lead quality score value object

use serde::{Deserialize, Serialize};

/// Discrete lead-quality bucket derived from the numeric score
///
/// Boundaries are contiguous and exhaustive over [0, 20]: no overlap,
/// no gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityTier {
    Hot,
    Warm,
    Cold,
    Unqualified,
}

impl QualityTier {
    /// Tier for a total score in [0, 20]
    pub fn from_score(score: u8) -> QualityTier {
        match score {
            15..=u8::MAX => QualityTier::Hot,
            10..=14 => QualityTier::Warm,
            5..=9 => QualityTier::Cold,
            0..=4 => QualityTier::Unqualified,
        }
    }

    /// Dollar value reported to ad platforms for this tier.
    /// Never the raw 0-20 score.
    pub fn conversion_value_usd(&self) -> u32 {
        match self {
            QualityTier::Hot => 100,
            QualityTier::Warm => 30,
            QualityTier::Cold => 10,
            QualityTier::Unqualified => 1,
        }
    }

    /// Qualification status label pushed to the CRM
    pub fn label(&self) -> &'static str {
        match self {
            QualityTier::Hot => "Hot Lead",
            QualityTier::Warm => "Warm Lead",
            QualityTier::Cold => "Cold Lead",
            QualityTier::Unqualified => "Unqualified",
        }
    }
}

/// Completed qualifying-form answer set, one answer per dimension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualificationAnswers {
    pub study_timeline: String,
    pub program_type: String,
    pub budget_range: String,
    pub career_goal: String,
    pub experience_level: String,
}

/// Deterministic scoring result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadScore {
    /// Sum of the five dimension contributions, each in [0, 4]
    pub score: u8,
    pub tier: QualityTier,
    pub conversion_value_usd: u32,
}

impl LeadScore {
    pub fn from_total(score: u8) -> LeadScore {
        let tier = QualityTier::from_score(score);
        LeadScore {
            score,
            tier,
            conversion_value_usd: tier.conversion_value_usd(),
        }
    }
}

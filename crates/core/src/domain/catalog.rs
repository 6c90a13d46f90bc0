use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::job::UserId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProgramId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramKind {
    Major,
    Minor,
    Certificate,
    GeneralEducation,
}

impl ProgramKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Major => "major",
            Self::Minor => "minor",
            Self::Certificate => "certificate",
            Self::GeneralEducation => "general_education",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "major" => Some(Self::Major),
            "minor" => Some(Self::Minor),
            "certificate" => Some(Self::Certificate),
            "general_education" | "gen_ed" => Some(Self::GeneralEducation),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StudentProfile {
    pub user_id: UserId,
    pub display_name: String,
    pub admission_year: Option<i32>,
    pub expected_graduation_term: Option<String>,
    pub is_transfer: bool,
    pub completed_courses: Vec<String>,
    pub career_goals: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub id: ProgramId,
    pub name: String,
    pub kind: ProgramKind,
    pub total_credits: u32,
    /// False when every requirement is a fixed course list with nothing to choose.
    pub requires_course_selection: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementGroup {
    pub id: String,
    pub program_id: ProgramId,
    pub name: String,
    pub credits_required: u32,
    pub course_codes: Vec<String>,
    /// Number of courses to pick from `course_codes`; `None` means all are required.
    pub min_courses: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramRequirements {
    pub program: Program,
    pub groups: Vec<RequirementGroup>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseOffering {
    pub code: String,
    pub term: String,
    pub title: String,
    pub credits: u32,
}

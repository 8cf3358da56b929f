pub mod analysis;
pub mod blueprint;
pub mod chapter;
pub mod outline;

pub use analysis::{
    AnalysisData, AnalysisMetadata, AnalysisSummaries, CharacterState, ForeshadowBlock, KeyEvent,
    PlantedForeshadow, ResolvedForeshadow,
};
pub use blueprint::{Blueprint, Character, Relationship};
pub use chapter::{Chapter, ChapterEvaluation, ChapterVersion, EvaluationDecision};
pub use outline::{ChapterOutline, GenerationStatus, PartOutline};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::ProjectStatus;

/// Root entity: one novel project owned by one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub user_id: String,
    pub title: String,
    pub initial_prompt: String,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(user_id: &str, title: &str, initial_prompt: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            initial_prompt: initial_prompt.to_string(),
            status: ProjectStatus::Draft,
            created_at: now,
            updated_at: now,
        }
    }
}

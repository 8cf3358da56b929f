use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::model::analysis::AnalysisData;
use crate::state::ChapterStatus;

/// A chapter of the novel. Text lives in candidate versions until one is
/// selected; `selected_version_id` is an id reference only, never a
/// navigable back-pointer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub id: Uuid,
    pub project_id: Uuid,
    pub chapter_number: u32,
    pub status: ChapterStatus,
    pub selected_version_id: Option<Uuid>,
    pub word_count: u32,
    pub real_summary: Option<String>,
    pub analysis_data: Option<AnalysisData>,
    #[serde(default)]
    pub versions: Vec<ChapterVersion>,
}

impl Chapter {
    pub fn new(project_id: Uuid, chapter_number: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            chapter_number,
            status: ChapterStatus::NotGenerated,
            selected_version_id: None,
            word_count: 0,
            real_summary: None,
            analysis_data: None,
            versions: Vec::new(),
        }
    }

    pub fn selected_version(&self) -> Option<&ChapterVersion> {
        let id = self.selected_version_id?;
        self.versions.iter().find(|v| v.id == id)
    }
}

/// One of N concurrently generated candidates for a chapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterVersion {
    pub id: Uuid,
    pub chapter_id: Uuid,
    pub version_label: String,
    pub content: String,
    #[serde(default)]
    pub provider_metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl ChapterVersion {
    pub fn new(chapter_id: Uuid, version_label: &str, content: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            chapter_id,
            version_label: version_label.to_string(),
            content,
            provider_metadata: Map::new(),
            created_at: Utc::now(),
        }
    }

    /// Versions that recorded a generation failure instead of prose.
    pub fn is_failed(&self) -> bool {
        self.content.starts_with("生成失败:")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationDecision {
    Accept,
    Retry,
    Reject,
}

impl EvaluationDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationDecision::Accept => "accept",
            EvaluationDecision::Retry => "retry",
            EvaluationDecision::Reject => "reject",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "accept" => EvaluationDecision::Accept,
            "retry" => EvaluationDecision::Retry,
            _ => EvaluationDecision::Reject,
        }
    }
}

/// Record of a user decision over a chapter's candidate versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterEvaluation {
    pub id: Uuid,
    pub chapter_id: Uuid,
    pub version_id: Option<Uuid>,
    pub decision: EvaluationDecision,
    pub feedback: String,
}

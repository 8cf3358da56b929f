use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Structured extraction from a confirmed chapter's text. Every field is
/// optional on the wire; malformed responses degrade to
/// `AnalysisData::degraded` rather than failing the chapter flow.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnalysisData {
    #[serde(default)]
    pub metadata: AnalysisMetadata,
    #[serde(default)]
    pub summaries: AnalysisSummaries,
    #[serde(default)]
    pub character_states: BTreeMap<String, CharacterState>,
    #[serde(default)]
    pub foreshadowing: ForeshadowBlock,
    #[serde(default)]
    pub key_events: Vec<KeyEvent>,
    /// Keys the schema does not know about yet, kept for rendering.
    #[serde(flatten)]
    pub raw: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnalysisMetadata {
    #[serde(default)]
    pub characters: Vec<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub items: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tone: String,
    #[serde(default)]
    pub timeline_marker: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnalysisSummaries {
    #[serde(default)]
    pub compressed: String,
    #[serde(default)]
    pub one_line: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CharacterState {
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub changes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ForeshadowBlock {
    #[serde(default)]
    pub planted: Vec<PlantedForeshadow>,
    #[serde(default)]
    pub resolved: Vec<ResolvedForeshadow>,
    #[serde(default)]
    pub tensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlantedForeshadow {
    pub description: String,
    #[serde(default)]
    pub original_text: String,
    #[serde(default)]
    pub category: String,
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default)]
    pub related_entities: Vec<String>,
}

fn default_priority() -> String {
    "medium".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResolvedForeshadow {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub resolution: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KeyEvent {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub description: String,
    #[serde(default)]
    pub importance: String,
}

impl AnalysisData {
    /// Minimal analysis used when the model's JSON cannot be repaired:
    /// only a one-line summary cut from the chapter opening survives.
    pub fn degraded(content: &str) -> Self {
        let one_line: String = content.chars().take(200).collect();
        Self {
            summaries: AnalysisSummaries {
                one_line,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

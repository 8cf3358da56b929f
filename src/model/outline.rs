use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle of a long-running outline generation. `Cancelling` is set
/// externally and converted to `Cancelled` at the next checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Pending,
    Generating,
    Cancelling,
    Completed,
    Cancelled,
    Failed,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::Pending => "pending",
            GenerationStatus::Generating => "generating",
            GenerationStatus::Cancelling => "cancelling",
            GenerationStatus::Completed => "completed",
            GenerationStatus::Cancelled => "cancelled",
            GenerationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "generating" => GenerationStatus::Generating,
            "cancelling" => GenerationStatus::Cancelling,
            "completed" => GenerationStatus::Completed,
            "cancelled" => GenerationStatus::Cancelled,
            "failed" => GenerationStatus::Failed,
            _ => GenerationStatus::Pending,
        }
    }
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mid-level plan covering a contiguous chapter range of a long novel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartOutline {
    pub part_number: u32,
    pub title: String,
    pub summary: String,
    pub start_chapter: u32,
    pub end_chapter: u32,
    #[serde(default)]
    pub theme: String,
    #[serde(default)]
    pub key_events: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<String>,
    #[serde(default)]
    pub character_arcs: BTreeMap<String, String>,
    #[serde(default)]
    pub ending_hook: String,
    #[serde(default = "default_generation_status")]
    pub generation_status: GenerationStatus,
    #[serde(default)]
    pub progress: u8,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_generation_status() -> GenerationStatus {
    GenerationStatus::Pending
}

impl fmt::Display for PartOutline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "第{}卷《{}》(第{}–{}章) 主题: {}",
            self.part_number, self.title, self.start_chapter, self.end_chapter, self.theme
        )?;
        writeln!(f, "{}", self.summary)?;
        if !self.key_events.is_empty() {
            writeln!(f, "关键事件: {}", self.key_events.join("；"))?;
        }
        if !self.conflicts.is_empty() {
            writeln!(f, "冲突: {}", self.conflicts.join("；"))?;
        }
        for (name, arc) in &self.character_arcs {
            writeln!(f, "{} 的成长线: {}", name, arc)?;
        }
        write!(f, "卷末钩子: {}", self.ending_hook)
    }
}

/// Per-chapter title and summary, created before the chapter text itself.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChapterOutline {
    pub chapter_number: u32,
    pub title: String,
    pub summary: String,
}

impl fmt::Display for ChapterOutline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "第{}章《{}》: {}", self.chapter_number, self.title, self.summary)
    }
}

use std::collections::BTreeMap;

use crate::index::{ForeshadowPriority, ForeshadowRow};
use crate::model::{Blueprint, ChapterOutline, CharacterState, KeyEvent};
use crate::rag::retriever::{ScoredChunk, ScoredSummary};

/// How many trailing chapters keep their full summary in the layered
/// historical summary; everything older shrinks to one sentence.
const FULL_SUMMARY_WINDOW: u32 = 10;
/// Previous-chapter ending excerpt length, characters.
const ENDING_EXCERPT_CHARS: usize = 1000;
const TOP_SUMMARIES: usize = 3;
const TOP_CHUNKS: usize = 5;

/// One labeled block of prompt context. Droppable sections may be removed
/// by the compressor when their tier runs over budget.
#[derive(Debug, Clone)]
pub struct Section {
    pub label: String,
    pub body: String,
    pub droppable: bool,
}

impl Section {
    fn new(label: &str, body: String) -> Self {
        Self {
            label: label.to_string(),
            body,
            droppable: false,
        }
    }

    fn droppable(label: &str, body: String) -> Self {
        Self {
            label: label.to_string(),
            body,
            droppable: true,
        }
    }

    pub fn render(&self) -> String {
        format!("{}\n{}", self.label, self.body)
    }
}

/// Three-slot context: required always survives compression, important is
/// kept while budget allows, reference fills whatever is left.
#[derive(Debug, Clone, Default)]
pub struct TieredContext {
    pub required: Vec<Section>,
    pub important: Vec<Section>,
    pub reference: Vec<Section>,
}

/// Everything the builder reads. The generator collects these once before
/// the version fan-out so all candidates share one snapshot.
pub struct ContextInputs<'a> {
    pub blueprint: &'a Blueprint,
    pub outline: &'a ChapterOutline,
    pub writing_notes: Option<&'a str>,
    /// Full content of the previous chapter's selected version.
    pub previous_content: Option<&'a str>,
    pub previous_summary: Option<&'a str>,
    pub previous_states: Option<&'a BTreeMap<String, CharacterState>>,
    pub pending_foreshadows: &'a [ForeshadowRow],
    pub retrieved_summaries: &'a [ScoredSummary],
    pub retrieved_chunks: &'a [ScoredChunk],
    /// (chapter_number, key events) for the trailing chapters.
    pub recent_key_events: &'a [(u32, Vec<KeyEvent>)],
    /// (chapter_number, real_summary) for every prior confirmed chapter.
    pub prior_summaries: &'a [(u32, String)],
}

pub struct ContextBuilder;

impl ContextBuilder {
    pub fn build(inputs: &ContextInputs<'_>) -> TieredContext {
        let blueprint = inputs.blueprint;
        let outline = inputs.outline;

        let mut required = Vec::new();
        required.push(Section::new(
            "[世界蓝图]",
            format!(
                "书名: {}\n一句话简介: {}\n类型: {}\n文风: {}\n基调: {}",
                blueprint.title,
                blueprint.one_sentence_summary,
                blueprint.genre,
                blueprint.style,
                blueprint.tone
            ),
        ));
        if !blueprint.characters.is_empty() {
            let names: Vec<&str> = blueprint
                .characters
                .iter()
                .map(|c| c.name.as_str())
                .collect();
            required.push(Section::droppable("[主要角色]", names.join("、")));
        }
        let mut goal = format!("标题: {}\n概要: {}", outline.title, outline.summary);
        if let Some(notes) = inputs.writing_notes {
            if !notes.is_empty() {
                goal.push_str(&format!("\n写作要求: {}", notes));
            }
        }
        required.push(Section::new("[本章章纲]", goal));
        if let Some(content) = inputs.previous_content {
            required.push(Section::droppable(
                "[上一章结尾]",
                ending_excerpt(content, ENDING_EXCERPT_CHARS),
            ));
        }

        let mut important = Vec::new();
        if !inputs.prior_summaries.is_empty() {
            important.push(Section::new(
                "[前情摘要]",
                layered_summary(inputs.prior_summaries, outline.chapter_number),
            ));
        }
        if let Some(summary) = inputs.previous_summary {
            if !summary.is_empty() {
                important.push(Section::new("[上一章摘要]", summary.to_string()));
            }
        }
        let outline_text = format!("{} {}", outline.title, outline.summary);
        let involved: Vec<&crate::model::Character> = blueprint
            .characters
            .iter()
            .filter(|c| !c.name.is_empty() && outline_text.contains(&c.name))
            .collect();
        if !involved.is_empty() {
            let details: Vec<String> = involved.iter().map(|c| c.to_string()).collect();
            important.push(Section::new("[角色详情]", details.join("\n")));

            let relationships: Vec<String> = blueprint
                .relationships
                .iter()
                .filter(|r| {
                    involved
                        .iter()
                        .any(|c| c.name == r.character_from || c.name == r.character_to)
                })
                .map(|r| r.to_string())
                .collect();
            if !relationships.is_empty() {
                important.push(Section::droppable("[人物关系]", relationships.join("\n")));
            }
        }
        let high_foreshadows: Vec<String> = inputs
            .pending_foreshadows
            .iter()
            .filter(|row| row.priority == ForeshadowPriority::High)
            .map(|row| format!("第{}章埋下: {}", row.planted_chapter, row.description))
            .collect();
        if !high_foreshadows.is_empty() {
            important.push(Section::new(
                "[待回收伏笔]",
                high_foreshadows.join("\n"),
            ));
        }
        if let Some(states) = inputs.previous_states {
            if !states.is_empty() {
                let lines: Vec<String> = states
                    .iter()
                    .map(|(name, state)| {
                        format!(
                            "{}: 位于{}，{}。{}",
                            name,
                            state.location,
                            state.status,
                            state.changes.join("；")
                        )
                    })
                    .collect();
                important.push(Section::new("[上一章角色状态]", lines.join("\n")));
            }
        }
        if !inputs.retrieved_summaries.is_empty() {
            let lines: Vec<String> = inputs
                .retrieved_summaries
                .iter()
                .take(TOP_SUMMARIES)
                .map(|s| format!("第{}章: {}", s.record.chapter_number, s.record.summary))
                .collect();
            important.push(Section::new("[检索到的章节摘要]", lines.join("\n")));
        }

        let mut reference = Vec::new();
        if !blueprint.world_setting.is_empty() {
            let lines: Vec<String> = blueprint
                .world_setting
                .iter()
                .map(|(key, value)| format!("{}: {}", key, render_world_value(value)))
                .collect();
            reference.push(Section::droppable("[世界设定]", lines.join("\n")));
        }
        if !inputs.retrieved_chunks.is_empty() {
            let lines: Vec<String> = inputs
                .retrieved_chunks
                .iter()
                .take(TOP_CHUNKS)
                .map(|c| {
                    format!(
                        "《{}》第{}章片段: {}",
                        c.record.chapter_title, c.record.chapter_number, c.record.content
                    )
                })
                .collect();
            reference.push(Section::new("[检索到的剧情上下文]", lines.join("\n")));
        }
        let minor_foreshadows: Vec<String> = inputs
            .pending_foreshadows
            .iter()
            .filter(|row| row.priority != ForeshadowPriority::High)
            .map(|row| {
                format!(
                    "第{}章埋下({}): {}",
                    row.planted_chapter,
                    row.priority.as_str(),
                    row.description
                )
            })
            .collect();
        if !minor_foreshadows.is_empty() {
            reference.push(Section::droppable(
                "[次要伏笔]",
                minor_foreshadows.join("\n"),
            ));
        }
        if !inputs.recent_key_events.is_empty() {
            let lines: Vec<String> = inputs
                .recent_key_events
                .iter()
                .flat_map(|(chapter, events)| {
                    events
                        .iter()
                        .map(move |e| format!("第{}章 [{}] {}", chapter, e.kind, e.description))
                })
                .collect();
            reference.push(Section::droppable("[近期关键事件]", lines.join("\n")));
        }

        TieredContext {
            required,
            important,
            reference,
        }
    }
}

/// Full summaries inside the trailing window, one-sentence briefs beyond it.
pub fn layered_summary(prior_summaries: &[(u32, String)], current_chapter: u32) -> String {
    let cutoff = current_chapter.saturating_sub(FULL_SUMMARY_WINDOW);
    prior_summaries
        .iter()
        .map(|(chapter, summary)| {
            if *chapter >= cutoff {
                format!("第{}章: {}", chapter, summary)
            } else {
                format!("第{}章: {}", chapter, first_sentence(summary))
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Up to and including the first Chinese or ASCII full stop.
fn first_sentence(text: &str) -> String {
    let mut sentence = String::new();
    for c in text.chars() {
        sentence.push(c);
        if c == '。' || c == '.' {
            break;
        }
    }
    sentence
}

/// Last `limit` characters of the previous chapter.
fn ending_excerpt(content: &str, limit: usize) -> String {
    let chars: Vec<char> = content.chars().collect();
    let start = chars.len().saturating_sub(limit);
    chars[start..].iter().collect()
}

fn render_world_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Blueprint, Character};
    use crate::rag::compress::compress;
    use crate::rag::retriever::ScoredChunk;
    use crate::vector::ChunkRecord;
    use uuid::Uuid;

    #[test]
    fn oversized_context_compresses_to_budget() {
        let blueprint = Blueprint {
            title: "凡人问道".to_string(),
            one_sentence_summary: "一个程序员穿越到修仙世界。".to_string(),
            genre: "仙侠".to_string(),
            style: "沉稳".to_string(),
            tone: "苍凉".to_string(),
            characters: (0..50)
                .map(|i| Character {
                    name: format!("角色{}", i),
                    identity: "配角".repeat(20),
                    position: i,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let outline = ChapterOutline {
            chapter_number: 30,
            title: "大比开幕".to_string(),
            summary: "角色0 与 角色1 在大比中相遇。".to_string(),
        };
        let project_id = Uuid::new_v4();
        let chunks: Vec<ScoredChunk> = (0..50)
            .map(|i| ScoredChunk {
                record: ChunkRecord {
                    id: ChunkRecord::record_id(project_id, i, 0),
                    project_id,
                    chapter_number: i,
                    chunk_index: 0,
                    chapter_title: format!("第{}章", i),
                    content: "旧章情节。".repeat(30),
                    embedding: vec![],
                    metadata: Default::default(),
                },
                final_score: 0.5,
            })
            .collect();

        let context = ContextBuilder::build(&ContextInputs {
            blueprint: &blueprint,
            outline: &outline,
            writing_notes: None,
            previous_content: None,
            previous_summary: None,
            previous_states: None,
            pending_foreshadows: &[],
            retrieved_summaries: &[],
            retrieved_chunks: &chunks,
            recent_key_events: &[],
            prior_summaries: &[],
        });

        let out = compress(&context, 2000, |s| s.chars().count());
        assert!(out.chars().count() <= 2000);
        assert!(out.contains("大比开幕"));
        assert!(out.contains("一个程序员穿越到修仙世界。"));
    }

    #[test]
    fn layered_summary_shortens_old_chapters() {
        let summaries: Vec<(u32, String)> = (1..=15)
            .map(|n| {
                (
                    n,
                    format!("第一句交代了第{}章的主线。第二句展开了细节。", n),
                )
            })
            .collect();
        let layered = layered_summary(&summaries, 16);
        let lines: Vec<&str> = layered.lines().collect();
        assert_eq!(lines.len(), 15);
        // Chapter 5 is outside the window of 10: brief only.
        assert!(lines[4].ends_with("主线。"), "got {:?}", lines[4]);
        // Chapter 14 keeps the full summary.
        assert!(lines[13].contains("第二句展开了细节"));
    }

    #[test]
    fn first_sentence_handles_ascii_stop() {
        assert_eq!(first_sentence("A short one. And more."), "A short one.");
        assert_eq!(first_sentence("没有句号的摘要"), "没有句号的摘要");
    }

    #[test]
    fn ending_excerpt_takes_char_tail() {
        let content = "前文。".repeat(600);
        let excerpt = ending_excerpt(&content, 1000);
        assert_eq!(excerpt.chars().count(), 1000);
        assert!(content.ends_with(&excerpt));
    }
}

use tracing::{info, warn};

use crate::llm::{CompletionParams, Gateway};
use crate::model::AnalysisData;
use crate::prompts;

/// Structured extraction over a confirmed chapter. Analysis must never sink
/// the chapter flow: any model or parse failure degrades to a minimal
/// analysis instead of an error.
#[derive(Clone)]
pub struct ChapterAnalyzer {
    gateway: Gateway,
    timeout_secs: u64,
}

impl ChapterAnalyzer {
    pub fn new(gateway: Gateway, timeout_secs: u64) -> Self {
        Self {
            gateway,
            timeout_secs,
        }
    }

    pub async fn analyze(
        &self,
        user_id: &str,
        content: &str,
        title: &str,
        chapter_number: u32,
        novel_title: &str,
    ) -> AnalysisData {
        let prompt = prompts::build_analysis_prompt(content, title, chapter_number, novel_title);
        let params = CompletionParams::new(user_id, prompts::ANALYSIS_SYSTEM, prompt)
            .json()
            .temperature(0.2)
            .timeout_secs(self.timeout_secs);

        match self.gateway.complete(params).await {
            Ok(raw) => {
                let analysis = parse_analysis(&raw, content);
                info!(
                    chapter_number,
                    characters = analysis.metadata.characters.len(),
                    planted = analysis.foreshadowing.planted.len(),
                    "chapter analysis extracted"
                );
                analysis
            }
            Err(err) => {
                warn!(chapter_number, "chapter analysis failed, degrading: {}", err);
                AnalysisData::degraded(content)
            }
        }
    }
}

/// Parse the model's JSON, tolerating a stray markdown fence; degrade when
/// it still is not a usable object.
pub fn parse_analysis(raw: &str, content: &str) -> AnalysisData {
    if let Ok(analysis) = serde_json::from_str::<AnalysisData>(raw) {
        return analysis;
    }
    let stripped = strip_fences(raw);
    match serde_json::from_str::<AnalysisData>(stripped) {
        Ok(analysis) => analysis,
        Err(err) => {
            warn!("analysis JSON unusable, degrading: {}", err);
            AnalysisData::degraded(content)
        }
    }
}

fn strip_fences(raw: &str) -> &str {
    let s = raw.trim();
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    let body = match rest.split_once('\n') {
        Some((_, body)) => body,
        None => rest,
    };
    match body.rfind("```") {
        Some(idx) => body[..idx].trim(),
        None => body.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_payload() {
        let raw = r#"{
            "metadata": {"characters": ["林凡"], "locations": ["青云宗"], "items": [], "tags": [], "tone": "紧张", "timeline_marker": "当夜"},
            "summaries": {"compressed": "压缩摘要", "one_line": "一句话", "keywords": ["突破"]},
            "character_states": {"林凡": {"location": "青云宗", "status": "闭关", "changes": ["突破炼气五层"]}},
            "foreshadowing": {"planted": [{"description": "玉佩发光", "priority": "high"}], "resolved": [], "tensions": []},
            "key_events": [{"type": "突破", "description": "林凡突破", "importance": "high"}],
            "未知字段": "应当保留"
        }"#;
        let analysis = parse_analysis(raw, "正文");
        assert_eq!(analysis.metadata.characters, vec!["林凡"]);
        assert_eq!(analysis.character_states["林凡"].status, "闭关");
        assert_eq!(analysis.foreshadowing.planted[0].priority, "high");
        assert!(analysis.raw.contains_key("未知字段"));
    }

    #[test]
    fn strips_fences_on_second_attempt() {
        let raw = "```json\n{\"summaries\": {\"one_line\": \"一句话\"}}\n```";
        let analysis = parse_analysis(raw, "正文");
        assert_eq!(analysis.summaries.one_line, "一句话");
    }

    #[test]
    fn degrades_to_one_line_summary() {
        let content = "开".to_string() + &"局".repeat(300);
        let analysis = parse_analysis("not json at all", &content);
        assert_eq!(analysis.summaries.one_line.chars().count(), 200);
        assert!(analysis.character_states.is_empty());
        assert!(analysis.foreshadowing.planted.is_empty());
    }
}

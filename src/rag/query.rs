use std::collections::HashMap;
use uuid::Uuid;

use crate::index::{ForeshadowPriority, ForeshadowRow};
use crate::model::{Blueprint, ChapterOutline};

/// The query set derived for one chapter's retrieval pass. The main query
/// is always embedded; sub-queries get their own embeddings and their hits
/// are merged with the main results.
#[derive(Debug, Clone, Default)]
pub struct RagQueries {
    pub main_query: String,
    pub character_queries: Vec<(String, String)>,
    pub foreshadow_queries: Vec<(Uuid, String)>,
    pub location_query: Option<String>,
}

impl RagQueries {
    pub fn all(&self) -> Vec<&str> {
        let mut queries = vec![self.main_query.as_str()];
        queries.extend(self.character_queries.iter().map(|(_, q)| q.as_str()));
        queries.extend(self.foreshadow_queries.iter().map(|(_, q)| q.as_str()));
        if let Some(q) = &self.location_query {
            queries.push(q.as_str());
        }
        queries
    }
}

/// Derive the retrieval queries for `current_chapter` from its outline, the
/// blueprint, and the open foreshadowing. `advisory_targets` comes from
/// `ForeshadowIndex::suggest_resolution_chapters`.
pub fn build_queries(
    outline: &ChapterOutline,
    blueprint: &Blueprint,
    writing_notes: Option<&str>,
    pending_foreshadows: &[ForeshadowRow],
    advisory_targets: &HashMap<Uuid, u32>,
    current_chapter: u32,
) -> RagQueries {
    let outline_text = format!("{} {}", outline.title, outline.summary);

    let main_query = normalize_whitespace(&format!(
        "{} {} {}",
        outline.title,
        outline.summary,
        writing_notes.unwrap_or_default()
    ));

    let character_queries = blueprint
        .characters
        .iter()
        .filter(|c| !c.name.is_empty() && outline_text.contains(&c.name))
        .map(|c| (c.name.clone(), format!("角色 {} 的行动和状态变化", c.name)))
        .collect();

    let foreshadow_queries = pending_foreshadows
        .iter()
        .filter(|row| {
            row.priority == ForeshadowPriority::High
                || advisory_targets
                    .get(&row.id)
                    .map(|&target| target <= current_chapter)
                    .unwrap_or(false)
        })
        .map(|row| (row.id, format!("伏笔: {}", row.description)))
        .collect();

    let location_query = blueprint
        .key_locations()
        .into_iter()
        .find(|location| !location.is_empty() && outline_text.contains(location.as_str()))
        .map(|location| format!("场景 {} 中发生的事件", location));

    RagQueries {
        main_query,
        character_queries,
        foreshadow_queries,
        location_query,
    }
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{ForeshadowPriority, ForeshadowStatus};
    use crate::model::Character;
    use chrono::Utc;
    use serde_json::json;

    fn sample_blueprint() -> Blueprint {
        let mut bp = Blueprint {
            characters: vec![
                Character {
                    name: "林凡".to_string(),
                    ..Default::default()
                },
                Character {
                    name: "苏瑶".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        bp.world_setting
            .insert("key_locations".to_string(), json!(["青云宗", "万兽山脉"]));
        bp
    }

    fn foreshadow(priority: ForeshadowPriority) -> ForeshadowRow {
        ForeshadowRow {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            planted_chapter: 1,
            description: "神秘玉佩".to_string(),
            original_text: String::new(),
            category: String::new(),
            priority,
            related_entities: vec![],
            status: ForeshadowStatus::Pending,
            resolved_chapter: None,
            resolution: None,
            remind_after_chapter: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn main_query_is_whitespace_normalized() {
        let outline = ChapterOutline {
            chapter_number: 2,
            title: "初入  宗门".to_string(),
            summary: "林凡 拜入青云宗，\n开始修炼。".to_string(),
        };
        let queries = build_queries(
            &outline,
            &sample_blueprint(),
            Some("多写内心戏"),
            &[],
            &HashMap::new(),
            2,
        );
        assert_eq!(queries.main_query, "初入 宗门 林凡 拜入青云宗， 开始修炼。 多写内心戏");
    }

    #[test]
    fn only_mentioned_characters_get_queries() {
        let outline = ChapterOutline {
            chapter_number: 2,
            title: "初入宗门".to_string(),
            summary: "林凡拜入青云宗。".to_string(),
        };
        let queries = build_queries(
            &outline,
            &sample_blueprint(),
            None,
            &[],
            &HashMap::new(),
            2,
        );
        assert_eq!(queries.character_queries.len(), 1);
        assert_eq!(queries.character_queries[0].1, "角色 林凡 的行动和状态变化");
        assert_eq!(
            queries.location_query.as_deref(),
            Some("场景 青云宗 中发生的事件")
        );
    }

    #[test]
    fn high_priority_and_due_foreshadows_are_queried() {
        let outline = ChapterOutline {
            chapter_number: 20,
            title: "风起".to_string(),
            summary: "山雨欲来。".to_string(),
        };
        let high = foreshadow(ForeshadowPriority::High);
        let due = foreshadow(ForeshadowPriority::Low);
        let not_due = foreshadow(ForeshadowPriority::Low);

        let mut advisory = HashMap::new();
        advisory.insert(due.id, 18u32);
        advisory.insert(not_due.id, 80u32);

        let queries = build_queries(
            &outline,
            &sample_blueprint(),
            None,
            &[high.clone(), due.clone(), not_due],
            &advisory,
            20,
        );
        let ids: Vec<Uuid> = queries.foreshadow_queries.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![high.id, due.id]);
        assert!(queries.foreshadow_queries[0].1.starts_with("伏笔: "));
    }
}

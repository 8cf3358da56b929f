//! End-to-end pipeline tests against a scripted model provider and an
//! in-memory SQLite database.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use novelforge::config::Config;
use novelforge::db::Database;
use novelforge::error::{NovelError, Result};
use novelforge::llm::{ChatProvider, ChatRequest, RawCompletion, ResolvedLlmConfig};
use novelforge::model::GenerationStatus;
use novelforge::prompts;
use novelforge::service::NovelService;
use novelforge::state::{ChapterStatus, ProjectStatus};

/// Scripted provider: answers each pipeline prompt with a plausible payload,
/// keyed off the system prompt the engine uses for that call.
struct MockProvider {
    total_chapters: u32,
    chapters_per_part: u32,
    needs_parts: bool,
    chapter_calls: AtomicUsize,
    outline_delay_ms: u64,
}

impl MockProvider {
    fn short_novel() -> Self {
        Self {
            total_chapters: 20,
            chapters_per_part: 0,
            needs_parts: false,
            chapter_calls: AtomicUsize::new(0),
            outline_delay_ms: 0,
        }
    }

    fn long_novel(outline_delay_ms: u64) -> Self {
        Self {
            total_chapters: 100,
            chapters_per_part: 25,
            needs_parts: true,
            chapter_calls: AtomicUsize::new(0),
            outline_delay_ms,
        }
    }

    fn blueprint_json(&self) -> String {
        format!(
            r#"{{
                "title": "凡人问道",
                "genre": "仙侠",
                "style": "第三人称，沉稳克制",
                "tone": "热血中带苍凉",
                "target_audience": "网文读者",
                "one_sentence_summary": "一个程序员穿越到修仙世界，以凡人之躯问道长生。",
                "full_synopsis": "林凡本是程序员，一朝穿越，落入青云宗外门。他没有灵根，只能以勤补拙。",
                "world_setting": {{"key_locations": ["青云宗", "万兽山脉"], "power_system": "炼气、筑基、金丹"}},
                "needs_part_outlines": {needs_parts},
                "total_chapters": {total},
                "chapters_per_part": {per},
                "characters": [
                    {{"name": "林凡", "identity": "穿越者", "personality": "冷静务实", "goals": "长生", "abilities": "过目不忘", "relationship_to_protagonist": "本人", "position": 1}},
                    {{"name": "苏瑶", "identity": "内门师姐", "personality": "外冷内热", "goals": "复仇", "abilities": "剑道天才", "relationship_to_protagonist": "同门", "position": 2}}
                ],
                "relationships": [
                    {{"character_from": "苏瑶", "character_to": "林凡", "description": "亦师亦友", "position": 1}}
                ]
            }}"#,
            needs_parts = self.needs_parts,
            total = self.total_chapters,
            per = self.chapters_per_part,
        )
    }

    fn part_json() -> &'static str {
        r#"{
            "title": "外门岁月",
            "summary": "林凡在外门蛰伏，结识苏瑶，初窥修行门径。",
            "theme": "蛰伏与积累",
            "key_events": ["入门考核", "灵田风波"],
            "conflicts": ["外门弟子倾轧"],
            "character_arcs": {"林凡": "从迷茫到坚定"},
            "ending_hook": "宗门大比将至，林凡的名字出现在名单末尾。"
        }"#
    }

    fn outlines_json(start: u32, end: u32) -> String {
        let items: Vec<String> = (start..=end)
            .map(|n| {
                format!(
                    r#"{{"chapter_number": {n}, "title": "第{n}章试炼", "summary": "林凡在第{n}章经历试炼，修为更进一步。"}}"#
                )
            })
            .collect();
        format!(r#"{{"outlines": [{}]}}"#, items.join(","))
    }

    fn analysis_json() -> &'static str {
        r#"{
            "metadata": {"characters": ["林凡"], "locations": ["青云宗"], "items": ["玉佩"], "tags": ["修炼"], "tone": "沉稳", "timeline_marker": "当月"},
            "summaries": {"compressed": "林凡完成试炼，修为精进，玉佩异动埋下隐患。", "one_line": "林凡完成试炼。", "keywords": ["试炼", "玉佩"]},
            "character_states": {"林凡": {"location": "青云宗", "status": "修炼中", "changes": ["修为精进"]}, "路人甲": {"location": "坊市", "status": "无", "changes": []}},
            "foreshadowing": {"planted": [{"description": "玉佩在月光下泛起微光", "original_text": "玉佩微光", "category": "物品", "priority": "high", "related_entities": ["林凡"]}], "resolved": [], "tensions": ["大比临近"]},
            "key_events": [{"type": "修炼", "description": "林凡突破", "importance": "high"}]
        }"#
    }
}

/// First "第 X 章到第 Y 章" pair in the prompt.
fn extract_range(prompt: &str) -> (u32, u32) {
    let mut numbers = Vec::new();
    let mut current = String::new();
    for c in prompt.chars() {
        if c.is_ascii_digit() {
            current.push(c);
        } else if !current.is_empty() {
            numbers.push(current.parse::<u32>().unwrap());
            current.clear();
            if numbers.len() == 2 {
                break;
            }
        }
    }
    (numbers[0], numbers[1])
}

#[async_trait]
impl ChatProvider for MockProvider {
    async fn chat(
        &self,
        _config: &ResolvedLlmConfig,
        request: &ChatRequest,
    ) -> Result<RawCompletion> {
        let user_prompt = request
            .messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or_default();

        let content = if request.system == prompts::BLUEPRINT_SYSTEM {
            self.blueprint_json()
        } else if request.system == prompts::OUTLINE_SYSTEM {
            // Part-outline prompts open with 设计第…卷; outline batches with 撰写第…章.
            if user_prompt.contains("设计第") {
                MockProvider::part_json().to_string()
            } else {
                if self.outline_delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(self.outline_delay_ms)).await;
                }
                let (start, end) = extract_range(
                    user_prompt.split("章纲").next().unwrap_or(user_prompt),
                );
                MockProvider::outlines_json(start, end)
            }
        } else if request.system == prompts::ANALYSIS_SYSTEM {
            if user_prompt.contains("结构化信息") {
                MockProvider::analysis_json().to_string()
            } else {
                "本章摘要：林凡再进一步。".to_string()
            }
        } else {
            let call = self.chapter_calls.fetch_add(1, Ordering::SeqCst) + 1;
            format!(
                r#"{{"title": "试炼", "content": "这是第{call}次生成的章节正文。林凡迎着晨光踏入演武场，心神沉入识海。"}}"#
            )
        };

        Ok(RawCompletion {
            content,
            finish_reason: Some("stop".to_string()),
        })
    }

    async fn embed(
        &self,
        _config: &ResolvedLlmConfig,
        _model: &str,
        text: &str,
    ) -> Result<Vec<f32>> {
        // Deterministic pseudo-embedding so identical text lands identically.
        let bytes = text.as_bytes();
        let mut embedding = vec![0.0f32; 8];
        for (i, b) in bytes.iter().enumerate() {
            embedding[i % 8] += *b as f32 / 255.0;
        }
        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut embedding {
                *value /= norm;
            }
        }
        Ok(embedding)
    }
}

async fn service_with(provider: MockProvider, vector_store_enabled: bool) -> NovelService {
    let db = Database::connect_in_memory().await.unwrap();
    let config = Config {
        vector_store_enabled,
        ..Config::default()
    };
    NovelService::new(db, Arc::new(provider), config)
}

#[tokio::test]
async fn short_novel_happy_path() {
    let service = service_with(MockProvider::short_novel(), true).await;
    let project = service
        .create_project("user-1", "T1", "一个程序员穿越到修仙世界")
        .await
        .unwrap();

    let blueprint = service
        .generate_blueprint(project.id, "user-1")
        .await
        .unwrap();
    assert_eq!(blueprint.total_chapters, 20);
    assert!(!blueprint.needs_part_outlines);
    let loaded = service.load_project(project.id, "user-1").await.unwrap();
    assert_eq!(loaded.status, ProjectStatus::BlueprintReady);

    let outlines = service
        .generate_chapter_outlines(project.id, "user-1", 20)
        .await
        .unwrap();
    assert_eq!(outlines.len(), 20);
    let numbers: Vec<u32> = outlines.iter().map(|o| o.chapter_number).collect();
    assert_eq!(numbers, (1..=20).collect::<Vec<u32>>());

    let chapter = service
        .generate_chapter(project.id, "user-1", 1, None, Some(3))
        .await
        .unwrap();
    assert_eq!(chapter.status, ChapterStatus::WaitingForConfirm);
    assert_eq!(chapter.versions.len(), 3);
    assert!(chapter.versions.iter().all(|v| !v.is_failed()));

    let confirmed = service
        .select_chapter_version(project.id, "user-1", 1, 1)
        .await
        .unwrap();
    assert_eq!(confirmed.status, ChapterStatus::Successful);
    // Word count equals the character count of the selected content.
    let selected = confirmed.selected_version().unwrap();
    assert_eq!(confirmed.word_count, selected.content.chars().count() as u32);

    // Exactly the confirmed chapter's summary vector exists.
    let summaries = service
        .vector_store()
        .summaries_for_chapter(project.id, 1)
        .await
        .unwrap();
    assert_eq!(summaries.len(), 1);
}

#[tokio::test]
async fn long_novel_parts_and_cancellation() {
    let service = service_with(MockProvider::long_novel(80), true).await;
    let project = service
        .create_project("user-1", "T2", "百章长篇")
        .await
        .unwrap();
    service.generate_blueprint(project.id, "user-1").await.unwrap();

    let report = service
        .generate_part_outlines(project.id, "user-1", 100, 25, None)
        .await
        .unwrap();
    assert_eq!(report.total_parts, 4);
    assert_eq!(report.completed_parts, 4);
    assert!(!report.cancelled);

    let parts = service
        .database()
        .list_part_outlines(project.id)
        .await
        .unwrap();
    let ranges: Vec<(u32, u32)> = parts.iter().map(|p| (p.start_chapter, p.end_chapter)).collect();
    assert_eq!(ranges, vec![(1, 25), (26, 50), (51, 75), (76, 100)]);
    let loaded = service.load_project(project.id, "user-1").await.unwrap();
    assert_eq!(loaded.status, ProjectStatus::PartOutlinesReady);

    let outlines = service
        .generate_part_chapters(project.id, "user-1", 1, false)
        .await
        .unwrap();
    assert_eq!(outlines.len(), 25);
    assert_eq!(outlines[0].chapter_number, 1);
    assert_eq!(outlines[24].chapter_number, 25);

    // Cancel part 2 while its first outline batch is in flight.
    let cancel_service = service.clone();
    let project_id = project.id;
    let handle = tokio::spawn(async move {
        cancel_service
            .generate_part_chapters(project_id, "user-1", 2, false)
            .await
    });
    tokio::time::sleep(Duration::from_millis(40)).await;
    service
        .cancel_part_generation(project.id, "user-1", 2)
        .await
        .unwrap();
    let result = handle.await.unwrap();
    assert!(matches!(result, Err(NovelError::Cancelled)));

    let part2 = service
        .database()
        .get_part_outline(project.id, 2)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(part2.generation_status, GenerationStatus::Cancelled);

    // Nothing beyond the last completed batch was persisted.
    let all = service
        .database()
        .list_chapter_outlines(project.id)
        .await
        .unwrap();
    let in_part2: Vec<u32> = all
        .iter()
        .map(|o| o.chapter_number)
        .filter(|n| (26..=50).contains(n))
        .collect();
    assert!(in_part2.len() <= 5, "got {:?}", in_part2);
}

#[tokio::test]
async fn retry_regenerates_only_one_version() {
    let service = service_with(MockProvider::short_novel(), true).await;
    let project = service
        .create_project("user-1", "T3", "重试单个版本")
        .await
        .unwrap();
    service.generate_blueprint(project.id, "user-1").await.unwrap();
    service
        .generate_chapter_outlines(project.id, "user-1", 20)
        .await
        .unwrap();
    let chapter = service
        .generate_chapter(project.id, "user-1", 1, None, Some(3))
        .await
        .unwrap();
    let before: Vec<String> = chapter.versions.iter().map(|v| v.content.clone()).collect();

    let after = service
        .retry_chapter_version(project.id, "user-1", 1, 1, Some("更强调内心独白"))
        .await
        .unwrap();
    assert_eq!(after.versions.len(), 3);
    assert_eq!(after.versions[0].content, before[0]);
    assert_ne!(after.versions[1].content, before[1]);
    assert_eq!(after.versions[2].content, before[2]);
}

#[tokio::test]
async fn cascade_refusal_then_confirmation() {
    let service = service_with(MockProvider::short_novel(), true).await;
    let project = service
        .create_project("user-1", "T4", "级联测试")
        .await
        .unwrap();
    service.generate_blueprint(project.id, "user-1").await.unwrap();
    service
        .generate_chapter_outlines(project.id, "user-1", 20)
        .await
        .unwrap();

    let refusal = service
        .regenerate_chapter_outline(project.id, "user-1", 5, false, None)
        .await;
    assert!(matches!(refusal, Err(NovelError::CascadeRequired { .. })));
    let outlines = service
        .database()
        .list_chapter_outlines(project.id)
        .await
        .unwrap();
    assert_eq!(outlines.len(), 20);

    service
        .regenerate_chapter_outline(project.id, "user-1", 5, true, None)
        .await
        .unwrap();
    let outlines = service
        .database()
        .list_chapter_outlines(project.id)
        .await
        .unwrap();
    assert_eq!(outlines.len(), 5);
    let numbers: Vec<u32> = outlines.iter().map(|o| o.chapter_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);

    // The last outline regenerates freely.
    service
        .regenerate_chapter_outline(project.id, "user-1", 5, false, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn disabled_vector_store_still_generates() {
    let service = service_with(MockProvider::short_novel(), false).await;
    let project = service
        .create_project("user-1", "T5", "无向量库")
        .await
        .unwrap();
    service.generate_blueprint(project.id, "user-1").await.unwrap();
    service
        .generate_chapter_outlines(project.id, "user-1", 20)
        .await
        .unwrap();

    service
        .generate_chapter(project.id, "user-1", 1, None, Some(1))
        .await
        .unwrap();
    service
        .select_chapter_version(project.id, "user-1", 1, 0)
        .await
        .unwrap();

    let chapter2 = service
        .generate_chapter(project.id, "user-1", 2, None, Some(1))
        .await
        .unwrap();
    assert_eq!(chapter2.status, ChapterStatus::WaitingForConfirm);

    // Disabled store holds nothing.
    let summaries = service
        .vector_store()
        .summaries_for_chapter(project.id, 1)
        .await
        .unwrap();
    assert!(summaries.is_empty());
}

#[tokio::test]
async fn chapter_gap_is_rejected() {
    let service = service_with(MockProvider::short_novel(), true).await;
    let project = service
        .create_project("user-1", "T6", "顺序约束")
        .await
        .unwrap();
    service.generate_blueprint(project.id, "user-1").await.unwrap();
    service
        .generate_chapter_outlines(project.id, "user-1", 20)
        .await
        .unwrap();

    let result = service
        .generate_chapter(project.id, "user-1", 3, None, Some(1))
        .await;
    assert!(matches!(result, Err(NovelError::Conflict(_))));
}

#[tokio::test]
async fn quota_limit_rejects_generation() {
    let service = service_with(MockProvider::short_novel(), true).await;
    let db = service.database().clone();
    db.set_setting("admin.daily_quota", "1").await.unwrap();
    db.increment_usage("user-1", 1).await.unwrap();

    let project = service
        .create_project("user-1", "T7", "配额")
        .await
        .unwrap();
    let result = service.generate_blueprint(project.id, "user-1").await;
    assert!(matches!(result, Err(NovelError::RateLimited { .. })));
}

#[tokio::test]
async fn on_disk_database_round_trips() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("novel.db").display());

    let project_id = {
        let service = NovelService::new(
            Database::connect(&url).await?,
            Arc::new(MockProvider::short_novel()),
            Config::default(),
        );
        let project = service.create_project("user-1", "持久化", "落盘测试").await?;
        service.generate_blueprint(project.id, "user-1").await?;
        project.id
    };

    // A fresh pool over the same file sees everything.
    let reopened = Database::connect(&url).await?;
    let blueprint = reopened.require_blueprint(project_id).await?;
    assert_eq!(blueprint.title, "凡人问道");
    Ok(())
}

#[tokio::test]
async fn foreign_project_is_forbidden() {
    let service = service_with(MockProvider::short_novel(), true).await;
    let project = service
        .create_project("user-1", "T8", "归属")
        .await
        .unwrap();
    let result = service.load_project(project.id, "user-2").await;
    assert!(matches!(result, Err(NovelError::Forbidden(_))));
}

#[tokio::test]
async fn character_index_only_keeps_blueprint_names() {
    let service = service_with(MockProvider::short_novel(), true).await;
    let project = service
        .create_project("user-1", "T9", "角色索引")
        .await
        .unwrap();
    service.generate_blueprint(project.id, "user-1").await.unwrap();
    service
        .generate_chapter_outlines(project.id, "user-1", 20)
        .await
        .unwrap();
    service
        .generate_chapter(project.id, "user-1", 1, None, Some(1))
        .await
        .unwrap();
    service
        .select_chapter_version(project.id, "user-1", 1, 0)
        .await
        .unwrap();

    // The mock analysis reports 林凡 (a blueprint character) and 路人甲
    // (unknown); only the former may be indexed.
    let index = novelforge::index::CharacterStateIndex::new(service.database().clone());
    let states = index.chapter_states(project.id, 1).await.unwrap();
    assert!(states.contains_key("林凡"));
    assert!(!states.contains_key("路人甲"));
}

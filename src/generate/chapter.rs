use futures::future::join_all;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::analysis::ChapterAnalyzer;
use crate::config::Config;
use crate::db::Database;
use crate::error::{NovelError, Result};
use crate::index::{CharacterStateIndex, ForeshadowIndex};
use crate::ingest::ChapterIngestor;
use crate::llm::{CompletionParams, Gateway, ResolvedLlmConfig};
use crate::model::{
    Chapter, ChapterEvaluation, ChapterOutline, ChapterVersion, EvaluationDecision, Project,
};
use crate::prompts;
use crate::rag::retriever::{dedup_chunks, dedup_summaries};
use crate::rag::{build_queries, compress, ContextBuilder, ContextInputs, TemporalRetriever};
use crate::state::{ensure_chapter_transition, ensure_project_transition, ChapterStatus, ProjectStatus};
use crate::vector::VectorStore;

/// How many trailing chapters contribute key events to the reference tier.
const KEY_EVENT_WINDOW: u32 = 5;
const RETRIEVE_SUMMARIES: usize = 3;
const RETRIEVE_CHUNKS: usize = 5;

/// Tokens are approximated by character count; chapter prose is CJK where
/// the two are close to one-to-one.
fn approx_tokens(s: &str) -> usize {
    s.chars().count()
}

/// Produces candidate chapter versions and runs the confirm-time pipeline
/// (analysis, continuity indices, vector ingestion) once one is selected.
#[derive(Clone)]
pub struct ChapterGenerator {
    db: Database,
    gateway: Gateway,
    store: VectorStore,
    retriever: TemporalRetriever,
    analyzer: ChapterAnalyzer,
    ingestor: ChapterIngestor,
    character_index: CharacterStateIndex,
    foreshadow_index: ForeshadowIndex,
    config: Config,
}

impl ChapterGenerator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        gateway: Gateway,
        store: VectorStore,
        retriever: TemporalRetriever,
        analyzer: ChapterAnalyzer,
        ingestor: ChapterIngestor,
        character_index: CharacterStateIndex,
        foreshadow_index: ForeshadowIndex,
        config: Config,
    ) -> Self {
        Self {
            db,
            gateway,
            store,
            retriever,
            analyzer,
            ingestor,
            character_index,
            foreshadow_index,
            config,
        }
    }

    /// Generate N candidate versions for one chapter. Context is assembled
    /// once, the versions fan out concurrently under the semaphore, and
    /// per-version failures become failed version records instead of errors.
    pub async fn generate(
        &self,
        project: &Project,
        chapter_number: u32,
        writing_notes: Option<&str>,
        version_count: Option<usize>,
    ) -> Result<Chapter> {
        let version_count = version_count.unwrap_or(self.config.version_count).max(1);
        let outline = self
            .db
            .get_chapter_outline(project.id, chapter_number)
            .await?
            .ok_or_else(|| {
                NovelError::NotFound(format!("outline of chapter {}", chapter_number))
            })?;

        self.check_predecessor(project.id, chapter_number).await?;

        let chapter = match self.db.get_chapter(project.id, chapter_number).await? {
            Some(existing) => {
                ensure_chapter_transition(existing.status, ChapterStatus::Generating, false)?;
                self.db.delete_versions_for_chapter(existing.id).await?;
                existing
            }
            None => {
                let fresh = Chapter::new(project.id, chapter_number);
                self.db.insert_chapter(&fresh).await?;
                fresh
            }
        };
        self.db
            .set_chapter_status(chapter.id, ChapterStatus::Generating)
            .await?;

        let prompt = self
            .assemble_prompt(project, &outline, writing_notes, None)
            .await?;

        // One resolution and one quota check for the whole fan-out; the
        // individual calls run unchecked and untracked, and usage is settled
        // afterwards by the number of versions that actually landed.
        let resolved = self.gateway.resolve_config(&project.user_id).await?;
        self.gateway
            .precheck_quota(&project.user_id, &resolved)
            .await?;

        let outcomes = self
            .run_fanout(&project.user_id, &resolved, &prompt, version_count)
            .await;

        let mut successes = 0i64;
        for (index, outcome) in outcomes.into_iter().enumerate() {
            let label = format!("v{}", index + 1);
            let version = match outcome {
                Ok(raw) => match parse_version_payload(&raw) {
                    Ok((_, content)) => {
                        successes += 1;
                        ChapterVersion::new(chapter.id, &label, content)
                    }
                    Err(err) => failed_version(chapter.id, &label, &err),
                },
                Err(err) => failed_version(chapter.id, &label, &err),
            };
            self.db.insert_version(&version).await?;
        }

        let status = if successes > 0 {
            ChapterStatus::WaitingForConfirm
        } else {
            ChapterStatus::Failed
        };
        self.db.set_chapter_status(chapter.id, status).await?;
        self.gateway
            .track_usage(&project.user_id, &resolved, successes)
            .await?;

        info!(
            chapter_number,
            versions = version_count,
            successes,
            "chapter candidates generated"
        );
        self.db.require_chapter(project.id, chapter_number).await
    }

    /// Confirm one candidate. Word count is the character count of the
    /// selected content; the continuity pipeline runs strictly afterwards:
    /// analysis, character index, foreshadowing, vectors.
    pub async fn select_version(
        &self,
        project: &Project,
        chapter_number: u32,
        version_index: usize,
    ) -> Result<Chapter> {
        let chapter = self.db.require_chapter(project.id, chapter_number).await?;
        let version = chapter.versions.get(version_index).ok_or_else(|| {
            NovelError::NotFound(format!(
                "version {} of chapter {}",
                version_index, chapter_number
            ))
        })?;
        if version.is_failed() {
            return Err(NovelError::Conflict(
                "cannot select a failed version".to_string(),
            ));
        }
        ensure_chapter_transition(chapter.status, ChapterStatus::Successful, false)?;

        let word_count = version.content.chars().count() as u32;
        self.db
            .set_selected_version(chapter.id, version.id, word_count, ChapterStatus::Successful)
            .await?;
        self.db
            .insert_evaluation(&ChapterEvaluation {
                id: Uuid::new_v4(),
                chapter_id: chapter.id,
                version_id: Some(version.id),
                decision: EvaluationDecision::Accept,
                feedback: String::new(),
            })
            .await?;

        self.run_confirm_pipeline(project, &chapter, &version.content, chapter_number)
            .await?;
        self.advance_project_status(project, chapter_number).await?;

        self.db.require_chapter(project.id, chapter_number).await
    }

    /// Regenerate a single candidate slot with the same context, optionally
    /// steering it with an extra instruction.
    pub async fn retry_version(
        &self,
        project: &Project,
        chapter_number: u32,
        version_index: usize,
        custom_prompt: Option<&str>,
    ) -> Result<Chapter> {
        let chapter = self.db.require_chapter(project.id, chapter_number).await?;
        let version = chapter.versions.get(version_index).ok_or_else(|| {
            NovelError::NotFound(format!(
                "version {} of chapter {}",
                version_index, chapter_number
            ))
        })?;
        let outline = self
            .db
            .get_chapter_outline(project.id, chapter_number)
            .await?
            .ok_or_else(|| {
                NovelError::NotFound(format!("outline of chapter {}", chapter_number))
            })?;

        self.db
            .insert_evaluation(&ChapterEvaluation {
                id: Uuid::new_v4(),
                chapter_id: chapter.id,
                version_id: Some(version.id),
                decision: EvaluationDecision::Retry,
                feedback: custom_prompt.unwrap_or_default().to_string(),
            })
            .await?;

        let prompt = self
            .assemble_prompt(project, &outline, None, custom_prompt)
            .await?;
        let params = CompletionParams::new(&project.user_id, prompts::CHAPTER_SYSTEM, prompt)
            .json()
            .temperature(0.75)
            .timeout_secs(self.config.chapter_timeout_secs);

        match self.gateway.complete(params).await {
            Ok(raw) => match parse_version_payload(&raw) {
                Ok((_, content)) => {
                    self.db
                        .replace_version_content(version.id, &content, &Map::new())
                        .await?;
                }
                Err(err) => {
                    self.record_retry_failure(version.id, &err).await?;
                }
            },
            Err(err) => {
                self.record_retry_failure(version.id, &err).await?;
            }
        }

        self.db.require_chapter(project.id, chapter_number).await
    }

    async fn record_retry_failure(&self, version_id: Uuid, err: &NovelError) -> Result<()> {
        warn!("version retry failed: {}", err);
        let mut metadata = Map::new();
        metadata.insert("error".to_string(), Value::String(err.to_string()));
        self.db
            .replace_version_content(version_id, &format!("生成失败: {}", err), &metadata)
            .await
    }

    /// Chapter N requires chapter N-1 to exist and be fully ingested.
    async fn check_predecessor(&self, project_id: Uuid, chapter_number: u32) -> Result<()> {
        if chapter_number <= 1 {
            return Ok(());
        }
        let previous = self
            .db
            .get_chapter(project_id, chapter_number - 1)
            .await?
            .ok_or_else(|| {
                NovelError::Conflict(format!(
                    "chapter {} cannot start before chapter {} exists",
                    chapter_number,
                    chapter_number - 1
                ))
            })?;
        if previous.status != ChapterStatus::Successful {
            return Err(NovelError::Conflict(format!(
                "chapter {} is not confirmed yet",
                chapter_number - 1
            )));
        }
        Ok(())
    }

    /// Assemble and compress the full generation context, then wrap it in
    /// the chapter prompt. Shared by generate and retry so a retried slot
    /// sees the same snapshot its siblings saw.
    async fn assemble_prompt(
        &self,
        project: &Project,
        outline: &ChapterOutline,
        writing_notes: Option<&str>,
        custom_prompt: Option<&str>,
    ) -> Result<String> {
        let blueprint = self.db.require_blueprint(project.id).await?;
        let chapter_number = outline.chapter_number;

        let previous = if chapter_number > 1 {
            self.db.get_chapter(project.id, chapter_number - 1).await?
        } else {
            None
        };
        let previous_content = previous
            .as_ref()
            .and_then(|c| c.selected_version())
            .map(|v| v.content.clone());
        let previous_summary = previous.as_ref().and_then(|c| c.real_summary.clone());
        let previous_states: Option<BTreeMap<_, _>> = previous
            .as_ref()
            .and_then(|c| c.analysis_data.as_ref())
            .map(|a| a.character_states.clone());

        let chapters = self.db.list_chapters(project.id).await?;
        let prior_summaries: Vec<(u32, String)> = chapters
            .iter()
            .filter(|c| c.chapter_number < chapter_number)
            .filter_map(|c| c.real_summary.clone().map(|s| (c.chapter_number, s)))
            .collect();
        let recent_key_events: Vec<(u32, Vec<crate::model::KeyEvent>)> = chapters
            .iter()
            .filter(|c| {
                c.chapter_number < chapter_number
                    && c.chapter_number + KEY_EVENT_WINDOW >= chapter_number
            })
            .filter_map(|c| {
                c.analysis_data
                    .as_ref()
                    .map(|a| (c.chapter_number, a.key_events.clone()))
            })
            .collect();

        let pending = self
            .foreshadow_index
            .pending(project.id, chapter_number, true)
            .await?;
        let advisory = self
            .foreshadow_index
            .suggest_resolution_chapters(project.id, blueprint.total_chapters.max(1))
            .await?;

        let queries = build_queries(
            outline,
            &blueprint,
            writing_notes,
            &pending,
            &advisory,
            chapter_number,
        );

        // Retrieval: every query is embedded and merged, best score wins
        // per slot. With the store disabled this whole block is skipped.
        let mut retrieved_chunks = Vec::new();
        let mut retrieved_summaries = Vec::new();
        if self.store.is_enabled() {
            let total = blueprint.total_chapters.max(1);
            for query in queries.all() {
                let embedding = self
                    .gateway
                    .embed(query, &project.user_id, None)
                    .await?;
                retrieved_chunks.extend(
                    self.retriever
                        .retrieve_chunks(
                            &self.store,
                            project.id,
                            &embedding,
                            chapter_number,
                            total,
                            RETRIEVE_CHUNKS,
                        )
                        .await?,
                );
                retrieved_summaries.extend(
                    self.retriever
                        .retrieve_summaries(
                            &self.store,
                            project.id,
                            &embedding,
                            chapter_number,
                            total,
                            RETRIEVE_SUMMARIES,
                        )
                        .await?,
                );
            }
        }
        let retrieved_chunks = dedup_chunks(retrieved_chunks);
        let retrieved_summaries = dedup_summaries(retrieved_summaries);

        let context = ContextBuilder::build(&ContextInputs {
            blueprint: &blueprint,
            outline,
            writing_notes,
            previous_content: previous_content.as_deref(),
            previous_summary: previous_summary.as_deref(),
            previous_states: previous_states.as_ref(),
            pending_foreshadows: &pending,
            retrieved_summaries: &retrieved_summaries,
            retrieved_chunks: &retrieved_chunks,
            recent_key_events: &recent_key_events,
            prior_summaries: &prior_summaries,
        });
        let context_block = compress(&context, self.config.context_max_tokens, approx_tokens);

        Ok(prompts::build_chapter_prompt(
            &context_block,
            outline,
            writing_notes,
            custom_prompt,
        ))
    }

    /// Issue the candidate calls. A single version goes out directly; a
    /// batch fans out concurrently, bounded by the semaphore.
    async fn run_fanout(
        &self,
        user_id: &str,
        resolved: &ResolvedLlmConfig,
        prompt: &str,
        version_count: usize,
    ) -> Vec<Result<String>> {
        let params_for = |cached: Option<ResolvedLlmConfig>| {
            let mut params = CompletionParams::new(user_id, prompts::CHAPTER_SYSTEM, prompt)
                .json()
                .temperature(0.75)
                .timeout_secs(self.config.chapter_timeout_secs);
            params.skip_quota_check = true;
            params.skip_usage_tracking = true;
            params.cached_config = cached;
            params
        };

        if version_count == 1 {
            return vec![self.gateway.complete(params_for(Some(resolved.clone()))).await];
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_llm.max(1)));
        let tasks = (0..version_count).map(|_| {
            let gateway = self.gateway.clone();
            let semaphore = Arc::clone(&semaphore);
            let params = params_for(Some(resolved.clone()));
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| NovelError::Cancelled)?;
                gateway.complete(params).await
            }
        });
        join_all(tasks).await
    }

    /// The post-selection continuity pipeline, in its fixed order.
    async fn run_confirm_pipeline(
        &self,
        project: &Project,
        chapter: &Chapter,
        content: &str,
        chapter_number: u32,
    ) -> Result<()> {
        let blueprint = self.db.require_blueprint(project.id).await?;
        let outline = self
            .db
            .get_chapter_outline(project.id, chapter_number)
            .await?
            .unwrap_or_default();

        let analysis = self
            .analyzer
            .analyze(
                &project.user_id,
                content,
                &outline.title,
                chapter_number,
                &blueprint.title,
            )
            .await;
        self.db.set_chapter_analysis(chapter.id, &analysis).await?;

        let summary = if !analysis.summaries.compressed.is_empty() {
            analysis.summaries.compressed.clone()
        } else {
            analysis.summaries.one_line.clone()
        };
        if !summary.is_empty() {
            self.db.set_chapter_summary(chapter.id, &summary).await?;
        }

        // Only characters the blueprint knows may enter the index.
        let known_states: BTreeMap<_, _> = analysis
            .character_states
            .iter()
            .filter(|(name, _)| blueprint.character(name).is_some())
            .map(|(name, state)| (name.clone(), state.clone()))
            .collect();
        self.character_index
            .update(project.id, chapter_number, &known_states)
            .await?;

        self.foreshadow_index
            .ingest(project.id, chapter_number, &analysis.foreshadowing)
            .await?;

        self.ingestor
            .ingest_chapter(
                project.id,
                chapter_number,
                &outline.title,
                content,
                Some(&summary),
                &project.user_id,
            )
            .await?;

        Ok(())
    }

    async fn advance_project_status(&self, project: &Project, chapter_number: u32) -> Result<()> {
        let blueprint = self.db.require_blueprint(project.id).await?;
        let target = if blueprint.total_chapters > 0 && chapter_number >= blueprint.total_chapters {
            ProjectStatus::Completed
        } else {
            ProjectStatus::Writing
        };
        if project.status != target {
            ensure_project_transition(project.status, target, false)?;
            self.db.update_project_status(project.id, target).await?;
        }
        Ok(())
    }
}

fn failed_version(chapter_id: Uuid, label: &str, err: &NovelError) -> ChapterVersion {
    let mut version = ChapterVersion::new(chapter_id, label, format!("生成失败: {}", err));
    version
        .provider_metadata
        .insert("error".to_string(), Value::String(err.to_string()));
    version
}

/// Accept `{"title","content"}`, the `chapter_content` spelling, or a bare
/// JSON string; anything else is a parse failure. Empty content is rejected.
fn parse_version_payload(raw: &str) -> Result<(Option<String>, String)> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| NovelError::Parse(format!("version payload: {}", e)))?;

    let (title, content) = match &value {
        Value::Object(obj) => {
            let title = obj
                .get("title")
                .and_then(Value::as_str)
                .map(|s| s.to_string());
            let content = obj
                .get("content")
                .or_else(|| obj.get("chapter_content"))
                .and_then(Value::as_str)
                .map(|s| s.to_string())
                .ok_or_else(|| {
                    NovelError::Parse("version payload has no content field".to_string())
                })?;
            (title, content)
        }
        Value::String(s) => (None, s.clone()),
        _ => {
            return Err(NovelError::Parse(
                "version payload is neither object nor string".to_string(),
            ))
        }
    };

    if content.trim().is_empty() {
        return Err(NovelError::Parse("version content is empty".to_string()));
    }
    Ok((title, content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_object_with_content() {
        let (title, content) =
            parse_version_payload(r#"{"title": "初入宗门", "content": "林凡推开山门。"}"#).unwrap();
        assert_eq!(title.as_deref(), Some("初入宗门"));
        assert_eq!(content, "林凡推开山门。");
    }

    #[test]
    fn payload_alternate_key_and_bare_string() {
        let (_, content) =
            parse_version_payload(r#"{"chapter_content": "正文在此。"}"#).unwrap();
        assert_eq!(content, "正文在此。");

        let (_, content) = parse_version_payload(r#""裸字符串正文""#).unwrap();
        assert_eq!(content, "裸字符串正文");
    }

    #[test]
    fn payload_rejects_empty_and_garbage() {
        assert!(parse_version_payload(r#"{"content": "  "}"#).is_err());
        assert!(parse_version_payload("不是 JSON").is_err());
        assert!(parse_version_payload("[1, 2]").is_err());
    }
}

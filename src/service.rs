use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::analysis::ChapterAnalyzer;
use crate::config::Config;
use crate::db::Database;
use crate::error::{NovelError, Result};
use crate::generate::parts::ProgressReport;
use crate::generate::{BlueprintGenerator, ChapterGenerator, OutlineGenerator, PartOutlineGenerator};
use crate::index::{CharacterStateIndex, ForeshadowIndex};
use crate::ingest::ChapterIngestor;
use crate::llm::{ChatProvider, CompletionParams, Gateway};
use crate::model::{Blueprint, Chapter, ChapterOutline, Project};
use crate::prompts;
use crate::rag::TemporalRetriever;
use crate::splitter::TextSplitter;
use crate::vector::VectorStore;

/// Library facade consumed by the HTTP layer. One instance per process;
/// everything inside is cheaply cloneable and shares the SQLite pool.
#[derive(Clone)]
pub struct NovelService {
    db: Database,
    gateway: Gateway,
    store: VectorStore,
    ingestor: ChapterIngestor,
    blueprints: BlueprintGenerator,
    parts: PartOutlineGenerator,
    outlines: OutlineGenerator,
    chapters: ChapterGenerator,
    config: Config,
}

impl NovelService {
    pub fn new(db: Database, provider: Arc<dyn ChatProvider>, config: Config) -> Self {
        let gateway = Gateway::new(db.clone(), provider, config.clone());
        let store = VectorStore::new(db.clone(), config.vector_store_enabled);
        let splitter = TextSplitter::new(config.chunk_size, config.chunk_overlap);
        let analyzer = ChapterAnalyzer::new(gateway.clone(), config.summary_timeout_secs);
        let ingestor = ChapterIngestor::new(gateway.clone(), store.clone(), splitter);
        let character_index = CharacterStateIndex::new(db.clone());
        let foreshadow_index = ForeshadowIndex::new(db.clone());

        let blueprints = BlueprintGenerator::new(
            db.clone(),
            gateway.clone(),
            store.clone(),
            character_index.clone(),
            foreshadow_index.clone(),
            config.clone(),
        );
        let parts = PartOutlineGenerator::new(
            db.clone(),
            gateway.clone(),
            store.clone(),
            character_index.clone(),
            foreshadow_index.clone(),
            config.clone(),
        );
        let outlines = OutlineGenerator::new(db.clone(), parts.clone(), config.clone());
        let chapters = ChapterGenerator::new(
            db.clone(),
            gateway.clone(),
            store.clone(),
            TemporalRetriever::default(),
            analyzer,
            ingestor.clone(),
            character_index,
            foreshadow_index,
            config.clone(),
        );

        Self {
            db,
            gateway,
            store,
            ingestor,
            blueprints,
            parts,
            outlines,
            chapters,
            config,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn vector_store(&self) -> &VectorStore {
        &self.store
    }

    pub async fn create_project(
        &self,
        user_id: &str,
        title: &str,
        initial_prompt: &str,
    ) -> Result<Project> {
        let project = Project::new(user_id, title, initial_prompt);
        self.db.create_project(&project).await?;
        info!(%project.id, title, "project created");
        Ok(project)
    }

    /// Load with ownership check and stale-generation cleanup.
    pub async fn load_project(&self, project_id: Uuid, user_id: &str) -> Result<Project> {
        let project = self.db.require_project(project_id, user_id).await?;
        self.outlines.cleanup_stale_generations(&project).await?;
        Ok(project)
    }

    pub async fn delete_project(&self, project_id: Uuid, user_id: &str) -> Result<()> {
        self.db.require_project(project_id, user_id).await?;
        self.db.delete_project(project_id).await
    }

    pub async fn generate_blueprint(&self, project_id: Uuid, user_id: &str) -> Result<Blueprint> {
        let project = self.load_project(project_id, user_id).await?;
        self.blueprints.generate(&project, &[]).await
    }

    pub async fn refine_blueprint(
        &self,
        project_id: Uuid,
        user_id: &str,
        instruction: &str,
    ) -> Result<Blueprint> {
        let project = self.load_project(project_id, user_id).await?;
        self.blueprints.refine(&project, instruction).await
    }

    pub async fn generate_part_outlines(
        &self,
        project_id: Uuid,
        user_id: &str,
        total_chapters: u32,
        chapters_per_part: u32,
        optimization_prompt: Option<&str>,
    ) -> Result<ProgressReport> {
        let project = self.load_project(project_id, user_id).await?;
        self.parts
            .generate_all(&project, total_chapters, chapters_per_part, optimization_prompt)
            .await
    }

    pub async fn regenerate_part_outline(
        &self,
        project_id: Uuid,
        user_id: &str,
        part_number: u32,
        cascade_delete: bool,
        optimization_prompt: Option<&str>,
    ) -> Result<ProgressReport> {
        let project = self.load_project(project_id, user_id).await?;
        self.parts
            .regenerate_part(&project, part_number, cascade_delete, optimization_prompt)
            .await
    }

    pub async fn generate_part_chapters(
        &self,
        project_id: Uuid,
        user_id: &str,
        part_number: u32,
        regenerate: bool,
    ) -> Result<Vec<ChapterOutline>> {
        let project = self.load_project(project_id, user_id).await?;
        self.parts
            .generate_part_chapters(&project, part_number, regenerate)
            .await
    }

    /// Flip a running part generation to `cancelling`; the pipeline turns
    /// it into `cancelled` at its next checkpoint.
    pub async fn cancel_part_generation(
        &self,
        project_id: Uuid,
        user_id: &str,
        part_number: u32,
    ) -> Result<()> {
        self.db.require_project(project_id, user_id).await?;
        self.parts.request_cancel(project_id, part_number).await
    }

    pub async fn generate_chapter_outlines(
        &self,
        project_id: Uuid,
        user_id: &str,
        count: u32,
    ) -> Result<Vec<ChapterOutline>> {
        let project = self.load_project(project_id, user_id).await?;
        self.outlines.generate_chapter_outlines(&project, count).await
    }

    pub async fn regenerate_chapter_outline(
        &self,
        project_id: Uuid,
        user_id: &str,
        chapter_number: u32,
        cascade_delete: bool,
        custom_prompt: Option<&str>,
    ) -> Result<ChapterOutline> {
        let project = self.load_project(project_id, user_id).await?;
        self.outlines
            .regenerate_chapter_outline(&project, chapter_number, cascade_delete, custom_prompt)
            .await
    }

    pub async fn delete_chapter_outlines(
        &self,
        project_id: Uuid,
        user_id: &str,
        count_from_end: u32,
    ) -> Result<()> {
        let project = self.load_project(project_id, user_id).await?;
        self.outlines
            .delete_chapter_outlines(&project, count_from_end)
            .await
    }

    pub async fn generate_chapter(
        &self,
        project_id: Uuid,
        user_id: &str,
        chapter_number: u32,
        writing_notes: Option<&str>,
        version_count: Option<usize>,
    ) -> Result<Chapter> {
        let project = self.load_project(project_id, user_id).await?;
        self.chapters
            .generate(&project, chapter_number, writing_notes, version_count)
            .await
    }

    pub async fn select_chapter_version(
        &self,
        project_id: Uuid,
        user_id: &str,
        chapter_number: u32,
        version_index: usize,
    ) -> Result<Chapter> {
        let project = self.load_project(project_id, user_id).await?;
        self.chapters
            .select_version(&project, chapter_number, version_index)
            .await
    }

    pub async fn retry_chapter_version(
        &self,
        project_id: Uuid,
        user_id: &str,
        chapter_number: u32,
        version_index: usize,
        custom_prompt: Option<&str>,
    ) -> Result<Chapter> {
        let project = self.load_project(project_id, user_id).await?;
        self.chapters
            .retry_version(&project, chapter_number, version_index, custom_prompt)
            .await
    }

    /// Manual edit of a confirmed chapter: the selected version's content is
    /// replaced, word count refreshed, and the chapter re-ingested into the
    /// vector store.
    pub async fn update_chapter_content(
        &self,
        project_id: Uuid,
        user_id: &str,
        chapter_number: u32,
        new_content: &str,
    ) -> Result<Chapter> {
        let project = self.load_project(project_id, user_id).await?;
        let chapter = self.db.require_chapter(project_id, chapter_number).await?;
        let version = chapter.selected_version().ok_or_else(|| {
            NovelError::Conflict(format!(
                "chapter {} has no selected version to edit",
                chapter_number
            ))
        })?;

        self.db
            .replace_version_content(version.id, new_content, &version.provider_metadata)
            .await?;
        self.db
            .set_selected_version(
                chapter.id,
                version.id,
                new_content.chars().count() as u32,
                chapter.status,
            )
            .await?;

        let outline = self
            .db
            .get_chapter_outline(project_id, chapter_number)
            .await?
            .unwrap_or_default();
        self.ingestor
            .ingest_chapter(
                project_id,
                chapter_number,
                &outline.title,
                new_content,
                chapter.real_summary.as_deref(),
                &project.user_id,
            )
            .await?;

        self.db.require_chapter(project_id, chapter_number).await
    }

    /// Backfill summaries for confirmed chapters that are missing one.
    /// Summary calls run in parallel under the shared semaphore bound, each
    /// task on its own pooled connection; usage settles afterwards.
    pub async fn resummarize_range(
        &self,
        project_id: Uuid,
        user_id: &str,
        from_chapter: u32,
        to_chapter: u32,
    ) -> Result<usize> {
        let project = self.load_project(project_id, user_id).await?;
        let blueprint = self.db.require_blueprint(project_id).await?;

        let chapters = self.db.list_chapters(project_id).await?;
        let mut work = Vec::new();
        for chapter in chapters {
            if chapter.chapter_number < from_chapter || chapter.chapter_number > to_chapter {
                continue;
            }
            if chapter.real_summary.as_deref().is_some_and(|s| !s.is_empty()) {
                continue;
            }
            let Some(full) = self.db.get_chapter(project_id, chapter.chapter_number).await? else {
                continue;
            };
            let Some(version) = full.selected_version().cloned() else {
                continue;
            };
            work.push((full, version));
        }
        if work.is_empty() {
            return Ok(0);
        }

        let resolved = self.gateway.resolve_config(user_id).await?;
        self.gateway.precheck_quota(user_id, &resolved).await?;

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_llm.max(1)));
        let summary_timeout = self.config.summary_timeout_secs;
        let tasks = work.iter().map(|(chapter, version)| {
            let gateway = self.gateway.clone();
            let db = self.db.clone();
            let semaphore = Arc::clone(&semaphore);
            let resolved = resolved.clone();
            let user_id = project.user_id.clone();
            let title = blueprint.title.clone();
            let chapter_id = chapter.id;
            let chapter_number = chapter.chapter_number;
            let content = version.content.clone();
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| NovelError::Cancelled)?;
                let prompt = prompts::build_summary_prompt(&content, &title, chapter_number);
                let mut params = CompletionParams::new(&user_id, prompts::ANALYSIS_SYSTEM, prompt)
                    .temperature(0.3)
                    .timeout_secs(summary_timeout);
                params.skip_quota_check = true;
                params.skip_usage_tracking = true;
                params.cached_config = Some(resolved);
                let summary = gateway.complete(params).await?;
                db.set_chapter_summary(chapter_id, &summary).await?;
                Ok::<u32, NovelError>(chapter_number)
            }
        });

        let results = join_all(tasks).await;
        let mut succeeded = 0i64;
        for result in results {
            match result {
                Ok(chapter_number) => {
                    succeeded += 1;
                    // Refresh the summary vector for the backfilled chapter.
                    if let Some(chapter) =
                        self.db.get_chapter(project_id, chapter_number).await?
                    {
                        if let (Some(version), Some(summary)) =
                            (chapter.selected_version(), chapter.real_summary.as_deref())
                        {
                            let outline = self
                                .db
                                .get_chapter_outline(project_id, chapter_number)
                                .await?
                                .unwrap_or_default();
                            self.ingestor
                                .ingest_chapter(
                                    project_id,
                                    chapter_number,
                                    &outline.title,
                                    &version.content,
                                    Some(summary),
                                    user_id,
                                )
                                .await?;
                        }
                    }
                }
                Err(err) => warn!("summary backfill task failed: {}", err),
            }
        }
        self.gateway.track_usage(user_id, &resolved, succeeded).await?;
        Ok(succeeded as usize)
    }
}

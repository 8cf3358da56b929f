use tracing::info;

use crate::config::Config;
use crate::db::Database;
use crate::error::{NovelError, Result};
use crate::model::{ChapterOutline, Project};
use crate::prompts::OutlineBatchContext;
use crate::state::{ensure_project_transition, ProjectStatus};

use super::parts::PartOutlineGenerator;

/// Batch-serial chapter outline generation for the flat (no parts) path,
/// plus single-outline regeneration with the cascade rules.
#[derive(Clone)]
pub struct OutlineGenerator {
    db: Database,
    parts: PartOutlineGenerator,
    config: Config,
}

impl OutlineGenerator {
    pub fn new(db: Database, parts: PartOutlineGenerator, config: Config) -> Self {
        Self { db, parts, config }
    }

    /// Extend the chapter outlines by up to `count`, in batches, each batch
    /// seeing everything generated before it. Outlines persist per batch,
    /// so a mid-run failure keeps its completed prefix.
    pub async fn generate_chapter_outlines(
        &self,
        project: &Project,
        count: u32,
    ) -> Result<Vec<ChapterOutline>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let blueprint = self.db.require_blueprint(project.id).await?;
        let parts = self.db.list_part_outlines(project.id).await?;

        let existing = self.db.max_chapter_outline_number(project.id).await?;
        let target = if blueprint.total_chapters > 0 {
            (existing + count).min(blueprint.total_chapters)
        } else {
            existing + count
        };
        if target <= existing {
            return Ok(Vec::new());
        }

        let batch = self.config.outline_batch_size.max(1) as u32;
        let mut produced = Vec::new();
        let mut next = existing + 1;

        while next <= target {
            let batch_end = (next + batch - 1).min(target);
            let previous_outlines = self.db.list_chapter_outlines(project.id).await?;

            let current_part = parts
                .iter()
                .find(|p| next >= p.start_chapter && next <= p.end_chapter);
            let previous_hook = current_part.and_then(|p| {
                parts
                    .iter()
                    .find(|q| q.part_number + 1 == p.part_number)
                    .map(|q| q.ending_hook.clone())
            });
            let next_summary = current_part.and_then(|p| {
                parts
                    .iter()
                    .find(|q| q.part_number == p.part_number + 1)
                    .map(|q| q.summary.clone())
            });
            let context = OutlineBatchContext {
                current_part,
                previous_ending_hook: previous_hook.as_deref(),
                next_part_summary: next_summary.as_deref(),
            };

            let outlines = self
                .parts
                .generate_outline_batch(
                    project,
                    &blueprint,
                    &previous_outlines,
                    &context,
                    next,
                    batch_end,
                    None,
                )
                .await?;
            for outline in &outlines {
                self.db.upsert_chapter_outline(project.id, outline).await?;
            }
            produced.extend(outlines);
            next = batch_end + 1;
        }

        if project.status == ProjectStatus::BlueprintReady
            || project.status == ProjectStatus::PartOutlinesReady
        {
            ensure_project_transition(project.status, ProjectStatus::ChapterOutlinesReady, false)?;
            self.db
                .update_project_status(project.id, ProjectStatus::ChapterOutlinesReady)
                .await?;
        }

        info!(count = produced.len(), "chapter outlines generated");
        Ok(produced)
    }

    /// Replace one chapter outline. The last outline regenerates freely;
    /// any earlier one requires the caller to confirm the cascade, which
    /// deletes every outline and chapter after it.
    pub async fn regenerate_chapter_outline(
        &self,
        project: &Project,
        chapter_number: u32,
        cascade_delete: bool,
        custom_prompt: Option<&str>,
    ) -> Result<ChapterOutline> {
        let blueprint = self.db.require_blueprint(project.id).await?;
        let max = self.db.max_chapter_outline_number(project.id).await?;
        if chapter_number == 0 || chapter_number > max {
            return Err(NovelError::NotFound(format!(
                "outline of chapter {}",
                chapter_number
            )));
        }

        if chapter_number < max {
            if !cascade_delete {
                return Err(NovelError::CascadeRequired {
                    artifact: format!("chapter outline {}", chapter_number),
                    would_delete: format!(
                        "chapter outlines {}..{} and their chapters",
                        chapter_number + 1,
                        max
                    ),
                });
            }
            self.parts
                .cascade_from_chapter(project.id, chapter_number + 1)
                .await?;
        }

        let parts = self.db.list_part_outlines(project.id).await?;
        let previous_outlines: Vec<ChapterOutline> = self
            .db
            .list_chapter_outlines(project.id)
            .await?
            .into_iter()
            .filter(|o| o.chapter_number < chapter_number)
            .collect();
        let current_part = parts
            .iter()
            .find(|p| chapter_number >= p.start_chapter && chapter_number <= p.end_chapter);
        let context = OutlineBatchContext {
            current_part,
            previous_ending_hook: None,
            next_part_summary: None,
        };

        let mut outlines = self
            .parts
            .generate_outline_batch(
                project,
                &blueprint,
                &previous_outlines,
                &context,
                chapter_number,
                chapter_number,
                custom_prompt,
            )
            .await?;
        let outline = outlines
            .pop()
            .ok_or_else(|| NovelError::Parse("empty outline batch".to_string()))?;
        self.db.upsert_chapter_outline(project.id, &outline).await?;
        Ok(outline)
    }

    /// Drop the trailing `count_from_end` outlines and everything that
    /// depended on them.
    pub async fn delete_chapter_outlines(&self, project: &Project, count_from_end: u32) -> Result<()> {
        if count_from_end == 0 {
            return Ok(());
        }
        let max = self.db.max_chapter_outline_number(project.id).await?;
        if max == 0 {
            return Ok(());
        }
        let from = max.saturating_sub(count_from_end) + 1;
        self.parts.cascade_from_chapter(project.id, from).await?;
        Ok(())
    }

    /// Stale-state cleanup on project load.
    pub async fn cleanup_stale_generations(&self, project: &Project) -> Result<u64> {
        let fixed = self
            .db
            .fail_stale_part_generations(project.id, self.config.stale_generation_minutes)
            .await?;
        if fixed > 0 {
            info!(fixed, "stale part generations failed on load");
        }
        Ok(fixed)
    }
}

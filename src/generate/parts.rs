use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::Database;
use crate::error::{NovelError, Result};
use crate::index::{CharacterStateIndex, ForeshadowIndex};
use crate::llm::{CompletionParams, Gateway};
use crate::model::{Blueprint, ChapterOutline, GenerationStatus, PartOutline, Project};
use crate::prompts::{self, OutlineBatchContext};
use crate::state::{ensure_project_transition, ProjectStatus};
use crate::vector::VectorStore;

/// Outcome of a serial part-outline run.
#[derive(Debug, Clone)]
pub struct ProgressReport {
    pub total_parts: u32,
    pub completed_parts: u32,
    pub cancelled: bool,
}

/// Serial generator for part outlines and per-part chapter outlines. Every
/// part is persisted the moment it arrives, so a failed or cancelled run
/// resumes where it stopped. Cancellation is cooperative: an external call
/// flips the row to `cancelling` and the loop converts it to `cancelled`
/// at the next checkpoint.
#[derive(Clone)]
pub struct PartOutlineGenerator {
    db: Database,
    gateway: Gateway,
    store: VectorStore,
    character_index: CharacterStateIndex,
    foreshadow_index: ForeshadowIndex,
    config: Config,
}

impl PartOutlineGenerator {
    pub fn new(
        db: Database,
        gateway: Gateway,
        store: VectorStore,
        character_index: CharacterStateIndex,
        foreshadow_index: ForeshadowIndex,
        config: Config,
    ) -> Self {
        Self {
            db,
            gateway,
            store,
            character_index,
            foreshadow_index,
            config,
        }
    }

    /// The ranges parts tile: part k covers ((k-1)·per + 1)..=min(k·per, total).
    pub fn part_ranges(total_chapters: u32, chapters_per_part: u32) -> Vec<(u32, u32)> {
        let per = chapters_per_part.max(1);
        let count = total_chapters.div_ceil(per);
        (1..=count)
            .map(|k| ((k - 1) * per + 1, (k * per).min(total_chapters)))
            .collect()
    }

    pub async fn generate_all(
        &self,
        project: &Project,
        total_chapters: u32,
        chapters_per_part: u32,
        optimization_prompt: Option<&str>,
    ) -> Result<ProgressReport> {
        let mut blueprint = self.db.require_blueprint(project.id).await?;
        if total_chapters > 0 {
            blueprint.total_chapters = total_chapters;
        }
        if chapters_per_part > 0 {
            blueprint.chapters_per_part = chapters_per_part;
        }
        blueprint.needs_part_outlines = true;
        self.db.upsert_blueprint(project.id, &blueprint).await?;

        let ranges = Self::part_ranges(blueprint.total_chapters, blueprint.chapters_per_part);
        let total_parts = ranges.len() as u32;
        let mut completed = 0u32;

        for (index, &(start, end)) in ranges.iter().enumerate() {
            let part_number = index as u32 + 1;

            if let Some(existing) = self.db.get_part_outline(project.id, part_number).await? {
                if existing.generation_status == GenerationStatus::Completed {
                    completed += 1;
                    continue;
                }
            }

            match self
                .generate_one(project, &blueprint, part_number, start, end, optimization_prompt)
                .await
            {
                Ok(()) => completed += 1,
                Err(NovelError::Cancelled) => {
                    self.db
                        .set_part_generation_status(
                            project.id,
                            part_number,
                            GenerationStatus::Cancelled,
                            0,
                        )
                        .await?;
                    info!(part_number, "part outline generation cancelled");
                    return Ok(ProgressReport {
                        total_parts,
                        completed_parts: completed,
                        cancelled: true,
                    });
                }
                Err(err) => {
                    self.db
                        .set_part_generation_status(
                            project.id,
                            part_number,
                            GenerationStatus::Failed,
                            0,
                        )
                        .await?;
                    return Err(err);
                }
            }
        }

        ensure_project_transition(project.status, ProjectStatus::PartOutlinesReady, false)?;
        self.db
            .update_project_status(project.id, ProjectStatus::PartOutlinesReady)
            .await?;

        Ok(ProgressReport {
            total_parts,
            completed_parts: completed,
            cancelled: false,
        })
    }

    async fn generate_one(
        &self,
        project: &Project,
        blueprint: &Blueprint,
        part_number: u32,
        start_chapter: u32,
        end_chapter: u32,
        optimization_prompt: Option<&str>,
    ) -> Result<()> {
        // Placeholder row so the part is observable (and cancellable) from
        // the moment work starts.
        let placeholder = PartOutline {
            part_number,
            title: String::new(),
            summary: String::new(),
            start_chapter,
            end_chapter,
            theme: String::new(),
            key_events: Vec::new(),
            conflicts: Vec::new(),
            character_arcs: BTreeMap::new(),
            ending_hook: String::new(),
            generation_status: GenerationStatus::Generating,
            progress: 0,
            updated_at: chrono::Utc::now(),
        };
        self.db.upsert_part_outline(project.id, &placeholder).await?;

        self.checkpoint(project.id, part_number).await?;
        let previous = self.db.list_part_outlines(project.id).await?;
        let previous: Vec<PartOutline> = previous
            .into_iter()
            .filter(|p| {
                p.part_number < part_number
                    && p.generation_status == GenerationStatus::Completed
            })
            .collect();
        let prompt = prompts::build_part_outline_prompt(
            blueprint,
            &previous,
            part_number,
            start_chapter,
            end_chapter,
            optimization_prompt,
        );

        self.checkpoint(project.id, part_number).await?;
        self.db.set_part_progress(project.id, part_number, 30).await?;
        let params = CompletionParams::new(&project.user_id, prompts::OUTLINE_SYSTEM, prompt)
            .json()
            .temperature(0.7)
            .timeout_secs(self.config.chat_timeout_secs);
        let raw = self.gateway.complete(params).await?;

        self.checkpoint(project.id, part_number).await?;
        let payload: PartPayload = serde_json::from_str(&raw)
            .map_err(|e| NovelError::Parse(format!("part outline payload: {}", e)))?;

        let part = PartOutline {
            part_number,
            title: payload.title,
            summary: payload.summary,
            start_chapter,
            end_chapter,
            theme: payload.theme,
            key_events: payload.key_events,
            conflicts: payload.conflicts,
            character_arcs: payload.character_arcs,
            ending_hook: payload.ending_hook,
            generation_status: GenerationStatus::Completed,
            progress: 100,
            updated_at: chrono::Utc::now(),
        };
        self.db.upsert_part_outline(project.id, &part).await?;
        info!(part_number, start_chapter, end_chapter, "part outline persisted");
        Ok(())
    }

    /// Cancellation checkpoint: a row flipped to `cancelling` raises
    /// `Cancelled`, which the caller converts to the terminal state.
    async fn checkpoint(&self, project_id: Uuid, part_number: u32) -> Result<()> {
        let status = self
            .db
            .get_part_generation_status(project_id, part_number)
            .await?;
        if status == Some(GenerationStatus::Cancelling) {
            return Err(NovelError::Cancelled);
        }
        Ok(())
    }

    /// Request cancellation of a running part generation. The pipeline
    /// observes the flag at its next checkpoint; an in-flight model call is
    /// not aborted, its result is discarded.
    pub async fn request_cancel(&self, project_id: Uuid, part_number: u32) -> Result<()> {
        let Some(status) = self
            .db
            .get_part_generation_status(project_id, part_number)
            .await?
        else {
            return Err(NovelError::NotFound(format!("part {}", part_number)));
        };
        if status == GenerationStatus::Generating || status == GenerationStatus::Pending {
            self.db
                .set_part_generation_status(project_id, part_number, GenerationStatus::Cancelling, 0)
                .await?;
        }
        Ok(())
    }

    /// Chapter outlines for one part, generated batch-serially. The part
    /// row carries progress and honors cancellation exactly like the
    /// outline pass.
    pub async fn generate_part_chapters(
        &self,
        project: &Project,
        part_number: u32,
        regenerate: bool,
    ) -> Result<Vec<ChapterOutline>> {
        let blueprint = self.db.require_blueprint(project.id).await?;
        let parts = self.db.list_part_outlines(project.id).await?;
        let part = parts
            .iter()
            .find(|p| p.part_number == part_number)
            .ok_or_else(|| NovelError::NotFound(format!("part {}", part_number)))?
            .clone();

        if regenerate {
            self.cascade_from_chapter(project.id, part.start_chapter).await?;
        } else {
            let existing = self.db.max_chapter_outline_number(project.id).await?;
            if existing >= part.end_chapter {
                return self.collect_part_outlines(project.id, &part).await;
            }
        }

        let previous_hook = parts
            .iter()
            .find(|p| p.part_number + 1 == part_number)
            .map(|p| p.ending_hook.clone());
        let next_summary = parts
            .iter()
            .find(|p| p.part_number == part_number + 1)
            .map(|p| p.summary.clone());

        self.db
            .set_part_generation_status(project.id, part_number, GenerationStatus::Generating, 0)
            .await?;

        let batch = self.config.outline_batch_size.max(1) as u32;
        let mut next = self
            .db
            .max_chapter_outline_number(project.id)
            .await?
            .max(part.start_chapter - 1)
            + 1;

        while next <= part.end_chapter {
            let batch_end = (next + batch - 1).min(part.end_chapter);

            if let Err(err) = self.checkpoint(project.id, part_number).await {
                if matches!(err, NovelError::Cancelled) {
                    self.db
                        .set_part_generation_status(
                            project.id,
                            part_number,
                            GenerationStatus::Cancelled,
                            progress_of(&part, next),
                        )
                        .await?;
                }
                return Err(err);
            }

            let previous_outlines = self.db.list_chapter_outlines(project.id).await?;
            let context = OutlineBatchContext {
                current_part: Some(&part),
                previous_ending_hook: previous_hook.as_deref(),
                next_part_summary: next_summary.as_deref(),
            };
            let outlines = self
                .generate_outline_batch(
                    project,
                    &blueprint,
                    &previous_outlines,
                    &context,
                    next,
                    batch_end,
                    None,
                )
                .await;

            let outlines = match outlines {
                Ok(outlines) => outlines,
                Err(err) => {
                    let status = if matches!(err, NovelError::Cancelled) {
                        GenerationStatus::Cancelled
                    } else {
                        GenerationStatus::Failed
                    };
                    self.db
                        .set_part_generation_status(
                            project.id,
                            part_number,
                            status,
                            progress_of(&part, next),
                        )
                        .await?;
                    return Err(err);
                }
            };

            for outline in &outlines {
                self.db.upsert_chapter_outline(project.id, outline).await?;
            }
            next = batch_end + 1;
            self.db
                .set_part_progress(project.id, part_number, progress_of(&part, next))
                .await?;
        }

        self.db
            .set_part_generation_status(project.id, part_number, GenerationStatus::Completed, 100)
            .await?;
        if project.status != ProjectStatus::ChapterOutlinesReady {
            ensure_project_transition(project.status, ProjectStatus::ChapterOutlinesReady, false)?;
            self.db
                .update_project_status(project.id, ProjectStatus::ChapterOutlinesReady)
                .await?;
        }

        self.collect_part_outlines(project.id, &part).await
    }

    pub(crate) async fn generate_outline_batch(
        &self,
        project: &Project,
        blueprint: &Blueprint,
        previous_outlines: &[ChapterOutline],
        context: &OutlineBatchContext<'_>,
        start: u32,
        end: u32,
        extra_instruction: Option<&str>,
    ) -> Result<Vec<ChapterOutline>> {
        let mut prompt = prompts::build_chapter_outline_batch_prompt(
            blueprint,
            previous_outlines,
            context,
            start,
            end,
        );
        if let Some(extra) = extra_instruction.filter(|e| !e.is_empty()) {
            prompt.push_str(&format!("\n额外要求: {}", extra));
        }
        let params = CompletionParams::new(&project.user_id, prompts::OUTLINE_SYSTEM, prompt)
            .json()
            .temperature(0.7)
            .timeout_secs(self.config.chat_timeout_secs);
        let raw = self.gateway.complete(params).await?;

        let payload: OutlineBatchPayload = serde_json::from_str(&raw)
            .map_err(|e| NovelError::Parse(format!("chapter outline payload: {}", e)))?;

        let expected = (end - start + 1) as usize;
        if payload.outlines.len() != expected {
            warn!(
                got = payload.outlines.len(),
                expected, "outline batch size mismatch, renumbering sequentially"
            );
        }

        // Chapter numbers are assigned positionally; models drift.
        Ok(payload
            .outlines
            .into_iter()
            .take(expected)
            .enumerate()
            .map(|(offset, o)| ChapterOutline {
                chapter_number: start + offset as u32,
                title: o.title,
                summary: o.summary,
            })
            .collect())
    }

    /// Cascade used by part regeneration: drop outlines, chapters, indices
    /// and vectors from `start_chapter` on.
    pub(crate) async fn cascade_from_chapter(
        &self,
        project_id: Uuid,
        start_chapter: u32,
    ) -> Result<()> {
        self.db
            .delete_chapter_outlines_from(project_id, start_chapter)
            .await?;
        self.db.delete_chapters_from(project_id, start_chapter).await?;
        self.character_index
            .delete_chapters_from(project_id, start_chapter)
            .await?;
        self.foreshadow_index
            .delete_chapters_from(project_id, start_chapter)
            .await?;
        self.store.delete_chapters_from(project_id, start_chapter).await?;
        Ok(())
    }

    /// Regenerate part `part_number` and everything after it. Requires the
    /// caller to have confirmed the cascade unless it is the last part.
    pub async fn regenerate_part(
        &self,
        project: &Project,
        part_number: u32,
        cascade_delete: bool,
        optimization_prompt: Option<&str>,
    ) -> Result<ProgressReport> {
        let blueprint = self.db.require_blueprint(project.id).await?;
        let parts = self.db.list_part_outlines(project.id).await?;
        let part = parts
            .iter()
            .find(|p| p.part_number == part_number)
            .ok_or_else(|| NovelError::NotFound(format!("part {}", part_number)))?;
        let is_last = parts.iter().all(|p| p.part_number <= part_number);

        if !is_last && !cascade_delete {
            return Err(NovelError::CascadeRequired {
                artifact: format!("part {}", part_number),
                would_delete: format!(
                    "parts {}.. and chapters {}..",
                    part_number, part.start_chapter
                ),
            });
        }

        let start_chapter = part.start_chapter;
        self.db
            .delete_part_outlines_from(project.id, part_number)
            .await?;
        self.cascade_from_chapter(project.id, start_chapter).await?;

        self.generate_all(
            project,
            blueprint.total_chapters,
            blueprint.chapters_per_part,
            optimization_prompt,
        )
        .await
    }

    async fn collect_part_outlines(
        &self,
        project_id: Uuid,
        part: &PartOutline,
    ) -> Result<Vec<ChapterOutline>> {
        let all = self.db.list_chapter_outlines(project_id).await?;
        Ok(all
            .into_iter()
            .filter(|o| o.chapter_number >= part.start_chapter && o.chapter_number <= part.end_chapter)
            .collect())
    }
}

fn progress_of(part: &PartOutline, next_chapter: u32) -> u8 {
    let span = (part.end_chapter - part.start_chapter + 1).max(1);
    let done = next_chapter.saturating_sub(part.start_chapter);
    ((done * 100 / span).min(100)) as u8
}

#[derive(Debug, Deserialize)]
struct PartPayload {
    #[serde(default)]
    title: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    theme: String,
    #[serde(default)]
    key_events: Vec<String>,
    #[serde(default)]
    conflicts: Vec<String>,
    #[serde(default)]
    character_arcs: BTreeMap<String, String>,
    #[serde(default)]
    ending_hook: String,
}

#[derive(Debug, Deserialize)]
struct OutlineBatchPayload {
    #[serde(default)]
    outlines: Vec<OutlinePayload>,
}

#[derive(Debug, Deserialize)]
struct OutlinePayload {
    #[serde(default)]
    #[allow(dead_code)]
    chapter_number: u32,
    #[serde(default)]
    title: String,
    #[serde(default)]
    summary: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_ranges_tile_without_gaps() {
        let ranges = PartOutlineGenerator::part_ranges(100, 25);
        assert_eq!(ranges, vec![(1, 25), (26, 50), (51, 75), (76, 100)]);

        let ranges = PartOutlineGenerator::part_ranges(103, 25);
        assert_eq!(ranges.len(), 5);
        assert_eq!(ranges[4], (101, 103));

        // The concatenated ranges cover 1..=total exactly.
        let mut expected = 1u32;
        for (start, end) in ranges {
            assert_eq!(start, expected);
            expected = end + 1;
        }
        assert_eq!(expected, 104);
    }

    #[test]
    fn progress_tracks_batches() {
        let part = PartOutline {
            part_number: 1,
            title: String::new(),
            summary: String::new(),
            start_chapter: 26,
            end_chapter: 50,
            theme: String::new(),
            key_events: vec![],
            conflicts: vec![],
            character_arcs: BTreeMap::new(),
            ending_hook: String::new(),
            generation_status: GenerationStatus::Generating,
            progress: 0,
            updated_at: chrono::Utc::now(),
        };
        assert_eq!(progress_of(&part, 26), 0);
        assert_eq!(progress_of(&part, 31), 20);
        assert_eq!(progress_of(&part, 51), 100);
    }
}

use tracing::info;

use crate::config::Config;
use crate::db::Database;
use crate::error::{NovelError, Result};
use crate::index::{CharacterStateIndex, ForeshadowIndex};
use crate::llm::{CompletionParams, Gateway};
use crate::model::{Blueprint, Project};
use crate::prompts;
use crate::state::{ensure_project_transition, ProjectStatus};
use crate::vector::VectorStore;

/// Creates and refines the top-level novel blueprint. Regeneration replaces
/// the blueprint and cascades away every downstream artifact; refinement
/// replaces in place and keeps them.
#[derive(Clone)]
pub struct BlueprintGenerator {
    db: Database,
    gateway: Gateway,
    store: VectorStore,
    character_index: CharacterStateIndex,
    foreshadow_index: ForeshadowIndex,
    config: Config,
}

impl BlueprintGenerator {
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

    pub async fn generate(&self, project: &Project, history: &[String]) -> Result<Blueprint> {
        ensure_project_transition(project.status, ProjectStatus::BlueprintReady, false)?;

        let prompt = prompts::build_blueprint_prompt(&project.initial_prompt, history);
        let params = CompletionParams::new(&project.user_id, prompts::BLUEPRINT_SYSTEM, prompt)
            .json()
            .temperature(0.8)
            .timeout_secs(self.config.chat_timeout_secs);
        let raw = self.gateway.complete(params).await?;
        let blueprint = parse_blueprint(&raw, self.config.part_outline_threshold)?;

        // A fresh blueprint invalidates everything downstream.
        self.clear_dependents(project).await?;
        self.db.upsert_blueprint(project.id, &blueprint).await?;
        self.db
            .update_project_status(project.id, ProjectStatus::BlueprintReady)
            .await?;

        info!(
            %project.id,
            total_chapters = blueprint.total_chapters,
            needs_parts = blueprint.needs_part_outlines,
            "blueprint generated"
        );
        Ok(blueprint)
    }

    /// One refinement round: the model receives the current blueprint plus
    /// the instruction and returns the full structure again. No cascade.
    pub async fn refine(&self, project: &Project, instruction: &str) -> Result<Blueprint> {
        let current = self.db.require_blueprint(project.id).await?;

        let prompt = prompts::build_blueprint_refine_prompt(&current, instruction);
        let params = CompletionParams::new(&project.user_id, prompts::BLUEPRINT_SYSTEM, prompt)
            .json()
            .temperature(0.6)
            .timeout_secs(self.config.chat_timeout_secs);
        let raw = self.gateway.complete(params).await?;
        let blueprint = parse_blueprint(&raw, self.config.part_outline_threshold)?;

        self.db.upsert_blueprint(project.id, &blueprint).await?;
        Ok(blueprint)
    }

    async fn clear_dependents(&self, project: &Project) -> Result<()> {
        self.db.delete_part_outlines_from(project.id, 1).await?;
        self.db.delete_chapter_outlines_from(project.id, 1).await?;
        self.db.delete_chapters_from(project.id, 1).await?;
        self.character_index
            .delete_chapters_from(project.id, 1)
            .await?;
        self.foreshadow_index
            .delete_chapters_from(project.id, 1)
            .await?;
        self.store.delete_chapters_from(project.id, 1).await?;
        Ok(())
    }
}

fn parse_blueprint(raw: &str, part_threshold: u32) -> Result<Blueprint> {
    let mut blueprint: Blueprint = serde_json::from_str(raw)
        .map_err(|e| NovelError::Parse(format!("blueprint payload: {}", e)))?;

    if blueprint.title.trim().is_empty() {
        return Err(NovelError::Parse("blueprint has no title".to_string()));
    }
    if blueprint.total_chapters == 0 {
        blueprint.total_chapters = 20;
    }
    // Long novels always get part outlines, whatever the model decided.
    if blueprint.total_chapters >= part_threshold {
        blueprint.needs_part_outlines = true;
    }
    if blueprint.needs_part_outlines && blueprint.chapters_per_part == 0 {
        blueprint.chapters_per_part = 25;
    }
    Ok(blueprint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_part_outline_flags() {
        let raw = r#"{"title": "凡人问道", "total_chapters": 120, "needs_part_outlines": false}"#;
        let blueprint = parse_blueprint(raw, 30).unwrap();
        assert!(blueprint.needs_part_outlines);
        assert_eq!(blueprint.chapters_per_part, 25);
    }

    #[test]
    fn short_novel_keeps_flat_outline() {
        let raw = r#"{"title": "短篇", "total_chapters": 20}"#;
        let blueprint = parse_blueprint(raw, 30).unwrap();
        assert!(!blueprint.needs_part_outlines);
    }

    #[test]
    fn missing_title_is_rejected() {
        assert!(parse_blueprint(r#"{"total_chapters": 10}"#, 30).is_err());
    }
}

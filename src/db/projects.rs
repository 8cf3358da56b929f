use sqlx::Row;
use uuid::Uuid;

use crate::db::{parse_timestamp, Database};
use crate::error::{NovelError, Result};
use crate::model::{Blueprint, Project};
use crate::state::ProjectStatus;

impl Database {
    pub async fn create_project(&self, project: &Project) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO projects (id, user_id, title, initial_prompt, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(project.id.to_string())
        .bind(&project.user_id)
        .bind(&project.title)
        .bind(&project.initial_prompt)
        .bind(project.status.as_str())
        .bind(project.created_at.to_rfc3339())
        .bind(project.updated_at.to_rfc3339())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn get_project(&self, project_id: Uuid) -> Result<Option<Project>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, title, initial_prompt, status, created_at, updated_at
            FROM projects WHERE id = ?
            "#,
        )
        .bind(project_id.to_string())
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(r) => {
                let id: String = r.get("id");
                let status: String = r.get("status");
                let created_at: String = r.get("created_at");
                let updated_at: String = r.get("updated_at");
                Ok(Some(Project {
                    id: Uuid::parse_str(&id)
                        .map_err(|e| NovelError::Conflict(format!("bad project id: {}", e)))?,
                    user_id: r.get("user_id"),
                    title: r.get("title"),
                    initial_prompt: r.get("initial_prompt"),
                    status: ProjectStatus::parse(&status),
                    created_at: parse_timestamp(&created_at),
                    updated_at: parse_timestamp(&updated_at),
                }))
            }
            None => Ok(None),
        }
    }

    /// Load a project and enforce ownership.
    pub async fn require_project(&self, project_id: Uuid, user_id: &str) -> Result<Project> {
        let project = self
            .get_project(project_id)
            .await?
            .ok_or_else(|| NovelError::NotFound(format!("project {}", project_id)))?;
        if project.user_id != user_id {
            return Err(NovelError::Forbidden(format!(
                "project {} belongs to another user",
                project_id
            )));
        }
        Ok(project)
    }

    pub async fn update_project_status(
        &self,
        project_id: Uuid,
        status: ProjectStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE projects SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(chrono::Utc::now().to_rfc3339())
            .bind(project_id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Remove a project and everything it owns, vector records included.
    pub async fn delete_project(&self, project_id: Uuid) -> Result<()> {
        let pid = project_id.to_string();

        sqlx::query(
            "DELETE FROM chapter_versions WHERE chapter_id IN (SELECT id FROM chapters WHERE project_id = ?)",
        )
        .bind(&pid)
        .execute(self.pool())
        .await?;
        sqlx::query(
            "DELETE FROM chapter_evaluations WHERE chapter_id IN (SELECT id FROM chapters WHERE project_id = ?)",
        )
        .bind(&pid)
        .execute(self.pool())
        .await?;

        for table in [
            "chapters",
            "chapter_outlines",
            "part_outlines",
            "character_state_index",
            "foreshadowing_index",
            "vector_chunks",
            "vector_summaries",
            "blueprints",
        ] {
            sqlx::query(&format!("DELETE FROM {} WHERE project_id = ?", table))
                .bind(&pid)
                .execute(self.pool())
                .await?;
        }

        sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(&pid)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    pub async fn upsert_blueprint(&self, project_id: Uuid, blueprint: &Blueprint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO blueprints (
                project_id, title, genre, style, tone, target_audience,
                one_sentence_summary, full_synopsis, world_setting,
                needs_part_outlines, total_chapters, chapters_per_part,
                characters, relationships
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(project_id.to_string())
        .bind(&blueprint.title)
        .bind(&blueprint.genre)
        .bind(&blueprint.style)
        .bind(&blueprint.tone)
        .bind(&blueprint.target_audience)
        .bind(&blueprint.one_sentence_summary)
        .bind(&blueprint.full_synopsis)
        .bind(serde_json::to_string(&blueprint.world_setting)?)
        .bind(blueprint.needs_part_outlines as i64)
        .bind(blueprint.total_chapters as i64)
        .bind(blueprint.chapters_per_part as i64)
        .bind(serde_json::to_string(&blueprint.characters)?)
        .bind(serde_json::to_string(&blueprint.relationships)?)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn get_blueprint(&self, project_id: Uuid) -> Result<Option<Blueprint>> {
        let row = sqlx::query(
            r#"
            SELECT title, genre, style, tone, target_audience, one_sentence_summary,
                   full_synopsis, world_setting, needs_part_outlines, total_chapters,
                   chapters_per_part, characters, relationships
            FROM blueprints WHERE project_id = ?
            "#,
        )
        .bind(project_id.to_string())
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(r) => {
                let world_setting: String = r.get("world_setting");
                let characters: String = r.get("characters");
                let relationships: String = r.get("relationships");
                Ok(Some(Blueprint {
                    title: r.get("title"),
                    genre: r.get("genre"),
                    style: r.get("style"),
                    tone: r.get("tone"),
                    target_audience: r.get("target_audience"),
                    one_sentence_summary: r.get("one_sentence_summary"),
                    full_synopsis: r.get("full_synopsis"),
                    world_setting: serde_json::from_str(&world_setting).unwrap_or_default(),
                    needs_part_outlines: r.get::<i64, _>("needs_part_outlines") != 0,
                    total_chapters: r.get::<i64, _>("total_chapters") as u32,
                    chapters_per_part: r.get::<i64, _>("chapters_per_part") as u32,
                    characters: serde_json::from_str(&characters).unwrap_or_default(),
                    relationships: serde_json::from_str(&relationships).unwrap_or_default(),
                }))
            }
            None => Ok(None),
        }
    }

    pub async fn require_blueprint(&self, project_id: Uuid) -> Result<Blueprint> {
        self.get_blueprint(project_id)
            .await?
            .ok_or_else(|| NovelError::NotFound(format!("blueprint of project {}", project_id)))
    }
}

use sqlx::Row;
use uuid::Uuid;

use crate::db::{parse_timestamp, Database};
use crate::error::{NovelError, Result};
use crate::model::{AnalysisData, Chapter, ChapterEvaluation, ChapterVersion};
use crate::state::ChapterStatus;

impl Database {
    pub async fn insert_chapter(&self, chapter: &Chapter) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chapters (id, project_id, chapter_number, status, selected_version_id,
                                  word_count, real_summary, analysis_data)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(chapter.id.to_string())
        .bind(chapter.project_id.to_string())
        .bind(chapter.chapter_number as i64)
        .bind(chapter.status.as_str())
        .bind(chapter.selected_version_id.map(|id| id.to_string()))
        .bind(chapter.word_count as i64)
        .bind(&chapter.real_summary)
        .bind(match &chapter.analysis_data {
            Some(a) => Some(serde_json::to_string(a)?),
            None => None,
        })
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_chapter(
        &self,
        project_id: Uuid,
        chapter_number: u32,
    ) -> Result<Option<Chapter>> {
        let row = sqlx::query(
            "SELECT * FROM chapters WHERE project_id = ? AND chapter_number = ?",
        )
        .bind(project_id.to_string())
        .bind(chapter_number as i64)
        .fetch_optional(self.pool())
        .await?;

        let Some(r) = row else { return Ok(None) };
        let mut chapter = chapter_from_row(&r)?;
        chapter.versions = self.list_versions(chapter.id).await?;
        Ok(Some(chapter))
    }

    pub async fn require_chapter(
        &self,
        project_id: Uuid,
        chapter_number: u32,
    ) -> Result<Chapter> {
        self.get_chapter(project_id, chapter_number)
            .await?
            .ok_or_else(|| NovelError::NotFound(format!("chapter {}", chapter_number)))
    }

    pub async fn list_chapters(&self, project_id: Uuid) -> Result<Vec<Chapter>> {
        let rows = sqlx::query(
            "SELECT * FROM chapters WHERE project_id = ? ORDER BY chapter_number ASC",
        )
        .bind(project_id.to_string())
        .fetch_all(self.pool())
        .await?;

        let mut chapters = Vec::with_capacity(rows.len());
        for r in &rows {
            chapters.push(chapter_from_row(r)?);
        }
        Ok(chapters)
    }

    pub async fn set_chapter_status(&self, chapter_id: Uuid, status: ChapterStatus) -> Result<()> {
        sqlx::query("UPDATE chapters SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(chapter_id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_selected_version(
        &self,
        chapter_id: Uuid,
        version_id: Uuid,
        word_count: u32,
        status: ChapterStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE chapters SET selected_version_id = ?, word_count = ?, status = ? WHERE id = ?",
        )
        .bind(version_id.to_string())
        .bind(word_count as i64)
        .bind(status.as_str())
        .bind(chapter_id.to_string())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_chapter_summary(&self, chapter_id: Uuid, summary: &str) -> Result<()> {
        sqlx::query("UPDATE chapters SET real_summary = ? WHERE id = ?")
            .bind(summary)
            .bind(chapter_id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_chapter_analysis(
        &self,
        chapter_id: Uuid,
        analysis: &AnalysisData,
    ) -> Result<()> {
        sqlx::query("UPDATE chapters SET analysis_data = ? WHERE id = ?")
            .bind(serde_json::to_string(analysis)?)
            .bind(chapter_id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn insert_version(&self, version: &ChapterVersion) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chapter_versions (id, chapter_id, version_label, content, provider_metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(version.id.to_string())
        .bind(version.chapter_id.to_string())
        .bind(&version.version_label)
        .bind(&version.content)
        .bind(serde_json::to_string(&version.provider_metadata)?)
        .bind(version.created_at.to_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Swap a version's content in place, keeping its id and slot. Used by
    /// single-version retry.
    pub async fn replace_version_content(
        &self,
        version_id: Uuid,
        content: &str,
        provider_metadata: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE chapter_versions SET content = ?, provider_metadata = ?, created_at = ? WHERE id = ?",
        )
        .bind(content)
        .bind(serde_json::to_string(provider_metadata)?)
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(version_id.to_string())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn list_versions(&self, chapter_id: Uuid) -> Result<Vec<ChapterVersion>> {
        let rows = sqlx::query(
            "SELECT * FROM chapter_versions WHERE chapter_id = ? ORDER BY version_label ASC, created_at ASC",
        )
        .bind(chapter_id.to_string())
        .fetch_all(self.pool())
        .await?;

        let mut versions = Vec::with_capacity(rows.len());
        for r in &rows {
            let id: String = r.get("id");
            let chapter_id: String = r.get("chapter_id");
            let metadata: String = r.get("provider_metadata");
            let created_at: String = r.get("created_at");
            versions.push(ChapterVersion {
                id: Uuid::parse_str(&id)
                    .map_err(|e| NovelError::Conflict(format!("bad version id: {}", e)))?,
                chapter_id: Uuid::parse_str(&chapter_id)
                    .map_err(|e| NovelError::Conflict(format!("bad chapter id: {}", e)))?,
                version_label: r.get("version_label"),
                content: r.get("content"),
                provider_metadata: serde_json::from_str(&metadata).unwrap_or_default(),
                created_at: parse_timestamp(&created_at),
            });
        }
        Ok(versions)
    }

    /// Drop a chapter's candidate versions, for a full regeneration.
    pub async fn delete_versions_for_chapter(&self, chapter_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM chapter_versions WHERE chapter_id = ?")
            .bind(chapter_id.to_string())
            .execute(self.pool())
            .await?;
        sqlx::query(
            "UPDATE chapters SET selected_version_id = NULL, word_count = 0 WHERE id = ?",
        )
        .bind(chapter_id.to_string())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn insert_evaluation(&self, evaluation: &ChapterEvaluation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chapter_evaluations (id, chapter_id, version_id, decision, feedback)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(evaluation.id.to_string())
        .bind(evaluation.chapter_id.to_string())
        .bind(evaluation.version_id.map(|id| id.to_string()))
        .bind(evaluation.decision.as_str())
        .bind(&evaluation.feedback)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Delete chapters with chapter_number >= `from`, along with their
    /// versions and evaluations. Index/vector rows are the caller's cascade.
    pub async fn delete_chapters_from(&self, project_id: Uuid, from: u32) -> Result<Vec<u32>> {
        let pid = project_id.to_string();
        let rows = sqlx::query(
            "SELECT id, chapter_number FROM chapters WHERE project_id = ? AND chapter_number >= ?",
        )
        .bind(&pid)
        .bind(from as i64)
        .fetch_all(self.pool())
        .await?;

        let mut deleted = Vec::with_capacity(rows.len());
        for r in &rows {
            let id: String = r.get("id");
            deleted.push(r.get::<i64, _>("chapter_number") as u32);
            sqlx::query("DELETE FROM chapter_versions WHERE chapter_id = ?")
                .bind(&id)
                .execute(self.pool())
                .await?;
            sqlx::query("DELETE FROM chapter_evaluations WHERE chapter_id = ?")
                .bind(&id)
                .execute(self.pool())
                .await?;
        }

        sqlx::query("DELETE FROM chapters WHERE project_id = ? AND chapter_number >= ?")
            .bind(&pid)
            .bind(from as i64)
            .execute(self.pool())
            .await?;

        Ok(deleted)
    }
}

fn chapter_from_row(r: &sqlx::sqlite::SqliteRow) -> Result<Chapter> {
    let id: String = r.get("id");
    let project_id: String = r.get("project_id");
    let status: String = r.get("status");
    let selected: Option<String> = r.get("selected_version_id");
    let analysis: Option<String> = r.get("analysis_data");
    Ok(Chapter {
        id: Uuid::parse_str(&id)
            .map_err(|e| NovelError::Conflict(format!("bad chapter id: {}", e)))?,
        project_id: Uuid::parse_str(&project_id)
            .map_err(|e| NovelError::Conflict(format!("bad project id: {}", e)))?,
        chapter_number: r.get::<i64, _>("chapter_number") as u32,
        status: ChapterStatus::parse(&status),
        selected_version_id: selected.and_then(|s| Uuid::parse_str(&s).ok()),
        word_count: r.get::<i64, _>("word_count") as u32,
        real_summary: r.get("real_summary"),
        analysis_data: analysis.and_then(|a| serde_json::from_str(&a).ok()),
        versions: Vec::new(),
    })
}

use chrono::{Duration, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::db::{parse_timestamp, Database};
use crate::error::Result;
use crate::model::{ChapterOutline, GenerationStatus, PartOutline};

impl Database {
    pub async fn upsert_part_outline(&self, project_id: Uuid, part: &PartOutline) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO part_outlines (
                project_id, part_number, title, summary, start_chapter, end_chapter,
                theme, key_events, conflicts, character_arcs, ending_hook,
                generation_status, progress, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(project_id.to_string())
        .bind(part.part_number as i64)
        .bind(&part.title)
        .bind(&part.summary)
        .bind(part.start_chapter as i64)
        .bind(part.end_chapter as i64)
        .bind(&part.theme)
        .bind(serde_json::to_string(&part.key_events)?)
        .bind(serde_json::to_string(&part.conflicts)?)
        .bind(serde_json::to_string(&part.character_arcs)?)
        .bind(&part.ending_hook)
        .bind(part.generation_status.as_str())
        .bind(part.progress as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn get_part_outline(
        &self,
        project_id: Uuid,
        part_number: u32,
    ) -> Result<Option<PartOutline>> {
        let row = sqlx::query(
            "SELECT * FROM part_outlines WHERE project_id = ? AND part_number = ?",
        )
        .bind(project_id.to_string())
        .bind(part_number as i64)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(|r| part_from_row(&r)))
    }

    pub async fn list_part_outlines(&self, project_id: Uuid) -> Result<Vec<PartOutline>> {
        let rows = sqlx::query(
            "SELECT * FROM part_outlines WHERE project_id = ? ORDER BY part_number ASC",
        )
        .bind(project_id.to_string())
        .fetch_all(self.pool())
        .await?;

        Ok(rows.iter().map(part_from_row).collect())
    }

    pub async fn set_part_generation_status(
        &self,
        project_id: Uuid,
        part_number: u32,
        status: GenerationStatus,
        progress: u8,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE part_outlines
            SET generation_status = ?, progress = ?, updated_at = ?
            WHERE project_id = ? AND part_number = ?
            "#,
        )
        .bind(status.as_str())
        .bind(progress as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(project_id.to_string())
        .bind(part_number as i64)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Progress-only update. Deliberately conditional on the row still being
    /// in `generating`, so a concurrent `cancelling` flag is never clobbered.
    pub async fn set_part_progress(
        &self,
        project_id: Uuid,
        part_number: u32,
        progress: u8,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE part_outlines
            SET progress = ?, updated_at = ?
            WHERE project_id = ? AND part_number = ? AND generation_status = 'generating'
            "#,
        )
        .bind(progress as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(project_id.to_string())
        .bind(part_number as i64)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_part_generation_status(
        &self,
        project_id: Uuid,
        part_number: u32,
    ) -> Result<Option<GenerationStatus>> {
        let row = sqlx::query(
            "SELECT generation_status FROM part_outlines WHERE project_id = ? AND part_number = ?",
        )
        .bind(project_id.to_string())
        .bind(part_number as i64)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(|r| GenerationStatus::parse(r.get("generation_status"))))
    }

    pub async fn delete_part_outlines_from(
        &self,
        project_id: Uuid,
        part_number: u32,
    ) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM part_outlines WHERE project_id = ? AND part_number >= ?",
        )
        .bind(project_id.to_string())
        .bind(part_number as i64)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Any part stuck in `generating` past the deadline is assumed dead and
    /// forced to `failed`. Runs on project load.
    pub async fn fail_stale_part_generations(
        &self,
        project_id: Uuid,
        older_than_minutes: i64,
    ) -> Result<u64> {
        let cutoff = (Utc::now() - Duration::minutes(older_than_minutes)).to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE part_outlines
            SET generation_status = 'failed', updated_at = ?
            WHERE project_id = ? AND generation_status = 'generating' AND updated_at < ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(project_id.to_string())
        .bind(cutoff)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn upsert_chapter_outline(
        &self,
        project_id: Uuid,
        outline: &ChapterOutline,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO chapter_outlines (project_id, chapter_number, title, summary)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(project_id.to_string())
        .bind(outline.chapter_number as i64)
        .bind(&outline.title)
        .bind(&outline.summary)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_chapter_outline(
        &self,
        project_id: Uuid,
        chapter_number: u32,
    ) -> Result<Option<ChapterOutline>> {
        let row = sqlx::query(
            "SELECT chapter_number, title, summary FROM chapter_outlines WHERE project_id = ? AND chapter_number = ?",
        )
        .bind(project_id.to_string())
        .bind(chapter_number as i64)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(|r| ChapterOutline {
            chapter_number: r.get::<i64, _>("chapter_number") as u32,
            title: r.get("title"),
            summary: r.get("summary"),
        }))
    }

    pub async fn list_chapter_outlines(&self, project_id: Uuid) -> Result<Vec<ChapterOutline>> {
        let rows = sqlx::query(
            "SELECT chapter_number, title, summary FROM chapter_outlines WHERE project_id = ? ORDER BY chapter_number ASC",
        )
        .bind(project_id.to_string())
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|r| ChapterOutline {
                chapter_number: r.get::<i64, _>("chapter_number") as u32,
                title: r.get("title"),
                summary: r.get("summary"),
            })
            .collect())
    }

    pub async fn max_chapter_outline_number(&self, project_id: Uuid) -> Result<u32> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(chapter_number) FROM chapter_outlines WHERE project_id = ?",
        )
        .bind(project_id.to_string())
        .fetch_one(self.pool())
        .await?;
        Ok(max.unwrap_or(0) as u32)
    }

    /// Delete outlines with chapter_number >= `from` (cascade support).
    pub async fn delete_chapter_outlines_from(
        &self,
        project_id: Uuid,
        from: u32,
    ) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM chapter_outlines WHERE project_id = ? AND chapter_number >= ?",
        )
        .bind(project_id.to_string())
        .bind(from as i64)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}

fn part_from_row(r: &sqlx::sqlite::SqliteRow) -> PartOutline {
    let key_events: String = r.get("key_events");
    let conflicts: String = r.get("conflicts");
    let character_arcs: String = r.get("character_arcs");
    let status: String = r.get("generation_status");
    let updated_at: String = r.get("updated_at");
    PartOutline {
        part_number: r.get::<i64, _>("part_number") as u32,
        title: r.get("title"),
        summary: r.get("summary"),
        start_chapter: r.get::<i64, _>("start_chapter") as u32,
        end_chapter: r.get::<i64, _>("end_chapter") as u32,
        theme: r.get("theme"),
        key_events: serde_json::from_str(&key_events).unwrap_or_default(),
        conflicts: serde_json::from_str(&conflicts).unwrap_or_default(),
        character_arcs: serde_json::from_str(&character_arcs).unwrap_or_default(),
        ending_hook: r.get("ending_hook"),
        generation_status: GenerationStatus::parse(&status),
        progress: r.get::<i64, _>("progress") as u8,
        updated_at: parse_timestamp(&updated_at),
    }
}

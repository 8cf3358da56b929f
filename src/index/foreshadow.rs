use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use crate::db::{parse_timestamp, Database};
use crate::error::Result;
use crate::model::ForeshadowBlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForeshadowPriority {
    High,
    Medium,
    Low,
}

impl ForeshadowPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForeshadowPriority::High => "high",
            ForeshadowPriority::Medium => "medium",
            ForeshadowPriority::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "high" | "高" => ForeshadowPriority::High,
            "low" | "低" => ForeshadowPriority::Low,
            _ => ForeshadowPriority::Medium,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            ForeshadowPriority::High => 0,
            ForeshadowPriority::Medium => 1,
            ForeshadowPriority::Low => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForeshadowStatus {
    Pending,
    Resolved,
    Abandoned,
}

impl ForeshadowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForeshadowStatus::Pending => "pending",
            ForeshadowStatus::Resolved => "resolved",
            ForeshadowStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "resolved" => ForeshadowStatus::Resolved,
            "abandoned" => ForeshadowStatus::Abandoned,
            _ => ForeshadowStatus::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForeshadowRow {
    pub id: Uuid,
    pub project_id: Uuid,
    pub planted_chapter: u32,
    pub description: String,
    pub original_text: String,
    pub category: String,
    pub priority: ForeshadowPriority,
    pub related_entities: Vec<String>,
    pub status: ForeshadowStatus,
    pub resolved_chapter: Option<u32>,
    pub resolution: Option<String>,
    pub remind_after_chapter: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Planted narrative hooks and their lifecycle. Inserts are de-duplicated
/// on a similarity key so re-analysis of a chapter does not multiply rows.
#[derive(Clone)]
pub struct ForeshadowIndex {
    db: Database,
}

/// Case-folded first 80 characters of the description.
fn similarity_key(description: &str) -> String {
    description
        .trim()
        .to_lowercase()
        .chars()
        .take(80)
        .collect()
}

impl ForeshadowIndex {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Apply a chapter's foreshadowing block: insert fresh plants, resolve
    /// the ones the chapter paid off.
    pub async fn ingest(
        &self,
        project_id: Uuid,
        chapter_number: u32,
        block: &ForeshadowBlock,
    ) -> Result<()> {
        let mut existing_keys = self.existing_keys(project_id).await?;

        for planted in &block.planted {
            if planted.description.trim().is_empty() {
                continue;
            }
            let key = similarity_key(&planted.description);
            if existing_keys.contains_key(&key) {
                debug!(chapter_number, "skipping duplicate foreshadowing: {}", key);
                continue;
            }
            let id = Uuid::new_v4();
            existing_keys.insert(key, id);
            let now = Utc::now().to_rfc3339();
            sqlx::query(
                r#"
                INSERT INTO foreshadowing_index
                    (id, project_id, planted_chapter, description, original_text, category,
                     priority, related_entities, status, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)
                "#,
            )
            .bind(id.to_string())
            .bind(project_id.to_string())
            .bind(chapter_number as i64)
            .bind(planted.description.trim())
            .bind(&planted.original_text)
            .bind(&planted.category)
            .bind(ForeshadowPriority::parse(&planted.priority).as_str())
            .bind(serde_json::to_string(&planted.related_entities)?)
            .bind(&now)
            .bind(&now)
            .execute(self.db.pool())
            .await?;
        }

        for resolved in &block.resolved {
            let Some(id) = resolved.id.as_deref().and_then(|s| Uuid::parse_str(s).ok()) else {
                continue;
            };
            sqlx::query(
                r#"
                UPDATE foreshadowing_index
                SET status = 'resolved', resolved_chapter = ?, resolution = ?, updated_at = ?
                WHERE id = ? AND project_id = ?
                "#,
            )
            .bind(chapter_number as i64)
            .bind(&resolved.resolution)
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .bind(project_id.to_string())
            .execute(self.db.pool())
            .await?;
        }

        Ok(())
    }

    /// Pending rows, highest priority first, oldest plant first within a
    /// priority. With `include_overdue` off, rows whose reminder has not
    /// come due yet are left out.
    pub async fn pending(
        &self,
        project_id: Uuid,
        current_chapter: u32,
        include_overdue: bool,
    ) -> Result<Vec<ForeshadowRow>> {
        let rows = sqlx::query(
            "SELECT * FROM foreshadowing_index WHERE project_id = ? AND status = 'pending'",
        )
        .bind(project_id.to_string())
        .fetch_all(self.db.pool())
        .await?;

        let mut result: Vec<ForeshadowRow> = rows
            .iter()
            .map(row_from_sqlite)
            .filter(|row| {
                include_overdue
                    || row
                        .remind_after_chapter
                        .map(|after| after <= current_chapter)
                        .unwrap_or(true)
            })
            .collect();

        result.sort_by(|a, b| {
            a.priority
                .rank()
                .cmp(&b.priority.rank())
                .then(a.planted_chapter.cmp(&b.planted_chapter))
        });
        Ok(result)
    }

    pub async fn abandon(&self, project_id: Uuid, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE foreshadowing_index
            SET status = 'abandoned', updated_at = ?
            WHERE id = ? AND project_id = ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .bind(project_id.to_string())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Advisory chapter by which each pending row ought to resolve. The
    /// query builder uses it to decide which foreshadows are "due"; nothing
    /// enforces it.
    pub async fn suggest_resolution_chapters(
        &self,
        project_id: Uuid,
        total_chapters: u32,
    ) -> Result<HashMap<Uuid, u32>> {
        let pending = self.pending(project_id, u32::MAX, true).await?;
        Ok(pending
            .iter()
            .map(|row| {
                let target = match row.priority {
                    ForeshadowPriority::High => {
                        (row.planted_chapter + 5).min((total_chapters as f64 * 0.8) as u32)
                    }
                    ForeshadowPriority::Medium => {
                        (row.planted_chapter + 15).min((total_chapters as f64 * 0.9) as u32)
                    }
                    ForeshadowPriority::Low => (total_chapters as f64 * 0.95) as u32,
                };
                (row.id, target)
            })
            .collect())
    }

    /// Cascade support: plants from deleted chapters disappear, and rows
    /// resolved in a deleted chapter go back to pending.
    pub async fn delete_chapters_from(&self, project_id: Uuid, from: u32) -> Result<()> {
        let pid = project_id.to_string();
        sqlx::query(
            "DELETE FROM foreshadowing_index WHERE project_id = ? AND planted_chapter >= ?",
        )
        .bind(&pid)
        .bind(from as i64)
        .execute(self.db.pool())
        .await?;

        sqlx::query(
            r#"
            UPDATE foreshadowing_index
            SET status = 'pending', resolved_chapter = NULL, resolution = NULL, updated_at = ?
            WHERE project_id = ? AND resolved_chapter >= ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(&pid)
        .bind(from as i64)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn existing_keys(&self, project_id: Uuid) -> Result<HashMap<String, Uuid>> {
        let rows = sqlx::query("SELECT id, description FROM foreshadowing_index WHERE project_id = ?")
            .bind(project_id.to_string())
            .fetch_all(self.db.pool())
            .await?;

        Ok(rows
            .iter()
            .filter_map(|r| {
                let id: String = r.get("id");
                let description: String = r.get("description");
                Uuid::parse_str(&id)
                    .ok()
                    .map(|id| (similarity_key(&description), id))
            })
            .collect())
    }
}

fn row_from_sqlite(r: &sqlx::sqlite::SqliteRow) -> ForeshadowRow {
    let id: String = r.get("id");
    let project_id: String = r.get("project_id");
    let priority: String = r.get("priority");
    let status: String = r.get("status");
    let related: String = r.get("related_entities");
    let created_at: String = r.get("created_at");
    let updated_at: String = r.get("updated_at");
    ForeshadowRow {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        project_id: Uuid::parse_str(&project_id).unwrap_or_default(),
        planted_chapter: r.get::<i64, _>("planted_chapter") as u32,
        description: r.get("description"),
        original_text: r.get("original_text"),
        category: r.get("category"),
        priority: ForeshadowPriority::parse(&priority),
        related_entities: serde_json::from_str(&related).unwrap_or_default(),
        status: ForeshadowStatus::parse(&status),
        resolved_chapter: r.get::<Option<i64>, _>("resolved_chapter").map(|v| v as u32),
        resolution: r.get("resolution"),
        remind_after_chapter: r
            .get::<Option<i64>, _>("remind_after_chapter")
            .map(|v| v as u32),
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PlantedForeshadow, ResolvedForeshadow};

    fn planted(description: &str, priority: &str) -> PlantedForeshadow {
        PlantedForeshadow {
            description: description.to_string(),
            original_text: String::new(),
            category: "物品".to_string(),
            priority: priority.to_string(),
            related_entities: vec![],
        }
    }

    #[tokio::test]
    async fn duplicate_plants_are_skipped() {
        let db = Database::connect_in_memory().await.unwrap();
        let index = ForeshadowIndex::new(db);
        let project_id = Uuid::new_v4();

        let block = ForeshadowBlock {
            planted: vec![planted("神秘玉佩在灯下泛起微光", "high")],
            ..Default::default()
        };
        index.ingest(project_id, 1, &block).await.unwrap();
        index.ingest(project_id, 2, &block).await.unwrap();

        let pending = index.pending(project_id, 2, true).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].planted_chapter, 1);
    }

    #[tokio::test]
    async fn pending_orders_by_priority_then_age() {
        let db = Database::connect_in_memory().await.unwrap();
        let index = ForeshadowIndex::new(db);
        let project_id = Uuid::new_v4();

        for (chapter, description, priority) in [
            (3, "低优先级的伏笔", "low"),
            (2, "后种下的高优先级伏笔", "high"),
            (1, "先种下的高优先级伏笔", "high"),
            (1, "中优先级伏笔", "medium"),
        ] {
            let block = ForeshadowBlock {
                planted: vec![planted(description, priority)],
                ..Default::default()
            };
            index.ingest(project_id, chapter, &block).await.unwrap();
        }

        let pending = index.pending(project_id, 5, true).await.unwrap();
        let order: Vec<(&str, u32)> = pending
            .iter()
            .map(|r| (r.priority.as_str(), r.planted_chapter))
            .collect();
        assert_eq!(
            order,
            vec![("high", 1), ("high", 2), ("medium", 1), ("low", 3)]
        );
    }

    #[tokio::test]
    async fn resolution_updates_lifecycle() {
        let db = Database::connect_in_memory().await.unwrap();
        let index = ForeshadowIndex::new(db);
        let project_id = Uuid::new_v4();

        let block = ForeshadowBlock {
            planted: vec![planted("黑袍人留下的一句谶语", "medium")],
            ..Default::default()
        };
        index.ingest(project_id, 4, &block).await.unwrap();
        let id = index.pending(project_id, 4, true).await.unwrap()[0].id;

        let resolve = ForeshadowBlock {
            resolved: vec![ResolvedForeshadow {
                id: Some(id.to_string()),
                resolution: "谶语应验，宗门大劫降临".to_string(),
            }],
            ..Default::default()
        };
        index.ingest(project_id, 9, &resolve).await.unwrap();

        assert!(index.pending(project_id, 9, true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolution_targets_follow_priority() {
        let db = Database::connect_in_memory().await.unwrap();
        let index = ForeshadowIndex::new(db);
        let project_id = Uuid::new_v4();

        for (priority, description) in [
            ("high", "高优先级"),
            ("medium", "中优先级"),
            ("low", "低优先级"),
        ] {
            let block = ForeshadowBlock {
                planted: vec![planted(description, priority)],
                ..Default::default()
            };
            index.ingest(project_id, 10, &block).await.unwrap();
        }

        let targets = index
            .suggest_resolution_chapters(project_id, 100)
            .await
            .unwrap();
        let pending = index.pending(project_id, 10, true).await.unwrap();
        for row in &pending {
            let target = targets[&row.id];
            match row.priority {
                ForeshadowPriority::High => assert_eq!(target, 15),
                ForeshadowPriority::Medium => assert_eq!(target, 25),
                ForeshadowPriority::Low => assert_eq!(target, 95),
            }
        }
    }
}

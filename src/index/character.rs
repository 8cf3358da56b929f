use sqlx::Row;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::db::Database;
use crate::error::Result;
use crate::model::CharacterState;

#[derive(Debug, Clone)]
pub struct CharacterStateRow {
    pub project_id: Uuid,
    pub chapter_number: u32,
    pub character_name: String,
    pub state: CharacterState,
}

/// Where every character is and what happened to them, one row per
/// (chapter, character), derived from the confirmed chapter's analysis.
/// A chapter's rows are replaced wholesale on (re)confirmation.
#[derive(Clone)]
pub struct CharacterStateIndex {
    db: Database,
}

impl CharacterStateIndex {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn update(
        &self,
        project_id: Uuid,
        chapter_number: u32,
        states: &BTreeMap<String, CharacterState>,
    ) -> Result<()> {
        let pid = project_id.to_string();

        sqlx::query(
            "DELETE FROM character_state_index WHERE project_id = ? AND chapter_number = ?",
        )
        .bind(&pid)
        .bind(chapter_number as i64)
        .execute(self.db.pool())
        .await?;

        for (name, state) in states {
            sqlx::query(
                r#"
                INSERT INTO character_state_index
                    (project_id, chapter_number, character_name, location, status, changes)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&pid)
            .bind(chapter_number as i64)
            .bind(name)
            .bind(&state.location)
            .bind(&state.status)
            .bind(serde_json::to_string(&state.changes)?)
            .execute(self.db.pool())
            .await?;
        }

        Ok(())
    }

    /// A character's trail leading up to (not including) `before_chapter`,
    /// most recent first.
    pub async fn history(
        &self,
        project_id: Uuid,
        character_name: &str,
        before_chapter: u32,
        limit: usize,
    ) -> Result<Vec<CharacterStateRow>> {
        let rows = sqlx::query(
            r#"
            SELECT chapter_number, character_name, location, status, changes
            FROM character_state_index
            WHERE project_id = ? AND character_name = ? AND chapter_number < ?
            ORDER BY chapter_number DESC
            LIMIT ?
            "#,
        )
        .bind(project_id.to_string())
        .bind(character_name)
        .bind(before_chapter as i64)
        .bind(limit as i64)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|r| row_from_sqlite(project_id, r))
            .collect())
    }

    pub async fn chapter_states(
        &self,
        project_id: Uuid,
        chapter_number: u32,
    ) -> Result<BTreeMap<String, CharacterState>> {
        let rows = sqlx::query(
            r#"
            SELECT chapter_number, character_name, location, status, changes
            FROM character_state_index
            WHERE project_id = ? AND chapter_number = ?
            "#,
        )
        .bind(project_id.to_string())
        .bind(chapter_number as i64)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|r| {
                let row = row_from_sqlite(project_id, r);
                (row.character_name, row.state)
            })
            .collect())
    }

    pub async fn delete_chapters_from(&self, project_id: Uuid, from: u32) -> Result<()> {
        sqlx::query(
            "DELETE FROM character_state_index WHERE project_id = ? AND chapter_number >= ?",
        )
        .bind(project_id.to_string())
        .bind(from as i64)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }
}

fn row_from_sqlite(project_id: Uuid, r: &sqlx::sqlite::SqliteRow) -> CharacterStateRow {
    let changes: String = r.get("changes");
    CharacterStateRow {
        project_id,
        chapter_number: r.get::<i64, _>("chapter_number") as u32,
        character_name: r.get("character_name"),
        state: CharacterState {
            location: r.get("location"),
            status: r.get("status"),
            changes: serde_json::from_str(&changes).unwrap_or_default(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(location: &str, status: &str) -> CharacterState {
        CharacterState {
            location: location.to_string(),
            status: status.to_string(),
            changes: vec!["突破到炼气三层".to_string()],
        }
    }

    #[tokio::test]
    async fn update_replaces_chapter_rows() {
        let db = Database::connect_in_memory().await.unwrap();
        let index = CharacterStateIndex::new(db);
        let project_id = Uuid::new_v4();

        let mut states = BTreeMap::new();
        states.insert("林凡".to_string(), state("青云宗", "修炼中"));
        states.insert("苏瑶".to_string(), state("药王谷", "疗伤"));
        index.update(project_id, 3, &states).await.unwrap();

        // Second pass drops 苏瑶 from the chapter; her row must go too.
        let mut states = BTreeMap::new();
        states.insert("林凡".to_string(), state("万兽山脉", "历练"));
        index.update(project_id, 3, &states).await.unwrap();

        let current = index.chapter_states(project_id, 3).await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current["林凡"].location, "万兽山脉");
    }

    #[tokio::test]
    async fn history_is_descending_and_bounded() {
        let db = Database::connect_in_memory().await.unwrap();
        let index = CharacterStateIndex::new(db);
        let project_id = Uuid::new_v4();

        for chapter in 1..=6 {
            let mut states = BTreeMap::new();
            states.insert("林凡".to_string(), state(&format!("地点{}", chapter), ""));
            index.update(project_id, chapter, &states).await.unwrap();
        }

        let history = index.history(project_id, "林凡", 6, 3).await.unwrap();
        let chapters: Vec<u32> = history.iter().map(|r| r.chapter_number).collect();
        assert_eq!(chapters, vec![5, 4, 3]);
    }
}

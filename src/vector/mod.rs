use serde_json::{Map, Value};
use sqlx::Row;
use uuid::Uuid;

use crate::db::Database;
use crate::error::Result;

/// One embedded slice of a chapter. Ids are `{project}:{chapter}:{index}`
/// so re-ingesting a chapter replaces its records in place.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: String,
    pub project_id: Uuid,
    pub chapter_number: u32,
    pub chunk_index: u32,
    pub chapter_title: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: Map<String, Value>,
}

impl ChunkRecord {
    pub fn record_id(project_id: Uuid, chapter_number: u32, chunk_index: u32) -> String {
        format!("{}:{}:{}", project_id, chapter_number, chunk_index)
    }
}

#[derive(Debug, Clone)]
pub struct SummaryRecord {
    pub id: String,
    pub project_id: Uuid,
    pub chapter_number: u32,
    pub title: String,
    pub summary: String,
    pub embedding: Vec<f32>,
}

impl SummaryRecord {
    pub fn record_id(project_id: Uuid, chapter_number: u32) -> String {
        format!("{}:{}:summary", project_id, chapter_number)
    }
}

/// Query hit: record plus its cosine distance (smaller = more similar).
#[derive(Debug, Clone)]
pub struct ChunkHit {
    pub record: ChunkRecord,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct SummaryHit {
    pub record: SummaryRecord,
    pub score: f32,
}

/// Embedding store over the shared SQLite pool. Distances are computed
/// in-process; chapter volumes stay small enough that a brute-force scan
/// per query is fine. When disabled, writes are dropped and queries come
/// back empty, so the rest of the pipeline needs no special casing.
#[derive(Clone)]
pub struct VectorStore {
    db: Database,
    enabled: bool,
}

impl VectorStore {
    pub fn new(db: Database, enabled: bool) -> Self {
        Self { db, enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn upsert_chunks(&self, records: &[ChunkRecord]) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        for record in records {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO vector_chunks
                    (id, project_id, chapter_number, chunk_index, chapter_title, content, embedding, metadata)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.id)
            .bind(record.project_id.to_string())
            .bind(record.chapter_number as i64)
            .bind(record.chunk_index as i64)
            .bind(&record.chapter_title)
            .bind(&record.content)
            .bind(encode_embedding(&record.embedding))
            .bind(serde_json::to_string(&record.metadata)?)
            .execute(self.db.pool())
            .await?;
        }
        Ok(())
    }

    pub async fn upsert_summaries(&self, records: &[SummaryRecord]) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        for record in records {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO vector_summaries
                    (id, project_id, chapter_number, title, summary, embedding)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.id)
            .bind(record.project_id.to_string())
            .bind(record.chapter_number as i64)
            .bind(&record.title)
            .bind(&record.summary)
            .bind(encode_embedding(&record.embedding))
            .execute(self.db.pool())
            .await?;
        }
        Ok(())
    }

    pub async fn query_chunks(
        &self,
        project_id: Uuid,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<ChunkHit>> {
        if !self.enabled {
            return Ok(Vec::new());
        }
        let rows = sqlx::query("SELECT * FROM vector_chunks WHERE project_id = ?")
            .bind(project_id.to_string())
            .fetch_all(self.db.pool())
            .await?;

        let mut hits: Vec<ChunkHit> = rows
            .iter()
            .map(|r| {
                let metadata: String = r.get("metadata");
                let stored = decode_embedding(r.get("embedding"));
                ChunkHit {
                    score: cosine_distance(embedding, &stored),
                    record: ChunkRecord {
                        id: r.get("id"),
                        project_id,
                        chapter_number: r.get::<i64, _>("chapter_number") as u32,
                        chunk_index: r.get::<i64, _>("chunk_index") as u32,
                        chapter_title: r.get("chapter_title"),
                        content: r.get("content"),
                        embedding: stored,
                        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
                    },
                }
            })
            .collect();

        hits.sort_by(|a, b| a.score.total_cmp(&b.score));
        hits.truncate(top_k);
        Ok(hits)
    }

    pub async fn query_summaries(
        &self,
        project_id: Uuid,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<SummaryHit>> {
        if !self.enabled {
            return Ok(Vec::new());
        }
        let rows = sqlx::query("SELECT * FROM vector_summaries WHERE project_id = ?")
            .bind(project_id.to_string())
            .fetch_all(self.db.pool())
            .await?;

        let mut hits: Vec<SummaryHit> = rows
            .iter()
            .map(|r| {
                let stored = decode_embedding(r.get("embedding"));
                SummaryHit {
                    score: cosine_distance(embedding, &stored),
                    record: SummaryRecord {
                        id: r.get("id"),
                        project_id,
                        chapter_number: r.get::<i64, _>("chapter_number") as u32,
                        title: r.get("title"),
                        summary: r.get("summary"),
                        embedding: stored,
                    },
                }
            })
            .collect();

        hits.sort_by(|a, b| a.score.total_cmp(&b.score));
        hits.truncate(top_k);
        Ok(hits)
    }

    /// All summaries of one chapter, no similarity involved. Used by
    /// invariant checks and the confirm flow.
    pub async fn summaries_for_chapter(
        &self,
        project_id: Uuid,
        chapter_number: u32,
    ) -> Result<Vec<SummaryRecord>> {
        if !self.enabled {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT * FROM vector_summaries WHERE project_id = ? AND chapter_number = ?",
        )
        .bind(project_id.to_string())
        .bind(chapter_number as i64)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|r| SummaryRecord {
                id: r.get("id"),
                project_id,
                chapter_number,
                title: r.get("title"),
                summary: r.get("summary"),
                embedding: decode_embedding(r.get("embedding")),
            })
            .collect())
    }

    pub async fn delete_by_chapters(
        &self,
        project_id: Uuid,
        chapter_numbers: &[u32],
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let pid = project_id.to_string();
        for &chapter in chapter_numbers {
            sqlx::query("DELETE FROM vector_chunks WHERE project_id = ? AND chapter_number = ?")
                .bind(&pid)
                .bind(chapter as i64)
                .execute(self.db.pool())
                .await?;
            sqlx::query("DELETE FROM vector_summaries WHERE project_id = ? AND chapter_number = ?")
                .bind(&pid)
                .bind(chapter as i64)
                .execute(self.db.pool())
                .await?;
        }
        Ok(())
    }

    pub async fn delete_chapters_from(&self, project_id: Uuid, from: u32) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let pid = project_id.to_string();
        sqlx::query("DELETE FROM vector_chunks WHERE project_id = ? AND chapter_number >= ?")
            .bind(&pid)
            .bind(from as i64)
            .execute(self.db.pool())
            .await?;
        sqlx::query("DELETE FROM vector_summaries WHERE project_id = ? AND chapter_number >= ?")
            .bind(&pid)
            .bind(from as i64)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}

/// Embeddings are stored as contiguous little-endian f32 bytes.
fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 1.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (mag_a * mag_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn embedding_bytes_round_trip() {
        let embedding = vec![0.25f32, -1.5, 3.0, 0.0];
        assert_eq!(decode_embedding(&encode_embedding(&embedding)), embedding);
    }

    #[test]
    fn cosine_distance_basics() {
        let a = vec![1.0, 0.0];
        assert!(cosine_distance(&a, &[1.0, 0.0]).abs() < 1e-6);
        assert!((cosine_distance(&a, &[0.0, 1.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_distance(&a, &[-1.0, 0.0]) - 2.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn upsert_query_delete() {
        let db = Database::connect_in_memory().await.unwrap();
        let store = VectorStore::new(db, true);
        let project_id = Uuid::new_v4();

        let mk = |chapter: u32, index: u32, embedding: Vec<f32>| ChunkRecord {
            id: ChunkRecord::record_id(project_id, chapter, index),
            project_id,
            chapter_number: chapter,
            chunk_index: index,
            chapter_title: format!("第{}章", chapter),
            content: "……".to_string(),
            embedding,
            metadata: Default::default(),
        };

        store
            .upsert_chunks(&[
                mk(1, 0, vec![1.0, 0.0]),
                mk(1, 1, vec![0.0, 1.0]),
                mk(2, 0, vec![0.9, 0.1]),
            ])
            .await
            .unwrap();

        let hits = store
            .query_chunks(project_id, &[1.0, 0.0], 2)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.chapter_number, 1);
        assert_eq!(hits[0].record.chunk_index, 0);
        assert!(hits[0].score <= hits[1].score);

        // Replace-by-id keeps one row per id.
        store
            .upsert_chunks(&[mk(1, 0, vec![0.5, 0.5])])
            .await
            .unwrap();
        let hits = store
            .query_chunks(project_id, &[1.0, 0.0], 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 3);

        store.delete_by_chapters(project_id, &[1]).await.unwrap();
        let hits = store
            .query_chunks(project_id, &[1.0, 0.0], 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.chapter_number, 2);
    }

    #[tokio::test]
    async fn disabled_store_is_inert() {
        let db = Database::connect_in_memory().await.unwrap();
        let store = VectorStore::new(db, false);
        let project_id = Uuid::new_v4();

        store
            .upsert_summaries(&[SummaryRecord {
                id: SummaryRecord::record_id(project_id, 1),
                project_id,
                chapter_number: 1,
                title: "第1章".to_string(),
                summary: "概要".to_string(),
                embedding: vec![1.0],
            }])
            .await
            .unwrap();

        assert!(store
            .query_summaries(project_id, &[1.0], 5)
            .await
            .unwrap()
            .is_empty());
    }
}

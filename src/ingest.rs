use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::llm::Gateway;
use crate::splitter::TextSplitter;
use crate::vector::{ChunkRecord, SummaryRecord, VectorStore};

/// Turns a confirmed chapter into vector records: prior vectors deleted,
/// content chunked and embedded, summary embedded alongside. Re-running with
/// the same inputs lands on the same ids, so ingestion is idempotent and a
/// half-finished run is healed by the next successful one.
#[derive(Clone)]
pub struct ChapterIngestor {
    gateway: Gateway,
    store: VectorStore,
    splitter: TextSplitter,
}

impl ChapterIngestor {
    pub fn new(gateway: Gateway, store: VectorStore, splitter: TextSplitter) -> Self {
        Self {
            gateway,
            store,
            splitter,
        }
    }

    pub async fn ingest_chapter(
        &self,
        project_id: Uuid,
        chapter_number: u32,
        title: &str,
        content: &str,
        summary: Option<&str>,
        user_id: &str,
    ) -> Result<usize> {
        if !self.store.is_enabled() {
            return Ok(0);
        }

        self.store
            .delete_by_chapters(project_id, &[chapter_number])
            .await?;

        let chunks = self.splitter.split(content);
        let config = self.gateway.resolve_config(user_id).await?;

        let mut records = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.iter().enumerate() {
            let embedding = self.gateway.embed_with_config(&config, chunk).await?;
            records.push(ChunkRecord {
                id: ChunkRecord::record_id(project_id, chapter_number, index as u32),
                project_id,
                chapter_number,
                chunk_index: index as u32,
                chapter_title: title.to_string(),
                content: chunk.clone(),
                embedding,
                metadata: Default::default(),
            });
        }
        self.store.upsert_chunks(&records).await?;

        if let Some(summary) = summary.filter(|s| !s.trim().is_empty()) {
            let embedding = self.gateway.embed_with_config(&config, summary).await?;
            self.store
                .upsert_summaries(&[SummaryRecord {
                    id: SummaryRecord::record_id(project_id, chapter_number),
                    project_id,
                    chapter_number,
                    title: title.to_string(),
                    summary: summary.to_string(),
                    embedding,
                }])
                .await?;
        }

        info!(
            %project_id,
            chapter_number,
            chunks = records.len(),
            "chapter ingested into vector store"
        );
        Ok(records.len())
    }
}

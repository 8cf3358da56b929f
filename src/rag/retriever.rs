use std::collections::HashMap;
use uuid::Uuid;

use crate::error::Result;
use crate::vector::{ChunkRecord, SummaryRecord, VectorStore};

/// Retrieval hit re-scored with temporal weighting.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub record: ChunkRecord,
    pub final_score: f32,
}

#[derive(Debug, Clone)]
pub struct ScoredSummary {
    pub record: SummaryRecord,
    pub final_score: f32,
}

/// Blends vector similarity with recency relative to the chapter being
/// written, plus a small bonus for near-neighbour chapters. Pure similarity
/// would happily surface chapter 3 while writing chapter 290; the decay
/// keeps retrieval anchored to the story's present.
#[derive(Debug, Clone, Copy)]
pub struct TemporalRetriever {
    pub similarity_weight: f32,
    pub recency_weight: f32,
    pub nearby_range: u32,
    pub nearby_bonus: f32,
}

impl Default for TemporalRetriever {
    fn default() -> Self {
        Self {
            similarity_weight: 0.7,
            recency_weight: 0.3,
            nearby_range: 5,
            nearby_bonus: 0.2,
        }
    }
}

impl TemporalRetriever {
    pub fn score(
        &self,
        cosine_distance: f32,
        source_chapter: u32,
        target_chapter: u32,
        total_chapters: u32,
    ) -> f32 {
        let similarity = 1.0 - cosine_distance;
        let gap = source_chapter.abs_diff(target_chapter);
        let recency = (-3.0 * gap as f32 / total_chapters.max(1) as f32).exp();

        let mut score = self.similarity_weight * similarity + self.recency_weight * recency;
        if gap <= self.nearby_range {
            score += self.nearby_bonus * (1.0 - gap as f32 / self.nearby_range as f32);
        }
        score
    }

    pub async fn retrieve_chunks(
        &self,
        store: &VectorStore,
        project_id: Uuid,
        query_embedding: &[f32],
        target_chapter: u32,
        total_chapters: u32,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let candidates = store
            .query_chunks(project_id, query_embedding, top_k * 2)
            .await?;

        let mut scored: Vec<ScoredChunk> = candidates
            .into_iter()
            .map(|hit| ScoredChunk {
                final_score: self.score(
                    hit.score,
                    hit.record.chapter_number,
                    target_chapter,
                    total_chapters,
                ),
                record: hit.record,
            })
            .collect();

        scored.sort_by(|a, b| b.final_score.total_cmp(&a.final_score));
        scored.truncate(top_k);
        Ok(scored)
    }

    pub async fn retrieve_summaries(
        &self,
        store: &VectorStore,
        project_id: Uuid,
        query_embedding: &[f32],
        target_chapter: u32,
        total_chapters: u32,
        top_k: usize,
    ) -> Result<Vec<ScoredSummary>> {
        let candidates = store
            .query_summaries(project_id, query_embedding, top_k * 2)
            .await?;

        let mut scored: Vec<ScoredSummary> = candidates
            .into_iter()
            .map(|hit| ScoredSummary {
                final_score: self.score(
                    hit.score,
                    hit.record.chapter_number,
                    target_chapter,
                    total_chapters,
                ),
                record: hit.record,
            })
            .collect();

        scored.sort_by(|a, b| b.final_score.total_cmp(&a.final_score));
        scored.truncate(top_k);
        Ok(scored)
    }
}

/// Merge chunk hits gathered across sub-queries, keeping the best score per
/// (chapter, chunk) slot.
pub fn dedup_chunks(hits: Vec<ScoredChunk>) -> Vec<ScoredChunk> {
    let mut best: HashMap<(u32, u32), ScoredChunk> = HashMap::new();
    for hit in hits {
        let key = (hit.record.chapter_number, hit.record.chunk_index);
        match best.get(&key) {
            Some(existing) if existing.final_score >= hit.final_score => {}
            _ => {
                best.insert(key, hit);
            }
        }
    }
    let mut merged: Vec<ScoredChunk> = best.into_values().collect();
    merged.sort_by(|a, b| b.final_score.total_cmp(&a.final_score));
    merged
}

pub fn dedup_summaries(hits: Vec<ScoredSummary>) -> Vec<ScoredSummary> {
    let mut best: HashMap<u32, ScoredSummary> = HashMap::new();
    for hit in hits {
        let key = hit.record.chapter_number;
        match best.get(&key) {
            Some(existing) if existing.final_score >= hit.final_score => {}
            _ => {
                best.insert(key, hit);
            }
        }
    }
    let mut merged: Vec<ScoredSummary> = best.into_values().collect();
    merged.sort_by(|a, b| b.final_score.total_cmp(&a.final_score));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recency_is_neutral_for_single_chapter_novel() {
        let retriever = TemporalRetriever::default();
        // total=1, target=source=1: gap 0, recency term is exactly 1 and the
        // nearby bonus is constant, so ordering is by similarity alone.
        let close = retriever.score(0.1, 1, 1, 1);
        let far = retriever.score(0.6, 1, 1, 1);
        assert!(close > far);
        let expected = 0.7 * 0.9 + 0.3 + 0.2;
        assert!((close - expected).abs() < 1e-6);
    }

    #[test]
    fn recent_chapters_outrank_equally_similar_old_ones() {
        let retriever = TemporalRetriever::default();
        let recent = retriever.score(0.3, 95, 100, 100);
        let old = retriever.score(0.3, 10, 100, 100);
        assert!(recent > old);
    }

    #[test]
    fn nearby_bonus_decays_with_distance() {
        let retriever = TemporalRetriever::default();
        let next_door = retriever.score(0.5, 99, 100, 100);
        let five_away = retriever.score(0.5, 95, 100, 100);
        let six_away = retriever.score(0.5, 94, 100, 100);
        assert!(next_door > five_away);
        // At the range edge the bonus is zero, beyond it none is applied.
        assert!(five_away > six_away);
    }

    #[test]
    fn dedup_keeps_best_scoring_occurrence() {
        let record = |chapter: u32, index: u32| ChunkRecord {
            id: ChunkRecord::record_id(Uuid::nil(), chapter, index),
            project_id: Uuid::nil(),
            chapter_number: chapter,
            chunk_index: index,
            chapter_title: String::new(),
            content: String::new(),
            embedding: vec![],
            metadata: Default::default(),
        };

        let merged = dedup_chunks(vec![
            ScoredChunk {
                record: record(1, 0),
                final_score: 0.4,
            },
            ScoredChunk {
                record: record(1, 0),
                final_score: 0.9,
            },
            ScoredChunk {
                record: record(2, 1),
                final_score: 0.5,
            },
        ]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].record.chapter_number, 1);
        assert!((merged[0].final_score - 0.9).abs() < 1e-6);
    }
}

//! Cosine-similarity top-k retrieval over an embedded chunk set.
//!
//! Retrieval is purely functional: given a question vector and a chunk
//! set's embeddings it computes similarities and returns the top-k, with
//! ties broken by original chunk order so results are stable across
//! re-runs with identical embeddings.

use crate::chunker::Chunk;
use crate::embedding::EmbeddedChunkSet;
use serde::{Deserialize, Serialize};

/// One retrieved chunk with its similarity score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    /// The matched chunk.
    pub chunk: Chunk,
    /// Cosine similarity against the question vector.
    pub score: f32,
}

/// Compute cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Return the top-k chunks by descending similarity to the question
/// vector. Ties keep original chunk order. When fewer chunks exist than
/// k, all available chunks are returned.
pub fn top_k(question: &[f32], chunk_set: &EmbeddedChunkSet, k: usize) -> Vec<RetrievedChunk> {
    let mut scored: Vec<RetrievedChunk> = chunk_set
        .entries
        .iter()
        .map(|entry| RetrievedChunk {
            chunk: entry.chunk.clone(),
            score: cosine_similarity(question, &entry.embedding),
        })
        .collect();

    // Stable sort keeps document order among equal scores.
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    scored.truncate(k);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{Chunk, ChunkConfig};
    use crate::embedding::EmbeddedChunk;

    fn make_set(embeddings: Vec<Vec<f32>>) -> EmbeddedChunkSet {
        let entries = embeddings
            .into_iter()
            .enumerate()
            .map(|(index, embedding)| EmbeddedChunk {
                chunk: Chunk {
                    index,
                    start: index * 10,
                    end: index * 10 + 10,
                    text: format!("chunk {}", index),
                },
                embedding,
            })
            .collect();
        EmbeddedChunkSet {
            document_id: "doc".to_string(),
            config: ChunkConfig::default(),
            embedding_model: "embed-1".to_string(),
            entries,
            failures: Vec::new(),
        }
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);

        let c = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &c).abs() < 1e-6);

        // Zero and mismatched vectors never panic.
        assert_eq!(cosine_similarity(&a, &[0.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
    }

    #[test]
    fn test_top_k_ordering_and_size() {
        let set = make_set(vec![
            vec![0.1, 1.0],
            vec![1.0, 0.0],
            vec![0.7, 0.7],
            vec![0.0, 1.0],
        ]);
        let question = vec![1.0, 0.0];

        let results = top_k(&question, &set, 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.index, 1);
        assert_eq!(results[1].chunk.index, 2);
        assert!(results[0].score >= results[1].score);
    }

    #[test]
    fn test_top_k_is_subset_and_stable() {
        let set = make_set(vec![vec![1.0, 0.0]; 5]);
        let question = vec![1.0, 0.0];

        // All scores tie; document order must be preserved.
        let results = top_k(&question, &set, 3);
        let indices: Vec<usize> = results.iter().map(|r| r.chunk.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);

        // Re-running yields identical results.
        let rerun = top_k(&question, &set, 3);
        let rerun_indices: Vec<usize> = rerun.iter().map(|r| r.chunk.index).collect();
        assert_eq!(indices, rerun_indices);
    }

    #[test]
    fn test_k_larger_than_set_returns_all() {
        let set = make_set(vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        let results = top_k(&[1.0, 0.0], &set, 10);
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_empty_set_returns_empty() {
        let set = make_set(Vec::new());
        assert!(top_k(&[1.0, 0.0], &set, 3).is_empty());
    }
}

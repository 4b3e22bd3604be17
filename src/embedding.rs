//! Embedding pipeline and cache.
//!
//! Embeddings are cached by (chunk content hash, embedding model id) so
//! re-running a cell never re-embeds unchanged text. The cache is
//! first-writer-wins: concurrent writers of the same key keep the first
//! stored vector and later writers read it back. The cache can be
//! persisted to disk in compact bincode form.

use crate::backend::EmbeddingBackend;
use crate::chunker::{Chunk, ChunkConfig, ChunkSet};
use crate::error::{HarnessError, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Cache key: (content sha256, embedding model id).
type CacheKey = (String, String);

/// Shared embedding cache.
#[derive(Clone, Default)]
pub struct EmbeddingCache {
    inner: Arc<RwLock<HashMap<CacheKey, Vec<f32>>>>,
}

impl EmbeddingCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a cache from disk. A missing file yields an empty cache.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let data = std::fs::read(path).map_err(|e| HarnessError::io(path, e))?;
        let config = bincode::config::standard();
        let (entries, _): (Vec<(CacheKey, Vec<f32>)>, usize) =
            bincode::serde::decode_from_slice(&data, config)
                .map_err(|e| HarnessError::Serialization(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(RwLock::new(entries.into_iter().collect())),
        })
    }

    /// Persist the cache to disk.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let map = self.inner.read().await;
        let entries: Vec<(&CacheKey, &Vec<f32>)> = map.iter().collect();
        let config = bincode::config::standard();
        let data = bincode::serde::encode_to_vec(&entries, config)
            .map_err(|e| HarnessError::Serialization(e.to_string()))?;
        drop(map);

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| HarnessError::io(parent, e))?;
            }
        }
        std::fs::write(path, &data).map_err(|e| HarnessError::io(path, e))?;
        Ok(())
    }

    /// Read a cached vector.
    pub async fn get(&self, content_hash: &str, model_id: &str) -> Option<Vec<f32>> {
        let map = self.inner.read().await;
        map.get(&(content_hash.to_string(), model_id.to_string()))
            .cloned()
    }

    /// Insert unless already present; returns the vector that ended up
    /// stored (first writer wins).
    pub async fn insert_if_absent(
        &self,
        content_hash: &str,
        model_id: &str,
        embedding: Vec<f32>,
    ) -> Vec<f32> {
        let mut map = self.inner.write().await;
        map.entry((content_hash.to_string(), model_id.to_string()))
            .or_insert(embedding)
            .clone()
    }

    /// Number of cached vectors.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Check if the cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

/// A chunk with its computed embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
}

/// A chunk whose embedding failed after retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkEmbedFailure {
    pub chunk_index: usize,
    pub error: String,
}

/// Embedding results for one chunk set under one embedding model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedChunkSet {
    pub document_id: String,
    pub config: ChunkConfig,
    pub embedding_model: String,
    /// Successfully embedded chunks, in document order.
    pub entries: Vec<EmbeddedChunk>,
    /// Chunks that failed to embed. Never aborts the batch.
    pub failures: Vec<ChunkEmbedFailure>,
}

/// Drives chunk and query embedding through a pluggable backend.
pub struct Embedder {
    backend: Arc<dyn EmbeddingBackend>,
    cache: EmbeddingCache,
    retry: RetryPolicy,
    batch_size: usize,
}

impl Embedder {
    /// Create an embedder with the given backend, cache, and retry policy.
    pub fn new(backend: Arc<dyn EmbeddingBackend>, cache: EmbeddingCache, retry: RetryPolicy) -> Self {
        Self {
            backend,
            cache,
            retry,
            batch_size: 32,
        }
    }

    /// Access the underlying cache.
    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    /// Embed every chunk in the set, reading cached vectors where
    /// available. A batch that fails after retries records per-chunk
    /// failures; other batches still embed.
    pub async fn embed_chunk_set(&self, set: &ChunkSet, model_id: &str) -> EmbeddedChunkSet {
        let mut entries: Vec<Option<EmbeddedChunk>> = vec![None; set.chunks.len()];
        let mut failures = Vec::new();
        let mut pending: Vec<&Chunk> = Vec::new();

        for chunk in &set.chunks {
            let hash = chunk.content_hash();
            if let Some(embedding) = self.cache.get(&hash, model_id).await {
                entries[chunk.index] = Some(EmbeddedChunk {
                    chunk: chunk.clone(),
                    embedding,
                });
            } else {
                pending.push(chunk);
            }
        }

        for batch in pending.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let key = format!("{}/batch@{}", set.document_id, batch[0].index);

            let result = self
                .retry
                .run(&key, || self.backend.embed(&texts, model_id))
                .await;

            match result {
                Ok(vectors) => {
                    for (chunk, embedding) in batch.iter().zip(vectors) {
                        let stored = self
                            .cache
                            .insert_if_absent(&chunk.content_hash(), model_id, embedding)
                            .await;
                        entries[chunk.index] = Some(EmbeddedChunk {
                            chunk: (*chunk).clone(),
                            embedding: stored,
                        });
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        document = %set.document_id,
                        batch_start = batch[0].index,
                        error = %err,
                        "embedding batch failed after retries"
                    );
                    for chunk in batch {
                        failures.push(ChunkEmbedFailure {
                            chunk_index: chunk.index,
                            error: err.to_string(),
                        });
                    }
                }
            }
        }

        EmbeddedChunkSet {
            document_id: set.document_id.clone(),
            config: set.config,
            embedding_model: model_id.to_string(),
            entries: entries.into_iter().flatten().collect(),
            failures,
        }
    }

    /// Embed a single query string, going through the same cache.
    pub async fn embed_query(&self, text: &str, model_id: &str) -> Result<Vec<f32>> {
        let hash = format!("{:x}", Sha256::digest(text.as_bytes()));
        if let Some(embedding) = self.cache.get(&hash, model_id).await {
            return Ok(embedding);
        }

        let texts = vec![text.to_string()];
        let vectors = self
            .retry
            .run(&hash, || self.backend.embed(&texts, model_id))
            .await?;

        let embedding = vectors
            .into_iter()
            .next()
            .ok_or_else(|| HarnessError::fatal("Backend returned no embedding for query"))?;

        Ok(self.cache.insert_if_absent(&hash, model_id, embedding).await)
    }
}

//! Deterministic document chunking.
//!
//! Chunking is pure: the same document and config always produce
//! bit-identical chunk boundaries, independent of call order. Chunks are
//! fixed-stride character windows, so the union of all chunks with the
//! overlap removed reconstructs the original text exactly.

use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Configuration for text chunking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Maximum characters per chunk.
    pub size: usize,
    /// Overlap between consecutive chunks, in characters. Must be
    /// strictly below `size`.
    pub overlap: usize,
}

impl ChunkConfig {
    /// Create a config with an explicit character overlap.
    pub fn new(size: usize, overlap: usize) -> Result<Self> {
        let config = Self { size, overlap };
        config.validate()?;
        Ok(config)
    }

    /// Create a config with overlap expressed as a percentage of size.
    pub fn with_overlap_percent(size: usize, percent: usize) -> Result<Self> {
        Self::new(size, size * percent / 100)
    }

    /// Check the size/overlap relationship.
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(HarnessError::Config(
                "chunk size must be at least 1".to_string(),
            ));
        }
        if self.overlap >= self.size {
            return Err(HarnessError::Config(format!(
                "chunk overlap ({}) must be below chunk size ({})",
                self.overlap, self.size
            )));
        }
        Ok(())
    }

    /// Characters advanced between consecutive chunk starts.
    pub fn stride(&self) -> usize {
        self.size - self.overlap
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            size: 512,
            overlap: 50,
        }
    }
}

/// A bounded text segment derived from a document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    /// Position of this chunk within its chunk set.
    pub index: usize,
    /// Start character offset into the source document.
    pub start: usize,
    /// End character offset (exclusive).
    pub end: usize,
    /// Chunk text.
    pub text: String,
}

impl Chunk {
    /// Content hash used as the embedding cache key component.
    pub fn content_hash(&self) -> String {
        let digest = Sha256::digest(self.text.as_bytes());
        format!("{:x}", digest)
    }
}

/// The chunks of one document under one chunk config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSet {
    /// Source document id.
    pub document_id: String,
    /// The config the chunks were derived under.
    pub config: ChunkConfig,
    /// Chunks in document order.
    pub chunks: Vec<Chunk>,
}

impl ChunkSet {
    /// Number of chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Check if there are no chunks.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Split a document's text into overlapping chunks.
///
/// Chunk starts advance by `config.stride()`; every chunk except
/// possibly the last is exactly `config.size` characters. Offsets are
/// character (not byte) positions.
pub fn chunk_text(document_id: &str, text: &str, config: ChunkConfig) -> Result<ChunkSet> {
    config.validate()?;

    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();

    let mut chunks = Vec::new();
    let mut start = 0;
    let mut index = 0;

    while start < total {
        let end = (start + config.size).min(total);
        chunks.push(Chunk {
            index,
            start,
            end,
            text: chars[start..end].iter().collect(),
        });
        index += 1;

        if end == total {
            break;
        }
        start += config.stride();
    }

    Ok(ChunkSet {
        document_id: document_id.to_string(),
        config,
        chunks,
    })
}

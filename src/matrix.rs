//! The experiment variable matrix and its expansion into run configurations.
//!
//! A `MatrixSpec` declares named dimensions (model, prompt variant,
//! context mode, chunking params, top-k, embedding model), each with a
//! list of options. Expansion takes the Cartesian product of all
//! dimensions; exclusion rules and predicate filters only ever remove
//! cells. Every resolved cell is a `RunConfig` with a deterministic
//! content-hash identity, which makes runs cacheable, deduplicatable,
//! and resumable.

use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::Path;

/// Prompt template variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptVariant {
    /// Plain question-plus-context prompt.
    Naive,
    /// Prompt with citation and abstention instructions.
    Optimized,
}

impl fmt::Display for PromptVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptVariant::Naive => write!(f, "naive"),
            PromptVariant::Optimized => write!(f, "optimized"),
        }
    }
}

/// How document context is supplied to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    /// No document context at all (contamination baseline).
    None,
    /// The full document text.
    FullText,
    /// Top-k retrieved chunks.
    Retrieval,
}

impl fmt::Display for ContextMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextMode::None => write!(f, "none"),
            ContextMode::FullText => write!(f, "full_text"),
            ContextMode::Retrieval => write!(f, "retrieval"),
        }
    }
}

/// One fully-resolved point in the experiment variable matrix.
///
/// Field order is fixed and serialization is canonical, so the identity
/// hash is stable across runs and machines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Model id sent to the backend.
    pub model: String,
    /// Prompt template variant.
    pub prompt: PromptVariant,
    /// Context supply mode.
    pub context: ContextMode,
    /// Maximum characters per chunk.
    pub chunk_size: usize,
    /// Overlap between consecutive chunks, in characters.
    pub chunk_overlap: usize,
    /// Number of chunks retrieved per question.
    pub top_k: usize,
    /// Embedding model id used for chunk and question vectors.
    pub embedding_model: String,
}

impl RunConfig {
    /// Deterministic identifier: first 16 hex chars of the sha256 of the
    /// canonical JSON serialization.
    pub fn id(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let digest = Sha256::digest(canonical.as_bytes());
        format!("{:x}", digest)[..16].to_string()
    }

    /// Whether chunking/retrieval parameters are actually used.
    pub fn uses_retrieval(&self) -> bool {
        self.context == ContextMode::Retrieval
    }

    /// Whether this cell's parameters are mutually coherent.
    ///
    /// Retrieval cells need overlap strictly below chunk size and a
    /// positive top-k.
    pub fn is_coherent(&self) -> bool {
        !self.uses_retrieval() || (self.chunk_overlap < self.chunk_size && self.top_k >= 1)
    }

    /// Match a named dimension against a value, for filtering stored runs.
    pub fn matches_dimension(&self, dimension: &str, value: &str) -> bool {
        match dimension {
            "model" => self.model == value,
            "prompt" => self.prompt.to_string() == value,
            "context" => self.context.to_string() == value,
            "chunk_size" => self.chunk_size.to_string() == value,
            "chunk_overlap" => self.chunk_overlap.to_string() == value,
            "top_k" => self.top_k.to_string() == value,
            "embedding_model" => self.embedding_model == value,
            _ => false,
        }
    }
}

impl fmt::Display for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} model={} prompt={} context={}",
            self.id(),
            self.model,
            self.prompt,
            self.context
        )?;
        if self.uses_retrieval() {
            write!(
                f,
                " chunk={}x{} top_k={} embed={}",
                self.chunk_size, self.chunk_overlap, self.top_k, self.embedding_model
            )?;
        }
        Ok(())
    }
}

/// A rule removing all cells where `dimension` takes `value`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExcludeRule {
    pub dimension: String,
    pub value: String,
}

/// Declarative variable grid: one option list per dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixSpec {
    pub models: Vec<String>,
    pub prompts: Vec<PromptVariant>,
    pub contexts: Vec<ContextMode>,
    #[serde(default = "default_chunk_sizes")]
    pub chunk_sizes: Vec<usize>,
    #[serde(default = "default_chunk_overlaps")]
    pub chunk_overlaps: Vec<usize>,
    #[serde(default = "default_top_ks")]
    pub top_ks: Vec<usize>,
    #[serde(default = "default_embedding_models")]
    pub embedding_models: Vec<String>,
    /// Cells to remove after expansion.
    #[serde(default)]
    pub exclude: Vec<ExcludeRule>,
}

fn default_chunk_sizes() -> Vec<usize> {
    vec![512]
}

fn default_chunk_overlaps() -> Vec<usize> {
    vec![50]
}

fn default_top_ks() -> Vec<usize> {
    vec![5]
}

fn default_embedding_models() -> Vec<String> {
    vec!["text-embedding-3-small".to_string()]
}

const DIMENSION_NAMES: &[&str] = &[
    "model",
    "prompt",
    "context",
    "chunk_size",
    "chunk_overlap",
    "top_k",
    "embedding_model",
];

impl MatrixSpec {
    /// Load a matrix spec from a YAML file.
    pub fn load_yaml(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| HarnessError::io(path, e))?;
        let spec: MatrixSpec = serde_yaml::from_str(&content)
            .map_err(|e| HarnessError::Config(format!("Failed to parse matrix spec: {}", e)))?;
        Ok(spec)
    }

    /// Total cells the full Cartesian product will contain.
    pub fn cardinality(&self) -> usize {
        self.models.len()
            * self.prompts.len()
            * self.contexts.len()
            * self.chunk_sizes.len()
            * self.chunk_overlaps.len()
            * self.top_ks.len()
            * self.embedding_models.len()
    }

    /// Validate dimension declarations and exclusion rules.
    pub fn validate(&self) -> Result<()> {
        let check_nonempty = |name: &str, len: usize| {
            if len == 0 {
                Err(HarnessError::Config(format!(
                    "Dimension '{}' has no options",
                    name
                )))
            } else {
                Ok(())
            }
        };
        check_nonempty("model", self.models.len())?;
        check_nonempty("prompt", self.prompts.len())?;
        check_nonempty("context", self.contexts.len())?;
        check_nonempty("chunk_size", self.chunk_sizes.len())?;
        check_nonempty("chunk_overlap", self.chunk_overlaps.len())?;
        check_nonempty("top_k", self.top_ks.len())?;
        check_nonempty("embedding_model", self.embedding_models.len())?;

        if self.top_ks.iter().any(|&k| k == 0) {
            return Err(HarnessError::Config(
                "top_k options must be at least 1".to_string(),
            ));
        }
        if self.chunk_sizes.iter().any(|&s| s == 0) {
            return Err(HarnessError::Config(
                "chunk_size options must be at least 1".to_string(),
            ));
        }

        for rule in &self.exclude {
            if !DIMENSION_NAMES.contains(&rule.dimension.as_str()) {
                return Err(HarnessError::Config(format!(
                    "Exclusion rule references undefined dimension '{}'",
                    rule.dimension
                )));
            }
            if !self.dimension_has_option(&rule.dimension, &rule.value) {
                return Err(HarnessError::Config(format!(
                    "Exclusion rule references undefined option '{}' in dimension '{}'",
                    rule.value, rule.dimension
                )));
            }
        }

        Ok(())
    }

    fn dimension_has_option(&self, dimension: &str, value: &str) -> bool {
        match dimension {
            "model" => self.models.iter().any(|m| m == value),
            "prompt" => self.prompts.iter().any(|p| p.to_string() == value),
            "context" => self.contexts.iter().any(|c| c.to_string() == value),
            "chunk_size" => self.chunk_sizes.iter().any(|s| s.to_string() == value),
            "chunk_overlap" => self.chunk_overlaps.iter().any(|o| o.to_string() == value),
            "top_k" => self.top_ks.iter().any(|k| k.to_string() == value),
            "embedding_model" => self.embedding_models.iter().any(|m| m == value),
            _ => false,
        }
    }

    /// Expand the full Cartesian product, in declaration order.
    ///
    /// Produces exactly `cardinality()` cells; no filtering is applied.
    pub fn expand(&self) -> Result<Vec<RunConfig>> {
        self.validate()?;

        let mut cells = Vec::with_capacity(self.cardinality());
        for model in &self.models {
            for prompt in &self.prompts {
                for context in &self.contexts {
                    for &chunk_size in &self.chunk_sizes {
                        for &chunk_overlap in &self.chunk_overlaps {
                            for &top_k in &self.top_ks {
                                for embedding_model in &self.embedding_models {
                                    cells.push(RunConfig {
                                        model: model.clone(),
                                        prompt: *prompt,
                                        context: *context,
                                        chunk_size,
                                        chunk_overlap,
                                        top_k,
                                        embedding_model: embedding_model.clone(),
                                    });
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(cells)
    }

    /// Expand, then drop excluded cells and cells failing the predicate.
    ///
    /// The built-in coherence check also drops retrieval cells whose
    /// overlap is not below their chunk size.
    pub fn expand_filtered<F>(&self, predicate: F) -> Result<Vec<RunConfig>>
    where
        F: Fn(&RunConfig) -> bool,
    {
        let cells = self.expand()?;
        Ok(cells
            .into_iter()
            .filter(|cell| cell.is_coherent())
            .filter(|cell| {
                !self
                    .exclude
                    .iter()
                    .any(|rule| cell.matches_dimension(&rule.dimension, &rule.value))
            })
            .filter(|cell| predicate(cell))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_by_two_spec() -> MatrixSpec {
        MatrixSpec {
            models: vec!["model-a".to_string(), "model-b".to_string()],
            prompts: vec![PromptVariant::Naive, PromptVariant::Optimized],
            contexts: vec![ContextMode::FullText, ContextMode::Retrieval],
            chunk_sizes: vec![256, 512],
            chunk_overlaps: vec![32],
            top_ks: vec![3],
            embedding_models: vec!["embed-1".to_string()],
            exclude: Vec::new(),
        }
    }

    #[test]
    fn test_expand_cardinality() {
        let spec = two_by_two_spec();
        let cells = spec.expand().unwrap();
        assert_eq!(cells.len(), spec.cardinality());
        assert_eq!(cells.len(), 2 * 2 * 2 * 2);
    }

    #[test]
    fn test_filtering_only_removes() {
        let spec = two_by_two_spec();
        let all = spec.expand().unwrap();
        let filtered = spec
            .expand_filtered(|cell| cell.context == ContextMode::Retrieval)
            .unwrap();

        assert!(filtered.len() <= all.len());
        for cell in &filtered {
            assert!(all.contains(cell));
        }
    }

    #[test]
    fn test_exclude_rule_on_undefined_dimension() {
        let mut spec = two_by_two_spec();
        spec.exclude.push(ExcludeRule {
            dimension: "temperature".to_string(),
            value: "0.7".to_string(),
        });
        let result = spec.expand();
        assert!(matches!(result, Err(HarnessError::Config(_))));
    }

    #[test]
    fn test_exclude_rule_on_undefined_option() {
        let mut spec = two_by_two_spec();
        spec.exclude.push(ExcludeRule {
            dimension: "model".to_string(),
            value: "model-z".to_string(),
        });
        let result = spec.expand();
        assert!(matches!(result, Err(HarnessError::Config(_))));
    }

    #[test]
    fn test_exclude_rule_removes_cells() {
        let mut spec = two_by_two_spec();
        spec.exclude.push(ExcludeRule {
            dimension: "model".to_string(),
            value: "model-b".to_string(),
        });
        let filtered = spec.expand_filtered(|_| true).unwrap();
        assert!(filtered.iter().all(|cell| cell.model == "model-a"));
    }

    #[test]
    fn test_incoherent_retrieval_cells_dropped() {
        let mut spec = two_by_two_spec();
        spec.chunk_overlaps = vec![512]; // equals one of the chunk sizes
        let filtered = spec.expand_filtered(|_| true).unwrap();
        for cell in &filtered {
            assert!(cell.is_coherent());
        }
        // Full-text cells survive since chunking params are unused there.
        assert!(filtered.iter().any(|c| c.context == ContextMode::FullText));
    }

    #[test]
    fn test_run_config_id_deterministic() {
        let spec = two_by_two_spec();
        let a = spec.expand().unwrap();
        let b = spec.expand().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.id(), y.id());
        }

        // Distinct cells get distinct ids.
        let ids: std::collections::HashSet<String> = a.iter().map(|c| c.id()).collect();
        assert_eq!(ids.len(), a.len());
    }

    #[test]
    fn test_empty_dimension_is_config_error() {
        let mut spec = two_by_two_spec();
        spec.models.clear();
        assert!(matches!(spec.expand(), Err(HarnessError::Config(_))));
    }

    #[test]
    fn test_zero_top_k_rejected() {
        let mut spec = two_by_two_spec();
        spec.top_ks = vec![0];
        assert!(matches!(spec.expand(), Err(HarnessError::Config(_))));
    }
}

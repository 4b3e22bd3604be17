//! Question sets and the versioned ground-truth / contamination map.
//!
//! Ground truth is externally supplied and read-only: the harness never
//! generates or edits it. Every ground-truth set has a deterministic
//! content version; scores always record the version they were computed
//! against, so editing ground truth invalidates prior scores instead of
//! silently updating them.

use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Contamination-risk tier for a question.
///
/// High-risk questions are those a model could plausibly answer from
/// training data alone, independent of the provided documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

/// An expected citation for a ground-truth answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    /// Document id the answer comes from.
    pub document: String,
    /// 1-indexed page, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<usize>,
    /// Supporting quote, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<String>,
}

/// One weighted fact for rubric-based partial credit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RubricItem {
    /// The fact a complete answer should mention.
    pub fact: String,
    /// Numeric weight of this fact.
    pub weight: f64,
}

/// Ground truth for a single question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruthEntry {
    /// The canonical correct answer.
    pub answer: String,
    /// Accepted alternate phrasings.
    #[serde(default)]
    pub alternates: Vec<String>,
    /// Citations supporting the answer.
    #[serde(default)]
    pub citations: Vec<Citation>,
    /// Contamination-risk tier.
    pub risk: RiskTier,
    /// Weighted facts for partial credit on inference-style questions.
    #[serde(default)]
    pub rubric: Vec<RubricItem>,
}

/// The versioned ground-truth set, keyed by question id.
///
/// Entries live in a `BTreeMap` so serialization (and therefore the
/// content version) is independent of insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruthSet {
    pub entries: BTreeMap<String, GroundTruthEntry>,
}

impl GroundTruthSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Load from a JSON file.
    pub fn load_json(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| HarnessError::io(path, e))?;
        let set: GroundTruthSet = serde_json::from_str(&content)?;
        Ok(set)
    }

    /// Deterministic content version (hex sha256 of canonical JSON).
    pub fn version(&self) -> String {
        // BTreeMap keys are sorted, so this serialization is canonical.
        let canonical = serde_json::to_string(&self.entries).unwrap_or_default();
        let digest = Sha256::digest(canonical.as_bytes());
        format!("{:x}", digest)
    }

    /// Look up the entry for a question id.
    pub fn get(&self, question_id: &str) -> Option<&GroundTruthEntry> {
        self.entries.get(question_id)
    }

    /// Look up an entry, failing fast when the question has no ground truth.
    pub fn require(&self, question_id: &str) -> Result<&GroundTruthEntry> {
        self.get(question_id).ok_or_else(|| {
            HarnessError::Config(format!(
                "No ground-truth entry for question '{}'",
                question_id
            ))
        })
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for GroundTruthSet {
    fn default() -> Self {
        Self::new()
    }
}

/// A single evaluation question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    /// Unique identifier.
    pub id: String,
    /// The question text.
    pub text: String,
    /// Category tag (e.g., "extraction", "calculation", "inference").
    pub category: String,
    /// Document the question is asked against.
    pub document_id: String,
}

/// A named collection of questions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionSet {
    /// Question set name.
    pub name: String,
    /// The questions.
    pub questions: Vec<Question>,
}

impl QuestionSet {
    /// Create a new empty question set.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            questions: Vec::new(),
        }
    }

    /// Add a question.
    pub fn add(&mut self, question: Question) {
        self.questions.push(question);
    }

    /// Number of questions.
    pub fn len(&self) -> usize {
        self.questions.len()
    }

    /// Check if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    /// Get a subset of questions (for quick testing).
    pub fn take(&self, n: usize) -> Self {
        Self {
            name: self.name.clone(),
            questions: self.questions.iter().take(n).cloned().collect(),
        }
    }

    /// Load from a JSON file.
    pub fn load_json(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| HarnessError::io(path, e))?;
        let set: QuestionSet = serde_json::from_str(&content)?;
        Ok(set)
    }

    /// Save to a JSON file.
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).map_err(|e| HarnessError::io(path, e))?;
        Ok(())
    }

    /// Verify that every question has a ground-truth entry.
    pub fn validate_against(&self, ground_truth: &GroundTruthSet) -> Result<()> {
        for question in &self.questions {
            ground_truth.require(&question.id)?;
        }
        Ok(())
    }
}

/// Create a small built-in question set plus ground truth, for smoke tests.
pub fn create_sample_set() -> (QuestionSet, GroundTruthSet) {
    let mut questions = QuestionSet::new("sample");
    let mut ground_truth = GroundTruthSet::new();

    questions.add(Question {
        id: "sample_1".to_string(),
        text: "What exchange ratio do Class A shareholders receive in the merger?".to_string(),
        category: "extraction".to_string(),
        document_id: "merger-agreement".to_string(),
    });
    ground_truth.entries.insert(
        "sample_1".to_string(),
        GroundTruthEntry {
            answer: "Each Class A share converts into 0.25 shares of the acquirer".to_string(),
            alternates: vec!["0.25 shares per Class A share".to_string()],
            citations: vec![Citation {
                document: "merger-agreement".to_string(),
                page: Some(42),
                quote: None,
            }],
            risk: RiskTier::Low,
            rubric: Vec::new(),
        },
    );

    questions.add(Question {
        id: "sample_2".to_string(),
        text: "What are the main termination rights in the agreement?".to_string(),
        category: "inference".to_string(),
        document_id: "merger-agreement".to_string(),
    });
    ground_truth.entries.insert(
        "sample_2".to_string(),
        GroundTruthEntry {
            answer: "Either party may terminate on a financing failure or an outside-date lapse"
                .to_string(),
            alternates: Vec::new(),
            citations: vec![Citation {
                document: "merger-agreement".to_string(),
                page: Some(88),
                quote: None,
            }],
            risk: RiskTier::High,
            rubric: vec![
                RubricItem {
                    fact: "financing failure".to_string(),
                    weight: 0.5,
                },
                RubricItem {
                    fact: "outside date".to_string(),
                    weight: 0.5,
                },
            ],
        },
    );

    (questions, ground_truth)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_content_addressed() {
        let (_, gt) = create_sample_set();
        let v1 = gt.version();
        let v2 = gt.version();
        assert_eq!(v1, v2);

        let mut edited = gt.clone();
        edited
            .entries
            .get_mut("sample_1")
            .unwrap()
            .answer
            .push_str(" (amended)");
        assert_ne!(edited.version(), v1);
    }

    #[test]
    fn test_version_is_order_independent() {
        let (_, gt) = create_sample_set();

        // Rebuild inserting in reverse order; BTreeMap canonicalizes.
        let mut reversed = GroundTruthSet::new();
        for (id, entry) in gt.entries.iter().rev() {
            reversed.entries.insert(id.clone(), entry.clone());
        }
        assert_eq!(gt.version(), reversed.version());
    }

    #[test]
    fn test_require_missing_entry() {
        let gt = GroundTruthSet::new();
        let result = gt.require("q99");
        assert!(matches!(result, Err(HarnessError::Config(_))));
    }

    #[test]
    fn test_validate_against() {
        let (questions, gt) = create_sample_set();
        assert!(questions.validate_against(&gt).is_ok());

        let mut extra = questions.clone();
        extra.add(Question {
            id: "orphan".to_string(),
            text: "?".to_string(),
            category: "extraction".to_string(),
            document_id: "merger-agreement".to_string(),
        });
        assert!(extra.validate_against(&gt).is_err());
    }

    #[test]
    fn test_take_subset() {
        let (questions, _) = create_sample_set();
        assert_eq!(questions.len(), 2);
        assert_eq!(questions.take(1).len(), 1);
    }
}

//! Scoring run records against versioned ground truth.
//!
//! Scoring is a pure function of (record, question set, ground truth):
//! re-scoring an unchanged record yields identical verdicts. Every eval
//! record stores the ground-truth version it was computed against, so
//! editing ground truth invalidates prior scores instead of silently
//! changing them.
//!
//! Failed questions are never folded into accuracy as wrong answers.
//! Accuracy is computed over answered questions only, with failure and
//! abstention counts reported separately.

use crate::embedding::Embedder;
use crate::error::{BackendErrorKind, HarnessError, Result};
use crate::matrix::ContextMode;
use crate::prompt::ABSTAIN_MARKER;
use crate::question::{GroundTruthEntry, GroundTruthSet, Question, QuestionSet, RiskTier};
use crate::retriever::cosine_similarity;
use crate::runner::{QuestionOutcome, RunRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// How an answer is matched against ground truth.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ScoringMode {
    /// Normalized text equality against the answer or an alternate.
    Exact,
    /// Normalized containment of the answer or an alternate.
    Containment,
    /// Embedding cosine similarity above a threshold.
    Semantic { threshold: f32 },
}

/// Verdict for one answered question.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "credit")]
pub enum Verdict {
    Exact,
    /// Rubric-based partial credit in (0, 1).
    Partial(f64),
    Incorrect,
    /// The response declared insufficient evidence.
    Abstained,
}

impl Verdict {
    /// Credit contributed to accuracy.
    pub fn credit(&self) -> f64 {
        match self {
            Verdict::Exact => 1.0,
            Verdict::Partial(credit) => *credit,
            Verdict::Incorrect => 0.0,
            Verdict::Abstained => 0.0,
        }
    }
}

/// Score for one question within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionScore {
    pub question_id: String,
    pub category: String,
    pub risk: RiskTier,
    /// Absent when the question failed at the backend.
    pub verdict: Option<Verdict>,
    /// Failure kind for questions with no verdict.
    pub failure: Option<BackendErrorKind>,
    /// 0 = no citation, 1 = correct document, 2 = page or quote level.
    pub citation_level: u8,
}

/// Accuracy and counts for one slice of the question set.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GroupStats {
    pub questions: usize,
    pub answered: usize,
    pub accuracy: f64,
}

/// Run-level aggregates.
///
/// High-contamination-risk questions stay in the overall numbers and are
/// additionally broken out per tier, so a contamination-driven score
/// inflation is visible in the comparison rather than hidden by removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aggregates {
    pub total_questions: usize,
    /// Questions with a non-abstained verdict.
    pub answered: usize,
    pub abstained: usize,
    pub failed_transient_exhausted: usize,
    pub failed_fatal: usize,
    /// Mean credit over answered questions. Zero when none answered.
    pub accuracy: f64,
    /// Fraction of answered questions citing at least the right document.
    pub citation_rate: f64,
    pub per_category: BTreeMap<String, GroupStats>,
    pub per_risk: BTreeMap<RiskTier, GroupStats>,
}

/// The scored result of one run, pinned to a ground-truth version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalRecord {
    pub run_id: String,
    pub ground_truth_version: String,
    pub scoring_mode: ScoringMode,
    pub scored_at: DateTime<Utc>,
    pub scores: Vec<QuestionScore>,
    pub aggregates: Aggregates,
}

impl EvalRecord {
    /// Whether this eval is still valid against the given ground truth.
    pub fn is_valid_for(&self, ground_truth: &GroundTruthSet) -> bool {
        self.ground_truth_version == ground_truth.version()
    }
}

/// Lowercase, strip punctuation, collapse whitespace.
fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = true;
    for c in text.chars() {
        if c.is_alphanumeric() {
            for lower in c.to_lowercase() {
                out.push(lower);
            }
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Scores run records against ground truth.
pub struct Scorer {
    mode: ScoringMode,
    /// Present only in semantic mode.
    semantic: Option<(Arc<Embedder>, String)>,
}

impl Scorer {
    /// Exact-match scorer.
    pub fn exact() -> Self {
        Self {
            mode: ScoringMode::Exact,
            semantic: None,
        }
    }

    /// Containment scorer (the answer must appear in the response).
    pub fn containment() -> Self {
        Self {
            mode: ScoringMode::Containment,
            semantic: None,
        }
    }

    /// Semantic scorer using embedding similarity.
    pub fn semantic(embedder: Arc<Embedder>, embedding_model: &str, threshold: f32) -> Self {
        Self {
            mode: ScoringMode::Semantic { threshold },
            semantic: Some((embedder, embedding_model.to_string())),
        }
    }

    /// Score every outcome in the record. Fails fast when a question in
    /// the record has no ground-truth entry or is unknown to the set.
    pub async fn score(
        &self,
        record: &RunRecord,
        questions: &QuestionSet,
        ground_truth: &GroundTruthSet,
    ) -> Result<EvalRecord> {
        let by_id: HashMap<&str, &Question> = questions
            .questions
            .iter()
            .map(|q| (q.id.as_str(), q))
            .collect();

        let mut scores = Vec::with_capacity(record.outcomes.len());
        for outcome in &record.outcomes {
            let question = by_id.get(outcome.question_id.as_str()).copied().ok_or_else(|| {
                HarnessError::Config(format!(
                    "Run record references unknown question '{}'",
                    outcome.question_id
                ))
            })?;
            let entry = ground_truth.require(&outcome.question_id)?;
            scores.push(self.score_outcome(outcome, question, entry).await?);
        }

        let aggregates = aggregate(&scores);
        Ok(EvalRecord {
            run_id: record.run_id.clone(),
            ground_truth_version: ground_truth.version(),
            scoring_mode: self.mode,
            scored_at: Utc::now(),
            scores,
            aggregates,
        })
    }

    async fn score_outcome(
        &self,
        outcome: &QuestionOutcome,
        question: &Question,
        entry: &GroundTruthEntry,
    ) -> Result<QuestionScore> {
        if let Some(failure) = &outcome.failure {
            return Ok(QuestionScore {
                question_id: outcome.question_id.clone(),
                category: question.category.clone(),
                risk: entry.risk,
                verdict: None,
                failure: Some(failure.kind),
                citation_level: 0,
            });
        }

        let answer = outcome.answer.as_deref().unwrap_or_default();
        let verdict = if answer.trim().is_empty() || answer.contains(ABSTAIN_MARKER) {
            Verdict::Abstained
        } else {
            self.verdict_for(answer, entry).await?
        };

        let citation_level = if verdict == Verdict::Abstained {
            0
        } else {
            citation_level(answer, entry)
        };

        Ok(QuestionScore {
            question_id: outcome.question_id.clone(),
            category: question.category.clone(),
            risk: entry.risk,
            verdict: Some(verdict),
            failure: None,
            citation_level,
        })
    }

    async fn verdict_for(&self, answer: &str, entry: &GroundTruthEntry) -> Result<Verdict> {
        if self.matches(answer, entry).await? {
            return Ok(Verdict::Exact);
        }

        // Inference-style questions fall back to weighted fact coverage.
        if !entry.rubric.is_empty() {
            let total: f64 = entry.rubric.iter().map(|item| item.weight).sum();
            if total > 0.0 {
                let normalized = normalize(answer);
                let covered: f64 = entry
                    .rubric
                    .iter()
                    .filter(|item| normalized.contains(&normalize(&item.fact)))
                    .map(|item| item.weight)
                    .sum();
                let credit = covered / total;
                if credit >= 1.0 {
                    return Ok(Verdict::Exact);
                }
                if credit > 0.0 {
                    return Ok(Verdict::Partial(credit));
                }
            }
        }

        Ok(Verdict::Incorrect)
    }

    async fn matches(&self, answer: &str, entry: &GroundTruthEntry) -> Result<bool> {
        let mut candidates = std::iter::once(&entry.answer).chain(entry.alternates.iter());

        match self.mode {
            ScoringMode::Exact => {
                let normalized = normalize(answer);
                Ok(candidates.any(|c| normalize(c) == normalized))
            }
            ScoringMode::Containment => {
                let normalized = normalize(answer);
                Ok(candidates.any(|c| normalized.contains(&normalize(c))))
            }
            ScoringMode::Semantic { threshold } => {
                let (embedder, model) = self.semantic.as_ref().ok_or_else(|| {
                    HarnessError::Config("Semantic scoring requires an embedder".to_string())
                })?;
                let answer_vec = embedder.embed_query(answer, model).await?;
                for candidate in candidates {
                    let candidate_vec = embedder.embed_query(candidate, model).await?;
                    if cosine_similarity(&answer_vec, &candidate_vec) >= threshold {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

/// Citation level of a response against the expected citations.
///
/// Level 1 requires naming the right document; level 2 additionally
/// requires the right page number or the supporting quote.
fn citation_level(answer: &str, entry: &GroundTruthEntry) -> u8 {
    let normalized = normalize(answer);
    let mut level = 0;
    for citation in &entry.citations {
        if !normalized.contains(&normalize(&citation.document)) {
            continue;
        }
        level = level.max(1);

        let page_hit = citation
            .page
            .map(|p| normalized.contains(&format!("page {}", p)))
            .unwrap_or(false);
        let quote_hit = citation
            .quote
            .as_deref()
            .map(|q| normalized.contains(&normalize(q)))
            .unwrap_or(false);
        if page_hit || quote_hit {
            return 2;
        }
    }
    level
}

fn aggregate(scores: &[QuestionScore]) -> Aggregates {
    let mut answered = 0usize;
    let mut abstained = 0usize;
    let mut failed_transient = 0usize;
    let mut failed_fatal = 0usize;
    let mut credit_sum = 0.0f64;
    let mut cited = 0usize;

    struct GroupAcc {
        questions: usize,
        answered: usize,
        credit: f64,
    }
    let mut per_category: BTreeMap<String, GroupAcc> = BTreeMap::new();
    let mut per_risk: BTreeMap<RiskTier, GroupAcc> = BTreeMap::new();

    for score in scores {
        let category = per_category.entry(score.category.clone()).or_insert(GroupAcc {
            questions: 0,
            answered: 0,
            credit: 0.0,
        });
        category.questions += 1;
        let risk = per_risk.entry(score.risk).or_insert(GroupAcc {
            questions: 0,
            answered: 0,
            credit: 0.0,
        });
        risk.questions += 1;

        match (&score.verdict, &score.failure) {
            (Some(Verdict::Abstained), _) => abstained += 1,
            (Some(verdict), _) => {
                answered += 1;
                credit_sum += verdict.credit();
                if score.citation_level >= 1 {
                    cited += 1;
                }
                category.answered += 1;
                category.credit += verdict.credit();
                risk.answered += 1;
                risk.credit += verdict.credit();
            }
            (None, Some(BackendErrorKind::Transient)) => failed_transient += 1,
            (None, _) => failed_fatal += 1,
        }
    }

    let ratio = |num: f64, den: usize| if den > 0 { num / den as f64 } else { 0.0 };
    let finish = |acc: GroupAcc| GroupStats {
        questions: acc.questions,
        answered: acc.answered,
        accuracy: ratio(acc.credit, acc.answered),
    };

    Aggregates {
        total_questions: scores.len(),
        answered,
        abstained,
        failed_transient_exhausted: failed_transient,
        failed_fatal,
        accuracy: ratio(credit_sum, answered),
        citation_rate: ratio(cited as f64, answered),
        per_category: per_category.into_iter().map(|(k, v)| (k, finish(v))).collect(),
        per_risk: per_risk.into_iter().map(|(k, v)| (k, finish(v))).collect(),
    }
}

/// Render a comparison table across scored runs, one row per cell.
pub fn format_comparison(rows: &[(String, ContextMode, &Aggregates)]) -> String {
    let mut out = String::from(
        "| Run | Context | Accuracy | Answered | Abstained | Failed | Citation Rate |\n\
         |-----|---------|----------|----------|-----------|--------|---------------|\n",
    );
    for (run_id, context, agg) in rows {
        out.push_str(&format!(
            "| {} | {} | {:.3} | {}/{} | {} | {} | {:.3} |\n",
            run_id,
            context,
            agg.accuracy,
            agg.answered,
            agg.total_questions,
            agg.abstained,
            agg.failed_transient_exhausted + agg.failed_fatal,
            agg.citation_rate,
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TokenUsage;
    use crate::matrix::{PromptVariant, RunConfig};
    use crate::question::create_sample_set;
    use crate::runner::{FailureRecord, OutcomeSummary};

    fn outcome(question_id: &str, answer: Option<&str>) -> QuestionOutcome {
        QuestionOutcome {
            question_id: question_id.to_string(),
            answer: answer.map(str::to_string),
            failure: answer.is_none().then(|| FailureRecord {
                kind: BackendErrorKind::Fatal,
                message: "invalid request".to_string(),
            }),
            usage: TokenUsage::default(),
            latency_ms: 10,
            retrieved: Vec::new(),
        }
    }

    fn record(outcomes: Vec<QuestionOutcome>) -> RunRecord {
        let config = RunConfig {
            model: "model-a".to_string(),
            prompt: PromptVariant::Optimized,
            context: ContextMode::FullText,
            chunk_size: 512,
            chunk_overlap: 50,
            top_k: 3,
            embedding_model: "embed-1".to_string(),
        };
        RunRecord {
            run_id: format!("{}-test", config.id()),
            config,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            complete: true,
            outcomes,
            summary: OutcomeSummary::default(),
        }
    }

    #[tokio::test]
    async fn test_containment_and_failure_exclusion() {
        let (questions, gt) = create_sample_set();
        let record = record(vec![
            outcome(
                "sample_1",
                Some("The agreement provides 0.25 shares per Class A share (page 42)."),
            ),
            outcome("sample_2", None),
        ]);

        let eval = Scorer::containment()
            .score(&record, &questions, &gt)
            .await
            .unwrap();

        // Accuracy over the one answered question, not counting the
        // failed one as wrong.
        assert_eq!(eval.aggregates.answered, 1);
        assert_eq!(eval.aggregates.failed_fatal, 1);
        assert!((eval.aggregates.accuracy - 1.0).abs() < 1e-9);

        let failed = &eval.scores[1];
        assert!(failed.verdict.is_none());
        assert_eq!(failed.failure, Some(BackendErrorKind::Fatal));
    }

    #[tokio::test]
    async fn test_exact_requires_full_normalized_match() {
        let (questions, gt) = create_sample_set();
        let record = record(vec![outcome(
            "sample_1",
            Some("0.25 shares per Class A share"),
        )]);

        let eval = Scorer::exact().score(&record, &questions, &gt).await.unwrap();
        assert_eq!(eval.scores[0].verdict, Some(Verdict::Exact));

        // Extra prose breaks exact match but not containment.
        let wrapped = self::record(vec![outcome(
            "sample_1",
            Some("The answer is 0.25 shares per Class A share."),
        )]);
        let eval = Scorer::exact().score(&wrapped, &questions, &gt).await.unwrap();
        assert_eq!(eval.scores[0].verdict, Some(Verdict::Incorrect));
        let eval = Scorer::containment()
            .score(&wrapped, &questions, &gt)
            .await
            .unwrap();
        assert_eq!(eval.scores[0].verdict, Some(Verdict::Exact));
    }

    #[tokio::test]
    async fn test_later_alternates_are_considered() {
        let (questions, mut gt) = create_sample_set();
        gt.entries
            .get_mut("sample_1")
            .unwrap()
            .alternates
            .push("one quarter of an acquirer share".to_string());

        // Matches neither the canonical answer nor the first alternate.
        let record = record(vec![outcome(
            "sample_1",
            Some("One quarter of an acquirer share"),
        )]);
        let eval = Scorer::exact().score(&record, &questions, &gt).await.unwrap();
        assert_eq!(eval.scores[0].verdict, Some(Verdict::Exact));
    }

    #[tokio::test]
    async fn test_rubric_partial_credit() {
        let (questions, gt) = create_sample_set();
        // Mentions one of the two weighted facts.
        let record = record(vec![outcome(
            "sample_2",
            Some("Termination is permitted on a financing failure."),
        )]);

        let eval = Scorer::containment()
            .score(&record, &questions, &gt)
            .await
            .unwrap();
        match eval.scores[0].verdict {
            Some(Verdict::Partial(credit)) => assert!((credit - 0.5).abs() < 1e-9),
            other => panic!("expected partial credit, got {:?}", other),
        }
        assert!((eval.aggregates.accuracy - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_abstention_excluded_from_accuracy() {
        let (questions, gt) = create_sample_set();
        let record = record(vec![
            outcome("sample_1", Some("0.25 shares per Class A share")),
            outcome("sample_2", Some("INSUFFICIENT EVIDENCE")),
        ]);

        let eval = Scorer::containment()
            .score(&record, &questions, &gt)
            .await
            .unwrap();
        assert_eq!(eval.aggregates.answered, 1);
        assert_eq!(eval.aggregates.abstained, 1);
        assert!((eval.aggregates.accuracy - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_citation_levels() {
        let (questions, gt) = create_sample_set();
        let record = record(vec![
            outcome("sample_1", Some("0.25 shares per Class A share")),
            outcome(
                "sample_2",
                Some("Financing failure and outside date, per merger-agreement page 88."),
            ),
        ]);

        let eval = Scorer::containment()
            .score(&record, &questions, &gt)
            .await
            .unwrap();
        assert_eq!(eval.scores[0].citation_level, 0);
        assert_eq!(eval.scores[1].citation_level, 2);
        assert!((eval.aggregates.citation_rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_risk_tiers_broken_out_but_kept_in_overall() {
        let (questions, gt) = create_sample_set();
        let record = record(vec![
            outcome("sample_1", Some("0.25 shares per Class A share")),
            outcome("sample_2", Some("completely wrong")),
        ]);

        let eval = Scorer::containment()
            .score(&record, &questions, &gt)
            .await
            .unwrap();

        // Overall accuracy includes the high-risk question.
        assert!((eval.aggregates.accuracy - 0.5).abs() < 1e-9);
        let low = &eval.aggregates.per_risk[&RiskTier::Low];
        let high = &eval.aggregates.per_risk[&RiskTier::High];
        assert!((low.accuracy - 1.0).abs() < 1e-9);
        assert!(high.accuracy.abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_scoring_is_idempotent() {
        let (questions, gt) = create_sample_set();
        let record = record(vec![outcome(
            "sample_1",
            Some("0.25 shares per Class A share"),
        )]);

        let scorer = Scorer::containment();
        let first = scorer.score(&record, &questions, &gt).await.unwrap();
        let second = scorer.score(&record, &questions, &gt).await.unwrap();
        assert_eq!(first.scores[0].verdict, second.scores[0].verdict);
        assert_eq!(first.aggregates.accuracy, second.aggregates.accuracy);
        assert_eq!(first.ground_truth_version, second.ground_truth_version);
    }

    #[tokio::test]
    async fn test_ground_truth_edit_invalidates_eval() {
        let (questions, gt) = create_sample_set();
        let record = record(vec![outcome(
            "sample_1",
            Some("0.25 shares per Class A share"),
        )]);

        let eval = Scorer::containment()
            .score(&record, &questions, &gt)
            .await
            .unwrap();
        assert!(eval.is_valid_for(&gt));

        let mut edited = gt.clone();
        edited
            .entries
            .get_mut("sample_1")
            .unwrap()
            .answer
            .push_str(" (amended)");
        assert!(!eval.is_valid_for(&edited));
    }

    #[tokio::test]
    async fn test_missing_ground_truth_fails_fast() {
        let (mut questions, gt) = create_sample_set();
        questions.add(crate::question::Question {
            id: "orphan".to_string(),
            text: "?".to_string(),
            category: "extraction".to_string(),
            document_id: "merger-agreement".to_string(),
        });
        let record = record(vec![outcome("orphan", Some("anything"))]);

        let result = Scorer::containment().score(&record, &questions, &gt).await;
        assert!(matches!(result, Err(HarnessError::Config(_))));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  The Ratio, is 0.25!  "), "the ratio is 0 25");
        assert_eq!(normalize(""), "");
    }
}

//! Executes one run configuration against the question set.
//!
//! Questions run concurrently under a semaphore-bounded worker pool so
//! network-bound model calls overlap; chunking, retrieval, and scoring
//! stay synchronous. A question's failure is recorded inline with an
//! explicit marker and never aborts sibling questions. Runs can be
//! cancelled cooperatively: in-flight questions drain, unstarted ones
//! are skipped, and the partial record is marked incomplete.

use crate::backend::{ModelBackend, ModelParams, TokenUsage};
use crate::chunker::{ChunkConfig, chunk_text};
use crate::config::Config;
use crate::costs::{CostEntry, RunCosts};
use crate::document::DocumentStore;
use crate::embedding::{Embedder, EmbeddedChunkSet};
use crate::error::{BackendErrorKind, HarnessError, Result};
use crate::matrix::{ContextMode, RunConfig};
use crate::prompt::PromptRenderer;
use crate::question::{Question, QuestionSet};
use crate::retriever::{RetrievedChunk, top_k};
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Cooperative cancellation flag shared with a running cell.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. In-flight questions drain; unstarted ones
    /// are skipped.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Explicit failure marker recorded in place of an answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: BackendErrorKind,
    pub message: String,
}

/// Reference to a retrieved chunk, persisted alongside the response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunkRef {
    pub chunk_index: usize,
    pub start: usize,
    pub end: usize,
    pub score: f32,
}

impl From<&RetrievedChunk> for RetrievedChunkRef {
    fn from(retrieved: &RetrievedChunk) -> Self {
        Self {
            chunk_index: retrieved.chunk.index,
            start: retrieved.chunk.start,
            end: retrieved.chunk.end,
            score: retrieved.score,
        }
    }
}

/// Outcome of one question within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionOutcome {
    pub question_id: String,
    /// Raw response text; absent when the question failed.
    pub answer: Option<String>,
    /// Explicit failure marker; absent when the question succeeded.
    pub failure: Option<FailureRecord>,
    pub usage: TokenUsage,
    pub latency_ms: u64,
    /// Chunks supplied as context (retrieval cells only).
    #[serde(default)]
    pub retrieved: Vec<RetrievedChunkRef>,
}

impl QuestionOutcome {
    fn failed(question_id: &str, err: &HarnessError) -> Self {
        let kind = match err {
            HarnessError::Backend { kind, .. } => *kind,
            _ => BackendErrorKind::Fatal,
        };
        Self {
            question_id: question_id.to_string(),
            answer: None,
            failure: Some(FailureRecord {
                kind,
                message: err.to_string(),
            }),
            usage: TokenUsage::default(),
            latency_ms: 0,
            retrieved: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// Question counts surfaced in every run summary. Failures are always
/// reported separately, never blended into a score.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OutcomeSummary {
    pub succeeded: usize,
    pub failed_transient_exhausted: usize,
    pub failed_fatal: usize,
    /// Questions skipped because the run was cancelled.
    pub skipped: usize,
}

/// The complete outcome of executing one RunConfig against the question
/// set. Append-only: repeated runs of the same config get new run ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Config id plus start timestamp; unique per execution.
    pub run_id: String,
    pub config: RunConfig,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// False when the run was cancelled before all questions finished.
    pub complete: bool,
    /// Outcomes sorted by question id; execution order is irrelevant.
    pub outcomes: Vec<QuestionOutcome>,
    pub summary: OutcomeSummary,
}

impl RunRecord {
    /// Whether any question ended with a fatal (non-retryable) failure.
    pub fn had_fatal_failure(&self) -> bool {
        self.summary.failed_fatal > 0
    }

    /// Cost entries for the answered questions.
    pub fn costs(&self) -> RunCosts {
        let entries: Vec<CostEntry> = self
            .outcomes
            .iter()
            .filter(|o| o.succeeded())
            .map(|o| CostEntry::new(&o.question_id, &self.config.model, o.usage, o.latency_ms))
            .collect();
        RunCosts::aggregate(&self.run_id, &self.config.model, entries)
    }
}

fn make_run_id(config: &RunConfig, started_at: DateTime<Utc>) -> String {
    format!(
        "{}-{}",
        config.id(),
        started_at.format("%Y%m%dT%H%M%S%3fZ")
    )
}

/// Executes run configurations against a question set.
pub struct Runner {
    model: Arc<dyn ModelBackend>,
    embedder: Arc<Embedder>,
    renderer: PromptRenderer,
    params: ModelParams,
    retry: RetryPolicy,
    semaphore: Arc<Semaphore>,
}

impl Runner {
    /// Create a runner from backends and harness configuration.
    pub fn new(model: Arc<dyn ModelBackend>, embedder: Arc<Embedder>, config: &Config) -> Self {
        Self {
            model,
            embedder,
            renderer: PromptRenderer::new(config.execution.context_budget_chars),
            params: ModelParams {
                max_tokens: config.backend.max_tokens,
                temperature: config.backend.temperature,
            },
            retry: RetryPolicy::new(&config.retry),
            semaphore: Arc::new(Semaphore::new(config.execution.max_in_flight)),
        }
    }

    /// Execute one cell against the full question set.
    pub async fn execute(
        &self,
        config: &RunConfig,
        questions: &QuestionSet,
        documents: &DocumentStore,
        cancel: &CancelFlag,
    ) -> Result<RunRecord> {
        let started_at = Utc::now();
        let run_id = make_run_id(config, started_at);
        tracing::info!(run_id = %run_id, cell = %config, "executing run");

        // Chunk and embed each referenced document once, up front.
        // Chunking is pure; embedding goes through the shared cache.
        let chunk_sets = if config.uses_retrieval() {
            self.prepare_chunk_sets(config, questions, documents).await?
        } else {
            HashMap::new()
        };

        let mut tasks: JoinSet<Option<QuestionOutcome>> = JoinSet::new();
        let mut task_questions: HashMap<tokio::task::Id, String> = HashMap::new();

        for question in &questions.questions {
            let document_text = match config.context {
                ContextMode::FullText => {
                    Some(documents.require(&question.document_id)?.text.clone())
                }
                _ => None,
            };
            let chunk_set = chunk_sets.get(&question.document_id).cloned();

            let worker = QuestionWorker {
                model: self.model.clone(),
                embedder: self.embedder.clone(),
                renderer: self.renderer,
                params: self.params,
                retry: self.retry,
                config: config.clone(),
                question: question.clone(),
                document_text,
                chunk_set,
            };

            let semaphore = self.semaphore.clone();
            let cancel = cancel.clone();
            let handle = tasks.spawn(async move {
                // Queue behind the in-flight limit (backpressure, not failure).
                let _permit = semaphore.acquire_owned().await.ok()?;
                if cancel.is_cancelled() {
                    return None;
                }
                Some(worker.run().await)
            });
            task_questions.insert(handle.id(), question.id.clone());
        }

        let total_questions = questions.len();
        let mut outcomes = Vec::with_capacity(total_questions);
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, Some(outcome))) => outcomes.push(outcome),
                Ok((_, None)) => {}
                Err(err) => {
                    // A panic is a fatal failure for its question, not a
                    // cancellation skip.
                    tracing::warn!(error = %err, "question task panicked");
                    if let Some(question_id) = task_questions.get(&err.id()) {
                        outcomes.push(QuestionOutcome::failed(
                            question_id,
                            &HarnessError::fatal(format!("question task panicked: {}", err)),
                        ));
                    }
                }
            }
        }

        // Aggregation is order-independent; sort for a stable record.
        outcomes.sort_by(|a, b| a.question_id.cmp(&b.question_id));

        let mut summary = OutcomeSummary::default();
        for outcome in &outcomes {
            match &outcome.failure {
                None => summary.succeeded += 1,
                Some(f) if f.kind == BackendErrorKind::Transient => {
                    summary.failed_transient_exhausted += 1
                }
                Some(_) => summary.failed_fatal += 1,
            }
        }
        summary.skipped = total_questions - outcomes.len();

        Ok(RunRecord {
            run_id,
            config: config.clone(),
            started_at,
            finished_at: Utc::now(),
            complete: summary.skipped == 0,
            outcomes,
            summary,
        })
    }

    async fn prepare_chunk_sets(
        &self,
        config: &RunConfig,
        questions: &QuestionSet,
        documents: &DocumentStore,
    ) -> Result<HashMap<String, Arc<EmbeddedChunkSet>>> {
        let chunk_config = ChunkConfig::new(config.chunk_size, config.chunk_overlap)?;

        let mut document_ids: Vec<&String> =
            questions.questions.iter().map(|q| &q.document_id).collect();
        document_ids.sort();
        document_ids.dedup();

        let mut sets = HashMap::new();
        for document_id in document_ids {
            let document = documents.require(document_id)?;
            let chunks = chunk_text(document_id, &document.text, chunk_config)?;
            let embedded = self
                .embedder
                .embed_chunk_set(&chunks, &config.embedding_model)
                .await;
            if !embedded.failures.is_empty() {
                tracing::warn!(
                    document = %document_id,
                    failed_chunks = embedded.failures.len(),
                    "some chunks failed to embed; retrieval will use the rest"
                );
            }
            sets.insert(document_id.clone(), Arc::new(embedded));
        }
        Ok(sets)
    }
}

/// Everything one question task needs, owned so tasks are 'static.
struct QuestionWorker {
    model: Arc<dyn ModelBackend>,
    embedder: Arc<Embedder>,
    renderer: PromptRenderer,
    params: ModelParams,
    retry: RetryPolicy,
    config: RunConfig,
    question: Question,
    document_text: Option<String>,
    chunk_set: Option<Arc<EmbeddedChunkSet>>,
}

impl QuestionWorker {
    async fn run(self) -> QuestionOutcome {
        match self.attempt().await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::debug!(
                    question = %self.question.id,
                    error = %err,
                    "question failed"
                );
                QuestionOutcome::failed(&self.question.id, &err)
            }
        }
    }

    async fn attempt(&self) -> Result<QuestionOutcome> {
        let (prompt, retrieved) = self.render().await?;

        let completion = self
            .retry
            .run(&self.question.id, || {
                self.model.complete(&prompt, &self.config.model, &self.params)
            })
            .await?;

        Ok(QuestionOutcome {
            question_id: self.question.id.clone(),
            answer: Some(completion.text),
            failure: None,
            usage: completion.usage,
            latency_ms: completion.latency_ms,
            retrieved,
        })
    }

    async fn render(&self) -> Result<(String, Vec<RetrievedChunkRef>)> {
        match self.config.context {
            ContextMode::None => Ok((
                self.renderer
                    .render_closed_book(self.config.prompt, &self.question),
                Vec::new(),
            )),
            ContextMode::FullText => {
                let text = self.document_text.as_deref().unwrap_or_default();
                let document =
                    crate::document::Document::from_text(&self.question.document_id, text);
                Ok((
                    self.renderer
                        .render_full_text(self.config.prompt, &self.question, &document),
                    Vec::new(),
                ))
            }
            ContextMode::Retrieval => {
                let chunk_set = self.chunk_set.as_ref().ok_or_else(|| {
                    HarnessError::Config(format!(
                        "No chunk set prepared for document '{}'",
                        self.question.document_id
                    ))
                })?;

                let query = self
                    .embedder
                    .embed_query(&self.question.text, &self.config.embedding_model)
                    .await?;

                let retrieved = top_k(&query, chunk_set, self.config.top_k);
                let refs = retrieved.iter().map(RetrievedChunkRef::from).collect();
                Ok((
                    self.renderer
                        .render_retrieval(self.config.prompt, &self.question, &retrieved),
                    refs,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Completion, EmbeddingBackend};
    use crate::document::Document;
    use crate::embedding::EmbeddingCache;
    use crate::matrix::PromptVariant;
    use async_trait::async_trait;

    /// Scripted model backend: answers by question marker found in the
    /// prompt, fails fatally on a poison marker.
    struct ScriptedModel;

    #[async_trait]
    impl ModelBackend for ScriptedModel {
        async fn complete(
            &self,
            prompt: &str,
            _model_id: &str,
            _params: &ModelParams,
        ) -> Result<Completion> {
            if prompt.contains("FAIL_FATAL") {
                return Err(HarnessError::fatal("invalid request"));
            }
            if prompt.contains("FAIL_TRANSIENT") {
                return Err(HarnessError::transient("rate limited"));
            }
            if prompt.contains("FAIL_PANIC") {
                panic!("simulated backend bug");
            }
            Ok(Completion {
                text: "0.25 shares per Class A share".to_string(),
                usage: TokenUsage {
                    input_tokens: 100,
                    output_tokens: 20,
                },
                latency_ms: 5,
            })
        }
    }

    struct FakeEmbeddings;

    #[async_trait]
    impl EmbeddingBackend for FakeEmbeddings {
        async fn embed(&self, texts: &[String], _model_id: &str) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    fn test_runner() -> Runner {
        let mut config = Config::with_backend("https://unused.example.com", "key");
        config.retry.base_delay_ms = 1;
        let embedder = Arc::new(Embedder::new(
            Arc::new(FakeEmbeddings),
            EmbeddingCache::new(),
            RetryPolicy::none(),
        ));
        Runner::new(Arc::new(ScriptedModel), embedder, &config)
    }

    fn full_text_cell() -> RunConfig {
        RunConfig {
            model: "model-a".to_string(),
            prompt: PromptVariant::Naive,
            context: ContextMode::FullText,
            chunk_size: 512,
            chunk_overlap: 50,
            top_k: 3,
            embedding_model: "embed-1".to_string(),
        }
    }

    fn store_with(documents: Vec<Document>) -> DocumentStore {
        let mut store = DocumentStore::new();
        for doc in documents {
            store.insert(doc).unwrap();
        }
        store
    }

    fn question(id: &str, text: &str, document_id: &str) -> Question {
        Question {
            id: id.to_string(),
            text: text.to_string(),
            category: "extraction".to_string(),
            document_id: document_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_failure_isolation_between_questions() {
        let runner = test_runner();
        let store = store_with(vec![Document::from_text("doc", "The ratio is 0.25.")]);

        let mut questions = QuestionSet::new("test");
        questions.add(question("q1", "What is the exchange ratio?", "doc"));
        questions.add(question("q2", "FAIL_FATAL please", "doc"));
        questions.add(question("q3", "FAIL_TRANSIENT please", "doc"));

        let record = runner
            .execute(&full_text_cell(), &questions, &store, &CancelFlag::new())
            .await
            .unwrap();

        assert!(record.complete);
        assert_eq!(record.outcomes.len(), 3);
        assert_eq!(record.summary.succeeded, 1);
        assert_eq!(record.summary.failed_fatal, 1);
        assert_eq!(record.summary.failed_transient_exhausted, 1);

        // Outcomes sorted by question id regardless of completion order.
        let ids: Vec<&str> = record
            .outcomes
            .iter()
            .map(|o| o.question_id.as_str())
            .collect();
        assert_eq!(ids, vec!["q1", "q2", "q3"]);

        let q1 = &record.outcomes[0];
        assert!(q1.succeeded());
        assert!(q1.answer.as_deref().unwrap().contains("0.25"));

        let q2 = &record.outcomes[1];
        assert!(!q2.succeeded());
        assert_eq!(q2.failure.as_ref().unwrap().kind, BackendErrorKind::Fatal);
        assert!(q2.answer.is_none());
    }

    #[tokio::test]
    async fn test_retrieval_cell_records_chunks() {
        let runner = test_runner();
        let text = "First sentence about ratios. Second sentence about votes. \
                    Third sentence about fees. Fourth sentence about dates."
            .to_string();
        let store = store_with(vec![Document::from_text("doc", text)]);

        let mut cell = full_text_cell();
        cell.context = ContextMode::Retrieval;
        cell.chunk_size = 40;
        cell.chunk_overlap = 8;
        cell.top_k = 2;

        let mut questions = QuestionSet::new("test");
        questions.add(question("q1", "What about ratios?", "doc"));

        let record = runner
            .execute(&cell, &questions, &store, &CancelFlag::new())
            .await
            .unwrap();

        let outcome = &record.outcomes[0];
        assert!(outcome.succeeded());
        assert!(!outcome.retrieved.is_empty());
        assert!(outcome.retrieved.len() <= 2);
        for pair in outcome.retrieved.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn test_panicked_task_recorded_as_fatal_not_skipped() {
        let runner = test_runner();
        let store = store_with(vec![Document::from_text("doc", "content")]);

        let mut questions = QuestionSet::new("test");
        questions.add(question("q1", "fine", "doc"));
        questions.add(question("q2", "FAIL_PANIC please", "doc"));

        let record = runner
            .execute(&full_text_cell(), &questions, &store, &CancelFlag::new())
            .await
            .unwrap();

        // Every question is accounted for; a panic is a fatal failure,
        // not a skip, and the run is still complete.
        assert!(record.complete);
        assert_eq!(record.summary.skipped, 0);
        assert_eq!(record.summary.succeeded, 1);
        assert_eq!(record.summary.failed_fatal, 1);

        let q2 = record
            .outcomes
            .iter()
            .find(|o| o.question_id == "q2")
            .unwrap();
        assert_eq!(q2.failure.as_ref().unwrap().kind, BackendErrorKind::Fatal);
        assert!(q2.failure.as_ref().unwrap().message.contains("panicked"));
    }

    #[tokio::test]
    async fn test_cancelled_run_is_partial_and_marked() {
        let runner = test_runner();
        let store = store_with(vec![Document::from_text("doc", "content")]);

        let mut questions = QuestionSet::new("test");
        questions.add(question("q1", "anything", "doc"));
        questions.add(question("q2", "anything else", "doc"));

        let cancel = CancelFlag::new();
        cancel.cancel();

        let record = runner
            .execute(&full_text_cell(), &questions, &store, &cancel)
            .await
            .unwrap();

        assert!(!record.complete);
        assert_eq!(record.summary.skipped, 2);
        assert!(record.outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_costs_cover_answered_questions_only() {
        let runner = test_runner();
        let store = store_with(vec![Document::from_text("doc", "content")]);

        let mut questions = QuestionSet::new("test");
        questions.add(question("q1", "fine", "doc"));
        questions.add(question("q2", "FAIL_FATAL", "doc"));

        let record = runner
            .execute(&full_text_cell(), &questions, &store, &CancelFlag::new())
            .await
            .unwrap();

        let costs = record.costs();
        assert_eq!(costs.entries.len(), 1);
        assert_eq!(costs.total_input_tokens, 100);
    }

    #[test]
    fn test_run_ids_unique_per_execution() {
        let cell = full_text_cell();
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::milliseconds(5);
        assert_ne!(make_run_id(&cell, t1), make_run_id(&cell, t2));
        assert!(make_run_id(&cell, t1).starts_with(&cell.id()));
    }
}

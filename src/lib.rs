//! DocQA Harness - a matrixed evaluation harness for document QA.
//!
//! The harness runs a fixed question set against every cell of an
//! experiment matrix (model x prompt variant x context mode x chunking
//! parameters), records raw outputs durably, and scores them against
//! versioned ground truth.
//!
//! # Overview
//!
//! A single evaluation pass:
//! 1. Expands a declarative [`matrix::MatrixSpec`] into run configurations
//! 2. Executes each cell over the question set with bounded concurrency
//! 3. Persists one append-only record per run (responses, retrieved
//!    chunks, costs)
//! 4. Scores records against ground truth, pinning the ground-truth
//!    version so edits invalidate stale evals
//!
//! # Quick Start
//!
//! ```no_run
//! use docqa_harness::{
//!     config::Config,
//!     backend::{HttpEmbeddingBackend, HttpModelBackend},
//!     document::DocumentStore,
//!     embedding::{Embedder, EmbeddingCache},
//!     matrix::MatrixSpec,
//!     question::QuestionSet,
//!     recorder::RunRecorder,
//!     retry::RetryPolicy,
//!     runner::{CancelFlag, Runner},
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     config.validate()?;
//!
//!     let documents = DocumentStore::load_dir(Path::new("corpus"))?;
//!     let questions = QuestionSet::load_json(Path::new("questions.json"))?;
//!     let cells = MatrixSpec::load_yaml(Path::new("matrix.yaml"))?
//!         .expand_filtered(|_| true)?;
//!
//!     let model = Arc::new(HttpModelBackend::new(config.backend.clone()));
//!     let embeddings = Arc::new(HttpEmbeddingBackend::new(config.backend.clone()));
//!     let embedder = Arc::new(Embedder::new(
//!         embeddings,
//!         EmbeddingCache::new(),
//!         RetryPolicy::new(&config.retry),
//!     ));
//!
//!     let runner = Runner::new(model, embedder, &config);
//!     let recorder = RunRecorder::new(&config.execution.records_dir);
//!     let cancel = CancelFlag::new();
//!
//!     for cell in &cells {
//!         let record = runner.execute(cell, &questions, &documents, &cancel).await?;
//!         recorder.persist(&record)?;
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **matrix**: declarative variable grid expanded into identified cells
//! - **document / question**: the corpus and the versioned ground truth
//! - **chunker / embedding / retriever**: the retrieval context pipeline
//! - **runner**: bounded-concurrency execution with failure isolation
//! - **recorder**: atomic, append-only run storage
//! - **scorer**: verdicts and aggregates pinned to a ground-truth version

pub mod backend;
pub mod chunker;
pub mod config;
pub mod costs;
pub mod document;
pub mod embedding;
pub mod error;
pub mod matrix;
pub mod prompt;
pub mod question;
pub mod recorder;
pub mod retriever;
pub mod retry;
pub mod runner;
pub mod scorer;

// Re-export commonly used types
pub use config::Config;
pub use document::{Document, DocumentStore};
pub use error::{HarnessError, Result};
pub use matrix::{MatrixSpec, RunConfig};
pub use question::{GroundTruthSet, QuestionSet};
pub use recorder::RunRecorder;
pub use runner::{RunRecord, Runner};
pub use scorer::{EvalRecord, Scorer};

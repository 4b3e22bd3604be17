//! DocQA Harness CLI
//!
//! Runs a fixed question set against every cell of an experiment matrix,
//! records outputs durably, and scores them against versioned ground truth.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use docqa_harness::{
    backend::{HttpEmbeddingBackend, HttpModelBackend},
    config::Config,
    document::DocumentStore,
    embedding::{Embedder, EmbeddingCache},
    matrix::MatrixSpec,
    question::{GroundTruthSet, QuestionSet},
    recorder::RunRecorder,
    retry::RetryPolicy,
    runner::{CancelFlag, Runner},
    scorer::{Scorer, format_comparison},
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// DocQA Harness - matrixed evaluation for document QA
#[derive(Parser)]
#[command(name = "harness")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Expand a matrix spec and list the resulting cells
    Matrix {
        /// Path to the matrix spec (YAML)
        spec: PathBuf,
    },

    /// Execute matrix cells against the question set
    Run {
        /// Path to the matrix spec (YAML)
        spec: PathBuf,

        /// Path to the question set (JSON)
        #[arg(short, long)]
        questions: PathBuf,

        /// Directory containing the document corpus
        #[arg(short, long)]
        corpus: PathBuf,

        /// Run only the cell with this config id
        #[arg(long)]
        cell: Option<String>,

        /// Run only the first N questions (for quick testing)
        #[arg(long)]
        take: Option<usize>,
    },

    /// Score stored run records against ground truth
    Score {
        /// Path to the question set (JSON)
        #[arg(short, long)]
        questions: PathBuf,

        /// Path to the ground-truth set (JSON)
        #[arg(short, long)]
        ground_truth: PathBuf,

        /// Answer matching strategy
        #[arg(long, value_enum, default_value_t = MatchMode::Containment)]
        mode: MatchMode,

        /// Similarity threshold for semantic matching
        #[arg(long, default_value_t = 0.85)]
        threshold: f32,

        /// Embedding model for semantic matching
        #[arg(long, default_value = "text-embedding-3-small")]
        embedding_model: String,

        /// Score only this config id
        #[arg(long)]
        config_id: Option<String>,
    },

    /// Compare scored runs across the matrix
    Report {
        /// Path to the ground-truth set, to flag stale evals
        #[arg(short, long)]
        ground_truth: Option<PathBuf>,

        /// Filter runs by a dimension, e.g. --dimension context
        #[arg(long, requires = "value")]
        dimension: Option<String>,

        /// Dimension value to match, e.g. --value retrieval
        #[arg(long, requires = "dimension")]
        value: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum MatchMode {
    Exact,
    Containment,
    Semantic,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Matrix { spec } => cmd_matrix(spec),
        Commands::Run {
            spec,
            questions,
            corpus,
            cell,
            take,
        } => cmd_run(spec, questions, corpus, cell, take).await,
        Commands::Score {
            questions,
            ground_truth,
            mode,
            threshold,
            embedding_model,
            config_id,
        } => cmd_score(questions, ground_truth, mode, threshold, embedding_model, config_id).await,
        Commands::Report {
            ground_truth,
            dimension,
            value,
        } => cmd_report(ground_truth, dimension, value),
    }
}

fn cmd_matrix(spec_path: PathBuf) -> Result<()> {
    let spec = MatrixSpec::load_yaml(&spec_path).context("Failed to load matrix spec")?;
    let cells = spec
        .expand_filtered(|_| true)
        .context("Failed to expand matrix")?;

    for cell in &cells {
        println!("{}", cell);
    }
    println!(
        "\n{} cells ({} before coherence filtering and exclusions)",
        cells.len(),
        spec.cardinality()
    );
    Ok(())
}

async fn cmd_run(
    spec_path: PathBuf,
    questions_path: PathBuf,
    corpus: PathBuf,
    cell_id: Option<String>,
    take: Option<usize>,
) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let spec = MatrixSpec::load_yaml(&spec_path).context("Failed to load matrix spec")?;
    let mut cells = spec
        .expand_filtered(|_| true)
        .context("Failed to expand matrix")?;
    if let Some(id) = &cell_id {
        cells.retain(|c| &c.id() == id);
        if cells.is_empty() {
            anyhow::bail!("No cell with config id '{}' in this matrix", id);
        }
    }

    let mut questions =
        QuestionSet::load_json(&questions_path).context("Failed to load question set")?;
    if let Some(n) = take {
        questions = questions.take(n);
    }
    let documents = DocumentStore::load_dir(&corpus).context("Failed to load corpus")?;

    println!(
        "Running {} cells x {} questions over {} documents",
        cells.len(),
        questions.len(),
        documents.len()
    );

    let cache = match &config.execution.embedding_cache_path {
        Some(path) => EmbeddingCache::load(path).context("Failed to load embedding cache")?,
        None => EmbeddingCache::new(),
    };
    let model = Arc::new(HttpModelBackend::new(config.backend.clone()));
    let embeddings = Arc::new(HttpEmbeddingBackend::new(config.backend.clone()));
    let embedder = Arc::new(Embedder::new(
        embeddings,
        cache,
        RetryPolicy::new(&config.retry),
    ));

    let runner = Runner::new(model, embedder.clone(), &config);
    let recorder = RunRecorder::new(&config.execution.records_dir);

    // Ctrl-C drains in-flight questions and persists partial records.
    let cancel = CancelFlag::new();
    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancellation requested; draining in-flight questions...");
            cancel_signal.cancel();
        }
    });

    let start = Instant::now();
    let mut any_fatal = false;
    let mut failed_cells = 0usize;

    for cell in &cells {
        if cancel.is_cancelled() {
            println!("Skipping remaining cells.");
            break;
        }

        println!("\nCell {}", cell);
        // A cell-level failure aborts this cell only; the rest of the
        // matrix still runs.
        let record = match runner.execute(cell, &questions, &documents, &cancel).await {
            Ok(record) => record,
            Err(err) => {
                eprintln!("  Cell {} failed: {}", cell.id(), err);
                failed_cells += 1;
                continue;
            }
        };

        let summary = record.summary;
        println!(
            "  {} ok, {} transient-exhausted, {} fatal, {} skipped{}",
            summary.succeeded,
            summary.failed_transient_exhausted,
            summary.failed_fatal,
            summary.skipped,
            if record.complete { "" } else { " (partial)" },
        );
        let costs = record.costs();
        println!(
            "  ${:.4} total, {:.0}ms avg latency",
            costs.total_cost, costs.avg_latency_ms
        );

        any_fatal |= record.had_fatal_failure();
        match recorder.persist(&record) {
            Ok(path) => println!("  Recorded at {}", path.display()),
            Err(err) => {
                eprintln!("  Failed to persist run record: {}", err);
                failed_cells += 1;
            }
        }
    }

    if let Some(path) = &config.execution.embedding_cache_path {
        embedder
            .cache()
            .save(path)
            .await
            .context("Failed to save embedding cache")?;
    }

    println!("\nDone in {:.2?}", start.elapsed());

    if any_fatal || failed_cells > 0 {
        if failed_cells > 0 {
            eprintln!("{} cells failed to run or persist.", failed_cells);
        }
        if any_fatal {
            eprintln!("One or more questions failed fatally.");
        }
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_score(
    questions_path: PathBuf,
    ground_truth_path: PathBuf,
    mode: MatchMode,
    threshold: f32,
    embedding_model: String,
    config_id: Option<String>,
) -> Result<()> {
    let questions =
        QuestionSet::load_json(&questions_path).context("Failed to load question set")?;
    let ground_truth =
        GroundTruthSet::load_json(&ground_truth_path).context("Failed to load ground truth")?;
    questions
        .validate_against(&ground_truth)
        .context("Question set has entries without ground truth")?;

    let config = Config::load().context("Failed to load configuration")?;
    let recorder = RunRecorder::new(&config.execution.records_dir);

    let scorer = match mode {
        MatchMode::Exact => Scorer::exact(),
        MatchMode::Containment => Scorer::containment(),
        MatchMode::Semantic => {
            config.validate().context("Semantic scoring needs backend access")?;
            let embeddings = Arc::new(HttpEmbeddingBackend::new(config.backend.clone()));
            let embedder = Arc::new(Embedder::new(
                embeddings,
                EmbeddingCache::new(),
                RetryPolicy::new(&config.retry),
            ));
            Scorer::semantic(embedder, &embedding_model, threshold)
        }
    };

    let mut runs = recorder.list().context("Failed to list run records")?;
    if let Some(id) = &config_id {
        runs.retain(|r| &r.config_id == id);
    }
    runs.retain(|r| !r.has_eval);

    if runs.is_empty() {
        println!("No unscored runs found.");
        return Ok(());
    }

    for stored in &runs {
        let record = recorder.load(&stored.config_id, &stored.run_id)?;
        let eval = scorer
            .score(&record, &questions, &ground_truth)
            .await
            .with_context(|| format!("Failed to score run '{}'", stored.run_id))?;

        println!(
            "{}: accuracy {:.3} over {}/{} answered ({} abstained, {} failed)",
            stored.run_id,
            eval.aggregates.accuracy,
            eval.aggregates.answered,
            eval.aggregates.total_questions,
            eval.aggregates.abstained,
            eval.aggregates.failed_transient_exhausted + eval.aggregates.failed_fatal,
        );
        recorder.attach_eval(&stored.config_id, &stored.run_id, &eval)?;
    }

    println!(
        "\nScored {} runs against ground truth {}",
        runs.len(),
        &ground_truth.version()[..12]
    );
    Ok(())
}

fn cmd_report(
    ground_truth_path: Option<PathBuf>,
    dimension: Option<String>,
    value: Option<String>,
) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    let recorder = RunRecorder::new(&config.execution.records_dir);

    let ground_truth = ground_truth_path
        .map(|p| GroundTruthSet::load_json(&p))
        .transpose()
        .context("Failed to load ground truth")?;

    let runs = match (&dimension, &value) {
        (Some(dim), Some(val)) => recorder.filter(dim, val)?,
        _ => recorder.list()?,
    };

    let mut evals = Vec::new();
    let mut stale = 0usize;
    for stored in &runs {
        let Some(eval) = recorder.load_eval(&stored.config_id, &stored.run_id)? else {
            continue;
        };
        if let Some(gt) = &ground_truth {
            if !eval.is_valid_for(gt) {
                stale += 1;
                continue;
            }
        }
        evals.push((stored.run_id.clone(), stored.config.context, eval));
    }
    let rows: Vec<_> = evals
        .iter()
        .map(|(run_id, context, eval)| (run_id.clone(), *context, &eval.aggregates))
        .collect();

    if rows.is_empty() {
        println!("No scored runs to report.");
    } else {
        println!("{}", format_comparison(&rows));
    }
    if stale > 0 {
        println!(
            "{} evals skipped: scored against an older ground-truth version. Re-run 'score'.",
            stale
        );
    }
    Ok(())
}

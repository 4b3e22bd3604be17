//! Durable, append-only storage of run records.
//!
//! Each run lands under `<root>/<config_id>/<run_id>/` as a set of JSON
//! files. Writes are atomic: the directory is staged under a scratch
//! path and moved into place with a single rename, so a crash mid-write
//! never leaves a half-visible record. Existing records are never
//! overwritten; repeated runs of the same cell accumulate side by side.

use crate::error::{HarnessError, Result};
use crate::matrix::RunConfig;
use crate::runner::{QuestionOutcome, RetrievedChunkRef, RunRecord};
use crate::scorer::EvalRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.json";
const RESPONSES_FILE: &str = "responses.json";
const RETRIEVED_FILE: &str = "retrieved-chunks.json";
const COSTS_FILE: &str = "costs.json";
const EVAL_FILE: &str = "eval.json";
const STAGING_DIR: &str = ".staging";

/// Everything from a run record except the config and retrieved chunks,
/// which get their own files.
#[derive(Debug, Serialize, Deserialize)]
struct ResponsesFile {
    run_id: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    complete: bool,
    summary: crate::runner::OutcomeSummary,
    outcomes: Vec<QuestionOutcome>,
}

/// A stored run found on disk.
#[derive(Debug, Clone)]
pub struct StoredRun {
    pub config_id: String,
    pub run_id: String,
    pub config: RunConfig,
    pub complete: bool,
    pub has_eval: bool,
    pub path: PathBuf,
}

/// Writes and reads run records under a root directory.
pub struct RunRecorder {
    root: PathBuf,
}

impl RunRecorder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, config_id: &str, run_id: &str) -> PathBuf {
        self.root.join(config_id).join(run_id)
    }

    /// Persist a run record atomically. Fails with a storage error when
    /// a record with the same run id already exists.
    pub fn persist(&self, record: &RunRecord) -> Result<PathBuf> {
        let config_id = record.config.id();
        let final_dir = self.run_dir(&config_id, &record.run_id);
        if final_dir.exists() {
            return Err(HarnessError::Storage(format!(
                "Run record already exists at '{}'; records are append-only",
                final_dir.display()
            )));
        }

        let staging = self.root.join(STAGING_DIR).join(&record.run_id);
        fs::create_dir_all(&staging).map_err(|e| HarnessError::io(&staging, e))?;

        let result = self.write_files(&staging, record);
        if result.is_err() {
            let _ = fs::remove_dir_all(&staging);
            result?;
        }

        let parent = self.root.join(&config_id);
        fs::create_dir_all(&parent).map_err(|e| HarnessError::io(&parent, e))?;
        fs::rename(&staging, &final_dir).map_err(|e| {
            let _ = fs::remove_dir_all(&staging);
            HarnessError::Storage(format!(
                "Failed to move staged record into '{}': {}",
                final_dir.display(),
                e
            ))
        })?;

        tracing::info!(path = %final_dir.display(), "run record persisted");
        Ok(final_dir)
    }

    fn write_files(&self, dir: &Path, record: &RunRecord) -> Result<()> {
        write_json(&dir.join(CONFIG_FILE), &record.config)?;

        // Retrieved chunk refs live in their own file; the responses
        // file carries everything else.
        let mut outcomes = record.outcomes.clone();
        let mut retrieved: BTreeMap<String, Vec<RetrievedChunkRef>> = BTreeMap::new();
        for outcome in &mut outcomes {
            if !outcome.retrieved.is_empty() {
                retrieved.insert(
                    outcome.question_id.clone(),
                    std::mem::take(&mut outcome.retrieved),
                );
            }
        }

        let responses = ResponsesFile {
            run_id: record.run_id.clone(),
            started_at: record.started_at,
            finished_at: record.finished_at,
            complete: record.complete,
            summary: record.summary,
            outcomes,
        };
        write_json(&dir.join(RESPONSES_FILE), &responses)?;

        if record.config.uses_retrieval() {
            write_json(&dir.join(RETRIEVED_FILE), &retrieved)?;
        }
        write_json(&dir.join(COSTS_FILE), &record.costs())?;
        Ok(())
    }

    /// Load a run record back from disk.
    pub fn load(&self, config_id: &str, run_id: &str) -> Result<RunRecord> {
        let dir = self.run_dir(config_id, run_id);
        if !dir.is_dir() {
            return Err(HarnessError::RecordNotFound(dir));
        }

        let config: RunConfig = read_json(&dir.join(CONFIG_FILE))?;
        let responses: ResponsesFile = read_json(&dir.join(RESPONSES_FILE))?;

        let mut outcomes = responses.outcomes;
        let retrieved_path = dir.join(RETRIEVED_FILE);
        if retrieved_path.exists() {
            let mut retrieved: BTreeMap<String, Vec<RetrievedChunkRef>> =
                read_json(&retrieved_path)?;
            for outcome in &mut outcomes {
                if let Some(refs) = retrieved.remove(&outcome.question_id) {
                    outcome.retrieved = refs;
                }
            }
        }

        Ok(RunRecord {
            run_id: responses.run_id,
            config,
            started_at: responses.started_at,
            finished_at: responses.finished_at,
            complete: responses.complete,
            outcomes,
            summary: responses.summary,
        })
    }

    /// Attach an eval to a stored run. Evals are append-only too: a run
    /// that already has one must not be silently re-scored in place.
    pub fn attach_eval(&self, config_id: &str, run_id: &str, eval: &EvalRecord) -> Result<()> {
        let dir = self.run_dir(config_id, run_id);
        if !dir.is_dir() {
            return Err(HarnessError::RecordNotFound(dir));
        }

        let path = dir.join(EVAL_FILE);
        if path.exists() {
            return Err(HarnessError::Storage(format!(
                "Eval already exists at '{}'",
                path.display()
            )));
        }

        // Stage then rename, same discipline as the record itself.
        let tmp = dir.join(format!("{}.tmp", EVAL_FILE));
        write_json(&tmp, eval)?;
        fs::rename(&tmp, &path).map_err(|e| HarnessError::io(&path, e))?;
        Ok(())
    }

    /// Load the eval attached to a run, if any.
    pub fn load_eval(&self, config_id: &str, run_id: &str) -> Result<Option<EvalRecord>> {
        let path = self.run_dir(config_id, run_id).join(EVAL_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(read_json(&path)?))
    }

    /// List every stored run, sorted by (config id, run id).
    pub fn list(&self) -> Result<Vec<StoredRun>> {
        let mut runs = Vec::new();
        if !self.root.is_dir() {
            return Ok(runs);
        }

        let mut config_dirs = read_dirs(&self.root)?;
        config_dirs.retain(|d| d.file_name().and_then(|n| n.to_str()) != Some(STAGING_DIR));
        for config_dir in config_dirs {
            for run_dir in read_dirs(&config_dir)? {
                let config_path = run_dir.join(CONFIG_FILE);
                if !config_path.exists() {
                    continue;
                }
                let config: RunConfig = read_json(&config_path)?;
                let responses: ResponsesFile = read_json(&run_dir.join(RESPONSES_FILE))?;
                runs.push(StoredRun {
                    config_id: config.id(),
                    run_id: responses.run_id,
                    config,
                    complete: responses.complete,
                    has_eval: run_dir.join(EVAL_FILE).exists(),
                    path: run_dir,
                });
            }
        }

        runs.sort_by(|a, b| (&a.config_id, &a.run_id).cmp(&(&b.config_id, &b.run_id)));
        Ok(runs)
    }

    /// List runs whose config matches one dimension value, e.g.
    /// ("context", "retrieval") or ("model", "gpt-4o").
    pub fn filter(&self, dimension: &str, value: &str) -> Result<Vec<StoredRun>> {
        let mut runs = self.list()?;
        runs.retain(|run| run.config.matches_dimension(dimension, value));
        Ok(runs)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    fs::write(path, content).map_err(|e| HarnessError::io(path, e))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path).map_err(|e| HarnessError::io(path, e))?;
    Ok(serde_json::from_str(&content)?)
}

fn read_dirs(path: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(path).map_err(|e| HarnessError::io(path, e))? {
        let entry = entry.map_err(|e| HarnessError::io(path, e))?;
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

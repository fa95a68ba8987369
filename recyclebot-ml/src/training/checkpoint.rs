//! Checkpoint management for search trials.

use crate::error::{MlError, Result};
use crate::model::Classifier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

const MANIFEST: &str = "checkpoints.json";
const WEIGHTS: &str = "model.safetensors";

/// Saved weights of one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub trial_id: String,
    pub path: PathBuf,
    pub hash: String,
    pub size_bytes: u64,
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

/// Hex SHA-256 of a file's contents.
pub fn file_sha256(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Checkpoint manager rooted at a project directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    base_dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Where the weights of `trial_id` live.
    pub fn weights_path(&self, trial_id: &str) -> PathBuf {
        self.base_dir.join(format!("trial_{trial_id}")).join(WEIGHTS)
    }

    /// List all checkpoints in the manifest.
    pub fn list(&self) -> Result<Vec<Checkpoint>> {
        let manifest_path = self.base_dir.join(MANIFEST);
        Ok(recyclebot_core::persistence::load_json(&manifest_path)?.unwrap_or_default())
    }

    pub fn get(&self, trial_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.list()?.into_iter().find(|c| c.trial_id == trial_id))
    }

    /// Write the model's weights for `trial_id` and record them in the manifest.
    ///
    /// Saving the same trial twice replaces its earlier entry.
    pub fn save(&self, trial_id: &str, model: &Classifier, score: f64) -> Result<Checkpoint> {
        let path = self.weights_path(trial_id);
        model.save(&path)?;

        let checkpoint = Checkpoint {
            trial_id: trial_id.to_string(),
            hash: file_sha256(&path)?,
            size_bytes: std::fs::metadata(&path)?.len(),
            path,
            score,
            created_at: Utc::now(),
        };

        let mut checkpoints = self.list()?;
        checkpoints.retain(|c| c.trial_id != trial_id);
        checkpoints.push(checkpoint.clone());
        recyclebot_core::persistence::atomic_write_json(&self.base_dir.join(MANIFEST), &checkpoints)?;

        tracing::debug!(trial_id, hash = %checkpoint.hash, "Saved checkpoint");
        Ok(checkpoint)
    }

    /// Check the file on disk still matches the recorded hash.
    pub fn verify(&self, checkpoint: &Checkpoint) -> Result<bool> {
        if !checkpoint.path.exists() {
            return Err(MlError::not_found(format!(
                "checkpoint {}",
                checkpoint.path.display()
            )));
        }
        Ok(file_sha256(&checkpoint.path)? == checkpoint.hash)
    }

    /// Load a trial's weights into `model` after verifying the hash.
    pub fn restore(&self, trial_id: &str, model: &mut Classifier) -> Result<Checkpoint> {
        let checkpoint = self
            .get(trial_id)?
            .ok_or_else(|| MlError::not_found(format!("checkpoint for trial {trial_id}")))?;
        if !self.verify(&checkpoint)? {
            return Err(MlError::model(format!(
                "checkpoint for trial {trial_id} does not match its recorded hash"
            )));
        }
        model.load(&checkpoint.path)?;
        Ok(checkpoint)
    }
}

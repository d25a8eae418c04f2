//! Checkpoint loading.
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;

use candle_core::safetensors::MmapedSafetensors;
use candle_nn::var_builder::SimpleBackend;
use serde::Deserialize;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::info;

use crate::error::BoxedError;
use crate::repository::repo::Repo;

/// Name of a single-file checkpoint.
pub static SAFETENSORS_SINGLE: &str = "model.safetensors";

/// Name of the shard index of a sharded checkpoint.
pub static SAFETENSORS_INDEX: &str = "model.safetensors.index.json";

/// Extension trait for loading checkpoints from a repository.
pub trait LoadCheckpoint {
    /// Load a safetensors checkpoint.
    ///
    /// If the repository has a shard index, the shards it lists are loaded.
    /// Otherwise, a single-file checkpoint is loaded.
    fn load_checkpoint(&self) -> Result<Box<dyn SimpleBackend>, CheckpointError>;
}

/// Checkpoint loading errors.
#[derive(Debug, Snafu)]
pub enum CheckpointError {
    #[snafu(display("Cannot download checkpoint file: {name}"))]
    Download { source: BoxedError, name: String },

    #[snafu(display("Cannot open or load checkpoint"))]
    LoadCheckpoint { source: candle_core::Error },

    #[snafu(display("Checkpoint does not exist: {name}"))]
    NonExistentCheckpoint { name: String },

    #[snafu(display("Shard does not exist: {name}"))]
    NonExistentShard { name: String },

    #[snafu(display("Cannot open index file: {}", path.to_string_lossy()))]
    OpenCheckpointIndex { source: io::Error, path: PathBuf },

    #[snafu(display("Cannot parse index file: {}", path.to_string_lossy()))]
    ParseCheckpointIndex {
        source: serde_json::Error,
        path: PathBuf,
    },
}

impl<R> LoadCheckpoint for R
where
    R: Repo,
{
    fn load_checkpoint(&self) -> Result<Box<dyn SimpleBackend>, CheckpointError> {
        let checkpoint = if self.exists(SAFETENSORS_INDEX) {
            Checkpoint::Sharded(SAFETENSORS_INDEX)
        } else {
            Checkpoint::Single(SAFETENSORS_SINGLE)
        };

        let paths = checkpoint.paths(self)?;
        info!(n_files = paths.len(), "Loading checkpoint");

        Ok(Box::new(unsafe {
            MmapedSafetensors::multi(&paths).context(LoadCheckpointSnafu)?
        }))
    }
}

enum Checkpoint {
    Single(&'static str),
    Sharded(&'static str),
}

impl Checkpoint {
    fn paths(&self, repo: &impl Repo) -> Result<Vec<PathBuf>, CheckpointError> {
        match *self {
            Checkpoint::Single(name) => {
                let path = repo
                    .file(name)
                    .context(DownloadSnafu { name })?
                    .context(NonExistentCheckpointSnafu { name })?;
                Ok(vec![path])
            }
            Checkpoint::Sharded(index_name) => {
                let path = repo
                    .file(index_name)
                    .context(DownloadSnafu { name: index_name })?
                    .context(NonExistentCheckpointSnafu { name: index_name })?;

                let index_file = BufReader::new(
                    File::open(&path).context(OpenCheckpointIndexSnafu { path: path.clone() })?,
                );
                let index: CheckpointIndex = serde_json::from_reader(index_file)
                    .context(ParseCheckpointIndexSnafu { path: path.clone() })?;

                index
                    .shards()
                    .into_iter()
                    .map(|shard_name| {
                        repo.file(&shard_name)
                            .context(DownloadSnafu {
                                name: shard_name.clone(),
                            })?
                            .context(NonExistentShardSnafu { name: shard_name })
                    })
                    .collect()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct CheckpointIndex {
    weight_map: HashMap<String, String>,
}

impl CheckpointIndex {
    /// Get the names of the shards.
    fn shards(&self) -> BTreeSet<String> {
        self.weight_map.values().cloned().collect()
    }
}

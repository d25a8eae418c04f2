//! Loading and saving pretrained networks.
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use candle_core::Device;
use candle_nn::{VarBuilder, VarMap};
use snafu::{ResultExt, Snafu};
use tracing::info;

use crate::architectures::BuildArchitecture;
use crate::checkpoint::{CheckpointError, LoadCheckpoint, SAFETENSORS_SINGLE};
use crate::error::BoxedError;
use crate::models::config::NetworkConfigFile;
use crate::models::network::{Network, NetworkConfig};
use crate::repository::hf_hub::{HfHubRepo, HfHubRepoError};
use crate::repository::repo::Repo;

/// Name of the network configuration file.
pub static CONFIG_FILE: &str = "config.json";

/// Errors for loading a network from a repository.
#[derive(Debug, Snafu)]
pub enum FromRepoError {
    #[snafu(display("Cannot build network"))]
    BuildNetwork { source: BoxedError },

    #[snafu(display("Network configuration file does not exist"))]
    ConfigPath,

    #[snafu(display("Cannot convert network configuration"))]
    ConvertConfig { source: BoxedError },

    #[snafu(display("Cannot get network configuration file"))]
    GetConfig { source: BoxedError },

    #[snafu(display("Cannot open Hugging Face Hub repository"))]
    HfHubRepo { source: HfHubRepoError },

    #[snafu(display("Cannot deserialize network configuration"))]
    Json { source: serde_json::Error },

    #[snafu(display("Cannot open or load checkpoint"))]
    LoadCheckpoint { source: CheckpointError },

    #[snafu(display("Cannot open file for reading: {path:?}"))]
    Open { path: PathBuf, source: io::Error },
}

/// Errors for saving a network.
#[derive(Debug, Snafu)]
pub enum SavePretrainedError {
    #[snafu(display("Cannot create directory: {path:?}"))]
    CreateDir { path: PathBuf, source: io::Error },

    #[snafu(display("Cannot create file: {path:?}"))]
    CreateFile { path: PathBuf, source: io::Error },

    #[snafu(display("Cannot serialize network configuration"))]
    SerializeConfig { source: serde_json::Error },

    #[snafu(display("Cannot save parameters"))]
    SaveParameters { source: candle_core::Error },
}

impl NetworkConfigFile {
    /// Read the network configuration (`config.json`) of a repository.
    pub fn from_repo(repo: &impl Repo) -> Result<Self, FromRepoError> {
        let config_path = repo
            .file(CONFIG_FILE)
            .context(GetConfigSnafu)?
            .ok_or(FromRepoError::ConfigPath)?;
        let config_file = File::open(&config_path).context(OpenSnafu {
            path: config_path.clone(),
        })?;
        serde_json::from_reader(&config_file).context(JsonSnafu)
    }
}

impl Network {
    /// Load a network from a repository.
    ///
    /// The repository must contain a `config.json` network configuration
    /// and a safetensors checkpoint.
    ///
    /// * `repo` - Repository to load the network from.
    /// * `device` - The device to place the network on.
    pub fn from_repo(repo: &impl Repo, device: &Device) -> Result<Self, FromRepoError> {
        let config_file = NetworkConfigFile::from_repo(repo)?;
        Self::from_repo_config(repo, &config_file, device)
    }

    /// Load the checkpoint of a repository into a network with the
    /// given configuration.
    ///
    /// * `repo` - Repository with a safetensors checkpoint.
    /// * `config_file` - Network configuration.
    /// * `device` - The device to place the network on.
    pub fn from_repo_config(
        repo: &impl Repo,
        config_file: &NetworkConfigFile,
        device: &Device,
    ) -> Result<Self, FromRepoError> {
        let dtype = config_file.dtype();
        let config = NetworkConfig::try_from(config_file.clone()).context(ConvertConfigSnafu)?;
        let backend = repo.load_checkpoint().context(LoadCheckpointSnafu)?;
        let vb = VarBuilder::from_backend(backend, dtype, device.clone());
        let network = config.build(vb).context(BuildNetworkSnafu)?;

        info!(?dtype, n_layers = config_file.n_layers, "Loaded network");

        Ok(network)
    }

    /// Load a network from the Hugging Face Hub.
    ///
    /// * `name` - Model repository name.
    /// * `revision` - Model revision. If `None`, the main branch is used.
    /// * `device` - The device to place the network on.
    pub fn from_hf_hub(
        name: &str,
        revision: Option<&str>,
        device: &Device,
    ) -> Result<Self, FromRepoError> {
        let repo = HfHubRepo::new(name, revision).context(HfHubRepoSnafu)?;
        Self::from_repo(&repo, device)
    }
}

/// Save a network so that it can be loaded with [`Network::from_repo`].
///
/// * `dir` - Directory to save the network to, created when missing.
/// * `config` - Network configuration.
/// * `var_map` - Parameters of the network.
pub fn save_pretrained(
    dir: impl AsRef<Path>,
    config: &NetworkConfigFile,
    var_map: &VarMap,
) -> Result<(), SavePretrainedError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).context(CreateDirSnafu { path: dir })?;

    let config_path = dir.join(CONFIG_FILE);
    let config_file = File::create(&config_path).context(CreateFileSnafu {
        path: config_path.clone(),
    })?;
    serde_json::to_writer_pretty(BufWriter::new(config_file), config)
        .context(SerializeConfigSnafu)?;

    let checkpoint_path = dir.join(SAFETENSORS_SINGLE);
    var_map
        .save(&checkpoint_path)
        .context(SaveParametersSnafu)?;

    info!(dir = ?dir, n_tensors = var_map.all_vars().len(), "Saved network");

    Ok(())
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use snafu::{report, ResultExt, Whatever};

    use super::{save_pretrained, FromRepoError};
    use crate::models::config::tests::small_config_file;
    use crate::models::config::NetworkConfigFile;
    use crate::models::network::tests::small_network;
    use crate::models::network::Network;
    use crate::repository::local::LocalRepo;

    #[test]
    #[report]
    fn saved_network_loads_with_same_parameters() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir().whatever_context("Cannot create temporary directory")?;

        let var_map = VarMap::new();
        let network = small_network(VarBuilder::from_varmap(&var_map, DType::F32, &device))?;
        save_pretrained(dir.path(), &small_config_file(), &var_map)
            .whatever_context("Cannot save network")?;

        let repo = LocalRepo::new(dir.path()).whatever_context("Cannot open repository")?;
        let loaded = Network::from_repo(&repo, &device).whatever_context("Cannot load network")?;

        let features = Tensor::randn(0f32, 1., (2, 4, 12), &device)
            .whatever_context("Cannot create features")?;
        let piece_ids = Tensor::new(&[[1u32, 4, 2], [1, 3, 0]], &device)
            .whatever_context("Cannot create piece identifiers")?;
        let noise =
            Tensor::randn(0f32, 1., (2, 10), &device).whatever_context("Cannot create noise")?;

        let expected = network
            .forward_t(&features, &piece_ids, &noise, false)
            .whatever_context("Cannot apply network")?;
        let output = loaded
            .forward_t(&features, &piece_ids, &noise, false)
            .whatever_context("Cannot apply loaded network")?;

        let difference = (expected.images() - output.images())
            .and_then(|xs| xs.abs())
            .and_then(|xs| xs.max_all())
            .and_then(|xs| xs.to_scalar::<f32>())
            .whatever_context("Cannot compare images")?;
        assert!(difference < 1e-5);

        Ok(())
    }

    #[test]
    #[report]
    fn saved_config_is_read_back() -> Result<(), Whatever> {
        let dir = tempfile::tempdir().whatever_context("Cannot create temporary directory")?;
        let var_map = VarMap::new();
        small_network(VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu))?;
        let config = small_config_file();
        save_pretrained(dir.path(), &config, &var_map)
            .whatever_context("Cannot save network")?;

        let repo = LocalRepo::new(dir.path()).whatever_context("Cannot open repository")?;
        assert_eq!(
            NetworkConfigFile::from_repo(&repo).whatever_context("Cannot read configuration")?,
            config
        );

        Ok(())
    }

    #[test]
    fn missing_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let repo = LocalRepo::new(dir.path()).unwrap();
        assert!(matches!(
            Network::from_repo(&repo, &Device::Cpu),
            Err(FromRepoError::ConfigPath)
        ));
    }
}

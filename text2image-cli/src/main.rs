use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::{Args, Parser, Subcommand};
use snafu::{whatever, FromString, OptionExt, ResultExt, Whatever};
use text2image::architectures::BuildArchitecture;
use text2image::models::transformer::GreedyDecodeConfig;
use text2image::models::{save_pretrained, Network, NetworkConfig, NetworkConfigFile};
use text2image::repository::hf_hub::HfHubRepo;
use text2image::repository::local::LocalRepo;
use text2image::repository::repo::Repo;
use text2image::util::random::SeededUniform;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "text2image", version)]
#[command(about = "Caption encoder features and render images from the captions")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Save a randomly initialized network
    Init(InitArgs),

    /// Generate captions and images with a saved network
    Generate(GenerateArgs),
}

#[derive(Args)]
struct InitArgs {
    /// Directory to save the network to
    #[arg(short, long)]
    output: PathBuf,

    /// Network configuration (JSON), defaults are used when absent
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct GenerateArgs {
    /// Directory with a saved network
    #[arg(short, long, conflicts_with = "hub", required_unless_present = "hub")]
    model: Option<PathBuf>,

    /// Name of a network on the Hugging Face Hub
    #[arg(long)]
    hub: Option<String>,

    /// Revision of the Hugging Face Hub network
    #[arg(long, requires = "hub")]
    revision: Option<String>,

    /// Safetensors file with a `features` tensor of shape
    /// (batch_size, seq_len, feature_width), sampled when absent
    #[arg(short, long)]
    features: Option<PathBuf>,

    /// Number of samples when features are sampled
    #[arg(long, default_value_t = 1)]
    batch_size: usize,

    /// Sequence length when features are sampled
    #[arg(long, default_value_t = 64)]
    seq_len: usize,

    /// Maximum caption length
    #[arg(long, default_value_t = 40)]
    max_len: usize,

    /// Seed for sampling noise and features
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Run on the first CUDA device
    #[arg(long)]
    cuda: bool,

    /// Safetensors file to write `captions` and `images` to
    #[arg(short, long)]
    output: PathBuf,
}

fn read_config(path: &Path) -> Result<NetworkConfigFile, Whatever> {
    let file = File::open(path)
        .with_whatever_context(|_| format!("Cannot open configuration: {path:?}"))?;
    serde_json::from_reader(file)
        .with_whatever_context(|_| format!("Cannot parse configuration: {path:?}"))
}

/// Returns the number of parameters of the saved network.
fn init(args: InitArgs) -> Result<usize, Whatever> {
    let config_file = match &args.config {
        Some(path) => read_config(path)?,
        None => NetworkConfigFile::default(),
    };

    let config = NetworkConfig::try_from(config_file.clone())
        .map_err(|e| Whatever::with_source(e, "Cannot convert configuration".to_string()))?;
    let var_map = VarMap::new();
    let vb = VarBuilder::from_varmap(&var_map, config_file.dtype(), &Device::Cpu);
    config
        .build(vb)
        .map_err(|e| Whatever::with_source(e, "Cannot build network".to_string()))?;

    let n_parameters: usize = var_map
        .all_vars()
        .iter()
        .map(|var| var.elem_count())
        .sum();
    info!(n_parameters, "Initialized network");

    save_pretrained(&args.output, &config_file, &var_map)
        .whatever_context("Cannot save network")?;

    Ok(n_parameters)
}

fn load(repo: &impl Repo, device: &Device) -> Result<(Network, NetworkConfigFile), Whatever> {
    let config = NetworkConfigFile::from_repo(repo).whatever_context("Cannot read configuration")?;
    let network = Network::from_repo_config(repo, &config, device)
        .whatever_context("Cannot load network")?;
    Ok((network, config))
}

fn generate(args: GenerateArgs) -> Result<(), Whatever> {
    let device = if args.cuda {
        Device::new_cuda(0).whatever_context("Cannot open CUDA device")?
    } else {
        Device::Cpu
    };

    let (network, config) = match (&args.model, &args.hub) {
        (Some(model), _) => {
            let repo = LocalRepo::new(model).whatever_context("Cannot open model directory")?;
            load(&repo, &device)?
        }
        (None, Some(hub)) => {
            let repo = HfHubRepo::new(hub, args.revision.as_deref())
                .whatever_context("Cannot open Hugging Face Hub repository")?;
            load(&repo, &device)?
        }
        (None, None) => whatever!("Either a model directory or a Hub name is required"),
    };
    let dtype = config.dtype();

    let features = match &args.features {
        Some(path) => candle_core::safetensors::load(path, &device)
            .whatever_context("Cannot read features")?
            .remove("features")
            .whatever_context("Features file does not have a `features` tensor")?
            .to_dtype(dtype)
            .whatever_context("Cannot convert features")?,
        None => Tensor::seeded_uniform(
            (args.batch_size, args.seq_len, config.feature_width),
            0.,
            1.,
            args.seed,
            dtype,
            &device,
        )
        .whatever_context("Cannot sample features")?,
    };
    let (batch_size, _, _) = features
        .dims3()
        .whatever_context("Features must have shape (batch_size, seq_len, feature_width)")?;

    let noise = Tensor::seeded_uniform(
        (batch_size, config.noise_width),
        -1.,
        1.,
        args.seed.wrapping_add(1),
        dtype,
        &device,
    )
    .whatever_context("Cannot sample noise")?;

    let generation = network
        .generate(
            &features,
            &noise,
            &GreedyDecodeConfig::default().max_len(args.max_len),
        )
        .whatever_context("Cannot generate")?;
    let (captions, images) = generation.into_parts();
    info!(captions = ?captions.dims(), images = ?images.dims(), "Generated");

    let images = images
        .to_dtype(DType::F32)
        .whatever_context("Cannot convert images")?;
    candle_core::safetensors::save(
        &HashMap::from([("captions", captions), ("images", images)]),
        &args.output,
    )
    .with_whatever_context(|_| format!("Cannot write output: {:?}", args.output))?;
    info!(output = ?args.output, "Saved captions and images");

    Ok(())
}

#[snafu::report]
fn main() -> Result<(), Whatever> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("text2image=info")),
        )
        .init();

    match Cli::parse().command {
        Command::Init(args) => init(args).map(|_| ()),
        Command::Generate(args) => generate(args),
    }
}

/// Repositories that store model configurations and checkpoints.
pub mod hf_hub;
pub mod local;
pub mod repo;

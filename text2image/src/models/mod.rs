/// Models.
pub mod config;
pub use config::{ModelDType, NetworkConfigError, NetworkConfigFile};

pub mod generator;

pub mod network;
pub use network::{Generation, Network, NetworkConfig, NetworkError, NetworkOutput};

pub mod pretrained;
pub use pretrained::{save_pretrained, FromRepoError, SavePretrainedError};

pub mod transformer;

pub mod architectures;
pub mod checkpoint;
pub mod error;
pub mod layers;
pub mod models;
pub mod repository;
pub mod util;

pub mod activation;

pub mod attention;

pub mod build_module;

pub mod conv;

pub mod dropout;

pub mod embeddings;

pub mod feedforward;

pub mod identity;

pub mod init;

pub mod norm;

pub mod prelu;

pub mod residual;

pub mod transformer;

//! # Configuration
//!
//! Runtime configuration for the decryptor, loaded from the environment.

mod decryptor;

pub use decryptor::DecryptorConfig;

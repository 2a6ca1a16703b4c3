//! Core functionality for hubwire
//!
//! This module contains the shared building blocks:
//! - Secret loading, rotation, and censoring
//! - Broker options and validation
//! - The git client and the credential bridge

pub mod git;
pub mod options;
pub mod secrets;

pub use git::GitClient;
pub use options::{FlagCustomization, GitHubOptions};
pub use secrets::{Agent, SecretStore, TokenSource};

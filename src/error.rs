//! Custom error types for hubwire
//!
//! Every failure the broker can surface is a variant here. Validation
//! failures always name the offending flag and value so startup errors are
//! actionable; nothing in this crate retries or panics on the caller's
//! behalf.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the hubwire broker
#[derive(Error, Debug)]
pub enum BrokerError {
    /// An endpoint flag did not parse as an absolute URI
    #[error("invalid --{flag} URI: {value:?}")]
    InvalidEndpoint {
        /// Flag that carried the bad value
        flag: &'static str,
        /// The rejected value
        value: String,
    },

    /// Token-path auth and app auth were both configured
    #[error("--github-token-path is mutually exclusive with --github-app-id and --github-app-private-key-path")]
    MutuallyExclusiveAuth,

    /// Exactly one of the two app credential flags was set
    #[error("--github-app-id and --github-app-private-key-path must be set together")]
    IncompleteAppCredentials,

    /// One throttle flag was positive while the other was zero
    #[error("--github-hourly-tokens and --github-allowed-burst must be either both higher than zero or both equal to zero (got hourly={hourly}, burst={burst})")]
    ThrottleRequiresBoth {
        /// Configured hourly quota
        hourly: u32,
        /// Configured burst allowance
        burst: u32,
    },

    /// Burst allowance exceeds the hourly quota
    #[error("--github-allowed-burst ({burst}) must not be larger than --github-hourly-tokens ({hourly})")]
    BurstExceedsHourly {
        /// Configured hourly quota
        hourly: u32,
        /// Configured burst allowance
        burst: u32,
    },

    /// A secret path is configured but no secret store was supplied
    #[error("cannot read secret from {path:?} without a secret store")]
    MissingSecretStore {
        /// The path that cannot be served
        path: PathBuf,
    },

    /// A registered secret path could not be read
    #[error("failed to read secret from {path:?}: {source}")]
    SecretLoad {
        /// The unreadable path
        path: PathBuf,
        /// Underlying I/O failure
        #[source]
        source: std::io::Error,
    },

    /// The app private key bytes do not parse as an RSA key
    #[error("failed to parse app private key from {path:?}: {source}")]
    KeyParse {
        /// Path the PEM bytes were read from
        path: PathBuf,
        /// Underlying parse failure
        #[source]
        source: jsonwebtoken::errors::Error,
    },

    /// Identity lookup failed while deriving git credentials
    #[error("failed to resolve git authentication: {0}")]
    AuthResolution(String),

    /// GitHub API request failed
    #[error("GitHub API request failed: {0}")]
    Api(String),

    /// Network request error
    #[error("network request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// Git operation error
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),

    /// IO error
    #[error("file operation failed: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("failed to parse response: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML configuration error
    #[error("configuration file is invalid: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for BrokerError {
    fn from(err: toml::de::Error) -> Self {
        BrokerError::Toml(err.to_string())
    }
}

/// Result type alias using BrokerError
pub type Result<T> = std::result::Result<T, BrokerError>;

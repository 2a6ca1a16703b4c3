//! GitHub broker options and validation
//!
//! The option shape consumed by programs embedding the broker:
//! - Host, REST endpoint(s), and GraphQL endpoint
//! - Auth mode selection: token path vs. app id + app private-key path
//! - Client-side throttling limits
//!
//! `validate` normalizes defaults and rejects bad combinations with the
//! offending flag name and value. Programs that parse CLI flags flatten
//! `GitHubOptions` into their clap command; `FlagCustomization` lets hosts
//! override throttle defaults or hide the throttle flags when they embed
//! several independently throttled clients.

use std::fs;
use std::path::{Path, PathBuf};

use clap::Args;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{BrokerError, Result};

/// GitHub's default host (may differ for enterprise)
pub const DEFAULT_HOST: &str = "github.com";
/// GitHub's default REST API endpoint
pub const DEFAULT_API_ENDPOINT: &str = "https://api.github.com";
/// GitHub's default GraphQL API endpoint
pub const DEFAULT_GRAPHQL_ENDPOINT: &str = "https://api.github.com/graphql";
/// Conventional mount point for the OAuth token secret
pub const DEFAULT_TOKEN_PATH: &str = "/etc/github/oauth";

/// Options for interacting with GitHub
///
/// Set `allow_anonymous` if anonymous API access is acceptable, and
/// `allow_direct_access` to suppress the warning about talking to the
/// default endpoint without a caching proxy in between.
#[derive(Args, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubOptions {
    /// GitHub's default host (may differ for enterprise)
    #[arg(long = "github-host", default_value = DEFAULT_HOST)]
    pub host: String,

    /// GitHub's API endpoint (may differ for enterprise); repeatable,
    /// endpoints are tried in order
    #[arg(long = "github-endpoint", default_value = DEFAULT_API_ENDPOINT)]
    pub endpoints: Vec<String>,

    /// GitHub GraphQL API endpoint (may differ for enterprise)
    #[arg(long = "github-graphql-endpoint", default_value = DEFAULT_GRAPHQL_ENDPOINT)]
    pub graphql_endpoint: String,

    /// Path to the file containing the GitHub OAuth secret
    #[arg(long = "github-token-path")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_path: Option<PathBuf>,

    /// ID of the GitHub app; requires --github-app-private-key-path and
    /// excludes --github-token-path
    #[arg(long = "github-app-id")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,

    /// Path to the private key of the GitHub app; requires --github-app-id
    /// and excludes --github-token-path
    #[arg(long = "github-app-private-key-path")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_private_key_path: Option<PathBuf>,

    /// Allow anonymous API access
    #[arg(long = "allow-anonymous")]
    pub allow_anonymous: bool,

    /// Suppress the warning on direct access to the default endpoint
    #[arg(long = "allow-direct-access")]
    pub allow_direct_access: bool,

    /// If larger than zero, enable client-side throttling to limit hourly
    /// token consumption; requires --github-allowed-burst to be positive too
    #[arg(long = "github-hourly-tokens", default_value_t = 0)]
    pub throttle_hourly_tokens: u32,

    /// Size of token consumption bursts; must not exceed
    /// --github-hourly-tokens
    #[arg(long = "github-allowed-burst", default_value_t = 0)]
    pub throttle_allow_burst: u32,
}

impl Default for GitHubOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            endpoints: vec![DEFAULT_API_ENDPOINT.to_string()],
            graphql_endpoint: DEFAULT_GRAPHQL_ENDPOINT.to_string(),
            token_path: None,
            app_id: None,
            app_private_key_path: None,
            allow_anonymous: false,
            allow_direct_access: false,
            throttle_hourly_tokens: 0,
            throttle_allow_burst: 0,
        }
    }
}

impl GitHubOptions {
    /// Load options from a TOML file
    ///
    /// Lets embedding programs layer file configuration under their CLI
    /// flags. The result still needs `validate`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let options: GitHubOptions = toml::from_str(&contents)?;
        Ok(options)
    }

    /// Validate the options, filling in defaults
    ///
    /// Empty endpoint entries and an empty GraphQL endpoint are replaced by
    /// the well-known defaults; everything else must parse as an absolute
    /// URI. Fails on mutually exclusive or incomplete auth configuration and
    /// on inconsistent throttle limits.
    pub fn validate(&mut self) -> Result<()> {
        self.normalize_empty_fields();

        if self.endpoints.is_empty() {
            self.endpoints.push(DEFAULT_API_ENDPOINT.to_string());
        }
        for endpoint in &mut self.endpoints {
            if endpoint.is_empty() {
                *endpoint = DEFAULT_API_ENDPOINT.to_string();
            } else if Url::parse(endpoint).is_err() {
                return Err(BrokerError::InvalidEndpoint {
                    flag: "github-endpoint",
                    value: endpoint.clone(),
                });
            }
        }

        if self.token_path.is_some()
            && (self.app_id.is_some() || self.app_private_key_path.is_some())
        {
            return Err(BrokerError::MutuallyExclusiveAuth);
        }
        if self.app_id.is_some() != self.app_private_key_path.is_some() {
            return Err(BrokerError::IncompleteAppCredentials);
        }

        if self.token_path.is_some()
            && self.endpoints.len() == 1
            && self.endpoints[0] == DEFAULT_API_ENDPOINT
            && !self.allow_direct_access
        {
            tracing::warn!(
                "token auth against the default GitHub endpoint without a caching proxy; \
                 API rate limits will be consumed directly (pass --allow-direct-access to \
                 silence this warning)"
            );
        }

        if self.graphql_endpoint.is_empty() {
            self.graphql_endpoint = DEFAULT_GRAPHQL_ENDPOINT.to_string();
        } else if Url::parse(&self.graphql_endpoint).is_err() {
            return Err(BrokerError::InvalidEndpoint {
                flag: "github-graphql-endpoint",
                value: self.graphql_endpoint.clone(),
            });
        }

        if (self.throttle_hourly_tokens > 0) != (self.throttle_allow_burst > 0) {
            if self.throttle_hourly_tokens == 0 {
                // Tolerate `--github-hourly-tokens=0` alone to disable throttling
                self.throttle_allow_burst = 0;
            } else {
                return Err(BrokerError::ThrottleRequiresBoth {
                    hourly: self.throttle_hourly_tokens,
                    burst: self.throttle_allow_burst,
                });
            }
        }
        if self.throttle_allow_burst > self.throttle_hourly_tokens {
            return Err(BrokerError::BurstExceedsHourly {
                hourly: self.throttle_hourly_tokens,
                burst: self.throttle_allow_burst,
            });
        }

        Ok(())
    }

    /// Treat empty strings from file configs the same as absent flags
    fn normalize_empty_fields(&mut self) {
        if self.token_path.as_deref() == Some(Path::new("")) {
            self.token_path = None;
        }
        if self.app_id.as_deref() == Some("") {
            self.app_id = None;
        }
        if self.app_private_key_path.as_deref() == Some(Path::new("")) {
            self.app_private_key_path = None;
        }
    }

    /// Apply flag customizations to a built clap command
    ///
    /// Call after flattening `GitHubOptions` into the command.
    pub fn customize_command(
        command: clap::Command,
        customization: &FlagCustomization,
    ) -> clap::Command {
        let mut command = command;
        if let Some((hourly, burst)) = customization.throttler_defaults {
            command = command
                .mut_arg("throttle_hourly_tokens", |arg| {
                    arg.default_value(hourly.to_string())
                })
                .mut_arg("throttle_allow_burst", |arg| {
                    arg.default_value(burst.to_string())
                });
        }
        if customization.disable_throttler_options {
            command = command
                .mut_arg("throttle_hourly_tokens", |arg| arg.hide(true))
                .mut_arg("throttle_allow_burst", |arg| arg.hide(true));
        }
        command
    }
}

/// Customization of the common GitHub flag behavior
///
/// Lets composing programs provide their own throttle defaults or take the
/// throttle flags away from external users entirely, which matters when one
/// program creates multiple clients with different throttling behavior.
#[derive(Debug, Clone, Default)]
pub struct FlagCustomization {
    throttler_defaults: Option<(u32, u32)>,
    disable_throttler_options: bool,
}

impl FlagCustomization {
    /// Start with no customizations
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the default throttle values
    ///
    /// Setting `hourly_tokens` to zero disables throttling by default.
    pub fn throttler_defaults(mut self, hourly_tokens: u32, allowed_bursts: u32) -> Self {
        self.throttler_defaults = Some((hourly_tokens, allowed_bursts));
        self
    }

    /// Hide the throttle flags from external users
    pub fn disable_throttler_options(mut self) -> Self {
        self.disable_throttler_options = true;
        self
    }
}

//! hubwire - credential-brokered GitHub client factory
//!
//! Given options describing how to authenticate (personal-access token vs.
//! app-installation credentials), this crate produces a ready-to-use GitHub
//! API client and a companion git client, wired with the right auth
//! strategy, optional outbound throttling, optional dry-run interception,
//! and secret censoring for logs.
//!
//! The entry points hang off [`GitHubOptions`]: validate it, then ask it for
//! [`GitHubOptions::github_client`], [`GitHubOptions::git_client`], or
//! [`GitHubOptions::git_authentication`].

pub mod core;
pub mod error;
pub mod github;

#[cfg(test)]
pub(crate) mod test_support;

pub use self::core::git::GitClient;
pub use self::core::options::{
    FlagCustomization, GitHubOptions, DEFAULT_API_ENDPOINT, DEFAULT_GRAPHQL_ENDPOINT,
    DEFAULT_HOST, DEFAULT_TOKEN_PATH,
};
pub use self::core::secrets::{Agent, SecretStore, TokenSource};
pub use error::{BrokerError, Result};
pub use github::auth::GIT_APP_USER;
pub use github::client::{BotUser, BuiltClient, GitHubClient};

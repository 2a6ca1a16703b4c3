//! GitHub API integration module
//!
//! This module provides the API-side half of the broker:
//! - Authentication strategy resolution and app-token machinery
//! - Client construction (token/app auth, live/dry-run variants)
//! - Outbound request throttling

pub mod auth;
pub mod client;
pub mod throttle;

pub use auth::{resolve, AppKeySource, AppTokenSource, AuthStrategy, GIT_APP_USER};
pub use client::{BotUser, BuiltClient, Censor, GitHubClient, UserLookup};
pub use throttle::Throttle;

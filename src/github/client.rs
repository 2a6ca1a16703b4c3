//! GitHub API client construction
//!
//! The factory half of the broker: turns validated `GitHubOptions` plus a
//! secret store into a ready client. Four constructor variants are crossed
//! by {token auth, app auth} x {live, dry-run}; all of them consult their
//! credential source on every request, so rotated secrets take effect
//! without rebuilding the client. Throttle decoration is applied
//! unconditionally because zero limits disable it.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::Deserialize;

use crate::core::options::GitHubOptions;
use crate::core::secrets::{AnonymousTokenSource, SecretStore, TokenSource};
use crate::error::{BrokerError, Result};
use crate::github::auth::{self, AppKeySource, AppTokenSource, AuthStrategy};
use crate::github::throttle::Throttle;

const AGENT: &str = concat!("hubwire/", env!("CARGO_PKG_VERSION"));

/// Redaction function applied to response bodies before they reach logs
pub type Censor = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// The authenticated bot identity
#[derive(Debug, Clone, Deserialize)]
pub struct BotUser {
    /// Login name of the authenticated user
    pub login: String,
}

enum ClientAuth {
    /// Personal or anonymous token; an empty secret sends no header
    Token(Arc<dyn TokenSource>),
    /// App installation token, minted by the app-auth machinery
    App(Arc<AppTokenSource>),
}

/// GitHub API client
///
/// Requests consult the credential source per call and try the configured
/// endpoints in order. The dry-run variant answers read requests normally
/// and reports would-be mutations instead of sending them.
pub struct GitHubClient {
    http: reqwest::Client,
    auth: ClientAuth,
    endpoints: Vec<String>,
    graphql_endpoint: String,
    censor: Option<Censor>,
    dry_run: bool,
    throttle: Throttle,
}

impl GitHubClient {
    fn build(
        auth: ClientAuth,
        censor: Option<Censor>,
        graphql_endpoint: &str,
        endpoints: &[String],
        dry_run: bool,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            auth,
            endpoints: endpoints.to_vec(),
            graphql_endpoint: graphql_endpoint.to_string(),
            censor,
            dry_run,
            throttle: Throttle::disabled(),
        }
    }

    /// Create a live token-auth client
    pub fn new(
        token: Arc<dyn TokenSource>,
        censor: Option<Censor>,
        graphql_endpoint: &str,
        endpoints: &[String],
    ) -> Self {
        Self::build(ClientAuth::Token(token), censor, graphql_endpoint, endpoints, false)
    }

    /// Create a dry-run token-auth client
    pub fn new_dry_run(
        token: Arc<dyn TokenSource>,
        censor: Option<Censor>,
        graphql_endpoint: &str,
        endpoints: &[String],
    ) -> Self {
        Self::build(ClientAuth::Token(token), censor, graphql_endpoint, endpoints, true)
    }

    /// Create a live app-auth client
    ///
    /// Returns the installation-token source alongside the client so the
    /// caller can bridge the same identity into git credentials.
    pub fn new_app_auth(
        censor: Option<Censor>,
        app_id: String,
        key: Arc<AppKeySource>,
        graphql_endpoint: &str,
        endpoints: &[String],
    ) -> (Arc<AppTokenSource>, Self) {
        let tokens = Arc::new(AppTokenSource::new(app_id, key));
        let client = Self::build(
            ClientAuth::App(Arc::clone(&tokens)),
            censor,
            graphql_endpoint,
            endpoints,
            false,
        );
        (tokens, client)
    }

    /// Create a dry-run app-auth client
    pub fn new_app_auth_dry_run(
        censor: Option<Censor>,
        app_id: String,
        key: Arc<AppKeySource>,
        graphql_endpoint: &str,
        endpoints: &[String],
    ) -> (Arc<AppTokenSource>, Self) {
        let tokens = Arc::new(AppTokenSource::new(app_id, key));
        let client = Self::build(
            ClientAuth::App(Arc::clone(&tokens)),
            censor,
            graphql_endpoint,
            endpoints,
            true,
        );
        (tokens, client)
    }

    /// Install throttle limits; zeroes disable limiting
    pub fn throttle(&self, hourly_tokens: u32, allowed_burst: u32) {
        self.throttle.set_limits(hourly_tokens, allowed_burst);
    }

    /// Whether outbound throttling is active
    pub fn is_throttled(&self) -> bool {
        self.throttle.is_enabled()
    }

    /// Whether this is the dry-run variant
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// The configured GraphQL endpoint
    pub fn graphql_endpoint(&self) -> &str {
        &self.graphql_endpoint
    }

    /// The configured REST endpoints, in fallback order
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Gate for mutating calls: false means "skip, we are dry-running"
    pub fn guard_mutation(&self, action: &str) -> bool {
        if self.dry_run {
            tracing::info!(action, "dry-run: mutation intercepted");
            return false;
        }
        true
    }

    /// Wait for a throttle permit
    pub async fn acquire(&self) {
        self.throttle.acquire().await;
    }

    fn auth_header(&self) -> Result<Option<String>> {
        match &self.auth {
            ClientAuth::Token(source) => {
                let secret = source.current()?;
                if secret.is_empty() {
                    // Anonymous access
                    return Ok(None);
                }
                let token = String::from_utf8_lossy(&secret);
                Ok(Some(format!("token {}", token.trim())))
            }
            ClientAuth::App(tokens) => {
                let secret = tokens.current()?;
                let token = String::from_utf8_lossy(&secret);
                Ok(Some(format!("Bearer {}", token.trim())))
            }
        }
    }

    fn censor_text(&self, content: &[u8]) -> String {
        match &self.censor {
            Some(censor) => String::from_utf8_lossy(&censor(content)).into_owned(),
            None => String::from_utf8_lossy(content).into_owned(),
        }
    }

    /// Fetch the authenticated bot identity
    ///
    /// Endpoints are tried in order; the last failure wins when all of them
    /// misbehave. Error bodies are censored before they are surfaced.
    pub async fn bot_user(&self) -> Result<BotUser> {
        self.throttle.acquire().await;

        let mut last_err = None;
        for endpoint in &self.endpoints {
            let base = endpoint.trim_end_matches('/');
            let mut request = self
                .http
                .get(format!("{base}/user"))
                .header(ACCEPT, "application/vnd.github+json")
                .header(USER_AGENT, AGENT);
            if let Some(value) = self.auth_header()? {
                request = request.header(AUTHORIZATION, value);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    return Ok(response.json().await?);
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.bytes().await.unwrap_or_default();
                    last_err = Some(BrokerError::Api(format!(
                        "GET {base}/user returned {status}: {}",
                        self.censor_text(&body)
                    )));
                }
                Err(e) => last_err = Some(BrokerError::Network(e)),
            }
        }
        Err(last_err
            .unwrap_or_else(|| BrokerError::Api("no API endpoints configured".to_string())))
    }

    /// Access to the underlying HTTP client, for the app-auth machinery
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }
}

/// Identity lookup seam used by the git credential bridge
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserLookup: Send + Sync {
    /// Fetch the authenticated bot identity
    async fn bot_user(&self) -> Result<BotUser>;
}

#[async_trait]
impl UserLookup for GitHubClient {
    async fn bot_user(&self) -> Result<BotUser> {
        GitHubClient::bot_user(self).await
    }
}

/// Result of client construction
///
/// Carries the installation-token source next to the client instead of
/// stashing it in hidden configuration state; the git bridge threads it
/// through explicitly.
pub struct BuiltClient {
    /// The constructed API client
    pub client: GitHubClient,
    /// Set when the app-installation strategy was resolved
    pub app_tokens: Option<Arc<AppTokenSource>>,
}

/// Token source for a caller-supplied access token
struct AccessTokenSource(Vec<u8>);

impl TokenSource for AccessTokenSource {
    fn current(&self) -> Result<Vec<u8>> {
        Ok(self.0.clone())
    }
}

impl GitHubOptions {
    /// Build a GitHub API client for these options
    ///
    /// Resolves the auth strategy, constructs the matching client variant,
    /// and applies throttle decoration. A store is only required when a
    /// secret path is configured; anonymous construction tolerates `None`.
    pub fn github_client(
        &self,
        store: Option<&Arc<dyn SecretStore>>,
        dry_run: bool,
    ) -> Result<BuiltClient> {
        let strategy = auth::resolve(self, store)?;
        let censor = store.map(|store| {
            let store = Arc::clone(store);
            Arc::new(move |content: &[u8]| store.censor(content)) as Censor
        });

        let built = match strategy {
            AuthStrategy::AppInstallation { app_id, key } => {
                let (tokens, client) = if dry_run {
                    GitHubClient::new_app_auth_dry_run(
                        censor,
                        app_id,
                        key,
                        &self.graphql_endpoint,
                        &self.endpoints,
                    )
                } else {
                    GitHubClient::new_app_auth(
                        censor,
                        app_id,
                        key,
                        &self.graphql_endpoint,
                        &self.endpoints,
                    )
                };
                BuiltClient {
                    client,
                    app_tokens: Some(tokens),
                }
            }
            AuthStrategy::PersonalToken(source) => {
                let client = if dry_run {
                    GitHubClient::new_dry_run(source, censor, &self.graphql_endpoint, &self.endpoints)
                } else {
                    GitHubClient::new(source, censor, &self.graphql_endpoint, &self.endpoints)
                };
                BuiltClient {
                    client,
                    app_tokens: None,
                }
            }
            AuthStrategy::Anonymous => {
                let source: Arc<dyn TokenSource> = Arc::new(AnonymousTokenSource);
                let client = if dry_run {
                    GitHubClient::new_dry_run(source, censor, &self.graphql_endpoint, &self.endpoints)
                } else {
                    GitHubClient::new(source, censor, &self.graphql_endpoint, &self.endpoints)
                };
                BuiltClient {
                    client,
                    app_tokens: None,
                }
            }
        };

        // Throttle handles zeroes as "disable limiting", so this is safe
        // even when throttling is off
        built
            .client
            .throttle(self.throttle_hourly_tokens, self.throttle_allow_burst);
        Ok(built)
    }

    /// Build a client from a caller-supplied access token
    ///
    /// The censor strips the trimmed token from buffers; no secret store is
    /// involved.
    pub fn github_client_with_access_token(&self, token: &str) -> GitHubClient {
        let trimmed = token.trim().to_string();
        let censor: Option<Censor> = if trimmed.is_empty() {
            None
        } else {
            let needle = trimmed.clone().into_bytes();
            Some(Arc::new(move |content: &[u8]| {
                replace_all(content, &needle, b"CENSORED")
            }))
        };
        GitHubClient::new(
            Arc::new(AccessTokenSource(trimmed.into_bytes())),
            censor,
            &self.graphql_endpoint,
            &self.endpoints,
        )
    }
}

fn replace_all(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut rest = haystack;
    while let Some(pos) = rest
        .windows(needle.len())
        .position(|window| window == needle)
    {
        out.extend_from_slice(&rest[..pos]);
        out.extend_from_slice(replacement);
        rest = &rest[pos + needle.len()..];
    }
    out.extend_from_slice(rest);
    out
}

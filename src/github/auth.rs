//! Authentication strategy resolution
//!
//! Decides which of the three authentication strategies applies to a set of
//! validated options and builds the matching credential sources:
//! - Anonymous: empty secret, reduced rate limits
//! - Personal token: rotating token read from the secret store per call
//! - App installation: RS256 app JWTs minted from a freshly parsed private
//!   key, exchanged for short-lived installation tokens
//!
//! Resolution performs no I/O beyond registering paths with the store.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::core::options::GitHubOptions;
use crate::core::secrets::{SecretStore, StoredTokenSource, TokenSource};
use crate::error::{BrokerError, Result};

/// Identity used for HTTP-based git access with installation tokens
///
/// See the GitHub Apps documentation on HTTP-based git access by an
/// installation.
pub const GIT_APP_USER: &str = "x-access-token";

/// App JWTs are valid for at most ten minutes; stay below the cap
const APP_JWT_LIFETIME_MINUTES: i64 = 9;
/// Issue app JWTs slightly in the past to tolerate clock skew
const APP_JWT_SKEW_SECONDS: i64 = 10;
/// Refresh installation tokens this long before they expire
const INSTALLATION_TOKEN_SLACK_MINUTES: i64 = 2;

/// The resolved authentication strategy
pub enum AuthStrategy {
    /// No credentials configured; the token source yields empty secrets
    Anonymous,
    /// A long-lived personal access token read from the store per call
    PersonalToken(Arc<StoredTokenSource>),
    /// App credentials: the key source re-reads the PEM on every use
    AppInstallation {
        /// GitHub app ID, the JWT issuer
        app_id: String,
        /// Source of the freshly parsed signing key
        key: Arc<AppKeySource>,
    },
}

/// Decide which authentication strategy applies
///
/// Mutual exclusivity has already been handled by `validate`; if both
/// strategies somehow reach this point the app strategy wins, matching the
/// construction order of the client factory. Silently disambiguating
/// combinations validation should have rejected is a non-goal.
pub fn resolve(
    options: &GitHubOptions,
    store: Option<&Arc<dyn SecretStore>>,
) -> Result<AuthStrategy> {
    if let Some(key_path) = &options.app_private_key_path {
        let store = require_store(store, key_path)?;
        store.add(key_path)?;
        return Ok(AuthStrategy::AppInstallation {
            app_id: options.app_id.clone().unwrap_or_default(),
            key: Arc::new(AppKeySource::new(Arc::clone(store), key_path.clone())),
        });
    }

    match &options.token_path {
        None => {
            tracing::warn!(
                "empty --github-token-path, will use anonymous github client \
                 (anonymous access is subject to reduced rate limits)"
            );
            Ok(AuthStrategy::Anonymous)
        }
        Some(token_path) => {
            let store = require_store(store, token_path)?;
            store.add(token_path)?;
            Ok(AuthStrategy::PersonalToken(Arc::new(
                StoredTokenSource::new(Arc::clone(store), token_path.clone()),
            )))
        }
    }
}

fn require_store<'a>(
    store: Option<&'a Arc<dyn SecretStore>>,
    path: &Path,
) -> Result<&'a Arc<dyn SecretStore>> {
    store.ok_or_else(|| BrokerError::MissingSecretStore {
        path: path.to_path_buf(),
    })
}

/// Source of the app signing key
///
/// Re-reads the PEM bytes from the store and parses them on every call, so
/// a rotated key takes effect immediately. A parse failure is an error for
/// the caller, never a panic.
pub struct AppKeySource {
    store: Arc<dyn SecretStore>,
    path: PathBuf,
}

impl AppKeySource {
    /// Create a key source for `path` backed by `store`
    pub fn new(store: Arc<dyn SecretStore>, path: PathBuf) -> Self {
        Self { store, path }
    }

    /// The current signing key, freshly parsed from the store
    pub fn current(&self) -> Result<EncodingKey> {
        let pem = self.store.secret(&self.path);
        EncodingKey::from_rsa_pem(&pem).map_err(|source| BrokerError::KeyParse {
            path: self.path.clone(),
            source,
        })
    }
}

#[derive(Serialize)]
struct AppJwtClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Deserialize)]
struct Installation {
    id: u64,
}

#[derive(Deserialize)]
struct InstallationAccessToken {
    token: String,
    expires_at: DateTime<Utc>,
}

struct CachedInstallationToken {
    token: SecretString,
    expires_at: DateTime<Utc>,
}

/// Rotating token source for app-installation auth
///
/// `current` serves the cached installation token while it is fresh and
/// otherwise falls back to a newly signed app JWT, so it stays synchronous
/// and callable from git credential callbacks. The client's app-auth
/// machinery refreshes the installation token out of band via
/// `refresh_installation_token`.
pub struct AppTokenSource {
    app_id: String,
    key: Arc<AppKeySource>,
    installation: RwLock<Option<CachedInstallationToken>>,
}

impl AppTokenSource {
    /// Create a token source for the given app identity
    pub fn new(app_id: String, key: Arc<AppKeySource>) -> Self {
        Self {
            app_id,
            key,
            installation: RwLock::new(None),
        }
    }

    /// The app ID this source signs for
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Sign a fresh app JWT from the current private key
    pub fn signed_jwt(&self) -> Result<String> {
        let key = self.key.current()?;
        let now = Utc::now();
        let claims = AppJwtClaims {
            iat: (now - Duration::seconds(APP_JWT_SKEW_SECONDS)).timestamp(),
            exp: (now + Duration::minutes(APP_JWT_LIFETIME_MINUTES)).timestamp(),
            iss: self.app_id.clone(),
        };
        encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| BrokerError::Api(format!("failed to sign app JWT: {e}")))
    }

    /// Exchange a fresh app JWT for an installation access token
    ///
    /// Picks the app's first installation; hosts installed into exactly one
    /// account, which is the deployment shape this broker serves.
    pub async fn refresh_installation_token(
        &self,
        http: &reqwest::Client,
        api_endpoint: &str,
    ) -> Result<()> {
        let jwt = self.signed_jwt()?;
        let base = api_endpoint.trim_end_matches('/');

        let installations: Vec<Installation> = http
            .get(format!("{base}/app/installations"))
            .bearer_auth(&jwt)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header(
                reqwest::header::USER_AGENT,
                concat!("hubwire/", env!("CARGO_PKG_VERSION")),
            )
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let installation = installations
            .first()
            .ok_or_else(|| BrokerError::Api("app has no installations".to_string()))?;

        let access_token: InstallationAccessToken = http
            .post(format!(
                "{base}/app/installations/{}/access_tokens",
                installation.id
            ))
            .bearer_auth(&jwt)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header(
                reqwest::header::USER_AGENT,
                concat!("hubwire/", env!("CARGO_PKG_VERSION")),
            )
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Ok(mut cached) = self.installation.write() {
            *cached = Some(CachedInstallationToken {
                token: SecretString::from(access_token.token),
                expires_at: access_token.expires_at,
            });
        }
        Ok(())
    }

    fn fresh_installation_token(&self) -> Option<Vec<u8>> {
        let cached = self.installation.read().ok()?;
        let cached = cached.as_ref()?;
        let slack = Duration::minutes(INSTALLATION_TOKEN_SLACK_MINUTES);
        if Utc::now() + slack < cached.expires_at {
            Some(cached.token.expose_secret().as_bytes().to_vec())
        } else {
            None
        }
    }
}

impl TokenSource for AppTokenSource {
    fn current(&self) -> Result<Vec<u8>> {
        if let Some(token) = self.fresh_installation_token() {
            return Ok(token);
        }
        self.signed_jwt().map(String::into_bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::test_support::{capture_logs, static_store, TEST_RSA_KEY};

    #[test]
    fn empty_token_path_resolves_to_anonymous() {
        let options = GitHubOptions::default();
        let strategy = resolve(&options, None).unwrap();
        assert!(matches!(strategy, AuthStrategy::Anonymous));
    }

    #[test]
    fn anonymous_resolution_emits_an_advisory_warning() {
        let options = GitHubOptions::default();
        let (strategy, logs) = capture_logs(|| resolve(&options, None));
        assert!(matches!(strategy, Ok(AuthStrategy::Anonymous)));
        assert!(logs.contents().contains("anonymous github client"));
    }

    #[test]
    fn token_path_without_store_is_a_configuration_error() {
        let options = GitHubOptions {
            token_path: Some(PathBuf::from("/etc/tok")),
            ..Default::default()
        };
        let err = resolve(&options, None).map(|_| ()).unwrap_err();
        assert!(matches!(err, BrokerError::MissingSecretStore { .. }));
    }

    #[test]
    fn token_path_resolves_to_a_rotating_personal_token() {
        let store = static_store(&[("/etc/tok", b"secret123")]);
        let options = GitHubOptions {
            token_path: Some(PathBuf::from("/etc/tok")),
            ..Default::default()
        };
        match resolve(&options, Some(&store)).unwrap() {
            AuthStrategy::PersonalToken(source) => {
                assert_eq!(source.current().unwrap(), b"secret123");
                // Deterministic given a deterministic store
                assert_eq!(source.current().unwrap(), b"secret123");
            }
            _ => panic!("expected personal token strategy"),
        }
    }

    #[test]
    fn app_credentials_resolve_to_app_installation() {
        let store = static_store(&[("/etc/key.pem", TEST_RSA_KEY.as_bytes())]);
        let options = GitHubOptions {
            app_id: Some("42".to_string()),
            app_private_key_path: Some(PathBuf::from("/etc/key.pem")),
            ..Default::default()
        };
        match resolve(&options, Some(&store)).unwrap() {
            AuthStrategy::AppInstallation { app_id, key } => {
                assert_eq!(app_id, "42");
                key.current().unwrap();
            }
            _ => panic!("expected app installation strategy"),
        }
    }

    #[test]
    fn app_strategy_wins_over_a_stray_token_path() {
        let store = static_store(&[("/etc/key.pem", TEST_RSA_KEY.as_bytes())]);
        let options = GitHubOptions {
            token_path: Some(PathBuf::from("/etc/tok")),
            app_id: Some("42".to_string()),
            app_private_key_path: Some(PathBuf::from("/etc/key.pem")),
            ..Default::default()
        };
        assert!(matches!(
            resolve(&options, Some(&store)).unwrap(),
            AuthStrategy::AppInstallation { .. }
        ));
    }

    #[test]
    fn malformed_key_surfaces_as_a_parse_error() {
        let store = static_store(&[("/etc/key.pem", b"not a pem")]);
        let key = AppKeySource::new(store, PathBuf::from("/etc/key.pem"));
        assert!(matches!(
            key.current().map(|_| ()).unwrap_err(),
            BrokerError::KeyParse { .. }
        ));
    }

    #[test]
    fn app_token_source_yields_a_jwt_not_the_raw_key() {
        let store = static_store(&[("/etc/key.pem", TEST_RSA_KEY.as_bytes())]);
        let key = Arc::new(AppKeySource::new(store, PathBuf::from("/etc/key.pem")));
        let source = AppTokenSource::new("42".to_string(), key);

        let token = source.current().unwrap();
        let token = String::from_utf8(token).unwrap();
        assert_eq!(token.split('.').count(), 3, "expected a compact JWT");
        assert!(!token.contains("PRIVATE KEY"));
    }
}

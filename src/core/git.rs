//! Git client and the credential bridge from the API client
//!
//! The second client the broker wires up: a git2-backed client that clones
//! and fetches over HTTPS using the same underlying secret material as the
//! API client, reshaped into the credential form git wants (username plus a
//! rotating token). Personal-token auth authenticates as the bot user's
//! login; app auth authenticates as the fixed installation-access identity.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::build::RepoBuilder;
use git2::{Cred, FetchOptions, RemoteCallbacks, Repository};
use tempfile::TempDir;

use crate::core::options::GitHubOptions;
use crate::core::secrets::{AnonymousTokenSource, SecretStore, StoredTokenSource, TokenSource};
use crate::error::{BrokerError, Result};
use crate::github::auth::GIT_APP_USER;
use crate::github::client::{BuiltClient, UserLookup};

/// Git client operating out of a per-instance cache directory
///
/// Credentials must be installed with `set_credentials` before any remote
/// operation; the token source is consulted per fetch, so rotated secrets
/// take effect on the next operation.
pub struct GitClient {
    host: String,
    cache_dir: Option<TempDir>,
    credentials: Option<(String, Arc<dyn TokenSource>)>,
}

impl GitClient {
    /// Create a client for the given host with a fresh cache directory
    pub fn with_host(host: &str) -> Result<Self> {
        let cache_dir = TempDir::with_prefix("hubwire-git-")?;
        Ok(Self {
            host: host.to_string(),
            cache_dir: Some(cache_dir),
            credentials: None,
        })
    }

    /// The host remote URLs are built against
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The cache directory, `None` after `clean`
    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_ref().map(TempDir::path)
    }

    /// Install the identity and rotating token used for remote operations
    pub fn set_credentials(&mut self, user: String, token: Arc<dyn TokenSource>) {
        self.credentials = Some((user, token));
    }

    /// The installed credentials, if any
    pub fn credentials(&self) -> Option<(&str, Arc<dyn TokenSource>)> {
        self.credentials
            .as_ref()
            .map(|(user, token)| (user.as_str(), Arc::clone(token)))
    }

    /// Remove the cache directory and everything in it
    pub fn clean(&mut self) -> Result<()> {
        if let Some(cache_dir) = self.cache_dir.take() {
            cache_dir.close()?;
        }
        Ok(())
    }

    /// Clone `org/repo` from the configured host into the cache directory
    pub fn clone_repo(&self, org: &str, repo: &str) -> Result<Repository> {
        let url = format!("https://{}/{}/{}", self.host, org, repo);
        self.clone_url(&url, &format!("{org}/{repo}"))
    }

    fn clone_url(&self, url: &str, dest: &str) -> Result<Repository> {
        let cache_dir = self.cache_dir().ok_or_else(|| {
            BrokerError::Git(git2::Error::from_str("git client has been cleaned"))
        })?;
        let into: PathBuf = cache_dir.join(dest);
        if let Some(parent) = into.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut callbacks = RemoteCallbacks::new();
        if let Some((user, token)) = &self.credentials {
            let user = user.clone();
            let token = Arc::clone(token);
            callbacks.credentials(move |_url, _username, _allowed| {
                let secret = token
                    .current()
                    .map_err(|e| git2::Error::from_str(&e.to_string()))?;
                let secret = String::from_utf8_lossy(&secret);
                Cred::userpass_plaintext(&user, secret.trim())
            });
        }

        let mut fetch_options = FetchOptions::new();
        fetch_options.remote_callbacks(callbacks);
        let repo = RepoBuilder::new()
            .fetch_options(fetch_options)
            .clone(url, &into)?;
        Ok(repo)
    }
}

impl GitHubOptions {
    /// Build a git client with credentials derived from these options
    ///
    /// The cache directory is released again on every failing exit path
    /// after the client exists.
    pub async fn git_client(
        &self,
        store: Option<&Arc<dyn SecretStore>>,
        dry_run: bool,
    ) -> Result<GitClient> {
        let mut client = GitClient::with_host(&self.host)?;
        match self.git_authentication(store, dry_run).await {
            Ok((user, token)) => {
                client.set_credentials(user, token);
                Ok(client)
            }
            Err(e) => {
                let _ = client.clean();
                Err(e)
            }
        }
    }

    /// Derive git credentials: an identity plus a rotating token source
    ///
    /// Constructs its own API client, so callers have no ordering
    /// obligation. App auth yields the fixed installation-access identity
    /// paired with the installation-token source; otherwise the bot user's
    /// login is paired with a source that re-reads the token path.
    pub async fn git_authentication(
        &self,
        store: Option<&Arc<dyn SecretStore>>,
        dry_run: bool,
    ) -> Result<(String, Arc<dyn TokenSource>)> {
        let BuiltClient { client, app_tokens } = self.github_client(store, dry_run)?;

        if let Some(app_tokens) = app_tokens {
            if let Some(endpoint) = self.endpoints.first() {
                // The JWT fallback keeps the source usable if this fails
                if let Err(e) = app_tokens
                    .refresh_installation_token(client.http(), endpoint)
                    .await
                {
                    tracing::warn!(error = %e, "could not mint an installation token");
                }
            }
            return Ok((GIT_APP_USER.to_string(), app_tokens));
        }

        self.bot_user_authentication(&client, store).await
    }

    async fn bot_user_authentication(
        &self,
        lookup: &dyn UserLookup,
        store: Option<&Arc<dyn SecretStore>>,
    ) -> Result<(String, Arc<dyn TokenSource>)> {
        let bot = lookup
            .bot_user()
            .await
            .map_err(|e| BrokerError::AuthResolution(format!("error getting bot name: {e}")))?;

        let token: Arc<dyn TokenSource> = match (&self.token_path, store) {
            (Some(path), Some(store)) => {
                Arc::new(StoredTokenSource::new(Arc::clone(store), path.clone()))
            }
            _ => Arc::new(AnonymousTokenSource),
        };
        Ok((bot.login, token))
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::github::client::{BotUser, MockUserLookup};
    use crate::test_support::{static_store, StaticStore, TEST_RSA_KEY};

    #[test]
    fn clean_removes_the_cache_directory() {
        let mut client = GitClient::with_host("github.com").unwrap();
        let cache_dir = client.cache_dir().unwrap().to_path_buf();
        assert!(cache_dir.exists());

        client.clean().unwrap();
        assert!(client.cache_dir().is_none());
        assert!(!cache_dir.exists());
    }

    #[test]
    fn clone_works_against_a_local_repository() {
        let source = tempfile::tempdir().unwrap();
        let repo = Repository::init(source.path()).unwrap();
        {
            let signature = git2::Signature::now("tester", "tester@example.com").unwrap();
            let tree_id = repo.index().unwrap().write_tree().unwrap();
            let tree = repo.find_tree(tree_id).unwrap();
            repo.commit(Some("HEAD"), &signature, &signature, "init", &tree, &[])
                .unwrap();
        }

        let client = GitClient::with_host("github.com").unwrap();
        let url = format!("file://{}", source.path().display());
        let cloned = client.clone_url(&url, "org/repo").unwrap();
        assert!(cloned.path().starts_with(client.cache_dir().unwrap()));
    }

    #[tokio::test]
    async fn bot_user_login_pairs_with_the_rotating_token() {
        let store = static_store(&[("/etc/tok", b"secret123")]);
        let options = GitHubOptions {
            token_path: Some(PathBuf::from("/etc/tok")),
            allow_direct_access: true,
            ..Default::default()
        };

        let mut lookup = MockUserLookup::new();
        lookup.expect_bot_user().returning(|| {
            Ok(BotUser {
                login: "prow-bot".to_string(),
            })
        });

        let (user, token) = options
            .bot_user_authentication(&lookup, Some(&store))
            .await
            .unwrap();
        assert_eq!(user, "prow-bot");
        assert_eq!(token.current().unwrap(), b"secret123");
    }

    #[tokio::test]
    async fn git_token_observes_rotation() {
        let raw = Arc::new(StaticStore::new(&[("/etc/tok", b"secret123")]));
        let store: Arc<dyn SecretStore> = Arc::clone(&raw) as Arc<dyn SecretStore>;
        let options = GitHubOptions {
            token_path: Some(PathBuf::from("/etc/tok")),
            allow_direct_access: true,
            ..Default::default()
        };

        let mut lookup = MockUserLookup::new();
        lookup.expect_bot_user().returning(|| {
            Ok(BotUser {
                login: "prow-bot".to_string(),
            })
        });

        let (_, token) = options
            .bot_user_authentication(&lookup, Some(&store))
            .await
            .unwrap();
        assert_eq!(token.current().unwrap(), b"secret123");

        raw.set("/etc/tok", b"rotated456");
        assert_eq!(token.current().unwrap(), b"rotated456");
    }

    #[tokio::test]
    async fn failed_identity_lookup_is_an_auth_resolution_error() {
        let store = static_store(&[("/etc/tok", b"secret123")]);
        let options = GitHubOptions {
            token_path: Some(PathBuf::from("/etc/tok")),
            allow_direct_access: true,
            ..Default::default()
        };

        let mut lookup = MockUserLookup::new();
        lookup
            .expect_bot_user()
            .returning(|| Err(BrokerError::Api("401 Unauthorized".to_string())));

        let err = options
            .bot_user_authentication(&lookup, Some(&store))
            .await
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, BrokerError::AuthResolution(_)));
    }

    #[tokio::test]
    async fn app_auth_bridges_to_the_installation_identity() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/app/installations"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!([{"id": 7}])),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/app/installations/7/access_tokens"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "token": "ghs_installation_token",
                "expires_at": "2099-01-01T00:00:00Z"
            })))
            .mount(&server)
            .await;

        let store = static_store(&[("/etc/key.pem", TEST_RSA_KEY.as_bytes())]);
        let mut options = GitHubOptions {
            app_id: Some("42".to_string()),
            app_private_key_path: Some(PathBuf::from("/etc/key.pem")),
            endpoints: vec![server.uri()],
            ..Default::default()
        };
        options.validate().unwrap();

        let (user, token) = options
            .git_authentication(Some(&store), false)
            .await
            .unwrap();
        assert_eq!(user, GIT_APP_USER);
        assert_eq!(token.current().unwrap(), b"ghs_installation_token");
    }

    #[tokio::test]
    async fn git_client_propagates_credential_failures() {
        let options = GitHubOptions {
            token_path: Some(PathBuf::from("/etc/tok")),
            allow_direct_access: true,
            ..Default::default()
        };

        let err = options.git_client(None, false).await.map(|_| ()).unwrap_err();
        assert!(matches!(err, BrokerError::MissingSecretStore { .. }));
    }
}

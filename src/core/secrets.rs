//! Secret loading, rotation, and censoring
//!
//! This module handles the raw secret material the broker hands to clients:
//! - The `TokenSource` capability: "give me the current credential bytes"
//! - The `SecretStore` collaborator consumed by the auth resolver
//! - A file-backed `Agent` that re-reads registered paths on demand so
//!   rotated secrets take effect without rebuilding any client
//!
//! The agent never spawns background reload tasks; rotation support comes
//! from sources re-reading the store on every call.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use secrecy::{ExposeSecret, SecretBox};

use crate::error::{BrokerError, Result};

/// Replacement text for censored secret values
pub const CENSORED: &[u8] = b"CENSORED";

/// A rotating credential: yields the current secret bytes on every call
///
/// Clients capture a source at construction time and consult it per request,
/// so a rotated secret takes effect without reconstructing the client.
/// Implementations must be safe to call concurrently from many request
/// threads.
pub trait TokenSource: Send + Sync {
    /// The current secret value
    fn current(&self) -> Result<Vec<u8>>;
}

/// Store of raw secrets keyed by path
pub trait SecretStore: Send + Sync {
    /// Register a path with the store
    ///
    /// Fails with `SecretLoad` if the path cannot be read. Registering the
    /// same path twice is harmless.
    fn add(&self, path: &Path) -> Result<()>;

    /// The current value for a registered path, empty if unknown
    fn secret(&self, path: &Path) -> Vec<u8>;

    /// Strip every known secret value out of a byte buffer
    fn censor(&self, content: &[u8]) -> Vec<u8>;
}

/// File-backed secret store
///
/// `add` reads and caches the file; `secret` re-reads it on every call so
/// rotated files are picked up immediately, falling back to the last good
/// value when the re-read fails (e.g. during an atomic replace).
#[derive(Default)]
pub struct Agent {
    secrets: RwLock<HashMap<PathBuf, SecretBox<Vec<u8>>>>,
}

impl Agent {
    /// Create an empty agent
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a rotating token source for a registered path
    pub fn token_source(agent: &Arc<Self>, path: &Path) -> StoredTokenSource {
        StoredTokenSource {
            store: Arc::clone(agent) as Arc<dyn SecretStore>,
            path: path.to_path_buf(),
        }
    }

    fn load(path: &Path) -> Result<Vec<u8>> {
        let raw = fs::read(path).map_err(|source| BrokerError::SecretLoad {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(trim_secret(&raw))
    }

    fn store(&self, path: &Path, value: Vec<u8>) {
        if let Ok(mut secrets) = self.secrets.write() {
            secrets.insert(path.to_path_buf(), SecretBox::new(Box::new(value)));
        }
    }

    fn cached(&self, path: &Path) -> Option<Vec<u8>> {
        let secrets = self.secrets.read().ok()?;
        secrets.get(path).map(|s| s.expose_secret().clone())
    }
}

impl SecretStore for Agent {
    fn add(&self, path: &Path) -> Result<()> {
        let value = Self::load(path)?;
        self.store(path, value);
        Ok(())
    }

    fn secret(&self, path: &Path) -> Vec<u8> {
        match Self::load(path) {
            Ok(value) => {
                self.store(path, value.clone());
                value
            }
            Err(_) => self.cached(path).unwrap_or_default(),
        }
    }

    fn censor(&self, content: &[u8]) -> Vec<u8> {
        let mut censored = content.to_vec();
        if let Ok(secrets) = self.secrets.read() {
            for secret in secrets.values() {
                let value = secret.expose_secret();
                if !value.is_empty() {
                    censored = replace_all(&censored, value, CENSORED);
                }
            }
        }
        censored
    }
}

/// Token source that re-reads a secret store path on every call
pub struct StoredTokenSource {
    store: Arc<dyn SecretStore>,
    path: PathBuf,
}

impl StoredTokenSource {
    /// Create a source for `path` backed by `store`
    pub fn new(store: Arc<dyn SecretStore>, path: PathBuf) -> Self {
        Self { store, path }
    }
}

impl TokenSource for StoredTokenSource {
    fn current(&self) -> Result<Vec<u8>> {
        Ok(self.store.secret(&self.path))
    }
}

/// Token source for anonymous access: always yields an empty secret
pub struct AnonymousTokenSource;

impl TokenSource for AnonymousTokenSource {
    fn current(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// Strip leading and trailing ASCII whitespace
///
/// Tokens are often written with a trailing newline; PEM blocks keep their
/// interior newlines intact.
fn trim_secret(raw: &[u8]) -> Vec<u8> {
    let start = raw
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(raw.len());
    let end = raw
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    raw[start..end].to_vec()
}

/// Replace every occurrence of `needle` in `haystack` with `replacement`
fn replace_all(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    if needle.is_empty() {
        return haystack.to_vec();
    }
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

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn secret_file(contents: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn add_reads_and_trims_the_file() {
        let file = secret_file(b"secret123\n");
        let agent = Agent::new();
        agent.add(file.path()).unwrap();
        assert_eq!(agent.secret(file.path()), b"secret123");
    }

    #[test]
    fn add_fails_for_unreadable_path() {
        let agent = Agent::new();
        let err = agent.add(Path::new("/nonexistent/token")).unwrap_err();
        assert!(matches!(err, BrokerError::SecretLoad { .. }));
    }

    #[test]
    fn add_twice_is_idempotent() {
        let file = secret_file(b"secret123");
        let agent = Agent::new();
        agent.add(file.path()).unwrap();
        agent.add(file.path()).unwrap();
        assert_eq!(agent.secret(file.path()), b"secret123");
    }

    #[test]
    fn source_observes_rotation() {
        let mut file = secret_file(b"old-token");
        let agent = Arc::new(Agent::new());
        agent.add(file.path()).unwrap();

        let source = Agent::token_source(&agent, file.path());
        assert_eq!(source.current().unwrap(), b"old-token");

        file.as_file_mut().set_len(0).unwrap();
        {
            use std::io::Seek;
            file.as_file_mut().rewind().unwrap();
        }
        file.write_all(b"new-token").unwrap();
        file.flush().unwrap();

        assert_eq!(source.current().unwrap(), b"new-token");
    }

    #[test]
    fn secret_falls_back_to_cache_when_file_vanishes() {
        let file = secret_file(b"secret123");
        let agent = Agent::new();
        agent.add(file.path()).unwrap();

        let path = file.path().to_path_buf();
        drop(file);
        assert_eq!(agent.secret(&path), b"secret123");
    }

    #[test]
    fn censor_strips_known_secrets() {
        let file = secret_file(b"hunter2");
        let agent = Agent::new();
        agent.add(file.path()).unwrap();

        let censored = agent.censor(b"token is hunter2, repeat hunter2");
        assert_eq!(censored, b"token is CENSORED, repeat CENSORED");
    }

    #[test]
    fn anonymous_source_yields_empty_secret() {
        assert!(AnonymousTokenSource.current().unwrap().is_empty());
    }
}

//! HTTP-01 challenge publication via the proxy's webroot.
//!
//! The CA validates domain ownership by fetching
//! `http://<domain>/.well-known/acme-challenge/<token>`. The proxy already
//! serves that path from a webroot directory; the issuer only has to drop
//! the key authorization into the right file and remove it afterwards.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::AcmeError;

/// Path under the webroot where key authorizations are published.
pub const CHALLENGE_SUBDIR: &str = ".well-known/acme-challenge";

/// Publishes and retires HTTP-01 key authorizations in a webroot.
#[derive(Debug, Clone)]
pub struct WebrootChallenges {
    dir: PathBuf,
}

impl WebrootChallenges {
    /// Open (and create) the challenge directory under `webroot`.
    pub fn new(webroot: &Path) -> Result<Self, AcmeError> {
        let dir = webroot.join(CHALLENGE_SUBDIR);
        fs::create_dir_all(&dir).map_err(|source| AcmeError::Storage {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    /// Publish a key authorization for a challenge token.
    pub fn publish(&self, token: &str, key_authorization: &str) -> Result<(), AcmeError> {
        let path = self.token_path(token)?;
        fs::write(&path, key_authorization).map_err(|source| AcmeError::Storage {
            path: path.clone(),
            source,
        })?;
        debug!(token = %token, "Published HTTP-01 challenge");
        Ok(())
    }

    /// Remove a completed or abandoned challenge. Missing files are fine;
    /// the attempt may have failed before publication.
    pub fn remove(&self, token: &str) {
        let Ok(path) = self.token_path(token) else {
            return;
        };
        match fs::remove_file(&path) {
            Ok(()) => debug!(token = %token, "Removed HTTP-01 challenge"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(token = %token, error = %e, "Failed to remove challenge file"),
        }
    }

    /// Number of currently published challenge files.
    pub fn published_count(&self) -> usize {
        fs::read_dir(&self.dir)
            .map(|entries| entries.filter_map(|e| e.ok()).count())
            .unwrap_or(0)
    }

    /// Tokens come from the CA; refuse anything that does not stay a plain
    /// filename inside the challenge directory.
    fn token_path(&self, token: &str) -> Result<PathBuf, AcmeError> {
        let safe = !token.is_empty()
            && token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !safe {
            return Err(AcmeError::BadToken {
                token: token.to_string(),
            });
        }
        Ok(self.dir.join(token))
    }
}

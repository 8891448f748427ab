//! Configuration loading and validation for certkeeper.
//!
//! Both daemons (`certkeeper issue` and `certkeeper watch`) are configured
//! from the same TOML file so the filesystem contract between them (the
//! bundle root and the well-known filenames inside it) is written down
//! exactly once. See [`Config::from_file`] for the entry point.
//!
//! Validation happens in two passes:
//!
//! - Field validation ([`Config::validate`]) via `validator` derive plus a
//!   few manual checks (domain syntax, ACME directory URL). Cheap, always
//!   run on load.
//! - Deep validation ([`validate::validate_config`]) which inspects the
//!   filesystem and any existing live certificate. Run by `certkeeper test`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use validator::Validate;

pub mod validate;

/// The filesystem contract shared by the issuer and the watcher.
///
/// These names are fixed and agreed on by both daemons; they are part of the
/// integration contract, never discovered at runtime.
pub mod contract {
    /// Directory of per-domain symlinks to the current bundle version.
    pub const LIVE_DIR: &str = "live";

    /// Directory of immutable, versioned bundle directories.
    pub const VERSIONS_DIR: &str = "versions";

    /// Leaf certificate plus intermediates, PEM.
    pub const FULLCHAIN_FILE: &str = "fullchain.pem";

    /// Private key, PEM, mode 0600.
    pub const PRIVKEY_FILE: &str = "privkey.pem";

    /// Intermediates only, PEM. Used for stapling setups; optional.
    pub const CHAIN_FILE: &str = "chain.pem";
}

/// Let's Encrypt production directory URL.
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory URL (relaxed rate limits, untrusted roots).
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Errors from configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid configuration: {0}")]
    Fields(#[from] validator::ValidationErrors),
}

/// Top-level certkeeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Shared bundle tree, the only integration point between the daemons.
    #[validate(nested)]
    pub bundle: BundleConfig,

    /// Issuer daemon settings.
    #[validate(nested)]
    pub issuer: IssuerConfig,

    /// Watcher daemon settings.
    #[validate(nested)]
    #[serde(default)]
    pub watcher: WatcherConfig,
}

/// Location of the shared certificate bundle tree.
///
/// Layout under `root` (the integration contract, not discovered at runtime):
///
/// ```text
/// <root>/live/<domain>                 -> symlink into versions/
/// <root>/versions/<domain>/<version>/  fullchain.pem, privkey.pem, chain.pem
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct BundleConfig {
    /// Bundle tree root. Must be on a single filesystem so that symlink
    /// replacement via rename stays atomic.
    pub root: PathBuf,
}

/// Issuer daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct IssuerConfig {
    /// Domains covered by the certificate. The first entry is the primary
    /// domain and names the bundle directory.
    #[validate(length(min = 1, message = "at least one domain is required"))]
    pub domains: Vec<String>,

    /// Administrative contact registered with the CA.
    #[validate(email)]
    pub contact: String,

    /// Renewal window: attempt renewal when fewer than this many days of
    /// validity remain. The guard against rate-limit exhaustion.
    #[validate(range(min = 1, max = 89))]
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u32,

    /// Fixed cadence between renewal checks, in hours.
    #[validate(range(min = 1, max = 168))]
    #[serde(default = "default_check_interval_hours")]
    pub check_interval_hours: u64,

    /// Explicit ACME directory URL. Overrides `staging` when set.
    #[serde(default)]
    pub acme_directory: Option<String>,

    /// Use the Let's Encrypt staging environment.
    #[serde(default)]
    pub staging: bool,

    /// Private issuer state directory (ACME account credentials).
    pub storage: PathBuf,

    /// Webroot where HTTP-01 key authorizations are published for the proxy
    /// to serve under `/.well-known/acme-challenge/`.
    pub challenge_webroot: PathBuf,

    /// Number of published bundle versions to retain when pruning.
    #[validate(range(min = 1, max = 32))]
    #[serde(default = "default_keep_versions")]
    pub keep_versions: usize,
}

/// Watcher daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct WatcherConfig {
    /// Poll interval while waiting for the first bundle, and for the
    /// fallback poll while serving.
    #[validate(range(min = 1, max = 300))]
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// How often to log progress while still waiting for a bundle, so an
    /// operator can tell "booting" from "stuck".
    #[validate(range(min = 5, max = 3600))]
    #[serde(default = "default_waiting_log_interval_secs")]
    pub waiting_log_interval_secs: u64,

    /// Settle window after a filesystem event before acting on it. A single
    /// symlink swap can surface as several events on some platforms.
    #[validate(range(min = 0, max = 10_000))]
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Grace period on shutdown for in-flight reload work.
    #[validate(range(min = 0, max = 600))]
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    /// Proxy configuration check command (e.g. `["nginx", "-t"]`).
    /// Empty disables the external check; the internal bundle checks
    /// still apply.
    #[serde(default)]
    pub validate_command: Vec<String>,

    /// Proxy zero-downtime reload command (e.g. `["nginx", "-s", "reload"]`).
    #[serde(default)]
    pub reload_command: Vec<String>,
}

fn default_renew_before_days() -> u32 {
    30
}

fn default_check_interval_hours() -> u64 {
    12
}

fn default_keep_versions() -> usize {
    3
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_waiting_log_interval_secs() -> u64 {
    60
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_drain_timeout_secs() -> u64 {
    30
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            waiting_log_interval_secs: default_waiting_log_interval_secs(),
            debounce_ms: default_debounce_ms(),
            drain_timeout_secs: default_drain_timeout_secs(),
            validate_command: Vec::new(),
            reload_command: Vec::new(),
        }
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading configuration file");

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = toml::from_str(&content)?;
        config.validate_fields()?;

        info!(
            path = %path.display(),
            domains = ?config.issuer.domains,
            bundle_root = %config.bundle.root.display(),
            "Loaded configuration"
        );

        Ok(config)
    }

    /// Run field-level validation.
    ///
    /// Derive-based checks first, then the manual checks the derive macro
    /// cannot express (domain syntax, ACME directory URL).
    pub fn validate_fields(&self) -> Result<(), ConfigError> {
        self.validate()?;

        for domain in &self.issuer.domains {
            if !is_valid_domain(domain) {
                return Err(ConfigError::Invalid(format!(
                    "invalid domain name: '{domain}'"
                )));
            }
        }

        if let Some(ref dir) = self.issuer.acme_directory {
            let url = url::Url::parse(dir)
                .map_err(|e| ConfigError::Invalid(format!("invalid ACME directory URL: {e}")))?;
            if url.scheme() != "https" {
                return Err(ConfigError::Invalid(format!(
                    "ACME directory URL must use https: '{dir}'"
                )));
            }
        }

        Ok(())
    }

    /// The primary domain: first in the list, names the bundle directory.
    pub fn primary_domain(&self) -> &str {
        &self.issuer.domains[0]
    }
}

impl IssuerConfig {
    /// Effective ACME directory URL, honoring the override and the
    /// staging flag.
    pub fn directory_url(&self) -> String {
        match &self.acme_directory {
            Some(url) => url.clone(),
            None if self.staging => LETS_ENCRYPT_STAGING.to_string(),
            None => LETS_ENCRYPT_PRODUCTION.to_string(),
        }
    }

    /// Cadence between renewal checks.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_hours * 3600)
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn waiting_log_interval(&self) -> Duration {
        Duration::from_secs(self.waiting_log_interval_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Syntactic domain name check.
///
/// Accepts a leading wildcard label (`*.example.com`); everything else must
/// be LDH labels separated by dots.
fn is_valid_domain(domain: &str) -> bool {
    let rest = domain.strip_prefix("*.").unwrap_or(domain);

    if rest.is_empty() || rest.len() > 253 || rest.contains("*") {
        return false;
    }

    rest.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_toml() -> &'static str {
        r#"
            [bundle]
            root = "/var/lib/certkeeper/bundles"

            [issuer]
            domains = ["example.com", "www.example.com"]
            contact = "admin@example.com"
            storage = "/var/lib/certkeeper/acme"
            challenge_webroot = "/var/www/certkeeper"

            [watcher]
            validate_command = ["nginx", "-t"]
            reload_command = ["nginx", "-s", "reload"]
        "#
    }

    #[test]
    fn test_load_minimal_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(minimal_toml().as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();

        assert_eq!(config.primary_domain(), "example.com");
        assert_eq!(config.issuer.renew_before_days, 30);
        assert_eq!(config.issuer.check_interval_hours, 12);
        assert_eq!(config.issuer.directory_url(), LETS_ENCRYPT_PRODUCTION);
        assert_eq!(config.watcher.poll_interval_secs, 5);
        assert_eq!(config.watcher.reload_command, vec!["nginx", "-s", "reload"]);
    }

    #[test]
    fn test_staging_flag_selects_staging_directory() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.issuer.staging = true;
        assert_eq!(config.issuer.directory_url(), LETS_ENCRYPT_STAGING);
    }

    #[test]
    fn test_explicit_directory_overrides_staging() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.issuer.staging = true;
        config.issuer.acme_directory = Some("https://acme.internal/directory".to_string());
        assert_eq!(config.issuer.directory_url(), "https://acme.internal/directory");
    }

    #[test]
    fn test_rejects_empty_domains() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.issuer.domains.clear();
        assert!(config.validate_fields().is_err());
    }

    #[test]
    fn test_rejects_bad_contact() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.issuer.contact = "not-an-email".to_string();
        assert!(config.validate_fields().is_err());
    }

    #[test]
    fn test_rejects_http_acme_directory() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.issuer.acme_directory = Some("http://insecure/directory".to_string());
        assert!(config.validate_fields().is_err());
    }

    #[test]
    fn test_rejects_bad_domain() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.issuer.domains = vec!["exa mple.com".to_string()];
        assert!(config.validate_fields().is_err());
    }

    #[test]
    fn test_domain_syntax() {
        assert!(is_valid_domain("example.com"));
        assert!(is_valid_domain("*.example.com"));
        assert!(is_valid_domain("a-b.example.co.uk"));
        assert!(!is_valid_domain(""));
        assert!(!is_valid_domain("*.*.example.com"));
        assert!(!is_valid_domain("-bad.example.com"));
        assert!(!is_valid_domain("exa_mple.com"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let toml_str = format!("{}\nsurprise = true\n", minimal_toml());
        assert!(toml::from_str::<Config>(&toml_str).is_err());
    }
}

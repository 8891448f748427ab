//! Filesystem accessibility validation.
//!
//! The daemons create their own directories at startup, so a missing path is
//! only a warning here. A path that exists but is the wrong kind of thing is
//! an error: the daemon would hit it as a fatal condition at runtime.

use std::path::Path;

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;

/// Validate the directories named by the configuration.
pub fn validate_paths(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    check_directory(&mut result, &config.bundle.root, "bundle.root");
    check_directory(&mut result, &config.issuer.storage, "issuer.storage");
    check_directory(
        &mut result,
        &config.issuer.challenge_webroot,
        "issuer.challenge_webroot",
    );

    if config.issuer.storage.starts_with(&config.bundle.root) {
        result.add_warning(ValidationWarning::new(format!(
            "issuer.storage {} lives inside bundle.root {}: account credentials \
             would be visible to bundle readers",
            config.issuer.storage.display(),
            config.bundle.root.display()
        )));
    }

    result
}

fn check_directory(result: &mut ValidationResult, path: &Path, field: &str) {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            result.add_error(ValidationError::new(
                ErrorCategory::Filesystem,
                format!("{field} {} exists but is not a directory", path.display()),
            ));
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            result.add_warning(ValidationWarning::new(format!(
                "{field} {} does not exist yet (will be created at startup)",
                path.display()
            )));
        }
        Err(e) => {
            result.add_error(ValidationError::new(
                ErrorCategory::Filesystem,
                format!("{field} {} is not accessible: {e}", path.display()),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BundleConfig, IssuerConfig, WatcherConfig};

    fn test_config(root: &Path) -> Config {
        Config {
            bundle: BundleConfig {
                root: root.join("bundles"),
            },
            issuer: IssuerConfig {
                domains: vec!["example.com".to_string()],
                contact: "admin@example.com".to_string(),
                renew_before_days: 30,
                check_interval_hours: 12,
                acme_directory: None,
                staging: false,
                storage: root.join("acme"),
                challenge_webroot: root.join("webroot"),
                keep_versions: 3,
            },
            watcher: WatcherConfig::default(),
        }
    }

    #[test]
    fn test_missing_directories_warn_only() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = validate_paths(&test_config(dir.path()));
        assert!(result.is_ok());
        assert_eq!(result.warnings.len(), 3);
    }

    #[test]
    fn test_file_in_place_of_directory_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("bundles"), "not a dir").unwrap();

        let result = validate_paths(&test_config(dir.path()));
        assert!(!result.is_ok());
        assert!(result.errors[0].message.contains("not a directory"));
    }

    #[test]
    fn test_storage_inside_bundle_root_warns() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        config.issuer.storage = config.bundle.root.join("acme");

        let result = validate_paths(&config);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.message.contains("account credentials")));
    }
}

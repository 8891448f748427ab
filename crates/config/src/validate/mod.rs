//! Deep configuration validation.
//!
//! Field-level checks live on [`crate::Config`]; this module inspects the
//! environment the configuration points at: the bundle tree, the issuer
//! storage, and any live certificate already published. Used by
//! `certkeeper test`.

use std::fmt;

use crate::Config;

mod certs;
mod paths;

pub use certs::validate_live_certificate;
pub use paths::validate_paths;

/// What part of the configuration a finding belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Certificate,
    Filesystem,
    Command,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Certificate => write!(f, "certificate"),
            Self::Filesystem => write!(f, "filesystem"),
            Self::Command => write!(f, "command"),
        }
    }
}

/// A blocking validation finding.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ValidationError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

/// A non-blocking validation finding.
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Accumulated result of a validation pass.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// True when no blocking errors were found.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Run all deep validation checks.
pub fn validate_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    result.merge(validate_paths(config));
    result.merge(validate_live_certificate(config));

    if config.watcher.reload_command.is_empty() {
        result.add_warning(ValidationWarning::new(
            "watcher.reload_command is empty: the watcher will detect bundle \
             changes but cannot reload the proxy",
        ));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_accumulates() {
        let mut result = ValidationResult::new();
        assert!(result.is_ok());

        result.add_warning(ValidationWarning::new("minor"));
        assert!(result.is_ok());

        result.add_error(ValidationError::new(ErrorCategory::Filesystem, "major"));
        assert!(!result.is_ok());

        let mut merged = ValidationResult::new();
        merged.merge(result);
        assert_eq!(merged.errors.len(), 1);
        assert_eq!(merged.warnings.len(), 1);
    }
}

//! Live certificate validation.
//!
//! Inspects the certificate currently published under the bundle root, if
//! any. A missing bundle is not an error: pre-bootstrap, the tree is empty
//! by design and the issuer will populate it.

use std::path::Path;

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::{contract, Config};

/// Days of remaining validity below which a warning is emitted.
const EXPIRY_WARNING_DAYS: i64 = 30;

/// Validate the live certificate for the primary domain, when present.
pub fn validate_live_certificate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    let cert_path = config
        .bundle
        .root
        .join(contract::LIVE_DIR)
        .join(config.primary_domain())
        .join(contract::FULLCHAIN_FILE);

    if !cert_path.exists() {
        // Pre-bootstrap: nothing published yet.
        return result;
    }

    let key_path = cert_path.with_file_name(contract::PRIVKEY_FILE);
    if !key_path.exists() {
        result.add_error(ValidationError::new(
            ErrorCategory::Certificate,
            format!(
                "live bundle is incomplete: {} exists but {} is missing",
                cert_path.display(),
                key_path.display()
            ),
        ));
        return result;
    }

    match inspect_certificate(&cert_path) {
        Ok(Some(warning)) => result.add_warning(warning),
        Ok(None) => {}
        Err(e) => result.add_error(e),
    }

    result
}

/// Parse the leaf certificate and check its expiry.
fn inspect_certificate(cert_path: &Path) -> Result<Option<ValidationWarning>, ValidationError> {
    let cert_pem = std::fs::read(cert_path).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("failed to read certificate {}: {e}", cert_path.display()),
        )
    })?;

    let blocks = pem::parse_many(&cert_pem).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("failed to parse certificate {}: {e}", cert_path.display()),
        )
    })?;

    let leaf = blocks.first().ok_or_else(|| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("no PEM blocks in certificate {}", cert_path.display()),
        )
    })?;

    let (_, cert) = x509_parser::parse_x509_certificate(leaf.contents()).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("invalid X509 certificate {}: {e}", cert_path.display()),
        )
    })?;

    use std::time::{Duration, SystemTime};

    let not_after = cert.validity().not_after.to_datetime().unix_timestamp();
    let expiry_time = if not_after >= 0 {
        SystemTime::UNIX_EPOCH + Duration::from_secs(not_after as u64)
    } else {
        SystemTime::UNIX_EPOCH
    };
    let now = SystemTime::now();

    if expiry_time < now {
        return Err(ValidationError::new(
            ErrorCategory::Certificate,
            format!(
                "certificate expired: {} (expired at {})",
                cert_path.display(),
                cert.validity().not_after
            ),
        ));
    }

    let warning_window = Duration::from_secs(EXPIRY_WARNING_DAYS as u64 * 86400);
    if expiry_time < now + warning_window {
        return Ok(Some(ValidationWarning::new(format!(
            "certificate expires soon: {} (expires at {})",
            cert_path.display(),
            cert.validity().not_after
        ))));
    }

    Ok(None)
}

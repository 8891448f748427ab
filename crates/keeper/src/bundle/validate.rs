//! Pre-reload bundle validation.
//!
//! Second line of defense behind the issuer's atomic-swap discipline: the
//! watcher never hands the proxy a bundle that fails these checks. A
//! rejected candidate is logged and skipped; the proxy keeps serving the
//! previous, known-good material.

use chrono::{DateTime, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;

use super::CertificateBundle;

/// Why a candidate bundle was refused.
#[derive(Debug, thiserror::Error)]
pub enum BundleRejection {
    #[error("certificate expired at {not_after}")]
    Expired { not_after: DateTime<Utc> },

    #[error("certificate not valid until {not_before}")]
    NotYetValid { not_before: DateTime<Utc> },

    #[error("certificate does not cover configured domain '{domain}'")]
    DomainNotCovered { domain: String },

    #[error("certificate chain does not load: {0}")]
    BadCertificate(String),

    #[error("private key does not load: {0}")]
    BadKey(String),

    #[error("private key does not match the certificate")]
    KeyMismatch,
}

/// Validate a candidate bundle against the configured domains at `now`.
pub fn validate_bundle(
    bundle: &CertificateBundle,
    domains: &[String],
    now: DateTime<Utc>,
) -> Result<(), BundleRejection> {
    if bundle.meta.not_after <= now {
        return Err(BundleRejection::Expired {
            not_after: bundle.meta.not_after,
        });
    }
    if bundle.meta.not_before > now {
        return Err(BundleRejection::NotYetValid {
            not_before: bundle.meta.not_before,
        });
    }

    for domain in domains {
        if !bundle.meta.covers(domain) {
            return Err(BundleRejection::DomainNotCovered {
                domain: domain.clone(),
            });
        }
    }

    let certs = load_certs(&bundle.fullchain_pem)?;
    let key = load_key(&bundle.privkey_pem)?;
    check_consistency(certs, key)
}

fn load_certs(fullchain_pem: &str) -> Result<Vec<CertificateDer<'static>>, BundleRejection> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut fullchain_pem.as_bytes())
        .collect::<Result<_, _>>()
        .map_err(|e| BundleRejection::BadCertificate(e.to_string()))?;
    if certs.is_empty() {
        return Err(BundleRejection::BadCertificate(
            "no certificates in chain".to_string(),
        ));
    }
    Ok(certs)
}

fn load_key(privkey_pem: &str) -> Result<PrivateKeyDer<'static>, BundleRejection> {
    rustls_pemfile::private_key(&mut privkey_pem.as_bytes())
        .map_err(|e| BundleRejection::BadKey(e.to_string()))?
        .ok_or_else(|| BundleRejection::BadKey("no private key found".to_string()))
}

/// Cert/key consistency via rustls. Catches the mismatched-key case that a
/// pure parse cannot.
fn check_consistency(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<(), BundleRejection> {
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    let signing_key = provider
        .key_provider
        .load_private_key(key)
        .map_err(|e| BundleRejection::BadKey(e.to_string()))?;

    let certified = CertifiedKey::new(certs, signing_key);
    match certified.keys_match() {
        Ok(()) => Ok(()),
        // The provider cannot always extract a public key to compare;
        // treat "unknown" as passing rather than refusing a good bundle.
        Err(rustls::Error::InconsistentKeys(rustls::InconsistentKeys::Unknown)) => Ok(()),
        Err(_) => Err(BundleRejection::KeyMismatch),
    }
}

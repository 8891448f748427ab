//! Certificate bundle model.
//!
//! A bundle is the unit of truth shared between the issuer and the watcher:
//! a full certificate chain, a private key, and optionally the intermediate
//! chain on its own, living under a well-known directory layout (see
//! [`certkeeper_config::contract`]). Bundles are replaced wholesale by the
//! issuer and consumed read-only by the watcher; they are never mutated in
//! place.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};

mod store;
mod validate;

pub use store::{BundleStore, StoreError};
pub use validate::{validate_bundle, BundleRejection};

/// Content-derived version marker for a bundle.
///
/// SHA-256 over the full chain and the private key. The watcher compares
/// fingerprints to decide whether an observed filesystem event actually
/// changed the bundle.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint the material that matters for a reload decision.
    pub fn of(fullchain_pem: &str, privkey_pem: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(fullchain_pem.as_bytes());
        hasher.update(privkey_pem.as_bytes());
        Self(hasher.finalize().into())
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

/// Metadata parsed out of the leaf certificate itself.
///
/// The issuer re-derives renewal eligibility from this on every tick rather
/// than trusting a separate state file that could drift from what is
/// actually on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafMetadata {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// DNS names the certificate covers (SANs, plus the subject CN when no
    /// SAN extension is present).
    pub dns_names: Vec<String>,
    pub issuer: String,
}

impl LeafMetadata {
    /// Remaining whole days of validity at `now`. Negative once expired.
    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_days()
    }

    /// Whether `domain` is covered, honoring single-label wildcards.
    pub fn covers(&self, domain: &str) -> bool {
        self.dns_names.iter().any(|san| san_matches(san, domain))
    }
}

/// A complete certificate bundle loaded from the live directory.
#[derive(Debug, Clone)]
pub struct CertificateBundle {
    pub fullchain_pem: String,
    pub privkey_pem: String,
    pub chain_pem: Option<String>,
    pub fingerprint: Fingerprint,
    pub meta: LeafMetadata,
}

/// Errors from parsing certificate material.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid PEM: {0}")]
    Pem(#[from] pem::PemError),

    #[error("no certificate blocks in PEM input")]
    Empty,

    #[error("invalid X509 certificate: {0}")]
    X509(String),

    #[error("certificate validity timestamp out of range")]
    Timestamp,
}

/// Parse the leaf (first) certificate of a PEM chain.
pub fn parse_leaf_metadata(chain_pem: &str) -> Result<LeafMetadata, ParseError> {
    let blocks = pem::parse_many(chain_pem.as_bytes())?;
    let leaf = blocks.first().ok_or(ParseError::Empty)?;

    let (_, cert) = x509_parser::parse_x509_certificate(leaf.contents())
        .map_err(|e| ParseError::X509(e.to_string()))?;

    let not_before = asn1_to_chrono(&cert.validity().not_before)?;
    let not_after = asn1_to_chrono(&cert.validity().not_after)?;

    let mut dns_names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let x509_parser::extensions::GeneralName::DNSName(dns) = name {
                dns_names.push((*dns).to_string());
            }
        }
    }
    if dns_names.is_empty() {
        if let Some(cn) = cert.subject().iter_common_name().next() {
            if let Ok(cn) = cn.as_str() {
                dns_names.push(cn.to_string());
            }
        }
    }

    Ok(LeafMetadata {
        not_before,
        not_after,
        dns_names,
        issuer: cert.issuer().to_string(),
    })
}

fn asn1_to_chrono(t: &x509_parser::time::ASN1Time) -> Result<DateTime<Utc>, ParseError> {
    Utc.timestamp_opt(t.to_datetime().unix_timestamp(), 0)
        .single()
        .ok_or(ParseError::Timestamp)
}

/// Split the intermediate chain off a fullchain PEM.
///
/// Returns the PEM text of every certificate after the leaf, or `None` when
/// the chain contains only the leaf.
pub fn split_chain(fullchain_pem: &str) -> Result<Option<String>, ParseError> {
    let blocks = pem::parse_many(fullchain_pem.as_bytes())?;
    if blocks.is_empty() {
        return Err(ParseError::Empty);
    }

    if blocks.len() < 2 {
        return Ok(None);
    }

    let chain = blocks[1..]
        .iter()
        .map(pem::encode)
        .collect::<Vec<_>>()
        .join("");
    Ok(Some(chain))
}

/// Wildcard-aware SAN match: `*.example.com` covers exactly one extra label.
fn san_matches(san: &str, domain: &str) -> bool {
    if let Some(suffix) = san.strip_prefix("*.") {
        match domain.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest.eq_ignore_ascii_case(suffix),
            None => false,
        }
    } else {
        san.eq_ignore_ascii_case(domain)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Helpers for minting real certificate material in tests.

    use rcgen::{CertificateParams, KeyPair};

    /// Self-signed certificate and matching key for `domains`, valid for
    /// `days` days from now.
    pub fn self_signed(domains: &[&str], days: i64) -> (String, String) {
        let mut params =
            CertificateParams::new(domains.iter().map(|d| d.to_string()).collect::<Vec<_>>())
                .unwrap();
        let now = ::std::time::SystemTime::now();
        params.not_before = now.into();
        params.not_after = (now + ::std::time::Duration::from_secs(days.max(0) as u64 * 86400)).into();

        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = Fingerprint::of("cert-a", "key-a");
        let b = Fingerprint::of("cert-a", "key-a");
        let c = Fingerprint::of("cert-b", "key-a");
        let d = Fingerprint::of("cert-a", "key-b");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.short().len(), 12);
    }

    #[test]
    fn test_parse_leaf_metadata() {
        let (cert_pem, _) = testutil::self_signed(&["example.com", "www.example.com"], 90);
        let meta = parse_leaf_metadata(&cert_pem).unwrap();

        assert!(meta.covers("example.com"));
        assert!(meta.covers("www.example.com"));
        assert!(!meta.covers("other.com"));

        let days = meta.days_remaining(Utc::now());
        assert!((85..=90).contains(&days), "days_remaining = {days}");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_leaf_metadata("not pem at all").is_err());
        assert!(parse_leaf_metadata("").is_err());
    }

    #[test]
    fn test_wildcard_san_matching() {
        assert!(san_matches("*.example.com", "api.example.com"));
        assert!(san_matches("*.example.com", "API.EXAMPLE.COM"));
        assert!(!san_matches("*.example.com", "example.com"));
        assert!(!san_matches("*.example.com", "a.b.example.com"));
        assert!(san_matches("example.com", "Example.com"));
        assert!(!san_matches("example.com", "www.example.com"));
    }

    #[test]
    fn test_split_chain_single_cert() {
        let (cert_pem, _) = testutil::self_signed(&["example.com"], 90);
        assert!(split_chain(&cert_pem).unwrap().is_none());
    }

    #[test]
    fn test_split_chain_with_intermediate() {
        let (leaf, _) = testutil::self_signed(&["example.com"], 90);
        let (intermediate, _) = testutil::self_signed(&["ca.example.com"], 900);
        let fullchain = format!("{leaf}{intermediate}");

        let chain = split_chain(&fullchain).unwrap().unwrap();
        let meta = parse_leaf_metadata(&chain).unwrap();
        assert!(meta.covers("ca.example.com"));
    }
}

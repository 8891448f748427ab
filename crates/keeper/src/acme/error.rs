//! ACME error types and their retry classification.

use std::path::PathBuf;

/// Errors from the ACME subsystem.
#[derive(Debug, thiserror::Error)]
pub enum AcmeError {
    /// Protocol-level failure talking to the CA. Transient: the CA may be
    /// down, rate limiting, or the challenge infrastructure not yet ready.
    #[error("ACME protocol error: {0}")]
    Protocol(#[from] instant_acme::Error),

    #[error("authorization failed: {0}")]
    Authorization(String),

    #[error("CA offered no HTTP-01 challenge")]
    NoHttp01Challenge,

    #[error("unexpected order state: {0}")]
    OrderState(String),

    #[error("challenge token '{token}' is not a safe filename")]
    BadToken { token: String },

    /// Local storage failure (account credentials, challenge webroot).
    #[error("ACME storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode account credentials: {0}")]
    Credentials(#[from] serde_json::Error),
}

impl AcmeError {
    /// Whether this error should terminate the issuer rather than be
    /// retried on the next cadence tick.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Storage { source, .. } => crate::errors::io_is_fatal(source),
            // Encoding freshly created credentials failing is a bug, not
            // something the next tick will fix.
            Self::Credentials(_) => true,
            _ => false,
        }
    }
}

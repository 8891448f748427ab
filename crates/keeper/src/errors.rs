//! Top-level error taxonomy.
//!
//! Three kinds of failure: transient failures (CA unreachable, challenge not yet
//! satisfiable, watch subscription dropped) are retried on the next natural
//! cadence or poll; validation failures skip a reload and keep the old
//! material live; fatal local conditions (disk full, permission denied,
//! broken configuration) exit the process non-zero so a supervisor can
//! alert. Classification lives on the error types themselves so the daemon
//! loops never pattern-match on message strings.

use crate::acme::AcmeError;
use crate::bundle::StoreError;
use crate::reload::ReloadError;

/// Aggregated daemon error.
#[derive(Debug, thiserror::Error)]
pub enum KeeperError {
    #[error(transparent)]
    Config(#[from] certkeeper_config::ConfigError),

    #[error(transparent)]
    Acme(#[from] AcmeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Reload(#[from] ReloadError),
}

impl KeeperError {
    /// Whether this error should terminate the daemon.
    pub fn is_fatal(&self) -> bool {
        match self {
            // Mis-configuration never fixes itself across retries.
            Self::Config(_) => true,
            Self::Acme(e) => e.is_fatal(),
            Self::Store(e) => e.is_fatal(),
            // Reload failures keep the old material serving; never fatal.
            Self::Reload(_) => false,
        }
    }
}

/// Local I/O conditions that retrying cannot resolve.
pub(crate) fn io_is_fatal(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::PermissionDenied | ErrorKind::StorageFull | ErrorKind::ReadOnlyFilesystem
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_classification() {
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(io_is_fatal(&denied));

        let flaky = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(!io_is_fatal(&flaky));

        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert!(!io_is_fatal(&missing));
    }
}

//! Certkeeper Library
//!
//! TLS certificate lifecycle coordination for a reverse proxy, split into
//! two cooperating daemons that share nothing but a directory tree:
//!
//! - **Issuer**: obtains and renews certificates over ACME on a fixed
//!   cadence and publishes them atomically into the bundle store
//! - **Watcher**: runs next to the proxy, waits for certificate material,
//!   and drives validated zero-downtime reloads when it changes
//!
//! # Example
//!
//! ```ignore
//! use certkeeper::{IssuerDaemon, WatcherDaemon, CommandReloadTarget};
//! use certkeeper::shutdown::listen_for_signals;
//! use certkeeper_config::Config;
//!
//! let config = Config::from_file("certkeeper.toml")?;
//! let shutdown = listen_for_signals()?;
//!
//! let target = CommandReloadTarget::new(
//!     config.watcher.validate_command.clone(),
//!     config.watcher.reload_command.clone(),
//! )?;
//! WatcherDaemon::new(config, target).run(shutdown).await?;
//! ```


// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod bundle;
pub mod errors;
pub mod issuer;
pub mod reload;
pub mod shutdown;
pub mod watcher;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Error handling
pub use errors::KeeperError;

// ACME account and ordering
pub use acme::{AcmeClient, AcmeError, IssuedCertificate, WebrootChallenges};

// Bundle store
pub use bundle::{
    validate_bundle, BundleRejection, BundleStore, CertificateBundle, Fingerprint, LeafMetadata,
    StoreError,
};

// Issuer daemon
pub use issuer::{renewal_due, AttemptOutcome, CertificateSource, IssuerDaemon, RenewalState};

// Watcher daemon
pub use watcher::{ReloadOutcome, WatcherDaemon, WatcherState};

// Proxy reload primitives
pub use reload::{CommandReloadTarget, DrainCoordinator, ReloadError, ReloadTarget};

// Shutdown signaling
pub use shutdown::{listen_for_signals, Shutdown, ShutdownHandle};

//! Proxy reload execution.
//!
//! "Validate the configuration" and "reload without dropping connections"
//! are primitives of whatever proxy terminates TLS; this module only invokes
//! them at the right time. The [`ReloadTarget`] trait is the seam: the
//! daemon drives a [`CommandReloadTarget`] in production and a scripted
//! double in tests.

use std::process::Stdio;

use async_trait::async_trait;
use tracing::{debug, info, warn};

mod coordinator;

pub use coordinator::{DrainCoordinator, InflightGuard};

/// Errors from driving the proxy's validate/reload primitives.
#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error("no reload command configured")]
    NotConfigured,

    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// The proxy-side primitives the watcher invokes.
#[async_trait]
pub trait ReloadTarget: Send + Sync {
    /// Check that the proxy would accept its configuration with the new
    /// bundle in place (e.g. `nginx -t`). Must not disturb the live
    /// listener.
    async fn validate(&self) -> Result<(), ReloadError>;

    /// Swap the new bundle in without dropping existing connections
    /// (e.g. `nginx -s reload`).
    async fn reload(&self) -> Result<(), ReloadError>;
}

/// Drives configured external commands.
#[derive(Debug, Clone)]
pub struct CommandReloadTarget {
    validate_command: Vec<String>,
    reload_command: Vec<String>,
}

impl CommandReloadTarget {
    /// Build from configured argv vectors. `reload_command` must be
    /// non-empty; an empty `validate_command` disables the external check
    /// (the watcher's internal bundle checks still apply).
    pub fn new(
        validate_command: Vec<String>,
        reload_command: Vec<String>,
    ) -> Result<Self, ReloadError> {
        if reload_command.is_empty() {
            return Err(ReloadError::NotConfigured);
        }
        Ok(Self {
            validate_command,
            reload_command,
        })
    }
}

#[async_trait]
impl ReloadTarget for CommandReloadTarget {
    async fn validate(&self) -> Result<(), ReloadError> {
        if self.validate_command.is_empty() {
            debug!("No external validate command configured, skipping");
            return Ok(());
        }
        run_command(&self.validate_command).await
    }

    async fn reload(&self) -> Result<(), ReloadError> {
        run_command(&self.reload_command).await?;
        info!(command = %self.reload_command.join(" "), "Proxy reload command succeeded");
        Ok(())
    }
}

async fn run_command(argv: &[String]) -> Result<(), ReloadError> {
    let rendered = argv.join(" ");
    debug!(command = %rendered, "Running proxy command");

    let output = tokio::process::Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| ReloadError::Spawn {
            command: rendered.clone(),
            source,
        })?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    warn!(
        command = %rendered,
        status = %output.status,
        stderr = %stderr,
        "Proxy command failed"
    );
    Err(ReloadError::CommandFailed {
        command: rendered,
        status: output.status,
        stderr,
    })
}

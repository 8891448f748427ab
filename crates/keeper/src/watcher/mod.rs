//! Watcher daemon: bundle change detection and zero-downtime reload.
//!
//! Runs next to the TLS-terminating proxy. Blocks until certificate
//! material first appears (the cold-start ordering race against the
//! issuer), then watches the live directory and drives the proxy's
//! validate-then-reload primitives on each real change. A candidate that
//! fails validation is never applied: availability beats freshness, the
//! proxy keeps serving the previous known-good bundle.
//!
//! The state machine is explicit so tests can assert on transitions:
//!
//! ```text
//! AwaitingCertificate --bundle appears--> Serving
//! Serving --watch subscription error--> WatchLost
//! WatchLost --re-arm attempt--> Serving
//! ```

use std::fmt;
use std::time::Instant;

use chrono::Utc;
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use certkeeper_config::Config;

use crate::bundle::{validate_bundle, BundleStore, Fingerprint, StoreError};
use crate::errors::KeeperError;
use crate::reload::{DrainCoordinator, ReloadTarget};
use crate::shutdown::Shutdown;

/// Polls in WatchLost before trying to re-arm the filesystem watch.
const REARM_AFTER_POLLS: u32 = 5;

/// Watcher lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// No bundle published yet; polling until one appears.
    AwaitingCertificate,
    /// Bundle live, filesystem watch armed.
    Serving,
    /// Watch subscription dropped; degraded to polling until re-armed.
    WatchLost,
}

impl fmt::Display for WatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AwaitingCertificate => write!(f, "awaiting-certificate"),
            Self::Serving => write!(f, "serving"),
            Self::WatchLost => write!(f, "watch-lost"),
        }
    }
}

/// Result of one change check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Nothing published (or it vanished).
    NoBundle,
    /// Bundle present but identical to what the proxy already serves.
    Unchanged,
    /// Candidate rejected by the validation gate; old bundle stays live.
    Rejected,
    /// Validated and swapped in.
    Reloaded,
}

enum ServeExit {
    Shutdown,
    WatchFailed,
}

/// The watcher daemon.
pub struct WatcherDaemon<R: ReloadTarget> {
    store: BundleStore,
    target: R,
    config: Config,
    state: WatcherState,
    /// Fingerprint of the bundle the proxy currently serves.
    active: Option<Fingerprint>,
    drain: DrainCoordinator,
}

impl<R: ReloadTarget> WatcherDaemon<R> {
    pub fn new(config: Config, target: R) -> Self {
        let store = BundleStore::open(&config.bundle.root);
        let drain = DrainCoordinator::new(config.watcher.drain_timeout());
        Self {
            store,
            target,
            config,
            state: WatcherState::AwaitingCertificate,
            active: None,
            drain,
        }
    }

    pub fn state(&self) -> WatcherState {
        self.state
    }

    /// Fingerprint of the currently applied bundle, if any.
    pub fn active_fingerprint(&self) -> Option<Fingerprint> {
        self.active
    }

    /// Run until shutdown. Returns an error only for fatal conditions.
    pub async fn run(mut self, mut shutdown: Shutdown) -> Result<(), KeeperError> {
        info!(
            domain = %self.config.primary_domain(),
            live_dir = %self.store.live_dir().display(),
            "Starting watcher daemon"
        );

        loop {
            match self.state {
                WatcherState::AwaitingCertificate => {
                    if !self.await_certificate(&mut shutdown).await? {
                        break;
                    }
                    self.transition(WatcherState::Serving);
                }
                WatcherState::Serving => match self.serve(&mut shutdown).await? {
                    ServeExit::Shutdown => break,
                    ServeExit::WatchFailed => self.transition(WatcherState::WatchLost),
                },
                WatcherState::WatchLost => {
                    if !self.degraded_poll(&mut shutdown).await? {
                        break;
                    }
                    self.transition(WatcherState::Serving);
                }
            }
        }

        info!("Watcher shutting down, draining in-flight work");
        self.drain.wait_idle().await;
        Ok(())
    }

    fn transition(&mut self, next: WatcherState) {
        if self.state != next {
            info!(from = %self.state, to = %next, "Watcher state transition");
            self.state = next;
        }
    }

    /// Poll until a bundle appears and applies cleanly. Returns `false` on
    /// shutdown.
    ///
    /// Progress is logged on a fixed interval so an operator can tell
    /// "still booting, issuer not done yet" apart from "stuck".
    async fn await_certificate(&mut self, shutdown: &mut Shutdown) -> Result<bool, KeeperError> {
        let started = Instant::now();
        let mut last_logged = Instant::now();

        loop {
            match self.check_once("startup poll").await? {
                ReloadOutcome::Reloaded => return Ok(true),
                ReloadOutcome::Unchanged => {
                    // Possible after WatchLost recovery took a detour
                    // through here; the bundle is already applied.
                    return Ok(true);
                }
                ReloadOutcome::NoBundle | ReloadOutcome::Rejected => {}
            }

            if last_logged.elapsed() >= self.config.watcher.waiting_log_interval() {
                info!(
                    elapsed_secs = started.elapsed().as_secs(),
                    live_path = %self.store.live_path(self.config.primary_domain()).display(),
                    "Still waiting for certificate bundle to appear"
                );
                last_logged = Instant::now();
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.watcher.poll_interval()) => {}
                _ = shutdown.recv() => return Ok(false),
            }
        }
    }

    /// Serve with the filesystem watch armed. A fallback poll still runs so
    /// a missed event cannot hide a new bundle for long.
    async fn serve(&mut self, shutdown: &mut Shutdown) -> Result<ServeExit, KeeperError> {
        let live_dir = self.store.live_dir();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher: RecommendedWatcher =
            match notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
                let _ = tx.send(event);
            }) {
                Ok(watcher) => watcher,
                Err(e) => {
                    warn!(error = %e, "Failed to create filesystem watcher");
                    return Ok(ServeExit::WatchFailed);
                }
            };

        if let Err(e) = watcher.watch(&live_dir, RecursiveMode::NonRecursive) {
            warn!(
                path = %live_dir.display(),
                error = %e,
                "Failed to arm filesystem watch"
            );
            return Ok(ServeExit::WatchFailed);
        }
        debug!(path = %live_dir.display(), "Filesystem watch armed");

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(Ok(event)) => {
                        if matches!(event.kind, notify::EventKind::Access(_)) {
                            trace!(?event, "Ignoring access event");
                            continue;
                        }
                        debug!(kind = ?event.kind, "Bundle directory changed");
                        self.settle(&mut rx).await;
                        self.check_once("watch event").await?;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Filesystem watch error");
                        return Ok(ServeExit::WatchFailed);
                    }
                    None => {
                        warn!("Filesystem watch channel closed");
                        return Ok(ServeExit::WatchFailed);
                    }
                },
                _ = tokio::time::sleep(self.config.watcher.poll_interval()) => {
                    trace!("Fallback poll");
                    self.check_once("fallback poll").await?;
                }
                _ = shutdown.recv() => return Ok(ServeExit::Shutdown),
            }
        }
    }

    /// Debounce: one atomic swap can surface as several events; let them
    /// settle and drain the queue so the change is handled once.
    async fn settle(&self, rx: &mut mpsc::UnboundedReceiver<notify::Result<notify::Event>>) {
        let debounce = self.config.watcher.debounce();
        if debounce.is_zero() {
            return;
        }
        tokio::time::sleep(debounce).await;
        let mut drained = 0;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        if drained > 0 {
            trace!(drained, "Coalesced filesystem events");
        }
    }

    /// Polling-only operation after the watch subscription failed. Returns
    /// `false` on shutdown, `true` to attempt re-arming.
    async fn degraded_poll(&mut self, shutdown: &mut Shutdown) -> Result<bool, KeeperError> {
        warn!(
            polls_before_rearm = REARM_AFTER_POLLS,
            "Filesystem watch lost, falling back to polling"
        );

        for _ in 0..REARM_AFTER_POLLS {
            tokio::select! {
                _ = tokio::time::sleep(self.config.watcher.poll_interval()) => {
                    self.check_once("degraded poll").await?;
                }
                _ = shutdown.recv() => return Ok(false),
            }
        }

        debug!("Attempting to re-arm filesystem watch");
        Ok(true)
    }

    /// Load the live bundle and, when it changed, gate it through
    /// validation and reload the proxy.
    ///
    /// This is the watcher's whole decision procedure; everything else is
    /// plumbing that decides when to call it.
    pub async fn check_once(&mut self, trigger: &str) -> Result<ReloadOutcome, KeeperError> {
        let domain = self.config.primary_domain().to_string();

        let bundle = match self.store.load(&domain) {
            Ok(Some(bundle)) => bundle,
            Ok(None) => {
                if self.active.is_some() {
                    warn!(domain = %domain, "Live bundle disappeared; proxy keeps last-loaded material");
                }
                return Ok(ReloadOutcome::NoBundle);
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(StoreError::Incomplete { missing, .. }) => {
                // Should be unobservable under the atomic-swap contract.
                warn!(domain = %domain, missing, "Observed incomplete bundle, skipping");
                return Ok(ReloadOutcome::NoBundle);
            }
            Err(e) => {
                warn!(domain = %domain, error = %e, "Failed to read live bundle");
                return Ok(ReloadOutcome::Rejected);
            }
        };

        if self.active == Some(bundle.fingerprint) {
            trace!(trigger, fingerprint = %bundle.fingerprint.short(), "Bundle unchanged");
            return Ok(ReloadOutcome::Unchanged);
        }

        info!(
            trigger,
            fingerprint = %bundle.fingerprint.short(),
            expires = %bundle.meta.not_after,
            "New certificate bundle detected"
        );

        let _inflight = self.drain.begin();

        // Gate 1: internal bundle checks (parse, expiry, coverage,
        // cert/key consistency).
        if let Err(rejection) = validate_bundle(&bundle, &self.config.issuer.domains, Utc::now()) {
            warn!(
                fingerprint = %bundle.fingerprint.short(),
                error = %rejection,
                "Candidate bundle failed validation, keeping current bundle"
            );
            return Ok(ReloadOutcome::Rejected);
        }

        // Gate 2: the proxy's own configuration check.
        if let Err(e) = self.target.validate().await {
            warn!(
                fingerprint = %bundle.fingerprint.short(),
                error = %e,
                "Proxy validation failed, keeping current bundle"
            );
            return Ok(ReloadOutcome::Rejected);
        }

        if let Err(e) = self.target.reload().await {
            // The reload command failed; the proxy is still on the old
            // material. Leaving `active` unset retries on the next check.
            warn!(error = %e, "Proxy reload failed, will retry");
            return Ok(ReloadOutcome::Rejected);
        }

        info!(
            fingerprint = %bundle.fingerprint.short(),
            expires = %bundle.meta.not_after,
            "Proxy reloaded with new certificate bundle"
        );
        self.active = Some(bundle.fingerprint);
        Ok(ReloadOutcome::Reloaded)
    }
}

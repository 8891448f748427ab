//! Issuer daemon: the renewal cadence loop.
//!
//! Guarantees that a valid, non-expiring-soon certificate bundle exists on
//! the shared tree, without manual intervention and without hammering the
//! CA. Eligibility is re-derived every tick from the live certificate's own
//! embedded expiry; there is no separate renewal log that could drift from
//! what is actually on disk.
//!
//! Failure policy per tick: transient failures are logged and simply wait
//! for the next tick (the old bundle keeps serving, it was never removed);
//! fatal local conditions terminate the daemon non-zero.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use certkeeper_config::Config;

use crate::acme::{AcmeClient, AcmeError, IssuedCertificate, WebrootChallenges};
use crate::bundle::{BundleStore, LeafMetadata};
use crate::errors::KeeperError;
use crate::reload::DrainCoordinator;
use crate::shutdown::Shutdown;

/// Minimum cadence, clamping configs that would poll the CA too hard.
const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// How long to wait for in-flight issuance on shutdown.
const ISSUE_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Something that can produce a certificate on demand.
///
/// [`AcmeClient`] in production; tests script failures and canned
/// certificates through this seam.
#[async_trait]
pub trait CertificateSource: Send + Sync {
    async fn obtain(
        &self,
        challenges: &WebrootChallenges,
    ) -> Result<IssuedCertificate, AcmeError>;
}

#[async_trait]
impl CertificateSource for AcmeClient {
    async fn obtain(
        &self,
        challenges: &WebrootChallenges,
    ) -> Result<IssuedCertificate, AcmeError> {
        self.order_certificate(challenges).await
    }
}

/// Outcome of one cadence tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// A new bundle was published.
    Issued { expires: DateTime<Utc> },
    /// The live certificate still has enough runway.
    NotDue { days_remaining: i64 },
    /// The attempt failed; retry on the next tick.
    Failed { reason: String },
}

/// In-memory bookkeeping about recent attempts. Disposable: rebuilt from
/// nothing on restart, because eligibility never depends on it.
#[derive(Debug, Default)]
pub struct RenewalState {
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_outcome: Option<AttemptOutcome>,
    pub consecutive_failures: u32,
}

impl RenewalState {
    fn record(&mut self, outcome: AttemptOutcome) {
        self.last_attempt = Some(Utc::now());
        self.consecutive_failures = match outcome {
            AttemptOutcome::Failed { .. } => self.consecutive_failures + 1,
            _ => 0,
        };
        self.last_outcome = Some(outcome);
    }
}

/// Whether a renewal attempt is due.
///
/// `None` metadata means no bundle exists at all: issue immediately, this
/// is what the watcher is blocked on. Otherwise attempt only inside the
/// renewal window, which is the guard against rate-limit exhaustion.
pub fn renewal_due(meta: Option<&LeafMetadata>, renew_before_days: u32, now: DateTime<Utc>) -> bool {
    match meta {
        None => true,
        Some(meta) => meta.days_remaining(now) < i64::from(renew_before_days),
    }
}

/// The issuer daemon.
pub struct IssuerDaemon<S: CertificateSource> {
    source: S,
    store: BundleStore,
    challenges: WebrootChallenges,
    config: Config,
    state: RenewalState,
    drain: DrainCoordinator,
}

impl IssuerDaemon<AcmeClient> {
    /// Wire up the production daemon: bundle store, challenge webroot, and
    /// ACME account.
    pub async fn connect(config: Config) -> Result<Self, KeeperError> {
        let store = BundleStore::create(&config.bundle.root)?;
        let challenges = WebrootChallenges::new(&config.issuer.challenge_webroot)?;
        let client = AcmeClient::connect(&config.issuer).await?;
        Ok(Self::with_source(client, store, challenges, config))
    }
}

impl<S: CertificateSource> IssuerDaemon<S> {
    pub fn with_source(
        source: S,
        store: BundleStore,
        challenges: WebrootChallenges,
        config: Config,
    ) -> Self {
        Self {
            source,
            store,
            challenges,
            config,
            state: RenewalState::default(),
            drain: DrainCoordinator::new(ISSUE_DRAIN_TIMEOUT),
        }
    }

    pub fn state(&self) -> &RenewalState {
        &self.state
    }

    /// Run until shutdown. Returns an error only for fatal conditions.
    pub async fn run(mut self, mut shutdown: Shutdown) -> Result<(), KeeperError> {
        let interval = self.config.issuer.check_interval().max(MIN_CHECK_INTERVAL);

        info!(
            domains = ?self.config.issuer.domains,
            renew_before_days = self.config.issuer.renew_before_days,
            check_interval_hours = interval.as_secs() / 3600,
            "Starting issuer daemon"
        );

        // Initial check immediately rather than waiting out the first
        // cadence interval: if no bundle exists yet, the watcher (and the
        // proxy behind it) is blocked on us.
        if let Err(e) = self.tick().await {
            if e.is_fatal() {
                return Err(e);
            }
            error!(error = %e, "Initial certificate check failed");
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("Running scheduled certificate check");
                    if let Err(e) = self.tick().await {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        error!(error = %e, "Certificate check failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Issuer shutting down");
                    break;
                }
            }
        }

        self.drain.wait_idle().await;
        Ok(())
    }

    /// One cadence tick: derive eligibility, maybe renew.
    pub async fn tick(&mut self) -> Result<(), KeeperError> {
        let domain = self.config.primary_domain().to_string();

        let meta = match self.store.load(&domain) {
            Ok(bundle) => bundle.map(|b| b.meta),
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                // A broken live bundle is repaired by issuing a fresh one.
                warn!(domain = %domain, error = %e, "Live bundle unreadable, reissuing");
                None
            }
        };

        let now = Utc::now();
        if !renewal_due(meta.as_ref(), self.config.issuer.renew_before_days, now) {
            let days = meta.as_ref().map(|m| m.days_remaining(now)).unwrap_or(0);
            debug!(
                domain = %domain,
                days_remaining = days,
                "Certificate not yet due for renewal"
            );
            self.state.record(AttemptOutcome::NotDue {
                days_remaining: days,
            });
            return Ok(());
        }

        match meta {
            Some(ref m) => info!(
                domain = %domain,
                expires = %m.not_after,
                "Certificate due for renewal"
            ),
            None => info!(domain = %domain, "No certificate published, issuing"),
        }

        // Guard so shutdown waits for the stage-and-swap to finish.
        let _inflight = self.drain.begin();

        match self.renew(&domain).await {
            Ok(expires) => {
                info!(domain = %domain, expires = %expires, "Certificate renewed and published");
                self.state.record(AttemptOutcome::Issued { expires });
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                error!(
                    domain = %domain,
                    error = %e,
                    consecutive_failures = self.state.consecutive_failures + 1,
                    "Renewal failed, existing bundle left untouched; retrying next tick"
                );
                self.state.record(AttemptOutcome::Failed {
                    reason: e.to_string(),
                });
                Ok(())
            }
        }
    }

    /// Obtain and publish one certificate.
    async fn renew(&mut self, domain: &str) -> Result<DateTime<Utc>, KeeperError> {
        let issued = self.source.obtain(&self.challenges).await?;

        self.store.publish(
            domain,
            &issued.fullchain_pem,
            &issued.privkey_pem,
            issued.chain_pem.as_deref(),
        )?;

        // Pruning is housekeeping; a failure must not fail the renewal.
        match self.store.prune(domain, self.config.issuer.keep_versions) {
            Ok(0) => {}
            Ok(removed) => debug!(domain = %domain, removed, "Pruned old bundle versions"),
            Err(e) => warn!(domain = %domain, error = %e, "Failed to prune old bundle versions"),
        }

        Ok(issued.meta.not_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{parse_leaf_metadata, testutil};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    const DOMAIN: &str = "example.com";

    /// Scripted certificate source: fails `failures` times, then returns
    /// fresh material.
    struct FlakySource {
        failures: AtomicU32,
        attempts: Arc<AtomicU32>,
    }

    impl FlakySource {
        fn new(failures: u32) -> (Self, Arc<AtomicU32>) {
            let attempts = Arc::new(AtomicU32::new(0));
            (
                Self {
                    failures: AtomicU32::new(failures),
                    attempts: Arc::clone(&attempts),
                },
                attempts,
            )
        }
    }

    #[async_trait]
    impl CertificateSource for FlakySource {
        async fn obtain(
            &self,
            _challenges: &WebrootChallenges,
        ) -> Result<IssuedCertificate, AcmeError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(AcmeError::Authorization("CA timeout".to_string()));
            }
            let (fullchain_pem, privkey_pem) = testutil::self_signed(&[DOMAIN], 90);
            let meta = parse_leaf_metadata(&fullchain_pem).unwrap();
            Ok(IssuedCertificate {
                fullchain_pem,
                privkey_pem,
                chain_pem: None,
                meta,
            })
        }
    }

    fn daemon(root: &std::path::Path, failures: u32) -> (IssuerDaemon<FlakySource>, Arc<AtomicU32>) {
        let config: Config = toml::from_str(&format!(
            r#"
                [bundle]
                root = "{root}/bundles"

                [issuer]
                domains = ["{DOMAIN}"]
                contact = "admin@example.com"
                storage = "{root}/acme"
                challenge_webroot = "{root}/webroot"
            "#,
            root = root.display()
        ))
        .unwrap();

        let store = BundleStore::create(&config.bundle.root).unwrap();
        let challenges = WebrootChallenges::new(&config.issuer.challenge_webroot).unwrap();
        let (source, attempts) = FlakySource::new(failures);
        (
            IssuerDaemon::with_source(source, store, challenges, config),
            attempts,
        )
    }

    #[test]
    fn test_renewal_due_no_certificate() {
        assert!(renewal_due(None, 30, Utc::now()));
    }

    #[test]
    fn test_renewal_due_is_idempotent_outside_window() {
        let (cert, _) = testutil::self_signed(&[DOMAIN], 90);
        let meta = parse_leaf_metadata(&cert).unwrap();
        let now = Utc::now();
        for _ in 0..10 {
            assert!(!renewal_due(Some(&meta), 30, now));
        }
    }

    #[test]
    fn test_renewal_due_inside_window_every_time() {
        // 25 days remaining, 30 day window: due on every check.
        let (cert, _) = testutil::self_signed(&[DOMAIN], 25);
        let meta = parse_leaf_metadata(&cert).unwrap();
        let now = Utc::now();
        for _ in 0..10 {
            assert!(renewal_due(Some(&meta), 30, now));
        }
    }

    #[tokio::test]
    async fn test_tick_issues_when_nothing_published() {
        let dir = TempDir::new().unwrap();
        let (mut daemon, attempts) = daemon(dir.path(), 0);

        daemon.tick().await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(daemon.store.is_published(DOMAIN));
        assert!(matches!(
            daemon.state().last_outcome,
            Some(AttemptOutcome::Issued { .. })
        ));
    }

    #[tokio::test]
    async fn test_tick_noop_with_fresh_certificate() {
        let dir = TempDir::new().unwrap();
        let (mut daemon, attempts) = daemon(dir.path(), 0);

        daemon.tick().await.unwrap();
        let fingerprint = daemon.store.load(DOMAIN).unwrap().unwrap().fingerprint;

        // Repeated ticks with a fresh certificate never re-issue.
        for _ in 0..3 {
            daemon.tick().await.unwrap();
        }

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(
            daemon.store.load(DOMAIN).unwrap().unwrap().fingerprint,
            fingerprint
        );
        assert!(matches!(
            daemon.state().last_outcome,
            Some(AttemptOutcome::NotDue { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_attempts_leave_bundle_untouched_then_recover() {
        let dir = TempDir::new().unwrap();

        // Seed an expiring bundle so renewal is due.
        let (mut daemon, attempts) = daemon(dir.path(), 2);
        let (cert, key) = testutil::self_signed(&[DOMAIN], 25);
        daemon.store.publish(DOMAIN, &cert, &key, None).unwrap();
        let old = daemon.store.load(DOMAIN).unwrap().unwrap().fingerprint;

        // Two failing ticks: bundle unchanged, failures counted.
        daemon.tick().await.unwrap();
        daemon.tick().await.unwrap();
        assert_eq!(daemon.store.load(DOMAIN).unwrap().unwrap().fingerprint, old);
        assert_eq!(daemon.state().consecutive_failures, 2);

        // Third tick succeeds: bundle replaced.
        daemon.tick().await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_ne!(daemon.store.load(DOMAIN).unwrap().unwrap().fingerprint, old);
        assert_eq!(daemon.state().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let (daemon, _) = daemon(dir.path(), 0);
        let (handle, shutdown) = Shutdown::new();

        let task = tokio::spawn(daemon.run(shutdown));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        handle.shutdown();

        tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .expect("daemon should stop on shutdown")
            .unwrap()
            .unwrap();
    }
}

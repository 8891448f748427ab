//! Bundle storage with atomic replacement.
//!
//! Single-writer (issuer), multiple-reader (watcher) discipline over a
//! shared directory tree. The writer stages a complete version directory
//! under `versions/` and then swaps the per-domain symlink under `live/`
//! with a rename. Rename is atomic at the filesystem level, so a reader
//! resolving the symlink sees either the old complete bundle or the new
//! complete bundle, never a torn mix. That rename is the entire concurrency
//! control mechanism; there are no locks.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, trace, warn};

use certkeeper_config::contract::{
    CHAIN_FILE, FULLCHAIN_FILE, LIVE_DIR, PRIVKEY_FILE, VERSIONS_DIR,
};

use super::{parse_leaf_metadata, CertificateBundle, Fingerprint, ParseError};

/// Errors from bundle storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("bundle I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("live bundle for '{domain}' is incomplete: {missing} missing or empty")]
    Incomplete { domain: String, missing: &'static str },

    #[error("published certificate does not parse: {0}")]
    Parse(#[from] ParseError),
}

impl StoreError {
    /// Local conditions that retrying cannot fix. Fatal errors exit the
    /// process non-zero so a supervisor can alert.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Io { source, .. } => crate::errors::io_is_fatal(source),
            _ => false,
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Handle on the shared bundle tree.
#[derive(Debug, Clone)]
pub struct BundleStore {
    root: PathBuf,
}

impl BundleStore {
    /// Open the tree for writing, creating the layout if needed.
    pub fn create(root: &Path) -> Result<Self, StoreError> {
        let store = Self {
            root: root.to_path_buf(),
        };
        fs::create_dir_all(store.live_dir()).map_err(io_err(&store.live_dir()))?;
        fs::create_dir_all(store.versions_dir()).map_err(io_err(&store.versions_dir()))?;

        info!(root = %root.display(), "Initialized bundle store");
        Ok(store)
    }

    /// Open the tree read-only. Nothing is created; an absent tree simply
    /// loads as "no bundle yet".
    pub fn open(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The directory the watcher arms its filesystem watch on.
    pub fn live_dir(&self) -> PathBuf {
        self.root.join(LIVE_DIR)
    }

    fn versions_dir(&self) -> PathBuf {
        self.root.join(VERSIONS_DIR)
    }

    /// Path of the per-domain live symlink.
    pub fn live_path(&self, domain: &str) -> PathBuf {
        self.live_dir().join(domain)
    }

    /// Load the live bundle for a domain.
    ///
    /// Returns `Ok(None)` when nothing is published yet (pre-bootstrap).
    /// An existing but incomplete bundle is an error: under the atomic-swap
    /// contract it should never be observable.
    pub fn load(&self, domain: &str) -> Result<Option<CertificateBundle>, StoreError> {
        let live = self.live_path(domain);

        match fs::symlink_metadata(&live) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!(domain = %domain, "No live bundle published");
                return Ok(None);
            }
            Err(e) => return Err(io_err(&live)(e)),
        }

        let fullchain_path = live.join(FULLCHAIN_FILE);
        let privkey_path = live.join(PRIVKEY_FILE);
        let chain_path = live.join(CHAIN_FILE);

        let fullchain_pem = read_required(&fullchain_path, domain, FULLCHAIN_FILE)?;
        let privkey_pem = read_required(&privkey_path, domain, PRIVKEY_FILE)?;

        let chain_pem = match fs::read_to_string(&chain_path) {
            Ok(s) if !s.is_empty() => Some(s),
            Ok(_) => None,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(io_err(&chain_path)(e)),
        };

        let meta = parse_leaf_metadata(&fullchain_pem)?;
        let fingerprint = Fingerprint::of(&fullchain_pem, &privkey_pem);

        debug!(
            domain = %domain,
            fingerprint = %fingerprint.short(),
            expires = %meta.not_after,
            "Loaded live bundle"
        );

        Ok(Some(CertificateBundle {
            fullchain_pem,
            privkey_pem,
            chain_pem,
            fingerprint,
            meta,
        }))
    }

    /// Whether a complete live bundle exists, without parsing it.
    pub fn is_published(&self, domain: &str) -> bool {
        let live = self.live_path(domain);
        file_non_empty(&live.join(FULLCHAIN_FILE)) && file_non_empty(&live.join(PRIVKEY_FILE))
    }

    /// Publish a new bundle version: stage a complete version directory,
    /// fsync it, then atomically swap the live symlink over to it.
    ///
    /// Returns the path of the published version directory.
    pub fn publish(
        &self,
        domain: &str,
        fullchain_pem: &str,
        privkey_pem: &str,
        chain_pem: Option<&str>,
    ) -> Result<PathBuf, StoreError> {
        let domain_versions = self.versions_dir().join(domain);
        fs::create_dir_all(&domain_versions).map_err(io_err(&domain_versions))?;
        fs::create_dir_all(self.live_dir()).map_err(io_err(&self.live_dir()))?;

        // Stage. The version directory is immutable once the symlink points
        // at it.
        let version = next_version_name(&domain_versions);
        let version_dir = domain_versions.join(&version);
        fs::create_dir(&version_dir).map_err(io_err(&version_dir))?;

        write_file(&version_dir.join(FULLCHAIN_FILE), fullchain_pem, 0o644)?;
        write_file(&version_dir.join(PRIVKEY_FILE), privkey_pem, 0o600)?;
        if let Some(chain) = chain_pem {
            write_file(&version_dir.join(CHAIN_FILE), chain, 0o644)?;
        }
        fsync_dir(&version_dir)?;

        // Swap. A fresh symlink is renamed over the live one so the update
        // is a single directory-entry replacement.
        let target = Path::new("..")
            .join(VERSIONS_DIR)
            .join(domain)
            .join(&version);
        let swap_link = self.live_dir().join(format!(".{domain}.swap"));

        match fs::remove_file(&swap_link) {
            Ok(()) => warn!(link = %swap_link.display(), "Removed stale swap link"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(&swap_link)(e)),
        }

        std::os::unix::fs::symlink(&target, &swap_link).map_err(io_err(&swap_link))?;

        let live = self.live_path(domain);
        fs::rename(&swap_link, &live).map_err(io_err(&live))?;
        fsync_dir(&self.live_dir())?;

        info!(
            domain = %domain,
            version = %version,
            "Published certificate bundle"
        );

        Ok(version_dir)
    }

    /// Remove old version directories, keeping the `keep` newest plus
    /// whatever the live symlink currently points at.
    pub fn prune(&self, domain: &str, keep: usize) -> Result<usize, StoreError> {
        let domain_versions = self.versions_dir().join(domain);
        if !domain_versions.exists() {
            return Ok(0);
        }

        // Version the live symlink resolves to, if any. Never remove it.
        let live_target = fs::read_link(self.live_path(domain))
            .ok()
            .and_then(|t| t.file_name().map(|n| n.to_os_string()));

        let mut versions: Vec<_> = fs::read_dir(&domain_versions)
            .map_err(io_err(&domain_versions))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|entry| entry.file_name())
            .collect();

        // Version names sort chronologically.
        versions.sort();
        versions.reverse();

        let mut removed = 0;
        for name in versions.into_iter().skip(keep) {
            if Some(&name) == live_target.as_ref() {
                continue;
            }
            let path = domain_versions.join(&name);
            fs::remove_dir_all(&path).map_err(io_err(&path))?;
            debug!(domain = %domain, version = %name.to_string_lossy(), "Pruned old bundle version");
            removed += 1;
        }

        Ok(removed)
    }
}

fn read_required(path: &Path, domain: &str, name: &'static str) -> Result<String, StoreError> {
    match fs::read_to_string(path) {
        Ok(s) if !s.is_empty() => Ok(s),
        Ok(_) => Err(StoreError::Incomplete {
            domain: domain.to_string(),
            missing: name,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::Incomplete {
            domain: domain.to_string(),
            missing: name,
        }),
        Err(e) => Err(io_err(path)(e)),
    }
}

fn file_non_empty(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

fn write_file(path: &Path, content: &str, mode: u32) -> Result<(), StoreError> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)
        .map_err(io_err(path))?;
    file.write_all(content.as_bytes()).map_err(io_err(path))?;
    file.sync_all().map_err(io_err(path))?;
    Ok(())
}

fn fsync_dir(path: &Path) -> Result<(), StoreError> {
    File::open(path)
        .and_then(|f| f.sync_all())
        .map_err(io_err(path))
}

/// Timestamp-derived version name, disambiguated if a publish lands twice
/// within the same second. The suffix is zero-padded so names keep sorting
/// chronologically; `prune` relies on lexicographic order.
fn next_version_name(domain_versions: &Path) -> String {
    let base = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    if !domain_versions.join(&base).exists() {
        return base;
    }
    let mut n = 1;
    loop {
        let candidate = format!("{base}-{n:02}");
        if !domain_versions.join(&candidate).exists() {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil;
    use super::*;
    use tempfile::TempDir;

    const DOMAIN: &str = "example.com";

    fn setup() -> (TempDir, BundleStore) {
        let dir = TempDir::new().unwrap();
        let store = BundleStore::create(dir.path()).unwrap();
        (dir, store)
    }

    fn publish_fresh(store: &BundleStore, days: i64) -> Fingerprint {
        let (cert, key) = testutil::self_signed(&[DOMAIN], days);
        store.publish(DOMAIN, &cert, &key, None).unwrap();
        Fingerprint::of(&cert, &key)
    }

    #[test]
    fn test_load_before_any_publish() {
        let (_dir, store) = setup();
        assert!(store.load(DOMAIN).unwrap().is_none());
        assert!(!store.is_published(DOMAIN));
    }

    #[test]
    fn test_publish_then_load() {
        let (_dir, store) = setup();
        let fingerprint = publish_fresh(&store, 90);

        let bundle = store.load(DOMAIN).unwrap().unwrap();
        assert_eq!(bundle.fingerprint, fingerprint);
        assert!(bundle.meta.covers(DOMAIN));
        assert!(store.is_published(DOMAIN));

        // Private key is not world readable.
        use std::os::unix::fs::PermissionsExt;
        let key_path = store.live_path(DOMAIN).join(PRIVKEY_FILE);
        let mode = fs::metadata(key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);
    }

    #[test]
    fn test_publish_with_chain() {
        let (_dir, store) = setup();
        let (cert, key) = testutil::self_signed(&[DOMAIN], 90);
        let (intermediate, _) = testutil::self_signed(&["ca.test"], 900);

        store
            .publish(DOMAIN, &cert, &key, Some(&intermediate))
            .unwrap();

        let bundle = store.load(DOMAIN).unwrap().unwrap();
        assert!(bundle.chain_pem.is_some());
    }

    #[test]
    fn test_republish_swaps_atomically() {
        let (_dir, store) = setup();
        let first = publish_fresh(&store, 30);
        let second = publish_fresh(&store, 90);
        assert_ne!(first, second);

        let bundle = store.load(DOMAIN).unwrap().unwrap();
        assert_eq!(bundle.fingerprint, second);

        // Both versions still exist; the symlink moved.
        let versions = store.versions_dir().join(DOMAIN);
        assert_eq!(fs::read_dir(versions).unwrap().count(), 2);
    }

    #[test]
    fn test_interrupted_stage_leaves_old_bundle_intact() {
        let (_dir, store) = setup();
        let published = publish_fresh(&store, 90);

        // Simulate a writer killed mid-stage: a version directory exists
        // with a partial payload, but no symlink swap happened.
        let torn = store.versions_dir().join(DOMAIN).join("99991231T000000Z");
        fs::create_dir_all(&torn).unwrap();
        fs::write(torn.join(FULLCHAIN_FILE), "partial").unwrap();

        let bundle = store.load(DOMAIN).unwrap().unwrap();
        assert_eq!(bundle.fingerprint, published);
    }

    #[test]
    fn test_incomplete_live_bundle_is_an_error() {
        let (dir, store) = setup();

        // Bypass publish to build a broken live entry.
        let rogue = dir.path().join("rogue");
        fs::create_dir_all(&rogue).unwrap();
        let (cert, _) = testutil::self_signed(&[DOMAIN], 90);
        fs::write(rogue.join(FULLCHAIN_FILE), cert).unwrap();
        std::os::unix::fs::symlink(&rogue, store.live_path(DOMAIN)).unwrap();

        match store.load(DOMAIN) {
            Err(StoreError::Incomplete { missing, .. }) => assert_eq!(missing, PRIVKEY_FILE),
            other => panic!("expected incomplete error, got {other:?}"),
        }
        assert!(!store.is_published(DOMAIN));
    }

    #[test]
    fn test_prune_keeps_newest_and_live_target() {
        let (_dir, store) = setup();
        for _ in 0..4 {
            publish_fresh(&store, 90);
        }

        let latest = store.load(DOMAIN).unwrap().unwrap().fingerprint;

        let removed = store.prune(DOMAIN, 2).unwrap();
        assert_eq!(removed, 2);

        let versions = store.versions_dir().join(DOMAIN);
        assert_eq!(fs::read_dir(versions).unwrap().count(), 2);

        // The live bundle still resolves.
        assert_eq!(store.load(DOMAIN).unwrap().unwrap().fingerprint, latest);
    }

    #[test]
    fn test_version_names_sort_chronologically() {
        let (_dir, store) = setup();
        let versions = store.versions_dir().join(DOMAIN);
        fs::create_dir_all(&versions).unwrap();

        // Burst of same-second publishes: generation order must survive a
        // plain lexicographic sort, double-digit suffixes included.
        let mut names = Vec::new();
        for _ in 0..11 {
            let name = next_version_name(&versions);
            fs::create_dir(versions.join(&name)).unwrap();
            names.push(name);
        }

        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(sorted, names);
    }

    #[test]
    fn test_prune_nothing_to_do() {
        let (_dir, store) = setup();
        assert_eq!(store.prune(DOMAIN, 3).unwrap(), 0);

        publish_fresh(&store, 90);
        assert_eq!(store.prune(DOMAIN, 3).unwrap(), 0);
    }
}

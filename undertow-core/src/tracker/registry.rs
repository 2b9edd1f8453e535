//! Shared per-host tracker state.
//!
//! One [`TrackerRegistry`] is constructed at process start and passed by
//! reference to the announcers and the scrape scheduler. It replaces the
//! usual class-level singletons with an explicit, injectable object whose
//! lifetime is documented: created once, torn down at shutdown, nothing
//! persisted to disk.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use url::Url;

use super::types::{InfoHash, ScrapeEntry};

/// Adaptively learned per-host heuristics.
///
/// Once a quirk is observed it persists for the process lifetime so the same
/// broken configuration is not retried on every announce.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostQuirks {
    /// Hostname verification disabled after an unrecognized-SNI failure.
    pub sni_hack: bool,
    /// All-trusting trust manager installed after a handshake failure.
    pub relaxed_trust: bool,
    /// Diffie-Hellman workaround applied after a DH keypair error.
    pub dh_workaround: bool,
}

/// Per-tracker-host status shared by every torrent announcing to it.
#[derive(Debug)]
pub struct TrackerStatus {
    host: String,
    /// Derived scrape URL, or None when the announce path is not derivable.
    scrape_url: Option<Url>,
    entries: HashMap<InfoHash, ScrapeEntry>,
    /// Sticky: once a tracker is seen not to support multi-hash scraping it
    /// is permanently downgraded for this host.
    single_hash_only: bool,
    /// Host runs an AZ tracker; enables the extended announce fields.
    az_tracker: bool,
    /// Host confirmed to answer UDP announces.
    udp_confirmed: bool,
    /// Announces between automatic UDP capability probes, doubling on each
    /// failed probe up to the configured cap.
    auto_udp_probe_every: u8,
    announce_count: u64,
    /// Scrapes currently in flight against this host.
    active_scrapes: u32,
    quirks: HostQuirks,
}

impl TrackerStatus {
    fn new(host: String, announce_url: &Url) -> Self {
        Self {
            host,
            scrape_url: derive_scrape_url(announce_url),
            entries: HashMap::new(),
            single_hash_only: false,
            az_tracker: false,
            udp_confirmed: false,
            auto_udp_probe_every: 1,
            announce_count: 0,
            active_scrapes: 0,
            quirks: HostQuirks::default(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn scrape_url(&self) -> Option<&Url> {
        self.scrape_url.as_ref()
    }

    pub fn supports_scrape(&self) -> bool {
        self.scrape_url.is_some()
    }

    pub fn single_hash_only(&self) -> bool {
        self.single_hash_only
    }

    /// Permanently downgrades this host to single-hash scraping.
    pub fn downgrade_to_single_hash(&mut self) {
        if !self.single_hash_only {
            tracing::info!("Tracker {} downgraded to single-hash scrapes", self.host);
            self.single_hash_only = true;
        }
    }

    pub fn is_az_tracker(&self) -> bool {
        self.az_tracker
    }

    pub fn mark_az_tracker(&mut self) {
        self.az_tracker = true;
    }

    pub fn is_udp_confirmed(&self) -> bool {
        self.udp_confirmed
    }

    pub fn quirks(&self) -> HostQuirks {
        self.quirks
    }

    pub fn quirks_mut(&mut self) -> &mut HostQuirks {
        &mut self.quirks
    }

    /// Decides whether this announce should double as a UDP capability
    /// probe. Probing frequency backs off exponentially while probes fail.
    /// A confirmed host never probes: it announces over UDP directly.
    pub fn should_probe_udp(&mut self) -> bool {
        if self.udp_confirmed {
            return false;
        }
        self.announce_count += 1;
        // Never probe on the very first announce: it would add startup
        // latency for the common HTTP-only tracker.
        if self.announce_count <= 1 {
            return false;
        }
        self.announce_count % u64::from(self.auto_udp_probe_every) == 0
    }

    /// Records a failed UDP probe, backing the probe frequency off.
    pub fn record_probe_failure(&mut self, probe_cap: u8) {
        if self.auto_udp_probe_every < probe_cap {
            self.auto_udp_probe_every = self.auto_udp_probe_every.saturating_mul(2);
        }
    }

    /// Records a successful UDP contact: confirm UDP and reset the probe
    /// frequency.
    pub fn record_probe_success(&mut self) {
        self.udp_confirmed = true;
        self.auto_udp_probe_every = 1;
    }

    pub fn entry(&self, hash: &InfoHash) -> Option<&ScrapeEntry> {
        self.entries.get(hash)
    }

    pub fn entry_mut(&mut self, hash: &InfoHash) -> &mut ScrapeEntry {
        self.entries.entry(*hash).or_insert_with(|| ScrapeEntry::new(*hash))
    }

    pub fn remove_entry(&mut self, hash: &InfoHash) {
        self.entries.remove(hash);
    }

    pub fn entries(&self) -> impl Iterator<Item = &ScrapeEntry> {
        self.entries.values()
    }

    pub fn active_scrapes(&self) -> u32 {
        self.active_scrapes
    }

    pub fn scrape_started(&mut self) {
        self.active_scrapes += 1;
    }

    pub fn scrape_finished(&mut self) {
        self.active_scrapes = self.active_scrapes.saturating_sub(1);
    }
}

/// Derives the scrape URL by swapping the `announce` path component for
/// `scrape` (BEP 48 convention). Returns None when the final path segment
/// does not start with "announce".
pub fn derive_scrape_url(announce: &Url) -> Option<Url> {
    let path = announce.path();
    let (prefix, last) = path.rsplit_once('/')?;
    if !last.starts_with("announce") {
        return None;
    }
    let scrape_path = format!("{prefix}/{}", last.replacen("announce", "scrape", 1));
    let mut scrape = announce.clone();
    scrape.set_path(&scrape_path);
    Some(scrape)
}

/// Registry of per-host tracker status and the warning dedup map.
///
/// The host map is guarded by its own lock, distinct from any torrent's
/// progress lock, so a slow torrent cannot block scrape scheduling for
/// others on the same host.
#[derive(Default)]
pub struct TrackerRegistry {
    hosts: Mutex<HashMap<String, Arc<Mutex<TrackerStatus>>>>,
    /// (host, torrent, message) triples already surfaced to listeners.
    surfaced_warnings: Mutex<HashMap<(String, InfoHash), String>>,
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical host key for a tracker URL.
    pub fn host_key(url: &Url) -> String {
        let host = url.host_str().unwrap_or_default();
        match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    /// Hostname without the port, for overload-exclusion matching across
    /// ports of the same tracker.
    pub fn host_name(url: &Url) -> String {
        url.host_str().unwrap_or_default().to_string()
    }

    /// Fetches or creates the shared status for a tracker URL's host.
    pub fn status_for(&self, announce_url: &Url) -> Arc<Mutex<TrackerStatus>> {
        let key = Self::host_key(announce_url);
        let mut hosts = self.hosts.lock();
        hosts
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(TrackerStatus::new(key, announce_url))))
            .clone()
    }

    /// All registered host statuses, for the scrape scheduler's sweep.
    pub fn all_statuses(&self) -> Vec<Arc<Mutex<TrackerStatus>>> {
        self.hosts.lock().values().cloned().collect()
    }

    /// Returns true the first time a warning message is seen for a
    /// host+torrent pair; repeats are suppressed.
    pub fn should_surface_warning(&self, url: &Url, hash: InfoHash, message: &str) -> bool {
        let key = (Self::host_key(url), hash);
        let mut surfaced = self.surfaced_warnings.lock();
        match surfaced.get(&key) {
            Some(previous) if previous == message => false,
            _ => {
                surfaced.insert(key, message.to_string());
                true
            }
        }
    }
}

#[cfg(test)]
mod registry_tests {
    use super::*;

    #[test]
    fn test_scrape_url_derivation() {
        let announce = Url::parse("http://tracker.example.com:8080/announce").unwrap();
        let scrape = derive_scrape_url(&announce).unwrap();
        assert_eq!(scrape.as_str(), "http://tracker.example.com:8080/scrape");

        let with_key = Url::parse("http://tracker.example.com/announce.php?key=abc").unwrap();
        let scrape = derive_scrape_url(&with_key).unwrap();
        assert_eq!(
            scrape.as_str(),
            "http://tracker.example.com/scrape.php?key=abc"
        );

        let underivable = Url::parse("http://tracker.example.com/ann").unwrap();
        assert!(derive_scrape_url(&underivable).is_none());
    }

    #[test]
    fn test_status_shared_per_host() {
        let registry = TrackerRegistry::new();
        let a = Url::parse("http://tracker.example.com:6969/announce").unwrap();
        let b = Url::parse("http://tracker.example.com:6969/announce?x=1").unwrap();
        let status_a = registry.status_for(&a);
        let status_b = registry.status_for(&b);
        assert!(Arc::ptr_eq(&status_a, &status_b));

        let other = Url::parse("http://tracker.example.com:1337/announce").unwrap();
        let status_other = registry.status_for(&other);
        assert!(!Arc::ptr_eq(&status_a, &status_other));
    }

    #[test]
    fn test_single_hash_downgrade_is_sticky() {
        let registry = TrackerRegistry::new();
        let url = Url::parse("http://tracker.example.com/announce").unwrap();
        let status = registry.status_for(&url);
        assert!(!status.lock().single_hash_only());
        status.lock().downgrade_to_single_hash();
        assert!(registry.status_for(&url).lock().single_hash_only());
    }

    #[test]
    fn test_udp_probe_schedule() {
        let registry = TrackerRegistry::new();
        let url = Url::parse("http://tracker.example.com/announce").unwrap();
        let status = registry.status_for(&url);
        let mut status = status.lock();

        // Never on the first announce.
        assert!(!status.should_probe_udp());
        // Every announce while the frequency is 1.
        assert!(status.should_probe_udp());

        // After a failure, probe every second announce.
        status.record_probe_failure(16);
        assert!(!status.should_probe_udp());
        assert!(status.should_probe_udp());

        // Success confirms UDP; a confirmed host has nothing left to probe.
        status.record_probe_success();
        assert!(status.is_udp_confirmed());
        assert!(!status.should_probe_udp());
    }

    #[test]
    fn test_probe_backoff_caps() {
        let registry = TrackerRegistry::new();
        let url = Url::parse("http://tracker.example.com/announce").unwrap();
        let status = registry.status_for(&url);
        let mut status = status.lock();
        for _ in 0..10 {
            status.record_probe_failure(16);
        }
        assert_eq!(status.auto_udp_probe_every, 16);
    }

    #[test]
    fn test_warning_dedup() {
        let registry = TrackerRegistry::new();
        let url = Url::parse("http://tracker.example.com/announce").unwrap();
        let hash = InfoHash::new([1; 20]);

        assert!(registry.should_surface_warning(&url, hash, "slow down"));
        assert!(!registry.should_surface_warning(&url, hash, "slow down"));
        // A different message surfaces again.
        assert!(registry.should_surface_warning(&url, hash, "new message"));
        // A different torrent on the same host surfaces independently.
        assert!(registry.should_surface_warning(&url, InfoHash::new([2; 20]), "slow down"));
    }
}

//! Grouped scrape requests and the cross-host scrape scheduler.
//!
//! Scrapes run per tracker host: every hash due on the host joins one
//! batched request, unless the host has been downgraded to single-hash
//! scraping. The scheduler half picks, across all hosts, which scrape to
//! run next.

use std::sync::Arc;

use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, CONNECTION};
use url::Url;

use super::TrackerError;
use super::registry::{TrackerRegistry, TrackerStatus};
use super::sources::TrackerListener;
use super::types::{InfoHash, ScrapeEntry, ScrapeState};
use super::wire::http::{DecodedScrape, build_scrape_url, decode_scrape_response};
use super::wire::udp::UdpTrackerClient;
use crate::config::{ScrapeConfig, UndertowConfig};

/// Seconds until the next scrape for a hash with the given seed count.
///
/// Swarms with more seeds change more slowly, so the interval grows with
/// the square root of the seed count, bounded to [900, 10800]. A tracker's
/// declared `min_request_interval` raises the result but never lowers it
/// below the floor.
pub fn scrape_interval_secs(seeds: u32, tracker_min: Option<u32>) -> u32 {
    let derived = 900 + 60 * isqrt(seeds);
    derived.max(tracker_min.unwrap_or(0)).clamp(900, 10_800)
}

fn isqrt(n: u32) -> u32 {
    if n == 0 {
        return 0;
    }
    let mut root = (f64::from(n)).sqrt() as u32;
    while root.saturating_mul(root) > n {
        root -= 1;
    }
    root
}

/// What one scrape fetch produced.
enum ScrapeFetch {
    Decoded(DecodedScrape),
    /// HTTP 414: the batch URL was too long for this tracker.
    UriTooLong,
}

/// Performs scrape requests for one tracker host at a time.
pub struct ScrapeSession {
    config: UndertowConfig,
    registry: Arc<TrackerRegistry>,
    listeners: Mutex<Vec<Arc<dyn TrackerListener>>>,
}

impl ScrapeSession {
    pub fn new(config: UndertowConfig, registry: Arc<TrackerRegistry>) -> Self {
        Self {
            config,
            registry,
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn TrackerListener>) {
        self.listeners.lock().push(listener);
    }

    pub fn registry(&self) -> &Arc<TrackerRegistry> {
        &self.registry
    }

    /// Runs one scrape cycle for the host: batch the due hashes, fetch,
    /// apply, and reissue single-hash requests if the batch revealed a
    /// tracker that cannot handle grouping.
    pub async fn scrape_host(&self, status: &Arc<Mutex<TrackerStatus>>, now: u64) {
        let (scrape_url, batch) = {
            let mut status = status.lock();
            let Some(url) = status.scrape_url().cloned() else {
                return;
            };
            let batch = due_batch(&mut status, now, &self.config.scrape);
            if batch.is_empty() {
                return;
            }
            for hash in &batch {
                status.entry_mut(hash).state = ScrapeState::Scraping;
            }
            status.scrape_started();
            (url, batch)
        };

        tracing::debug!(
            "Scraping {} hash(es) against {scrape_url}",
            batch.len()
        );

        let fetched = self.fetch(&scrape_url, &batch).await;
        let reissue = {
            let mut status = status.lock();
            status.scrape_finished();
            self.apply(&mut status, &batch, fetched, now)
        };

        if reissue {
            for hash in &batch {
                let single = [*hash];
                let fetched = self.fetch(&scrape_url, &single).await;
                let mut status = status.lock();
                self.apply(&mut status, &single, fetched, now);
            }
        }

        let updated: Vec<ScrapeEntry> = {
            let status = status.lock();
            batch
                .iter()
                .filter_map(|hash| status.entry(hash).cloned())
                .collect()
        };
        let listeners = self.listeners.lock().clone();
        futures::future::join_all(
            listeners
                .iter()
                .flat_map(|listener| updated.iter().map(move |entry| listener.scrape_result(entry))),
        )
        .await;
    }

    async fn fetch(
        &self,
        scrape_url: &Url,
        hashes: &[InfoHash],
    ) -> Result<ScrapeFetch, TrackerError> {
        match scrape_url.scheme() {
            "udp" => {
                let client = UdpTrackerClient::connect(
                    scrape_url,
                    &self.config.udp,
                    false,
                    self.config.network.ipv6_enabled,
                )
                .await?;
                let entries = client.scrape(hashes).await?;
                Ok(ScrapeFetch::Decoded(DecodedScrape {
                    entries,
                    min_request_interval: None,
                    legacy_counts: None,
                }))
            }
            _ => self.fetch_http(scrape_url, hashes).await,
        }
    }

    async fn fetch_http(
        &self,
        scrape_url: &Url,
        hashes: &[InfoHash],
    ) -> Result<ScrapeFetch, TrackerError> {
        let request_url = build_scrape_url(scrape_url, hashes);

        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        let client = reqwest::Client::builder()
            .timeout(self.config.announce.tracker_timeout)
            .user_agent(self.config.announce.user_agent)
            .redirect(reqwest::redirect::Policy::limited(5))
            .default_headers(headers)
            .build()?;

        let response = client.get(&request_url).send().await.map_err(|e| {
            if e.is_timeout() {
                TrackerError::Timeout {
                    url: request_url.clone(),
                }
            } else {
                TrackerError::Http(e)
            }
        })?;

        let http_status = response.status();
        if http_status == reqwest::StatusCode::URI_TOO_LONG {
            return Ok(ScrapeFetch::UriTooLong);
        }
        if !http_status.is_success() {
            return Err(TrackerError::NetworkUnreachable {
                url: format!("{request_url} (HTTP {http_status})"),
            });
        }

        let limit = self.config.announce.max_response_bytes;
        let mut body = Vec::new();
        let mut response = response;
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > limit {
                return Err(TrackerError::ResponseTooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(ScrapeFetch::Decoded(decode_scrape_response(&body)?))
    }

    /// Applies a fetch result to the host's entries. Returns true when the
    /// batch must be reissued as single-hash requests.
    fn apply(
        &self,
        status: &mut TrackerStatus,
        batch: &[InfoHash],
        fetched: Result<ScrapeFetch, TrackerError>,
        now: u64,
    ) -> bool {
        match fetched {
            Ok(ScrapeFetch::UriTooLong) if batch.len() > 1 => {
                // The URL was simply too long; no error is recorded so the
                // single-hash retries happen promptly.
                status.downgrade_to_single_hash();
                for hash in batch {
                    status.entry_mut(hash).state = ScrapeState::Initializing;
                }
                true
            }
            Ok(ScrapeFetch::UriTooLong) => {
                self.record_failure(status, batch, "tracker rejected scrape URL length", now);
                false
            }
            Ok(ScrapeFetch::Decoded(decoded)) => {
                let short_result = batch.len() > 1
                    && (decoded.entries.len() < batch.len() || decoded.legacy_counts.is_some());
                if short_result {
                    status.downgrade_to_single_hash();
                    for hash in batch {
                        status.entry_mut(hash).state = ScrapeState::Initializing;
                    }
                    return true;
                }

                for hash in batch {
                    let found = decoded.entries.iter().find(|e| e.hash == *hash);
                    let entry = status.entry_mut(hash);
                    if let Some(file) = found {
                        entry.seeds = file.seeds;
                        entry.peers = file.peers;
                        entry.completed = file.completed;
                        entry.state = ScrapeState::Online;
                        entry.message = None;
                        entry.next_scrape_time = now
                            + u64::from(scrape_interval_secs(
                                file.seeds,
                                decoded.min_request_interval,
                            ));
                    } else if let Some((complete, incomplete)) = decoded.legacy_counts {
                        // Single-pair answer to a single-hash request.
                        entry.seeds = complete;
                        entry.peers = incomplete;
                        entry.state = ScrapeState::Online;
                        entry.message = None;
                        entry.next_scrape_time = now
                            + u64::from(scrape_interval_secs(
                                complete,
                                decoded.min_request_interval,
                            ));
                    } else {
                        // A well-formed response without our hash is a
                        // definitive not-found; back off for a long time.
                        entry.state = ScrapeState::Error;
                        entry.message = Some("hash not found on tracker".to_string());
                        entry.next_scrape_time = now + self.config.scrape.not_found_retry.as_secs();
                    }
                }
                false
            }
            Err(e) => {
                tracing::debug!("Scrape against {} failed: {e}", status.host());
                self.record_failure(status, batch, &e.to_string(), now);
                false
            }
        }
    }

    /// Marks every batch hash errored, keeping last-known-good counts.
    fn record_failure(&self, status: &mut TrackerStatus, batch: &[InfoHash], message: &str, now: u64) {
        for hash in batch {
            let entry = status.entry_mut(hash);
            entry.state = ScrapeState::Error;
            entry.message = Some(message.to_string());
            entry.next_scrape_time = now + self.config.scrape.faulty_retry.as_secs();
        }
    }
}

/// Collects the hashes to scrape now: the earliest-due hash plus any other
/// hash on the host due within the grouping window, up to the batch limit.
fn due_batch(status: &mut TrackerStatus, now: u64, config: &ScrapeConfig) -> Vec<InfoHash> {
    let mut due: Vec<(u64, InfoHash)> = status
        .entries()
        .filter(|e| e.state != ScrapeState::Scraping && e.next_scrape_time <= now)
        .map(|e| (e.next_scrape_time, e.hash))
        .collect();
    due.sort_by_key(|(time, _)| *time);

    let Some(&(_, primary)) = due.first() else {
        return Vec::new();
    };
    if status.single_hash_only() {
        return vec![primary];
    }

    let horizon = now + config.group_window.as_secs();
    let mut soon: Vec<(u64, InfoHash)> = status
        .entries()
        .filter(|e| {
            e.hash != primary && e.state != ScrapeState::Scraping && e.next_scrape_time <= horizon
        })
        .map(|e| (e.next_scrape_time, e.hash))
        .collect();
    soon.sort_by_key(|(time, _)| *time);

    let mut batch = vec![primary];
    for (_, hash) in soon {
        if batch.len() >= config.group_limit {
            break;
        }
        batch.push(hash);
    }
    batch
}

/// Picks the next tracker host to scrape across the whole registry.
pub struct ScrapeScheduler {
    registry: Arc<TrackerRegistry>,
    config: ScrapeConfig,
}

impl ScrapeScheduler {
    pub fn new(registry: Arc<TrackerRegistry>, config: ScrapeConfig) -> Self {
        Self { registry, config }
    }

    /// Returns the next host to scrape and its due time.
    ///
    /// Normally the globally earliest-due host without a scrape already in
    /// flight; a blocked host is returned instead when it is due strictly
    /// sooner and the best unblocked host is still at least the margin
    /// away, in hope it unblocks before its slot arrives.
    pub fn next_due(&self, now: u64) -> Option<(u64, Arc<Mutex<TrackerStatus>>)> {
        let mut best_free: Option<(u64, Arc<Mutex<TrackerStatus>>)> = None;
        let mut best_blocked: Option<(u64, Arc<Mutex<TrackerStatus>>)> = None;

        for status in self.registry.all_statuses() {
            let (due, blocked) = {
                let status = status.lock();
                if !status.supports_scrape() {
                    continue;
                }
                let due = status
                    .entries()
                    .filter(|e| e.state != ScrapeState::Scraping)
                    .map(|e| e.next_scrape_time)
                    .min();
                match due {
                    Some(due) => (due, status.active_scrapes() > 0),
                    None => continue,
                }
            };

            let slot = if blocked {
                &mut best_blocked
            } else {
                &mut best_free
            };
            if slot.as_ref().is_none_or(|(best, _)| due < *best) {
                *slot = Some((due, status));
            }
        }

        match (best_free, best_blocked) {
            (Some((free_due, free)), Some((blocked_due, blocked))) => {
                let margin = self.config.blocked_pick_margin.as_secs();
                if blocked_due < free_due && free_due >= now + margin {
                    Some((blocked_due, blocked))
                } else {
                    Some((free_due, free))
                }
            }
            (Some(free), None) => Some(free),
            (None, Some(blocked)) => Some(blocked),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod scrape_tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn registry_with_entries(hashes: &[InfoHash]) -> (Arc<TrackerRegistry>, Arc<Mutex<TrackerStatus>>) {
        let registry = Arc::new(TrackerRegistry::new());
        let url = Url::parse("http://tracker.example.com/announce").unwrap();
        let status = registry.status_for(&url);
        {
            let mut status = status.lock();
            for hash in hashes {
                status.entry_mut(hash);
            }
        }
        (registry, status)
    }

    #[test]
    fn test_scrape_interval_grows_with_seed_count() {
        assert_eq!(scrape_interval_secs(0, None), 900);
        assert_eq!(scrape_interval_secs(100, None), 900 + 60 * 10);
        // Tracker minimum raises the interval.
        assert_eq!(scrape_interval_secs(0, Some(2000)), 2000);
        // Upper bound.
        assert_eq!(scrape_interval_secs(1_000_000, None), 10_800);
        assert_eq!(scrape_interval_secs(0, Some(100_000)), 10_800);
    }

    #[test]
    fn test_due_batch_groups_within_window() {
        let hashes: Vec<InfoHash> = (0u8..4).map(|i| InfoHash::new([i; 20])).collect();
        let (_registry, status) = registry_with_entries(&hashes);
        let config = ScrapeConfig::default();

        {
            let mut status = status.lock();
            status.entry_mut(&hashes[0]).next_scrape_time = 1000;
            status.entry_mut(&hashes[1]).next_scrape_time = 1100;
            // Due within the 15-minute window but not yet.
            status.entry_mut(&hashes[2]).next_scrape_time = 1000 + 800;
            // Far in the future.
            status.entry_mut(&hashes[3]).next_scrape_time = 1000 + 7200;
        }

        let batch = due_batch(&mut status.lock(), 1200, &config);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0], hashes[0]);
        assert!(!batch.contains(&hashes[3]));
    }

    #[test]
    fn test_due_batch_respects_single_hash_downgrade() {
        let hashes: Vec<InfoHash> = (0u8..3).map(|i| InfoHash::new([i; 20])).collect();
        let (_registry, status) = registry_with_entries(&hashes);
        status.lock().downgrade_to_single_hash();

        let batch = due_batch(&mut status.lock(), 1000, &ScrapeConfig::default());
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_due_batch_caps_at_group_limit() {
        let hashes: Vec<InfoHash> = (0u8..30).map(|i| InfoHash::new([i; 20])).collect();
        let (_registry, status) = registry_with_entries(&hashes);

        let batch = due_batch(&mut status.lock(), 1000, &ScrapeConfig::default());
        assert_eq!(batch.len(), 20);
    }

    #[test]
    fn test_scheduler_prefers_earliest_unblocked() {
        let registry = Arc::new(TrackerRegistry::new());
        let early = registry.status_for(&Url::parse("http://early.example/announce").unwrap());
        let late = registry.status_for(&Url::parse("http://late.example/announce").unwrap());
        early.lock().entry_mut(&InfoHash::new([1; 20])).next_scrape_time = 100;
        late.lock().entry_mut(&InfoHash::new([2; 20])).next_scrape_time = 200;

        let scheduler = ScrapeScheduler::new(registry, ScrapeConfig::default());
        let (due, picked) = scheduler.next_due(0).unwrap();
        assert_eq!(due, 100);
        assert!(Arc::ptr_eq(&picked, &early));
    }

    #[test]
    fn test_scheduler_returns_blocked_host_when_due_sooner() {
        let registry = Arc::new(TrackerRegistry::new());
        let blocked = registry.status_for(&Url::parse("http://busy.example/announce").unwrap());
        let free = registry.status_for(&Url::parse("http://idle.example/announce").unwrap());
        blocked.lock().entry_mut(&InfoHash::new([1; 20])).next_scrape_time = 100;
        blocked.lock().scrape_started();
        free.lock().entry_mut(&InfoHash::new([2; 20])).next_scrape_time = 200;

        let scheduler = ScrapeScheduler::new(registry, ScrapeConfig::default());

        // Free host still >= 2s away: opportunistically return the blocked
        // one in hope it unblocks in time.
        let (_, picked) = scheduler.next_due(150).unwrap();
        assert!(Arc::ptr_eq(&picked, &blocked));

        // Free host due within the margin: take it.
        let (_, picked) = scheduler.next_due(199).unwrap();
        assert!(Arc::ptr_eq(&picked, &free));
    }

    /// Serves `bodies` over consecutive HTTP connections, recording how
    /// many requests arrived.
    async fn scripted_http_server(
        bodies: Vec<Vec<u8>>,
    ) -> (u16, tokio::task::JoinHandle<usize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let mut served = 0;
            for body in bodies {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await.unwrap();
                stream.write_all(&body).await.unwrap();
                served += 1;
            }
            served
        });
        (port, handle)
    }

    fn http_response(body: &[u8]) -> Vec<u8> {
        let mut response = format!(
            "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        response.extend_from_slice(body);
        response
    }

    /// Bencoded scrape body with one files entry per (hash, seeds) pair.
    fn scrape_body(entries: &[(InfoHash, u32)]) -> Vec<u8> {
        let mut body = b"d5:filesd".to_vec();
        for (hash, seeds) in entries {
            body.extend_from_slice(b"20:");
            body.extend_from_slice(hash.as_bytes());
            body.extend_from_slice(
                format!("d8:completei{seeds}e10:downloadedi1e10:incompletei3ee").as_bytes(),
            );
        }
        body.extend_from_slice(b"ee");
        body
    }

    #[tokio::test]
    async fn test_short_multi_hash_result_downgrades_and_reissues() {
        let hashes: Vec<InfoHash> = (1u8..=3).map(|i| InfoHash::new([i; 20])).collect();
        let full: Vec<(InfoHash, u32)> = hashes.iter().map(|h| (*h, 5)).collect();

        // First connection answers the 3-hash batch with a single entry;
        // the three single-hash reissues each get the full answer.
        let bodies = vec![
            http_response(&scrape_body(&full[..1])),
            http_response(&scrape_body(&full)),
            http_response(&scrape_body(&full)),
            http_response(&scrape_body(&full)),
        ];
        let (port, server) = scripted_http_server(bodies).await;

        let registry = Arc::new(TrackerRegistry::new());
        let url = Url::parse(&format!("http://127.0.0.1:{port}/announce")).unwrap();
        let status = registry.status_for(&url);
        {
            let mut status = status.lock();
            for hash in &hashes {
                status.entry_mut(hash);
            }
        }

        let session = ScrapeSession::new(UndertowConfig::default(), registry);
        session.scrape_host(&status, 1000).await;

        assert_eq!(server.await.unwrap(), 4);
        let status = status.lock();
        assert!(status.single_hash_only());
        for hash in &hashes {
            let entry = status.entry(hash).unwrap();
            assert_eq!(entry.state, ScrapeState::Online);
            assert_eq!(entry.seeds, 5);
            assert_eq!(entry.peers, 3);
            assert!(entry.next_scrape_time > 1000);
        }
    }

    #[tokio::test]
    async fn test_uri_too_long_downgrades_without_error() {
        let hashes: Vec<InfoHash> = (1u8..=2).map(|i| InfoHash::new([i; 20])).collect();
        let full: Vec<(InfoHash, u32)> = hashes.iter().map(|h| (*h, 7)).collect();

        let bodies = vec![
            b"HTTP/1.1 414 URI Too Long\r\ncontent-length: 0\r\nconnection: close\r\n\r\n".to_vec(),
            http_response(&scrape_body(&full)),
            http_response(&scrape_body(&full)),
        ];
        let (port, server) = scripted_http_server(bodies).await;

        let registry = Arc::new(TrackerRegistry::new());
        let url = Url::parse(&format!("http://127.0.0.1:{port}/announce")).unwrap();
        let status = registry.status_for(&url);
        {
            let mut status = status.lock();
            for hash in &hashes {
                status.entry_mut(hash);
            }
        }

        let session = ScrapeSession::new(UndertowConfig::default(), registry);
        session.scrape_host(&status, 1000).await;

        assert_eq!(server.await.unwrap(), 3);
        let status = status.lock();
        assert!(status.single_hash_only());
        // No error was recorded along the way: the entries went straight
        // from the downgrade to online.
        for hash in &hashes {
            let entry = status.entry(hash).unwrap();
            assert_eq!(entry.state, ScrapeState::Online);
            assert_eq!(entry.seeds, 7);
        }
    }

    #[tokio::test]
    async fn test_missing_hash_backs_off_three_hours() {
        let hash = InfoHash::new([9; 20]);
        let bodies = vec![http_response(&scrape_body(&[]))];
        let (port, server) = scripted_http_server(bodies).await;

        let registry = Arc::new(TrackerRegistry::new());
        let url = Url::parse(&format!("http://127.0.0.1:{port}/announce")).unwrap();
        let status = registry.status_for(&url);
        status.lock().entry_mut(&hash);

        let session = ScrapeSession::new(UndertowConfig::default(), registry);
        session.scrape_host(&status, 1000).await;

        server.await.unwrap();
        let status = status.lock();
        let entry = status.entry(&hash).unwrap();
        assert_eq!(entry.state, ScrapeState::Error);
        assert_eq!(entry.next_scrape_time, 1000 + 3 * 60 * 60);
    }

    #[tokio::test]
    async fn test_transport_failure_keeps_last_good_counts() {
        let hash = InfoHash::new([4; 20]);
        let registry = Arc::new(TrackerRegistry::new());
        // Nothing is listening on this port.
        let url = Url::parse("http://127.0.0.1:1/announce").unwrap();
        let status = registry.status_for(&url);
        {
            let mut status = status.lock();
            let entry = status.entry_mut(&hash);
            entry.seeds = 42;
            entry.peers = 17;
            entry.state = ScrapeState::Online;
        }

        let session = ScrapeSession::new(UndertowConfig::default(), registry);
        session.scrape_host(&status, 1000).await;

        let status = status.lock();
        let entry = status.entry(&hash).unwrap();
        assert_eq!(entry.state, ScrapeState::Error);
        // Last-known-good counts survive the error.
        assert_eq!(entry.seeds, 42);
        assert_eq!(entry.peers, 17);
        assert_eq!(entry.next_scrape_time, 1000 + 600);
    }
}

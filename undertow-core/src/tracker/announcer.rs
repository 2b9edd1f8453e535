//! Per-torrent announce state machine.
//!
//! Decides which event to send, walks the tiered URL list with failover,
//! and computes the next-announce delay from the tracker's declared
//! interval, the failure backoff, and any external override. One attempt
//! at a time per torrent; an overlapping tick is a no-op that reschedules.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::Rng;
use url::Url;

use super::backoff::FailureBackoff;
use super::registry::TrackerRegistry;
use super::session::{AnnounceTransport, AttemptContext};
use super::sources::{AnnounceDataProvider, PeerCache, TorrentView, TrackerListener, calculate_numwant};
use super::types::{
    AnnounceEvent, AnnounceRequestParams, AnnounceResponse, CryptoLevel, InfoHash, NetworkKind,
    PeerId, ResponseStatus,
};
use super::urls::TrackerUrlList;
use crate::config::{AnnounceConfig, REFRESH_MINIMUM_SECS};

/// Returned wait meaning "do not reschedule".
pub const NEVER: u32 = u32::MAX;

/// Lifecycle of a torrent's tracker relationship.
///
/// An explicit tracker error demotes `Downloading`/`Completed` back to
/// `Initialised` so the next contact sends a fresh `started`, which
/// trackers that lose peer state on restart require.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnouncerState {
    Initialised,
    Downloading,
    Completed,
    Stopped,
}

struct AnnouncerInner {
    state: AnnouncerState,
    urls: TrackerUrlList,
    tracker_id: Option<String>,
    complete_pending: bool,
    complete_reported: bool,
    stop_requested: bool,
    stop_attempted: bool,
    backoff: FailureBackoff,
    last_response: Option<AnnounceResponse>,
    status_line: String,
    /// Externally-set refresh-delay multiplier, 50-100 percent.
    override_percentage: Option<u8>,
}

/// Per-torrent announcer.
pub struct Announcer {
    info_hash: InfoHash,
    target_hash: InfoHash,
    peer_id: PeerId,
    is_private: bool,
    permitted_networks: Option<Vec<NetworkKind>>,
    announce_key: Option<String>,
    config: AnnounceConfig,
    transport: Arc<dyn AnnounceTransport>,
    registry: Arc<TrackerRegistry>,
    provider: Mutex<Option<Arc<dyn AnnounceDataProvider>>>,
    peer_cache: Mutex<Option<Arc<dyn PeerCache>>>,
    listeners: Mutex<Vec<Arc<dyn TrackerListener>>>,
    /// Single-in-flight guard; a tick that loses the race is a no-op.
    in_progress: AtomicBool,
    inner: Mutex<AnnouncerInner>,
}

enum TickPlan {
    /// Nothing to do this tick; reschedule after the given wait.
    Skip(u32),
    /// Transitioned straight to `Stopped` without a wire attempt.
    StopWithoutAnnounce,
    Announce {
        event: AnnounceEvent,
        params: AnnounceRequestParams,
        ctx: AttemptContext,
        urls: Vec<Url>,
        numwant: u32,
        is_seed: bool,
    },
}

impl Announcer {
    pub fn new(
        torrent: &dyn TorrentView,
        peer_id: PeerId,
        transport: Arc<dyn AnnounceTransport>,
        registry: Arc<TrackerRegistry>,
        config: AnnounceConfig,
    ) -> Self {
        let announce_key = config
            .send_key
            .then(|| format!("{:08x}", rand::rng().random::<u32>()));

        Self {
            info_hash: torrent.info_hash(),
            target_hash: torrent.target_hash(),
            peer_id,
            is_private: torrent.is_private(),
            permitted_networks: torrent.permitted_networks(),
            announce_key,
            config,
            transport,
            registry,
            provider: Mutex::new(None),
            peer_cache: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            in_progress: AtomicBool::new(false),
            inner: Mutex::new(AnnouncerInner {
                state: AnnouncerState::Initialised,
                urls: TrackerUrlList::new(torrent.announce_tiers()),
                tracker_id: None,
                complete_pending: false,
                complete_reported: false,
                stop_requested: false,
                stop_attempted: false,
                backoff: FailureBackoff::new(),
                last_response: None,
                status_line: String::new(),
                override_percentage: None,
            }),
        }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn state(&self) -> AnnouncerState {
        self.inner.lock().state
    }

    pub fn status_text(&self) -> String {
        self.inner.lock().status_line.clone()
    }

    pub fn last_response(&self) -> Option<AnnounceResponse> {
        self.inner.lock().last_response.clone()
    }

    pub fn url_list(&self) -> TrackerUrlList {
        self.inner.lock().urls.clone()
    }

    pub fn is_private(&self) -> bool {
        self.is_private
    }

    pub fn attach_provider(&self, provider: Arc<dyn AnnounceDataProvider>) {
        *self.provider.lock() = Some(provider);
    }

    pub fn set_peer_cache(&self, cache: Arc<dyn PeerCache>) {
        *self.peer_cache.lock() = Some(cache);
    }

    pub fn add_listener(&self, listener: Arc<dyn TrackerListener>) {
        self.listeners.lock().push(listener);
    }

    /// Marks the download complete; the next tick sends `completed` unless
    /// it has already been delivered.
    pub fn mark_complete(&self) {
        let mut inner = self.inner.lock();
        inner.complete_pending = true;
        if inner.state == AnnouncerState::Downloading {
            inner.state = AnnouncerState::Completed;
        }
    }

    /// Requests a final `stopped` announce. Exactly one attempt is made.
    pub fn request_stop(&self) {
        self.inner.lock().stop_requested = true;
    }

    /// Brings a stopped announcer back to life; the next tick sends a fresh
    /// `started`.
    pub fn reactivate(&self) {
        let mut inner = self.inner.lock();
        inner.state = AnnouncerState::Initialised;
        inner.stop_requested = false;
        inner.stop_attempted = false;
    }

    /// Sets the refresh-delay override percentage, clamped to 50-100.
    pub fn set_refresh_override(&self, percentage: u8) {
        self.inner.lock().override_percentage = Some(percentage.clamp(50, 100));
    }

    pub fn clear_refresh_override(&self) {
        self.inner.lock().override_percentage = None;
    }

    /// Runs one announce cycle and returns the seconds to wait before the
    /// next one ([`NEVER`] once stopped).
    pub async fn tick(&self) -> u32 {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another attempt is in flight; reschedule without touching it.
            return self
                .inner
                .lock()
                .backoff
                .error_retry_interval(unix_now(), false);
        }

        let wait = self.run_cycle().await;
        self.in_progress.store(false, Ordering::Release);
        wait
    }

    async fn run_cycle(&self) -> u32 {
        let plan = self.plan_tick();

        let (event, params, ctx, urls, numwant, is_seed) = match plan {
            TickPlan::Skip(wait) => return wait,
            TickPlan::StopWithoutAnnounce => return NEVER,
            TickPlan::Announce {
                event,
                params,
                ctx,
                urls,
                numwant,
                is_seed,
            } => (event, params, ctx, urls, numwant, is_seed),
        };

        // Walk tiers in order, skipping hosts that just reported overload,
        // stopping at the first online response.
        let mut skip_hosts: HashSet<String> = HashSet::new();
        let mut redirects: Vec<(Url, Url)> = Vec::new();
        let mut last: Option<(Url, AnnounceResponse)> = None;

        for url in urls {
            let host = TrackerRegistry::host_name(&url);
            if skip_hosts.contains(&host) {
                tracing::debug!("Skipping {url}: host reported overload this cycle");
                continue;
            }

            let outcome = self.transport.announce(&url, &params, &ctx).await;

            if let Some(overloaded) = outcome.overloaded_host {
                skip_hosts.insert(overloaded);
            }
            if let Some(new_url) = outcome.permanent_url {
                redirects.push((url.clone(), new_url));
            }

            let online = outcome.response.status == ResponseStatus::Online;
            last = Some((url, outcome.response));
            if online {
                break;
            }
        }

        let mut response = match &last {
            Some((_, response)) => response.clone(),
            // Empty or fully-filtered URL list.
            None => AnnounceResponse::offline(0, "no usable announce URLs"),
        };

        // Total failure still hands the caller something: cached peers,
        // oversized so the connection layer has room to fail some.
        if response.status != ResponseStatus::Online {
            let cache = self.peer_cache.lock().clone();
            if let Some(cache) = cache {
                let cached = cache.peers_from_cache(numwant as usize * 4);
                if !cached.is_empty() {
                    tracing::debug!(
                        "All announce URLs failed; merging {} cached peers",
                        cached.len()
                    );
                    response.peers.extend(cached);
                }
            }
        }

        if let Some(permitted) = &self.permitted_networks {
            response.retain_peers(|peer| permitted.contains(&NetworkKind::classify(&peer.ip)));
        }

        let (wait, moved_urls) =
            self.apply_result(event, last.as_ref().map(|(url, _)| url), &response, is_seed, redirects);

        if response.status == ResponseStatus::Online {
            let cache = self.peer_cache.lock().clone();
            if let Some(cache) = cache {
                cache.add_to_cache(&response.peers);
            }
        }

        let listeners = self.listeners.lock().clone();
        if !moved_urls.is_empty() {
            for (old, new) in &moved_urls {
                futures::future::join_all(
                    listeners
                        .iter()
                        .map(|listener| listener.url_changed(old, new, false)),
                )
                .await;
            }
            futures::future::join_all(listeners.iter().map(|listener| listener.urls_refreshed()))
                .await;
        }
        futures::future::join_all(
            listeners
                .iter()
                .map(|listener| listener.announce_result(self.info_hash, &response)),
        )
        .await;

        wait
    }

    /// Chooses the event for this tick and snapshots everything the async
    /// phase needs, under the state lock.
    fn plan_tick(&self) -> TickPlan {
        let provider = self.provider.lock().clone();
        let mut inner = self.inner.lock();

        if inner.state == AnnouncerState::Stopped {
            return TickPlan::Skip(NEVER);
        }

        let Some(provider) = provider else {
            // Provider not attached yet; reschedule with the retry interval.
            return TickPlan::Skip(inner.backoff.error_retry_interval(unix_now(), false));
        };

        let event = if inner.stop_requested {
            if inner.stop_attempted {
                inner.state = AnnouncerState::Stopped;
                return TickPlan::Skip(NEVER);
            }
            if inner.state == AnnouncerState::Initialised {
                // Never told the tracker we exist; nothing to retract.
                inner.state = AnnouncerState::Stopped;
                return TickPlan::StopWithoutAnnounce;
            }
            inner.stop_attempted = true;
            AnnounceEvent::Stopped
        } else if !provider.is_peer_source_enabled() {
            inner.status_line = "ps_disabled".to_string();
            return TickPlan::Skip(REFRESH_MINIMUM_SECS.max(inner.backoff.current()));
        } else if inner.state == AnnouncerState::Initialised {
            AnnounceEvent::Started
        } else if inner.complete_pending && !inner.complete_reported {
            AnnounceEvent::Completed
        } else {
            AnnounceEvent::None
        };

        let stopping = event == AnnounceEvent::Stopped;
        let numwant = if stopping {
            0
        } else {
            calculate_numwant(provider.max_new_connections_allowed()).min(self.config.max_numwant)
        };

        let remaining = provider.remaining();
        let crypto_level = provider.crypto_level();

        let mut params = AnnounceRequestParams::new(self.target_hash, self.peer_id, provider.tcp_listening_port());
        params.uploaded = provider.total_sent();
        params.downloaded = provider.total_received();
        params.left = remaining;
        params.corrupt = provider.failed_hash_check_count();
        params.event = event;
        params.numwant = numwant;
        params.require_crypto = crypto_level == CryptoLevel::Required;
        params.tracker_id = inner.tracker_id.clone();
        params.key = self.announce_key.clone();
        params.extensions = provider.extensions();
        params.pretend_complete = self.config.pretend_complete;
        params.upload_speed_kb = provider.upload_speed_kb_sec();

        let ctx = AttemptContext {
            first_announce: inner.last_response.is_none(),
            stopping,
            is_private: self.is_private,
            permitted_networks: self.permitted_networks.clone(),
        };

        let urls = inner
            .urls
            .flattened()
            .into_iter()
            .map(|(_, url)| url)
            .collect();

        TickPlan::Announce {
            event,
            params,
            ctx,
            urls,
            numwant,
            is_seed: remaining == 0,
        }
    }

    /// Applies a finished cycle's result: state transition, URL promotion,
    /// backoff, status line, and the next wait. Returns the wait alongside
    /// the redirects actually applied, for listener notification.
    fn apply_result(
        &self,
        event: AnnounceEvent,
        url: Option<&Url>,
        response: &AnnounceResponse,
        is_seed: bool,
        redirects: Vec<(Url, Url)>,
    ) -> (u32, Vec<(Url, Url)>) {
        let mut inner = self.inner.lock();

        let mut moved = Vec::new();
        for (old, new) in redirects {
            if inner.urls.replace(&old, new.clone()) {
                tracing::info!("Announce URL permanently moved: {old} -> {new}");
                moved.push((old, new));
            }
        }

        let online = response.status == ResponseStatus::Online;

        if online {
            inner.backoff.reset();
            if let Some(url) = url {
                inner.urls.promote(url);
            }
            if response.tracker_id.is_some() {
                inner.tracker_id = response.tracker_id.clone();
            }
        }

        match event {
            AnnounceEvent::Stopped => {
                // One attempt only, regardless of how it went.
                inner.state = AnnouncerState::Stopped;
            }
            AnnounceEvent::Started if online => {
                inner.state = AnnouncerState::Downloading;
            }
            AnnounceEvent::Completed => {
                // A tracker-side rejection still counts as delivered, so the
                // event is never double-counted by the tracker.
                if response.status != ResponseStatus::Offline {
                    inner.complete_reported = true;
                }
                if online {
                    inner.state = AnnouncerState::Completed;
                }
            }
            _ => {}
        }

        if response.status == ResponseStatus::ReportedError
            && matches!(
                inner.state,
                AnnouncerState::Downloading | AnnouncerState::Completed
            )
        {
            // Tracker dropped us; re-introduce ourselves with `started`.
            inner.state = AnnouncerState::Initialised;
        }

        inner.status_line = match response.status {
            ResponseStatus::Online => "ok".to_string(),
            ResponseStatus::Offline => "offline".to_string(),
            ResponseStatus::ReportedError => {
                format!("error: {}", response.message.as_deref().unwrap_or("unspecified"))
            }
        };

        inner.last_response = Some(response.clone());

        if inner.state == AnnouncerState::Stopped {
            return (NEVER, moved);
        }

        let wait = adjusted_secs_to_wait(&mut inner, response, unix_now(), is_seed);
        (wait, moved)
    }
}

/// Next-wait computation from the last response.
///
/// Explicit tracker errors force a 900s backoff floor before the escalating
/// retry interval; network failures use the retry interval directly; a
/// healthy response starts from the declared interval, applies the override
/// percentage, floors at [`REFRESH_MINIMUM_SECS`], and scales toward a
/// larger declared min-interval without ever passing the full interval.
fn adjusted_secs_to_wait(
    inner: &mut AnnouncerInner,
    response: &AnnounceResponse,
    now_secs: u64,
    is_seed: bool,
) -> u32 {
    match response.status {
        ResponseStatus::ReportedError => {
            inner.backoff.raise_floor(900);
            inner.backoff.error_retry_interval(now_secs, is_seed)
        }
        ResponseStatus::Offline => inner.backoff.error_retry_interval(now_secs, is_seed),
        ResponseStatus::Online => {
            let mut wait = u64::from(response.interval_secs);
            if let Some(percentage) = inner.override_percentage {
                wait = wait * u64::from(percentage) / 100;
            }
            let mut wait = wait.max(u64::from(REFRESH_MINIMUM_SECS)) as u32;

            if let Some(min_interval) = response.min_interval_secs {
                if min_interval > wait {
                    // Pull the wait toward min_interval, weighted by how far
                    // below it the base wait sits, capped at the interval.
                    let deficit = min_interval - wait;
                    let pulled = wait.saturating_add(deficit.saturating_mul(deficit) / min_interval);
                    wait = pulled.min(response.interval_secs.max(wait));
                }
            }
            wait
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod announcer_tests {
    use super::*;
    use crate::tracker::simulated::{ScriptedResponse, SimulatedTransport};

    struct TestTorrent {
        tiers: Vec<Vec<String>>,
    }

    impl TorrentView for TestTorrent {
        fn info_hash(&self) -> InfoHash {
            InfoHash::new([0; 20])
        }
        fn is_private(&self) -> bool {
            false
        }
        fn announce_tiers(&self) -> Vec<Vec<String>> {
            self.tiers.clone()
        }
    }

    struct TestProvider {
        peer_source_enabled: bool,
    }

    impl AnnounceDataProvider for TestProvider {
        fn tcp_listening_port(&self) -> u16 {
            6881
        }
        fn total_sent(&self) -> u64 {
            0
        }
        fn total_received(&self) -> u64 {
            0
        }
        fn remaining(&self) -> u64 {
            1000
        }
        fn failed_hash_check_count(&self) -> u64 {
            0
        }
        fn is_peer_source_enabled(&self) -> bool {
            self.peer_source_enabled
        }
        fn max_new_connections_allowed(&self) -> Option<u32> {
            None
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        url_changes: Mutex<Vec<(String, String, bool)>>,
        refreshes: Mutex<u32>,
    }

    #[async_trait::async_trait]
    impl TrackerListener for RecordingListener {
        async fn announce_result(&self, _hash: InfoHash, _response: &AnnounceResponse) {}
        async fn scrape_result(&self, _entry: &crate::tracker::types::ScrapeEntry) {}
        async fn url_changed(&self, old: &Url, new: &Url, explicit: bool) {
            self.url_changes
                .lock()
                .push((old.to_string(), new.to_string(), explicit));
        }
        async fn urls_refreshed(&self) {
            *self.refreshes.lock() += 1;
        }
    }

    fn announcer(tiers: Vec<Vec<&str>>, transport: Arc<SimulatedTransport>) -> Announcer {
        let torrent = TestTorrent {
            tiers: tiers
                .into_iter()
                .map(|tier| tier.into_iter().map(str::to_string).collect())
                .collect(),
        };
        let announcer = Announcer::new(
            &torrent,
            PeerId::new([7; 20]),
            transport,
            Arc::new(TrackerRegistry::new()),
            AnnounceConfig::default(),
        );
        announcer.attach_provider(Arc::new(TestProvider {
            peer_source_enabled: true,
        }));
        announcer
    }

    #[tokio::test]
    async fn test_first_announce_sends_started_and_transitions() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.script_repeating(
            "http://tracker.example/announce",
            ScriptedResponse::online(1790, Vec::new()),
        );
        let announcer = announcer(vec![vec!["http://tracker.example/announce"]], transport.clone());

        let wait = announcer.tick().await;

        assert_eq!(announcer.state(), AnnouncerState::Downloading);
        assert_eq!(wait, 1790);
        assert_eq!(announcer.status_text(), "ok");
        let calls = transport.calls();
        assert_eq!(calls, vec![(
            "http://tracker.example/announce".to_string(),
            AnnounceEvent::Started,
        )]);
    }

    #[tokio::test]
    async fn test_failover_promotes_working_url() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.script_repeating(
            "http://dead.example/announce",
            ScriptedResponse::offline("connection refused"),
        );
        transport.script_repeating(
            "http://live.example/announce",
            ScriptedResponse::online(1800, Vec::new()),
        );
        let announcer = announcer(
            vec![
                vec!["http://dead.example/announce"],
                vec!["http://live.example/announce"],
            ],
            transport.clone(),
        );

        announcer.tick().await;

        // The working URL is promoted to position 0,0 after one success.
        let flat = announcer.url_list().flattened();
        assert_eq!(flat[0].1.as_str(), "http://live.example/announce");
        assert_eq!(flat[0].0, 0);

        // The next announce goes straight to the promoted URL.
        announcer.tick().await;
        let calls = transport.calls();
        assert_eq!(calls.last().unwrap().0, "http://live.example/announce");
        assert_eq!(calls.len(), 3);
    }

    #[tokio::test]
    async fn test_permanent_redirect_rewrites_urls_and_notifies_listeners() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.script(
            "http://old.example/announce",
            ScriptedResponse::online(1800, Vec::new())
                .with_permanent_url("http://new.example/announce"),
        );
        transport.script_repeating(
            "http://new.example/announce",
            ScriptedResponse::online(1800, Vec::new()),
        );
        let announcer = announcer(vec![vec!["http://old.example/announce"]], transport.clone());
        let listener = Arc::new(RecordingListener::default());
        announcer.add_listener(listener.clone());

        announcer.tick().await;

        let changes = listener.url_changes.lock().clone();
        assert_eq!(
            changes,
            vec![(
                "http://old.example/announce".to_string(),
                "http://new.example/announce".to_string(),
                false,
            )]
        );
        assert_eq!(*listener.refreshes.lock(), 1);

        // The announce list is rewritten in place and used from now on.
        let flat = announcer.url_list().flattened();
        assert_eq!(flat[0].1.as_str(), "http://new.example/announce");
        announcer.tick().await;
        assert_eq!(
            transport.calls().last().unwrap().0,
            "http://new.example/announce"
        );
    }

    #[tokio::test]
    async fn test_overloaded_host_skips_sibling_port() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.script_repeating(
            "http://busy.example:80/announce",
            ScriptedResponse::reported_error("too many seeds"),
        );
        transport.script_repeating(
            "http://busy.example:8080/announce",
            ScriptedResponse::online(1800, Vec::new()),
        );
        transport.script_repeating(
            "http://other.example/announce",
            ScriptedResponse::online(1800, Vec::new()),
        );
        let announcer = announcer(
            vec![vec![
                "http://busy.example:80/announce",
                "http://busy.example:8080/announce",
                "http://other.example/announce",
            ]],
            transport.clone(),
        );

        announcer.tick().await;

        let attempted: Vec<String> = transport.calls().into_iter().map(|(url, _)| url).collect();
        // Second port on the overloaded host is skipped; the other host is
        // still tried.
        assert_eq!(
            attempted,
            vec![
                "http://busy.example:80/announce".to_string(),
                "http://other.example/announce".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_is_final() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.script_repeating(
            "http://tracker.example/announce",
            ScriptedResponse::online(1800, Vec::new()),
        );
        let announcer = announcer(vec![vec!["http://tracker.example/announce"]], transport.clone());

        announcer.tick().await;
        announcer.request_stop();
        let wait = announcer.tick().await;

        assert_eq!(announcer.state(), AnnouncerState::Stopped);
        assert_eq!(wait, NEVER);
        assert_eq!(transport.calls().last().unwrap().1, AnnounceEvent::Stopped);

        // Further ticks do nothing.
        let calls_before = transport.calls().len();
        assert_eq!(announcer.tick().await, NEVER);
        assert_eq!(transport.calls().len(), calls_before);

        // Reactivation starts the lifecycle over.
        announcer.reactivate();
        announcer.tick().await;
        assert_eq!(transport.calls().last().unwrap().1, AnnounceEvent::Started);
    }

    #[tokio::test]
    async fn test_stop_before_start_skips_the_wire() {
        let transport = Arc::new(SimulatedTransport::new());
        let announcer = announcer(vec![vec!["http://tracker.example/announce"]], transport.clone());

        announcer.request_stop();
        assert_eq!(announcer.tick().await, NEVER);
        assert_eq!(announcer.state(), AnnouncerState::Stopped);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_completed_marked_delivered_on_tracker_rejection() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.script(
            "http://tracker.example/announce",
            ScriptedResponse::online(1800, Vec::new()),
        );
        transport.script(
            "http://tracker.example/announce",
            ScriptedResponse::reported_error("unregistered torrent"),
        );
        transport.script_repeating(
            "http://tracker.example/announce",
            ScriptedResponse::online(1800, Vec::new()),
        );
        let announcer = announcer(vec![vec!["http://tracker.example/announce"]], transport.clone());

        announcer.tick().await;
        announcer.mark_complete();
        announcer.tick().await;

        // The rejection still counts as delivered, and the explicit error
        // demotes the state so the next contact re-introduces us.
        assert_eq!(transport.calls()[1].1, AnnounceEvent::Completed);
        assert_eq!(announcer.state(), AnnouncerState::Initialised);
        announcer.tick().await;
        assert_eq!(transport.calls()[2].1, AnnounceEvent::Started);
    }

    #[tokio::test]
    async fn test_reported_error_waits_at_least_900s() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.script_repeating(
            "http://tracker.example/announce",
            ScriptedResponse::reported_error("unregistered torrent"),
        );
        let announcer = announcer(vec![vec!["http://tracker.example/announce"]], transport.clone());

        let wait = announcer.tick().await;
        assert!(wait >= 900, "reported errors retry no sooner than 900s, got {wait}");
        assert!(announcer.status_text().starts_with("error: "));
    }

    #[tokio::test]
    async fn test_disabled_peer_source_skips_announce() {
        let transport = Arc::new(SimulatedTransport::new());
        let torrent = TestTorrent {
            tiers: vec![vec!["http://tracker.example/announce".to_string()]],
        };
        let announcer = Announcer::new(
            &torrent,
            PeerId::new([7; 20]),
            transport.clone(),
            Arc::new(TrackerRegistry::new()),
            AnnounceConfig::default(),
        );
        announcer.attach_provider(Arc::new(TestProvider {
            peer_source_enabled: false,
        }));

        announcer.tick().await;
        assert_eq!(announcer.status_text(), "ps_disabled");
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_override_percentage_shortens_wait() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.script_repeating(
            "http://tracker.example/announce",
            ScriptedResponse::online(1000, Vec::new()),
        );
        let announcer = announcer(vec![vec!["http://tracker.example/announce"]], transport.clone());
        announcer.set_refresh_override(50);

        let wait = announcer.tick().await;
        assert_eq!(wait, 500);
    }

    #[tokio::test]
    async fn test_end_to_end_announce_over_http() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        use crate::config::UndertowConfig;
        use crate::tracker::session::AnnounceSession;

        // Compact v1 peer list: 10.0.0.1:6881 and 10.0.0.2:6882.
        let mut body = b"d8:intervali1800e5:peers12:".to_vec();
        body.extend_from_slice(&[10, 0, 0, 1, 0x1A, 0xE1]);
        body.extend_from_slice(&[10, 0, 0, 2, 0x1A, 0xE2]);
        body.push(b'e');

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await.unwrap();
            let head = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(head.as_bytes()).await.unwrap();
            stream.write_all(&body).await.unwrap();
        });

        let registry = Arc::new(TrackerRegistry::new());
        let session = Arc::new(AnnounceSession::new(
            UndertowConfig::default(),
            registry.clone(),
        ));
        let torrent = TestTorrent {
            tiers: vec![vec![format!("http://127.0.0.1:{port}/announce")]],
        };
        let announcer = Announcer::new(
            &torrent,
            PeerId::new([7; 20]),
            session,
            registry,
            AnnounceConfig::default(),
        );
        announcer.attach_provider(Arc::new(TestProvider {
            peer_source_enabled: true,
        }));

        let wait = announcer.tick().await;
        server.await.unwrap();

        // 1800s interval minus the 10s safety margin.
        assert_eq!(wait, 1790);
        assert_eq!(announcer.state(), AnnouncerState::Downloading);
        assert_eq!(announcer.status_text(), "ok");

        let response = announcer.last_response().unwrap();
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[0].ip, "10.0.0.1");
        assert_eq!(response.peers[0].tcp_port, 6881);
        // Peer ids are synthesized deterministically from the address.
        assert_eq!(response.peers[0].peer_id, PeerId::synthesize("10.0.0.1", 6881));
        assert_eq!(response.peers[1].peer_id, PeerId::synthesize("10.0.0.2", 6882));
    }

    #[tokio::test]
    async fn test_wait_never_below_refresh_minimum() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.script_repeating(
            "http://tracker.example/announce",
            ScriptedResponse::online(5, Vec::new()),
        );
        let announcer = announcer(vec![vec!["http://tracker.example/announce"]], transport.clone());

        let wait = announcer.tick().await;
        assert_eq!(wait, REFRESH_MINIMUM_SECS);
    }
}

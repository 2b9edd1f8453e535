//! Core types for tracker announce and scrape communication

use std::fmt;

use sha1::{Digest, Sha1};

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte hash of the info dictionary. Used as the swarm key in every
/// announce and scrape exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from a 20-byte hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Creates InfoHash from a byte slice, if it is exactly 20 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 20] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// 20-byte peer identifier.
///
/// Either reported by the tracker or synthesized deterministically from the
/// peer's address when the tracker omits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Synthesizes a deterministic peer id from an (ip, port) pair.
    ///
    /// Repeated observations of the same address collapse to the same id
    /// internally, so peers without a reported id can still be deduplicated.
    pub fn synthesize(ip: &str, port: u16) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(ip.as_bytes());
        hasher.update(port.to_be_bytes());
        let digest = hasher.finalize();
        let mut id = [0u8; 20];
        id.copy_from_slice(&digest);
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// BitTorrent announce events.
///
/// `None` is the plain periodic update; the others mark client state changes
/// the tracker needs for swarm accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnnounceEvent {
    Started,
    Stopped,
    Completed,
    #[default]
    None,
}

impl AnnounceEvent {
    /// Wire representation. Empty for plain updates, in which case the
    /// `event` parameter is omitted entirely.
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Stopped => "stopped",
            AnnounceEvent::Completed => "completed",
            AnnounceEvent::None => "",
        }
    }
}

/// Network classification of a tracker host.
///
/// Decides which announce parameters apply and whether the torrent's
/// permitted-network list allows contacting the host at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkKind {
    Public,
    I2p,
    Tor,
}

impl NetworkKind {
    /// Classifies a hostname by its suffix.
    pub fn classify(host: &str) -> Self {
        let host = host.to_ascii_lowercase();
        if host.ends_with(".i2p") {
            NetworkKind::I2p
        } else if host.ends_with(".onion") {
            NetworkKind::Tor
        } else {
            NetworkKind::Public
        }
    }
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkKind::Public => "Public",
            NetworkKind::I2p => "I2P",
            NetworkKind::Tor => "Tor",
        };
        write!(f, "{s}")
    }
}

/// Peer connection protocol preference carried in AZ compact encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CryptoLevel {
    #[default]
    Plain,
    Required,
}

/// Origin of a peer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    Tracker,
    Cache,
}

/// Normalized peer record produced by every peer-list encoding.
///
/// Ephemeral: rebuilt from each response, never persisted beyond the
/// short-lived peer cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub source: PeerSource,
    pub peer_id: PeerId,
    /// String form to accommodate v4, v6 and `.b32.i2p` hostnames.
    pub ip: String,
    pub tcp_port: u16,
    pub udp_port: Option<u16>,
    pub http_port: Option<u16>,
    pub crypto: CryptoLevel,
    /// Client version tag from AZ-extended responses.
    pub az_version: u8,
    /// Upload speed hint in KiB/s from AZ-extended responses.
    pub upload_speed: Option<u32>,
}

impl PeerRecord {
    /// Builds a tracker-sourced record with a synthesized peer id.
    pub fn from_address(ip: String, tcp_port: u16) -> Self {
        let peer_id = PeerId::synthesize(&ip, tcp_port);
        Self {
            source: PeerSource::Tracker,
            peer_id,
            ip,
            tcp_port,
            udp_port: None,
            http_port: None,
            crypto: CryptoLevel::Plain,
            az_version: 1,
            upload_speed: None,
        }
    }
}

/// Classification of one announce attempt's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    /// Parseable response received.
    Online,
    /// Network-level failure: DNS, connect, timeout, malformed data.
    Offline,
    /// Tracker explicitly returned a failure reason.
    ReportedError,
}

/// Parameters for a single announce attempt.
///
/// Built fresh per attempt from the data provider's live counters; never
/// cached across attempts.
#[derive(Debug, Clone)]
pub struct AnnounceRequestParams {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub corrupt: u64,
    pub event: AnnounceEvent,
    pub numwant: u32,
    pub tcp_port: u16,
    /// Second listening port advertised when a crypto handshake port differs.
    pub crypto_port: Option<u16>,
    pub require_crypto: bool,
    /// Resolved `ip=` override, per network-type rules.
    pub ip_override: Option<String>,
    pub tracker_id: Option<String>,
    pub key: Option<String>,
    /// Free-form query suffix from the data provider.
    pub extensions: Option<String>,
    /// Stop issued because of queueing rather than user action.
    pub stopped_for_queue: bool,
    /// Pretend-complete mode reports `left=0` regardless of the counter.
    pub pretend_complete: bool,
    pub az_tracker: bool,
    pub upload_speed_kb: u32,
    /// Autonomous-system hint sent to AZ trackers.
    pub az_as: Option<String>,
    /// Network-position blob sent to AZ trackers, base32-encoded on the wire.
    pub az_np: Option<Vec<u8>>,
}

impl AnnounceRequestParams {
    /// Baseline parameters with zeroed counters, for callers that fill in
    /// live values afterwards.
    pub fn new(info_hash: InfoHash, peer_id: PeerId, tcp_port: u16) -> Self {
        Self {
            info_hash,
            peer_id,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            corrupt: 0,
            event: AnnounceEvent::None,
            numwant: 30,
            tcp_port,
            crypto_port: None,
            require_crypto: false,
            ip_override: None,
            tracker_id: None,
            key: None,
            extensions: None,
            stopped_for_queue: false,
            pretend_complete: false,
            az_tracker: false,
            upload_speed_kb: 0,
            az_as: None,
            az_np: None,
        }
    }
}

/// Result of one announce attempt, immutable after construction apart from
/// the post-hoc network-compatibility peer filter.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub status: ResponseStatus,
    /// Seconds until the next announce, post clamping and safety margin.
    pub interval_secs: u32,
    pub min_interval_secs: Option<u32>,
    /// Sticky tracker-assigned id echoed back on subsequent requests.
    pub tracker_id: Option<String>,
    pub peers: Vec<PeerRecord>,
    /// Seed count when the tracker includes scrape-like totals.
    pub complete: Option<u32>,
    pub incomplete: Option<u32>,
    pub downloaded: Option<u32>,
    /// Failure reason or warning/additional-info text.
    pub message: Option<String>,
    /// Response obtained via an automatic HTTP-to-UDP capability probe.
    pub udp_probe: bool,
}

impl AnnounceResponse {
    /// Builds an offline response carrying a failure description.
    pub fn offline(interval_secs: u32, message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Offline,
            interval_secs,
            min_interval_secs: None,
            tracker_id: None,
            peers: Vec::new(),
            complete: None,
            incomplete: None,
            downloaded: None,
            message: Some(message.into()),
            udp_probe: false,
        }
    }

    /// Builds a tracker-reported-error response.
    pub fn reported_error(interval_secs: u32, reason: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::ReportedError,
            message: Some(reason.into()),
            ..Self::offline(interval_secs, "")
        }
    }

    /// Drops peers rejected by a network-compatibility filter.
    ///
    /// The only mutation permitted after construction.
    pub fn retain_peers<F: FnMut(&PeerRecord) -> bool>(&mut self, filter: F) {
        self.peers.retain(filter);
    }
}

/// Scrape lifecycle for one hash on one tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeState {
    Initializing,
    Scraping,
    Online,
    Error,
}

/// Per-hash scrape results, retaining last-known-good counts across errors
/// so a transient failure does not blank the caller's view.
#[derive(Debug, Clone)]
pub struct ScrapeEntry {
    pub hash: InfoHash,
    pub seeds: u32,
    pub peers: u32,
    pub completed: u32,
    pub state: ScrapeState,
    /// Unix time in seconds of the next scheduled scrape.
    pub next_scrape_time: u64,
    pub message: Option<String>,
}

impl ScrapeEntry {
    pub fn new(hash: InfoHash) -> Self {
        Self {
            hash,
            seeds: 0,
            peers: 0,
            completed: 0,
            state: ScrapeState::Initializing,
            next_scrape_time: 0,
            message: None,
        }
    }
}

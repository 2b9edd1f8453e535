//! Interfaces to the surrounding application.
//!
//! The announcer consumes live statistics from a data provider and torrent
//! metadata from a torrent view, warms a peer cache, and reports results to
//! listeners. All four are trait objects so the core stays testable without
//! a download engine behind it.

use async_trait::async_trait;
use url::Url;

use super::types::{AnnounceResponse, CryptoLevel, InfoHash, NetworkKind, PeerRecord, ScrapeEntry};

/// Live per-torrent statistics supplied by the owning download.
///
/// Queried fresh on every announce attempt; values are never cached across
/// attempts.
pub trait AnnounceDataProvider: Send + Sync {
    fn tcp_listening_port(&self) -> u16;
    fn total_sent(&self) -> u64;
    fn total_received(&self) -> u64;
    fn remaining(&self) -> u64;
    fn failed_hash_check_count(&self) -> u64;
    /// Free-form query suffix appended to announce URLs.
    fn extensions(&self) -> Option<String> {
        None
    }
    fn is_peer_source_enabled(&self) -> bool {
        true
    }
    /// Upper bound on new connections; None means unbounded.
    fn max_new_connections_allowed(&self) -> Option<u32>;
    fn crypto_level(&self) -> CryptoLevel {
        CryptoLevel::Plain
    }
    fn upload_speed_kb_sec(&self) -> u32 {
        0
    }
}

/// Static view of the torrent being announced.
pub trait TorrentView: Send + Sync {
    fn info_hash(&self) -> InfoHash;
    /// Override hash announced in place of the real one for blinded or
    /// decentralized lookups.
    fn target_hash(&self) -> InfoHash {
        self.info_hash()
    }
    fn is_private(&self) -> bool;
    /// Announce-list tiers; a bare announce URL is a single one-URL tier.
    fn announce_tiers(&self) -> Vec<Vec<String>>;
    /// Networks this torrent may be announced over; None permits all.
    fn permitted_networks(&self) -> Option<Vec<NetworkKind>> {
        None
    }
}

/// Short-lived peer cache shared with the peer-connection layer.
///
/// Used both to seed a failure response with something useful and to let
/// external consumers warm the cache from successful announces.
pub trait PeerCache: Send + Sync {
    fn peers_from_cache(&self, max: usize) -> Vec<PeerRecord>;
    fn add_to_cache(&self, peers: &[PeerRecord]);
}

/// Consumer of announce and scrape results.
#[async_trait]
pub trait TrackerListener: Send + Sync {
    async fn announce_result(&self, hash: InfoHash, response: &AnnounceResponse);
    async fn scrape_result(&self, entry: &ScrapeEntry);
    /// A tracker signalled a permanent redirect; `explicit` is false when
    /// the change was inferred rather than user-initiated.
    async fn url_changed(&self, old: &Url, new: &Url, explicit: bool) {
        let _ = (old, new, explicit);
    }
    async fn urls_refreshed(&self) {}
}

/// Computes `numwant` from the provider's connection budget.
///
/// No budget at all asks for the default 30; a zero budget asks for none;
/// anything else is capped at 100 to keep responses small.
pub fn calculate_numwant(max_new_connections: Option<u32>) -> u32 {
    match max_new_connections {
        None => 30,
        Some(0) => 0,
        Some(allowed) => allowed.min(100),
    }
}

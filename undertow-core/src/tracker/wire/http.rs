//! HTTP announce/scrape query construction and bencoded response decoding.

use serde_bencode::value::Value;
use url::Url;

use super::super::peers::decode_peer_lists;
use super::super::types::{
    AnnounceEvent, AnnounceRequestParams, InfoHash, NetworkKind, PeerRecord,
};
use super::super::TrackerError;

/// AZ tracker protocol version advertised in `azver=`.
const AZ_TRACKER_VERSION: u8 = 3;

/// Parameters I2P trackers accept, in the only order they accept them.
const I2P_PARAM_WHITELIST: [&str; 10] = [
    "info_hash",
    "peer_id",
    "port",
    "ip",
    "uploaded",
    "downloaded",
    "left",
    "compact",
    "event",
    "numwant",
];

/// Percent-encodes raw bytes for a tracker query value.
///
/// Unreserved characters pass through, spaces become `%20` (never `+`) and
/// everything else is `%XX`-escaped. Applied to raw info-hash/peer-id bytes,
/// so it must never be double-encoded.
pub fn url_encode_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for &b in bytes {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char);
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Builds the full announce URL for one attempt.
///
/// Parameter order matters: some trackers and client-id extensions rely on
/// `info_hash` being the first parameter we append. Fails with
/// `InvalidNetwork` before any I/O when the host's network classification is
/// not among the torrent's permitted networks.
pub fn build_announce_url(
    base: &Url,
    params: &AnnounceRequestParams,
    permitted_networks: Option<&[NetworkKind]>,
) -> Result<String, TrackerError> {
    let host = base.host_str().unwrap_or_default();
    let network = NetworkKind::classify(host);

    if let Some(permitted) = permitted_networks {
        if !permitted.contains(&network) {
            return Err(TrackerError::InvalidNetwork {
                url: base.to_string(),
                network,
            });
        }
    }

    let mut query: Vec<(&str, String)> = Vec::with_capacity(20);

    query.push(("info_hash", url_encode_bytes(params.info_hash.as_bytes())));
    query.push(("peer_id", url_encode_bytes(params.peer_id.as_bytes())));

    // Port details depend on the crypto policy: a required-crypto client
    // advertises only its crypto port.
    if params.require_crypto {
        let port = params.crypto_port.unwrap_or(params.tcp_port);
        query.push(("port", port.to_string()));
        query.push(("requirecrypto", "1".to_string()));
    } else {
        query.push(("port", params.tcp_port.to_string()));
        if let Some(crypto_port) = params.crypto_port {
            query.push(("supportcrypto", "1".to_string()));
            query.push(("cryptoport", crypto_port.to_string()));
        }
    }

    query.push(("uploaded", params.uploaded.to_string()));
    query.push(("downloaded", params.downloaded.to_string()));
    let left = if params.pretend_complete { 0 } else { params.left };
    query.push(("left", left.to_string()));
    query.push(("corrupt", params.corrupt.to_string()));

    if let Some(tracker_id) = &params.tracker_id {
        query.push(("trackerid", tracker_id.clone()));
    }

    if params.event != AnnounceEvent::None {
        query.push(("event", params.event.as_str().to_string()));
    }

    if params.event == AnnounceEvent::Stopped {
        query.push(("numwant", "0".to_string()));
        if params.stopped_for_queue {
            query.push(("azq", "1".to_string()));
        }
    } else {
        query.push(("numwant", params.numwant.to_string()));
    }

    // Obsoleted by compact=1 but legacy trackers still want it.
    query.push(("no_peer_id", "1".to_string()));
    query.push(("compact", "1".to_string()));

    if let Some(ip) = &params.ip_override {
        query.push(("ip", ip.clone()));
    }

    if let Some(key) = &params.key {
        query.push(("key", key.clone()));
    }

    if network == NetworkKind::I2p {
        return Ok(assemble(base, truncate_for_i2p(query)));
    }

    let mut url = assemble(base, query);

    if let Some(extensions) = &params.extensions {
        if !extensions.is_empty() {
            url.push('&');
            url.push_str(extensions.trim_start_matches('&'));
        }
    }

    url.push_str(&format!("&azver={AZ_TRACKER_VERSION}"));

    if params.az_tracker {
        url.push_str(&format!("&azup={}", params.upload_speed_kb));
        if let Some(az_as) = &params.az_as {
            url.push_str(&format!("&azas={}", url_encode_bytes(az_as.as_bytes())));
        }
        if let Some(az_np) = &params.az_np {
            url.push_str(&format!("&aznp={}", super::super::peers::base32_encode(az_np)));
        }
    }

    Ok(url)
}

/// Keeps only the parameters I2P trackers tolerate, in their fixed order.
fn truncate_for_i2p(query: Vec<(&str, String)>) -> Vec<(&str, String)> {
    let mut kept = Vec::with_capacity(I2P_PARAM_WHITELIST.len());
    for name in I2P_PARAM_WHITELIST {
        if let Some(pair) = query.iter().find(|(k, _)| *k == name) {
            kept.push(pair.clone());
        }
    }
    kept
}

/// Joins the query onto the base URL, honoring an existing query string.
fn assemble(base: &Url, query: Vec<(&str, String)>) -> String {
    let mut url = base.to_string();
    url.push(if base.query().is_some() { '&' } else { '?' });
    for (i, (name, value)) in query.iter().enumerate() {
        if i > 0 {
            url.push('&');
        }
        url.push_str(name);
        url.push('=');
        url.push_str(value);
    }
    url
}

/// Decoded announce response, pre classification.
#[derive(Debug, Clone)]
pub struct DecodedAnnounce {
    /// Interval in seconds, clamped and safety-adjusted.
    pub interval_secs: u32,
    pub min_interval_secs: Option<u32>,
    pub tracker_id: Option<String>,
    pub peers: Vec<PeerRecord>,
    pub complete: Option<u32>,
    pub incomplete: Option<u32>,
    pub downloaded: Option<u32>,
    pub warning: Option<String>,
    /// Response carried AZ-flavoured keys; the host runs an AZ tracker.
    pub az_tracker: bool,
}

fn get_i64(dict: &std::collections::HashMap<Vec<u8>, Value>, key: &[u8]) -> Option<i64> {
    match dict.get(key) {
        Some(Value::Int(v)) => Some(*v),
        _ => None,
    }
}

fn get_string(dict: &std::collections::HashMap<Vec<u8>, Value>, key: &[u8]) -> Option<String> {
    match dict.get(key) {
        Some(Value::Bytes(b)) => Some(String::from_utf8_lossy(b).to_string()),
        _ => None,
    }
}

/// Clamps a declared interval into the protocol's u32 range.
fn clamp_interval(raw: i64) -> u32 {
    raw.clamp(0, i64::from(u32::MAX)) as u32
}

/// Decodes a bencoded announce response body.
///
/// `interval` is required unless the request carried a `stopped` event, in
/// which case absence is tolerated and treated as 60 seconds. A
/// `failure reason` key forces a reported error regardless of other keys.
pub fn decode_announce_response(
    body: &[u8],
    event: AnnounceEvent,
    network: NetworkKind,
) -> Result<DecodedAnnounce, TrackerError> {
    let value: Value =
        serde_bencode::from_bytes(body).map_err(|e| TrackerError::ProtocolError {
            message: format!("Failed to parse tracker response: {e}"),
        })?;

    let Value::Dict(dict) = value else {
        return Err(TrackerError::ProtocolError {
            message: "Tracker response is not a dictionary".to_string(),
        });
    };

    if let Some(reason) = get_string(&dict, b"failure reason") {
        return Err(TrackerError::TrackerReported { reason });
    }

    let raw_interval = match get_i64(&dict, b"interval") {
        Some(raw) => clamp_interval(raw),
        None if event == AnnounceEvent::Stopped => 60,
        None => {
            return Err(TrackerError::ProtocolError {
                message: "Missing interval in tracker response".to_string(),
            });
        }
    };

    // An explicit min interval outside (0, interval] is discarded and the
    // default derivation applies.
    let min_interval_secs = match get_i64(&dict, b"min interval") {
        Some(declared) if declared >= 1 && clamp_interval(declared) <= raw_interval => {
            Some(clamp_interval(declared))
        }
        _ => {
            if raw_interval > 30 {
                Some(raw_interval - 10)
            } else {
                Some(raw_interval)
            }
        }
    };

    // Back off 10 seconds from the tracker's own timeout window. Short
    // intervals are left alone.
    let interval_secs = if raw_interval > 30 {
        raw_interval - 10
    } else {
        raw_interval
    };

    let azcompact_declared = get_i64(&dict, b"azcompact");
    let azcompact = azcompact_declared.unwrap_or(0) as u8;
    let crypto_flags = match dict.get(b"crypto_flags".as_slice()) {
        Some(Value::Bytes(flags)) => Some(flags.clone()),
        _ => None,
    };

    let peers = decode_peer_lists(
        dict.get(b"peers".as_slice()),
        dict.get(b"peers6".as_slice()),
        azcompact,
        crypto_flags.as_deref(),
        network,
    );

    Ok(DecodedAnnounce {
        interval_secs,
        min_interval_secs,
        tracker_id: get_string(&dict, b"tracker id"),
        peers,
        complete: get_i64(&dict, b"complete").and_then(|v| u32::try_from(v).ok()),
        incomplete: get_i64(&dict, b"incomplete").and_then(|v| u32::try_from(v).ok()),
        downloaded: get_i64(&dict, b"downloaded").and_then(|v| u32::try_from(v).ok()),
        warning: get_string(&dict, b"warning message"),
        az_tracker: azcompact_declared.is_some(),
    })
}

/// Builds a scrape URL for one or more hashes.
pub fn build_scrape_url(scrape: &Url, hashes: &[InfoHash]) -> String {
    let mut url = scrape.to_string();
    let mut sep = if scrape.query().is_some() { '&' } else { '?' };
    for hash in hashes {
        url.push(sep);
        url.push_str("info_hash=");
        url.push_str(&url_encode_bytes(hash.as_bytes()));
        sep = '&';
    }
    url
}

/// Per-hash entry from a scrape response's `files` dictionary.
#[derive(Debug, Clone)]
pub struct ScrapeFileEntry {
    pub hash: InfoHash,
    pub seeds: u32,
    pub peers: u32,
    pub completed: u32,
}

/// Decoded scrape response.
#[derive(Debug, Clone)]
pub struct DecodedScrape {
    pub entries: Vec<ScrapeFileEntry>,
    /// Tracker-recommended minimum scrape interval, from the `flags` dict.
    pub min_request_interval: Option<u32>,
    /// Legacy single-pair form: top-level complete/incomplete counts.
    pub legacy_counts: Option<(u32, u32)>,
}

/// Decodes a bencoded scrape response body.
pub fn decode_scrape_response(body: &[u8]) -> Result<DecodedScrape, TrackerError> {
    let value: Value =
        serde_bencode::from_bytes(body).map_err(|e| TrackerError::ProtocolError {
            message: format!("Failed to parse scrape response: {e}"),
        })?;

    let Value::Dict(dict) = value else {
        return Err(TrackerError::ProtocolError {
            message: "Scrape response is not a dictionary".to_string(),
        });
    };

    if let Some(reason) = get_string(&dict, b"failure reason") {
        return Err(TrackerError::TrackerReported { reason });
    }

    let mut entries = Vec::new();
    if let Some(Value::Dict(files)) = dict.get(b"files".as_slice()) {
        for (hash_bytes, file) in files {
            let Some(hash) = InfoHash::from_slice(hash_bytes) else {
                tracing::debug!("Skipping scrape entry with {}-byte key", hash_bytes.len());
                continue;
            };
            let Value::Dict(file) = file else {
                continue;
            };
            entries.push(ScrapeFileEntry {
                hash,
                seeds: get_i64(file, b"complete").unwrap_or(0).max(0) as u32,
                peers: get_i64(file, b"incomplete").unwrap_or(0).max(0) as u32,
                completed: get_i64(file, b"downloaded").unwrap_or(0).max(0) as u32,
            });
        }
    }

    let min_request_interval = match dict.get(b"flags".as_slice()) {
        Some(Value::Dict(flags)) => {
            get_i64(flags, b"min_request_interval").and_then(|v| u32::try_from(v).ok())
        }
        _ => None,
    };

    // Some trackers answer a multi-hash scrape with a single top-level pair.
    let legacy_counts = match (get_i64(&dict, b"complete"), get_i64(&dict, b"incomplete")) {
        (Some(complete), Some(incomplete)) if entries.is_empty() => {
            Some((complete.max(0) as u32, incomplete.max(0) as u32))
        }
        _ => None,
    };

    Ok(DecodedScrape {
        entries,
        min_request_interval,
        legacy_counts,
    })
}

#[cfg(test)]
mod http_wire_tests {
    use super::*;
    use crate::tracker::types::PeerId;

    fn params() -> AnnounceRequestParams {
        let mut p = AnnounceRequestParams::new(
            InfoHash::new([0x11; 20]),
            PeerId::new([0x22; 20]),
            6881,
        );
        p.uploaded = 1000;
        p.downloaded = 500;
        p.left = 2000;
        p.numwant = 50;
        p
    }

    #[test]
    fn test_announce_url_parameter_order() {
        let base = Url::parse("http://tracker.example.com/announce").unwrap();
        let url = build_announce_url(&base, &params(), None).unwrap();

        let info_hash_pos = url.find("info_hash=").unwrap();
        let peer_id_pos = url.find("peer_id=").unwrap();
        let port_pos = url.find("port=").unwrap();
        let uploaded_pos = url.find("uploaded=").unwrap();

        // info_hash must be the first parameter we append.
        assert_eq!(&url[..info_hash_pos], "http://tracker.example.com/announce?");
        assert!(peer_id_pos > info_hash_pos);
        assert!(port_pos > peer_id_pos);
        assert!(uploaded_pos > port_pos);
        assert!(url.contains("no_peer_id=1"));
        assert!(url.contains("compact=1"));
        assert!(url.contains("corrupt=0"));
        assert!(url.contains("&azver=3"));
        assert!(url.contains(&format!("info_hash={}", "%11".repeat(20))));
    }

    #[test]
    fn test_announce_url_appends_to_existing_query() {
        let base = Url::parse("http://tracker.example.com/announce?passkey=abc").unwrap();
        let url = build_announce_url(&base, &params(), None).unwrap();
        assert!(url.starts_with("http://tracker.example.com/announce?passkey=abc&info_hash="));
    }

    #[test]
    fn test_stopped_event_sends_numwant_zero() {
        let mut p = params();
        p.event = AnnounceEvent::Stopped;
        p.stopped_for_queue = true;
        let base = Url::parse("http://tracker.example.com/announce").unwrap();
        let url = build_announce_url(&base, &p, None).unwrap();
        assert!(url.contains("event=stopped"));
        assert!(url.contains("numwant=0"));
        assert!(url.contains("azq=1"));
    }

    #[test]
    fn test_require_crypto_advertises_crypto_port_only() {
        let mut p = params();
        p.require_crypto = true;
        p.crypto_port = Some(7000);
        let base = Url::parse("http://tracker.example.com/announce").unwrap();
        let url = build_announce_url(&base, &p, None).unwrap();
        assert!(url.contains("port=7000"));
        assert!(url.contains("requirecrypto=1"));
        assert!(!url.contains("cryptoport="));
    }

    #[test]
    fn test_az_tracker_extended_parameters() {
        let mut p = params();
        p.az_tracker = true;
        p.upload_speed_kb = 12;
        p.az_as = Some("AS1234".to_string());
        let base = Url::parse("http://tracker.example.com/announce").unwrap();
        let url = build_announce_url(&base, &p, None).unwrap();
        assert!(url.contains("&azup=12"));
        assert!(url.contains("&azas=AS1234"));

        // A non-AZ host never receives the extras.
        p.az_tracker = false;
        let url = build_announce_url(&base, &p, None).unwrap();
        assert!(!url.contains("azup="));
        assert!(!url.contains("azas="));
    }

    #[test]
    fn test_azcompact_marks_az_host() {
        let body = b"d9:azcompacti1e8:intervali1800e5:peers0:e";
        let decoded =
            decode_announce_response(body, AnnounceEvent::None, NetworkKind::Public).unwrap();
        assert!(decoded.az_tracker);

        let body = b"d8:intervali1800e5:peers0:e";
        let decoded =
            decode_announce_response(body, AnnounceEvent::None, NetworkKind::Public).unwrap();
        assert!(!decoded.az_tracker);
    }

    #[test]
    fn test_i2p_query_truncated_to_whitelist() {
        let mut p = params();
        p.key = Some("secret".to_string());
        p.tracker_id = Some("tid".to_string());
        let base = Url::parse("http://abcdef.b32.i2p/a/announce").unwrap();
        let url = build_announce_url(&base, &p, None).unwrap();
        assert!(url.contains("info_hash="));
        assert!(url.contains("numwant="));
        assert!(!url.contains("key="));
        assert!(!url.contains("trackerid="));
        assert!(!url.contains("azver="));
        assert!(!url.contains("no_peer_id="));
    }

    #[test]
    fn test_network_restriction_rejected_before_io() {
        let base = Url::parse("http://abcdef.b32.i2p/announce").unwrap();
        let result = build_announce_url(&base, &params(), Some(&[NetworkKind::Public]));
        assert!(matches!(
            result,
            Err(TrackerError::InvalidNetwork {
                network: NetworkKind::I2p,
                ..
            })
        ));
    }

    #[test]
    fn test_interval_clamping() {
        // Declared -1 clamps to 0 (no safety subtraction at or below 30).
        let body = b"d8:intervali-1e5:peers0:e";
        let decoded =
            decode_announce_response(body, AnnounceEvent::None, NetworkKind::Public).unwrap();
        assert_eq!(decoded.interval_secs, 0);

        // 2^33 clamps to u32::MAX, then loses the 10-second margin.
        let body = b"d8:intervali8589934592e5:peers0:e";
        let decoded =
            decode_announce_response(body, AnnounceEvent::None, NetworkKind::Public).unwrap();
        assert_eq!(decoded.interval_secs, u32::MAX - 10);

        // interval=30: no subtraction.
        let body = b"d8:intervali30e5:peers0:e";
        let decoded =
            decode_announce_response(body, AnnounceEvent::None, NetworkKind::Public).unwrap();
        assert_eq!(decoded.interval_secs, 30);

        // interval=31: exactly 10 subtracted.
        let body = b"d8:intervali31e5:peers0:e";
        let decoded =
            decode_announce_response(body, AnnounceEvent::None, NetworkKind::Public).unwrap();
        assert_eq!(decoded.interval_secs, 21);
    }

    #[test]
    fn test_min_interval_derivation() {
        // No explicit min interval: derived = interval - 10 when > 30.
        let body = b"d8:intervali1800e5:peers0:e";
        let decoded =
            decode_announce_response(body, AnnounceEvent::None, NetworkKind::Public).unwrap();
        assert_eq!(decoded.min_interval_secs, Some(1790));

        // interval <= 30: derived = interval.
        let body = b"d8:intervali20e5:peers0:e";
        let decoded =
            decode_announce_response(body, AnnounceEvent::None, NetworkKind::Public).unwrap();
        assert_eq!(decoded.min_interval_secs, Some(20));

        // Explicit value above interval is discarded.
        let body = b"d8:intervali1800e12:min intervali3600e5:peers0:e";
        let decoded =
            decode_announce_response(body, AnnounceEvent::None, NetworkKind::Public).unwrap();
        assert_eq!(decoded.min_interval_secs, Some(1790));

        // Explicit value below 1 is discarded.
        let body = b"d8:intervali1800e12:min intervali0e5:peers0:e";
        let decoded =
            decode_announce_response(body, AnnounceEvent::None, NetworkKind::Public).unwrap();
        assert_eq!(decoded.min_interval_secs, Some(1790));

        // A sane explicit value is kept.
        let body = b"d8:intervali1800e12:min intervali600e5:peers0:e";
        let decoded =
            decode_announce_response(body, AnnounceEvent::None, NetworkKind::Public).unwrap();
        assert_eq!(decoded.min_interval_secs, Some(600));
    }

    #[test]
    fn test_missing_interval_tolerated_only_for_stopped() {
        let body = b"d5:peers0:e";
        let err = decode_announce_response(body, AnnounceEvent::None, NetworkKind::Public);
        assert!(matches!(err, Err(TrackerError::ProtocolError { .. })));

        let decoded =
            decode_announce_response(body, AnnounceEvent::Stopped, NetworkKind::Public).unwrap();
        assert_eq!(decoded.interval_secs, 60);
    }

    #[test]
    fn test_failure_reason_wins_over_other_keys() {
        let body = b"d14:failure reason12:unregistered8:intervali1800ee";
        let err = decode_announce_response(body, AnnounceEvent::None, NetworkKind::Public);
        assert!(matches!(
            err,
            Err(TrackerError::TrackerReported { reason }) if reason == "unregistered"
        ));
    }

    #[test]
    fn test_announce_response_with_compact_peers() {
        let body =
            b"d8:completei10e10:incompletei5e8:intervali1800e5:peers12:\x7f\x00\x00\x01\x1a\xe1\xc0\xa8\x01\x64\xc3\x50e";
        let decoded =
            decode_announce_response(body, AnnounceEvent::None, NetworkKind::Public).unwrap();
        assert_eq!(decoded.peers.len(), 2);
        assert_eq!(decoded.complete, Some(10));
        assert_eq!(decoded.incomplete, Some(5));
        assert_eq!(decoded.peers[0].ip, "127.0.0.1");
        assert_eq!(decoded.peers[0].tcp_port, 6881);
    }

    #[test]
    fn test_scrape_url_builder() {
        let scrape = Url::parse("http://tracker.example.com/scrape").unwrap();
        let url = build_scrape_url(&scrape, &[InfoHash::new([0xAA; 20]), InfoHash::new([0xBB; 20])]);
        assert_eq!(url.matches("info_hash=").count(), 2);
        assert!(url.contains(&"%AA".repeat(20)));
        assert!(url.contains(&"%BB".repeat(20)));
    }

    #[test]
    fn test_scrape_response_decode() {
        let hash = InfoHash::new([0x11; 20]);
        let mut body = Vec::new();
        body.extend_from_slice(b"d5:filesd20:");
        body.extend_from_slice(hash.as_bytes());
        body.extend_from_slice(b"d8:completei10e10:downloadedi20e10:incompletei5eee5:flagsd20:min_request_intervali1200eee");

        let decoded = decode_scrape_response(&body).unwrap();
        assert_eq!(decoded.entries.len(), 1);
        assert_eq!(decoded.entries[0].hash, hash);
        assert_eq!(decoded.entries[0].seeds, 10);
        assert_eq!(decoded.entries[0].peers, 5);
        assert_eq!(decoded.entries[0].completed, 20);
        assert_eq!(decoded.min_request_interval, Some(1200));
    }

    #[test]
    fn test_scrape_legacy_single_pair() {
        let body = b"d8:completei4e10:incompletei9ee";
        let decoded = decode_scrape_response(body).unwrap();
        assert!(decoded.entries.is_empty());
        assert_eq!(decoded.legacy_counts, Some((4, 9)));
    }
}

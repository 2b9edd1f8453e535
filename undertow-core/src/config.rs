//! Centralized configuration for Undertow.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase. Constants whose
//! original tuning rationale is undocumented (UDP probe cap, probe timeout)
//! are deliberately exposed as defaults rather than baked in.

use std::time::Duration;

/// Minimum delay between announces regardless of what the tracker declares.
pub const REFRESH_MINIMUM_SECS: u32 = 60;

/// Central configuration for all Undertow components.
///
/// Groups related configuration settings into logical sections.
#[derive(Debug, Clone, Default)]
pub struct UndertowConfig {
    pub announce: AnnounceConfig,
    pub scrape: ScrapeConfig,
    pub udp: UdpConfig,
    pub network: NetworkPolicyConfig,
}

/// Announce timing and HTTP transport configuration.
#[derive(Debug, Clone)]
pub struct AnnounceConfig {
    /// HTTP request timeout for tracker communication
    pub tracker_timeout: Duration,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
    /// Hard cap on the HTTP response body; exceeding it fails the attempt
    pub max_response_bytes: usize,
    /// Upper bound on `numwant` sent to trackers
    pub max_numwant: u32,
    /// Rate limit on externally forced refresh overrides
    pub override_period: Duration,
    /// Scheduled events within this window are left to fire on stop/update
    pub cancel_grace: Duration,
    /// Report `left=0` regardless of the real remaining counter
    pub pretend_complete: bool,
    /// Send the random per-torrent `key=` parameter
    pub send_key: bool,
}

impl Default for AnnounceConfig {
    fn default() -> Self {
        Self {
            tracker_timeout: Duration::from_secs(30),
            user_agent: "undertow/0.1.0",
            max_response_bytes: 128 * 1024, // 128 KiB
            max_numwant: 100,
            override_period: Duration::from_secs(10),
            cancel_grace: Duration::from_secs(10),
            pretend_complete: false,
            send_key: true,
        }
    }
}

/// Scrape batching and retry configuration.
#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    /// Pending hashes due within this window join the current batch
    pub group_window: Duration,
    /// Maximum hashes per HTTP scrape request
    pub group_limit: usize,
    /// Retry interval after a scrape error
    pub faulty_retry: Duration,
    /// Retry interval after a definitive hash-not-found response
    pub not_found_retry: Duration,
    /// A blocked tracker is returned early when the best unblocked scrape
    /// is still at least this far away
    pub blocked_pick_margin: Duration,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            group_window: Duration::from_secs(15 * 60),
            group_limit: 20,
            faulty_retry: Duration::from_secs(10 * 60),
            not_found_retry: Duration::from_secs(3 * 60 * 60),
            blocked_pick_margin: Duration::from_secs(2),
        }
    }
}

/// UDP tracker protocol configuration, including the automatic
/// HTTP-to-UDP capability probe heuristic.
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Round-trip timeout for confirmed-UDP endpoints; kept short since a
    /// confirmed host that stops answering should fail over quickly
    pub timeout: Duration,
    /// Longer timeout used while probing an HTTP tracker for UDP support
    pub probe_timeout: Duration,
    /// Full connect+action sequence retries on timeout
    pub request_retries: u32,
    /// Exponential cap on announces between failed probes
    pub probe_cap: u8,
    /// Maximum hashes per UDP scrape packet (IPv4 packet-size bound)
    pub scrape_batch_limit: usize,
    /// UDP probing administratively disabled
    pub probe_enabled: bool,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(10),
            request_retries: 3,
            probe_cap: 16,
            scrape_batch_limit: 70,
            probe_enabled: true,
        }
    }
}

/// Network restrictions resolved by the surrounding application.
#[derive(Debug, Clone)]
pub struct NetworkPolicyConfig {
    /// IPv6 targets are skipped entirely when disabled
    pub ipv6_enabled: bool,
    /// Explicit `ip=` override from configuration
    pub ip_override: Option<String>,
    /// Per-network public address override
    pub public_ip_override: Option<String>,
}

impl Default for NetworkPolicyConfig {
    fn default() -> Self {
        Self {
            ipv6_enabled: true,
            ip_override: None,
            public_ip_override: None,
        }
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = UndertowConfig::default();
        assert_eq!(config.announce.max_response_bytes, 131072);
        assert_eq!(config.scrape.group_limit, 20);
        assert_eq!(config.scrape.group_window, Duration::from_secs(900));
        assert_eq!(config.udp.probe_cap, 16);
        assert_eq!(config.udp.scrape_batch_limit, 70);
        // Probes get the generous timeout; confirmed endpoints stay snappy.
        assert!(config.udp.timeout < config.udp.probe_timeout);
        assert_eq!(REFRESH_MINIMUM_SECS, 60);
    }
}

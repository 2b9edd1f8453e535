//! BitTorrent tracker announce/scrape client core.
//!
//! Talks to trackers over HTTP(S) and UDP to register swarm participation,
//! retrieve peer lists and periodically report transfer statistics. The
//! per-torrent [`Announcer`] drives a retry/backoff state machine across a
//! tiered URL list; [`ScrapeScheduler`] batches scrape requests per tracker
//! host across all torrents.

pub mod announcer;
pub mod backoff;
pub mod peers;
pub mod registry;
pub mod scheduler;
pub mod scrape;
pub mod session;
pub mod simulated;
pub mod sources;
pub mod types;
pub mod urls;
pub mod wire;

use std::fmt;

pub use announcer::{Announcer, AnnouncerState};
pub use backoff::FailureBackoff;
pub use peers::{PeerListEncoding, decode_peer_lists};
pub use registry::{TrackerRegistry, TrackerStatus};
pub use scheduler::{AnnounceScheduler, TimerQueueKind};
pub use scrape::{ScrapeScheduler, ScrapeSession};
pub use session::{AnnounceOutcome, AnnounceSession, AnnounceTransport, AttemptContext, ConnectionOutcome};
pub use simulated::{ScriptedResponse, SimulatedTransport};
pub use sources::{AnnounceDataProvider, PeerCache, TorrentView, TrackerListener};
pub use types::{
    AnnounceEvent, AnnounceRequestParams, AnnounceResponse, CryptoLevel, InfoHash, NetworkKind,
    PeerId, PeerRecord, PeerSource, ResponseStatus, ScrapeEntry, ScrapeState,
};
pub use urls::TrackerUrlList;

/// Tracker communication failures.
///
/// Classified per attempt into a response status at the session boundary;
/// no variant propagates past the per-URL attempt except through the
/// resulting response object.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Tracker unreachable: {url}")]
    NetworkUnreachable { url: String },

    #[error("Host could not be resolved: {host}")]
    UnresolvedHost { host: String },

    #[error("Tracker request timed out: {url}")]
    Timeout { url: String },

    #[error("Protocol error: {message}")]
    ProtocolError { message: String },

    #[error("Tracker reported failure: {reason}")]
    TrackerReported { reason: String },

    #[error("Tracker authentication failed: {url}")]
    AuthenticationFailure { url: String },

    #[error("Network {network} not enabled for url '{url}'")]
    InvalidNetwork { url: String, network: NetworkKind },

    #[error("Tracker response exceeded {limit} bytes")]
    ResponseTooLarge { limit: usize },

    #[error("No usable address for host {host}")]
    NoUsableAddress { host: String },

    #[error("Configuration rejected request: {reason}")]
    ConfigurationRejected { reason: String },

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("URL parsing error")]
    UrlParsing(#[from] url::ParseError),

    #[error("HTTP error")]
    Http(#[from] reqwest::Error),
}

impl TrackerError {
    /// Maps a failure into the announce status it produces.
    pub fn response_status(&self) -> ResponseStatus {
        match self {
            TrackerError::TrackerReported { .. } => ResponseStatus::ReportedError,
            _ => ResponseStatus::Offline,
        }
    }

    /// Soft failures are logged at reduced severity; the retry policy is
    /// unaffected either way.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            TrackerError::AuthenticationFailure { .. }
                | TrackerError::UnresolvedHost { .. }
                | TrackerError::Timeout { .. }
        )
    }
}

/// Severity of a failed attempt, for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSeverity {
    Soft,
    Hard,
}

impl fmt::Display for FailureSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureSeverity::Soft => write!(f, "soft"),
            FailureSeverity::Hard => write!(f, "hard"),
        }
    }
}

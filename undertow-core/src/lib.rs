//! Undertow Core - BitTorrent tracker announce and scrape client
//!
//! This crate implements the tracker side of a BitTorrent client: the
//! per-torrent announce state machine, HTTP and UDP tracker wire codecs,
//! peer-list decoding for every common encoding, grouped scraping, and the
//! timer queues that drive it all.

pub mod config;
pub mod tracing_setup;
pub mod tracker;

// Re-export main types for convenient access
pub use config::UndertowConfig;
pub use tracker::{
    AnnounceResponse, AnnounceScheduler, AnnounceSession, Announcer, ScrapeScheduler,
    ScrapeSession, TrackerError, TrackerRegistry,
};

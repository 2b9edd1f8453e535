//! Wire codecs for the two tracker protocols.
//!
//! HTTP announces are GET requests with a hand-built query string and a
//! bencoded response body; UDP uses binary connect/announce/scrape packets
//! with a connection handshake.

pub mod http;
pub mod udp;

pub use http::{DecodedAnnounce, DecodedScrape, ScrapeFileEntry};
pub use udp::{UdpTrackerClient, PROTOCOL_MAGIC};

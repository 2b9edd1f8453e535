//! UDP tracker protocol: connect/announce/scrape packets with the
//! connection-id handshake.
//!
//! Two announce wire formats are supported. V1 carries raw 4-byte IPv4 peer
//! lists and no swarm totals; v2 adds a key field, IPv6 peer entries and
//! seed/leech counts in the announce reply itself, making a parallel scrape
//! unnecessary. The version is a build-time constant: there is no version
//! field on the wire, only payload shape.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;
use url::Url;

use super::super::types::{AnnounceEvent, AnnounceRequestParams, InfoHash, PeerRecord};
use super::super::TrackerError;
use super::http::ScrapeFileEntry;
use crate::config::UdpConfig;

/// Magic constant opening every connect request.
pub const PROTOCOL_MAGIC: u64 = 0x0417_2710_1980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_SCRAPE: u32 = 2;
const ACTION_ERROR: u32 = 3;

/// Announce payload shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V1,
    V2,
}

/// Version compiled into this client.
pub const WIRE_VERSION: ProtocolVersion = ProtocolVersion::V2;

/// Decoded UDP announce reply.
#[derive(Debug, Clone)]
pub struct UdpAnnounce {
    pub interval_secs: u32,
    /// Present only in v2 replies.
    pub seeders: Option<u32>,
    pub leechers: Option<u32>,
    pub peers: Vec<PeerRecord>,
}

/// One UDP tracker endpoint with its handshake state.
pub struct UdpTrackerClient {
    socket: UdpSocket,
    target: SocketAddr,
    config: UdpConfig,
    timeout: Duration,
}

impl UdpTrackerClient {
    /// Resolves the tracker URL and binds a socket toward it.
    ///
    /// IPv6 addresses are skipped when administratively disabled; if every
    /// resolved address was skipped the attempt fails with `NoUsableAddress`.
    /// Probe mode uses the longer probe timeout so a capability probe is not
    /// written off by a slow first round-trip.
    pub async fn connect(
        url: &Url,
        config: &UdpConfig,
        probe: bool,
        ipv6_enabled: bool,
    ) -> Result<Self, TrackerError> {
        let host = url
            .host_str()
            .ok_or_else(|| TrackerError::ProtocolError {
                message: format!("URL without host: {url}"),
            })?
            .to_string();
        let port = url.port().unwrap_or(6969);

        let addrs: Vec<SocketAddr> = lookup_host((host.as_str(), port))
            .await
            .map_err(|_| TrackerError::UnresolvedHost { host: host.clone() })?
            .collect();

        if addrs.is_empty() {
            return Err(TrackerError::UnresolvedHost { host });
        }

        let target = addrs
            .iter()
            .find(|addr| ipv6_enabled || addr.is_ipv4())
            .copied()
            .ok_or(TrackerError::NoUsableAddress { host })?;

        let bind_addr = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(target).await?;

        let timeout = if probe { config.probe_timeout } else { config.timeout };

        Ok(Self {
            socket,
            target,
            config: config.clone(),
            timeout,
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Performs the connect/announce handshake.
    ///
    /// The full sequence is retried on timeout only; any other failure is
    /// fatal to the attempt.
    pub async fn announce(
        &self,
        params: &AnnounceRequestParams,
    ) -> Result<UdpAnnounce, TrackerError> {
        let mut last_timeout = None;

        for _ in 0..self.config.request_retries {
            let connection_id = match self.request_connection_id().await {
                Ok(id) => id,
                Err(TrackerError::Timeout { url }) => {
                    last_timeout = Some(TrackerError::Timeout { url });
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self.announce_once(connection_id, params).await {
                Ok(reply) => return Ok(reply),
                Err(TrackerError::Timeout { url }) => {
                    last_timeout = Some(TrackerError::Timeout { url });
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_timeout.unwrap_or_else(|| TrackerError::Timeout {
            url: self.target.to_string(),
        }))
    }

    /// Performs the connect/scrape handshake for a batch of hashes.
    ///
    /// The batch is capped for IPv4 packet-size reasons; callers split
    /// larger requests.
    pub async fn scrape(
        &self,
        hashes: &[InfoHash],
    ) -> Result<Vec<ScrapeFileEntry>, TrackerError> {
        let hashes = &hashes[..hashes.len().min(self.config.scrape_batch_limit)];
        let mut last_timeout = None;

        for _ in 0..self.config.request_retries {
            let connection_id = match self.request_connection_id().await {
                Ok(id) => id,
                Err(TrackerError::Timeout { url }) => {
                    last_timeout = Some(TrackerError::Timeout { url });
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self.scrape_once(connection_id, hashes).await {
                Ok(entries) => return Ok(entries),
                Err(TrackerError::Timeout { url }) => {
                    last_timeout = Some(TrackerError::Timeout { url });
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_timeout.unwrap_or_else(|| TrackerError::Timeout {
            url: self.target.to_string(),
        }))
    }

    async fn request_connection_id(&self) -> Result<u64, TrackerError> {
        let transaction_id: u32 = rand::rng().random();

        let mut request = BytesMut::with_capacity(16);
        request.put_u64(PROTOCOL_MAGIC);
        request.put_u32(ACTION_CONNECT);
        request.put_u32(transaction_id);

        let reply = self.round_trip(&request, 16).await?;
        let mut reply = reply.as_slice();

        let action = reply.get_u32();
        let reply_tid = reply.get_u32();
        if action == ACTION_ERROR {
            return Err(TrackerError::TrackerReported {
                reason: String::from_utf8_lossy(reply).to_string(),
            });
        }
        if action != ACTION_CONNECT || reply_tid != transaction_id {
            return Err(TrackerError::ProtocolError {
                message: "connect reply action/transaction mismatch".to_string(),
            });
        }

        Ok(reply.get_u64())
    }

    async fn announce_once(
        &self,
        connection_id: u64,
        params: &AnnounceRequestParams,
    ) -> Result<UdpAnnounce, TrackerError> {
        let transaction_id: u32 = rand::rng().random();

        let mut request = BytesMut::with_capacity(98);
        request.put_u64(connection_id);
        request.put_u32(ACTION_ANNOUNCE);
        request.put_u32(transaction_id);
        request.put_slice(params.info_hash.as_bytes());
        request.put_slice(params.peer_id.as_bytes());
        request.put_u64(params.downloaded);
        request.put_u64(if params.pretend_complete { 0 } else { params.left });
        request.put_u64(params.uploaded);
        request.put_u32(event_id(params.event));
        request.put_u32(0); // IP override unsupported over UDP, default
        if WIRE_VERSION == ProtocolVersion::V2 {
            let key: u32 = rand::rng().random();
            request.put_u32(key);
        }
        request.put_i32(params.numwant as i32);
        request.put_u16(params.tcp_port);

        let min_len = if WIRE_VERSION == ProtocolVersion::V2 { 20 } else { 12 };
        let reply = self.round_trip(&request, min_len).await?;
        let mut reply = reply.as_slice();

        let action = reply.get_u32();
        let reply_tid = reply.get_u32();
        if action == ACTION_ERROR {
            return Err(TrackerError::TrackerReported {
                reason: String::from_utf8_lossy(reply).to_string(),
            });
        }
        if action != ACTION_ANNOUNCE || reply_tid != transaction_id {
            return Err(TrackerError::ProtocolError {
                message: "announce reply action/transaction mismatch".to_string(),
            });
        }

        let interval_secs = reply.get_u32();
        let (seeders, leechers) = if WIRE_VERSION == ProtocolVersion::V2 {
            let leechers = reply.get_u32();
            let seeders = reply.get_u32();
            (Some(seeders), Some(leechers))
        } else {
            (None, None)
        };

        let peers = decode_udp_peers(reply, self.target.is_ipv6());

        Ok(UdpAnnounce {
            interval_secs,
            seeders,
            leechers,
            peers,
        })
    }

    async fn scrape_once(
        &self,
        connection_id: u64,
        hashes: &[InfoHash],
    ) -> Result<Vec<ScrapeFileEntry>, TrackerError> {
        let transaction_id: u32 = rand::rng().random();

        let mut request = BytesMut::with_capacity(16 + hashes.len() * 20);
        request.put_u64(connection_id);
        request.put_u32(ACTION_SCRAPE);
        request.put_u32(transaction_id);
        for hash in hashes {
            request.put_slice(hash.as_bytes());
        }

        let reply = self.round_trip(&request, 8).await?;
        let mut reply = reply.as_slice();

        let action = reply.get_u32();
        let reply_tid = reply.get_u32();
        if action == ACTION_ERROR {
            return Err(TrackerError::TrackerReported {
                reason: String::from_utf8_lossy(reply).to_string(),
            });
        }
        if action != ACTION_SCRAPE || reply_tid != transaction_id {
            return Err(TrackerError::ProtocolError {
                message: "scrape reply action/transaction mismatch".to_string(),
            });
        }

        decode_scrape_reply(reply, hashes)
    }

    async fn round_trip(&self, request: &[u8], min_len: usize) -> Result<Vec<u8>, TrackerError> {
        self.socket.send(request).await?;

        let mut buf = vec![0u8; 4096];
        match timeout(self.timeout, self.socket.recv(&mut buf)).await {
            Ok(Ok(n)) if n >= min_len => Ok(buf[..n].to_vec()),
            Ok(Ok(n)) => Err(TrackerError::ProtocolError {
                message: format!("reply too short: {n} bytes"),
            }),
            Ok(Err(e)) => Err(TrackerError::Io(e)),
            Err(_) => Err(TrackerError::Timeout {
                url: self.target.to_string(),
            }),
        }
    }
}

fn event_id(event: AnnounceEvent) -> u32 {
    match event {
        AnnounceEvent::None => 0,
        AnnounceEvent::Completed => 1,
        AnnounceEvent::Started => 2,
        AnnounceEvent::Stopped => 3,
    }
}

/// Decodes the trailing peer entries of an announce reply. Entry width
/// follows the socket family: 6 bytes over IPv4, 18 over IPv6.
fn decode_udp_peers(data: &[u8], ipv6: bool) -> Vec<PeerRecord> {
    use super::super::peers::decode_peer_lists;
    use super::super::types::NetworkKind;
    use serde_bencode::value::Value;

    let value = Value::Bytes(data.to_vec());
    if ipv6 {
        decode_peer_lists(None, Some(&value), 0, None, NetworkKind::Public)
    } else {
        decode_peer_lists(Some(&value), None, 0, None, NetworkKind::Public)
    }
}

/// Decodes a scrape reply.
///
/// V1 replies carry per-hash records (hash + counts); v2 replies are bare
/// 12-byte triples ordered parallel to the request hash list.
fn decode_scrape_reply(
    mut data: &[u8],
    requested: &[InfoHash],
) -> Result<Vec<ScrapeFileEntry>, TrackerError> {
    let mut entries = Vec::new();

    match WIRE_VERSION {
        ProtocolVersion::V1 => {
            while data.len() >= 32 {
                let hash = InfoHash::from_slice(&data[..20]).ok_or_else(|| {
                    TrackerError::ProtocolError {
                        message: "bad scrape entry hash".to_string(),
                    }
                })?;
                data.advance(20);
                let seeds = data.get_u32();
                let completed = data.get_u32();
                let peers = data.get_u32();
                entries.push(ScrapeFileEntry {
                    hash,
                    seeds,
                    peers,
                    completed,
                });
            }
        }
        ProtocolVersion::V2 => {
            for hash in requested {
                if data.len() < 12 {
                    break;
                }
                let seeds = data.get_u32();
                let completed = data.get_u32();
                let peers = data.get_u32();
                entries.push(ScrapeFileEntry {
                    hash: *hash,
                    seeds,
                    peers,
                    completed,
                });
            }
        }
    }

    Ok(entries)
}

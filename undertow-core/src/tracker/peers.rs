//! Peer-list decoding for the several encodings found in tracker responses.
//!
//! Every variant funnels through [`decode_peer_lists`] and produces the same
//! normalized [`PeerRecord`] sequence, with exhaustive matching over
//! [`PeerListEncoding`] instead of shape-sniffing casts.

use std::net::{Ipv4Addr, Ipv6Addr};

use serde_bencode::value::Value;

use super::types::{CryptoLevel, NetworkKind, PeerRecord};

/// Compact v1 entry size: 4-byte IPv4 + 2-byte port.
const COMPACT_V1_LEN: usize = 6;
/// AZ compact v1 adds a UDP port and a crypto flags byte.
const COMPACT_AZ1_LEN: usize = 9;
/// IPv6 compact entry size: 16-byte address + 2-byte port.
const COMPACT_V6_LEN: usize = 18;
/// I2P responses carry raw 32-byte destination hashes.
const I2P_HASH_LEN: usize = 32;
/// Fixed port synthesized for I2P peers.
const I2P_PORT: u16 = 6881;

/// The peer-list encodings a tracker response can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerListEncoding {
    /// Classic list of per-peer dictionaries.
    Dictionary,
    /// Byte string, 6 bytes per peer.
    CompactV1,
    /// Byte string, 9 bytes per peer with UDP port and crypto flags.
    CompactAz1,
    /// List of short-key dictionaries with RTT/bias ordering.
    CompactAz2,
    /// `peers6` byte string, 18 bytes per peer.
    CompactV6,
    /// 32-byte destination hashes from I2P trackers.
    I2PHash,
}

/// Selects the encoding of the `peers` value.
///
/// `azcompact` is the tracker-supplied hint; the I2P form is recognized by
/// the announce target's network classification.
pub fn select_encoding(peers: &Value, azcompact: u8, network: NetworkKind) -> Option<PeerListEncoding> {
    match peers {
        Value::Bytes(bytes) => {
            if network == NetworkKind::I2p && bytes.len() % I2P_HASH_LEN == 0 {
                Some(PeerListEncoding::I2PHash)
            } else if azcompact == 1 && bytes.len() % COMPACT_AZ1_LEN == 0 {
                Some(PeerListEncoding::CompactAz1)
            } else if bytes.len() % COMPACT_V1_LEN == 0 {
                Some(PeerListEncoding::CompactV1)
            } else {
                None
            }
        }
        Value::List(_) => {
            if azcompact == 2 {
                Some(PeerListEncoding::CompactAz2)
            } else {
                Some(PeerListEncoding::Dictionary)
            }
        }
        // Some trackers return an empty dictionary to mean "no peers".
        Value::Dict(map) if map.is_empty() => None,
        _ => None,
    }
}

/// Decodes the `peers` (and optional `peers6`) values into peer records.
///
/// The `crypto_flags` array runs parallel to compact peer entries; a length
/// mismatch discards it entirely rather than mis-attributing flags.
pub fn decode_peer_lists(
    peers: Option<&Value>,
    peers6: Option<&Value>,
    azcompact: u8,
    crypto_flags: Option<&[u8]>,
    network: NetworkKind,
) -> Vec<PeerRecord> {
    let mut records = Vec::new();

    if let Some(peers) = peers {
        match select_encoding(peers, azcompact, network) {
            Some(PeerListEncoding::Dictionary) => {
                if let Value::List(entries) = peers {
                    records.extend(decode_dictionary_peers(entries));
                }
            }
            Some(PeerListEncoding::CompactV1) => {
                if let Value::Bytes(bytes) = peers {
                    records.extend(decode_compact_v1(bytes, validated_flags(crypto_flags, bytes.len() / COMPACT_V1_LEN)));
                }
            }
            Some(PeerListEncoding::CompactAz1) => {
                if let Value::Bytes(bytes) = peers {
                    records.extend(decode_compact_az1(bytes));
                }
            }
            Some(PeerListEncoding::CompactAz2) => {
                if let Value::List(entries) = peers {
                    records.extend(decode_compact_az2(entries));
                }
            }
            Some(PeerListEncoding::I2PHash) => {
                if let Value::Bytes(bytes) = peers {
                    records.extend(decode_i2p_hashes(bytes));
                }
            }
            Some(PeerListEncoding::CompactV6) | None => {}
        }
    }

    // peers6 decodes independently and appends to whatever was present.
    if let Some(Value::Bytes(bytes)) = peers6 {
        records.extend(decode_compact_v6(bytes));
    }

    records
}

/// Returns the flags array only when its length matches the peer count.
fn validated_flags<'a>(flags: Option<&'a [u8]>, peer_count: usize) -> Option<&'a [u8]> {
    let flags = flags?;
    if flags.len() == peer_count {
        Some(flags)
    } else {
        tracing::warn!(
            "Discarding crypto_flags: {} flags for {} peers",
            flags.len(),
            peer_count
        );
        None
    }
}

fn decode_dictionary_peers(entries: &[Value]) -> Vec<PeerRecord> {
    let mut records = Vec::with_capacity(entries.len());

    for entry in entries {
        let Value::Dict(dict) = entry else {
            tracing::debug!("Skipping non-dictionary peer entry");
            continue;
        };

        let Some(Value::Bytes(ip_bytes)) = dict.get(b"ip".as_slice()) else {
            tracing::debug!("Skipping peer entry without ip");
            continue;
        };
        let ip = String::from_utf8_lossy(ip_bytes).to_string();

        let Some(Value::Int(raw_port)) = dict.get(b"port".as_slice()) else {
            tracing::debug!("Skipping peer entry without port");
            continue;
        };

        let Some(port) = repair_port(*raw_port) else {
            tracing::warn!("Skipping peer {ip} with invalid port {raw_port}");
            continue;
        };

        let mut record = PeerRecord::from_address(ip, port);
        if let Some(Value::Bytes(id)) = dict.get(b"peer id".as_slice()) {
            if let Ok(id) = <[u8; 20]>::try_from(id.as_slice()) {
                record.peer_id = super::types::PeerId::new(id);
            }
        }
        records.push(record);
    }

    records
}

/// Repairs the documented off-by-65536 port encodings before validating.
fn repair_port(raw: i64) -> Option<u16> {
    let repaired = if raw < 0 {
        raw + 65536
    } else if raw > 65535 {
        raw - 65536
    } else {
        raw
    };
    u16::try_from(repaired).ok()
}

fn decode_compact_v1(bytes: &[u8], crypto_flags: Option<&[u8]>) -> Vec<PeerRecord> {
    bytes
        .chunks_exact(COMPACT_V1_LEN)
        .enumerate()
        .map(|(i, chunk)| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            let mut record = PeerRecord::from_address(ip.to_string(), port);
            if let Some(flags) = crypto_flags {
                if flags[i] & 0x01 != 0 {
                    record.crypto = CryptoLevel::Required;
                }
            }
            record
        })
        .collect()
}

fn decode_compact_az1(bytes: &[u8]) -> Vec<PeerRecord> {
    bytes
        .chunks_exact(COMPACT_AZ1_LEN)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let tcp_port = u16::from_be_bytes([chunk[4], chunk[5]]);
            let udp_port = u16::from_be_bytes([chunk[6], chunk[7]]);
            let mut record = PeerRecord::from_address(ip.to_string(), tcp_port);
            record.udp_port = (udp_port != 0).then_some(udp_port);
            if chunk[8] & 0x01 != 0 {
                record.crypto = CryptoLevel::Required;
            }
            record
        })
        .collect()
}

fn decode_compact_v6(bytes: &[u8]) -> Vec<PeerRecord> {
    bytes
        .chunks_exact(COMPACT_V6_LEN)
        .map(|chunk| {
            let mut addr = [0u8; 16];
            addr.copy_from_slice(&chunk[..16]);
            let ip = Ipv6Addr::from(addr);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            PeerRecord::from_address(ip.to_string(), port)
        })
        .collect()
}

fn decode_i2p_hashes(bytes: &[u8]) -> Vec<PeerRecord> {
    bytes
        .chunks_exact(I2P_HASH_LEN)
        .map(|hash| {
            let host = format!("{}.b32.i2p", base32_encode(hash));
            PeerRecord::from_address(host, I2P_PORT)
        })
        .collect()
}

/// RFC 4648 base32, lowercase, unpadded, as used for `.b32.i2p` hostnames
/// and the AZ network-position announce field.
pub(crate) fn base32_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";
    let mut out = String::with_capacity(data.len().div_ceil(5) * 8);
    for chunk in data.chunks(5) {
        let mut buf = [0u8; 5];
        buf[..chunk.len()].copy_from_slice(chunk);
        let bits = u64::from(buf[0]) << 32
            | u64::from(buf[1]) << 24
            | u64::from(buf[2]) << 16
            | u64::from(buf[3]) << 8
            | u64::from(buf[4]);
        let chars = (chunk.len() * 8).div_ceil(5);
        for i in 0..chars {
            let index = ((bits >> (35 - i * 5)) & 0x1f) as usize;
            out.push(ALPHABET[index] as char);
        }
    }
    out
}

/// One decoded AZ-v2 entry plus its ordering metadata.
struct Az2Peer {
    record: PeerRecord,
    rtt: Option<u32>,
    biased: bool,
}

fn decode_compact_az2(entries: &[Value]) -> Vec<PeerRecord> {
    let mut decoded = Vec::with_capacity(entries.len());

    for entry in entries {
        let Value::Dict(dict) = entry else {
            continue;
        };

        let Some(Value::Bytes(ip_bytes)) = dict.get(b"i".as_slice()) else {
            continue;
        };
        let ip = match ip_bytes.len() {
            4 => Ipv4Addr::new(ip_bytes[0], ip_bytes[1], ip_bytes[2], ip_bytes[3]).to_string(),
            16 => {
                let mut addr = [0u8; 16];
                addr.copy_from_slice(ip_bytes);
                Ipv6Addr::from(addr).to_string()
            }
            _ => {
                tracing::debug!("Skipping AZ peer with {}-byte address", ip_bytes.len());
                continue;
            }
        };

        let Some(tcp_port) = get_port(dict, b"t") else {
            continue;
        };

        let mut record = PeerRecord::from_address(ip, tcp_port);
        record.udp_port = get_port(dict, b"u");
        record.http_port = get_port(dict, b"h");
        if matches!(dict.get(b"c".as_slice()), Some(Value::Int(c)) if *c & 0x01 != 0) {
            record.crypto = CryptoLevel::Required;
        }
        if let Some(Value::Int(v)) = dict.get(b"v".as_slice()) {
            record.az_version = *v as u8;
        }
        if let Some(Value::Int(s)) = dict.get(b"s".as_slice()) {
            record.upload_speed = u32::try_from(*s).ok();
        }

        let rtt = match dict.get(b"r".as_slice()) {
            Some(Value::Int(r)) => u32::try_from(*r).ok(),
            _ => None,
        };
        let biased = dict.contains_key(b"b".as_slice());

        decoded.push(Az2Peer { record, rtt, biased });
    }

    order_az2_peers(decoded)
}

fn get_port(dict: &std::collections::HashMap<Vec<u8>, Value>, key: &[u8]) -> Option<u16> {
    match dict.get(key) {
        Some(Value::Int(port)) => repair_port(*port).filter(|p| *p != 0),
        _ => None,
    }
}

/// Orders AZ-v2 peers by ascending RTT with biased-peer interleaving.
///
/// Missing RTTs default to the batch average. The merge always prefers a
/// biased peer unless the previous pick was also biased and the non-biased
/// candidate has a strictly lower RTT.
fn order_az2_peers(peers: Vec<Az2Peer>) -> Vec<PeerRecord> {
    let known: Vec<u32> = peers.iter().filter_map(|p| p.rtt).collect();
    let average = if known.is_empty() {
        0
    } else {
        known.iter().map(|r| u64::from(*r)).sum::<u64>() / known.len() as u64
    } as u32;

    let effective = |p: &Az2Peer| p.rtt.unwrap_or(average);

    let (mut biased, mut plain): (Vec<Az2Peer>, Vec<Az2Peer>) =
        peers.into_iter().partition(|p| p.biased);
    biased.sort_by_key(|p| effective(p));
    plain.sort_by_key(|p| effective(p));

    let mut out = Vec::with_capacity(biased.len() + plain.len());
    let mut biased = biased.into_iter().peekable();
    let mut plain = plain.into_iter().peekable();
    let mut previous_was_biased = false;

    loop {
        match (biased.peek(), plain.peek()) {
            (Some(b), Some(p)) => {
                let take_plain = previous_was_biased && effective(p) < effective(b);
                if take_plain {
                    if let Some(p) = plain.next() {
                        out.push(p.record);
                    }
                    previous_was_biased = false;
                } else {
                    if let Some(b) = biased.next() {
                        out.push(b.record);
                    }
                    previous_was_biased = true;
                }
            }
            (Some(_), None) => {
                out.extend(biased.by_ref().map(|p| p.record));
            }
            (None, Some(_)) => {
                out.extend(plain.by_ref().map(|p| p.record));
            }
            (None, None) => break,
        }
    }

    out
}

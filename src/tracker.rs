//! The UDP tracker client (BEP 15).
//!
//! A connection id is obtained once and reused for an `announce` as long as
//! it hasn't expired; BEP 15 mandates it stays valid for 60 seconds from
//! the moment it was issued.

use std::convert::TryInto;
use std::net::SocketAddr;
use std::time::Instant;

use rand::RngCore;
use tokio::net::UdpSocket;

use crate::conf::TRACKER_CONNECTION_ID_TTL;
use crate::error::{Error, Result};
use crate::{PeerId, Sha1Hash};

const PROTOCOL_MAGIC: u64 = 0x417_2710_1980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;

/// The announce event, sent with every announce request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    None = 0,
    Completed = 1,
    Started = 2,
    Stopped = 3,
}

/// Parameters for a single announce call.
#[derive(Clone, Copy, Debug)]
pub(crate) struct AnnounceRequest {
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
    pub port: u16,
    pub event: Event,
    /// The number of peers we'd like the tracker to return, or `-1` to let
    /// the tracker pick its own default.
    pub num_want: i32,
}

/// A tracker's response to an announce.
#[derive(Clone, Debug)]
pub(crate) struct AnnounceResponse {
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
    pub peers: Vec<SocketAddr>,
}

/// A UDP tracker client for a single torrent.
pub(crate) struct Tracker {
    socket: UdpSocket,
    peer_id: PeerId,
    info_hash: Sha1Hash,
    connection: Option<(u64, Instant)>,
}

impl Tracker {
    /// Connects the underlying UDP socket to `addr` (UDP "connect" merely
    /// fixes the default peer for `send`/`recv`, no handshake is sent yet).
    pub async fn connect(
        addr: SocketAddr,
        peer_id: PeerId,
        info_hash: Sha1Hash,
    ) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;
        Ok(Self {
            socket,
            peer_id,
            info_hash,
            connection: None,
        })
    }

    /// Returns a valid connection id, establishing a new tracker connection
    /// if none exists yet or the existing one has expired.
    async fn connection_id(&mut self) -> Result<u64> {
        if let Some((id, obtained_at)) = self.connection {
            if obtained_at.elapsed() < TRACKER_CONNECTION_ID_TTL {
                return Ok(id);
            }
        }

        let transaction_id = rand::thread_rng().next_u32();
        let mut request = [0u8; 16];
        request[0..8].copy_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
        request[8..12].copy_from_slice(&ACTION_CONNECT.to_be_bytes());
        request[12..16].copy_from_slice(&transaction_id.to_be_bytes());

        self.socket.send(&request).await?;

        let mut response = [0u8; 16];
        let n = self.socket.recv(&mut response).await?;
        if n != 16 {
            return Err(Error::Protocol(format!(
                "connect response has unexpected length {}",
                n
            )));
        }

        let action = u32::from_be_bytes(response[0..4].try_into().unwrap());
        let resp_transaction_id = u32::from_be_bytes(response[4..8].try_into().unwrap());
        if resp_transaction_id != transaction_id {
            return Err(Error::Protocol(
                "connect response transaction id mismatch".into(),
            ));
        }
        if action != ACTION_CONNECT {
            return Err(Error::Protocol(format!(
                "connect response has unexpected action {}",
                action
            )));
        }

        let connection_id = u64::from_be_bytes(response[8..16].try_into().unwrap());
        self.connection = Some((connection_id, Instant::now()));
        Ok(connection_id)
    }

    /// Sends an announce request and returns the tracker's response.
    pub async fn announce(&mut self, request: AnnounceRequest) -> Result<AnnounceResponse> {
        let connection_id = self.connection_id().await?;
        let transaction_id = rand::thread_rng().next_u32();

        let mut data = [0u8; 98];
        data[0..8].copy_from_slice(&connection_id.to_be_bytes());
        data[8..12].copy_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        data[12..16].copy_from_slice(&transaction_id.to_be_bytes());
        data[16..36].copy_from_slice(&self.info_hash);
        data[36..56].copy_from_slice(&self.peer_id);
        data[56..64].copy_from_slice(&request.downloaded.to_be_bytes());
        data[64..72].copy_from_slice(&request.left.to_be_bytes());
        data[72..80].copy_from_slice(&request.uploaded.to_be_bytes());
        data[80..84].copy_from_slice(&(request.event as u32).to_be_bytes());
        // IP address (default), key (default)
        data[84..88].copy_from_slice(&0u32.to_be_bytes());
        data[88..92].copy_from_slice(&0u32.to_be_bytes());
        data[92..96].copy_from_slice(&request.num_want.to_be_bytes());
        data[96..98].copy_from_slice(&request.port.to_be_bytes());

        self.socket.send(&data).await?;

        let mut buf = vec![0u8; 2048];
        let n = self.socket.recv(&mut buf).await?;
        parse_announce_response(&buf[..n], transaction_id)
    }
}

fn parse_announce_response(data: &[u8], expected_transaction_id: u32) -> Result<AnnounceResponse> {
    if data.len() < 20 {
        return Err(Error::Protocol(format!(
            "announce response shorter than 20 bytes: {}",
            data.len()
        )));
    }

    let action = u32::from_be_bytes(data[0..4].try_into().unwrap());
    let transaction_id = u32::from_be_bytes(data[4..8].try_into().unwrap());
    if transaction_id != expected_transaction_id {
        return Err(Error::Protocol(
            "announce response transaction id mismatch".into(),
        ));
    }
    if action != ACTION_ANNOUNCE {
        return Err(Error::Protocol(format!(
            "announce response has unexpected action {}",
            action
        )));
    }

    let interval = u32::from_be_bytes(data[8..12].try_into().unwrap());
    let leechers = u32::from_be_bytes(data[12..16].try_into().unwrap());
    let seeders = u32::from_be_bytes(data[16..20].try_into().unwrap());

    let peer_count = (data.len() - 20) / 6;
    let mut peers = Vec::with_capacity(peer_count);
    for i in 0..peer_count {
        let entry = &data[20 + 6 * i..20 + 6 * (i + 1)];
        let ip = std::net::Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
        let port = u16::from_be_bytes([entry[4], entry[5]]);
        peers.push(SocketAddr::new(ip.into(), port));
    }

    Ok(AnnounceResponse {
        interval,
        leechers,
        seeders,
        peers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_announce_response() {
        let mut data = vec![0u8; 20 + 6 * 2];
        data[0..4].copy_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        data[4..8].copy_from_slice(&7u32.to_be_bytes());
        data[8..12].copy_from_slice(&1800u32.to_be_bytes());
        data[12..16].copy_from_slice(&3u32.to_be_bytes());
        data[16..20].copy_from_slice(&5u32.to_be_bytes());
        data[20..24].copy_from_slice(&[127, 0, 0, 1]);
        data[24..26].copy_from_slice(&6881u16.to_be_bytes());
        data[26..30].copy_from_slice(&[10, 0, 0, 1]);
        data[30..32].copy_from_slice(&51413u16.to_be_bytes());

        let response = parse_announce_response(&data, 7).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.leechers, 3);
        assert_eq!(response.seeders, 5);
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[0].port(), 6881);
        assert_eq!(response.peers[1].port(), 51413);
    }

    #[test]
    fn test_parse_announce_response_transaction_mismatch() {
        let mut data = vec![0u8; 20];
        data[0..4].copy_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        data[4..8].copy_from_slice(&7u32.to_be_bytes());
        assert!(parse_announce_response(&data, 8).is_err());
    }

    #[test]
    fn test_parse_announce_response_too_short() {
        assert!(parse_announce_response(&[0u8; 10], 0).is_err());
    }
}

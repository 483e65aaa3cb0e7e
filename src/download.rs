//! The download orchestrator.
//!
//! Wires together the pieces that make up a running torrent: the UDP
//! tracker client, the inbound TCP listener and the swarm manager. This is
//! the torrent-level event loop; it drives the periodic announce, dials
//! newly discovered peers, accepts inbound ones, and registers both with
//! the manager.

use std::collections::HashSet;
use std::net::{SocketAddr, ToSocketAddrs};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant as TokioInstant;

use crate::conf::TorrentConf;
use crate::error::{Error, Result};
use crate::listener::Listener;
use crate::manager::{Manager, ManagerCommand};
use crate::metainfo::Metainfo;
use crate::peer::{self, PeerEvent};
use crate::state::State;
use crate::storage_info::StorageInfo;
use crate::tracker::{AnnounceRequest, AnnounceResponse, Event as TrackerEvent, Tracker};
use crate::{PeerId, Sha1Hash};

/// How many peers we ask the tracker for on the initial announce.
const INITIAL_NUM_WANT: i32 = 100;
/// How many peers we ask the tracker for on periodic re-announces.
const PERIODIC_NUM_WANT: i32 = 50;
/// We don't need more peers once we're shutting down or already complete.
const FINAL_NUM_WANT: i32 = 0;

/// Orchestrates a single torrent download/seed from tracker announce to
/// completion.
pub(crate) struct Download {
    metainfo: Metainfo,
    info_hash: Sha1Hash,
    client_id: PeerId,
    listen_port_range: RangeInclusive<u16>,
    conf: TorrentConf,
    state: Arc<State>,
}

impl Download {
    pub fn new(
        metainfo: Metainfo,
        listen_port_range: RangeInclusive<u16>,
        conf: TorrentConf,
    ) -> Result<Self> {
        let info_hash = metainfo.create_info_hash()?;
        let piece_count = metainfo.piece_count();
        let storage_info = StorageInfo::new(&metainfo, conf.download_dir.clone());

        Ok(Self {
            metainfo,
            info_hash,
            client_id: random_peer_id(),
            listen_port_range,
            conf,
            state: Arc::new(State::new(piece_count, storage_info.download_len)),
        })
    }

    /// The shared progress/counter state, readable independently of the
    /// manager's own event loop.
    pub fn state(&self) -> Arc<State> {
        self.state.clone()
    }

    /// Runs the torrent to completion or until externally stopped via
    /// [`State::stop`].
    pub async fn run(self) -> Result<()> {
        let mut listener = Listener::bind(self.listen_port_range.clone()).await?;
        let listen_port = listener.port();
        log::info!("Listening for peers on port {}", listen_port);

        let tracker_addr = resolve_tracker_addr(&self.metainfo.announce)?;
        let mut tracker =
            Tracker::connect(tracker_addr, self.client_id, self.info_hash).await?;

        let (mut manager, events_tx, cmds_tx, mut manager_done) = Manager::new(
            &self.metainfo,
            self.conf.download_dir.clone(),
            self.client_id,
            self.state.clone(),
        )?;
        tokio::spawn(async move {
            if let Err(e) = manager.run().await {
                log::error!("Manager exited with error: {}", e);
            }
        });

        let mut seen_peers: HashSet<SocketAddr> = HashSet::new();

        let response = announce(
            &mut tracker,
            &self.state,
            listen_port,
            TrackerEvent::Started,
            INITIAL_NUM_WANT,
        )
        .await?;
        let mut announce_deadline = next_announce_deadline(&response, &self.conf);
        dial_new_peers(
            &response,
            &mut seen_peers,
            self.info_hash,
            self.client_id,
            &events_tx,
            &cmds_tx,
        );

        loop {
            if self.state.is_stopped() {
                let _ = announce(
                    &mut tracker,
                    &self.state,
                    listen_port,
                    TrackerEvent::Stopped,
                    FINAL_NUM_WANT,
                )
                .await;
                return Ok(());
            }

            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, addr)) => {
                            spawn_inbound_peer(
                                socket,
                                addr,
                                self.info_hash,
                                self.client_id,
                                events_tx.clone(),
                                cmds_tx.clone(),
                            );
                        }
                        Err(e) => log::warn!("Failed to accept inbound connection: {}", e),
                    }
                }
                _ = tokio::time::sleep_until(announce_deadline) => {
                    match announce(
                        &mut tracker,
                        &self.state,
                        listen_port,
                        TrackerEvent::None,
                        PERIODIC_NUM_WANT,
                    ).await {
                        Ok(response) => {
                            announce_deadline = next_announce_deadline(&response, &self.conf);
                            dial_new_peers(
                                &response,
                                &mut seen_peers,
                                self.info_hash,
                                self.client_id,
                                &events_tx,
                                &cmds_tx,
                            );
                        }
                        Err(e) => log::warn!("Announce failed: {}", e),
                    }
                }
                _ = &mut manager_done => {
                    log::info!("Torrent finished downloading");
                    let _ = announce(
                        &mut tracker,
                        &self.state,
                        listen_port,
                        TrackerEvent::Completed,
                        FINAL_NUM_WANT,
                    )
                    .await;
                    return Ok(());
                }
            }
        }
    }
}

fn random_peer_id() -> PeerId {
    let mut id = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

fn next_announce_deadline(response: &AnnounceResponse, conf: &TorrentConf) -> TokioInstant {
    let interval = Duration::from_secs(response.interval as u64).max(conf.announce_interval);
    TokioInstant::now() + interval
}

async fn announce(
    tracker: &mut Tracker,
    state: &State,
    listen_port: u16,
    event: TrackerEvent,
    num_want: i32,
) -> Result<AnnounceResponse> {
    tracker
        .announce(AnnounceRequest {
            downloaded: state.downloaded(),
            uploaded: state.uploaded(),
            left: state.left(),
            port: listen_port,
            event,
            num_want,
        })
        .await
}

/// Dials every peer in `response` we haven't already seen this session,
/// spawning each handshake independently so a slow or unreachable peer
/// doesn't delay the rest.
fn dial_new_peers(
    response: &AnnounceResponse,
    seen_peers: &mut HashSet<SocketAddr>,
    info_hash: Sha1Hash,
    client_id: PeerId,
    events: &mpsc::Sender<PeerEvent>,
    cmds: &mpsc::Sender<ManagerCommand>,
) {
    for &addr in &response.peers {
        if !seen_peers.insert(addr) {
            continue;
        }
        spawn_outbound_peer(addr, info_hash, client_id, events.clone(), cmds.clone());
    }
}

fn spawn_outbound_peer(
    addr: SocketAddr,
    info_hash: Sha1Hash,
    client_id: PeerId,
    events: mpsc::Sender<PeerEvent>,
    cmds: mpsc::Sender<ManagerCommand>,
) {
    tokio::spawn(async move {
        match peer::spawn_outbound(addr, info_hash, client_id, events).await {
            Ok((peer_id, cmd, _handle)) => {
                let _ = cmds
                    .send(ManagerCommand::AddPeer { addr, peer_id, cmd })
                    .await;
            }
            Err(e) => log::debug!("Failed to connect to peer {}: {}", addr, e),
        }
    });
}

fn spawn_inbound_peer(
    socket: TcpStream,
    addr: SocketAddr,
    info_hash: Sha1Hash,
    client_id: PeerId,
    events: mpsc::Sender<PeerEvent>,
    cmds: mpsc::Sender<ManagerCommand>,
) {
    tokio::spawn(async move {
        match peer::spawn_inbound(socket, addr, info_hash, client_id, events).await {
            Ok((peer_id, cmd, _handle)) => {
                let _ = cmds
                    .send(ManagerCommand::AddPeer { addr, peer_id, cmd })
                    .await;
            }
            Err(e) => log::debug!("Inbound handshake with {} failed: {}", addr, e),
        }
    });
}

/// Resolves a torrent's `udp://host:port/announce` URL to a socket address.
fn resolve_tracker_addr(announce: &str) -> Result<SocketAddr> {
    let url = url::Url::parse(announce)
        .map_err(|e| Error::Config(format!("invalid announce url: {}", e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::Config("announce url has no host".into()))?;
    let port = url.port().unwrap_or(6969);

    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::Config(format!("could not resolve tracker host {}", host)))
}

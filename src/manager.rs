//! The swarm manager: the single task that owns all piece-scheduling
//! state for a torrent.
//!
//! Every peer session is a dumb pipe (see [`crate::peer`]); this is where
//! all the actual BitTorrent logic lives; which pieces we want, who we ask
//! for them, when we're interested, when to choke. Centralizing it here
//! means there is exactly one writer for the in-flight block bitfield, the
//! piece progress counters and the last-requested-block map, so none of it
//! needs to be behind a lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use sha1::{Digest, Sha1};
use tokio::sync::{mpsc, oneshot};
use tokio::task;

use crate::conf::MANAGER_INBOUND_CHANNEL_CAPACITY;
use crate::error::Result;
use crate::metainfo::Metainfo;
use crate::peer::codec::Message;
use crate::peer::{Command as PeerCommand, CommandSender, PeerEvent};
use crate::state::State;
use crate::storage::Storage;
use crate::storage_info::StorageInfo;
use crate::{block_count, block_len, Bitfield, PeerId, PieceIndex, Sha1Hash, BLOCK_LEN};

struct PeerHandle {
    peer_id: PeerId,
    cmd: CommandSender,
    bitfield: Bitfield,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
}

impl PeerHandle {
    fn new(peer_id: PeerId, cmd: CommandSender, piece_count: usize) -> Self {
        Self {
            peer_id,
            cmd,
            bitfield: Bitfield::new(piece_count),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// Commands sent into the manager from outside its own event loop (the
/// download orchestrator, new inbound/outbound connections).
pub(crate) enum ManagerCommand {
    /// Registers a newly handshaken peer session.
    AddPeer {
        addr: SocketAddr,
        peer_id: PeerId,
        cmd: CommandSender,
    },
    Shutdown,
}

/// The swarm manager for a single torrent.
pub(crate) struct Manager {
    storage: Storage,
    state: Arc<State>,
    piece_hashes: Vec<Sha1Hash>,

    /// Our own peer id, so we can reject a connection claiming to be us.
    client_id: PeerId,
    /// Signalled once when the torrent finishes downloading.
    done: Option<oneshot::Sender<()>>,

    peers: HashMap<SocketAddr, PeerHandle>,

    /// One bit per block in the torrent: set while a request for that
    /// block is outstanding.
    downloading_blocks: Bitfield,
    /// One bit per block in the torrent: set once the block has been
    /// written to storage (regardless of whether its piece later passed
    /// hash verification).
    downloaded_blocks: Bitfield,
    /// Remaining block count per piece before it's eligible for hashing.
    piece_progress: Vec<u32>,
    /// The last global block index requested from each peer, used to
    /// clear `downloading_blocks` if that peer disconnects before
    /// delivering it.
    last_requested_block: HashMap<SocketAddr, usize>,

    blocks_per_piece: usize,
    blocks_per_last_piece: usize,
    block_count: usize,
    piece_count: usize,
    piece_len: u32,
    last_piece_len: u32,

    /// The number of peers we are currently interested in. Only used for
    /// diagnostics; never allowed to underflow.
    interesting_peer_count: u64,

    events: mpsc::Receiver<PeerEvent>,
    cmds: mpsc::Receiver<ManagerCommand>,
}

impl Manager {
    pub fn new(
        metainfo: &Metainfo,
        download_dir: PathBuf,
        client_id: PeerId,
        state: Arc<State>,
    ) -> Result<(
        Self,
        mpsc::Sender<PeerEvent>,
        mpsc::Sender<ManagerCommand>,
        oneshot::Receiver<()>,
    )> {
        let storage_info = StorageInfo::new(metainfo, download_dir);
        let storage = Storage::new(storage_info.clone())?;

        let piece_count = storage_info.piece_count;
        let piece_len = storage_info.piece_len;
        let last_piece_len = storage_info.last_piece_len;

        let blocks_per_piece = block_count(piece_len);
        let blocks_per_last_piece = block_count(last_piece_len);
        let block_count_total =
            (piece_count - 1) * blocks_per_piece + blocks_per_last_piece;

        let mut piece_progress = vec![blocks_per_piece as u32; piece_count];
        if let Some(last) = piece_progress.last_mut() {
            *last = blocks_per_last_piece as u32;
        }

        let piece_hashes = (0..piece_count).map(|i| metainfo.piece_hash(i)).collect();

        let (events_tx, events_rx) = mpsc::channel(MANAGER_INBOUND_CHANNEL_CAPACITY);
        let (cmds_tx, cmds_rx) = mpsc::channel(MANAGER_INBOUND_CHANNEL_CAPACITY);
        let (done_tx, done_rx) = oneshot::channel();

        Ok((
            Self {
                storage,
                state,
                piece_hashes,
                client_id,
                done: Some(done_tx),
                peers: HashMap::new(),
                downloading_blocks: Bitfield::new(block_count_total),
                downloaded_blocks: Bitfield::new(block_count_total),
                piece_progress,
                last_requested_block: HashMap::new(),
                blocks_per_piece,
                blocks_per_last_piece,
                block_count: block_count_total,
                piece_count,
                piece_len,
                last_piece_len,
                interesting_peer_count: 0,
                events: events_rx,
                cmds: cmds_rx,
            },
            events_tx,
            cmds_tx,
            done_rx,
        ))
    }

    /// Runs the manager's event loop until told to shut down.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                Some(cmd) = self.cmds.recv() => {
                    match cmd {
                        ManagerCommand::AddPeer { addr, peer_id, cmd } => {
                            self.add_peer(addr, peer_id, cmd).await;
                        }
                        ManagerCommand::Shutdown => {
                            log::info!("Shutting down manager");
                            return Ok(());
                        }
                    }
                }
                Some(event) = self.events.recv() => {
                    self.handle_event(event).await?;
                }
                else => return Ok(()),
            }
        }
    }

    async fn add_peer(&mut self, addr: SocketAddr, peer_id: PeerId, cmd: CommandSender) {
        if peer_id == self.client_id {
            log::warn!("Rejecting peer {} claiming our own peer id", addr);
            let _ = cmd.send(PeerCommand::Shutdown).await;
            return;
        }
        if self.peers.values().any(|peer| peer.peer_id == peer_id) {
            log::warn!("Rejecting peer {} with duplicate peer id", addr);
            let _ = cmd.send(PeerCommand::Shutdown).await;
            return;
        }

        log::info!("Manager registering peer {}", addr);
        let mut handle = PeerHandle::new(peer_id, cmd, self.piece_count);
        if self.state.downloaded() > 0 {
            let bitfield = self.state.own_pieces();
            let _ = handle
                .cmd
                .send(PeerCommand::Send(Message::Bitfield(
                    bitfield.as_bytes().to_vec(),
                )))
                .await;
        }
        self.peers.insert(addr, handle);
    }

    async fn handle_event(&mut self, event: PeerEvent) -> Result<()> {
        match event {
            PeerEvent::Connected { .. } => {
                // peer registration (including duplicate-peer-id rejection)
                // happens via `ManagerCommand::AddPeer`, sent by whoever
                // established the connection, once the command sender is
                // available
            }
            PeerEvent::Message { addr, message } => {
                self.handle_message(addr, message).await?;
            }
            PeerEvent::Disconnected { addr, reason } => {
                log::info!("Peer {} disconnected: {}", addr, reason);
                self.handle_disconnect(&addr).await;
            }
        }
        Ok(())
    }

    async fn handle_message(&mut self, addr: SocketAddr, message: Message) -> Result<()> {
        if !self.peers.contains_key(&addr) {
            log::warn!("Message from unregistered peer {}, ignoring", addr);
            return Ok(());
        }

        match message {
            Message::KeepAlive => {}
            Message::Bitfield(bytes) => self.handle_bitfield(addr, bytes).await?,
            Message::Have { piece_index } => self.handle_have(addr, piece_index).await?,
            Message::Choke => self.handle_choke(addr).await?,
            Message::Unchoke => self.handle_unchoke(addr).await?,
            Message::Interested => self.handle_interested(addr).await?,
            Message::NotInterested => self.handle_not_interested(addr).await?,
            Message::Request(block) => {
                self.handle_request(addr, block.piece_index, block.offset, block.len)
                    .await?
            }
            Message::Piece { piece_index, offset, data } => {
                self.handle_piece(addr, piece_index, offset, data).await?
            }
            Message::Cancel(_) => {
                // we never queue outbound requests beyond the single
                // outstanding one, so there's nothing to cancel
            }
        }

        Ok(())
    }

    fn interesting_piece_count(&self, peer_bitfield: &Bitfield) -> Result<usize> {
        let owned = self.state.own_pieces();
        Ok(peer_bitfield.and_not(&owned)?.count(true))
    }

    async fn set_interest(&mut self, addr: SocketAddr, interested: bool) -> Result<()> {
        let peer = self.peers.get_mut(&addr).unwrap();
        if interested == peer.am_interested {
            return Ok(());
        }
        peer.am_interested = interested;
        let msg = if interested {
            self.interesting_peer_count += 1;
            Message::Interested
        } else {
            self.interesting_peer_count = self.interesting_peer_count.saturating_sub(1);
            Message::NotInterested
        };
        let _ = peer.cmd.send(PeerCommand::Send(msg)).await;
        Ok(())
    }

    async fn handle_bitfield(&mut self, addr: SocketAddr, bytes: Vec<u8>) -> Result<()> {
        let bitfield = Bitfield::from_bytes(&bytes, self.piece_count)?;
        let interesting = self.interesting_piece_count(&bitfield)?;
        self.peers.get_mut(&addr).unwrap().bitfield = bitfield;
        if interesting > 0 {
            self.set_interest(addr, true).await?;
        }
        Ok(())
    }

    async fn handle_have(&mut self, addr: SocketAddr, piece_index: PieceIndex) -> Result<()> {
        let peer = self.peers.get_mut(&addr).unwrap();
        peer.bitfield.set(piece_index);
        if !self.state.has_piece(piece_index) {
            self.set_interest(addr, true).await?;
        }
        Ok(())
    }

    async fn handle_choke(&mut self, addr: SocketAddr) -> Result<()> {
        let peer = self.peers.get_mut(&addr).unwrap();
        peer.peer_choking = true;
        self.set_interest(addr, false).await
    }

    async fn handle_unchoke(&mut self, addr: SocketAddr) -> Result<()> {
        {
            let peer = self.peers.get_mut(&addr).unwrap();
            peer.peer_choking = false;
        }
        if self.peers.get(&addr).unwrap().am_interested {
            self.request_next_block(addr).await?;
        }
        Ok(())
    }

    async fn handle_interested(&mut self, addr: SocketAddr) -> Result<()> {
        let peer = self.peers.get_mut(&addr).unwrap();
        peer.peer_interested = true;
        peer.am_choking = false;
        let _ = peer.cmd.send(PeerCommand::Send(Message::Unchoke)).await;
        Ok(())
    }

    async fn handle_not_interested(&mut self, addr: SocketAddr) -> Result<()> {
        let peer = self.peers.get_mut(&addr).unwrap();
        peer.peer_interested = false;
        peer.am_choking = true;
        let _ = peer.cmd.send(PeerCommand::Send(Message::Choke)).await;
        Ok(())
    }

    async fn handle_request(
        &mut self,
        addr: SocketAddr,
        piece_index: PieceIndex,
        offset: u32,
        len: u32,
    ) -> Result<()> {
        let peer = self.peers.get(&addr).unwrap();
        if peer.am_choking {
            return Ok(());
        }
        if !self.state.has_piece(piece_index) {
            return Ok(());
        }

        let torrent_offset = piece_index as u64 * self.piece_len as u64 + offset as u64;
        let mut data = vec![0u8; len as usize];
        self.storage.read_at(torrent_offset, &mut data)?;

        let peer = self.peers.get(&addr).unwrap();
        let _ = peer
            .cmd
            .send(PeerCommand::Send(Message::Piece { piece_index, offset, data }))
            .await;
        self.state.record_upload(len as u64);

        Ok(())
    }

    /// Converts a global block index into its `(piece_index, block_index)`
    /// pair.
    fn split_global_block(&self, global: usize) -> (PieceIndex, usize) {
        (global / self.blocks_per_piece, global % self.blocks_per_piece)
    }

    fn join_global_block(&self, piece_index: PieceIndex, block_index: usize) -> usize {
        piece_index * self.blocks_per_piece + block_index
    }

    fn block_offset(&self, block_index: usize) -> u32 {
        block_index as u32 * BLOCK_LEN
    }

    fn block_len_at(&self, piece_index: PieceIndex, block_index: usize) -> u32 {
        let piece_len = if piece_index == self.piece_count - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        };
        block_len(piece_len, block_index)
    }

    /// Finds the next block that `addr` has and we don't, marks it
    /// in-flight and sends the request.
    async fn request_next_block(&mut self, addr: SocketAddr) -> Result<()> {
        let peer_bitfield = self.peers.get(&addr).unwrap().bitfield.clone();

        let mut index = self.downloading_blocks.first_index(0, false);
        while index < self.block_count {
            let (piece_index, block_index) = self.split_global_block(index);
            if peer_bitfield.get(piece_index) {
                self.downloading_blocks.set(index);
                self.last_requested_block.insert(addr, index);

                let offset = self.block_offset(block_index);
                let len = self.block_len_at(piece_index, block_index);
                let block = crate::BlockInfo { piece_index, offset, len };

                let peer = self.peers.get(&addr).unwrap();
                let _ = peer.cmd.send(PeerCommand::Send(Message::Request(block))).await;
                return Ok(());
            }
            index = self.downloading_blocks.first_index(index + 1, false);
        }

        // nothing left that this peer has and we want
        self.set_interest(addr, false).await
    }

    async fn handle_piece(
        &mut self,
        addr: SocketAddr,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        let block_index = (offset / BLOCK_LEN) as usize;
        let global_index = self.join_global_block(piece_index, block_index);

        let torrent_offset = piece_index as u64 * self.piece_len as u64 + offset as u64;
        self.storage.write_at(torrent_offset, &data)?;
        self.downloaded_blocks.set(global_index);

        self.piece_progress[piece_index] = self.piece_progress[piece_index].saturating_sub(1);
        if self.piece_progress[piece_index] == 0 {
            self.verify_piece(piece_index).await?;
        }

        let peer = self.peers.get(&addr).unwrap();
        if peer.am_interested && !peer.peer_choking {
            self.request_next_block(addr).await?;
        }

        Ok(())
    }

    /// Reads the full piece back from storage, hashes it off the event
    /// loop thread, and either records it as owned or requeues its blocks
    /// if verification failed.
    async fn verify_piece(&mut self, piece_index: PieceIndex) -> Result<()> {
        let piece_len = if piece_index == self.piece_count - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        };
        let torrent_offset = piece_index as u64 * self.piece_len as u64;

        let mut data = vec![0u8; piece_len as usize];
        self.storage.read_at(torrent_offset, &mut data)?;
        let expected_hash = self.piece_hashes[piece_index];

        let actual_hash = task::spawn_blocking(move || {
            let digest = Sha1::digest(&data);
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&digest);
            hash
        })
        .await
        .expect("hashing task panicked");

        if actual_hash != expected_hash {
            log::warn!(
                "Piece {} failed hash verification (got {}, expected {}), requeuing",
                piece_index,
                hex::encode(&actual_hash),
                hex::encode(&expected_hash)
            );
            self.piece_progress[piece_index] = if piece_index == self.piece_count - 1 {
                self.blocks_per_last_piece as u32
            } else {
                self.blocks_per_piece as u32
            };

            let start = self.join_global_block(piece_index, 0);
            let end = self.join_global_block(piece_index + 1, 0).min(self.block_count);
            for i in start..end {
                self.downloading_blocks.clear(i);
                self.downloaded_blocks.clear(i);
            }
            return Ok(());
        }

        log::info!("Piece {} verified", piece_index);
        self.state.record_piece(piece_index, piece_len);

        for peer in self.peers.values() {
            if !peer.bitfield.get(piece_index) {
                let _ = peer
                    .cmd
                    .send(PeerCommand::Send(Message::Have { piece_index }))
                    .await;
            }
        }

        if self.state.is_finished() {
            if let Some(done) = self.done.take() {
                let _ = done.send(());
            }
        }

        Ok(())
    }

    async fn handle_disconnect(&mut self, addr: &SocketAddr) {
        if let Some(peer) = self.peers.remove(addr) {
            if peer.am_interested {
                self.interesting_peer_count = self.interesting_peer_count.saturating_sub(1);
            }
        }

        if let Some(index) = self.last_requested_block.remove(addr) {
            if !self.downloaded_blocks.get(index) {
                self.downloading_blocks.clear(index);

                let (piece_index, _) = self.split_global_block(index);
                let candidates: Vec<SocketAddr> = self
                    .peers
                    .iter()
                    .filter(|(_, peer)| !peer.am_interested && peer.bitfield.get(piece_index))
                    .map(|(addr, _)| *addr)
                    .collect();
                for other in candidates {
                    let _ = self.set_interest(other, true).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::{Info, Metainfo};
    use pretty_assertions::assert_eq;

    /// A torrent of two single-block pieces, "abcd" and "efgh", in one file.
    fn two_piece_metainfo() -> Metainfo {
        let mut pieces = Vec::new();
        pieces.extend_from_slice(&Sha1::digest(b"abcd"));
        pieces.extend_from_slice(&Sha1::digest(b"efgh"));
        Metainfo {
            info: Info {
                name: "file.bin".into(),
                pieces,
                piece_length: 4,
                length: Some(8),
                files: None,
                private: None,
            },
            announce: "udp://tracker.example.com:6969/announce".into(),
            announce_list: None,
        }
    }

    fn test_manager(metainfo: &Metainfo) -> (Manager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(State::new(metainfo.piece_count(), 8));
        let (manager, _events_tx, _cmds_tx, _done_rx) =
            Manager::new(metainfo, dir.path().to_path_buf(), [1u8; 20], state).unwrap();
        (manager, dir)
    }

    fn add_test_peer(
        manager: &mut Manager,
        addr: SocketAddr,
        peer_id: PeerId,
    ) -> mpsc::Receiver<PeerCommand> {
        let (tx, rx) = mpsc::channel(16);
        let piece_count = manager.piece_count;
        manager
            .peers
            .insert(addr, PeerHandle::new(peer_id, tx, piece_count));
        rx
    }

    #[tokio::test]
    async fn test_piece_verification_records_and_broadcasts_have() {
        let metainfo = two_piece_metainfo();
        let (mut manager, _dir) = test_manager(&metainfo);

        let addr: SocketAddr = "127.0.0.1:6000".parse().unwrap();
        let mut peer_cmds = add_test_peer(&mut manager, addr, [2u8; 20]);

        manager.handle_piece(addr, 0, 0, b"abcd".to_vec()).await.unwrap();

        assert!(manager.state.has_piece(0));
        let cmd = peer_cmds.recv().await.unwrap();
        assert!(matches!(
            cmd,
            PeerCommand::Send(Message::Have { piece_index: 0 })
        ));
    }

    #[tokio::test]
    async fn test_piece_hash_mismatch_requeues_blocks() {
        let metainfo = two_piece_metainfo();
        let (mut manager, _dir) = test_manager(&metainfo);

        let addr: SocketAddr = "127.0.0.1:6001".parse().unwrap();
        add_test_peer(&mut manager, addr, [3u8; 20]);

        // deliver the wrong bytes for piece 0
        manager.handle_piece(addr, 0, 0, b"wxyz".to_vec()).await.unwrap();

        assert!(!manager.state.has_piece(0));
        assert_eq!(manager.piece_progress[0], 1);
        assert!(!manager.downloading_blocks.get(0));
        assert!(!manager.downloaded_blocks.get(0));
    }

    #[tokio::test]
    async fn test_disconnect_clears_in_flight_block_and_reexpresses_interest() {
        let metainfo = two_piece_metainfo();
        let (mut manager, _dir) = test_manager(&metainfo);

        let downloader: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        add_test_peer(&mut manager, downloader, [4u8; 20]);
        manager.downloading_blocks.set(0);
        manager.last_requested_block.insert(downloader, 0);

        let other: SocketAddr = "127.0.0.1:7001".parse().unwrap();
        let mut other_cmds = add_test_peer(&mut manager, other, [5u8; 20]);
        manager.peers.get_mut(&other).unwrap().bitfield.set(0);

        manager.handle_disconnect(&downloader).await;

        assert!(!manager.downloading_blocks.get(0));
        assert!(!manager.peers.contains_key(&downloader));

        let cmd = other_cmds.recv().await.unwrap();
        assert!(matches!(cmd, PeerCommand::Send(Message::Interested)));
        assert!(manager.peers.get(&other).unwrap().am_interested);
    }

    #[tokio::test]
    async fn test_add_peer_rejects_duplicate_peer_id() {
        let metainfo = two_piece_metainfo();
        let (mut manager, _dir) = test_manager(&metainfo);

        let addr1: SocketAddr = "127.0.0.1:8000".parse().unwrap();
        let (tx1, _rx1) = mpsc::channel(4);
        manager.add_peer(addr1, [9u8; 20], tx1).await;
        assert!(manager.peers.contains_key(&addr1));

        let addr2: SocketAddr = "127.0.0.1:8001".parse().unwrap();
        let (tx2, mut rx2) = mpsc::channel(4);
        manager.add_peer(addr2, [9u8; 20], tx2).await;

        assert!(!manager.peers.contains_key(&addr2));
        let cmd = rx2.recv().await.unwrap();
        assert!(matches!(cmd, PeerCommand::Shutdown));
    }

    #[tokio::test]
    async fn test_add_peer_rejects_own_peer_id() {
        let metainfo = two_piece_metainfo();
        let (mut manager, _dir) = test_manager(&metainfo);

        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        manager.add_peer(addr, [1u8; 20], tx).await;

        assert!(!manager.peers.contains_key(&addr));
        let cmd = rx.recv().await.unwrap();
        assert!(matches!(cmd, PeerCommand::Shutdown));
    }
}

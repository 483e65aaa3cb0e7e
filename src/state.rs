//! Shared, mutable torrent-wide counters and progress.
//!
//! Unlike piece scheduling (owned exclusively by [`crate::manager`]), these
//! counters are read from several places (the engine's alert stream, future
//! tracker announces) so they're kept behind a lock rather than folded into
//! the manager's own event loop state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::Bitfield;

/// Torrent-wide progress counters and the set of pieces we have.
pub(crate) struct State {
    /// Bytes downloaded from peers so far (including pieces that later
    /// failed hash verification and had to be re-downloaded).
    downloaded: RwLock<u64>,
    /// Bytes uploaded to peers so far.
    uploaded: RwLock<u64>,
    /// Bytes left to download to complete the torrent.
    left: RwLock<u64>,
    /// The pieces we have fully downloaded and verified.
    own_pieces: RwLock<Bitfield>,
    /// Set once `left` reaches zero.
    finished: AtomicBool,
    /// Set once the torrent has been asked to stop.
    stopped: AtomicBool,
}

impl State {
    pub fn new(piece_count: usize, download_len: u64) -> Self {
        Self {
            downloaded: RwLock::new(0),
            uploaded: RwLock::new(0),
            left: RwLock::new(download_len),
            own_pieces: RwLock::new(Bitfield::new(piece_count)),
            finished: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn downloaded(&self) -> u64 {
        *self.downloaded.read().unwrap()
    }

    pub fn uploaded(&self) -> u64 {
        *self.uploaded.read().unwrap()
    }

    pub fn left(&self) -> u64 {
        *self.left.read().unwrap()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn record_upload(&self, len: u64) {
        *self.uploaded.write().unwrap() += len;
    }

    /// Records a verified piece: marks it owned, subtracts its length from
    /// `left`, and sets `finished` if that was the last missing piece.
    pub fn record_piece(&self, index: usize, piece_len: u32) {
        let mut own_pieces = self.own_pieces.write().unwrap();
        own_pieces.set(index);
        let all_have = own_pieces.count(true) == own_pieces.len();
        drop(own_pieces);

        *self.downloaded.write().unwrap() += piece_len as u64;
        let mut left = self.left.write().unwrap();
        *left = left.saturating_sub(piece_len as u64);
        drop(left);

        if all_have {
            self.finished.store(true, Ordering::Release);
        }
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.own_pieces.read().unwrap().get(index)
    }

    pub fn own_pieces(&self) -> Bitfield {
        self.own_pieces.read().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_piece_updates_counters() {
        let state = State::new(4, 40);
        assert!(!state.is_finished());
        state.record_piece(0, 10);
        assert_eq!(state.downloaded(), 10);
        assert_eq!(state.left(), 30);
        assert!(state.has_piece(0));
        assert!(!state.is_finished());

        state.record_piece(1, 10);
        state.record_piece(2, 10);
        state.record_piece(3, 10);
        assert_eq!(state.left(), 0);
        assert!(state.is_finished());
    }
}

//! The crate-wide error type and result alias.
//!
//! Every fallible operation in the public API returns [`Result`]. Errors
//! that indicate a broken programming invariant (out of bounds storage
//! access, a double close) are not meant to be recovered from by callers;
//! they exist mostly so that a peer- or tracker-local failure can be
//! reported and contained instead of aborting the whole process.

use crate::PieceIndex;

/// The crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All errors that can occur in this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The torrent metadata or an invocation argument was invalid (e.g. an
    /// empty listener port range, or a piece length that isn't a multiple
    /// of the block length).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A filesystem or socket operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The bencoded metainfo file could not be decoded.
    #[error("metainfo decode error: {0}")]
    Bencode(#[from] serde_bencode::Error),

    /// A peer or tracker violated the wire protocol: a malformed frame, a
    /// mismatched info hash, an unknown message id, a bitfield of the
    /// wrong length, or a payload of the wrong length.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// An operation that has a deadline (handshake, outstanding request,
    /// tracker connection id) did not complete in time.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// A downloaded piece's SHA-1 digest did not match the metainfo's.
    #[error("piece {piece_index} failed hash verification")]
    HashMismatch {
        /// The piece that failed verification.
        piece_index: PieceIndex,
    },

    /// A storage offset/length pair fell outside the torrent's address
    /// space. This is a programming error, not a recoverable condition.
    #[error("storage offset out of bounds")]
    OutOfBounds,

    /// The operation was attempted on a resource (peer connection,
    /// tracker, listener) that had already been closed.
    #[error("operation on an already closed resource")]
    AlreadyClosed,

    /// A [`crate::engine::TorrentCommand`] named a torrent id the engine
    /// has no record of (never added, or already removed).
    #[error("unknown torrent id {0}")]
    UnknownTorrent(crate::TorrentId),
}

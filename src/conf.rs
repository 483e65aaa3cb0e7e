//! This module defines types used to configure the engine and its parts.

use std::{ops::RangeInclusive, path::PathBuf, time::Duration};

/// How long we wait for a peer's handshake before giving up on the
/// connection.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// How long we wait for a `piece` message after sending a `request` before
/// considering the peer unresponsive and dropping the connection.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// How long a UDP tracker connection id remains valid per BEP 15.
pub const TRACKER_CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

/// The capacity of a peer session's outbound command channel (writer task).
pub const PEER_OUTBOUND_CHANNEL_CAPACITY: usize = 16;

/// The capacity of the manager's shared inbound channel, into which every
/// peer session's reader task forwards incoming messages.
pub const MANAGER_INBOUND_CHANNEL_CAPACITY: usize = 32;

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                listen_port_range: 6881..=6889,
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The range of ports the TCP listener tries to bind to, in order,
    /// giving up once the range is exhausted.
    pub listen_port_range: RangeInclusive<u16>,
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The minimum number of peers we want to keep in torrent at all times.
    /// This will be configurable later.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide a minimum announce interval, we default
    /// to announcing every 30 seconds.
    pub announce_interval: Duration,

    /// After this many attempts, the torrent stops announcing to a tracker.
    pub tracker_error_threshold: usize,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // We always request at least 10 peers as anything less is a waste
            // of network round trip and it allows us to buffer up a bit more
            // than needed.
            min_requested_peer_count: 10,
            // This value is mostly picked for performance while keeping in mind
            // not to overwhelm the host.
            max_connected_peer_count: 50,
            // needs teting
            announce_interval: Duration::from_secs(60 * 60),
            // needs testing
            tracker_error_threshold: 15,
        }
    }
}

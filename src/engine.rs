//! The public facade for running one or more torrents under one shared
//! configuration.
//!
//! [`Engine::run`] is a command loop, much like [`crate::manager::Manager`]
//! is for a single torrent's peers: commands come in on an unbounded
//! channel via [`EngineHandle`], and progress notifications go out on
//! another as [`Alert`]s.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::conf::Conf;
use crate::download::Download;
use crate::error::{Error, Result};
use crate::metainfo::Metainfo;
use crate::state::State;
use crate::TorrentId;

/// How often [`Engine::run`] polls every live torrent's state and emits a
/// [`Alert::TorrentStats`] for it.
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// An action requested of a single already-registered torrent.
#[derive(Clone, Copy, Debug)]
pub enum TorrentCommand {
    /// Stops announcing and accepting/dialing peers, but keeps the
    /// torrent's entry (and downloaded data) around.
    ///
    /// This spec doesn't implement a standalone paused state distinct from
    /// stopped, so a `Pause` simply stops the torrent in place; a later
    /// `Resume` restarts it from scratch using its original metainfo.
    Pause,
    /// Restarts a paused (stopped) torrent from its original metainfo.
    Resume,
    /// Stops the torrent and forgets it entirely.
    Remove,
}

/// A command sent to a running [`Engine`].
pub enum Command {
    /// Registers a new torrent from its parsed metainfo and assigns it a
    /// fresh [`TorrentId`], reporting the outcome on `result`.
    CreateTorrent {
        metainfo: Metainfo,
        download_dir: PathBuf,
        result: oneshot::Sender<Result<TorrentId>>,
    },
    /// Applies a [`TorrentCommand`] to an already-registered torrent.
    TorrentCommand { id: TorrentId, cmd: TorrentCommand },
    /// Stops every torrent and ends the engine's command loop.
    Shutdown,
}

/// A notification the engine emits about a torrent's lifecycle.
pub enum Alert {
    /// A periodic progress snapshot for a running torrent.
    TorrentStats {
        id: TorrentId,
        downloaded: u64,
        uploaded: u64,
        left: u64,
    },
    /// A torrent finished downloading all of its pieces.
    TorrentComplete(TorrentId),
    /// A torrent's download task ended with an error (connect failure,
    /// storage error, or the like).
    TorrentError { id: TorrentId, error: Error },
}

pub type AlertReceiver = mpsc::UnboundedReceiver<Alert>;
type AlertSender = mpsc::UnboundedSender<Alert>;
type CommandReceiver = mpsc::UnboundedReceiver<Command>;
type CommandSender = mpsc::UnboundedSender<Command>;

/// A cheaply cloneable handle used to send [`Command`]s to a running
/// [`Engine`] from any task.
#[derive(Clone)]
pub struct EngineHandle {
    cmd: CommandSender,
}

impl EngineHandle {
    /// Registers a new torrent, returning a receiver that resolves once the
    /// engine has assigned it a [`TorrentId`] (or failed to start it).
    pub fn create_torrent(
        &self,
        metainfo: Metainfo,
        download_dir: impl Into<PathBuf>,
    ) -> Result<oneshot::Receiver<Result<TorrentId>>> {
        let (result, rx) = oneshot::channel();
        self.cmd
            .send(Command::CreateTorrent {
                metainfo,
                download_dir: download_dir.into(),
                result,
            })
            .map_err(|_| Error::AlreadyClosed)?;
        Ok(rx)
    }

    /// Applies `cmd` to the torrent identified by `id`.
    pub fn torrent_command(&self, id: TorrentId, cmd: TorrentCommand) -> Result<()> {
        self.cmd
            .send(Command::TorrentCommand { id, cmd })
            .map_err(|_| Error::AlreadyClosed)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.cmd
            .send(Command::Shutdown)
            .map_err(|_| Error::AlreadyClosed)
    }
}

/// What the engine keeps on hand for a registered torrent, enough to
/// restart it from scratch on `Resume`.
struct TorrentHandle {
    metainfo: Metainfo,
    download_dir: PathBuf,
    state: Arc<State>,
    #[allow(dead_code)]
    join: JoinHandle<()>,
}

/// Runs zero or more torrents concurrently under one shared configuration.
pub struct Engine {
    conf: Conf,
    cmd: CommandReceiver,
    alert: AlertSender,
    torrents: HashMap<TorrentId, TorrentHandle>,
    next_id: TorrentId,
}

impl Engine {
    /// Creates a new engine, returning it along with the handle used to
    /// drive it and the alert stream it emits on.
    pub fn new(conf: Conf) -> (Self, EngineHandle, AlertReceiver) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (alert_tx, alert_rx) = mpsc::unbounded_channel();
        (
            Self {
                conf,
                cmd: cmd_rx,
                alert: alert_tx,
                torrents: HashMap::new(),
                next_id: 0,
            },
            EngineHandle { cmd: cmd_tx },
            alert_rx,
        )
    }

    /// Runs the engine's command loop until a [`Command::Shutdown`] is
    /// received or every handle is dropped.
    pub async fn run(mut self) -> Result<()> {
        let mut stats_tick = tokio::time::interval(STATS_INTERVAL);

        loop {
            tokio::select! {
                cmd = self.cmd.recv() => {
                    match cmd {
                        Some(Command::CreateTorrent { metainfo, download_dir, result }) => {
                            let id = self.create_torrent(metainfo, download_dir);
                            let _ = result.send(id);
                        }
                        Some(Command::TorrentCommand { id, cmd }) => {
                            self.apply_torrent_command(id, cmd);
                        }
                        Some(Command::Shutdown) | None => {
                            for handle in self.torrents.values() {
                                handle.state.stop();
                            }
                            break;
                        }
                    }
                }
                _ = stats_tick.tick() => {
                    self.emit_stats();
                }
            }
        }
        Ok(())
    }

    fn create_torrent(&mut self, metainfo: Metainfo, download_dir: PathBuf) -> Result<TorrentId> {
        let id = self.next_id;
        self.next_id += 1;
        self.start_torrent(id, metainfo, download_dir)?;
        Ok(id)
    }

    fn apply_torrent_command(&mut self, id: TorrentId, cmd: TorrentCommand) {
        match cmd {
            TorrentCommand::Pause => {
                if let Some(handle) = self.torrents.get(&id) {
                    handle.state.stop();
                } else {
                    self.report_unknown_torrent(id);
                }
            }
            TorrentCommand::Resume => match self.torrents.remove(&id) {
                Some(handle) => {
                    if let Err(e) = self.start_torrent(id, handle.metainfo, handle.download_dir) {
                        log::error!("Failed to resume torrent {}: {}", id, e);
                        let _ = self.alert.send(Alert::TorrentError { id, error: e });
                    }
                }
                None => self.report_unknown_torrent(id),
            },
            TorrentCommand::Remove => {
                if let Some(handle) = self.torrents.remove(&id) {
                    handle.state.stop();
                } else {
                    self.report_unknown_torrent(id);
                }
            }
        }
    }

    fn report_unknown_torrent(&self, id: TorrentId) {
        log::warn!("Command issued for unknown torrent {}", id);
        let _ = self.alert.send(Alert::TorrentError {
            id,
            error: Error::UnknownTorrent(id),
        });
    }

    fn start_torrent(
        &mut self,
        id: TorrentId,
        metainfo: Metainfo,
        download_dir: PathBuf,
    ) -> Result<()> {
        let mut conf = self.conf.torrent.clone();
        conf.download_dir = download_dir.clone();

        let download = Download::new(
            metainfo.clone(),
            self.conf.engine.listen_port_range.clone(),
            conf,
        )?;

        let state = download.state();
        let alert = self.alert.clone();
        let join = tokio::spawn(async move {
            match download.run().await {
                Ok(()) => {
                    let _ = alert.send(Alert::TorrentComplete(id));
                }
                Err(error) => {
                    let _ = alert.send(Alert::TorrentError { id, error });
                }
            }
        });

        self.torrents.insert(
            id,
            TorrentHandle {
                metainfo,
                download_dir,
                state,
                join,
            },
        );
        Ok(())
    }

    fn emit_stats(&self) {
        for (&id, handle) in self.torrents.iter() {
            let _ = self.alert.send(Alert::TorrentStats {
                id,
                downloaded: handle.state.downloaded(),
                uploaded: handle.state.uploaded(),
                left: handle.state.left(),
            });
        }
    }
}

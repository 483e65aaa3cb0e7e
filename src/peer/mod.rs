//! Peer sessions.
//!
//! A [`PeerSession`] is a thin, decision-free transport: it owns the TCP
//! connection and the framed wire codec and nothing else. All scheduling
//! decisions (what to request, when we're interested, when to choke) are
//! made by [`crate::manager::Manager`], which is the sole owner of shared
//! piece-availability and progress state. A session is really two
//! independent tasks sharing one socket half each: a reader that forwards
//! every decoded message to the manager's shared inbound channel, and a
//! writer that serializes outbound messages coming from its own bounded
//! command channel. Splitting them this way means a slow manager never
//! blocks us from reading keep-alives off the wire, and a slow peer on the
//! write side never blocks us from noticing messages on the read side.

pub(crate) mod codec;

use std::net::SocketAddr;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, FramedParts};

use crate::conf::{HANDSHAKE_TIMEOUT, PEER_OUTBOUND_CHANNEL_CAPACITY, REQUEST_TIMEOUT};
use crate::error::{Error, Result};
use crate::peer::codec::{Handshake, HandshakeCodec, Message, PeerCodec, PROTOCOL_STRING};
use crate::{PeerId, Sha1Hash};

/// A message the manager receives from a peer session, tagged with the
/// address identifying which session it came from.
#[derive(Debug)]
pub(crate) enum PeerEvent {
    /// The handshake completed successfully.
    Connected { addr: SocketAddr, peer_id: PeerId },
    /// A peer message arrived.
    Message { addr: SocketAddr, message: Message },
    /// The session ended, for the given reason.
    Disconnected { addr: SocketAddr, reason: Error },
}

/// A command sent from the manager to a single peer session's writer task.
#[derive(Debug)]
pub(crate) enum Command {
    Send(Message),
    Shutdown,
}

pub(crate) type CommandSender = mpsc::Sender<Command>;
type CommandReceiver = mpsc::Receiver<Command>;

/// Connects to `addr`, performs the handshake and spawns the reader/writer
/// task pair. Returns the command sender used to push outbound messages at
/// the session, and a join handle that resolves once both tasks exit.
///
/// Every inbound event (including the initial handshake result) is sent on
/// the shared `events` channel, tagged with `addr`, so the manager can
/// multiplex arbitrarily many sessions over one channel.
pub(crate) async fn spawn_outbound(
    addr: SocketAddr,
    info_hash: Sha1Hash,
    client_id: PeerId,
    events: mpsc::Sender<PeerEvent>,
) -> Result<(PeerId, CommandSender, JoinHandle<()>)> {
    let socket = TcpStream::connect(addr).await?;
    run(socket, addr, info_hash, client_id, true, events).await
}

/// Like [`spawn_outbound`], but for a connection accepted by
/// [`crate::listener::Listener`], where the peer sends the first
/// handshake.
pub(crate) async fn spawn_inbound(
    socket: TcpStream,
    addr: SocketAddr,
    info_hash: Sha1Hash,
    client_id: PeerId,
    events: mpsc::Sender<PeerEvent>,
) -> Result<(PeerId, CommandSender, JoinHandle<()>)> {
    run(socket, addr, info_hash, client_id, false, events).await
}

async fn run(
    socket: TcpStream,
    addr: SocketAddr,
    info_hash: Sha1Hash,
    client_id: PeerId,
    is_outbound: bool,
    events: mpsc::Sender<PeerEvent>,
) -> Result<(PeerId, CommandSender, JoinHandle<()>)> {
    let socket = Framed::new(socket, HandshakeCodec);
    let (peer_id, socket) = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        do_handshake(socket, info_hash, client_id, is_outbound),
    )
    .await
    .map_err(|_| Error::Timeout("peer handshake"))??;

    log::info!("Completed handshake with peer {}", addr);
    let _ = events
        .send(PeerEvent::Connected { addr, peer_id })
        .await;

    let (sink, stream) = socket.split();
    let (cmd_tx, cmd_rx) = mpsc::channel(PEER_OUTBOUND_CHANNEL_CAPACITY);

    // shared by the writer (sets it when a request goes out) and the reader
    // (clears it when the matching piece arrives, and enforces it as a read
    // deadline otherwise)
    let (deadline_tx, deadline_rx) = watch::channel(None::<Instant>);

    let writer_events = events.clone();
    let writer = tokio::spawn(async move {
        if let Err(e) = run_writer(sink, cmd_rx, deadline_tx).await {
            let _ = writer_events
                .send(PeerEvent::Disconnected { addr, reason: e })
                .await;
        }
    });

    let reader_events = events.clone();
    let reader = tokio::spawn(async move {
        if let Err(e) = run_reader(stream, reader_events.clone(), addr, deadline_rx).await {
            let _ = reader_events
                .send(PeerEvent::Disconnected { addr, reason: e })
                .await;
        }
    });

    let handle = tokio::spawn(async move {
        let _ = tokio::join!(writer, reader);
    });

    Ok((peer_id, cmd_tx, handle))
}

async fn do_handshake(
    mut socket: Framed<TcpStream, HandshakeCodec>,
    info_hash: Sha1Hash,
    client_id: PeerId,
    is_outbound: bool,
) -> Result<(PeerId, Framed<TcpStream, PeerCodec>)> {
    let handshake = Handshake::new(info_hash, client_id);

    if is_outbound {
        socket.send(handshake).await?;
    }

    let peer_handshake = socket
        .next()
        .await
        .ok_or_else(|| Error::Protocol("connection closed before handshake".into()))??;

    if peer_handshake.prot != PROTOCOL_STRING.as_bytes() {
        return Err(Error::Protocol("invalid protocol string in handshake".into()));
    }
    if peer_handshake.info_hash != info_hash {
        return Err(Error::Protocol("handshake info hash mismatch".into()));
    }

    if !is_outbound {
        socket.send(handshake).await?;
    }

    // switch to the peer message codec, carrying over any buffered bytes
    // the peer may have sent immediately after its handshake
    let old_parts = socket.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    let socket = Framed::from_parts(new_parts);

    Ok((peer_handshake.peer_id, socket))
}

async fn run_writer(
    mut sink: futures::stream::SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    mut cmd_rx: CommandReceiver,
    deadline_tx: watch::Sender<Option<Instant>>,
) -> Result<()> {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            Command::Send(msg) => {
                if matches!(msg, Message::Request(_)) {
                    let _ = deadline_tx.send(Some(Instant::now() + REQUEST_TIMEOUT));
                }
                sink.send(msg).await?;
            }
            Command::Shutdown => break,
        }
    }
    Ok(())
}

async fn run_reader(
    mut stream: futures::stream::SplitStream<Framed<TcpStream, PeerCodec>>,
    events: mpsc::Sender<PeerEvent>,
    addr: SocketAddr,
    mut deadline_rx: watch::Receiver<Option<Instant>>,
) -> Result<()> {
    // mirrors what the writer last set, but cleared locally the moment a
    // piece arrives rather than round-tripping back through the channel
    let mut deadline: Option<Instant> = *deadline_rx.borrow();

    loop {
        let sleep_until_deadline = async {
            match deadline {
                Some(d) => tokio::time::sleep_until(d.into()).await,
                None => futures::future::pending().await,
            }
        };

        tokio::select! {
            changed = deadline_rx.changed() => {
                if changed.is_ok() {
                    deadline = *deadline_rx.borrow();
                }
            }
            _ = sleep_until_deadline => {
                return Err(Error::Timeout("outstanding request"));
            }
            msg = stream.next() => {
                let msg = match msg {
                    Some(msg) => msg?,
                    None => return Ok(()),
                };

                if matches!(msg, Message::Piece { .. }) {
                    deadline = None;
                }

                if events
                    .send(PeerEvent::Message { addr, message: msg })
                    .await
                    .is_err()
                {
                    // manager is gone, nothing left to do
                    return Ok(());
                }
            }
        }
    }
}

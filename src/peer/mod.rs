//! One connection to a remote peer.
//!
//! The state of a connection is split in two: [`PeerLink`] is the shared
//! handle the rest of the engine uses to inspect a peer and queue messages to
//! it, while [`PeerSession`] is the task that owns the socket, decodes
//! inbound frames, and performs all writes. Serializing every write through
//! the session task is what guarantees messages never interleave on the wire.

pub(crate) mod codec;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use bitvec::bitvec;
use bitvec::prelude::Msb0;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::{
    net::TcpStream,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::{timeout, Duration},
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{conf::PeerInfo, error::*, swarm::Swarm, Bitfield, PeerId, PieceIndex};

pub(crate) use codec::Message;
use codec::{Handshake, HandshakeCodec, PeerCodec};

/// How long connection setup waits for the remote's bitfield before deciding
/// the remote simply has no pieces to advertise.
const BITFIELD_TIMEOUT: Duration = Duration::from_secs(5);

/// The channel on which the rest of the engine sends commands to a peer
/// session task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands a peer session can receive.
#[derive(Debug)]
pub(crate) enum Command {
    /// Queue a message for sending on this link.
    Send(Message),
    /// Eventually shut down the peer session.
    Shutdown,
}

/// Connection-local state of one remote peer, shared between that peer's
/// session task, the schedulers, and the request driver.
///
/// By default both sides of a connection start out choked and not interested
/// in the other.
pub(crate) struct PeerLink {
    /// The remote peer's id.
    pub id: PeerId,
    cmd_chan: Sender,
    /// The remote has choked us; we must not request pieces.
    am_choked: AtomicBool,
    /// We have advertised interest to the remote.
    am_interested: AtomicBool,
    /// We have choked the remote; we must not serve its requests.
    peer_choked: AtomicBool,
    /// The remote has advertised interest to us.
    peer_interested: AtomicBool,
    /// The remote's piece availability. Bits only ever transition 0 to 1.
    pieces: RwLock<Bitfield>,
    /// Piece payload bytes received since the last choke tick.
    downloaded: AtomicU64,
}

impl PeerLink {
    pub(crate) fn new(id: PeerId, piece_count: usize, cmd_chan: Sender) -> Self {
        Self {
            id,
            cmd_chan,
            am_choked: AtomicBool::new(true),
            am_interested: AtomicBool::new(false),
            peer_choked: AtomicBool::new(true),
            peer_interested: AtomicBool::new(false),
            pieces: RwLock::new(bitvec![u8, Msb0; 0; piece_count]),
            downloaded: AtomicU64::new(0),
        }
    }

    /// Queues a message for sending. Best effort: a session that has already
    /// exited is about to be removed from the swarm, and anything queued for
    /// it can be dropped.
    pub fn send(&self, msg: Message) {
        if self.cmd_chan.send(Command::Send(msg)).is_err() {
            log::debug!("Peer {} session is gone, dropping message", self.id);
        }
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_chan.send(Command::Shutdown);
    }

    /// Whether the remote has choked us.
    pub fn is_choked(&self) -> bool {
        self.am_choked.load(Ordering::SeqCst)
    }

    pub fn set_am_choked(&self, choked: bool) {
        self.am_choked.store(choked, Ordering::SeqCst);
    }

    pub fn is_peer_choked(&self) -> bool {
        self.peer_choked.load(Ordering::SeqCst)
    }

    pub fn is_peer_interested(&self) -> bool {
        self.peer_interested.load(Ordering::SeqCst)
    }

    pub fn set_peer_interested(&self, interested: bool) {
        self.peer_interested.store(interested, Ordering::SeqCst);
    }

    /// Chokes the remote. The message is only emitted on an actual flag
    /// change, which is what keeps the two schedulers from double-choking a
    /// peer they both touch.
    pub fn choke(&self) {
        if !self.peer_choked.swap(true, Ordering::SeqCst) {
            self.send(Message::Choke);
        }
    }

    /// Unchokes the remote; emits only on flag change.
    pub fn unchoke(&self) {
        if self.peer_choked.swap(false, Ordering::SeqCst) {
            self.send(Message::Unchoke);
        }
    }

    /// Recomputes whether the remote has any piece we lack and advertises
    /// the result, suppressing the message when the flag already matches.
    ///
    /// Called whenever either side's bitfield changes.
    pub fn update_interest(&self, own_pieces: &Bitfield) {
        let wants_something = self.has_interesting_pieces(own_pieces);
        if self.am_interested.swap(wants_something, Ordering::SeqCst) != wants_something {
            self.send(if wants_something {
                Message::Interested
            } else {
                Message::NotInterested
            });
        }
    }

    /// Whether the remote has any piece we lack.
    pub fn has_interesting_pieces(&self, own_pieces: &Bitfield) -> bool {
        self.pieces
            .read()
            .iter_ones()
            .any(|index| !own_pieces[index])
    }

    /// The pieces the remote has that we lack.
    pub fn interesting_pieces(&self, own_pieces: &Bitfield) -> Vec<PieceIndex> {
        self.pieces
            .read()
            .iter_ones()
            .filter(|&index| !own_pieces[index])
            .collect()
    }

    /// Records the remote's announcement of a newly acquired piece.
    pub fn set_have(&self, index: PieceIndex) -> Result<()> {
        let mut pieces = self.pieces.write();
        if index >= pieces.len() {
            return Err(Error::InvalidPieceIndex);
        }
        pieces.set(index, true);
        Ok(())
    }

    /// Replaces the availability with the bitfield received during setup.
    ///
    /// The wire form is rounded up to whole bytes and its padding bits must
    /// be zero; the stored form is trimmed back to the piece count.
    fn install_pieces(&self, mut bitfield: Bitfield, piece_count: usize) -> Result<()> {
        if bitfield.len() < piece_count || bitfield[piece_count..].any() {
            return Err(Error::InvalidPayload("bitfield"));
        }
        bitfield.resize(piece_count, false);
        *self.pieces.write() = bitfield;
        Ok(())
    }

    pub fn has_all_pieces(&self) -> bool {
        let pieces = self.pieces.read();
        pieces.count_ones() == pieces.len()
    }

    pub fn record_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Piece payload bytes received since the last scheduler reset.
    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn reset_downloaded(&self) {
        self.downloaded.store(0, Ordering::Relaxed);
    }
}

/// Dials the given roster peer and runs the session until it ends.
pub(crate) async fn run_outbound(swarm: Arc<Swarm>, peer: PeerInfo) -> Result<()> {
    log::info!("Connecting to peer {}", peer.id);
    let socket = TcpStream::connect((peer.host.as_str(), peer.port)).await?;

    // this is an outbound connection, so we send the first handshake
    let mut socket = Framed::new(socket, HandshakeCodec);
    socket.send(Handshake::new(swarm.own_id)).await?;
    let theirs = recv_handshake(&mut socket).await?;
    if theirs.peer_id != peer.id {
        return Err(Error::HandshakeIdMismatch {
            expected: peer.id,
            actual: theirs.peer_id,
        });
    }
    swarm.event_log.connected_to(peer.id);

    PeerSession::establish(swarm, peer.id, socket).await
}

/// Runs a session on an accepted connection until it ends.
pub(crate) async fn run_inbound(swarm: Arc<Swarm>, socket: TcpStream) -> Result<()> {
    // the dialing side talks first; its id must be in the roster
    let mut socket = Framed::new(socket, HandshakeCodec);
    let theirs = recv_handshake(&mut socket).await?;
    if !swarm.in_roster(theirs.peer_id) {
        return Err(Error::UnknownPeer(theirs.peer_id));
    }
    socket.send(Handshake::new(swarm.own_id)).await?;
    swarm.event_log.connected_from(theirs.peer_id);

    PeerSession::establish(swarm, theirs.peer_id, socket).await
}

async fn recv_handshake(
    socket: &mut Framed<TcpStream, HandshakeCodec>,
) -> Result<Handshake> {
    match socket.next().await {
        Some(handshake) => handshake,
        None => Err(Error::ConnectionClosed),
    }
}

/// The task owning one connection. Created after a successful handshake and
/// run until the stream fails, the remote closes, or the engine shuts the
/// session down.
struct PeerSession {
    swarm: Arc<Swarm>,
    link: Arc<PeerLink>,
    cmd_port: Receiver,
}

impl PeerSession {
    /// Performs the availability exchange, installs the link in the swarm,
    /// and runs the session loop. The link is removed again when the loop
    /// ends, however it ends.
    async fn establish(
        swarm: Arc<Swarm>,
        remote_id: PeerId,
        socket: Framed<TcpStream, HandshakeCodec>,
    ) -> Result<()> {
        // switch to the message codec, keeping the buffers: the remote may
        // have pipelined its bitfield right behind its handshake
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let mut socket = Framed::from_parts(new_parts);

        let piece_count = swarm.store.info().piece_count;
        let own_pieces = swarm.store.own_pieces();
        if own_pieces.any() {
            socket.send(Message::Bitfield(own_pieces.clone())).await?;
        }

        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let link = Arc::new(PeerLink::new(remote_id, piece_count, cmd_chan));

        // availability exchange: wait a bounded time for the remote's
        // bitfield. Its absence just means the remote has nothing yet, and
        // any other first frame is handed to the normal dispatch below.
        let mut pending = None;
        match timeout(BITFIELD_TIMEOUT, socket.next()).await {
            Ok(Some(msg)) => match msg? {
                Message::Bitfield(bitfield) => {
                    link.install_pieces(bitfield, piece_count)?;
                }
                other => pending = Some(other),
            },
            Ok(None) => return Err(Error::ConnectionClosed),
            Err(_) => log::debug!("Peer {} sent no bitfield", remote_id),
        }

        swarm.insert_link(Arc::clone(&link))?;
        if link.has_all_pieces() {
            swarm.mark_peer_complete(remote_id);
        }

        // pieces ingested between the bitfield snapshot above and the link's
        // installation were announced on no link at all; catch the remote up
        // so its view of us doesn't miss them forever
        for index in swarm.store.own_pieces().iter_ones() {
            if !own_pieces[index] {
                link.send(Message::Have { piece_index: index });
            }
        }

        let mut session = Self {
            swarm: Arc::clone(&swarm),
            link,
            cmd_port,
        };
        let result = session.run(&mut socket, pending).await;
        swarm.remove_link(remote_id);
        log::info!("Session with peer {} ended", remote_id);
        result
    }

    /// The session loop: exchange of messages and commands until the
    /// connection or the engine winds down.
    async fn run(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
        pending: Option<Message>,
    ) -> Result<()> {
        self.link.update_interest(&self.swarm.store.own_pieces());
        if let Some(msg) = pending {
            self.handle_msg(socket, msg).await?;
        }

        loop {
            tokio::select! {
                maybe_msg = socket.next() => {
                    match maybe_msg {
                        Some(msg) => self.handle_msg(socket, msg?).await?,
                        // the remote closed the stream
                        None => return Ok(()),
                    }
                }
                cmd = self.cmd_port.recv() => {
                    match cmd {
                        Some(Command::Send(msg)) => socket.send(msg).await?,
                        Some(Command::Shutdown) | None => return Ok(()),
                    }
                }
            }
        }
    }

    async fn handle_msg(
        &self,
        socket: &mut Framed<TcpStream, PeerCodec>,
        msg: Message,
    ) -> Result<()> {
        log::debug!("Received message {:?} from peer {}", msg.id(), self.link.id);
        match msg {
            Message::Choke => {
                self.link.set_am_choked(true);
                self.swarm.event_log.choked_by(self.link.id);
            }
            Message::Unchoke => {
                self.link.set_am_choked(false);
                self.swarm.event_log.unchoked_by(self.link.id);
            }
            Message::Interested => {
                self.link.set_peer_interested(true);
                self.swarm.event_log.interested_received(self.link.id);
            }
            Message::NotInterested => {
                self.link.set_peer_interested(false);
                self.swarm.event_log.not_interested_received(self.link.id);
            }
            Message::Have { piece_index } => {
                self.link.set_have(piece_index)?;
                self.swarm.event_log.have_received(self.link.id, piece_index);
                if self.link.has_all_pieces() {
                    self.swarm.mark_peer_complete(self.link.id);
                }
                self.link.update_interest(&self.swarm.store.own_pieces());
            }
            Message::Bitfield(_) => {
                log::warn!(
                    "Peer {} sent a bitfield after the first message",
                    self.link.id
                );
                return Err(Error::BitfieldNotFirst);
            }
            Message::Request { piece_index } => {
                // requests from a peer we choke are silently dropped; the
                // peer re-requests after its next unchoke
                if !self.link.is_peer_choked()
                    && self.swarm.store.has_piece(piece_index)
                {
                    let data = self.swarm.store.read_piece(piece_index).await?;
                    socket.send(Message::Piece { piece_index, data }).await?;
                }
            }
            Message::Piece { piece_index, data } => {
                self.link.record_downloaded(data.len() as u64);
                // whatever was in flight toward this peer is satisfied now
                self.swarm.release_request(self.link.id);
                self.swarm.ingest_piece(&self.link, piece_index, data).await?;
            }
        }
        Ok(())
    }
}

use thiserror::Error;

use crate::PeerId;

/// The error type returned by the engine and its parts.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A directive in one of the configuration files is missing or malformed.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The peer id given on the command line (or received in a handshake) is
    /// not present in the roster.
    #[error("peer {0} is not listed in PeerInfo.cfg")]
    UnknownPeer(PeerId),
    /// The remote's handshake did not start with the expected protocol string.
    #[error("handshake protocol string mismatch")]
    HandshakeProtocol,
    /// The remote identified itself with an id other than the one we dialed.
    #[error("handshake peer id {actual} does not match expected {expected}")]
    HandshakeIdMismatch { expected: PeerId, actual: PeerId },
    /// A message frame carried an unknown type byte.
    #[error("invalid message type {0}")]
    InvalidMessageId(u8),
    /// A message frame's payload did not have the length its type requires.
    #[error("malformed payload for message type {0}")]
    InvalidPayload(&'static str),
    /// A piece index was outside the torrent's piece count.
    #[error("invalid piece index")]
    InvalidPieceIndex,
    /// The seed's file on disk does not have the configured length.
    #[error("seed file has length {actual}, expected {expected}")]
    SeedFileLength { expected: u64, actual: u64 },
    /// A connection for this peer is already installed.
    #[error("peer {0} is already connected")]
    AlreadyConnected(PeerId),
    /// The remote closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,
    /// A bitfield message arrived after the availability exchange.
    #[error("bitfield received after the first message")]
    BitfieldNotFirst,
    /// Holds global IO related errors.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

mod choker;
pub mod conf;
pub mod engine;
pub mod error;
mod eventlog;
mod peer;
mod request;
mod storage;
mod swarm;

use bitvec::prelude::{BitVec, Msb0};

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in the
/// source code we use `usize` to be consistent with other index types in Rust.
pub type PieceIndex = usize;

/// Peers are identified by a distinct positive integer, carried on the wire as
/// a 4-byte big endian value in the handshake.
pub type PeerId = u32;

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector of most significant bits to least significant
/// bits, that is, where the first highest bit represents the first piece, the
/// second highest element the second piece, and so on (e.g. `0b1100_0001`
/// would mean that the peer has pieces 0, 1, and 7). A truthy boolean value of
/// a piece's position in this vector means that the peer has the piece, while
/// a falsy value means it doesn't have the piece.
pub type Bitfield = BitVec<u8, Msb0>;

/// The 18-byte ASCII literal every handshake starts with.
pub(crate) const PROTOCOL_STRING: &str = "P2PFILESHARINGPROJ";

//! The protocol event log.
//!
//! Every peer appends one line per protocol event to `log_<peerId>.log` in
//! the working directory. This is distinct from the diagnostic logging done
//! through the `log` facade: the event log is part of the protocol's
//! observable output and its line format is fixed.

use std::{
    fmt::Display,
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use parking_lot::Mutex;

use crate::{error::*, PeerId, PieceIndex};

pub(crate) struct EventLog {
    own_id: PeerId,
    out: Mutex<BufWriter<File>>,
}

impl EventLog {
    /// Creates `log_<peerId>.log` in the given directory, truncating any
    /// leftover from a previous run.
    pub fn create(dir: impl AsRef<Path>, own_id: PeerId) -> Result<Self> {
        let path = dir.as_ref().join(format!("log_{}.log", own_id));
        let file = File::create(path)?;
        Ok(Self {
            own_id,
            out: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Appends `<timestamp>: Peer <own_id> <sentence>` and flushes, so that
    /// the log survives an abrupt process exit.
    fn record(&self, sentence: impl Display) {
        let mut out = self.out.lock();
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        if let Err(e) = writeln!(out, "{}: Peer {} {}", timestamp, self.own_id, sentence)
            .and_then(|_| out.flush())
        {
            log::warn!("Failed to append to event log: {}", e);
        }
    }

    pub fn connected_to(&self, peer: PeerId) {
        self.record(format_args!("makes a connection to Peer {}.", peer));
    }

    pub fn connected_from(&self, peer: PeerId) {
        self.record(format_args!("is connected from Peer {}.", peer));
    }

    pub fn preferred_neighbors(&self, peers: &[PeerId]) {
        let ids = peers
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.record(format_args!("has the preferred neighbors [{}].", ids));
    }

    pub fn optimistic_neighbor(&self, peer: PeerId) {
        self.record(format_args!(
            "has the optimistically unchoked neighbor {}.",
            peer
        ));
    }

    pub fn choked_by(&self, peer: PeerId) {
        self.record(format_args!("is choked by {}.", peer));
    }

    pub fn unchoked_by(&self, peer: PeerId) {
        self.record(format_args!("is unchoked by {}.", peer));
    }

    pub fn have_received(&self, peer: PeerId, piece: PieceIndex) {
        self.record(format_args!(
            "received the 'have' message from {} for the piece {}.",
            peer, piece
        ));
    }

    pub fn interested_received(&self, peer: PeerId) {
        self.record(format_args!(
            "received the 'interested' message from {}.",
            peer
        ));
    }

    pub fn not_interested_received(&self, peer: PeerId) {
        self.record(format_args!(
            "received the 'not interested' message from {}.",
            peer
        ));
    }

    pub fn piece_downloaded(&self, piece: PieceIndex, from: PeerId, have_count: usize) {
        self.record(format_args!(
            "has downloaded the piece {} from {}. Now the number of pieces it has is {}.",
            piece, from, have_count
        ));
    }

    pub fn download_complete(&self) {
        self.record("has downloaded the complete file.");
    }
}

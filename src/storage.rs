//! The on-disk piece store.
//!
//! Each peer keeps the shared file in its own directory and tracks which
//! pieces of it are locally available in a bitfield. Pieces are written
//! durably: the data is flushed to stable storage before the corresponding
//! bit is set, so a bit never advertises a piece the disk doesn't hold.

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
    sync::Arc,
};

use bitvec::bitvec;
use bitvec::prelude::Msb0;
use parking_lot::RwLock;
use tokio::task;

use crate::{conf::StorageInfo, error::*, Bitfield, PieceIndex};

/// The entity responsible for reading and persisting pieces of the shared
/// file. File IO runs on the blocking thread pool so that the async runtime
/// only ever suspends on sockets and timers.
pub(crate) struct PieceStore {
    info: StorageInfo,
    file: Arc<File>,
    pieces: RwLock<Bitfield>,
}

impl PieceStore {
    /// Opens the store for a peer that starts out as a seed. The file must
    /// already exist with the configured length; its pieces are all marked
    /// available.
    pub fn open_seed(path: impl AsRef<Path>, info: StorageInfo) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let actual = file.metadata()?.len();
        if actual != info.download_len {
            return Err(Error::SeedFileLength {
                expected: info.download_len,
                actual,
            });
        }
        Ok(Self {
            info,
            file: Arc::new(file),
            pieces: RwLock::new(bitvec![u8, Msb0; 1; info.piece_count]),
        })
    }

    /// Opens the store for a peer that starts out with nothing: the file is
    /// created (or extended) to the configured length and every piece is
    /// marked missing.
    pub fn open_empty(path: impl AsRef<Path>, info: StorageInfo) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(info.download_len)?;
        Ok(Self {
            info,
            file: Arc::new(file),
            pieces: RwLock::new(bitvec![u8, Msb0; 0; info.piece_count]),
        })
    }

    pub fn info(&self) -> &StorageInfo {
        &self.info
    }

    pub fn has_piece(&self, index: PieceIndex) -> bool {
        self.pieces.read().get(index).map(|bit| *bit).unwrap_or(false)
    }

    /// Returns a snapshot of the local bitfield.
    pub fn own_pieces(&self) -> Bitfield {
        self.pieces.read().clone()
    }

    /// The number of locally available pieces.
    pub fn piece_count(&self) -> usize {
        self.pieces.read().count_ones()
    }

    pub fn is_complete(&self) -> bool {
        self.piece_count() == self.info.piece_count
    }

    /// Reads the piece at the given index off disk.
    pub async fn read_piece(&self, index: PieceIndex) -> Result<Vec<u8>> {
        let len = self.info.piece_len(index)?;
        let offset = self.info.piece_offset(index);
        let file = Arc::clone(&self.file);
        task::spawn_blocking(move || {
            let mut data = vec![0; len as usize];
            file.read_exact_at(&mut data, offset)?;
            Ok::<_, Error>(data)
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }

    /// Writes the piece at the given index and flushes it to stable storage.
    ///
    /// Returns whether the piece was newly recorded: a `false` means another
    /// connection got the same piece in first and the (identical) write was
    /// redundant, in which case the caller must not announce it again.
    pub async fn write_piece(
        &self,
        index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<bool> {
        let len = self.info.piece_len(index)?;
        if data.len() != len as usize {
            return Err(Error::InvalidPayload("piece"));
        }
        let offset = self.info.piece_offset(index);
        let file = Arc::clone(&self.file);
        task::spawn_blocking(move || {
            file.write_all_at(&data, offset)?;
            file.sync_data()?;
            Ok::<_, Error>(())
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        let mut pieces = self.pieces.write();
        let newly_recorded = !pieces[index];
        pieces.set(index, true);
        Ok(newly_recorded)
    }
}

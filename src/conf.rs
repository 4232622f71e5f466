//! This module defines the immutable run parameters and the peer roster,
//! loaded from the two whitespace-delimited configuration files found in the
//! working directory.

use std::{fs, path::Path, str::FromStr, time::Duration};

use crate::{error::*, PeerId, PieceIndex};

/// The run parameters from `Common.cfg`, immutable after startup.
#[derive(Clone, Debug)]
pub struct Conf {
    /// The number of preferred neighbors each choke tick selects.
    pub preferred_count: usize,
    /// The interval between preferred neighbor reselections.
    pub unchoking_interval: Duration,
    /// The interval between optimistic unchoke rotations.
    pub optimistic_interval: Duration,
    /// The name of the shared file inside each peer's directory.
    pub file_name: String,
    /// The length of the shared file, in bytes.
    pub file_size: u64,
    /// The nominal length of a piece, in bytes. The last piece may be shorter.
    pub piece_size: u32,
}

impl Conf {
    /// Loads and parses `Common.cfg` from the given path.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::parse(&fs::read_to_string(path)?)
    }

    /// Parses the `key value` directives. Unknown keys are ignored and the
    /// order of directives is irrelevant.
    fn parse(contents: &str) -> Result<Self> {
        let mut preferred_count = None;
        let mut unchoking_interval = None;
        let mut optimistic_interval = None;
        let mut file_name = None;
        let mut file_size = None;
        let mut piece_size = None;

        for line in contents.lines() {
            let mut fields = line.split_whitespace();
            let (key, value) = match (fields.next(), fields.next()) {
                (Some(key), Some(value)) => (key, value),
                // blank lines are tolerated, a key without a value is not
                (Some(key), None) => {
                    return Err(Error::Config(format!("missing value for {key}")))
                }
                _ => continue,
            };
            match key {
                "NumberOfPreferredNeighbors" => {
                    preferred_count = Some(parse_value(key, value)?);
                }
                "UnchokingInterval" => {
                    unchoking_interval =
                        Some(Duration::from_secs(parse_value(key, value)?));
                }
                "OptimisticUnchokingInterval" => {
                    optimistic_interval =
                        Some(Duration::from_secs(parse_value(key, value)?));
                }
                "FileName" => file_name = Some(value.to_string()),
                "FileSize" => file_size = Some(parse_value(key, value)?),
                "PieceSize" => piece_size = Some(parse_value(key, value)?),
                _ => log::debug!("Ignoring unknown directive {}", key),
            }
        }

        Ok(Self {
            preferred_count: required("NumberOfPreferredNeighbors", preferred_count)?,
            unchoking_interval: required("UnchokingInterval", unchoking_interval)?,
            optimistic_interval: required(
                "OptimisticUnchokingInterval",
                optimistic_interval,
            )?,
            file_name: required("FileName", file_name)?,
            file_size: required("FileSize", file_size)?,
            piece_size: required("PieceSize", piece_size)?,
        })
    }

    /// Returns the piece layout derived from the file and piece sizes.
    pub fn storage_info(&self) -> StorageInfo {
        StorageInfo::new(self.file_size, self.piece_size)
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("malformed value for {key}: {value}")))
}

fn required<T>(key: &str, value: Option<T>) -> Result<T> {
    value.ok_or_else(|| Error::Config(format!("missing directive {key}")))
}

/// One roster record from `PeerInfo.cfg`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    /// The peer's id, distinct within the roster.
    pub id: PeerId,
    /// The host the peer listens on.
    pub host: String,
    /// The peer's listening port.
    pub port: u16,
    /// Whether the peer starts out with the complete file.
    pub has_file: bool,
}

/// Loads and parses the roster from `PeerInfo.cfg`. The file's line order
/// defines the dial order at startup.
pub fn load_roster(path: impl AsRef<Path>) -> Result<Vec<PeerInfo>> {
    parse_roster(&fs::read_to_string(path)?)
}

fn parse_roster(contents: &str) -> Result<Vec<PeerInfo>> {
    let mut roster = Vec::new();
    for line in contents.lines() {
        let fields: Vec<_> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        let &[id, host, port, has_file] = fields.as_slice() else {
            return Err(Error::Config(format!("malformed roster record: {line}")));
        };
        let has_file = match has_file {
            "0" => false,
            "1" => true,
            other => {
                return Err(Error::Config(format!(
                    "malformed hasFile flag: {other}"
                )))
            }
        };
        roster.push(PeerInfo {
            id: parse_value("peerId", id)?,
            host: host.to_string(),
            port: parse_value("listeningPort", port)?,
            has_file,
        });
    }
    Ok(roster)
}

/// Information about the shared file's piece layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StorageInfo {
    /// The number of pieces the file divides into.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece, which may differ from the nominal piece
    /// length if the file size is not an exact multiple of the piece length.
    pub last_piece_len: u32,
    /// The length of the shared file.
    pub download_len: u64,
}

impl StorageInfo {
    pub fn new(download_len: u64, piece_len: u32) -> Self {
        let piece_count =
            ((download_len + piece_len as u64 - 1) / piece_len as u64) as usize;
        let last_piece_len =
            (download_len - piece_len as u64 * (piece_count as u64 - 1)) as u32;
        Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
        }
    }

    /// Returns the length of the piece at the given index. Every piece is
    /// the nominal length except the final one, which covers whatever the
    /// file size leaves over.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        match (index + 1).cmp(&self.piece_count) {
            std::cmp::Ordering::Less => Ok(self.piece_len),
            std::cmp::Ordering::Equal => Ok(self.last_piece_len),
            std::cmp::Ordering::Greater => {
                log::error!(
                    "Piece index {} is out of range, the shared file has {} pieces",
                    index,
                    self.piece_count
                );
                Err(Error::InvalidPieceIndex)
            }
        }
    }

    /// Returns the byte offset of the piece in the file.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_len as u64
    }
}

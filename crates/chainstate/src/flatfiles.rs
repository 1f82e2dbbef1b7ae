//! Append-only record files for blocks (`blk*.dat`) and undo data
//! (`rev*.dat`). Each record is framed by the network magic and a length;
//! files are size-capped and grown in pre-allocated chunks so appends do not
//! fragment.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const BLOCKFILE_CHUNK_SIZE: u64 = 16 * 1024 * 1024;
pub const UNDOFILE_CHUNK_SIZE: u64 = 1024 * 1024;
pub const MAX_BLOCKFILE_SIZE: u64 = 128 * 1024 * 1024;

const RECORD_HEADER_LEN: u64 = 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileLocation {
    pub file_id: u32,
    pub offset: u64,
    pub len: u32,
}

impl FileLocation {
    pub fn encode(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.file_id.to_le_bytes());
        out[4..12].copy_from_slice(&self.offset.to_le_bytes());
        out[12..16].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 16 {
            return None;
        }
        let file_id = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let offset = u64::from_le_bytes(bytes[4..12].try_into().ok()?);
        let len = u32::from_le_bytes(bytes[12..16].try_into().ok()?);
        Some(Self {
            file_id,
            offset,
            len,
        })
    }
}

#[derive(Debug)]
pub enum FlatFileError {
    Io(std::io::Error),
    InvalidLocation,
    MagicMismatch,
    LengthMismatch,
}

impl std::fmt::Display for FlatFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlatFileError::Io(err) => write!(f, "{err}"),
            FlatFileError::InvalidLocation => write!(f, "invalid flatfile location"),
            FlatFileError::MagicMismatch => write!(f, "flatfile record magic mismatch"),
            FlatFileError::LengthMismatch => write!(f, "flatfile record length mismatch"),
        }
    }
}

impl std::error::Error for FlatFileError {}

impl From<std::io::Error> for FlatFileError {
    fn from(err: std::io::Error) -> Self {
        FlatFileError::Io(err)
    }
}

pub struct FlatFileStore {
    dir: PathBuf,
    prefix: String,
    magic: [u8; 4],
    max_file_size: u64,
    chunk_size: u64,
    state: Mutex<FlatFileState>,
}

#[derive(Debug)]
struct FlatFileState {
    current_file: u32,
    current_len: u64,
}

impl FlatFileStore {
    /// Opens a store resuming at a known write position, normally recovered
    /// from the file-info records of the index database.
    pub fn open(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        magic: [u8; 4],
        max_file_size: u64,
        chunk_size: u64,
        current_file: u32,
        current_len: u64,
    ) -> Result<Self, FlatFileError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            prefix: prefix.into(),
            magic,
            max_file_size,
            chunk_size,
            state: Mutex::new(FlatFileState {
                current_file,
                current_len,
            }),
        })
    }

    pub fn current_position(&self) -> (u32, u64) {
        let state = self.state.lock().expect("flatfile lock");
        (state.current_file, state.current_len)
    }

    /// Appends one record, rolling to the next file when the cap is hit.
    /// Returns where the payload landed; `offset` addresses the record
    /// header, as the index stores it.
    pub fn append(&self, bytes: &[u8]) -> Result<FileLocation, FlatFileError> {
        let mut state = self.state.lock().expect("flatfile lock");
        let needed = RECORD_HEADER_LEN + bytes.len() as u64;
        if state.current_len + needed > self.max_file_size && state.current_len > 0 {
            state.current_file += 1;
            state.current_len = 0;
        }
        let offset = state.current_len;
        let path = self.file_path(state.current_file);
        let mut file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;

        // Grow in chunks ahead of the write position.
        let allocated = file.metadata()?.len();
        let end = offset + needed;
        if end > allocated {
            let target = end.div_ceil(self.chunk_size) * self.chunk_size;
            file.set_len(target.min(self.max_file_size.max(end)))?;
        }

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&self.magic)?;
        file.write_all(&(bytes.len() as u32).to_le_bytes())?;
        file.write_all(bytes)?;
        file.flush()?;
        state.current_len += needed;
        Ok(FileLocation {
            file_id: state.current_file,
            offset,
            len: bytes.len() as u32,
        })
    }

    /// Appends a record at an explicit position in an explicit file, used
    /// for undo data whose file id is paired with the block's file. The
    /// caller tracks per-file write offsets.
    pub fn append_at(
        &self,
        file_id: u32,
        offset: u64,
        bytes: &[u8],
    ) -> Result<FileLocation, FlatFileError> {
        let path = self.file_path(file_id);
        let mut file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        let needed = RECORD_HEADER_LEN + bytes.len() as u64;
        let allocated = file.metadata()?.len();
        let end = offset + needed;
        if end > allocated {
            let target = end.div_ceil(self.chunk_size) * self.chunk_size;
            file.set_len(target)?;
        }
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&self.magic)?;
        file.write_all(&(bytes.len() as u32).to_le_bytes())?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(FileLocation {
            file_id,
            offset,
            len: bytes.len() as u32,
        })
    }

    pub fn read(&self, location: FileLocation) -> Result<Vec<u8>, FlatFileError> {
        if location.len == 0 {
            return Err(FlatFileError::InvalidLocation);
        }
        let path = self.file_path(location.file_id);
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(location.offset))?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if magic != self.magic {
            return Err(FlatFileError::MagicMismatch);
        }
        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        if u32::from_le_bytes(len_bytes) != location.len {
            return Err(FlatFileError::LengthMismatch);
        }
        let mut buffer = vec![0u8; location.len as usize];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Truncates pre-allocated slack off a finished file and syncs it, part
    /// of the ordered flush sequence.
    pub fn finalize(&self, file_id: u32, used_len: u64) -> Result<(), FlatFileError> {
        let path = self.file_path(file_id);
        if !path.exists() {
            return Ok(());
        }
        let file = OpenOptions::new().write(true).open(&path)?;
        if file.metadata()?.len() > used_len {
            file.set_len(used_len)?;
        }
        file.sync_all()?;
        Ok(())
    }

    /// Deletes a pruned file from disk.
    pub fn remove_file(&self, file_id: u32) -> Result<(), FlatFileError> {
        let path = self.file_path(file_id);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn file_path(&self, file_id: u32) -> PathBuf {
        self.dir.join(format!("{}{file_id:05}.dat", self.prefix))
    }

    /// Scans the directory for the last file and its used length, for
    /// stores opened without index metadata. Pre-allocated slack makes this
    /// an upper bound; the index metadata is authoritative when present.
    pub fn scan_position(
        dir: &Path,
        prefix: &str,
        max_file_size: u64,
    ) -> Result<(u32, u64), FlatFileError> {
        let mut file_id = 0u32;
        let mut last: Option<(u32, u64)> = None;
        loop {
            let path = dir.join(format!("{prefix}{file_id:05}.dat"));
            if !path.exists() {
                break;
            }
            last = Some((file_id, std::fs::metadata(&path)?.len()));
            file_id += 1;
        }
        Ok(match last {
            Some((id, len)) if len >= max_file_size => (id + 1, 0),
            Some((id, len)) => (id, len),
            None => (0, 0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

    fn store(dir: &Path, max: u64) -> FlatFileStore {
        FlatFileStore::open(dir, "blk", MAGIC, max, 4096, 0, 0).expect("open")
    }

    #[test]
    fn append_then_read_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = store(dir.path(), 1_000_000);
        let first = files.append(b"first record").expect("append");
        let second = files.append(b"second").expect("append");
        assert_eq!(files.read(first).expect("read"), b"first record");
        assert_eq!(files.read(second).expect("read"), b"second");
        assert!(second.offset > first.offset);
        assert_eq!(first.file_id, second.file_id);
    }

    #[test]
    fn size_cap_rolls_to_next_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = store(dir.path(), 64);
        let first = files.append(&[0xaa; 40]).expect("append");
        let second = files.append(&[0xbb; 40]).expect("append");
        assert_eq!(first.file_id, 0);
        assert_eq!(second.file_id, 1);
        assert_eq!(files.read(second).expect("read"), vec![0xbb; 40]);
    }

    #[test]
    fn corrupted_magic_is_detected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = store(dir.path(), 1_000_000);
        let location = files.append(b"payload").expect("append");

        let path = dir.path().join("blk00000.dat");
        let mut bytes = std::fs::read(&path).expect("read file");
        bytes[0] ^= 0xff;
        std::fs::write(&path, bytes).expect("write file");
        assert!(matches!(
            files.read(location),
            Err(FlatFileError::MagicMismatch)
        ));
    }

    #[test]
    fn finalize_truncates_preallocation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = store(dir.path(), 1_000_000);
        files.append(b"only").expect("append");
        let path = dir.path().join("blk00000.dat");
        assert_eq!(std::fs::metadata(&path).expect("meta").len(), 4096);

        let (_, used) = files.current_position();
        files.finalize(0, used).expect("finalize");
        assert_eq!(std::fs::metadata(&path).expect("meta").len(), used);
    }
}

use crate::commitlog::atomic_file;
use crate::commitlog::{Entry, Index, Log};
use std::convert::TryFrom;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

const LENGTH_FIELD_SIZE: u64 = 4;
const RECORD_OVERHEAD: u64 = 2 * LENGTH_FIELD_SIZE;

/// PersistentLog is a crash-recoverable log stored in two files next to each other:
///
/// * `<prefix>_log` holds records back-to-back. The length is written on both sides of the
///   payload so the tail can be found walking backwards.
/// * `<prefix>_cursor` holds the byte offset where valid data ends, as a 4 byte little endian
///   integer. It is only ever replaced atomically, and only after the record bytes are flushed.
///
/// ```text
/// | 0 | 1 | 2 | 3 | 4 |  ...  | N+4 | N+5 | N+6 | N+7 |
/// +---+---+---+---+---+-...-+-----+-----+-----+-----+
/// |  Length (N)   | Payload |     Length (N)        |
/// +---------------+---------+-----------------------+
/// ```
///
/// Anything in the log file beyond the cursor is garbage from an interrupted append and is
/// ignored on reload. Payloads are loaded lazily and cached once read.
pub struct PersistentLog<E: Entry> {
    logger: slog::Logger,
    log_file: File,
    cursor_path: PathBuf,
    cursor: u64,
    index: Vec<RecordLocation>,
    _pd: PhantomData<E>,
}

struct RecordLocation {
    // Offset of the leading length field.
    offset: u64,
    len: u32,
    cached: Option<Vec<u8>>,
}

impl<E: Entry> PersistentLog<E> {
    pub fn open_or_create<P: AsRef<Path>>(logger: slog::Logger, path_prefix: P) -> io::Result<Self> {
        let (log_path, cursor_path) = Self::paths(path_prefix.as_ref());

        if !log_path.exists() || !cursor_path.exists() {
            slog::info!(logger, "Creating empty log at {:?}", log_path);
            File::create(&log_path)?.sync_all()?;
            write_cursor(&cursor_path, 0)?;
        }

        let mut log_file = OpenOptions::new().read(true).write(true).open(&log_path)?;
        let cursor = read_cursor(&cursor_path)?;
        let index = scan(&mut log_file, cursor)?;
        slog::info!(logger, "Loaded {} log entries from {:?}", index.len(), log_path);

        Ok(PersistentLog {
            logger,
            log_file,
            cursor_path,
            cursor,
            index,
            _pd: PhantomData::default(),
        })
    }

    /// Delete the files backing a log. Used to start a server from a clean slate.
    pub fn remove_files<P: AsRef<Path>>(path_prefix: P) -> io::Result<()> {
        let (log_path, cursor_path) = Self::paths(path_prefix.as_ref());
        atomic_file::remove_if_exists(&cursor_path)?;
        atomic_file::remove_if_exists(&log_path)
    }

    fn paths(path_prefix: &Path) -> (PathBuf, PathBuf) {
        (
            atomic_file::with_suffix(path_prefix, "_log"),
            atomic_file::with_suffix(path_prefix, "_cursor"),
        )
    }
}

impl<E: Entry> Log<E> for PersistentLog<E> {
    fn append(&mut self, entry: E) -> Result<Index, io::Error> {
        let payload = entry.to_bytes()?;
        let len = u32::try_from(payload.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "log entry too large"))?;
        let new_cursor = self.cursor + len as u64 + RECORD_OVERHEAD;

        let mut record = Vec::with_capacity(payload.len() + RECORD_OVERHEAD as usize);
        record.extend_from_slice(&len.to_le_bytes());
        record.extend_from_slice(&payload);
        record.extend_from_slice(&len.to_le_bytes());

        self.log_file.seek(SeekFrom::Start(self.cursor))?;
        self.log_file.write_all(&record)?;
        self.log_file.sync_data()?;
        // Only now does the record become visible.
        write_cursor(&self.cursor_path, new_cursor)?;

        self.index.push(RecordLocation {
            offset: self.cursor,
            len,
            cached: Some(payload),
        });
        self.cursor = new_cursor;

        Ok(Index::new_usize(self.index.len() - 1))
    }

    fn read(&mut self, index: Index) -> Result<Option<E>, io::Error> {
        let location = match self.index.get_mut(index.as_usize()) {
            Some(location) => location,
            None => return Ok(None),
        };

        let bytes = match &location.cached {
            Some(bytes) => bytes.clone(),
            None => {
                let mut bytes = vec![0u8; location.len as usize];
                self.log_file.seek(SeekFrom::Start(location.offset + LENGTH_FIELD_SIZE))?;
                self.log_file.read_exact(&mut bytes)?;
                location.cached.replace(bytes.clone());
                bytes
            }
        };

        E::try_from(bytes).map(Some)
    }

    fn remove_last(&mut self) -> Result<bool, io::Error> {
        if self.index.is_empty() {
            return Ok(false);
        }

        let trailing_len = read_u32_at(&mut self.log_file, self.cursor - LENGTH_FIELD_SIZE)?;
        let new_cursor = self
            .cursor
            .checked_sub(trailing_len as u64 + RECORD_OVERHEAD)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "trailing length points before start of log"))?;

        write_cursor(&self.cursor_path, new_cursor)?;
        self.cursor = new_cursor;
        self.index.pop();
        slog::debug!(self.logger, "Removed log entry {}", self.index.len());

        Ok(true)
    }

    fn last_index(&self) -> Option<Index> {
        self.index.len().checked_sub(1).map(Index::new_usize)
    }
}

/// Rebuild the in-memory index by walking record headers up to `cursor`, without reading payloads.
fn scan(log_file: &mut File, cursor: u64) -> io::Result<Vec<RecordLocation>> {
    let mut index = vec![];
    let mut offset = 0;

    while offset < cursor {
        let len = read_u32_at(log_file, offset)?;
        let end = offset + len as u64 + RECORD_OVERHEAD;
        if end > cursor {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("record at offset {} extends past cursor {}", offset, cursor),
            ));
        }

        let trailing_len = read_u32_at(log_file, end - LENGTH_FIELD_SIZE)?;
        if trailing_len != len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("record at offset {} has mismatched length fields", offset),
            ));
        }

        index.push(RecordLocation {
            offset,
            len,
            cached: None,
        });
        offset = end;
    }

    Ok(index)
}

fn read_u32_at(file: &mut File, offset: u64) -> io::Result<u32> {
    let mut buffer = [0u8; LENGTH_FIELD_SIZE as usize];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buffer)?;
    Ok(u32::from_le_bytes(buffer))
}

fn read_cursor(cursor_path: &Path) -> io::Result<u64> {
    let mut buffer = [0u8; LENGTH_FIELD_SIZE as usize];
    let mut file = File::open(cursor_path)?;
    file.read_exact(&mut buffer)?;
    Ok(u32::from_le_bytes(buffer) as u64)
}

fn write_cursor(cursor_path: &Path, cursor: u64) -> io::Result<()> {
    let cursor = u32::try_from(cursor)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "log file would exceed 4 GiB"))?;
    atomic_file::replace(cursor_path, &cursor.to_le_bytes())
}

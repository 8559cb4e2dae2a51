use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::limits::MAX_WAL_ENTRY_LEN;
use crate::model::Event;

/// Magic + format version, written once at the start of every WAL file.
const WAL_HEADER: &[u8; 6] = b"GBWAL\x01";

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "WAL entry too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Read exactly `buf.len()` bytes. `Ok(false)` on a clean or torn EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// The file operations the log needs on top of `Write`.
///
/// `File` is the only production implementation; tests substitute files
/// that fail part way through a write or an fsync.
pub trait WalFile: Write {
    fn size(&self) -> io::Result<u64>;
    fn truncate(&self, len: u64) -> io::Result<()>;
    fn sync(&self) -> io::Result<()>;
}

impl WalFile for File {
    fn size(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&self) -> io::Result<()> {
        self.sync_all()
    }
}

/// Append-only Write-Ahead Log for table and guest events.
///
/// File layout: `GBWAL\x01` header, then per entry `[u32: len][bincode: Event][u32: crc32]`.
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A torn last entry (crash mid-write) is discarded on replay via length-prefix + CRC check.
///
/// Appends are staged in memory and reach the file only in `flush_sync`.
/// The file never holds bytes past `committed_len` once a batch has failed:
/// `rollback` truncates back to it, and if that fails the log is poisoned
/// and refuses further appends until reopened.
pub struct Wal<F: WalFile = File> {
    file: F,
    path: PathBuf,
    pending: Vec<u8>,
    pending_events: u64,
    committed_len: u64,
    poisoned: bool,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`. A new file gets the header.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Self::from_file(file, path)
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write compacted events (with header) to the temp file and fsync.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let file = File::create(Self::compact_tmp_path(path))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(WAL_HEADER)?;
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the WAL and reopen for appending.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.committed_len = file.size()?;
        self.file = file;
        self.pending.clear();
        self.pending_events = 0;
        self.poisoned = false;
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Both compaction phases in one call.
    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }
}

impl<F: WalFile> Wal<F> {
    /// Wrap an already opened file, which must append at its end.
    /// An empty file gets the header.
    pub fn from_file(mut file: F, path: &Path) -> io::Result<Self> {
        if file.size()? == 0 {
            file.write_all(WAL_HEADER)?;
            file.flush()?;
            file.sync()?;
        }
        let committed_len = file.size()?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            pending: Vec::new(),
            pending_events: 0,
            committed_len,
            poisoned: false,
            appends_since_compact: 0,
        })
    }

    /// Append and fsync one event. Tests only; the engine goes through
    /// `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Stage one event without writing it. Call `flush_sync()` after the batch.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL is poisoned by a failed rollback"));
        }
        encode_event(&mut self.pending, event)?;
        self.pending_events += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Write every staged event and fsync. On error the batch stays staged and
    /// the file may hold part of it; call `rollback()` before anything else.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL is poisoned by a failed rollback"));
        }
        let result = self
            .file
            .write_all(&self.pending)
            .and_then(|()| self.file.flush())
            .and_then(|()| self.file.sync());
        if result.is_ok() {
            self.committed_len += self.pending.len() as u64;
            self.pending.clear();
            self.pending_events = 0;
        }
        result
    }

    /// Drop the staged batch and cut the file back to the last committed entry.
    pub fn rollback(&mut self) -> io::Result<()> {
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.pending_events);
        self.pending.clear();
        self.pending_events = 0;
        let result = self
            .file
            .truncate(self.committed_len)
            .and_then(|()| self.file.sync());
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }
}

impl Wal {
    /// Replay the WAL from disk, returning all valid events.
    ///
    /// A missing or empty file replays as nothing. A foreign header is an error.
    /// Torn or corrupt trailing entries end the replay silently.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        if file.metadata()?.len() == 0 {
            return Ok(Vec::new());
        }
        let mut reader = BufReader::new(file);

        let mut header = [0u8; WAL_HEADER.len()];
        if !read_full(&mut reader, &mut header)? || &header != WAL_HEADER {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not a guestbook WAL", path.display()),
            ));
        }

        let mut events = Vec::new();
        loop {
            let mut len_buf = [0u8; 4];
            if !read_full(&mut reader, &mut len_buf)? {
                break;
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_WAL_ENTRY_LEN {
                break;
            }

            let mut payload = vec![0u8; len];
            if !read_full(&mut reader, &mut payload)? {
                break;
            }

            let mut crc_buf = [0u8; 4];
            if !read_full(&mut reader, &mut crc_buf)? {
                break;
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }

            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
        }

        Ok(events)
    }
}

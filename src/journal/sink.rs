//! Byte-level destinations for the journal.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Name of the append-only log inside a database directory.
pub const LOG_FILE: &str = "journal.log";
/// Name of the checkpoint snapshot inside a database directory.
pub const SNAPSHOT_FILE: &str = "snapshot.json";

/// Where journal bytes go.
///
/// `append` may buffer; `flush` hands buffered bytes to the backing store and
/// `sync` additionally makes them durable.
pub trait LogSink: Send {
    fn append(&mut self, bytes: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;

    fn sync(&mut self) -> io::Result<()>;

    /// Everything appended so far.
    fn read_log(&mut self) -> io::Result<Vec<u8>>;

    /// Drop the whole log. Only called right after a snapshot was written.
    fn truncate_log(&mut self) -> io::Result<()>;

    fn read_snapshot(&mut self) -> io::Result<Option<Vec<u8>>>;

    /// Replace the snapshot atomically.
    fn write_snapshot(&mut self, bytes: &[u8]) -> io::Result<()>;
}

/// Journal stored as files in a database directory.
pub struct FileSink {
    dir: PathBuf,
    writer: BufWriter<File>,
}

impl FileSink {
    /// Open (or create) the log in `dir`. The directory must exist.
    pub fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(dir.join(LOG_FILE))?;

        Ok(Self {
            dir,
            writer: BufWriter::new(file),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl LogSink for FileSink {
    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    fn sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }

    fn read_log(&mut self) -> io::Result<Vec<u8>> {
        self.writer.flush()?;
        fs::read(self.dir.join(LOG_FILE))
    }

    fn truncate_log(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        let file = self.writer.get_ref();
        file.set_len(0)?;
        file.sync_all()
    }

    fn read_snapshot(&mut self) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.dir.join(SNAPSHOT_FILE)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_snapshot(&mut self, bytes: &[u8]) -> io::Result<()> {
        let tmp = self.dir.join(format!("{}.tmp", SNAPSHOT_FILE));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.dir.join(SNAPSHOT_FILE))
    }
}

/// In-memory journal.
///
/// Clones share the same buffers, so a clone handed to a second `Database`
/// behaves like reopening the same directory after a crash. Writes can be made
/// to fail on demand for exercising durability errors.
#[derive(Clone, Default)]
pub struct MemorySink {
    log: Arc<Mutex<Vec<u8>>>,
    snapshot: Arc<Mutex<Option<Vec<u8>>>>,
    fail_writes: Arc<AtomicBool>,
    fail_syncs: Arc<AtomicBool>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent append and sync fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make `sync` fail while appends keep landing in the log, like a disk
    /// that accepts writes but cannot make them durable.
    pub fn fail_syncs(&self, fail: bool) {
        self.fail_syncs.store(fail, Ordering::SeqCst);
    }

    /// Raw log bytes, for inspection.
    pub fn contents(&self) -> Vec<u8> {
        self.log.lock().clone()
    }

    fn check(&self) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        Ok(())
    }
}

impl LogSink for MemorySink {
    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.check()?;
        self.log.lock().extend_from_slice(bytes);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check()
    }

    fn sync(&mut self) -> io::Result<()> {
        self.check()?;
        if self.fail_syncs.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected sync failure"));
        }
        Ok(())
    }

    fn read_log(&mut self) -> io::Result<Vec<u8>> {
        Ok(self.log.lock().clone())
    }

    fn truncate_log(&mut self) -> io::Result<()> {
        self.check()?;
        self.log.lock().clear();
        Ok(())
    }

    fn read_snapshot(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.snapshot.lock().clone())
    }

    fn write_snapshot(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.check()?;
        *self.snapshot.lock() = Some(bytes.to_vec());
        Ok(())
    }
}

//! Partitioned, size-limited blob storage.
//!
//! A [`Store`] maps names to [`Record`]s. Stores can be partitioned by a
//! numeric key (usually the owning user id) and carry an optional byte limit
//! enforced on every write through [`LimitedWriter`].

pub mod fs;
pub mod null;

use std::io::{self, Read, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub use fs::FsStore;
pub use null::NullStore;

const COPY_BUF: usize = 32 * 1024;

/// Errors from store and record operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("file already exists")]
    Exist,

    #[error("file does not exist")]
    NotExist,

    #[error("file already closed")]
    Closed,

    #[error("permission denied")]
    Permission,

    /// The byte limit was reached. `written` counts the bytes that did make
    /// it through before the limit stopped the write.
    #[error("write limit reached after {written} bytes")]
    WriteLimit { written: u64 },

    #[error("invalid argument")]
    Invalid,

    #[error("{op} {path}: {source}")]
    Path {
        op: &'static str,
        path: String,
        #[source]
        source: Box<StoreError>,
    },

    #[error("io error: {0}")]
    Io(io::Error),
}

impl StoreError {
    /// Wrap `err` with the operation and name it failed on.
    pub fn path(op: &'static str, path: impl Into<String>, err: StoreError) -> StoreError {
        StoreError::Path {
            op,
            path: path.into(),
            source: Box::new(err),
        }
    }

    /// The innermost error, looking through `Path` wrappers.
    pub fn root(&self) -> &StoreError {
        match self {
            StoreError::Path { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_exist(&self) -> bool {
        matches!(self.root(), StoreError::NotExist)
    }

    pub fn is_exist(&self) -> bool {
        matches!(self.root(), StoreError::Exist)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.root(), StoreError::Closed)
    }

    pub fn is_permission(&self) -> bool {
        matches!(self.root(), StoreError::Permission)
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self.root(), StoreError::Invalid)
    }

    /// Bytes written before the limit was hit, if this is a limit error.
    pub fn write_limit(&self) -> Option<u64> {
        match self.root() {
            StoreError::WriteLimit { written } => Some(*written),
            _ => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => StoreError::NotExist,
            io::ErrorKind::AlreadyExists => StoreError::Exist,
            io::ErrorKind::PermissionDenied => StoreError::Permission,
            io::ErrorKind::InvalidInput => StoreError::Invalid,
            _ => StoreError::Io(e),
        }
    }
}

impl From<StoreError> for io::Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Io(e) => e,
            other => {
                let kind = match other.root() {
                    StoreError::NotExist => io::ErrorKind::NotFound,
                    StoreError::Exist => io::ErrorKind::AlreadyExists,
                    StoreError::Permission => io::ErrorKind::PermissionDenied,
                    StoreError::Invalid => io::ErrorKind::InvalidInput,
                    _ => io::ErrorKind::Other,
                };
                io::Error::new(kind, other)
            }
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Metadata about a stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// A single named blob: readable, writable, seekable and closeable.
///
/// Records start open. After [`Record::close`] every operation, including a
/// second close, fails with [`StoreError::Closed`].
pub trait Record: Send {
    fn name(&self) -> &str;

    fn read(&mut self, buf: &mut [u8]) -> StoreResult<usize>;

    fn write(&mut self, buf: &[u8]) -> StoreResult<usize>;

    fn seek(&mut self, pos: SeekFrom) -> StoreResult<u64>;

    fn close(&mut self) -> StoreResult<()>;
}

/// Named blob storage.
pub trait Store: Send + Sync {
    /// Prepare the backing storage.
    fn init(&self) -> StoreResult<()>;

    /// A store scoped to partition `key`, sharing this store's limit.
    fn partition(&self, key: i64) -> Arc<dyn Store>;

    fn create(&self, name: &str) -> StoreResult<Box<dyn Record>>;

    fn open(&self, name: &str) -> StoreResult<Box<dyn Record>>;

    fn remove(&self, name: &str) -> StoreResult<()>;

    fn stat(&self, name: &str) -> StoreResult<FileInfo>;

    /// Byte limit applied to every record write; `0` means unbounded.
    fn limit(&self) -> u64;

    /// Create `name` and fill it from `reader`. Returns the bytes written.
    ///
    /// When the limit cuts the copy short the blob keeps the truncated
    /// content and the error carries the total written.
    fn collect(&self, name: &str, reader: &mut dyn Read) -> StoreResult<u64> {
        let mut record = self.create(name)?;
        let copied = copy_into(record.as_mut(), reader);
        let closed = record.close();
        let n = copied.map_err(|e| StoreError::path("collect", name, e))?;
        closed?;
        Ok(n)
    }

    /// Stream `name` into `writer`. Returns the bytes copied.
    fn place(&self, name: &str, writer: &mut dyn Write) -> StoreResult<u64> {
        let mut record = self.open(name)?;
        let copied = copy_from(record.as_mut(), writer);
        let closed = record.close();
        let n = copied.map_err(|e| StoreError::path("place", name, e))?;
        closed?;
        Ok(n)
    }
}

fn copy_into(record: &mut dyn Record, reader: &mut dyn Read) -> StoreResult<u64> {
    let mut buf = vec![0u8; COPY_BUF];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        match record.write(&buf[..n]) {
            Ok(w) => total += w as u64,
            Err(StoreError::WriteLimit { written }) => {
                return Err(StoreError::WriteLimit {
                    written: total + written,
                })
            }
            Err(e) => return Err(e),
        }
    }
}

fn copy_from(record: &mut dyn Record, writer: &mut dyn Write) -> StoreResult<u64> {
    let mut buf = vec![0u8; COPY_BUF];
    let mut total = 0u64;
    loop {
        let n = record.read(&mut buf)?;
        if n == 0 {
            writer.flush()?;
            return Ok(total);
        }
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
}

/// Open/closed state shared by record implementations.
#[derive(Debug, Default)]
pub struct RecordState {
    closed: AtomicBool,
}

impl RecordState {
    /// Fails with `Closed` once the record has been closed.
    pub fn check(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Mark the record closed. Only the first call succeeds.
    pub fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Writer that stops accepting bytes once `limit` have been written.
///
/// With `limit == 0` writes pass through unbounded. Otherwise a write that
/// reaches or crosses the limit is truncated to fit and reported as
/// [`StoreError::WriteLimit`] carrying the bytes that were written.
#[derive(Debug)]
pub struct LimitedWriter<W> {
    inner: W,
    limit: u64,
    written: u64,
}

impl<W> LimitedWriter<W> {
    pub fn new(inner: W, limit: u64) -> Self {
        Self {
            inner,
            limit,
            written: 0,
        }
    }

    /// Total bytes accepted so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> LimitedWriter<W> {
    pub fn write(&mut self, buf: &[u8]) -> StoreResult<usize> {
        if self.limit == 0 {
            self.inner.write_all(buf)?;
            self.written += buf.len() as u64;
            return Ok(buf.len());
        }
        if self.written >= self.limit {
            return Err(StoreError::WriteLimit { written: 0 });
        }
        let remaining = self.limit - self.written;
        if (buf.len() as u64) < remaining {
            self.inner.write_all(buf)?;
            self.written += buf.len() as u64;
            return Ok(buf.len());
        }
        let take = remaining as usize;
        self.inner.write_all(&buf[..take])?;
        self.written += remaining;
        Err(StoreError::WriteLimit {
            written: remaining,
        })
    }
}

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::{FileInfo, LimitedWriter, Record, RecordState, Store, StoreError, StoreResult};

const DIR_MODE: u32 = 0o755;

/// Filesystem-backed store.
///
/// Layout: `<root>/<name>`, and `<root>/<partition>/<name>` for partitions.
/// Partition directories are created lazily on first create.
#[derive(Debug, Clone)]
pub struct FsStore {
    dir: PathBuf,
    limit: u64,
}

impl FsStore {
    pub fn new(dir: impl AsRef<Path>, limit: u64) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            limit,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn resolve(&self, op: &'static str, name: &str) -> StoreResult<PathBuf> {
        let bad = name.is_empty()
            || name == "."
            || name.contains("..")
            || name.contains('/')
            || name.contains('\\')
            || name.contains('\0');
        if bad {
            return Err(StoreError::path(op, name, StoreError::Invalid));
        }
        let path = self.dir.join(name);
        if path.is_dir() {
            return Err(StoreError::path(op, name, StoreError::Invalid));
        }
        Ok(path)
    }

    fn ensure_dir(&self) -> StoreResult<()> {
        if self.dir.is_dir() {
            return Ok(());
        }
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(DIR_MODE);
        }
        builder
            .create(&self.dir)
            .map_err(|e| StoreError::path("mkdir", self.dir.display().to_string(), e.into()))
    }
}

impl Store for FsStore {
    fn init(&self) -> StoreResult<()> {
        self.ensure_dir()
    }

    fn partition(&self, key: i64) -> Arc<dyn Store> {
        Arc::new(FsStore {
            dir: self.dir.join(key.to_string()),
            limit: self.limit,
        })
    }

    fn create(&self, name: &str) -> StoreResult<Box<dyn Record>> {
        let path = self.resolve("create", name)?;
        self.ensure_dir()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| StoreError::path("create", name, e.into()))?;
        Ok(Box::new(FileRecord::new(name, file, self.limit)))
    }

    fn open(&self, name: &str) -> StoreResult<Box<dyn Record>> {
        let path = self.resolve("open", name)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| StoreError::path("open", name, e.into()))?;
        Ok(Box::new(FileRecord::new(name, file, self.limit)))
    }

    fn remove(&self, name: &str) -> StoreResult<()> {
        let path = self.resolve("remove", name)?;
        fs::remove_file(&path).map_err(|e| StoreError::path("remove", name, e.into()))
    }

    fn stat(&self, name: &str) -> StoreResult<FileInfo> {
        let path = self.resolve("stat", name)?;
        let meta = fs::metadata(&path).map_err(|e| StoreError::path("stat", name, e.into()))?;
        Ok(FileInfo {
            name: name.to_string(),
            size: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    fn limit(&self) -> u64 {
        self.limit
    }
}

struct FileRecord {
    name: String,
    file: LimitedWriter<File>,
    state: RecordState,
}

impl FileRecord {
    fn new(name: &str, file: File, limit: u64) -> Self {
        Self {
            name: name.to_string(),
            file: LimitedWriter::new(file, limit),
            state: RecordState::default(),
        }
    }
}

impl Record for FileRecord {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, buf: &mut [u8]) -> StoreResult<usize> {
        self.state.check()?;
        Ok(self.file.get_mut().read(buf)?)
    }

    fn write(&mut self, buf: &[u8]) -> StoreResult<usize> {
        self.state.check()?;
        self.file.write(buf)
    }

    fn seek(&mut self, pos: SeekFrom) -> StoreResult<u64> {
        self.state.check()?;
        Ok(self.file.get_mut().seek(pos)?)
    }

    fn close(&mut self) -> StoreResult<()> {
        self.state.close()?;
        self.file.get_ref().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store(limit: u64) -> (tempfile::TempDir, FsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path().join("blobs"), limit);
        store.init().unwrap();
        (dir, store)
    }

    #[test]
    fn create_write_read_back() {
        let (_dir, store) = make_store(0);
        let mut rec = store.create("a.bin").unwrap();
        assert_eq!(rec.write(b"hello").unwrap(), 5);
        rec.close().unwrap();

        let mut rec = store.open("a.bin").unwrap();
        let mut buf = [0u8; 16];
        let n = rec.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");

        rec.seek(SeekFrom::Start(1)).unwrap();
        let n = rec.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ello");
        assert_eq!(store.stat("a.bin").unwrap().size, 5);
    }

    #[test]
    fn create_twice_is_exist() {
        let (_dir, store) = make_store(0);
        store.create("dup").unwrap().close().unwrap();
        let err = store.create("dup").err().unwrap();
        assert!(err.is_exist());
    }

    #[test]
    fn missing_blob_is_not_exist() {
        let (_dir, store) = make_store(0);
        assert!(store.open("nope").err().unwrap().is_not_exist());
        assert!(store.stat("nope").unwrap_err().is_not_exist());
        assert!(store.remove("nope").unwrap_err().is_not_exist());
    }

    #[test]
    fn bad_names_are_invalid() {
        let (dir, store) = make_store(0);
        std::fs::create_dir(dir.path().join("blobs").join("sub")).unwrap();
        for name in ["", ".", "..", "../etc", "a/b", "sub"] {
            let err = store.create(name).err().unwrap();
            assert!(err.is_invalid(), "{name:?} should be invalid");
        }
    }

    #[test]
    fn partition_is_created_lazily() {
        let (dir, store) = make_store(0);
        let part = store.partition(42);
        let part_dir = dir.path().join("blobs").join("42");
        assert!(!part_dir.exists());

        part.create("x").unwrap().close().unwrap();
        assert!(part_dir.join("x").is_file());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&part_dir).unwrap().permissions().mode();
            assert_eq!(mode & 0o700, DIR_MODE & 0o700);
        }
    }

    #[test]
    fn limit_applies_per_record() {
        let (_dir, store) = make_store(8);
        let mut rec = store.create("big").unwrap();
        let err = rec.write(&[0xA5; 16]).unwrap_err();
        assert_eq!(err.write_limit(), Some(8));
        assert_eq!(rec.write(b"x").unwrap_err().write_limit(), Some(0));
        rec.close().unwrap();
        assert_eq!(store.stat("big").unwrap().size, 8);
    }

    #[test]
    fn closed_record_refuses_everything() {
        let (_dir, store) = make_store(0);
        let mut rec = store.create("c").unwrap();
        rec.close().unwrap();
        let mut buf = [0u8; 1];
        assert!(rec.read(&mut buf).unwrap_err().is_closed());
        assert!(rec.write(b"x").unwrap_err().is_closed());
        assert!(rec.seek(SeekFrom::Start(0)).unwrap_err().is_closed());
        assert!(rec.close().unwrap_err().is_closed());
    }

    #[test]
    fn collect_then_place() {
        let (_dir, store) = make_store(0);
        let n = store.collect("blob", &mut &b"payload"[..]).unwrap();
        assert_eq!(n, 7);

        let mut out = Vec::new();
        assert_eq!(store.place("blob", &mut out).unwrap(), 7);
        assert_eq!(out, b"payload");
    }

    #[test]
    fn collect_over_limit_keeps_truncated_blob() {
        let (_dir, store) = make_store(8);
        let payload = [0xA5u8; 16];
        let err = store.collect("art", &mut &payload[..]).unwrap_err();
        assert_eq!(err.write_limit(), Some(8));
        assert_eq!(store.stat("art").unwrap().size, 8);
    }
}

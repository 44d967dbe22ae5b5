use std::io::{Read, SeekFrom, Write};
use std::sync::Arc;

use super::{FileInfo, Record, RecordState, Store, StoreError, StoreResult};

/// Store that discards writes and reads back zeroes. It never fails on its
/// own, which makes it a convenient sink for tests and dry runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStore;

impl Store for NullStore {
    fn init(&self) -> StoreResult<()> {
        Ok(())
    }

    fn partition(&self, _key: i64) -> Arc<dyn Store> {
        Arc::new(NullStore)
    }

    fn create(&self, name: &str) -> StoreResult<Box<dyn Record>> {
        Ok(Box::new(NullRecord::new(name)))
    }

    fn open(&self, name: &str) -> StoreResult<Box<dyn Record>> {
        Ok(Box::new(NullRecord::new(name)))
    }

    fn remove(&self, _name: &str) -> StoreResult<()> {
        Ok(())
    }

    fn stat(&self, name: &str) -> StoreResult<FileInfo> {
        Ok(FileInfo {
            name: name.to_string(),
            size: 0,
            modified: None,
        })
    }

    fn limit(&self) -> u64 {
        0
    }

    /// Drains `reader`, counting the bytes. Read errors are passed on.
    fn collect(&self, name: &str, reader: &mut dyn Read) -> StoreResult<u64> {
        std::io::copy(reader, &mut std::io::sink())
            .map_err(|e| StoreError::path("collect", name, e.into()))
    }

    /// Null blobs are empty when placed.
    fn place(&self, _name: &str, _writer: &mut dyn Write) -> StoreResult<u64> {
        Ok(0)
    }
}

/// Record over nothing. Reads fill the buffer with zeroes.
#[derive(Debug)]
pub struct NullRecord {
    name: String,
    offset: u64,
    state: RecordState,
}

impl NullRecord {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            offset: 0,
            state: RecordState::default(),
        }
    }
}

impl Record for NullRecord {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, buf: &mut [u8]) -> StoreResult<usize> {
        self.state.check()?;
        buf.fill(0);
        self.offset += buf.len() as u64;
        Ok(buf.len())
    }

    fn write(&mut self, buf: &[u8]) -> StoreResult<usize> {
        self.state.check()?;
        self.offset += buf.len() as u64;
        Ok(buf.len())
    }

    fn seek(&mut self, pos: SeekFrom) -> StoreResult<u64> {
        self.state.check()?;
        self.offset = match pos {
            SeekFrom::Start(n) => n,
            SeekFrom::Current(d) => self.offset.saturating_add_signed(d),
            SeekFrom::End(d) => 0u64.saturating_add_signed(d),
        };
        Ok(self.offset)
    }

    fn close(&mut self) -> StoreResult<()> {
        self.state.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_vanish_and_reads_are_zero() {
        let store = NullStore;
        let mut rec = store.create("x").unwrap();
        assert_eq!(rec.write(&[7; 64]).unwrap(), 64);

        let mut buf = [9u8; 8];
        assert_eq!(rec.read(&mut buf).unwrap(), 8);
        assert_eq!(buf, [0; 8]);
        assert_eq!(store.stat("x").unwrap().size, 0);
    }

    #[test]
    fn collect_counts_and_place_is_empty() {
        let store = NullStore.partition(3);
        assert_eq!(store.collect("a", &mut &[1u8; 40][..]).unwrap(), 40);
        let mut out = Vec::new();
        assert_eq!(store.place("a", &mut out).unwrap(), 0);
        store.remove("a").unwrap();
    }

    struct Broken;

    impl Read for Broken {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "unreadable"))
        }
    }

    #[test]
    fn collect_passes_read_errors_on() {
        let err = NullStore.collect("a", &mut Broken).unwrap_err();
        assert!(err.is_permission());
        assert!(err.to_string().contains("collect a"));
    }
}

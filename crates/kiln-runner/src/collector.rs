//! Artifact collection.
//!
//! Bytes read out of a build are streamed into the owner's store partition
//! under the artifact's opaque hash, and hashed with MD5 and SHA-256 on the
//! way through. The pending artifact row is completed once the blob is
//! stored.

use std::io::{self, Read};
use std::sync::Arc;

use async_trait::async_trait;
use kiln_core::store::{Store, StoreError};
use kiln_state::ArtifactStore;
use md5::Md5;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::driver::Collector;
use crate::error::TransferError;

/// Reader that feeds every byte it yields to both hashers.
pub struct HashingReader<'a> {
    inner: &'a mut (dyn Read + Send),
    md5: Md5,
    sha256: Sha256,
    read: u64,
}

impl<'a> HashingReader<'a> {
    pub fn new(inner: &'a mut (dyn Read + Send)) -> Self {
        Self {
            inner,
            md5: Md5::new(),
            sha256: Sha256::new(),
            read: 0,
        }
    }

    /// Bytes read so far with their hex MD5 and SHA-256 digests.
    pub fn finish(self) -> (u64, String, String) {
        (
            self.read,
            hex::encode(self.md5.finalize()),
            hex::encode(self.sha256.finalize()),
        )
    }
}

impl Read for HashingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.md5.update(&buf[..n]);
        self.sha256.update(&buf[..n]);
        self.read += n as u64;
        Ok(n)
    }
}

/// Collects the artifacts of one build.
pub struct ArtifactCollector {
    build_id: i64,
    artifacts: Arc<dyn ArtifactStore>,
    /// The build owner's partition.
    store: Arc<dyn Store>,
}

impl ArtifactCollector {
    pub fn new(build_id: i64, artifacts: Arc<dyn ArtifactStore>, store: Arc<dyn Store>) -> Self {
        Self {
            build_id,
            artifacts,
            store,
        }
    }
}

#[async_trait]
impl Collector for ArtifactCollector {
    #[instrument(skip(self, reader), fields(build_id = self.build_id))]
    async fn collect(
        &self,
        name: &str,
        reader: Box<dyn Read + Send>,
    ) -> Result<u64, TransferError> {
        let artifact = self
            .artifacts
            .find_artifact(self.build_id, name)
            .await?
            .ok_or_else(|| StoreError::path("collect", name, StoreError::NotExist))?;

        let store = self.store.clone();
        let hash = artifact.hash.clone();
        let (written, read, md5, sha256) = tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut tee = HashingReader::new(reader.as_mut());
            let written = store.collect(&hash, &mut tee);
            let (read, md5, sha256) = tee.finish();
            written.map(|n| (n, read, md5, sha256))
        })
        .await??;
        debug!(artifact_id = artifact.id, written, read, "artifact stored");

        self.artifacts
            .record_collected(artifact.id, written, &md5, &sha256)
            .await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_what_it_reads() {
        let mut src: &[u8] = b"abc";
        let mut tee = HashingReader::new(&mut src);
        let mut sink = Vec::new();
        io::copy(&mut tee, &mut sink).unwrap();
        let (n, md5, sha256) = tee.finish();
        assert_eq!(n, 3);
        assert_eq!(sink, b"abc");
        assert_eq!(md5, "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(
            sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}

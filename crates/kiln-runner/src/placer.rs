//! Object placement: the mirror image of artifact collection.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use kiln_core::store::{Store, StoreError};
use kiln_state::{BuildStore, ObjectStore};
use tracing::{debug, instrument};

use crate::driver::Placer;
use crate::error::TransferError;

/// Places the objects attached to one build. Object blobs live in their
/// owner's partition of `store`, named by the object hash.
pub struct ObjectPlacer {
    build_id: i64,
    builds: Arc<dyn BuildStore>,
    objects: Arc<dyn ObjectStore>,
    store: Arc<dyn Store>,
}

impl ObjectPlacer {
    pub fn new(
        build_id: i64,
        builds: Arc<dyn BuildStore>,
        objects: Arc<dyn ObjectStore>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            build_id,
            builds,
            objects,
            store,
        }
    }
}

#[async_trait]
impl Placer for ObjectPlacer {
    #[instrument(skip(self, writer), fields(build_id = self.build_id))]
    async fn place(
        &self,
        name: &str,
        writer: Box<dyn Write + Send>,
    ) -> Result<u64, TransferError> {
        let not_exist = || StoreError::path("place", name, StoreError::NotExist);
        // One object may be placed at several destinations; take the first
        // link not yet placed.
        let links: Vec<_> = self
            .builds
            .build_objects(self.build_id)
            .await?
            .into_iter()
            .filter(|o| o.source == name)
            .collect();
        let link = links
            .iter()
            .find(|o| !o.placed)
            .or_else(|| links.first())
            .cloned()
            .ok_or_else(not_exist)?;
        let object_id = link.object_id.ok_or_else(not_exist)?;
        let object = self.objects.get_object(object_id).await?;

        let partition = self.store.partition(object.user_id);
        let hash = object.hash.clone();
        let n = tokio::task::spawn_blocking(move || {
            let mut writer = writer;
            partition.place(&hash, &mut writer)
        })
        .await??;
        self.builds.mark_object_placed(link.id).await?;
        debug!(object_id, bytes = n, "object placed");
        Ok(n)
    }
}

/// Placer for builds without objects.
pub struct NoObjects;

#[async_trait]
impl Placer for NoObjects {
    async fn place(
        &self,
        name: &str,
        _writer: Box<dyn Write + Send>,
    ) -> Result<u64, TransferError> {
        Err(StoreError::path("place", name, StoreError::NotExist).into())
    }
}

//! Kiln-State: data model and persistence for Kiln CI
//!
//! ## Layer 0 - Data/Persistence
//!
//! Entities reference each other by numeric id. Every aggregate is reached
//! through an async storage trait; `fakes::MemoryState` and `SurrealHandle`
//! both implement all of them.
//!
//! ## Key Components
//!
//! - `model`: builds, stages, jobs, artifacts, crons, namespaces, webhooks,
//!   deliveries and the codecs they rely on (status, passthrough, headers,
//!   event bitmask)
//! - `storage_traits`: `BuildStore`, `ArtifactStore`, `CronStore`,
//!   `HookStore`, `DeliveryLog`, ...
//! - `SurrealHandle`: SurrealDB connection implementing every trait

mod error;
pub mod fakes;
pub mod model;
pub mod storage_traits;
pub mod surreal;

pub use error::{StateError, StorageError};
pub use storage_traits::{
    ArtifactStore, BuildStore, CronStore, DeliveryLog, HookStore, KilnStore, NamespaceStore,
    ObjectStore, StorageResult, UserStore,
};
pub use surreal::{CloudConfig, SurrealHandle};

/// Result type for kiln-state operations
pub type Result<T> = std::result::Result<T, StateError>;

/// Mint an opaque token, used for build secrets and artifact blob names.
pub(crate) fn new_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

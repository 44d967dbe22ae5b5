//! Kiln Core Library
//!
//! ## Layer 1 - Domain
//!
//! Turns manifests into persisted builds, hands them to driver queues,
//! schedules cron builds, delivers signed webhook events and keeps the
//! artifact store within quota. Persistence goes through the `kiln-state`
//! traits; blob storage goes through [`store::Store`].

pub mod build;
pub mod config;
pub mod cron;
pub mod curator;
pub mod error;
pub mod event;
pub mod hook;
pub mod manifest;
pub mod obs;
pub mod queue;
pub mod store;
pub mod telemetry;

pub use build::{plan, BuildRequest, Creator, CLONE_STAGE};
pub use config::KilnConfig;
pub use cron::{Batch, ErrorHandler, Scheduler};
pub use curator::{CurateReport, Curator};
pub use error::{BlobError, CurateError, HookError, KilnError, Result, ValidationError};
pub use event::{Dispatcher, EventBus, MultiDispatcher};
pub use hook::HookDispatcher;
pub use manifest::{Driver, Manifest, ManifestJob, Source, DRIVERS};
pub use queue::{MemoryQueue, Queue, QueueRegistry, Submitter, Task, RUN_BUILD};
pub use store::{
    FileInfo, FsStore, LimitedWriter, NullStore, Record, Store, StoreError, StoreResult,
};

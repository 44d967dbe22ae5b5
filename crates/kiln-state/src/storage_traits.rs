//! Storage trait definitions for Kiln
//!
//! One trait per aggregate:
//! - `BuildStore`: builds and everything a build owns
//! - `ArtifactStore`: artifact rows filled in by the collector and curator
//! - `ObjectStore`: user objects placed into builds
//! - `UserStore`: users and their cleanup preference
//! - `CronStore`: cron rows, due-row paging and the cron/build link
//! - `NamespaceStore`: namespace tree
//! - `HookStore`: webhooks bound to root namespaces
//! - `DeliveryLog`: append-only record of webhook attempts
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StorageError;
use crate::model::*;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// BuildStore
// ---------------------------------------------------------------------------

/// Build persistence.
///
/// Guarantees:
/// - `create_build` writes the build and all of its children at once; the
///   build starts `Queued`.
/// - Build and job statuses only move Queued → Running → terminal. A
///   rejected move returns `StorageError::InvalidTransition`.
/// - Tags are unique per build.
#[async_trait]
pub trait BuildStore: Send + Sync {
    /// Persist a new build with its trigger, tags, stages, jobs, pending
    /// artifacts, objects, variables and keys.
    async fn create_build(&self, new: NewBuild) -> StorageResult<Build>;

    async fn get_build(&self, id: i64) -> StorageResult<Build>;

    /// Move the build to `status`, stamping `started_at` on Running and
    /// `finished_at` on a terminal status.
    async fn set_build_status(
        &self,
        id: i64,
        status: Status,
        output: Option<String>,
    ) -> StorageResult<Build>;

    /// Stages of a build in creation order.
    async fn stages(&self, build_id: i64) -> StorageResult<Vec<Stage>>;

    /// Jobs of a build in creation order.
    async fn jobs(&self, build_id: i64) -> StorageResult<Vec<Job>>;

    async fn update_job(&self, job_id: i64, update: JobUpdate) -> StorageResult<Job>;

    async fn trigger(&self, build_id: i64) -> StorageResult<Trigger>;

    async fn tags(&self, build_id: i64) -> StorageResult<Vec<Tag>>;

    /// Tag a build. Returns `StorageError::Conflict` if the tag exists.
    async fn add_tag(&self, build_id: i64, user_id: i64, name: &str) -> StorageResult<Tag>;

    async fn build_objects(&self, build_id: i64) -> StorageResult<Vec<BuildObject>>;

    async fn mark_object_placed(&self, build_object_id: i64) -> StorageResult<()>;

    async fn variables(&self, build_id: i64) -> StorageResult<Vec<Variable>>;

    async fn keys(&self, build_id: i64) -> StorageResult<Vec<Key>>;
}

// ---------------------------------------------------------------------------
// ArtifactStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn artifacts(&self, build_id: i64) -> StorageResult<Vec<Artifact>>;

    /// Live artifact of `build_id` with the given external name.
    async fn find_artifact(&self, build_id: i64, name: &str) -> StorageResult<Option<Artifact>>;

    /// Fill in the digest columns once the blob has been written.
    async fn record_collected(
        &self,
        artifact_id: i64,
        size: u64,
        md5: &str,
        sha256: &str,
    ) -> StorageResult<()>;

    /// Live artifacts of a user, oldest first.
    async fn user_artifacts(&self, user_id: i64) -> StorageResult<Vec<Artifact>>;

    /// Tombstone artifacts whose bytes were reclaimed: size becomes 0, the
    /// digests are cleared and `deleted_at` is set.
    async fn zero_out_artifacts(&self, ids: &[i64], at: DateTime<Utc>) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// ObjectStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn create_object(&self, new: NewObject) -> StorageResult<Object>;

    async fn get_object(&self, id: i64) -> StorageResult<Object>;

    async fn find_object(&self, user_id: i64, name: &str) -> StorageResult<Option<Object>>;
}

// ---------------------------------------------------------------------------
// UserStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create_user(&self, new: NewUser) -> StorageResult<User>;

    async fn get_user(&self, id: i64) -> StorageResult<User>;

    /// Users with the given ids. Unknown ids are skipped.
    async fn get_users(&self, ids: &[i64]) -> StorageResult<Vec<User>>;

    /// Users that opted in to artifact cleanup.
    async fn cleanup_users(&self) -> StorageResult<Vec<User>>;
}

// ---------------------------------------------------------------------------
// CronStore
// ---------------------------------------------------------------------------

/// Cron persistence.
///
/// Guarantees:
/// - A new cron's `next_run` is `schedule.next(created_at)`.
/// - `due_crons` pages by id, so rows advanced between pages are never
///   skipped or seen twice within one sweep.
#[async_trait]
pub trait CronStore: Send + Sync {
    async fn create_cron(&self, new: NewCron) -> StorageResult<Cron>;

    async fn get_cron(&self, id: i64) -> StorageResult<Cron>;

    /// Number of crons with `next_run <= now`.
    async fn count_due(&self, now: DateTime<Utc>) -> StorageResult<u64>;

    /// Up to `limit` due crons with an id greater than `after_id`, ordered
    /// by id.
    async fn due_crons(
        &self,
        now: DateTime<Utc>,
        after_id: i64,
        limit: usize,
    ) -> StorageResult<Vec<Cron>>;

    /// Set `prev_run` and `next_run` in one write.
    async fn record_cron_run(
        &self,
        id: i64,
        prev_run: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> StorageResult<Cron>;

    async fn link_cron_build(&self, cron_id: i64, build_id: i64) -> StorageResult<()>;

    /// Ids of builds created by a cron, oldest first.
    async fn cron_builds(&self, cron_id: i64) -> StorageResult<Vec<i64>>;
}

// ---------------------------------------------------------------------------
// NamespaceStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait NamespaceStore: Send + Sync {
    /// Create a namespace. A child inherits the root of its parent and its
    /// path is `parent.path/name`.
    async fn create_namespace(&self, new: NewNamespace) -> StorageResult<Namespace>;

    async fn get_namespace(&self, id: i64) -> StorageResult<Namespace>;

    async fn add_collaborator(&self, namespace_id: i64, user_id: i64) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// HookStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait HookStore: Send + Sync {
    async fn create_webhook(&self, new: NewWebhook) -> StorageResult<Webhook>;

    async fn get_webhook(&self, id: i64) -> StorageResult<Webhook>;

    /// Webhooks of a namespace, ordered by id.
    async fn webhooks(&self, namespace_id: i64, active_only: bool) -> StorageResult<Vec<Webhook>>;
}

// ---------------------------------------------------------------------------
// DeliveryLog
// ---------------------------------------------------------------------------

/// Append-only webhook delivery log.
///
/// Guarantees:
/// - At most one row per `(webhook_id, event_id)` has `redelivery = false`;
///   `append_delivery` forces the flag on when an original already exists.
/// - Rows are never updated or deleted.
#[async_trait]
pub trait DeliveryLog: Send + Sync {
    async fn append_delivery(&self, new: NewDelivery) -> StorageResult<Delivery>;

    /// The first delivery of `event_id` to `webhook_id`.
    async fn original_delivery(
        &self,
        webhook_id: i64,
        event_id: Uuid,
    ) -> StorageResult<Option<Delivery>>;

    /// Every delivery to a webhook, oldest first.
    async fn deliveries(&self, webhook_id: i64) -> StorageResult<Vec<Delivery>>;

    async fn get_delivery(&self, id: i64) -> StorageResult<Delivery>;
}

/// Everything the daemon needs from one backend.
pub trait KilnStore:
    BuildStore
    + ArtifactStore
    + ObjectStore
    + UserStore
    + CronStore
    + NamespaceStore
    + HookStore
    + DeliveryLog
{
}

impl<T> KilnStore for T where
    T: BuildStore
        + ArtifactStore
        + ObjectStore
        + UserStore
        + CronStore
        + NamespaceStore
        + HookStore
        + DeliveryLog
{
}

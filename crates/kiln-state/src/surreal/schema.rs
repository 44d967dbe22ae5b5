//! Row types for the Kiln SurrealDB tables
//!
//! Every row carries the SurrealDB record id plus its own numeric key
//! (`build_id`, `job_id`, ...) minted from the `sequences` table. Rows are
//! converted to the `model` types at the storage boundary.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::model::*;
use crate::storage_traits::StorageResult;

/// Module for serializing chrono DateTime to SurrealDB datetime format
pub(crate) mod surreal_dt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format
pub(crate) mod surreal_dt_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = date.map(SurrealDatetime::from);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

fn decode<T, E: std::fmt::Display>(r: Result<T, E>) -> StorageResult<T> {
    r.map_err(|e| StorageError::Backend(e.to_string()))
}

/// Counter row in the `sequences` table, one per table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceRow {
    pub counter: i64,
}

/// Result row of a `count()` query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountRow {
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub build_id: i64,
    pub user_id: i64,
    pub namespace_id: Option<i64>,
    pub manifest: String,
    pub status: String,
    pub output: Option<String>,
    pub secret: String,
    #[serde(with = "surreal_dt")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "surreal_dt_opt")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "surreal_dt_opt")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl BuildRow {
    pub fn into_model(self) -> StorageResult<Build> {
        Ok(Build {
            id: self.build_id,
            user_id: self.user_id,
            namespace_id: self.namespace_id,
            manifest: self.manifest,
            status: decode(self.status.parse())?,
            output: self.output,
            secret: self.secret,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub trigger_id: i64,
    pub build_id: i64,
    pub kind: String,
    pub comment: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(with = "surreal_dt")]
    pub created_at: DateTime<Utc>,
}

impl TriggerRow {
    pub fn into_model(self) -> StorageResult<Trigger> {
        Ok(Trigger {
            id: self.trigger_id,
            build_id: self.build_id,
            kind: decode(self.kind.parse())?,
            comment: self.comment,
            data: self.data,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub tag_id: i64,
    pub build_id: i64,
    pub user_id: i64,
    pub name: String,
    #[serde(with = "surreal_dt")]
    pub created_at: DateTime<Utc>,
}

impl From<TagRow> for Tag {
    fn from(r: TagRow) -> Self {
        Tag {
            id: r.tag_id,
            build_id: r.build_id,
            user_id: r.user_id,
            name: r.name,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub stage_id: i64,
    pub build_id: i64,
    pub name: String,
    pub can_fail: bool,
    #[serde(with = "surreal_dt")]
    pub created_at: DateTime<Utc>,
}

impl From<StageRow> for Stage {
    fn from(r: StageRow) -> Self {
        Stage {
            id: r.stage_id,
            build_id: r.build_id,
            name: r.name,
            can_fail: r.can_fail,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub job_id: i64,
    pub build_id: i64,
    pub stage_id: i64,
    pub name: String,
    pub commands: Vec<String>,
    #[serde(default)]
    pub depends: Vec<String>,
    pub status: String,
    pub output: Option<String>,
    #[serde(with = "surreal_dt")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "surreal_dt_opt")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "surreal_dt_opt")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRow {
    pub fn into_model(self) -> StorageResult<Job> {
        Ok(Job {
            id: self.job_id,
            build_id: self.build_id,
            stage_id: self.stage_id,
            name: self.name,
            commands: self.commands,
            depends: self.depends,
            status: decode(self.status.parse())?,
            output: self.output,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub artifact_id: i64,
    pub user_id: i64,
    pub build_id: i64,
    pub job_id: i64,
    pub hash: String,
    pub source: String,
    pub name: String,
    pub size: Option<u64>,
    pub md5: Option<String>,
    pub sha256: Option<String>,
    #[serde(with = "surreal_dt")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "surreal_dt_opt")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl From<ArtifactRow> for Artifact {
    fn from(r: ArtifactRow) -> Self {
        Artifact {
            id: r.artifact_id,
            user_id: r.user_id,
            build_id: r.build_id,
            job_id: r.job_id,
            hash: r.hash,
            source: r.source,
            name: r.name,
            size: r.size,
            md5: r.md5,
            sha256: r.sha256,
            created_at: r.created_at,
            deleted_at: r.deleted_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub object_id: i64,
    pub user_id: i64,
    pub namespace_id: Option<i64>,
    pub hash: String,
    pub name: String,
    pub size: u64,
    pub md5: String,
    pub sha256: String,
    #[serde(with = "surreal_dt")]
    pub created_at: DateTime<Utc>,
}

impl From<ObjectRow> for Object {
    fn from(r: ObjectRow) -> Self {
        Object {
            id: r.object_id,
            user_id: r.user_id,
            namespace_id: r.namespace_id,
            hash: r.hash,
            name: r.name,
            size: r.size,
            md5: r.md5,
            sha256: r.sha256,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildObjectRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub build_object_id: i64,
    pub build_id: i64,
    pub object_id: Option<i64>,
    pub source: String,
    pub name: String,
    pub placed: bool,
    #[serde(with = "surreal_dt")]
    pub created_at: DateTime<Utc>,
}

impl From<BuildObjectRow> for BuildObject {
    fn from(r: BuildObjectRow) -> Self {
        BuildObject {
            id: r.build_object_id,
            build_id: r.build_id,
            object_id: r.object_id,
            source: r.source,
            name: r.name,
            placed: r.placed,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub variable_id: i64,
    pub build_id: i64,
    pub name: String,
    pub value: String,
    pub masked: bool,
}

impl From<VariableRow> for Variable {
    fn from(r: VariableRow) -> Self {
        Variable {
            id: r.variable_id,
            build_id: r.build_id,
            key: r.name,
            value: r.value,
            masked: r.masked,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub key_id: i64,
    pub build_id: i64,
    pub name: String,
    pub private_key: String,
    pub config: String,
}

impl From<KeyRow> for Key {
    fn from(r: KeyRow) -> Self {
        Key {
            id: r.key_id,
            build_id: r.build_id,
            name: r.name,
            key: r.private_key,
            config: r.config,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub user_id: i64,
    pub username: String,
    pub email: String,
    pub cleanup: bool,
    #[serde(with = "surreal_dt")]
    pub created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(r: UserRow) -> Self {
        User {
            id: r.user_id,
            username: r.username,
            email: r.email,
            cleanup: r.cleanup,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub cron_id: i64,
    pub user_id: i64,
    pub namespace_id: Option<i64>,
    pub name: String,
    pub schedule: String,
    pub manifest: String,
    #[serde(default, with = "surreal_dt_opt")]
    pub prev_run: Option<DateTime<Utc>>,
    #[serde(with = "surreal_dt")]
    pub next_run: DateTime<Utc>,
    #[serde(with = "surreal_dt")]
    pub created_at: DateTime<Utc>,
}

impl CronRow {
    pub fn into_model(self) -> StorageResult<Cron> {
        Ok(Cron {
            id: self.cron_id,
            user_id: self.user_id,
            namespace_id: self.namespace_id,
            name: self.name,
            schedule: decode(self.schedule.parse())?,
            manifest: self.manifest,
            prev_run: self.prev_run,
            next_run: self.next_run,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronBuildRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub cron_id: i64,
    pub build_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub namespace_id: i64,
    pub user_id: i64,
    pub root_id: Option<i64>,
    pub parent_id: Option<i64>,
    pub name: String,
    pub path: String,
    pub description: String,
    pub visibility: Visibility,
    #[serde(default)]
    pub collaborators: Vec<i64>,
    #[serde(with = "surreal_dt")]
    pub created_at: DateTime<Utc>,
}

impl From<NamespaceRow> for Namespace {
    fn from(r: NamespaceRow) -> Self {
        Namespace {
            id: r.namespace_id,
            user_id: r.user_id,
            root_id: r.root_id,
            parent_id: r.parent_id,
            name: r.name,
            path: r.path,
            description: r.description,
            visibility: r.visibility,
            collaborators: r.collaborators,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub webhook_id: i64,
    pub user_id: i64,
    pub namespace_id: i64,
    pub payload_url: String,
    pub secret: Option<String>,
    pub ssl: bool,
    pub events: u32,
    pub active: bool,
    #[serde(with = "surreal_dt")]
    pub created_at: DateTime<Utc>,
}

impl From<WebhookRow> for Webhook {
    fn from(r: WebhookRow) -> Self {
        Webhook {
            id: r.webhook_id,
            user_id: r.user_id,
            namespace_id: r.namespace_id,
            payload_url: r.payload_url,
            secret: r.secret,
            ssl: r.ssl,
            events: EventMask::from_bits(r.events),
            active: r.active,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub delivery_id: i64,
    pub webhook_id: i64,
    pub event_id: String,
    pub event_type: String,
    pub error: Option<String>,
    pub redelivery: bool,
    pub request_headers: String,
    pub request_body: String,
    pub response_code: Option<u16>,
    pub response_headers: Option<String>,
    pub response_body: Option<String>,
    #[serde(default)]
    pub response_truncated: bool,
    pub duration_ms: u64,
    #[serde(with = "surreal_dt")]
    pub created_at: DateTime<Utc>,
}

impl DeliveryRow {
    pub fn new(delivery_id: i64, d: NewDelivery) -> Self {
        DeliveryRow {
            id: None,
            delivery_id,
            webhook_id: d.webhook_id,
            event_id: d.event_id.to_string(),
            event_type: d.event_type.as_str().to_string(),
            error: d.error,
            redelivery: d.redelivery,
            request_headers: d.request_headers.encode(),
            request_body: d.request_body,
            response_code: d.response_code,
            response_headers: d.response_headers.map(|h| h.encode()),
            response_body: d.response_body,
            response_truncated: d.response_truncated,
            duration_ms: d.duration_ms,
            created_at: Utc::now(),
        }
    }

    pub fn into_model(self) -> StorageResult<Delivery> {
        Ok(Delivery {
            id: self.delivery_id,
            webhook_id: self.webhook_id,
            event_id: decode(self.event_id.parse())?,
            event_type: decode(self.event_type.parse())?,
            error: self.error,
            redelivery: self.redelivery,
            request_headers: Headers::decode(&self.request_headers),
            request_body: self.request_body,
            response_code: self.response_code,
            response_headers: self.response_headers.as_deref().map(Headers::decode),
            response_body: self.response_body,
            response_truncated: self.response_truncated,
            duration_ms: self.duration_ms,
            created_at: self.created_at,
        })
    }
}

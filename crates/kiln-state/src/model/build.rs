//! Builds and everything a build owns.
//!
//! Entities reference each other through numeric ids only. A build owns its
//! stages, jobs, artifacts, trigger, tags, objects, variables and keys; none
//! of them hold a pointer back to their parent.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::passthrough::Passthrough;
use super::status::Status;

/// Column at which a trigger comment title is cut.
pub const COMMENT_TITLE_WIDTH: usize = 72;

const ELLIPSIS: &str = "...";

/// A single invocation of a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: i64,
    pub user_id: i64,
    pub namespace_id: Option<i64>,
    /// Manifest text, kept verbatim.
    pub manifest: String,
    pub status: Status,
    pub output: Option<String>,
    /// Token authenticating runner callbacks for this build.
    pub secret: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// The view of a build published to event subscribers. Webhook endpoints
/// are outside parties, so the callback secret is left out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildEvent {
    pub id: i64,
    pub user_id: i64,
    pub namespace_id: Option<i64>,
    pub manifest: String,
    pub status: Status,
    pub output: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Build> for BuildEvent {
    fn from(build: &Build) -> Self {
        Self {
            id: build.id,
            user_id: build.user_id,
            namespace_id: build.namespace_id,
            manifest: build.manifest.clone(),
            status: build.status,
            output: build.output.clone(),
            created_at: build.created_at,
            started_at: build.started_at,
            finished_at: build.finished_at,
        }
    }
}

/// Why a build was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Push,
    Pull,
    Schedule,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Manual => "manual",
            TriggerKind::Push => "push",
            TriggerKind::Pull => "pull",
            TriggerKind::Schedule => "schedule",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TriggerKind::Manual),
            "push" => Ok(TriggerKind::Push),
            "pull" => Ok(TriggerKind::Pull),
            "schedule" => Ok(TriggerKind::Schedule),
            other => Err(format!("unknown trigger type: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: i64,
    pub build_id: i64,
    pub kind: TriggerKind,
    pub comment: String,
    pub data: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Trigger {
    /// First line of the comment. Lines longer than the title width are cut
    /// and end with an ellipsis.
    pub fn comment_title(&self) -> String {
        split_comment(&self.comment).0
    }

    /// Everything after the title. When the title was cut the body starts
    /// with an ellipsis followed by the remainder of the comment.
    pub fn comment_body(&self) -> String {
        split_comment(&self.comment).1
    }
}

fn split_comment(comment: &str) -> (String, String) {
    let first_line = comment.split('\n').next().unwrap_or("");
    if first_line.chars().count() > COMMENT_TITLE_WIDTH {
        let cut = comment
            .char_indices()
            .nth(COMMENT_TITLE_WIDTH)
            .map(|(i, _)| i)
            .unwrap_or(comment.len());
        let title = format!("{}{}", &comment[..cut], ELLIPSIS);
        let body = format!("{}{}", ELLIPSIS, comment[cut..].trim_end());
        return (title, body);
    }
    let body = comment[first_line.len()..].trim().to_string();
    (first_line.trim_end_matches('\r').to_string(), body)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: i64,
    pub build_id: i64,
    pub user_id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Named group of jobs, ordered within its build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub id: i64,
    pub build_id: i64,
    pub name: String,
    pub can_fail: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub build_id: i64,
    pub stage_id: i64,
    pub name: String,
    pub commands: Vec<String>,
    /// Names of jobs that must complete before this one starts.
    pub depends: Vec<String>,
    pub status: Status,
    pub output: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Partial update applied to a job as it runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<Status>,
    pub output: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A file collected out of a build environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: i64,
    pub user_id: i64,
    pub build_id: i64,
    pub job_id: i64,
    /// Opaque blob name, minted before any bytes exist.
    pub hash: String,
    /// Producer path inside the build environment.
    pub source: String,
    /// Externally visible file name.
    pub name: String,
    pub size: Option<u64>,
    pub md5: Option<String>,
    pub sha256: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Artifact {
    pub fn is_collected(&self) -> bool {
        self.sha256.is_some()
    }
}

/// User-owned data that can be placed into builds by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    pub id: i64,
    pub user_id: i64,
    pub namespace_id: Option<i64>,
    pub hash: String,
    pub name: String,
    pub size: u64,
    pub md5: String,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewObject {
    pub user_id: i64,
    pub namespace_id: Option<i64>,
    pub hash: String,
    pub name: String,
    pub size: u64,
    pub md5: String,
    pub sha256: String,
}

/// Association of an object with a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildObject {
    pub id: i64,
    pub build_id: i64,
    pub object_id: Option<i64>,
    /// Object name as written in the manifest.
    pub source: String,
    /// Destination inside the build environment.
    pub name: String,
    pub placed: bool,
    pub created_at: DateTime<Utc>,
}

/// Environment variable copied into a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub id: i64,
    pub build_id: i64,
    pub key: String,
    pub value: String,
    pub masked: bool,
}

/// SSH key copied into a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub id: i64,
    pub build_id: i64,
    /// File name the key is exposed under.
    pub name: String,
    /// Private key material.
    pub key: String,
    /// Companion block appended to the generated ssh config.
    pub config: String,
}

// ---------------------------------------------------------------------------
// Creation payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct NewTrigger {
    pub kind: TriggerKind,
    pub comment: String,
    pub data: BTreeMap<String, String>,
}

impl NewTrigger {
    pub fn new(kind: TriggerKind, comment: impl Into<String>) -> Self {
        Self {
            kind,
            comment: comment.into(),
            data: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub name: String,
    pub commands: Vec<String>,
    pub depends: Vec<String>,
    pub artifacts: Passthrough,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewStage {
    pub name: String,
    pub can_fail: bool,
    pub jobs: Vec<NewJob>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBuildObject {
    pub object_id: Option<i64>,
    pub source: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVariable {
    pub key: String,
    pub value: String,
    pub masked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewKey {
    pub name: String,
    pub key: String,
    pub config: String,
}

/// Everything needed to persist a build in one call. The store assigns ids,
/// the build secret and one artifact hash per artifact mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBuild {
    pub user_id: i64,
    pub namespace_id: Option<i64>,
    pub manifest: String,
    pub trigger: NewTrigger,
    pub tags: Vec<String>,
    pub stages: Vec<NewStage>,
    pub objects: Vec<NewBuildObject>,
    pub variables: Vec<NewVariable>,
    pub keys: Vec<NewKey>,
}

//! Domain-level error taxonomy for Kiln.

use kiln_state::StorageError;

use crate::store::StoreError;

/// A manifest or schedule rejected at parse time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid yaml: {0}")]
    Yaml(String),

    #[error("unsupported yaml {feature} on line {line}")]
    UnsupportedYaml { feature: &'static str, line: usize },

    #[error("driver type is required")]
    MissingDriverType,

    #[error("unknown driver: {0}")]
    UnknownDriver(String),

    #[error("{driver} driver requires {field}")]
    MissingDriverField {
        driver: &'static str,
        field: &'static str,
    },

    #[error("driver {key} must be a scalar")]
    DriverValue { key: String },

    #[error("at least one stage is required")]
    NoStages,

    #[error("duplicate stage: {0}")]
    DuplicateStage(String),

    #[error("job {job} references undeclared stage {stage}")]
    UnknownStage { job: String, stage: String },

    #[error("allowed failure references undeclared stage {0}")]
    UnknownAllowedFailure(String),

    #[error("duplicate job {name} in stage {stage}")]
    DuplicateJob { stage: String, name: String },

    #[error("job {job} depends on unknown job {dependency}")]
    UnknownDependency { job: String, dependency: String },

    #[error("artifact {0} is published more than once")]
    DuplicateArtifact(String),

    #[error("object destination {0} is used more than once")]
    DuplicateObjectDestination(String),

    #[error("invalid env entry {0:?}, expected KEY=VALUE")]
    InvalidEnv(String),

    #[error("invalid source {0:?}")]
    InvalidSource(String),

    #[error("unknown object: {0}")]
    UnknownObject(String),

    #[error("unknown schedule: {0}")]
    UnknownSchedule(String),
}

/// Kiln domain errors.
#[derive(Debug, thiserror::Error)]
pub enum KilnError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("hook error: {0}")]
    Hook(#[from] HookError),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("cron {cron_id} owner {user_id} not found")]
    CronOwner { cron_id: i64, user_id: i64 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for Kiln domain operations.
pub type Result<T> = std::result::Result<T, KilnError>;

/// Webhook dispatch failures. Transport errors are not among them: those
/// are recorded in the delivery log and swallowed.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("no original delivery of event {event_id} to webhook {webhook_id}")]
    NotFound {
        webhook_id: i64,
        event_id: uuid::Uuid,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http client: {0}")]
    Client(String),

    #[error("signature: {0}")]
    Signature(String),
}

/// A blob the curator failed to remove.
#[derive(Debug)]
pub struct BlobError {
    pub user_id: i64,
    pub artifact_id: i64,
    pub error: StoreError,
}

impl std::fmt::Display for BlobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "artifact {} (user {}): {}",
            self.artifact_id, self.user_id, self.error
        )
    }
}

/// Curation failures.
#[derive(Debug, thiserror::Error)]
pub enum CurateError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to remove {} blob(s): {}", .0.len(), join_errors(.0))]
    Blobs(Vec<BlobError>),

    #[error("blob removal task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

fn join_errors(errors: &[BlobError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_display() {
        let err = ValidationError::MissingDriverField {
            driver: "docker",
            field: "workspace",
        };
        assert_eq!(err.to_string(), "docker driver requires workspace");

        let err = KilnError::from(ValidationError::NoStages);
        assert!(err.to_string().contains("at least one stage"));
    }

    #[test]
    fn curate_error_lists_every_blob() {
        let err = CurateError::Blobs(vec![
            BlobError {
                user_id: 1,
                artifact_id: 10,
                error: StoreError::Permission,
            },
            BlobError {
                user_id: 1,
                artifact_id: 11,
                error: StoreError::Invalid,
            },
        ]);
        let msg = err.to_string();
        assert!(msg.contains("2 blob(s)"));
        assert!(msg.contains("artifact 10"));
        assert!(msg.contains("artifact 11"));
    }
}

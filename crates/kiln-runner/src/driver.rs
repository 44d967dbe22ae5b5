//! Driver abstraction.
//!
//! A driver owns one build environment: it is created once per build,
//! executes jobs (possibly several at a time) and is destroyed when the
//! build ends. Drivers are instantiated by type through a
//! [`DriverRegistry`].

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use async_trait::async_trait;
pub use kiln_core::manifest::Driver as DriverSpec;
use kiln_state::model::{Passthrough, Status};
use tokio::sync::RwLock;

use crate::error::{DriverError, TransferError};
use crate::keychain::KeyChain;
use crate::output::Output;

/// Receives artifact bytes read out of a build environment.
///
/// Readers and writers are handed over by value so implementations can move
/// the blocking copy off the async runtime.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Store the artifact published as `name`. Returns the bytes stored.
    async fn collect(
        &self,
        name: &str,
        reader: Box<dyn Read + Send>,
    ) -> Result<u64, TransferError>;
}

/// Supplies object bytes to a build environment.
#[async_trait]
pub trait Placer: Send + Sync {
    /// Stream the object named `name` into `writer`. Returns the bytes
    /// written.
    async fn place(
        &self,
        name: &str,
        writer: Box<dyn Write + Send>,
    ) -> Result<u64, TransferError>;
}

/// Everything a driver needs to bring up a build environment.
#[derive(Clone)]
pub struct Environment {
    /// `KEY=VALUE` pairs exported to every job.
    pub env: Vec<String>,
    /// Objects to place, by object name to guest path.
    pub objects: Passthrough,
    pub placer: Arc<dyn Placer>,
    pub keys: KeyChain,
    /// Build-level output.
    pub output: Output,
}

/// A job as seen by a driver. The driver reports its outcome by setting
/// `status` and appending to `errors`.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub name: String,
    pub commands: Vec<String>,
    /// Guest path to published artifact name.
    pub artifacts: Passthrough,
    pub output: Output,
    pub status: Status,
    pub errors: Vec<String>,
}

impl Job {
    pub fn new(id: i64, name: impl Into<String>, commands: Vec<String>, output: Output) -> Self {
        Self {
            id,
            name: name.into(),
            commands,
            artifacts: Passthrough::new(),
            output,
            status: Status::Queued,
            errors: Vec::new(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Passthrough) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Mark the job failed with `status`, recording `error` in the job and
    /// its output.
    pub fn fail(&mut self, status: Status, error: impl Into<String>) {
        let error = error.into();
        self.output.line(&format!("error: {error}"));
        self.errors.push(error);
        if self.status < status {
            self.status = status;
        }
    }
}

#[async_trait]
pub trait Driver: Send + Sync {
    /// Bring up the environment: export `env`, place objects, install keys.
    async fn create(&self, env: Environment) -> Result<(), DriverError>;

    /// Run `job` and collect its artifacts. Never fails; the outcome is the
    /// job's status.
    async fn execute(&self, job: &mut Job, collector: Arc<dyn Collector>);

    /// Tear the environment down. Safe to call when `create` failed.
    async fn destroy(&self) -> Result<(), DriverError>;
}

/// Builds a driver from the manifest's driver map.
pub type DriverFactory = Arc<dyn Fn(&DriverSpec) -> Result<Arc<dyn Driver>, DriverError> + Send + Sync>;

/// Driver type to factory map. Written at startup, read for every build.
#[derive(Default)]
pub struct DriverRegistry {
    factories: RwLock<HashMap<String, DriverFactory>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, kind: impl Into<String>, factory: DriverFactory) {
        self.factories.write().await.insert(kind.into(), factory);
    }

    pub async fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.read().await.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Instantiate the driver named by `spec`'s `type`.
    pub async fn instantiate(&self, spec: &DriverSpec) -> Result<Arc<dyn Driver>, DriverError> {
        let factory = self
            .factories
            .read()
            .await
            .get(spec.kind())
            .cloned()
            .ok_or_else(|| DriverError::Unsupported(spec.kind().to_string()))?;
        factory(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Driver for Noop {
        async fn create(&self, _env: Environment) -> Result<(), DriverError> {
            Ok(())
        }

        async fn execute(&self, job: &mut Job, _collector: Arc<dyn Collector>) {
            job.status = Status::Passed;
        }

        async fn destroy(&self) -> Result<(), DriverError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn registry_instantiates_by_type() {
        let registry = DriverRegistry::new();
        registry
            .register("noop", Arc::new(|_: &DriverSpec| Ok(Arc::new(Noop) as Arc<dyn Driver>)))
            .await;
        assert_eq!(registry.kinds().await, ["noop"]);
        assert!(registry.instantiate(&DriverSpec::new("noop")).await.is_ok());

        match registry.instantiate(&DriverSpec::new("qemu")).await {
            Err(DriverError::Unsupported(kind)) => assert_eq!(kind, "qemu"),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("qemu should not be registered"),
        }
    }

    #[test]
    fn fail_keeps_the_strongest_status() {
        let mut job = Job::new(1, "build.1", vec![], Output::new());
        job.fail(Status::TimedOut, "too slow");
        job.fail(Status::Failed, "and broken");
        assert_eq!(job.status, Status::TimedOut);
        assert_eq!(job.errors.len(), 2);
        assert!(job.output.contents().contains("error: too slow"));
    }
}

//! Build submission.
//!
//! A build is handed to the runners as a [`Task`] named `run_build` whose
//! single argument is the JSON encoding of the build. Tasks are pushed onto
//! the [`Queue`] registered for the build's driver type.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kiln_state::model::Build;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, instrument};

use crate::error::{KilnError, Result};
use crate::manifest::Manifest;

pub const RUN_BUILD: &str = "run_build";

/// How often a failed `run_build` task is retried.
pub const RUN_BUILD_RETRIES: u32 = 3;

/// A unit of work for a queue consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub args: Vec<String>,
    pub retries: u32,
}

impl Task {
    pub fn run_build(build: &Build) -> Result<Task> {
        Ok(Task {
            name: RUN_BUILD.to_string(),
            args: vec![serde_json::to_string(build)?],
            retries: RUN_BUILD_RETRIES,
        })
    }

    /// Decode the build carried by a `run_build` task.
    pub fn build(&self) -> Result<Build> {
        if self.name != RUN_BUILD {
            return Err(KilnError::UnknownTask(self.name.clone()));
        }
        let arg = self
            .args
            .first()
            .ok_or_else(|| KilnError::Queue("run_build task has no arguments".into()))?;
        Ok(serde_json::from_str(arg)?)
    }
}

/// A queue transport.
#[async_trait]
pub trait Queue: Send + Sync {
    async fn push(&self, task: Task) -> Result<()>;
}

/// In-process queue over a bounded tokio channel.
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    tx: mpsc::Sender<Task>,
}

impl MemoryQueue {
    /// A queue and the receiving end its consumer reads from.
    pub fn new(capacity: usize) -> (MemoryQueue, mpsc::Receiver<Task>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (MemoryQueue { tx }, rx)
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn push(&self, task: Task) -> Result<()> {
        self.tx
            .send(task)
            .await
            .map_err(|_| KilnError::Queue("queue receiver dropped".into()))
    }
}

/// Driver type to queue map. Written at startup, read on every submission.
#[derive(Default)]
pub struct QueueRegistry {
    queues: RwLock<HashMap<String, Arc<dyn Queue>>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, driver: impl Into<String>, queue: Arc<dyn Queue>) {
        self.queues.write().await.insert(driver.into(), queue);
    }

    pub async fn get(&self, driver: &str) -> Option<Arc<dyn Queue>> {
        self.queues.read().await.get(driver).cloned()
    }

    pub async fn drivers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Submits builds to the queue of their manifest's driver.
#[derive(Clone)]
pub struct Submitter {
    queues: Arc<QueueRegistry>,
}

impl Submitter {
    pub fn new(queues: Arc<QueueRegistry>) -> Self {
        Self { queues }
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.queues
    }

    /// Push `build` onto its driver's queue. Returns `false` without error
    /// when no queue is registered for the driver.
    #[instrument(skip(self, build, manifest), fields(build_id = build.id))]
    pub async fn submit(&self, build: &Build, manifest: &Manifest) -> Result<bool> {
        let driver = manifest.driver_type();
        let Some(queue) = self.queues.get(driver).await else {
            debug!(driver = %driver, "no queue registered, skipping submission");
            return Ok(false);
        };
        queue.push(Task::run_build(build)?).await?;
        Ok(true)
    }
}

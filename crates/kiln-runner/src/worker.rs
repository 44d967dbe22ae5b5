//! Queue consumer for `run_build` tasks.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use kiln_core::obs;
use kiln_core::store::Store;
use kiln_core::{EventBus, KilnError, Manifest, Task};
use kiln_state::model::{Build, BuildEvent, EventType, JobUpdate, Passthrough, Status};
use kiln_state::{ArtifactStore, BuildStore, KilnStore, ObjectStore};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::collector::ArtifactCollector;
use crate::driver::{DriverRegistry, Environment, Job};
use crate::error::Result;
use crate::keychain::KeyChain;
use crate::output::Output;
use crate::placer::ObjectPlacer;
use crate::runner::{JobPlan, RunObserver, RunReport, Runner, StagePlan};

/// Runs queued builds end to end: status transitions, events, driver
/// selection, job persistence.
pub struct Worker {
    builds: Arc<dyn BuildStore>,
    artifacts: Arc<dyn ArtifactStore>,
    objects: Arc<dyn ObjectStore>,
    drivers: Arc<DriverRegistry>,
    /// Root of the blob store; artifacts go to the owner's partition.
    store: Arc<dyn Store>,
    events: EventBus,
    cancel: CancellationToken,
}

/// Outcome of taking a build off the queue.
enum Claim {
    Run(Build),
    Skip(Status),
}

struct Prepared {
    env: Environment,
    stages: Vec<StagePlan>,
    manifest: Manifest,
}

impl Worker {
    pub fn new<S: KilnStore + 'static>(
        state: Arc<S>,
        drivers: Arc<DriverRegistry>,
        store: Arc<dyn Store>,
        events: EventBus,
    ) -> Self {
        Self {
            builds: state.clone(),
            artifacts: state.clone(),
            objects: state,
            drivers,
            store,
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling `cancel` stops [`Worker::run`] and kills running builds
    /// at their next stage boundary.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Consume tasks until the channel closes or the worker is cancelled,
    /// running up to `concurrency` builds at once. Returns once every
    /// started build has finished.
    pub async fn run(self: Arc<Self>, mut tasks: mpsc::Receiver<Task>, concurrency: usize) {
        let concurrency = concurrency.max(1);
        let permits = Arc::new(Semaphore::new(concurrency));
        info!(concurrency, "worker started");

        loop {
            let permit = tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let task = tokio::select! {
                _ = self.cancel.cancelled() => break,
                task = tasks.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            let worker = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = worker.process(&task).await {
                    error!(task = %task.name, error = %e, "task failed");
                }
                drop(permit);
            });
        }

        let _ = permits.acquire_many(concurrency as u32).await;
        info!("worker stopped");
    }

    /// Handle one task and return the build's final status.
    ///
    /// Up to `task.retries` retries cover claiming the build and writing
    /// its final status. Anything failing in between becomes part of the
    /// build's outcome instead.
    pub async fn process(&self, task: &Task) -> Result<Status> {
        let build = task.build()?;
        let mut attempt = 0;
        let build = loop {
            match self.claim(build.id).await {
                Ok(Claim::Run(build)) => break build,
                Ok(Claim::Skip(status)) => return Ok(status),
                Err(e) if attempt < task.retries => {
                    attempt += 1;
                    warn!(build_id = build.id, attempt, error = %e, "claiming build failed, retrying");
                }
                Err(e) => return Err(e),
            }
        };
        self.run_build(build, task.retries).await
    }

    /// Move a queued build to Running. Builds in any other state are left
    /// alone.
    async fn claim(&self, build_id: i64) -> Result<Claim> {
        let build = self.builds.get_build(build_id).await?;
        if build.status != Status::Queued {
            debug!(build_id, status = %build.status, "build is not queued, skipping");
            return Ok(Claim::Skip(build.status));
        }
        let build = self
            .builds
            .set_build_status(build_id, Status::Running, None)
            .await?;
        Ok(Claim::Run(build))
    }

    #[instrument(skip_all, fields(build_id = build.id))]
    async fn run_build(&self, build: Build, retries: u32) -> Result<Status> {
        self.publish(&build, EventType::BuildStarted).await;
        let started = Instant::now();

        let (status, output) = match self.prepare(&build).await {
            Ok(prepared) => self.execute(&build, prepared).await,
            Err(e) => {
                error!(error = %e, "could not prepare build");
                (Status::Failed, format!("error: {e}\n"))
            }
        };

        let build = self.finish(build.id, status, output, retries).await?;
        obs::emit_build_finished(build.id, status, started.elapsed().as_millis() as u64);
        self.publish(&build, EventType::BuildFinished).await;
        Ok(status)
    }

    /// Write the final status, retrying the write alone so a finished run
    /// is never repeated.
    async fn finish(
        &self,
        build_id: i64,
        status: Status,
        output: String,
        retries: u32,
    ) -> Result<Build> {
        let mut attempt = 0;
        loop {
            match self
                .builds
                .set_build_status(build_id, status, Some(output.clone()))
                .await
            {
                Ok(build) => return Ok(build),
                Err(e) if attempt < retries => {
                    attempt += 1;
                    warn!(build_id, attempt, error = %e, "recording build status failed, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Load everything the driver and runner need.
    async fn prepare(&self, build: &Build) -> Result<Prepared> {
        let manifest = Manifest::parse(&build.manifest).map_err(KilnError::from)?;

        let mut env = manifest.env.clone();
        let mut masks = Vec::new();
        for var in self.builds.variables(build.id).await? {
            if var.masked {
                masks.push(var.value.clone());
            }
            env.push(format!("{}={}", var.key, var.value));
        }

        let mut objects = Passthrough::new();
        for object in self.builds.build_objects(build.id).await? {
            objects.insert(object.source, object.name);
        }

        let artifacts = self.artifacts.artifacts(build.id).await?;
        let jobs = self.builds.jobs(build.id).await?;
        let stages = self
            .builds
            .stages(build.id)
            .await?
            .into_iter()
            .map(|stage| StagePlan {
                jobs: jobs
                    .iter()
                    .filter(|j| j.stage_id == stage.id)
                    .map(|j| {
                        let mut published = Passthrough::new();
                        for a in artifacts.iter().filter(|a| a.job_id == j.id) {
                            published.insert(a.source.clone(), a.name.clone());
                        }
                        JobPlan {
                            id: j.id,
                            name: j.name.clone(),
                            commands: j.commands.clone(),
                            depends: j.depends.clone(),
                            artifacts: published,
                        }
                    })
                    .collect(),
                name: stage.name,
                can_fail: stage.can_fail,
            })
            .collect();

        let env = Environment {
            env,
            objects,
            placer: Arc::new(ObjectPlacer::new(
                build.id,
                Arc::clone(&self.builds),
                Arc::clone(&self.objects),
                Arc::clone(&self.store),
            )),
            keys: KeyChain::new(self.builds.keys(build.id).await?),
            output: Output::with_masks(masks),
        };
        Ok(Prepared {
            env,
            stages,
            manifest,
        })
    }

    async fn execute(&self, build: &Build, prepared: Prepared) -> (Status, String) {
        let Prepared {
            env,
            stages,
            manifest,
        } = prepared;
        let output = env.output.clone();

        let driver = match self.drivers.instantiate(&manifest.driver).await {
            Ok(driver) => driver,
            Err(e) => {
                output.line(&format!("error: {e}"));
                return (Status::Failed, output.contents());
            }
        };

        obs::emit_build_started(build.id, stages.len());
        let collector = ArtifactCollector::new(
            build.id,
            Arc::clone(&self.artifacts),
            self.store.partition(build.user_id),
        );
        let report = Runner::new(driver, Arc::new(collector))
            .with_observer(Arc::new(JobRecorder {
                build_id: build.id,
                builds: Arc::clone(&self.builds),
            }))
            .with_cancel(self.cancel.child_token())
            .run(env, stages)
            .await;
        self.settle_unstarted(build.id, &report).await;
        (report.status, output.contents())
    }

    /// Jobs the runner gave up on before starting them never reach the
    /// observer; record their outcome here.
    async fn settle_unstarted(&self, build_id: i64, report: &RunReport) {
        let rows = match self.builds.jobs(build_id).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "could not reload jobs");
                return;
            }
        };
        for row in rows.iter().filter(|r| r.status == Status::Queued) {
            let Some(job) = report.jobs.iter().find(|j| j.id == row.id) else {
                continue;
            };
            let update = JobUpdate {
                status: Some(job.status),
                output: Some(job.output.clone()),
                finished_at: Some(Utc::now()),
                ..Default::default()
            };
            if let Err(e) = self.builds.update_job(row.id, update).await {
                warn!(job_id = row.id, error = %e, "could not record job");
            }
        }
    }

    async fn publish(&self, build: &Build, event_type: EventType) {
        if let Err(e) = self
            .events
            .publish(build.namespace_id, event_type, &BuildEvent::from(build))
            .await
        {
            warn!(build_id = build.id, event = event_type.as_str(), error = %e, "event dispatch failed");
        }
    }
}

/// Persists job rows as the runner reports progress.
struct JobRecorder {
    build_id: i64,
    builds: Arc<dyn BuildStore>,
}

#[async_trait]
impl RunObserver for JobRecorder {
    async fn job_started(&self, _stage: &str, job: &Job) {
        let update = JobUpdate {
            status: Some(Status::Running),
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        if let Err(e) = self.builds.update_job(job.id, update).await {
            warn!(job_id = job.id, error = %e, "could not record job start");
        }
    }

    async fn job_finished(&self, _stage: &str, job: &Job) {
        obs::emit_job_finished(self.build_id, &job.name, job.status);
        let update = JobUpdate {
            status: Some(job.status),
            output: Some(job.output.contents()),
            finished_at: Some(Utc::now()),
            ..Default::default()
        };
        if let Err(e) = self.builds.update_job(job.id, update).await {
            warn!(job_id = job.id, error = %e, "could not record job result");
        }
    }
}

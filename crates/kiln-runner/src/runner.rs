//! Stage runner.
//!
//! Stages run one after another in plan order. Inside a stage every job
//! whose sibling dependencies have completed runs concurrently; the stage
//! ends when all of its jobs have. A failing job in a stage that may not
//! fail stops the build after that stage.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use kiln_state::model::{Passthrough, Status};
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::driver::{Collector, Driver, Environment, Job};
use crate::output::Output;

/// A job to run.
#[derive(Debug, Clone, Default)]
pub struct JobPlan {
    pub id: i64,
    pub name: String,
    pub commands: Vec<String>,
    /// Names of jobs this one waits for. Names outside the stage refer to
    /// earlier stages and are already satisfied.
    pub depends: Vec<String>,
    pub artifacts: Passthrough,
}

#[derive(Debug, Clone, Default)]
pub struct StagePlan {
    pub name: String,
    pub can_fail: bool,
    pub jobs: Vec<JobPlan>,
}

/// Notified as jobs start and finish.
#[async_trait]
pub trait RunObserver: Send + Sync {
    async fn job_started(&self, _stage: &str, _job: &Job) {}

    async fn job_finished(&self, _stage: &str, _job: &Job) {}
}

pub struct NoopObserver;

impl RunObserver for NoopObserver {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub id: i64,
    pub stage: String,
    pub name: String,
    pub status: Status,
    pub output: String,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub status: Status,
    pub jobs: Vec<JobReport>,
}

impl RunReport {
    pub fn job(&self, name: &str) -> Option<&JobReport> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

/// Contribution of one job status to the build status.
pub fn severity(status: Status, can_fail: bool) -> Status {
    let status = if status.is_terminal() {
        status
    } else {
        Status::Failed
    };
    if can_fail && status.is_failure() {
        Status::PassedWithFailures
    } else {
        status
    }
}

pub struct Runner {
    driver: Arc<dyn Driver>,
    collector: Arc<dyn Collector>,
    observer: Arc<dyn RunObserver>,
    cancel: CancellationToken,
}

impl Runner {
    pub fn new(driver: Arc<dyn Driver>, collector: Arc<dyn Collector>) -> Self {
        Self {
            driver,
            collector,
            observer: Arc::new(NoopObserver),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Once `cancel` fires no further stage or job is started; running jobs
    /// finish and the build ends `Killed`.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Bring up the driver, run `stages` and tear the driver down.
    pub async fn run(&self, env: Environment, stages: Vec<StagePlan>) -> RunReport {
        let output = env.output.clone();
        let mut status = Status::Passed;
        let mut jobs = Vec::new();

        match self.driver.create(env).await {
            Ok(()) => {
                for stage in &stages {
                    if self.cancel.is_cancelled() {
                        output.line("build cancelled");
                        status = status.max(Status::Killed);
                        break;
                    }
                    output.line(&format!("==> {}", stage.name));
                    info!(stage = %stage.name, jobs = stage.jobs.len(), "running stage");

                    let mut abort = false;
                    for job in self.run_stage(stage, &output).await {
                        status = status.max(severity(job.status, stage.can_fail));
                        abort |= !stage.can_fail && severity(job.status, false).is_failure();
                        jobs.push(JobReport {
                            id: job.id,
                            stage: stage.name.clone(),
                            name: job.name,
                            status: job.status,
                            output: job.output.contents(),
                            errors: job.errors,
                        });
                    }
                    if self.cancel.is_cancelled() {
                        status = status.max(Status::Killed);
                    }
                    if abort {
                        output.line(&format!("stage {} failed, stopping", stage.name));
                        break;
                    }
                }
            }
            Err(e) => {
                output.line(&format!("error: {e}"));
                status = Status::Failed;
            }
        }

        if let Err(e) = self.driver.destroy().await {
            warn!(error = %e, "driver destroy failed");
            output.line(&format!("error: {e}"));
        }
        RunReport { status, jobs }
    }

    async fn run_stage(&self, stage: &StagePlan, output: &Output) -> Vec<Job> {
        let siblings: HashSet<&str> = stage.jobs.iter().map(|j| j.name.as_str()).collect();
        let depends: Vec<Vec<&str>> = stage
            .jobs
            .iter()
            .map(|j| {
                j.depends
                    .iter()
                    .map(String::as_str)
                    .filter(|d| siblings.contains(d))
                    .collect()
            })
            .collect();

        let mut waiting: Vec<usize> = (0..stage.jobs.len()).collect();
        let mut done: HashSet<&str> = HashSet::new();
        let mut finished: Vec<Option<Job>> = vec![None; stage.jobs.len()];
        let mut running = JoinSet::new();
        let mut tasks: HashMap<task::Id, usize> = HashMap::new();

        loop {
            if !self.cancel.is_cancelled() {
                let (ready, blocked): (Vec<usize>, Vec<usize>) = waiting
                    .iter()
                    .copied()
                    .partition(|&i| depends[i].iter().all(|d| done.contains(d)));
                waiting = blocked;
                for i in ready {
                    let id = self.spawn_job(&mut running, stage, i, output);
                    tasks.insert(id, i);
                }
            }

            match running.join_next().await {
                Some(Ok((i, job))) => {
                    output.line(&format!("--- {} ({})", job.name, job.status));
                    output.write_str(&job.output.contents());
                    done.insert(stage.jobs[i].name.as_str());
                    finished[i] = Some(job);
                }
                Some(Err(e)) => {
                    warn!(error = %e, "job task failed");
                    let Some(&i) = tasks.get(&e.id()) else {
                        continue;
                    };
                    let plan = &stage.jobs[i];
                    let mut job =
                        Job::new(plan.id, &plan.name, plan.commands.clone(), output.child());
                    job.fail(
                        Status::Failed,
                        if e.is_panic() {
                            "job task panicked"
                        } else {
                            "job task aborted"
                        },
                    );
                    let recorded = AssertUnwindSafe(self.observer.job_finished(&stage.name, &job))
                        .catch_unwind()
                        .await;
                    if recorded.is_err() {
                        warn!(job = %job.name, "observer panicked");
                    }
                    output.line(&format!("--- {} ({})", job.name, job.status));
                    output.write_str(&job.output.contents());
                    done.insert(plan.name.as_str());
                    finished[i] = Some(job);
                }
                None => break,
            }
        }

        let cancelled = self.cancel.is_cancelled();
        let blocked: Vec<&str> = waiting.iter().map(|&i| stage.jobs[i].name.as_str()).collect();
        stage
            .jobs
            .iter()
            .zip(finished)
            .map(|(plan, job)| match job {
                Some(job) => job,
                None => {
                    let mut job = Job::new(plan.id, &plan.name, plan.commands.clone(), output.child());
                    if cancelled {
                        job.fail(Status::Killed, "not started: build cancelled");
                    } else if blocked.contains(&plan.name.as_str()) {
                        job.fail(
                            Status::Failed,
                            format!("dependency cycle among {}", blocked.join(", ")),
                        );
                    } else {
                        job.fail(Status::Failed, "job task aborted");
                    }
                    job
                }
            })
            .collect()
    }

    fn spawn_job(
        &self,
        running: &mut JoinSet<(usize, Job)>,
        stage: &StagePlan,
        index: usize,
        output: &Output,
    ) -> task::Id {
        let plan = &stage.jobs[index];
        let mut job = Job::new(plan.id, &plan.name, plan.commands.clone(), output.child())
            .with_artifacts(plan.artifacts.clone());
        let driver = Arc::clone(&self.driver);
        let collector = Arc::clone(&self.collector);
        let observer = Arc::clone(&self.observer);
        let stage_name = stage.name.clone();

        running.spawn(async move {
            job.status = Status::Running;
            observer.job_started(&stage_name, &job).await;
            let ran = AssertUnwindSafe(driver.execute(&mut job, collector))
                .catch_unwind()
                .await;
            if ran.is_err() {
                job.fail(Status::Failed, "driver panicked");
            } else if !job.status.is_terminal() {
                job.fail(Status::Failed, "driver did not report a status");
            }
            observer.job_finished(&stage_name, &job).await;
            (index, job)
        })
        .id()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::error::{DriverError, TransferError};
    use crate::keychain::KeyChain;
    use crate::placer::NoObjects;

    /// Driver scripted by job name: the first command decides the outcome.
    #[derive(Default)]
    struct Scripted {
        log: Mutex<Vec<String>>,
        destroyed: Mutex<bool>,
        fail_create: bool,
    }

    #[async_trait]
    impl Driver for Scripted {
        async fn create(&self, _env: Environment) -> Result<(), DriverError> {
            if self.fail_create {
                return Err(DriverError::Setup("no capacity".into()));
            }
            Ok(())
        }

        async fn execute(&self, job: &mut Job, _collector: Arc<dyn Collector>) {
            self.log.lock().unwrap().push(format!("start {}", job.name));
            let cmd = job.commands.first().cloned().unwrap_or_default();
            if let Some(ms) = cmd.strip_prefix("sleep ") {
                tokio::time::sleep(Duration::from_millis(ms.parse().unwrap())).await;
            }
            job.output.line(&format!("ran {cmd}"));
            job.status = match cmd.as_str() {
                "fail" => Status::Failed,
                "timeout" => Status::TimedOut,
                _ => Status::Passed,
            };
            self.log.lock().unwrap().push(format!("end {}", job.name));
        }

        async fn destroy(&self) -> Result<(), DriverError> {
            *self.destroyed.lock().unwrap() = true;
            Ok(())
        }
    }

    struct Nowhere;

    #[async_trait]
    impl Collector for Nowhere {
        async fn collect(
            &self,
            _name: &str,
            _reader: Box<dyn std::io::Read + Send>,
        ) -> Result<u64, TransferError> {
            Ok(0)
        }
    }

    fn env() -> Environment {
        Environment {
            env: vec![],
            objects: Passthrough::new(),
            placer: Arc::new(NoObjects),
            keys: KeyChain::default(),
            output: Output::with_masks(["s3cr3t"]),
        }
    }

    fn job(name: &str, cmd: &str, depends: &[&str]) -> JobPlan {
        JobPlan {
            name: name.into(),
            commands: vec![cmd.into()],
            depends: depends.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        }
    }

    fn stage(name: &str, can_fail: bool, jobs: Vec<JobPlan>) -> StagePlan {
        StagePlan {
            name: name.into(),
            can_fail,
            jobs,
        }
    }

    fn runner(driver: &Arc<Scripted>) -> Runner {
        Runner::new(driver.clone(), Arc::new(Nowhere))
    }

    #[tokio::test]
    async fn single_passing_job_passes() {
        let driver = Arc::new(Scripted::default());
        let report = runner(&driver)
            .run(env(), vec![stage("list", false, vec![job("list.1", "true", &[])])])
            .await;
        assert_eq!(report.status, Status::Passed);
        assert_eq!(report.job("list.1").unwrap().status, Status::Passed);
        assert!(*driver.destroyed.lock().unwrap());
    }

    #[tokio::test]
    async fn no_jobs_is_a_pass() {
        let driver = Arc::new(Scripted::default());
        let report = runner(&driver).run(env(), vec![]).await;
        assert_eq!(report.status, Status::Passed);
        assert!(report.jobs.is_empty());
    }

    #[tokio::test]
    async fn failures_in_failable_stages_are_tolerated() {
        let driver = Arc::new(Scripted::default());
        let report = runner(&driver)
            .run(
                env(),
                vec![
                    stage("build", false, vec![job("build.1", "true", &[])]),
                    stage("deploy", true, vec![job("deploy.1", "fail", &[])]),
                ],
            )
            .await;
        assert_eq!(report.status, Status::PassedWithFailures);
    }

    #[tokio::test]
    async fn failing_stage_aborts_the_build() {
        let driver = Arc::new(Scripted::default());
        let report = runner(&driver)
            .run(
                env(),
                vec![
                    stage("compile", false, vec![job("compile.1", "fail", &[])]),
                    stage("publish", false, vec![job("publish.1", "true", &[])]),
                ],
            )
            .await;
        assert_eq!(report.status, Status::Failed);
        assert!(report.job("publish.1").is_none());
        assert!(!driver
            .log
            .lock()
            .unwrap()
            .iter()
            .any(|l| l.contains("publish")));
        assert!(*driver.destroyed.lock().unwrap());
    }

    #[tokio::test]
    async fn strongest_status_wins() {
        let driver = Arc::new(Scripted::default());
        let report = runner(&driver)
            .run(
                env(),
                vec![stage(
                    "test",
                    false,
                    vec![job("a", "fail", &[]), job("b", "timeout", &[])],
                )],
            )
            .await;
        assert_eq!(report.status, Status::TimedOut);
        // Siblings of a failing job still run to completion.
        assert_eq!(report.jobs.len(), 2);
    }

    #[tokio::test]
    async fn dependencies_order_jobs_within_a_stage() {
        let driver = Arc::new(Scripted::default());
        let report = runner(&driver)
            .run(
                env(),
                vec![stage(
                    "build",
                    false,
                    vec![
                        job("late", "true", &["slow", "earlier-stage-job"]),
                        job("slow", "sleep 50", &[]),
                        job("fast", "true", &[]),
                    ],
                )],
            )
            .await;
        assert_eq!(report.status, Status::Passed);

        let log = driver.log.lock().unwrap().clone();
        let pos = |entry: &str| log.iter().position(|l| l == entry).unwrap();
        assert!(pos("end slow") < pos("start late"));
        assert!(pos("start fast") < pos("end slow"));
    }

    #[tokio::test]
    async fn dependency_on_a_failed_sibling_still_runs() {
        let driver = Arc::new(Scripted::default());
        let report = runner(&driver)
            .run(
                env(),
                vec![stage(
                    "s",
                    true,
                    vec![job("a", "fail", &[]), job("b", "true", &["a"])],
                )],
            )
            .await;
        assert_eq!(report.job("b").unwrap().status, Status::Passed);
        assert_eq!(report.status, Status::PassedWithFailures);
    }

    #[tokio::test]
    async fn cycles_fail_instead_of_hanging() {
        let driver = Arc::new(Scripted::default());
        let report = runner(&driver)
            .run(
                env(),
                vec![stage(
                    "s",
                    false,
                    vec![
                        job("a", "true", &["b"]),
                        job("b", "true", &["a"]),
                        job("c", "true", &[]),
                    ],
                )],
            )
            .await;
        assert_eq!(report.status, Status::Failed);
        assert_eq!(report.job("c").unwrap().status, Status::Passed);
        let a = report.job("a").unwrap();
        assert_eq!(a.status, Status::Failed);
        assert!(a.errors[0].contains("dependency cycle"));
    }

    struct Panicky;

    #[async_trait]
    impl RunObserver for Panicky {
        async fn job_started(&self, _stage: &str, job: &Job) {
            if job.name == "flaky" {
                panic!("observer blew up");
            }
        }
    }

    #[tokio::test]
    async fn a_panicked_job_is_a_failed_dependency_not_a_cycle() {
        let driver = Arc::new(Scripted::default());
        let report = runner(&driver)
            .with_observer(Arc::new(Panicky))
            .run(
                env(),
                vec![stage(
                    "s",
                    true,
                    vec![job("flaky", "true", &[]), job("after", "true", &["flaky"])],
                )],
            )
            .await;
        let flaky = report.job("flaky").unwrap();
        assert_eq!(flaky.status, Status::Failed);
        assert_eq!(flaky.errors, ["job task panicked"]);
        assert_eq!(report.job("after").unwrap().status, Status::Passed);
        assert_eq!(report.status, Status::PassedWithFailures);
    }

    #[tokio::test]
    async fn cancellation_stops_before_the_next_stage() {
        let driver = Arc::new(Scripted::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let report = runner(&driver)
            .with_cancel(cancel)
            .run(
                env(),
                vec![
                    stage("one", false, vec![job("one.1", "sleep 100", &[])]),
                    stage("two", false, vec![job("two.1", "true", &[])]),
                ],
            )
            .await;
        assert_eq!(report.status, Status::Killed);
        assert_eq!(report.job("one.1").unwrap().status, Status::Passed);
        assert!(report.job("two.1").is_none());
        assert!(*driver.destroyed.lock().unwrap());
    }

    #[tokio::test]
    async fn create_failure_fails_the_build_and_still_destroys() {
        let driver = Arc::new(Scripted {
            fail_create: true,
            ..Default::default()
        });
        let output = Output::new();
        let report = runner(&driver)
            .run(
                Environment {
                    output: output.clone(),
                    ..env()
                },
                vec![stage("s", false, vec![job("s.1", "true", &[])])],
            )
            .await;
        assert_eq!(report.status, Status::Failed);
        assert!(report.jobs.is_empty());
        assert!(output.contents().contains("no capacity"));
        assert!(*driver.destroyed.lock().unwrap());
    }

    #[tokio::test]
    async fn job_output_is_masked_and_reported() {
        let driver = Arc::new(Scripted::default());
        let build_output = Output::with_masks(["s3cr3t"]);
        let report = runner(&driver)
            .run(
                Environment {
                    output: build_output.clone(),
                    ..env()
                },
                vec![stage("s", false, vec![job("s.1", "echo s3cr3t", &[])])],
            )
            .await;
        let job = report.job("s.1").unwrap();
        assert_eq!(job.output, "ran echo xxxxxx\n");
        assert!(build_output.contents().contains("ran echo xxxxxx"));
        assert!(!build_output.contents().contains("s3cr3t"));
    }

    #[test]
    fn severity_rules() {
        let cases: HashMap<(Status, bool), Status> = [
            ((Status::Passed, false), Status::Passed),
            ((Status::Failed, false), Status::Failed),
            ((Status::Failed, true), Status::PassedWithFailures),
            ((Status::Killed, true), Status::PassedWithFailures),
            ((Status::Running, false), Status::Failed),
            ((Status::TimedOut, false), Status::TimedOut),
        ]
        .into_iter()
        .collect();
        for ((status, can_fail), expected) in cases {
            assert_eq!(severity(status, can_fail), expected, "{status} can_fail={can_fail}");
        }
    }
}

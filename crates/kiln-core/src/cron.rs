//! Cron scheduler.
//!
//! On every tick the scheduler pages through the crons that are due,
//! advances each one's schedule, turns it into a build and submits the
//! build to its driver queue. Batches never overlap, and errors for a single cron go to
//! the error handler without stopping the loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use kiln_state::model::{Build, Cron, NewTrigger, TriggerKind, User};
use kiln_state::{CronStore, UserStore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::build::{BuildRequest, Creator};
use crate::error::{KilnError, Result};
use crate::manifest::Manifest;
use crate::obs;
use crate::queue::Submitter;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Receives per-cron errors.
pub type ErrorHandler = Arc<dyn Fn(&KilnError) + Send + Sync>;

fn log_error() -> ErrorHandler {
    Arc::new(|err: &KilnError| error!(error = %err, "cron invocation failed"))
}

/// One page of due crons with their owners.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub crons: Vec<Cron>,
    pub users: HashMap<i64, User>,
}

pub struct Scheduler {
    crons: Arc<dyn CronStore>,
    users: Arc<dyn UserStore>,
    creator: Creator,
    submitter: Submitter,
    interval: Duration,
    batch_size: usize,
    on_error: ErrorHandler,
    page: u64,
    pages: u64,
    cursor: i64,
}

impl Scheduler {
    pub fn new(
        crons: Arc<dyn CronStore>,
        users: Arc<dyn UserStore>,
        creator: Creator,
        submitter: Submitter,
    ) -> Self {
        Self {
            crons,
            users,
            creator,
            submitter,
            interval: DEFAULT_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            on_error: log_error(),
            page: 0,
            pages: 0,
            cursor: 0,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_error_handler(mut self, on_error: ErrorHandler) -> Self {
        self.on_error = on_error;
        self
    }

    /// Tick until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = self.interval.as_secs(), "cron scheduler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick(Utc::now()).await,
            }
        }
        info!("cron scheduler stopped");
    }

    /// Load and run batches until every due cron has been visited once.
    pub async fn tick(&mut self, now: DateTime<Utc>) {
        loop {
            match self.load(now).await {
                Ok(Some(batch)) => self.run_batch(batch, now).await,
                Ok(None) => break,
                Err(e) => {
                    (self.on_error)(&e);
                    self.reset();
                    break;
                }
            }
        }
    }

    fn reset(&mut self) {
        self.page = 0;
        self.pages = 0;
        self.cursor = 0;
    }

    /// The next page of due crons, or `None` once the tick is exhausted.
    ///
    /// Pages are keyed by cron id, so advancing rows of an earlier page does
    /// not shift later ones.
    #[instrument(skip(self))]
    pub async fn load(&mut self, now: DateTime<Utc>) -> Result<Option<Batch>> {
        if self.page == 0 {
            let due = self.crons.count_due(now).await?;
            self.pages = due.div_ceil(self.batch_size as u64);
            debug!(due, pages = self.pages, "due crons counted");
        }
        if self.page >= self.pages {
            self.reset();
            return Ok(None);
        }

        let crons = self
            .crons
            .due_crons(now, self.cursor, self.batch_size)
            .await?;
        let Some(last) = crons.last() else {
            self.reset();
            return Ok(None);
        };
        self.cursor = last.id;
        self.page += 1;

        let mut ids: Vec<i64> = crons.iter().map(|c| c.user_id).collect();
        ids.sort_unstable();
        ids.dedup();
        let users = self
            .users
            .get_users(&ids)
            .await?
            .into_iter()
            .map(|u| (u.id, u))
            .collect();
        Ok(Some(Batch { crons, users }))
    }

    pub async fn run_batch(&mut self, batch: Batch, now: DateTime<Utc>) {
        for cron in &batch.crons {
            if !batch.users.contains_key(&cron.user_id) {
                (self.on_error)(&KilnError::CronOwner {
                    cron_id: cron.id,
                    user_id: cron.user_id,
                });
                continue;
            }
            if let Err(e) = self.invoke(cron, now).await {
                (self.on_error)(&e);
            }
        }
    }

    /// Materialise one build from `cron` if it is due at `now`.
    ///
    /// The cron is advanced before its build is created, so a failure after
    /// that point loses at most this run and never fires it twice. A cron
    /// whose manifest does not validate stays due.
    #[instrument(skip(self, cron), fields(cron_id = cron.id))]
    pub async fn invoke(&self, cron: &Cron, now: DateTime<Utc>) -> Result<Option<Build>> {
        if !cron.is_due(now) {
            return Ok(None);
        }
        Manifest::parse(&cron.manifest)?.validate()?;

        let next = cron.schedule.next(now);
        let next_text = next.to_rfc3339_opts(SecondsFormat::Secs, true);

        let mut trigger = NewTrigger::new(
            TriggerKind::Schedule,
            format!("Scheduled build, next run at {next_text}"),
        );
        trigger.data.insert("cron_id".into(), cron.id.to_string());
        trigger.data.insert("schedule".into(), cron.schedule.to_string());
        trigger.data.insert("next_run".into(), next_text.clone());

        let req = BuildRequest::new(cron.user_id, cron.manifest.clone(), trigger)
            .with_namespace(cron.namespace_id)
            .with_tag(cron.tag());
        self.crons.record_cron_run(cron.id, now, next).await?;
        let (build, manifest) = self.creator.create(req).await?;
        if let Err(e) = self.crons.link_cron_build(cron.id, build.id).await {
            (self.on_error)(&KilnError::from(e));
        }
        obs::emit_cron_invoked(cron.id, build.id, &next_text);

        self.submitter.submit(&build, &manifest).await?;
        Ok(Some(build))
    }
}

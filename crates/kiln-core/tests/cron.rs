//! Cron scheduler driving builds through the in-memory backend.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use kiln_core::{Creator, EventBus, KilnError, MemoryQueue, QueueRegistry, Scheduler, Submitter};
use kiln_state::fakes::MemoryState;
use kiln_state::model::*;
use kiln_state::{BuildStore, CronStore, UserStore};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const MANIFEST: &str = "\
driver: {type: os}
stages: [test]
jobs:
  - stage: test
    commands: [make test]
";

struct Harness {
    state: Arc<MemoryState>,
    scheduler: Scheduler,
    tasks: mpsc::Receiver<kiln_core::Task>,
    errors: Arc<Mutex<Vec<String>>>,
}

async fn harness(batch_size: usize) -> Harness {
    let state = Arc::new(MemoryState::new());
    let registry = Arc::new(QueueRegistry::new());
    let (queue, tasks) = MemoryQueue::new(64);
    registry.register("os", Arc::new(queue)).await;

    let creator = Creator::new(state.clone(), state.clone(), EventBus::noop());
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    let scheduler = Scheduler::new(state.clone(), state.clone(), creator, Submitter::new(registry))
        .with_batch_size(batch_size)
        .with_error_handler(Arc::new(move |e: &KilnError| {
            sink.lock().unwrap().push(e.to_string())
        }));
    Harness {
        state,
        scheduler,
        tasks,
        errors,
    }
}

async fn user(state: &MemoryState) -> User {
    state
        .create_user(NewUser {
            username: "ops".into(),
            email: "ops@example.com".into(),
            cleanup: false,
        })
        .await
        .unwrap()
}

/// A cron owned by `user_id` that is due from `due`.
async fn cron(state: &MemoryState, user_id: i64, name: &str, manifest: &str, due: DateTime<Utc>) -> Cron {
    let cron = state
        .create_cron(NewCron {
            user_id,
            namespace_id: None,
            name: name.into(),
            schedule: Schedule::Daily,
            manifest: manifest.into(),
        })
        .await
        .unwrap();
    state.record_cron_run(cron.id, due, due).await.unwrap()
}

fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
}

#[tokio::test]
async fn daily_cron_fires_before_midnight() {
    let mut h = harness(100).await;
    let owner = user(&h.state).await;
    let created = cron(&h.state, owner.id, "nightly build", MANIFEST, at(2025, 1, 31, 0, 0, 0)).await;

    let now = at(2025, 1, 31, 23, 59, 59);
    h.scheduler.tick(now).await;
    assert!(h.errors.lock().unwrap().is_empty());

    let after = h.state.get_cron(created.id).await.unwrap();
    assert_eq!(after.prev_run, Some(now));
    assert_eq!(after.next_run, at(2025, 2, 1, 0, 0, 0));

    let builds = h.state.cron_builds(created.id).await.unwrap();
    assert_eq!(builds.len(), 1);
    let build_id = builds[0];

    let tags = h.state.tags(build_id).await.unwrap();
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].name, "cron:nightly-build");

    let trigger = h.state.trigger(build_id).await.unwrap();
    assert_eq!(trigger.kind, TriggerKind::Schedule);
    assert!(trigger.comment.contains("2025-02-01T00:00:00Z"));
    assert_eq!(trigger.data.get("cron_id"), Some(&created.id.to_string()));

    let task = h.tasks.try_recv().unwrap();
    assert_eq!(task.build().unwrap().id, build_id);

    // Not due again until midnight.
    h.scheduler.tick(now).await;
    assert_eq!(h.state.cron_builds(created.id).await.unwrap().len(), 1);
    assert!(h.tasks.try_recv().is_err());
}

#[tokio::test]
async fn every_due_cron_runs_once_across_pages() {
    let mut h = harness(2).await;
    let owner = user(&h.state).await;
    let due = at(2025, 3, 1, 0, 0, 0);
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(cron(&h.state, owner.id, &format!("c{i}"), MANIFEST, due).await.id);
    }

    h.scheduler.tick(at(2025, 3, 1, 12, 0, 0)).await;
    assert!(h.errors.lock().unwrap().is_empty());
    for id in ids {
        assert_eq!(h.state.cron_builds(id).await.unwrap().len(), 1, "cron {id}");
    }

    let mut submitted = 0;
    while h.tasks.try_recv().is_ok() {
        submitted += 1;
    }
    assert_eq!(submitted, 5);
}

#[tokio::test]
async fn crons_without_owner_are_reported_and_skipped() {
    let mut h = harness(10).await;
    let owner = user(&h.state).await;
    let due = at(2025, 3, 1, 0, 0, 0);
    let orphan = cron(&h.state, 9999, "orphan", MANIFEST, due).await;
    let fine = cron(&h.state, owner.id, "fine", MANIFEST, due).await;

    h.scheduler.tick(at(2025, 3, 1, 1, 0, 0)).await;

    let errors = h.errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains(&orphan.id.to_string()));
    assert!(h.state.cron_builds(orphan.id).await.unwrap().is_empty());
    assert_eq!(h.state.cron_builds(fine.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn invalid_manifest_does_not_stop_the_batch() {
    let mut h = harness(10).await;
    let owner = user(&h.state).await;
    let due = at(2025, 3, 1, 0, 0, 0);
    let broken = cron(&h.state, owner.id, "broken", "driver: {type: os}\n", due).await;
    let fine = cron(&h.state, owner.id, "fine", MANIFEST, due).await;

    h.scheduler.tick(at(2025, 3, 1, 1, 0, 0)).await;

    assert_eq!(h.errors.lock().unwrap().len(), 1);
    assert!(h.state.cron_builds(broken.id).await.unwrap().is_empty());
    assert_eq!(h.state.cron_builds(fine.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn run_stops_on_cancel() {
    let h = harness(10).await;
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(
        h.scheduler
            .with_interval(std::time::Duration::from_millis(10))
            .run(cancel.clone()),
    );
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn a_failed_advance_creates_nothing_and_retries_next_tick() {
    let mut h = harness(10).await;
    let owner = user(&h.state).await;
    let created = cron(&h.state, owner.id, "nightly", MANIFEST, at(2025, 3, 1, 0, 0, 0)).await;
    let now = at(2025, 3, 1, 6, 0, 0);

    h.state.fail_next("record_cron_run", 1);
    h.scheduler.tick(now).await;
    assert_eq!(h.errors.lock().unwrap().len(), 1);
    assert!(h.state.cron_builds(created.id).await.unwrap().is_empty());
    assert!(h.tasks.try_recv().is_err());

    h.scheduler.tick(now).await;
    assert_eq!(h.state.cron_builds(created.id).await.unwrap().len(), 1);
    assert!(h.tasks.try_recv().is_ok());
}

#[tokio::test]
async fn a_failed_link_does_not_fire_the_cron_twice() {
    let mut h = harness(10).await;
    let owner = user(&h.state).await;
    let created = cron(&h.state, owner.id, "nightly", MANIFEST, at(2025, 3, 1, 0, 0, 0)).await;
    let now = at(2025, 3, 1, 6, 0, 0);

    h.state.fail_next("link_cron_build", 1);
    h.scheduler.tick(now).await;
    assert_eq!(h.errors.lock().unwrap().len(), 1);
    assert_eq!(h.state.get_cron(created.id).await.unwrap().prev_run, Some(now));
    assert!(h.tasks.try_recv().is_ok(), "the build is still submitted");

    h.scheduler.tick(now).await;
    assert!(h.tasks.try_recv().is_err());
    assert_eq!(h.errors.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn a_failed_build_write_skips_the_run_once() {
    let mut h = harness(10).await;
    let owner = user(&h.state).await;
    let created = cron(&h.state, owner.id, "nightly", MANIFEST, at(2025, 3, 1, 0, 0, 0)).await;
    let now = at(2025, 3, 1, 6, 0, 0);

    h.state.fail_next("create_build", 1);
    h.scheduler.tick(now).await;
    assert_eq!(h.errors.lock().unwrap().len(), 1);
    assert_eq!(
        h.state.get_cron(created.id).await.unwrap().next_run,
        at(2025, 3, 2, 0, 0, 0)
    );

    h.scheduler.tick(now).await;
    assert!(h.state.cron_builds(created.id).await.unwrap().is_empty());
    assert!(h.tasks.try_recv().is_err());
}

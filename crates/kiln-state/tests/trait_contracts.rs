//! Trait contract tests for the storage traits.
//!
//! Each contract runs against the in-memory fake and the SurrealDB backend
//! (`mem://`). Any conforming implementation must pass these.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use kiln_state::fakes::MemoryState;
use kiln_state::model::*;
use kiln_state::storage_traits::*;
use kiln_state::{StorageError, SurrealHandle};
use uuid::Uuid;

fn sample_build(user_id: i64) -> NewBuild {
    NewBuild {
        user_id,
        namespace_id: None,
        manifest: "driver:\n  type: os\n".into(),
        trigger: NewTrigger::new(TriggerKind::Manual, "manual run"),
        tags: vec!["nightly".into(), "nightly".into()],
        stages: vec![
            NewStage {
                name: "build".into(),
                can_fail: false,
                jobs: vec![NewJob {
                    name: "build.1".into(),
                    commands: vec!["make".into()],
                    depends: vec![],
                    artifacts: Passthrough::parse(["out/app.bin => app.bin"]),
                }],
            },
            NewStage {
                name: "test".into(),
                can_fail: true,
                jobs: vec![NewJob {
                    name: "test.1".into(),
                    commands: vec!["make test".into()],
                    depends: vec![],
                    artifacts: Passthrough::new(),
                }],
            },
        ],
        objects: vec![NewBuildObject {
            object_id: None,
            source: "dataset.tar".into(),
            name: "data/dataset.tar".into(),
        }],
        variables: vec![NewVariable {
            key: "TOKEN".into(),
            value: "s3cr3t".into(),
            masked: true,
        }],
        keys: vec![NewKey {
            name: "id_deploy".into(),
            key: "-----BEGIN KEY-----".into(),
            config: "Host example.com\n  IdentityFile ~/.ssh/id_deploy".into(),
        }],
    }
}

fn sample_delivery(webhook_id: i64, event_id: Uuid, redelivery: bool) -> NewDelivery {
    let mut headers = Headers::new();
    headers.set("X-Event", "build.started");
    NewDelivery {
        webhook_id,
        event_id,
        event_type: EventType::BuildStarted,
        error: None,
        redelivery,
        request_headers: headers,
        request_body: "{}".into(),
        response_code: Some(200),
        response_headers: None,
        response_body: Some("ok".into()),
        response_truncated: false,
        duration_ms: 12,
    }
}

// ===========================================================================
// Contracts
// ===========================================================================

async fn build_creation_persists_children<S: KilnStore>(store: &S) {
    let build = store.create_build(sample_build(7)).await.unwrap();
    assert_eq!(build.status, Status::Queued);
    assert!(!build.secret.is_empty());

    let stages = store.stages(build.id).await.unwrap();
    assert_eq!(
        stages.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
        ["build", "test"]
    );
    assert!(stages[1].can_fail);

    let jobs = store.jobs(build.id).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].stage_id, stages[0].id);

    let artifacts = store.artifacts(build.id).await.unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].name, "app.bin");
    assert_eq!(artifacts[0].source, "out/app.bin");
    assert_eq!(artifacts[0].user_id, 7);
    assert!(!artifacts[0].hash.is_empty());
    assert!(!artifacts[0].is_collected());

    let tags = store.tags(build.id).await.unwrap();
    assert_eq!(tags.len(), 1, "duplicate tags collapse");

    let trigger = store.trigger(build.id).await.unwrap();
    assert_eq!(trigger.kind, TriggerKind::Manual);

    assert_eq!(store.variables(build.id).await.unwrap()[0].key, "TOKEN");
    assert_eq!(store.keys(build.id).await.unwrap()[0].name, "id_deploy");
    assert_eq!(store.build_objects(build.id).await.unwrap().len(), 1);
}

async fn build_status_only_moves_forward<S: KilnStore>(store: &S) {
    let build = store.create_build(sample_build(1)).await.unwrap();

    let running = store
        .set_build_status(build.id, Status::Running, None)
        .await
        .unwrap();
    assert!(running.started_at.is_some());

    let done = store
        .set_build_status(build.id, Status::Passed, Some("all good".into()))
        .await
        .unwrap();
    assert_eq!(done.status, Status::Passed);
    assert!(done.finished_at.is_some());
    assert_eq!(done.output.as_deref(), Some("all good"));

    let err = store
        .set_build_status(build.id, Status::Failed, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidTransition { .. }));
}

async fn job_updates_respect_transitions<S: KilnStore>(store: &S) {
    let build = store.create_build(sample_build(1)).await.unwrap();
    let job = store.jobs(build.id).await.unwrap().remove(0);

    let updated = store
        .update_job(
            job.id,
            JobUpdate {
                status: Some(Status::Running),
                started_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.status, Status::Running);

    let err = store
        .update_job(
            job.id,
            JobUpdate {
                status: Some(Status::Queued),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidTransition { .. }));
}

async fn tags_are_unique_per_build<S: KilnStore>(store: &S) {
    let build = store.create_build(sample_build(1)).await.unwrap();
    store.add_tag(build.id, 1, "release").await.unwrap();
    let err = store.add_tag(build.id, 1, "release").await.unwrap_err();
    assert!(matches!(err, StorageError::Conflict(_)));
}

async fn collected_artifacts_and_zero_out<S: KilnStore>(store: &S) {
    let build = store.create_build(sample_build(3)).await.unwrap();
    let artifact = store
        .find_artifact(build.id, "app.bin")
        .await
        .unwrap()
        .expect("pending artifact");
    assert!(store.find_artifact(build.id, "missing").await.unwrap().is_none());

    store
        .record_collected(artifact.id, 16, "md5hex", "shahex")
        .await
        .unwrap();
    let listed = store.user_artifacts(3).await.unwrap();
    assert_eq!(listed[0].size, Some(16));
    assert_eq!(listed[0].sha256.as_deref(), Some("shahex"));

    store
        .zero_out_artifacts(&[artifact.id], Utc::now())
        .await
        .unwrap();
    assert!(store.user_artifacts(3).await.unwrap().is_empty());
    let all = store.artifacts(build.id).await.unwrap();
    assert_eq!(all[0].size, Some(0));
    assert!(all[0].md5.is_none());
    assert!(all[0].deleted_at.is_some());
}

async fn cron_paging_is_keyed_by_id<S: KilnStore>(store: &S) {
    let mut ids = Vec::new();
    for name in ["a", "b", "c"] {
        let cron = store
            .create_cron(NewCron {
                user_id: 1,
                namespace_id: None,
                name: name.into(),
                schedule: Schedule::Daily,
                manifest: String::new(),
            })
            .await
            .unwrap();
        assert!(cron.next_run >= cron.created_at);
        ids.push(cron.id);
    }

    let now = Utc::now();
    assert_eq!(store.count_due(now).await.unwrap(), 0);

    let later = now + Duration::days(2);
    assert_eq!(store.count_due(later).await.unwrap(), 3);

    let first = store.due_crons(later, 0, 2).await.unwrap();
    assert_eq!(first.iter().map(|c| c.id).collect::<Vec<_>>(), ids[..2]);

    // Advancing a row does not shift the next page.
    store
        .record_cron_run(first[0].id, later, later + Duration::days(1))
        .await
        .unwrap();
    let second = store.due_crons(later, first[1].id, 2).await.unwrap();
    assert_eq!(second.iter().map(|c| c.id).collect::<Vec<_>>(), ids[2..]);

    let cron = store.get_cron(ids[0]).await.unwrap();
    assert_eq!(cron.prev_run, Some(later));

    store.link_cron_build(ids[0], 42).await.unwrap();
    assert_eq!(store.cron_builds(ids[0]).await.unwrap(), vec![42]);
}

async fn deliveries_force_redelivery_flag<S: KilnStore>(store: &S) {
    let event_id = Uuid::new_v4();
    assert!(store.original_delivery(9, event_id).await.unwrap().is_none());

    let first = store
        .append_delivery(sample_delivery(9, event_id, false))
        .await
        .unwrap();
    assert!(!first.redelivery);

    let second = store
        .append_delivery(sample_delivery(9, event_id, false))
        .await
        .unwrap();
    assert!(second.redelivery);

    let original = store.original_delivery(9, event_id).await.unwrap().unwrap();
    assert_eq!(original.id, first.id);
    assert_eq!(original.request_headers.get("X-Event"), Some("build.started"));

    let all = store.deliveries(9).await.unwrap();
    assert_eq!(all.iter().filter(|d| !d.redelivery).count(), 1);
    assert_eq!(store.get_delivery(second.id).await.unwrap().id, second.id);
}

async fn namespaces_and_hooks<S: KilnStore>(store: &S) {
    let root = store
        .create_namespace(NewNamespace {
            user_id: 1,
            parent_id: None,
            name: "acme".into(),
            description: String::new(),
            visibility: Visibility::Private,
        })
        .await
        .unwrap();
    let child = store
        .create_namespace(NewNamespace {
            user_id: 1,
            parent_id: Some(root.id),
            name: "web".into(),
            description: String::new(),
            visibility: Visibility::Private,
        })
        .await
        .unwrap();
    assert_eq!(child.root(), root.id);
    assert_eq!(child.path, "acme/web");

    store.add_collaborator(root.id, 5).await.unwrap();
    let root = store.get_namespace(root.id).await.unwrap();
    assert!(root.has_access(Some(5)));

    let events = EventType::BuildStarted | EventType::BuildFinished;
    for active in [true, false] {
        store
            .create_webhook(NewWebhook {
                user_id: 1,
                namespace_id: root.id,
                payload_url: "http://localhost/hook".into(),
                secret: Some("s".into()),
                ssl: false,
                events,
                active,
            })
            .await
            .unwrap();
    }
    let active = store.webhooks(root.id, true).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].events, events);
    assert_eq!(store.webhooks(root.id, false).await.unwrap().len(), 2);
}

async fn users_and_objects<S: KilnStore>(store: &S) {
    let keep = store
        .create_user(NewUser {
            username: "keep".into(),
            email: "keep@example.com".into(),
            cleanup: false,
        })
        .await
        .unwrap();
    let tidy = store
        .create_user(NewUser {
            username: "tidy".into(),
            email: "tidy@example.com".into(),
            cleanup: true,
        })
        .await
        .unwrap();

    let cleanup: Vec<i64> = store
        .cleanup_users()
        .await
        .unwrap()
        .into_iter()
        .map(|u| u.id)
        .collect();
    assert_eq!(cleanup, vec![tidy.id]);
    assert_eq!(
        store.get_users(&[keep.id, 9999]).await.unwrap().len(),
        1,
        "unknown ids are skipped"
    );

    let object = store
        .create_object(NewObject {
            user_id: keep.id,
            namespace_id: None,
            hash: "blob".into(),
            name: "dataset.tar".into(),
            size: 3,
            md5: "m".into(),
            sha256: "s".into(),
        })
        .await
        .unwrap();
    let found = store.find_object(keep.id, "dataset.tar").await.unwrap();
    assert_eq!(found.map(|o| o.id), Some(object.id));
    assert!(store.get_object(-1).await.unwrap_err().is_not_found());
}

// ===========================================================================
// Runners
// ===========================================================================

macro_rules! contract_suite {
    ($($name:ident),* $(,)?) => {
        mod memory {
            use super::*;
            $(
                #[tokio::test]
                async fn $name() {
                    super::$name(&MemoryState::new()).await;
                }
            )*
        }

        mod surreal {
            use super::*;
            $(
                #[tokio::test]
                async fn $name() {
                    let handle = SurrealHandle::setup_db().await.unwrap();
                    super::$name(&handle).await;
                }
            )*
        }
    };
}

contract_suite!(
    build_creation_persists_children,
    build_status_only_moves_forward,
    job_updates_respect_transitions,
    tags_are_unique_per_build,
    collected_artifacts_and_zero_out,
    cron_paging_is_keyed_by_id,
    deliveries_force_redelivery_flag,
    namespaces_and_hooks,
    users_and_objects,
);

#[tokio::test]
async fn trigger_data_round_trips_through_surreal() {
    let handle = SurrealHandle::setup_db().await.unwrap();
    let mut new = sample_build(1);
    new.trigger.data = BTreeMap::from([("ref".to_string(), "main".to_string())]);
    let build = handle.create_build(new).await.unwrap();
    let trigger = handle.trigger(build.id).await.unwrap();
    assert_eq!(trigger.data.get("ref").map(String::as_str), Some("main"));
}

#[tokio::test]
async fn failed_build_writes_leave_nothing_behind() {
    let handle = SurrealHandle::setup_db().await.unwrap();
    let mut clash = sample_build(3);
    clash.stages[1].name = clash.stages[0].name.clone();
    assert!(handle.create_build(clash).await.is_err());

    assert!(handle.get_build(1).await.unwrap_err().is_not_found());
    assert!(handle.trigger(1).await.is_err());
    assert!(handle.stages(1).await.unwrap().is_empty());
    assert!(handle.jobs(1).await.unwrap().is_empty());
    assert!(handle.user_artifacts(3).await.unwrap().is_empty());
    assert!(handle.variables(1).await.unwrap().is_empty());

    let build = handle.create_build(sample_build(3)).await.unwrap();
    assert_eq!(handle.stages(build.id).await.unwrap().len(), 2);
    assert_eq!(handle.user_artifacts(3).await.unwrap().len(), 1);
}

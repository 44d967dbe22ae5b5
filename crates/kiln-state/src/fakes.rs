//! In-memory fakes for storage traits (testing and local runs)
//!
//! `MemoryState` implements every storage trait over a single mutex-guarded
//! set of tables, without any external dependencies.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StorageError;
use crate::new_token;
use crate::model::*;
use crate::storage_traits::*;

#[derive(Debug, Default)]
struct Tables {
    seq: u64,
    builds: BTreeMap<i64, Build>,
    triggers: BTreeMap<i64, Trigger>,
    tags: BTreeMap<i64, Tag>,
    stages: BTreeMap<i64, Stage>,
    jobs: BTreeMap<i64, Job>,
    artifacts: BTreeMap<i64, Artifact>,
    objects: BTreeMap<i64, Object>,
    build_objects: BTreeMap<i64, BuildObject>,
    variables: BTreeMap<i64, Variable>,
    keys: BTreeMap<i64, Key>,
    users: BTreeMap<i64, User>,
    crons: BTreeMap<i64, Cron>,
    cron_builds: Vec<CronBuild>,
    namespaces: BTreeMap<i64, Namespace>,
    webhooks: BTreeMap<i64, Webhook>,
    deliveries: BTreeMap<i64, Delivery>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.seq += 1;
        self.seq as i64
    }
}

/// In-memory implementation of every storage trait.
#[derive(Debug, Default)]
pub struct MemoryState {
    tables: Mutex<Tables>,
    faults: Mutex<HashMap<String, u32>>,
}

impl MemoryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls of `op` fail with a backend error.
    ///
    /// Supported ops: `create_build`, `record_cron_run`, `link_cron_build`
    /// and `set_build_status:<status>`, the latter armed per target status.
    pub fn fail_next(&self, op: impl Into<String>, times: u32) {
        self.faults.lock().unwrap().insert(op.into(), times);
    }

    fn fault(&self, op: &str) -> StorageResult<()> {
        let mut faults = self.faults.lock().unwrap();
        match faults.get_mut(op) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(StorageError::Backend(format!("injected failure: {op}")))
            }
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// BuildStore
// ---------------------------------------------------------------------------

#[async_trait]
impl BuildStore for MemoryState {
    async fn create_build(&self, new: NewBuild) -> StorageResult<Build> {
        self.fault("create_build")?;
        let now = Utc::now();
        let mut t = self.tables.lock().unwrap();

        let build = Build {
            id: t.next_id(),
            user_id: new.user_id,
            namespace_id: new.namespace_id,
            manifest: new.manifest,
            status: Status::Queued,
            output: None,
            secret: new_token(),
            created_at: now,
            started_at: None,
            finished_at: None,
        };

        let trigger = Trigger {
            id: t.next_id(),
            build_id: build.id,
            kind: new.trigger.kind,
            comment: new.trigger.comment,
            data: new.trigger.data,
            created_at: now,
        };
        t.triggers.insert(trigger.id, trigger);

        for name in new.tags {
            if t.tags
                .values()
                .any(|tag| tag.build_id == build.id && tag.name == name)
            {
                continue;
            }
            let tag = Tag {
                id: t.next_id(),
                build_id: build.id,
                user_id: build.user_id,
                name,
                created_at: now,
            };
            t.tags.insert(tag.id, tag);
        }

        for new_stage in new.stages {
            let stage = Stage {
                id: t.next_id(),
                build_id: build.id,
                name: new_stage.name,
                can_fail: new_stage.can_fail,
                created_at: now,
            };
            for new_job in new_stage.jobs {
                let job = Job {
                    id: t.next_id(),
                    build_id: build.id,
                    stage_id: stage.id,
                    name: new_job.name,
                    commands: new_job.commands,
                    depends: new_job.depends,
                    status: Status::Queued,
                    output: None,
                    created_at: now,
                    started_at: None,
                    finished_at: None,
                };
                for mapping in &new_job.artifacts {
                    let artifact = Artifact {
                        id: t.next_id(),
                        user_id: build.user_id,
                        build_id: build.id,
                        job_id: job.id,
                        hash: new_token(),
                        source: mapping.source.clone(),
                        name: mapping.destination.clone(),
                        size: None,
                        md5: None,
                        sha256: None,
                        created_at: now,
                        deleted_at: None,
                    };
                    t.artifacts.insert(artifact.id, artifact);
                }
                t.jobs.insert(job.id, job);
            }
            t.stages.insert(stage.id, stage);
        }

        for o in new.objects {
            let row = BuildObject {
                id: t.next_id(),
                build_id: build.id,
                object_id: o.object_id,
                source: o.source,
                name: o.name,
                placed: false,
                created_at: now,
            };
            t.build_objects.insert(row.id, row);
        }

        for v in new.variables {
            let row = Variable {
                id: t.next_id(),
                build_id: build.id,
                key: v.key,
                value: v.value,
                masked: v.masked,
            };
            t.variables.insert(row.id, row);
        }

        for k in new.keys {
            let row = Key {
                id: t.next_id(),
                build_id: build.id,
                name: k.name,
                key: k.key,
                config: k.config,
            };
            t.keys.insert(row.id, row);
        }

        t.builds.insert(build.id, build.clone());
        Ok(build)
    }

    async fn get_build(&self, id: i64) -> StorageResult<Build> {
        let t = self.tables.lock().unwrap();
        t.builds
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("build", id))
    }

    async fn set_build_status(
        &self,
        id: i64,
        status: Status,
        output: Option<String>,
    ) -> StorageResult<Build> {
        self.fault(&format!("set_build_status:{}", status.as_str()))?;
        let mut t = self.tables.lock().unwrap();
        let build = t
            .builds
            .get_mut(&id)
            .ok_or_else(|| StorageError::not_found("build", id))?;
        if !build.status.can_transition_to(status) {
            return Err(StorageError::InvalidTransition {
                kind: "build",
                id,
                from: build.status,
                to: status,
            });
        }
        let now = Utc::now();
        build.status = status;
        if status == Status::Running {
            build.started_at = Some(now);
        }
        if status.is_terminal() {
            build.finished_at = Some(now);
        }
        if output.is_some() {
            build.output = output;
        }
        Ok(build.clone())
    }

    async fn stages(&self, build_id: i64) -> StorageResult<Vec<Stage>> {
        let t = self.tables.lock().unwrap();
        Ok(t.stages
            .values()
            .filter(|s| s.build_id == build_id)
            .cloned()
            .collect())
    }

    async fn jobs(&self, build_id: i64) -> StorageResult<Vec<Job>> {
        let t = self.tables.lock().unwrap();
        Ok(t.jobs
            .values()
            .filter(|j| j.build_id == build_id)
            .cloned()
            .collect())
    }

    async fn update_job(&self, job_id: i64, update: JobUpdate) -> StorageResult<Job> {
        let mut t = self.tables.lock().unwrap();
        let job = t
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| StorageError::not_found("job", job_id))?;
        if let Some(status) = update.status {
            if !job.status.can_transition_to(status) {
                return Err(StorageError::InvalidTransition {
                    kind: "job",
                    id: job_id,
                    from: job.status,
                    to: status,
                });
            }
            job.status = status;
        }
        if update.output.is_some() {
            job.output = update.output;
        }
        if update.started_at.is_some() {
            job.started_at = update.started_at;
        }
        if update.finished_at.is_some() {
            job.finished_at = update.finished_at;
        }
        Ok(job.clone())
    }

    async fn trigger(&self, build_id: i64) -> StorageResult<Trigger> {
        let t = self.tables.lock().unwrap();
        t.triggers
            .values()
            .find(|tr| tr.build_id == build_id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("trigger", build_id))
    }

    async fn tags(&self, build_id: i64) -> StorageResult<Vec<Tag>> {
        let t = self.tables.lock().unwrap();
        Ok(t.tags
            .values()
            .filter(|tag| tag.build_id == build_id)
            .cloned()
            .collect())
    }

    async fn add_tag(&self, build_id: i64, user_id: i64, name: &str) -> StorageResult<Tag> {
        let mut t = self.tables.lock().unwrap();
        if !t.builds.contains_key(&build_id) {
            return Err(StorageError::not_found("build", build_id));
        }
        if t.tags
            .values()
            .any(|tag| tag.build_id == build_id && tag.name == name)
        {
            return Err(StorageError::Conflict(format!(
                "build {build_id} already tagged {name}"
            )));
        }
        let tag = Tag {
            id: t.next_id(),
            build_id,
            user_id,
            name: name.to_string(),
            created_at: Utc::now(),
        };
        t.tags.insert(tag.id, tag.clone());
        Ok(tag)
    }

    async fn build_objects(&self, build_id: i64) -> StorageResult<Vec<BuildObject>> {
        let t = self.tables.lock().unwrap();
        Ok(t.build_objects
            .values()
            .filter(|o| o.build_id == build_id)
            .cloned()
            .collect())
    }

    async fn mark_object_placed(&self, build_object_id: i64) -> StorageResult<()> {
        let mut t = self.tables.lock().unwrap();
        let row = t
            .build_objects
            .get_mut(&build_object_id)
            .ok_or_else(|| StorageError::not_found("build object", build_object_id))?;
        row.placed = true;
        Ok(())
    }

    async fn variables(&self, build_id: i64) -> StorageResult<Vec<Variable>> {
        let t = self.tables.lock().unwrap();
        Ok(t.variables
            .values()
            .filter(|v| v.build_id == build_id)
            .cloned()
            .collect())
    }

    async fn keys(&self, build_id: i64) -> StorageResult<Vec<Key>> {
        let t = self.tables.lock().unwrap();
        Ok(t.keys
            .values()
            .filter(|k| k.build_id == build_id)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// ArtifactStore
// ---------------------------------------------------------------------------

#[async_trait]
impl ArtifactStore for MemoryState {
    async fn artifacts(&self, build_id: i64) -> StorageResult<Vec<Artifact>> {
        let t = self.tables.lock().unwrap();
        Ok(t.artifacts
            .values()
            .filter(|a| a.build_id == build_id)
            .cloned()
            .collect())
    }

    async fn find_artifact(&self, build_id: i64, name: &str) -> StorageResult<Option<Artifact>> {
        let t = self.tables.lock().unwrap();
        Ok(t.artifacts
            .values()
            .find(|a| a.build_id == build_id && a.name == name && a.deleted_at.is_none())
            .cloned())
    }

    async fn record_collected(
        &self,
        artifact_id: i64,
        size: u64,
        md5: &str,
        sha256: &str,
    ) -> StorageResult<()> {
        let mut t = self.tables.lock().unwrap();
        let a = t
            .artifacts
            .get_mut(&artifact_id)
            .ok_or_else(|| StorageError::not_found("artifact", artifact_id))?;
        a.size = Some(size);
        a.md5 = Some(md5.to_string());
        a.sha256 = Some(sha256.to_string());
        Ok(())
    }

    async fn user_artifacts(&self, user_id: i64) -> StorageResult<Vec<Artifact>> {
        let t = self.tables.lock().unwrap();
        let mut rows: Vec<Artifact> = t
            .artifacts
            .values()
            .filter(|a| a.user_id == user_id && a.deleted_at.is_none())
            .cloned()
            .collect();
        rows.sort_by_key(|a| (a.created_at, a.id));
        Ok(rows)
    }

    async fn zero_out_artifacts(&self, ids: &[i64], at: DateTime<Utc>) -> StorageResult<()> {
        let mut t = self.tables.lock().unwrap();
        for id in ids {
            if let Some(a) = t.artifacts.get_mut(id) {
                a.size = Some(0);
                a.md5 = None;
                a.sha256 = None;
                a.deleted_at = Some(at);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ObjectStore
// ---------------------------------------------------------------------------

#[async_trait]
impl ObjectStore for MemoryState {
    async fn create_object(&self, new: NewObject) -> StorageResult<Object> {
        let mut t = self.tables.lock().unwrap();
        if t.objects
            .values()
            .any(|o| o.user_id == new.user_id && o.name == new.name)
        {
            return Err(StorageError::Conflict(format!(
                "object {} already exists",
                new.name
            )));
        }
        let object = Object {
            id: t.next_id(),
            user_id: new.user_id,
            namespace_id: new.namespace_id,
            hash: new.hash,
            name: new.name,
            size: new.size,
            md5: new.md5,
            sha256: new.sha256,
            created_at: Utc::now(),
        };
        t.objects.insert(object.id, object.clone());
        Ok(object)
    }

    async fn get_object(&self, id: i64) -> StorageResult<Object> {
        let t = self.tables.lock().unwrap();
        t.objects
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("object", id))
    }

    async fn find_object(&self, user_id: i64, name: &str) -> StorageResult<Option<Object>> {
        let t = self.tables.lock().unwrap();
        Ok(t.objects
            .values()
            .find(|o| o.user_id == user_id && o.name == name)
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// UserStore
// ---------------------------------------------------------------------------

#[async_trait]
impl UserStore for MemoryState {
    async fn create_user(&self, new: NewUser) -> StorageResult<User> {
        let mut t = self.tables.lock().unwrap();
        let user = User {
            id: t.next_id(),
            username: new.username,
            email: new.email,
            cleanup: new.cleanup,
            created_at: Utc::now(),
        };
        t.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, id: i64) -> StorageResult<User> {
        let t = self.tables.lock().unwrap();
        t.users
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("user", id))
    }

    async fn get_users(&self, ids: &[i64]) -> StorageResult<Vec<User>> {
        let t = self.tables.lock().unwrap();
        Ok(ids.iter().filter_map(|id| t.users.get(id).cloned()).collect())
    }

    async fn cleanup_users(&self) -> StorageResult<Vec<User>> {
        let t = self.tables.lock().unwrap();
        Ok(t.users.values().filter(|u| u.cleanup).cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// CronStore
// ---------------------------------------------------------------------------

#[async_trait]
impl CronStore for MemoryState {
    async fn create_cron(&self, new: NewCron) -> StorageResult<Cron> {
        let now = Utc::now();
        let mut t = self.tables.lock().unwrap();
        let cron = Cron {
            id: t.next_id(),
            user_id: new.user_id,
            namespace_id: new.namespace_id,
            name: new.name,
            schedule: new.schedule,
            manifest: new.manifest,
            prev_run: None,
            next_run: new.schedule.next(now),
            created_at: now,
        };
        t.crons.insert(cron.id, cron.clone());
        Ok(cron)
    }

    async fn get_cron(&self, id: i64) -> StorageResult<Cron> {
        let t = self.tables.lock().unwrap();
        t.crons
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("cron", id))
    }

    async fn count_due(&self, now: DateTime<Utc>) -> StorageResult<u64> {
        let t = self.tables.lock().unwrap();
        Ok(t.crons.values().filter(|c| c.is_due(now)).count() as u64)
    }

    async fn due_crons(
        &self,
        now: DateTime<Utc>,
        after_id: i64,
        limit: usize,
    ) -> StorageResult<Vec<Cron>> {
        let t = self.tables.lock().unwrap();
        Ok(t.crons
            .range(after_id + 1..)
            .map(|(_, c)| c)
            .filter(|c| c.is_due(now))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn record_cron_run(
        &self,
        id: i64,
        prev_run: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> StorageResult<Cron> {
        self.fault("record_cron_run")?;
        let mut t = self.tables.lock().unwrap();
        let cron = t
            .crons
            .get_mut(&id)
            .ok_or_else(|| StorageError::not_found("cron", id))?;
        cron.prev_run = Some(prev_run);
        cron.next_run = next_run;
        Ok(cron.clone())
    }

    async fn link_cron_build(&self, cron_id: i64, build_id: i64) -> StorageResult<()> {
        self.fault("link_cron_build")?;
        let mut t = self.tables.lock().unwrap();
        t.cron_builds.push(CronBuild { cron_id, build_id });
        Ok(())
    }

    async fn cron_builds(&self, cron_id: i64) -> StorageResult<Vec<i64>> {
        let t = self.tables.lock().unwrap();
        Ok(t.cron_builds
            .iter()
            .filter(|l| l.cron_id == cron_id)
            .map(|l| l.build_id)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// NamespaceStore
// ---------------------------------------------------------------------------

#[async_trait]
impl NamespaceStore for MemoryState {
    async fn create_namespace(&self, new: NewNamespace) -> StorageResult<Namespace> {
        let mut t = self.tables.lock().unwrap();
        let (root_id, path) = match new.parent_id {
            Some(pid) => {
                let parent = t
                    .namespaces
                    .get(&pid)
                    .ok_or_else(|| StorageError::not_found("namespace", pid))?;
                (Some(parent.root()), format!("{}/{}", parent.path, new.name))
            }
            None => (None, new.name.clone()),
        };
        let ns = Namespace {
            id: t.next_id(),
            user_id: new.user_id,
            root_id,
            parent_id: new.parent_id,
            name: new.name,
            path,
            description: new.description,
            visibility: new.visibility,
            collaborators: Vec::new(),
            created_at: Utc::now(),
        };
        t.namespaces.insert(ns.id, ns.clone());
        Ok(ns)
    }

    async fn get_namespace(&self, id: i64) -> StorageResult<Namespace> {
        let t = self.tables.lock().unwrap();
        t.namespaces
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("namespace", id))
    }

    async fn add_collaborator(&self, namespace_id: i64, user_id: i64) -> StorageResult<()> {
        let mut t = self.tables.lock().unwrap();
        let ns = t
            .namespaces
            .get_mut(&namespace_id)
            .ok_or_else(|| StorageError::not_found("namespace", namespace_id))?;
        if !ns.collaborators.contains(&user_id) {
            ns.collaborators.push(user_id);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HookStore
// ---------------------------------------------------------------------------

#[async_trait]
impl HookStore for MemoryState {
    async fn create_webhook(&self, new: NewWebhook) -> StorageResult<Webhook> {
        let mut t = self.tables.lock().unwrap();
        let hook = Webhook {
            id: t.next_id(),
            user_id: new.user_id,
            namespace_id: new.namespace_id,
            payload_url: new.payload_url,
            secret: new.secret,
            ssl: new.ssl,
            events: new.events,
            active: new.active,
            created_at: Utc::now(),
        };
        t.webhooks.insert(hook.id, hook.clone());
        Ok(hook)
    }

    async fn get_webhook(&self, id: i64) -> StorageResult<Webhook> {
        let t = self.tables.lock().unwrap();
        t.webhooks
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("webhook", id))
    }

    async fn webhooks(&self, namespace_id: i64, active_only: bool) -> StorageResult<Vec<Webhook>> {
        let t = self.tables.lock().unwrap();
        Ok(t.webhooks
            .values()
            .filter(|h| h.namespace_id == namespace_id && (h.active || !active_only))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// DeliveryLog
// ---------------------------------------------------------------------------

#[async_trait]
impl DeliveryLog for MemoryState {
    async fn append_delivery(&self, new: NewDelivery) -> StorageResult<Delivery> {
        let mut t = self.tables.lock().unwrap();
        let has_original = t.deliveries.values().any(|d| {
            d.webhook_id == new.webhook_id && d.event_id == new.event_id && !d.redelivery
        });
        let delivery = Delivery {
            id: t.next_id(),
            webhook_id: new.webhook_id,
            event_id: new.event_id,
            event_type: new.event_type,
            error: new.error,
            redelivery: new.redelivery || has_original,
            request_headers: new.request_headers,
            request_body: new.request_body,
            response_code: new.response_code,
            response_headers: new.response_headers,
            response_body: new.response_body,
            response_truncated: new.response_truncated,
            duration_ms: new.duration_ms,
            created_at: Utc::now(),
        };
        t.deliveries.insert(delivery.id, delivery.clone());
        Ok(delivery)
    }

    async fn original_delivery(
        &self,
        webhook_id: i64,
        event_id: Uuid,
    ) -> StorageResult<Option<Delivery>> {
        let t = self.tables.lock().unwrap();
        Ok(t.deliveries
            .values()
            .find(|d| d.webhook_id == webhook_id && d.event_id == event_id && !d.redelivery)
            .cloned())
    }

    async fn deliveries(&self, webhook_id: i64) -> StorageResult<Vec<Delivery>> {
        let t = self.tables.lock().unwrap();
        Ok(t.deliveries
            .values()
            .filter(|d| d.webhook_id == webhook_id)
            .cloned()
            .collect())
    }

    async fn get_delivery(&self, id: i64) -> StorageResult<Delivery> {
        let t = self.tables.lock().unwrap();
        t.deliveries
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("delivery", id))
    }
}

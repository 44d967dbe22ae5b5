//! `BuildStore`, `ArtifactStore` and `ObjectStore` over SurrealDB.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use surrealdb::sql::Datetime as SurrealDatetime;
use tracing::{debug, instrument};

use super::schema::*;
use super::{backend, SurrealHandle};
use crate::error::StorageError;
use crate::new_token;
use crate::model::*;
use crate::storage_traits::*;

#[async_trait]
impl BuildStore for SurrealHandle {
    #[instrument(skip(self, new), fields(user_id = new.user_id))]
    async fn create_build(&self, new: NewBuild) -> StorageResult<Build> {
        let now = Utc::now();
        let build_id = self.next_id("builds").await?;

        let row = BuildRow {
            id: None,
            build_id,
            user_id: new.user_id,
            namespace_id: new.namespace_id,
            manifest: new.manifest,
            status: Status::Queued.as_str().to_string(),
            output: None,
            secret: new_token(),
            created_at: now,
            started_at: None,
            finished_at: None,
        };
        let build = row.clone().into_model()?;
        let mut batch = self.batch().create("builds", row);

        let trigger_id = self.next_id("triggers").await?;
        batch = batch.create(
            "triggers",
            TriggerRow {
                id: None,
                trigger_id,
                build_id,
                kind: new.trigger.kind.as_str().to_string(),
                comment: new.trigger.comment,
                data: new.trigger.data,
                created_at: now,
            },
        );

        let mut seen = Vec::new();
        for name in new.tags {
            if seen.contains(&name) {
                continue;
            }
            seen.push(name.clone());
            let tag_id = self.next_id("tags").await?;
            batch = batch.create(
                "tags",
                TagRow {
                    id: None,
                    tag_id,
                    build_id,
                    user_id: new.user_id,
                    name,
                    created_at: now,
                },
            );
        }

        for stage in new.stages {
            let stage_id = self.next_id("stages").await?;
            batch = batch.create(
                "stages",
                StageRow {
                    id: None,
                    stage_id,
                    build_id,
                    name: stage.name,
                    can_fail: stage.can_fail,
                    created_at: now,
                },
            );

            for job in stage.jobs {
                let job_id = self.next_id("jobs").await?;
                for mapping in &job.artifacts {
                    let artifact_id = self.next_id("artifacts").await?;
                    batch = batch.create(
                        "artifacts",
                        ArtifactRow {
                            id: None,
                            artifact_id,
                            user_id: new.user_id,
                            build_id,
                            job_id,
                            hash: new_token(),
                            source: mapping.source.clone(),
                            name: mapping.destination.clone(),
                            size: None,
                            md5: None,
                            sha256: None,
                            created_at: now,
                            deleted_at: None,
                        },
                    );
                }
                batch = batch.create(
                    "jobs",
                    JobRow {
                        id: None,
                        job_id,
                        build_id,
                        stage_id,
                        name: job.name,
                        commands: job.commands,
                        depends: job.depends,
                        status: Status::Queued.as_str().to_string(),
                        output: None,
                        created_at: now,
                        started_at: None,
                        finished_at: None,
                    },
                );
            }
        }

        for o in new.objects {
            let build_object_id = self.next_id("build_objects").await?;
            batch = batch.create(
                "build_objects",
                BuildObjectRow {
                    id: None,
                    build_object_id,
                    build_id,
                    object_id: o.object_id,
                    source: o.source,
                    name: o.name,
                    placed: false,
                    created_at: now,
                },
            );
        }

        for v in new.variables {
            let variable_id = self.next_id("variables").await?;
            batch = batch.create(
                "variables",
                VariableRow {
                    id: None,
                    variable_id,
                    build_id,
                    name: v.key,
                    value: v.value,
                    masked: v.masked,
                },
            );
        }

        for k in new.keys {
            let key_id = self.next_id("ssh_keys").await?;
            batch = batch.create(
                "ssh_keys",
                KeyRow {
                    id: None,
                    key_id,
                    build_id,
                    name: k.name,
                    private_key: k.key,
                    config: k.config,
                },
            );
        }

        batch.commit().await?;
        debug!(build_id, "build created");
        Ok(build)
    }

    async fn get_build(&self, id: i64) -> StorageResult<Build> {
        self.fetch_one::<BuildRow>("SELECT * FROM builds WHERE build_id = $id", "build", id)
            .await?
            .into_model()
    }

    #[instrument(skip(self, output))]
    async fn set_build_status(
        &self,
        id: i64,
        status: Status,
        output: Option<String>,
    ) -> StorageResult<Build> {
        let current = self.get_build(id).await?;
        if !current.status.can_transition_to(status) {
            return Err(StorageError::InvalidTransition {
                kind: "build",
                id,
                from: current.status,
                to: status,
            });
        }

        let now = SurrealDatetime::from(Utc::now());
        let started_at = (status == Status::Running).then(|| now.clone());
        let finished_at = status.is_terminal().then_some(now);

        self.db
            .query(
                "UPDATE builds SET status = $status, \
                 output = IF $output != NONE THEN $output ELSE output END, \
                 started_at = IF $started_at != NONE THEN $started_at ELSE started_at END, \
                 finished_at = IF $finished_at != NONE THEN $finished_at ELSE finished_at END \
                 WHERE build_id = $id",
            )
            .bind(("status", status.as_str()))
            .bind(("output", output))
            .bind(("started_at", started_at))
            .bind(("finished_at", finished_at))
            .bind(("id", id))
            .await
            .map_err(backend)?;

        self.get_build(id).await
    }

    async fn stages(&self, build_id: i64) -> StorageResult<Vec<Stage>> {
        let rows: Vec<StageRow> = self
            .select_by(
                "SELECT * FROM stages WHERE build_id = $id ORDER BY stage_id ASC",
                build_id,
            )
            .await?;
        Ok(rows.into_iter().map(Stage::from).collect())
    }

    async fn jobs(&self, build_id: i64) -> StorageResult<Vec<Job>> {
        let rows: Vec<JobRow> = self
            .select_by(
                "SELECT * FROM jobs WHERE build_id = $id ORDER BY job_id ASC",
                build_id,
            )
            .await?;
        rows.into_iter().map(JobRow::into_model).collect()
    }

    async fn update_job(&self, job_id: i64, update: JobUpdate) -> StorageResult<Job> {
        let current = self
            .fetch_one::<JobRow>("SELECT * FROM jobs WHERE job_id = $id", "job", job_id)
            .await?
            .into_model()?;

        if let Some(status) = update.status {
            if !current.status.can_transition_to(status) {
                return Err(StorageError::InvalidTransition {
                    kind: "job",
                    id: job_id,
                    from: current.status,
                    to: status,
                });
            }
        }

        self.db
            .query(
                "UPDATE jobs SET \
                 status = IF $status != NONE THEN $status ELSE status END, \
                 output = IF $output != NONE THEN $output ELSE output END, \
                 started_at = IF $started_at != NONE THEN $started_at ELSE started_at END, \
                 finished_at = IF $finished_at != NONE THEN $finished_at ELSE finished_at END \
                 WHERE job_id = $id",
            )
            .bind(("status", update.status.map(|s| s.as_str())))
            .bind(("output", update.output))
            .bind(("started_at", update.started_at.map(SurrealDatetime::from)))
            .bind(("finished_at", update.finished_at.map(SurrealDatetime::from)))
            .bind(("id", job_id))
            .await
            .map_err(backend)?;

        self.fetch_one::<JobRow>("SELECT * FROM jobs WHERE job_id = $id", "job", job_id)
            .await?
            .into_model()
    }

    async fn trigger(&self, build_id: i64) -> StorageResult<Trigger> {
        self.fetch_one::<TriggerRow>(
            "SELECT * FROM triggers WHERE build_id = $id",
            "trigger",
            build_id,
        )
        .await?
        .into_model()
    }

    async fn tags(&self, build_id: i64) -> StorageResult<Vec<Tag>> {
        let rows: Vec<TagRow> = self
            .select_by(
                "SELECT * FROM tags WHERE build_id = $id ORDER BY tag_id ASC",
                build_id,
            )
            .await?;
        Ok(rows.into_iter().map(Tag::from).collect())
    }

    async fn add_tag(&self, build_id: i64, user_id: i64, name: &str) -> StorageResult<Tag> {
        let build = self.get_build(build_id).await?;
        if self.tags(build.id).await?.iter().any(|t| t.name == name) {
            return Err(StorageError::Conflict(format!(
                "build {build_id} already tagged {name}"
            )));
        }
        let row = TagRow {
            id: None,
            tag_id: self.next_id("tags").await?,
            build_id,
            user_id,
            name: name.to_string(),
            created_at: Utc::now(),
        };
        let tag = Tag::from(row.clone());
        self.insert("tags", row).await?;
        Ok(tag)
    }

    async fn build_objects(&self, build_id: i64) -> StorageResult<Vec<BuildObject>> {
        let rows: Vec<BuildObjectRow> = self
            .select_by(
                "SELECT * FROM build_objects WHERE build_id = $id ORDER BY build_object_id ASC",
                build_id,
            )
            .await?;
        Ok(rows.into_iter().map(BuildObject::from).collect())
    }

    async fn mark_object_placed(&self, build_object_id: i64) -> StorageResult<()> {
        let rows: Vec<BuildObjectRow> = self
            .select_by(
                "UPDATE build_objects SET placed = true WHERE build_object_id = $id",
                build_object_id,
            )
            .await?;
        if rows.is_empty() {
            return Err(StorageError::not_found("build object", build_object_id));
        }
        Ok(())
    }

    async fn variables(&self, build_id: i64) -> StorageResult<Vec<Variable>> {
        let rows: Vec<VariableRow> = self
            .select_by(
                "SELECT * FROM variables WHERE build_id = $id ORDER BY variable_id ASC",
                build_id,
            )
            .await?;
        Ok(rows.into_iter().map(Variable::from).collect())
    }

    async fn keys(&self, build_id: i64) -> StorageResult<Vec<Key>> {
        let rows: Vec<KeyRow> = self
            .select_by(
                "SELECT * FROM ssh_keys WHERE build_id = $id ORDER BY key_id ASC",
                build_id,
            )
            .await?;
        Ok(rows.into_iter().map(Key::from).collect())
    }
}

#[async_trait]
impl ArtifactStore for SurrealHandle {
    async fn artifacts(&self, build_id: i64) -> StorageResult<Vec<Artifact>> {
        let rows: Vec<ArtifactRow> = self
            .select_by(
                "SELECT * FROM artifacts WHERE build_id = $id ORDER BY artifact_id ASC",
                build_id,
            )
            .await?;
        Ok(rows.into_iter().map(Artifact::from).collect())
    }

    async fn find_artifact(&self, build_id: i64, name: &str) -> StorageResult<Option<Artifact>> {
        let mut res = self
            .db
            .query(
                "SELECT * FROM artifacts WHERE build_id = $id AND name = $name \
                 AND deleted_at = NONE ORDER BY artifact_id ASC LIMIT 1",
            )
            .bind(("id", build_id))
            .bind(("name", name.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<ArtifactRow> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().next().map(Artifact::from))
    }

    async fn record_collected(
        &self,
        artifact_id: i64,
        size: u64,
        md5: &str,
        sha256: &str,
    ) -> StorageResult<()> {
        let mut res = self
            .db
            .query(
                "UPDATE artifacts SET size = $size, md5 = $md5, sha256 = $sha256 \
                 WHERE artifact_id = $id",
            )
            .bind(("size", size))
            .bind(("md5", md5.to_string()))
            .bind(("sha256", sha256.to_string()))
            .bind(("id", artifact_id))
            .await
            .map_err(backend)?;
        let rows: Vec<ArtifactRow> = res.take(0).map_err(backend)?;
        if rows.is_empty() {
            return Err(StorageError::not_found("artifact", artifact_id));
        }
        Ok(())
    }

    async fn user_artifacts(&self, user_id: i64) -> StorageResult<Vec<Artifact>> {
        let rows: Vec<ArtifactRow> = self
            .select_by(
                "SELECT * FROM artifacts WHERE user_id = $id AND deleted_at = NONE \
                 ORDER BY created_at ASC, artifact_id ASC",
                user_id,
            )
            .await?;
        Ok(rows.into_iter().map(Artifact::from).collect())
    }

    async fn zero_out_artifacts(&self, ids: &[i64], at: DateTime<Utc>) -> StorageResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.db
            .query(
                "UPDATE artifacts SET size = 0, md5 = NONE, sha256 = NONE, deleted_at = $at \
                 WHERE artifact_id IN $ids",
            )
            .bind(("at", SurrealDatetime::from(at)))
            .bind(("ids", ids.to_vec()))
            .await
            .map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for SurrealHandle {
    async fn create_object(&self, new: NewObject) -> StorageResult<Object> {
        if self.find_object(new.user_id, &new.name).await?.is_some() {
            return Err(StorageError::Conflict(format!(
                "object {} already exists",
                new.name
            )));
        }
        let row = ObjectRow {
            id: None,
            object_id: self.next_id("objects").await?,
            user_id: new.user_id,
            namespace_id: new.namespace_id,
            hash: new.hash,
            name: new.name,
            size: new.size,
            md5: new.md5,
            sha256: new.sha256,
            created_at: Utc::now(),
        };
        let object = Object::from(row.clone());
        self.insert("objects", row).await?;
        Ok(object)
    }

    async fn get_object(&self, id: i64) -> StorageResult<Object> {
        self.fetch_one::<ObjectRow>("SELECT * FROM objects WHERE object_id = $id", "object", id)
            .await
            .map(Object::from)
    }

    async fn find_object(&self, user_id: i64, name: &str) -> StorageResult<Option<Object>> {
        let mut res = self
            .db
            .query("SELECT * FROM objects WHERE user_id = $id AND name = $name LIMIT 1")
            .bind(("id", user_id))
            .bind(("name", name.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<ObjectRow> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().next().map(Object::from))
    }
}

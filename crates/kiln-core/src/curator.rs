//! Artifact quota enforcement.
//!
//! For each user who opted into cleanup, artifacts are walked oldest first
//! while their sizes are summed. Once the running total passes the quota,
//! the blob of that artifact and of every later one is removed and the rows
//! are zeroed out, keeping their metadata.

use std::sync::Arc;

use chrono::Utc;
use kiln_state::{ArtifactStore, UserStore};
use tracing::{instrument, warn};

use crate::error::{BlobError, CurateError};
use crate::obs;
use crate::store::Store;

/// What a curation pass reclaimed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CurateReport {
    pub users: usize,
    /// Ids of the zeroed-out artifacts.
    pub artifacts: Vec<i64>,
    pub bytes: u64,
}

pub struct Curator {
    users: Arc<dyn UserStore>,
    artifacts: Arc<dyn ArtifactStore>,
    store: Arc<dyn Store>,
    limit: u64,
}

impl Curator {
    /// `store` is the root artifact store; blobs live in per-user partitions.
    pub fn new(
        users: Arc<dyn UserStore>,
        artifacts: Arc<dyn ArtifactStore>,
        store: Arc<dyn Store>,
        limit: u64,
    ) -> Self {
        Self {
            users,
            artifacts,
            store,
            limit,
        }
    }

    /// Run one pass. Blob removal failures do not stop the pass; they are
    /// returned together once every user has been visited.
    #[instrument(skip(self), fields(limit = self.limit))]
    pub async fn curate(&self) -> Result<CurateReport, CurateError> {
        let mut report = CurateReport::default();
        let mut failures = Vec::new();

        for user in self.users.cleanup_users().await? {
            report.users += 1;
            let mut total = 0u64;
            let mut over = Vec::new();
            for artifact in self.artifacts.user_artifacts(user.id).await? {
                let size = artifact.size.unwrap_or(0);
                total = total.saturating_add(size);
                if total > self.limit {
                    over.push((artifact.id, artifact.hash, size));
                }
            }
            if over.is_empty() {
                continue;
            }

            let partition = self.store.partition(user.id);
            let removed = tokio::task::spawn_blocking(move || {
                over.into_iter()
                    .map(|(id, hash, size)| (id, size, partition.remove(&hash)))
                    .collect::<Vec<_>>()
            })
            .await?;

            let mut zero_out = Vec::new();
            let mut reclaimed = 0u64;
            for (artifact_id, size, outcome) in removed {
                match outcome {
                    Ok(()) => {}
                    Err(e) if e.is_not_exist() => {}
                    Err(e) => {
                        warn!(artifact_id, error = %e, "failed to remove artifact blob");
                        failures.push(BlobError {
                            user_id: user.id,
                            artifact_id,
                            error: e,
                        });
                        continue;
                    }
                }
                reclaimed += size;
                zero_out.push(artifact_id);
            }

            if !zero_out.is_empty() {
                self.artifacts
                    .zero_out_artifacts(&zero_out, Utc::now())
                    .await?;
                obs::emit_curated(user.id, zero_out.len(), reclaimed);
                report.bytes += reclaimed;
                report.artifacts.extend(zero_out);
            }
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(CurateError::Blobs(failures))
        }
    }
}

#[cfg(test)]
mod tests {
    use kiln_state::fakes::MemoryState;
    use kiln_state::model::*;
    use kiln_state::BuildStore;

    use super::*;
    use crate::store::{FsStore, NullStore};

    async fn seed(state: &MemoryState, cleanup: bool, sizes: &[u64]) -> (User, Vec<Artifact>) {
        let user = state
            .create_user(NewUser {
                username: "u".into(),
                email: "u@example.com".into(),
                cleanup,
            })
            .await
            .unwrap();
        let artifacts = Passthrough::parse((0..sizes.len()).map(|i| format!("out/{i}")));
        let build = state
            .create_build(NewBuild {
                user_id: user.id,
                namespace_id: None,
                manifest: String::new(),
                trigger: NewTrigger::new(TriggerKind::Manual, ""),
                tags: vec![],
                stages: vec![NewStage {
                    name: "s".into(),
                    can_fail: false,
                    jobs: vec![NewJob {
                        name: "s.1".into(),
                        commands: vec![],
                        depends: vec![],
                        artifacts,
                    }],
                }],
                objects: vec![],
                variables: vec![],
                keys: vec![],
            })
            .await
            .unwrap();
        let mut out = Vec::new();
        for (artifact, size) in state.artifacts(build.id).await.unwrap().into_iter().zip(sizes) {
            state
                .record_collected(artifact.id, *size, "m", "s")
                .await
                .unwrap();
            out.push(artifact);
        }
        (user, out)
    }

    #[tokio::test]
    async fn reclaims_artifacts_past_the_quota() {
        let state = Arc::new(MemoryState::new());
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsStore::new(dir.path(), 0));

        let (user, artifacts) = seed(&state, true, &[4, 4, 4]).await;
        let partition = store.partition(user.id);
        for a in &artifacts {
            partition.collect(&a.hash, &mut &[1u8; 4][..]).unwrap();
        }

        let curator = Curator::new(state.clone(), state.clone(), store.clone(), 6);
        let report = curator.curate().await.unwrap();
        assert_eq!(report.users, 1);
        assert_eq!(report.artifacts, vec![artifacts[1].id, artifacts[2].id]);
        assert_eq!(report.bytes, 8);

        assert!(partition.stat(&artifacts[0].hash).is_ok());
        assert!(partition.stat(&artifacts[1].hash).unwrap_err().is_not_exist());

        let rows = state.artifacts(artifacts[0].build_id).await.unwrap();
        assert_eq!(rows[0].size, Some(4));
        assert_eq!(rows[1].size, Some(0));
        assert!(rows[1].sha256.is_none());
        assert!(rows[1].deleted_at.is_some());
    }

    #[tokio::test]
    async fn users_without_cleanup_are_untouched() {
        let state = Arc::new(MemoryState::new());
        seed(&state, false, &[100]).await;
        let curator = Curator::new(state.clone(), state.clone(), Arc::new(NullStore), 1);
        let report = curator.curate().await.unwrap();
        assert_eq!(report, CurateReport::default());
    }

    #[tokio::test]
    async fn removal_failures_are_collected() {
        let state = Arc::new(MemoryState::new());
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsStore::new(dir.path(), 0));
        let (user, artifacts) = seed(&state, true, &[5, 5]).await;

        // A directory where the blob should be cannot be removed as a file.
        let part_dir = dir.path().join(user.id.to_string());
        std::fs::create_dir_all(part_dir.join(&artifacts[1].hash)).unwrap();

        let curator = Curator::new(state.clone(), state.clone(), store, 5);
        match curator.curate().await {
            Err(CurateError::Blobs(errors)) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].artifact_id, artifacts[1].id);
            }
            other => panic!("expected blob errors, got {other:?}"),
        }
    }
}

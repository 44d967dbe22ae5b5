//! Turning manifests into persisted builds.

use std::sync::Arc;

use kiln_state::model::{
    Build, BuildEvent, EventType, NewBuild, NewBuildObject, NewJob, NewKey, NewStage, NewTrigger, NewVariable,
    Passthrough,
};
use kiln_state::{BuildStore, ObjectStore};
use tracing::{instrument, warn};

use crate::error::{Result, ValidationError};
use crate::event::EventBus;
use crate::manifest::{Manifest, Source};
use crate::obs;

/// Name of the synthetic stage cloning the manifest's sources.
pub const CLONE_STAGE: &str = "clone sources";

fn clone_commands(source: &Source) -> Vec<String> {
    let mut commands = vec![
        format!("mkdir -p {}", source.dir),
        format!("git clone {} {}", source.url, source.dir),
        format!("cd {}", source.dir),
    ];
    if !source.reference.is_empty() {
        commands.push(format!("git checkout -q {}", source.reference));
    }
    commands
}

/// Stages and jobs for `manifest`, in execution order.
///
/// When the manifest lists sources a `clone sources` stage comes first with
/// one `clone.<n>` job per source, each depending on the one before it.
pub fn plan(manifest: &Manifest) -> Vec<NewStage> {
    let mut stages = Vec::with_capacity(manifest.stages.len() + 1);

    if !manifest.sources.is_empty() {
        let jobs = manifest
            .sources
            .iter()
            .enumerate()
            .map(|(i, source)| NewJob {
                name: format!("clone.{}", i + 1),
                commands: clone_commands(source),
                depends: if i == 0 {
                    Vec::new()
                } else {
                    vec![format!("clone.{i}")]
                },
                artifacts: Passthrough::new(),
            })
            .collect();
        stages.push(NewStage {
            name: CLONE_STAGE.to_string(),
            can_fail: false,
            jobs,
        });
    }

    for stage in &manifest.stages {
        let jobs = manifest
            .stage_jobs(stage)
            .map(|job| NewJob {
                name: job.name.clone(),
                commands: job.commands.clone(),
                depends: job.depends.clone(),
                artifacts: job.artifacts.clone(),
            })
            .collect();
        stages.push(NewStage {
            name: stage.clone(),
            can_fail: manifest.can_fail(stage),
            jobs,
        });
    }
    stages
}

/// Everything needed to submit a build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub user_id: i64,
    pub namespace_id: Option<i64>,
    /// Manifest text, stored verbatim.
    pub manifest: String,
    pub trigger: NewTrigger,
    pub tags: Vec<String>,
    pub variables: Vec<NewVariable>,
    pub keys: Vec<NewKey>,
}

impl BuildRequest {
    pub fn new(user_id: i64, manifest: impl Into<String>, trigger: NewTrigger) -> Self {
        Self {
            user_id,
            namespace_id: None,
            manifest: manifest.into(),
            trigger,
            tags: Vec::new(),
            variables: Vec::new(),
            keys: Vec::new(),
        }
    }

    pub fn with_namespace(mut self, namespace_id: Option<i64>) -> Self {
        self.namespace_id = namespace_id;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Validates, materialises and persists builds.
#[derive(Clone)]
pub struct Creator {
    builds: Arc<dyn BuildStore>,
    objects: Arc<dyn ObjectStore>,
    events: EventBus,
}

impl Creator {
    pub fn new(builds: Arc<dyn BuildStore>, objects: Arc<dyn ObjectStore>, events: EventBus) -> Self {
        Self {
            builds,
            objects,
            events,
        }
    }

    /// Parse and validate the request's manifest, persist the build with all
    /// of its children and publish `build.submitted`.
    ///
    /// Once the build is stored the call succeeds: a failed publish is only
    /// logged, since the build exists either way.
    #[instrument(skip(self, req), fields(user_id = req.user_id))]
    pub async fn create(&self, req: BuildRequest) -> Result<(Build, Manifest)> {
        let manifest = Manifest::parse(&req.manifest)?;
        manifest.validate()?;

        let mut objects = Vec::with_capacity(manifest.objects.len());
        for mapping in manifest.objects.iter() {
            let object = self
                .objects
                .find_object(req.user_id, &mapping.source)
                .await?
                .ok_or_else(|| ValidationError::UnknownObject(mapping.source.clone()))?;
            objects.push(NewBuildObject {
                object_id: Some(object.id),
                source: mapping.source.clone(),
                name: mapping.destination.clone(),
            });
        }

        let build = self
            .builds
            .create_build(NewBuild {
                user_id: req.user_id,
                namespace_id: req.namespace_id,
                manifest: req.manifest,
                trigger: req.trigger,
                tags: req.tags,
                stages: plan(&manifest),
                objects,
                variables: req.variables,
                keys: req.keys,
            })
            .await?;

        obs::emit_build_submitted(build.id, build.user_id, manifest.driver_type());
        if let Err(e) = self
            .events
            .publish(build.namespace_id, EventType::BuildSubmitted, &BuildEvent::from(&build))
            .await
        {
            warn!(build_id = build.id, error = %e, "failed to publish build.submitted");
        }
        Ok((build, manifest))
    }
}

#[cfg(test)]
mod tests {
    use kiln_state::fakes::MemoryState;
    use kiln_state::model::{NewObject, Status, TriggerKind};
    use kiln_state::ArtifactStore;

    use super::*;
    use crate::error::KilnError;

    const WITH_SOURCES: &str = "\
driver: {type: os}
sources:
  - https://example.com/acme/app.git v2
  - https://example.com/acme/lib => vendor/lib
stages: [build, deploy]
allow_failures: [deploy]
jobs:
  - stage: build
    commands: [make]
    artifacts: [out/app]
  - stage: deploy
    commands: [./deploy.sh]
";

    #[test]
    fn plan_prepends_clone_stage() {
        let manifest = Manifest::parse(WITH_SOURCES).unwrap();
        let stages = plan(&manifest);
        let names: Vec<_> = stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, [CLONE_STAGE, "build", "deploy"]);

        let clone = &stages[0];
        assert!(!clone.can_fail);
        assert_eq!(clone.jobs[0].name, "clone.1");
        assert_eq!(
            clone.jobs[0].commands,
            vec![
                "mkdir -p app",
                "git clone https://example.com/acme/app.git app",
                "cd app",
                "git checkout -q v2",
            ]
        );
        assert!(clone.jobs[0].depends.is_empty());
        assert_eq!(clone.jobs[1].commands.len(), 3, "no ref, no checkout");
        assert_eq!(clone.jobs[1].depends, vec!["clone.1"]);

        assert!(!stages[1].can_fail);
        assert!(stages[2].can_fail);
        assert_eq!(stages[1].jobs[0].artifacts.get("out/app"), Some("app"));
    }

    #[test]
    fn plan_without_sources_has_no_clone_stage() {
        let manifest = Manifest::parse(
            "driver: {type: os}\nstages: [list]\njobs:\n  - stage: list\n    commands: [\"true\"]\n",
        )
        .unwrap();
        let stages = plan(&manifest);
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].name, "list");
        assert_eq!(stages[0].jobs[0].name, "list.1");
    }

    fn creator(state: &Arc<MemoryState>) -> Creator {
        Creator::new(state.clone(), state.clone(), EventBus::noop())
    }

    #[tokio::test]
    async fn create_persists_a_queued_build() {
        let state = Arc::new(MemoryState::new());
        let req = BuildRequest::new(1, WITH_SOURCES, NewTrigger::new(TriggerKind::Manual, "go"))
            .with_tag("release");
        let (build, manifest) = creator(&state).create(req).await.unwrap();

        assert_eq!(build.status, Status::Queued);
        assert_eq!(build.manifest, WITH_SOURCES);
        assert_eq!(manifest.stages.len(), 2);
        assert_eq!(state.stages(build.id).await.unwrap().len(), 3);
        assert_eq!(state.tags(build.id).await.unwrap()[0].name, "release");
        assert_eq!(state.artifacts(build.id).await.unwrap()[0].name, "app");
    }

    #[tokio::test]
    async fn create_rejects_invalid_manifests() {
        let state = Arc::new(MemoryState::new());
        let req = BuildRequest::new(
            1,
            "driver: {type: docker}\nstages: [a]\n",
            NewTrigger::new(TriggerKind::Manual, ""),
        );
        let err = creator(&state).create(req).await.unwrap_err();
        assert!(matches!(err, KilnError::Validation(_)));
    }

    #[tokio::test]
    async fn create_resolves_objects_by_name() {
        let state = Arc::new(MemoryState::new());
        let text = "driver: {type: os}\nobjects: [dataset.tar => data/in.tar]\nstages: [a]\n";
        let req = BuildRequest::new(7, text, NewTrigger::new(TriggerKind::Manual, ""));
        let err = creator(&state).create(req.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            KilnError::Validation(ValidationError::UnknownObject(_))
        ));

        let object = state
            .create_object(NewObject {
                user_id: 7,
                namespace_id: None,
                hash: "blob".into(),
                name: "dataset.tar".into(),
                size: 1,
                md5: String::new(),
                sha256: String::new(),
            })
            .await
            .unwrap();
        let (build, _) = creator(&state).create(req).await.unwrap();
        let objects = state.build_objects(build.id).await.unwrap();
        assert_eq!(objects[0].object_id, Some(object.id));
        assert_eq!(objects[0].source, "dataset.tar");
        assert_eq!(objects[0].name, "data/in.tar");
    }

    struct Unreachable;

    #[async_trait::async_trait]
    impl crate::event::Dispatcher for Unreachable {
        async fn dispatch(&self, _event: &kiln_state::model::Event) -> Result<()> {
            Err(KilnError::Queue("subscriber down".into()))
        }
    }

    #[tokio::test]
    async fn stored_builds_survive_a_failed_publish() {
        let state = Arc::new(MemoryState::new());
        let creator = Creator::new(
            state.clone(),
            state.clone(),
            EventBus::new(Arc::new(Unreachable)),
        );
        let req = BuildRequest::new(1, WITH_SOURCES, NewTrigger::new(TriggerKind::Manual, "go"));
        let (build, _) = creator.create(req).await.unwrap();
        assert_eq!(state.get_build(build.id).await.unwrap().status, Status::Queued);
    }
}

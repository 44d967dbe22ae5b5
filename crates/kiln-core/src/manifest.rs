//! Build manifests.
//!
//! A manifest is a YAML document describing the driver, environment,
//! objects, sources, stages and jobs of a build. Only a strict subset of
//! YAML is accepted: anchors, aliases, tags, directives and multi-document
//! streams are rejected before the document is deserialised.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use kiln_state::model::{base_name, Passthrough};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

const ARROW: &str = "=>";

/// Drivers a manifest may name.
pub const DRIVERS: [&str; 4] = ["docker", "qemu", "ssh", "os"];

/// Driver configuration: a flat map of scalar values, `type` required.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Driver(BTreeMap<String, String>);

impl Driver {
    pub fn new(kind: impl Into<String>) -> Self {
        let mut map = BTreeMap::new();
        map.insert("type".to_string(), kind.into());
        Self(map)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// The driver type, or `""` when missing.
    pub fn kind(&self) -> &str {
        self.get("type").unwrap_or("")
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    fn require(&self, driver: &'static str, field: &'static str) -> Result<(), ValidationError> {
        match self.get(field) {
            Some(v) if !v.trim().is_empty() => Ok(()),
            _ => Err(ValidationError::MissingDriverField { driver, field }),
        }
    }
}

impl<'de> Deserialize<'de> for Driver {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, serde_yaml::Value>::deserialize(deserializer)?;
        let mut map = BTreeMap::new();
        for (key, value) in raw {
            let value = match value {
                serde_yaml::Value::Null => String::new(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::String(s) => s,
                _ => {
                    return Err(de::Error::custom(ValidationError::DriverValue { key }));
                }
            };
            map.insert(key, value);
        }
        Ok(Self(map))
    }
}

/// A repository to clone before the first stage: `URL [REF] [=> DIR]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Source {
    pub url: String,
    /// Ref to check out after cloning; empty for the default branch.
    pub reference: String,
    pub dir: String,
}

impl Source {
    pub fn parse(line: &str) -> Result<Source, ValidationError> {
        let line = line.trim();
        let (url, tail) = match line.split_once(char::is_whitespace) {
            Some((url, tail)) => (url, tail),
            None => (line, ""),
        };
        // `URL=>DIR` without spaces still names a directory.
        let (url, tail) = match url.split_once(ARROW) {
            Some((url, rest)) => (url, format!("{ARROW}{rest} {tail}")),
            None => (url, tail.to_string()),
        };
        if url.is_empty() {
            return Err(ValidationError::InvalidSource(line.to_string()));
        }

        let (before, dir) = match tail.split_once(ARROW) {
            Some((before, dir)) => (before, dir.trim()),
            None => (tail.as_str(), ""),
        };
        let reference = before.split_whitespace().next().unwrap_or("").to_string();
        let dir = if dir.is_empty() {
            default_dir(url)
        } else {
            dir.to_string()
        };

        Ok(Source {
            url: url.to_string(),
            reference,
            dir,
        })
    }
}

fn default_dir(url: &str) -> String {
    let base = base_name(url);
    base.strip_suffix(".git").unwrap_or(base).to_string()
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)?;
        if !self.reference.is_empty() {
            write!(f, " {}", self.reference)?;
        }
        write!(f, " {} {}", ARROW, self.dir)
    }
}

impl TryFrom<String> for Source {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Source::parse(&s)
    }
}

impl From<Source> for String {
    fn from(s: Source) -> Self {
        s.to_string()
    }
}

/// A job as written in the manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestJob {
    pub stage: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, deserialize_with = "commands")]
    pub commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends: Vec<String>,
    #[serde(default, skip_serializing_if = "Passthrough::is_empty")]
    pub artifacts: Passthrough,
}

/// Commands are a list of lines, or a single block split on newlines.
fn commands<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Commands {
        List(Vec<String>),
        Block(String),
    }

    Ok(match Commands::deserialize(deserializer)? {
        Commands::List(list) => list,
        Commands::Block(block) => block
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.trim().is_empty())
            .map(String::from)
            .collect(),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default)]
    pub driver: Driver,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Passthrough::is_empty")]
    pub objects: Passthrough,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub stages: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_failures: Vec<String>,
    #[serde(default)]
    pub jobs: Vec<ManifestJob>,
}

impl Manifest {
    /// Parse manifest text. Unnamed jobs are named `<stage>.<n>`, `n` being
    /// the job's 1-based position among the jobs of its stage.
    pub fn parse(text: &str) -> Result<Manifest, ValidationError> {
        check_subset(text)?;
        let mut manifest: Manifest =
            serde_yaml::from_str(text).map_err(|e| ValidationError::Yaml(e.to_string()))?;
        manifest.name_jobs();
        Ok(manifest)
    }

    /// Canonical YAML form. Parsing it yields an equal manifest.
    pub fn to_yaml(&self) -> Result<String, ValidationError> {
        serde_yaml::to_string(self).map_err(|e| ValidationError::Yaml(e.to_string()))
    }

    fn name_jobs(&mut self) {
        let mut positions: BTreeMap<String, usize> = BTreeMap::new();
        for job in &mut self.jobs {
            let n = positions.entry(job.stage.clone()).or_insert(0);
            *n += 1;
            if job.name.is_empty() {
                job.name = format!("{}.{}", job.stage, n);
            }
        }
    }

    pub fn driver_type(&self) -> &str {
        self.driver.kind()
    }

    /// Jobs of `stage` in manifest order.
    pub fn stage_jobs<'a>(&'a self, stage: &'a str) -> impl Iterator<Item = &'a ManifestJob> {
        self.jobs.iter().filter(move |j| j.stage == stage)
    }

    pub fn can_fail(&self, stage: &str) -> bool {
        self.allow_failures.iter().any(|s| s == stage)
    }

    /// `env` entries split into key and value.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .filter_map(|e| e.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Driver-specific checks only.
    pub fn validate_driver(&self) -> Result<(), ValidationError> {
        match self.driver.kind() {
            "" => Err(ValidationError::MissingDriverType),
            "docker" => {
                self.driver.require("docker", "image")?;
                self.driver.require("docker", "workspace")
            }
            "qemu" => self.driver.require("qemu", "image"),
            "ssh" => self.driver.require("ssh", "address"),
            "os" => Ok(()),
            other => Err(ValidationError::UnknownDriver(other.to_string())),
        }
    }

    /// Full validation: driver, stages, env and job references.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.validate_driver()?;

        if self.stages.is_empty() {
            return Err(ValidationError::NoStages);
        }
        let mut stages = HashSet::new();
        for stage in &self.stages {
            if !stages.insert(stage.as_str()) {
                return Err(ValidationError::DuplicateStage(stage.clone()));
            }
        }
        for stage in &self.allow_failures {
            if !stages.contains(stage.as_str()) {
                return Err(ValidationError::UnknownAllowedFailure(stage.clone()));
            }
        }
        for entry in &self.env {
            match entry.split_once('=') {
                Some((key, _)) if !key.trim().is_empty() => {}
                _ => return Err(ValidationError::InvalidEnv(entry.clone())),
            }
        }

        let mut seen = HashSet::new();
        for job in &self.jobs {
            if !stages.contains(job.stage.as_str()) {
                return Err(ValidationError::UnknownStage {
                    job: job.name.clone(),
                    stage: job.stage.clone(),
                });
            }
            if !seen.insert((job.stage.as_str(), job.name.as_str())) {
                return Err(ValidationError::DuplicateJob {
                    stage: job.stage.clone(),
                    name: job.name.clone(),
                });
            }
        }

        let mut destinations = HashSet::new();
        for mapping in &self.objects {
            if !destinations.insert(mapping.destination.as_str()) {
                return Err(ValidationError::DuplicateObjectDestination(
                    mapping.destination.clone(),
                ));
            }
        }
        let mut published = HashSet::new();
        for mapping in self.jobs.iter().flat_map(|j| &j.artifacts) {
            if !published.insert(mapping.destination.as_str()) {
                return Err(ValidationError::DuplicateArtifact(mapping.destination.clone()));
            }
        }

        // Dependencies resolve to a sibling or to a job of an earlier stage,
        // the clone jobs included.
        let mut earlier: HashSet<String> = (1..=self.sources.len())
            .map(|n| format!("clone.{n}"))
            .collect();
        for stage in &self.stages {
            let siblings: HashSet<&str> = self.stage_jobs(stage).map(|j| j.name.as_str()).collect();
            for job in self.stage_jobs(stage) {
                for dep in &job.depends {
                    let sibling = dep != &job.name && siblings.contains(dep.as_str());
                    if !sibling && !earlier.contains(dep) {
                        return Err(ValidationError::UnknownDependency {
                            job: job.name.clone(),
                            dependency: dep.clone(),
                        });
                    }
                }
            }
            earlier.extend(siblings.into_iter().map(String::from));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Strict subset
// ---------------------------------------------------------------------------

fn unsupported(feature: &'static str, line: usize) -> ValidationError {
    ValidationError::UnsupportedYaml { feature, line }
}

fn is_marker(line: &str, marker: &str) -> bool {
    line.strip_prefix(marker)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with([' ', '\t']))
}

/// Reject YAML features outside the manifest subset.
fn check_subset(text: &str) -> Result<(), ValidationError> {
    let mut scanner = Scanner::default();
    let mut seen_content = false;
    let mut ended = false;
    let mut block_parent: Option<usize> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let indent = raw.len() - raw.trim_start_matches(' ').len();
        let trimmed = raw.trim();

        if let Some(parent) = block_parent {
            if trimmed.is_empty() || indent > parent {
                continue;
            }
            block_parent = None;
        }

        let mut line = raw;
        if scanner.quote.is_none() {
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if raw.starts_with('%') {
                return Err(unsupported("directive", line_no));
            }
            if is_marker(raw, "---") {
                if seen_content || ended {
                    return Err(unsupported("multi-document stream", line_no));
                }
                line = &raw[3..];
                if line.trim().is_empty() || line.trim().starts_with('#') {
                    continue;
                }
            }
            if is_marker(raw, "...") {
                ended = true;
                continue;
            }
            if ended {
                return Err(unsupported("multi-document stream", line_no));
            }
        }

        seen_content = true;
        if scanner.scan_line(line, line_no)? {
            block_parent = Some(indent);
        }
    }
    Ok(())
}

#[derive(Default)]
struct Scanner {
    quote: Option<char>,
    flow: usize,
}

impl Scanner {
    /// Scan one line. Returns true when the line opens a block scalar.
    fn scan_line(&mut self, line: &str, line_no: usize) -> Result<bool, ValidationError> {
        let chars: Vec<char> = line.chars().collect();
        let ws = |i: usize| chars.get(i).map_or(true, |c| c.is_whitespace());
        let mut node_start = self.quote.is_none();
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];

            if let Some(q) = self.quote {
                if q == '\'' && c == '\'' {
                    if chars.get(i + 1) == Some(&'\'') {
                        i += 2;
                        continue;
                    }
                    self.quote = None;
                } else if q == '"' && c == '\\' {
                    i += 2;
                    continue;
                } else if q == '"' && c == '"' {
                    self.quote = None;
                }
                i += 1;
                continue;
            }

            if c.is_whitespace() {
                i += 1;
                continue;
            }
            if c == '#' && (i == 0 || chars[i - 1].is_whitespace()) {
                break;
            }

            if node_start {
                match c {
                    '&' => return Err(unsupported("anchor", line_no)),
                    '*' => return Err(unsupported("alias", line_no)),
                    '!' => return Err(unsupported("tag", line_no)),
                    '\'' | '"' => {
                        self.quote = Some(c);
                        node_start = false;
                        i += 1;
                        continue;
                    }
                    '|' | '>' => return Ok(true),
                    '[' | '{' => {
                        self.flow += 1;
                        i += 1;
                        continue;
                    }
                    '-' | '?' if ws(i + 1) => {
                        i += 1;
                        continue;
                    }
                    _ => node_start = false,
                }
            }

            match c {
                ':' if ws(i + 1) || (self.flow > 0 && matches!(chars.get(i + 1), Some(',' | ']' | '}'))) => {
                    node_start = true
                }
                ',' if self.flow > 0 => node_start = true,
                ']' | '}' if self.flow > 0 => self.flow -= 1,
                _ => {}
            }
            i += 1;
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = "\
driver:
  type: os
stages: [list]
jobs:
  - stage: list
    commands: [\"true\"]
";

    fn manifest(driver: Driver) -> Manifest {
        Manifest {
            driver,
            stages: vec!["build".into()],
            jobs: vec![ManifestJob {
                stage: "build".into(),
                name: "build.1".into(),
                commands: vec!["make".into()],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn parses_and_names_jobs() {
        let m = Manifest::parse(SIMPLE).unwrap();
        assert_eq!(m.driver_type(), "os");
        assert_eq!(m.stages, vec!["list"]);
        assert_eq!(m.jobs[0].name, "list.1");
        assert_eq!(m.jobs[0].commands, vec!["true"]);
        m.validate().unwrap();
    }

    #[test]
    fn job_names_count_per_stage() {
        let text = "\
driver: {type: os}
stages: [a, b]
jobs:
  - stage: a
    name: first
    commands: [x]
  - stage: b
    commands: [y]
  - stage: a
    commands: [z]
";
        let m = Manifest::parse(text).unwrap();
        let names: Vec<_> = m.jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, ["first", "b.1", "a.2"]);
    }

    #[test]
    fn commands_accept_a_block() {
        let text = "\
driver: {type: os}
stages: [s]
jobs:
  - stage: s
    commands: |
      echo one
      echo *.txt
";
        let m = Manifest::parse(text).unwrap();
        assert_eq!(m.jobs[0].commands, vec!["echo one", "echo *.txt"]);
    }

    #[test]
    fn driver_scalars_become_strings() {
        let m = Manifest::parse("driver: {type: os, timeout: 60, privileged: true}\nstages: [s]\n")
            .unwrap();
        assert_eq!(m.driver.get("timeout"), Some("60"));
        assert_eq!(m.driver.get("privileged"), Some("true"));
    }

    #[test]
    fn rejects_yaml_outside_the_subset() {
        let cases = [
            ("base: &b {type: os}\ndriver: *b\n", "anchor"),
            ("driver:\n  type: *t\n", "alias"),
            ("driver: !custom {type: os}\n", "tag"),
            ("driver: {type: os}\n---\nstages: [a]\n", "multi-document stream"),
            ("%YAML 1.2\n---\ndriver: {type: os}\n", "directive"),
        ];
        for (text, feature) in cases {
            match Manifest::parse(text) {
                Err(ValidationError::UnsupportedYaml { feature: f, .. }) => assert_eq!(f, feature),
                other => panic!("{text:?}: expected {feature}, got {other:?}"),
            }
        }
    }

    #[test]
    fn subset_ignores_indicators_inside_scalars() {
        let text = "\
---
# leading document marker is fine
driver:
  type: os
env:
  - \"GLOB=*.rs\"
  - 'TAG=!important'
stages: [s]
jobs:
  - stage: s
    commands:
      - ls *.txt && echo done # trailing & comment
      - echo 'it''s *fine*'
";
        Manifest::parse(text).unwrap();
    }

    #[test]
    fn source_parsing() {
        let s = Source::parse("https://example.com/acme/app.git").unwrap();
        assert_eq!(s.dir, "app");
        assert_eq!(s.reference, "");

        let s = Source::parse("https://example.com/acme/app.git v1.2").unwrap();
        assert_eq!((s.reference.as_str(), s.dir.as_str()), ("v1.2", "app"));

        let s = Source::parse("https://example.com/acme/app   =>   src/app").unwrap();
        assert_eq!((s.reference.as_str(), s.dir.as_str()), ("", "src/app"));

        let s = Source::parse("https://example.com/acme/app.git main => code").unwrap();
        assert_eq!((s.reference.as_str(), s.dir.as_str()), ("main", "code"));

        let s = Source::parse("git@example.com:acme/tool.git=>vendor/tool").unwrap();
        assert_eq!(s.url, "git@example.com:acme/tool.git");
        assert_eq!(s.dir, "vendor/tool");

        assert!(Source::parse("   ").is_err());
    }

    #[test]
    fn source_without_tail_defaults_dir_for_many_urls() {
        for url in [
            "https://example.com/a/b.git",
            "https://example.com/a/b",
            "git://host/x/repo.git",
            "ssh://git@host:22/r.git.git",
        ] {
            let s = Source::parse(url).unwrap();
            let base = base_name(url);
            assert_eq!(s.dir, base.strip_suffix(".git").unwrap_or(base));
            assert_eq!(s.reference, "");
        }
    }

    #[test]
    fn docker_requires_image_and_workspace() {
        for (image, workspace, ok) in [
            ("", "", false),
            ("alpine", "", false),
            ("", "/src", false),
            ("alpine", "/src", true),
        ] {
            let m = manifest(
                Driver::new("docker")
                    .with("image", image)
                    .with("workspace", workspace),
            );
            assert_eq!(m.validate().is_ok(), ok, "image={image:?} workspace={workspace:?}");
        }
    }

    #[test]
    fn driver_requirements() {
        assert!(manifest(Driver::new("qemu")).validate().is_err());
        manifest(Driver::new("qemu").with("image", "debian")).validate().unwrap();
        assert!(manifest(Driver::new("ssh")).validate().is_err());
        manifest(Driver::new("ssh").with("address", "10.0.0.2:22")).validate().unwrap();
        manifest(Driver::new("os")).validate().unwrap();
        assert_eq!(
            manifest(Driver::new("lxc")).validate().unwrap_err(),
            ValidationError::UnknownDriver("lxc".into())
        );
        assert_eq!(
            manifest(Driver::default()).validate().unwrap_err(),
            ValidationError::MissingDriverType
        );
    }

    #[test]
    fn structural_validation() {
        let mut m = manifest(Driver::new("os"));
        m.allow_failures = vec!["deploy".into()];
        assert!(matches!(
            m.validate(),
            Err(ValidationError::UnknownAllowedFailure(_))
        ));

        let mut m = manifest(Driver::new("os"));
        m.env = vec!["NOEQUALS".into()];
        assert!(matches!(m.validate(), Err(ValidationError::InvalidEnv(_))));

        let mut m = manifest(Driver::new("os"));
        m.jobs[0].stage = "missing".into();
        assert!(matches!(m.validate(), Err(ValidationError::UnknownStage { .. })));

        let mut m = manifest(Driver::new("os"));
        m.stages.clear();
        assert_eq!(m.validate().unwrap_err(), ValidationError::NoStages);
    }

    #[test]
    fn dependencies_resolve_to_siblings_or_earlier_stages() {
        let text = "\
driver: {type: os}
sources: [https://example.com/app.git]
stages: [build, test]
jobs:
  - stage: build
    name: compile
    commands: [make]
    depends: [clone.1]
  - stage: build
    name: lint
    commands: [make lint]
    depends: [compile]
  - stage: test
    commands: [make test]
    depends: [compile]
";
        Manifest::parse(text).unwrap().validate().unwrap();

        let bad = text.replace(
            "commands: [make test]\n    depends: [compile]",
            "commands: [make test]\n    depends: [deploy]",
        );
        assert!(matches!(
            Manifest::parse(&bad).unwrap().validate(),
            Err(ValidationError::UnknownDependency { .. })
        ));

        let forward = text.replace("depends: [clone.1]", "depends: [test.1]");
        assert!(Manifest::parse(&forward).unwrap().validate().is_err());
    }

    #[test]
    fn published_names_and_object_destinations_are_unique() {
        let text = "\
driver: {type: os}
objects: [seed => a/seed, seed => b/seed]
stages: [build]
jobs:
  - stage: build
    commands: [make]
    artifacts: [out.bin => bin, out.bin => copy]
";
        let m = Manifest::parse(text).unwrap();
        m.validate().unwrap();
        assert_eq!(m.objects.len(), 2);
        assert_eq!(m.jobs[0].artifacts.len(), 2);

        let clash = text.replace("out.bin => copy", "log.txt => bin");
        assert_eq!(
            Manifest::parse(&clash).unwrap().validate().unwrap_err(),
            ValidationError::DuplicateArtifact("bin".into())
        );

        let clash = text.replace("seed => b/seed", "other => a/seed");
        assert_eq!(
            Manifest::parse(&clash).unwrap().validate().unwrap_err(),
            ValidationError::DuplicateObjectDestination("a/seed".into())
        );
    }

    #[test]
    fn canonical_text_round_trips() {
        let text = "\
namespace: acme
driver:
  type: docker
  image: alpine
  workspace: /src
env: [A=1, B=two]
objects: [data.tar => /tmp/data.tar]
sources:
  - https://example.com/app.git main
stages: [build, deploy]
allow_failures: [deploy]
jobs:
  - stage: deploy
    commands: [./deploy]
  - stage: build
    commands: [make, make test]
    artifacts: [bin/app]
";
        let m = Manifest::parse(text).unwrap();
        let again = Manifest::parse(&m.to_yaml().unwrap()).unwrap();
        assert_eq!(m, again);
        assert_eq!(again.stages, vec!["build", "deploy"]);
        assert_eq!(again.jobs[0].name, "deploy.1");
        assert_eq!(again.sources[0].dir, "app");
    }
}

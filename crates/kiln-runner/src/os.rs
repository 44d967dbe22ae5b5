//! The `os` driver: runs jobs as shell scripts on the host.
//!
//! Every build gets a private temporary workspace. Objects are placed and
//! artifacts collected relative to it, and keys are installed under
//! `.ssh/` inside it. Each job runs its commands as a single `sh` script
//! with `set -e`, echoing every command before running it.
//!
//! Driver options:
//! - `timeout`: per-job limit in seconds (default: none)
//! - `shell`: interpreter for job scripts (default: `sh`)

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kiln_core::manifest::Driver as DriverSpec;
use kiln_core::store::Store;
use kiln_state::model::Status;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::driver::{Collector, Driver, DriverFactory, Environment, Job};
use crate::error::DriverError;
use crate::output::Output;

pub const KIND: &str = "os";

const DEFAULT_SHELL: &str = "sh";

struct Workspace {
    dir: TempDir,
    env: Vec<(String, String)>,
}

pub struct OsDriver {
    root: Option<PathBuf>,
    shell: String,
    timeout: Option<Duration>,
    workspace: Mutex<Option<Workspace>>,
}

impl OsDriver {
    /// A driver whose workspaces live under `root`, or the system temp
    /// directory when `None`.
    pub fn new(root: Option<PathBuf>) -> Self {
        Self {
            root,
            shell: DEFAULT_SHELL.to_string(),
            timeout: None,
            workspace: Mutex::new(None),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Configure a driver from the manifest's driver map.
    pub fn from_spec(root: Option<PathBuf>, spec: &DriverSpec) -> Result<Self, DriverError> {
        let mut driver = Self::new(root);
        if let Some(value) = spec.get("timeout") {
            let secs: u64 = value.trim().parse().map_err(|_| DriverError::Option {
                key: "timeout".into(),
                value: value.to_string(),
            })?;
            driver.timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(shell) = spec.get("shell").filter(|s| !s.trim().is_empty()) {
            driver.shell = shell.to_string();
        }
        Ok(driver)
    }

    /// Registry factory creating `os` drivers under `root`.
    pub fn factory(root: Option<PathBuf>) -> DriverFactory {
        Arc::new(move |spec: &DriverSpec| {
            Ok(Arc::new(OsDriver::from_spec(root.clone(), spec)?) as Arc<dyn Driver>)
        })
    }

    /// Workspace directory of the current build, if created.
    pub async fn workspace(&self) -> Option<PathBuf> {
        self.workspace
            .lock()
            .await
            .as_ref()
            .map(|ws| ws.dir.path().to_path_buf())
    }

    fn make_dir(&self) -> io::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("kiln-build-");
        match &self.root {
            Some(root) => {
                fs::create_dir_all(root)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
    }
}

/// Resolve a guest path relative to the workspace. Absolute paths are
/// taken relative to the workspace root; `..` is rejected.
fn guest_path(root: &Path, path: &str) -> Option<PathBuf> {
    let rel = Path::new(path.trim_start_matches('/'));
    if rel.as_os_str().is_empty() || rel.components().any(|c| matches!(c, Component::ParentDir)) {
        return None;
    }
    Some(root.join(rel))
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// The script run for a job.
pub fn script(commands: &[String]) -> String {
    let mut out = String::from("set -e\n");
    for cmd in commands {
        out.push_str(&format!("printf '%s\\n' {}\n", quote(&format!("$ {cmd}"))));
        out.push_str(cmd);
        out.push('\n');
    }
    out
}

fn parse_env(env: &[String]) -> Result<Vec<(String, String)>, DriverError> {
    env.iter()
        .map(|kv| match kv.split_once('=') {
            Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
            _ => Err(DriverError::Setup(format!("invalid env entry {kv:?}"))),
        })
        .collect()
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

async fn pump<R: AsyncRead + Unpin>(reader: Option<R>, output: Output) {
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        output.line(&line);
    }
}

async fn wait(child: &mut Child, output: &Output) -> io::Result<ExitStatus> {
    let stdout = pump(child.stdout.take(), output.clone());
    let stderr = pump(child.stderr.take(), output.clone());
    let (_, _, status) = tokio::join!(stdout, stderr, child.wait());
    status
}

#[async_trait]
impl Driver for OsDriver {
    #[instrument(skip_all)]
    async fn create(&self, env: Environment) -> Result<(), DriverError> {
        let mut vars = parse_env(&env.env)?;
        let dir = self.make_dir()?;
        debug!(workspace = %dir.path().display(), "workspace created");

        for mapping in env.objects.iter() {
            let dest = guest_path(dir.path(), &mapping.destination).ok_or_else(|| {
                DriverError::Setup(format!("invalid object destination {:?}", mapping.destination))
            })?;
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = tokio::fs::File::create(&dest).await?.into_std().await;
            env.placer
                .place(&mapping.source, Box::new(file))
                .await
                .map_err(|source| DriverError::Place {
                    name: mapping.source.clone(),
                    source,
                })?;
            env.output
                .line(&format!("placed {} => {}", mapping.source, mapping.destination));
        }

        if !env.keys.is_empty() {
            let ssh = dir.path().join(".ssh");
            tokio::fs::create_dir_all(&ssh).await?;
            set_mode(&ssh, 0o700).await?;
            for name in env.keys.names() {
                let mut body = Vec::new();
                env.keys.place(&name, &mut body).map_err(|e| DriverError::Place {
                    name: name.clone(),
                    source: e.into(),
                })?;
                let path = ssh.join(&name);
                tokio::fs::write(&path, body).await?;
                set_mode(&path, 0o600).await?;
            }
            vars.push((
                "GIT_SSH_COMMAND".into(),
                format!("ssh -F {}", ssh.join(crate::keychain::CONFIG).display()),
            ));
        }

        *self.workspace.lock().await = Some(Workspace { dir, env: vars });
        Ok(())
    }

    #[instrument(skip_all, fields(job = %job.name))]
    async fn execute(&self, job: &mut Job, collector: Arc<dyn Collector>) {
        let Some((root, env)) = self
            .workspace
            .lock()
            .await
            .as_ref()
            .map(|ws| (ws.dir.path().to_path_buf(), ws.env.clone()))
        else {
            job.fail(Status::Failed, DriverError::NotCreated.to_string());
            return;
        };
        job.status = Status::Running;

        let spawned = Command::new(&self.shell)
            .arg("-c")
            .arg(script(&job.commands))
            .current_dir(&root)
            .envs(env)
            .env("KILN_JOB", &job.name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                job.fail(Status::Failed, format!("spawn {}: {e}", self.shell));
                return;
            }
        };

        let outcome = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, wait(&mut child, &job.output))
                .await
                .ok(),
            None => Some(wait(&mut child, &job.output).await),
        };
        match outcome {
            None => {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill timed out job");
                }
                let secs = self.timeout.map(|t| t.as_secs()).unwrap_or_default();
                job.fail(Status::TimedOut, format!("timed out after {secs}s"));
                return;
            }
            Some(Ok(status)) if status.success() => {}
            Some(Ok(status)) => {
                job.fail(Status::Failed, format!("commands exited with {status}"));
                return;
            }
            Some(Err(e)) => {
                job.fail(Status::Failed, format!("waiting for commands: {e}"));
                return;
            }
        }

        let mut collected = true;
        for mapping in job.artifacts.clone().iter() {
            let Some(path) = guest_path(&root, &mapping.source) else {
                job.fail(Status::Failed, format!("invalid artifact path {:?}", mapping.source));
                collected = false;
                continue;
            };
            let file = match tokio::fs::File::open(&path).await {
                Ok(file) => file.into_std().await,
                Err(e) => {
                    job.fail(Status::Failed, format!("artifact {}: {e}", mapping.source));
                    collected = false;
                    continue;
                }
            };
            match collector.collect(&mapping.destination, Box::new(file)).await {
                Ok(n) => job
                    .output
                    .line(&format!("collected {} ({n} bytes)", mapping.destination)),
                Err(e) => {
                    job.fail(Status::Failed, format!("artifact {}: {e}", mapping.destination));
                    collected = false;
                }
            }
        }
        if collected {
            job.status = Status::Passed;
        }
    }

    async fn destroy(&self) -> Result<(), DriverError> {
        let Some(ws) = self.workspace.lock().await.take() else {
            return Ok(());
        };
        debug!(workspace = %ws.dir.path().display(), "removing workspace");
        tokio::task::spawn_blocking(move || ws.dir.close())
            .await
            .map_err(|e| DriverError::Setup(format!("removing workspace: {e}")))??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keychain::KeyChain;
    use crate::placer::NoObjects;
    use kiln_state::model::Passthrough;

    struct Discard;

    #[async_trait]
    impl Collector for Discard {
        async fn collect(
            &self,
            _name: &str,
            mut reader: Box<dyn io::Read + Send>,
        ) -> Result<u64, crate::error::TransferError> {
            Ok(io::copy(&mut reader, &mut io::sink()).map_err(kiln_core::StoreError::from)?)
        }
    }

    fn environment(env: &[&str]) -> Environment {
        Environment {
            env: env.iter().map(|s| s.to_string()).collect(),
            objects: Passthrough::new(),
            placer: Arc::new(NoObjects),
            keys: KeyChain::default(),
            output: Output::new(),
        }
    }

    fn job(commands: &[&str]) -> Job {
        Job::new(
            1,
            "test.1",
            commands.iter().map(|s| s.to_string()).collect(),
            Output::new(),
        )
    }

    #[test]
    fn script_echoes_quoted_commands() {
        let s = script(&["echo 'hi'".to_string()]);
        assert_eq!(s, "set -e\nprintf '%s\\n' '$ echo '\\''hi'\\'''\necho 'hi'\n");
    }

    #[test]
    fn guest_paths_stay_inside() {
        let root = Path::new("/ws");
        assert_eq!(guest_path(root, "out/a"), Some(PathBuf::from("/ws/out/a")));
        assert_eq!(guest_path(root, "/abs"), Some(PathBuf::from("/ws/abs")));
        assert_eq!(guest_path(root, "../etc/passwd"), None);
        assert_eq!(guest_path(root, ""), None);
    }

    #[test]
    fn options_come_from_the_driver_map() {
        let spec = DriverSpec::new("os").with("timeout", "5");
        let driver = OsDriver::from_spec(None, &spec).unwrap();
        assert_eq!(driver.timeout, Some(Duration::from_secs(5)));

        let spec = DriverSpec::new("os").with("timeout", "soon");
        assert!(matches!(
            OsDriver::from_spec(None, &spec),
            Err(DriverError::Option { .. })
        ));
    }

    #[tokio::test]
    async fn passing_commands_echo_and_capture_output() {
        let driver = OsDriver::new(None);
        driver.create(environment(&["GREETING=hello"])).await.unwrap();

        let mut job = job(&["echo $GREETING", "echo oops >&2"]);
        driver.execute(&mut job, Arc::new(Discard)).await;
        assert_eq!(job.status, Status::Passed, "{:?}", job.errors);
        let out = job.output.contents();
        assert!(out.contains("$ echo $GREETING"));
        assert!(out.contains("hello"));
        assert!(out.contains("oops"));

        driver.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn failing_command_stops_the_script() {
        let driver = OsDriver::new(None);
        driver.create(environment(&[])).await.unwrap();

        let mut job = job(&["false", "echo unreachable"]);
        driver.execute(&mut job, Arc::new(Discard)).await;
        assert_eq!(job.status, Status::Failed);
        assert!(!job.output.contents().contains("unreachable\n"));
        driver.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn slow_jobs_time_out() {
        let driver = OsDriver::new(None).with_timeout(Some(Duration::from_millis(200)));
        driver.create(environment(&[])).await.unwrap();

        let mut job = job(&["sleep 5"]);
        driver.execute(&mut job, Arc::new(Discard)).await;
        assert_eq!(job.status, Status::TimedOut);
        driver.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn workspace_is_removed_on_destroy() {
        let driver = OsDriver::new(None);
        driver.create(environment(&[])).await.unwrap();
        let dir = driver.workspace().await.unwrap();
        assert!(dir.is_dir());
        driver.destroy().await.unwrap();
        assert!(!dir.exists());
        driver.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn execute_before_create_fails_the_job() {
        let driver = OsDriver::new(None);
        let mut job = job(&["true"]);
        driver.execute(&mut job, Arc::new(Discard)).await;
        assert_eq!(job.status, Status::Failed);
    }

    #[tokio::test]
    async fn bad_env_entries_are_rejected() {
        let driver = OsDriver::new(None);
        let err = driver.create(environment(&["NOEQUALS"])).await.unwrap_err();
        assert!(matches!(err, DriverError::Setup(_)));
    }
}

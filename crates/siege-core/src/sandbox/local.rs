//! Local sandboxes: a temporary working directory per sandbox, commands run
//! through `bash -c` on the host. Meant for development and single-host demos;
//! there is no isolation beyond the working directory.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::error::{SandboxError, SandboxResult};
use super::provisioner::{
    ExecOptions, ExecOutput, NetworkAddress, Sandbox, SandboxProvisioner, SandboxSpec,
};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Provisions [`LocalSandbox`]es under the system temp dir (or `root`).
#[derive(Debug, Clone)]
pub struct LocalProvisioner {
    root: Option<PathBuf>,
    command_timeout: Duration,
}

impl Default for LocalProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalProvisioner {
    pub fn new() -> Self {
        Self {
            root: None,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Create sandbox directories under `root` instead of the system temp dir.
    pub fn in_dir(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

#[async_trait]
impl SandboxProvisioner for LocalProvisioner {
    async fn create(&self, spec: SandboxSpec) -> SandboxResult<Arc<dyn Sandbox>> {
        let mut builder = tempfile::Builder::new();
        let prefix = format!("{}-", spec.label);
        builder.prefix(&prefix);
        let dir = match &self.root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|e| SandboxError::Provision(format!("{}: {e}", spec.label)))?;

        let id = format!("local-{}", uuid::Uuid::new_v4());
        debug!(sandbox_id = %id, dir = %dir.path().display(), "created local sandbox");

        Ok(Arc::new(LocalSandbox {
            id,
            workdir: dir.path().to_path_buf(),
            dir: Mutex::new(Some(dir)),
            background: Mutex::new(Vec::new()),
            groups: Mutex::new(Vec::new()),
            expires_at: Instant::now() + spec.timeout,
            command_timeout: self.command_timeout,
        }))
    }
}

/// A sandbox backed by a temp dir on the local host.
pub struct LocalSandbox {
    id: String,
    workdir: PathBuf,
    /// `None` once destroyed
    dir: Mutex<Option<TempDir>>,
    /// Detached commands, killed on destroy
    background: Mutex<Vec<Child>>,
    /// Process group of every spawned command; whatever a command forks,
    /// `nohup … &` included, stays in it. Killed on destroy.
    groups: Mutex<Vec<u32>>,
    expires_at: Instant,
    command_timeout: Duration,
}

impl LocalSandbox {
    fn command(&self, command: &str) -> Command {
        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    async fn track(&self, child: &Child) {
        if let Some(pid) = child.id() {
            self.groups.lock().await.push(pid);
        }
    }

    /// SIGKILL every process group this sandbox started. Groups that are
    /// already gone are skipped by `kill`.
    async fn kill_groups(&self) {
        let groups = std::mem::take(&mut *self.groups.lock().await);
        if groups.is_empty() {
            return;
        }
        let targets: Vec<String> = groups.iter().map(|pgid| format!("-{pgid}")).collect();
        let script = format!("kill -KILL -- {} 2>/dev/null; true", targets.join(" "));
        if let Err(e) = Command::new("bash")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            debug!(sandbox_id = %self.id, error = %e, "failed to signal process groups");
        }
    }

    fn exec_error(&self, reason: impl Into<String>) -> SandboxError {
        SandboxError::Exec {
            sandbox_id: self.id.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn exec(&self, command: &str, options: ExecOptions) -> SandboxResult<ExecOutput> {
        if self.dir.lock().await.is_none() {
            return Err(self.exec_error("sandbox destroyed"));
        }
        if Instant::now() >= self.expires_at {
            return Err(self.exec_error("sandbox expired"));
        }

        if options.background {
            let child = self
                .command(command)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|e| self.exec_error(e.to_string()))?;
            self.track(&child).await;
            self.background.lock().await.push(child);
            return Ok(ExecOutput {
                exit_code: 0,
                output: String::new(),
            });
        }

        let child = self
            .command(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.exec_error(e.to_string()))?;
        self.track(&child).await;

        let output = tokio::time::timeout(self.command_timeout, child.wait_with_output())
            .await
            .map_err(|_| SandboxError::Timeout {
                what: format!("command in {}", self.id),
                elapsed_ms: self.command_timeout.as_millis() as u64,
            })?
            .map_err(|e| self.exec_error(e.to_string()))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            output: combined,
        })
    }

    async fn network_address(&self, port: u16) -> SandboxResult<NetworkAddress> {
        Ok(NetworkAddress {
            host: "127.0.0.1".to_string(),
            port,
        })
    }

    async fn destroy(&self) -> SandboxResult<()> {
        self.kill_groups().await;
        let mut children = std::mem::take(&mut *self.background.lock().await);
        for child in children.iter_mut() {
            // Already-exited children report an error here; nothing to do for them.
            let _ = child.kill().await;
        }

        if let Some(dir) = self.dir.lock().await.take() {
            dir.close().map_err(|e| SandboxError::Destroy {
                sandbox_id: self.id.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}

//! The provisioning contract every sandbox backend implements.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::SandboxResult;

/// What a sandbox is for within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxRole {
    Target,
    Agent,
}

impl SandboxRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxRole::Target => "target",
            SandboxRole::Agent => "agent",
        }
    }
}

impl fmt::Display for SandboxRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource request for a new sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSpec {
    /// Human-readable label, also used as overlay hostname
    pub label: String,
    pub vcpus: u32,
    /// Lifetime after which the provider may reclaim the sandbox
    pub timeout: Duration,
    /// Port to expose from the sandbox, if it serves anything
    pub exposed_port: Option<u16>,
    /// Provider-specific runtime image
    pub runtime: Option<String>,
}

/// Per-command execution options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOptions {
    /// Start the command detached and return immediately
    pub background: bool,
}

impl ExecOptions {
    pub fn background() -> Self {
        Self { background: true }
    }
}

/// Result of a foreground command: exit code plus combined stdout/stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Where a sandbox port can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A live execution environment.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Provider-side identifier.
    fn id(&self) -> &str;

    /// Run `command` through a shell inside the sandbox.
    async fn exec(&self, command: &str, options: ExecOptions) -> SandboxResult<ExecOutput>;

    /// The address at which `port` inside the sandbox is reachable.
    async fn network_address(&self, port: u16) -> SandboxResult<NetworkAddress>;

    /// Tear the sandbox down. Calling it twice is not an error.
    async fn destroy(&self) -> SandboxResult<()>;
}

/// Creates sandboxes.
#[async_trait]
pub trait SandboxProvisioner: Send + Sync {
    async fn create(&self, spec: SandboxSpec) -> SandboxResult<Arc<dyn Sandbox>>;
}

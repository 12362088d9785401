//! Private overlay network joining the tower and agent sandboxes.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::provisioner::{ExecOptions, Sandbox};

/// Joins a sandbox to the battle network.
#[async_trait]
pub trait OverlayNetwork: Send + Sync {
    /// Join `sandbox` as `hostname`. Returns its private address, or `None`
    /// if the join did not complete.
    async fn join(&self, sandbox: &dyn Sandbox, hostname: &str) -> Option<String>;
}

/// No overlay: sandboxes are reached at their own network address.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectOverlay;

#[async_trait]
impl OverlayNetwork for DirectOverlay {
    async fn join(&self, sandbox: &dyn Sandbox, _hostname: &str) -> Option<String> {
        match sandbox.network_address(0).await {
            Ok(addr) => Some(addr.host),
            Err(e) => {
                warn!(sandbox_id = %sandbox.id(), error = %e, "no network address");
                None
            }
        }
    }
}

const TAILSCALE_VERSION: &str = "1.76.6";
const SOCKS5_LISTEN: &str = "localhost:1055";

/// Tailscale in userspace-networking mode with a SOCKS5 proxy on
/// `localhost:1055`, installed from the static tarball.
#[derive(Debug, Clone)]
pub struct TailscaleOverlay {
    auth_key: Option<String>,
    version: String,
    sudo: bool,
    daemon_settle: Duration,
    connect_settle: Duration,
    ip_attempts: u32,
    ip_retry_delay: Duration,
}

impl TailscaleOverlay {
    pub fn new(auth_key: Option<String>) -> Self {
        Self {
            auth_key,
            version: TAILSCALE_VERSION.to_string(),
            sudo: true,
            daemon_settle: Duration::from_secs(2),
            connect_settle: Duration::from_secs(1),
            ip_attempts: 3,
            ip_retry_delay: Duration::from_millis(500),
        }
    }

    /// Auth key from `TAILSCALE_KEY`.
    pub fn from_env() -> Self {
        Self::new(std::env::var("TAILSCALE_KEY").ok().filter(|k| !k.is_empty()))
    }

    /// Run binaries without `sudo` (sandboxes that already run as root).
    pub fn without_sudo(mut self) -> Self {
        self.sudo = false;
        self
    }

    fn dir(&self) -> String {
        format!("/tmp/tailscale_{}_amd64", self.version)
    }

    fn bin(&self, name: &str) -> String {
        let path = format!("{}/{}", self.dir(), name);
        if self.sudo {
            format!("sudo {path}")
        } else {
            path
        }
    }

    async fn run(&self, sandbox: &dyn Sandbox, command: &str) -> Option<(i32, String)> {
        match sandbox.exec(command, ExecOptions::default()).await {
            Ok(out) => Some((out.exit_code, out.output)),
            Err(e) => {
                warn!(sandbox_id = %sandbox.id(), error = %e, "overlay command failed");
                None
            }
        }
    }
}

#[async_trait]
impl OverlayNetwork for TailscaleOverlay {
    async fn join(&self, sandbox: &dyn Sandbox, hostname: &str) -> Option<String> {
        info!(sandbox_id = %sandbox.id(), hostname = %hostname, "installing tailscale");

        let install = format!(
            "curl -fsSL https://pkgs.tailscale.com/stable/tailscale_{v}_amd64.tgz -o /tmp/tailscale.tgz && tar -xzf /tmp/tailscale.tgz -C /tmp",
            v = self.version
        );
        match self.run(sandbox, &install).await {
            Some((0, _)) => {}
            Some((code, output)) => {
                warn!(exit_code = code, output = %output.trim(), "tailscale install failed");
                return None;
            }
            None => return None,
        }

        let daemon = format!(
            "{} --tun=userspace-networking --statedir=/tmp/tailscale-state --socks5-server={}",
            self.bin("tailscaled"),
            SOCKS5_LISTEN
        );
        if let Err(e) = sandbox.exec(&daemon, ExecOptions::background()).await {
            warn!(error = %e, "failed to start tailscaled");
            return None;
        }
        tokio::time::sleep(self.daemon_settle).await;

        let Some(auth_key) = &self.auth_key else {
            warn!("TAILSCALE_KEY not set, skipping overlay authentication");
            return None;
        };

        let up = format!(
            "{} up --authkey {} --hostname {}",
            self.bin("tailscale"),
            auth_key,
            hostname
        );
        match self.run(sandbox, &up).await {
            Some((0, _)) => {}
            Some((code, output)) => {
                warn!(exit_code = code, output = %output.trim(), "tailscale up failed");
                return None;
            }
            None => return None,
        }
        tokio::time::sleep(self.connect_settle).await;

        let ip_cmd = format!("{} ip -4", self.bin("tailscale"));
        for attempt in 1..=self.ip_attempts {
            if let Some((code, output)) = self.run(sandbox, &ip_cmd).await {
                let ip = output.lines().next().unwrap_or("").trim().to_string();
                if code == 0 && !ip.is_empty() {
                    info!(hostname = %hostname, ip = %ip, attempt, "joined overlay");
                    return Some(ip);
                }
            }
            tokio::time::sleep(self.ip_retry_delay).await;
        }

        warn!(hostname = %hostname, "no overlay address after {} attempts", self.ip_attempts);
        None
    }
}

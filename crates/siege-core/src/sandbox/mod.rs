//! Sandboxes: isolated execution environments for the tower and the agents.
//!
//! # Modules
//!
//! - [`provisioner`]: `Sandbox` / `SandboxProvisioner` traits and their value types
//! - [`local`]: `LocalProvisioner`, temp-dir sandboxes driven through `bash -c`
//! - [`overlay`]: `OverlayNetwork`: `DirectOverlay`, `TailscaleOverlay`
//! - [`lifecycle`]: `SandboxLifecycleManager`, the per-run handle registry
//! - [`error`]: `SandboxError` / `SandboxResult`

pub mod error;
pub mod lifecycle;
pub mod local;
pub mod overlay;
pub mod provisioner;

pub use error::{SandboxError, SandboxResult};
pub use lifecycle::{SandboxHandle, SandboxKey, SandboxLifecycleManager, TeardownReport};
pub use local::LocalProvisioner;
pub use overlay::{DirectOverlay, OverlayNetwork, TailscaleOverlay};
pub use provisioner::{
    ExecOptions, ExecOutput, NetworkAddress, Sandbox, SandboxProvisioner, SandboxRole, SandboxSpec,
};

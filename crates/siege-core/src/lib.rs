//! Tower Siege Core Library
//!
//! Battle orchestration: a tower service is provisioned in a sandbox, agents
//! driven by reasoning providers attack it from their own sandboxes, and every
//! step is persisted to a replayable event log that clients tail live.

pub mod agent_runner;
pub mod config;
pub mod controller;
pub mod domain;
pub mod events;
pub mod fakes;
pub mod gateway;
pub mod health;
pub mod metrics;
pub mod obs;
pub mod ranking;
pub mod reasoning;
pub mod sandbox;
pub mod telemetry;

pub use agent_runner::{system_prompt, tail_output, AgentOutcome, AgentRunner, CONTINUE_NUDGE};
pub use config::BattleConfig;
pub use controller::{EndReason, RunController, RunSnapshot};
pub use domain::{
    default_agents, health_after, resolve_agents, validate_agents, HealthTracker, Result,
    SiegeError, TowerState, TowerStats,
};
pub use events::{EventBus, EventSink, LedgerSink, RunEmitter};
pub use gateway::StreamGateway;
pub use health::{HealthMonitor, HealthReport};
pub use ranking::rank_agents;
pub use reasoning::{
    bash_tool, AnthropicProvider, FinishReason, OpenAiCompatProvider, ProviderError,
    ProviderRegistry, ProviderResult, ReasoningProvider, ReasoningStep, StepRequest, ToolCall,
    ToolSpec, Turn, Usage,
};
pub use sandbox::{
    DirectOverlay, ExecOptions, ExecOutput, LocalProvisioner, NetworkAddress, OverlayNetwork,
    Sandbox, SandboxError, SandboxHandle, SandboxKey, SandboxLifecycleManager, SandboxProvisioner,
    SandboxResult, SandboxRole, SandboxSpec, TailscaleOverlay, TeardownReport,
};

pub use siege_state::{
    AgentProfile, AgentResult, BattleEvent, BattleLedger, EventKind, NewEvent, ProviderKind, RunId,
    RunRecord, RunStatus,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

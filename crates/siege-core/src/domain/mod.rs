//! Domain models for Tower Siege.
//!
//! - `agent`: the stock agent catalogue and roster validation
//! - `tower`: tower counters and monotonic health tracking
//! - `error`: `SiegeError` / `Result`

pub mod agent;
pub mod error;
pub mod tower;

pub use agent::{default_agents, resolve_agents, validate_agents};
pub use error::{Result, SiegeError};
pub use tower::{health_after, HealthTracker, TowerState, TowerStats};

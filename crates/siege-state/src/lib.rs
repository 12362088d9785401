//! Siege-State: persistence for Tower Siege battles
//!
//! This crate owns every durable fact about a battle run: the run record and
//! its status, the append-only event log that clients replay and resume from,
//! and the per-agent results written once at finalization.
//!
//! ## Key Components
//!
//! - [`RunStore`]: run records and guarded status transitions
//! - [`EventLog`]: gapless, per-run sequenced event append and `list_since`
//! - [`ResultStore`]: write-once agent results
//! - [`fakes::MemoryLedger`]: in-memory implementation of all three
//! - [`SurrealLedger`]: SurrealDB implementation of all three

mod error;
pub mod fakes;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_ledger;

pub use error::StorageError;
pub use storage_traits::{
    AgentProfile, AgentResult, BattleEvent, BattleLedger, EventKind, EventLog, NewEvent,
    ProviderKind, ResultStore, RunId, RunRecord, RunStatus, RunStore, StorageResult,
};
pub use surreal_ledger::SurrealLedger;

//! Tower attack counters and the derived health value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Counters served by the tower's stats endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TowerStats {
    /// Hits per `X-Agent-ID`
    #[serde(default)]
    pub agents: BTreeMap<String, u64>,
    #[serde(default)]
    pub total_requests: u64,
}

impl TowerStats {
    /// Hits recorded for an agent identity, 0 if the tower never saw it.
    pub fn damage_for(&self, agent_id: &str) -> u64 {
        self.agents.get(agent_id).copied().unwrap_or(0)
    }
}

/// Status tag carried by `tower:status` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TowerState {
    UnderAttack,
    Defeated,
}

/// `max(0, initial - total * damage_per_request)`
pub fn health_after(initial: u32, damage_per_request: u32, total_requests: u64) -> u32 {
    let damage = total_requests.saturating_mul(u64::from(damage_per_request));
    u64::from(initial).saturating_sub(damage) as u32
}

/// Tracks tower health from a stream of stats readings.
///
/// Only the highest total ever observed feeds the computation, so a counter
/// that goes backwards (tower restart, stale read) can never raise health.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    initial: u32,
    damage_per_request: u32,
    max_total: u64,
    health: u32,
}

impl HealthTracker {
    pub fn new(initial: u32, damage_per_request: u32) -> Self {
        Self {
            initial,
            damage_per_request,
            max_total: 0,
            health: initial,
        }
    }

    pub fn health(&self) -> u32 {
        self.health
    }

    pub fn is_defeated(&self) -> bool {
        self.health == 0
    }

    pub fn state(&self) -> TowerState {
        if self.is_defeated() {
            TowerState::Defeated
        } else {
            TowerState::UnderAttack
        }
    }

    /// Feed a total-requests reading. Returns the new health if it changed.
    pub fn observe(&mut self, total_requests: u64) -> Option<u32> {
        if total_requests <= self.max_total {
            return None;
        }
        self.max_total = total_requests;
        let next = health_after(self.initial, self.damage_per_request, total_requests);
        if next < self.health {
            self.health = next;
            Some(next)
        } else {
            None
        }
    }
}

//! Final standings from the tower's counters.

use std::collections::HashMap;

use siege_state::{AgentProfile, AgentResult};

use crate::domain::TowerStats;

/// Rank every configured agent by the damage the tower recorded for it.
///
/// Ranks are `1..=agents.len()`. The sort is stable, so agents with equal
/// damage keep their configured order. Agents the tower never saw (including
/// ones whose sandbox failed) rank with zero damage.
pub fn rank_agents(
    agents: &[AgentProfile],
    stats: &TowerStats,
    tokens: &HashMap<String, u64>,
) -> Vec<AgentResult> {
    let mut results: Vec<AgentResult> = agents
        .iter()
        .map(|agent| AgentResult {
            agent_id: agent.id.clone(),
            agent_name: agent.name.clone(),
            model: agent.model.clone(),
            color: agent.color.clone(),
            damage: stats.damage_for(&agent.id),
            rank: 0,
            tokens_used: tokens.get(&agent.id).copied().unwrap_or(0),
        })
        .collect();

    results.sort_by(|a, b| b.damage.cmp(&a.damage));
    for (i, result) in results.iter_mut().enumerate() {
        result.rank = i as u32 + 1;
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::default_agents;

    fn stats(hits: &[(&str, u64)]) -> TowerStats {
        let mut stats = TowerStats::default();
        for (id, n) in hits {
            stats.agents.insert(id.to_string(), *n);
            stats.total_requests += n;
        }
        stats
    }

    #[test]
    fn test_ranks_by_damage_descending() {
        let agents = default_agents();
        let results = rank_agents(
            &agents,
            &stats(&[("agent-3", 40), ("agent-1", 10), ("agent-4", 25)]),
            &HashMap::from([("agent-3".to_string(), 900)]),
        );

        let order: Vec<&str> = results.iter().map(|r| r.agent_id.as_str()).collect();
        assert_eq!(order, vec!["agent-3", "agent-4", "agent-1", "agent-2"]);
        assert_eq!(results[0].rank, 1);
        assert_eq!(results[0].tokens_used, 900);
        assert_eq!(results[3].damage, 0);
        assert_eq!(results[3].rank, 4);
    }

    #[test]
    fn test_ties_keep_configured_order() {
        let agents = default_agents();
        let results = rank_agents(&agents, &stats(&[("agent-2", 5), ("agent-4", 5)]), &HashMap::new());
        let order: Vec<&str> = results.iter().map(|r| r.agent_id.as_str()).collect();
        assert_eq!(order, vec!["agent-2", "agent-4", "agent-1", "agent-3"]);
    }

    #[test]
    fn test_ranks_are_a_permutation() {
        let agents = default_agents();
        let results = rank_agents(&agents, &TowerStats::default(), &HashMap::new());
        let mut ranks: Vec<u32> = results.iter().map(|r| r.rank).collect();
        ranks.sort_unstable();
        assert_eq!(ranks, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_unknown_identities_are_ignored() {
        let agents = default_agents();
        let results = rank_agents(&agents, &stats(&[("unknown", 500)]), &HashMap::new());
        assert!(results.iter().all(|r| r.damage == 0));
    }
}

//! Agent catalogue and start-request validation.

use std::collections::HashSet;

use siege_state::{AgentProfile, ProviderKind};

use super::error::{Result, SiegeError};

fn profile(id: &str, name: &str, provider: ProviderKind, model: &str, color: &str) -> AgentProfile {
    AgentProfile {
        id: id.to_string(),
        name: name.to_string(),
        provider,
        model: model.to_string(),
        color: color.to_string(),
    }
}

/// The four stock agents used when a start request names none.
pub fn default_agents() -> Vec<AgentProfile> {
    vec![
        profile("agent-1", "GPT-4", ProviderKind::Openai, "gpt-4o", "#10a37f"),
        profile(
            "agent-2",
            "Claude",
            ProviderKind::Anthropic,
            "claude-3-5-sonnet-20241022",
            "#d97706",
        ),
        profile("agent-3", "Gemini", ProviderKind::Google, "gemini-1.5-pro", "#4285f4"),
        profile("agent-4", "Grok", ProviderKind::Xai, "grok-2", "#ef4444"),
    ]
}

/// Check a roster: non-empty, unique non-blank ids, non-blank models.
pub fn validate_agents(agents: &[AgentProfile]) -> Result<()> {
    if agents.is_empty() {
        return Err(SiegeError::InvalidInput(
            "agents must not be empty".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for agent in agents {
        if agent.id.trim().is_empty() {
            return Err(SiegeError::InvalidInput(
                "agent id must not be empty".to_string(),
            ));
        }
        if agent.model.trim().is_empty() {
            return Err(SiegeError::InvalidInput(format!(
                "agent {} has no model",
                agent.id
            )));
        }
        if !seen.insert(agent.id.as_str()) {
            return Err(SiegeError::InvalidInput(format!(
                "duplicate agent id: {}",
                agent.id
            )));
        }
    }
    Ok(())
}

/// Resolve the roster of a start request: `None` means the defaults.
pub fn resolve_agents(requested: Option<Vec<AgentProfile>>) -> Result<Vec<AgentProfile>> {
    let agents = requested.unwrap_or_else(default_agents);
    validate_agents(&agents)?;
    Ok(agents)
}

//! Reasoning engines: DeepThink (iterative solve/verify/correct) and
//! UltraThink (plan → fan-out → synthesise).

pub mod deep_think;
pub mod prompts;
pub mod ultra_think;
pub mod verify;

pub use deep_think::{DeepThinkEngine, DeepThinkResult, VerificationRecord};
pub use ultra_think::{AgentResult, AgentSpec, UltraThinkEngine, UltraThinkResult};

use serde::{Deserialize, Serialize};

/// Named sub-step of an engine run.
///
/// Each stage may route to a distinct underlying model via the model
/// configuration's `stage_models` map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// First exploration of the problem.
    Initial,
    /// Judge pass over a candidate solution.
    Verification,
    /// Revision guided by verifier feedback.
    Correction,
    /// Optional refinement of an accepted solution.
    Improvement,
    /// User-facing final summary.
    Summary,
    /// UltraThink high-level plan.
    Planning,
    /// UltraThink agent-configuration generation.
    AgentConfig,
    /// UltraThink synthesis across agent solutions.
    Synthesis,
}

impl Stage {
    /// Stage name as used in `stage_models` keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Initial => "initial",
            Stage::Verification => "verification",
            Stage::Correction => "correction",
            Stage::Improvement => "improvement",
            Stage::Summary => "summary",
            Stage::Planning => "planning",
            Stage::AgentConfig => "agent_config",
            Stage::Synthesis => "synthesis",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names_match_config_keys() {
        assert_eq!(Stage::Initial.as_str(), "initial");
        assert_eq!(Stage::AgentConfig.as_str(), "agent_config");
        assert_eq!(Stage::Synthesis.as_str(), "synthesis");
        assert_eq!(
            serde_json::to_value(Stage::AgentConfig).unwrap(),
            "agent_config"
        );
    }
}

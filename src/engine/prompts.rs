//! Prompt templates for the reasoning engines.
//!
//! Concise, math/proof oriented, model-agnostic. The judge prompt demands a
//! JSON verdict so the permissive parser in [`crate::engine::verify`] has a
//! canonical shape to aim for.

/// System prompt for the first exploration of a problem.
pub const INITIAL_PROMPT: &str = "You are a careful mathematician. Read the problem, reason \
     step-by-step, and produce a fully rigorous solution with explicit \
     lemmas. Keep derivations auditable.";

/// System prompt for the verification judge.
pub const VERIFY_PROMPT: &str = "You are a strict proof checker. Check the solution for \
     correctness, hidden assumptions, and gaps. If incorrect, identify the \
     first concrete error and explain why. Respond with a JSON object: \
     {\"is_correct\": true|false, \"reasoning\": \"...\", \"errors\": [\"...\"]}. \
     No extra text.";

/// System prompt for the correction step.
pub const CORRECT_PROMPT: &str = "Fix the solution strictly based on the verification feedback. \
     Provide the complete corrected solution.";

/// System prompt for the UltraThink planning step.
pub const PLAN_PROMPT: &str = "Produce a minimal plan for solving the problem, enumerating \
     distinct approaches (algebraic, geometric, combinatorial, \
     number-theoretic) with one or two bullets each.";

/// System prompt for the UltraThink synthesis step.
pub const SYNTHESIZE_PROMPT: &str = "Synthesize multiple candidate solutions. Prefer the most \
     rigorous argument. Resolve conflicts and produce a single coherent \
     proof.";

/// System prompt demanding strictly-JSON agent configurations.
pub fn agent_config_prompt(num_agents: u32) -> String {
    format!(
        "Given the plan, design {n} diverse solver configurations that \
         enforce genuinely different approaches. Respond with ONLY a JSON \
         array of exactly {n} objects, each shaped \
         {{\"system_prompt\": \"...\", \"temperature\": 0.7, \
         \"model_override\": null, \"seed\": null}}. \
         No prose, no code fences.",
        n = num_agents
    )
}

/// User prompt handed to the verification judge.
pub fn verify_user_prompt(problem: &str, solution: &str) -> String {
    format!("Problem:\n{}\n\nSolution:\n{}", problem, solution)
}

/// User prompt for the correction step.
pub fn correct_user_prompt(problem: &str, solution: &str, feedback: &str) -> String {
    format!(
        "Problem:\n{}\n\nPrevious solution:\n{}\n\nVerifier feedback:\n{}",
        problem, solution, feedback
    )
}

/// User prompt for the final user-facing summary.
pub fn final_summary_prompt(problem: &str, solution: &str) -> String {
    format!(
        "Write a concise final answer for the user, summarizing the key \
         steps and final result.\n\nProblem:\n{}\n\nSolution:\n{}",
        problem, solution
    )
}

/// User prompt for the synthesis step.
pub fn synthesis_user_prompt(problem: &str, solutions: &[(String, String)]) -> String {
    let joined = solutions
        .iter()
        .map(|(agent_id, solution)| format!("### {} ###\n{}", agent_id, solution))
        .collect::<Vec<_>>()
        .join("\n\n---\n\n");
    format!("Problem:\n{}\n\nAgent Solutions:\n{}", problem, joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_config_prompt_pins_count() {
        let prompt = agent_config_prompt(4);
        assert!(prompt.contains("exactly 4 objects"));
        assert!(prompt.contains("system_prompt"));
    }

    #[test]
    fn test_synthesis_prompt_labels_agents() {
        let prompt = synthesis_user_prompt(
            "P",
            &[
                ("agent-1".to_string(), "sol A".to_string()),
                ("agent-2".to_string(), "sol B".to_string()),
            ],
        );
        assert!(prompt.contains("### agent-1 ###"));
        assert!(prompt.contains("sol B"));
    }
}

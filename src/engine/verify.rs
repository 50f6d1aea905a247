//! Verification helpers: judge-verdict parsing and an advisory numeric
//! sanity check.
//!
//! The judge's canonical output is a JSON object
//! `{"is_correct": bool, "reasoning": "...", "errors": [...]}`. Models do
//! not always comply, so parsing is permissive: a JSON object anywhere in
//! the text is accepted, and failing that, a textual verdict whose first
//! non-whitespace token is "yes" counts as a pass.
//!
//! The sanity check scans for simple binary numeric assertions
//! (`a op b = c`) and evaluates them in f64. It is advisory only: its
//! outcome is recorded but never overrides the judge.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Parsed judge verdict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JudgeVerdict {
    /// The judge's boolean outcome; the only field control flow trusts.
    pub is_correct: bool,
    /// Free-text reasoning.
    #[serde(default)]
    pub reasoning: String,
    /// Concrete errors the judge identified.
    #[serde(default)]
    pub errors: Vec<String>,
}

impl JudgeVerdict {
    fn fail(reasoning: impl Into<String>) -> Self {
        Self {
            is_correct: false,
            reasoning: reasoning.into(),
            errors: Vec::new(),
        }
    }
}

/// Parse a judge response permissively.
///
/// Unparseable output is a failed verification, never a crash.
pub fn parse_judge_verdict(text: &str) -> JudgeVerdict {
    let trimmed = text.trim();

    // Canonical form: a JSON object, possibly surrounded by prose.
    if let Some(verdict) = extract_json_verdict(trimmed) {
        return verdict;
    }

    // Textual fallback: a leading "yes" is a pass.
    let first_token = trimmed
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_ascii_lowercase();
    if first_token == "yes" {
        return JudgeVerdict {
            is_correct: true,
            reasoning: trimmed.to_string(),
            errors: Vec::new(),
        };
    }

    JudgeVerdict::fail(trimmed.to_string())
}

fn extract_json_verdict(text: &str) -> Option<JudgeVerdict> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<JudgeVerdict>(&text[start..=end]).ok()
}

fn assertion_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(-?\d+(?:\.\d+)?)\s*([+\-*/])\s*(-?\d+(?:\.\d+)?)\s*=\s*(-?\d+(?:\.\d+)?)",
        )
        .expect("valid regex")
    })
}

/// Best-effort check of numeric assertions in a solution text.
///
/// Returns `Some(true)` when every extracted assertion holds,
/// `Some(false)` when at least one is wrong, and `None` when no assertion
/// was found (prose proofs). Purely advisory.
pub fn symbolic_sanity_check(text: &str) -> Option<bool> {
    let mut found = false;
    for caps in assertion_regex().captures_iter(text) {
        let (Ok(a), Ok(b), Ok(expected)) = (
            caps[1].parse::<f64>(),
            caps[3].parse::<f64>(),
            caps[4].parse::<f64>(),
        ) else {
            continue;
        };
        let actual = match &caps[2] {
            "+" => a + b,
            "-" => a - b,
            "*" => a * b,
            "/" => {
                if b == 0.0 {
                    continue;
                }
                a / b
            }
            _ => continue,
        };
        found = true;
        if (actual - expected).abs() > 1e-9 * expected.abs().max(1.0) {
            return Some(false);
        }
    }
    found.then_some(true)
}

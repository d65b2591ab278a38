use regex::{RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// Requested tool-calling mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolCallingMode {
    Native,
    TextConvention,
    #[default]
    Auto,
}

/// The mode a turn actually runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolvedMode {
    Native,
    TextConvention,
}

/// Model-id patterns consulted when the mode is `auto`.
///
/// Patterns are case-insensitive regular expressions. Text-convention patterns
/// are checked first; a model matching neither list runs in text-convention
/// mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModeRules {
    pub text_convention_patterns: Vec<String>,
    pub native_patterns: Vec<String>,
}

impl Default for ModeRules {
    fn default() -> Self {
        let owned = |patterns: &[&str]| -> Vec<String> {
            patterns.iter().map(|p| p.to_string()).collect()
        };
        Self {
            text_convention_patterns: owned(&[
                r"deepseek-r1",
                r"\bqwq\b",
                r"gemma",
                r"\bphi-?[1-4]",
                r"llama-?2",
                r"tinyllama",
                r"codellama",
                r"mistral-7b",
                r"vicuna",
                r"orca",
                r"falcon",
                r"starcoder",
            ]),
            native_patterns: owned(&[
                r"gpt-?[34]",
                r"gpt-?5",
                r"^(openai/)?o[134](-|$)",
                r"claude",
                r"gemini",
                r"qwen-?2\.5",
                r"qwen-?3",
                r"llama-?3\.[1-9]",
                r"llama-?4",
                r"mistral-(large|medium|small)",
                r"mixtral",
                r"command-r",
                r"grok",
                r"deepseek-(chat|v3)",
                r"glm-4",
                r"kimi",
            ]),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModeSelector {
    text_convention: RegexSet,
    native: RegexSet,
}

impl ModeSelector {
    pub fn new(rules: &ModeRules) -> Result<Self, AgentError> {
        Ok(Self {
            text_convention: compile(&rules.text_convention_patterns)?,
            native: compile(&rules.native_patterns)?,
        })
    }

    /// An explicit `native`/`text-convention` request always wins over the
    /// model-id rules.
    pub fn select(&self, model_id: &str, requested: ToolCallingMode) -> ResolvedMode {
        match requested {
            ToolCallingMode::Native => ResolvedMode::Native,
            ToolCallingMode::TextConvention => ResolvedMode::TextConvention,
            ToolCallingMode::Auto if self.text_convention.is_match(model_id) => {
                ResolvedMode::TextConvention
            }
            ToolCallingMode::Auto if self.native.is_match(model_id) => ResolvedMode::Native,
            ToolCallingMode::Auto => ResolvedMode::TextConvention,
        }
    }
}

impl Default for ModeSelector {
    fn default() -> Self {
        Self::new(&ModeRules::default()).unwrap_or_else(|_| Self {
            text_convention: RegexSet::empty(),
            native: RegexSet::empty(),
        })
    }
}

fn compile(patterns: &[String]) -> Result<RegexSet, AgentError> {
    RegexSetBuilder::new(patterns)
        .case_insensitive(true)
        .build()
        .map_err(|err| AgentError::Config(format!("invalid mode rule pattern: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auto(model_id: &str) -> ResolvedMode {
        ModeSelector::default().select(model_id, ToolCallingMode::Auto)
    }

    #[test]
    fn known_tool_capable_models_use_native_mode() {
        for model_id in [
            "gpt-4o-mini",
            "claude-3-5-sonnet",
            "gemini-2.0-flash",
            "qwen2.5-coder:7b",
            "llama3.1:8b",
            "mistral-large-latest",
            "o3-mini",
        ] {
            assert_eq!(auto(model_id), ResolvedMode::Native, "{model_id}");
        }
    }

    #[test]
    fn weak_or_reasoning_models_use_text_convention() {
        for model_id in ["deepseek-r1:14b", "gemma2:9b", "llama2", "QwQ-32B", "phi3:mini"] {
            assert_eq!(auto(model_id), ResolvedMode::TextConvention, "{model_id}");
        }
    }

    #[test]
    fn unknown_models_default_to_text_convention() {
        assert_eq!(auto("my-local-finetune"), ResolvedMode::TextConvention);
    }

    #[test]
    fn explicit_request_overrides_rules() {
        let selector = ModeSelector::default();
        assert_eq!(
            selector.select("deepseek-r1", ToolCallingMode::Native),
            ResolvedMode::Native
        );
        assert_eq!(
            selector.select("gpt-4o", ToolCallingMode::TextConvention),
            ResolvedMode::TextConvention
        );
    }

    #[test]
    fn custom_rules_replace_defaults() {
        let selector = ModeSelector::new(&ModeRules {
            text_convention_patterns: vec![],
            native_patterns: vec!["^house-".to_string()],
        })
        .expect("rules compile");
        assert_eq!(
            selector.select("HOUSE-model", ToolCallingMode::Auto),
            ResolvedMode::Native
        );
        assert_eq!(
            selector.select("gpt-4o", ToolCallingMode::Auto),
            ResolvedMode::TextConvention
        );
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let err = ModeSelector::new(&ModeRules {
            text_convention_patterns: vec!["(".to_string()],
            native_patterns: vec![],
        })
        .expect_err("pattern must fail");
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    fn mode_names_deserialize_in_kebab_case() {
        let mode: ToolCallingMode =
            serde_json::from_str("\"text-convention\"").expect("deserializes");
        assert_eq!(mode, ToolCallingMode::TextConvention);
    }
}

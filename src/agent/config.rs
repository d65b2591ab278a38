use serde::{Deserialize, Serialize};

use crate::agent::mode::{ModeRules, ToolCallingMode};
use crate::agent::orchestrator::ResultPattern;
use crate::error::AgentError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentConfig {
    /// Base system prompt; a built-in prompt is used when unset.
    pub system_prompt: Option<String>,
    pub max_iterations: u32,
    pub parallel_tool_calls: bool,
    /// Unset means on for text-convention turns and off for native ones.
    pub enable_reasoning_phase: Option<bool>,
    pub reasoning_phase_prompt: Option<String>,
    pub immediate_result_matchers: Vec<ResultPattern>,
    pub tool_calling_mode: ToolCallingMode,
    pub mode_rules: ModeRules,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_iterations: 10,
            parallel_tool_calls: true,
            enable_reasoning_phase: None,
            reasoning_phase_prompt: None,
            immediate_result_matchers: Vec::new(),
            tool_calling_mode: ToolCallingMode::Auto,
            mode_rules: ModeRules::default(),
        }
    }
}

impl AgentConfig {
    /// Parses a camelCase options object; missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, AgentError> {
        serde_json::from_str(json)
            .map_err(|err| AgentError::Config(format!("invalid agent options: {err}")))
    }

    pub(crate) fn validate(&self) -> Result<(), AgentError> {
        if self.max_iterations == 0 {
            return Err(AgentError::Config(
                "maxIterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AgentConfig::default();
        assert_eq!(config.max_iterations, 10);
        assert!(config.parallel_tool_calls);
        assert_eq!(config.enable_reasoning_phase, None);
        assert_eq!(config.tool_calling_mode, ToolCallingMode::Auto);
    }

    #[test]
    fn from_json_reads_camel_case_options() {
        let config = AgentConfig::from_json(
            r#"{
                "systemPrompt": "be brief",
                "maxIterations": 3,
                "parallelToolCalls": false,
                "enableReasoningPhase": true,
                "immediateResultMatchers": [{"type": "card"}],
                "toolCallingMode": "text-convention",
                "modeRules": {"nativePatterns": ["^house-"]}
            }"#,
        )
        .expect("options parse");

        assert_eq!(config.system_prompt.as_deref(), Some("be brief"));
        assert_eq!(config.max_iterations, 3);
        assert!(!config.parallel_tool_calls);
        assert_eq!(config.enable_reasoning_phase, Some(true));
        assert_eq!(
            config.immediate_result_matchers,
            vec![json!({"type": "card"}).as_object().cloned().expect("object")]
        );
        assert_eq!(config.tool_calling_mode, ToolCallingMode::TextConvention);
        assert_eq!(config.mode_rules.native_patterns, vec!["^house-"]);
        assert_eq!(
            config.mode_rules.text_convention_patterns,
            ModeRules::default().text_convention_patterns
        );
    }

    #[test]
    fn rejects_zero_iterations_and_bad_json() {
        let config = AgentConfig {
            max_iterations: 0,
            ..AgentConfig::default()
        };
        assert!(matches!(config.validate(), Err(AgentError::Config(_))));
        assert!(AgentConfig::from_json("{\"maxIterations\": \"many\"}").is_err());
    }
}

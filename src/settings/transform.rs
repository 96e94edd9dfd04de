//! Prompt template transforms.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Placeholder replaced with the incoming prompt text.
pub const PROMPT_TOKEN: &str = "{prompt}";

/// Rewrites a prompt through a template before it reaches a connector.
///
/// The template must contain `{prompt}`; any other `{Name}` token is filled
/// from the global parameters of the dispatch settings, letting dynamic
/// blocks be injected consistently into type- or connector-specific
/// templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTransform {
    pub template: String,
}

impl PromptTransform {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Applies the template to `prompt`, filling `{Name}` tokens from
    /// `parameters`. Unknown tokens are left verbatim.
    pub fn apply(&self, prompt: &str, parameters: &HashMap<String, String>) -> String {
        let mut result = self.template.replace(PROMPT_TOKEN, prompt);
        for (name, value) in parameters {
            result = result.replace(&format!("{{{name}}}"), value);
        }
        result
    }
}

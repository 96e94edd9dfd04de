//! Prompt signatures: the classification keys of the prompt-type registry.

use crate::error::DispatchError;
use crate::job::{CompletionJob, RequestSettings};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Identifies a family of completion jobs from a subset of request settings
/// and the start of the prompt.
///
/// A signature matches a job when the job's settings carry all the tracked
/// keys with equal values and the prompt either matches the regex (when one
/// is configured) or literally starts with `prompt_start` (exact,
/// case-sensitive).
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PromptSignature {
    pub settings: RequestSettings,
    pub prompt_start: String,
    pub matching_regex: Option<String>,
    #[serde(skip)]
    compiled_regex: OnceLock<Option<Regex>>,
}

impl Clone for PromptSignature {
    fn clone(&self) -> Self {
        Self {
            settings: self.settings.clone(),
            prompt_start: self.prompt_start.clone(),
            matching_regex: self.matching_regex.clone(),
            compiled_regex: OnceLock::new(),
        }
    }
}

impl PromptSignature {
    pub fn new(settings: RequestSettings, prompt_start: impl Into<String>) -> Self {
        Self {
            settings,
            prompt_start: prompt_start.into(),
            matching_regex: None,
            compiled_regex: OnceLock::new(),
        }
    }

    /// Signature matching by regex instead of the literal prefix, for prompt
    /// families with variable leading content.
    pub fn with_regex(mut self, pattern: impl Into<String>) -> Self {
        self.matching_regex = Some(pattern.into());
        self
    }

    fn compiled(&self) -> Option<&Regex> {
        self.compiled_regex
            .get_or_init(|| {
                self.matching_regex.as_deref().and_then(|pattern| {
                    RegexBuilder::new(pattern)
                        .case_insensitive(true)
                        .build()
                        .map_err(|error| {
                            tracing::warn!(%pattern, %error, "invalid signature regex ignored");
                            error
                        })
                        .ok()
                })
            })
            .as_ref()
    }

    /// Whether the job belongs to this signature's family.
    pub fn matches(&self, job: &CompletionJob) -> bool {
        if !self.settings.is_subset_of(job.settings()) {
            return false;
        }
        match self.compiled() {
            Some(regex) => regex.is_match(job.prompt()),
            None => job.prompt().starts_with(&self.prompt_start),
        }
    }

    /// Extracts a new signature from an unmatched job.
    ///
    /// The candidate prefix is the first `truncation_length` characters of
    /// the prompt. When an already-registered regex-bearing signature has a
    /// `prompt_start` that itself begins with the candidate, the candidate is
    /// extended to the common prefix with the full prompt, so a new type is
    /// not carved too short under an existing regex family.
    pub fn extract_from_prompt<'a>(
        job: &CompletionJob,
        existing: impl IntoIterator<Item = &'a PromptSignature>,
        truncation_length: usize,
    ) -> Result<Self, DispatchError> {
        let prompt = job.prompt();
        let char_count = prompt.chars().count();
        if char_count < truncation_length {
            return Err(DispatchError::PromptTooShort {
                length: char_count,
                required: truncation_length,
            });
        }

        let byte_end = prompt
            .char_indices()
            .nth(truncation_length)
            .map_or(prompt.len(), |(i, _)| i);
        let mut prompt_start = prompt[..byte_end].to_string();

        for signature in existing {
            if signature.matching_regex.is_some()
                && signature.prompt_start.starts_with(&prompt_start)
            {
                prompt_start = common_prefix(&signature.prompt_start, prompt).to_string();
            }
        }

        Ok(Self::new(job.settings().clone(), prompt_start))
    }

    /// Narrows a signature from two distinct instances of the same type: the
    /// new start is their longest common prefix.
    ///
    /// Known gap: there is no lower bound, so adversarial instance sequences
    /// can degrade the prefix toward the empty string.
    pub fn extract_from_two_instances(
        prompt1: &str,
        prompt2: &str,
        settings: RequestSettings,
    ) -> Self {
        Self::new(settings, common_prefix(prompt1, prompt2))
    }
}

/// Longest common prefix of two strings, on character boundaries.
pub fn common_prefix<'a>(a: &'a str, b: &str) -> &'a str {
    let mut end = 0;
    for (ca, cb) in a.chars().zip(b.chars()) {
        if ca != cb {
            break;
        }
        end += ca.len_utf8();
    }
    &a[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(prompt: &str) -> CompletionJob {
        CompletionJob::new(prompt, RequestSettings::new()).unwrap()
    }

    #[test]
    fn prefix_match_is_exact_and_case_sensitive() {
        let signature = PromptSignature::new(RequestSettings::new(), "Hello, ");
        assert!(signature.matches(&job("Hello, this is a test.")));
        assert!(!signature.matches(&job("hello, this is a test.")));
    }

    #[test]
    fn settings_must_agree_on_tracked_keys() {
        let tracked: RequestSettings = [("temperature", "0.7")].into_iter().collect();
        let signature = PromptSignature::new(tracked, "Hello");

        let matching: RequestSettings = [("temperature", "0.7"), ("maxTokens", "64")]
            .into_iter()
            .collect();
        let other: RequestSettings = [("temperature", "0.9")].into_iter().collect();

        assert!(signature.matches(&CompletionJob::new("Hello there", matching).unwrap()));
        assert!(!signature.matches(&CompletionJob::new("Hello there", other).unwrap()));
    }

    #[test]
    fn regex_match_overrides_prefix() {
        let signature = PromptSignature::new(RequestSettings::new(), "unused")
            .with_regex(r"Compute \w+\(\d+, \d+\)");
        assert!(signature.matches(&job("Compute Add(1, 1)")));
        assert!(!signature.matches(&job("Sum 1 and 1")));
    }

    #[test]
    fn short_prompt_is_rejected_not_truncated() {
        let result = PromptSignature::extract_from_prompt(&job("short"), std::iter::empty(), 10);
        assert!(matches!(
            result,
            Err(DispatchError::PromptTooShort {
                length: 5,
                required: 10
            })
        ));
    }

    #[test]
    fn extraction_takes_truncated_start() {
        let signature =
            PromptSignature::extract_from_prompt(&job("Compute Add(1, 1)"), std::iter::empty(), 10)
                .unwrap();
        assert_eq!(signature.prompt_start, "Compute Ad");
    }

    #[test]
    fn extraction_extends_under_regex_family() {
        let existing = PromptSignature::new(RequestSettings::new(), "Compute Add(")
            .with_regex(r"Compute Add\(\d+, \d+\) then explain");
        let signature = PromptSignature::extract_from_prompt(
            &job("Compute Add(7, 8) in roman numerals"),
            [&existing],
            10,
        )
        .unwrap();
        // Candidate "Compute Ad" is a prefix of the regex family's start, so
        // the candidate grows to the common prefix with the full prompt.
        assert_eq!(signature.prompt_start, "Compute Add(");
    }

    #[test]
    fn two_instance_narrowing_uses_common_prefix() {
        let signature = PromptSignature::extract_from_two_instances(
            "Hello, this is a",
            "Hello, that was a",
            RequestSettings::new(),
        );
        assert_eq!(signature.prompt_start, "Hello, th");
    }

    #[test]
    fn common_prefix_respects_char_boundaries() {
        assert_eq!(common_prefix("héllo", "héllx"), "héll");
        assert_eq!(common_prefix("abc", "xyz"), "");
    }
}

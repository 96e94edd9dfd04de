//! Completion jobs and normalized request settings.
//!
//! A [`CompletionJob`] is the immutable input of every dispatch: the raw
//! prompt plus a normalized bag of request settings. Equality is structural
//! (prompt text and every setting key/value), which lets jobs double as map
//! keys for in-flight de-duplication during sampling.

use crate::error::DispatchError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Canonical key under which the completion token budget is stored.
pub const MAX_TOKENS_KEY: &str = "MAXTOKENS";
/// Canonical key under which the sampling temperature is stored.
pub const TEMPERATURE_KEY: &str = "TEMPERATURE";
/// Canonical key under which nucleus sampling is stored.
pub const TOP_P_KEY: &str = "TOPP";

/// Normalized request settings attached to a completion job.
///
/// Key names are upper-cased on insertion so equivalent settings supplied
/// under different aliases (e.g. `maxTokens` vs `MAX_NEW_TOKENS`) collapse to
/// the same canonical entry during comparison and lookup. Values are kept as
/// canonical strings; typed accessors parse the common ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestSettings {
    entries: BTreeMap<String, String>,
}

impl RequestSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalizes a raw key name: upper-cased, underscores removed, known
    /// aliases collapsed to their canonical key.
    pub fn canonical_key(raw: &str) -> String {
        let upper: String = raw
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .flat_map(|c| c.to_uppercase())
            .collect();
        match upper.as_str() {
            "MAXNEWTOKENS" | "MAXCOMPLETIONTOKENS" => MAX_TOKENS_KEY.to_string(),
            "TEMP" => TEMPERATURE_KEY.to_string(),
            _ => upper,
        }
    }

    /// Inserts a setting under its canonical key.
    pub fn set(&mut self, key: &str, value: impl ToString) -> &mut Self {
        self.entries
            .insert(Self::canonical_key(key), value.to_string());
        self
    }

    /// Looks up a setting by any alias of its key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&Self::canonical_key(key))
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// True when every tracked entry of `self` is present in `other` with an
    /// equal value. Used by signature matching: the signature's settings are
    /// the tracked subset.
    pub fn is_subset_of(&self, other: &RequestSettings) -> bool {
        self.entries
            .iter()
            .all(|(key, value)| other.entries.get(key).is_some_and(|v| v == value))
    }

    pub fn max_tokens(&self) -> Option<u32> {
        self.entries.get(MAX_TOKENS_KEY)?.parse().ok()
    }

    pub fn set_max_tokens(&mut self, max_tokens: u32) {
        self.entries
            .insert(MAX_TOKENS_KEY.to_string(), max_tokens.to_string());
    }

    pub fn temperature(&self) -> Option<f64> {
        self.entries.get(TEMPERATURE_KEY)?.parse().ok()
    }

    pub fn set_temperature(&mut self, temperature: f64) {
        self.entries
            .insert(TEMPERATURE_KEY.to_string(), temperature.to_string());
    }

    pub fn top_p(&self) -> Option<f64> {
        self.entries.get(TOP_P_KEY)?.parse().ok()
    }
}

impl<K: AsRef<str>, V: ToString> FromIterator<(K, V)> for RequestSettings {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut settings = RequestSettings::new();
        for (key, value) in iter {
            settings.set(key.as_ref(), value);
        }
        settings
    }
}

/// A job to be executed by the multi-connector dispatch.
///
/// Immutable once constructed; two jobs are equal when their prompt text and
/// all normalized settings are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompletionJob {
    prompt: String,
    settings: RequestSettings,
}

impl CompletionJob {
    /// Builds a job from a raw prompt and its request settings.
    ///
    /// Fails with [`DispatchError::InvalidJob`] when the prompt is empty.
    pub fn new(
        prompt: impl Into<String>,
        settings: RequestSettings,
    ) -> Result<Self, DispatchError> {
        let prompt = prompt.into();
        if prompt.is_empty() {
            return Err(DispatchError::InvalidJob(
                "prompt must not be empty".to_string(),
            ));
        }
        Ok(Self { prompt, settings })
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn settings(&self) -> &RequestSettings {
        &self.settings
    }
}

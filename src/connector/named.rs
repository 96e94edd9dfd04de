//! Named connector descriptors.

use crate::connector::provider::{
    CompletionProvider, CompletionStream, TokenCounter, whitespace_token_counter,
};
use crate::error::CompletionError;
use crate::job::RequestSettings;
use crate::settings::transform::PromptTransform;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::trace;

/// How a connector caps the requested completion token budget against its
/// own context limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MaxTokensAdjustment {
    /// Leave the requested budget untouched.
    None,
    /// Cap the budget at a percentage of the connector's max tokens.
    Percentage,
    /// Count the prompt tokens and grant what remains of the connector's max
    /// tokens.
    CountInputTokens,
}

/// Mapping of a temperature into the range a given model supports.
pub type TemperatureTransform = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

/// A completion provider instance with a unique name and its cost, capacity
/// and transform configuration.
///
/// Created once at configuration time and read-mostly during dispatch. The
/// first connector handed to the dispatcher is the designated primary
/// (trusted) connector.
pub struct NamedConnector {
    name: String,
    provider: Arc<dyn CompletionProvider>,
    max_tokens: Option<u32>,
    cost_per_request: f64,
    cost_per_1000_tokens: f64,
    token_counter: TokenCounter,
    max_tokens_adjustment: MaxTokensAdjustment,
    max_tokens_reserve_percentage: u32,
    prompt_transform: Option<PromptTransform>,
    temperature_transform: Option<TemperatureTransform>,
    concurrency_gate: Semaphore,
}

impl fmt::Debug for NamedConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedConnector")
            .field("name", &self.name)
            .field("max_tokens", &self.max_tokens)
            .field("cost_per_request", &self.cost_per_request)
            .field("cost_per_1000_tokens", &self.cost_per_1000_tokens)
            .finish_non_exhaustive()
    }
}

impl NamedConnector {
    pub fn new(name: impl Into<String>, provider: Arc<dyn CompletionProvider>) -> Self {
        Self {
            name: name.into(),
            provider,
            max_tokens: None,
            cost_per_request: 0.0,
            cost_per_1000_tokens: 0.0,
            token_counter: whitespace_token_counter(),
            max_tokens_adjustment: MaxTokensAdjustment::Percentage,
            max_tokens_reserve_percentage: 80,
            prompt_transform: None,
            temperature_transform: None,
            concurrency_gate: Semaphore::new(1),
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_costs(mut self, per_request: f64, per_1000_tokens: f64) -> Self {
        self.cost_per_request = per_request;
        self.cost_per_1000_tokens = per_1000_tokens;
        self
    }

    pub fn with_token_counter(mut self, counter: TokenCounter) -> Self {
        self.token_counter = counter;
        self
    }

    pub fn with_max_tokens_adjustment(
        mut self,
        adjustment: MaxTokensAdjustment,
        reserve_percentage: u32,
    ) -> Self {
        self.max_tokens_adjustment = adjustment;
        self.max_tokens_reserve_percentage = reserve_percentage;
        self
    }

    pub fn with_prompt_transform(mut self, transform: PromptTransform) -> Self {
        self.prompt_transform = Some(transform);
        self
    }

    pub fn with_temperature_transform(mut self, transform: TemperatureTransform) -> Self {
        self.temperature_transform = Some(transform);
        self
    }

    /// Maximum number of in-flight requests against this connector. Excess
    /// callers wait for a slot rather than fail.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.concurrency_gate = Semaphore::new(max_concurrency.max(1));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_tokens(&self) -> Option<u32> {
        self.max_tokens
    }

    pub fn prompt_transform(&self) -> Option<&PromptTransform> {
        self.prompt_transform.as_ref()
    }

    pub fn temperature_transform(&self) -> Option<&TemperatureTransform> {
        self.temperature_transform.as_ref()
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        (self.token_counter)(text)
    }

    /// Cost of one completion: the per-request price plus the per-token
    /// price over prompt and result together.
    pub fn cost_of(&self, prompt: &str, result: &str) -> f64 {
        let tokens = self.count_tokens(prompt) + self.count_tokens(result);
        self.cost_per_request + self.cost_per_1000_tokens * tokens as f64 / 1000.0
    }

    /// Effective completion token budget for `settings` under this
    /// connector's adjustment strategy.
    pub fn adjusted_max_tokens(&self, prompt: &str, requested: Option<u32>) -> Option<u32> {
        let Some(model_max) = self.max_tokens else {
            return requested;
        };
        match self.max_tokens_adjustment {
            MaxTokensAdjustment::None => requested,
            MaxTokensAdjustment::Percentage => {
                let ceiling = model_max * self.max_tokens_reserve_percentage / 100;
                Some(requested.map_or(ceiling, |r| r.min(ceiling)))
            }
            MaxTokensAdjustment::CountInputTokens => {
                let input = self.count_tokens(prompt) as u32;
                let remaining = model_max.saturating_sub(input);
                Some(requested.map_or(remaining, |r| r.min(remaining)))
            }
        }
    }

    /// Runs the completion, waiting for a concurrency slot first, and
    /// measures the call duration.
    pub async fn complete(
        &self,
        prompt: &str,
        settings: &RequestSettings,
    ) -> Result<(String, Duration), CompletionError> {
        let _permit = self
            .concurrency_gate
            .acquire()
            .await
            .map_err(|_| CompletionError::ProviderUnavailable(self.name.clone()))?;
        trace!(connector = %self.name, "invoking completion provider");
        let started = Instant::now();
        let text = self.provider.complete(prompt, settings).await?;
        Ok((text, started.elapsed()))
    }

    /// Streaming variant; the permit is held until the stream is produced
    /// (chunk consumption is the caller's pace).
    pub async fn complete_stream(
        &self,
        prompt: &str,
        settings: &RequestSettings,
    ) -> Result<CompletionStream, CompletionError> {
        let _permit = self
            .concurrency_gate
            .acquire()
            .await
            .map_err(|_| CompletionError::ProviderUnavailable(self.name.clone()))?;
        trace!(connector = %self.name, "opening completion stream");
        self.provider.complete_stream(prompt, settings).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::arithmetic::ArithmeticProvider;

    fn connector() -> NamedConnector {
        NamedConnector::new("calc", Arc::new(ArithmeticProvider::exact()))
            .with_max_tokens(1000)
            .with_costs(0.002, 0.5)
    }

    #[test]
    fn cost_combines_request_and_token_price() {
        let connector = connector();
        // "Compute Add(1, 1)" -> 3 words, "2" -> 1 word.
        let cost = connector.cost_of("Compute Add(1, 1)", "2");
        assert!((cost - (0.002 + 0.5 * 4.0 / 1000.0)).abs() < 1e-12);
    }

    #[test]
    fn percentage_adjustment_caps_budget() {
        let connector = connector();
        assert_eq!(connector.adjusted_max_tokens("p", Some(900)), Some(800));
        assert_eq!(connector.adjusted_max_tokens("p", Some(100)), Some(100));
        assert_eq!(connector.adjusted_max_tokens("p", None), Some(800));
    }

    #[test]
    fn input_counting_adjustment_subtracts_prompt() {
        let connector = connector()
            .with_max_tokens_adjustment(MaxTokensAdjustment::CountInputTokens, 100);
        assert_eq!(
            connector.adjusted_max_tokens("one two three", Some(2000)),
            Some(997)
        );
    }

    #[tokio::test]
    async fn concurrency_ceiling_serializes_calls() {
        let connector = Arc::new(
            NamedConnector::new(
                "slow",
                Arc::new(ArithmeticProvider::exact().with_latency(Duration::from_millis(20))),
            )
            .with_max_concurrency(1),
        );

        let started = Instant::now();
        let a = {
            let c = Arc::clone(&connector);
            tokio::spawn(async move {
                c.complete("Compute Add(1, 1)", &RequestSettings::new()).await
            })
        };
        let b = {
            let c = Arc::clone(&connector);
            tokio::spawn(async move {
                c.complete("Compute Add(2, 2)", &RequestSettings::new()).await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        // Two 20ms calls through a single slot cannot overlap.
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}

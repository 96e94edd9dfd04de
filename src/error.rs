//! Error taxonomy for the dispatch path, the provider contract and the
//! analysis pipeline.
//!
//! Dispatch-path errors propagate synchronously to the caller of a job.
//! Pipeline errors never do: they are captured and surfaced through
//! [`AnalysisEvent::Crashed`](crate::analysis::AnalysisEvent) instead.

use std::sync::Arc;

/// Errors returned synchronously on the dispatch path.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid completion job: {0}")]
    InvalidJob(String),
    #[error("Prompt is too short to extract a signature of length {required} (got {length} chars)")]
    PromptTooShort { length: usize, required: usize },
    #[error("No connectors configured")]
    NoConnectors,
    #[error("Connector '{name}' failed: {source}")]
    Connector {
        name: String,
        #[source]
        source: CompletionError,
    },
}

/// Failures raised by a completion provider implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CompletionError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("Context too large: {current} > {max}")]
    ContextTooLarge { current: u64, max: u64 },
    #[error("Network error: {0}")]
    Network(String),
    #[error("Provider-specific error: {0}")]
    ProviderSpecific(String),
}

/// Faults raised inside the analysis pipeline.
///
/// These are reported through the crash notification channel, never thrown
/// into an unrelated caller's context.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    #[error("Connector '{connector}' failed during analysis: {source}")]
    Completion {
        connector: String,
        #[source]
        source: CompletionError,
    },
    #[error("Evaluation of connector '{connector}' produced no verdict after {trials} trials")]
    NoVerdict { connector: String, trials: u32 },
    #[error("Failed to persist suggested settings: {0}")]
    Persistence(String),
    #[error("Analysis cancelled")]
    Cancelled,
}

/// Shared fault handle carried by crash notifications.
pub type PipelineFault = Arc<PipelineError>;

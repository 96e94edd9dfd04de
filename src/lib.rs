//! # textmux
//!
//! An adaptive multi-connector text-completion dispatcher. Jobs are
//! classified into prompt types by their leading text, routed to the best
//! connector known for that type, and continuously vetted: cheaper
//! connectors are probed with real prompts, judged against the trusted
//! primary connector, and promoted once their answers hold up.
//!
//! ## Architecture Overview
//!
//! - **[`dispatch`]**: The [`MultiDispatcher`] entry point routing jobs and
//!   feeding the vetting pipeline
//! - **[`settings`]**: Prompt-type registry, signatures, connector
//!   performance records, transforms and durable snapshots
//! - **[`connector`]**: The [`CompletionProvider`] seam, named connector
//!   descriptors with cost and capacity metadata, and deterministic
//!   arithmetic test providers
//! - **[`analysis`]**: The background sample → test → evaluate → suggest
//!   loop that earns connectors their vetting levels
//! - **[`creditor`]**: Lock-free accrual of compound completion cost
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use textmux::{
//!     AnalysisConfig, ArithmeticProvider, CompletionJob, DispatchSettings,
//!     MultiDispatcher, NamedConnector, RequestSettings,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let connectors = vec![
//!         Arc::new(
//!             NamedConnector::new("primary", Arc::new(ArithmeticProvider::exact()))
//!                 .with_costs(0.02, 0.4),
//!         ),
//!         Arc::new(
//!             NamedConnector::new("cheap", Arc::new(ArithmeticProvider::exact()))
//!                 .with_costs(0.0, 0.01),
//!         ),
//!     ];
//!     let dispatcher = MultiDispatcher::new(
//!         Arc::new(DispatchSettings::default()),
//!         connectors,
//!         AnalysisConfig::default(),
//!     )?;
//!
//!     let job = CompletionJob::new("Compute Add(1, 1)", RequestSettings::new())?;
//!     let result = dispatcher.complete(job).await?;
//!     println!("{} answered: {}", result.connector_name, result.text);
//!     Ok(())
//! }
//! ```

/// The background vetting pipeline.
///
/// Collects samples from dispatched jobs, probes unvetted connectors with
/// the same prompts, has the trusted connector judge the results and folds
/// verdicts back into the per-type performance records.
pub mod analysis;

/// Completion providers and named connector descriptors.
pub mod connector;

/// Lock-free accrual of compound completion cost across connectors.
pub mod creditor;

/// The multi-connector dispatcher: the caller-facing entry point.
pub mod dispatch;

/// Error taxonomy of the dispatcher, connectors and pipeline.
pub mod error;

/// Completion jobs and their normalized request settings.
pub mod job;

/// Resolved dispatch sessions.
pub mod session;

/// Prompt-type registry, signatures, performance records, transforms and
/// durable snapshots.
pub mod settings;

/// Copy-on-write helper for settings adjustments.
pub mod updater;

pub use analysis::{
    AnalysisConfig, AnalysisCoordinator, AnalysisEvent, AnalysisRecord, ConnectorEvaluation,
    ConnectorTest,
};
pub use connector::{
    ArithmeticEngine, ArithmeticOperation, ArithmeticProvider, CompletionProvider,
    CompletionStream, MaxTokensAdjustment, NamedConnector,
};
pub use creditor::CostCreditor;
pub use dispatch::{DispatchResult, MultiDispatcher};
pub use error::{CompletionError, DispatchError, PipelineError, PipelineFault};
pub use job::{CompletionJob, RequestSettings};
pub use session::DispatchSession;
pub use settings::persistence::SettingsSnapshot;
pub use settings::{
    DispatchSettings,
    performance::{ConnectorPerformance, VettingLevel, weighted_comparator},
    prompt_type::{PromptPolicy, PromptType},
    signature::PromptSignature,
    transform::PromptTransform,
};

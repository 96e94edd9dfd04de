//! The analysis pipeline: sample → test → evaluate → suggest.
//!
//! Connectors earn their vetting levels here. Dispatched jobs served by the
//! trusted connector are collected as samples; unvetted connectors are then
//! probed with the same prompts, the trusted connector judges their output,
//! and successful verdicts promote vetting levels so future dispatches may
//! select the cheaper connector.

pub mod pipeline;
pub mod types;

mod tests;

pub use pipeline::{AnalysisConfig, AnalysisCoordinator};
pub use types::{AnalysisEvent, AnalysisRecord, ConnectorEvaluation, ConnectorTest};

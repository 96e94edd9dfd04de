//! Records and events produced by the analysis pipeline.

use crate::error::PipelineFault;
use crate::job::RequestSettings;
use crate::settings::persistence::SettingsSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One recorded (prompt, result) pair from a connector.
///
/// Samples are tests run by the trusted connector during normal dispatch;
/// probe tests are runs of the same prompt on connectors under vetting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorTest {
    pub connector_name: String,
    pub prompt: String,
    pub settings: RequestSettings,
    pub result: String,
    pub duration: Duration,
    pub cost: f64,
    pub timestamp: DateTime<Utc>,
}

impl ConnectorTest {
    pub fn new(
        connector_name: impl Into<String>,
        prompt: impl Into<String>,
        settings: RequestSettings,
        result: impl Into<String>,
        duration: Duration,
        cost: f64,
    ) -> Self {
        Self {
            connector_name: connector_name.into(),
            prompt: prompt.into(),
            settings,
            result: result.into(),
            duration,
            cost,
            timestamp: Utc::now(),
        }
    }
}

/// Verdict of one evaluation of a probe test against its reference sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorEvaluation {
    pub test: ConnectorTest,
    /// Name of the connector that judged the test.
    pub vetting_connector: String,
    pub is_vetted: bool,
    pub timestamp: DateTime<Utc>,
}

/// The accumulating collection of samples, probe tests and evaluations for
/// one analysis cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub samples: Vec<ConnectorTest>,
    pub tests: Vec<ConnectorTest>,
    pub evaluations: Vec<ConnectorEvaluation>,
    pub test_timestamp: Option<DateTime<Utc>>,
    pub evaluation_timestamp: Option<DateTime<Utc>>,
    pub suggestion_timestamp: Option<DateTime<Utc>>,
}

/// Notifications raised by the pipeline, delivered through the subscription
/// handle scoped to the coordinator instance.
#[derive(Debug, Clone)]
pub enum AnalysisEvent {
    /// New samples were flushed from the collection buffer.
    SamplesReceived { new_samples: Vec<ConnectorTest> },
    /// The evaluation stage finished a cycle.
    EvaluationCompleted { record: AnalysisRecord },
    /// The suggestion stage finished: performance records were updated and a
    /// settings snapshot reflecting them is attached.
    SuggestionCompleted {
        record: AnalysisRecord,
        suggested_settings: SettingsSnapshot,
    },
    /// A stage crashed; the fault is carried here instead of stalling
    /// silently or unwinding into an unrelated caller.
    Crashed { fault: PipelineFault },
}

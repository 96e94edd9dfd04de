//! Resolved dispatch sessions.

use crate::connector::NamedConnector;
use crate::job::{CompletionJob, RequestSettings};
use crate::settings::prompt_type::PromptPolicy;
use std::sync::Arc;

/// The ready-to-execute form of a completion job after classification,
/// connector selection and transforms.
#[derive(Debug, Clone)]
pub struct DispatchSession {
    /// The original job as submitted by the caller.
    pub job: CompletionJob,
    /// The final prompt after global, type and connector transforms.
    pub prompt: String,
    /// The final request settings after connector adjustments.
    pub settings: RequestSettings,
    /// The connector chosen to serve the job.
    pub connector: Arc<NamedConnector>,
    /// The prompt policy the job classified into.
    pub policy: Arc<PromptPolicy>,
    /// Whether classification created a new prompt type for this job.
    pub is_new_type: bool,
}

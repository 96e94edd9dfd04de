//! The multi-connector dispatcher.
//!
//! [`MultiDispatcher`] is the single entry point callers use. Each job is
//! classified into a prompt type, routed to the cheapest vetted connector
//! (the trusted primary until cheaper ones are vetted), executed, accounted
//! for, and possibly queued as a vetting sample.

use crate::analysis::{AnalysisConfig, AnalysisCoordinator, AnalysisEvent, ConnectorTest};
use crate::connector::{CompletionStream, NamedConnector};
use crate::error::DispatchError;
use crate::job::CompletionJob;
use crate::session::DispatchSession;
use crate::settings::DispatchSettings;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Outcome of one dispatched completion.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub text: String,
    /// Name of the connector that served the job.
    pub connector_name: String,
    pub duration: Duration,
    pub cost: f64,
}

/// Routes completion jobs across a set of named connectors and feeds the
/// vetting pipeline.
///
/// The first connector is the designated primary: trusted unconditionally
/// and used as the reference for vetting the others.
pub struct MultiDispatcher {
    settings: Arc<DispatchSettings>,
    connectors: Vec<Arc<NamedConnector>>,
    analysis: Arc<AnalysisCoordinator>,
}

impl MultiDispatcher {
    /// Builds a dispatcher over an ordered connector set. The background
    /// analysis tasks are spawned here, so this must run inside a tokio
    /// runtime.
    pub fn new(
        settings: Arc<DispatchSettings>,
        connectors: Vec<Arc<NamedConnector>>,
        analysis_config: AnalysisConfig,
    ) -> Result<Self, DispatchError> {
        if connectors.is_empty() {
            return Err(DispatchError::NoConnectors);
        }
        let analysis = AnalysisCoordinator::new(
            analysis_config,
            Arc::clone(&settings),
            connectors.clone(),
        );
        Ok(Self {
            settings,
            connectors,
            analysis,
        })
    }

    pub fn settings(&self) -> &Arc<DispatchSettings> {
        &self.settings
    }

    pub fn connectors(&self) -> &[Arc<NamedConnector>] {
        &self.connectors
    }

    pub fn analysis(&self) -> &Arc<AnalysisCoordinator> {
        &self.analysis
    }

    /// Subscription handle for analysis pipeline notifications.
    pub fn events(&self) -> broadcast::Receiver<AnalysisEvent> {
        self.analysis.subscribe()
    }

    /// Dispatches one completion job end to end.
    pub async fn complete(&self, job: CompletionJob) -> Result<DispatchResult, DispatchError> {
        let session = self.settings.build_session(job, &self.connectors)?;
        let (text, duration) = session
            .connector
            .complete(&session.prompt, &session.settings)
            .await
            .map_err(|source| DispatchError::Connector {
                name: session.connector.name().to_string(),
                source,
            })?;

        let cost = self.settle(&session, &text, duration);
        Ok(DispatchResult {
            text,
            connector_name: session.connector.name().to_string(),
            duration,
            cost,
        })
    }

    /// Streaming variant of [`complete`](Self::complete). Accounting and
    /// sampling run once the stream is exhausted, over the accumulated text;
    /// an abandoned or failed stream settles nothing.
    pub async fn complete_stream(
        &self,
        job: CompletionJob,
    ) -> Result<CompletionStream, DispatchError> {
        let session = self.settings.build_session(job, &self.connectors)?;
        let inner = session
            .connector
            .complete_stream(&session.prompt, &session.settings)
            .await
            .map_err(|source| DispatchError::Connector {
                name: session.connector.name().to_string(),
                source,
            })?;

        let started = Instant::now();
        let finalizer = Some(StreamFinalizer {
            settings: Arc::clone(&self.settings),
            connectors: self.connectors.clone(),
            analysis: Arc::clone(&self.analysis),
            session,
        });
        let stream = futures::stream::unfold(
            (inner, String::new(), finalizer),
            move |(mut inner, mut accumulated, finalizer)| async move {
                match inner.next().await {
                    Some(Ok(chunk)) => {
                        accumulated.push_str(&chunk);
                        Some((Ok(chunk), (inner, accumulated, finalizer)))
                    }
                    Some(Err(error)) => Some((Err(error), (inner, accumulated, None))),
                    None => {
                        if let Some(finalizer) = finalizer {
                            finalizer.finish(&accumulated, started.elapsed());
                        }
                        None
                    }
                }
            },
        );
        Ok(Box::pin(stream))
    }

    /// Runs the full optimization cycle and applies its outcome; see
    /// [`AnalysisCoordinator::optimize`].
    pub async fn optimize(
        &self,
    ) -> Result<
        (
            crate::analysis::AnalysisRecord,
            crate::settings::persistence::SettingsSnapshot,
        ),
        crate::error::PipelineFault,
    > {
        self.analysis.optimize().await
    }

    fn settle(&self, session: &DispatchSession, text: &str, duration: Duration) -> f64 {
        settle_completion(
            &self.settings,
            &self.connectors,
            &self.analysis,
            session,
            text,
            duration,
        )
    }
}

/// Accounting carried into a dispatched stream, run when it completes.
struct StreamFinalizer {
    settings: Arc<DispatchSettings>,
    connectors: Vec<Arc<NamedConnector>>,
    analysis: Arc<AnalysisCoordinator>,
    session: DispatchSession,
}

impl StreamFinalizer {
    fn finish(&self, text: &str, duration: Duration) {
        settle_completion(
            &self.settings,
            &self.connectors,
            &self.analysis,
            &self.session,
            text,
            duration,
        );
    }
}

/// Post-completion accounting: credits the cost ledger and queues the job as
/// a vetting sample when the policy still wants one.
fn settle_completion(
    settings: &DispatchSettings,
    connectors: &[Arc<NamedConnector>],
    analysis: &AnalysisCoordinator,
    session: &DispatchSession,
    text: &str,
    duration: Duration,
) -> f64 {
    let cost = session.connector.cost_of(&session.prompt, text);
    if let Some(creditor) = &settings.creditor {
        creditor.credit(cost);
        trace!(cost, ongoing = creditor.ongoing_cost(), "credited completion cost");
    }

    let sample_wanted = settings.sampling_enabled()
        && session.policy.is_sample_needed(
            &session.job,
            session.is_new_type,
            settings.max_instances,
            settings.sample_vetted_connectors,
            connectors,
        );
    if sample_wanted {
        session
            .policy
            .record_instance(session.job.prompt(), settings.max_instances);
        session.policy.mark_session_prompt(session.job.prompt());
        debug!(
            prompt_type = %session.policy.type_name(),
            connector = %session.connector.name(),
            "queueing dispatched job as vetting sample"
        );
        analysis.enqueue_sample(
            ConnectorTest::new(
                session.connector.name(),
                session.prompt.clone(),
                session.settings.clone(),
                text,
                duration,
                cost,
            ),
            session.job.clone(),
        );
    }
    cost
}

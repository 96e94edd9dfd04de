//! The analysis coordinator and its four stages.

use crate::analysis::types::{
    AnalysisEvent, AnalysisRecord, ConnectorEvaluation, ConnectorTest,
};
use crate::connector::NamedConnector;
use crate::error::{PipelineError, PipelineFault};
use crate::job::CompletionJob;
use crate::settings::DispatchSettings;
use crate::settings::persistence::SettingsSnapshot;
use crate::settings::prompt_type::PromptPolicy;
use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Notify, broadcast, mpsc, watch};
use tracing::{debug, info, trace, warn};

/// Default template asking the trusted connector for a vetting verdict.
/// Placeholders: `{prompt}`, `{reference}`, `{candidate}`.
pub const DEFAULT_VETTING_PROMPT_TEMPLATE: &str = "Below is an instruction, the reference answer from a trusted model, and a candidate answer to judge.\nInstruction:\n{prompt}\n\nReference answer:\n{reference}\n\nCandidate answer:\n{candidate}\n\nIs the candidate answer correct? Answer true or false:";

/// Configuration of the analysis pipeline stages.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Run the testing stage when new samples arrive.
    pub enable_test: bool,
    /// Run the evaluation stage after testing.
    pub enable_evaluation: bool,
    /// Run the suggestion stage after evaluation.
    pub enable_suggestion: bool,
    /// Hold each analysis run until [`AnalysisCoordinator::release_analysis`]
    /// is called. Makes the pipeline deterministic for tests and
    /// controlled-cost operation.
    pub await_manual_trigger: bool,
    /// Let the connector under test judge its own output instead of the
    /// trusted connector.
    pub enable_self_vetting: bool,
    /// Also probe the connector that produced the reference sample.
    pub enable_reference_connector_tests: bool,
    /// Number of repeated evaluation trials before a verdict is finalized.
    pub nb_prompt_tests: u32,
    /// Parallelism bound across samples under test.
    pub max_parallel_tests: usize,
    /// Parallelism bound across connectors probed per sample.
    pub max_parallel_connectors: usize,
    /// Temperature used to diversify repeated trials when only one sample
    /// was collected for a type.
    pub diversification_temperature: f64,
    /// Template of the vetting prompt sent to the judging connector.
    pub vetting_prompt_template: String,
    /// When set, the suggestion stage checkpoints the updated settings
    /// snapshot to this file.
    pub settings_file: Option<PathBuf>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            enable_test: true,
            enable_evaluation: true,
            enable_suggestion: true,
            await_manual_trigger: false,
            enable_self_vetting: false,
            enable_reference_connector_tests: false,
            nb_prompt_tests: 3,
            max_parallel_tests: 3,
            max_parallel_connectors: 3,
            diversification_temperature: 1.0,
            vetting_prompt_template: DEFAULT_VETTING_PROMPT_TEMPLATE.to_string(),
            settings_file: None,
        }
    }
}

/// Coordinates the sample → test → evaluate → suggest loop.
///
/// Stages run as independent tokio tasks; the sampling → testing handoff is
/// channel-driven, not polled. Faults inside any stage surface through
/// [`AnalysisEvent::Crashed`], never through a dispatch caller.
pub struct AnalysisCoordinator {
    config: AnalysisConfig,
    settings: Arc<DispatchSettings>,
    connectors: Vec<Arc<NamedConnector>>,
    record: Mutex<AnalysisRecord>,
    /// Jobs currently buffered for sampling; keyed by the job value itself.
    in_flight: DashMap<CompletionJob, ()>,
    events: broadcast::Sender<AnalysisEvent>,
    release_gate: Notify,
    awaits_trigger: AtomicBool,
    sample_tx: mpsc::UnboundedSender<(ConnectorTest, CompletionJob)>,
    shutdown_tx: watch::Sender<bool>,
}

impl AnalysisCoordinator {
    /// Creates the coordinator and spawns its sample-batching task. Must be
    /// called from within a tokio runtime.
    pub fn new(
        config: AnalysisConfig,
        settings: Arc<DispatchSettings>,
        connectors: Vec<Arc<NamedConnector>>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let (sample_tx, sample_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let awaits_trigger = AtomicBool::new(config.await_manual_trigger);

        let coordinator = Arc::new(Self {
            config,
            settings,
            connectors,
            record: Mutex::new(AnalysisRecord::default()),
            in_flight: DashMap::new(),
            events,
            release_gate: Notify::new(),
            awaits_trigger,
            sample_tx,
            shutdown_tx,
        });

        tokio::spawn(Arc::clone(&coordinator).batch_samples(sample_rx, shutdown_rx));
        coordinator
    }

    /// Subscription handle for pipeline notifications, scoped to this
    /// coordinator instance.
    pub fn subscribe(&self) -> broadcast::Receiver<AnalysisEvent> {
        self.events.subscribe()
    }

    /// Unblocks one pending analysis run waiting on the manual trigger.
    /// Harmless when none is waiting.
    pub fn release_analysis(&self) {
        self.release_gate.notify_one();
    }

    /// Disables the manual-trigger gate for all future runs.
    pub fn disable_manual_trigger(&self) {
        self.awaits_trigger.store(false, Ordering::SeqCst);
    }

    /// Requests cooperative shutdown of all pipeline tasks.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Copy of the accumulated analysis record.
    pub async fn record(&self) -> AnalysisRecord {
        self.record.lock().await.clone()
    }

    /// Queues an executed job as a sample candidate. Duplicate jobs already
    /// buffered this cycle are dropped here.
    pub fn enqueue_sample(&self, test: ConnectorTest, job: CompletionJob) {
        if self.in_flight.insert(job.clone(), ()).is_some() {
            trace!(prompt = %test.prompt, "sample already in flight, skipping");
            return;
        }
        if self.sample_tx.send((test, job)).is_err() {
            warn!("sample channel closed; analysis pipeline is shut down");
        }
    }

    /// Stage 1: coalesces bursts of samples into batches, records them and
    /// hands each batch to an analysis run.
    async fn batch_samples(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<(ConnectorTest, CompletionJob)>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let first = tokio::select! {
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => return,
                },
                _ = shutdown.changed() => return,
            };

            let mut batch = vec![first];
            // Collect the rest of the burst before flushing.
            while let Ok(Some(item)) =
                tokio::time::timeout(self.settings.sample_collection_delay, rx.recv()).await
            {
                batch.push(item);
            }

            let new_samples: Vec<ConnectorTest> =
                batch.iter().map(|(test, _)| test.clone()).collect();
            for (_, job) in &batch {
                self.in_flight.remove(job);
            }
            {
                let mut record = self.record.lock().await;
                record.samples.extend(new_samples.iter().cloned());
            }
            debug!(count = new_samples.len(), "flushed sample batch");
            let _ = self.events.send(AnalysisEvent::SamplesReceived {
                new_samples: new_samples.clone(),
            });

            if self.config.enable_test {
                let coordinator = Arc::clone(&self);
                tokio::spawn(async move {
                    if let Err(fault) = coordinator.run_analysis(new_samples).await {
                        warn!(%fault, "analysis run crashed");
                        let _ = coordinator
                            .events
                            .send(AnalysisEvent::Crashed { fault: Arc::new(fault) });
                    }
                });
            }
        }
    }

    /// Stages 2–4 for one batch of reference samples.
    async fn run_analysis(
        &self,
        samples: Vec<ConnectorTest>,
    ) -> Result<(), PipelineError> {
        if self.awaits_trigger.load(Ordering::SeqCst) {
            trace!("analysis run awaiting manual trigger");
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::select! {
                _ = self.release_gate.notified() => {}
                _ = shutdown.changed() => return Err(PipelineError::Cancelled),
            }
        }
        if self.is_shutdown() {
            return Err(PipelineError::Cancelled);
        }

        let tests = self.run_tests(&samples).await?;
        {
            let mut record = self.record.lock().await;
            record.tests.extend(tests.iter().cloned());
            record.test_timestamp = Some(Utc::now());
        }
        if !self.config.enable_evaluation {
            return Ok(());
        }

        let evaluations = self.run_evaluations(&samples, &tests).await?;
        let record_snapshot = {
            let mut record = self.record.lock().await;
            record.evaluations.extend(evaluations.iter().cloned());
            record.evaluation_timestamp = Some(Utc::now());
            record.clone()
        };
        let _ = self.events.send(AnalysisEvent::EvaluationCompleted {
            record: record_snapshot,
        });
        if !self.config.enable_suggestion {
            return Ok(());
        }

        self.run_suggestion(&samples, &evaluations).await
    }

    /// Stage 2: probes every untested-but-eligible connector with each
    /// sample's prompt. Individual connector failures are logged and skipped;
    /// they never abort the batch.
    async fn run_tests(
        &self,
        samples: &[ConnectorTest],
    ) -> Result<Vec<ConnectorTest>, PipelineError> {
        let results: Vec<Vec<ConnectorTest>> = futures::stream::iter(samples.iter().cloned())
            .map(|sample| self.test_one_sample(sample))
            .buffer_unordered(self.config.max_parallel_tests.max(1))
            .collect()
            .await;
        Ok(results.into_iter().flatten().collect())
    }

    async fn test_one_sample(&self, sample: ConnectorTest) -> Vec<ConnectorTest> {
        let Some(policy) = self.policy_of(&sample) else {
            return Vec::new();
        };
        let candidates = policy.connectors_to_test(
            &sample.connector_name,
            &self.connectors,
            self.config.enable_reference_connector_tests,
        );
        trace!(
            prompt_type = %policy.type_name(),
            candidates = candidates.len(),
            "probing unvetted connectors"
        );

        let sample = Arc::new(sample);
        futures::stream::iter(candidates)
            .map(|connector| {
                let sample = Arc::clone(&sample);
                let shutdown = self.is_shutdown();
                async move {
                    if shutdown {
                        return None;
                    }
                    match connector.complete(&sample.prompt, &sample.settings).await {
                        Ok((result, duration)) => {
                            let cost = connector.cost_of(&sample.prompt, &result);
                            Some(ConnectorTest::new(
                                connector.name(),
                                sample.prompt.clone(),
                                sample.settings.clone(),
                                result,
                                duration,
                                cost,
                            ))
                        }
                        Err(error) => {
                            warn!(connector = %connector.name(), %error, "probe test failed; skipping connector");
                            None
                        }
                    }
                }
            })
            .buffer_unordered(self.config.max_parallel_connectors.max(1))
            .filter_map(|test| async move { test })
            .collect()
            .await
    }

    /// Stage 3: the trusted connector (or the connector itself under
    /// self-vetting) judges each probe test against its reference sample.
    async fn run_evaluations(
        &self,
        samples: &[ConnectorTest],
        tests: &[ConnectorTest],
    ) -> Result<Vec<ConnectorEvaluation>, PipelineError> {
        let mut evaluations = Vec::with_capacity(tests.len());
        for test in tests {
            if self.is_shutdown() {
                return Err(PipelineError::Cancelled);
            }
            let Some(reference) = samples.iter().find(|s| s.prompt == test.prompt) else {
                continue;
            };
            let evaluation = self.evaluate_test(test, reference, samples.len()).await?;
            evaluations.push(evaluation);
        }
        Ok(evaluations)
    }

    async fn evaluate_test(
        &self,
        test: &ConnectorTest,
        reference: &ConnectorTest,
        batch_size: usize,
    ) -> Result<ConnectorEvaluation, PipelineError> {
        let judge = if self.config.enable_self_vetting {
            self.connectors
                .iter()
                .find(|c| c.name() == test.connector_name)
                .cloned()
                .unwrap_or_else(|| Arc::clone(&self.connectors[0]))
        } else {
            Arc::clone(&self.connectors[0])
        };

        let vetting_prompt = self
            .config
            .vetting_prompt_template
            .replace("{prompt}", &test.prompt)
            .replace("{reference}", &reference.result)
            .replace("{candidate}", &test.result);

        let mut verdicts = Vec::new();
        for trial in 0..self.config.nb_prompt_tests.max(1) {
            let mut settings = test.settings.clone();
            // A single collected sample gives repeated trials nothing new to
            // compare against; raise the temperature to diversify them.
            if batch_size == 1 && trial > 0 {
                settings.set_temperature(self.config.diversification_temperature);
            }
            let (reply, _) = judge
                .complete(&vetting_prompt, &settings)
                .await
                .map_err(|source| PipelineError::Completion {
                    connector: judge.name().to_string(),
                    source,
                })?;
            if let Some(verdict) = parse_verdict(&reply) {
                verdicts.push(verdict);
            }
        }

        if verdicts.is_empty() {
            return Err(PipelineError::NoVerdict {
                connector: test.connector_name.clone(),
                trials: self.config.nb_prompt_tests,
            });
        }
        let is_vetted = verdicts.iter().all(|v| *v);
        debug!(
            connector = %test.connector_name,
            judge = %judge.name(),
            is_vetted,
            "evaluation verdict finalized"
        );
        Ok(ConnectorEvaluation {
            test: test.clone(),
            vetting_connector: judge.name().to_string(),
            is_vetted,
            timestamp: Utc::now(),
        })
    }

    /// Stage 4: folds this run's verdicts into the per-type per-connector
    /// performance records, checkpoints the suggested settings and notifies
    /// subscribers.
    async fn run_suggestion(
        &self,
        samples: &[ConnectorTest],
        evaluations: &[ConnectorEvaluation],
    ) -> Result<(), PipelineError> {
        use crate::settings::performance::VettingLevel;

        let record_snapshot = {
            let mut record = self.record.lock().await;
            record.suggestion_timestamp = Some(Utc::now());
            record.clone()
        };
        let policies = self.settings.policies();

        // The reference samples ground the sampling connector's own cost and
        // duration averages, so the comparator has both sides to rank.
        for sample in samples {
            if let Some(policy) = policies.iter().find(|p| matches_test(p, sample)) {
                policy.update_performance(&sample.connector_name, |performance| {
                    performance.record_measurement(sample.duration, sample.cost);
                });
            }
        }

        // Group verdicts by (prompt policy, connector); vetting levels are
        // written only here, after evaluation completed, so cancellation can
        // never leave a partial write behind.
        let mut groups: HashMap<(usize, String), Vec<&ConnectorEvaluation>> = HashMap::new();
        for evaluation in evaluations {
            let Some(policy_index) = policies
                .iter()
                .position(|p| matches_test(p, &evaluation.test))
            else {
                continue;
            };
            groups
                .entry((policy_index, evaluation.test.connector_name.clone()))
                .or_default()
                .push(evaluation);
        }

        for ((policy_index, connector_name), evaluations) in groups {
            let policy = &policies[policy_index];
            let all_vetted = evaluations.iter().all(|e| e.is_vetted);
            let distinct_prompts: HashSet<&str> = evaluations
                .iter()
                .map(|e| e.test.prompt.as_str())
                .collect();
            let level = if !all_vetted {
                VettingLevel::Invalid
            } else if distinct_prompts.len() > 1 {
                VettingLevel::OracleVaried
            } else {
                VettingLevel::Oracle
            };
            policy.update_performance(&connector_name, |performance| {
                performance.vetting_level = level;
                for evaluation in &evaluations {
                    performance.record_measurement(evaluation.test.duration, evaluation.test.cost);
                }
            });
            info!(
                prompt_type = %policy.type_name(),
                connector = %connector_name,
                vetting_level = ?level,
                "suggestion updated connector vetting"
            );
        }

        let suggested_settings = SettingsSnapshot::capture(&self.settings);
        if let Some(path) = &self.config.settings_file {
            suggested_settings
                .save_to(path)
                .await
                .map_err(|error| PipelineError::Persistence(error.to_string()))?;
        }
        let _ = self.events.send(AnalysisEvent::SuggestionCompleted {
            record: record_snapshot,
            suggested_settings,
        });
        Ok(())
    }

    /// Runs the full optimization cycle: disables further sampling, releases
    /// the manual trigger, and resolves when the suggestion completes (or
    /// fails with the crash fault).
    pub async fn optimize(
        &self,
    ) -> Result<(AnalysisRecord, SettingsSnapshot), PipelineFault> {
        self.settings.set_sampling_enabled(false);
        let mut events = self.subscribe();
        self.disable_manual_trigger();
        self.release_analysis();
        trace!("released analysis trigger; awaiting suggestion");

        loop {
            match events.recv().await {
                Ok(AnalysisEvent::SuggestionCompleted {
                    record,
                    suggested_settings,
                }) => return Ok((record, suggested_settings)),
                Ok(AnalysisEvent::Crashed { fault }) => return Err(fault),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Arc::new(PipelineError::Cancelled));
                }
            }
        }
    }

    /// Validates collected samples with the trusted connector and returns
    /// the evaluations. Producing no verdict is a hard failure for the run
    /// that requested validation.
    pub async fn validate(
        &self,
        samples: &[ConnectorTest],
    ) -> Result<Vec<ConnectorEvaluation>, PipelineError> {
        let primary = self
            .connectors
            .first()
            .ok_or(PipelineError::Cancelled)?;
        let mut evaluations = Vec::with_capacity(samples.len());
        for sample in samples {
            // A sample from the primary is its own reference; anything else
            // is judged against a fresh primary completion.
            let reference = if sample.connector_name == primary.name() {
                sample.clone()
            } else {
                let (result, duration) = primary
                    .complete(&sample.prompt, &sample.settings)
                    .await
                    .map_err(|source| PipelineError::Completion {
                        connector: primary.name().to_string(),
                        source,
                    })?;
                let cost = primary.cost_of(&sample.prompt, &result);
                ConnectorTest::new(
                    primary.name(),
                    sample.prompt.clone(),
                    sample.settings.clone(),
                    result,
                    duration,
                    cost,
                )
            };
            let evaluation = self.evaluate_test(sample, &reference, samples.len()).await?;
            evaluations.push(evaluation);
        }
        Ok(evaluations)
    }

    fn policy_of(&self, sample: &ConnectorTest) -> Option<Arc<PromptPolicy>> {
        self.settings
            .policies()
            .into_iter()
            .find(|policy| matches_test(policy, sample))
    }
}

/// Whether a recorded test's (prompt, settings) pair classifies into a
/// policy.
fn matches_test(policy: &PromptPolicy, test: &ConnectorTest) -> bool {
    CompletionJob::new(test.prompt.clone(), test.settings.clone())
        .map(|job| policy.matches(&job))
        .unwrap_or(false)
}

/// Extracts the first boolean verdict token from a judge's reply.
fn parse_verdict(reply: &str) -> Option<bool> {
    for token in reply.split(|c: char| !c.is_ascii_alphabetic()) {
        if token.eq_ignore_ascii_case("true") {
            return Some(true);
        }
        if token.eq_ignore_ascii_case("false") {
            return Some(false);
        }
    }
    None
}

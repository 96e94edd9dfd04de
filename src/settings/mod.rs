//! Dispatch settings: the long-lived aggregate owning prompt types,
//! selection policy and analysis configuration.
//!
//! One [`DispatchSettings`] instance exists per deployment/session and is
//! shared (via `Arc`) between the dispatcher and the analysis pipeline. The
//! prompt-type registry it owns is an explicit object, never a process-wide
//! singleton, so multiple independent deployments can coexist in one
//! process.

pub mod performance;
pub mod persistence;
pub mod prompt_type;
pub mod signature;
pub mod transform;

mod tests;

use crate::connector::NamedConnector;
use crate::error::DispatchError;
use crate::job::CompletionJob;
use crate::session::DispatchSession;
use crate::updater::SettingsUpdater;
use performance::{ConnectorComparator, weighted_comparator};
use prompt_type::{PromptPolicy, PromptType};
use signature::PromptSignature;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, trace};
use transform::PromptTransform;

/// Matcher resolving a job to a registered prompt policy.
pub type PromptMatcher =
    Arc<dyn Fn(&CompletionJob, &[Arc<PromptPolicy>]) -> Option<Arc<PromptPolicy>> + Send + Sync>;

/// First-match-wins matcher: the registry is scanned in insertion order and
/// the first matching signature is returned. No precedence or specificity
/// ranking is applied; callers needing disambiguation supply a regex.
pub fn first_match_prompt_matcher() -> PromptMatcher {
    Arc::new(|job, policies| policies.iter().find(|p| p.matches(job)).cloned())
}

/// Settings for the multi-connector completion process.
pub struct DispatchSettings {
    /// Registered prompt policies, append-only, in insertion order.
    policies: RwLock<Vec<Arc<PromptPolicy>>>,
    /// Serializes the check-then-insert race window of type creation.
    creation_lock: Mutex<()>,
    /// When true, no new prompt types are discovered; unmatched jobs are
    /// assigned the catch-all default type.
    pub freeze_prompt_types: bool,
    /// Length (in chars) to which prompts are truncated for signature
    /// extraction.
    pub prompt_truncation_length: usize,
    /// Opt-in narrowing of prompt starts when differing instances are
    /// witnessed. Off by default: templates legitimately invoked with highly
    /// variable leading content would narrow runaway.
    pub adjust_prompt_starts: bool,
    /// Whether dispatched jobs are considered for sampling. Toggled at
    /// runtime by the analysis pipeline.
    enable_prompt_sampling: AtomicBool,
    /// Number of distinct sample instances to collect per prompt type.
    pub max_instances: usize,
    /// When disabled, types whose known connectors are all vetted stop
    /// collecting samples.
    pub sample_vetted_connectors: bool,
    /// Coalescing delay before a burst of new samples is flushed as a batch.
    pub sample_collection_delay: Duration,
    /// Dynamic blocks injected into prompt templates via `{Name}` tokens.
    pub global_parameters: HashMap<String, String>,
    /// Optional transform applied to every input prompt.
    pub global_prompt_transform: Option<PromptTransform>,
    /// Comparator ranking vetted connectors.
    pub comparator: ConnectorComparator,
    /// Matcher resolving jobs to prompt policies.
    pub prompt_matcher: PromptMatcher,
    /// Optional shared ledger accruing compound cost across connectors.
    pub creditor: Option<Arc<crate::creditor::CostCreditor>>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            policies: RwLock::new(Vec::new()),
            creation_lock: Mutex::new(()),
            freeze_prompt_types: false,
            prompt_truncation_length: 20,
            adjust_prompt_starts: false,
            enable_prompt_sampling: AtomicBool::new(true),
            max_instances: 10,
            sample_vetted_connectors: true,
            sample_collection_delay: Duration::from_millis(20),
            global_parameters: HashMap::new(),
            global_prompt_transform: None,
            comparator: weighted_comparator(1.0, 1.0),
            prompt_matcher: first_match_prompt_matcher(),
            creditor: None,
        }
    }
}

impl std::fmt::Debug for DispatchSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchSettings")
            .field("prompt_types", &self.policies().len())
            .field("freeze_prompt_types", &self.freeze_prompt_types)
            .field("prompt_truncation_length", &self.prompt_truncation_length)
            .field("adjust_prompt_starts", &self.adjust_prompt_starts)
            .field("max_instances", &self.max_instances)
            .finish_non_exhaustive()
    }
}

impl DispatchSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sampling_enabled(&self) -> bool {
        self.enable_prompt_sampling.load(Ordering::SeqCst)
    }

    pub fn set_sampling_enabled(&self, enabled: bool) {
        self.enable_prompt_sampling.store(enabled, Ordering::SeqCst);
    }

    /// Snapshot of the registered policies, in insertion order.
    pub fn policies(&self) -> Vec<Arc<PromptPolicy>> {
        self.policies.read().expect("registry lock poisoned").clone()
    }

    /// Pre-registers a prompt policy, e.g. a regex-bearing signature for a
    /// family with variable leading content.
    pub fn register_policy(&self, policy: PromptPolicy) -> Arc<PromptPolicy> {
        let policy = Arc::new(policy);
        self.policies
            .write()
            .expect("registry lock poisoned")
            .push(Arc::clone(&policy));
        policy
    }

    /// Resolves (or creates) the prompt policy for a job.
    ///
    /// The common case of a known type is served by an optimistic match with
    /// no lock held; only an unmatched job takes the creation lock, re-checks
    /// and inserts. Returns the policy and whether it was newly created.
    pub fn policy_for(
        &self,
        job: &CompletionJob,
    ) -> Result<(Arc<PromptPolicy>, bool), DispatchError> {
        if let Some(policy) = self.match_policy(job) {
            if self.adjust_prompt_starts {
                policy.adjust_signature(job);
            }
            return Ok((policy, false));
        }

        if self.freeze_prompt_types {
            trace!("prompt types frozen; assigning catch-all default type");
            return Ok((Arc::new(PromptPolicy::new(PromptType::default_catch_all())), false));
        }

        let _guard = self.creation_lock.lock().expect("creation lock poisoned");
        // Another caller may have raced us to create the same type.
        if let Some(policy) = self.match_policy(job) {
            return Ok((policy, false));
        }

        let signature = {
            let policies = self.policies.read().expect("registry lock poisoned");
            let signatures: Vec<PromptSignature> = policies
                .iter()
                .map(|p| p.with_prompt_type(|t| t.signature.clone()))
                .collect();
            PromptSignature::extract_from_prompt(
                job,
                signatures.iter(),
                self.prompt_truncation_length,
            )?
        };
        debug!(prompt_start = %signature.prompt_start, "registering new prompt type");

        let mut prompt_type = PromptType::new(signature, self.adjust_prompt_starts);
        prompt_type.instances.push(job.prompt().to_string());
        let policy = Arc::new(PromptPolicy::new(prompt_type));
        self.policies
            .write()
            .expect("registry lock poisoned")
            .push(Arc::clone(&policy));
        Ok((policy, true))
    }

    fn match_policy(&self, job: &CompletionJob) -> Option<Arc<PromptPolicy>> {
        let policies = self.policies.read().expect("registry lock poisoned");
        (self.prompt_matcher)(job, &policies)
    }

    /// Builds the ready-to-execute session for a job: classify, select,
    /// then apply the prompt and request-setting transforms.
    pub fn build_session(
        &self,
        job: CompletionJob,
        connectors: &[Arc<NamedConnector>],
    ) -> Result<DispatchSession, DispatchError> {
        if connectors.is_empty() {
            return Err(DispatchError::NoConnectors);
        }
        let (policy, is_new_type) = self.policy_for(&job)?;
        trace!(prompt_type = %policy.type_name(), is_new_type, "classified job");

        let (connector, _performance) = policy
            .select_connector(&job, connectors, &self.comparator)
            .ok_or(DispatchError::NoConnectors)?;
        trace!(connector = %connector.name(), "selected connector");

        let prompt = self.transform_prompt(job.prompt(), &policy, &connector);
        let settings = self.transform_settings(&job, &prompt, &connector);

        Ok(DispatchSession {
            job,
            prompt,
            settings,
            connector,
            policy,
            is_new_type,
        })
    }

    fn transform_prompt(
        &self,
        prompt: &str,
        policy: &PromptPolicy,
        connector: &NamedConnector,
    ) -> String {
        let mut prompt = match &self.global_prompt_transform {
            Some(transform) => transform.apply(prompt, &self.global_parameters),
            None => prompt.to_string(),
        };
        if let Some(transform) = &policy.prompt_type_transform {
            prompt = transform.apply(&prompt, &self.global_parameters);
        }
        if policy.apply_model_transform
            && let Some(transform) = connector.prompt_transform()
        {
            prompt = transform.apply(&prompt, &self.global_parameters);
        }
        prompt
    }

    /// Adjusts the request settings to the selected connector; the original
    /// job settings are cloned at most once, and not at all when nothing
    /// changes.
    fn transform_settings(
        &self,
        job: &CompletionJob,
        final_prompt: &str,
        connector: &NamedConnector,
    ) -> crate::job::RequestSettings {
        let mut updater = SettingsUpdater::new(job.settings(), |s| s.clone());

        updater.modify_if_changed(
            |s| s.max_tokens(),
            |requested| connector.adjusted_max_tokens(final_prompt, *requested),
            |s, value| {
                if let Some(max_tokens) = value {
                    s.set_max_tokens(max_tokens);
                }
            },
        );

        if let Some(transform) = connector.temperature_transform() {
            updater.modify_if_changed(
                |s| s.temperature(),
                |temperature| temperature.map(|t| transform(t)),
                |s, value| {
                    if let Some(temperature) = value {
                        s.set_temperature(temperature);
                    }
                },
            );
        }

        updater
            .into_modified()
            .unwrap_or_else(|| job.settings().clone())
    }

    /// Resets the vetting level of all connectors for all prompt types and
    /// empties recorded instances, so test collection and vetting run again.
    pub fn reset_vetting(&self) {
        for policy in self.policies() {
            policy.reset_vetting();
        }
    }
}

//! Prompt types and their per-connector policy records.

use crate::connector::NamedConnector;
use crate::job::CompletionJob;
use crate::settings::performance::{
    ConnectorComparator, ConnectorPerformance, VettingLevel,
};
use crate::settings::signature::PromptSignature;
use crate::settings::transform::PromptTransform;
use dashmap::DashMap;
use std::sync::{Arc, RwLock};

/// One classification bucket of structurally similar requests.
///
/// Created lazily on the first unmatched job (unless discovery is frozen),
/// mutated as new instances arrive, never deleted.
#[derive(Debug, Clone)]
pub struct PromptType {
    pub signature: PromptSignature,
    pub name: String,
    /// Distinct prompt texts recorded for this type, in arrival order,
    /// bounded by the configured maximum. The first entry anchors signature
    /// adjustment.
    pub instances: Vec<String>,
    pub signature_needs_adjusting: bool,
}

impl PromptType {
    pub fn new(signature: PromptSignature, needs_adjusting: bool) -> Self {
        let name = signature.prompt_start.replace(' ', "_");
        Self {
            signature,
            name,
            instances: Vec::new(),
            signature_needs_adjusting: needs_adjusting,
        }
    }

    /// The catch-all type used when prompt-type discovery is frozen.
    pub fn default_catch_all() -> Self {
        let signature = PromptSignature::new(Default::default(), "");
        Self {
            signature,
            name: "default".to_string(),
            instances: Vec::new(),
            signature_needs_adjusting: false,
        }
    }
}

/// The settings record for one prompt type: the type itself plus the
/// per-connector performance bookkeeping and sampling state.
#[derive(Debug)]
pub struct PromptPolicy {
    prompt_type: RwLock<PromptType>,
    /// Connector name to recorded performance; records are created on first
    /// access, one per key even under concurrent first access.
    connectors: DashMap<String, ConnectorPerformance>,
    /// Prompts already queued for sampling this collection cycle.
    session_prompts: DashMap<String, ()>,
    pub apply_model_transform: bool,
    pub prompt_type_transform: Option<PromptTransform>,
}

impl PromptPolicy {
    pub fn new(prompt_type: PromptType) -> Self {
        Self {
            prompt_type: RwLock::new(prompt_type),
            connectors: DashMap::new(),
            session_prompts: DashMap::new(),
            apply_model_transform: true,
            prompt_type_transform: None,
        }
    }

    pub fn type_name(&self) -> String {
        self.prompt_type.read().expect("registry lock poisoned").name.clone()
    }

    /// Runs `f` against the current prompt type record.
    pub fn with_prompt_type<R>(&self, f: impl FnOnce(&PromptType) -> R) -> R {
        f(&self.prompt_type.read().expect("registry lock poisoned"))
    }

    /// Whether the job's prompt matches this policy's signature.
    pub fn matches(&self, job: &CompletionJob) -> bool {
        self.with_prompt_type(|t| t.signature.matches(job))
    }

    /// Records a distinct instance, bounded by `max_instances`.
    pub fn record_instance(&self, prompt: &str, max_instances: usize) {
        let mut prompt_type = self.prompt_type.write().expect("registry lock poisoned");
        if prompt_type.instances.len() < max_instances
            && !prompt_type.instances.iter().any(|i| i == prompt)
        {
            prompt_type.instances.push(prompt.to_string());
        }
    }

    /// Narrows the signature's prompt start to the longest common prefix of
    /// the first recorded instance and a newly witnessed distinct prompt.
    /// Only active when the type opted into adjustment.
    pub fn adjust_signature(&self, job: &CompletionJob) {
        let mut prompt_type = self.prompt_type.write().expect("registry lock poisoned");
        if !prompt_type.signature_needs_adjusting {
            return;
        }
        let Some(first) = prompt_type.instances.first().cloned() else {
            return;
        };
        if first == job.prompt() {
            return;
        }
        prompt_type.signature = PromptSignature::extract_from_two_instances(
            job.prompt(),
            &first,
            job.settings().clone(),
        );
        tracing::debug!(
            prompt_start = %prompt_type.signature.prompt_start,
            "narrowed prompt signature from second distinct instance"
        );
    }

    /// Current performance record for `connector_name`, created on first
    /// access.
    pub fn performance(&self, connector_name: &str) -> ConnectorPerformance {
        self.connectors
            .entry(connector_name.to_string())
            .or_default()
            .clone()
    }

    /// Applies `update` to the performance record of `connector_name` under
    /// the map shard lock.
    pub fn update_performance(
        &self,
        connector_name: &str,
        update: impl FnOnce(&mut ConnectorPerformance),
    ) {
        let mut entry = self.connectors.entry(connector_name.to_string()).or_default();
        update(entry.value_mut());
    }

    /// Iterates recorded (connector name, performance) pairs.
    pub fn performances(&self) -> Vec<(String, ConnectorPerformance)> {
        self.connectors
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub(crate) fn insert_performance(&self, connector_name: String, record: ConnectorPerformance) {
        self.connectors.insert(connector_name, record);
    }

    /// Selects the connector to serve a job for this prompt type.
    ///
    /// The designated primary (first) connector is always eligible regardless
    /// of vetting; every other connector requires a vetting level above
    /// `None`. With more than one candidate the comparator ranks them and the
    /// first wins.
    pub fn select_connector(
        &self,
        job: &CompletionJob,
        connectors: &[Arc<NamedConnector>],
        comparator: &ConnectorComparator,
    ) -> Option<(Arc<NamedConnector>, ConnectorPerformance)> {
        let primary = connectors.first()?;
        let mut candidates = vec![(Arc::clone(primary), self.performance(primary.name()))];
        for connector in &connectors[1..] {
            let performance = self.performance(connector.name());
            if performance.vetting_level.is_vetted() {
                candidates.push((Arc::clone(connector), performance));
            }
        }
        if candidates.len() > 1 {
            candidates.sort_by(|a, b| comparator(job, &a.1, &b.1));
        }
        candidates.into_iter().next()
    }

    /// The connectors still eligible to be probed with the same prompt for
    /// vetting, given a reference test from `reference_connector`.
    pub fn connectors_to_test(
        &self,
        reference_connector: &str,
        connectors: &[Arc<NamedConnector>],
        include_reference: bool,
    ) -> Vec<Arc<NamedConnector>> {
        connectors
            .iter()
            .filter(|connector| {
                (connector.name() != reference_connector || include_reference)
                    && self
                        .connectors
                        .get(connector.name())
                        .is_none_or(|record| record.vetting_level == VettingLevel::None)
            })
            .cloned()
            .collect()
    }

    /// Whether the job should be queued as a new sample this cycle.
    pub fn is_sample_needed(
        &self,
        job: &CompletionJob,
        is_new_type: bool,
        max_instances: usize,
        sample_vetted_connectors: bool,
        connectors: &[Arc<NamedConnector>],
    ) -> bool {
        let instance_wanted = is_new_type
            || self.with_prompt_type(|t| {
                t.instances.len() < max_instances && !t.instances.iter().any(|i| i == job.prompt())
            });
        if !instance_wanted || self.session_prompts.contains_key(job.prompt()) {
            return false;
        }
        sample_vetted_connectors
            || connectors.iter().any(|connector| {
                self.connectors
                    .get(connector.name())
                    .is_none_or(|record| record.vetting_level == VettingLevel::None)
            })
    }

    /// Marks a prompt as queued for the current collection cycle.
    pub fn mark_session_prompt(&self, prompt: &str) {
        self.session_prompts.insert(prompt.to_string(), ());
    }

    /// Clears recorded instances and zeroes all vetting levels so test
    /// collection and vetting run again.
    pub fn reset_vetting(&self) {
        self.prompt_type
            .write()
            .expect("registry lock poisoned")
            .instances
            .clear();
        for mut entry in self.connectors.iter_mut() {
            entry.value_mut().vetting_level = VettingLevel::None;
        }
        self.session_prompts.clear();
    }
}

//! Durable snapshots of dispatch settings.
//!
//! The snapshot captures everything the vetting loop has learned — prompt
//! types with their signatures and recorded instances, and the per-type
//! per-connector performance records — so it survives process restarts.
//! Absence of the file is not an error: the system falls back to the
//! current in-memory settings.

use crate::settings::DispatchSettings;
use crate::settings::performance::ConnectorPerformance;
use crate::settings::prompt_type::{PromptPolicy, PromptType};
use crate::settings::signature::PromptSignature;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs as async_fs;
use tracing::{debug, info};

/// Serializable state of one prompt type and its connector records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTypeSnapshot {
    pub signature: PromptSignature,
    pub name: String,
    pub instances: Vec<String>,
    pub signature_needs_adjusting: bool,
    pub connectors: BTreeMap<String, ConnectorPerformance>,
}

/// Serializable state of a whole [`DispatchSettings`] instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsSnapshot {
    pub prompt_types: Vec<PromptTypeSnapshot>,
}

impl SettingsSnapshot {
    /// Captures the current state of `settings`.
    pub fn capture(settings: &DispatchSettings) -> Self {
        let prompt_types = settings
            .policies()
            .iter()
            .map(|policy| {
                let (signature, name, instances, needs_adjusting) = policy.with_prompt_type(|t| {
                    (
                        t.signature.clone(),
                        t.name.clone(),
                        t.instances.clone(),
                        t.signature_needs_adjusting,
                    )
                });
                PromptTypeSnapshot {
                    signature,
                    name,
                    instances,
                    signature_needs_adjusting: needs_adjusting,
                    connectors: policy.performances().into_iter().collect(),
                }
            })
            .collect();
        Self { prompt_types }
    }

    /// Rebuilds the prompt-type registry of a fresh settings instance from
    /// this snapshot.
    pub fn restore_into(&self, settings: &DispatchSettings) {
        for snapshot in &self.prompt_types {
            let mut prompt_type = PromptType::new(
                snapshot.signature.clone(),
                snapshot.signature_needs_adjusting,
            );
            prompt_type.name = snapshot.name.clone();
            prompt_type.instances = snapshot.instances.clone();
            let policy = settings.register_policy(PromptPolicy::new(prompt_type));
            for (connector_name, record) in &snapshot.connectors {
                policy.insert_performance(connector_name.clone(), record.clone());
            }
        }
        debug!(
            prompt_types = self.prompt_types.len(),
            "restored settings snapshot"
        );
    }

    /// Writes the snapshot atomically (temp file + rename) as pretty JSON.
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            async_fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let json = serde_json::to_vec_pretty(self).context("Failed to serialize snapshot")?;
        let temp_path = path.with_extension("json.tmp");
        async_fs::write(&temp_path, &json)
            .await
            .with_context(|| format!("Failed to write snapshot: {}", temp_path.display()))?;
        async_fs::rename(&temp_path, path)
            .await
            .with_context(|| format!("Failed to move snapshot into place: {}", path.display()))?;
        info!(path = %path.display(), bytes = json.len(), "saved settings snapshot");
        Ok(())
    }

    /// Loads a snapshot if the file exists; a missing file yields `None`.
    pub async fn load_from(path: &Path) -> Result<Option<Self>> {
        match async_fs::read(path).await {
            Ok(bytes) => {
                let snapshot: SettingsSnapshot = serde_json::from_slice(&bytes)
                    .with_context(|| format!("Corrupt snapshot file: {}", path.display()))?;
                debug!(path = %path.display(), "loaded settings snapshot");
                Ok(Some(snapshot))
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error)
                .with_context(|| format!("Failed to read snapshot: {}", path.display())),
        }
    }
}

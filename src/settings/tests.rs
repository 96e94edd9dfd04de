#[cfg(test)]
mod tests {
    use crate::connector::{ArithmeticProvider, NamedConnector};
    use crate::job::{CompletionJob, RequestSettings};
    use crate::settings::DispatchSettings;
    use crate::settings::performance::{VettingLevel, weighted_comparator};
    use crate::settings::prompt_type::{PromptPolicy, PromptType};
    use crate::settings::signature::PromptSignature;
    use crate::settings::transform::PromptTransform;
    use std::sync::Arc;
    use std::time::Duration;

    fn job(prompt: &str) -> CompletionJob {
        CompletionJob::new(prompt, RequestSettings::new()).unwrap()
    }

    fn connector(name: &str) -> Arc<NamedConnector> {
        Arc::new(NamedConnector::new(
            name,
            Arc::new(ArithmeticProvider::exact()),
        ))
    }

    fn short_truncation_settings() -> DispatchSettings {
        let mut settings = DispatchSettings::default();
        settings.prompt_truncation_length = 10;
        settings
    }

    #[test]
    fn classification_is_idempotent() {
        let settings = short_truncation_settings();

        let (first, created) = settings.policy_for(&job("Compute Add(1, 1)")).unwrap();
        assert!(created);
        let (second, created) = settings.policy_for(&job("Compute Add(1, 1)")).unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(settings.policies().len(), 1);
    }

    #[test]
    fn distinct_prompt_shapes_get_distinct_types() {
        let settings = short_truncation_settings();

        settings.policy_for(&job("Compute Add(1, 1)")).unwrap();
        let (_, created) = settings
            .policy_for(&job("Summarize the following text: hello"))
            .unwrap();
        assert!(created);
        assert_eq!(settings.policies().len(), 2);
    }

    #[test]
    fn frozen_types_assign_the_catch_all_default() {
        let mut settings = DispatchSettings::default();
        settings.freeze_prompt_types = true;
        let settings = settings;

        let (policy, created) = settings.policy_for(&job("Never seen before")).unwrap();
        assert!(!created);
        assert_eq!(policy.type_name(), "default");
        // The catch-all is never added to the registry.
        assert!(settings.policies().is_empty());
        // And it matches everything, including the empty-settings job.
        assert!(policy.matches(&job("Anything else at all")));
    }

    #[test]
    fn second_distinct_instance_narrows_the_signature() {
        let mut settings = short_truncation_settings();
        settings.adjust_prompt_starts = true;
        let settings = settings;

        let (policy, _) = settings.policy_for(&job("Compute Add(1, 1)")).unwrap();
        assert!(policy.with_prompt_type(|t| t.signature_needs_adjusting));
        assert_eq!(
            policy.with_prompt_type(|t| t.signature.prompt_start.clone()),
            "Compute Ad"
        );

        let (narrowed, created) = settings.policy_for(&job("Compute Add(2, 3)")).unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&policy, &narrowed));
        assert_eq!(
            narrowed.with_prompt_type(|t| t.signature.prompt_start.clone()),
            "Compute Add("
        );
        // The narrowed signature now also captures further family members.
        assert!(narrowed.matches(&job("Compute Add(40, 2)")));
    }

    #[test]
    fn concurrent_classification_registers_one_type() {
        let settings = Arc::new(short_truncation_settings());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let settings = Arc::clone(&settings);
                std::thread::spawn(move || settings.policy_for(&job("Compute Add(1, 1)")).unwrap())
            })
            .collect();
        let policies: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(settings.policies().len(), 1);
        assert_eq!(policies.iter().filter(|(_, created)| *created).count(), 1);
        for (policy, _) in &policies {
            assert!(Arc::ptr_eq(policy, &policies[0].0));
        }
    }

    #[test]
    fn unvetted_connectors_are_never_selected() {
        let policy = PromptPolicy::new(PromptType::new(
            PromptSignature::new(RequestSettings::new(), "Compute "),
            false,
        ));
        let connectors = vec![connector("primary"), connector("cheap")];
        let comparator = weighted_comparator(1.0, 1.0);

        let (selected, _) = policy
            .select_connector(&job("Compute Add(1, 1)"), &connectors, &comparator)
            .unwrap();
        assert_eq!(selected.name(), "primary");
    }

    #[test]
    fn vetted_cheaper_connector_wins_selection() {
        let policy = PromptPolicy::new(PromptType::new(
            PromptSignature::new(RequestSettings::new(), "Compute "),
            false,
        ));
        let connectors = vec![connector("primary"), connector("cheap")];

        policy.update_performance("primary", |p| {
            p.vetting_level = VettingLevel::Oracle;
            p.record_measurement(Duration::from_millis(100), 0.02);
        });
        policy.update_performance("cheap", |p| {
            p.vetting_level = VettingLevel::Oracle;
            p.record_measurement(Duration::from_millis(100), 0.001);
        });

        let comparator = weighted_comparator(1.0, 1.0);
        let (selected, _) = policy
            .select_connector(&job("Compute Add(1, 1)"), &connectors, &comparator)
            .unwrap();
        assert_eq!(selected.name(), "cheap");
    }

    #[test]
    fn transforms_compose_global_then_type_then_connector() {
        let mut settings = DispatchSettings::default();
        settings.global_prompt_transform =
            Some(PromptTransform::new("[global]{prompt}"));
        settings
            .global_parameters
            .insert("Tone".to_string(), "terse".to_string());
        let settings = settings;

        let mut policy = PromptPolicy::new(PromptType::new(
            PromptSignature::new(RequestSettings::new(), "Compute "),
            false,
        ));
        policy.prompt_type_transform = Some(PromptTransform::new("Be {Tone}. {prompt}"));
        settings.register_policy(policy);

        let connectors = vec![Arc::new(
            NamedConnector::new("primary", Arc::new(ArithmeticProvider::exact()))
                .with_prompt_transform(PromptTransform::new("{prompt} END")),
        )];
        let session = settings
            .build_session(job("Compute Add(1, 1)"), &connectors)
            .unwrap();

        assert_eq!(session.prompt, "Be terse. [global]Compute Add(1, 1) END");
        // The original job is preserved untouched.
        assert_eq!(session.job.prompt(), "Compute Add(1, 1)");
    }

    #[test]
    fn session_settings_are_capped_and_temperature_mapped() {
        let settings = short_truncation_settings();
        let connectors = vec![Arc::new(
            NamedConnector::new("primary", Arc::new(ArithmeticProvider::exact()))
                .with_max_tokens(1000)
                .with_temperature_transform(Arc::new(|t| t / 2.0)),
        )];

        let mut request = RequestSettings::new();
        request.set_max_tokens(5000);
        request.set_temperature(1.0);
        let job = CompletionJob::new("Compute Add(1, 1)", request).unwrap();

        let session = settings.build_session(job, &connectors).unwrap();
        assert_eq!(session.settings.max_tokens(), Some(800));
        assert_eq!(session.settings.temperature(), Some(0.5));
    }

    #[test]
    fn reset_vetting_clears_levels_and_instances() {
        let settings = short_truncation_settings();
        let (policy, _) = settings.policy_for(&job("Compute Add(1, 1)")).unwrap();
        policy.update_performance("cheap", |p| {
            p.vetting_level = VettingLevel::OracleVaried;
            p.record_measurement(Duration::from_millis(10), 0.001);
        });

        settings.reset_vetting();

        assert!(policy.with_prompt_type(|t| t.instances.is_empty()));
        let record = policy.performance("cheap");
        assert_eq!(record.vetting_level, VettingLevel::None);
        // Measurement history survives; only the verdicts are withdrawn.
        assert_eq!(record.sample_count, 1);
    }
}

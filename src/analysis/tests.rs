#[cfg(test)]
mod tests {
    use crate::analysis::pipeline::{AnalysisConfig, AnalysisCoordinator};
    use crate::analysis::types::{AnalysisEvent, ConnectorTest};
    use crate::connector::{ArithmeticEngine, ArithmeticProvider, CompletionProvider, NamedConnector};
    use crate::error::{CompletionError, PipelineError};
    use crate::job::{CompletionJob, RequestSettings};
    use crate::settings::DispatchSettings;
    use crate::settings::performance::VettingLevel;
    use crate::settings::prompt_type::{PromptPolicy, PromptType};
    use crate::settings::signature::PromptSignature;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tokio::time::timeout;

    /// A judge that never produces a parseable verdict.
    struct VagueProvider;

    #[async_trait]
    impl CompletionProvider for VagueProvider {
        async fn complete(
            &self,
            _prompt: &str,
            _settings: &RequestSettings,
        ) -> Result<String, CompletionError> {
            Ok("no idea".to_string())
        }
    }

    fn settings_with_compute_policy() -> Arc<DispatchSettings> {
        let settings = Arc::new(DispatchSettings::default());
        settings.register_policy(PromptPolicy::new(PromptType::new(
            PromptSignature::new(RequestSettings::new(), "Compute "),
            false,
        )));
        settings
    }

    fn sample_from(connector_name: &str, prompt: &str, result: &str) -> ConnectorTest {
        ConnectorTest::new(
            connector_name,
            prompt,
            RequestSettings::new(),
            result,
            Duration::from_millis(5),
            0.01,
        )
    }

    fn job(prompt: &str) -> CompletionJob {
        CompletionJob::new(prompt, RequestSettings::new()).unwrap()
    }

    async fn next_matching<F>(
        events: &mut broadcast::Receiver<AnalysisEvent>,
        mut matcher: F,
    ) -> AnalysisEvent
    where
        F: FnMut(&AnalysisEvent) -> bool,
    {
        loop {
            let event = timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for analysis event")
                .expect("event channel closed");
            if matcher(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn duplicate_buffered_jobs_collapse_to_one_sample() {
        let settings = settings_with_compute_policy();
        let config = AnalysisConfig {
            enable_test: false,
            ..AnalysisConfig::default()
        };
        let coordinator = AnalysisCoordinator::new(
            config,
            Arc::clone(&settings),
            vec![Arc::new(NamedConnector::new(
                "primary",
                Arc::new(ArithmeticProvider::exact()),
            ))],
        );
        let mut events = coordinator.subscribe();

        let sample = sample_from("primary", "Compute Add(1, 1)", "2");
        coordinator.enqueue_sample(sample.clone(), job("Compute Add(1, 1)"));
        coordinator.enqueue_sample(sample, job("Compute Add(1, 1)"));

        let event = next_matching(&mut events, |e| {
            matches!(e, AnalysisEvent::SamplesReceived { .. })
        })
        .await;
        let AnalysisEvent::SamplesReceived { new_samples } = event else {
            unreachable!()
        };
        assert_eq!(new_samples.len(), 1);
        assert_eq!(coordinator.record().await.samples.len(), 1);
    }

    #[tokio::test]
    async fn correct_candidate_earns_oracle_vetting() {
        let settings = settings_with_compute_policy();
        let connectors = vec![
            Arc::new(NamedConnector::new(
                "primary",
                Arc::new(ArithmeticProvider::exact()),
            )),
            Arc::new(NamedConnector::new(
                "cheap",
                Arc::new(ArithmeticProvider::exact()),
            )),
        ];
        let coordinator = AnalysisCoordinator::new(
            AnalysisConfig::default(),
            Arc::clone(&settings),
            connectors,
        );
        let mut events = coordinator.subscribe();

        coordinator.enqueue_sample(
            sample_from("primary", "Compute Add(1, 1)", "2"),
            job("Compute Add(1, 1)"),
        );

        let event = next_matching(&mut events, |e| {
            matches!(e, AnalysisEvent::SuggestionCompleted { .. })
        })
        .await;
        let AnalysisEvent::SuggestionCompleted { record, .. } = event else {
            unreachable!()
        };
        assert_eq!(record.evaluations.len(), 1);
        assert!(record.evaluations[0].is_vetted);
        assert_eq!(record.evaluations[0].vetting_connector, "primary");

        let policy = &settings.policies()[0];
        let performance = policy.performance("cheap");
        assert_eq!(performance.vetting_level, VettingLevel::Oracle);
        assert!(performance.vetting_level.is_vetted());
        assert!(performance.sample_count > 0);
    }

    #[tokio::test]
    async fn wrong_candidate_is_marked_invalid() {
        let settings = settings_with_compute_policy();
        // The cheap connector computes everything off by one.
        let skewed = ArithmeticEngine::with_compute(Arc::new(|op, a, b| {
            ArithmeticEngine::compute(op, a, b) + 1
        }));
        let connectors = vec![
            Arc::new(NamedConnector::new(
                "primary",
                Arc::new(ArithmeticProvider::exact()),
            )),
            Arc::new(NamedConnector::new(
                "cheap",
                Arc::new(ArithmeticProvider::with_engine(skewed)),
            )),
        ];
        let coordinator = AnalysisCoordinator::new(
            AnalysisConfig::default(),
            Arc::clone(&settings),
            connectors,
        );
        let mut events = coordinator.subscribe();

        coordinator.enqueue_sample(
            sample_from("primary", "Compute Add(1, 1)", "2"),
            job("Compute Add(1, 1)"),
        );

        next_matching(&mut events, |e| {
            matches!(e, AnalysisEvent::SuggestionCompleted { .. })
        })
        .await;

        let policy = &settings.policies()[0];
        let performance = policy.performance("cheap");
        assert_eq!(performance.vetting_level, VettingLevel::Invalid);
        assert!(!performance.vetting_level.is_vetted());
    }

    #[tokio::test]
    async fn unjudgeable_output_crashes_the_run_not_the_caller() {
        let settings = settings_with_compute_policy();
        let connectors = vec![
            Arc::new(NamedConnector::new("primary", Arc::new(VagueProvider))),
            Arc::new(NamedConnector::new(
                "cheap",
                Arc::new(ArithmeticProvider::exact()),
            )),
        ];
        let coordinator = AnalysisCoordinator::new(
            AnalysisConfig::default(),
            Arc::clone(&settings),
            connectors,
        );
        let mut events = coordinator.subscribe();

        coordinator.enqueue_sample(
            sample_from("primary", "Compute Add(1, 1)", "no idea"),
            job("Compute Add(1, 1)"),
        );

        let event =
            next_matching(&mut events, |e| matches!(e, AnalysisEvent::Crashed { .. })).await;
        let AnalysisEvent::Crashed { fault } = event else {
            unreachable!()
        };
        assert!(matches!(
            fault.as_ref(),
            PipelineError::NoVerdict { connector, .. } if connector.as_str() == "cheap"
        ));
        // No vetting level was written for the crashed run.
        let policy = &settings.policies()[0];
        assert_eq!(
            policy.performance("cheap").vetting_level,
            VettingLevel::None
        );
    }

    #[tokio::test]
    async fn manual_trigger_holds_analysis_until_released() {
        let settings = settings_with_compute_policy();
        let config = AnalysisConfig {
            await_manual_trigger: true,
            ..AnalysisConfig::default()
        };
        let connectors = vec![
            Arc::new(NamedConnector::new(
                "primary",
                Arc::new(ArithmeticProvider::exact()),
            )),
            Arc::new(NamedConnector::new(
                "cheap",
                Arc::new(ArithmeticProvider::exact()),
            )),
        ];
        let coordinator =
            AnalysisCoordinator::new(config, Arc::clone(&settings), connectors);
        let mut events = coordinator.subscribe();

        coordinator.enqueue_sample(
            sample_from("primary", "Compute Add(1, 1)", "2"),
            job("Compute Add(1, 1)"),
        );
        next_matching(&mut events, |e| {
            matches!(e, AnalysisEvent::SamplesReceived { .. })
        })
        .await;

        // Nothing past sampling happens while the gate is closed.
        let held = timeout(Duration::from_millis(150), events.recv()).await;
        assert!(held.is_err(), "analysis ran without the manual trigger");

        coordinator.release_analysis();
        next_matching(&mut events, |e| {
            matches!(e, AnalysisEvent::SuggestionCompleted { .. })
        })
        .await;
    }

    #[tokio::test]
    async fn validate_judges_foreign_samples_against_the_primary() {
        let settings = settings_with_compute_policy();
        let connectors = vec![
            Arc::new(NamedConnector::new(
                "primary",
                Arc::new(ArithmeticProvider::exact()),
            )),
            Arc::new(NamedConnector::new(
                "cheap",
                Arc::new(ArithmeticProvider::exact()),
            )),
        ];
        let coordinator = AnalysisCoordinator::new(
            AnalysisConfig {
                enable_test: false,
                ..AnalysisConfig::default()
            },
            Arc::clone(&settings),
            connectors,
        );

        let good = sample_from("cheap", "Compute Add(20, 22)", "42");
        let bad = sample_from("cheap", "Compute Add(20, 22)", "41");
        let evaluations = coordinator.validate(&[good, bad]).await.unwrap();

        assert_eq!(evaluations.len(), 2);
        assert!(evaluations[0].is_vetted);
        assert!(!evaluations[1].is_vetted);
        assert!(evaluations.iter().all(|e| e.vetting_connector == "primary"));
    }
}

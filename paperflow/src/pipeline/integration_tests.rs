//! End-to-end tests for document runs: retry chains, idempotent skips,
//! mutual exclusion, and both completion policies.

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::cancellation::CancelToken;
    use crate::core::{DocumentStatus, ErrorStatus, RetryPolicy, StageStatus};
    use crate::errors::StageFault;
    use crate::pipeline::context::{DocumentContext, StageContext};
    use crate::pipeline::orchestrator::{
        CompletionPolicy, PipelineConfig, PipelineOrchestrator, PipelineServices, StageDisposition,
    };
    use crate::pipeline::processor::{StageDefinition, StageProcessor};
    use crate::resilience::{RetryOrchestrator, RetryOutcome, RetryTerminal};
    use crate::store::InMemoryPolicyStore;
    use crate::testing::mocks::{CountingProcessor, FailingProcessor, FlakyProcessor};
    use crate::utils::correlation::{request_prefix, retry_index};

    /// Services with a `default:*` policy tuned for tests.
    fn services_with_policy(max_retries: u32, base_delay_ms: u64) -> PipelineServices {
        let policy_store = Arc::new(InMemoryPolicyStore::empty());
        policy_store.put(
            RetryPolicy::new("default", max_retries, base_delay_ms)
                .with_max_delay_ms(base_delay_ms * 4)
                .with_jitter(false),
        );
        let mut services = PipelineServices::in_memory();
        services.policies = Arc::new(crate::resilience::RetryPolicyManager::new(policy_store));
        services
    }

    /// Services whose retry chains settle in milliseconds.
    fn fast_services(max_retries: u32) -> PipelineServices {
        services_with_policy(max_retries, 1)
    }

    fn pipeline(
        stages: Vec<StageDefinition>,
        services: &PipelineServices,
        policy: CompletionPolicy,
    ) -> PipelineOrchestrator {
        PipelineOrchestrator::new(
            stages,
            services.clone(),
            PipelineConfig {
                completion_policy: policy,
                stage_timeout: Duration::from_secs(5),
            },
        )
    }

    fn document(id: &str) -> Arc<DocumentContext> {
        Arc::new(DocumentContext::new(id, "cafe01", 4_096))
    }

    #[tokio::test]
    async fn test_transient_fault_recovers_within_budget() {
        // A transient condition that clears before the last allowed attempt:
        // initial attempt and first retry fail, the second retry succeeds.
        let services = fast_services(2);
        let processor = Arc::new(FlakyProcessor::new(2, || {
            StageFault::http(503, "inference backend unavailable")
        }));
        let orchestrator = pipeline(
            vec![StageDefinition::new("embedding", processor.clone())],
            &services,
            CompletionPolicy::Strict,
        );

        let document = document("doc-a");
        let mut outcome = orchestrator
            .run_document(document.clone(), &CancelToken::new())
            .await;

        // The second retry runs detached; the run returns with it in flight.
        assert!(matches!(
            outcome.stages[0].disposition,
            StageDisposition::Retrying { .. }
        ));
        let settled = outcome.wait_for_retries().await;
        assert_eq!(settled, vec![("embedding".to_string(), RetryTerminal::Completed)]);
        assert_eq!(processor.calls(), 3);

        let execution = services
            .state
            .status("doc-a", "embedding")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(execution.status, StageStatus::Completed);
        assert_eq!(execution.retry_count, 2);

        // One error row per failed attempt, correlation suffixes in order,
        // all sharing the run's request prefix.
        let history = services.errors.history("doc-a").await.unwrap();
        assert_eq!(history.len(), 2);
        let indices: Vec<u32> = history
            .iter()
            .filter_map(|r| retry_index(&r.correlation_id))
            .collect();
        assert_eq!(indices, vec![0, 1]);
        for record in &history {
            assert_eq!(
                request_prefix(&record.correlation_id),
                Some(document.request_id.as_str())
            );
        }
        assert_eq!(history[1].status, ErrorStatus::Resolved);

        // The completion marker now covers the stage.
        let marker = services
            .idempotency
            .check("doc-a", "embedding")
            .await
            .unwrap();
        assert!(marker.is_some());
    }

    #[tokio::test]
    async fn test_default_sequence_completes_in_order() {
        use crate::pipeline::processor::DEFAULT_STAGE_SEQUENCE;

        let services = fast_services(2);
        let stages: Vec<StageDefinition> = DEFAULT_STAGE_SEQUENCE
            .iter()
            .map(|name| {
                StageDefinition::new(
                    *name,
                    Arc::new(CountingProcessor::with_artifact(
                        serde_json::json!({"stage": name}),
                    )),
                )
            })
            .collect();
        let orchestrator = pipeline(stages, &services, CompletionPolicy::Strict);

        let document = document("doc-seq");
        let outcome = orchestrator
            .run_document(document.clone(), &CancelToken::new())
            .await;

        assert_eq!(outcome.status, DocumentStatus::Completed);
        let names: Vec<&str> = outcome
            .stages
            .iter()
            .map(|r| r.stage_name.as_str())
            .collect();
        assert_eq!(names, DEFAULT_STAGE_SEQUENCE.to_vec());
        for name in DEFAULT_STAGE_SEQUENCE {
            assert!(document.artifact(name).is_some());
        }
    }

    #[tokio::test]
    async fn test_permanent_fault_is_never_retried() {
        let services = fast_services(3);
        let processor = Arc::new(FailingProcessor::new(|| {
            StageFault::validation("page tree is malformed")
        }));
        let orchestrator = pipeline(
            vec![StageDefinition::new("text_extraction", processor.clone())],
            &services,
            CompletionPolicy::Strict,
        );

        let outcome = orchestrator
            .run_document(document("doc-b"), &CancelToken::new())
            .await;

        assert_eq!(outcome.status, DocumentStatus::Failed);
        assert!(matches!(
            outcome.stages[0].disposition,
            StageDisposition::Failed { error_id: Some(_) }
        ));
        assert!(outcome.pending_retries.is_empty());
        assert_eq!(processor.calls(), 1);

        let history = services.errors.history("doc-b").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(retry_index(&history[0].correlation_id), Some(0));
        assert_eq!(history[0].status, ErrorStatus::Failed);

        let execution = services
            .state
            .status("doc-b", "text_extraction")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(execution.status, StageStatus::Failed);
        assert_eq!(execution.retry_count, 0);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails_with_notes() {
        let services = fast_services(2);
        let processor = Arc::new(FailingProcessor::new(|| {
            StageFault::timeout("object store fetch timed out")
        }));
        let orchestrator = pipeline(
            vec![StageDefinition::new("image_extraction", processor.clone())],
            &services,
            CompletionPolicy::Strict,
        );

        let mut outcome = orchestrator
            .run_document(document("doc-c"), &CancelToken::new())
            .await;
        let settled = outcome.wait_for_retries().await;
        assert_eq!(
            settled,
            vec![("image_extraction".to_string(), RetryTerminal::Exhausted)]
        );

        // Initial attempt plus the full retry budget.
        assert_eq!(processor.calls(), 3);

        let execution = services
            .state
            .status("doc-c", "image_extraction")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(execution.status, StageStatus::Failed);
        assert_eq!(execution.retry_count, execution.max_retries);

        let history = services.errors.history("doc-c").await.unwrap();
        assert_eq!(history.len(), 3);
        let last = history.last().unwrap();
        assert_eq!(last.status, ErrorStatus::Failed);
        assert_eq!(last.resolution_notes.as_deref(), Some("retry limit exceeded"));
    }

    #[tokio::test]
    async fn test_five_stages_under_strict_policy() {
        let services = fast_services(2);
        let s1 = Arc::new(CountingProcessor::new());
        let s2 = Arc::new(CountingProcessor::new());
        let s3 = Arc::new(FailingProcessor::new(|| {
            StageFault::validation("unreadable part numbers")
        }));
        let s4 = Arc::new(FailingProcessor::new(|| {
            StageFault::validation("missing classification")
        }));
        let s5 = Arc::new(CountingProcessor::new());
        let stages = vec![
            StageDefinition::new("text_extraction", s1.clone()),
            StageDefinition::new("image_extraction", s2.clone()),
            StageDefinition::new("code_extraction", s3.clone()),
            StageDefinition::new("embedding", s4.clone()),
            StageDefinition::new("search_index", s5.clone()),
        ];
        let orchestrator = pipeline(stages, &services, CompletionPolicy::Strict);

        let outcome = orchestrator
            .run_document(document("doc-d"), &CancelToken::new())
            .await;

        assert_eq!(outcome.status, DocumentStatus::Failed);
        assert_eq!(outcome.stages[0].disposition, StageDisposition::Completed);
        assert_eq!(outcome.stages[1].disposition, StageDisposition::Completed);
        assert!(matches!(
            outcome.stages[2].disposition,
            StageDisposition::Failed { .. }
        ));
        // The failure halts the sequence: later stages never run.
        assert_eq!(outcome.stages[3].disposition, StageDisposition::NotAttempted);
        assert_eq!(outcome.stages[4].disposition, StageDisposition::NotAttempted);
        assert_eq!(s4.calls(), 0);
        assert_eq!(s5.calls(), 0);
    }

    #[tokio::test]
    async fn test_five_stages_under_best_effort_policy() {
        let services = fast_services(2);
        let s3 = Arc::new(FailingProcessor::new(|| {
            StageFault::validation("unreadable part numbers")
        }));
        let s4 = Arc::new(FailingProcessor::new(|| {
            StageFault::validation("missing classification")
        }));
        let s5 = Arc::new(CountingProcessor::new());
        let stages = vec![
            StageDefinition::new("text_extraction", Arc::new(CountingProcessor::new())),
            StageDefinition::new("image_extraction", Arc::new(CountingProcessor::new())),
            StageDefinition::new("code_extraction", s3),
            StageDefinition::new("embedding", s4),
            StageDefinition::new("search_index", s5.clone()),
        ];
        let orchestrator = pipeline(stages, &services, CompletionPolicy::BestEffort);

        let outcome = orchestrator
            .run_document(document("doc-e"), &CancelToken::new())
            .await;

        // Best-effort: the document completes, with the failures recorded
        // for later reprocessing.
        assert_eq!(outcome.status, DocumentStatus::Completed);
        assert_eq!(s5.calls(), 1);

        let failures: Vec<&str> = outcome
            .stages
            .iter()
            .filter(|r| matches!(r.disposition, StageDisposition::Failed { .. }))
            .map(|r| r.stage_name.as_str())
            .collect();
        assert_eq!(failures, vec!["code_extraction", "embedding"]);

        let history = services.errors.history("doc-e").await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_rerun_skips_marked_stages() {
        let services = fast_services(2);
        // code_extraction fails permanently once, then works.
        let s4 = Arc::new(FlakyProcessor::new(1, || {
            StageFault::validation("ocr text incomplete")
        }));
        let s1 = Arc::new(CountingProcessor::new());
        let s2 = Arc::new(CountingProcessor::new());
        let s3 = Arc::new(CountingProcessor::new());
        let s5 = Arc::new(CountingProcessor::new());
        let stages = vec![
            StageDefinition::new("text_extraction", s1.clone()),
            StageDefinition::new("image_extraction", s2.clone()),
            StageDefinition::new("classification", s3.clone()),
            StageDefinition::new("code_extraction", s4.clone()),
            StageDefinition::new("search_index", s5.clone()),
        ];
        let orchestrator = pipeline(stages, &services, CompletionPolicy::Strict);

        let first = orchestrator
            .run_document(document("doc-f"), &CancelToken::new())
            .await;
        assert_eq!(first.status, DocumentStatus::Failed);
        assert_eq!(s5.calls(), 0);

        // Re-run: the first three stages have valid markers and are
        // skipped; only the remaining stages execute.
        let second = orchestrator
            .run_document(document("doc-f"), &CancelToken::new())
            .await;
        assert_eq!(second.status, DocumentStatus::Completed);
        assert_eq!(second.stages[0].disposition, StageDisposition::Skipped);
        assert_eq!(second.stages[1].disposition, StageDisposition::Skipped);
        assert_eq!(second.stages[2].disposition, StageDisposition::Skipped);
        assert_eq!(second.stages[3].disposition, StageDisposition::Completed);
        assert_eq!(second.stages[4].disposition, StageDisposition::Completed);

        assert_eq!(s1.calls(), 1);
        assert_eq!(s2.calls(), 1);
        assert_eq!(s3.calls(), 1);
        assert_eq!(s4.calls(), 2);
        assert_eq!(s5.calls(), 1);
    }

    #[tokio::test]
    async fn test_matching_marker_short_circuits_processor() {
        let services = fast_services(2);
        let processor = Arc::new(CountingProcessor::with_artifact(
            serde_json::json!({"pages": 12}),
        ));
        let orchestrator = pipeline(
            vec![StageDefinition::new("text_extraction", processor.clone())],
            &services,
            CompletionPolicy::Strict,
        );

        for _ in 0..3 {
            let outcome = orchestrator
                .run_document(document("doc-g"), &CancelToken::new())
                .await;
            assert_eq!(outcome.status, DocumentStatus::Completed);
        }

        // Re-runs hit the marker; the processor ran exactly once.
        assert_eq!(processor.calls(), 1);
    }

    #[tokio::test]
    async fn test_mock_processor_not_reinvoked_with_valid_marker() {
        mockall::mock! {
            Processor {}

            #[async_trait]
            impl StageProcessor for Processor {
                fn service_name(&self) -> String;
                async fn process(
                    &self,
                    ctx: &StageContext,
                ) -> Result<serde_json::Value, StageFault>;
            }
        }

        let mut mock = MockProcessor::new();
        mock.expect_service_name()
            .return_const("default".to_string());
        mock.expect_process()
            .times(1)
            .returning(|_| Ok(serde_json::json!({"chunks": 42})));

        let services = fast_services(2);
        let orchestrator = pipeline(
            vec![StageDefinition::new("embedding", Arc::new(mock))],
            &services,
            CompletionPolicy::Strict,
        );

        let first = orchestrator
            .run_document(document("doc-h"), &CancelToken::new())
            .await;
        assert_eq!(first.stages[0].disposition, StageDisposition::Completed);

        let second = orchestrator
            .run_document(document("doc-h"), &CancelToken::new())
            .await;
        // The expectation would fail the test on a second invocation.
        assert_eq!(second.stages[0].disposition, StageDisposition::Skipped);
    }

    #[tokio::test]
    async fn test_changed_inputs_invalidate_marker() {
        let services = fast_services(2);
        let processor = Arc::new(CountingProcessor::new());
        let orchestrator = pipeline(
            vec![StageDefinition::new("text_extraction", processor.clone())],
            &services,
            CompletionPolicy::Strict,
        );

        let outcome = orchestrator
            .run_document(document("doc-i"), &CancelToken::new())
            .await;
        assert_eq!(outcome.status, DocumentStatus::Completed);

        // The source file was replaced: same document, different content.
        let changed = Arc::new(DocumentContext::new("doc-i", "beef02", 8_192));
        let outcome = orchestrator
            .run_document(changed, &CancelToken::new())
            .await;
        assert_eq!(outcome.stages[0].disposition, StageDisposition::Completed);
        assert_eq!(processor.calls(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_retries_one_proceeds() {
        // A generous backoff keeps the winner's inline retry holding the
        // lock while the loser arrives.
        let services = services_with_policy(3, 200);
        let retry = Arc::new(RetryOrchestrator::new(
            services.policies.clone(),
            services.locks.clone(),
            services.idempotency.clone(),
            services.errors.clone(),
            services.state.clone(),
        ));
        let document = document("doc-j");
        let stage = StageDefinition::new("embedding", Arc::new(CountingProcessor::new()));

        let execution = services
            .state
            .start("doc-j", "embedding", 3)
            .await
            .unwrap();
        let fault = || StageFault::http(503, "inference backend unavailable");

        let mut tasks = Vec::new();
        for _ in 0..2 {
            let retry = retry.clone();
            let document = document.clone();
            let stage = stage.clone();
            let execution = execution.clone();
            tasks.push(tokio::spawn(async move {
                retry
                    .handle_failure(document, &stage, &execution, fault(), CancelToken::new())
                    .await
            }));
        }

        let mut in_progress = 0;
        let mut recovered = 0;
        for task in tasks {
            match task.await.unwrap() {
                RetryOutcome::AlreadyInProgress => in_progress += 1,
                RetryOutcome::Recovered { .. } => recovered += 1,
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(in_progress, 1);
        assert_eq!(recovered, 1);
    }

    #[tokio::test]
    async fn test_held_lock_reports_retry_in_progress() {
        let services = fast_services(3);
        let retry = RetryOrchestrator::new(
            services.policies.clone(),
            services.locks.clone(),
            services.idempotency.clone(),
            services.errors.clone(),
            services.state.clone(),
        );
        let document = document("doc-k");

        let execution = services
            .state
            .start("doc-k", "embedding", 3)
            .await
            .unwrap();

        let guard = services.locks.try_acquire("doc-k", "embedding").unwrap();
        let outcome = retry
            .handle_failure(
                document,
                &StageDefinition::new("embedding", Arc::new(CountingProcessor::new())),
                &execution,
                StageFault::timeout("slow inference"),
                CancelToken::new(),
            )
            .await;
        drop(guard);

        assert!(matches!(outcome, RetryOutcome::AlreadyInProgress));
        // The contended caller must not consume retry budget.
        let record = services
            .state
            .status("doc-k", "embedding")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.retry_count, 0);
    }

    #[tokio::test]
    async fn test_targeted_rerun_of_failed_stage() {
        let services = fast_services(2);
        let flaky = Arc::new(FlakyProcessor::new(1, || {
            StageFault::validation("llm returned malformed json")
        }));
        let upstream = Arc::new(CountingProcessor::with_artifact(
            serde_json::json!({"text": "torque specs"}),
        ));
        let stages = vec![
            StageDefinition::new("text_extraction", upstream.clone()),
            StageDefinition::new("classification", flaky.clone()),
        ];
        let orchestrator = pipeline(stages, &services, CompletionPolicy::Strict);

        let first = orchestrator
            .run_document(document("doc-l"), &CancelToken::new())
            .await;
        assert_eq!(first.status, DocumentStatus::Failed);

        // Operator re-runs just the failed stage on a fresh context; the
        // upstream artifact rehydrates from its completion marker.
        let rerun = orchestrator
            .run_stage(document("doc-l"), "classification", &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(rerun.status, DocumentStatus::Completed);
        assert_eq!(upstream.calls(), 1);
        assert_eq!(flaky.calls(), 2);

        assert!(orchestrator
            .run_stage(document("doc-l"), "no_such_stage", &CancelToken::new())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_operator_queries_and_manual_resolution() {
        let services = fast_services(2);
        let orchestrator = pipeline(
            vec![StageDefinition::new(
                "embedding",
                Arc::new(FailingProcessor::new(|| {
                    StageFault::validation("embedding dimensionality mismatch")
                })),
            )],
            &services,
            CompletionPolicy::Strict,
        );

        orchestrator
            .run_document(document("doc-m"), &CancelToken::new())
            .await;

        let statuses = orchestrator.stage_statuses("doc-m").await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status, StageStatus::Failed);

        let history = orchestrator.error_history("doc-m").await.unwrap();
        assert_eq!(history.len(), 1);

        orchestrator
            .resolve_error(
                history[0].error_id,
                "ops@example.com",
                "source re-exported with embedded fonts",
            )
            .await
            .unwrap();

        let history = orchestrator.error_history("doc-m").await.unwrap();
        assert_eq!(history[0].status, ErrorStatus::Resolved);
        assert_eq!(history[0].resolved_by.as_deref(), Some("ops@example.com"));
    }

    #[tokio::test]
    async fn test_cancellation_halts_sequence() {
        let services = fast_services(2);
        let s2 = Arc::new(CountingProcessor::new());
        let cancel = CancelToken::new();

        struct CancellingProcessor {
            cancel: CancelToken,
        }

        #[async_trait]
        impl StageProcessor for CancellingProcessor {
            async fn process(
                &self,
                _ctx: &StageContext,
            ) -> Result<serde_json::Value, StageFault> {
                self.cancel.cancel("operator abort");
                Ok(serde_json::json!({}))
            }
        }

        let stages = vec![
            StageDefinition::new(
                "text_extraction",
                Arc::new(CancellingProcessor {
                    cancel: cancel.clone(),
                }),
            ),
            StageDefinition::new("image_extraction", s2.clone()),
        ];
        let orchestrator = pipeline(stages, &services, CompletionPolicy::Strict);

        let outcome = orchestrator.run_document(document("doc-n"), &cancel).await;
        assert_eq!(outcome.stages[1].disposition, StageDisposition::NotAttempted);
        assert_eq!(s2.calls(), 0);
    }
}

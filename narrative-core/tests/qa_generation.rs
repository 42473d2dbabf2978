//! QA tests for the generation path: caching, admission, retries,
//! validation failures and fallbacks.
//!
//! Run with: `cargo test -p narrative-core --test qa_generation`

use narrative_core::config::{AdmissionConfig, EngineConfig, RetryConfig};
use narrative_core::engine::{FallbackReason, GenerationStatus};
use narrative_core::testing::{MemoryStore, PayloadBuilder, Scripted, ScriptedGenerator};
use narrative_core::validate::RuleId;
use narrative_core::{
    BranchKey, DecisionRecord, EngineError, GeneratorError, OptionKey, StoryCanon, StoryEngine,
};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn quiet_config() -> EngineConfig {
    EngineConfig::default()
        .with_retry(RetryConfig::none())
        .with_enrichment(false)
}

fn engine_with(generator: Arc<ScriptedGenerator>, config: EngineConfig) -> (StoryEngine, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let engine = StoryEngine::new(config, generator, store.clone(), StoryCanon::new());
    (engine, store)
}

// =============================================================================
// Caching and deduplication
// =============================================================================

#[tokio::test]
async fn test_cached_unit_not_regenerated() {
    init_tracing();
    let generator = Arc::new(ScriptedGenerator::new().then_payload(PayloadBuilder::new().build()));
    let (engine, store) = engine_with(generator.clone(), quiet_config());

    let first = engine.generate_unit(1, 1, &[]).await.unwrap();
    assert_eq!(first.status, GenerationStatus::Generated);
    assert_eq!(store.unit_count(), 1);

    let second = engine.generate_unit(1, 1, &[]).await.unwrap();
    assert_eq!(second.status, GenerationStatus::Cached);
    assert_eq!(second.unit, first.unit);
    assert_eq!(generator.unit_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_duplicates_generate_once() {
    init_tracing();
    let generator = Arc::new(
        ScriptedGenerator::new()
            .repeating(PayloadBuilder::new().build())
            .with_delay(Duration::from_secs(10)),
    );
    let (engine, _store) = engine_with(generator.clone(), quiet_config());

    let leader = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.generate_unit(1, 2, &[]).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;

    let follower = engine.generate_unit(1, 2, &[]).await.unwrap();
    let leader = leader.await.unwrap().unwrap();

    assert!(follower.deduplicated);
    assert!(!leader.deduplicated);
    assert_eq!(follower.unit, leader.unit);
    assert_eq!(generator.unit_calls(), 1);
}

// =============================================================================
// Admission
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_generation_concurrency_is_bounded() {
    init_tracing();
    let generator = Arc::new(
        ScriptedGenerator::new()
            .repeating(PayloadBuilder::new().build())
            .with_delay(Duration::from_secs(3)),
    );
    let config = quiet_config().with_admission(AdmissionConfig::default().with_max_concurrent(2));
    let (engine, _store) = engine_with(generator.clone(), config);

    let tasks: Vec<_> = (1..=5)
        .map(|chapter| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.generate_unit(chapter, 2, &[]).await })
        })
        .collect();
    for task in tasks {
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.status, GenerationStatus::Generated);
    }

    assert_eq!(generator.unit_calls(), 5);
    assert_eq!(generator.peak_concurrency(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_queue_overflow_is_busy() {
    init_tracing();
    let generator = Arc::new(
        ScriptedGenerator::new()
            .repeating(PayloadBuilder::new().build())
            .with_delay(Duration::from_secs(10)),
    );
    let config = quiet_config().with_admission(
        AdmissionConfig::default()
            .with_max_concurrent(1)
            .with_max_queue_depth(0),
    );
    let (engine, _store) = engine_with(generator.clone(), config);

    let running = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.generate_unit(1, 1, &[]).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;

    let refused = engine.generate_unit(1, 2, &[]).await.unwrap_err();
    assert_eq!(refused, EngineError::Busy { queued: 0 });
    assert!(refused.is_retryable());

    assert!(running.await.unwrap().is_ok());
    assert_eq!(engine.admission_stats().rejected_total, 1);
}

#[tokio::test]
async fn test_shutdown_refuses_work() {
    let generator = Arc::new(ScriptedGenerator::new().repeating(PayloadBuilder::new().build()));
    let (engine, _store) = engine_with(generator.clone(), quiet_config());

    engine.shutdown();
    assert!(engine.is_shut_down());
    assert_eq!(engine.generate_unit(1, 1, &[]).await.unwrap_err(), EngineError::ShutDown);
    assert_eq!(generator.unit_calls(), 0);
}

#[tokio::test]
async fn test_invalid_position_rejected() {
    let generator = Arc::new(ScriptedGenerator::new());
    let (engine, _store) = engine_with(generator, quiet_config());

    assert_eq!(
        engine.generate_unit(0, 1, &[]).await.unwrap_err(),
        EngineError::InvalidPosition { chapter: 0, subchapter: 1 }
    );
    assert!(matches!(
        engine.generate_unit(1, 4, &[]).await,
        Err(EngineError::InvalidPosition { .. })
    ));
}

// =============================================================================
// Failure policy
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_hanging_generator_falls_back() {
    init_tracing();
    let generator = Arc::new(ScriptedGenerator::new().then(Scripted::Hang));
    let config = quiet_config().with_generation_timeout(Duration::from_secs(5));
    let (engine, store) = engine_with(generator, config);

    let outcome = engine.generate_unit(1, 3, &[]).await.unwrap();
    assert_eq!(outcome.status, GenerationStatus::Fallback(FallbackReason::TimedOut));
    assert!(!outcome.unit.narrative.is_empty());
    assert!(outcome.unit.decision.unwrap().is_well_formed());
    // Fallbacks are not cached, so a later request can try again.
    assert_eq!(store.unit_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_retried() {
    init_tracing();
    let generator = Arc::new(
        ScriptedGenerator::new()
            .then_fail(GeneratorError::Unavailable("overloaded".into()))
            .then_fail(GeneratorError::Malformed("truncated".into()))
            .then_payload(PayloadBuilder::new().build()),
    );
    let config = quiet_config().with_retry(
        RetryConfig::default()
            .with_max_retries(2)
            .with_base_delay(Duration::from_millis(100)),
    );
    let (engine, _store) = engine_with(generator.clone(), config);

    let outcome = engine.generate_unit(1, 1, &[]).await.unwrap();
    assert_eq!(outcome.status, GenerationStatus::Generated);
    assert_eq!(generator.unit_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_falls_back() {
    init_tracing();
    let generator = Arc::new(
        ScriptedGenerator::new()
            .then_fail(GeneratorError::Timeout)
            .then_fail(GeneratorError::Timeout)
            .then_fail(GeneratorError::Timeout),
    );
    let config = quiet_config().with_retry(RetryConfig::default().with_max_retries(2));
    let (engine, _store) = engine_with(generator.clone(), config);

    let outcome = engine.generate_unit(1, 1, &[]).await.unwrap();
    assert!(matches!(
        outcome.status,
        GenerationStatus::Fallback(FallbackReason::ExternalFailure(_))
    ));
    assert_eq!(generator.unit_calls(), 3);
}

#[tokio::test]
async fn test_permanent_failure_not_retried() {
    let generator = Arc::new(
        ScriptedGenerator::new().then_fail(GeneratorError::Rejected("invalid request".into())),
    );
    let config = quiet_config().with_retry(RetryConfig::default().with_max_retries(3));
    let (engine, _store) = engine_with(generator.clone(), config);

    let outcome = engine.generate_unit(1, 1, &[]).await.unwrap();
    assert!(outcome.status.is_fallback());
    assert_eq!(generator.unit_calls(), 1);
}

#[tokio::test]
async fn test_hard_violation_falls_back_without_retry() {
    init_tracing();
    let generator = Arc::new(
        ScriptedGenerator::new()
            .repeating(PayloadBuilder::new().opening("Sara waited by the pier.").build()),
    );
    let store = Arc::new(MemoryStore::new());
    let canon = StoryCanon::new().with_character("Sarah", &["Sara"]);
    let config = quiet_config().with_retry(RetryConfig::default().with_max_retries(3));
    let engine = StoryEngine::new(config, generator.clone(), store, canon);

    let outcome = engine.generate_unit(1, 1, &[]).await.unwrap();
    match &outcome.status {
        GenerationStatus::Fallback(FallbackReason::HardViolation(issues)) => {
            assert!(issues.iter().any(|i| i.rule == RuleId::IdentityIntegrity));
        }
        other => panic!("expected a hard-violation fallback, got {other:?}"),
    }
    assert!(!outcome.unit.narrative.contains("Sara "));
    assert!(outcome.warnings.iter().any(|w| w.starts_with("IDENTITY:")));
    assert_eq!(generator.unit_calls(), 1);
}

#[tokio::test]
async fn test_missing_decision_repaired() {
    let generator = Arc::new(ScriptedGenerator::new().then_payload(PayloadBuilder::new().build()));
    let (engine, _store) = engine_with(generator, quiet_config());

    let outcome = engine.generate_unit(1, 3, &[]).await.unwrap();
    assert_eq!(outcome.status, GenerationStatus::Generated);
    assert!(outcome.unit.decision.unwrap().is_well_formed());
    assert!(outcome.warnings.iter().any(|w| w.contains("repaired")));
}

#[tokio::test]
async fn test_store_failures_never_surface() {
    let generator = Arc::new(ScriptedGenerator::new().repeating(PayloadBuilder::new().build()));
    let (engine, store) = engine_with(generator, quiet_config());
    store.set_fail_writes(true);

    let outcome = engine.generate_unit(1, 1, &[]).await.unwrap();
    assert_eq!(outcome.status, GenerationStatus::Generated);
    assert_eq!(store.unit_count(), 0);
}

// =============================================================================
// Player agency
// =============================================================================

fn confront_history() -> Vec<DecisionRecord> {
    vec![DecisionRecord::new("001C", OptionKey::A).with_title("Confront the fence")]
}

#[tokio::test]
async fn test_ignored_decision_falls_back_to_consequence() {
    init_tracing();
    let generator = Arc::new(ScriptedGenerator::new().repeating(PayloadBuilder::new().build()));
    let (engine, _store) = engine_with(generator, quiet_config());

    let outcome = engine.generate_unit(2, 1, &confront_history()).await.unwrap();
    match &outcome.status {
        GenerationStatus::Fallback(FallbackReason::HardViolation(issues)) => {
            assert!(issues.iter().any(|i| i.rule == RuleId::PlayerAgency));
        }
        other => panic!("expected an agency fallback, got {other:?}"),
    }
    assert_eq!(outcome.unit.branch_key.as_str(), "A");
    assert!(outcome.unit.narrative.starts_with("You chose to confront the fence."));
}

#[tokio::test]
async fn test_reflected_decision_accepted() {
    let generator = Arc::new(ScriptedGenerator::new().then_payload(
        PayloadBuilder::new()
            .opening("The fence was still counting money when the door gave way.")
            .build(),
    ));
    let (engine, _store) = engine_with(generator.clone(), quiet_config());

    let outcome = engine.generate_unit(2, 1, &confront_history()).await.unwrap();
    assert_eq!(outcome.status, GenerationStatus::Generated);

    let request = &generator.requests()[0];
    assert_eq!(request.context["previous_decision"]["title"], "Confront the fence");
    assert_eq!(request.context["super_path"], "balanced");
    assert_eq!(request.context["personality"]["archetype"], "aggressive");

    let context = engine.context_snapshot();
    assert!(context.consequences.get("001C:A").is_some());
    assert!(context.branch(&BranchKey::root()).is_none());
}

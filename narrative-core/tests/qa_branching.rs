//! QA tests for branch identity and per-branch isolation.
//!
//! Run with: `cargo test -p narrative-core --test qa_branching`

use narrative_core::config::{EngineConfig, RetryConfig};
use narrative_core::engine::GenerationStatus;
use narrative_core::testing::{MemoryStore, PayloadBuilder, ScriptedGenerator};
use narrative_core::{resolve_branch_key, BranchKey, DecisionRecord, OptionKey, StoryCanon, StoryEngine};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

fn decision(chapter: u32, key: OptionKey) -> DecisionRecord {
    DecisionRecord::new(format!("{chapter:03}C"), key)
}

fn random_option(rng: &mut StdRng) -> OptionKey {
    if rng.gen_bool(0.5) {
        OptionKey::A
    } else {
        OptionKey::B
    }
}

/// One decision for each chapter in `chapters`, in random order.
fn random_history(rng: &mut StdRng, chapters: std::ops::Range<u32>) -> Vec<DecisionRecord> {
    let mut history: Vec<_> = chapters.map(|c| decision(c, random_option(rng))).collect();
    history.shuffle(rng);
    history
}

// =============================================================================
// Branch identity
// =============================================================================

#[test]
fn test_known_paths() {
    let history = vec![decision(1, OptionKey::A)];
    assert_eq!(resolve_branch_key(1, &history), BranchKey::root());
    assert_eq!(resolve_branch_key(2, &history).as_str(), "A");

    let history = vec![decision(1, OptionKey::B), decision(2, OptionKey::A), decision(3, OptionKey::B)];
    assert_eq!(resolve_branch_key(3, &history).as_str(), "BA");
    assert_eq!(resolve_branch_key(4, &history).as_str(), "BAB");
}

#[test]
fn test_key_ignores_order_and_later_decisions() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..200 {
        let target = rng.gen_range(1..=12);
        let history = random_history(&mut rng, 1..target);
        let key = resolve_branch_key(target, &history);

        assert_eq!(key.choices().len(), target as usize - 1);

        // Decisions made at or after the target chapter never matter.
        let later = rng.gen_range(1..5);
        let mut extended = history.clone();
        extended.extend(random_history(&mut rng, target..target + later));
        extended.shuffle(&mut rng);
        assert_eq!(resolve_branch_key(target, &extended), key);

        // Unparsable locators are ignored.
        extended.push(DecisionRecord::new("not-a-locator", random_option(&mut rng)));
        assert_eq!(resolve_branch_key(target, &extended), key);
    }
}

#[test]
fn test_prefix_agreeing_histories_share_a_key() {
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..200 {
        let target = rng.gen_range(2..=10);
        let prefix = random_history(&mut rng, 1..target);

        let mut left = prefix.clone();
        left.extend(random_history(&mut rng, target..target + 3));
        let mut right = prefix;
        right.extend(random_history(&mut rng, target..target + 6));
        right.shuffle(&mut rng);

        assert_eq!(resolve_branch_key(target, &left), resolve_branch_key(target, &right));
    }
}

#[test]
fn test_latest_decision_per_chapter_wins() {
    let history = vec![decision(1, OptionKey::A), decision(2, OptionKey::A), decision(1, OptionKey::B)];
    assert_eq!(resolve_branch_key(3, &history).as_str(), "BA");
}

#[test]
fn test_ancestors_end_at_root() {
    let key = resolve_branch_key(4, &[decision(1, OptionKey::A), decision(2, OptionKey::B), decision(3, OptionKey::A)]);
    let ancestors: Vec<_> = key.ancestors().iter().map(|k| k.to_string()).collect();
    assert_eq!(ancestors, vec!["AB", "A", "ROOT"]);
    assert!(BranchKey::root().ancestors().is_empty());
}

// =============================================================================
// Isolation through the engine
// =============================================================================

#[tokio::test]
async fn test_removal_on_one_branch_is_invisible_on_its_sibling() {
    let generator = Arc::new(
        ScriptedGenerator::new()
            .then_payload(PayloadBuilder::new().removed("Marcus").build())
            .then_payload(
                PayloadBuilder::new()
                    .opening("Marcus walked into the bar and ordered a drink.")
                    .with_decision()
                    .build(),
            )
            .then_payload(
                PayloadBuilder::new()
                    .opening("Marcus walked into the bar and ordered a drink.")
                    .build(),
            ),
    );
    let config = EngineConfig::default()
        .with_retry(RetryConfig::none())
        .with_enrichment(false);
    let engine = StoryEngine::new(config, generator, Arc::new(MemoryStore::new()), StoryCanon::new());

    let went_a = vec![decision(1, OptionKey::A)];
    let went_b = vec![decision(1, OptionKey::B)];

    let outcome = engine.generate_unit(2, 2, &went_a).await.unwrap();
    assert_eq!(outcome.status, GenerationStatus::Generated);

    // Branch A remembers the removal and flags the return.
    let outcome = engine.generate_unit(2, 3, &went_a).await.unwrap();
    assert_eq!(outcome.status, GenerationStatus::Generated);
    assert!(outcome.warnings.iter().any(|w| w.contains("Marcus")), "{:?}", outcome.warnings);

    // Branch B never saw it.
    let outcome = engine.generate_unit(2, 2, &went_b).await.unwrap();
    assert_eq!(outcome.status, GenerationStatus::Generated);
    assert!(outcome.warnings.iter().all(|w| !w.contains("Marcus")), "{:?}", outcome.warnings);

    let context = engine.context_snapshot();
    let a = resolve_branch_key(2, &went_a);
    let b = resolve_branch_key(2, &went_b);
    assert!(context.branch(&a).unwrap().facts.is_removed("Marcus"));
    assert!(!context.branch(&b).unwrap().facts.is_removed("Marcus"));
    assert!(context.branch(&BranchKey::root()).is_none());
}

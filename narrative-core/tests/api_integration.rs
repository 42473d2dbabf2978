//! Integration tests that call the real Claude API.
//!
//! These tests require ANTHROPIC_API_KEY to be set (via .env file or environment).
//! Run with: `cargo test -p narrative-core --test api_integration -- --ignored --nocapture`
//!
//! These are marked #[ignore] by default to keep CI free of API costs and slow calls.

use narrative_core::{
    ClaudeGenerator, DecisionRecord, EngineConfig, GenerationStatus, MemoryStore, OptionKey,
    StoryCanon, StoryEngine,
};
use std::sync::Arc;

/// Load environment variables from .env file
fn setup() {
    let _ = dotenvy::dotenv();
}

/// Check if API key is available
fn has_api_key() -> bool {
    std::env::var("ANTHROPIC_API_KEY").is_ok()
}

fn live_engine() -> StoryEngine {
    let generator = ClaudeGenerator::from_env().expect("Failed to create generator");
    let canon = StoryCanon::new()
        .with_character("Jack Halloway", &["Jack Holloway"])
        .with_character("Sarah Reyes", &["Sara Reyes"])
        .with_attribute("Jack", "drink", "bourbon", &["gin", "vodka"]);
    StoryEngine::new(EngineConfig::default(), Arc::new(generator), Arc::new(MemoryStore::new()), canon)
}

#[tokio::test]
#[ignore] // Run with: cargo test -p narrative-core --test api_integration -- --ignored
async fn test_first_unit_generates() {
    setup();
    if !has_api_key() {
        eprintln!("Skipping test: ANTHROPIC_API_KEY not set");
        return;
    }

    let engine = live_engine();
    let outcome = engine.generate_unit(1, 1, &[]).await.expect("engine accepted the request");

    println!("Status: {:?}", outcome.status);
    println!("Title: {}", outcome.unit.title);
    for warning in &outcome.warnings {
        println!("  warning: {warning}");
    }
    assert!(!outcome.unit.narrative.is_empty());
    assert!(outcome.unit.board_words.len() <= engine.config().validator.max_board_words);
}

#[tokio::test]
#[ignore]
async fn test_decision_is_carried_forward() {
    setup();
    if !has_api_key() {
        eprintln!("Skipping test: ANTHROPIC_API_KEY not set");
        return;
    }

    let engine = live_engine();
    let history = vec![DecisionRecord::new("001C", OptionKey::A)
        .with_title("Confront the fence")
        .with_focus("Corner him at the pawnshop and demand the ledger.")];

    let outcome = engine.generate_unit(2, 1, &history).await.expect("engine accepted the request");
    println!("Status: {:?}", outcome.status);
    println!("{}", outcome.unit.narrative);

    if outcome.status == GenerationStatus::Generated {
        assert!(outcome.warnings.iter().all(|w| !w.contains("previous decision ignored")));
    }
    assert!(!outcome.unit.narrative.is_empty());
}

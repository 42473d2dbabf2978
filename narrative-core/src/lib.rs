//! Branching narrative engine with consistency checking and admission control.
//!
//! This crate provides:
//! - Deterministic branch identity from a player's decision history
//! - Decision consequences and the personality they add up to
//! - A lifecycle for open narrative threads (merge, cap, archive, escalate)
//! - A rule-driven consistency validator for generated units
//! - Admission control for expensive generator calls
//! - Graceful fallback when generation fails
//!
//! # Quick Start
//!
//! ```ignore
//! use narrative_core::{
//!     ClaudeGenerator, DecisionRecord, EngineConfig, JsonDirStore, OptionKey, StoryCanon,
//!     StoryEngine,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let canon = StoryCanon::load_json("canon.json").await?;
//!     let engine = StoryEngine::open(
//!         EngineConfig::default(),
//!         Arc::new(ClaudeGenerator::from_env()?),
//!         Arc::new(JsonDirStore::new("saves/story")),
//!         canon,
//!     )
//!     .await?;
//!
//!     let history = vec![DecisionRecord::new("001C", OptionKey::A).with_title("Confront the fence")];
//!     let outcome = engine.generate_unit(2, 1, &history).await?;
//!     println!("{}", outcome.unit.narrative);
//!
//!     engine.shutdown();
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod canon;
pub mod config;
pub mod consequence;
pub mod engine;
pub mod error;
pub mod facts;
pub mod fallback;
pub mod generator;
pub mod path;
pub mod persist;
pub mod prompt;
pub mod state;
pub mod testing;
pub mod threads;
pub mod unit;
pub mod validate;

// Primary public API
pub use canon::StoryCanon;
pub use config::{AdmissionConfig, EngineConfig, RetryConfig, ThreadPolicy, ValidatorConfig};
pub use consequence::{Consequence, ConsequenceResolver, PersonalityProfile};
pub use engine::{FallbackReason, GenerationStatus, StoryEngine, UnitOutcome};
pub use error::EngineError;
pub use generator::{ClaudeGenerator, GenerationRequest, Generator, GeneratorError};
pub use path::{resolve_branch_key, BranchKey, CaseNumber, DecisionRecord, OptionKey, UnitKey};
pub use persist::{JsonDirStore, PersistError, StoryStore};
pub use state::StoryContext;
pub use testing::{MemoryStore, PayloadBuilder, ScriptedGenerator};
pub use unit::GeneratedUnit;

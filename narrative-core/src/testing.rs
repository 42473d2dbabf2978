//! Testing utilities for the story engine.
//!
//! This module provides tools for integration testing:
//! - `ScriptedGenerator` for deterministic generation without API calls
//! - `PayloadBuilder` for generator payloads that pass validation
//! - `MemoryStore` (re-exported) for persistence without a filesystem

use crate::generator::{GenerationRequest, Generator, GeneratorError, RequestPurpose};
use crate::path::OptionKey;
use crate::threads::ThreadDeclaration;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub use crate::persist::MemoryStore;

/// Neutral filler: no play-style lexicon, no durations, no names.
const FILLER: &str = "The rain kept falling on the quiet street outside the office window. \
                      A tram rattled past and the radio hummed an old song about the harbor.";

/// A scripted generator reply.
#[derive(Debug, Clone)]
pub enum Scripted {
    Payload(serde_json::Value),
    Fail(GeneratorError),
    /// Never answer.
    Hang,
}

/// A generator that replays scripted replies in order.
///
/// Unit requests and consequence-enrichment requests have separate scripts,
/// so enrichment never steals a reply meant for a unit. When the unit script
/// runs dry the repeat payload (if any) is served, otherwise the request is
/// rejected.
pub struct ScriptedGenerator {
    units: Mutex<VecDeque<Scripted>>,
    consequences: Mutex<VecDeque<Scripted>>,
    repeat: Mutex<Option<serde_json::Value>>,
    delay: Duration,
    consequence_delay: Duration,
    unit_calls: AtomicUsize,
    consequence_calls: AtomicUsize,
    running: Arc<AtomicUsize>,
    peak: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl Default for ScriptedGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self {
            units: Mutex::new(VecDeque::new()),
            consequences: Mutex::new(VecDeque::new()),
            repeat: Mutex::new(None),
            delay: Duration::ZERO,
            consequence_delay: Duration::ZERO,
            unit_calls: AtomicUsize::new(0),
            consequence_calls: AtomicUsize::new(0),
            running: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a reply for the next unit request.
    pub fn then(self, reply: Scripted) -> Self {
        self.push(reply);
        self
    }

    /// Queue a payload for the next unit request.
    pub fn then_payload(self, payload: serde_json::Value) -> Self {
        self.then(Scripted::Payload(payload))
    }

    /// Queue a failure for the next unit request.
    pub fn then_fail(self, error: GeneratorError) -> Self {
        self.then(Scripted::Fail(error))
    }

    /// Serve `payload` whenever the unit script is empty.
    pub fn repeating(self, payload: serde_json::Value) -> Self {
        *self.repeat.lock().unwrap_or_else(PoisonError::into_inner) = Some(payload);
        self
    }

    /// Queue a reply for the next consequence-enrichment request.
    pub fn then_consequence(self, reply: Scripted) -> Self {
        self.consequences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(reply);
        self
    }

    /// Sleep this long before every reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sleep this much longer before every consequence-enrichment reply.
    pub fn with_consequence_delay(mut self, delay: Duration) -> Self {
        self.consequence_delay = delay;
        self
    }

    /// Queue a unit reply on a shared generator.
    pub fn push(&self, reply: Scripted) {
        self.units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(reply);
    }

    pub fn unit_calls(&self) -> usize {
        self.unit_calls.load(Ordering::SeqCst)
    }

    pub fn consequence_calls(&self) -> usize {
        self.consequence_calls.load(Ordering::SeqCst)
    }

    /// Most unit requests ever in progress at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next_reply(&self, purpose: RequestPurpose) -> Scripted {
        match purpose {
            RequestPurpose::Unit => {
                let next = self
                    .units
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pop_front();
                next.or_else(|| {
                    self.repeat
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone()
                        .map(Scripted::Payload)
                })
                .unwrap_or_else(|| Scripted::Fail(GeneratorError::Rejected("script exhausted".into())))
            }
            RequestPurpose::Consequence => self
                .consequences
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
                .unwrap_or_else(|| Scripted::Fail(GeneratorError::Unavailable("no enrichment scripted".into()))),
        }
    }
}

/// Decrements the running count when a call finishes or is dropped.
struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<serde_json::Value, GeneratorError> {
        let purpose = request.purpose;
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);

        let _guard = match purpose {
            RequestPurpose::Unit => {
                self.unit_calls.fetch_add(1, Ordering::SeqCst);
                let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                Some(RunningGuard(Arc::clone(&self.running)))
            }
            RequestPurpose::Consequence => {
                self.consequence_calls.fetch_add(1, Ordering::SeqCst);
                None
            }
        };

        let delay = match purpose {
            RequestPurpose::Unit => self.delay,
            RequestPurpose::Consequence => self.delay + self.consequence_delay,
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match self.next_reply(purpose) {
            Scripted::Payload(payload) => Ok(payload),
            Scripted::Fail(error) => Err(error),
            Scripted::Hang => futures::future::pending().await,
        }
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// `words` words of neutral prose, opened by `opening`.
pub fn long_narrative(opening: &str, words: usize) -> String {
    let mut text = opening.trim().to_string();
    while text.split_whitespace().count() < words {
        if !text.is_empty() {
            text.push(' ');
        }
        text.push_str(FILLER);
    }
    text
}

/// Builds unit payloads as a generator would emit them.
///
/// The defaults pass every structural check.
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    title: String,
    opening: String,
    bridge_text: String,
    previously: String,
    threads: Vec<ThreadDeclaration>,
    revelations: Vec<String>,
    removed_characters: Vec<String>,
    emotional_state: Option<String>,
    decision: bool,
}

impl Default for PayloadBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadBuilder {
    pub fn new() -> Self {
        Self {
            title: "Night Shift".to_string(),
            opening: String::new(),
            bridge_text: "Later that night.".to_string(),
            previously: "A case arrived with the rain.".to_string(),
            threads: Vec::new(),
            revelations: Vec::new(),
            removed_characters: Vec::new(),
            emotional_state: None,
            decision: false,
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Text placed at the very start of the narrative.
    pub fn opening(mut self, opening: impl Into<String>) -> Self {
        self.opening = opening.into();
        self
    }

    pub fn bridge(mut self, bridge: impl Into<String>) -> Self {
        self.bridge_text = bridge.into();
        self
    }

    pub fn thread(mut self, declaration: ThreadDeclaration) -> Self {
        self.threads.push(declaration);
        self
    }

    pub fn revelation(mut self, text: impl Into<String>) -> Self {
        self.revelations.push(text.into());
        self
    }

    pub fn removed(mut self, name: impl Into<String>) -> Self {
        self.removed_characters.push(name.into());
        self
    }

    pub fn emotional_state(mut self, state: impl Into<String>) -> Self {
        self.emotional_state = Some(state.into());
        self
    }

    /// Include a well-formed A/B decision.
    pub fn with_decision(mut self) -> Self {
        self.decision = true;
        self
    }

    pub fn build(self) -> serde_json::Value {
        let mut payload = serde_json::json!({
            "title": self.title,
            "narrative": long_narrative(&self.opening, 320),
            "bridge_text": self.bridge_text,
            "previously": self.previously,
            "threads": self.threads,
            "revelations": self.revelations,
            "removed_characters": self.removed_characters,
            "board_words": ["RAIN", "STREET", "OFFICE", "WINDOW", "TRAM", "RADIO", "SONG", "HARBOR"],
        });
        if let Some(state) = self.emotional_state {
            payload["emotional_state"] = serde_json::Value::String(state);
        }
        if self.decision {
            payload["decision"] = serde_json::json!({
                "intro": "Two doors, one night.",
                "options": [
                    {"key": OptionKey::A, "title": "Take the docks", "focus": "The harbor office."},
                    {"key": OptionKey::B, "title": "Take the hotel", "focus": "The night clerk."}
                ]
            });
        }
        payload
    }
}

//! Narrative consequences of past decisions.
//!
//! A consequence records what a decision did to the story: the immediate
//! effect the next chapter must open on, the ongoing effects that color
//! later chapters, and how the choice shifts the detective's character.
//!
//! Resolution order, first hit wins:
//! 1. the registry (authored consequences, plus everything resolved this session)
//! 2. the durable cache persisted with the story context
//! 3. a cheap derivation from the option's own title and focus text
//!
//! A derived consequence may later be replaced by an enriched one produced
//! by the generator in the background; the caller never waits for it.

use crate::generator::{GenerationRequest, Generator, RequestPurpose};
use crate::path::{lean_of, words, DecisionRecord, Lean, OptionKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Recency weight added per decision (later decisions weigh more).
const RECENCY_STEP: f32 = 0.5;

/// Minimum aggression/thoroughness gap that selects a non-balanced archetype.
const ARCHETYPE_THRESHOLD: f32 = 1.5;

/// Shortest word considered a consequence keyword.
const MIN_KEYWORD_LEN: usize = 5;

const KEYWORD_STOPWORDS: &[&str] = &[
    "about", "after", "again", "being", "before", "chose", "choose", "could", "every",
    "focusing", "option", "other", "their", "there", "these", "those", "which", "while",
    "would", "should", "yourself", "something", "someone", "still", "where", "because",
    "pattern", "reputation", "precedes",
];

/// How a decision shifts the detective's character.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterImpact {
    pub trust: i32,
    pub aggression: i32,
    pub thoroughness: i32,
}

/// The narrative effect of one decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consequence {
    pub immediate: String,
    #[serde(default)]
    pub ongoing: Vec<String>,
    #[serde(default)]
    pub character_impact: CharacterImpact,
}

/// Where a resolved consequence came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsequenceOrigin {
    Registry,
    Cache,
    Derived,
}

/// A consequence together with its origin.
#[derive(Debug, Clone)]
pub struct ResolvedConsequence {
    pub key: String,
    pub consequence: Consequence,
    pub origin: ConsequenceOrigin,
}

/// Key of a consequence: the decision's locator plus the option taken.
pub fn consequence_key(locator_id: &str, option: OptionKey) -> String {
    format!("{}:{}", locator_id.trim().to_uppercase(), option)
}

/// Consequences persisted with the story context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsequenceCache(BTreeMap<String, Consequence>);

impl ConsequenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Consequence> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, consequence: Consequence) {
        self.0.insert(key.into(), consequence);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// =============================================================================
// Personality
// =============================================================================

/// The detective's overall play style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Archetype {
    Aggressive,
    Methodical,
    Balanced,
}

impl Archetype {
    pub fn name(&self) -> &'static str {
        match self {
            Archetype::Aggressive => "aggressive",
            Archetype::Methodical => "methodical",
            Archetype::Balanced => "balanced",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTolerance {
    Low,
    Moderate,
    High,
}

/// Weighted aggression and thoroughness scores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonalityScores {
    pub aggression: f32,
    pub thoroughness: f32,
}

/// The aggregate personality implied by a decision history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonalityProfile {
    pub archetype: Archetype,
    pub narrative_style: String,
    pub risk_tolerance: RiskTolerance,
    pub dialogue_tone: String,
    pub scores: PersonalityScores,
}

impl PersonalityProfile {
    fn for_archetype(archetype: Archetype, scores: PersonalityScores) -> Self {
        let (style, risk, tone) = match archetype {
            Archetype::Aggressive => (
                "punchy and kinetic, scenes driven by confrontation",
                RiskTolerance::High,
                "blunt and pressing",
            ),
            Archetype::Methodical => (
                "deliberate and observational, scenes driven by detail",
                RiskTolerance::Low,
                "precise and probing",
            ),
            Archetype::Balanced => (
                "measured, alternating action and deduction",
                RiskTolerance::Moderate,
                "even and adaptable",
            ),
        };
        Self {
            archetype,
            narrative_style: style.to_string(),
            risk_tolerance: risk,
            dialogue_tone: tone.to_string(),
            scores,
        }
    }

    /// The profile of a player with no decisions yet.
    pub fn balanced() -> Self {
        Self::for_archetype(Archetype::Balanced, PersonalityScores::default())
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Resolves, derives, caches and enriches decision consequences.
pub struct ConsequenceResolver {
    registry: RwLock<HashMap<String, Consequence>>,
    enrich_tx: mpsc::UnboundedSender<(String, Consequence)>,
    enrich_rx: Mutex<mpsc::UnboundedReceiver<(String, Consequence)>>,
    /// In-flight enrichments by consequence key.
    enriching: Arc<Mutex<HashMap<String, AbortHandle>>>,
}

impl Default for ConsequenceResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsequenceResolver {
    pub fn new() -> Self {
        let (enrich_tx, enrich_rx) = mpsc::unbounded_channel();
        Self {
            registry: RwLock::new(HashMap::new()),
            enrich_tx,
            enrich_rx: Mutex::new(enrich_rx),
            enriching: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register an authored consequence.
    pub fn register(&self, locator_id: &str, option: OptionKey, consequence: Consequence) {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(consequence_key(locator_id, option), consequence);
    }

    /// Number of registry entries.
    pub fn registry_len(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Resolve the consequence of `decision`.
    ///
    /// Never calls the generator and never fails.
    pub fn resolve(
        &self,
        decision: &DecisionRecord,
        history: &[DecisionRecord],
        cache: &ConsequenceCache,
    ) -> ResolvedConsequence {
        let key = consequence_key(&decision.locator_id, decision.option_key);

        if let Some(found) = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return ResolvedConsequence {
                key,
                consequence: found.clone(),
                origin: ConsequenceOrigin::Registry,
            };
        }

        if let Some(found) = cache.get(&key) {
            return ResolvedConsequence {
                key,
                consequence: found.clone(),
                origin: ConsequenceOrigin::Cache,
            };
        }

        ResolvedConsequence {
            key,
            consequence: derive_consequence(decision, history),
            origin: ConsequenceOrigin::Derived,
        }
    }

    /// Write a resolution back into the registry and the durable cache.
    pub fn remember(&self, key: &str, consequence: &Consequence, cache: &mut ConsequenceCache) {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), consequence.clone());
        cache.insert(key, consequence.clone());
    }

    /// Aggregate the personality implied by `history`.
    ///
    /// Each decision contributes its consequence's aggression and
    /// thoroughness impact, weighted up the more recent it is.
    pub fn aggregate_personality(
        &self,
        history: &[DecisionRecord],
        cache: &ConsequenceCache,
    ) -> PersonalityProfile {
        if history.is_empty() {
            return PersonalityProfile::balanced();
        }

        let mut ordered: Vec<&DecisionRecord> = history.iter().collect();
        ordered.sort_by_key(|d| d.chapter().unwrap_or(0));

        let mut weighted = PersonalityScores::default();
        let mut total_weight = 0.0f32;
        for (index, decision) in ordered.iter().enumerate() {
            let weight = 1.0 + index as f32 * RECENCY_STEP;
            let impact = self.resolve(decision, history, cache).consequence.character_impact;
            weighted.aggression += weight * impact.aggression as f32;
            weighted.thoroughness += weight * impact.thoroughness as f32;
            total_weight += weight;
        }

        let scores = PersonalityScores {
            aggression: weighted.aggression / total_weight,
            thoroughness: weighted.thoroughness / total_weight,
        };
        let diff = scores.aggression - scores.thoroughness;
        let archetype = if diff >= ARCHETYPE_THRESHOLD {
            Archetype::Aggressive
        } else if diff <= -ARCHETYPE_THRESHOLD {
            Archetype::Methodical
        } else {
            Archetype::Balanced
        };
        PersonalityProfile::for_archetype(archetype, scores)
    }

    /// Ask the generator for a richer version of a derived consequence.
    ///
    /// Returns immediately. The result, if any, arrives through
    /// [`drain_enrichments`](Self::drain_enrichments); failures and
    /// timeouts are logged and dropped, leaving the derivation in force.
    pub fn spawn_enrichment(
        &self,
        generator: Arc<dyn Generator>,
        decision: &DecisionRecord,
        derived: &ResolvedConsequence,
        timeout: Duration,
    ) {
        // Held across the spawn so the task cannot deregister before it is registered.
        let mut in_flight = self.enriching.lock().unwrap_or_else(PoisonError::into_inner);
        if in_flight.contains_key(&derived.key) {
            return;
        }

        let request = enrichment_request(decision, &derived.consequence);
        let key = derived.key.clone();
        let tx = self.enrich_tx.clone();
        let enriching = Arc::clone(&self.enriching);

        let task = tokio::spawn(async move {
            match tokio::time::timeout(timeout, generator.generate(request)).await {
                Ok(Ok(payload)) => match serde_json::from_value::<Consequence>(payload) {
                    Ok(consequence) if !consequence.immediate.trim().is_empty() => {
                        tracing::debug!(key = %key, "Consequence enriched");
                        let _ = tx.send((key.clone(), consequence));
                    }
                    Ok(_) => tracing::debug!(key = %key, "Enrichment returned empty consequence"),
                    Err(e) => tracing::debug!(key = %key, error = %e, "Enrichment payload malformed"),
                },
                Ok(Err(e)) => tracing::debug!(key = %key, error = %e, "Enrichment failed"),
                Err(_) => tracing::debug!(key = %key, "Enrichment timed out"),
            }
            enriching
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
        });
        in_flight.insert(derived.key.clone(), task.abort_handle());
    }

    /// Number of enrichments still running.
    pub fn pending_enrichments(&self) -> usize {
        self.enriching.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Abort every running enrichment. Returns how many were stopped.
    ///
    /// Results already delivered stay available to
    /// [`drain_enrichments`](Self::drain_enrichments).
    pub fn abort_enrichments(&self) -> usize {
        let aborted: Vec<(String, AbortHandle)> = self
            .enriching
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (key, handle) in &aborted {
            tracing::debug!(key = %key, "Enrichment aborted");
            handle.abort();
        }
        aborted.len()
    }

    /// Take every enrichment that has completed so far.
    pub fn drain_enrichments(&self) -> Vec<(String, Consequence)> {
        let mut rx = self.enrich_rx.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }
}

/// Best-effort consequence from the option's own metadata.
pub fn derive_consequence(decision: &DecisionRecord, history: &[DecisionRecord]) -> Consequence {
    let option_text = decision.option_text();
    let lean = lean_of(&option_text);

    let immediate = match (&decision.option_title, &decision.option_focus) {
        (Some(title), Some(focus)) => {
            format!("You chose to {}, focusing on {}.", lowercase_first(title), lowercase_first(focus))
        }
        (Some(title), None) => format!("You chose to {}.", lowercase_first(title)),
        (None, Some(focus)) => format!("You chose to focus on {}.", lowercase_first(focus)),
        (None, None) => format!(
            "You took option {} at case {}.",
            decision.option_key, decision.locator_id
        ),
    };

    let mut ongoing: Vec<String> = match lean {
        Lean::Aggressive => vec![
            "Your reputation for direct action precedes you".to_string(),
            "Suspects are warier and quicker to lawyer up".to_string(),
        ],
        Lean::Methodical => vec![
            "Your patience has earned quiet cooperation from witnesses".to_string(),
            "The other side has had more time to cover its tracks".to_string(),
        ],
        Lean::Neutral => vec!["The choice still weighs on the case".to_string()],
    };

    let previous = history
        .iter()
        .filter(|d| d.chapter() < decision.chapter() && d.chapter().is_some())
        .max_by_key(|d| d.chapter());
    if let Some(previous) = previous {
        if lean != Lean::Neutral && lean_of(&previous.option_text()) == lean {
            ongoing.push("This continues a pattern the people around you have noticed".to_string());
        }
    }

    let character_impact = match lean {
        Lean::Aggressive => CharacterImpact {
            trust: -1,
            aggression: 2,
            thoroughness: -1,
        },
        Lean::Methodical => CharacterImpact {
            trust: 1,
            aggression: -1,
            thoroughness: 2,
        },
        Lean::Neutral => CharacterImpact {
            trust: 1,
            aggression: 0,
            thoroughness: 0,
        },
    };

    Consequence {
        immediate,
        ongoing,
        character_impact,
    }
}

/// Keywords a following chapter must echo to show the decision mattered.
pub fn consequence_keywords(consequence: &Consequence, decision: &DecisionRecord) -> Vec<String> {
    let mut seen = HashSet::new();
    let source = format!("{} {}", consequence.immediate, decision.option_text());
    words(&source)
        .filter(|w| w.len() >= MIN_KEYWORD_LEN && !KEYWORD_STOPWORDS.contains(&w.as_str()))
        .filter(|w| seen.insert(w.clone()))
        .collect()
}

fn enrichment_request(decision: &DecisionRecord, derived: &Consequence) -> GenerationRequest {
    GenerationRequest {
        purpose: RequestPurpose::Consequence,
        instructions: "You maintain continuity for a branching detective story. Given a player's \
                       decision and a draft consequence, write the concrete immediate effect the \
                       next chapter must open on, two or three ongoing effects, and the impact on \
                       the detective's trust, aggression and thoroughness (-3 to 3)."
            .to_string(),
        output_schema: consequence_schema(),
        context: serde_json::json!({
            "decision": decision,
            "draft": derived,
        }),
    }
}

/// JSON schema of a [`Consequence`] payload.
pub fn consequence_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "immediate": {"type": "string"},
            "ongoing": {"type": "array", "items": {"type": "string"}},
            "character_impact": {
                "type": "object",
                "properties": {
                    "trust": {"type": "integer"},
                    "aggression": {"type": "integer"},
                    "thoroughness": {"type": "integer"}
                },
                "required": ["trust", "aggression", "thoroughness"]
            }
        },
        "required": ["immediate", "ongoing", "character_impact"]
    })
}

fn lowercase_first(text: &str) -> String {
    let text = text.trim().trim_end_matches('.');
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

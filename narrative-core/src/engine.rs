//! StoryEngine - the caller-facing API.
//!
//! One call, [`StoryEngine::generate_unit`], turns a position and a decision
//! history into a unit the reader can be shown. It never fails because the
//! generator did: every generator, validation or timeout failure degrades to
//! a templated fallback built from the same branch state.
//!
//! ```text
//! generate_unit(chapter, subchapter, history)
//!   │
//!   ├─ branch key, unit key
//!   ├─ store hit? ──────────────────────────────► Cached
//!   ├─ admission (dedup / queue / Busy)
//!   │    └─ job:
//!   │         gather branch state, consequence, personality
//!   │         generator call ── retry transient failures with backoff
//!   │         validate ── hard issue ──► fallback (no retry)
//!   │         whole attempt raced against generation_timeout ──► fallback
//!   │         fold threads, facts, consequences; drain enrichments
//!   │         persist unit, then the live context under the save lock
//!   └─ UnitOutcome
//! ```

use crate::admission::{AdmissionController, AdmissionError, AdmissionStats};
use crate::canon::StoryCanon;
use crate::config::EngineConfig;
use crate::consequence::{
    ConsequenceOrigin, ConsequenceResolver, PersonalityProfile, ResolvedConsequence,
};
use crate::error::EngineError;
use crate::fallback::{fallback_decision, fallback_unit};
use crate::generator::{GenerationRequest, Generator, GeneratorError};
use crate::path::{
    classify_super_path, resolve_branch_key, BranchKey, CaseNumber, DecisionRecord, UnitKey,
};
use crate::persist::{PersistError, StoryStore};
use crate::prompt::{unit_request, PromptInput};
use crate::state::{BranchState, StoryContext};
use crate::threads::NarrativeThread;
use crate::unit::GeneratedUnit;
use crate::validate::{ConsistencyIssue, ConsistencyValidator, PriorDecision, ValidationInput};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Why a unit is a fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// The candidate broke a hard consistency rule.
    HardViolation(Vec<ConsistencyIssue>),
    /// The generator failed permanently or ran out of retries.
    ExternalFailure(String),
    TimedOut,
    /// The attempt was evicted as stale.
    Evicted,
}

/// How a unit was obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Generated,
    Cached,
    Fallback(FallbackReason),
}

impl GenerationStatus {
    pub fn is_fallback(&self) -> bool {
        matches!(self, GenerationStatus::Fallback(_))
    }
}

/// The result of [`StoryEngine::generate_unit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOutcome {
    pub unit: GeneratedUnit,
    pub status: GenerationStatus,
    /// Soft issues and repairs worth surfacing.
    pub warnings: Vec<String>,
    /// Whether this request joined one already in flight.
    pub deduplicated: bool,
}

/// Result of one generator-and-validate attempt.
enum Attempt {
    Accepted {
        unit: GeneratedUnit,
        warnings: Vec<String>,
    },
    Rejected(Vec<ConsistencyIssue>),
    Failed(GeneratorError),
}

/// Branch state and resolutions gathered before an attempt.
struct Gathered {
    state: BranchState,
    prior: Option<(DecisionRecord, ResolvedConsequence)>,
    personality: PersonalityProfile,
}

struct EngineInner {
    config: EngineConfig,
    generator: Arc<dyn Generator>,
    store: Arc<dyn StoryStore>,
    canon: StoryCanon,
    validator: ConsistencyValidator,
    consequences: ConsequenceResolver,
    admission: AdmissionController<UnitOutcome>,
    context: Mutex<StoryContext>,
    /// Orders context saves; each one snapshots the context after taking it.
    save_lock: tokio::sync::Mutex<()>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

/// The branching story engine.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct StoryEngine {
    inner: Arc<EngineInner>,
}

impl StoryEngine {
    /// Create an engine with an empty story context.
    pub fn new(
        config: EngineConfig,
        generator: Arc<dyn Generator>,
        store: Arc<dyn StoryStore>,
        canon: StoryCanon,
    ) -> Self {
        Self::with_context(config, generator, store, canon, StoryContext::new())
    }

    /// Create an engine resuming from `context`.
    pub fn with_context(
        config: EngineConfig,
        generator: Arc<dyn Generator>,
        store: Arc<dyn StoryStore>,
        canon: StoryCanon,
        context: StoryContext,
    ) -> Self {
        let validator = ConsistencyValidator::new(config.validator.clone());
        let admission = AdmissionController::new(config.admission.clone());
        Self {
            inner: Arc::new(EngineInner {
                config,
                generator,
                store,
                canon,
                validator,
                consequences: ConsequenceResolver::new(),
                admission,
                context: Mutex::new(context),
                save_lock: tokio::sync::Mutex::new(()),
                watchdog: Mutex::new(None),
            }),
        }
    }

    /// Create an engine resuming from whatever context `store` holds.
    pub async fn open(
        config: EngineConfig,
        generator: Arc<dyn Generator>,
        store: Arc<dyn StoryStore>,
        canon: StoryCanon,
    ) -> Result<Self, PersistError> {
        let context = store.load_context().await?.unwrap_or_default();
        tracing::debug!(branches = context.branch_count(), "Story context loaded");
        Ok(Self::with_context(config, generator, store, canon, context))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The consequence resolver, for registering authored consequences.
    pub fn consequences(&self) -> &ConsequenceResolver {
        &self.inner.consequences
    }

    /// Evict stale generations every `period` until shutdown.
    pub fn start_watchdog(&self, period: Duration) {
        let handle = self.inner.admission.spawn_watchdog(period);
        if let Some(previous) = self.inner.watchdog().replace(handle) {
            previous.abort();
        }
    }

    /// Produce the unit at (`chapter`, `subchapter`) for the branch `history` leads to.
    ///
    /// Errors only when the engine is out of capacity, shut down, or the
    /// position is outside the story grid.
    pub async fn generate_unit(
        &self,
        chapter: u32,
        subchapter: u8,
        history: &[DecisionRecord],
    ) -> Result<UnitOutcome, EngineError> {
        let case = CaseNumber::new(chapter, subchapter)
            .ok_or(EngineError::InvalidPosition { chapter, subchapter })?;
        if self.inner.admission.is_shut_down() {
            return Err(EngineError::ShutDown);
        }

        let branch = resolve_branch_key(chapter, history);
        let key = UnitKey::new(case, &branch);

        match self.inner.store.load_unit(&key).await {
            Ok(Some(unit)) => {
                tracing::debug!(unit_key = %key, "Unit served from store");
                return Ok(UnitOutcome {
                    unit,
                    status: GenerationStatus::Cached,
                    warnings: Vec::new(),
                    deduplicated: false,
                });
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(unit_key = %key, error = %e, "Unit lookup failed"),
        }

        let job = {
            let inner = Arc::clone(&self.inner);
            let history = history.to_vec();
            let branch = branch.clone();
            let key = key.clone();
            async move { inner.produce(case, branch, key, history).await }
        };

        let ticket = self.inner.admission.submit(key.as_str(), job).map_err(|e| {
            tracing::warn!(unit_key = %key, error = %e, "Generation refused");
            EngineError::from(e)
        })?;
        let deduplicated = ticket.is_deduplicated();

        match ticket.wait().await {
            Ok(mut outcome) => {
                outcome.deduplicated = deduplicated;
                Ok(outcome)
            }
            Err(AdmissionError::Cancelled) | Err(AdmissionError::ShutDown) => Err(EngineError::ShutDown),
            Err(AdmissionError::QueueFull { depth }) => Err(EngineError::Busy { queued: depth }),
            Err(e) => {
                let reason = match &e {
                    AdmissionError::Evicted => FallbackReason::Evicted,
                    AdmissionError::TimedOut => FallbackReason::TimedOut,
                    other => FallbackReason::ExternalFailure(other.to_string()),
                };
                tracing::warn!(unit_key = %key, error = %e, "Generation abandoned, serving fallback");
                let gathered = self.inner.gather(case, &branch, history);
                let mut outcome = self.inner.fallback_outcome(case, &branch, &gathered, reason);
                outcome.deduplicated = deduplicated;
                Ok(outcome)
            }
        }
    }

    /// Fold enrichments that have completed since the last unit and save the context.
    ///
    /// Call before [`shutdown`](Self::shutdown) to keep late enrichments.
    pub async fn flush(&self) -> Result<(), PersistError> {
        let absorbed = self.inner.absorb_enrichments(&mut self.inner.context());
        tracing::debug!(absorbed, "Flushing story context");
        self.inner.save_context().await
    }

    /// Refuse new work, cancel queued requests, abort running enrichments
    /// and stop the watchdog.
    pub fn shutdown(&self) {
        self.inner.admission.shutdown();
        let aborted = self.inner.consequences.abort_enrichments();
        if let Some(handle) = self.inner.watchdog().take() {
            handle.abort();
        }
        tracing::info!(aborted_enrichments = aborted, "Story engine shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.admission.is_shut_down()
    }

    /// A copy of the current story context.
    pub fn context_snapshot(&self) -> StoryContext {
        self.inner.context().clone()
    }

    /// Active threads on `branch` (inherited from its ancestry if unseen).
    pub fn active_threads(&self, branch: &BranchKey) -> Vec<NarrativeThread> {
        self.inner
            .context()
            .branch_state_for(branch)
            .ledger
            .active()
            .to_vec()
    }

    pub fn admission_stats(&self) -> AdmissionStats {
        self.inner.admission.stats()
    }
}

impl EngineInner {
    fn context(&self) -> MutexGuard<'_, StoryContext> {
        self.context.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn watchdog(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.watchdog.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one admitted generation to its conclusion.
    async fn produce(
        &self,
        case: CaseNumber,
        branch: BranchKey,
        key: UnitKey,
        history: Vec<DecisionRecord>,
    ) -> UnitOutcome {
        let gathered = self.gather(case, &branch, &history);

        if let Some((decision, resolved)) = &gathered.prior {
            if resolved.origin == ConsequenceOrigin::Derived && self.config.enrich_consequences {
                self.consequences.spawn_enrichment(
                    Arc::clone(&self.generator),
                    decision,
                    resolved,
                    self.config.enrichment_timeout(),
                );
            }
        }

        let personality = &gathered.personality;
        let prior = gathered.prior.as_ref().map(|(decision, resolved)| PriorDecision {
            decision,
            consequence: &resolved.consequence,
        });
        let request = unit_request(&PromptInput {
            case,
            branch: &branch,
            super_path: classify_super_path(&history),
            personality,
            prior,
            state: &gathered.state,
            canon: &self.canon,
            policy: &self.config.threads,
            limits: &self.config.validator,
        });
        let input = ValidationInput {
            case,
            ledger: &gathered.state.ledger,
            facts: &gathered.state.facts,
            canon: &self.canon,
            prior,
            personality,
            policy: &self.config.threads,
        };

        let attempt = tokio::time::timeout(
            self.config.generation_timeout(),
            self.attempt(&key, &branch, request, &input),
        )
        .await;

        let outcome = match attempt {
            Ok(Attempt::Accepted { mut unit, mut warnings }) => {
                if case.is_decision_point() && !unit.decision.as_ref().is_some_and(|d| d.is_well_formed()) {
                    tracing::warn!(unit_key = %key, "Accepted unit lacks a decision, repairing");
                    unit.decision = Some(fallback_decision(&gathered.state));
                    warnings.push("decision point repaired from fallback".to_string());
                }
                tracing::info!(unit_key = %key, branch = %branch, words = unit.word_count(), "Unit accepted");
                UnitOutcome {
                    unit,
                    status: GenerationStatus::Generated,
                    warnings,
                    deduplicated: false,
                }
            }
            Ok(Attempt::Rejected(issues)) => {
                for issue in &issues {
                    tracing::warn!(unit_key = %key, issue = %issue, "Hard consistency issue");
                }
                self.fallback_outcome(case, &branch, &gathered, FallbackReason::HardViolation(issues))
            }
            Ok(Attempt::Failed(e)) => {
                self.fallback_outcome(case, &branch, &gathered, FallbackReason::ExternalFailure(e.to_string()))
            }
            Err(_) => {
                tracing::warn!(
                    unit_key = %key,
                    timeout_ms = self.config.generation_timeout_ms,
                    "Generation timed out"
                );
                self.fallback_outcome(case, &branch, &gathered, FallbackReason::TimedOut)
            }
        };

        self.fold(&branch, &outcome.unit, gathered.prior.as_ref().map(|(_, r)| r));
        self.persist(&key, &outcome).await;
        outcome
    }

    /// Snapshot what an attempt on `branch` is generated and checked against.
    fn gather(&self, case: CaseNumber, branch: &BranchKey, history: &[DecisionRecord]) -> Gathered {
        let context = self.context();
        let state = context.branch_state_for(branch);
        let prior = prior_decision(case, history).map(|decision| {
            let resolved = self.consequences.resolve(decision, history, &context.consequences);
            (decision.clone(), resolved)
        });
        let personality = self
            .consequences
            .aggregate_personality(history, &context.consequences);
        Gathered {
            state,
            prior,
            personality,
        }
    }

    /// Call the generator until it yields a candidate, retrying transient failures.
    async fn attempt(
        &self,
        key: &UnitKey,
        branch: &BranchKey,
        request: GenerationRequest,
        input: &ValidationInput<'_>,
    ) -> Attempt {
        let retry = &self.config.retry;
        let mut attempt = 0u32;
        loop {
            let error = match self.generator.generate(request.clone()).await {
                Ok(payload) => match GeneratedUnit::from_payload(payload, input.case, branch) {
                    Ok(unit) => return self.judge(key, unit, input),
                    Err(e) => GeneratorError::Malformed(e.to_string()),
                },
                Err(e) => e,
            };

            if !error.is_transient() {
                tracing::error!(unit_key = %key, error = %error, "Generator rejected the request");
                return Attempt::Failed(error);
            }
            if attempt >= retry.max_retries {
                tracing::error!(
                    unit_key = %key,
                    attempts = attempt + 1,
                    error = %error,
                    "Generator retries exhausted"
                );
                return Attempt::Failed(error);
            }

            let delay = retry.delay_for(attempt + 1);
            tracing::warn!(
                unit_key = %key,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Generator call failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn judge(&self, key: &UnitKey, unit: GeneratedUnit, input: &ValidationInput<'_>) -> Attempt {
        let report = self.validator.validate(&unit, input);
        if !report.valid {
            return Attempt::Rejected(report.hard().cloned().collect());
        }
        let warnings: Vec<String> = report.soft().map(|i| i.message.clone()).collect();
        for warning in &warnings {
            tracing::warn!(unit_key = %key, issue = %warning, "Soft consistency issue");
        }
        Attempt::Accepted { unit, warnings }
    }

    fn fallback_outcome(
        &self,
        case: CaseNumber,
        branch: &BranchKey,
        gathered: &Gathered,
        reason: FallbackReason,
    ) -> UnitOutcome {
        let prior = gathered.prior.as_ref().map(|(_, r)| &r.consequence);
        let unit = fallback_unit(case, branch, prior, &gathered.state, &self.config.validator);
        let warnings = match &reason {
            FallbackReason::HardViolation(issues) => issues.iter().map(|i| i.message.clone()).collect(),
            FallbackReason::ExternalFailure(message) => vec![message.clone()],
            FallbackReason::TimedOut => vec!["generation timed out".to_string()],
            FallbackReason::Evicted => vec!["generation evicted as stale".to_string()],
        };
        tracing::warn!(case = %case, branch = %branch, reason = ?reason, "Serving fallback unit");
        UnitOutcome {
            unit,
            status: GenerationStatus::Fallback(reason),
            warnings,
            deduplicated: false,
        }
    }

    /// Fold a concluded unit into the live context.
    fn fold(&self, branch: &BranchKey, unit: &GeneratedUnit, prior: Option<&ResolvedConsequence>) {
        let mut context = self.context();
        let report = context
            .branch_mut(branch)
            .fold(unit, &self.config.threads, &self.canon);

        if let Some(resolved) = prior {
            self.consequences
                .remember(&resolved.key, &resolved.consequence, &mut context.consequences);
        }
        self.absorb_enrichments(&mut context);

        if !report.auto_resolved.is_empty() {
            tracing::warn!(
                branch = %branch,
                count = report.auto_resolved.len(),
                "Threads auto-resolved at capacity"
            );
        }
        for identity in &report.newly_overdue {
            tracing::warn!(branch = %branch, thread = %identity, "Thread escalated to overdue");
        }
        tracing::debug!(
            branch = %branch,
            merged = report.merged,
            dropped_zombies = report.dropped_zombies,
            archived = report.archived,
            "Unit folded"
        );
    }

    /// Remember every completed enrichment. Returns how many there were.
    fn absorb_enrichments(&self, context: &mut StoryContext) -> usize {
        let enriched = self.consequences.drain_enrichments();
        for (key, consequence) in &enriched {
            tracing::debug!(key = %key, "Folding enriched consequence");
            self.consequences
                .remember(key, consequence, &mut context.consequences);
        }
        enriched.len()
    }

    /// Save the unit (if generated) and the context. Failures are logged only.
    async fn persist(&self, key: &UnitKey, outcome: &UnitOutcome) {
        if outcome.status == GenerationStatus::Generated {
            if let Err(e) = self.store.save_unit(key, &outcome.unit).await {
                tracing::warn!(unit_key = %key, error = %e, "Failed to save unit");
            }
        }
        if let Err(e) = self.save_context().await {
            tracing::warn!(unit_key = %key, error = %e, "Failed to save story context");
        }
    }

    /// Save the live context as it stands once earlier saves are done.
    ///
    /// The snapshot is taken under the save lock, so the last save always
    /// holds every fold that finished before it started.
    async fn save_context(&self) -> Result<(), PersistError> {
        let _guard = self.save_lock.lock().await;
        let snapshot = self.context().clone();
        self.store.save_context(&snapshot).await
    }
}

/// The decision that opened `case`'s chapter; the latest record wins.
fn prior_decision(case: CaseNumber, history: &[DecisionRecord]) -> Option<&DecisionRecord> {
    if case.chapter <= 1 {
        return None;
    }
    history
        .iter()
        .filter(|d| d.chapter() == Some(case.chapter - 1))
        .last()
}

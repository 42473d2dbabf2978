//! Engine configuration.
//!
//! Every struct here has sensible defaults and deserializes with missing
//! fields filled in, so hosts can keep a partial JSON file next to the story.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for a [`StoryEngine`](crate::StoryEngine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub admission: AdmissionConfig,
    pub retry: RetryConfig,
    pub threads: ThreadPolicy,
    pub validator: ValidatorConfig,

    /// Hard limit on one whole generation attempt, retries included.
    pub generation_timeout_ms: u64,

    /// Whether derived consequences are enriched by the generator in the background.
    pub enrich_consequences: bool,

    /// Limit on one enrichment call.
    pub enrichment_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            admission: AdmissionConfig::default(),
            retry: RetryConfig::default(),
            threads: ThreadPolicy::default(),
            validator: ValidatorConfig::default(),
            generation_timeout_ms: 180_000,
            enrich_consequences: true,
            enrichment_timeout_ms: 15_000,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_admission(mut self, admission: AdmissionConfig) -> Self {
        self.admission = admission;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_threads(mut self, threads: ThreadPolicy) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_validator(mut self, validator: ValidatorConfig) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_enrichment(mut self, enabled: bool) -> Self {
        self.enrich_consequences = enabled;
        self
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_millis(self.generation_timeout_ms)
    }

    pub fn enrichment_timeout(&self) -> Duration {
        Duration::from_millis(self.enrichment_timeout_ms)
    }
}

// =============================================================================
// Admission
// =============================================================================

/// Limits of the generation admission controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Concurrent generations allowed (K).
    pub max_concurrent: usize,

    /// Requests allowed to wait for a slot; beyond this they are rejected.
    pub max_queue_depth: usize,

    /// Hard limit on a single admitted job.
    pub slot_timeout_ms: u64,

    /// Age after which an active entry no longer absorbs duplicates and may be evicted.
    pub stale_after_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_queue_depth: 8,
            slot_timeout_ms: 240_000,
            stale_after_ms: 300_000,
        }
    }
}

impl AdmissionConfig {
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    pub fn with_slot_timeout(mut self, timeout: Duration) -> Self {
        self.slot_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after_ms = stale_after.as_millis() as u64;
        self
    }

    pub fn slot_timeout(&self) -> Duration {
        Duration::from_millis(self.slot_timeout_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

// =============================================================================
// Retry
// =============================================================================

/// Retry behavior for transient generator failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 = a single attempt).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Cap on the exponential delay.
    pub max_delay_ms: u64,
    /// Jitter as a fraction (0.0-1.0) of the delay, applied in both directions.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 1000,
            max_delay_ms: 15_000,
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (1-based): exponential, capped, jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let exponential = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
        let capped = exponential.min(self.max_delay_ms);

        let jitter_range = (capped as f64 * self.jitter_factor) as i64;
        let millis = if jitter_range > 0 {
            let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
            (capped as i64 + jitter).max(0) as u64
        } else {
            capped
        };
        Duration::from_millis(millis)
    }
}

// =============================================================================
// Threads
// =============================================================================

/// Weights of the fuzzy thread similarity score. They sum to 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityWeights {
    pub thread_type: f32,
    pub characters: f32,
    pub action: f32,
    /// Halved when neither thread names a location.
    pub location: f32,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            thread_type: 0.30,
            characters: 0.30,
            action: 0.25,
            location: 0.15,
        }
    }
}

/// Tunables of the narrative thread ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPolicy {
    /// Active thread budget.
    pub max_active: usize,

    /// Share of the non-critical budget reserved for normal-urgency threads.
    pub normal_share: f32,

    /// Fuzzy duplicates are merged at or above this similarity.
    pub fuzzy_threshold: f32,

    /// Fuzzy merging only runs once this many threads are active.
    pub fuzzy_min_active: usize,

    pub weights: SimilarityWeights,

    /// Consecutive acknowledgments without progress that make a thread overdue.
    pub overdue_after: u32,

    /// Chapters an obligation may stay open before the validator flags it.
    pub stale_after_chapters: u32,

    /// Chapters an archived thread is retained after it closed.
    pub archive_retention_chapters: u32,

    /// Maximum archive size.
    pub max_archived: usize,
}

impl Default for ThreadPolicy {
    fn default() -> Self {
        Self {
            max_active: 20,
            normal_share: 0.6,
            fuzzy_threshold: 0.75,
            fuzzy_min_active: 10,
            weights: SimilarityWeights::default(),
            overdue_after: 2,
            stale_after_chapters: 2,
            archive_retention_chapters: 4,
            max_archived: 60,
        }
    }
}

impl ThreadPolicy {
    pub fn with_max_active(mut self, max_active: usize) -> Self {
        self.max_active = max_active;
        self
    }

    pub fn with_fuzzy_threshold(mut self, threshold: f32) -> Self {
        self.fuzzy_threshold = threshold;
        self
    }

    pub fn with_fuzzy_min_active(mut self, min_active: usize) -> Self {
        self.fuzzy_min_active = min_active;
        self
    }

    pub fn with_max_archived(mut self, max_archived: usize) -> Self {
        self.max_archived = max_archived;
        self
    }
}

// =============================================================================
// Validator
// =============================================================================

/// Tunables of the consistency validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Treat logical impossibilities as hard issues.
    pub strict_logic: bool,

    /// How far into the narrative the player-agency check looks.
    pub agency_window_chars: usize,

    pub min_narrative_words: usize,
    pub max_title_chars: usize,
    pub max_bridge_chars: usize,
    pub max_previously_chars: usize,

    /// Accepted board word count range.
    pub min_board_words: usize,
    pub max_board_words: usize,
    pub max_board_word_len: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            strict_logic: false,
            agency_window_chars: 1200,
            min_narrative_words: 300,
            max_title_chars: 80,
            max_bridge_chars: 400,
            max_previously_chars: 1200,
            min_board_words: 8,
            max_board_words: 16,
            max_board_word_len: 12,
        }
    }
}

impl ValidatorConfig {
    pub fn with_strict_logic(mut self, strict: bool) -> Self {
        self.strict_logic = strict;
        self
    }

    pub fn with_min_narrative_words(mut self, words: usize) -> Self {
        self.min_narrative_words = words;
        self
    }
}

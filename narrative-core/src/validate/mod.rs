//! Consistency validation of candidate units.
//!
//! The validator runs a fixed battery of independent checks over a
//! candidate and the branch state it was generated from. Each check emits
//! zero or more [`ConsistencyIssue`]s through the [`RuleBook`]; the unit is
//! accepted only when none of them is hard.

mod rules;

pub use rules::{ConsistencyIssue, Rule, RuleBook, RuleId, Severity};

use crate::canon::StoryCanon;
use crate::config::{ThreadPolicy, ValidatorConfig};
use crate::consequence::{consequence_keywords, Archetype, Consequence, PersonalityProfile};
use crate::facts::BranchFacts;
use crate::path::{lean_counts, words, CaseNumber, DecisionRecord};
use crate::threads::{stem, ThreadLedger, ThreadProgress};
use crate::unit::GeneratedUnit;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static::lazy_static! {
    static ref SENTENCE_END: Regex = Regex::new(r"[.!?]+\s+|\n+").expect("valid regex");
}

/// Words that explain why a removed character still appears.
const PRESENCE_EXPLANATIONS: &[&str] = &[
    "memory", "memories", "remember", "remembered", "remembering", "recalled", "flashback",
    "photo", "photograph", "picture", "portrait", "ghost", "dream", "dreamed", "dreamt", "grave",
    "funeral", "late", "dead", "death", "died", "body", "corpse", "memorial", "voicemail",
    "letter", "tape", "recording",
];

/// Vague quantities that must not stand in for a canonical duration.
const VAGUE_QUANTITIES: &[&str] = &[
    "a few", "a couple of", "several", "many", "some", "countless", "a number of",
];

/// Keyword stems shorter than this only match whole words.
const MIN_PREFIX_STEM: usize = 5;

const NUMBER_WORDS: &[(&str, u32)] = &[
    ("one", 1), ("two", 2), ("three", 3), ("four", 4), ("five", 5), ("six", 6), ("seven", 7),
    ("eight", 8), ("nine", 9), ("ten", 10), ("eleven", 11), ("twelve", 12), ("thirteen", 13),
    ("fourteen", 14), ("fifteen", 15), ("sixteen", 16), ("seventeen", 17), ("eighteen", 18),
    ("nineteen", 19), ("twenty", 20), ("thirty", 30), ("forty", 40), ("fifty", 50),
];

/// The previous chapter's decision and its resolved consequence.
#[derive(Debug, Clone, Copy)]
pub struct PriorDecision<'a> {
    pub decision: &'a DecisionRecord,
    pub consequence: &'a Consequence,
}

/// Everything a candidate is checked against.
#[derive(Debug, Clone, Copy)]
pub struct ValidationInput<'a> {
    pub case: CaseNumber,
    pub ledger: &'a ThreadLedger,
    pub facts: &'a BranchFacts,
    pub canon: &'a StoryCanon,
    pub prior: Option<PriorDecision<'a>>,
    pub personality: &'a PersonalityProfile,
    pub policy: &'a ThreadPolicy,
}

/// Outcome of validating one candidate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub issues: Vec<ConsistencyIssue>,
}

impl ValidationReport {
    pub fn hard(&self) -> impl Iterator<Item = &ConsistencyIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Hard)
    }

    pub fn soft(&self) -> impl Iterator<Item = &ConsistencyIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Soft)
    }
}

/// Runs the consistency checks.
#[derive(Debug, Clone)]
pub struct ConsistencyValidator {
    book: RuleBook,
    config: ValidatorConfig,
}

impl Default for ConsistencyValidator {
    fn default() -> Self {
        Self::new(ValidatorConfig::default())
    }
}

impl ConsistencyValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self {
            book: RuleBook::default().with_strict_logic(config.strict_logic),
            config,
        }
    }

    /// Replace the rule book.
    pub fn with_rule_book(mut self, book: RuleBook) -> Self {
        self.book = book;
        self
    }

    pub fn rule_book(&self) -> &RuleBook {
        &self.book
    }

    pub fn is_hard_issue(&self, issue: &ConsistencyIssue) -> bool {
        self.book.is_hard_issue(issue)
    }

    /// Check a candidate unit.
    pub fn validate(&self, unit: &GeneratedUnit, input: &ValidationInput<'_>) -> ValidationReport {
        let mut issues = Vec::new();
        self.check_identity(unit, input, &mut issues);
        self.check_agency(unit, input, &mut issues);
        self.check_logic(unit, input, &mut issues);
        self.check_threads(unit, input, &mut issues);
        self.check_timeline(unit, input, &mut issues);
        self.check_personality(unit, input, &mut issues);
        self.check_structure(unit, input, &mut issues);

        let valid = !issues.iter().any(|i| self.book.is_hard_issue(i));
        tracing::debug!(
            case = %input.case,
            issues = issues.len(),
            valid,
            "Validated candidate unit"
        );
        ValidationReport { valid, issues }
    }

    // =========================================================================
    // Identity integrity
    // =========================================================================

    fn check_identity(&self, unit: &GeneratedUnit, input: &ValidationInput<'_>, issues: &mut Vec<ConsistencyIssue>) {
        let text = prose(unit);

        for name in &input.canon.names {
            for variant in &name.variants {
                if variant == &name.canonical {
                    continue;
                }
                if let Some(re) = word_regex(variant, false) {
                    if re.is_match(&text) {
                        issues.push(self.book.issue(
                            RuleId::IdentityIntegrity,
                            &format!("\"{}\" should be spelled \"{}\"", variant, name.canonical),
                        ));
                    }
                }
            }
        }

        for fixed in &input.canon.fixed_attributes {
            let Some(subject) = word_regex(&fixed.subject, true) else {
                continue;
            };
            let contradictions: Vec<(String, Regex)> = fixed
                .contradictions
                .iter()
                .filter_map(|c| word_regex(c, true).map(|re| (c.clone(), re)))
                .collect();

            for sentence in sentences(&text) {
                if !subject.is_match(sentence) {
                    continue;
                }
                if let Some((phrase, _)) = contradictions.iter().find(|(_, re)| re.is_match(sentence)) {
                    issues.push(self.book.issue(
                        RuleId::IdentityIntegrity,
                        &format!(
                            "{}'s {} is {}, not \"{}\"",
                            fixed.subject, fixed.attribute, fixed.value, phrase
                        ),
                    ));
                    break;
                }
            }
        }
    }

    // =========================================================================
    // Player agency
    // =========================================================================

    fn check_agency(&self, unit: &GeneratedUnit, input: &ValidationInput<'_>, issues: &mut Vec<ConsistencyIssue>) {
        if input.case.subchapter != 1 || input.case.chapter <= 1 {
            return;
        }
        let Some(prior) = input.prior else {
            return;
        };

        let keywords = consequence_keywords(prior.consequence, prior.decision);
        if keywords.is_empty() {
            return;
        }

        let opening: String = unit
            .narrative
            .chars()
            .take(self.config.agency_window_chars)
            .collect();
        let opening = format!("{} {}", unit.bridge_text, opening);
        let stems: Vec<String> = words(&opening).map(|w| stem(&w)).collect();

        // Short stems must match exactly: "hat" is not "hatter".
        let echoed = keywords.iter().any(|k| {
            let k = stem(k);
            let prefix_ok = k.chars().count() >= MIN_PREFIX_STEM;
            stems.iter().any(|w| *w == k || (prefix_ok && w.starts_with(&k)))
        });
        if !echoed {
            let shown: Vec<&str> = keywords.iter().take(5).map(String::as_str).collect();
            issues.push(self.book.issue(
                RuleId::PlayerAgency,
                &format!(
                    "option {} at {} not reflected in the opening (expected one of: {})",
                    prior.decision.option_key,
                    prior.decision.locator_id,
                    shown.join(", ")
                ),
            ));
        }
    }

    // =========================================================================
    // Logical impossibility
    // =========================================================================

    fn check_logic(&self, unit: &GeneratedUnit, input: &ValidationInput<'_>, issues: &mut Vec<ConsistencyIssue>) {
        for revelation in &unit.revelations {
            if input.facts.has_revelation(revelation) {
                issues.push(self.book.issue(
                    RuleId::LogicalImpossibility,
                    &format!("\"{}\" was already revealed", revelation.trim()),
                ));
            }
        }

        for removed in &input.facts.removed_characters {
            let Some(name) = word_regex(&removed.name, true) else {
                continue;
            };
            let acting = sentences(&unit.narrative).any(|sentence| {
                name.is_match(sentence) && !words(sentence).any(|w| PRESENCE_EXPLANATIONS.contains(&w.as_str()))
            });
            if acting {
                issues.push(self.book.issue(
                    RuleId::LogicalImpossibility,
                    &format!(
                        "{} left the story in chapter {} but appears without explanation",
                        removed.name, removed.chapter
                    ),
                ));
            }
        }
    }

    // =========================================================================
    // Threads
    // =========================================================================

    fn check_threads(&self, unit: &GeneratedUnit, input: &ValidationInput<'_>, issues: &mut Vec<ConsistencyIssue>) {
        let declared: Vec<(String, &crate::threads::ThreadDeclaration)> = unit
            .threads
            .iter()
            .map(|d| (ThreadLedger::identity_key(d, input.case, input.canon), d))
            .collect();

        for identity in input.ledger.overdue() {
            let progressed = declared.iter().any(|(id, d)| {
                id == identity && (d.status.is_terminal() || d.progress == ThreadProgress::Advanced)
            });
            if !progressed {
                let description = input
                    .ledger
                    .find(identity)
                    .map(|t| t.description.as_str())
                    .unwrap_or(identity);
                issues.push(self.book.issue(
                    RuleId::ThreadOverdue,
                    &format!(
                        "\"{}\" (acknowledged {} times)",
                        description,
                        input.ledger.acknowledgments(identity)
                    ),
                ));
            }
        }

        for thread in input.ledger.stale(input.case.chapter, input.policy) {
            let Some(identity) = thread.normalized_id.as_deref() else {
                continue;
            };
            if input.ledger.is_overdue(identity) {
                continue;
            }
            if !declared.iter().any(|(id, _)| id == identity) {
                issues.push(self.book.issue(
                    RuleId::ThreadStale,
                    &format!(
                        "{} \"{}\" open since chapter {}",
                        thread.thread_type.name(),
                        thread.description,
                        thread.opened_chapter
                    ),
                ));
            }
        }
    }

    // =========================================================================
    // Timeline
    // =========================================================================

    fn check_timeline(&self, unit: &GeneratedUnit, input: &ValidationInput<'_>, issues: &mut Vec<ConsistencyIssue>) {
        for duration in &input.canon.durations {
            let Some(cue) = word_regex(&duration.cue, true) else {
                continue;
            };
            let unit_word = duration.unit.trim_end_matches('s');
            let vague_pattern = format!(
                r"(?i)\b(?:{})\s+{}s?\b",
                VAGUE_QUANTITIES
                    .iter()
                    .map(|v| regex::escape(v))
                    .collect::<Vec<_>>()
                    .join("|"),
                regex::escape(unit_word)
            );
            let number_pattern = format!(
                r"(?i)\b([0-9]+|[a-z]+(?:-[a-z]+)?)[\s-]+{}s?\b",
                regex::escape(unit_word)
            );
            let (Ok(vague), Ok(number)) = (Regex::new(&vague_pattern), Regex::new(&number_pattern)) else {
                continue;
            };

            for sentence in sentences(&unit.narrative) {
                if !cue.is_match(sentence) {
                    continue;
                }
                if let Some(m) = vague.find(sentence) {
                    issues.push(self.book.issue(
                        RuleId::TimelineExactness,
                        &format!(
                            "\"{}\" should be exactly {} {} ({})",
                            m.as_str(),
                            duration.value,
                            duration.unit,
                            duration.cue
                        ),
                    ));
                    continue;
                }
                for caps in number.captures_iter(sentence) {
                    let Some(stated) = caps.get(1).and_then(|m| parse_number(m.as_str())) else {
                        continue;
                    };
                    if stated != duration.value {
                        issues.push(self.book.issue(
                            RuleId::TimelineExactness,
                            &format!(
                                "{} stated as {} {}, established as {}",
                                duration.cue, stated, duration.unit, duration.value
                            ),
                        ));
                    }
                }
            }
        }
    }

    // =========================================================================
    // Personality
    // =========================================================================

    fn check_personality(&self, unit: &GeneratedUnit, input: &ValidationInput<'_>, issues: &mut Vec<ConsistencyIssue>) {
        if unit
            .emotional_state
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty())
        {
            return;
        }

        let (aggressive, methodical) = lean_counts(&unit.narrative);
        let (aligned, opposing, opposite) = match input.personality.archetype {
            Archetype::Aggressive => (aggressive, methodical, "methodical"),
            Archetype::Methodical => (methodical, aggressive, "aggressive"),
            Archetype::Balanced => return,
        };
        if opposing >= 3 && opposing >= aligned * 2 {
            issues.push(self.book.issue(
                RuleId::PersonalityAlignment,
                &format!(
                    "{} detective written as {} ({} vs {} cues) with no emotional state given",
                    input.personality.archetype.name(),
                    opposite,
                    opposing,
                    aligned
                ),
            ));
        }
    }

    // =========================================================================
    // Structure
    // =========================================================================

    fn check_structure(&self, unit: &GeneratedUnit, input: &ValidationInput<'_>, issues: &mut Vec<ConsistencyIssue>) {
        let config = &self.config;
        let mut structure = |detail: String| issues.push(self.book.issue(RuleId::Structure, &detail));

        let words = unit.word_count();
        if words < config.min_narrative_words {
            structure(format!(
                "narrative has {} words, expected at least {}",
                words, config.min_narrative_words
            ));
        }

        let title_len = unit.title.trim().chars().count();
        if title_len == 0 || title_len > config.max_title_chars {
            structure(format!("title length {} outside 1..={}", title_len, config.max_title_chars));
        }
        if unit.bridge_text.chars().count() > config.max_bridge_chars {
            structure(format!("bridge text longer than {} characters", config.max_bridge_chars));
        }
        if unit.previously.chars().count() > config.max_previously_chars {
            structure(format!("recap longer than {} characters", config.max_previously_chars));
        }

        let board = unit.board_words.len();
        if board < config.min_board_words || board > config.max_board_words {
            structure(format!(
                "{} board words, expected {}..={}",
                board, config.min_board_words, config.max_board_words
            ));
        }
        for word in &unit.board_words {
            if word.is_empty()
                || !word.chars().all(|c| c.is_ascii_alphabetic())
                || word.chars().count() > config.max_board_word_len
            {
                structure(format!("board word \"{}\" is not a single short word", word));
            }
        }

        match (&unit.decision, input.case.is_decision_point()) {
            (None, true) => structure("decision point missing".to_string()),
            (Some(decision), true) if !decision.is_well_formed() => {
                structure("decision point must offer options A and B with titles".to_string())
            }
            (Some(_), false) => structure("decision offered before the final subchapter".to_string()),
            _ => {}
        }
    }
}

/// All reader-visible prose of a unit.
fn prose(unit: &GeneratedUnit) -> String {
    [
        unit.title.as_str(),
        unit.bridge_text.as_str(),
        unit.previously.as_str(),
        unit.narrative.as_str(),
    ]
    .join("\n")
}

fn sentences(text: &str) -> impl Iterator<Item = &str> {
    SENTENCE_END
        .split(text)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Whole-word matcher for a literal phrase.
fn word_regex(phrase: &str, case_insensitive: bool) -> Option<Regex> {
    let phrase = phrase.trim();
    if phrase.is_empty() {
        return None;
    }
    let flags = if case_insensitive { "(?i)" } else { "" };
    Regex::new(&format!(r"{}\b{}\b", flags, regex::escape(phrase))).ok()
}

fn parse_number(token: &str) -> Option<u32> {
    if let Ok(n) = token.parse() {
        return Some(n);
    }
    let lower = token.to_lowercase();
    // "twenty-two"
    if let Some((tens, ones)) = lower.split_once('-') {
        let tens = number_word(tens).filter(|n| *n >= 20 && n % 10 == 0)?;
        let ones = number_word(ones).filter(|n| *n < 10)?;
        return Some(tens + ones);
    }
    number_word(&lower)
}

fn number_word(word: &str) -> Option<u32> {
    NUMBER_WORDS
        .iter()
        .find(|(w, _)| *w == word)
        .map(|(_, n)| *n)
}

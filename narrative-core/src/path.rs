//! Branch identity derived from the player's decision history.
//!
//! Every chapter has three subchapters; the last one ends in a binary
//! decision. A branch key is the string of option letters chosen in the
//! chapters *before* a target chapter, so two players who made the same
//! choices so far always share generated content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Sentinel branch key used before any decision has been made.
pub const ROOT_BRANCH: &str = "ROOT";

/// Subchapters per chapter; the last one carries the decision.
pub const SUBCHAPTERS_PER_CHAPTER: u8 = 3;

/// One of the two options offered at a decision point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OptionKey {
    A,
    B,
}

impl OptionKey {
    /// The option letter.
    pub fn letter(&self) -> char {
        match self {
            OptionKey::A => 'A',
            OptionKey::B => 'B',
        }
    }

    /// Parse a single option letter, case-insensitively.
    pub fn from_letter(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'A' => Some(OptionKey::A),
            'B' => Some(OptionKey::B),
            _ => None,
        }
    }
}

impl fmt::Display for OptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// A chapter/subchapter position, written like `"003B"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CaseNumber {
    pub chapter: u32,
    pub subchapter: u8,
}

impl CaseNumber {
    /// Create a case number, rejecting positions outside the story grid.
    pub fn new(chapter: u32, subchapter: u8) -> Option<Self> {
        if chapter == 0 || subchapter == 0 || subchapter > SUBCHAPTERS_PER_CHAPTER {
            return None;
        }
        Some(Self {
            chapter,
            subchapter,
        })
    }

    /// Parse `"003B"`-style locators. Leading zeros are optional.
    pub fn parse(locator: &str) -> Option<Self> {
        let locator = locator.trim();
        let letter = locator.chars().last()?;
        let digits = &locator[..locator.len() - letter.len_utf8()];
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let chapter: u32 = digits.parse().ok()?;
        let subchapter = match letter.to_ascii_uppercase() {
            'A' => 1,
            'B' => 2,
            'C' => 3,
            _ => return None,
        };
        Self::new(chapter, subchapter)
    }

    /// Whether this subchapter ends in a decision.
    pub fn is_decision_point(&self) -> bool {
        self.subchapter == SUBCHAPTERS_PER_CHAPTER
    }

    fn letter(&self) -> char {
        (b'A' + self.subchapter - 1) as char
    }
}

impl fmt::Display for CaseNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}{}", self.chapter, self.letter())
    }
}

/// A decision the player made at the end of a chapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Case number of the decision subchapter, e.g. `"002C"`.
    pub locator_id: String,
    pub option_key: OptionKey,
    #[serde(default)]
    pub option_title: Option<String>,
    #[serde(default)]
    pub option_focus: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DecisionRecord {
    /// Record a decision made now.
    pub fn new(locator_id: impl Into<String>, option_key: OptionKey) -> Self {
        Self {
            locator_id: locator_id.into(),
            option_key,
            option_title: None,
            option_focus: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach the option's title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.option_title = Some(title.into());
        self
    }

    /// Attach the option's focus text.
    pub fn with_focus(mut self, focus: impl Into<String>) -> Self {
        self.option_focus = Some(focus.into());
        self
    }

    /// The chapter in which this decision was made, if the locator parses.
    pub fn chapter(&self) -> Option<u32> {
        CaseNumber::parse(&self.locator_id).map(|c| c.chapter)
    }

    /// Title and focus joined, for keyword heuristics.
    pub fn option_text(&self) -> String {
        [self.option_title.as_deref(), self.option_focus.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Deterministic identity of a decision path up to a chapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchKey(String);

impl BranchKey {
    /// The key shared by everyone before the first decision.
    pub fn root() -> Self {
        Self(ROOT_BRANCH.to_string())
    }

    /// Whether this is the root sentinel.
    pub fn is_root(&self) -> bool {
        self.0 == ROOT_BRANCH
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Keys of the enclosing branches, nearest first, ending at root.
    pub fn ancestors(&self) -> Vec<BranchKey> {
        if self.is_root() {
            return Vec::new();
        }
        let mut out: Vec<BranchKey> = (1..self.0.len())
            .rev()
            .map(|len| BranchKey(self.0[..len].to_string()))
            .collect();
        out.push(BranchKey::root());
        out
    }

    /// Option letters chosen along this branch.
    pub fn choices(&self) -> Vec<OptionKey> {
        if self.is_root() {
            return Vec::new();
        }
        self.0.chars().filter_map(OptionKey::from_letter).collect()
    }
}

impl fmt::Display for BranchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolve the branch key for `target_chapter`.
///
/// Only decisions made in chapters strictly before the target count. When a
/// chapter appears more than once in the history the latest record wins.
/// Records whose locator does not parse are ignored.
pub fn resolve_branch_key(target_chapter: u32, history: &[DecisionRecord]) -> BranchKey {
    let mut by_chapter: BTreeMap<u32, OptionKey> = BTreeMap::new();
    for decision in history {
        if let Some(chapter) = decision.chapter() {
            if chapter < target_chapter {
                by_chapter.insert(chapter, decision.option_key);
            }
        }
    }

    if by_chapter.is_empty() {
        return BranchKey::root();
    }
    BranchKey(by_chapter.values().map(OptionKey::letter).collect())
}

/// Stable key of one generated cell: case number plus branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitKey(String);

impl UnitKey {
    pub fn new(case: CaseNumber, branch: &BranchKey) -> Self {
        Self(format!("{case}:{branch}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Play-style lexicon and super paths
// =============================================================================

/// Which way a piece of text leans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lean {
    Aggressive,
    Methodical,
    Neutral,
}

const AGGRESSIVE_WORDS: &[&str] = &[
    "confront", "force", "attack", "press", "demand", "chase", "storm", "threaten", "break",
    "raid", "burst", "grab", "punch", "shoot", "accuse", "corner", "intimidate", "rush", "kick",
    "smash", "bluff",
];

const METHODICAL_WORDS: &[&str] = &[
    "investigate", "examine", "wait", "observe", "research", "analyze", "analyse", "follow",
    "study", "review", "listen", "search", "document", "verify", "trace", "watch", "question",
    "patient", "careful", "records", "evidence", "compare",
];

/// Count aggressive and methodical lexicon hits in `text`.
pub fn lean_counts(text: &str) -> (usize, usize) {
    let mut aggressive = 0;
    let mut methodical = 0;
    for word in words(text) {
        if AGGRESSIVE_WORDS.iter().any(|w| word.starts_with(w)) {
            aggressive += 1;
        } else if METHODICAL_WORDS.iter().any(|w| word.starts_with(w)) {
            methodical += 1;
        }
    }
    (aggressive, methodical)
}

/// Classify a short option text by its dominant lexicon.
pub fn lean_of(text: &str) -> Lean {
    let (aggressive, methodical) = lean_counts(text);
    match aggressive.cmp(&methodical) {
        std::cmp::Ordering::Greater => Lean::Aggressive,
        std::cmp::Ordering::Less => Lean::Methodical,
        std::cmp::Ordering::Equal => Lean::Neutral,
    }
}

pub(crate) fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
}

/// Coarse play style over the whole playthrough.
///
/// Used where a fine-grained branch key would churn state that should stay
/// stable for a playthrough's overall flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuperPath {
    Aggressive,
    Methodical,
    Balanced,
}

impl SuperPath {
    pub fn name(&self) -> &'static str {
        match self {
            SuperPath::Aggressive => "aggressive",
            SuperPath::Methodical => "methodical",
            SuperPath::Balanced => "balanced",
        }
    }
}

/// Collapse a full decision history into a [`SuperPath`].
///
/// A style wins when at least two decisions lean its way and they make up
/// two thirds of the decisions that lean at all.
pub fn classify_super_path(history: &[DecisionRecord]) -> SuperPath {
    let mut aggressive = 0usize;
    let mut methodical = 0usize;
    for decision in history {
        match lean_of(&decision.option_text()) {
            Lean::Aggressive => aggressive += 1,
            Lean::Methodical => methodical += 1,
            Lean::Neutral => {}
        }
    }

    let leaning = aggressive + methodical;
    if aggressive >= 2 && aggressive * 3 >= leaning * 2 {
        SuperPath::Aggressive
    } else if methodical >= 2 && methodical * 3 >= leaning * 2 {
        SuperPath::Methodical
    } else {
        SuperPath::Balanced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(chapter: u32, key: OptionKey) -> DecisionRecord {
        DecisionRecord::new(format!("{chapter:03}C"), key)
    }

    #[test]
    fn test_case_number_roundtrip() {
        let case = CaseNumber::new(7, 2).unwrap();
        assert_eq!(case.to_string(), "007B");
        assert_eq!(CaseNumber::parse("007B"), Some(case));
        assert_eq!(CaseNumber::parse("12c"), CaseNumber::new(12, 3));
        assert!(CaseNumber::parse("003D").is_none());
        assert!(CaseNumber::parse("C").is_none());
        assert!(CaseNumber::new(0, 1).is_none());
    }

    #[test]
    fn test_root_before_any_decision() {
        assert!(resolve_branch_key(1, &[]).is_root());
        let history = vec![decision(1, OptionKey::A)];
        assert!(resolve_branch_key(1, &history).is_root());
        assert_eq!(resolve_branch_key(2, &history).as_str(), "A");
    }

    #[test]
    fn test_order_independent_and_latest_wins() {
        let history = vec![
            decision(2, OptionKey::B),
            decision(1, OptionKey::A),
            decision(1, OptionKey::B),
        ];
        assert_eq!(resolve_branch_key(3, &history).as_str(), "BB");
    }

    #[test]
    fn test_unparseable_locator_ignored() {
        let history = vec![
            DecisionRecord::new("intro", OptionKey::A),
            decision(1, OptionKey::B),
        ];
        assert_eq!(resolve_branch_key(2, &history).as_str(), "B");
    }

    #[test]
    fn test_ancestors() {
        let key = resolve_branch_key(
            4,
            &[
                decision(1, OptionKey::A),
                decision(2, OptionKey::B),
                decision(3, OptionKey::A),
            ],
        );
        let ancestors: Vec<_> = key.ancestors().iter().map(|k| k.to_string()).collect();
        assert_eq!(ancestors, vec!["AB", "A", "ROOT"]);
        assert!(BranchKey::root().ancestors().is_empty());
        assert_eq!(key.choices(), vec![OptionKey::A, OptionKey::B, OptionKey::A]);
    }

    #[test]
    fn test_unit_key_format() {
        let case = CaseNumber::new(2, 1).unwrap();
        let key = UnitKey::new(case, &BranchKey::root());
        assert_eq!(key.as_str(), "002A:ROOT");
    }

    #[test]
    fn test_super_path() {
        assert_eq!(classify_super_path(&[]), SuperPath::Balanced);

        let aggressive = vec![
            decision(1, OptionKey::A).with_title("Confront the bartender"),
            decision(2, OptionKey::A).with_title("Storm the warehouse"),
            decision(3, OptionKey::B).with_title("Review the ledger"),
        ];
        assert_eq!(classify_super_path(&aggressive), SuperPath::Aggressive);

        let mixed = vec![
            decision(1, OptionKey::A).with_title("Confront the bartender"),
            decision(2, OptionKey::B).with_title("Examine the letters"),
        ];
        assert_eq!(classify_super_path(&mixed), SuperPath::Balanced);
    }
}

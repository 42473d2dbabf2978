//! Normalized thread identity.
//!
//! Two declarations describe the same obligation when they reduce to the same
//! `(type, characters, action, location, time)` tuple. Surface verbs and
//! places are mapped onto a representative of a small synonym group after
//! crude suffix stripping, so "will see Sarah tonight" and "meeting Sarah at
//! midnight" land on the same identity.

use super::thread::{NarrativeThread, ThreadType};
use crate::config::SimilarityWeights;
use crate::path::words;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Verb groups; the first member is the canonical token.
const ACTION_GROUPS: &[&[&str]] = &[
    &["meet", "met", "see", "saw", "seen", "visit", "arrive", "join", "rendezvous", "encounter"],
    &["tell", "told", "inform", "warn", "explain", "reveal", "confess", "admit"],
    &["find", "found", "locate", "discover", "track", "uncover"],
    &["deliver", "bring", "brought", "hand", "give", "gave", "return", "send", "sent"],
    &["confront", "face", "accuse", "challenge"],
    &["call", "phone", "contact"],
    &["protect", "guard", "shield", "save", "hide", "hid"],
    &["investigate", "search", "examine", "inspect", "check", "probe"],
    &["pay", "paid", "repay", "settle", "owe"],
    &["kill", "murder", "shoot", "shot", "stab", "strangle"],
];

/// Location groups; the first member is the canonical token.
const LOCATION_GROUPS: &[&[&str]] = &[
    &["office", "precinct", "station", "headquarters", "desk"],
    &["bar", "pub", "tavern", "saloon", "club", "lounge", "speakeasy"],
    &["home", "house", "apartment", "flat"],
    &["dock", "pier", "wharf", "harbor", "harbour", "port", "waterfront"],
    &["church", "chapel", "cathedral"],
    &["warehouse", "depot", "storehouse"],
    &["park", "garden", "square"],
    &["hospital", "clinic", "morgue"],
    &["diner", "cafe", "restaurant"],
    &["bridge", "overpass"],
    &["alley", "alleyway", "backstreet"],
];

/// Coarse time of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeBucket {
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl TimeBucket {
    pub fn name(&self) -> &'static str {
        match self {
            TimeBucket::Morning => "morning",
            TimeBucket::Afternoon => "afternoon",
            TimeBucket::Evening => "evening",
            TimeBucket::Night => "night",
        }
    }

    fn of_word(word: &str) -> Option<Self> {
        match word {
            "morning" | "dawn" | "sunrise" | "breakfast" => Some(TimeBucket::Morning),
            "afternoon" | "noon" | "midday" | "lunch" => Some(TimeBucket::Afternoon),
            "evening" | "dusk" | "sunset" | "dinner" => Some(TimeBucket::Evening),
            "night" | "tonight" | "midnight" | "late" => Some(TimeBucket::Night),
            _ => None,
        }
    }
}

/// The normalized identity of a thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadIdentity {
    pub thread_type: ThreadType,
    /// Lowercased, sorted, deduplicated.
    pub characters: Vec<String>,
    pub action: Option<&'static str>,
    pub location: Option<&'static str>,
    pub time: Option<TimeBucket>,
}

impl ThreadIdentity {
    /// Normalize a thread. `known_characters` are names recognized in the
    /// description in addition to the thread's declared characters.
    pub fn of<'a>(
        thread: &NarrativeThread,
        known_characters: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let tokens: Vec<String> = words(&thread.description).collect();

        let mut characters: BTreeSet<String> = thread
            .characters
            .iter()
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .collect();
        for name in known_characters {
            let lowered = name.to_lowercase();
            let parts: Vec<String> = words(&lowered).collect();
            if !parts.is_empty() && tokens.windows(parts.len()).any(|w| w == parts.as_slice()) {
                characters.insert(lowered);
            }
        }

        Self {
            thread_type: thread.thread_type,
            characters: characters.into_iter().collect(),
            action: tokens.iter().find_map(|t| canonical_in(t, ACTION_GROUPS)),
            location: tokens.iter().find_map(|t| canonical_in(t, LOCATION_GROUPS)),
            time: tokens.iter().find_map(|t| TimeBucket::of_word(t)),
        }
    }

    /// Weighted similarity in `[0, 1]`.
    pub fn similarity(&self, other: &ThreadIdentity, weights: &SimilarityWeights) -> f32 {
        let mut score = 0.0;

        if self.thread_type == other.thread_type {
            score += weights.thread_type;
        }

        score += weights.characters * jaccard(&self.characters, &other.characters);

        if self.action.is_some() && self.action == other.action {
            score += weights.action;
        }

        match (self.location, other.location) {
            (None, None) => score += weights.location / 2.0,
            (Some(a), Some(b)) if a == b => score += weights.location,
            _ => {}
        }

        score
    }
}

impl fmt::Display for ThreadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.thread_type.name(),
            self.characters.join(","),
            self.action.unwrap_or("-"),
            self.location.unwrap_or("-"),
            self.time.map(|t| t.name()).unwrap_or("-"),
        )
    }
}

/// Strip common inflections so "meeting", "meets" and "met" compare sensibly.
pub fn stem(word: &str) -> String {
    let word = word.trim_matches('\'').to_lowercase();
    let word = word.strip_suffix("'s").unwrap_or(&word).to_string();

    let mut out = word.clone();
    for suffix in ["ing", "ed", "es", "s"] {
        if let Some(base) = word.strip_suffix(suffix) {
            if base.chars().count() >= 3 {
                out = base.to_string();
                break;
            }
        }
    }
    if out.chars().count() > 3 {
        if let Some(base) = out.strip_suffix('e') {
            out = base.to_string();
        }
    }
    out
}

fn canonical_in(word: &str, groups: &[&[&'static str]]) -> Option<&'static str> {
    let stemmed = stem(word);
    groups
        .iter()
        .find(|group| group.iter().any(|member| stem(member) == stemmed))
        .map(|group| group[0])
}

fn jaccard(a: &[String], b: &[String]) -> f32 {
    let a: BTreeSet<&String> = a.iter().collect();
    let b: BTreeSet<&String> = b.iter().collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f32 / union as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::CaseNumber;
    use crate::threads::ThreadDeclaration;

    fn identity(thread_type: ThreadType, description: &str, characters: &[&str]) -> ThreadIdentity {
        let mut decl = ThreadDeclaration::new(thread_type, description);
        for c in characters {
            decl = decl.with_character(*c);
        }
        let thread = NarrativeThread::from_declaration(&decl, CaseNumber::new(1, 1).unwrap());
        ThreadIdentity::of(&thread, std::iter::empty())
    }

    #[test]
    fn test_stem() {
        assert_eq!(stem("meeting"), "meet");
        assert_eq!(stem("sees"), "see");
        assert_eq!(stem("arrives"), stem("arrive"));
        assert_eq!(stem("visited"), "visit");
        assert_eq!(stem("docks"), "dock");
        assert_eq!(stem("offices"), stem("office"));
        assert_eq!(stem("bar"), "bar");
    }

    #[test]
    fn test_rephrasings_collapse() {
        let a = identity(ThreadType::Promise, "meet Sarah at midnight", &["Sarah"]);
        let b = identity(ThreadType::Promise, "will see Sarah tonight at midnight", &["Sarah"]);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "promise|sarah|meet|-|night");
    }

    #[test]
    fn test_synonym_groups() {
        let a = identity(ThreadType::Appointment, "Visiting the pier at dawn", &[]);
        assert_eq!(a.action, Some("meet"));
        assert_eq!(a.location, Some("dock"));
        assert_eq!(a.time, Some(TimeBucket::Morning));
    }

    #[test]
    fn test_known_characters_recognized() {
        let decl = ThreadDeclaration::new(ThreadType::Threat, "Victor Crane will kill the witness");
        let thread = NarrativeThread::from_declaration(&decl, CaseNumber::new(2, 1).unwrap());
        let id = ThreadIdentity::of(&thread, ["Victor Crane", "Sarah"]);
        assert_eq!(id.characters, vec!["victor crane".to_string()]);
        assert_eq!(id.action, Some("kill"));
    }

    #[test]
    fn test_similarity_weights() {
        let weights = SimilarityWeights::default();
        let a = identity(ThreadType::Promise, "meet Sarah at the bar", &["Sarah"]);
        let b = identity(ThreadType::Promise, "see Sarah in the tavern tomorrow", &["Sarah"]);
        assert!((a.similarity(&b, &weights) - 1.0).abs() < 1e-6);

        let c = identity(ThreadType::Promise, "meet Sarah", &["Sarah"]);
        let d = identity(ThreadType::Promise, "visit Sarah", &["Sarah"]);
        // Neither names a location: half the location weight.
        assert!((c.similarity(&d, &weights) - 0.925).abs() < 1e-6);

        let e = identity(ThreadType::Threat, "call Marcus", &["Marcus"]);
        assert!(c.similarity(&e, &weights) < 0.75);
    }
}

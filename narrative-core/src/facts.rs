//! One-time facts established along a branch.

use serde::{Deserialize, Serialize};

/// A revelation the reader has already been given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revelation {
    pub text: String,
    /// Lowercased, whitespace-collapsed form used for matching.
    pub normalized: String,
    pub chapter: u32,
}

/// A character who is dead or has left the story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemovedCharacter {
    pub name: String,
    pub chapter: u32,
}

/// Delivered revelations and removed characters for one branch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BranchFacts {
    #[serde(default)]
    pub revelations: Vec<Revelation>,
    #[serde(default)]
    pub removed_characters: Vec<RemovedCharacter>,
}

impl BranchFacts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a revelation. Returns false if it was already delivered.
    pub fn record_revelation(&mut self, text: &str, chapter: u32) -> bool {
        let normalized = normalize(text);
        if normalized.is_empty() || self.has_revelation(&normalized) {
            return false;
        }
        self.revelations.push(Revelation {
            text: text.trim().to_string(),
            normalized,
            chapter,
        });
        true
    }

    /// Record a removal. Returns false if the character was already removed.
    pub fn record_removal(&mut self, name: &str, chapter: u32) -> bool {
        let name = name.trim();
        if name.is_empty() || self.is_removed(name) {
            return false;
        }
        self.removed_characters.push(RemovedCharacter {
            name: name.to_string(),
            chapter,
        });
        true
    }

    pub fn has_revelation(&self, text: &str) -> bool {
        let normalized = normalize(text);
        self.revelations.iter().any(|r| r.normalized == normalized)
    }

    pub fn is_removed(&self, name: &str) -> bool {
        self.removed_characters
            .iter()
            .any(|c| c.name.eq_ignore_ascii_case(name.trim()))
    }
}

/// Lowercase and collapse whitespace and trailing punctuation.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(['.', '!', '?'])
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revelations_recorded_once() {
        let mut facts = BranchFacts::new();
        assert!(facts.record_revelation("The mayor hired the killer.", 2));
        assert!(!facts.record_revelation("the  mayor hired the killer", 3));
        assert_eq!(facts.revelations.len(), 1);
        assert_eq!(facts.revelations[0].chapter, 2);
    }

    #[test]
    fn test_removals() {
        let mut facts = BranchFacts::new();
        assert!(facts.record_removal("Eddie Malone", 4));
        assert!(facts.is_removed("eddie malone"));
        assert!(!facts.record_removal("Eddie Malone", 5));
        assert!(!facts.record_removal("  ", 5));
    }
}

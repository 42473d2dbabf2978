//! Canonical story facts that generated content must never contradict.
//!
//! The canon is authored data (loaded from JSON by the host), not something
//! the engine learns: proper-noun spellings, fixed character attributes and
//! exact durations the story has committed to.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// A proper noun and the misspellings that must never appear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalName {
    pub canonical: String,
    /// Wrong spellings, matched as whole words and case-sensitively.
    #[serde(default)]
    pub variants: Vec<String>,
    /// Whether this name is a character (used for thread identity).
    #[serde(default = "default_true")]
    pub is_character: bool,
}

fn default_true() -> bool {
    true
}

/// An attribute of a subject that is fixed for the whole story.
///
/// Example: subject "Jack", attribute "drink", value "bourbon",
/// contradictions ["gin", "vodka"].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedAttribute {
    pub subject: String,
    pub attribute: String,
    pub value: String,
    /// Phrases that contradict the value when they share a sentence with the subject.
    #[serde(default)]
    pub contradictions: Vec<String>,
}

/// An exact span of time the story has established.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalDuration {
    /// Word that identifies the duration in prose, e.g. "married" or "sentence".
    pub cue: String,
    pub value: u32,
    /// Unit word, e.g. "years".
    pub unit: String,
}

/// The full canon for one story.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoryCanon {
    #[serde(default)]
    pub names: Vec<CanonicalName>,
    #[serde(default)]
    pub fixed_attributes: Vec<FixedAttribute>,
    #[serde(default)]
    pub durations: Vec<CanonicalDuration>,
}

impl StoryCanon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a canon from a JSON file.
    pub async fn load_json(path: impl AsRef<Path>) -> Result<Self, crate::persist::PersistError> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Add a character name with its forbidden misspellings.
    pub fn with_character(mut self, canonical: impl Into<String>, variants: &[&str]) -> Self {
        self.names.push(CanonicalName {
            canonical: canonical.into(),
            variants: variants.iter().map(|v| v.to_string()).collect(),
            is_character: true,
        });
        self
    }

    /// Add a non-character proper noun (a place, an organization).
    pub fn with_place(mut self, canonical: impl Into<String>, variants: &[&str]) -> Self {
        self.names.push(CanonicalName {
            canonical: canonical.into(),
            variants: variants.iter().map(|v| v.to_string()).collect(),
            is_character: false,
        });
        self
    }

    /// Add a fixed attribute.
    pub fn with_attribute(
        mut self,
        subject: impl Into<String>,
        attribute: impl Into<String>,
        value: impl Into<String>,
        contradictions: &[&str],
    ) -> Self {
        self.fixed_attributes.push(FixedAttribute {
            subject: subject.into(),
            attribute: attribute.into(),
            value: value.into(),
            contradictions: contradictions.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    /// Add an exact duration.
    pub fn with_duration(mut self, cue: impl Into<String>, value: u32, unit: impl Into<String>) -> Self {
        self.durations.push(CanonicalDuration {
            cue: cue.into(),
            value,
            unit: unit.into(),
        });
        self
    }

    /// Canonical character names.
    pub fn characters(&self) -> impl Iterator<Item = &str> {
        self.names
            .iter()
            .filter(|n| n.is_character)
            .map(|n| n.canonical.as_str())
    }
}

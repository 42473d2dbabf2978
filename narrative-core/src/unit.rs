//! Generated story units.
//!
//! A unit is one subchapter of one branch: the prose, the bookkeeping the
//! generator declares about it (threads, revelations, removals) and, on the
//! last subchapter of a chapter, the decision offered to the player.

use crate::path::{BranchKey, CaseNumber, OptionKey};
use crate::threads::ThreadDeclaration;
use serde::{Deserialize, Serialize};

/// One of the two options of a decision point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOption {
    pub key: OptionKey,
    pub title: String,
    /// What the option concentrates on, shown under the title.
    #[serde(default)]
    pub focus: String,
}

/// The binary choice that ends a chapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionPoint {
    pub intro: String,
    pub options: Vec<DecisionOption>,
}

impl DecisionPoint {
    /// Whether this offers exactly options A and B with titles.
    pub fn is_well_formed(&self) -> bool {
        self.options.len() == 2
            && self.options[0].key == OptionKey::A
            && self.options[1].key == OptionKey::B
            && self.options.iter().all(|o| !o.title.trim().is_empty())
    }

    pub fn option(&self, key: OptionKey) -> Option<&DecisionOption> {
        self.options.iter().find(|o| o.key == key)
    }
}

/// A generated (or fallback) subchapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedUnit {
    /// Filled in by the engine; generator payloads may omit it.
    #[serde(default = "placeholder_case")]
    pub case_number: CaseNumber,
    #[serde(default = "BranchKey::root")]
    pub branch_key: BranchKey,
    pub title: String,
    pub narrative: String,
    /// One or two sentences carrying the reader from the previous unit.
    #[serde(default)]
    pub bridge_text: String,
    /// Short recap of the story so far.
    #[serde(default)]
    pub previously: String,
    #[serde(default)]
    pub threads: Vec<ThreadDeclaration>,
    /// One-time revelations delivered in this unit.
    #[serde(default)]
    pub revelations: Vec<String>,
    /// Characters who die or leave the story in this unit.
    #[serde(default)]
    pub removed_characters: Vec<String>,
    /// Declared emotional state that justifies out-of-character behavior.
    #[serde(default)]
    pub emotional_state: Option<String>,
    /// Words hidden in the puzzle board for this unit.
    #[serde(default)]
    pub board_words: Vec<String>,
    #[serde(default)]
    pub decision: Option<DecisionPoint>,
}

fn placeholder_case() -> CaseNumber {
    CaseNumber {
        chapter: 1,
        subchapter: 1,
    }
}

impl GeneratedUnit {
    /// Parse a generator payload and stamp it with its position.
    pub fn from_payload(
        payload: serde_json::Value,
        case: CaseNumber,
        branch: &BranchKey,
    ) -> Result<Self, serde_json::Error> {
        let mut unit: GeneratedUnit = serde_json::from_value(payload)?;
        unit.case_number = case;
        unit.branch_key = branch.clone();
        Ok(unit)
    }

    pub fn word_count(&self) -> usize {
        self.narrative.split_whitespace().count()
    }
}

/// JSON schema the generator must fill for a unit.
pub fn unit_schema() -> serde_json::Value {
    let thread = serde_json::json!({
        "type": "object",
        "properties": {
            "type": {
                "type": "string",
                "enum": ["appointment", "revelation", "investigation", "relationship",
                         "physical_state", "promise", "threat"]
            },
            "description": {"type": "string"},
            "status": {"type": "string", "enum": ["active", "resolved", "failed"]},
            "urgency": {"type": "string", "enum": ["critical", "normal", "background"]},
            "characters": {"type": "array", "items": {"type": "string"}},
            "deadline_chapter": {"type": "integer"},
            "progress": {"type": "string", "enum": ["introduced", "advanced", "acknowledged"]},
            "resolution": {"type": "string"}
        },
        "required": ["type", "description", "status", "urgency", "progress"]
    });

    serde_json::json!({
        "type": "object",
        "properties": {
            "title": {"type": "string"},
            "narrative": {"type": "string"},
            "bridge_text": {"type": "string"},
            "previously": {"type": "string"},
            "threads": {"type": "array", "items": thread},
            "revelations": {"type": "array", "items": {"type": "string"}},
            "removed_characters": {"type": "array", "items": {"type": "string"}},
            "emotional_state": {"type": "string"},
            "board_words": {"type": "array", "items": {"type": "string"}},
            "decision": {
                "type": "object",
                "properties": {
                    "intro": {"type": "string"},
                    "options": {
                        "type": "array",
                        "minItems": 2,
                        "maxItems": 2,
                        "items": {
                            "type": "object",
                            "properties": {
                                "key": {"type": "string", "enum": ["A", "B"]},
                                "title": {"type": "string"},
                                "focus": {"type": "string"}
                            },
                            "required": ["key", "title", "focus"]
                        }
                    }
                },
                "required": ["intro", "options"]
            }
        },
        "required": ["title", "narrative", "bridge_text", "previously", "threads", "board_words"]
    })
}

//! Templated units for when generation cannot be used.
//!
//! A fallback is plain but consistent: it is built from the same branch
//! state a generated unit would have been checked against, so it carries the
//! previous decision forward, keeps open threads in view and never puts a
//! removed character on stage.

use crate::config::ValidatorConfig;
use crate::consequence::Consequence;
use crate::path::{words, BranchKey, CaseNumber, OptionKey};
use crate::state::BranchState;
use crate::threads::NarrativeThread;
use crate::unit::{DecisionOption, DecisionPoint, GeneratedUnit};
use std::collections::BTreeSet;

/// Threads named in a fallback narrative.
const MAX_THREADS_MENTIONED: usize = 3;

const SCENE: &[&str] = &[
    "The city kept its own hours. Rain worked the gutters, neon buzzed over shuttered storefronts, \
     and somewhere across the river a siren rose and fell without ever arriving.",
    "The detective turned the case over again, laying each piece out in order and looking for \
     the one that did not sit flat. Every file had one. The trick was finding it before someone \
     else did.",
    "A cigarette burned down in the ashtray, untouched, its smoke climbing toward the stained \
     ceiling. Patience had never come easily, but the evidence did not care about that. It only \
     cared whether anyone was paying attention.",
];

const CLOSING: &str = "By the time the streetlights flickered on, the next move was clear, and so \
     was its price. There was always a price. The coat came off the hook, and the door closed on \
     an empty office.";

/// Build a fallback unit for `case` on `branch`.
///
/// `prior` is the consequence of the decision that opened this chapter,
/// when there is one.
pub fn fallback_unit(
    case: CaseNumber,
    branch: &BranchKey,
    prior: Option<&Consequence>,
    state: &BranchState,
    limits: &ValidatorConfig,
) -> GeneratedUnit {
    let removed = removed_names(state);

    let mut paragraphs: Vec<String> = Vec::new();
    let mut bridge_text = String::from("The night was not finished yet.");

    if let Some(consequence) = prior.filter(|_| case.subchapter == 1) {
        if !mentions_any(&consequence.immediate, &removed) {
            bridge_text = consequence.immediate.clone();
            paragraphs.push(consequence.immediate.clone());
        }
        let ongoing: Vec<&str> = consequence
            .ongoing
            .iter()
            .map(String::as_str)
            .filter(|o| !mentions_any(o, &removed))
            .collect();
        if !ongoing.is_empty() {
            paragraphs.push(format!("The ripples were already spreading. {}", ongoing.join(" ")));
        }
    }

    paragraphs.extend(SCENE.iter().map(|s| s.to_string()));

    for thread in threads_to_mention(state, &removed) {
        paragraphs.push(format!(
            "There was still the matter of {}. It would not wait forever.",
            lowercase_first(&thread.description)
        ));
    }
    paragraphs.push(CLOSING.to_string());

    let narrative = paragraphs.join("\n\n");
    let previously = recap(state, limits.max_previously_chars);
    let board_words = board_words(&narrative, limits);
    let decision = case.is_decision_point().then(|| fallback_decision(state));

    GeneratedUnit {
        case_number: case,
        branch_key: branch.clone(),
        title: format!("Case {case}"),
        narrative,
        bridge_text: truncate(&bridge_text, limits.max_bridge_chars),
        previously,
        threads: Vec::new(),
        revelations: Vec::new(),
        removed_characters: Vec::new(),
        emotional_state: None,
        board_words,
        decision,
    }
}

/// The decision offered when a unit has none of its own.
pub fn fallback_decision(state: &BranchState) -> DecisionPoint {
    let removed = removed_names(state);
    let intro = match threads_to_mention(state, &removed).first() {
        Some(thread) => format!(
            "With {} still unsettled, it is time to decide how to play this.",
            lowercase_first(&thread.description)
        ),
        None => "It is time to decide how to play this.".to_string(),
    };

    DecisionPoint {
        intro,
        options: vec![
            DecisionOption {
                key: OptionKey::A,
                title: "Confront them now".to_string(),
                focus: "Push hard and force answers before the trail goes cold.".to_string(),
            },
            DecisionOption {
                key: OptionKey::B,
                title: "Investigate quietly".to_string(),
                focus: "Examine the records and watch carefully before making a move.".to_string(),
            },
        ],
    }
}

fn removed_names(state: &BranchState) -> Vec<String> {
    state
        .facts
        .removed_characters
        .iter()
        .map(|c| c.name.to_lowercase())
        .collect()
}

/// Whole-word match, so a removed "Al" does not hide the alley.
fn mentions_any(text: &str, lowercase_names: &[String]) -> bool {
    let tokens: Vec<String> = words(text).collect();
    lowercase_names.iter().any(|name| {
        let name: Vec<String> = words(name).collect();
        !name.is_empty() && tokens.windows(name.len()).any(|window| window == name.as_slice())
    })
}

/// Open threads safe to name, most urgent and most recent first.
fn threads_to_mention<'a>(state: &'a BranchState, removed: &[String]) -> Vec<&'a NarrativeThread> {
    let mut threads: Vec<&NarrativeThread> = state
        .ledger
        .active()
        .iter()
        .filter(|t| {
            !mentions_any(&t.description, removed) && !t.characters.iter().any(|c| mentions_any(c, removed))
        })
        .collect();
    threads.sort_by(|a, b| b.urgency.cmp(&a.urgency).then(b.position().cmp(&a.position())));
    threads.truncate(MAX_THREADS_MENTIONED);
    threads
}

fn recap(state: &BranchState, max_chars: usize) -> String {
    let mut parts: Vec<&str> = state
        .facts
        .revelations
        .iter()
        .rev()
        .take(2)
        .map(|r| r.text.as_str())
        .collect();
    parts.reverse();
    if parts.is_empty() {
        return "A case that will not close.".to_string();
    }
    truncate(&parts.join(" "), max_chars)
}

/// Distinct longer words of the narrative, upper-cased.
fn board_words(narrative: &str, limits: &ValidatorConfig) -> Vec<String> {
    let mut seen = BTreeSet::new();
    narrative
        .split(|c: char| !c.is_ascii_alphabetic())
        .filter(|w| w.len() >= 4 && w.len() <= limits.max_board_word_len)
        .map(str::to_uppercase)
        .filter(|w| seen.insert(w.clone()))
        .take(limits.max_board_words)
        .collect()
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", cut.trim_end())
}

fn lowercase_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

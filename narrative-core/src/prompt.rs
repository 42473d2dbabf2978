//! Assembly of generation requests.
//!
//! The generator gets fixed instructions plus a structured JSON context
//! describing exactly what this branch has established. Everything the
//! validator will check the candidate against is in that context.

use crate::canon::StoryCanon;
use crate::config::{ThreadPolicy, ValidatorConfig};
use crate::consequence::PersonalityProfile;
use crate::generator::{GenerationRequest, RequestPurpose};
use crate::path::{BranchKey, CaseNumber, SuperPath};
use crate::state::BranchState;
use crate::threads::NarrativeThread;
use crate::unit::unit_schema;
use crate::validate::PriorDecision;
use serde::Serialize;

/// Everything a unit request is built from.
#[derive(Debug, Clone, Copy)]
pub struct PromptInput<'a> {
    pub case: CaseNumber,
    pub branch: &'a BranchKey,
    pub super_path: SuperPath,
    pub personality: &'a PersonalityProfile,
    pub prior: Option<PriorDecision<'a>>,
    pub state: &'a BranchState,
    pub canon: &'a StoryCanon,
    pub policy: &'a ThreadPolicy,
    pub limits: &'a ValidatorConfig,
}

#[derive(Debug, Serialize)]
struct Position<'a> {
    case: String,
    chapter: u32,
    subchapter: u8,
    branch: &'a str,
    decision_required: bool,
}

#[derive(Debug, Serialize)]
struct OpenThread<'a> {
    id: Option<&'a str>,
    #[serde(rename = "type")]
    thread_type: &'static str,
    description: &'a str,
    urgency: &'static str,
    characters: &'a [String],
    opened_chapter: u32,
    deadline_chapter: Option<u32>,
    needs_attention: bool,
}

#[derive(Debug, Serialize)]
struct Limits {
    min_narrative_words: usize,
    max_title_chars: usize,
    max_bridge_chars: usize,
    max_previously_chars: usize,
    board_words: (usize, usize),
}

/// Build the request for one unit.
pub fn unit_request(input: &PromptInput<'_>) -> GenerationRequest {
    let chapter = input.case.chapter;
    let ledger = &input.state.ledger;

    let open_threads: Vec<OpenThread<'_>> = ledger
        .active()
        .iter()
        .map(|t| open_thread(t, chapter, input.policy))
        .collect();
    let overdue: Vec<&str> = ledger.overdue().collect();

    let previous_decision = input.prior.map(|prior| {
        serde_json::json!({
            "locator": prior.decision.locator_id,
            "option": prior.decision.option_key,
            "title": prior.decision.option_title,
            "focus": prior.decision.option_focus,
            "consequence": prior.consequence,
        })
    });

    let revelations: Vec<&str> = input
        .state
        .facts
        .revelations
        .iter()
        .map(|r| r.text.as_str())
        .collect();
    let removed: Vec<&str> = input
        .state
        .facts
        .removed_characters
        .iter()
        .map(|c| c.name.as_str())
        .collect();

    let limits = input.limits;
    let context = serde_json::json!({
        "position": Position {
            case: input.case.to_string(),
            chapter,
            subchapter: input.case.subchapter,
            branch: input.branch.as_str(),
            decision_required: input.case.is_decision_point(),
        },
        "super_path": input.super_path.name(),
        "personality": input.personality,
        "previous_decision": previous_decision,
        "open_threads": open_threads,
        "overdue_threads": overdue,
        "delivered_revelations": revelations,
        "removed_characters": removed,
        "canon": input.canon,
        "limits": Limits {
            min_narrative_words: limits.min_narrative_words,
            max_title_chars: limits.max_title_chars,
            max_bridge_chars: limits.max_bridge_chars,
            max_previously_chars: limits.max_previously_chars,
            board_words: (limits.min_board_words, limits.max_board_words),
        },
    });

    GenerationRequest {
        purpose: RequestPurpose::Unit,
        instructions: include_str!("prompts/unit.txt").to_string(),
        output_schema: unit_schema(),
        context,
    }
}

fn open_thread<'a>(thread: &'a NarrativeThread, chapter: u32, policy: &ThreadPolicy) -> OpenThread<'a> {
    OpenThread {
        id: thread.normalized_id.as_deref(),
        thread_type: thread.thread_type.name(),
        description: &thread.description,
        urgency: thread.urgency.name(),
        characters: &thread.characters,
        opened_chapter: thread.opened_chapter,
        deadline_chapter: thread.deadline_chapter,
        needs_attention: thread.is_stale(chapter, policy.stale_after_chapters),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consequence::{derive_consequence, Consequence};
    use crate::path::{DecisionRecord, OptionKey};
    use crate::threads::{ThreadDeclaration, ThreadType, Urgency};

    #[test]
    fn test_context_carries_branch_state() {
        let mut state = BranchState::default();
        let case = CaseNumber::new(2, 3).unwrap();
        state.ledger.ingest(
            case,
            &[ThreadDeclaration::new(ThreadType::Appointment, "meet Sarah at the pier at midnight")
                .with_urgency(Urgency::Critical)
                .with_character("Sarah")],
            &ThreadPolicy::default(),
            &StoryCanon::default(),
        );
        state.facts.record_revelation("The ledger was forged.", 2);
        state.facts.record_removal("Eddie", 2);

        let decision = DecisionRecord::new("002C", OptionKey::A).with_title("Confront the fence");
        let consequence: Consequence = derive_consequence(&decision, std::slice::from_ref(&decision));
        let branch = BranchKey::root();
        let personality = PersonalityProfile::balanced();
        let input = PromptInput {
            case,
            branch: &branch,
            super_path: SuperPath::Balanced,
            personality: &personality,
            prior: Some(PriorDecision {
                decision: &decision,
                consequence: &consequence,
            }),
            state: &state,
            canon: &StoryCanon::default(),
            policy: &ThreadPolicy::default(),
            limits: &ValidatorConfig::default(),
        };

        let request = unit_request(&input);
        assert_eq!(request.purpose, RequestPurpose::Unit);
        let context = &request.context;
        assert_eq!(context["position"]["case"], "002C");
        assert_eq!(context["position"]["decision_required"], true);
        assert_eq!(context["open_threads"].as_array().unwrap().len(), 1);
        assert_eq!(context["open_threads"][0]["urgency"], "critical");
        assert_eq!(context["delivered_revelations"][0], "The ledger was forged.");
        assert_eq!(context["removed_characters"][0], "Eddie");
        assert_eq!(context["previous_decision"]["option"], "A");
        assert!(!request.instructions.is_empty());
    }
}

//! The rule book: every consistency rule as data.
//!
//! Each rule has a tag that prefixes the messages it produces. Severity is
//! looked up from that tag, so whether an issue blocks a unit is decided in
//! exactly one place ([`RuleBook::is_hard_issue`]).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    /// Canonical spellings and fixed attributes.
    IdentityIntegrity,
    /// The opening of a chapter must show the previous decision mattered.
    PlayerAgency,
    /// Re-revealed revelations, removed characters acting.
    LogicalImpossibility,
    /// Stale obligations not referenced.
    ThreadStale,
    /// Overdue obligations still not advanced.
    ThreadOverdue,
    /// Vague or wrong canonical durations.
    TimelineExactness,
    /// Behavior against the player's established personality.
    PersonalityAlignment,
    /// Length and shape of the unit's fields.
    Structure,
}

/// Whether an issue blocks acceptance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Hard,
    Soft,
}

impl Severity {
    pub fn name(&self) -> &'static str {
        match self {
            Severity::Hard => "hard",
            Severity::Soft => "soft",
        }
    }
}

/// One consistency rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    /// Message prefix, upper case.
    pub tag: String,
    pub severity: Severity,
    /// Message body; `{detail}` is replaced by the finding.
    pub template: String,
}

impl Rule {
    fn new(id: RuleId, tag: &str, severity: Severity, template: &str) -> Self {
        Self {
            id,
            tag: tag.to_string(),
            severity,
            template: template.to_string(),
        }
    }

    /// Render a message for this rule.
    pub fn render(&self, detail: &str) -> String {
        format!("{}: {}", self.tag, self.template.replace("{detail}", detail))
    }
}

/// A problem found in a candidate unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyIssue {
    pub rule: RuleId,
    pub message: String,
    pub severity: Severity,
}

impl fmt::Display for ConsistencyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.severity.name(), self.message)
    }
}

/// The table of rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleBook {
    rules: Vec<Rule>,
}

impl Default for RuleBook {
    fn default() -> Self {
        use RuleId::*;
        use Severity::*;

        Self {
            rules: vec![
                Rule::new(IdentityIntegrity, "IDENTITY", Hard, "{detail}"),
                Rule::new(PlayerAgency, "AGENCY", Hard, "previous decision ignored: {detail}"),
                Rule::new(LogicalImpossibility, "LOGIC", Soft, "{detail}"),
                Rule::new(ThreadStale, "THREAD", Soft, "open thread not referenced: {detail}"),
                Rule::new(ThreadOverdue, "OVERDUE", Hard, "overdue thread still not advanced: {detail}"),
                Rule::new(TimelineExactness, "TIMELINE", Soft, "{detail}"),
                Rule::new(PersonalityAlignment, "PERSONALITY", Soft, "{detail}"),
                Rule::new(Structure, "STRUCTURE", Soft, "{detail}"),
            ],
        }
    }
}

impl RuleBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Promote logical impossibilities to hard issues.
    pub fn with_strict_logic(mut self, strict: bool) -> Self {
        if strict {
            self.set_severity(RuleId::LogicalImpossibility, Severity::Hard);
        }
        self
    }

    pub fn set_severity(&mut self, id: RuleId, severity: Severity) {
        if let Some(rule) = self.rules.iter_mut().find(|r| r.id == id) {
            rule.severity = severity;
        }
    }

    pub fn rule(&self, id: RuleId) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Build an issue for `id`.
    pub fn issue(&self, id: RuleId, detail: &str) -> ConsistencyIssue {
        let message = match self.rule(id) {
            Some(rule) => rule.render(detail),
            None => detail.to_string(),
        };
        let severity = self.severity_of(&message);
        ConsistencyIssue {
            rule: id,
            message,
            severity,
        }
    }

    /// Severity of a message, from its tag. Untagged or unknown → soft.
    pub fn severity_of(&self, message: &str) -> Severity {
        let Some((tag, _)) = message.split_once(':') else {
            return Severity::Soft;
        };
        let tag = tag.trim();
        self.rules
            .iter()
            .find(|r| r.tag == tag)
            .map(|r| r.severity)
            .unwrap_or(Severity::Soft)
    }

    /// The single hard/soft decision point.
    pub fn is_hard_issue(&self, issue: &ConsistencyIssue) -> bool {
        self.severity_of(&issue.message) == Severity::Hard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_severities() {
        let book = RuleBook::default();
        assert!(book.is_hard_issue(&book.issue(RuleId::IdentityIntegrity, "Sara")));
        assert!(book.is_hard_issue(&book.issue(RuleId::PlayerAgency, "x")));
        assert!(book.is_hard_issue(&book.issue(RuleId::ThreadOverdue, "x")));
        assert!(!book.is_hard_issue(&book.issue(RuleId::LogicalImpossibility, "x")));
        assert!(!book.is_hard_issue(&book.issue(RuleId::TimelineExactness, "x")));
        assert!(!book.is_hard_issue(&book.issue(RuleId::Structure, "x")));
    }

    #[test]
    fn test_strict_logic() {
        let book = RuleBook::default().with_strict_logic(true);
        assert!(book.is_hard_issue(&book.issue(RuleId::LogicalImpossibility, "x")));
    }

    #[test]
    fn test_severity_is_total() {
        let book = RuleBook::default();
        assert_eq!(book.severity_of("IDENTITY: Sara"), Severity::Hard);
        assert_eq!(book.severity_of("no tag at all"), Severity::Soft);
        assert_eq!(book.severity_of("UNKNOWN: something"), Severity::Soft);
        assert_eq!(book.severity_of(""), Severity::Soft);
    }

    #[test]
    fn test_issue_matches_predicate() {
        let book = RuleBook::default();
        for rule in book.rules() {
            let issue = book.issue(rule.id, "detail");
            assert_eq!(issue.severity == Severity::Hard, book.is_hard_issue(&issue));
            assert!(issue.message.starts_with(&rule.tag));
        }
    }
}

//! Narrative thread records.

use crate::path::CaseNumber;
use serde::{Deserialize, Serialize};

/// Tag appended to the resolution of threads closed to make room.
pub const AUTO_RESOLVED_TAG: &str = "auto-resolved: capacity";

/// Kind of narrative obligation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadType {
    Appointment,
    Revelation,
    Investigation,
    Relationship,
    PhysicalState,
    Promise,
    Threat,
}

impl ThreadType {
    pub fn name(&self) -> &'static str {
        match self {
            ThreadType::Appointment => "appointment",
            ThreadType::Revelation => "revelation",
            ThreadType::Investigation => "investigation",
            ThreadType::Relationship => "relationship",
            ThreadType::PhysicalState => "physical_state",
            ThreadType::Promise => "promise",
            ThreadType::Threat => "threat",
        }
    }

    /// Obligations the reader expects to see paid off on a schedule.
    pub fn is_obligation(&self) -> bool {
        matches!(
            self,
            ThreadType::Appointment | ThreadType::Promise | ThreadType::Threat
        )
    }
}

/// Lifecycle status. Only `Active → Resolved | Failed` transitions exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    #[default]
    Active,
    Resolved,
    Failed,
}

impl ThreadStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ThreadStatus::Active)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ThreadStatus::Active => "active",
            ThreadStatus::Resolved => "resolved",
            ThreadStatus::Failed => "failed",
        }
    }
}

/// How urgently a thread needs payoff. Ordered low to high.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Background,
    #[default]
    Normal,
    Critical,
}

impl Urgency {
    pub fn name(&self) -> &'static str {
        match self {
            Urgency::Background => "background",
            Urgency::Normal => "normal",
            Urgency::Critical => "critical",
        }
    }
}

/// What a unit did with a thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadProgress {
    /// First appearance.
    #[default]
    Introduced,
    /// Moved forward in a way that matters.
    Advanced,
    /// Mentioned without moving forward.
    Acknowledged,
}

/// A thread as declared by one generated unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadDeclaration {
    #[serde(rename = "type")]
    pub thread_type: ThreadType,
    pub description: String,
    #[serde(default)]
    pub status: ThreadStatus,
    #[serde(default)]
    pub urgency: Urgency,
    #[serde(default)]
    pub characters: Vec<String>,
    #[serde(default)]
    pub deadline_chapter: Option<u32>,
    #[serde(default)]
    pub progress: ThreadProgress,
    /// How the thread closed, for terminal declarations.
    #[serde(default)]
    pub resolution: Option<String>,
}

impl ThreadDeclaration {
    pub fn new(thread_type: ThreadType, description: impl Into<String>) -> Self {
        Self {
            thread_type,
            description: description.into(),
            status: ThreadStatus::Active,
            urgency: Urgency::Normal,
            characters: Vec::new(),
            deadline_chapter: None,
            progress: ThreadProgress::Introduced,
            resolution: None,
        }
    }

    pub fn with_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }

    pub fn with_character(mut self, name: impl Into<String>) -> Self {
        self.characters.push(name.into());
        self
    }

    pub fn with_deadline(mut self, chapter: u32) -> Self {
        self.deadline_chapter = Some(chapter);
        self
    }

    pub fn with_progress(mut self, progress: ThreadProgress) -> Self {
        self.progress = progress;
        self
    }

    pub fn resolved(mut self, resolution: impl Into<String>) -> Self {
        self.status = ThreadStatus::Resolved;
        self.resolution = Some(resolution.into());
        self
    }

    pub fn failed(mut self, resolution: impl Into<String>) -> Self {
        self.status = ThreadStatus::Failed;
        self.resolution = Some(resolution.into());
        self
    }
}

/// A thread tracked by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrativeThread {
    #[serde(rename = "type")]
    pub thread_type: ThreadType,
    pub description: String,
    pub status: ThreadStatus,
    pub urgency: Urgency,
    /// Position of the latest declaration that shaped this record.
    pub chapter: u32,
    pub subchapter: u8,
    /// Chapter the obligation first appeared in.
    pub opened_chapter: u32,
    #[serde(default)]
    pub characters: Vec<String>,
    #[serde(default)]
    pub deadline_chapter: Option<u32>,
    #[serde(default)]
    pub normalized_id: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
}

impl NarrativeThread {
    /// Stamp a declaration with the position of the unit that made it.
    pub fn from_declaration(declaration: &ThreadDeclaration, case: CaseNumber) -> Self {
        Self {
            thread_type: declaration.thread_type,
            description: declaration.description.trim().to_string(),
            status: declaration.status,
            urgency: declaration.urgency,
            chapter: case.chapter,
            subchapter: case.subchapter,
            opened_chapter: case.chapter,
            characters: declaration.characters.clone(),
            deadline_chapter: declaration.deadline_chapter,
            normalized_id: None,
            resolution: declaration.resolution.clone(),
        }
    }

    pub fn position(&self) -> (u32, u8) {
        (self.chapter, self.subchapter)
    }

    pub fn is_active(&self) -> bool {
        self.status == ThreadStatus::Active
    }

    /// Whether `incoming` should replace `self` for the same identity.
    ///
    /// Terminal status beats active, then higher urgency, then the later
    /// position. Full ties go to the incoming record.
    pub fn superseded_by(&self, incoming: &NarrativeThread) -> bool {
        match (self.status.is_terminal(), incoming.status.is_terminal()) {
            (false, true) => return true,
            (true, false) => return false,
            _ => {}
        }
        if incoming.urgency != self.urgency {
            return incoming.urgency > self.urgency;
        }
        incoming.position() >= self.position()
    }

    /// Close an active thread. Terminal threads are left untouched.
    pub fn close(&mut self, status: ThreadStatus, resolution: impl Into<String>) {
        if self.status.is_terminal() || !status.is_terminal() {
            return;
        }
        self.status = status;
        self.resolution = Some(resolution.into());
    }

    /// Whether an open obligation has waited too long as of `chapter`.
    pub fn is_stale(&self, chapter: u32, stale_after_chapters: u32) -> bool {
        if !self.is_active() {
            return false;
        }
        if let Some(deadline) = self.deadline_chapter {
            if chapter > deadline {
                return true;
            }
        }
        let watched = self.urgency == Urgency::Critical || self.thread_type.is_obligation();
        watched && chapter.saturating_sub(self.opened_chapter) > stale_after_chapters
    }
}

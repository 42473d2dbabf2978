//! The per-branch thread ledger.

use super::identity::ThreadIdentity;
use super::thread::{
    NarrativeThread, ThreadDeclaration, ThreadProgress, ThreadStatus, ThreadType, Urgency,
    AUTO_RESOLVED_TAG,
};
use crate::canon::StoryCanon;
use crate::config::ThreadPolicy;
use crate::path::CaseNumber;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

/// Longest archived summary, in characters.
const ARCHIVE_SUMMARY_CHARS: usize = 80;

/// Most character names kept on an archived thread.
const ARCHIVE_MAX_CHARACTERS: usize = 3;

/// Compressed record of a closed thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedThread {
    pub identity: String,
    #[serde(rename = "type")]
    pub thread_type: ThreadType,
    pub summary: String,
    pub characters: Vec<String>,
    pub status: ThreadStatus,
    pub opened_chapter: u32,
    pub resolved_chapter: u32,
}

impl ArchivedThread {
    fn from_thread(thread: &NarrativeThread, identity: String, resolved_chapter: u32) -> Self {
        let summary = if thread.description.chars().count() > ARCHIVE_SUMMARY_CHARS {
            let mut s: String = thread
                .description
                .chars()
                .take(ARCHIVE_SUMMARY_CHARS - 3)
                .collect();
            s.push_str("...");
            s
        } else {
            thread.description.clone()
        };
        Self {
            identity,
            thread_type: thread.thread_type,
            summary,
            characters: thread
                .characters
                .iter()
                .take(ARCHIVE_MAX_CHARACTERS)
                .cloned()
                .collect(),
            status: thread.status,
            opened_chapter: thread.opened_chapter,
            resolved_chapter,
        }
    }
}

/// What one ingestion pass changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    /// Declarations folded into an existing thread (exact or fuzzy).
    pub merged: usize,
    /// Active declarations of already-closed identities, discarded.
    pub dropped_zombies: usize,
    /// Threads moved to the archive this pass (auto-resolved ones included).
    pub archived: usize,
    /// Identities closed to respect the active budget.
    pub auto_resolved: Vec<String>,
    /// Identities that crossed the overdue threshold this pass.
    pub newly_overdue: Vec<String>,
}

/// Open narrative obligations for one branch, plus their closed history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadLedger {
    /// Active threads, oldest position first.
    active: Vec<NarrativeThread>,
    archive: Vec<ArchivedThread>,
    /// Identities that have closed; they never reopen.
    tombstones: BTreeSet<String>,
    /// Consecutive acknowledgments per identity.
    acknowledgments: BTreeMap<String, u32>,
    overdue: BTreeSet<String>,
}

impl ThreadLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// The normalized identity key of a declaration.
    pub fn identity_key(declaration: &ThreadDeclaration, case: CaseNumber, canon: &StoryCanon) -> String {
        let thread = NarrativeThread::from_declaration(declaration, case);
        ThreadIdentity::of(&thread, canon.characters()).to_string()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn active(&self) -> &[NarrativeThread] {
        &self.active
    }

    pub fn archive(&self) -> &[ArchivedThread] {
        &self.archive
    }

    pub fn is_closed(&self, identity: &str) -> bool {
        self.tombstones.contains(identity)
    }

    pub fn is_overdue(&self, identity: &str) -> bool {
        self.overdue.contains(identity)
    }

    /// Overdue identities, in key order.
    pub fn overdue(&self) -> impl Iterator<Item = &str> {
        self.overdue.iter().map(String::as_str)
    }

    pub fn acknowledgments(&self, identity: &str) -> u32 {
        self.acknowledgments.get(identity).copied().unwrap_or(0)
    }

    /// Active threads that have waited too long as of `chapter`.
    pub fn stale(&self, chapter: u32, policy: &ThreadPolicy) -> Vec<&NarrativeThread> {
        self.active
            .iter()
            .filter(|t| t.is_stale(chapter, policy.stale_after_chapters))
            .collect()
    }

    /// Active thread with the given identity.
    pub fn find(&self, identity: &str) -> Option<&NarrativeThread> {
        self.active
            .iter()
            .find(|t| t.normalized_id.as_deref() == Some(identity))
    }

    // =========================================================================
    // Ingestion
    // =========================================================================

    /// Fold the thread declarations of one unit into the ledger.
    pub fn ingest(
        &mut self,
        case: CaseNumber,
        declarations: &[ThreadDeclaration],
        policy: &ThreadPolicy,
        canon: &StoryCanon,
    ) -> IngestReport {
        let mut report = IngestReport::default();

        for declaration in declarations {
            let mut thread = NarrativeThread::from_declaration(declaration, case);
            let identity = ThreadIdentity::of(&thread, canon.characters()).to_string();
            thread.normalized_id = Some(identity.clone());

            if self.tombstones.contains(&identity) {
                if thread.is_active() {
                    tracing::debug!(identity = %identity, "Dropping declaration of a closed thread");
                    report.dropped_zombies += 1;
                }
                continue;
            }

            self.track_progress(&identity, declaration, policy, &mut report);

            if self.merge_exact(thread) {
                report.merged += 1;
            }
        }

        if self.active_count() >= policy.fuzzy_min_active {
            report.merged += self.merge_fuzzy(policy, canon);
        }

        report.archived += self.archive_terminal(case.chapter);
        self.enforce_capacity(case.chapter, policy, &mut report);
        self.prune_archive(case.chapter, policy);

        self.active.sort_by_key(|t| t.position());
        report
    }

    fn active_count(&self) -> usize {
        self.active.iter().filter(|t| t.is_active()).count()
    }

    fn track_progress(
        &mut self,
        identity: &str,
        declaration: &ThreadDeclaration,
        policy: &ThreadPolicy,
        report: &mut IngestReport,
    ) {
        let acknowledged = declaration.progress == ThreadProgress::Acknowledged
            && !declaration.status.is_terminal();
        if !acknowledged {
            self.acknowledgments.remove(identity);
            self.overdue.remove(identity);
            return;
        }

        let count = self.acknowledgments.entry(identity.to_string()).or_insert(0);
        *count += 1;
        if *count >= policy.overdue_after && self.overdue.insert(identity.to_string()) {
            tracing::debug!(identity = %identity, acknowledgments = *count, "Thread is overdue");
            report.newly_overdue.push(identity.to_string());
        }
    }

    /// Returns true when the thread merged into an existing one.
    fn merge_exact(&mut self, mut incoming: NarrativeThread) -> bool {
        let existing = self
            .active
            .iter_mut()
            .find(|t| t.normalized_id == incoming.normalized_id);

        match existing {
            Some(existing) => {
                if existing.superseded_by(&incoming) {
                    incoming.opened_chapter = incoming.opened_chapter.min(existing.opened_chapter);
                    if incoming.deadline_chapter.is_none() {
                        incoming.deadline_chapter = existing.deadline_chapter;
                    }
                    *existing = incoming;
                }
                true
            }
            None => {
                self.active.push(incoming);
                false
            }
        }
    }

    /// Collapse near-duplicates. Returns the number of threads removed.
    fn merge_fuzzy(&mut self, policy: &ThreadPolicy, canon: &StoryCanon) -> usize {
        let mut identities: Vec<ThreadIdentity> = self
            .active
            .iter()
            .map(|t| ThreadIdentity::of(t, canon.characters()))
            .collect();
        let mut removed = 0;

        let mut i = 0;
        while i < self.active.len() {
            let mut j = i + 1;
            while j < self.active.len() {
                let score = identities[i].similarity(&identities[j], &policy.weights);
                if score < policy.fuzzy_threshold {
                    j += 1;
                    continue;
                }

                let loser = if self.active[i].superseded_by(&self.active[j]) {
                    let opened = self.active[i].opened_chapter;
                    let survivor = self.active.remove(j);
                    let loser = std::mem::replace(&mut self.active[i], survivor);
                    let survivor_identity = identities.remove(j);
                    identities[i] = survivor_identity;
                    self.active[i].opened_chapter = self.active[i].opened_chapter.min(opened);
                    // Survivor changed; compare it against everything again.
                    j = i + 1;
                    loser
                } else {
                    identities.remove(j);
                    self.active.remove(j)
                };

                tracing::debug!(
                    kept = ?self.active[i].normalized_id,
                    dropped = ?loser.normalized_id,
                    score,
                    "Merged near-duplicate threads"
                );
                if self.active[i].status.is_terminal() {
                    if let Some(id) = loser.normalized_id {
                        self.tombstones.insert(id);
                    }
                }
                removed += 1;
            }
            i += 1;
        }
        removed
    }

    /// Move every closed thread to the archive.
    fn archive_terminal(&mut self, chapter: u32) -> usize {
        let (closed, open): (Vec<_>, Vec<_>) = std::mem::take(&mut self.active)
            .into_iter()
            .partition(|t| t.status.is_terminal());
        self.active = open;

        let count = closed.len();
        for thread in closed {
            self.retire(&thread, chapter);
        }
        count
    }

    fn retire(&mut self, thread: &NarrativeThread, chapter: u32) {
        let identity = thread.normalized_id.clone().unwrap_or_default();
        self.acknowledgments.remove(&identity);
        self.overdue.remove(&identity);
        self.tombstones.insert(identity.clone());
        self.archive
            .push(ArchivedThread::from_thread(thread, identity, chapter));
    }

    /// Keep the active set within budget, auto-resolving the overflow.
    ///
    /// Critical threads always stay. Normal threads get their share of the
    /// remaining budget (or more, when there are too few background threads
    /// to use it); background threads take what is left. Newer threads are
    /// kept before older ones.
    fn enforce_capacity(&mut self, chapter: u32, policy: &ThreadPolicy, report: &mut IngestReport) {
        if self.active.len() <= policy.max_active {
            return;
        }

        let mut newest_first = std::mem::take(&mut self.active);
        newest_first.reverse();
        newest_first.sort_by_key(|t| Reverse(t.position()));

        let mut critical = Vec::new();
        let mut normal = Vec::new();
        let mut background = Vec::new();
        for thread in newest_first {
            match thread.urgency {
                Urgency::Critical => critical.push(thread),
                Urgency::Normal => normal.push(thread),
                Urgency::Background => background.push(thread),
            }
        }

        let remaining = policy.max_active.saturating_sub(critical.len());
        let normal_share = (remaining as f32 * policy.normal_share).ceil() as usize;
        let unused_by_background = remaining.saturating_sub(background.len());
        let normal_slots = normal.len().min(normal_share.max(unused_by_background));
        let background_slots = background.len().min(remaining - normal_slots.min(remaining));

        let overflow_background = background.split_off(background_slots);
        let overflow_normal = normal.split_off(normal_slots);

        self.active = critical;
        self.active.extend(normal);
        self.active.extend(background);

        for mut thread in overflow_background.into_iter().chain(overflow_normal) {
            thread.close(ThreadStatus::Resolved, AUTO_RESOLVED_TAG);
            let identity = thread.normalized_id.clone().unwrap_or_default();
            tracing::debug!(identity = %identity, urgency = thread.urgency.name(), "Auto-resolved thread over capacity");
            self.retire(&thread, chapter);
            report.archived += 1;
            report.auto_resolved.push(identity);
        }
    }

    /// Drop archive entries past retention, then the oldest over the size cap.
    fn prune_archive(&mut self, chapter: u32, policy: &ThreadPolicy) {
        self.archive.retain(|a| {
            chapter.saturating_sub(a.resolved_chapter) <= policy.archive_retention_chapters
        });
        if self.archive.len() > policy.max_archived {
            self.archive.sort_by_key(|a| a.resolved_chapter);
            let excess = self.archive.len() - policy.max_archived;
            self.archive.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case(chapter: u32, subchapter: u8) -> CaseNumber {
        CaseNumber::new(chapter, subchapter).unwrap()
    }

    fn sarah_promise(description: &str) -> ThreadDeclaration {
        ThreadDeclaration::new(ThreadType::Promise, description).with_character("Sarah")
    }

    #[test]
    fn test_rephrased_promise_merges_to_later() {
        let policy = ThreadPolicy::default();
        let canon = StoryCanon::new();
        let mut ledger = ThreadLedger::new();

        ledger.ingest(case(1, 2), &[sarah_promise("meet Sarah at midnight")], &policy, &canon);
        let report = ledger.ingest(
            case(2, 1),
            &[sarah_promise("will see Sarah tonight at midnight")],
            &policy,
            &canon,
        );

        assert_eq!(report.merged, 1);
        assert_eq!(ledger.active().len(), 1);
        let thread = &ledger.active()[0];
        assert_eq!(thread.chapter, 2);
        assert_eq!(thread.description, "will see Sarah tonight at midnight");
        assert_eq!(thread.opened_chapter, 1);
    }

    #[test]
    fn test_higher_urgency_survives_later_update() {
        let policy = ThreadPolicy::default();
        let canon = StoryCanon::new();
        let mut ledger = ThreadLedger::new();

        ledger.ingest(
            case(1, 1),
            &[sarah_promise("meet Sarah at the docks").with_urgency(Urgency::Critical)],
            &policy,
            &canon,
        );
        ledger.ingest(case(1, 2), &[sarah_promise("meeting Sarah at the pier")], &policy, &canon);

        assert_eq!(ledger.active().len(), 1);
        assert_eq!(ledger.active()[0].urgency, Urgency::Critical);
        assert_eq!(ledger.active()[0].chapter, 1);
    }

    #[test]
    fn test_closed_identity_never_reopens() {
        let policy = ThreadPolicy::default();
        let canon = StoryCanon::new();
        let mut ledger = ThreadLedger::new();

        ledger.ingest(case(1, 1), &[sarah_promise("meet Sarah at midnight")], &policy, &canon);
        let report = ledger.ingest(
            case(1, 2),
            &[sarah_promise("meet Sarah at midnight").resolved("they met")],
            &policy,
            &canon,
        );
        assert_eq!(report.archived, 1);
        assert!(ledger.active().is_empty());
        assert_eq!(ledger.archive()[0].status, ThreadStatus::Resolved);

        let report = ledger.ingest(case(2, 1), &[sarah_promise("see Sarah at midnight")], &policy, &canon);
        assert_eq!(report.dropped_zombies, 1);
        assert!(ledger.active().is_empty());
    }

    #[test]
    fn test_terminal_and_active_in_one_batch() {
        let policy = ThreadPolicy::default();
        let canon = StoryCanon::new();
        let mut ledger = ThreadLedger::new();

        // The closing declaration arrives first; the stale active copy must not win.
        ledger.ingest(
            case(3, 1),
            &[
                sarah_promise("meet Sarah at midnight").failed("she never showed"),
                sarah_promise("meet Sarah at midnight"),
            ],
            &policy,
            &canon,
        );
        assert!(ledger.active().is_empty());
        assert_eq!(ledger.archive().len(), 1);
        assert_eq!(ledger.archive()[0].status, ThreadStatus::Failed);
    }

    #[test]
    fn test_ingest_is_idempotent() {
        let policy = ThreadPolicy::default();
        let canon = StoryCanon::new();
        let declarations = vec![
            sarah_promise("meet Sarah at midnight"),
            ThreadDeclaration::new(ThreadType::Investigation, "find the missing ledger"),
            ThreadDeclaration::new(ThreadType::Threat, "Marcus will kill the witness")
                .with_character("Marcus"),
        ];

        let mut ledger = ThreadLedger::new();
        ledger.ingest(case(2, 1), &declarations, &policy, &canon);
        let once = ledger.active().to_vec();
        ledger.ingest(case(2, 1), &declarations, &policy, &canon);
        assert_eq!(ledger.active(), once.as_slice());
        assert_eq!(once.len(), 3);
    }

    #[test]
    fn test_background_overflow_auto_resolves() {
        let policy = ThreadPolicy::default().with_max_active(20);
        let canon = StoryCanon::new();
        let mut ledger = ThreadLedger::new();

        let declarations: Vec<_> = (0..25)
            .map(|i| {
                ThreadDeclaration::new(ThreadType::Relationship, format!("rumor number {i}"))
                    .with_character(format!("Witness{i}"))
                    .with_urgency(Urgency::Background)
            })
            .collect();
        let report = ledger.ingest(case(1, 1), &declarations, &policy, &canon);

        assert_eq!(ledger.active().len(), 20);
        assert_eq!(report.auto_resolved.len(), 5);
        assert!(ledger
            .archive()
            .iter()
            .all(|a| a.status == ThreadStatus::Resolved));
        assert_eq!(ledger.archive().len(), 5);
    }

    #[test]
    fn test_critical_threads_always_kept() {
        let policy = ThreadPolicy::default().with_max_active(4);
        let canon = StoryCanon::new();
        let mut ledger = ThreadLedger::new();

        let mut declarations: Vec<_> = (0..3)
            .map(|i| {
                ThreadDeclaration::new(ThreadType::Threat, format!("bomb threat {i}"))
                    .with_character(format!("Bomber{i}"))
                    .with_urgency(Urgency::Critical)
            })
            .collect();
        declarations.extend((0..3).map(|i| {
            ThreadDeclaration::new(ThreadType::Promise, format!("favor owed {i}"))
                .with_character(format!("Friend{i}"))
        }));
        declarations.extend((0..3).map(|i| {
            ThreadDeclaration::new(ThreadType::Relationship, format!("old flame {i}"))
                .with_character(format!("Flame{i}"))
                .with_urgency(Urgency::Background)
        }));

        let report = ledger.ingest(case(1, 1), &declarations, &policy, &canon);
        let critical = ledger
            .active()
            .iter()
            .filter(|t| t.urgency == Urgency::Critical)
            .count();
        assert_eq!(critical, 3);
        assert_eq!(ledger.active().len(), 4);
        // One slot left: taken by a normal thread since the share rounds up.
        assert!(ledger.active().iter().any(|t| t.urgency == Urgency::Normal));
        assert_eq!(report.auto_resolved.len(), 5);
    }

    #[test]
    fn test_normals_take_unused_background_room() {
        let policy = ThreadPolicy::default().with_max_active(10);
        let canon = StoryCanon::new();
        let mut ledger = ThreadLedger::new();

        let declarations: Vec<_> = (0..12)
            .map(|i| {
                ThreadDeclaration::new(ThreadType::Investigation, format!("lead number {i}"))
                    .with_character(format!("Source{i}"))
            })
            .collect();
        let report = ledger.ingest(case(1, 1), &declarations, &policy, &canon);
        assert_eq!(ledger.active().len(), 10);
        assert_eq!(report.auto_resolved.len(), 2);
    }

    #[test]
    fn test_acknowledgments_escalate() {
        let policy = ThreadPolicy::default();
        let canon = StoryCanon::new();
        let mut ledger = ThreadLedger::new();

        ledger.ingest(case(1, 1), &[sarah_promise("meet Sarah at midnight")], &policy, &canon);
        let id = ledger.active()[0].normalized_id.clone().unwrap();

        let ack = sarah_promise("meet Sarah at midnight").with_progress(ThreadProgress::Acknowledged);
        let first = ledger.ingest(case(1, 2), &[ack.clone()], &policy, &canon);
        assert!(first.newly_overdue.is_empty());
        assert_eq!(ledger.acknowledgments(&id), 1);

        let second = ledger.ingest(case(1, 3), &[ack], &policy, &canon);
        assert_eq!(second.newly_overdue, vec![id.clone()]);
        assert!(ledger.is_overdue(&id));

        let advanced = sarah_promise("meet Sarah at midnight").with_progress(ThreadProgress::Advanced);
        ledger.ingest(case(2, 1), &[advanced], &policy, &canon);
        assert!(!ledger.is_overdue(&id));
        assert_eq!(ledger.acknowledgments(&id), 0);
    }

    #[test]
    fn test_fuzzy_merge_above_threshold() {
        let policy = ThreadPolicy::default().with_fuzzy_min_active(2);
        let canon = StoryCanon::new();
        let mut ledger = ThreadLedger::new();

        // Same people and action, different time of day: not an exact match.
        let report = ledger.ingest(
            case(2, 1),
            &[
                sarah_promise("meet Sarah in the morning"),
                sarah_promise("visit Sarah this evening"),
            ],
            &policy,
            &canon,
        );
        assert_eq!(report.merged, 1);
        assert_eq!(ledger.active().len(), 1);
        assert_eq!(ledger.active()[0].description, "visit Sarah this evening");
    }

    #[test]
    fn test_fuzzy_skipped_when_few_threads() {
        let policy = ThreadPolicy::default();
        let canon = StoryCanon::new();
        let mut ledger = ThreadLedger::new();
        ledger.ingest(
            case(2, 1),
            &[
                sarah_promise("meet Sarah in the morning"),
                sarah_promise("visit Sarah this evening"),
            ],
            &policy,
            &canon,
        );
        assert_eq!(ledger.active().len(), 2);
    }

    #[test]
    fn test_archive_retention_and_cap() {
        let policy = ThreadPolicy::default().with_max_archived(2);
        let canon = StoryCanon::new();
        let mut ledger = ThreadLedger::new();

        for chapter in 1..=3 {
            let closed = ThreadDeclaration::new(ThreadType::Investigation, format!("case file {chapter}"))
                .with_character(format!("Clerk{chapter}"))
                .resolved("filed");
            ledger.ingest(case(chapter, 1), &[closed], &policy, &canon);
        }
        assert_eq!(ledger.archive().len(), 2);
        assert_eq!(ledger.archive()[0].resolved_chapter, 2);

        // Everything falls out of the retention window eventually.
        ledger.ingest(case(9, 1), &[], &policy, &canon);
        assert!(ledger.archive().is_empty());
        // Tombstones outlive the archive.
        let id = ThreadLedger::identity_key(
            &ThreadDeclaration::new(ThreadType::Investigation, "case file 1").with_character("Clerk1"),
            case(9, 1),
            &canon,
        );
        assert!(ledger.is_closed(&id));
    }

    #[test]
    fn test_archive_summary_truncated() {
        let long = "x".repeat(200);
        let decl = ThreadDeclaration::new(ThreadType::Revelation, long)
            .with_character("A")
            .with_character("B")
            .with_character("C")
            .with_character("D")
            .resolved("done");
        let thread = NarrativeThread::from_declaration(&decl, case(1, 1));
        let archived = ArchivedThread::from_thread(&thread, "id".into(), 1);
        assert_eq!(archived.summary.chars().count(), 80);
        assert_eq!(archived.characters.len(), 3);
    }
}

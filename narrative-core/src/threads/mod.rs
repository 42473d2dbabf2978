//! Narrative thread lifecycle.
//!
//! Generated units declare the open obligations of the story (appointments,
//! promises, threats, investigations...). The [`ThreadLedger`] of a branch
//! folds those declarations into a bounded active set:
//!
//! ```text
//! declarations ──► normalize ──► tombstone check ──► exact merge
//!                                                        │
//!       prune archive ◄── cap active ◄── archive ◄── fuzzy merge
//! ```
//!
//! Statuses only ever move `active → resolved | failed`, and an identity that
//! has closed is never reopened by a later declaration.

mod identity;
mod ledger;
mod thread;

pub use identity::{stem, ThreadIdentity, TimeBucket};
pub use ledger::{ArchivedThread, IngestReport, ThreadLedger};
pub use thread::{
    NarrativeThread, ThreadDeclaration, ThreadProgress, ThreadStatus, ThreadType, Urgency,
    AUTO_RESOLVED_TAG,
};

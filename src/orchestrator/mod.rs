//! The scheduling loop over the issue board.
//!
//! Each cycle picks the highest priority open issue, dispatches it to its
//! assignee, judges the reply and, when accepted, applies code, updates the
//! issue and runs the check for the inferred stage.

pub mod judge;
pub mod reply;
pub mod runner;
pub mod stage;
pub mod state;

pub use judge::{BinaryAnswer, Judge, ResponseScore};
pub use runner::{OrchestrationReport, Orchestrator, UNASSIGNED};
pub use stage::{Stage, StageCommands, StageRunner};
pub use state::{CycleJournal, JournalEntry, Phase};

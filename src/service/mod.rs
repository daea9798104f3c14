//! Service layer: the tracker pipelines and their building blocks.
//!
//! [`PollService`] and [`UpdateService`] drive a [`TrackerSession`]
//! through their journaled stages. [`JournalManager`] owns the run state
//! machine, [`for_each_window`] walks large stages in commit windows and
//! [`CallsignConflictResolver`] keeps callsign writes clear of the unique
//! index. [`EventIngester`] applies pushed match events.
//!
//! [`TrackerSession`]: crate::persistence::TrackerSession

pub mod conflict;
pub mod ingest;
pub mod journal;
pub mod poll;
pub mod ranking;
pub mod status;
pub mod update;
pub mod windowed;

pub use conflict::{CallsignConflictResolver, CallsignWrite};
pub use ingest::{EventIngester, IngestOutcome};
pub use journal::{JournalManager, RunStart, error_chain};
pub use poll::{LiveMatch, LiveSighting, PollService, SeenPlayers, record_seen_players};
pub use ranking::{RankAssigner, RankingEngine};
pub use status::{JournalStatusReport, JournalSummary};
pub use update::{UpdateService, common_regions, match_aggregates};
pub use windowed::{
    LastSeenSource, WindowBatch, WindowSource, WindowedStage, build_windows, for_each_window,
    plan_windows,
};

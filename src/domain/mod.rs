//! Domain layer: tracked entities, run journals and pure tracker rules.
//!
//! Nothing in here performs I/O. Players, matches, presence intervals and
//! stats snapshots are plain data; the derived-metric thresholds, region
//! families and the journal state machine are pure functions over them.

pub mod event;
pub mod ids;
pub mod journal;
pub mod match_info;
pub mod player;
pub mod region;
pub mod snapshot;

pub use event::{EventPlayer, MatchEvent, MatchEventKind};
pub use ids::{BOT_PLAYER_ID, MatchId, PlayerId};
pub use journal::{
    Flag, Journal, JournalRow, JournalTable, Pipeline, PollCounters, PollFlag, PollJournal,
    PollPipeline, PollStage, RunStatus, Stage, UpdateCounters, UpdateFlag, UpdateJournal,
    UpdatePipeline, UpdateStage,
};
pub use match_info::{Match, MatchAggregate, MatchPlayer, MatchSummary, ServerInfo, ServerListing};
pub use player::{Player, callsign_key};
pub use region::{most_common_region, region_family};
pub use snapshot::{PlayerStatsSnapshot, RankedField, RawStats};

//! Run journals for the poll and update pipelines.
//!
//! A [`Journal`] is one row per pipeline run, keyed by its start time. It
//! records the run status, the pipeline-specific stage, the step counters
//! used to resume a stage mid-way, the run flags and the result counters.
//!
//! The two pipelines share the same state machine and differ only in
//! their stage/flag enums and counters, which is expressed through the
//! [`Pipeline`] trait.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::TrackerError;

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created but not yet picked up.
    NotStarted,
    /// Currently executing.
    InProgress,
    /// Aborted by an error; resumable.
    Failed,
    /// Finished successfully.
    Complete,
}

impl RunStatus {
    /// Stored integer code.
    #[must_use]
    pub const fn code(self) -> i16 {
        match self {
            Self::NotStarted => 0,
            Self::InProgress => 1,
            Self::Failed => 2,
            Self::Complete => 3,
        }
    }

    /// Parses a stored integer code.
    #[must_use]
    pub const fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(Self::NotStarted),
            1 => Some(Self::InProgress),
            2 => Some(Self::Failed),
            3 => Some(Self::Complete),
            _ => None,
        }
    }

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Failed => "failed",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pipeline stage enum with stable storage codes.
pub trait Stage: Copy + Eq + Ord + fmt::Debug + Send + Sync + 'static {
    /// Stage of a journal that has not run yet.
    const INITIAL: Self;

    /// Stored integer code.
    fn code(self) -> i16;

    /// Parses a stored integer code.
    fn from_code(code: i16) -> Option<Self>;

    /// Lowercase name.
    fn as_str(self) -> &'static str;
}

/// A run modifier with a stable storage name.
pub trait Flag: Copy + Eq + Ord + fmt::Debug + Send + Sync + 'static {
    /// Stored name.
    fn as_str(self) -> &'static str;

    /// Parses a stored name.
    fn parse(name: &str) -> Option<Self>;
}

/// Which journal table a pipeline writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalTable {
    /// `poll_journals`.
    Poll,
    /// `update_journals`.
    Update,
}

impl JournalTable {
    /// SQL table name.
    #[must_use]
    pub const fn table_name(self) -> &'static str {
        match self {
            Self::Poll => "poll_journals",
            Self::Update => "update_journals",
        }
    }
}

/// Ties together the stage, flag and counter types of one pipeline.
pub trait Pipeline: fmt::Debug + Clone + PartialEq + Send + Sync + 'static {
    /// Stage enum.
    type Stage: Stage;
    /// Flag enum.
    type Flag: Flag;
    /// Result counters recorded on the journal.
    type Counters: fmt::Debug
        + Clone
        + Default
        + PartialEq
        + Serialize
        + DeserializeOwned
        + Send
        + Sync;

    /// Journal table.
    const TABLE: JournalTable;
    /// Name used in logs.
    const NAME: &'static str;
}

/// Stages of the poll pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PollStage {
    /// Not started.
    NotStarted,
    /// Fetching the live server list.
    FetchServers,
    /// Writing seen players.
    Players,
    /// Writing seen matches.
    Matches,
    /// Done.
    Complete,
}

impl Stage for PollStage {
    const INITIAL: Self = Self::NotStarted;

    fn code(self) -> i16 {
        match self {
            Self::NotStarted => 0,
            Self::Complete => 1,
            Self::FetchServers => 2,
            Self::Players => 3,
            Self::Matches => 4,
        }
    }

    fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(Self::NotStarted),
            1 => Some(Self::Complete),
            2 => Some(Self::FetchServers),
            3 => Some(Self::Players),
            4 => Some(Self::Matches),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::FetchServers => "fetch_servers",
            Self::Players => "players",
            Self::Matches => "matches",
            Self::Complete => "complete",
        }
    }
}

/// Stages of the update pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UpdateStage {
    /// Not started.
    NotStarted,
    /// Refreshing player snapshots.
    Players,
    /// Recomputing match aggregates.
    Matches,
    /// Rebuilding the rank store.
    GlobalRankings,
    /// Done.
    Complete,
}

impl Stage for UpdateStage {
    const INITIAL: Self = Self::NotStarted;

    fn code(self) -> i16 {
        match self {
            Self::NotStarted => 0,
            Self::Complete => 1,
            Self::Players => 2,
            Self::Matches => 3,
            Self::GlobalRankings => 4,
        }
    }

    fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(Self::NotStarted),
            1 => Some(Self::Complete),
            2 => Some(Self::Players),
            3 => Some(Self::Matches),
            4 => Some(Self::GlobalRankings),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Players => "players",
            Self::Matches => "matches",
            Self::GlobalRankings => "global_rankings",
            Self::Complete => "complete",
        }
    }
}

/// Poll run modifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PollFlag {
    /// Keep live matches that currently have no players.
    KeepEmptyMatches,
}

impl Flag for PollFlag {
    fn as_str(self) -> &'static str {
        match self {
            Self::KeepEmptyMatches => "keep_empty_matches",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "keep_empty_matches" => Some(Self::KeepEmptyMatches),
            _ => None,
        }
    }
}

/// Update run modifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UpdateFlag {
    /// Refresh every player, not only those seen since the last update.
    AllPlayers,
    /// Recompute every match, not only those seen since the last update.
    AllMatches,
    /// Refresh callsigns alongside stats.
    UpdateCallsigns,
}

impl Flag for UpdateFlag {
    fn as_str(self) -> &'static str {
        match self {
            Self::AllPlayers => "players",
            Self::AllMatches => "matches",
            Self::UpdateCallsigns => "callsigns",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "players" => Some(Self::AllPlayers),
            "matches" => Some(Self::AllMatches),
            "callsigns" => Some(Self::UpdateCallsigns),
            _ => None,
        }
    }
}

/// Counters recorded by a poll run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollCounters {
    /// Known players marked seen.
    pub players_updated: u64,
    /// New players inserted.
    pub players_added: u64,
    /// Known matches refreshed.
    pub matches_updated: u64,
    /// New matches inserted.
    pub matches_added: u64,
}

/// Counters recorded by an update run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateCounters {
    /// Players that received a new snapshot.
    pub players_updated: u64,
    /// Matches whose aggregates were recomputed.
    pub matches_updated: u64,
    /// Callsigns refreshed.
    pub callsigns_updated: u64,
    /// Rank store rebuilt.
    pub global_rankings_updated: bool,
}

/// Marker for the poll pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPipeline;

impl Pipeline for PollPipeline {
    type Stage = PollStage;
    type Flag = PollFlag;
    type Counters = PollCounters;

    const TABLE: JournalTable = JournalTable::Poll;
    const NAME: &'static str = "poll";
}

/// Marker for the update pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdatePipeline;

impl Pipeline for UpdatePipeline {
    type Stage = UpdateStage;
    type Flag = UpdateFlag;
    type Counters = UpdateCounters;

    const TABLE: JournalTable = JournalTable::Update;
    const NAME: &'static str = "update";
}

/// Journal of the poll pipeline.
pub type PollJournal = Journal<PollPipeline>;
/// Journal of the update pipeline.
pub type UpdateJournal = Journal<UpdatePipeline>;

/// Persisted record of one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct Journal<P: Pipeline> {
    /// Run start; primary key.
    pub start: DateTime<Utc>,
    /// Time the run last ended (failed or completed).
    pub end: Option<DateTime<Utc>>,
    /// Seconds spent across every attempt of this run.
    pub time_elapsed: f64,
    /// Run status.
    pub status: RunStatus,
    /// Current stage.
    pub stage: P::Stage,
    /// Last committed step within the stage.
    pub current_step: Option<usize>,
    /// Steps in the current stage.
    pub total_steps: Option<usize>,
    /// Run modifiers.
    pub flags: BTreeSet<P::Flag>,
    /// Result counters.
    pub counters: P::Counters,
}

impl<P: Pipeline> Journal<P> {
    /// Creates a fresh, not-yet-started journal.
    #[must_use]
    pub fn new(start: DateTime<Utc>, flags: BTreeSet<P::Flag>) -> Self {
        Self {
            start,
            end: None,
            time_elapsed: 0.0,
            status: RunStatus::NotStarted,
            stage: P::Stage::INITIAL,
            current_step: None,
            total_steps: None,
            flags,
            counters: P::Counters::default(),
        }
    }

    /// Returns `true` when the journal blocks a new run from starting.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self.status, RunStatus::NotStarted | RunStatus::InProgress)
    }

    /// Returns `true` when `flag` is set.
    #[must_use]
    pub fn has_flag(&self, flag: P::Flag) -> bool {
        self.flags.contains(&flag)
    }

    /// Marks the journal as executing.
    pub fn begin(&mut self) {
        self.status = RunStatus::InProgress;
    }

    /// Enters a stage of `total` steps and returns the step to start from.
    ///
    /// On a fresh stage this is 0; on resume it is the last checkpoint,
    /// capped at `total`.
    pub fn stage_start(&mut self, total: usize) -> usize {
        let current = self.current_step.unwrap_or(0).min(total);
        self.current_step = Some(current);
        self.total_steps = Some(total);
        current
    }

    /// Records that `current` steps of the stage are done.
    pub fn stage_checkpoint(&mut self, current: usize) {
        self.current_step = Some(current);
    }

    /// Advances to `next`, clearing the step counters.
    pub fn stage_next(&mut self, next: P::Stage) {
        self.current_step = None;
        self.total_steps = None;
        self.stage = next;
    }

    /// Percentage of the current stage done; `None` when unknown.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stage_progress(&self) -> Option<f64> {
        let (Some(current), Some(total)) = (self.current_step, self.total_steps) else {
            return None;
        };
        if total == 0 {
            return Some(0.0);
        }
        Some(current as f64 / total as f64 * 100.0)
    }

    /// Marks the run failed, keeping the checkpoint.
    pub fn fail(&mut self, run_start: DateTime<Utc>) {
        self.finish(run_start);
        self.status = RunStatus::Failed;
    }

    /// Marks the run complete and clears the step counters.
    pub fn complete(&mut self, run_start: DateTime<Utc>) {
        self.finish(run_start);
        self.status = RunStatus::Complete;
        self.current_step = None;
        self.total_steps = None;
    }

    #[allow(clippy::cast_precision_loss)]
    fn finish(&mut self, run_start: DateTime<Utc>) {
        let now = Utc::now();
        let spent = (now - run_start).num_milliseconds().max(0) as f64 / 1000.0;
        self.time_elapsed += spent;
        self.end = Some(now);
    }

    /// Flags as their stored names, sorted.
    #[must_use]
    pub fn flag_names(&self) -> Vec<String> {
        self.flags.iter().map(|f| f.as_str().to_string()).collect()
    }

    /// Converts to the storage row.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Persistence`] if the counters cannot be
    /// serialized.
    pub fn to_row(&self) -> Result<JournalRow, TrackerError> {
        Ok(JournalRow {
            start: self.start,
            end: self.end,
            time_elapsed: self.time_elapsed,
            status: self.status.code(),
            stage: self.stage.code(),
            current_step: self.current_step.map(to_i64),
            total_steps: self.total_steps.map(to_i64),
            flags: self.flag_names(),
            counters: serde_json::to_value(&self.counters)?,
        })
    }

    /// Rebuilds a journal from its storage row.
    ///
    /// Unknown flag names are dropped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Persistence`] on an unknown status or stage
    /// code, negative step counters or malformed counters.
    pub fn from_row(row: JournalRow) -> Result<Self, TrackerError> {
        let status = RunStatus::from_code(row.status).ok_or_else(|| {
            TrackerError::Persistence(format!("unknown {} status code {}", P::NAME, row.status))
        })?;
        let stage = P::Stage::from_code(row.stage).ok_or_else(|| {
            TrackerError::Persistence(format!("unknown {} stage code {}", P::NAME, row.stage))
        })?;
        let mut flags = BTreeSet::new();
        for name in &row.flags {
            match P::Flag::parse(name) {
                Some(flag) => {
                    flags.insert(flag);
                }
                None => tracing::warn!(
                    pipeline = P::NAME,
                    flag = %name,
                    "ignoring unknown journal flag"
                ),
            }
        }
        Ok(Self {
            start: row.start,
            end: row.end,
            time_elapsed: row.time_elapsed,
            status,
            stage,
            current_step: row.current_step.map(to_usize).transpose()?,
            total_steps: row.total_steps.map(to_usize).transpose()?,
            flags,
            counters: serde_json::from_value(row.counters)?,
        })
    }
}

fn to_i64(v: usize) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn to_usize(v: i64) -> Result<usize, TrackerError> {
    usize::try_from(v).map_err(|_| TrackerError::Persistence(format!("negative step counter {v}")))
}

/// Storage shape of a journal, shared by both journal tables.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalRow {
    /// Run start.
    pub start: DateTime<Utc>,
    /// Run end.
    pub end: Option<DateTime<Utc>>,
    /// Accumulated seconds.
    pub time_elapsed: f64,
    /// [`RunStatus::code`].
    pub status: i16,
    /// [`Stage::code`].
    pub stage: i16,
    /// Checkpoint.
    pub current_step: Option<i64>,
    /// Steps in stage.
    pub total_steps: Option<i64>,
    /// [`Flag::as_str`] names.
    pub flags: Vec<String>,
    /// Serialized counters.
    pub counters: serde_json::Value,
}

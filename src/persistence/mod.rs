//! Persistence layer: relational session, rank store and API token store.
//!
//! Pipelines never talk to a database directly. They drive a
//! [`TrackerSession`], a transactional unit of work over the relational
//! store, and write rankings through a [`RankStore`]. The concrete
//! implementations are PostgreSQL ([`postgres::PgSession`]) and Redis
//! ([`redis_store::RedisStore`]). Tests run against in-process versions
//! with the same semantics.

#[cfg(test)]
pub mod memory;
pub mod postgres;
pub mod redis_store;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    JournalRow, JournalTable, Match, MatchAggregate, MatchId, MatchPlayer, Player, PlayerId,
    PlayerStatsSnapshot, RankedField,
};
use crate::error::TrackerError;

#[cfg(test)]
pub use memory::{MemoryRankStore, MemorySession, MemoryStore, MemoryTokenStore};
pub use postgres::PgSession;
pub use redis_store::RedisStore;

/// Ordered column a windowed stage iterates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDomain {
    /// `players.last_seen`.
    PlayersLastSeen,
    /// `matches.last_seen`.
    MatchesLastSeen,
}

impl WindowDomain {
    /// Table the domain lives in.
    #[must_use]
    pub const fn table(self) -> &'static str {
        match self {
            Self::PlayersLastSeen => "players",
            Self::MatchesLastSeen => "matches",
        }
    }
}

impl fmt::Display for WindowDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.last_seen", self.table())
    }
}

/// A half-open range `[start, end)` of an ordered column; open-ended when
/// `end` is `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window<K> {
    /// Inclusive lower bound.
    pub start: K,
    /// Exclusive upper bound.
    pub end: Option<K>,
}

impl<K: PartialOrd> Window<K> {
    /// Returns `true` when `key` falls inside the window.
    pub fn contains(&self, key: &K) -> bool {
        *key >= self.start && self.end.as_ref().is_none_or(|end| key < end)
    }
}

/// Extra conditions narrowing a window domain beyond its bounds.
///
/// The same filter must reach sampling, counting and the batch query so
/// the planned windows cover exactly the rows the stage processes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowFilter {
    /// Leave blacklisted players out. Matches are never blacklisted.
    pub skip_blacklisted: bool,
    /// Only rows first seen at or after this instant.
    pub first_seen_since: Option<DateTime<Utc>>,
}

impl WindowFilter {
    /// Returns `true` when a row with these attributes passes the filter.
    #[must_use]
    pub fn admits(&self, first_seen: DateTime<Utc>, blacklisted: bool) -> bool {
        !(self.skip_blacklisted && blacklisted)
            && self.first_seen_since.is_none_or(|since| first_seen >= since)
    }
}

/// Per-player match count in one server region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionCount {
    /// Player.
    pub player_id: PlayerId,
    /// Raw server region.
    pub region: String,
    /// Distinct matches played there.
    pub matches: u64,
}

/// Latest-snapshot values of one match participant.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantStats {
    /// Match.
    pub match_id: MatchId,
    /// Ranked MMR, `None` if unranked.
    pub mmr: Option<f64>,
    /// Pilot level.
    pub pilot_level: i32,
}

/// A transactional unit of work over the relational store.
///
/// A transaction begins implicitly on the first statement after creation
/// or after [`commit`](Self::commit)/[`rollback`](Self::rollback).
/// Everything written since the last commit is discarded by `rollback`.
#[async_trait]
pub trait TrackerSession: Send {
    /// Commits the open transaction, if any.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] on store failure.
    async fn commit(&mut self) -> Result<(), TrackerError>;

    /// Discards the open transaction, if any.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] on store failure.
    async fn rollback(&mut self) -> Result<(), TrackerError>;

    /// Creates a named savepoint in the open transaction.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] on store failure.
    async fn savepoint(&mut self, name: &str) -> Result<(), TrackerError>;

    /// Undoes everything written since the savepoint, keeping it.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] on store failure or unknown savepoint.
    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), TrackerError>;

    /// Forgets a savepoint, keeping its writes.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] on store failure or unknown savepoint.
    async fn release_savepoint(&mut self, name: &str) -> Result<(), TrackerError>;

    /// Loads the journal with the latest start.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] on store failure.
    async fn last_journal(&mut self, table: JournalTable)
    -> Result<Option<JournalRow>, TrackerError>;

    /// Start time of the latest complete journal.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] on store failure.
    async fn last_completed_start(
        &mut self,
        table: JournalTable,
    ) -> Result<Option<DateTime<Utc>>, TrackerError>;

    /// Inserts or overwrites the journal keyed by `row.start`.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] on store failure.
    async fn save_journal(&mut self, table: JournalTable, row: &JournalRow)
    -> Result<(), TrackerError>;

    /// Loads the known players among `ids`.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] on store failure.
    async fn find_players(&mut self, ids: &[PlayerId]) -> Result<Vec<Player>, TrackerError>;

    /// Moves `last_seen` forward to `at` for the known players among `ids`.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] on store failure.
    async fn mark_players_seen(
        &mut self,
        ids: &[PlayerId],
        at: DateTime<Utc>,
    ) -> Result<u64, TrackerError>;

    /// Inserts new players.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::UniqueViolation`] when a callsign collides
    /// with a stored one, or another [`TrackerError`] on store failure.
    async fn insert_players(&mut self, players: &[Player]) -> Result<(), TrackerError>;

    /// Overwrites callsigns; `None` clears.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::UniqueViolation`] when a callsign collides
    /// with a stored one, or another [`TrackerError`] on store failure.
    async fn set_callsigns(
        &mut self,
        callsigns: &[(PlayerId, Option<String>)],
    ) -> Result<(), TrackerError>;

    /// Players whose stored callsign matches one of `keys`, which are
    /// already case-folded.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] on store failure.
    async fn find_callsign_owners(&mut self, keys: &[String])
    -> Result<Vec<PlayerId>, TrackerError>;

    /// Loads the known matches among `ids`.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] on store failure.
    async fn find_matches(&mut self, ids: &[MatchId]) -> Result<Vec<Match>, TrackerError>;

    /// Inserts or fully overwrites matches.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] on store failure.
    async fn upsert_matches(&mut self, matches: &[Match]) -> Result<(), TrackerError>;

    /// Loads presence rows of `players` in `match_id`.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] on store failure.
    async fn find_match_players(
        &mut self,
        match_id: &MatchId,
        players: &[PlayerId],
    ) -> Result<Vec<MatchPlayer>, TrackerError>;

    /// Inserts or fully overwrites presence rows.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] on store failure.
    async fn upsert_match_players(&mut self, rows: &[MatchPlayer]) -> Result<(), TrackerError>;

    /// Every `size`th value of the filtered, ordered domain restricted to
    /// `[begin, end)`, starting with the first.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] on store failure.
    async fn window_boundaries(
        &mut self,
        domain: WindowDomain,
        filter: &WindowFilter,
        size: usize,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<DateTime<Utc>>, TrackerError>;

    /// Filtered rows of the domain inside `window`.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] on store failure.
    async fn count_in_window(
        &mut self,
        domain: WindowDomain,
        filter: &WindowFilter,
        window: &Window<DateTime<Utc>>,
    ) -> Result<u64, TrackerError>;

    /// Players passing `filter` whose `last_seen` falls in `window`,
    /// ordered by it.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] on store failure.
    async fn players_in_window(
        &mut self,
        filter: &WindowFilter,
        window: &Window<DateTime<Utc>>,
    ) -> Result<Vec<PlayerId>, TrackerError>;

    /// Matches passing `filter` whose `last_seen` falls in `window`,
    /// ordered by it.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] on store failure.
    async fn matches_in_window(
        &mut self,
        filter: &WindowFilter,
        window: &Window<DateTime<Utc>>,
    ) -> Result<Vec<MatchId>, TrackerError>;

    /// Writes snapshots, replacing any with the same key.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] on store failure.
    async fn insert_snapshots(
        &mut self,
        snapshots: &[PlayerStatsSnapshot],
    ) -> Result<(), TrackerError>;

    /// Points each player's latest snapshot at `taken`.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] on store failure.
    async fn set_latest_snapshots(
        &mut self,
        ids: &[PlayerId],
        taken: DateTime<Utc>,
    ) -> Result<(), TrackerError>;

    /// Per-player distinct match counts by raw server region.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] on store failure.
    async fn player_region_counts(
        &mut self,
        ids: &[PlayerId],
    ) -> Result<Vec<RegionCount>, TrackerError>;

    /// Overwrites common regions; `None` clears.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] on store failure.
    async fn set_common_regions(
        &mut self,
        regions: &[(PlayerId, Option<String>)],
    ) -> Result<(), TrackerError>;

    /// Latest-snapshot values of every participant of `ids` that has one.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] on store failure.
    async fn match_participant_stats(
        &mut self,
        ids: &[MatchId],
    ) -> Result<Vec<ParticipantStats>, TrackerError>;

    /// Overwrites match aggregates.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] on store failure.
    async fn set_match_aggregates(
        &mut self,
        aggregates: &[(MatchId, MatchAggregate)],
    ) -> Result<(), TrackerError>;

    /// Opens a cursor over `(player, value)` for non-blacklisted players'
    /// latest snapshots, excluding NULL and the field's unset value,
    /// ordered by value descending then player ascending.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] on store failure or if a cursor is
    /// already open.
    async fn open_rank_cursor(&mut self, field: RankedField) -> Result<(), TrackerError>;

    /// Fetches up to `limit` rows from the open cursor; empty when drained.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] on store failure or if no cursor is open.
    async fn fetch_rank_batch(
        &mut self,
        limit: usize,
    ) -> Result<Vec<(PlayerId, f64)>, TrackerError>;

    /// Closes the open cursor, if any.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] on store failure.
    async fn close_rank_cursor(&mut self) -> Result<(), TrackerError>;
}

/// Key-value store holding the derived global rankings.
#[async_trait]
pub trait RankStore: Send + Sync + fmt::Debug {
    /// Deletes every entry of `field`, including its total.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::RankStore`] on store failure.
    async fn clear_field(&self, field: RankedField) -> Result<(), TrackerError>;

    /// Sets ranks for a batch of players.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::RankStore`] on store failure.
    async fn set_ranks(&self, field: RankedField, ranks: &[(PlayerId, u64)])
    -> Result<(), TrackerError>;

    /// Sets the number of ranked players.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::RankStore`] on store failure.
    async fn set_total(&self, field: RankedField, total: u64) -> Result<(), TrackerError>;

    /// Rank of `player` in `field`.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::RankStore`] on store failure.
    async fn get_rank(&self, field: RankedField, player: &PlayerId)
    -> Result<Option<u64>, TrackerError>;

    /// Number of ranked players in `field`.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::RankStore`] on store failure.
    async fn get_total(&self, field: RankedField) -> Result<Option<u64>, TrackerError>;
}

/// Durable home of the stats API access grant.
#[async_trait]
pub trait TokenStore: Send + Sync + fmt::Debug {
    /// Loads the persisted token.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::RankStore`] on store failure.
    async fn load_token(&self) -> Result<Option<String>, TrackerError>;

    /// Persists `token`.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::RankStore`] on store failure.
    async fn store_token(&self, token: &str) -> Result<(), TrackerError>;
}

//! In-memory persistence with the same transactional semantics as the
//! PostgreSQL and Redis stores.
//!
//! A [`MemorySession`] works on a private copy of the committed state and
//! publishes it on commit, so uncommitted writes are invisible to other
//! sessions and vanish on rollback. Savepoints are stacked copies. The
//! case-insensitive callsign index is enforced like the real unique index.
//!
//! [`MemoryStore::fail_once`] makes the next call of a named operation
//! fail, which is how pipeline tests simulate mid-run crashes.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    ParticipantStats, RankStore, RegionCount, TokenStore, TrackerSession, Window, WindowDomain,
    WindowFilter,
};
use crate::domain::{
    JournalRow, JournalTable, Match, MatchAggregate, MatchId, MatchPlayer, Player, PlayerId,
    PlayerStatsSnapshot, RankedField, RunStatus, callsign_key,
};
use crate::error::{CALLSIGN_CONSTRAINT, TrackerError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    players: BTreeMap<PlayerId, Player>,
    matches: BTreeMap<MatchId, Match>,
    match_players: BTreeMap<(MatchId, PlayerId), MatchPlayer>,
    snapshots: BTreeMap<(PlayerId, DateTime<Utc>), PlayerStatsSnapshot>,
    poll_journals: BTreeMap<DateTime<Utc>, JournalRow>,
    update_journals: BTreeMap<DateTime<Utc>, JournalRow>,
}

impl MemoryState {
    fn journals(&self, table: JournalTable) -> &BTreeMap<DateTime<Utc>, JournalRow> {
        match table {
            JournalTable::Poll => &self.poll_journals,
            JournalTable::Update => &self.update_journals,
        }
    }

    fn journals_mut(&mut self, table: JournalTable) -> &mut BTreeMap<DateTime<Utc>, JournalRow> {
        match table {
            JournalTable::Poll => &mut self.poll_journals,
            JournalTable::Update => &mut self.update_journals,
        }
    }

    fn last_seen_values(&self, domain: WindowDomain, filter: &WindowFilter) -> Vec<DateTime<Utc>> {
        let mut values: Vec<DateTime<Utc>> = match domain {
            WindowDomain::PlayersLastSeen => self
                .players
                .values()
                .filter(|p| filter.admits(p.first_seen, p.blacklisted))
                .map(|p| p.last_seen)
                .collect(),
            WindowDomain::MatchesLastSeen => self
                .matches
                .values()
                .filter(|m| filter.admits(m.first_seen, false))
                .map(|m| m.last_seen)
                .collect(),
        };
        values.sort();
        values
    }

    fn latest_snapshot(&self, player: &Player) -> Option<&PlayerStatsSnapshot> {
        let taken = player.latest_snapshot?;
        self.snapshots.get(&(player.id.clone(), taken))
    }
}

fn check_callsign_index(players: &BTreeMap<PlayerId, Player>) -> Result<(), TrackerError> {
    let mut seen = HashSet::new();
    for callsign in players.values().filter_map(|p| p.callsign.as_deref()) {
        if !seen.insert(callsign_key(callsign)) {
            return Err(TrackerError::UniqueViolation {
                constraint: CALLSIGN_CONSTRAINT.to_string(),
            });
        }
    }
    Ok(())
}

/// Shared committed state; hand out sessions with [`MemoryStore::session`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    committed: Arc<Mutex<MemoryState>>,
    fail_points: Arc<Mutex<Vec<String>>>,
    commits: Arc<Mutex<u64>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new session.
    #[must_use]
    pub fn session(&self) -> MemorySession {
        MemorySession {
            store: self.clone(),
            working: None,
            savepoints: Vec::new(),
            cursor: None,
        }
    }

    /// Makes the next call of `operation` fail with a persistence error.
    pub fn fail_once(&self, operation: &str) {
        lock(&self.fail_points).push(operation.to_string());
    }

    /// Number of commits that published writes.
    #[must_use]
    pub fn commits(&self) -> u64 {
        *lock(&self.commits)
    }

    /// Adds a committed player.
    pub fn seed_player(&self, player: Player) {
        lock(&self.committed).players.insert(player.id.clone(), player);
    }

    /// Adds a committed match.
    pub fn seed_match(&self, game: Match) {
        lock(&self.committed).matches.insert(game.id.clone(), game);
    }

    /// Adds a committed presence row.
    pub fn seed_match_player(&self, row: MatchPlayer) {
        lock(&self.committed)
            .match_players
            .insert((row.match_id.clone(), row.player_id.clone()), row);
    }

    /// Adds a committed snapshot and points the player at it.
    pub fn seed_snapshot(&self, snapshot: PlayerStatsSnapshot) {
        let mut state = lock(&self.committed);
        if let Some(player) = state.players.get_mut(&snapshot.player_id) {
            player.latest_snapshot = Some(snapshot.snapshot_taken);
        }
        state
            .snapshots
            .insert((snapshot.player_id.clone(), snapshot.snapshot_taken), snapshot);
    }

    /// Adds a committed journal row.
    pub fn seed_journal(&self, table: JournalTable, row: JournalRow) {
        lock(&self.committed).journals_mut(table).insert(row.start, row);
    }

    /// Committed player by id.
    #[must_use]
    pub fn player(&self, id: &PlayerId) -> Option<Player> {
        lock(&self.committed).players.get(id).cloned()
    }

    /// Every committed player, ordered by id.
    #[must_use]
    pub fn players(&self) -> Vec<Player> {
        lock(&self.committed).players.values().cloned().collect()
    }

    /// Committed match by id.
    #[must_use]
    pub fn game(&self, id: &MatchId) -> Option<Match> {
        lock(&self.committed).matches.get(id).cloned()
    }

    /// Every committed match, ordered by id.
    #[must_use]
    pub fn matches(&self) -> Vec<Match> {
        lock(&self.committed).matches.values().cloned().collect()
    }

    /// Every committed presence row.
    #[must_use]
    pub fn match_players(&self) -> Vec<MatchPlayer> {
        lock(&self.committed).match_players.values().cloned().collect()
    }

    /// Every committed snapshot.
    #[must_use]
    pub fn snapshots(&self) -> Vec<PlayerStatsSnapshot> {
        lock(&self.committed).snapshots.values().cloned().collect()
    }

    /// Committed journal rows, oldest first.
    #[must_use]
    pub fn journal_rows(&self, table: JournalTable) -> Vec<JournalRow> {
        lock(&self.committed).journals(table).values().cloned().collect()
    }

    fn take_fail_point(&self, operation: &str) -> Result<(), TrackerError> {
        let mut points = lock(&self.fail_points);
        if let Some(pos) = points.iter().position(|p| p == operation) {
            points.remove(pos);
            return Err(TrackerError::Persistence(format!(
                "injected failure in {operation}"
            )));
        }
        Ok(())
    }
}

/// A unit of work over a [`MemoryStore`].
#[derive(Debug)]
pub struct MemorySession {
    store: MemoryStore,
    working: Option<MemoryState>,
    savepoints: Vec<(String, MemoryState)>,
    cursor: Option<VecDeque<(PlayerId, f64)>>,
}

impl MemorySession {
    fn state(&mut self) -> &mut MemoryState {
        let committed = &self.store.committed;
        self.working.get_or_insert_with(|| lock(committed).clone())
    }

    fn enter(&mut self, operation: &str) -> Result<&mut MemoryState, TrackerError> {
        self.store.take_fail_point(operation)?;
        Ok(self.state())
    }
}

#[async_trait]
impl TrackerSession for MemorySession {
    async fn commit(&mut self) -> Result<(), TrackerError> {
        self.store.take_fail_point("commit")?;
        self.savepoints.clear();
        if let Some(state) = self.working.take() {
            *lock(&self.store.committed) = state;
            *lock(&self.store.commits) += 1;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), TrackerError> {
        self.working = None;
        self.savepoints.clear();
        self.cursor = None;
        Ok(())
    }

    async fn savepoint(&mut self, name: &str) -> Result<(), TrackerError> {
        let snapshot = self.state().clone();
        self.savepoints.push((name.to_string(), snapshot));
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), TrackerError> {
        let pos = self
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| TrackerError::Persistence(format!("no savepoint {name}")))?;
        self.savepoints.truncate(pos + 1);
        let restored = self
            .savepoints
            .last()
            .map(|(_, state)| state.clone())
            .ok_or_else(|| TrackerError::Internal("savepoint stack empty".to_string()))?;
        self.working = Some(restored);
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<(), TrackerError> {
        let pos = self
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| TrackerError::Persistence(format!("no savepoint {name}")))?;
        self.savepoints.truncate(pos);
        Ok(())
    }

    async fn last_journal(
        &mut self,
        table: JournalTable,
    ) -> Result<Option<JournalRow>, TrackerError> {
        let state = self.enter("last_journal")?;
        Ok(state.journals(table).values().next_back().cloned())
    }

    async fn last_completed_start(
        &mut self,
        table: JournalTable,
    ) -> Result<Option<DateTime<Utc>>, TrackerError> {
        let state = self.enter("last_completed_start")?;
        Ok(state
            .journals(table)
            .values()
            .rev()
            .find(|row| row.status == RunStatus::Complete.code())
            .map(|row| row.start))
    }

    async fn save_journal(
        &mut self,
        table: JournalTable,
        row: &JournalRow,
    ) -> Result<(), TrackerError> {
        let state = self.enter("save_journal")?;
        state.journals_mut(table).insert(row.start, row.clone());
        Ok(())
    }

    async fn find_players(&mut self, ids: &[PlayerId]) -> Result<Vec<Player>, TrackerError> {
        let state = self.enter("find_players")?;
        Ok(ids
            .iter()
            .filter_map(|id| state.players.get(id).cloned())
            .collect())
    }

    async fn mark_players_seen(
        &mut self,
        ids: &[PlayerId],
        at: DateTime<Utc>,
    ) -> Result<u64, TrackerError> {
        let state = self.enter("mark_players_seen")?;
        let mut updated = 0;
        let unique: BTreeSet<&PlayerId> = ids.iter().collect();
        for id in unique {
            if let Some(player) = state.players.get_mut(id) {
                player.mark_seen(at);
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn insert_players(&mut self, players: &[Player]) -> Result<(), TrackerError> {
        let state = self.enter("insert_players")?;
        let mut next = state.players.clone();
        for player in players {
            if next.insert(player.id.clone(), player.clone()).is_some() {
                return Err(TrackerError::UniqueViolation {
                    constraint: "players_pkey".to_string(),
                });
            }
        }
        check_callsign_index(&next)?;
        state.players = next;
        Ok(())
    }

    async fn set_callsigns(
        &mut self,
        callsigns: &[(PlayerId, Option<String>)],
    ) -> Result<(), TrackerError> {
        let state = self.enter("set_callsigns")?;
        let mut next = state.players.clone();
        for (id, callsign) in callsigns {
            if let Some(player) = next.get_mut(id) {
                player.callsign.clone_from(callsign);
            }
        }
        check_callsign_index(&next)?;
        state.players = next;
        Ok(())
    }

    async fn find_callsign_owners(
        &mut self,
        keys: &[String],
    ) -> Result<Vec<PlayerId>, TrackerError> {
        let state = self.enter("find_callsign_owners")?;
        let keys: HashSet<&str> = keys.iter().map(String::as_str).collect();
        Ok(state
            .players
            .values()
            .filter(|p| {
                p.callsign
                    .as_deref()
                    .is_some_and(|c| keys.contains(callsign_key(c).as_str()))
            })
            .map(|p| p.id.clone())
            .collect())
    }

    async fn find_matches(&mut self, ids: &[MatchId]) -> Result<Vec<Match>, TrackerError> {
        let state = self.enter("find_matches")?;
        Ok(ids
            .iter()
            .filter_map(|id| state.matches.get(id).cloned())
            .collect())
    }

    async fn upsert_matches(&mut self, matches: &[Match]) -> Result<(), TrackerError> {
        let state = self.enter("upsert_matches")?;
        for game in matches {
            state.matches.insert(game.id.clone(), game.clone());
        }
        Ok(())
    }

    async fn find_match_players(
        &mut self,
        match_id: &MatchId,
        players: &[PlayerId],
    ) -> Result<Vec<MatchPlayer>, TrackerError> {
        let state = self.enter("find_match_players")?;
        Ok(players
            .iter()
            .filter_map(|p| {
                state
                    .match_players
                    .get(&(match_id.clone(), p.clone()))
                    .cloned()
            })
            .collect())
    }

    async fn upsert_match_players(&mut self, rows: &[MatchPlayer]) -> Result<(), TrackerError> {
        let state = self.enter("upsert_match_players")?;
        for row in rows {
            state
                .match_players
                .insert((row.match_id.clone(), row.player_id.clone()), row.clone());
        }
        Ok(())
    }

    async fn window_boundaries(
        &mut self,
        domain: WindowDomain,
        filter: &WindowFilter,
        size: usize,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<DateTime<Utc>>, TrackerError> {
        let state = self.enter("window_boundaries")?;
        let step = size.max(1);
        Ok(state
            .last_seen_values(domain, filter)
            .into_iter()
            .filter(|v| begin.is_none_or(|b| *v >= b) && end.is_none_or(|e| *v < e))
            .step_by(step)
            .collect())
    }

    async fn count_in_window(
        &mut self,
        domain: WindowDomain,
        filter: &WindowFilter,
        window: &Window<DateTime<Utc>>,
    ) -> Result<u64, TrackerError> {
        let state = self.enter("count_in_window")?;
        let count = state
            .last_seen_values(domain, filter)
            .iter()
            .filter(|v| window.contains(v))
            .count();
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }

    async fn players_in_window(
        &mut self,
        filter: &WindowFilter,
        window: &Window<DateTime<Utc>>,
    ) -> Result<Vec<PlayerId>, TrackerError> {
        let state = self.enter("players_in_window")?;
        let mut rows: Vec<&Player> = state
            .players
            .values()
            .filter(|p| {
                window.contains(&p.last_seen) && filter.admits(p.first_seen, p.blacklisted)
            })
            .collect();
        rows.sort_by(|a, b| a.last_seen.cmp(&b.last_seen).then_with(|| a.id.cmp(&b.id)));
        Ok(rows.into_iter().map(|p| p.id.clone()).collect())
    }

    async fn matches_in_window(
        &mut self,
        filter: &WindowFilter,
        window: &Window<DateTime<Utc>>,
    ) -> Result<Vec<MatchId>, TrackerError> {
        let state = self.enter("matches_in_window")?;
        let mut rows: Vec<&Match> = state
            .matches
            .values()
            .filter(|m| window.contains(&m.last_seen) && filter.admits(m.first_seen, false))
            .collect();
        rows.sort_by(|a, b| a.last_seen.cmp(&b.last_seen).then_with(|| a.id.cmp(&b.id)));
        Ok(rows.into_iter().map(|m| m.id.clone()).collect())
    }

    async fn insert_snapshots(
        &mut self,
        snapshots: &[PlayerStatsSnapshot],
    ) -> Result<(), TrackerError> {
        let state = self.enter("insert_snapshots")?;
        for snapshot in snapshots {
            state.snapshots.insert(
                (snapshot.player_id.clone(), snapshot.snapshot_taken),
                snapshot.clone(),
            );
        }
        Ok(())
    }

    async fn set_latest_snapshots(
        &mut self,
        ids: &[PlayerId],
        taken: DateTime<Utc>,
    ) -> Result<(), TrackerError> {
        let state = self.enter("set_latest_snapshots")?;
        for id in ids {
            if let Some(player) = state.players.get_mut(id) {
                player.latest_snapshot = Some(taken);
            }
        }
        Ok(())
    }

    async fn player_region_counts(
        &mut self,
        ids: &[PlayerId],
    ) -> Result<Vec<RegionCount>, TrackerError> {
        let state = self.enter("player_region_counts")?;
        let wanted: HashSet<&PlayerId> = ids.iter().collect();
        let mut counts: BTreeMap<(PlayerId, String), u64> = BTreeMap::new();
        for (match_id, player_id) in state.match_players.keys() {
            if !wanted.contains(player_id) {
                continue;
            }
            if let Some(game) = state.matches.get(match_id) {
                *counts
                    .entry((player_id.clone(), game.info.region.clone()))
                    .or_default() += 1;
            }
        }
        Ok(counts
            .into_iter()
            .map(|((player_id, region), matches)| RegionCount {
                player_id,
                region,
                matches,
            })
            .collect())
    }

    async fn set_common_regions(
        &mut self,
        regions: &[(PlayerId, Option<String>)],
    ) -> Result<(), TrackerError> {
        let state = self.enter("set_common_regions")?;
        for (id, region) in regions {
            if let Some(player) = state.players.get_mut(id) {
                player.common_region.clone_from(region);
            }
        }
        Ok(())
    }

    async fn match_participant_stats(
        &mut self,
        ids: &[MatchId],
    ) -> Result<Vec<ParticipantStats>, TrackerError> {
        let state = self.enter("match_participant_stats")?;
        let wanted: HashSet<&MatchId> = ids.iter().collect();
        let mut stats = Vec::new();
        for (match_id, player_id) in state.match_players.keys() {
            if !wanted.contains(match_id) {
                continue;
            }
            let snapshot = state
                .players
                .get(player_id)
                .and_then(|p| state.latest_snapshot(p));
            if let Some(snapshot) = snapshot {
                stats.push(ParticipantStats {
                    match_id: match_id.clone(),
                    mmr: snapshot.mmr,
                    pilot_level: snapshot.pilot_level,
                });
            }
        }
        Ok(stats)
    }

    async fn set_match_aggregates(
        &mut self,
        aggregates: &[(MatchId, MatchAggregate)],
    ) -> Result<(), TrackerError> {
        let state = self.enter("set_match_aggregates")?;
        for (id, aggregate) in aggregates {
            if let Some(game) = state.matches.get_mut(id) {
                game.aggregate = aggregate.clone();
            }
        }
        Ok(())
    }

    async fn open_rank_cursor(&mut self, field: RankedField) -> Result<(), TrackerError> {
        if self.cursor.is_some() {
            return Err(TrackerError::Persistence(
                "rank cursor already open".to_string(),
            ));
        }
        let state = self.enter("open_rank_cursor")?;
        let mut rows: Vec<(PlayerId, f64)> = state
            .players
            .values()
            .filter(|p| !p.blacklisted)
            .filter_map(|p| {
                let snapshot = state.latest_snapshot(p)?;
                field.value(snapshot).map(|v| (p.id.clone(), v))
            })
            .collect();
        rows.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        self.cursor = Some(rows.into());
        Ok(())
    }

    async fn fetch_rank_batch(
        &mut self,
        limit: usize,
    ) -> Result<Vec<(PlayerId, f64)>, TrackerError> {
        self.store.take_fail_point("fetch_rank_batch")?;
        let cursor = self
            .cursor
            .as_mut()
            .ok_or_else(|| TrackerError::Persistence("no rank cursor open".to_string()))?;
        let take = limit.min(cursor.len());
        Ok(cursor.drain(..take).collect())
    }

    async fn close_rank_cursor(&mut self) -> Result<(), TrackerError> {
        self.cursor = None;
        Ok(())
    }
}

/// In-memory [`RankStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryRankStore {
    ranks: Arc<Mutex<HashMap<RankedField, BTreeMap<PlayerId, u64>>>>,
    totals: Arc<Mutex<HashMap<RankedField, u64>>>,
}

impl MemoryRankStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every rank of `field`, ordered by player id.
    #[must_use]
    pub fn ranks(&self, field: RankedField) -> Vec<(PlayerId, u64)> {
        lock(&self.ranks)
            .get(&field)
            .map(|m| m.iter().map(|(p, r)| (p.clone(), *r)).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RankStore for MemoryRankStore {
    async fn clear_field(&self, field: RankedField) -> Result<(), TrackerError> {
        lock(&self.ranks).remove(&field);
        lock(&self.totals).remove(&field);
        Ok(())
    }

    async fn set_ranks(
        &self,
        field: RankedField,
        ranks: &[(PlayerId, u64)],
    ) -> Result<(), TrackerError> {
        let mut all = lock(&self.ranks);
        let entry = all.entry(field).or_default();
        for (player, rank) in ranks {
            entry.insert(player.clone(), *rank);
        }
        Ok(())
    }

    async fn set_total(&self, field: RankedField, total: u64) -> Result<(), TrackerError> {
        lock(&self.totals).insert(field, total);
        Ok(())
    }

    async fn get_rank(
        &self,
        field: RankedField,
        player: &PlayerId,
    ) -> Result<Option<u64>, TrackerError> {
        Ok(lock(&self.ranks)
            .get(&field)
            .and_then(|m| m.get(player).copied()))
    }

    async fn get_total(&self, field: RankedField) -> Result<Option<u64>, TrackerError> {
        Ok(lock(&self.totals).get(&field).copied())
    }
}

/// In-memory [`TokenStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryTokenStore {
    token: Arc<Mutex<Option<String>>>,
}

impl MemoryTokenStore {
    /// Creates a store holding `token`.
    #[must_use]
    pub fn with_token(token: &str) -> Self {
        Self {
            token: Arc::new(Mutex::new(Some(token.to_string()))),
        }
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load_token(&self) -> Result<Option<String>, TrackerError> {
        Ok(lock(&self.token).clone())
    }

    async fn store_token(&self, token: &str) -> Result<(), TrackerError> {
        *lock(&self.token) = Some(token.to_string());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn player(id: &str, callsign: Option<&str>) -> Player {
        Player::new(PlayerId::from(id), callsign.map(ToString::to_string), Utc::now())
    }

    #[tokio::test]
    async fn uncommitted_writes_are_private_and_rolled_back() {
        let store = MemoryStore::new();
        let mut session = store.session();
        let Ok(()) = session.insert_players(&[player("a", Some("Alpha"))]).await else {
            panic!("insert failed");
        };
        assert!(store.players().is_empty());
        let _ = session.rollback().await;
        let _ = session.commit().await;
        assert!(store.players().is_empty());
        assert_eq!(store.commits(), 0);
    }

    #[tokio::test]
    async fn commit_publishes_writes() {
        let store = MemoryStore::new();
        let mut session = store.session();
        let _ = session.insert_players(&[player("a", Some("Alpha"))]).await;
        let Ok(()) = session.commit().await else {
            panic!("commit failed");
        };
        assert_eq!(store.players().len(), 1);
        assert_eq!(store.commits(), 1);
    }

    #[tokio::test]
    async fn callsign_index_ignores_case() {
        let store = MemoryStore::new();
        store.seed_player(player("a", Some("Foo")));
        let mut session = store.session();
        let result = session.insert_players(&[player("b", Some("fOO"))]).await;
        let Err(err) = result else {
            panic!("expected unique violation");
        };
        assert!(err.is_unique_violation(CALLSIGN_CONSTRAINT));
        let result = session
            .set_callsigns(&[(PlayerId::from("a"), Some("Bar".to_string()))])
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn savepoint_rollback_restores_state() {
        let store = MemoryStore::new();
        let mut session = store.session();
        let _ = session.insert_players(&[player("a", None)]).await;
        let _ = session.savepoint("sp").await;
        let _ = session.insert_players(&[player("b", None)]).await;
        let Ok(()) = session.rollback_to_savepoint("sp").await else {
            panic!("rollback to savepoint failed");
        };
        let _ = session.release_savepoint("sp").await;
        let _ = session.commit().await;
        let ids: Vec<String> = store.players().into_iter().map(|p| p.id.into()).collect();
        assert_eq!(ids, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn fail_once_fires_a_single_time() {
        let store = MemoryStore::new();
        store.fail_once("find_players");
        let mut session = store.session();
        assert!(session.find_players(&[]).await.is_err());
        assert!(session.find_players(&[]).await.is_ok());
    }

    #[tokio::test]
    async fn boundaries_sample_every_nth_row() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        for i in 0..10 {
            let mut p = player(&format!("p{i}"), None);
            p.last_seen = t0 + Duration::seconds(i);
            p.blacklisted = i == 3;
            store.seed_player(p);
        }
        let mut session = store.session();
        let everyone = WindowFilter::default();
        let Ok(bounds) = session
            .window_boundaries(WindowDomain::PlayersLastSeen, &everyone, 4, None, None)
            .await
        else {
            panic!("boundaries failed");
        };
        assert_eq!(
            bounds,
            vec![t0, t0 + Duration::seconds(4), t0 + Duration::seconds(8)]
        );

        let filter = WindowFilter {
            skip_blacklisted: true,
            ..WindowFilter::default()
        };
        let Ok(bounds) = session
            .window_boundaries(WindowDomain::PlayersLastSeen, &filter, 4, None, None)
            .await
        else {
            panic!("boundaries failed");
        };
        assert_eq!(
            bounds,
            vec![t0, t0 + Duration::seconds(5), t0 + Duration::seconds(9)]
        );
    }
}

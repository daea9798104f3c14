//! Poll pipeline: records who is playing where right now.
//!
//! A poll is one transaction. It fetches the live server list, marks the
//! listed players and matches as seen (inserting the unknown ones) and
//! commits everything together with its journal. On error the whole poll
//! is rolled back and only the failed journal is written.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};

use super::conflict::{CallsignConflictResolver, CallsignWrite};
use super::journal::{JournalManager, RunStart};
use crate::api::ApiClient;
use crate::config::PipelineSettings;
use crate::domain::{
    Match, MatchId, MatchPlayer, Player, PlayerId, PollFlag, PollJournal, PollPipeline, PollStage,
    ServerInfo, ServerListing,
};
use crate::error::TrackerError;
use crate::persistence::TrackerSession;

/// A live match and its current roster.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveMatch {
    /// Match id.
    pub id: MatchId,
    /// Metadata of the hosting server.
    pub info: ServerInfo,
    /// Players on the server, bots excluded.
    pub players: Vec<PlayerId>,
}

/// Everything one server list says is live.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveSighting {
    /// Every player on any server, de-duplicated and sorted.
    pub players: Vec<PlayerId>,
    /// Live matches, ordered by id.
    pub matches: Vec<LiveMatch>,
}

impl LiveSighting {
    /// Collects players and matches from `servers`.
    ///
    /// Servers without a match id contribute players only. Matches nobody
    /// plays are dropped unless `keep_empty` is set.
    #[must_use]
    pub fn collect(servers: &[ServerListing], keep_empty: bool) -> Self {
        let mut players = BTreeSet::new();
        let mut matches = BTreeMap::new();
        for server in servers {
            let roster = server.players();
            players.extend(roster.iter().cloned());
            let Some(id) = server.match_id() else {
                continue;
            };
            if roster.is_empty() && !keep_empty {
                continue;
            }
            matches.insert(
                id.clone(),
                LiveMatch {
                    id,
                    info: server.info(),
                    players: roster,
                },
            );
        }
        Self {
            players: players.into_iter().collect(),
            matches: matches.into_values().collect(),
        }
    }
}

/// What [`record_seen_players`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeenPlayers {
    /// Known players marked seen.
    pub updated: u64,
    /// New players inserted.
    pub added: u64,
    /// Known players whose callsign changed.
    pub renamed: u64,
}

/// Marks `ids` seen at `at` and inserts the unknown ones with their
/// current callsigns.
///
/// With `refresh_known`, callsigns are fetched for every listed player and
/// stale stored callsigns are overwritten; otherwise only new players are
/// looked up. All callsign writes go through the conflict resolver.
///
/// # Errors
///
/// Returns [`TrackerError::Interface`] on stats service failure,
/// [`TrackerError::CallsignConflictUnresolved`] when a callsign collision
/// cannot be resolved, or a store error.
pub async fn record_seen_players<S>(
    session: &mut S,
    resolver: &CallsignConflictResolver<'_>,
    api: &ApiClient,
    ids: &[PlayerId],
    at: DateTime<Utc>,
    refresh_known: bool,
) -> Result<SeenPlayers, TrackerError>
where
    S: TrackerSession + ?Sized,
{
    if ids.is_empty() {
        return Ok(SeenPlayers::default());
    }
    let known = session.find_players(ids).await?;
    let known_ids: HashSet<&PlayerId> = known.iter().map(|p| &p.id).collect();
    let unseen: Vec<PlayerId> = ids
        .iter()
        .filter(|id| !known_ids.contains(id))
        .cloned()
        .collect();
    let seen: Vec<PlayerId> = known.iter().map(|p| p.id.clone()).collect();

    let updated = session.mark_players_seen(&seen, at).await?;

    let fresh = if refresh_known {
        api.callsigns(ids).await?
    } else {
        api.callsigns(&unseen).await?
    };

    let mut renamed = 0;
    if refresh_known {
        let stale = CallsignWrite::renames(&known, &fresh);
        renamed = u64::try_from(stale.len()).unwrap_or(u64::MAX);
        resolver.write(session, &stale).await?;
    }

    let new_players: Vec<Player> = unseen
        .into_iter()
        .map(|id| {
            let callsign = fresh.get(&id).cloned();
            Player::new(id, callsign, at)
        })
        .collect();
    let added = u64::try_from(new_players.len()).unwrap_or(u64::MAX);
    resolver
        .write(session, &CallsignWrite::InsertPlayers(new_players))
        .await?;

    Ok(SeenPlayers {
        updated,
        added,
        renamed,
    })
}

/// Ingests the live server list.
#[derive(Debug, Clone)]
pub struct PollService {
    api: ApiClient,
    settings: PipelineSettings,
    journals: JournalManager<PollPipeline>,
}

impl PollService {
    /// Creates a poll service.
    #[must_use]
    pub fn new(api: ApiClient, settings: PipelineSettings) -> Self {
        Self {
            api,
            settings,
            journals: JournalManager::new(),
        }
    }

    /// Runs one poll and returns its journal.
    ///
    /// When the previous poll is still active nothing is done and its
    /// journal is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns the error that aborted the poll after the failed journal
    /// has been recorded, or a store error while recording the journal.
    pub async fn run<S>(
        &self,
        session: &mut S,
        flags: BTreeSet<PollFlag>,
    ) -> Result<PollJournal, TrackerError>
    where
        S: TrackerSession + ?Sized,
    {
        let run_start = Utc::now();
        let mut journal = match self.journals.start_or_resume(session, flags, false).await? {
            RunStart::AlreadyRunning(journal) => return Ok(journal),
            RunStart::Fresh(journal) | RunStart::Resumed(journal) => journal,
        };
        let outcome = self.execute(session, &mut journal).await;
        self.journals
            .conclude(session, journal, run_start, outcome)
            .await
    }

    async fn execute<S>(
        &self,
        session: &mut S,
        journal: &mut PollJournal,
    ) -> Result<(), TrackerError>
    where
        S: TrackerSession + ?Sized,
    {
        self.journals.transition(journal, PollStage::FetchServers);
        let poll_time = Utc::now();
        let servers = self.api.live_servers().await?;
        let keep_empty =
            self.settings.keep_empty_matches || journal.has_flag(PollFlag::KeepEmptyMatches);
        let live = LiveSighting::collect(&servers, keep_empty);
        tracing::debug!(
            servers = servers.len(),
            players = live.players.len(),
            matches = live.matches.len(),
            "live server list fetched"
        );

        self.journals.transition(journal, PollStage::Players);
        let resolver = CallsignConflictResolver::new(&self.api, self.settings.callsign_max_rounds);
        let seen =
            record_seen_players(session, &resolver, &self.api, &live.players, poll_time, true)
                .await?;
        journal.counters.players_updated = seen.updated;
        journal.counters.players_added = seen.added;

        self.journals.transition(journal, PollStage::Matches);
        let (updated, added) = self.record_matches(session, &live.matches, poll_time).await?;
        journal.counters.matches_updated = updated;
        journal.counters.matches_added = added;

        self.journals.transition(journal, PollStage::Complete);
        Ok(())
    }

    async fn record_matches<S>(
        &self,
        session: &mut S,
        live: &[LiveMatch],
        at: DateTime<Utc>,
    ) -> Result<(u64, u64), TrackerError>
    where
        S: TrackerSession + ?Sized,
    {
        if live.is_empty() {
            return Ok((0, 0));
        }
        let ids: Vec<MatchId> = live.iter().map(|m| m.id.clone()).collect();
        let mut known: HashMap<MatchId, Match> = session
            .find_matches(&ids)
            .await?
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();

        let (mut updated, mut added) = (0, 0);
        let mut games = Vec::with_capacity(live.len());
        let mut presence = Vec::new();
        for entry in live {
            if let Some(mut game) = known.remove(&entry.id) {
                game.info = entry.info.clone();
                game.mark_seen(at);
                games.push(game);
                updated += 1;

                let mut rows: HashMap<PlayerId, MatchPlayer> = session
                    .find_match_players(&entry.id, &entry.players)
                    .await?
                    .into_iter()
                    .map(|row| (row.player_id.clone(), row))
                    .collect();
                for player in &entry.players {
                    let row = match rows.remove(player) {
                        Some(mut row) => {
                            row.extend(at);
                            row
                        }
                        None => MatchPlayer::new(entry.id.clone(), player.clone(), at),
                    };
                    presence.push(row);
                }
            } else {
                games.push(Match::new(entry.id.clone(), entry.info.clone(), at));
                added += 1;
                presence.extend(
                    entry
                        .players
                        .iter()
                        .map(|player| MatchPlayer::new(entry.id.clone(), player.clone(), at)),
                );
            }
        }

        session.upsert_matches(&games).await?;
        session.upsert_match_players(&presence).await?;
        Ok((updated, added))
    }
}

//! Update pipeline: stats snapshots, match aggregates and global rankings.
//!
//! Each stage walks its domain in commit windows and checkpoints the
//! journal after every window (or ranked field), so a failed run resumed
//! with `resume` continues where it stopped. Stages already left are
//! never re-entered.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::conflict::{CallsignConflictResolver, CallsignWrite};
use super::journal::{JournalManager, RunStart};
use super::ranking::RankingEngine;
use super::windowed::{WindowBatch, WindowedStage, for_each_window};
use crate::api::ApiClient;
use crate::config::PipelineSettings;
use crate::domain::{
    MatchAggregate, MatchId, PlayerId, PlayerStatsSnapshot, RankedField, UpdateCounters,
    UpdateFlag, UpdateJournal, UpdatePipeline, UpdateStage, most_common_region,
};
use crate::error::TrackerError;
use crate::persistence::{
    ParticipantStats, RankStore, RegionCount, TrackerSession, Window, WindowDomain, WindowFilter,
};

/// Refreshes stats, aggregates and rankings.
#[derive(Debug, Clone)]
pub struct UpdateService {
    api: ApiClient,
    rankings: RankingEngine,
    settings: PipelineSettings,
    journals: JournalManager<UpdatePipeline>,
}

impl UpdateService {
    /// Creates an update service writing rankings into `ranks`.
    #[must_use]
    pub fn new(api: ApiClient, ranks: Arc<dyn RankStore>, settings: PipelineSettings) -> Self {
        Self {
            api,
            rankings: RankingEngine::new(ranks, settings.rank_batch_size),
            settings,
            journals: JournalManager::new(),
        }
    }

    /// Runs an update and returns its journal.
    ///
    /// With `resume`, a failed last run is continued from its checkpoint
    /// with its stored flags. When the previous run is still active its
    /// journal is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns the error that aborted the run after the failed journal
    /// has been recorded, or a store error while recording the journal.
    pub async fn run<S>(
        &self,
        session: &mut S,
        flags: BTreeSet<UpdateFlag>,
        resume: bool,
    ) -> Result<UpdateJournal, TrackerError>
    where
        S: TrackerSession + ?Sized,
    {
        let run_start = Utc::now();
        let mut journal = match self.journals.start_or_resume(session, flags, resume).await? {
            RunStart::AlreadyRunning(journal) => return Ok(journal),
            RunStart::Fresh(journal) | RunStart::Resumed(journal) => journal,
        };
        let outcome = self.execute(session, &mut journal).await;
        let journal = self
            .journals
            .conclude(session, journal, run_start, outcome)
            .await?;
        if let Err(err) = self.api.persist_session().await {
            tracing::warn!(error = %err, "could not persist stats service session");
        }
        Ok(journal)
    }

    async fn execute<S>(
        &self,
        session: &mut S,
        journal: &mut UpdateJournal,
    ) -> Result<(), TrackerError>
    where
        S: TrackerSession + ?Sized,
    {
        let last_complete = self.journals.last_completed_start(session).await?;
        loop {
            match journal.stage {
                UpdateStage::NotStarted => {
                    self.journals
                        .advance(session, journal, UpdateStage::Players)
                        .await?;
                }
                UpdateStage::Players => {
                    let since = if journal.has_flag(UpdateFlag::AllPlayers) {
                        None
                    } else {
                        last_complete
                    };
                    self.update_players(session, journal, since).await?;
                    self.journals
                        .advance(session, journal, UpdateStage::Matches)
                        .await?;
                }
                UpdateStage::Matches => {
                    let since = if journal.has_flag(UpdateFlag::AllMatches) {
                        None
                    } else {
                        last_complete
                    };
                    self.update_matches(session, journal, since).await?;
                    self.journals
                        .advance(session, journal, UpdateStage::GlobalRankings)
                        .await?;
                }
                UpdateStage::GlobalRankings => {
                    self.update_rankings(session, journal).await?;
                    journal.counters.global_rankings_updated = true;
                    self.journals
                        .advance(session, journal, UpdateStage::Complete)
                        .await?;
                }
                UpdateStage::Complete => return Ok(()),
            }
        }
    }

    fn windowed_stage(
        &self,
        domain: WindowDomain,
        filter: WindowFilter,
        since: Option<DateTime<Utc>>,
    ) -> WindowedStage {
        WindowedStage {
            domain,
            filter,
            size: self.settings.batch_size,
            begin: since,
            end: None,
        }
    }

    async fn update_players<S>(
        &self,
        session: &mut S,
        journal: &mut UpdateJournal,
        since: Option<DateTime<Utc>>,
    ) -> Result<(), TrackerError>
    where
        S: TrackerSession + ?Sized,
    {
        let filter = WindowFilter {
            skip_blacklisted: self.settings.skip_blacklisted,
            ..WindowFilter::default()
        };
        let stage = self.windowed_stage(WindowDomain::PlayersLastSeen, filter, since);
        let batch = PlayerRefresh {
            service: self,
            taken: journal.start,
            callsigns: journal.has_flag(UpdateFlag::UpdateCallsigns),
        };
        for_each_window(&self.journals, session, journal, &stage, &batch).await?;
        Ok(())
    }

    async fn refresh_players<S>(
        &self,
        session: &mut S,
        players: &[PlayerId],
        taken: DateTime<Utc>,
        callsigns: bool,
    ) -> Result<PlayerTally, TrackerError>
    where
        S: TrackerSession + ?Sized,
    {
        let mut tally = PlayerTally::default();
        if players.is_empty() {
            return Ok(tally);
        }
        let snapshots: Vec<PlayerStatsSnapshot> = self
            .api
            .stats(players)
            .await?
            .iter()
            .map(|raw| PlayerStatsSnapshot::from_raw(raw, taken))
            .collect();
        let refreshed: Vec<PlayerId> = snapshots.iter().map(|s| s.player_id.clone()).collect();
        session.insert_snapshots(&snapshots).await?;
        session.set_latest_snapshots(&refreshed, taken).await?;

        let counts = session.player_region_counts(players).await?;
        session
            .set_common_regions(&common_regions(players, &counts))
            .await?;

        if callsigns {
            let known = session.find_players(players).await?;
            let fresh = self.api.callsigns(players).await?;
            let renames = CallsignWrite::renames(&known, &fresh);
            let resolver =
                CallsignConflictResolver::new(&self.api, self.settings.callsign_max_rounds);
            resolver.write(session, &renames).await?;
            tally.callsigns = count(renames.len());
        }

        tally.snapshots = count(refreshed.len());
        tracing::debug!(
            players = players.len(),
            snapshots = refreshed.len(),
            "player window refreshed"
        );
        Ok(tally)
    }

    async fn update_matches<S>(
        &self,
        session: &mut S,
        journal: &mut UpdateJournal,
        since: Option<DateTime<Utc>>,
    ) -> Result<(), TrackerError>
    where
        S: TrackerSession + ?Sized,
    {
        let stage =
            self.windowed_stage(WindowDomain::MatchesLastSeen, WindowFilter::default(), since);
        for_each_window(&self.journals, session, journal, &stage, &MatchRefresh).await?;
        Ok(())
    }

    async fn update_rankings<S>(
        &self,
        session: &mut S,
        journal: &mut UpdateJournal,
    ) -> Result<(), TrackerError>
    where
        S: TrackerSession + ?Sized,
    {
        let total = RankedField::ALL.len();
        let first = journal.stage_start(total);
        self.journals.save(session, journal).await?;
        for (index, field) in RankedField::ALL.iter().enumerate().skip(first) {
            let ranked = self.rankings.rebuild_field(session, *field).await?;
            tracing::info!(%field, ranked, "global ranking rebuilt");
            self.journals
                .checkpoint(session, journal, index + 1, total)
                .await?;
        }
        Ok(())
    }
}

/// Snapshots and callsigns written for one player window.
#[derive(Debug, Default)]
struct PlayerTally {
    snapshots: u64,
    callsigns: u64,
}

/// Snapshot refresh of the players in one window.
#[derive(Debug)]
struct PlayerRefresh<'a> {
    service: &'a UpdateService,
    taken: DateTime<Utc>,
    callsigns: bool,
}

#[async_trait]
impl<S: TrackerSession + ?Sized> WindowBatch<UpdatePipeline, S> for PlayerRefresh<'_> {
    type Tally = PlayerTally;

    async fn process(
        &self,
        session: &mut S,
        window: &Window<DateTime<Utc>>,
        filter: &WindowFilter,
    ) -> Result<PlayerTally, TrackerError> {
        let players = session.players_in_window(filter, window).await?;
        self.service
            .refresh_players(session, &players, self.taken, self.callsigns)
            .await
    }

    fn record(&self, counters: &mut UpdateCounters, tally: PlayerTally) {
        counters.players_updated += tally.snapshots;
        counters.callsigns_updated += tally.callsigns;
    }
}

/// Aggregate recomputation of the matches in one window.
#[derive(Debug, Clone, Copy)]
struct MatchRefresh;

#[async_trait]
impl<S: TrackerSession + ?Sized> WindowBatch<UpdatePipeline, S> for MatchRefresh {
    type Tally = u64;

    async fn process(
        &self,
        session: &mut S,
        window: &Window<DateTime<Utc>>,
        filter: &WindowFilter,
    ) -> Result<u64, TrackerError> {
        let matches = session.matches_in_window(filter, window).await?;
        if matches.is_empty() {
            return Ok(0);
        }
        let participants = session.match_participant_stats(&matches).await?;
        let aggregates = match_aggregates(&matches, &participants, Utc::now());
        session.set_match_aggregates(&aggregates).await?;
        Ok(count(matches.len()))
    }

    fn record(&self, counters: &mut UpdateCounters, tally: u64) {
        counters.matches_updated += tally;
    }
}

fn count(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

/// Most common region family of each of `players`; `None` when none of
/// their matches ran in a known region.
#[must_use]
pub fn common_regions(
    players: &[PlayerId],
    counts: &[RegionCount],
) -> Vec<(PlayerId, Option<String>)> {
    let mut by_player: HashMap<&PlayerId, Vec<(&str, u64)>> = HashMap::new();
    for entry in counts {
        by_player
            .entry(&entry.player_id)
            .or_default()
            .push((entry.region.as_str(), entry.matches));
    }
    players
        .iter()
        .map(|id| {
            let region = by_player
                .get(id)
                .and_then(|regions| most_common_region(regions.iter().copied()))
                .map(ToString::to_string);
            (id.clone(), region)
        })
        .collect()
}

/// Aggregates of every match in `matches` from its participants' latest
/// snapshots. Participants without a ranked MMR only count towards the
/// pilot level.
#[must_use]
pub fn match_aggregates(
    matches: &[MatchId],
    participants: &[ParticipantStats],
    at: DateTime<Utc>,
) -> Vec<(MatchId, MatchAggregate)> {
    let mut grouped: BTreeMap<&MatchId, (Vec<f64>, Vec<i32>)> = BTreeMap::new();
    for participant in participants {
        let (mmrs, levels) = grouped.entry(&participant.match_id).or_default();
        if let Some(mmr) = participant.mmr {
            mmrs.push(mmr);
        }
        levels.push(participant.pilot_level);
    }
    matches
        .iter()
        .map(|id| {
            let aggregate = grouped.get(id).map_or_else(
                || MatchAggregate::compute(&[], &[], at),
                |(mmrs, levels)| MatchAggregate::compute(mmrs, levels, at),
            );
            (id.clone(), aggregate)
        })
        .collect()
}

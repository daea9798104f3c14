//! Match events pushed by game servers.
//!
//! Start and end events carry the match roster at that moment. Each event
//! is applied in its own transaction: the match is marked seen and given
//! its start/end summary, mentioned players are recorded like a poll
//! would, and presence rows of active players are extended.

use std::collections::{BTreeMap, HashMap};
use std::slice;

use serde_json::Value;

use super::conflict::CallsignConflictResolver;
use super::journal::error_chain;
use super::poll::record_seen_players;
use crate::api::ApiClient;
use crate::config::PipelineSettings;
use crate::domain::{EventPlayer, Match, MatchEvent, MatchEventKind, MatchPlayer, PlayerId};
use crate::error::TrackerError;
use crate::persistence::TrackerSession;

/// What happened to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Not a game server match event.
    Ignored,
    /// Applied and committed.
    Ingested {
        /// Presence rows written.
        presence: usize,
    },
}

/// Applies match events.
#[derive(Debug, Clone)]
pub struct EventIngester {
    api: ApiClient,
    settings: PipelineSettings,
}

impl EventIngester {
    /// Creates an ingester.
    #[must_use]
    pub fn new(api: ApiClient, settings: PipelineSettings) -> Self {
        Self { api, settings }
    }

    /// Parses and applies `event` in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::InvalidEvent`] for malformed match events or
    /// when an unknown match can no longer be matched to its server,
    /// otherwise the stats service or store error. Nothing of a failed
    /// event is committed.
    pub async fn ingest<S>(
        &self,
        session: &mut S,
        event: &Value,
    ) -> Result<IngestOutcome, TrackerError>
    where
        S: TrackerSession + ?Sized,
    {
        let Some(event) = MatchEvent::parse(event)? else {
            return Ok(IngestOutcome::Ignored);
        };
        match self.apply(session, &event).await {
            Ok(presence) => {
                session.commit().await?;
                tracing::info!(
                    match_id = %event.match_id,
                    kind = ?event.kind,
                    presence,
                    "match event ingested"
                );
                Ok(IngestOutcome::Ingested { presence })
            }
            Err(err) => {
                tracing::error!(
                    match_id = %event.match_id,
                    kind = ?event.kind,
                    error = %error_chain(&err),
                    "match event rejected"
                );
                if let Err(rollback) = session.rollback().await {
                    tracing::warn!(error = %rollback, "rollback after rejected event failed");
                }
                Err(err)
            }
        }
    }

    async fn apply<S>(&self, session: &mut S, event: &MatchEvent) -> Result<usize, TrackerError>
    where
        S: TrackerSession + ?Sized,
    {
        let known = session
            .find_matches(slice::from_ref(&event.match_id))
            .await?
            .pop();
        let mut game = match known {
            Some(game) => game,
            None => self.match_from_server(event).await?,
        };
        game.mark_seen(event.time);
        let summary = &mut game.summary;
        match event.kind {
            MatchEventKind::Started => {
                summary.match_started = Some(event.time);
                summary.players_started = Some(event.num_players);
            }
            MatchEventKind::Ended => {
                summary.match_ended = Some(event.time);
                summary.players_ended = Some(event.num_players);
                summary.winning_team = event.winning_team;
                summary.win_reason.clone_from(&event.win_reason);
            }
        }
        session.upsert_matches(slice::from_ref(&game)).await?;

        let players: Vec<PlayerId> = event.players().into_iter().collect();
        let resolver = CallsignConflictResolver::new(&self.api, self.settings.callsign_max_rounds);
        record_seen_players(session, &resolver, &self.api, &players, event.time, false).await?;

        let mut existing: HashMap<PlayerId, MatchPlayer> = session
            .find_match_players(&event.match_id, &players)
            .await?
            .into_iter()
            .map(|row| (row.player_id.clone(), row))
            .collect();
        let mut rows: BTreeMap<PlayerId, MatchPlayer> = BTreeMap::new();
        // Inactive players may have left at any time, so they never get a
        // presence row of their own.
        for player in &event.inactive {
            if let Some(mut row) = existing.remove(&player.player_id) {
                record_details(&mut row, player, event.kind, false);
                rows.insert(player.player_id.clone(), row);
            }
        }
        for player in &event.active {
            let mut row = rows
                .remove(&player.player_id)
                .or_else(|| existing.remove(&player.player_id))
                .unwrap_or_else(|| {
                    MatchPlayer::new(event.match_id.clone(), player.player_id.clone(), event.time)
                });
            row.extend(event.time);
            record_details(&mut row, player, event.kind, true);
            rows.insert(player.player_id.clone(), row);
        }

        let rows: Vec<MatchPlayer> = rows.into_values().collect();
        session.upsert_match_players(&rows).await?;
        Ok(rows.len())
    }

    async fn match_from_server(&self, event: &MatchEvent) -> Result<Match, TrackerError> {
        let listing = self.api.server(&event.server_id).await?.ok_or_else(|| {
            TrackerError::InvalidEvent(format!(
                "server {} is gone, cannot create match {}",
                event.server_id, event.match_id
            ))
        })?;
        if listing.match_id().as_ref() != Some(&event.match_id) {
            return Err(TrackerError::InvalidEvent(format!(
                "server {} reports a different match than {}",
                event.server_id, event.match_id
            )));
        }
        Ok(Match::new(event.match_id.clone(), listing.info(), event.time))
    }
}

fn record_details(row: &mut MatchPlayer, player: &EventPlayer, kind: MatchEventKind, active: bool) {
    if player.team.is_some() {
        row.team = player.team;
    }
    if player.kills.is_some() {
        row.kills = player.kills;
    }
    if player.mmr.is_some() {
        row.player_mmr = player.mmr;
    }
    match kind {
        MatchEventKind::Started => row.started_with = Some(active),
        MatchEventKind::Ended => row.ended_with = Some(active),
    }
}

//! Live server listings, matches and match presence.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{MatchId, PlayerId};

/// One entry of the live server list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerListing {
    /// Server GUID.
    pub guid: String,
    /// Match currently running on the server, if any.
    #[serde(default)]
    pub match_id: Option<String>,
    /// Players currently on the server.
    #[serde(default)]
    pub users: Vec<PlayerId>,
    /// Display name.
    #[serde(default)]
    pub server_name: String,
    /// Raw region name.
    #[serde(default)]
    pub region: String,
    /// Game mode.
    #[serde(default)]
    pub game_type: String,
    /// Map name.
    #[serde(default)]
    pub map: String,
    /// Server build.
    #[serde(default)]
    pub game_version: String,
    /// Listed for matchmaking.
    #[serde(default)]
    pub is_matchmaking_visible: bool,
    /// Free-form server flags.
    #[serde(default)]
    pub developer_data: BTreeMap<String, serde_json::Value>,
}

impl ServerListing {
    /// Match id, `None` when absent or empty.
    #[must_use]
    pub fn match_id(&self) -> Option<MatchId> {
        self.match_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(MatchId::from)
    }

    /// Players on the server, bots excluded.
    #[must_use]
    pub fn players(&self) -> Vec<PlayerId> {
        self.users.iter().filter(|p| !p.is_bot()).cloned().collect()
    }

    /// Server metadata recorded on the match.
    #[must_use]
    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            server_id: self.guid.clone(),
            name: self.server_name.clone(),
            region: self.region.clone(),
            game_type: self.game_type.clone(),
            map: self.map.clone(),
            version: self.game_version.clone(),
            matchmaking: self.is_matchmaking_visible,
            tournament: self.developer_flag("bTournament"),
            password_protected: !self.developer_str("PasswordHash").is_empty(),
            mmr_ignored: self.developer_flag("bIgnoreMMR"),
        }
    }

    fn developer_str(&self, key: &str) -> String {
        match self.developer_data.get(key) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }

    fn developer_flag(&self, key: &str) -> bool {
        self.developer_str(key).eq_ignore_ascii_case("true")
    }
}

/// Server metadata stored on a match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInfo {
    /// Server GUID.
    pub server_id: String,
    /// Display name.
    pub name: String,
    /// Raw region name.
    pub region: String,
    /// Game mode.
    pub game_type: String,
    /// Map name.
    pub map: String,
    /// Server build.
    pub version: String,
    /// Listed for matchmaking.
    pub matchmaking: bool,
    /// Tournament server.
    pub tournament: bool,
    /// Requires a password.
    pub password_protected: bool,
    /// Results do not affect MMR.
    pub mmr_ignored: bool,
}

/// Aggregates recomputed from participants' latest snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchAggregate {
    /// Mean MMR.
    pub mmr_avg: Option<f64>,
    /// Lowest MMR.
    pub mmr_min: Option<f64>,
    /// Highest MMR.
    pub mmr_max: Option<f64>,
    /// Population standard deviation of MMR; needs two participants.
    pub mmr_stddev: Option<f64>,
    /// Mean pilot level.
    pub pilot_level_avg: Option<f64>,
    /// When these values were computed.
    pub last_stats_update: Option<DateTime<Utc>>,
}

impl MatchAggregate {
    /// Computes aggregates over the participants' ranked MMRs and pilot
    /// levels.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn compute(mmrs: &[f64], pilot_levels: &[i32], at: DateTime<Utc>) -> Self {
        let mut aggregate = Self {
            last_stats_update: Some(at),
            ..Self::default()
        };
        if !mmrs.is_empty() {
            let n = mmrs.len() as f64;
            let mean = mmrs.iter().sum::<f64>() / n;
            aggregate.mmr_avg = Some(mean);
            aggregate.mmr_min = mmrs.iter().copied().reduce(f64::min);
            aggregate.mmr_max = mmrs.iter().copied().reduce(f64::max);
            if mmrs.len() > 1 {
                let variance = mmrs.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / n;
                aggregate.mmr_stddev = Some(variance.sqrt());
            }
        }
        if !pilot_levels.is_empty() {
            let total: f64 = pilot_levels.iter().map(|l| f64::from(*l)).sum();
            aggregate.pilot_level_avg = Some(total / pilot_levels.len() as f64);
        }
        aggregate
    }
}

/// Start/end summary reported by game server events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchSummary {
    /// Match start event time.
    pub match_started: Option<DateTime<Utc>>,
    /// Match end event time.
    pub match_ended: Option<DateTime<Utc>>,
    /// Active players at start.
    pub players_started: Option<i32>,
    /// Active players at end.
    pub players_ended: Option<i32>,
    /// Winning team at end.
    pub winning_team: Option<i32>,
    /// Why the match ended.
    pub win_reason: Option<String>,
}

/// One match on one server.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    /// Match id.
    pub id: MatchId,
    /// Server metadata as last seen.
    pub info: ServerInfo,
    /// First sighting.
    pub first_seen: DateTime<Utc>,
    /// Latest sighting.
    pub last_seen: DateTime<Utc>,
    /// Participant aggregates.
    pub aggregate: MatchAggregate,
    /// Event summary.
    pub summary: MatchSummary,
}

impl Match {
    /// Creates a match first seen at `seen`.
    #[must_use]
    pub fn new(id: MatchId, info: ServerInfo, seen: DateTime<Utc>) -> Self {
        Self {
            id,
            info,
            first_seen: seen,
            last_seen: seen,
            aggregate: MatchAggregate::default(),
            summary: MatchSummary::default(),
        }
    }

    /// Records a sighting. `last_seen` never moves backwards.
    pub fn mark_seen(&mut self, at: DateTime<Utc>) {
        if at > self.last_seen {
            self.last_seen = at;
        }
    }
}

/// A player's presence interval in a match.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchPlayer {
    /// Match.
    pub match_id: MatchId,
    /// Player.
    pub player_id: PlayerId,
    /// First sighting in the match.
    pub first_seen: DateTime<Utc>,
    /// Latest sighting in the match.
    pub last_seen: DateTime<Utc>,
    /// Team reported by events.
    pub team: Option<i32>,
    /// Kills reported by events.
    pub kills: Option<i32>,
    /// MMR reported by events.
    pub player_mmr: Option<f64>,
    /// Active when the match started.
    pub started_with: Option<bool>,
    /// Active when the match ended.
    pub ended_with: Option<bool>,
}

impl MatchPlayer {
    /// Creates a presence interval starting at `seen`.
    #[must_use]
    pub fn new(match_id: MatchId, player_id: PlayerId, seen: DateTime<Utc>) -> Self {
        Self {
            match_id,
            player_id,
            first_seen: seen,
            last_seen: seen,
            team: None,
            kills: None,
            player_mmr: None,
            started_with: None,
            ended_with: None,
        }
    }

    /// Extends the interval to cover `at`.
    pub fn extend(&mut self, at: DateTime<Utc>) {
        if at < self.first_seen {
            self.first_seen = at;
        }
        if at > self.last_seen {
            self.last_seen = at;
        }
    }
}

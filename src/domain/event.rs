//! Match start/end events pushed by game servers.
//!
//! Events are loosely-typed JSON documents. Only match events produced by
//! game servers are of interest; everything else is ignored. Per-player
//! data is flattened into the `Data` object as `Player<i>.<Field>` and
//! `InactivePlayer<i>.<Field>` keys.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::ids::{MatchId, PlayerId};
use crate::error::TrackerError;

/// Whether the event opens or closes a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchEventKind {
    /// `Verb == "Started"`.
    Started,
    /// `Verb == "Ended"`.
    Ended,
}

/// Per-player fields of a match event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPlayer {
    /// Player GUID.
    pub player_id: PlayerId,
    /// Team number.
    pub team: Option<i32>,
    /// Kills so far.
    pub kills: Option<i32>,
    /// Player MMR at the time of the event.
    pub mmr: Option<f64>,
}

/// A parsed match event.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchEvent {
    /// Started or ended.
    pub kind: MatchEventKind,
    /// Match the event is about.
    pub match_id: MatchId,
    /// Server listing GUID hosting the match.
    pub server_id: String,
    /// Event creation time.
    pub time: DateTime<Utc>,
    /// Players active in the match, bots excluded.
    pub active: Vec<EventPlayer>,
    /// Players that left or idled, bots excluded.
    pub inactive: Vec<EventPlayer>,
    /// Active player count as reported, bots included.
    pub num_players: i32,
    /// Winning team, end events only.
    pub winning_team: Option<i32>,
    /// Win reason, end events only.
    pub win_reason: Option<String>,
}

impl MatchEvent {
    /// Parses `event`, returning `Ok(None)` if it is not a game server
    /// match event.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::InvalidEvent`] when a match event is missing
    /// required fields.
    pub fn parse(event: &Value) -> Result<Option<Self>, TrackerError> {
        let kind = match event.get("Verb").and_then(Value::as_str) {
            Some("Started") => MatchEventKind::Started,
            Some("Ended") => MatchEventKind::Ended,
            _ => return Ok(None),
        };
        if path_str(event, &["Subject", "Type"]) != Some("Match")
            || path_str(event, &["Producer", "Type"]) != Some("HawkenGameServer")
        {
            return Ok(None);
        }

        let match_id = path_str(event, &["Subject", "Id"])
            .filter(|id| !id.is_empty())
            .ok_or_else(|| invalid("Subject.Id"))?;
        let data = event.get("Data").ok_or_else(|| invalid("Data"))?;
        let server_id = data
            .get("ServerListingGuid")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("Data.ServerListingGuid"))?;
        let time = event
            .get("TimeCreated")
            .and_then(as_f64)
            .and_then(unix_seconds)
            .ok_or_else(|| invalid("TimeCreated"))?;

        let num_players = data_int(data, "Num_Players").unwrap_or(0);
        let num_inactive = data_int(data, "Num_Players_Inactive").unwrap_or(0);

        Ok(Some(Self {
            kind,
            match_id: MatchId::from(match_id),
            server_id: server_id.to_string(),
            time,
            active: parse_players(data, "Player", num_players)?,
            inactive: parse_players(data, "InactivePlayer", num_inactive)?,
            num_players,
            winning_team: data_int(data, "WinningTeam"),
            win_reason: data
                .get("WinReason")
                .and_then(Value::as_str)
                .map(ToString::to_string),
        }))
    }

    /// Every non-bot player mentioned by the event.
    #[must_use]
    pub fn players(&self) -> BTreeSet<PlayerId> {
        self.active
            .iter()
            .chain(&self.inactive)
            .map(|p| p.player_id.clone())
            .collect()
    }
}

fn invalid(field: &str) -> TrackerError {
    TrackerError::InvalidEvent(format!("match event is missing {field}"))
}

fn path_str<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |v, key| v.get(key))
        .and_then(Value::as_str)
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn unix_seconds(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9) as u32;
    DateTime::from_timestamp(whole as i64, nanos)
}

#[allow(clippy::cast_possible_truncation)]
fn data_int(data: &Value, key: &str) -> Option<i32> {
    data.get(key)
        .and_then(as_f64)
        .and_then(|f| i32::try_from(f as i64).ok())
}

fn parse_players(data: &Value, prefix: &str, count: i32) -> Result<Vec<EventPlayer>, TrackerError> {
    let mut players = Vec::new();
    for i in 0..count.max(0) {
        let key = |field: &str| format!("{prefix}{i}.{field}");
        let user = data
            .get(key("UserID"))
            .and_then(Value::as_str)
            .ok_or_else(|| invalid(&key("UserID")))?;
        let player_id = PlayerId::from(user);
        if player_id.is_bot() {
            continue;
        }
        players.push(EventPlayer {
            player_id,
            team: data_int(data, &key("Team")),
            kills: data_int(data, &key("Kills")),
            mmr: data.get(key("MMR")).and_then(as_f64),
        });
    }
    Ok(players)
}

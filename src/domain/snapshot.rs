//! Player statistics snapshots and the ranked fields derived from them.
//!
//! [`RawStats`] is the counter document returned by the stats service.
//! [`PlayerStatsSnapshot::from_raw`] turns it into an immutable snapshot,
//! applying the sampling thresholds that decide which ratios and rates are
//! meaningful enough to be ranked.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::PlayerId;

/// MMR values the backend reports for players that never played ranked.
pub const DEFAULT_MMRS: [f64; 3] = [0.0, 1250.0, 1500.0];
/// Seconds played before any rate or ratio is recorded.
pub const MIN_TIME_PLAYED: i64 = 36_000;
/// Matches in a mode before its win/loss ratio is recorded.
pub const MIN_MATCHES: i64 = 50;
/// Kills before kill-based ratios are recorded.
pub const MIN_KILLS: i64 = 100;
/// Assists before assist-based ratios are recorded.
pub const MIN_ASSISTS: i64 = 100;

/// Raw stat counters for one player, keyed by the service's dotted names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawStats {
    /// Player the counters belong to.
    #[serde(rename = "Guid")]
    pub guid: PlayerId,
    /// Every other key of the payload.
    #[serde(flatten)]
    pub values: BTreeMap<String, serde_json::Value>,
}

impl RawStats {
    /// Creates an empty counter set.
    #[must_use]
    pub fn new(guid: PlayerId) -> Self {
        Self {
            guid,
            values: BTreeMap::new(),
        }
    }

    /// Builder-style setter, mostly for tests and fixtures.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    /// Integer counter, `default` when absent or not numeric.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn int_or(&self, key: &str, default: i64) -> i64 {
        match self.values.get(key) {
            Some(serde_json::Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(default),
            Some(serde_json::Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    /// Integer counter, 0 when absent.
    #[must_use]
    pub fn int(&self, key: &str) -> i64 {
        self.int_or(key, 0)
    }

    /// Floating-point counter, 0 when absent or not numeric.
    #[must_use]
    pub fn float(&self, key: &str) -> f64 {
        match self.values.get(key) {
            Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(serde_json::Value::String(s)) => s.trim().parse().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    fn mode(&self, mode: &str) -> ModeRecord {
        ModeRecord {
            total: self.int(&format!("GameMode.{mode}.TotalMatches")),
            wins: self.int(&format!("GameMode.{mode}.Wins")),
            mvp: self.int(&format!("GameMode.{mode}.MVP")),
            losses: self.int(&format!("GameMode.{mode}.Losses")),
            abandons: self.int(&format!("GameMode.{mode}.Abandonded")),
        }
    }
}

/// Match results for one game mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeRecord {
    /// Matches played.
    pub total: i64,
    /// Matches won.
    pub wins: i64,
    /// Matches finished as MVP.
    pub mvp: i64,
    /// Matches lost.
    pub losses: i64,
    /// Matches left early.
    pub abandons: i64,
}

impl ModeRecord {
    fn minus_clamped(self, other: Self) -> Self {
        Self {
            total: (self.total - other.total).max(0),
            wins: (self.wins - other.wins).max(0),
            mvp: (self.mvp - other.mvp).max(0),
            losses: (self.losses - other.losses).max(0),
            abandons: (self.abandons - other.abandons).max(0),
        }
    }

    fn win_loss(self) -> Option<f64> {
        let lost = self.losses + self.abandons;
        (self.total >= MIN_MATCHES && self.wins > 0 && lost > 0)
            .then(|| self.wins as f64 / lost as f64)
    }

    /// Deathmatch has no winning team; MVPs count as wins and non-MVP
    /// "wins" count against.
    fn mvp_loss(self) -> Option<f64> {
        let lost = self.losses + self.abandons + (self.wins - self.mvp);
        (self.total >= MIN_MATCHES && self.mvp > 0 && lost > 0)
            .then(|| self.mvp as f64 / lost as f64)
    }
}

/// Unranked counters kept with each snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotCounters {
    /// Total kills.
    pub kills: i64,
    /// Total deaths.
    pub deaths: i64,
    /// Total assists.
    pub assists: i64,
    /// Kills taken from another player's target.
    pub kill_steals: i64,
    /// Assists that dealt critical damage.
    pub critical_assists: i64,
    /// Damage sustained.
    pub damage_in: f64,
    /// Damage dealt.
    pub damage_out: f64,
    /// All modes except co-op team deathmatch.
    pub all: ModeRecord,
    /// Deathmatch.
    pub dm: ModeRecord,
    /// Team deathmatch.
    pub tdm: ModeRecord,
    /// Missile assault.
    pub ma: ModeRecord,
    /// Siege.
    pub sg: ModeRecord,
    /// Co-op bot destruction.
    pub coop: ModeRecord,
    /// Co-op team deathmatch.
    pub cooptdm: ModeRecord,
}

/// One player's statistics at one update run.
///
/// Keyed by `(player_id, snapshot_taken)`; never modified once written.
/// Ratio fields are `None` when the player is below the sampling
/// thresholds for that ratio.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerStatsSnapshot {
    /// Player the snapshot belongs to.
    pub player_id: PlayerId,
    /// Start of the update run that took it.
    pub snapshot_taken: DateTime<Utc>,
    /// Pilot level, 1 when unreported.
    pub pilot_level: i32,
    /// Seconds played.
    pub time_played: i64,
    /// Unranked counters.
    pub counters: SnapshotCounters,
    /// Matchmaking rating; `None` for the backend defaults.
    pub mmr: Option<f64>,
    /// Experience points.
    pub xp: Option<i64>,
    /// Experience points per minute played.
    pub xp_per_min: Option<f64>,
    /// Hawken credits earned.
    pub hc: Option<i64>,
    /// Hawken credits per minute played.
    pub hc_per_min: Option<f64>,
    /// `(kills + assists) / deaths`.
    pub kda: Option<f64>,
    /// Kill steals per kill.
    pub kill_steal_ratio: Option<f64>,
    /// Critical assists per assist.
    pub critical_assist_ratio: Option<f64>,
    /// Damage dealt per damage sustained.
    pub damage_ratio: Option<f64>,
    /// Wins per loss over all modes but co-op team deathmatch.
    pub win_loss: Option<f64>,
    /// Deathmatch MVPs per match not won as MVP.
    pub dm_win_loss: Option<f64>,
    /// Team deathmatch wins per loss.
    pub tdm_win_loss: Option<f64>,
    /// Missile assault wins per loss.
    pub ma_win_loss: Option<f64>,
    /// Siege wins per loss.
    pub sg_win_loss: Option<f64>,
    /// Co-op wins per loss.
    pub coop_win_loss: Option<f64>,
    /// Co-op team deathmatch wins per loss.
    pub cooptdm_win_loss: Option<f64>,
}

impl PlayerStatsSnapshot {
    /// Derives a snapshot from raw counters.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
    pub fn from_raw(raw: &RawStats, snapshot_taken: DateTime<Utc>) -> Self {
        let cooptdm = raw.mode("CoOpTDM");
        let counters = SnapshotCounters {
            kills: raw.int("Kills.Total"),
            deaths: raw.int("Death.Total"),
            assists: raw.int("Assist.Total"),
            kill_steals: raw.int("Kills.Steal"),
            critical_assists: raw.int("Assist.CriticalDamage"),
            damage_in: raw.float("Damage.Sustained.Total"),
            damage_out: raw.float("Damage.Dealt.Total"),
            all: raw.mode("All").minus_clamped(cooptdm),
            dm: raw.mode("DM"),
            tdm: raw.mode("TDM"),
            ma: raw.mode("MA"),
            sg: raw.mode("SG"),
            coop: raw.mode("CoOp"),
            cooptdm,
        };

        let rating = raw.float("MatchMaking.Rating");
        let mmr = (!DEFAULT_MMRS.contains(&rating)).then_some(rating);
        let pilot_level = i32::try_from(raw.int_or("Progress.Pilot.Level", 1)).unwrap_or(1);
        let time_played = raw.int("TimePlayed");

        let mut snapshot = Self {
            player_id: raw.guid.clone(),
            snapshot_taken,
            pilot_level,
            time_played,
            counters,
            mmr,
            xp: None,
            xp_per_min: None,
            hc: None,
            hc_per_min: None,
            kda: None,
            kill_steal_ratio: None,
            critical_assist_ratio: None,
            damage_ratio: None,
            win_loss: None,
            dm_win_loss: None,
            tdm_win_loss: None,
            ma_win_loss: None,
            sg_win_loss: None,
            coop_win_loss: None,
            cooptdm_win_loss: None,
        };
        if time_played >= MIN_TIME_PLAYED {
            snapshot.derive_ratios(raw);
        }
        snapshot
    }

    fn derive_ratios(&mut self, raw: &RawStats) {
        let seconds = self.time_played as f64;
        let c = &self.counters;

        let xp = raw.int("ExpPoints");
        if xp > 0 {
            self.xp = Some(xp);
            self.xp_per_min = Some(xp as f64 / seconds * 60.0);
        }
        let hc = raw.int("HawkenPoints");
        if hc > 0 {
            self.hc = Some(hc);
            self.hc_per_min = Some(hc as f64 / seconds * 60.0);
        }

        if c.kills >= MIN_KILLS && c.deaths > 0 && c.assists >= MIN_ASSISTS {
            self.kda = Some((c.kills + c.assists) as f64 / c.deaths as f64);
        }
        if c.kill_steals > 0 && c.kills >= MIN_KILLS {
            self.kill_steal_ratio = Some(c.kill_steals as f64 / c.kills as f64);
        }
        if c.critical_assists > 0 && c.assists >= MIN_ASSISTS {
            self.critical_assist_ratio = Some(c.critical_assists as f64 / c.assists as f64);
        }
        if c.damage_in > 0.0 && c.damage_out > 0.0 {
            self.damage_ratio = Some(c.damage_out / c.damage_in);
        }

        self.win_loss = c.all.win_loss();
        self.dm_win_loss = c.dm.mvp_loss();
        self.tdm_win_loss = c.tdm.win_loss();
        self.ma_win_loss = c.ma.win_loss();
        self.sg_win_loss = c.sg.win_loss();
        self.coop_win_loss = c.coop.win_loss();
        self.cooptdm_win_loss = c.cooptdm.win_loss();
    }
}

/// A snapshot column that has a global ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RankedField {
    /// Matchmaking rating.
    Mmr,
    /// Seconds played.
    TimePlayed,
    /// Experience points.
    Xp,
    /// Experience points per minute.
    XpPerMin,
    /// Hawken credits.
    Hc,
    /// Hawken credits per minute.
    HcPerMin,
    /// Kills and assists per death.
    Kda,
    /// Kill steals per kill.
    KillStealRatio,
    /// Critical assists per assist.
    CriticalAssistRatio,
    /// Damage dealt per damage sustained.
    DamageRatio,
    /// Cross-mode wins per loss.
    WinLoss,
    /// Deathmatch MVP ratio.
    DmWinLoss,
    /// Team deathmatch wins per loss.
    TdmWinLoss,
    /// Missile assault wins per loss.
    MaWinLoss,
    /// Siege wins per loss.
    SgWinLoss,
    /// Co-op wins per loss.
    CoopWinLoss,
    /// Co-op team deathmatch wins per loss.
    CooptdmWinLoss,
}

impl RankedField {
    /// Every ranked field, in rebuild order. A rebuild checkpoint is an
    /// index into this array.
    pub const ALL: [Self; 17] = [
        Self::Mmr,
        Self::TimePlayed,
        Self::Xp,
        Self::XpPerMin,
        Self::Hc,
        Self::HcPerMin,
        Self::Kda,
        Self::KillStealRatio,
        Self::CriticalAssistRatio,
        Self::DamageRatio,
        Self::WinLoss,
        Self::DmWinLoss,
        Self::TdmWinLoss,
        Self::MaWinLoss,
        Self::SgWinLoss,
        Self::CoopWinLoss,
        Self::CooptdmWinLoss,
    ];

    /// Column name in `player_stats`; also the rank store key suffix.
    #[must_use]
    pub const fn column(self) -> &'static str {
        match self {
            Self::Mmr => "mmr",
            Self::TimePlayed => "time_played",
            Self::Xp => "xp",
            Self::XpPerMin => "xp_per_min",
            Self::Hc => "hc",
            Self::HcPerMin => "hc_per_min",
            Self::Kda => "kda",
            Self::KillStealRatio => "kill_steal_ratio",
            Self::CriticalAssistRatio => "critical_assist_ratio",
            Self::DamageRatio => "damage_ratio",
            Self::WinLoss => "win_loss",
            Self::DmWinLoss => "dm_win_loss",
            Self::TdmWinLoss => "tdm_win_loss",
            Self::MaWinLoss => "ma_win_loss",
            Self::SgWinLoss => "sg_win_loss",
            Self::CoopWinLoss => "coop_win_loss",
            Self::CooptdmWinLoss => "cooptdm_win_loss",
        }
    }

    /// Value excluded from ranking besides NULL.
    #[must_use]
    pub const fn unset(self) -> Option<f64> {
        match self {
            Self::TimePlayed => Some(0.0),
            _ => None,
        }
    }

    /// Rankable value of this field in `snapshot`, if any.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn value(self, snapshot: &PlayerStatsSnapshot) -> Option<f64> {
        let value = match self {
            Self::Mmr => snapshot.mmr,
            Self::TimePlayed => Some(snapshot.time_played as f64),
            Self::Xp => snapshot.xp.map(|v| v as f64),
            Self::XpPerMin => snapshot.xp_per_min,
            Self::Hc => snapshot.hc.map(|v| v as f64),
            Self::HcPerMin => snapshot.hc_per_min,
            Self::Kda => snapshot.kda,
            Self::KillStealRatio => snapshot.kill_steal_ratio,
            Self::CriticalAssistRatio => snapshot.critical_assist_ratio,
            Self::DamageRatio => snapshot.damage_ratio,
            Self::WinLoss => snapshot.win_loss,
            Self::DmWinLoss => snapshot.dm_win_loss,
            Self::TdmWinLoss => snapshot.tdm_win_loss,
            Self::MaWinLoss => snapshot.ma_win_loss,
            Self::SgWinLoss => snapshot.sg_win_loss,
            Self::CoopWinLoss => snapshot.coop_win_loss,
            Self::CooptdmWinLoss => snapshot.cooptdm_win_loss,
        }?;
        match self.unset() {
            Some(unset) if value == unset => None,
            _ => Some(value),
        }
    }
}

impl fmt::Display for RankedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

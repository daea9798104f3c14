//! PostgreSQL implementation of [`TrackerSession`].
//!
//! A [`PgSession`] owns at most one open `sqlx` transaction, begun lazily
//! on the first statement. Savepoints and the ranking cursor are plain SQL
//! issued inside that transaction. Bulk writes use `QueryBuilder` multi-row
//! inserts or `UNNEST` updates so each window costs a handful of round
//! trips regardless of its size.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Row, Transaction};

use super::{
    ParticipantStats, RegionCount, TrackerSession, Window, WindowDomain, WindowFilter,
};
use crate::config::TrackerConfig;
use crate::domain::{
    JournalRow, JournalTable, Match, MatchAggregate, MatchId, MatchPlayer, MatchSummary, Player,
    PlayerId, PlayerStatsSnapshot, RankedField, RunStatus, ServerInfo,
};
use crate::error::TrackerError;

/// Rows per multi-row `INSERT`; keeps bind counts well under the
/// protocol's 65535 parameter limit.
const INSERT_CHUNK: usize = 500;

const RANK_CURSOR: &str = "rank_cursor";

const MATCH_COLUMNS: &str = "id, server_id, server_name, server_region, server_gametype, \
     server_map, server_version, server_matchmaking, server_tournament, \
     server_password_protected, server_mmr_ignored, first_seen, last_seen, last_stats_update, \
     pilot_level_avg, mmr_avg, mmr_min, mmr_max, mmr_stddev, match_started, match_ended, \
     players_started, players_ended, winning_team, win_reason";

const SNAPSHOT_COLUMNS: &str = "player_id, snapshot_taken, pilot_level, time_played, counters, \
     mmr, xp, xp_per_min, hc, hc_per_min, kda, kill_steal_ratio, critical_assist_ratio, \
     damage_ratio, win_loss, dm_win_loss, tdm_win_loss, ma_win_loss, sg_win_loss, \
     coop_win_loss, cooptdm_win_loss";

/// Opens the connection pool described by `config`.
///
/// # Errors
///
/// Returns [`TrackerError::Persistence`] if the database is unreachable.
pub async fn connect_pool(config: &TrackerConfig) -> Result<PgPool, TrackerError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .min_connections(config.database_min_connections)
        .acquire_timeout(Duration::from_secs(config.database_connect_timeout_secs))
        .connect(&config.database_url)
        .await?;
    Ok(pool)
}

/// Applies the embedded schema migrations.
///
/// # Errors
///
/// Returns [`TrackerError::Persistence`] if a migration fails.
pub async fn run_migrations(pool: &PgPool) -> Result<(), TrackerError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn player_ids(ids: &[PlayerId]) -> Vec<String> {
    ids.iter().map(|id| id.as_str().to_string()).collect()
}

fn match_ids(ids: &[MatchId]) -> Vec<String> {
    ids.iter().map(|id| id.as_str().to_string()).collect()
}

fn count_to_u64(count: i64) -> u64 {
    u64::try_from(count).unwrap_or(0)
}

/// Appends the `AND` conditions of `filter`; the builder must already be
/// inside a `WHERE`.
fn push_window_filter(
    qb: &mut QueryBuilder<'_, Postgres>,
    domain: WindowDomain,
    filter: &WindowFilter,
) {
    if let Some(since) = filter.first_seen_since {
        qb.push(" AND first_seen >= ").push_bind(since);
    }
    if filter.skip_blacklisted && domain == WindowDomain::PlayersLastSeen {
        qb.push(" AND NOT blacklisted");
    }
}

/// Appends `WHERE` restricting `last_seen` to `window` plus `filter`.
fn push_window_predicate(
    qb: &mut QueryBuilder<'_, Postgres>,
    domain: WindowDomain,
    filter: &WindowFilter,
    window: &Window<DateTime<Utc>>,
) {
    qb.push(" WHERE last_seen >= ").push_bind(window.start);
    if let Some(end) = window.end {
        qb.push(" AND last_seen < ").push_bind(end);
    }
    push_window_filter(qb, domain, filter);
}

fn valid_savepoint(name: &str) -> Result<&str, TrackerError> {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(TrackerError::Internal(format!("invalid savepoint name {name:?}")))
    }
}

fn match_from_row(row: &PgRow) -> Result<Match, sqlx::Error> {
    Ok(Match {
        id: MatchId::from(row.try_get::<String, _>("id")?),
        info: ServerInfo {
            server_id: row.try_get("server_id")?,
            name: row.try_get("server_name")?,
            region: row.try_get("server_region")?,
            game_type: row.try_get("server_gametype")?,
            map: row.try_get("server_map")?,
            version: row.try_get("server_version")?,
            matchmaking: row.try_get("server_matchmaking")?,
            tournament: row.try_get("server_tournament")?,
            password_protected: row.try_get("server_password_protected")?,
            mmr_ignored: row.try_get("server_mmr_ignored")?,
        },
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
        aggregate: MatchAggregate {
            mmr_avg: row.try_get("mmr_avg")?,
            mmr_min: row.try_get("mmr_min")?,
            mmr_max: row.try_get("mmr_max")?,
            mmr_stddev: row.try_get("mmr_stddev")?,
            pilot_level_avg: row.try_get("pilot_level_avg")?,
            last_stats_update: row.try_get("last_stats_update")?,
        },
        summary: MatchSummary {
            match_started: row.try_get("match_started")?,
            match_ended: row.try_get("match_ended")?,
            players_started: row.try_get("players_started")?,
            players_ended: row.try_get("players_ended")?,
            winning_team: row.try_get("winning_team")?,
            win_reason: row.try_get("win_reason")?,
        },
    })
}

type PlayerTuple = (
    String,
    Option<String>,
    DateTime<Utc>,
    DateTime<Utc>,
    Option<String>,
    bool,
    Option<DateTime<Utc>>,
);

type MatchPlayerTuple = (
    String,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
    Option<i32>,
    Option<i32>,
    Option<f64>,
    Option<bool>,
    Option<bool>,
);

type JournalTuple = (
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    f64,
    i16,
    i16,
    Option<i64>,
    Option<i64>,
    Vec<String>,
    serde_json::Value,
);

/// Relational session backed by a PostgreSQL pool.
pub struct PgSession {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
    cursor_open: bool,
}

impl fmt::Debug for PgSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgSession")
            .field("in_transaction", &self.tx.is_some())
            .field("cursor_open", &self.cursor_open)
            .finish_non_exhaustive()
    }
}

impl PgSession {
    /// Creates a session; no connection is taken until the first statement.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            tx: None,
            cursor_open: false,
        }
    }

    async fn conn(&mut self) -> Result<&mut PgConnection, TrackerError> {
        if self.tx.is_none() {
            self.tx = Some(self.pool.begin().await?);
        }
        self.tx
            .as_deref_mut()
            .ok_or_else(|| TrackerError::Internal("transaction not open".to_string()))
    }
}

#[async_trait]
impl TrackerSession for PgSession {
    async fn commit(&mut self) -> Result<(), TrackerError> {
        self.cursor_open = false;
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
            tracing::debug!("transaction committed");
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), TrackerError> {
        self.cursor_open = false;
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
            tracing::debug!("transaction rolled back");
        }
        Ok(())
    }

    async fn savepoint(&mut self, name: &str) -> Result<(), TrackerError> {
        let sql = format!("SAVEPOINT {}", valid_savepoint(name)?);
        sqlx::query(&sql).execute(self.conn().await?).await?;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), TrackerError> {
        let sql = format!("ROLLBACK TO SAVEPOINT {}", valid_savepoint(name)?);
        sqlx::query(&sql).execute(self.conn().await?).await?;
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<(), TrackerError> {
        let sql = format!("RELEASE SAVEPOINT {}", valid_savepoint(name)?);
        sqlx::query(&sql).execute(self.conn().await?).await?;
        Ok(())
    }

    async fn last_journal(
        &mut self,
        table: JournalTable,
    ) -> Result<Option<JournalRow>, TrackerError> {
        let sql = format!(
            "SELECT start_time, end_time, time_elapsed, status, stage, current_step, total_steps, \
             flags, counters FROM {} ORDER BY start_time DESC LIMIT 1",
            table.table_name()
        );
        let row = sqlx::query_as::<_, JournalTuple>(&sql)
            .fetch_optional(self.conn().await?)
            .await?;

        Ok(row.map(
            |(
                start,
                end,
                time_elapsed,
                status,
                stage,
                current_step,
                total_steps,
                flags,
                counters,
            )| {
                JournalRow {
                    start,
                    end,
                    time_elapsed,
                    status,
                    stage,
                    current_step,
                    total_steps,
                    flags,
                    counters,
                }
            },
        ))
    }

    async fn last_completed_start(
        &mut self,
        table: JournalTable,
    ) -> Result<Option<DateTime<Utc>>, TrackerError> {
        let sql = format!(
            "SELECT start_time FROM {} WHERE status = $1 ORDER BY start_time DESC LIMIT 1",
            table.table_name()
        );
        let start = sqlx::query_scalar::<_, DateTime<Utc>>(&sql)
            .bind(RunStatus::Complete.code())
            .fetch_optional(self.conn().await?)
            .await?;
        Ok(start)
    }

    async fn save_journal(
        &mut self,
        table: JournalTable,
        row: &JournalRow,
    ) -> Result<(), TrackerError> {
        let sql = format!(
            "INSERT INTO {} (start_time, end_time, time_elapsed, status, stage, current_step, \
             total_steps, flags, counters) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (start_time) DO UPDATE SET end_time = EXCLUDED.end_time, \
             time_elapsed = EXCLUDED.time_elapsed, status = EXCLUDED.status, \
             stage = EXCLUDED.stage, current_step = EXCLUDED.current_step, \
             total_steps = EXCLUDED.total_steps, flags = EXCLUDED.flags, \
             counters = EXCLUDED.counters",
            table.table_name()
        );
        sqlx::query(&sql)
            .bind(row.start)
            .bind(row.end)
            .bind(row.time_elapsed)
            .bind(row.status)
            .bind(row.stage)
            .bind(row.current_step)
            .bind(row.total_steps)
            .bind(row.flags.clone())
            .bind(row.counters.clone())
            .execute(self.conn().await?)
            .await?;
        Ok(())
    }

    async fn find_players(&mut self, ids: &[PlayerId]) -> Result<Vec<Player>, TrackerError> {
        let rows = sqlx::query_as::<_, PlayerTuple>(
            "SELECT id, callsign, first_seen, last_seen, common_region, blacklisted, \
             latest_snapshot FROM players WHERE id = ANY($1)",
        )
        .bind(player_ids(ids))
        .fetch_all(self.conn().await?)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(
                    id,
                    callsign,
                    first_seen,
                    last_seen,
                    common_region,
                    blacklisted,
                    latest_snapshot,
                )| {
                    Player {
                        id: PlayerId::from(id),
                        callsign,
                        first_seen,
                        last_seen,
                        common_region,
                        blacklisted,
                        latest_snapshot,
                    }
                },
            )
            .collect())
    }

    async fn mark_players_seen(
        &mut self,
        ids: &[PlayerId],
        at: DateTime<Utc>,
    ) -> Result<u64, TrackerError> {
        let result = sqlx::query(
            "UPDATE players SET last_seen = GREATEST(last_seen, $2) WHERE id = ANY($1)",
        )
        .bind(player_ids(ids))
        .bind(at)
        .execute(self.conn().await?)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_players(&mut self, players: &[Player]) -> Result<(), TrackerError> {
        let conn = self.conn().await?;
        for chunk in players.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO players (id, callsign, first_seen, last_seen, common_region, \
                 blacklisted, latest_snapshot) ",
            );
            qb.push_values(chunk, |mut b, p| {
                b.push_bind(p.id.as_str().to_string())
                    .push_bind(p.callsign.clone())
                    .push_bind(p.first_seen)
                    .push_bind(p.last_seen)
                    .push_bind(p.common_region.clone())
                    .push_bind(p.blacklisted)
                    .push_bind(p.latest_snapshot);
            });
            qb.build().execute(&mut *conn).await?;
        }
        Ok(())
    }

    async fn set_callsigns(
        &mut self,
        callsigns: &[(PlayerId, Option<String>)],
    ) -> Result<(), TrackerError> {
        let (ids, names): (Vec<String>, Vec<Option<String>>) = callsigns
            .iter()
            .map(|(id, name)| (id.as_str().to_string(), name.clone()))
            .unzip();
        sqlx::query(
            "UPDATE players AS p SET callsign = v.callsign \
             FROM UNNEST($1::text[], $2::text[]) AS v(id, callsign) WHERE p.id = v.id",
        )
        .bind(ids)
        .bind(names)
        .execute(self.conn().await?)
        .await?;
        Ok(())
    }

    async fn find_callsign_owners(
        &mut self,
        keys: &[String],
    ) -> Result<Vec<PlayerId>, TrackerError> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT id FROM players WHERE lower(callsign) = ANY($1)",
        )
        .bind(keys.to_vec())
        .fetch_all(self.conn().await?)
        .await?;
        Ok(ids.into_iter().map(PlayerId::from).collect())
    }

    async fn find_matches(&mut self, ids: &[MatchId]) -> Result<Vec<Match>, TrackerError> {
        let sql = format!("SELECT {MATCH_COLUMNS} FROM matches WHERE id = ANY($1)");
        let rows = sqlx::query(&sql)
            .bind(match_ids(ids))
            .fetch_all(self.conn().await?)
            .await?;
        let matches = rows
            .iter()
            .map(match_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(matches)
    }

    async fn upsert_matches(&mut self, matches: &[Match]) -> Result<(), TrackerError> {
        let conn = self.conn().await?;
        let updates = MATCH_COLUMNS
            .split(", ")
            .map(str::trim)
            .filter(|c| *c != "id")
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        for chunk in matches.chunks(INSERT_CHUNK) {
            let mut qb =
                QueryBuilder::<Postgres>::new(format!("INSERT INTO matches ({MATCH_COLUMNS}) "));
            qb.push_values(chunk, |mut b, m| {
                b.push_bind(m.id.as_str().to_string())
                    .push_bind(m.info.server_id.clone())
                    .push_bind(m.info.name.clone())
                    .push_bind(m.info.region.clone())
                    .push_bind(m.info.game_type.clone())
                    .push_bind(m.info.map.clone())
                    .push_bind(m.info.version.clone())
                    .push_bind(m.info.matchmaking)
                    .push_bind(m.info.tournament)
                    .push_bind(m.info.password_protected)
                    .push_bind(m.info.mmr_ignored)
                    .push_bind(m.first_seen)
                    .push_bind(m.last_seen)
                    .push_bind(m.aggregate.last_stats_update)
                    .push_bind(m.aggregate.pilot_level_avg)
                    .push_bind(m.aggregate.mmr_avg)
                    .push_bind(m.aggregate.mmr_min)
                    .push_bind(m.aggregate.mmr_max)
                    .push_bind(m.aggregate.mmr_stddev)
                    .push_bind(m.summary.match_started)
                    .push_bind(m.summary.match_ended)
                    .push_bind(m.summary.players_started)
                    .push_bind(m.summary.players_ended)
                    .push_bind(m.summary.winning_team)
                    .push_bind(m.summary.win_reason.clone());
            });
            qb.push(" ON CONFLICT (id) DO UPDATE SET ");
            qb.push(&updates);
            qb.build().execute(&mut *conn).await?;
        }
        Ok(())
    }

    async fn find_match_players(
        &mut self,
        match_id: &MatchId,
        players: &[PlayerId],
    ) -> Result<Vec<MatchPlayer>, TrackerError> {
        let rows = sqlx::query_as::<_, MatchPlayerTuple>(
            "SELECT match_id, player_id, first_seen, last_seen, team, kills, player_mmr, \
             started_with, ended_with FROM match_players \
             WHERE match_id = $1 AND player_id = ANY($2)",
        )
        .bind(match_id.as_str())
        .bind(player_ids(players))
        .fetch_all(self.conn().await?)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(
                    match_id,
                    player_id,
                    first_seen,
                    last_seen,
                    team,
                    kills,
                    player_mmr,
                    started_with,
                    ended_with,
                )| {
                    MatchPlayer {
                        match_id: MatchId::from(match_id),
                        player_id: PlayerId::from(player_id),
                        first_seen,
                        last_seen,
                        team,
                        kills,
                        player_mmr,
                        started_with,
                        ended_with,
                    }
                },
            )
            .collect())
    }

    async fn upsert_match_players(&mut self, rows: &[MatchPlayer]) -> Result<(), TrackerError> {
        let conn = self.conn().await?;
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO match_players (match_id, player_id, first_seen, last_seen, team, \
                 kills, player_mmr, started_with, ended_with) ",
            );
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(r.match_id.as_str().to_string())
                    .push_bind(r.player_id.as_str().to_string())
                    .push_bind(r.first_seen)
                    .push_bind(r.last_seen)
                    .push_bind(r.team)
                    .push_bind(r.kills)
                    .push_bind(r.player_mmr)
                    .push_bind(r.started_with)
                    .push_bind(r.ended_with);
            });
            qb.push(
                " ON CONFLICT (match_id, player_id) DO UPDATE SET \
                 first_seen = EXCLUDED.first_seen, last_seen = EXCLUDED.last_seen, \
                 team = EXCLUDED.team, kills = EXCLUDED.kills, \
                 player_mmr = EXCLUDED.player_mmr, started_with = EXCLUDED.started_with, \
                 ended_with = EXCLUDED.ended_with",
            );
            qb.build().execute(&mut *conn).await?;
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
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT last_seen FROM (SELECT last_seen, row_number() OVER (ORDER BY last_seen) \
             AS rownum FROM {} WHERE TRUE",
            domain.table()
        ));
        if let Some(begin) = begin {
            qb.push(" AND last_seen >= ").push_bind(begin);
        }
        if let Some(end) = end {
            qb.push(" AND last_seen < ").push_bind(end);
        }
        push_window_filter(&mut qb, domain, filter);
        let step = i64::try_from(size.max(1)).unwrap_or(i64::MAX);
        qb.push(") AS sampled WHERE (rownum - 1) % ")
            .push_bind(step)
            .push(" = 0 ORDER BY last_seen");
        let bounds = qb
            .build_query_scalar::<DateTime<Utc>>()
            .fetch_all(self.conn().await?)
            .await?;
        Ok(bounds)
    }

    async fn count_in_window(
        &mut self,
        domain: WindowDomain,
        filter: &WindowFilter,
        window: &Window<DateTime<Utc>>,
    ) -> Result<u64, TrackerError> {
        let mut qb =
            QueryBuilder::<Postgres>::new(format!("SELECT count(*) FROM {}", domain.table()));
        push_window_predicate(&mut qb, domain, filter, window);
        let count = qb
            .build_query_scalar::<i64>()
            .fetch_one(self.conn().await?)
            .await?;
        Ok(count_to_u64(count))
    }

    async fn players_in_window(
        &mut self,
        filter: &WindowFilter,
        window: &Window<DateTime<Utc>>,
    ) -> Result<Vec<PlayerId>, TrackerError> {
        let domain = WindowDomain::PlayersLastSeen;
        let mut qb = QueryBuilder::<Postgres>::new("SELECT id FROM players");
        push_window_predicate(&mut qb, domain, filter, window);
        qb.push(" ORDER BY last_seen, id");
        let ids = qb
            .build_query_scalar::<String>()
            .fetch_all(self.conn().await?)
            .await?;
        Ok(ids.into_iter().map(PlayerId::from).collect())
    }

    async fn matches_in_window(
        &mut self,
        filter: &WindowFilter,
        window: &Window<DateTime<Utc>>,
    ) -> Result<Vec<MatchId>, TrackerError> {
        let domain = WindowDomain::MatchesLastSeen;
        let mut qb = QueryBuilder::<Postgres>::new("SELECT id FROM matches");
        push_window_predicate(&mut qb, domain, filter, window);
        qb.push(" ORDER BY last_seen, id");
        let ids = qb
            .build_query_scalar::<String>()
            .fetch_all(self.conn().await?)
            .await?;
        Ok(ids.into_iter().map(MatchId::from).collect())
    }

    async fn insert_snapshots(
        &mut self,
        snapshots: &[PlayerStatsSnapshot],
    ) -> Result<(), TrackerError> {
        let counters = snapshots
            .iter()
            .map(|s| serde_json::to_value(&s.counters))
            .collect::<Result<Vec<_>, _>>()?;
        let updates = SNAPSHOT_COLUMNS
            .split(", ")
            .map(str::trim)
            .filter(|c| *c != "player_id" && *c != "snapshot_taken")
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let rows: Vec<(&PlayerStatsSnapshot, serde_json::Value)> =
            snapshots.iter().zip(counters).collect();

        let conn = self.conn().await?;
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO player_stats ({SNAPSHOT_COLUMNS}) "
            ));
            qb.push_values(chunk, |mut b, (s, counters)| {
                b.push_bind(s.player_id.as_str().to_string())
                    .push_bind(s.snapshot_taken)
                    .push_bind(s.pilot_level)
                    .push_bind(s.time_played)
                    .push_bind(counters.clone())
                    .push_bind(s.mmr)
                    .push_bind(s.xp)
                    .push_bind(s.xp_per_min)
                    .push_bind(s.hc)
                    .push_bind(s.hc_per_min)
                    .push_bind(s.kda)
                    .push_bind(s.kill_steal_ratio)
                    .push_bind(s.critical_assist_ratio)
                    .push_bind(s.damage_ratio)
                    .push_bind(s.win_loss)
                    .push_bind(s.dm_win_loss)
                    .push_bind(s.tdm_win_loss)
                    .push_bind(s.ma_win_loss)
                    .push_bind(s.sg_win_loss)
                    .push_bind(s.coop_win_loss)
                    .push_bind(s.cooptdm_win_loss);
            });
            qb.push(" ON CONFLICT (player_id, snapshot_taken) DO UPDATE SET ");
            qb.push(&updates);
            qb.build().execute(&mut *conn).await?;
        }
        Ok(())
    }

    async fn set_latest_snapshots(
        &mut self,
        ids: &[PlayerId],
        taken: DateTime<Utc>,
    ) -> Result<(), TrackerError> {
        sqlx::query("UPDATE players SET latest_snapshot = $2 WHERE id = ANY($1)")
            .bind(player_ids(ids))
            .bind(taken)
            .execute(self.conn().await?)
            .await?;
        Ok(())
    }

    async fn player_region_counts(
        &mut self,
        ids: &[PlayerId],
    ) -> Result<Vec<RegionCount>, TrackerError> {
        let rows = sqlx::query_as::<_, (String, String, i64)>(
            "SELECT mp.player_id, m.server_region, count(DISTINCT m.id) \
             FROM match_players mp JOIN matches m ON m.id = mp.match_id \
             WHERE mp.player_id = ANY($1) GROUP BY mp.player_id, m.server_region",
        )
        .bind(player_ids(ids))
        .fetch_all(self.conn().await?)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(player_id, region, matches)| RegionCount {
                player_id: PlayerId::from(player_id),
                region,
                matches: count_to_u64(matches),
            })
            .collect())
    }

    async fn set_common_regions(
        &mut self,
        regions: &[(PlayerId, Option<String>)],
    ) -> Result<(), TrackerError> {
        let (ids, values): (Vec<String>, Vec<Option<String>>) = regions
            .iter()
            .map(|(id, region)| (id.as_str().to_string(), region.clone()))
            .unzip();
        sqlx::query(
            "UPDATE players AS p SET common_region = v.region \
             FROM UNNEST($1::text[], $2::text[]) AS v(id, region) WHERE p.id = v.id",
        )
        .bind(ids)
        .bind(values)
        .execute(self.conn().await?)
        .await?;
        Ok(())
    }

    async fn match_participant_stats(
        &mut self,
        ids: &[MatchId],
    ) -> Result<Vec<ParticipantStats>, TrackerError> {
        let rows = sqlx::query_as::<_, (String, Option<f64>, i32)>(
            "SELECT mp.match_id, s.mmr, s.pilot_level FROM match_players mp \
             JOIN players p ON p.id = mp.player_id \
             JOIN player_stats s ON s.player_id = p.id AND s.snapshot_taken = p.latest_snapshot \
             WHERE mp.match_id = ANY($1)",
        )
        .bind(match_ids(ids))
        .fetch_all(self.conn().await?)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(match_id, mmr, pilot_level)| ParticipantStats {
                match_id: MatchId::from(match_id),
                mmr,
                pilot_level,
            })
            .collect())
    }

    async fn set_match_aggregates(
        &mut self,
        aggregates: &[(MatchId, MatchAggregate)],
    ) -> Result<(), TrackerError> {
        let mut ids = Vec::with_capacity(aggregates.len());
        let mut avg = Vec::with_capacity(aggregates.len());
        let mut min = Vec::with_capacity(aggregates.len());
        let mut max = Vec::with_capacity(aggregates.len());
        let mut stddev = Vec::with_capacity(aggregates.len());
        let mut level = Vec::with_capacity(aggregates.len());
        let mut stamped = Vec::with_capacity(aggregates.len());
        for (id, a) in aggregates {
            ids.push(id.as_str().to_string());
            avg.push(a.mmr_avg);
            min.push(a.mmr_min);
            max.push(a.mmr_max);
            stddev.push(a.mmr_stddev);
            level.push(a.pilot_level_avg);
            stamped.push(a.last_stats_update);
        }
        sqlx::query(
            "UPDATE matches AS m SET mmr_avg = v.mmr_avg, mmr_min = v.mmr_min, \
             mmr_max = v.mmr_max, mmr_stddev = v.mmr_stddev, \
             pilot_level_avg = v.pilot_level_avg, last_stats_update = v.last_stats_update \
             FROM UNNEST($1::text[], $2::float8[], $3::float8[], $4::float8[], $5::float8[], \
                         $6::float8[], $7::timestamptz[]) \
               AS v(id, mmr_avg, mmr_min, mmr_max, mmr_stddev, pilot_level_avg, last_stats_update) \
             WHERE m.id = v.id",
        )
        .bind(ids)
        .bind(avg)
        .bind(min)
        .bind(max)
        .bind(stddev)
        .bind(level)
        .bind(stamped)
        .execute(self.conn().await?)
        .await?;
        Ok(())
    }

    async fn open_rank_cursor(&mut self, field: RankedField) -> Result<(), TrackerError> {
        if self.cursor_open {
            return Err(TrackerError::Persistence(
                "rank cursor already open".to_string(),
            ));
        }
        let column = field.column();
        let unset = field
            .unset()
            .map(|v| format!(" AND s.{column} <> {v}"))
            .unwrap_or_default();
        let sql = format!(
            "DECLARE {RANK_CURSOR} NO SCROLL CURSOR FOR \
             SELECT s.player_id, s.{column}::float8 FROM player_stats s \
             JOIN players p ON p.id = s.player_id AND p.latest_snapshot = s.snapshot_taken \
             WHERE NOT p.blacklisted AND s.{column} IS NOT NULL{unset} \
             ORDER BY s.{column} DESC, s.player_id ASC"
        );
        sqlx::query(&sql).execute(self.conn().await?).await?;
        self.cursor_open = true;
        Ok(())
    }

    async fn fetch_rank_batch(
        &mut self,
        limit: usize,
    ) -> Result<Vec<(PlayerId, f64)>, TrackerError> {
        if !self.cursor_open {
            return Err(TrackerError::Persistence("no rank cursor open".to_string()));
        }
        let sql = format!("FETCH FORWARD {} FROM {RANK_CURSOR}", limit.max(1));
        let rows = sqlx::query_as::<_, (String, f64)>(&sql)
            .fetch_all(self.conn().await?)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(id, value)| (PlayerId::from(id), value))
            .collect())
    }

    async fn close_rank_cursor(&mut self) -> Result<(), TrackerError> {
        if self.cursor_open {
            let sql = format!("CLOSE {RANK_CURSOR}");
            sqlx::query(&sql).execute(self.conn().await?).await?;
            self.cursor_open = false;
        }
        Ok(())
    }
}

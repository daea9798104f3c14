//! Redis-backed rank store and API token store.
//!
//! Each ranked field lives in one hash, `<prefix>:rank:<field>`, mapping
//! player ids to their rank plus a `total` entry. The access grant of the
//! stats API lives at `<prefix>:api_token`.

use std::fmt;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

use super::{RankStore, TokenStore};
use crate::domain::{PlayerId, RankedField};
use crate::error::TrackerError;

/// Hash entry holding the number of ranked players.
pub const TOTAL_KEY: &str = "total";

/// Joins key parts with `:`.
#[must_use]
pub fn format_key(parts: &[&str]) -> String {
    parts.join(":")
}

/// Redis connection plus key prefix.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connects to `url`; keys are namespaced under `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::RankStore`] if the URL is malformed or the
    /// server is unreachable.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, TrackerError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!(prefix, "connected to redis");
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    fn rank_key(&self, field: RankedField) -> String {
        format_key(&[&self.prefix, "rank", field.column()])
    }

    fn token_key(&self) -> String {
        format_key(&[&self.prefix, "api_token"])
    }
}

#[async_trait]
impl RankStore for RedisStore {
    async fn clear_field(&self, field: RankedField) -> Result<(), TrackerError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.rank_key(field)).await?;
        Ok(())
    }

    async fn set_ranks(
        &self,
        field: RankedField,
        ranks: &[(PlayerId, u64)],
    ) -> Result<(), TrackerError> {
        if ranks.is_empty() {
            return Ok(());
        }
        let items: Vec<(&str, u64)> = ranks.iter().map(|(id, rank)| (id.as_str(), *rank)).collect();
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(self.rank_key(field), &items)
            .await?;
        Ok(())
    }

    async fn set_total(&self, field: RankedField, total: u64) -> Result<(), TrackerError> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(self.rank_key(field), TOTAL_KEY, total)
            .await?;
        Ok(())
    }

    async fn get_rank(
        &self,
        field: RankedField,
        player: &PlayerId,
    ) -> Result<Option<u64>, TrackerError> {
        let mut conn = self.conn.clone();
        let rank: Option<u64> = conn.hget(self.rank_key(field), player.as_str()).await?;
        Ok(rank)
    }

    async fn get_total(&self, field: RankedField) -> Result<Option<u64>, TrackerError> {
        let mut conn = self.conn.clone();
        let total: Option<u64> = conn.hget(self.rank_key(field), TOTAL_KEY).await?;
        Ok(total)
    }
}

#[async_trait]
impl TokenStore for RedisStore {
    async fn load_token(&self) -> Result<Option<String>, TrackerError> {
        let mut conn = self.conn.clone();
        let token: Option<String> = conn.get(self.token_key()).await?;
        Ok(token.filter(|t| !t.is_empty()))
    }

    async fn store_token(&self, token: &str) -> Result<(), TrackerError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(self.token_key(), token).await?;
        tracing::debug!("api token persisted");
        Ok(())
    }
}

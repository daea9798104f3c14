//! Live collaborators shared by the tracker tasks.

use std::sync::Arc;

use sqlx::PgPool;

use crate::api::{ApiClient, HttpStatsApi, StatsApi};
use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::persistence::postgres::connect_pool;
use crate::persistence::{PgSession, RankStore, RedisStore, TokenStore};
use crate::service::{EventIngester, PollService, UpdateService};

/// Database pool, Redis store and stats service client, wired from
/// configuration.
#[derive(Debug, Clone)]
pub struct TrackerContext {
    /// Loaded configuration.
    pub config: TrackerConfig,
    /// PostgreSQL pool.
    pub pool: PgPool,
    /// Rank and token store.
    pub redis: RedisStore,
    /// Retrying stats service client.
    pub api: ApiClient,
}

impl TrackerContext {
    /// Connects every collaborator and restores or opens the stats
    /// service session.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Persistence`] or [`TrackerError::RankStore`]
    /// when a store is unreachable, [`TrackerError::InvalidConfig`] when
    /// the HTTP client cannot be built, or [`TrackerError::Interface`] when
    /// login fails.
    pub async fn connect(config: TrackerConfig) -> Result<Self, TrackerError> {
        let pool = connect_pool(&config).await?;
        let redis = RedisStore::connect(&config.redis_url, &config.redis_prefix).await?;

        let http: Arc<dyn StatsApi> = Arc::new(HttpStatsApi::new(&config.api)?);
        let tokens: Arc<dyn TokenStore> = Arc::new(redis.clone());
        let api = ApiClient::new(http, tokens, &config.api);
        api.connect().await?;

        tracing::info!(api = %config.api.base_url(), "tracker context ready");
        Ok(Self {
            config,
            pool,
            redis,
            api,
        })
    }

    /// A fresh unit of work on the pool.
    #[must_use]
    pub fn session(&self) -> PgSession {
        PgSession::new(self.pool.clone())
    }

    /// The poll pipeline.
    #[must_use]
    pub fn poll_service(&self) -> PollService {
        PollService::new(self.api.clone(), self.config.pipeline.clone())
    }

    /// The update pipeline, ranking into Redis.
    #[must_use]
    pub fn update_service(&self) -> UpdateService {
        let ranks: Arc<dyn RankStore> = Arc::new(self.redis.clone());
        UpdateService::new(self.api.clone(), ranks, self.config.pipeline.clone())
    }

    /// The match event ingester.
    #[must_use]
    pub fn event_ingester(&self) -> EventIngester {
        EventIngester::new(self.api.clone(), self.config.pipeline.clone())
    }
}

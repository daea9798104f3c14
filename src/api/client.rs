//! Retrying wrapper around a [`StatsApi`].
//!
//! Every pipeline call to the stats service goes through [`ApiClient::call`]:
//! transient failures are retried up to the configured attempt count, and
//! whatever finally escapes is a single [`TrackerError::Interface`] chained
//! to the last underlying [`ApiError`].

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::StatsApi;
use crate::config::ApiSettings;
use crate::domain::{PlayerId, RawStats, ServerListing};
use crate::error::{ApiError, TrackerError};
use crate::persistence::TokenStore;

/// Stats service handle shared by the pipelines.
#[derive(Clone)]
pub struct ApiClient {
    api: Arc<dyn StatsApi>,
    tokens: Arc<dyn TokenStore>,
    user: String,
    password: String,
    attempts: u32,
    retry_delay: Duration,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("api", &self.api)
            .field("user", &self.user)
            .field("attempts", &self.attempts)
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    /// Wraps `api`; the access grant is persisted through `tokens`.
    #[must_use]
    pub fn new(
        api: Arc<dyn StatsApi>,
        tokens: Arc<dyn TokenStore>,
        settings: &ApiSettings,
    ) -> Self {
        Self {
            api,
            tokens,
            user: settings.user.clone(),
            password: settings.password.clone(),
            attempts: settings.attempts.max(1),
            retry_delay: settings.retry_delay,
        }
    }

    /// Restores the persisted grant, or logs in and persists a new one.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Interface`] if login fails, or
    /// [`TrackerError::RankStore`] if the token store is unreachable.
    pub async fn connect(&self) -> Result<(), TrackerError> {
        if let Some(token) = self.tokens.load_token().await? {
            self.api.restore_session(&token).await;
            tracing::debug!("restored stats service session");
            return Ok(());
        }
        self.login().await
    }

    /// Writes the grant currently in use back to the token store.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::RankStore`] if the token store is
    /// unreachable.
    pub async fn persist_session(&self) -> Result<(), TrackerError> {
        if let Some(token) = self.api.session_token().await {
            self.tokens.store_token(&token).await?;
        }
        Ok(())
    }

    async fn login(&self) -> Result<(), TrackerError> {
        let token = self
            .retry("login", || self.api.login(&self.user, &self.password))
            .await?;
        self.tokens.store_token(&token).await
    }

    /// Runs `op` under the retry policy. An expired grant triggers one
    /// fresh login before the call is retried.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Interface`] once attempts are exhausted or a
    /// fatal error occurs.
    pub async fn call<T, F, Fut>(&self, name: &str, mut op: F) -> Result<T, TrackerError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, ApiError>> + Send,
        T: Send,
    {
        match self.retry(name, &mut op).await {
            Err(TrackerError::Interface {
                source: ApiError::Unauthorized(reason),
                ..
            }) => {
                tracing::warn!(
                    call = name,
                    %reason,
                    "stats service grant rejected, logging in again"
                );
                self.login().await?;
                self.retry(name, op).await
            }
            other => other,
        }
    }

    async fn retry<T, F, Fut>(&self, name: &str, mut op: F) -> Result<T, TrackerError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, ApiError>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.attempts => {
                    tracing::warn!(
                        call = name,
                        attempt,
                        max_attempts = self.attempts,
                        error = %err,
                        "stats service call failed, retrying"
                    );
                    let delay = self.retry_delay * attempt;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(source) => {
                    return Err(TrackerError::Interface {
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }

    /// Every live server listing.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Interface`] on service failure.
    pub async fn live_servers(&self) -> Result<Vec<ServerListing>, TrackerError> {
        self.call("list_live_servers", || self.api.list_live_servers())
            .await
    }

    /// One server listing, `None` once gone.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Interface`] on service failure.
    pub async fn server(&self, server_id: &str) -> Result<Option<ServerListing>, TrackerError> {
        self.call("get_server", || self.api.get_server(server_id))
            .await
    }

    /// Raw stat counters of `players`.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Interface`] on service failure.
    pub async fn stats(&self, players: &[PlayerId]) -> Result<Vec<RawStats>, TrackerError> {
        if players.is_empty() {
            return Ok(Vec::new());
        }
        self.call("get_stats", || self.api.get_stats(players)).await
    }

    /// Current callsigns of `players`.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Interface`] on service failure.
    pub async fn callsigns(
        &self,
        players: &[PlayerId],
    ) -> Result<HashMap<PlayerId, String>, TrackerError> {
        if players.is_empty() {
            return Ok(HashMap::new());
        }
        self.call("get_callsigns", || self.api.get_callsigns(players))
            .await
    }
}

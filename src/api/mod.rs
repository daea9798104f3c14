//! External stats / server-list service.
//!
//! [`StatsApi`] is the raw service surface; [`http::HttpStatsApi`] speaks it
//! over HTTP. Pipelines never call it directly: they go through
//! [`client::ApiClient`], which owns retry policy and session persistence.

pub mod client;
pub mod http;

#[cfg(test)]
pub(crate) mod fake;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;

use crate::domain::{PlayerId, RawStats, ServerListing};
use crate::error::ApiError;

pub use client::ApiClient;
pub use http::HttpStatsApi;

/// Calls offered by the stats service.
#[async_trait]
pub trait StatsApi: Send + Sync + fmt::Debug {
    /// Authenticates and returns the access grant.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Unauthorized`] for bad credentials, or a
    /// transport error.
    async fn login(&self, user: &str, password: &str) -> Result<String, ApiError>;

    /// Reuses a previously issued grant instead of logging in.
    async fn restore_session(&self, token: &str);

    /// Grant currently in use, if authenticated.
    async fn session_token(&self) -> Option<String>;

    /// Every live server listing.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] on transport or service failure.
    async fn list_live_servers(&self) -> Result<Vec<ServerListing>, ApiError>;

    /// One server listing; `None` once the server is gone.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] on transport or service failure.
    async fn get_server(&self, server_id: &str) -> Result<Option<ServerListing>, ApiError>;

    /// Raw stat counters for `players`; unknown players are omitted.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] on transport or service failure.
    async fn get_stats(&self, players: &[PlayerId]) -> Result<Vec<RawStats>, ApiError>;

    /// Current callsigns of `players`; players without one are omitted.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] on transport or service failure.
    async fn get_callsigns(
        &self,
        players: &[PlayerId],
    ) -> Result<HashMap<PlayerId, String>, ApiError>;
}

//! HTTP implementation of [`StatsApi`].
//!
//! Every response is wrapped in an envelope `{Status, Message, Result}`;
//! the envelope status is authoritative even when the HTTP status is 200.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;

use super::StatsApi;
use crate::config::ApiSettings;
use crate::domain::{PlayerId, RawStats, ServerListing};
use crate::error::{ApiError, TrackerError};

/// Players per batched stats / callsign request.
const BATCH_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Envelope<T> {
    status: u16,
    message: Option<String>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DisplayName {
    guid: PlayerId,
    game_display_name: Option<String>,
}

/// Stats service client over `reqwest`.
#[derive(Debug)]
pub struct HttpStatsApi {
    http: reqwest::Client,
    base_url: String,
    grant: RwLock<Option<String>>,
}

impl HttpStatsApi {
    /// Builds a client for `settings`; requests time out after
    /// `settings.timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::InvalidConfig`] if the HTTP client cannot
    /// be built.
    pub fn new(settings: &ApiSettings) -> Result<Self, TrackerError> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .user_agent(concat!("hawken-tracker/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TrackerError::InvalidConfig(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: settings.base_url(),
            grant: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Sends `request` and unwraps the envelope. `Ok(None)` means the
    /// service reported the resource as not found.
    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<Option<T>, ApiError> {
        let request = match self.grant.read().await.as_deref() {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        };
        let response = request.send().await?;
        let http_status = response.status();
        match http_status {
            StatusCode::NOT_FOUND => return Ok(None),
            StatusCode::SERVICE_UNAVAILABLE => return Err(ApiError::ServiceUnavailable),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(ApiError::Unauthorized(format!("http {http_status}")));
            }
            s if !s.is_success() => return Err(ApiError::Http { status: s.as_u16() }),
            _ => {}
        }

        let envelope: Envelope<T> = response.json().await?;
        match envelope.status {
            200 => Ok(envelope.result),
            404 => Ok(None),
            503 => Err(ApiError::ServiceUnavailable),
            401 | 403 => Err(ApiError::Unauthorized(envelope.message.unwrap_or_default())),
            status => Err(ApiError::Rejected {
                status,
                message: envelope.message.unwrap_or_default(),
            }),
        }
    }
}

#[async_trait]
impl StatsApi for HttpStatsApi {
    async fn login(&self, user: &str, password: &str) -> Result<String, ApiError> {
        let request = self
            .http
            .post(self.url(&format!("users/{user}/accessGrant")))
            .json(&serde_json::json!({ "Password": password }));
        let token: String = self
            .send(request)
            .await?
            .filter(|t: &String| !t.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("no access grant issued".to_string()))?;
        *self.grant.write().await = Some(token.clone());
        tracing::info!(user, "authenticated with stats service");
        Ok(token)
    }

    async fn restore_session(&self, token: &str) {
        *self.grant.write().await = Some(token.to_string());
    }

    async fn session_token(&self) -> Option<String> {
        self.grant.read().await.clone()
    }

    async fn list_live_servers(&self) -> Result<Vec<ServerListing>, ApiError> {
        let request = self.http.get(self.url("gameServerListings"));
        Ok(self.send(request).await?.unwrap_or_default())
    }

    async fn get_server(&self, server_id: &str) -> Result<Option<ServerListing>, ApiError> {
        let request = self
            .http
            .get(self.url(&format!("gameServerListings/{server_id}")));
        self.send(request).await
    }

    async fn get_stats(&self, players: &[PlayerId]) -> Result<Vec<RawStats>, ApiError> {
        let mut stats = Vec::with_capacity(players.len());
        for chunk in players.chunks(BATCH_LIMIT) {
            let request = self.http.post(self.url("statsBatch")).json(chunk);
            let batch: Vec<RawStats> = self.send(request).await?.unwrap_or_default();
            stats.extend(batch);
        }
        Ok(stats)
    }

    async fn get_callsigns(
        &self,
        players: &[PlayerId],
    ) -> Result<HashMap<PlayerId, String>, ApiError> {
        let mut callsigns = HashMap::with_capacity(players.len());
        for chunk in players.chunks(BATCH_LIMIT) {
            let request = self.http.post(self.url("userGameDisplayNames")).json(chunk);
            let names: Vec<DisplayName> = self.send(request).await?.unwrap_or_default();
            callsigns.extend(names.into_iter().filter_map(|n| {
                n.game_display_name
                    .filter(|name| !name.is_empty())
                    .map(|name| (n.guid, name))
            }));
        }
        Ok(callsigns)
    }
}

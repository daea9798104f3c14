//! Scripted in-process [`StatsApi`] for pipeline tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::StatsApi;
use crate::domain::{PlayerId, RawStats, ServerListing};
use crate::error::ApiError;

#[derive(Debug, Default)]
struct Script {
    servers: Vec<ServerListing>,
    stats: BTreeMap<PlayerId, RawStats>,
    callsigns: HashMap<PlayerId, String>,
    failures: VecDeque<ApiError>,
    calls: HashMap<&'static str, usize>,
    grant: Option<String>,
    logins: usize,
    expired_grant: Option<String>,
}

/// Stats service whose answers and failures are set up by the test.
#[derive(Debug, Default)]
pub(crate) struct ScriptedApi {
    script: Mutex<Script>,
}

impl ScriptedApi {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_servers(&self, servers: Vec<ServerListing>) {
        self.lock().servers = servers;
    }

    pub(crate) fn set_stats(&self, stats: RawStats) {
        self.lock().stats.insert(stats.guid.clone(), stats);
    }

    pub(crate) fn set_callsign(&self, player: &str, callsign: &str) {
        self.lock()
            .callsigns
            .insert(PlayerId::from(player), callsign.to_string());
    }

    /// Queues an error returned by the next call, whatever it is.
    pub(crate) fn fail_next(&self, err: ApiError) {
        self.lock().failures.push_back(err);
    }

    /// Makes `grant` answer `Unauthorized` until a fresh login.
    pub(crate) fn expire_grant(&self, grant: &str) {
        self.lock().expired_grant = Some(grant.to_string());
    }

    pub(crate) fn calls(&self, name: &str) -> usize {
        self.lock().calls.get(name).copied().unwrap_or(0)
    }

    pub(crate) fn logins(&self) -> usize {
        self.lock().logins
    }

    fn enter(&self, name: &'static str) -> Result<(), ApiError> {
        let mut script = self.lock();
        *script.calls.entry(name).or_insert(0) += 1;
        if let Some(err) = script.failures.pop_front() {
            return Err(err);
        }
        if name != "login" && script.grant.is_some() && script.grant == script.expired_grant {
            return Err(ApiError::Unauthorized("grant expired".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StatsApi for ScriptedApi {
    async fn login(&self, user: &str, password: &str) -> Result<String, ApiError> {
        self.enter("login")?;
        if password.is_empty() {
            return Err(ApiError::Unauthorized(format!("bad password for {user}")));
        }
        let mut script = self.lock();
        script.logins += 1;
        let grant = format!("grant-{}", script.logins);
        script.grant = Some(grant.clone());
        Ok(grant)
    }

    async fn restore_session(&self, token: &str) {
        self.lock().grant = Some(token.to_string());
    }

    async fn session_token(&self) -> Option<String> {
        self.lock().grant.clone()
    }

    async fn list_live_servers(&self) -> Result<Vec<ServerListing>, ApiError> {
        self.enter("list_live_servers")?;
        Ok(self.lock().servers.clone())
    }

    async fn get_server(&self, server_id: &str) -> Result<Option<ServerListing>, ApiError> {
        self.enter("get_server")?;
        Ok(self
            .lock()
            .servers
            .iter()
            .find(|s| s.guid == server_id)
            .cloned())
    }

    async fn get_stats(&self, players: &[PlayerId]) -> Result<Vec<RawStats>, ApiError> {
        self.enter("get_stats")?;
        let script = self.lock();
        Ok(players
            .iter()
            .filter_map(|p| script.stats.get(p).cloned())
            .collect())
    }

    async fn get_callsigns(
        &self,
        players: &[PlayerId],
    ) -> Result<HashMap<PlayerId, String>, ApiError> {
        self.enter("get_callsigns")?;
        let script = self.lock();
        Ok(players
            .iter()
            .filter_map(|p| script.callsigns.get(p).map(|c| (p.clone(), c.clone())))
            .collect())
    }
}

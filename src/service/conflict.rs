//! Resolution of case-insensitive callsign collisions.
//!
//! Callsigns change hands: a player may rename to a callsign another
//! stored player held before their own rename was observed. Such a write
//! trips the `ix_players_callsign` unique index. The resolver rolls the
//! write back to a savepoint, refreshes every stored holder of the
//! colliding names from the stats service (following renames transitively)
//! and then replays the original write.

use std::collections::{BTreeMap, HashMap};

use crate::api::ApiClient;
use crate::domain::{Player, PlayerId, callsign_key};
use crate::error::{CALLSIGN_CONSTRAINT, TrackerError};
use crate::persistence::TrackerSession;

const SAVEPOINT: &str = "callsign_write";

/// A write that may violate the callsign index.
#[derive(Debug, Clone, PartialEq)]
pub enum CallsignWrite {
    /// Insert new players with their callsigns.
    InsertPlayers(Vec<Player>),
    /// Overwrite callsigns of known players; `None` clears.
    SetCallsigns(Vec<(PlayerId, Option<String>)>),
}

impl CallsignWrite {
    /// Callsign updates for the `players` whose stored callsign differs
    /// from the one in `fresh`. Players missing from `fresh` keep theirs.
    #[must_use]
    pub fn renames(players: &[Player], fresh: &HashMap<PlayerId, String>) -> Self {
        Self::SetCallsigns(
            players
                .iter()
                .filter_map(|player| {
                    let current = fresh.get(&player.id)?;
                    (player.callsign.as_deref() != Some(current.as_str()))
                        .then(|| (player.id.clone(), Some(current.clone())))
                })
                .collect(),
        )
    }

    /// Case-folded callsigns the write stores.
    #[must_use]
    pub fn callsign_keys(&self) -> Vec<String> {
        match self {
            Self::InsertPlayers(players) => players
                .iter()
                .filter_map(|p| p.callsign.as_deref().map(callsign_key))
                .collect(),
            Self::SetCallsigns(callsigns) => callsigns
                .iter()
                .filter_map(|(_, c)| c.as_deref().map(callsign_key))
                .collect(),
        }
    }

    /// Rows touched by the write.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::InsertPlayers(players) => players.len(),
            Self::SetCallsigns(callsigns) => callsigns.len(),
        }
    }

    /// Returns `true` when the write touches nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn apply<S>(&self, session: &mut S) -> Result<(), TrackerError>
    where
        S: TrackerSession + ?Sized,
    {
        match self {
            Self::InsertPlayers(players) => session.insert_players(players).await,
            Self::SetCallsigns(callsigns) => session.set_callsigns(callsigns).await,
        }
    }
}

/// Wraps callsign writes with collision recovery.
#[derive(Debug, Clone, Copy)]
pub struct CallsignConflictResolver<'a> {
    api: &'a ApiClient,
    max_rounds: usize,
}

impl<'a> CallsignConflictResolver<'a> {
    /// Resolver that refreshes callsigns through `api`, giving up after
    /// `max_rounds` rounds.
    #[must_use]
    pub fn new(api: &'a ApiClient, max_rounds: usize) -> Self {
        Self {
            api,
            max_rounds: max_rounds.max(1),
        }
    }

    /// Performs `write`, resolving callsign collisions on the way.
    ///
    /// Returns the number of other players whose callsigns had to be
    /// refreshed.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::CallsignConflictUnresolved`] when collisions
    /// persist past the round limit. Any other error of the write,
    /// including violations of other constraints, is returned unchanged.
    pub async fn write<S>(
        &self,
        session: &mut S,
        write: &CallsignWrite,
    ) -> Result<u64, TrackerError>
    where
        S: TrackerSession + ?Sized,
    {
        if write.is_empty() {
            return Ok(0);
        }
        let mut refreshed = 0;
        for attempt in 1..=self.max_rounds {
            session.savepoint(SAVEPOINT).await?;
            match write.apply(session).await {
                Ok(()) => {
                    session.release_savepoint(SAVEPOINT).await?;
                    return Ok(refreshed);
                }
                Err(err) if err.is_unique_violation(CALLSIGN_CONSTRAINT) => {
                    session.rollback_to_savepoint(SAVEPOINT).await?;
                    session.release_savepoint(SAVEPOINT).await?;
                    tracing::warn!(
                        attempt,
                        rows = write.len(),
                        "callsign conflict, refreshing holders"
                    );
                    refreshed += self.refresh_holders(session, write.callsign_keys()).await?;
                }
                Err(err) => return Err(err),
            }
        }
        Err(TrackerError::CallsignConflictUnresolved {
            rounds: self.max_rounds,
        })
    }

    /// Clears and refetches the callsigns of every stored player holding
    /// one of `keys`, then of every player holding one of the refetched
    /// names, until no stored player holds a pending name.
    async fn refresh_holders<S>(
        &self,
        session: &mut S,
        mut keys: Vec<String>,
    ) -> Result<u64, TrackerError>
    where
        S: TrackerSession + ?Sized,
    {
        let mut pending: BTreeMap<PlayerId, Option<String>> = BTreeMap::new();
        for round in 1..=self.max_rounds {
            let holders = session.find_callsign_owners(&keys).await?;
            if holders.is_empty() {
                let updates: Vec<(PlayerId, Option<String>)> = pending.into_iter().collect();
                session.set_callsigns(&updates).await?;
                tracing::info!(
                    players = updates.len(),
                    rounds = round,
                    "callsign holders refreshed"
                );
                return Ok(u64::try_from(updates.len()).unwrap_or(u64::MAX));
            }

            let fresh = self.api.callsigns(&holders).await?;
            let cleared: Vec<(PlayerId, Option<String>)> =
                holders.iter().map(|id| (id.clone(), None)).collect();
            session.set_callsigns(&cleared).await?;

            keys = holders
                .iter()
                .filter_map(|id| fresh.get(id).map(|c| callsign_key(c)))
                .collect();
            for id in holders {
                let callsign = fresh.get(&id).cloned();
                tracing::debug!(player = %id, callsign = ?callsign, "refreshed colliding callsign");
                pending.insert(id, callsign);
            }
        }
        Err(TrackerError::CallsignConflictUnresolved {
            rounds: self.max_rounds,
        })
    }
}

//! Global rankings: competition ranks per field, rebuilt into the rank
//! store from the latest snapshots.

use std::sync::Arc;

use crate::domain::{PlayerId, RankedField};
use crate::error::TrackerError;
use crate::persistence::{RankStore, TrackerSession};

/// Assigns competition ranks to values fed in descending order.
///
/// Equal values share a rank and the next distinct value skips ahead by
/// the size of the tie: `[100, 100, 90, 80]` ranks as `[1, 1, 3, 4]`.
#[derive(Debug, Clone, Default)]
pub struct RankAssigner {
    position: u64,
    rank: u64,
    last: Option<f64>,
}

impl RankAssigner {
    /// Creates an assigner positioned before the first value.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rank of the next value.
    #[allow(clippy::float_cmp)]
    pub fn assign(&mut self, value: f64) -> u64 {
        self.position += 1;
        if self.last != Some(value) {
            self.rank = self.position;
            self.last = Some(value);
        }
        self.rank
    }

    /// Values assigned so far.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.position
    }
}

/// Rebuilds rankings field by field.
#[derive(Debug, Clone)]
pub struct RankingEngine {
    ranks: Arc<dyn RankStore>,
    batch_size: usize,
}

impl RankingEngine {
    /// Writes into `ranks`, streaming `batch_size` rows at a time.
    #[must_use]
    pub fn new(ranks: Arc<dyn RankStore>, batch_size: usize) -> Self {
        Self {
            ranks,
            batch_size: batch_size.max(1),
        }
    }

    /// Replaces every entry of `field` and returns the number of ranked
    /// players.
    ///
    /// The field is cleared first, so readers see a partial ranking while
    /// the rebuild runs.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::RankStore`] or [`TrackerError::Persistence`]
    /// on store failure. The session's cursor is left for the caller's
    /// rollback to discard.
    pub async fn rebuild_field<S>(
        &self,
        session: &mut S,
        field: RankedField,
    ) -> Result<u64, TrackerError>
    where
        S: TrackerSession + ?Sized,
    {
        self.ranks.clear_field(field).await?;
        session.open_rank_cursor(field).await?;

        let mut assigner = RankAssigner::new();
        loop {
            let batch = session.fetch_rank_batch(self.batch_size).await?;
            if batch.is_empty() {
                break;
            }
            let ranks: Vec<(PlayerId, u64)> = batch
                .into_iter()
                .map(|(player, value)| {
                    let rank = assigner.assign(value);
                    (player, rank)
                })
                .collect();
            self.ranks.set_ranks(field, &ranks).await?;
        }
        session.close_rank_cursor().await?;

        let total = assigner.total();
        self.ranks.set_total(field, total).await?;
        tracing::debug!(%field, total, "field ranked");
        Ok(total)
    }
}

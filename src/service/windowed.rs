//! Partitioning of an ordered column into resumable commit windows.
//!
//! Boundaries are every `N`th value of the filtered, ordered domain. The
//! resulting half-open windows are disjoint, contiguous and together cover
//! the domain, so a stage can commit after each one and resume from the
//! journal checkpoint without skipping or repeating rows.
//! [`for_each_window`] plans a stage, skips the windows a previous attempt
//! committed and checkpoints after every window it hands to a
//! [`WindowBatch`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::journal::JournalManager;
use crate::domain::{Journal, Pipeline, Stage};
use crate::error::TrackerError;
use crate::persistence::{TrackerSession, Window, WindowDomain, WindowFilter};

/// An ordered key domain that can be sampled and counted.
#[async_trait]
pub trait WindowSource<K: Send + Sync>: Send {
    /// Extra conditions narrowing the domain.
    type Filter: Sync + ?Sized;

    /// Every `size`th key of the filtered domain restricted to
    /// `[begin, end)`, starting with the first, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Persistence`] on store failure.
    async fn sample(
        &mut self,
        filter: &Self::Filter,
        size: usize,
        begin: Option<&K>,
        end: Option<&K>,
    ) -> Result<Vec<K>, TrackerError>;

    /// Number of filtered keys inside `window`.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Persistence`] on store failure.
    async fn count(&mut self, filter: &Self::Filter, window: &Window<K>)
    -> Result<u64, TrackerError>;
}

/// `last_seen` of players or matches, read through a session.
#[derive(Debug)]
pub struct LastSeenSource<'a, S: TrackerSession + ?Sized> {
    session: &'a mut S,
    domain: WindowDomain,
}

impl<'a, S: TrackerSession + ?Sized> LastSeenSource<'a, S> {
    /// Reads `domain` through `session`.
    pub fn new(session: &'a mut S, domain: WindowDomain) -> Self {
        Self { session, domain }
    }
}

#[async_trait]
impl<S: TrackerSession + ?Sized> WindowSource<DateTime<Utc>> for LastSeenSource<'_, S> {
    type Filter = WindowFilter;

    async fn sample(
        &mut self,
        filter: &WindowFilter,
        size: usize,
        begin: Option<&DateTime<Utc>>,
        end: Option<&DateTime<Utc>>,
    ) -> Result<Vec<DateTime<Utc>>, TrackerError> {
        self.session
            .window_boundaries(self.domain, filter, size, begin.copied(), end.copied())
            .await
    }

    async fn count(
        &mut self,
        filter: &WindowFilter,
        window: &Window<DateTime<Utc>>,
    ) -> Result<u64, TrackerError> {
        self.session
            .count_in_window(self.domain, filter, window)
            .await
    }
}

/// Turns sampled boundaries into contiguous windows.
///
/// `begin` is prepended when it precedes the first boundary. The last
/// window runs to `end`, or is open-ended without one. Repeated boundary
/// values are collapsed.
#[must_use]
pub fn build_windows<K: Ord + Clone>(
    mut boundaries: Vec<K>,
    begin: Option<K>,
    end: Option<K>,
) -> Vec<Window<K>> {
    boundaries.dedup();
    if let Some(begin) = begin
        && boundaries.first().is_none_or(|first| begin < *first)
    {
        boundaries.insert(0, begin);
    }

    let mut windows: Vec<Window<K>> = boundaries
        .windows(2)
        .filter_map(|pair| match pair {
            [start, stop] => Some(Window {
                start: start.clone(),
                end: Some(stop.clone()),
            }),
            _ => None,
        })
        .collect();
    if let Some(last) = boundaries.pop()
        && end.as_ref().is_none_or(|e| last < *e)
    {
        windows.push(Window { start: last, end });
    }
    windows
}

/// Plans the windows of a stage over `source`.
///
/// Empty windows at either edge are dropped when the domain is bounded
/// by `begin` or `end`.
///
/// # Errors
///
/// Returns [`TrackerError::InvalidWindowSize`] when `size` is zero, or a
/// store error from `source`.
pub async fn plan_windows<K, W>(
    source: &mut W,
    filter: &W::Filter,
    size: usize,
    begin: Option<K>,
    end: Option<K>,
) -> Result<Vec<Window<K>>, TrackerError>
where
    K: Ord + Clone + Send + Sync,
    W: WindowSource<K> + ?Sized,
{
    if size == 0 {
        return Err(TrackerError::InvalidWindowSize);
    }
    let bounded = begin.is_some() || end.is_some();
    let boundaries = source
        .sample(filter, size, begin.as_ref(), end.as_ref())
        .await?;
    let mut windows = build_windows(boundaries, begin, end);

    if bounded {
        if let Some(first) = windows.first()
            && source.count(filter, first).await? == 0
        {
            windows.remove(0);
        }
        if let Some(last) = windows.last()
            && source.count(filter, last).await? == 0
        {
            windows.pop();
        }
    }

    tracing::debug!(windows = windows.len(), size, bounded, "planned windows");
    Ok(windows)
}

/// The domain, filter and bounds one windowed stage walks.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowedStage {
    /// Ordered column.
    pub domain: WindowDomain,
    /// Extra conditions applied to sampling and to every batch.
    pub filter: WindowFilter,
    /// Rows per window.
    pub size: usize,
    /// Inclusive lower bound; the whole domain when `None`.
    pub begin: Option<DateTime<Utc>>,
    /// Exclusive upper bound; open-ended when `None`.
    pub end: Option<DateTime<Utc>>,
}

/// Work done for each window of a stage of pipeline `P`.
///
/// `process` must be idempotent: a window whose commit was lost is
/// processed again on resume.
#[async_trait]
pub trait WindowBatch<P: Pipeline, S: TrackerSession + ?Sized>: Sync {
    /// What one processed window adds to the journal counters.
    type Tally: Send;

    /// Handles the rows of `window`; the writes stay uncommitted.
    ///
    /// # Errors
    ///
    /// Returns any [`TrackerError`]; the stage stops at this window.
    async fn process(
        &self,
        session: &mut S,
        window: &Window<DateTime<Utc>>,
        filter: &WindowFilter,
    ) -> Result<Self::Tally, TrackerError>;

    /// Folds `tally` into `counters`; called inside the window's commit.
    fn record(&self, counters: &mut P::Counters, tally: Self::Tally);
}

/// Plans `stage`, then hands every window from the journal checkpoint on
/// to `batch`, checkpointing `i + 1` and committing after each.
///
/// Returns the number of windows processed by this call.
///
/// # Errors
///
/// Returns [`TrackerError::InvalidWindowSize`] for a zero window size, or
/// the first error of planning, `batch` or a checkpoint. Windows already
/// checkpointed stay committed.
pub async fn for_each_window<P, S, B>(
    journals: &JournalManager<P>,
    session: &mut S,
    journal: &mut Journal<P>,
    stage: &WindowedStage,
    batch: &B,
) -> Result<usize, TrackerError>
where
    P: Pipeline,
    S: TrackerSession + ?Sized,
    B: WindowBatch<P, S> + ?Sized,
{
    let windows = {
        let mut source = LastSeenSource::new(session, stage.domain);
        plan_windows(&mut source, &stage.filter, stage.size, stage.begin, stage.end).await?
    };
    let total = windows.len();
    let first = journal.stage_start(total);
    if first > 0 {
        tracing::info!(
            pipeline = P::NAME,
            stage = journal.stage.as_str(),
            domain = %stage.domain,
            skipped = first,
            total,
            "resuming stage from checkpoint"
        );
    }
    journals.save(session, journal).await?;
    session.commit().await?;

    let mut processed = 0;
    for (index, window) in windows.iter().enumerate().skip(first) {
        let tally = batch.process(session, window, &stage.filter).await?;
        journals
            .checkpoint_with(session, journal, index + 1, total, |counters| {
                batch.record(counters, tally);
            })
            .await?;
        processed += 1;
    }
    Ok(processed)
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use super::*;
    use crate::domain::{Player, PlayerId, UpdateJournal, UpdatePipeline, UpdateStage};
    use crate::persistence::{MemorySession, MemoryStore};

    type KeyFilter = fn(&u32) -> bool;

    fn any_key(_: &u32) -> bool {
        true
    }

    /// An in-memory sorted key list.
    struct SortedKeys {
        keys: Vec<u32>,
    }

    #[async_trait]
    impl WindowSource<u32> for SortedKeys {
        type Filter = KeyFilter;

        async fn sample(
            &mut self,
            filter: &KeyFilter,
            size: usize,
            begin: Option<&u32>,
            end: Option<&u32>,
        ) -> Result<Vec<u32>, TrackerError> {
            Ok(self
                .keys
                .iter()
                .filter(|k| filter(k))
                .filter(|k| begin.is_none_or(|b| *k >= b) && end.is_none_or(|e| *k < e))
                .step_by(size.max(1))
                .copied()
                .collect())
        }

        async fn count(
            &mut self,
            filter: &KeyFilter,
            window: &Window<u32>,
        ) -> Result<u64, TrackerError> {
            let n = self
                .keys
                .iter()
                .filter(|k| filter(k) && window.contains(k))
                .count();
            Ok(u64::try_from(n).unwrap_or(u64::MAX))
        }
    }

    async fn plan_filtered(
        mut keys: Vec<u32>,
        filter: KeyFilter,
        size: usize,
        begin: Option<u32>,
        end: Option<u32>,
    ) -> Vec<Window<u32>> {
        keys.sort_unstable();
        let mut source = SortedKeys { keys };
        let Ok(windows) = plan_windows(&mut source, &filter, size, begin, end).await else {
            panic!("planning failed");
        };
        windows
    }

    async fn plan(
        keys: Vec<u32>,
        size: usize,
        begin: Option<u32>,
        end: Option<u32>,
    ) -> Vec<Window<u32>> {
        plan_filtered(keys, any_key, size, begin, end).await
    }

    #[tokio::test]
    async fn windows_cover_domain_disjointly() {
        let keys: Vec<u32> = (0..2500).collect();
        let windows = plan(keys.clone(), 500, None, None).await;
        assert_eq!(windows.len(), 5);
        for pair in windows.windows(2) {
            let [a, b] = pair else {
                panic!("pairs of two");
            };
            assert_eq!(a.end.as_ref(), Some(&b.start));
        }
        assert_eq!(windows.last().and_then(|w| w.end), None);
        for key in &keys {
            assert_eq!(windows.iter().filter(|w| w.contains(key)).count(), 1);
        }
    }

    #[tokio::test]
    async fn filter_narrows_sampled_domain() {
        let even: KeyFilter = |k| k % 2 == 0;
        let windows = plan_filtered((0..20).collect(), even, 5, None, None).await;
        assert_eq!(
            windows,
            vec![Window { start: 0, end: Some(10) }, Window { start: 10, end: None }]
        );
    }

    #[tokio::test]
    async fn size_one_gives_one_window_per_key() {
        let windows = plan(vec![3, 1, 2], 1, None, None).await;
        assert_eq!(windows.len(), 3);
        assert_eq!(windows.first().map(|w| w.start), Some(1));
    }

    #[tokio::test]
    async fn empty_domain_has_no_windows() {
        assert!(plan(Vec::new(), 10, None, None).await.is_empty());
        assert!(plan(Vec::new(), 10, Some(5), None).await.is_empty());
        assert!(plan(vec![1, 2], 10, Some(5), Some(9)).await.is_empty());
    }

    #[tokio::test]
    async fn zero_size_is_rejected() {
        let mut source = SortedKeys { keys: vec![1] };
        let all: KeyFilter = any_key;
        assert!(matches!(
            plan_windows(&mut source, &all, 0, None, None).await,
            Err(TrackerError::InvalidWindowSize)
        ));
    }

    #[tokio::test]
    async fn bounds_trim_and_drop_empty_edges() {
        let keys: Vec<u32> = (0..100).collect();
        let windows = plan(keys, 20, Some(50), Some(90)).await;
        assert_eq!(windows.first().map(|w| w.start), Some(50));
        assert_eq!(windows.last().and_then(|w| w.end), Some(90));
        assert_eq!(windows.len(), 2);
        assert!(!windows.iter().any(|w| w.contains(&49) || w.contains(&90)));
    }

    #[tokio::test]
    async fn begin_before_first_key_drops_leading_empty_window() {
        let windows = plan(vec![10, 11, 12, 13], 2, Some(0), None).await;
        assert_eq!(
            windows,
            vec![
                Window { start: 10, end: Some(12) },
                Window { start: 12, end: None },
            ]
        );
    }

    #[test]
    fn repeated_boundaries_collapse() {
        let windows = build_windows(vec![1, 1, 1, 4], None, None);
        assert_eq!(
            windows,
            vec![Window { start: 1, end: Some(4) }, Window { start: 4, end: None }]
        );
    }

    fn seeded_store(count: i64) -> (MemoryStore, DateTime<Utc>) {
        let store = MemoryStore::new();
        let base = Utc::now();
        for i in 0..count {
            let mut player = Player::new(
                PlayerId::from(format!("p-{i}")),
                None,
                base + chrono::Duration::seconds(i),
            );
            player.blacklisted = i == 1;
            store.seed_player(player);
        }
        (store, base)
    }

    #[tokio::test]
    async fn last_seen_source_reads_through_session() {
        let (store, base) = seeded_store(7);
        let mut session = store.session();
        let mut source = LastSeenSource::new(&mut session, WindowDomain::PlayersLastSeen);
        let Ok(windows) = plan_windows(&mut source, &WindowFilter::default(), 3, None, None).await
        else {
            panic!("planning failed");
        };
        assert_eq!(windows.len(), 3);
        assert_eq!(windows.first().map(|w| w.start), Some(base));
    }

    /// Counts players per window, failing on the window at `fail_at`.
    #[derive(Default)]
    struct CountingBatch {
        batches: Mutex<Vec<usize>>,
        fail_at: Option<usize>,
    }

    #[async_trait]
    impl WindowBatch<UpdatePipeline, MemorySession> for CountingBatch {
        type Tally = u64;

        async fn process(
            &self,
            session: &mut MemorySession,
            window: &Window<DateTime<Utc>>,
            filter: &WindowFilter,
        ) -> Result<u64, TrackerError> {
            let players = session.players_in_window(filter, window).await?;
            let mut batches = self.batches.lock().unwrap_or_else(|e| e.into_inner());
            if self.fail_at == Some(batches.len()) {
                return Err(TrackerError::Internal("window failed".to_string()));
            }
            batches.push(players.len());
            Ok(u64::try_from(players.len()).unwrap_or(u64::MAX))
        }

        fn record(&self, counters: &mut <UpdatePipeline as Pipeline>::Counters, tally: u64) {
            counters.players_updated += tally;
        }
    }

    fn players_stage(filter: WindowFilter) -> WindowedStage {
        WindowedStage {
            domain: WindowDomain::PlayersLastSeen,
            filter,
            size: 3,
            begin: None,
            end: None,
        }
    }

    fn players_journal() -> UpdateJournal {
        let mut journal: UpdateJournal = Journal::new(Utc::now(), BTreeSet::new());
        journal.stage_next(UpdateStage::Players);
        journal
    }

    #[tokio::test]
    async fn driver_checkpoints_every_window() {
        let (store, _) = seeded_store(7);
        let mut session = store.session();
        let mut journal = players_journal();
        let batch = CountingBatch::default();
        let Ok(processed) = for_each_window(
            &JournalManager::new(),
            &mut session,
            &mut journal,
            &players_stage(WindowFilter::default()),
            &batch,
        )
        .await
        else {
            panic!("stage failed");
        };
        assert_eq!(processed, 3);
        assert_eq!(*batch.batches.lock().unwrap_or_else(|e| e.into_inner()), vec![3, 3, 1]);
        assert_eq!(journal.current_step, Some(3));
        assert_eq!(journal.total_steps, Some(3));
        assert_eq!(journal.counters.players_updated, 7);
        assert_eq!(store.commits(), 4);
    }

    #[tokio::test]
    async fn driver_resumes_from_stored_window_index() {
        let (store, _) = seeded_store(7);
        let mut session = store.session();
        let mut journal = players_journal();
        journal.stage_checkpoint(2);
        let batch = CountingBatch::default();
        let Ok(processed) = for_each_window(
            &JournalManager::new(),
            &mut session,
            &mut journal,
            &players_stage(WindowFilter::default()),
            &batch,
        )
        .await
        else {
            panic!("stage failed");
        };
        assert_eq!(processed, 1);
        assert_eq!(*batch.batches.lock().unwrap_or_else(|e| e.into_inner()), vec![1]);
        assert_eq!(journal.current_step, Some(3));
    }

    #[tokio::test]
    async fn driver_applies_filter_to_every_batch() {
        let (store, _) = seeded_store(7);
        let mut session = store.session();
        let mut journal = players_journal();
        let batch = CountingBatch::default();
        let filter = WindowFilter {
            skip_blacklisted: true,
            ..WindowFilter::default()
        };
        let Ok(processed) = for_each_window(
            &JournalManager::new(),
            &mut session,
            &mut journal,
            &players_stage(filter),
            &batch,
        )
        .await
        else {
            panic!("stage failed");
        };
        assert_eq!(processed, 2);
        assert_eq!(journal.counters.players_updated, 6);
    }

    #[tokio::test]
    async fn driver_stops_at_failing_window_with_prior_checkpoint() {
        let (store, _) = seeded_store(7);
        let mut session = store.session();
        let mut journal = players_journal();
        let batch = CountingBatch {
            fail_at: Some(1),
            ..CountingBatch::default()
        };
        let outcome = for_each_window(
            &JournalManager::new(),
            &mut session,
            &mut journal,
            &players_stage(WindowFilter::default()),
            &batch,
        )
        .await;
        assert!(matches!(outcome, Err(TrackerError::Internal(_))));
        assert_eq!(journal.current_step, Some(1));
        assert_eq!(journal.counters.players_updated, 3);
    }
}

//! Journal lifecycle shared by the poll and update pipelines.
//!
//! The manager decides whether a run starts fresh, resumes a failed
//! journal, or is refused because another run looks active. It persists
//! every transition immediately so a crash leaves an accurate record.

use std::collections::BTreeSet;
use std::marker::PhantomData;

use chrono::{DateTime, Utc};

use crate::domain::{Journal, Pipeline, RunStatus, Stage};
use crate::error::TrackerError;
use crate::persistence::TrackerSession;

/// Outcome of [`JournalManager::start_or_resume`].
#[derive(Debug, Clone, PartialEq)]
pub enum RunStart<P: Pipeline> {
    /// A new journal was created and marked in progress.
    Fresh(Journal<P>),
    /// A failed journal was picked up again at its checkpoint.
    Resumed(Journal<P>),
    /// The last journal is still active; it is returned untouched.
    AlreadyRunning(Journal<P>),
}

impl<P: Pipeline> RunStart<P> {
    /// The journal, whichever way it was obtained.
    #[must_use]
    pub fn journal(&self) -> &Journal<P> {
        match self {
            Self::Fresh(j) | Self::Resumed(j) | Self::AlreadyRunning(j) => j,
        }
    }
}

/// Loads, creates and persists journals of pipeline `P`.
#[derive(Debug, Clone, Copy)]
pub struct JournalManager<P: Pipeline> {
    _pipeline: PhantomData<P>,
}

impl<P: Pipeline> JournalManager<P> {
    /// Creates a manager.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _pipeline: PhantomData,
        }
    }

    /// Latest journal of the pipeline, if any.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Persistence`] on store failure or an
    /// unreadable row.
    pub async fn last<S>(&self, session: &mut S) -> Result<Option<Journal<P>>, TrackerError>
    where
        S: TrackerSession + ?Sized,
    {
        session
            .last_journal(P::TABLE)
            .await?
            .map(Journal::from_row)
            .transpose()
    }

    /// Start time of the latest complete run, if any.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Persistence`] on store failure.
    pub async fn last_completed_start<S>(
        &self,
        session: &mut S,
    ) -> Result<Option<DateTime<Utc>>, TrackerError>
    where
        S: TrackerSession + ?Sized,
    {
        session.last_completed_start(P::TABLE).await
    }

    /// Picks the journal for a new run and commits it as in progress.
    ///
    /// A running last journal is never touched. A failed one is reused
    /// only when `resume` is set; the stored flags win over `flags`.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Persistence`] on store failure.
    pub async fn start_or_resume<S>(
        &self,
        session: &mut S,
        flags: BTreeSet<P::Flag>,
        resume: bool,
    ) -> Result<RunStart<P>, TrackerError>
    where
        S: TrackerSession + ?Sized,
    {
        let last = self.last(session).await?;

        let start = match last {
            Some(journal) if journal.is_running() => {
                tracing::warn!(
                    pipeline = P::NAME,
                    start = %journal.start,
                    status = %journal.status,
                    "previous run is still active, refusing to start"
                );
                session.rollback().await?;
                return Ok(RunStart::AlreadyRunning(journal));
            }
            Some(mut journal) if resume && journal.status == RunStatus::Failed => {
                if journal.flags != flags {
                    tracing::warn!(
                        pipeline = P::NAME,
                        requested = ?flags,
                        stored = ?journal.flags,
                        "resume flags differ from the stored run, keeping stored flags"
                    );
                }
                tracing::info!(
                    pipeline = P::NAME,
                    start = %journal.start,
                    stage = journal.stage.as_str(),
                    step = ?journal.current_step,
                    "resuming failed run"
                );
                journal.begin();
                RunStart::Resumed(journal)
            }
            _ => {
                let mut journal = Journal::new(Utc::now(), flags);
                tracing::info!(pipeline = P::NAME, start = %journal.start, "starting new run");
                journal.begin();
                RunStart::Fresh(journal)
            }
        };

        self.save(session, start.journal()).await?;
        session.commit().await?;
        Ok(start)
    }

    /// Writes the journal row; the caller commits.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Persistence`] on store failure.
    pub async fn save<S>(&self, session: &mut S, journal: &Journal<P>) -> Result<(), TrackerError>
    where
        S: TrackerSession + ?Sized,
    {
        session.save_journal(P::TABLE, &journal.to_row()?).await
    }

    /// Records `done` of `total` windows as committed and commits the
    /// window's writes together with the checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Persistence`] on store failure.
    pub async fn checkpoint<S>(
        &self,
        session: &mut S,
        journal: &mut Journal<P>,
        done: usize,
        total: usize,
    ) -> Result<(), TrackerError>
    where
        S: TrackerSession + ?Sized,
    {
        self.checkpoint_with(session, journal, done, total, |_| {})
            .await
    }

    /// Like [`checkpoint`](Self::checkpoint), folding `record` into the
    /// counters in the same commit. When the commit fails the journal keeps
    /// its previous step and counters, so a later `fail` records only
    /// committed work.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Persistence`] on store failure.
    pub async fn checkpoint_with<S, F>(
        &self,
        session: &mut S,
        journal: &mut Journal<P>,
        done: usize,
        total: usize,
        record: F,
    ) -> Result<(), TrackerError>
    where
        S: TrackerSession + ?Sized,
        F: FnOnce(&mut P::Counters) + Send,
    {
        let step = journal.current_step;
        let counters = journal.counters.clone();
        journal.stage_checkpoint(done);
        record(&mut journal.counters);

        let saved = match self.save(session, journal).await {
            Ok(()) => session.commit().await,
            Err(err) => Err(err),
        };
        if let Err(err) = saved {
            journal.current_step = step;
            journal.counters = counters;
            return Err(err);
        }
        tracing::info!(
            pipeline = P::NAME,
            stage = journal.stage.as_str(),
            "chunk {done}/{total} complete"
        );
        Ok(())
    }

    /// Moves to `next` in memory only; the transition is persisted with
    /// the next save.
    pub fn transition(&self, journal: &mut Journal<P>, next: P::Stage) {
        tracing::info!(
            pipeline = P::NAME,
            from = journal.stage.as_str(),
            to = next.as_str(),
            "stage transition"
        );
        journal.stage_next(next);
    }

    /// Moves to `next` and commits, so a resume never re-enters the stage
    /// just left.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Persistence`] on store failure.
    pub async fn advance<S>(
        &self,
        session: &mut S,
        journal: &mut Journal<P>,
        next: P::Stage,
    ) -> Result<(), TrackerError>
    where
        S: TrackerSession + ?Sized,
    {
        self.transition(journal, next);
        self.save(session, journal).await?;
        session.commit().await
    }

    /// Discards uncommitted work, marks the run failed at its checkpoint
    /// and persists that.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Persistence`] if the failed journal itself
    /// cannot be written.
    pub async fn fail<S>(
        &self,
        session: &mut S,
        journal: &mut Journal<P>,
        run_start: DateTime<Utc>,
        cause: &TrackerError,
    ) -> Result<(), TrackerError>
    where
        S: TrackerSession + ?Sized,
    {
        tracing::error!(
            pipeline = P::NAME,
            stage = journal.stage.as_str(),
            step = ?journal.current_step,
            code = cause.error_code(),
            error = %error_chain(cause),
            "run failed"
        );
        session.rollback().await?;
        journal.fail(run_start);
        self.save(session, journal).await?;
        session.commit().await
    }

    /// Marks the run complete and persists that.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Persistence`] on store failure.
    pub async fn complete<S>(
        &self,
        session: &mut S,
        journal: &mut Journal<P>,
        run_start: DateTime<Utc>,
    ) -> Result<(), TrackerError>
    where
        S: TrackerSession + ?Sized,
    {
        journal.complete(run_start);
        self.save(session, journal).await?;
        session.commit().await?;
        tracing::info!(
            pipeline = P::NAME,
            elapsed_secs = journal.time_elapsed,
            counters = ?journal.counters,
            "run complete"
        );
        Ok(())
    }

    /// Settles a run from the outcome of its stages: completes the
    /// journal on success, or fails it and hands back the stage error.
    ///
    /// A journal that cannot be marked failed is logged; the stage error
    /// still wins.
    ///
    /// # Errors
    ///
    /// Returns the stage error, or [`TrackerError::Persistence`] if the
    /// complete journal cannot be written.
    pub async fn conclude<S>(
        &self,
        session: &mut S,
        mut journal: Journal<P>,
        run_start: DateTime<Utc>,
        outcome: Result<(), TrackerError>,
    ) -> Result<Journal<P>, TrackerError>
    where
        S: TrackerSession + ?Sized,
    {
        match outcome {
            Ok(()) => {
                self.complete(session, &mut journal, run_start).await?;
                Ok(journal)
            }
            Err(err) => {
                if let Err(save_err) = self.fail(session, &mut journal, run_start, &err).await {
                    tracing::error!(
                        pipeline = P::NAME,
                        error = %error_chain(&save_err),
                        "could not record failed run"
                    );
                }
                Err(err)
            }
        }
    }
}

/// Renders `err` followed by every source, separated by `: `.
#[must_use]
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::{JournalTable, UpdateFlag, UpdatePipeline, UpdateStage};
    use crate::error::ApiError;
    use crate::persistence::MemoryStore;

    type Manager = JournalManager<UpdatePipeline>;

    fn flags(list: &[UpdateFlag]) -> BTreeSet<UpdateFlag> {
        list.iter().copied().collect()
    }

    #[tokio::test]
    async fn first_run_starts_fresh_and_is_committed() {
        let store = MemoryStore::new();
        let mut session = store.session();
        let Ok(RunStart::Fresh(journal)) = Manager::new()
            .start_or_resume(&mut session, flags(&[UpdateFlag::AllPlayers]), false)
            .await
        else {
            panic!("expected a fresh run");
        };
        assert_eq!(journal.status, RunStatus::InProgress);
        let rows = store.journal_rows(JournalTable::Update);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.first().map(|r| r.status), Some(RunStatus::InProgress.code()));
    }

    #[tokio::test]
    async fn active_run_is_refused_unchanged() {
        let store = MemoryStore::new();
        let mut session = store.session();
        let manager = Manager::new();
        let _ = manager.start_or_resume(&mut session, BTreeSet::new(), false).await;

        let Ok(RunStart::AlreadyRunning(journal)) =
            manager.start_or_resume(&mut session, BTreeSet::new(), false).await
        else {
            panic!("expected refusal");
        };
        assert_eq!(journal.status, RunStatus::InProgress);
        assert_eq!(store.journal_rows(JournalTable::Update).len(), 1);
    }

    #[tokio::test]
    async fn resume_keeps_checkpoint_and_stored_flags() {
        let store = MemoryStore::new();
        let mut session = store.session();
        let manager = Manager::new();
        let Ok(RunStart::Fresh(mut journal)) = manager
            .start_or_resume(&mut session, flags(&[UpdateFlag::AllMatches]), false)
            .await
        else {
            panic!("expected a fresh run");
        };
        let run_start = Utc::now();
        let _ = manager
            .advance(&mut session, &mut journal, UpdateStage::Matches)
            .await;
        journal.stage_start(4);
        let _ = manager.checkpoint(&mut session, &mut journal, 2, 4).await;
        let cause = TrackerError::Interface {
            attempts: 1,
            source: ApiError::Timeout,
        };
        let Ok(()) = manager.fail(&mut session, &mut journal, run_start, &cause).await else {
            panic!("fail should persist");
        };

        let Ok(RunStart::Resumed(mut resumed)) = manager
            .start_or_resume(&mut session, flags(&[UpdateFlag::AllPlayers]), true)
            .await
        else {
            panic!("expected resume");
        };
        assert_eq!(resumed.start, journal.start);
        assert_eq!(resumed.stage, UpdateStage::Matches);
        assert_eq!(resumed.flags, flags(&[UpdateFlag::AllMatches]));
        assert_eq!(resumed.stage_start(4), 2);
    }

    #[tokio::test]
    async fn failed_checkpoint_commit_keeps_previous_progress() {
        let store = MemoryStore::new();
        let mut session = store.session();
        let manager = Manager::new();
        let Ok(RunStart::Fresh(mut journal)) =
            manager.start_or_resume(&mut session, BTreeSet::new(), false).await
        else {
            panic!("expected a fresh run");
        };
        let _ = manager
            .advance(&mut session, &mut journal, UpdateStage::Players)
            .await;
        journal.stage_start(3);
        let Ok(()) = manager
            .checkpoint_with(&mut session, &mut journal, 1, 3, |c| c.players_updated += 10)
            .await
        else {
            panic!("first checkpoint should commit");
        };

        store.fail_once("commit");
        let outcome = manager
            .checkpoint_with(&mut session, &mut journal, 2, 3, |c| c.players_updated += 10)
            .await;
        assert!(outcome.is_err());
        assert_eq!(journal.current_step, Some(1));
        assert_eq!(journal.counters.players_updated, 10);

        let cause = TrackerError::Internal("commit lost".to_string());
        let _ = manager
            .fail(&mut session, &mut journal, Utc::now(), &cause)
            .await;
        let Ok(Some(stored)) = manager.last(&mut session).await else {
            panic!("journal missing");
        };
        assert_eq!(stored.current_step, Some(1));
        assert_eq!(stored.counters.players_updated, 10);
    }

    #[tokio::test]
    async fn failed_run_without_resume_starts_fresh() {
        let store = MemoryStore::new();
        let mut session = store.session();
        let manager = Manager::new();
        let Ok(RunStart::Fresh(mut journal)) =
            manager.start_or_resume(&mut session, BTreeSet::new(), false).await
        else {
            panic!("expected a fresh run");
        };
        let cause = TrackerError::Internal("boom".to_string());
        let _ = manager
            .fail(&mut session, &mut journal, Utc::now(), &cause)
            .await;

        let Ok(RunStart::Fresh(next)) =
            manager.start_or_resume(&mut session, BTreeSet::new(), false).await
        else {
            panic!("expected a fresh run");
        };
        assert!(next.start >= journal.start);
        assert_eq!(next.stage, UpdateStage::NotStarted);
    }

    #[test]
    fn error_chain_includes_sources() {
        let err = TrackerError::Interface {
            attempts: 3,
            source: ApiError::ServiceUnavailable,
        };
        assert_eq!(
            error_chain(&err),
            "interface error after 3 attempt(s): service unavailable"
        );
    }
}

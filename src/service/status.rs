//! Journal status for operators and schedulers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::journal::JournalManager;
use crate::domain::{Journal, Pipeline, RunStatus, Stage};
use crate::error::TrackerError;
use crate::persistence::TrackerSession;

/// The latest journal of a pipeline, flattened for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JournalSummary {
    /// Run start.
    pub start: DateTime<Utc>,
    /// Run end, if it ended.
    pub end: Option<DateTime<Utc>>,
    /// Run status.
    pub status: RunStatus,
    /// Stage name.
    pub stage: &'static str,
    /// Percentage of the stage done.
    pub progress: Option<f64>,
    /// Seconds spent over every attempt.
    pub time_elapsed: f64,
    /// Run modifiers.
    pub flags: Vec<String>,
}

impl<P: Pipeline> From<&Journal<P>> for JournalSummary {
    fn from(journal: &Journal<P>) -> Self {
        Self {
            start: journal.start,
            end: journal.end,
            status: journal.status,
            stage: journal.stage.as_str(),
            progress: journal.stage_progress(),
            time_elapsed: journal.time_elapsed,
            flags: journal.flag_names(),
        }
    }
}

/// Last and last complete run of one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JournalStatusReport {
    /// Pipeline name.
    pub pipeline: &'static str,
    /// Latest journal.
    pub last: Option<JournalSummary>,
    /// Start of the latest complete run.
    pub last_completed: Option<DateTime<Utc>>,
}

impl JournalStatusReport {
    /// Reads the report of pipeline `P`; read-only.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Persistence`] on store failure.
    pub async fn load<P, S>(session: &mut S) -> Result<Self, TrackerError>
    where
        P: Pipeline,
        S: TrackerSession + ?Sized,
    {
        let journals = JournalManager::<P>::new();
        let last = journals.last(session).await?;
        let last_completed = journals.last_completed_start(session).await?;
        session.rollback().await?;
        Ok(Self {
            pipeline: P::NAME,
            last: last.as_ref().map(JournalSummary::from),
            last_completed,
        })
    }

    /// Returns `true` only when the latest run completed.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.last
            .as_ref()
            .is_some_and(|last| last.status == RunStatus::Complete)
    }
}

impl fmt::Display for JournalStatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(last) = &self.last else {
            return write!(f, "{}: never run", self.pipeline);
        };
        write!(f, "{}: {} at {} (stage {}", self.pipeline, last.status, last.start, last.stage)?;
        if let Some(progress) = last.progress {
            write!(f, ", {progress:.1}%")?;
        }
        write!(f, ", {:.1}s)", last.time_elapsed)?;
        match self.last_completed {
            Some(completed) => write!(f, ", last complete {completed}"),
            None => write!(f, ", never completed"),
        }
    }
}

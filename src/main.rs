//! hawken-tracker entry point.
//!
//! Runs one task per invocation, meant to be driven by a scheduler:
//!
//! ```text
//! hawken-tracker setup
//! hawken-tracker poll [keep_empty_matches]
//! hawken-tracker update [players] [matches] [callsigns] [resume]
//! hawken-tracker ingest < events.jsonl
//! hawken-tracker status
//! ```
//!
//! The exit code is non-zero whenever the run did not complete.

use std::collections::BTreeSet;
use std::process::ExitCode;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use hawken_tracker::config::TrackerConfig;
use hawken_tracker::context::TrackerContext;
use hawken_tracker::domain::{Flag, Journal, Pipeline, PollPipeline, RunStatus, UpdatePipeline};
use hawken_tracker::error::TrackerError;
use hawken_tracker::persistence::PgSession;
use hawken_tracker::persistence::postgres::{connect_pool, run_migrations};
use hawken_tracker::service::{IngestOutcome, JournalStatusReport, error_chain};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((task, options)) = args.split_first() else {
        eprintln!("usage: hawken-tracker <setup|poll|update|ingest|status> [options]");
        return ExitCode::from(2);
    };

    match run(task, options).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            tracing::error!(
                task = %task,
                code = err.error_code(),
                error = %error_chain(&err),
                "task failed"
            );
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Runs `task`; `Ok(false)` means it finished without completing.
async fn run(task: &str, options: &[String]) -> Result<bool, TrackerError> {
    let config = TrackerConfig::from_env()?;
    match task {
        "setup" => {
            let pool = connect_pool(&config).await?;
            run_migrations(&pool).await?;
            tracing::info!("database schema is up to date");
            Ok(true)
        }
        "status" => {
            let pool = connect_pool(&config).await?;
            let mut session = PgSession::new(pool);
            let poll = JournalStatusReport::load::<PollPipeline, _>(&mut session).await?;
            let update = JournalStatusReport::load::<UpdatePipeline, _>(&mut session).await?;
            println!("{poll}");
            println!("{update}");
            Ok(poll.is_healthy() && update.is_healthy())
        }
        "poll" => {
            let (flags, _) = parse_options::<PollPipeline>(options)?;
            let ctx = TrackerContext::connect(config).await?;
            let mut session = ctx.session();
            let journal = ctx.poll_service().run(&mut session, flags).await?;
            Ok(report(&journal))
        }
        "update" => {
            let (flags, resume) = parse_options::<UpdatePipeline>(options)?;
            let ctx = TrackerContext::connect(config).await?;
            let mut session = ctx.session();
            let journal = ctx.update_service().run(&mut session, flags, resume).await?;
            Ok(report(&journal))
        }
        "ingest" => {
            let ctx = TrackerContext::connect(config).await?;
            ingest_stdin(&ctx).await
        }
        other => Err(TrackerError::InvalidConfig(format!("unknown task '{other}'"))),
    }
}

/// Splits positional options into pipeline flags and the `resume` switch.
fn parse_options<P: Pipeline>(
    options: &[String],
) -> Result<(BTreeSet<P::Flag>, bool), TrackerError> {
    let mut flags = BTreeSet::new();
    let mut resume = false;
    for option in options {
        if option == "resume" {
            resume = true;
            continue;
        }
        let flag = P::Flag::parse(option).ok_or_else(|| {
            TrackerError::InvalidConfig(format!("unknown {} option '{option}'", P::NAME))
        })?;
        flags.insert(flag);
    }
    Ok((flags, resume))
}

fn report<P: Pipeline>(journal: &Journal<P>) -> bool {
    let complete = journal.status == RunStatus::Complete;
    if complete {
        println!("{} complete in {:.1}s: {:?}", P::NAME, journal.time_elapsed, journal.counters);
    } else {
        println!(
            "{} not run: previous run started {} is {}",
            P::NAME,
            journal.start,
            journal.status
        );
    }
    complete
}

/// Ingests one JSON event per stdin line; every event is attempted.
async fn ingest_stdin(ctx: &TrackerContext) -> Result<bool, TrackerError> {
    let ingester = ctx.event_ingester();
    let mut session = ctx.session();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let (mut ingested, mut ignored, mut failed) = (0_u64, 0_u64, 0_u64);
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| TrackerError::Internal(format!("reading events: {e}")))?
    {
        if line.trim().is_empty() {
            continue;
        }
        let outcome = match serde_json::from_str(&line) {
            Ok(event) => ingester.ingest(&mut session, &event).await,
            Err(err) => Err(TrackerError::from(err)),
        };
        match outcome {
            Ok(IngestOutcome::Ingested { .. }) => ingested += 1,
            Ok(IngestOutcome::Ignored) => ignored += 1,
            Err(err) => {
                tracing::warn!(
                    code = err.error_code(),
                    error = %error_chain(&err),
                    "event skipped"
                );
                failed += 1;
            }
        }
    }
    tracing::info!(ingested, ignored, failed, "event stream drained");
    Ok(failed == 0)
}

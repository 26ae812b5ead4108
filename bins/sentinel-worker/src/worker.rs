// Queue consumer: pops submissions once a slot is free, runs each on its own
// task and persists the outcome.

use crate::health::Health;
use chrono::Utc;
use ::redis::aio::ConnectionManager;
use sentinel_common::redis;
use sentinel_common::types::{Language, Submission, SubmissionOutcome, SubmissionRecord, SubmissionStatus};
use sentinel_engine::admission::AdmissionPermit;
use sentinel_engine::toolchain::{ToolchainConfigManager, ToolchainRegistry};
use sentinel_engine::{outcome_of, Executor};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const POP_TIMEOUT_SECS: f64 = 2.0;
const CANCEL_POLL: Duration = Duration::from_millis(250);
const REPROBE_INTERVAL: Duration = Duration::from_secs(10);

pub struct WorkerContext {
    pub executor: Arc<Executor>,
    pub manager: ToolchainConfigManager,
    pub languages: Vec<Language>,
    pub health: Arc<Health>,
    pub result_ttl_secs: u64,
}

/// Pop and execute until `shutdown` fires, then drain in-flight work
#[instrument(skip_all, fields(languages = ?ctx.languages))]
pub async fn run(ctx: Arc<WorkerContext>, mut conn: ConnectionManager, shutdown: CancellationToken) -> anyhow::Result<()> {
    let mut tasks = JoinSet::new();

    while !shutdown.is_cancelled() {
        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "Submission task panicked");
            }
        }

        if ctx.health.is_halted() {
            recover(&ctx, &shutdown).await;
            continue;
        }

        // Only pop once a slot is free so the backlog stays in Redis
        let permit = tokio::select! {
            permit = ctx.executor.admission().acquire() => permit?,
            _ = shutdown.cancelled() => break,
        };

        match redis::pop_submission(&mut conn, &ctx.languages, POP_TIMEOUT_SECS).await {
            Ok(Some(submission)) => {
                info!(
                    submission_id = %submission.id,
                    language = %submission.language,
                    tenant = %submission.tenant,
                    source_size = submission.source.len(),
                    "Received submission"
                );
                tasks.spawn(process(ctx.clone(), conn.clone(), submission, permit));
            }
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    ctx.health.start_draining();
    info!(in_flight = tasks.len(), "Draining in-flight submissions");
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Submission task panicked");
        }
    }
    Ok(())
}

/// Re-probe toolchains and scratch until intake may resume
async fn recover(ctx: &WorkerContext, shutdown: &CancellationToken) {
    warn!(reason = ?ctx.health.reason(), "Intake halted");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(REPROBE_INTERVAL) => {}
            _ = shutdown.cancelled() => return,
        }

        let registry = ToolchainRegistry::probe(&ctx.manager, &ctx.languages).await;
        ctx.executor.replace_toolchains(registry);
        match ctx.executor.check_preconditions() {
            Ok(()) => {
                info!("Preconditions hold again, resuming intake");
                ctx.health.resume();
                return;
            }
            Err(e) => {
                debug!(error = %e, "Still unhealthy");
                ctx.health.halt(e.to_string());
            }
        }
    }
}

/// Flip `cancel` once the API records a cancellation for `id`
async fn watch_cancellation(mut conn: ConnectionManager, id: uuid::Uuid, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(CANCEL_POLL);
    loop {
        ticker.tick().await;
        match redis::is_cancelled(&mut conn, &id).await {
            Ok(true) => {
                info!(submission_id = %id, "Cancellation requested");
                cancel.cancel();
                return;
            }
            Ok(false) => {}
            Err(e) => warn!(submission_id = %id, error = %e, "Failed to poll cancellation flag"),
        }
    }
}

#[instrument(skip_all, fields(submission_id = %submission.id, language = %submission.language))]
async fn process(ctx: Arc<WorkerContext>, mut conn: ConnectionManager, submission: Submission, permit: AdmissionPermit) {
    let id = submission.id;
    let language = submission.language;
    let tenant = submission.tenant.clone();

    if let Err(e) = redis::set_status(&mut conn, &id, SubmissionStatus::Running, ctx.result_ttl_secs).await {
        warn!(error = %e, "Failed to mark submission running");
    }

    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(watch_cancellation(conn.clone(), id, cancel.clone()));
    let started = Instant::now();
    let result = ctx
        .executor
        .execute_admitted(submission.clone(), &cancel, &permit)
        .await;
    watcher.abort();
    drop(permit);

    if let Err(e) = &result {
        if e.is_fatal() {
            // Not the submission's fault: put it back for after recovery
            error!(error = %e, "Fatal precondition failure, halting intake");
            ctx.health.halt(e.to_string());
            match redis::requeue_submission(&mut conn, &submission).await {
                Ok(()) => {
                    let _ = redis::set_status(&mut conn, &id, SubmissionStatus::Queued, ctx.result_ttl_secs).await;
                }
                Err(requeue_err) => {
                    error!(error = %requeue_err, "Failed to requeue submission");
                    persist(&ctx, &mut conn, id, language, tenant, outcome_of(result)).await;
                }
            }
            return;
        }
    }

    let outcome = outcome_of(result);
    log_outcome(&outcome, started.elapsed());
    persist(&ctx, &mut conn, id, language, tenant, outcome).await;
}

fn log_outcome(outcome: &SubmissionOutcome, elapsed: Duration) {
    let total_ms = elapsed.as_millis() as u64;
    match outcome {
        SubmissionOutcome::Executed { result } => info!(
            status = ?result.status,
            exit_code = ?result.exit_code,
            violation = ?result.violation,
            cache_hit = result.cache_hit,
            duration_ms = result.duration_ms,
            total_ms,
            "Execution completed"
        ),
        SubmissionOutcome::CompileError { truncated, .. } => {
            info!(truncated, total_ms, "Compilation failed")
        }
        SubmissionOutcome::Failed { kind, message } => {
            warn!(?kind, %message, total_ms, "Submission failed")
        }
    }
}

async fn persist(
    ctx: &WorkerContext,
    conn: &mut ConnectionManager,
    id: uuid::Uuid,
    language: Language,
    tenant: String,
    outcome: SubmissionOutcome,
) {
    let record = SubmissionRecord {
        submission_id: id,
        language,
        tenant,
        outcome,
        finished_at: Utc::now(),
    };
    match redis::store_record(conn, &record, ctx.result_ttl_secs).await {
        Ok(()) => debug!(submission_id = %id, "Result persisted to Redis"),
        // Non-fatal - worker continues
        Err(e) => error!(submission_id = %id, error = %e, "Failed to persist result"),
    }
}


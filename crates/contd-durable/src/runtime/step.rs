//! Step runtime
//!
//! The exactly-once-commit protocol. Every step invocation goes:
//! cache lookup -> attempt allocation -> intention event -> guarded
//! execution -> completion commit (journal append + completion row in one
//! atomic commit). A crash between intention and completion leaves no
//! completion row, so resume re-executes the step; a crash cannot split
//! the completion commit because both writes share one transaction.

use std::future::Future;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use contd_core::{step, CompletedStep, Event, EventPayload, IntegrityError, StateDelta};

use crate::idempotency::IdempotencyError;
use crate::journal::JournalError;
use crate::lease::StopReason;
use crate::persistence::{AttemptOutcome, DurableStore, StoreError};
use crate::reliability::RetryPolicy;
use crate::snapshots::SnapshotError;

use super::context::{StepFailure, StepOptions, WorkflowContext};

/// Error kind recorded for attempts that hit their timeout
pub const TIMEOUT_ERROR_KIND: &str = "step_timeout";

/// Errors surfaced by step execution
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The attempt hit its wall-clock bound and the budget ran out
    #[error("step {step_id} timed out after {timeout:?}")]
    Timeout { step_id: String, timeout: Duration },

    /// Retryable failures exhausted the attempt budget
    #[error("step {step_id} exhausted its {max_attempts} attempts: {last}")]
    TooManyAttempts {
        step_id: String,
        max_attempts: u32,
        last: StepFailure,
    },

    /// The step failed with a non-retryable error
    #[error("step {step_id} failed: {failure}")]
    ExecutionFailed {
        step_id: String,
        failure: StepFailure,
    },

    /// Cancellation was observed while the step ran
    #[error("step {step_id} was cancelled")]
    Cancelled { step_id: String },

    /// The executor was fenced out; all work must stop
    #[error("lease lost for workflow {0}")]
    LeaseLost(String),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<JournalError> for StepError {
    fn from(err: JournalError) -> Self {
        match err {
            JournalError::Store(e) => Self::Store(e),
            JournalError::Integrity(e) => Self::Integrity(e),
        }
    }
}

impl From<SnapshotError> for StepError {
    fn from(err: SnapshotError) -> Self {
        match err {
            SnapshotError::Store(e) => Self::Store(e),
            SnapshotError::Integrity(e) => Self::Integrity(e),
        }
    }
}

impl From<IdempotencyError> for StepError {
    fn from(err: IdempotencyError) -> Self {
        match err {
            IdempotencyError::Store(e) => Self::Store(e),
            IdempotencyError::Journal(e) => e.into(),
        }
    }
}

/// How a guarded execution ended
enum Guarded {
    Succeeded(Value),
    Failed(StepFailure),
    TimedOut,
    Stopped(StopReason),
}

pub(crate) async fn run_step<F, Fut>(
    ctx: &mut WorkflowContext,
    name: &str,
    options: StepOptions,
    f: F,
) -> Result<Value, StepError>
where
    F: Fn(Value) -> Fut + Send,
    Fut: Future<Output = Result<Value, StepFailure>> + Send,
{
    ctx.invocations += 1;
    let step_id = step::step_id(name, ctx.invocations);
    let workflow_id = ctx.workflow_id.clone();
    let org_id = ctx.org_id.clone();

    // Cache lookup: a recorded completion is the authoritative result of
    // this logical step; the user function is not called again.
    if let Some(done) = ctx.idempotency.check_completed(&workflow_id, &step_id).await? {
        done.verify_result()?;
        debug!(%workflow_id, %step_id, "completion cache hit; skipping execution");
        return Ok(done.result);
    }

    let policy = options
        .retry
        .clone()
        .unwrap_or_else(|| ctx.default_retry.clone());

    loop {
        if let Some(reason) = ctx.stop_requested() {
            return Err(stop_error(reason, &workflow_id, &step_id));
        }

        // Attempt allocation doubles as the fencing check: the store
        // refuses tokens that no longer match the live lease.
        let attempt = match ctx
            .idempotency
            .allocate_attempt(&workflow_id, &step_id, ctx.lease.fencing_token)
            .await
        {
            Ok(AttemptOutcome::Allocated(attempt)) => attempt,
            Ok(AttemptOutcome::AlreadyCompleted(done)) => {
                done.verify_result()?;
                return Ok(done.result);
            }
            Err(IdempotencyError::Store(StoreError::LeaseMismatch(_))) => {
                return Err(StepError::LeaseLost(workflow_id));
            }
            Err(err) => return Err(err.into()),
        };
        let attempt_id = attempt.attempt_id;

        // Write-ahead intention, before any side effect can happen.
        let sealed = ctx
            .journal
            .append(
                &workflow_id,
                &org_id,
                EventPayload::StepIntention {
                    step_id: step_id.clone(),
                    step_name: name.to_string(),
                    attempt_id,
                    fencing_token: ctx.lease.fencing_token,
                },
            )
            .await?;
        ctx.last_event_seq = sealed.event_seq;

        let args = Value::Object(ctx.state.variables.clone());
        let started = Instant::now();
        let outcome = guarded(&mut ctx.stop_rx, options.timeout, f(args)).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Guarded::Stopped(reason) => {
                return Err(stop_error(reason, &workflow_id, &step_id));
            }

            Guarded::TimedOut => {
                let timeout = options.timeout.unwrap_or_default();
                let failure = StepFailure::fatal(
                    TIMEOUT_ERROR_KIND,
                    format!("attempt {attempt_id} exceeded {timeout:?}"),
                );
                record_failure(ctx, &workflow_id, &org_id, &step_id, attempt_id, &failure).await?;

                if policy.kind_is_retryable(TIMEOUT_ERROR_KIND) && policy.allows_retry(attempt_id) {
                    tokio::time::sleep(policy.backoff_after(attempt_id)).await;
                    continue;
                }
                return Err(StepError::Timeout { step_id, timeout });
            }

            Guarded::Failed(failure) => {
                record_failure(ctx, &workflow_id, &org_id, &step_id, attempt_id, &failure).await?;

                let retryable = failure.retryable || policy.kind_is_retryable(&failure.kind);
                if retryable && policy.allows_retry(attempt_id) {
                    let backoff = policy.backoff_after(attempt_id);
                    debug!(%step_id, attempt_id, ?backoff, "retrying after backoff");
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                if retryable {
                    return Err(StepError::TooManyAttempts {
                        step_id,
                        max_attempts: policy.max_attempts,
                        last: failure,
                    });
                }
                return Err(StepError::ExecutionFailed { step_id, failure });
            }

            Guarded::Succeeded(result) => {
                let Some(result_map) = result.as_object() else {
                    let failure = StepFailure::fatal(
                        "invalid_result",
                        "step result must be a JSON object to merge into variables",
                    );
                    record_failure(ctx, &workflow_id, &org_id, &step_id, attempt_id, &failure)
                        .await?;
                    return Err(StepError::ExecutionFailed { step_id, failure });
                };

                commit_completion(
                    ctx,
                    &workflow_id,
                    &org_id,
                    &step_id,
                    attempt_id,
                    result_map.clone(),
                    duration_ms,
                )
                .await?;
                maybe_snapshot(ctx, &options).await?;

                return Ok(Value::Object(result_map.clone()));
            }
        }
    }
}

/// Race the user function against the step timer and the stop channel.
async fn guarded<Fut>(
    stop_rx: &mut watch::Receiver<Option<StopReason>>,
    timeout: Option<Duration>,
    work: Fut,
) -> Guarded
where
    Fut: Future<Output = Result<Value, StepFailure>> + Send,
{
    let timer = async move {
        match timeout {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(work);
    tokio::pin!(timer);

    let mut stop_open = true;
    loop {
        tokio::select! {
            result = &mut work => {
                return match result {
                    Ok(value) => Guarded::Succeeded(value),
                    Err(failure) => Guarded::Failed(failure),
                };
            }
            _ = &mut timer => return Guarded::TimedOut,
            changed = stop_rx.changed(), if stop_open => match changed {
                Ok(()) => {
                    if let Some(reason) = *stop_rx.borrow() {
                        return Guarded::Stopped(reason);
                    }
                }
                Err(_) => stop_open = false,
            },
        }
    }
}

fn stop_error(reason: StopReason, workflow_id: &str, step_id: &str) -> StepError {
    match reason {
        StopReason::LeaseLost => StepError::LeaseLost(workflow_id.to_string()),
        StopReason::Cancelled => StepError::Cancelled {
            step_id: step_id.to_string(),
        },
    }
}

async fn record_failure(
    ctx: &mut WorkflowContext,
    workflow_id: &str,
    org_id: &str,
    step_id: &str,
    attempt_id: u32,
    failure: &StepFailure,
) -> Result<(), StepError> {
    warn!(%workflow_id, %step_id, attempt_id, kind = %failure.kind, "step attempt failed");
    let sealed = ctx
        .journal
        .append(
            workflow_id,
            org_id,
            EventPayload::StepFailed {
                step_id: step_id.to_string(),
                attempt_id,
                error_kind: failure.kind.clone(),
                error_message: failure.message.clone(),
            },
        )
        .await?;
    ctx.last_event_seq = sealed.event_seq;
    Ok(())
}

/// Advance the state and commit: the `step_completed` event and the
/// completion row become visible together or not at all.
async fn commit_completion(
    ctx: &mut WorkflowContext,
    workflow_id: &str,
    org_id: &str,
    step_id: &str,
    attempt_id: u32,
    result_map: serde_json::Map<String, Value>,
    duration_ms: u64,
) -> Result<(), StepError> {
    let mut next_vars = ctx.state.variables.clone();
    for (key, value) in &result_map {
        next_vars.insert(key.clone(), value.clone());
    }
    let delta = StateDelta::between(&ctx.state.variables, &next_vars);

    let mut new_state = ctx.state.clone();
    new_state.apply_completion(&delta).map_err(|err| {
        StepError::ExecutionFailed {
            step_id: step_id.to_string(),
            failure: StepFailure::fatal("state_delta", err.to_string()),
        }
    })?;

    let event = Event::new(
        workflow_id,
        org_id,
        EventPayload::StepCompleted {
            step_id: step_id.to_string(),
            attempt_id,
            state_delta: delta,
            new_state_checksum: new_state.checksum.clone(),
            duration_ms,
        },
    );
    let completion = CompletedStep::record(
        workflow_id,
        step_id,
        attempt_id,
        Value::Object(result_map),
    );

    let sealed = ctx
        .store
        .append_with_completion(event, completion, ctx.lease.fencing_token)
        .await
        .map_err(|err| match err {
            StoreError::LeaseMismatch(id) => StepError::LeaseLost(id),
            other => StepError::Store(other),
        })?;
    ctx.state = new_state;
    ctx.last_event_seq = sealed.event_seq;
    info!(%workflow_id, %step_id, attempt_id, seq = sealed.event_seq, "step committed");
    Ok(())
}

/// Snapshot cadence: every `snapshot_interval` checkpointed steps, and
/// always when the step requested a savepoint.
async fn maybe_snapshot(ctx: &mut WorkflowContext, options: &StepOptions) -> Result<(), StepError> {
    if let Some(note) = &options.savepoint {
        let snapshot = ctx.snapshots.create(&ctx.state, ctx.last_event_seq).await?;
        let payload =
            note.clone()
                .into_payload(Uuid::now_v7(), ctx.state.step_number, snapshot.snapshot_id);
        let sealed = ctx
            .journal
            .append(&ctx.workflow_id, &ctx.org_id, payload)
            .await?;
        ctx.last_event_seq = sealed.event_seq;
        ctx.steps_since_snapshot = 0;
        return Ok(());
    }

    if options.checkpoint {
        ctx.steps_since_snapshot += 1;
        if ctx.steps_since_snapshot >= ctx.snapshot_interval {
            ctx.snapshots.create(&ctx.state, ctx.last_event_seq).await?;
            ctx.steps_since_snapshot = 0;
        }
    }
    Ok(())
}

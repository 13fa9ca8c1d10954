//! Call scheduler: periodic dispatch of due calls and delayed reconciliation
//! of finished ones.
//!
//! One sweep per interval. Claims are guarded updates in the store, so
//! overlapping sweeps (or a second service instance) dispatch each schedule
//! at most once.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep};
use tracing::{error, info, instrument, warn};

use wellcall_core::sentiment;

use crate::db::CallStore;
use crate::error::CallError;
use crate::models::{CallRecord, ScheduleStatus, ScheduledCall};
use crate::state::AppState;
use crate::telephony::TelephonyGateway;

/// Provider statuses that mean the call will not progress further.
const TERMINAL_CALL_STATUSES: [&str; 5] =
    ["completed", "busy", "no-answer", "failed", "canceled"];

/// Reconciliation is the only writer that settles a schedule, so transient
/// provider failures get a few tries before the sweep's recovery pass takes
/// over.
const RECONCILE_ATTEMPTS: u32 = 3;
const RECONCILE_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// Starts the background dispatch loop. Runs for the life of the process.
pub fn spawn(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut ticker = interval(state.config.dispatch_interval);
        info!(
            interval_secs = state.config.dispatch_interval.as_secs(),
            "Call scheduler started"
        );
        loop {
            ticker.tick().await;
            if let Err(e) = run_dispatch_sweep(&state).await {
                error!(error = %e, "Dispatch sweep failed");
            }
        }
    });
}

/// One pass over due schedules. A failure on one schedule never blocks the
/// rest of the sweep.
async fn run_dispatch_sweep(state: &Arc<AppState>) -> Result<(), CallError> {
    let cutoff = Utc::now() + state.config.dispatch_buffer;
    let due = state.db.due_schedules(cutoff).await?;
    if !due.is_empty() {
        info!(count = due.len(), "Dispatching due schedules");
    }

    for schedule in &due {
        let instructions_url = state.config.instructions_url(schedule.id);
        match dispatch_one(
            state.db.as_ref(),
            state.telephony.as_ref(),
            schedule,
            &instructions_url,
        )
        .await
        {
            Ok(Some(record)) => {
                spawn_reconcile(state.clone(), record.provider_call_id.clone(), schedule.id);
            }
            Ok(None) => {}
            Err(e) => {
                error!(schedule_id = %schedule.id, error = %e, "Dispatch failed");
            }
        }
    }

    // Reconciliations lost to a restart or exhausted retries are picked up
    // here, so no schedule strands at in_progress forever.
    if let Ok(delay) = chrono::Duration::from_std(state.config.reconcile_delay) {
        run_recovery_pass(
            state.db.as_ref(),
            state.telephony.as_ref(),
            Utc::now() - delay,
        )
        .await?;
    }
    Ok(())
}

/// Re-runs reconciliation for in-progress schedules whose call record should
/// have been finalized by now. Reconciliation is idempotent, so racing a
/// still-sleeping reconcile task is harmless.
async fn run_recovery_pass<S, G>(
    store: &S,
    gateway: &G,
    stale_before: chrono::DateTime<Utc>,
) -> Result<(), CallError>
where
    S: CallStore + ?Sized,
    G: TelephonyGateway + ?Sized,
{
    for (schedule_id, provider_call_id) in store.unreconciled_calls(stale_before).await? {
        warn!(%schedule_id, call_sid = %provider_call_id, "Recovering lost reconciliation");
        if let Err(e) = reconcile_call(store, gateway, &provider_call_id, schedule_id).await {
            error!(call_sid = %provider_call_id, error = %e, "Recovery reconciliation failed");
        }
    }
    Ok(())
}

/// Claims and dispatches a single schedule.
///
/// Returns `Ok(None)` when another sweep claimed the schedule first. On a
/// placement failure the schedule moves to `failed`.
#[instrument(skip_all, fields(schedule_id = %schedule.id))]
async fn dispatch_one<S, G>(
    store: &S,
    gateway: &G,
    schedule: &ScheduledCall,
    instructions_url: &str,
) -> Result<Option<CallRecord>, CallError>
where
    S: CallStore + ?Sized,
    G: TelephonyGateway + ?Sized,
{
    if !store.claim_schedule(schedule.id).await? {
        info!("Schedule already claimed, skipping");
        return Ok(None);
    }

    match gateway
        .place_call(&schedule.phone_number, instructions_url)
        .await
    {
        Ok(provider_call_id) => {
            let record = store
                .create_call_record(schedule, &provider_call_id, Utc::now())
                .await?;
            info!(call_sid = %provider_call_id, "Call dispatched");
            Ok(Some(record))
        }
        Err(e) => {
            error!(error = %e, "Call placement failed");
            store
                .mark_schedule(schedule.id, ScheduleStatus::Failed)
                .await?;
            Err(e)
        }
    }
}

fn spawn_reconcile(state: Arc<AppState>, provider_call_id: String, schedule_id: uuid::Uuid) {
    tokio::spawn(async move {
        sleep(state.config.reconcile_delay).await;
        if let Err(e) = reconcile_with_retry(
            state.db.as_ref(),
            state.telephony.as_ref(),
            &provider_call_id,
            schedule_id,
            RECONCILE_ATTEMPTS,
            RECONCILE_RETRY_BACKOFF,
        )
        .await
        {
            // The next sweep's recovery pass will try again.
            error!(call_sid = %provider_call_id, error = %e, "Reconciliation abandoned after retries");
        }
    });
}

async fn reconcile_with_retry<S, G>(
    store: &S,
    gateway: &G,
    provider_call_id: &str,
    schedule_id: uuid::Uuid,
    attempts: u32,
    backoff: Duration,
) -> Result<(), CallError>
where
    S: CallStore + ?Sized,
    G: TelephonyGateway + ?Sized,
{
    let mut last_err = None;
    for attempt in 1..=attempts {
        match reconcile_call(store, gateway, provider_call_id, schedule_id).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(attempt, error = %e, "Reconciliation attempt failed");
                last_err = Some(e);
                if attempt < attempts {
                    sleep(backoff).await;
                }
            }
        }
    }
    Err(last_err
        .unwrap_or_else(|| CallError::Session("reconciliation never attempted".to_string())))
}

/// Fetches the call's final provider state, writes it to the record, settles
/// the schedule, and scores sentiment for completed calls with a transcript.
#[instrument(skip(store, gateway), fields(call_sid = %provider_call_id))]
async fn reconcile_call<S, G>(
    store: &S,
    gateway: &G,
    provider_call_id: &str,
    schedule_id: uuid::Uuid,
) -> Result<(), CallError>
where
    S: CallStore + ?Sized,
    G: TelephonyGateway + ?Sized,
{
    let mut meta = gateway.fetch_call_metadata(provider_call_id).await?;
    if !TERMINAL_CALL_STATUSES.contains(&meta.status.as_str()) {
        // A check-in call outliving the reconcile delay gets hung up so the
        // schedule can settle.
        warn!(status = %meta.status, "Call still live at reconcile time, hanging up");
        match gateway.terminate_call(provider_call_id).await {
            Ok(()) => meta = gateway.fetch_call_metadata(provider_call_id).await?,
            Err(e) => warn!(error = %e, "Hangup failed, settling with current state"),
        }
    }

    store
        .finalize_call_record(
            provider_call_id,
            meta.duration_seconds,
            meta.ended_at,
            &meta.status,
        )
        .await?;

    let outcome = schedule_outcome(&meta.status);
    store.mark_schedule(schedule_id, outcome).await?;
    info!(status = %meta.status, outcome = %outcome, "Call reconciled");

    if outcome != ScheduleStatus::Completed {
        return Ok(());
    }
    score_sentiment(store, provider_call_id).await
}

/// Sentiment contributes only when the caller actually said something.
async fn score_sentiment<S>(store: &S, provider_call_id: &str) -> Result<(), CallError>
where
    S: CallStore + ?Sized,
{
    let Some(record) = store.find_call_record(provider_call_id).await? else {
        return Err(CallError::NotFound(provider_call_id.to_string()));
    };
    if record.caller_transcript.trim().is_empty() {
        info!("No caller speech captured, skipping sentiment");
        return Ok(());
    }

    // Both sides of the conversation are scored; the agent's phrasing
    // carries mood signal the caller reacted to.
    let full_text = format!("{} {}", record.caller_transcript, record.agent_responses);
    let scores = sentiment::analyze(&full_text);
    let impact = scores.mental_health_impact();
    store.upsert_sentiment(record.id, &scores, impact).await?;
    info!(
        dominant = %scores.dominant(),
        impact,
        "Sentiment recorded"
    );
    Ok(())
}

/// Maps a terminal provider call status to the schedule's terminal state.
/// Only a clean completion counts as completed.
fn schedule_outcome(call_status: &str) -> ScheduleStatus {
    if call_status == "completed" {
        ScheduleStatus::Completed
    } else {
        ScheduleStatus::Failed
    }
}

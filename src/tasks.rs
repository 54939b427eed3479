use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::state::{AppState, EngineEvent};
use crate::store::{pending_payout_jobs, process_payout_job_slice, sweep_expired_challenges, PayoutSliceOutcome};

const PAYOUT_RETRY_DELAY_MS: u64 = 250;
const PAYOUT_SLOW_WARN_MS: u128 = 1_000;
const TELEMETRY_INTERVAL_SECS: u64 = 30;

fn enqueue_payout_after_delay(state: AppState, job_id: Uuid, delay_ms: u64) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(delay_ms.max(1))).await;
        state.enqueue_payout_job(job_id);
    });
}

/// Run one batch of a payout job, re-arming the wake channel while the job
/// still has pending entries.
async fn run_payout_slice(state: &AppState, job_id: Uuid) {
    let started = std::time::Instant::now();
    match process_payout_job_slice(state, job_id).await {
        Ok(PayoutSliceOutcome::NotFound) => {
            eprintln!("[payout] job_missing job_id={}", job_id);
        }
        Ok(PayoutSliceOutcome::AlreadyTerminal) => {}
        Ok(PayoutSliceOutcome::Completed { completed, failed }) => {
            eprintln!(
                "[payout] job_completed job_id={} completed={} failed={} elapsed_ms={}",
                job_id,
                completed,
                failed,
                started.elapsed().as_millis()
            );
        }
        Ok(PayoutSliceOutcome::Progress { processed, batch }) => {
            eprintln!(
                "[payout] batch_done job_id={} batch={} processed_total={} elapsed_ms={}",
                job_id,
                batch,
                processed,
                started.elapsed().as_millis()
            );
            // More entries may remain; come back for the next batch.
            enqueue_payout_after_delay(state.clone(), job_id, PAYOUT_RETRY_DELAY_MS);
        }
        Err(e) => {
            eprintln!(
                "[payout] slice_error job_id={} elapsed_ms={} error={}",
                job_id,
                started.elapsed().as_millis(),
                e.detail
            );
            enqueue_payout_after_delay(state.clone(), job_id, PAYOUT_RETRY_DELAY_MS * 4);
        }
    }
    let elapsed = started.elapsed().as_millis();
    if elapsed >= PAYOUT_SLOW_WARN_MS {
        eprintln!("[payout] slow_slice job_id={} elapsed_ms={}", job_id, elapsed);
    }
}

pub(crate) fn start_background_tasks(
    state: AppState,
    mut payout_rx: mpsc::UnboundedReceiver<Uuid>,
    mut events_rx: mpsc::UnboundedReceiver<EngineEvent>,
) {
    // 1) Payout worker: drains wake signals, one slice per job at a time.
    let s_payout = state.clone();
    tokio::spawn(async move {
        while let Some(job_id) = payout_rx.recv().await {
            s_payout.payout_pending.remove(&job_id);
            if s_payout.payout_running.insert(job_id, ()).is_some() {
                s_payout.perf.payout_busy.fetch_add(1, Ordering::Relaxed);
                enqueue_payout_after_delay(s_payout.clone(), job_id, PAYOUT_RETRY_DELAY_MS);
                continue;
            }
            let s_job = s_payout.clone();
            tokio::spawn(async move {
                run_payout_slice(&s_job, job_id).await;
                s_job.payout_running.remove(&job_id);
            });
        }
    });

    // 2) Interval scan: picks up jobs left behind by a crash or missed
    //    wake. The immediate wake after settlement makes this the slow path.
    let s_scan = state.clone();
    tokio::spawn(async move {
        let interval = Duration::from_secs(s_scan.cfg.worker.payout_interval_seconds.max(1));
        loop {
            tokio::time::sleep(interval).await;
            match pending_payout_jobs(&s_scan).await {
                Ok(jobs) => {
                    if !jobs.is_empty() {
                        eprintln!("[payout] interval_scan pending_jobs={}", jobs.len());
                    }
                    for job_id in jobs {
                        s_scan.enqueue_payout_job(job_id);
                    }
                }
                Err(e) => {
                    eprintln!("[payout] interval_scan_failed error={}", e.detail);
                }
            }
        }
    });

    // 3) Expiry sweep for open challenges past their deadline.
    let s_exp = state.clone();
    tokio::spawn(async move {
        let interval = Duration::from_secs(s_exp.cfg.worker.expiry_sweep_seconds.max(1));
        loop {
            tokio::time::sleep(interval).await;
            match sweep_expired_challenges(&s_exp).await {
                Ok(0) => {}
                Ok(n) => {
                    eprintln!("[queue] expiry_sweep expired={}", n);
                }
                Err(e) => {
                    eprintln!("[queue] expiry_sweep_failed error={}", e.detail);
                }
            }
        }
    });

    // 4) Event dispatcher. Downstream delivery is out of scope here; events
    //    are surfaced as structured log lines for the notification plumbing.
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(payload) => eprintln!("[notify] event={}", payload),
                Err(e) => eprintln!("[notify] serialize_failed error={}", e),
            }
        }
    });

    // 5) Counter telemetry.
    let s_perf = state.clone();
    tokio::spawn(async move {
        let mut last_emitted = 0u64;
        let mut last_completed = 0u64;
        let mut last_failed = 0u64;
        loop {
            tokio::time::sleep(Duration::from_secs(TELEMETRY_INTERVAL_SECS)).await;
            let emitted = s_perf.perf.events_emitted.load(Ordering::Relaxed);
            let completed = s_perf.perf.payout_entries_completed.load(Ordering::Relaxed);
            let failed = s_perf.perf.payout_entries_failed.load(Ordering::Relaxed);
            let pending = s_perf.payout_pending.len();
            let running = s_perf.payout_running.len();
            if emitted != last_emitted
                || completed != last_completed
                || failed != last_failed
                || pending > 0
                || running > 0
            {
                eprintln!(
                    "[perf] joins={} matched={} refunds={} payout_entries_completed={} payout_entries_failed={} jobs_completed={} pending_jobs={} running_jobs={} events_emitted={}",
                    s_perf.perf.join_received.load(Ordering::Relaxed),
                    s_perf.perf.join_matched.load(Ordering::Relaxed),
                    s_perf.perf.refunds_issued.load(Ordering::Relaxed),
                    completed,
                    failed,
                    s_perf.perf.payout_jobs_completed.load(Ordering::Relaxed),
                    pending,
                    running,
                    emitted
                );
                last_emitted = emitted;
                last_completed = completed;
                last_failed = failed;
            }
        }
    });

    // 6) Startup scan so jobs interrupted by a restart resume immediately.
    let s_boot = state.clone();
    tokio::spawn(async move {
        match pending_payout_jobs(&s_boot).await {
            Ok(jobs) => {
                if !jobs.is_empty() {
                    eprintln!("[startup] resuming_payout_jobs count={}", jobs.len());
                }
                for job_id in jobs {
                    s_boot.enqueue_payout_job(job_id);
                }
            }
            Err(e) => {
                eprintln!("[startup] payout_resume_failed error={}", e.detail);
            }
        }
    });
}

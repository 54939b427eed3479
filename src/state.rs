use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use sqlx::{Pool, Postgres};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::AppConfig;

/// Outbound domain events. Delivery is best-effort: the dispatcher task
/// drains these for downstream notification plumbing, and a send failure
/// never affects the operation that produced the event.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum EngineEvent {
    QueueJoined {
        challenge_id: i64,
        user_id: i64,
        side: String,
        position: i32,
    },
    StakeMatched {
        challenge_id: i64,
        user_id: i64,
        opponent_user_id: i64,
        stake_amount: i64,
    },
    QueueCancelled {
        challenge_id: i64,
        user_id: i64,
        refunded: i64,
    },
    ChallengeExpired {
        challenge_id: i64,
        refunded_entries: i64,
    },
    ChallengeSettled {
        challenge_id: i64,
        outcome: String,
        payout_job_id: Option<Uuid>,
    },
    PayoutDelivered {
        challenge_id: i64,
        user_id: i64,
        amount: i64,
    },
    PayoutJobCompleted {
        job_id: Uuid,
        completed_entries: i64,
        failed_entries: i64,
    },
    PartnerFeeSettled {
        partner_program_id: i64,
        challenge_id: i64,
        partner_fee: i64,
        already_existed: bool,
    },
    WithdrawalDecided {
        withdrawal_id: Uuid,
        partner_program_id: i64,
        approved: bool,
        amount: i64,
    },
}

pub(crate) struct PerfCounters {
    pub(crate) join_received: AtomicU64,
    pub(crate) join_matched: AtomicU64,
    pub(crate) join_queued: AtomicU64,
    pub(crate) join_rejected: AtomicU64,
    pub(crate) cancel_confirmed: AtomicU64,
    pub(crate) cancel_rejected: AtomicU64,
    pub(crate) challenges_expired: AtomicU64,
    pub(crate) refunds_issued: AtomicU64,
    pub(crate) settle_requests: AtomicU64,
    pub(crate) payout_jobs_created: AtomicU64,
    pub(crate) payout_batches: AtomicU64,
    pub(crate) payout_entries_completed: AtomicU64,
    pub(crate) payout_entries_failed: AtomicU64,
    pub(crate) payout_jobs_completed: AtomicU64,
    pub(crate) payout_wakeups: AtomicU64,
    pub(crate) payout_busy: AtomicU64,
    pub(crate) partner_settlements: AtomicU64,
    pub(crate) partner_credits_deduped: AtomicU64,
    pub(crate) events_emitted: AtomicU64,
    pub(crate) events_dropped: AtomicU64,
}

impl PerfCounters {
    pub(crate) fn new() -> Self {
        Self {
            join_received: AtomicU64::new(0),
            join_matched: AtomicU64::new(0),
            join_queued: AtomicU64::new(0),
            join_rejected: AtomicU64::new(0),
            cancel_confirmed: AtomicU64::new(0),
            cancel_rejected: AtomicU64::new(0),
            challenges_expired: AtomicU64::new(0),
            refunds_issued: AtomicU64::new(0),
            settle_requests: AtomicU64::new(0),
            payout_jobs_created: AtomicU64::new(0),
            payout_batches: AtomicU64::new(0),
            payout_entries_completed: AtomicU64::new(0),
            payout_entries_failed: AtomicU64::new(0),
            payout_jobs_completed: AtomicU64::new(0),
            payout_wakeups: AtomicU64::new(0),
            payout_busy: AtomicU64::new(0),
            partner_settlements: AtomicU64::new(0),
            partner_credits_deduped: AtomicU64::new(0),
            events_emitted: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        }
    }

    pub(crate) fn snapshot_json(&self, payout_pending: usize, payout_running: usize) -> serde_json::Value {
        serde_json::json!({
            "queue": {
                "join_received": self.join_received.load(Ordering::Relaxed),
                "join_matched": self.join_matched.load(Ordering::Relaxed),
                "join_queued": self.join_queued.load(Ordering::Relaxed),
                "join_rejected": self.join_rejected.load(Ordering::Relaxed),
                "cancel_confirmed": self.cancel_confirmed.load(Ordering::Relaxed),
                "cancel_rejected": self.cancel_rejected.load(Ordering::Relaxed),
                "challenges_expired": self.challenges_expired.load(Ordering::Relaxed),
                "refunds_issued": self.refunds_issued.load(Ordering::Relaxed),
            },
            "settlement": {
                "settle_requests": self.settle_requests.load(Ordering::Relaxed),
                "partner_settlements": self.partner_settlements.load(Ordering::Relaxed),
                "partner_credits_deduped": self.partner_credits_deduped.load(Ordering::Relaxed),
            },
            "payout": {
                "jobs_created": self.payout_jobs_created.load(Ordering::Relaxed),
                "jobs_completed": self.payout_jobs_completed.load(Ordering::Relaxed),
                "batches": self.payout_batches.load(Ordering::Relaxed),
                "entries_completed": self.payout_entries_completed.load(Ordering::Relaxed),
                "entries_failed": self.payout_entries_failed.load(Ordering::Relaxed),
                "wakeups": self.payout_wakeups.load(Ordering::Relaxed),
                "busy": self.payout_busy.load(Ordering::Relaxed),
                "pending_jobs": payout_pending,
                "running_jobs": payout_running,
            },
            "events": {
                "emitted": self.events_emitted.load(Ordering::Relaxed),
                "dropped": self.events_dropped.load(Ordering::Relaxed),
            }
        })
    }
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) cfg: Arc<AppConfig>,
    pub(crate) db: Pool<Postgres>,
    pub(crate) payout_tx: mpsc::UnboundedSender<Uuid>,
    pub(crate) payout_pending: Arc<DashMap<Uuid, ()>>,
    pub(crate) payout_running: Arc<DashMap<Uuid, ()>>,
    pub(crate) events_tx: mpsc::UnboundedSender<EngineEvent>,
    pub(crate) perf: Arc<PerfCounters>,
}

impl AppState {
    /// Wake the payout worker for one job. Coalesces repeated wakes for a
    /// job that is already queued on the channel.
    pub(crate) fn enqueue_payout_job(&self, job_id: Uuid) {
        if self.payout_pending.insert(job_id, ()).is_some() {
            return;
        }
        self.perf.payout_wakeups.fetch_add(1, Ordering::Relaxed);
        if self.payout_tx.send(job_id).is_err() {
            self.payout_pending.remove(&job_id);
        }
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        if self.events_tx.send(event).is_ok() {
            self.perf.events_emitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.perf.events_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_screaming_tags() {
        let e = EngineEvent::StakeMatched {
            challenge_id: 7,
            user_id: 1,
            opponent_user_id: 2,
            stake_amount: 1000,
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "STAKE_MATCHED");
        assert_eq!(v["stake_amount"], 1000);
    }

    #[test]
    fn settled_event_carries_optional_job() {
        let e = EngineEvent::ChallengeSettled {
            challenge_id: 3,
            outcome: "draw".to_string(),
            payout_job_id: None,
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "CHALLENGE_SETTLED");
        assert!(v["payout_job_id"].is_null());
    }
}

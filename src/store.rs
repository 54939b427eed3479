use std::sync::atomic::Ordering;

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use uuid::Uuid;

use crate::engine::{
    check_recorded_result, derive_winner_payouts, partner_fee_minor, platform_fee_minor,
    stake_in_matched_pool, MatchedStake, Outcome, Side, CHALLENGE_EXPIRED, CHALLENGE_OPEN,
    CHALLENGE_SETTLED, ENTRY_CANCELLED, ENTRY_MATCHED, ENTRY_REFUNDED, ENTRY_WAITING,
    JOB_COMPLETED, JOB_FAILED, JOB_QUEUED, JOB_RUNNING, PAYOUT_COMPLETED, PAYOUT_FAILED,
    PAYOUT_PENDING, PTX_SETTLEMENT_CREDIT, PTX_WITHDRAWAL_DEBIT, TX_CHALLENGE_PAYOUT,
    TX_DRAW_REFUND, TX_EXPIRED_REFUND, TX_QUEUE_CANCEL_REFUND, TX_STAKE_HOLD, WD_APPROVED,
    WD_PENDING, WD_REJECTED,
};
use crate::error::{is_unique_violation, ApiError};
use crate::state::{AppState, EngineEvent};

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum JoinOutcome {
    Matched {
        entry_id: i64,
        opponent_user_id: i64,
        stake_amount: i64,
    },
    Waiting {
        entry_id: i64,
        position: i32,
        stake_amount: i64,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct QueueEntryRow {
    pub(crate) id: i64,
    pub(crate) user_id: i64,
    pub(crate) stake_amount: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub(crate) struct PayoutJobSummary {
    pub(crate) id: Uuid,
    pub(crate) challenge_id: i64,
    pub(crate) status: String,
    pub(crate) total_winners: i32,
    pub(crate) total_pool: i64,
    pub(crate) platform_fee: i64,
    pub(crate) winner_pool: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct PartnerSettlement {
    pub(crate) id: Uuid,
    pub(crate) partner_program_id: i64,
    pub(crate) challenge_id: i64,
    pub(crate) partner_fee: i64,
    pub(crate) already_existed: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct SettleOutcome {
    pub(crate) outcome: Outcome,
    pub(crate) job: Option<PayoutJobSummary>,
    pub(crate) refunded_entries: i64,
    pub(crate) partner: Option<PartnerSettlement>,
}

// ===== Escrow primitives (run inside a caller-owned transaction) =====

/// Debit the stake from the user's wallet, fail closed. The conditional
/// update never leaves a partial debit: zero rows means insufficient funds.
async fn hold_stake(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i64,
    challenge_id: i64,
    entry_id: i64,
    amount: i64,
) -> Result<(), ApiError> {
    let debited = sqlx::query(
        "UPDATE wallet_accounts SET balance = balance - $1, updated_at = now() \
         WHERE user_id = $2 AND balance >= $1",
    )
    .bind(amount)
    .bind(user_id)
    .execute(&mut **tx)
    .await
    .map_err(ApiError::db)?
    .rows_affected();
    if debited == 0 {
        return Err(ApiError::new(StatusCode::PAYMENT_REQUIRED, "Insufficient funds"));
    }
    sqlx::query(
        "INSERT INTO wallet_transactions (user_id, tx_type, amount, challenge_id, queue_entry_id, description) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(user_id)
    .bind(TX_STAKE_HOLD)
    .bind(-amount)
    .bind(challenge_id)
    .bind(entry_id)
    .bind(format!("Stake held for challenge {challenge_id}"))
    .execute(&mut **tx)
    .await
    .map_err(ApiError::db)?;
    Ok(())
}

/// Credit a held stake back for one queue entry. Idempotent per
/// (entry, reason): the partial unique index turns a repeat into a no-op,
/// and the wallet is only credited when the ledger row actually landed.
async fn release_entry_stake(
    tx: &mut Transaction<'_, Postgres>,
    entry: &QueueEntryRow,
    challenge_id: i64,
    tx_type: &str,
    description: String,
) -> Result<bool, ApiError> {
    let inserted = sqlx::query(
        "INSERT INTO wallet_transactions (user_id, tx_type, amount, challenge_id, queue_entry_id, description) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (queue_entry_id, tx_type) WHERE queue_entry_id IS NOT NULL DO NOTHING",
    )
    .bind(entry.user_id)
    .bind(tx_type)
    .bind(entry.stake_amount)
    .bind(challenge_id)
    .bind(entry.id)
    .bind(description)
    .execute(&mut **tx)
    .await
    .map_err(ApiError::db)?
    .rows_affected();
    if inserted == 0 {
        return Ok(false);
    }
    sqlx::query(
        "INSERT INTO wallet_accounts (user_id, balance) VALUES ($1, $2) \
         ON CONFLICT (user_id) DO UPDATE \
         SET balance = wallet_accounts.balance + EXCLUDED.balance, updated_at = now()",
    )
    .bind(entry.user_id)
    .bind(entry.stake_amount)
    .execute(&mut **tx)
    .await
    .map_err(ApiError::db)?;
    Ok(true)
}

// ===== Matching queue =====

pub(crate) async fn join_challenge(
    state: &AppState,
    challenge_id: i64,
    user_id: i64,
    side: Side,
) -> Result<JoinOutcome, ApiError> {
    state.perf.join_received.fetch_add(1, Ordering::Relaxed);
    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    // Row lock on the challenge serializes all queue mutations for it.
    let challenge = sqlx::query(
        "SELECT status, stake_amount, deadline FROM challenges WHERE id = $1 FOR UPDATE",
    )
    .bind(challenge_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Challenge not found"))?;

    let status: String = challenge.get("status");
    if status != CHALLENGE_OPEN {
        state.perf.join_rejected.fetch_add(1, Ordering::Relaxed);
        return Err(ApiError::new(StatusCode::CONFLICT, "Challenge is not open"));
    }
    let deadline: Option<DateTime<Utc>> = challenge.get("deadline");
    if deadline.map(|d| d <= Utc::now()).unwrap_or(false) {
        state.perf.join_rejected.fetch_add(1, Ordering::Relaxed);
        return Err(ApiError::new(StatusCode::CONFLICT, "Challenge deadline has passed"));
    }
    let stake_amount: i64 = challenge.get("stake_amount");

    let position: i32 = sqlx::query_scalar(
        "SELECT COUNT(*)::int + 1 FROM queue_entries \
         WHERE challenge_id = $1 AND side = $2 AND status = $3",
    )
    .bind(challenge_id)
    .bind(side.as_str())
    .bind(ENTRY_WAITING)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    // The partial unique index rejects a second live entry for this user.
    let entry_id: i64 = match sqlx::query_scalar::<_, i64>(
        "INSERT INTO queue_entries (challenge_id, user_id, side, stake_amount, status, position) \
         VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
    )
    .bind(challenge_id)
    .bind(user_id)
    .bind(side.as_str())
    .bind(stake_amount)
    .bind(ENTRY_WAITING)
    .bind(position)
    .fetch_one(&mut *tx)
    .await
    {
        Ok(id) => id,
        Err(e) if is_unique_violation(&e) => {
            state.perf.join_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(ApiError::new(
                StatusCode::CONFLICT,
                "Already in queue for this challenge",
            ));
        }
        Err(e) => return Err(ApiError::db(e)),
    };

    hold_stake(&mut tx, user_id, challenge_id, entry_id, stake_amount).await?;

    // FCFS scan for the oldest waiting entry on the opposite side.
    let opponent = sqlx::query(
        "SELECT id, user_id FROM queue_entries \
         WHERE challenge_id = $1 AND side = $2 AND status = $3 \
         ORDER BY created_at, id LIMIT 1 FOR UPDATE",
    )
    .bind(challenge_id)
    .bind(side.opposite().as_str())
    .bind(ENTRY_WAITING)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    let outcome = match opponent {
        Some(opp) => {
            let opp_entry_id: i64 = opp.get("id");
            let opp_user_id: i64 = opp.get("user_id");
            sqlx::query(
                "UPDATE queue_entries SET status = $1, matched_with = $2, matched_at = now() \
                 WHERE id = $3",
            )
            .bind(ENTRY_MATCHED)
            .bind(opp_entry_id)
            .bind(entry_id)
            .execute(&mut *tx)
            .await
            .map_err(ApiError::db)?;
            sqlx::query(
                "UPDATE queue_entries SET status = $1, matched_with = $2, matched_at = now() \
                 WHERE id = $3",
            )
            .bind(ENTRY_MATCHED)
            .bind(entry_id)
            .bind(opp_entry_id)
            .execute(&mut *tx)
            .await
            .map_err(ApiError::db)?;
            JoinOutcome::Matched {
                entry_id,
                opponent_user_id: opp_user_id,
                stake_amount,
            }
        }
        None => JoinOutcome::Waiting {
            entry_id,
            position,
            stake_amount,
        },
    };

    tx.commit().await.map_err(ApiError::db)?;

    match &outcome {
        JoinOutcome::Matched { opponent_user_id, .. } => {
            state.perf.join_matched.fetch_add(1, Ordering::Relaxed);
            state.emit(EngineEvent::StakeMatched {
                challenge_id,
                user_id,
                opponent_user_id: *opponent_user_id,
                stake_amount,
            });
            state.emit(EngineEvent::StakeMatched {
                challenge_id,
                user_id: *opponent_user_id,
                opponent_user_id: user_id,
                stake_amount,
            });
        }
        JoinOutcome::Waiting { position, .. } => {
            state.perf.join_queued.fetch_add(1, Ordering::Relaxed);
            state.emit(EngineEvent::QueueJoined {
                challenge_id,
                user_id,
                side: side.as_str().to_string(),
                position: *position,
            });
        }
    }
    Ok(outcome)
}

/// Leave the queue before a match. Only waiting entries can be cancelled;
/// a matched stake is committed until settlement.
pub(crate) async fn cancel_from_queue(
    state: &AppState,
    challenge_id: i64,
    user_id: i64,
) -> Result<i64, ApiError> {
    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let row = sqlx::query(
        "SELECT id, status, stake_amount FROM queue_entries \
         WHERE challenge_id = $1 AND user_id = $2 AND status IN ($3, $4) \
         ORDER BY id DESC LIMIT 1 FOR UPDATE",
    )
    .bind(challenge_id)
    .bind(user_id)
    .bind(ENTRY_WAITING)
    .bind(ENTRY_MATCHED)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| {
        state.perf.cancel_rejected.fetch_add(1, Ordering::Relaxed);
        ApiError::new(StatusCode::NOT_FOUND, "No queue entry for this challenge")
    })?;

    let status: String = row.get("status");
    if status != ENTRY_WAITING {
        state.perf.cancel_rejected.fetch_add(1, Ordering::Relaxed);
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "Entry is already matched and cannot be cancelled",
        ));
    }
    let entry = QueueEntryRow {
        id: row.get("id"),
        user_id,
        stake_amount: row.get("stake_amount"),
    };

    sqlx::query("UPDATE queue_entries SET status = $1 WHERE id = $2")
        .bind(ENTRY_CANCELLED)
        .bind(entry.id)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?;
    let credited = release_entry_stake(
        &mut tx,
        &entry,
        challenge_id,
        TX_QUEUE_CANCEL_REFUND,
        format!("Refund for leaving challenge {challenge_id} queue"),
    )
    .await?;
    tx.commit().await.map_err(ApiError::db)?;

    state.perf.cancel_confirmed.fetch_add(1, Ordering::Relaxed);
    if credited {
        state.perf.refunds_issued.fetch_add(1, Ordering::Relaxed);
    }
    state.emit(EngineEvent::QueueCancelled {
        challenge_id,
        user_id,
        refunded: entry.stake_amount,
    });
    Ok(entry.stake_amount)
}

/// Close an open challenge past its deadline. Waiting entries are refunded;
/// matched pairs stay in escrow until the challenge is settled.
pub(crate) async fn expire_challenge(state: &AppState, challenge_id: i64) -> Result<i64, ApiError> {
    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let updated = sqlx::query("UPDATE challenges SET status = $1 WHERE id = $2 AND status = $3")
        .bind(CHALLENGE_EXPIRED)
        .bind(challenge_id)
        .bind(CHALLENGE_OPEN)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?
        .rows_affected();
    if updated == 0 {
        return Err(ApiError::new(StatusCode::CONFLICT, "Challenge is not open"));
    }

    let waiting = sqlx::query(
        "SELECT id, user_id, stake_amount FROM queue_entries \
         WHERE challenge_id = $1 AND status = $2 ORDER BY id FOR UPDATE",
    )
    .bind(challenge_id)
    .bind(ENTRY_WAITING)
    .fetch_all(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    let mut refunded = 0i64;
    for row in &waiting {
        let entry = QueueEntryRow {
            id: row.get("id"),
            user_id: row.get("user_id"),
            stake_amount: row.get("stake_amount"),
        };
        sqlx::query("UPDATE queue_entries SET status = $1 WHERE id = $2")
            .bind(ENTRY_REFUNDED)
            .bind(entry.id)
            .execute(&mut *tx)
            .await
            .map_err(ApiError::db)?;
        if release_entry_stake(
            &mut tx,
            &entry,
            challenge_id,
            TX_EXPIRED_REFUND,
            format!("Refund for expired challenge {challenge_id}"),
        )
        .await?
        {
            refunded += 1;
        }
    }
    tx.commit().await.map_err(ApiError::db)?;

    state.perf.challenges_expired.fetch_add(1, Ordering::Relaxed);
    state
        .perf
        .refunds_issued
        .fetch_add(refunded as u64, Ordering::Relaxed);
    state.emit(EngineEvent::ChallengeExpired {
        challenge_id,
        refunded_entries: refunded,
    });
    Ok(refunded)
}

/// Expire every open challenge whose deadline has passed. Used by the
/// background sweep; per-challenge failures are logged and skipped.
pub(crate) async fn sweep_expired_challenges(state: &AppState) -> Result<usize, ApiError> {
    let due: Vec<i64> = sqlx::query_scalar(
        "SELECT id FROM challenges WHERE status = $1 AND deadline IS NOT NULL AND deadline <= now() \
         ORDER BY deadline LIMIT 100",
    )
    .bind(CHALLENGE_OPEN)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let mut expired = 0usize;
    for challenge_id in due {
        match expire_challenge(state, challenge_id).await {
            Ok(_) => expired += 1,
            Err(e) if e.status == StatusCode::CONFLICT => {}
            Err(e) => {
                eprintln!(
                    "[queue] expire_failed challenge_id={} error={}",
                    challenge_id, e.detail
                );
            }
        }
    }
    Ok(expired)
}

// ===== Settlement =====

pub(crate) async fn settle_challenge(
    state: &AppState,
    challenge_id: i64,
    outcome: Outcome,
) -> Result<SettleOutcome, ApiError> {
    state.perf.settle_requests.fetch_add(1, Ordering::Relaxed);
    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let challenge = sqlx::query("SELECT status, result FROM challenges WHERE id = $1 FOR UPDATE")
        .bind(challenge_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(ApiError::db)?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Challenge not found"))?;
    let status: String = challenge.get("status");
    if status == CHALLENGE_SETTLED {
        // Idempotent re-settle: report the stored result and existing job.
        // A repeat call with a different result is a conflict, not a no-op.
        let stored: Option<String> = challenge.get("result");
        let outcome = check_recorded_result(stored.as_deref(), outcome)?;
        drop(tx);
        let job = fetch_job_by_challenge(state, challenge_id).await?;
        return Ok(SettleOutcome {
            outcome,
            job,
            refunded_entries: 0,
            partner: settle_partner_fees(state, challenge_id).await?,
        });
    }

    sqlx::query("UPDATE challenges SET status = $1, result = $2, settled_at = now() WHERE id = $3")
        .bind(CHALLENGE_SETTLED)
        .bind(outcome.as_str())
        .bind(challenge_id)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?;

    let matched_rows = sqlx::query(
        "SELECT id, user_id, side, stake_amount FROM queue_entries \
         WHERE challenge_id = $1 AND status = $2 \
         ORDER BY matched_at, id FOR UPDATE",
    )
    .bind(challenge_id)
    .bind(ENTRY_MATCHED)
    .fetch_all(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    let mut matched = Vec::with_capacity(matched_rows.len());
    for r in &matched_rows {
        matched.push(MatchedStake {
            entry_id: r.get("id"),
            user_id: r.get("user_id"),
            side: r.get::<String, _>("side").parse()?,
            stake_amount: r.get("stake_amount"),
        });
    }
    let total_pool: i64 = matched.iter().map(|m| m.stake_amount).sum();

    let mut refunded = 0i64;
    let mut job_summary: Option<PayoutJobSummary> = None;

    match outcome {
        Outcome::Draw => {
            // No fee on a draw; every matched stake goes back to its owner.
            for m in &matched {
                let entry = QueueEntryRow {
                    id: m.entry_id,
                    user_id: m.user_id,
                    stake_amount: m.stake_amount,
                };
                sqlx::query("UPDATE queue_entries SET status = $1 WHERE id = $2")
                    .bind(ENTRY_REFUNDED)
                    .bind(entry.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(ApiError::db)?;
                if release_entry_stake(
                    &mut tx,
                    &entry,
                    challenge_id,
                    TX_DRAW_REFUND,
                    format!("Draw refund for challenge {challenge_id}"),
                )
                .await?
                {
                    refunded += 1;
                }
            }
        }
        Outcome::Winner(winning_side) => {
            let platform_fee = platform_fee_minor(total_pool, state.cfg.fees.platform_fee_bps);
            let winner_pool = total_pool - platform_fee;
            let payouts = derive_winner_payouts(&matched, winning_side, winner_pool);

            if !payouts.is_empty() {
                let job_id = Uuid::new_v4();

                // One job per challenge; a concurrent settle loses the
                // insert race and reuses the existing job.
                let inserted: Option<Uuid> = sqlx::query_scalar(
                    "INSERT INTO payout_jobs \
                     (id, challenge_id, status, total_winners, total_pool, platform_fee, winner_pool) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7) \
                     ON CONFLICT (challenge_id) DO NOTHING RETURNING id",
                )
                .bind(job_id)
                .bind(challenge_id)
                .bind(JOB_QUEUED)
                .bind(payouts.len() as i32)
                .bind(total_pool)
                .bind(platform_fee)
                .bind(winner_pool)
                .fetch_optional(&mut *tx)
                .await
                .map_err(ApiError::db)?;

                if inserted.is_some() {
                    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                        "INSERT INTO payout_entries (id, job_id, challenge_id, user_id, amount, status) ",
                    );
                    qb.push_values(payouts.iter(), |mut b, p| {
                        b.push_bind(Uuid::new_v4())
                            .push_bind(job_id)
                            .push_bind(challenge_id)
                            .push_bind(p.user_id)
                            .push_bind(p.amount)
                            .push_bind(PAYOUT_PENDING);
                    });
                    qb.build().execute(&mut *tx).await.map_err(ApiError::db)?;
                    job_summary = Some(PayoutJobSummary {
                        id: job_id,
                        challenge_id,
                        status: JOB_QUEUED.to_string(),
                        total_winners: payouts.len() as i32,
                        total_pool,
                        platform_fee,
                        winner_pool,
                    });
                }
            }
        }
    }

    tx.commit().await.map_err(ApiError::db)?;

    if job_summary.is_some() {
        state.perf.payout_jobs_created.fetch_add(1, Ordering::Relaxed);
    }
    state
        .perf
        .refunds_issued
        .fetch_add(refunded as u64, Ordering::Relaxed);

    // Partner fees settle after the challenge commit; the path is
    // idempotent, so a crash here is recovered by calling settle again.
    let partner = settle_partner_fees(state, challenge_id).await?;

    if let Some(job) = &job_summary {
        state.enqueue_payout_job(job.id);
    }
    state.emit(EngineEvent::ChallengeSettled {
        challenge_id,
        outcome: outcome.as_str().to_string(),
        payout_job_id: job_summary.as_ref().map(|j| j.id),
    });

    Ok(SettleOutcome {
        outcome,
        job: job_summary,
        refunded_entries: refunded,
        partner,
    })
}

async fn fetch_job_by_challenge(
    state: &AppState,
    challenge_id: i64,
) -> Result<Option<PayoutJobSummary>, ApiError> {
    let row = sqlx::query(
        "SELECT id, challenge_id, status, total_winners, total_pool, platform_fee, winner_pool \
         FROM payout_jobs WHERE challenge_id = $1",
    )
    .bind(challenge_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;
    Ok(row.map(|r| PayoutJobSummary {
        id: r.get("id"),
        challenge_id: r.get("challenge_id"),
        status: r.get("status"),
        total_winners: r.get("total_winners"),
        total_pool: r.get("total_pool"),
        platform_fee: r.get("platform_fee"),
        winner_pool: r.get("winner_pool"),
    }))
}

// ===== Payout pipeline =====

#[derive(Debug, Clone)]
pub(crate) struct PayoutEntryRow {
    pub(crate) id: Uuid,
    pub(crate) job_id: Uuid,
    pub(crate) challenge_id: i64,
    pub(crate) user_id: i64,
    pub(crate) amount: i64,
}

pub(crate) enum PayoutSliceOutcome {
    NotFound,
    AlreadyTerminal,
    Completed { completed: i64, failed: i64 },
    Progress { processed: i64, batch: usize },
}

pub(crate) async fn pending_payout_jobs(state: &AppState) -> Result<Vec<Uuid>, ApiError> {
    let ids: Vec<Uuid> = sqlx::query_scalar(
        "SELECT id FROM payout_jobs WHERE status IN ($1, $2) ORDER BY created_at",
    )
    .bind(JOB_QUEUED)
    .bind(JOB_RUNNING)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;
    Ok(ids)
}

/// Drive one batch of a payout job. Queued jobs are started, pending
/// entries are processed one at a time with per-entry isolation, and the
/// job completes only when no pending entries remain.
pub(crate) async fn process_payout_job_slice(
    state: &AppState,
    job_id: Uuid,
) -> Result<PayoutSliceOutcome, ApiError> {
    let job = sqlx::query(
        "SELECT j.status, (c.id IS NOT NULL) AS challenge_exists \
         FROM payout_jobs j LEFT JOIN challenges c ON c.id = j.challenge_id \
         WHERE j.id = $1",
    )
    .bind(job_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;
    let Some(job) = job else {
        return Ok(PayoutSliceOutcome::NotFound);
    };
    let status: String = job.get("status");
    if status == JOB_COMPLETED || status == JOB_FAILED {
        return Ok(PayoutSliceOutcome::AlreadyTerminal);
    }
    // Job-level failure is reserved for a job that cannot be processed at
    // all. Entry-level errors never take this path.
    if !job.get::<bool, _>("challenge_exists") {
        mark_job_failed(state, job_id, "challenge record is gone").await?;
        return Ok(PayoutSliceOutcome::AlreadyTerminal);
    }
    if status == JOB_QUEUED {
        sqlx::query(
            "UPDATE payout_jobs SET status = $1, started_at = now() WHERE id = $2 AND status = $3",
        )
        .bind(JOB_RUNNING)
        .bind(job_id)
        .bind(JOB_QUEUED)
        .execute(&state.db)
        .await
        .map_err(ApiError::db)?;
    }

    let entries = sqlx::query(
        "SELECT id, job_id, challenge_id, user_id, amount FROM payout_entries \
         WHERE job_id = $1 AND status = $2 ORDER BY created_at, id LIMIT $3",
    )
    .bind(job_id)
    .bind(PAYOUT_PENDING)
    .bind(state.cfg.worker.payout_batch_size)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    if entries.is_empty() {
        // Zero pending entries is the sole completion condition. Failed
        // entries stay on the books for manual re-drive.
        let (completed, failed) = terminal_entry_counts(state, job_id).await?;
        sqlx::query(
            "UPDATE payout_jobs SET status = $1, processed_winners = $2, completed_at = now() \
             WHERE id = $3 AND status = $4",
        )
        .bind(JOB_COMPLETED)
        .bind((completed + failed) as i32)
        .bind(job_id)
        .bind(JOB_RUNNING)
        .execute(&state.db)
        .await
        .map_err(ApiError::db)?;
        state.perf.payout_jobs_completed.fetch_add(1, Ordering::Relaxed);
        state.emit(EngineEvent::PayoutJobCompleted {
            job_id,
            completed_entries: completed,
            failed_entries: failed,
        });
        return Ok(PayoutSliceOutcome::Completed { completed, failed });
    }

    let batch = entries.len();
    for row in entries {
        let entry = PayoutEntryRow {
            id: row.get("id"),
            job_id: row.get("job_id"),
            challenge_id: row.get("challenge_id"),
            user_id: row.get("user_id"),
            amount: row.get("amount"),
        };
        match process_payout_entry(state, &entry).await {
            Ok(true) => {
                state
                    .perf
                    .payout_entries_completed
                    .fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => {}
            Err(e) => {
                // Entry failure is isolated: mark it and keep going.
                eprintln!(
                    "[payout] entry_failed job_id={} entry_id={} user_id={} error={}",
                    job_id, entry.id, entry.user_id, e.detail
                );
                mark_entry_failed(state, entry.id, &e.detail).await?;
                state
                    .perf
                    .payout_entries_failed
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    let (completed, failed) = terminal_entry_counts(state, job_id).await?;
    let processed = completed + failed;
    sqlx::query("UPDATE payout_jobs SET processed_winners = $1 WHERE id = $2")
        .bind(processed as i32)
        .bind(job_id)
        .execute(&state.db)
        .await
        .map_err(ApiError::db)?;
    state.perf.payout_batches.fetch_add(1, Ordering::Relaxed);
    Ok(PayoutSliceOutcome::Progress { processed, batch })
}

async fn terminal_entry_counts(state: &AppState, job_id: Uuid) -> Result<(i64, i64), ApiError> {
    let row = sqlx::query(
        "SELECT \
           COUNT(*) FILTER (WHERE status = $2)::bigint AS completed, \
           COUNT(*) FILTER (WHERE status = $3)::bigint AS failed \
         FROM payout_entries WHERE job_id = $1",
    )
    .bind(job_id)
    .bind(PAYOUT_COMPLETED)
    .bind(PAYOUT_FAILED)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;
    Ok((row.get("completed"), row.get("failed")))
}

/// Credit one winner. The guard update claims the entry first, so a crash
/// after commit can never pay twice, and a concurrent worker sees zero
/// rows and skips.
async fn process_payout_entry(state: &AppState, entry: &PayoutEntryRow) -> Result<bool, ApiError> {
    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let claimed = sqlx::query(
        "UPDATE payout_entries SET status = $1, processed_at = now() \
         WHERE id = $2 AND status = $3",
    )
    .bind(PAYOUT_COMPLETED)
    .bind(entry.id)
    .bind(PAYOUT_PENDING)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?
    .rows_affected();
    if claimed == 0 {
        return Ok(false);
    }

    sqlx::query(
        "INSERT INTO wallet_accounts (user_id, balance) VALUES ($1, $2) \
         ON CONFLICT (user_id) DO UPDATE \
         SET balance = wallet_accounts.balance + EXCLUDED.balance, updated_at = now()",
    )
    .bind(entry.user_id)
    .bind(entry.amount)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    sqlx::query(
        "INSERT INTO wallet_transactions (user_id, tx_type, amount, challenge_id, description) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(entry.user_id)
    .bind(TX_CHALLENGE_PAYOUT)
    .bind(entry.amount)
    .bind(entry.challenge_id)
    .bind(format!("Challenge payout - job {}", entry.job_id))
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    state.emit(EngineEvent::PayoutDelivered {
        challenge_id: entry.challenge_id,
        user_id: entry.user_id,
        amount: entry.amount,
    });
    Ok(true)
}

async fn mark_job_failed(state: &AppState, job_id: Uuid, error: &str) -> Result<(), ApiError> {
    sqlx::query(
        "UPDATE payout_jobs SET status = $1, error = $2, completed_at = now() \
         WHERE id = $3 AND status IN ($4, $5)",
    )
    .bind(JOB_FAILED)
    .bind(error)
    .bind(job_id)
    .bind(JOB_QUEUED)
    .bind(JOB_RUNNING)
    .execute(&state.db)
    .await
    .map_err(ApiError::db)?;
    eprintln!("[payout] job_failed job_id={} error={}", job_id, error);
    Ok(())
}

async fn mark_entry_failed(state: &AppState, entry_id: Uuid, error: &str) -> Result<(), ApiError> {
    sqlx::query(
        "UPDATE payout_entries SET status = $1, error = $2, processed_at = now() \
         WHERE id = $3 AND status = $4",
    )
    .bind(PAYOUT_FAILED)
    .bind(error)
    .bind(entry_id)
    .bind(PAYOUT_PENDING)
    .execute(&state.db)
    .await
    .map_err(ApiError::db)?;
    Ok(())
}

/// Manual re-drive: flip failed entries of a job back to pending and
/// requeue the job. Failed entries are never retried automatically.
pub(crate) async fn retry_failed_entries(state: &AppState, job_id: Uuid) -> Result<u64, ApiError> {
    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let exists: Option<Uuid> =
        sqlx::query_scalar("SELECT id FROM payout_jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(ApiError::db)?;
    if exists.is_none() {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "Payout job not found"));
    }

    let reset = sqlx::query(
        "UPDATE payout_entries SET status = $1, error = NULL, processed_at = NULL \
         WHERE job_id = $2 AND status = $3",
    )
    .bind(PAYOUT_PENDING)
    .bind(job_id)
    .bind(PAYOUT_FAILED)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?
    .rows_affected();

    if reset > 0 {
        sqlx::query(
            "UPDATE payout_jobs SET status = $1, completed_at = NULL, error = NULL WHERE id = $2",
        )
        .bind(JOB_QUEUED)
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?;
    }
    tx.commit().await.map_err(ApiError::db)?;

    if reset > 0 {
        state.enqueue_payout_job(job_id);
    }
    Ok(reset)
}

// ===== Partner fee settlement =====

pub(crate) async fn settle_partner_fees(
    state: &AppState,
    challenge_id: i64,
) -> Result<Option<PartnerSettlement>, ApiError> {
    let link = sqlx::query(
        "SELECT pc.partner_program_id, pp.fee_share_bps \
         FROM partner_challenges pc \
         JOIN partner_programs pp ON pp.id = pc.partner_program_id \
         WHERE pc.challenge_id = $1",
    )
    .bind(challenge_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;
    let Some(link) = link else {
        return Ok(None);
    };
    let partner_program_id: i64 = link.get("partner_program_id");
    let fee_share_bps: i32 = link.get("fee_share_bps");

    // Re-settling only re-attempts the wallet credit; the stored amounts
    // are never recomputed.
    if let Some(existing) = fetch_settlement(state, challenge_id).await? {
        let credited = credit_settlement_to_partner_wallet(state, &existing).await?;
        if !credited {
            state
                .perf
                .partner_credits_deduped
                .fetch_add(1, Ordering::Relaxed);
        }
        state.emit(EngineEvent::PartnerFeeSettled {
            partner_program_id: existing.partner_program_id,
            challenge_id,
            partner_fee: existing.partner_fee,
            already_existed: true,
        });
        return Ok(Some(PartnerSettlement {
            already_existed: true,
            ..existing
        }));
    }

    // Draw-refunded entries keep their matched_at and still count toward
    // the pool; expiry refunds of waiting entries never matched and don't.
    let pool_rows = sqlx::query(
        "SELECT stake_amount, status, matched_at FROM queue_entries \
         WHERE challenge_id = $1 AND status IN ($2, $3)",
    )
    .bind(challenge_id)
    .bind(ENTRY_MATCHED)
    .bind(ENTRY_REFUNDED)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;
    let total_pool: i64 = pool_rows
        .iter()
        .filter(|r| {
            stake_in_matched_pool(
                r.get::<String, _>("status").as_str(),
                r.get::<Option<DateTime<Utc>>, _>("matched_at").is_some(),
            )
        })
        .map(|r| r.get::<i64, _>("stake_amount"))
        .sum();
    let platform_fee = platform_fee_minor(total_pool, state.cfg.fees.platform_fee_bps);
    let partner_fee = partner_fee_minor(platform_fee, fee_share_bps as i64);

    let settlement_id = Uuid::new_v4();
    let inserted: Option<Uuid> = sqlx::query_scalar(
        "INSERT INTO partner_fee_settlements \
         (id, partner_program_id, challenge_id, total_pool, platform_fee, partner_fee, fee_share_bps) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         ON CONFLICT (challenge_id) DO NOTHING RETURNING id",
    )
    .bind(settlement_id)
    .bind(partner_program_id)
    .bind(challenge_id)
    .bind(total_pool)
    .bind(platform_fee)
    .bind(partner_fee)
    .bind(fee_share_bps)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;

    let settlement = match inserted {
        Some(id) => {
            sqlx::query(
                "UPDATE partner_challenges SET settlement_status = 'settled' WHERE challenge_id = $1",
            )
            .bind(challenge_id)
            .execute(&state.db)
            .await
            .map_err(ApiError::db)?;
            state.perf.partner_settlements.fetch_add(1, Ordering::Relaxed);
            PartnerSettlement {
                id,
                partner_program_id,
                challenge_id,
                partner_fee,
                already_existed: false,
            }
        }
        // Lost the insert race; trust the stored row.
        None => fetch_settlement(state, challenge_id)
            .await?
            .map(|s| PartnerSettlement {
                already_existed: true,
                ..s
            })
            .ok_or_else(|| {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "settlement row vanished")
            })?,
    };

    let credited = credit_settlement_to_partner_wallet(state, &settlement).await?;
    if !credited {
        state
            .perf
            .partner_credits_deduped
            .fetch_add(1, Ordering::Relaxed);
    }
    state.emit(EngineEvent::PartnerFeeSettled {
        partner_program_id: settlement.partner_program_id,
        challenge_id,
        partner_fee: settlement.partner_fee,
        already_existed: settlement.already_existed,
    });
    Ok(Some(settlement))
}

async fn fetch_settlement(
    state: &AppState,
    challenge_id: i64,
) -> Result<Option<PartnerSettlement>, ApiError> {
    let row = sqlx::query(
        "SELECT id, partner_program_id, partner_fee FROM partner_fee_settlements \
         WHERE challenge_id = $1",
    )
    .bind(challenge_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;
    Ok(row.map(|r| PartnerSettlement {
        id: r.get("id"),
        partner_program_id: r.get("partner_program_id"),
        challenge_id,
        partner_fee: r.get("partner_fee"),
        already_existed: false,
    }))
}

/// Credit a settlement to the partner wallet exactly once. The ledger's
/// unique (settlement_id, tx_type) turns a duplicate attempt into a
/// successful no-op: 23505 rolls the transaction back and returns false.
async fn credit_settlement_to_partner_wallet(
    state: &AppState,
    settlement: &PartnerSettlement,
) -> Result<bool, ApiError> {
    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    sqlx::query(
        "INSERT INTO partner_wallets (partner_program_id) VALUES ($1) \
         ON CONFLICT (partner_program_id) DO NOTHING",
    )
    .bind(settlement.partner_program_id)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    sqlx::query("SELECT balance FROM partner_wallets WHERE partner_program_id = $1 FOR UPDATE")
        .bind(settlement.partner_program_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(ApiError::db)?;

    let insert_res = sqlx::query(
        "INSERT INTO partner_wallet_transactions \
         (partner_program_id, tx_type, amount, settlement_id, meta) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(settlement.partner_program_id)
    .bind(PTX_SETTLEMENT_CREDIT)
    .bind(settlement.partner_fee)
    .bind(settlement.id)
    .bind(serde_json::json!({ "challenge_id": settlement.challenge_id }))
    .execute(&mut *tx)
    .await;
    if let Err(e) = insert_res {
        if is_unique_violation(&e) {
            return Ok(false);
        }
        return Err(ApiError::db(e));
    }

    sqlx::query(
        "UPDATE partner_wallets \
         SET balance = balance + $1, total_credited = total_credited + $1, updated_at = now() \
         WHERE partner_program_id = $2",
    )
    .bind(settlement.partner_fee)
    .bind(settlement.partner_program_id)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;
    Ok(true)
}

// ===== Partner withdrawals =====

#[derive(Debug, Clone)]
pub(crate) struct WithdrawalDecision {
    pub(crate) withdrawal_id: Uuid,
    pub(crate) partner_program_id: i64,
    pub(crate) amount: i64,
    pub(crate) approved: bool,
}

async fn pending_withdrawal_total(
    tx: &mut Transaction<'_, Postgres>,
    partner_program_id: i64,
    exclude: Option<Uuid>,
) -> Result<i64, ApiError> {
    let total: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(amount), 0)::bigint FROM partner_withdrawals \
         WHERE partner_program_id = $1 AND status = $2 AND ($3::uuid IS NULL OR id <> $3)",
    )
    .bind(partner_program_id)
    .bind(WD_PENDING)
    .bind(exclude)
    .fetch_one(&mut **tx)
    .await
    .map_err(ApiError::db)?;
    Ok(total)
}

pub(crate) async fn request_partner_withdrawal(
    state: &AppState,
    partner_program_id: i64,
    amount: i64,
) -> Result<Uuid, ApiError> {
    if amount <= 0 {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "amount must be > 0"));
    }
    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let balance: i64 = sqlx::query_scalar(
        "SELECT balance FROM partner_wallets WHERE partner_program_id = $1 FOR UPDATE",
    )
    .bind(partner_program_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Partner wallet not found"))?;

    let reserved = pending_withdrawal_total(&mut tx, partner_program_id, None).await?;
    if amount > balance - reserved {
        return Err(ApiError::new(StatusCode::PAYMENT_REQUIRED, "Insufficient funds"));
    }

    let withdrawal_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO partner_withdrawals (id, partner_program_id, amount, status) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(withdrawal_id)
    .bind(partner_program_id)
    .bind(amount)
    .bind(WD_PENDING)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;
    tx.commit().await.map_err(ApiError::db)?;
    Ok(withdrawal_id)
}

/// Approve or reject a pending withdrawal. Approval re-validates the
/// balance net of other pending requests at decision time, then debits the
/// wallet and writes the ledger row in the same transaction.
pub(crate) async fn decide_partner_withdrawal(
    state: &AppState,
    withdrawal_id: Uuid,
    approve: bool,
    reason: Option<String>,
) -> Result<WithdrawalDecision, ApiError> {
    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let row = sqlx::query(
        "SELECT partner_program_id, amount, status FROM partner_withdrawals \
         WHERE id = $1 FOR UPDATE",
    )
    .bind(withdrawal_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Withdrawal not found"))?;

    let status: String = row.get("status");
    if status != WD_PENDING {
        return Err(ApiError::new(StatusCode::CONFLICT, "Withdrawal already decided"));
    }
    let partner_program_id: i64 = row.get("partner_program_id");
    let amount: i64 = row.get("amount");

    if approve {
        let balance: i64 = sqlx::query_scalar(
            "SELECT balance FROM partner_wallets WHERE partner_program_id = $1 FOR UPDATE",
        )
        .bind(partner_program_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(ApiError::db)?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Partner wallet not found"))?;
        let reserved =
            pending_withdrawal_total(&mut tx, partner_program_id, Some(withdrawal_id)).await?;
        if amount > balance - reserved {
            return Err(ApiError::new(
                StatusCode::CONFLICT,
                "Balance no longer covers this withdrawal",
            ));
        }

        sqlx::query(
            "UPDATE partner_wallets \
             SET balance = balance - $1, total_withdrawn = total_withdrawn + $1, updated_at = now() \
             WHERE partner_program_id = $2",
        )
        .bind(amount)
        .bind(partner_program_id)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?;

        sqlx::query(
            "INSERT INTO partner_wallet_transactions \
             (partner_program_id, tx_type, amount, withdrawal_id, meta) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(partner_program_id)
        .bind(PTX_WITHDRAWAL_DEBIT)
        .bind(-amount)
        .bind(withdrawal_id)
        .bind(serde_json::json!({}))
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?;
    }

    sqlx::query(
        "UPDATE partner_withdrawals SET status = $1, reason = $2, decided_at = now() WHERE id = $3",
    )
    .bind(if approve { WD_APPROVED } else { WD_REJECTED })
    .bind(reason)
    .bind(withdrawal_id)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;
    tx.commit().await.map_err(ApiError::db)?;

    state.emit(EngineEvent::WithdrawalDecided {
        withdrawal_id,
        partner_program_id,
        approved: approve,
        amount,
    });
    Ok(WithdrawalDecision {
        withdrawal_id,
        partner_program_id,
        amount,
        approved: approve,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_outcomes_serialize_with_state_tags() {
        let matched = JoinOutcome::Matched {
            entry_id: 10,
            opponent_user_id: 2,
            stake_amount: 1000,
        };
        let v = serde_json::to_value(&matched).unwrap();
        assert_eq!(v["state"], "MATCHED");
        assert_eq!(v["opponent_user_id"], 2);

        let waiting = JoinOutcome::Waiting {
            entry_id: 11,
            position: 3,
            stake_amount: 1000,
        };
        let v = serde_json::to_value(&waiting).unwrap();
        assert_eq!(v["state"], "WAITING");
        assert_eq!(v["position"], 3);
    }

    #[test]
    fn job_summary_serializes_pool_breakdown() {
        let job = PayoutJobSummary {
            id: Uuid::nil(),
            challenge_id: 1,
            status: "queued".to_string(),
            total_winners: 2,
            total_pool: 4000,
            platform_fee: 200,
            winner_pool: 3800,
        };
        let v = serde_json::to_value(&job).unwrap();
        assert_eq!(v["total_pool"], 4000);
        assert_eq!(v["platform_fee"], 200);
        assert_eq!(v["winner_pool"], 3800);
    }
}

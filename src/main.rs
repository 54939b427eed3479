use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use rust_decimal::Decimal;
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::Row;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

mod config;
mod engine;
mod error;
mod state;
mod store;
mod tasks;

use crate::config::load_config;
use crate::engine::{Outcome, Side, CHALLENGE_OPEN, ENTRY_MATCHED, ENTRY_WAITING, TX_DEV_TOPUP};
use crate::error::ApiError;
use crate::state::{AppState, EngineEvent, PerfCounters};
use crate::store::{
    cancel_from_queue, decide_partner_withdrawal, expire_challenge, join_challenge,
    request_partner_withdrawal, retry_failed_entries, settle_challenge,
};
use crate::tasks::start_background_tasks;

const MAX_TX_HISTORY: i64 = 200;

/// Minor units to a display amount with two decimal places.
fn minor_to_decimal(amount: i64) -> Decimal {
    Decimal::new(amount, 2)
}

#[derive(Debug, Deserialize)]
struct ChallengeCreate {
    title: String,
    stake_amount: i64,
    deadline: Option<DateTime<Utc>>,
    partner_program_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct JoinRequest {
    user_id: i64,
    side: String,
}

#[derive(Debug, Deserialize)]
struct CancelRequest {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct SettleRequest {
    outcome: String,
}

#[derive(Debug, Deserialize)]
struct UserCreate {
    username: String,
}

#[derive(Debug, Deserialize)]
struct DevTopupRequest {
    user_id: i64,
    amount: i64,
}

#[derive(Debug, Deserialize)]
struct PartnerProgramCreate {
    name: String,
    fee_share_bps: i32,
}

#[derive(Debug, Deserialize)]
struct WithdrawalRequest {
    amount: i64,
}

#[derive(Debug, Deserialize)]
struct WithdrawalReject {
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<i64>,
}

async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.db)
        .await
        .map_err(ApiError::db)?;
    Ok(Json(serde_json::json!({"status": "ok"})))
}

// ===== Challenges =====

async fn create_challenge(
    State(state): State<AppState>,
    Json(req): Json<ChallengeCreate>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if req.stake_amount <= 0 {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "stake_amount must be > 0"));
    }
    if req.title.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "title must not be empty"));
    }
    if let Some(deadline) = req.deadline {
        if deadline <= Utc::now() {
            return Err(ApiError::new(StatusCode::BAD_REQUEST, "deadline must be in the future"));
        }
    }
    if let Some(pid) = req.partner_program_id {
        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM partner_programs WHERE id = $1")
            .bind(pid)
            .fetch_optional(&state.db)
            .await
            .map_err(ApiError::db)?;
        if exists.is_none() {
            return Err(ApiError::new(StatusCode::NOT_FOUND, "Partner program not found"));
        }
    }

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;
    let challenge_id: i64 = sqlx::query_scalar(
        "INSERT INTO challenges (title, stake_amount, status, partner_program_id, deadline) \
         VALUES ($1, $2, $3, $4, $5) RETURNING id",
    )
    .bind(req.title.trim())
    .bind(req.stake_amount)
    .bind(CHALLENGE_OPEN)
    .bind(req.partner_program_id)
    .bind(req.deadline)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;
    if let Some(pid) = req.partner_program_id {
        sqlx::query(
            "INSERT INTO partner_challenges (partner_program_id, challenge_id) VALUES ($1, $2)",
        )
        .bind(pid)
        .bind(challenge_id)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?;
    }
    tx.commit().await.map_err(ApiError::db)?;

    Ok(Json(serde_json::json!({
        "id": challenge_id,
        "status": CHALLENGE_OPEN,
        "stake_amount": req.stake_amount,
    })))
}

async fn get_challenge_overview(
    State(state): State<AppState>,
    Path(challenge_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let challenge = sqlx::query(
        "SELECT id, title, stake_amount, status, result, partner_program_id, deadline, created_at, settled_at \
         FROM challenges WHERE id = $1",
    )
    .bind(challenge_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Challenge not found"))?;

    let counts = sqlx::query(
        "SELECT \
           COUNT(*) FILTER (WHERE status = $2 AND side = 'yes')::bigint AS waiting_yes, \
           COUNT(*) FILTER (WHERE status = $2 AND side = 'no')::bigint AS waiting_no, \
           COUNT(*) FILTER (WHERE status = $3)::bigint AS matched, \
           COALESCE(SUM(stake_amount) FILTER (WHERE status = $3), 0)::bigint AS matched_pool \
         FROM queue_entries WHERE challenge_id = $1",
    )
    .bind(challenge_id)
    .bind(ENTRY_WAITING)
    .bind(ENTRY_MATCHED)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    let job = sqlx::query(
        "SELECT id, status, total_winners, processed_winners FROM payout_jobs WHERE challenge_id = $1",
    )
    .bind(challenge_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;

    let stake: i64 = challenge.get("stake_amount");
    Ok(Json(serde_json::json!({
        "id": challenge.get::<i64, _>("id"),
        "title": challenge.get::<String, _>("title"),
        "status": challenge.get::<String, _>("status"),
        "result": challenge.get::<Option<String>, _>("result"),
        "stake_amount": stake,
        "stake_display": minor_to_decimal(stake),
        "partner_program_id": challenge.get::<Option<i64>, _>("partner_program_id"),
        "deadline": challenge.get::<Option<DateTime<Utc>>, _>("deadline"),
        "created_at": challenge.get::<DateTime<Utc>, _>("created_at"),
        "settled_at": challenge.get::<Option<DateTime<Utc>>, _>("settled_at"),
        "queue": {
            "waiting_yes": counts.get::<i64, _>("waiting_yes"),
            "waiting_no": counts.get::<i64, _>("waiting_no"),
            "matched_entries": counts.get::<i64, _>("matched"),
            "matched_pool": counts.get::<i64, _>("matched_pool"),
        },
        "payout_job": job.map(|j| serde_json::json!({
            "id": j.get::<Uuid, _>("id"),
            "status": j.get::<String, _>("status"),
            "total_winners": j.get::<i32, _>("total_winners"),
            "processed_winners": j.get::<i32, _>("processed_winners"),
        })),
    })))
}

async fn join_challenge_queue(
    State(state): State<AppState>,
    Path(challenge_id): Path<i64>,
    Json(req): Json<JoinRequest>,
) -> Result<Json<store::JoinOutcome>, ApiError> {
    let side: Side = req.side.parse()?;
    let outcome = join_challenge(&state, challenge_id, req.user_id, side).await?;
    Ok(Json(outcome))
}

async fn cancel_challenge_queue(
    State(state): State<AppState>,
    Path(challenge_id): Path<i64>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let refunded = cancel_from_queue(&state, challenge_id, req.user_id).await?;
    Ok(Json(serde_json::json!({
        "cancelled": true,
        "refunded": refunded,
        "refunded_display": minor_to_decimal(refunded),
    })))
}

async fn get_queue_status(
    State(state): State<AppState>,
    Path(challenge_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM challenges WHERE id = $1")
        .bind(challenge_id)
        .fetch_optional(&state.db)
        .await
        .map_err(ApiError::db)?;
    if exists.is_none() {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "Challenge not found"));
    }

    let rows = sqlx::query(
        "SELECT side, COUNT(*)::bigint AS waiting FROM queue_entries \
         WHERE challenge_id = $1 AND status = $2 GROUP BY side",
    )
    .bind(challenge_id)
    .bind(ENTRY_WAITING)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let mut waiting_yes = 0i64;
    let mut waiting_no = 0i64;
    for r in rows {
        let side: String = r.get("side");
        let n: i64 = r.get("waiting");
        if side == "yes" {
            waiting_yes = n;
        } else {
            waiting_no = n;
        }
    }
    let matched: i64 = sqlx::query_scalar(
        "SELECT COUNT(*)::bigint FROM queue_entries WHERE challenge_id = $1 AND status = $2",
    )
    .bind(challenge_id)
    .bind(ENTRY_MATCHED)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(serde_json::json!({
        "challenge_id": challenge_id,
        "waiting_yes": waiting_yes,
        "waiting_no": waiting_no,
        "matched_entries": matched,
    })))
}

async fn get_user_queue_status(
    State(state): State<AppState>,
    Path((challenge_id, user_id)): Path<(i64, i64)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let row = sqlx::query(
        "SELECT id, side, status, position, stake_amount, matched_with, created_at, matched_at \
         FROM queue_entries WHERE challenge_id = $1 AND user_id = $2 \
         ORDER BY id DESC LIMIT 1",
    )
    .bind(challenge_id)
    .bind(user_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "No queue entry for this challenge"))?;

    let status: String = row.get("status");
    // A waiting entry's live position is recomputed from entries ahead of
    // it, not the position recorded at insert time.
    let live_position: Option<i64> = if status == ENTRY_WAITING {
        let entry_id: i64 = row.get("id");
        let side: String = row.get("side");
        Some(
            sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*)::bigint + 1 FROM queue_entries \
                 WHERE challenge_id = $1 AND side = $2 AND status = $3 AND id < $4",
            )
            .bind(challenge_id)
            .bind(side)
            .bind(ENTRY_WAITING)
            .bind(entry_id)
            .fetch_one(&state.db)
            .await
            .map_err(ApiError::db)?,
        )
    } else {
        None
    };

    Ok(Json(serde_json::json!({
        "challenge_id": challenge_id,
        "user_id": user_id,
        "entry_id": row.get::<i64, _>("id"),
        "side": row.get::<String, _>("side"),
        "status": status,
        "position": live_position,
        "stake_amount": row.get::<i64, _>("stake_amount"),
        "matched_with": row.get::<Option<i64>, _>("matched_with"),
        "created_at": row.get::<DateTime<Utc>, _>("created_at"),
        "matched_at": row.get::<Option<DateTime<Utc>>, _>("matched_at"),
    })))
}

async fn settle_challenge_handler(
    State(state): State<AppState>,
    Path(challenge_id): Path<i64>,
    Json(req): Json<SettleRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome: Outcome = req.outcome.parse()?;
    let result = settle_challenge(&state, challenge_id, outcome).await?;
    Ok(Json(serde_json::json!({
        "challenge_id": challenge_id,
        "outcome": result.outcome.as_str(),
        "refunded_entries": result.refunded_entries,
        "payout_job": result.job,
        "partner_settlement": result.partner.map(|p| serde_json::json!({
            "id": p.id,
            "partner_program_id": p.partner_program_id,
            "partner_fee": p.partner_fee,
            "already_existed": p.already_existed,
        })),
    })))
}

async fn admin_expire_challenge(
    State(state): State<AppState>,
    Path(challenge_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let refunded = expire_challenge(&state, challenge_id).await?;
    Ok(Json(serde_json::json!({
        "challenge_id": challenge_id,
        "expired": true,
        "refunded_entries": refunded,
    })))
}

// ===== Payout jobs =====

async fn get_payout_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = sqlx::query(
        "SELECT id, challenge_id, status, total_winners, processed_winners, total_pool, \
                platform_fee, winner_pool, error, created_at, started_at, completed_at \
         FROM payout_jobs WHERE id = $1",
    )
    .bind(job_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Payout job not found"))?;

    let total_winners: i32 = job.get("total_winners");
    let processed: i32 = job.get("processed_winners");
    let progress = if total_winners > 0 {
        (processed as f64) / (total_winners as f64)
    } else {
        1.0
    };

    let counts = sqlx::query(
        "SELECT \
           COUNT(*) FILTER (WHERE status = 'completed')::bigint AS completed, \
           COUNT(*) FILTER (WHERE status = 'failed')::bigint AS failed, \
           COUNT(*) FILTER (WHERE status = 'pending')::bigint AS pending \
         FROM payout_entries WHERE job_id = $1",
    )
    .bind(job_id)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(serde_json::json!({
        "id": job.get::<Uuid, _>("id"),
        "challenge_id": job.get::<i64, _>("challenge_id"),
        "status": job.get::<String, _>("status"),
        "total_winners": total_winners,
        "processed_winners": processed,
        "progress": progress,
        "total_pool": job.get::<i64, _>("total_pool"),
        "platform_fee": job.get::<i64, _>("platform_fee"),
        "winner_pool": job.get::<i64, _>("winner_pool"),
        "entries": {
            "completed": counts.get::<i64, _>("completed"),
            "failed": counts.get::<i64, _>("failed"),
            "pending": counts.get::<i64, _>("pending"),
        },
        "error": job.get::<Option<String>, _>("error"),
        "created_at": job.get::<DateTime<Utc>, _>("created_at"),
        "started_at": job.get::<Option<DateTime<Utc>>, _>("started_at"),
        "completed_at": job.get::<Option<DateTime<Utc>>, _>("completed_at"),
    })))
}

async fn admin_retry_payout_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let reset = retry_failed_entries(&state, job_id).await?;
    Ok(Json(serde_json::json!({
        "job_id": job_id,
        "entries_requeued": reset,
    })))
}

// ===== Users and wallets =====

async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<UserCreate>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let username = req.username.trim();
    if username.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "username must not be empty"));
    }
    let mut tx = state.db.begin().await.map_err(ApiError::db)?;
    let user_id: i64 = match sqlx::query_scalar::<_, i64>(
        "INSERT INTO users (username) VALUES ($1) RETURNING id",
    )
    .bind(username)
    .fetch_one(&mut *tx)
    .await
    {
        Ok(id) => id,
        Err(e) if crate::error::is_unique_violation(&e) => {
            return Err(ApiError::new(StatusCode::CONFLICT, "Username already taken"));
        }
        Err(e) => return Err(ApiError::db(e)),
    };
    sqlx::query("INSERT INTO wallet_accounts (user_id) VALUES ($1)")
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?;
    tx.commit().await.map_err(ApiError::db)?;
    Ok(Json(serde_json::json!({"id": user_id, "username": username})))
}

async fn get_user_wallet(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let row = sqlx::query(
        "SELECT w.balance, w.updated_at, u.username \
         FROM wallet_accounts w JOIN users u ON u.id = w.user_id WHERE w.user_id = $1",
    )
    .bind(user_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Wallet not found"))?;

    let balance: i64 = row.get("balance");
    Ok(Json(serde_json::json!({
        "user_id": user_id,
        "username": row.get::<String, _>("username"),
        "balance": balance,
        "balance_display": minor_to_decimal(balance),
        "updated_at": row.get::<DateTime<Utc>, _>("updated_at"),
    })))
}

async fn get_user_wallet_transactions(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = q.limit.unwrap_or(50).clamp(1, MAX_TX_HISTORY);
    let rows = sqlx::query(
        "SELECT id, tx_type, amount, challenge_id, description, created_at \
         FROM wallet_transactions WHERE user_id = $1 ORDER BY id DESC LIMIT $2",
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let items: Vec<serde_json::Value> = rows
        .iter()
        .map(|r| {
            let amount: i64 = r.get("amount");
            serde_json::json!({
                "id": r.get::<i64, _>("id"),
                "tx_type": r.get::<String, _>("tx_type"),
                "amount": amount,
                "amount_display": minor_to_decimal(amount),
                "challenge_id": r.get::<Option<i64>, _>("challenge_id"),
                "description": r.get::<String, _>("description"),
                "created_at": r.get::<DateTime<Utc>, _>("created_at"),
            })
        })
        .collect();
    Ok(Json(serde_json::json!({"count": items.len(), "items": items})))
}

async fn admin_dev_topup(
    State(state): State<AppState>,
    Json(req): Json<DevTopupRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if req.amount <= 0 {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "amount must be > 0"));
    }
    let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE id = $1")
        .bind(req.user_id)
        .fetch_optional(&state.db)
        .await
        .map_err(ApiError::db)?;
    if exists.is_none() {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "User not found"));
    }

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;
    let balance: i64 = sqlx::query_scalar(
        "INSERT INTO wallet_accounts (user_id, balance) VALUES ($1, $2) \
         ON CONFLICT (user_id) DO UPDATE \
         SET balance = wallet_accounts.balance + EXCLUDED.balance, updated_at = now() \
         RETURNING balance",
    )
    .bind(req.user_id)
    .bind(req.amount)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;
    sqlx::query(
        "INSERT INTO wallet_transactions (user_id, tx_type, amount, description) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(req.user_id)
    .bind(TX_DEV_TOPUP)
    .bind(req.amount)
    .bind("Development top-up")
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;
    tx.commit().await.map_err(ApiError::db)?;

    Ok(Json(serde_json::json!({
        "user_id": req.user_id,
        "balance": balance,
        "balance_display": minor_to_decimal(balance),
    })))
}

// ===== Partner programs =====

async fn admin_create_partner_program(
    State(state): State<AppState>,
    Json(req): Json<PartnerProgramCreate>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !(0..=10_000).contains(&req.fee_share_bps) {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "fee_share_bps must be within 0..=10000",
        ));
    }
    let mut tx = state.db.begin().await.map_err(ApiError::db)?;
    let partner_id: i64 = match sqlx::query_scalar::<_, i64>(
        "INSERT INTO partner_programs (name, fee_share_bps) VALUES ($1, $2) RETURNING id",
    )
    .bind(req.name.trim())
    .bind(req.fee_share_bps)
    .fetch_one(&mut *tx)
    .await
    {
        Ok(id) => id,
        Err(e) if crate::error::is_unique_violation(&e) => {
            return Err(ApiError::new(StatusCode::CONFLICT, "Partner program name already taken"));
        }
        Err(e) => return Err(ApiError::db(e)),
    };
    sqlx::query("INSERT INTO partner_wallets (partner_program_id) VALUES ($1)")
        .bind(partner_id)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?;
    tx.commit().await.map_err(ApiError::db)?;
    Ok(Json(serde_json::json!({
        "id": partner_id,
        "name": req.name.trim(),
        "fee_share_bps": req.fee_share_bps,
    })))
}

async fn get_partner_wallet(
    State(state): State<AppState>,
    Path(partner_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let row = sqlx::query(
        "SELECT w.balance, w.total_credited, w.total_withdrawn, w.updated_at, p.name, p.fee_share_bps \
         FROM partner_wallets w JOIN partner_programs p ON p.id = w.partner_program_id \
         WHERE w.partner_program_id = $1",
    )
    .bind(partner_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Partner wallet not found"))?;

    let pending: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(amount), 0)::bigint FROM partner_withdrawals \
         WHERE partner_program_id = $1 AND status = 'pending'",
    )
    .bind(partner_id)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    let balance: i64 = row.get("balance");
    Ok(Json(serde_json::json!({
        "partner_program_id": partner_id,
        "name": row.get::<String, _>("name"),
        "fee_share_bps": row.get::<i32, _>("fee_share_bps"),
        "balance": balance,
        "balance_display": minor_to_decimal(balance),
        "pending_withdrawals": pending,
        "available": balance - pending,
        "total_credited": row.get::<i64, _>("total_credited"),
        "total_withdrawn": row.get::<i64, _>("total_withdrawn"),
        "updated_at": row.get::<DateTime<Utc>, _>("updated_at"),
    })))
}

async fn get_partner_wallet_transactions(
    State(state): State<AppState>,
    Path(partner_id): Path<i64>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = q.limit.unwrap_or(50).clamp(1, MAX_TX_HISTORY);
    let rows = sqlx::query(
        "SELECT id, tx_type, amount, settlement_id, withdrawal_id, meta, created_at \
         FROM partner_wallet_transactions WHERE partner_program_id = $1 \
         ORDER BY id DESC LIMIT $2",
    )
    .bind(partner_id)
    .bind(limit)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let items: Vec<serde_json::Value> = rows
        .iter()
        .map(|r| {
            let amount: i64 = r.get("amount");
            serde_json::json!({
                "id": r.get::<i64, _>("id"),
                "tx_type": r.get::<String, _>("tx_type"),
                "amount": amount,
                "amount_display": minor_to_decimal(amount),
                "settlement_id": r.get::<Option<Uuid>, _>("settlement_id"),
                "withdrawal_id": r.get::<Option<Uuid>, _>("withdrawal_id"),
                "meta": r.get::<serde_json::Value, _>("meta"),
                "created_at": r.get::<DateTime<Utc>, _>("created_at"),
            })
        })
        .collect();
    Ok(Json(serde_json::json!({"count": items.len(), "items": items})))
}

async fn request_withdrawal(
    State(state): State<AppState>,
    Path(partner_id): Path<i64>,
    Json(req): Json<WithdrawalRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let withdrawal_id = request_partner_withdrawal(&state, partner_id, req.amount).await?;
    Ok(Json(serde_json::json!({
        "id": withdrawal_id,
        "partner_program_id": partner_id,
        "amount": req.amount,
        "status": "pending",
    })))
}

async fn admin_approve_withdrawal(
    State(state): State<AppState>,
    Path(withdrawal_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let decision = decide_partner_withdrawal(&state, withdrawal_id, true, None).await?;
    Ok(Json(serde_json::json!({
        "id": decision.withdrawal_id,
        "partner_program_id": decision.partner_program_id,
        "amount": decision.amount,
        "status": if decision.approved { "approved" } else { "rejected" },
    })))
}

async fn admin_reject_withdrawal(
    State(state): State<AppState>,
    Path(withdrawal_id): Path<Uuid>,
    Json(req): Json<WithdrawalReject>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let decision = decide_partner_withdrawal(&state, withdrawal_id, false, req.reason).await?;
    Ok(Json(serde_json::json!({
        "id": decision.withdrawal_id,
        "partner_program_id": decision.partner_program_id,
        "amount": decision.amount,
        "status": if decision.approved { "approved" } else { "rejected" },
    })))
}

async fn admin_get_perf(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(
        state
            .perf
            .snapshot_json(state.payout_pending.len(), state.payout_running.len()),
    )
}

#[tokio::main(worker_threads = 8)]
async fn main() -> Result<()> {
    let cfg = Arc::new(load_config()?);

    let db = PgPoolOptions::new()
        .min_connections(cfg.database.min_pool_size)
        .max_connections(cfg.database.max_pool_size)
        .acquire_timeout(Duration::from_secs(cfg.database.acquire_timeout_seconds))
        .max_lifetime(Duration::from_secs(cfg.database.max_lifetime_seconds))
        .connect(&cfg.database.url)
        .await
        .context("failed to connect to postgres")?;

    let (payout_tx, payout_rx) = mpsc::unbounded_channel::<Uuid>();
    let (events_tx, events_rx) = mpsc::unbounded_channel::<EngineEvent>();

    let state = AppState {
        cfg: cfg.clone(),
        db,
        payout_tx,
        payout_pending: Arc::new(DashMap::new()),
        payout_running: Arc::new(DashMap::new()),
        events_tx,
        perf: Arc::new(PerfCounters::new()),
    };

    start_background_tasks(state.clone(), payout_rx, events_rx);
    eprintln!(
        "[startup] workers_started payout_interval_s={} payout_batch_size={} expiry_sweep_s={}",
        cfg.worker.payout_interval_seconds, cfg.worker.payout_batch_size, cfg.worker.expiry_sweep_seconds
    );

    let allowed_headers = [AUTHORIZATION, CONTENT_TYPE, ACCEPT];
    let allowed_methods = [Method::GET, Method::POST, Method::PATCH, Method::DELETE, Method::OPTIONS];
    let cors = if cfg.api.cors_origins.iter().any(|x| x == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(allowed_methods)
            .allow_headers(allowed_headers)
    } else {
        let origins: Vec<HeaderValue> = cfg
            .api
            .cors_origins
            .iter()
            .filter_map(|origin| HeaderValue::from_str(origin).ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(allowed_methods)
            .allow_headers(allowed_headers)
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/users", post(create_user))
        .route("/users/{user_id}/wallet", get(get_user_wallet))
        .route("/users/{user_id}/wallet/transactions", get(get_user_wallet_transactions))
        .route("/challenges", post(create_challenge))
        .route("/challenges/{challenge_id}", get(get_challenge_overview))
        .route("/challenges/{challenge_id}/join", post(join_challenge_queue))
        .route("/challenges/{challenge_id}/cancel", post(cancel_challenge_queue))
        .route("/challenges/{challenge_id}/queue", get(get_queue_status))
        .route("/challenges/{challenge_id}/queue/{user_id}", get(get_user_queue_status))
        .route("/challenges/{challenge_id}/settle", post(settle_challenge_handler))
        .route("/payouts/{job_id}", get(get_payout_job))
        .route("/partners/{partner_id}/wallet", get(get_partner_wallet))
        .route("/partners/{partner_id}/wallet/transactions", get(get_partner_wallet_transactions))
        .route("/partners/{partner_id}/withdrawals", post(request_withdrawal))
        .route("/admin/challenges/{challenge_id}/expire", post(admin_expire_challenge))
        .route("/admin/payouts/{job_id}/retry", post(admin_retry_payout_job))
        .route("/admin/partners", post(admin_create_partner_program))
        .route("/admin/withdrawals/{withdrawal_id}/approve", post(admin_approve_withdrawal))
        .route("/admin/withdrawals/{withdrawal_id}/reject", post(admin_reject_withdrawal))
        .route("/admin/dev/topup", post(admin_dev_topup))
        .route("/admin/debug/perf", get(admin_get_perf))
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", cfg.api.host, cfg.api.port).parse()?;
    println!("Challenge engine listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

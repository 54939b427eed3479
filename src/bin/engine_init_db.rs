use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, Row};
use std::fs;
use std::time::Duration;

fn split_sql_statements(input: &str) -> Vec<String> {
    // Simple splitter suitable for our schema.sql (no functions / dollar-quoting).
    // Skips comments/whitespace-only segments.
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut in_single = false;

    for line in input.lines() {
        let trimmed = line.trim_start();
        if !in_single && trimmed.starts_with("--") {
            continue;
        }
        for ch in line.chars() {
            match ch {
                '\'' => {
                    in_single = !in_single;
                    cur.push(ch);
                }
                ';' if !in_single => {
                    let s = cur.trim();
                    if !s.is_empty() {
                        out.push(s.to_string());
                    }
                    cur.clear();
                }
                _ => cur.push(ch),
            }
        }
        cur.push('\n');
    }
    let s = cur.trim();
    if !s.is_empty() {
        out.push(s.to_string());
    }
    out
}

#[tokio::main]
async fn main() -> Result<()> {
    let db_url = env_required("DATABASE_URL")?;
    let min = env_u32("DB_MIN_POOL_SIZE", 5).max(1);
    let max = env_u32("DB_MAX_POOL_SIZE", 20).max(min);
    let acquire = env_u64("DB_ACQUIRE_TIMEOUT_SECONDS", 30).max(5);
    let schema_path = env_string("SCHEMA_PATH", "schema.sql");
    let seed_users = env_list("SEED_USERS", &["alice", "bob", "carol", "dave"]);
    let seed_balance = env_i64("SEED_BALANCE", 100_000);
    let partner_name = env_string("SEED_PARTNER_NAME", "demo-partner");
    let partner_share_bps = env_u32("SEED_PARTNER_SHARE_BPS", 3000).min(10_000) as i32;

    let db = PgPoolOptions::new()
        .min_connections(min)
        .max_connections(max)
        .acquire_timeout(Duration::from_secs(acquire))
        .connect(&db_url)
        .await
        .context("connect postgres")?;

    // Hard reset (clean schema). POSTGRES_USER in compose is a superuser in dev.
    sqlx::query("DROP SCHEMA IF EXISTS public CASCADE")
        .execute(&db)
        .await
        .context("drop public schema")?;
    sqlx::query("CREATE SCHEMA public")
        .execute(&db)
        .await
        .context("create public schema")?;

    let schema_sql =
        fs::read_to_string(&schema_path).with_context(|| format!("read {schema_path}"))?;
    for stmt in split_sql_statements(&schema_sql) {
        sqlx::query(&stmt)
            .execute(&db)
            .await
            .with_context(|| format!("exec schema stmt: {}", stmt.lines().next().unwrap_or("<empty>")))?;
    }

    // Seed users with funded wallets.
    let mut user_ids = Vec::new();
    for username in &seed_users {
        let row = sqlx::query("INSERT INTO users (username) VALUES ($1) RETURNING id")
            .bind(username)
            .fetch_one(&db)
            .await
            .with_context(|| format!("insert user {username}"))?;
        let user_id: i64 = row.get("id");
        sqlx::query("INSERT INTO wallet_accounts (user_id, balance) VALUES ($1, $2)")
            .bind(user_id)
            .bind(seed_balance)
            .execute(&db)
            .await?;
        sqlx::query(
            "INSERT INTO wallet_transactions (user_id, tx_type, amount, description) \
             VALUES ($1, 'dev_topup', $2, 'Seed balance')",
        )
        .bind(user_id)
        .bind(seed_balance)
        .execute(&db)
        .await?;
        user_ids.push(user_id);
    }

    // Seed a partner program with an empty wallet.
    let partner_row = sqlx::query(
        "INSERT INTO partner_programs (name, fee_share_bps) VALUES ($1, $2) RETURNING id",
    )
    .bind(&partner_name)
    .bind(partner_share_bps)
    .fetch_one(&db)
    .await
    .context("insert partner program")?;
    let partner_id: i64 = partner_row.get("id");
    sqlx::query("INSERT INTO partner_wallets (partner_program_id) VALUES ($1)")
        .bind(partner_id)
        .execute(&db)
        .await?;

    // One sample challenge attributed to the partner.
    let challenge_row = sqlx::query(
        "INSERT INTO challenges (title, stake_amount, status, partner_program_id) \
         VALUES ($1, $2, 'open', $3) RETURNING id",
    )
    .bind("Demo challenge")
    .bind(1_000i64)
    .bind(partner_id)
    .fetch_one(&db)
    .await
    .context("insert sample challenge")?;
    let challenge_id: i64 = challenge_row.get("id");
    sqlx::query("INSERT INTO partner_challenges (partner_program_id, challenge_id) VALUES ($1, $2)")
        .bind(partner_id)
        .bind(challenge_id)
        .execute(&db)
        .await?;

    println!(
        "initialized: users={}, partner_id={}, challenge_id={}",
        user_ids.len(),
        partner_id,
        challenge_id
    );

    Ok(())
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("missing required env var: {key}"))
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) => parse_list_value(&v)
            .unwrap_or_else(|| default.iter().map(|s| (*s).to_string()).collect()),
        Err(_) => default.iter().map(|s| (*s).to_string()).collect(),
    }
}

fn parse_list_value(raw: &str) -> Option<Vec<String>> {
    if let Ok(v) = serde_json::from_str::<Vec<String>>(raw) {
        return Some(v.into_iter().filter(|s| !s.trim().is_empty()).collect());
    }
    let parts: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().trim_matches('"').to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts)
    }
}

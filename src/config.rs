use anyhow::{anyhow, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct AppConfig {
    pub(crate) database: DatabaseConfig,
    pub(crate) api: ApiConfig,
    pub(crate) fees: FeesConfig,
    pub(crate) worker: WorkerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct DatabaseConfig {
    pub(crate) url: String,
    pub(crate) min_pool_size: u32,
    pub(crate) max_pool_size: u32,
    pub(crate) max_lifetime_seconds: u64,
    pub(crate) acquire_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct ApiConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) cors_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct FeesConfig {
    /// Platform cut of the matched pool, in basis points.
    pub(crate) platform_fee_bps: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct WorkerConfig {
    pub(crate) payout_interval_seconds: u64,
    pub(crate) payout_batch_size: i64,
    pub(crate) expiry_sweep_seconds: u64,
}

pub(crate) fn load_config() -> Result<AppConfig> {
    let cfg = AppConfig {
        database: DatabaseConfig {
            url: env_required("DATABASE_URL")?,
            min_pool_size: env_u32("DB_MIN_POOL_SIZE", 10),
            max_pool_size: env_u32("DB_MAX_POOL_SIZE", 60),
            max_lifetime_seconds: env_u64("DB_MAX_LIFETIME_SECONDS", 1800),
            acquire_timeout_seconds: env_u64("DB_ACQUIRE_TIMEOUT_SECONDS", 30),
        },
        api: ApiConfig {
            host: env_string("API_HOST", "0.0.0.0"),
            port: env_u16("API_PORT", 8000),
            cors_origins: env_list("CORS_ORIGINS", &["*"]),
        },
        fees: FeesConfig {
            platform_fee_bps: env_i64("PLATFORM_FEE_BPS", 500),
        },
        worker: WorkerConfig {
            payout_interval_seconds: env_u64("PAYOUT_INTERVAL_SECONDS", 300),
            payout_batch_size: env_i64("PAYOUT_BATCH_SIZE", 500),
            expiry_sweep_seconds: env_u64("EXPIRY_SWEEP_SECONDS", 60),
        },
    };
    if cfg.fees.platform_fee_bps < 0 || cfg.fees.platform_fee_bps > 10_000 {
        return Err(anyhow!("PLATFORM_FEE_BPS must be within 0..=10000"));
    }
    if cfg.worker.payout_batch_size <= 0 {
        return Err(anyhow!("PAYOUT_BATCH_SIZE must be > 0"));
    }
    Ok(cfg)
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow!("missing required env var: {key}"))
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(default)
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

#[cfg(test)]
mod tests {
    use super::parse_list_value;

    #[test]
    fn list_parses_json_arrays() {
        let v = parse_list_value(r#"["http://a", "http://b"]"#).unwrap();
        assert_eq!(v, vec!["http://a".to_string(), "http://b".to_string()]);
    }

    #[test]
    fn list_parses_comma_separated() {
        let v = parse_list_value(" http://a , \"http://b\" ").unwrap();
        assert_eq!(v, vec!["http://a".to_string(), "http://b".to_string()]);
    }

    #[test]
    fn list_rejects_empty() {
        assert!(parse_list_value("  , ,").is_none());
    }
}

use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::db::PoolSettings;
use crate::reaper::ReaperConfig;
use crate::tasks::RetryConfig;
use crate::worker::WorkerConfig;

/// Runtime configuration, read from the environment (and `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub pool: PoolSettings,
    pub migrate_on_startup: bool,
    pub log_json: bool,

    pub worker_id: String,
    pub queues: Vec<String>,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub default_timeout_secs: u64,
    pub outcome_retries: u32,
    pub fallback_path: PathBuf,

    pub reaper_interval: Duration,
    pub reaper_grace_secs: i32,
    pub scheduler_interval: Duration,
    pub scheduler_enabled: bool,

    pub retry: RetryConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env_or_fallback("TASKFLOW_DATABASE_URL", "DATABASE_URL")
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let pool_defaults = PoolSettings::default();
        let pool = PoolSettings {
            max_connections: env_parse("TASKFLOW_DB_MAX_CONNECTIONS", "DB_MAX_CONNECTIONS")
                .unwrap_or(pool_defaults.max_connections)
                .clamp(1, 64),
            acquire_timeout: Duration::from_secs(
                env_parse("TASKFLOW_DB_ACQUIRE_TIMEOUT_SECS", "DB_ACQUIRE_TIMEOUT_SECS")
                    .unwrap_or(10u64)
                    .clamp(1, 60),
            ),
            disable_jit: env_bool("TASKFLOW_DISABLE_JIT").unwrap_or(pool_defaults.disable_jit),
            statement_timeout: env_parse::<u64>(
                "TASKFLOW_DB_STATEMENT_TIMEOUT_MS",
                "DB_STATEMENT_TIMEOUT_MS",
            )
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis),
            application_name: env_or_fallback("TASKFLOW_DB_APPLICATION_NAME", "DB_APPLICATION_NAME")
                .unwrap_or(pool_defaults.application_name),
        };

        let worker_id = env_or_fallback("TASKFLOW_WORKER_ID", "WORKER_ID")
            .unwrap_or_else(default_worker_id);

        let queues = env_or_fallback("TASKFLOW_QUEUES", "QUEUES")
            .map(|s| parse_list(&s))
            .filter(|q| !q.is_empty())
            .unwrap_or_else(|| vec!["default".to_string()]);

        let concurrency = env_parse("TASKFLOW_CONCURRENCY", "CONCURRENCY")
            .unwrap_or(4usize)
            .clamp(1, 256);

        let poll_interval_ms = env_parse("TASKFLOW_POLL_INTERVAL_MS", "POLL_INTERVAL_MS")
            .unwrap_or(500u64)
            .clamp(10, 60_000);

        let heartbeat_secs = env_parse("TASKFLOW_HEARTBEAT_SECS", "HEARTBEAT_SECS")
            .unwrap_or(30u64)
            .clamp(1, 3600);

        let default_timeout_secs =
            env_parse("TASKFLOW_DEFAULT_TIMEOUT_SECS", "DEFAULT_TIMEOUT_SECS")
                .unwrap_or(3600u64)
                .max(1);

        let outcome_retries = env_parse("TASKFLOW_OUTCOME_RETRIES", "OUTCOME_RETRIES")
            .unwrap_or(5u32)
            .clamp(1, 50);

        let fallback_path = env_or_fallback("TASKFLOW_FALLBACK_PATH", "FALLBACK_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("taskflow-outcomes.jsonl"));

        let reaper_interval_secs = env_parse("TASKFLOW_REAPER_INTERVAL_SECS", "REAPER_INTERVAL_SECS")
            .unwrap_or(60u64)
            .clamp(1, 3600);

        let reaper_grace_secs = env_parse("TASKFLOW_REAPER_GRACE_SECS", "REAPER_GRACE_SECS")
            .unwrap_or(3600i32)
            .max(1);

        let scheduler_interval_secs =
            env_parse("TASKFLOW_SCHEDULER_INTERVAL_SECS", "SCHEDULER_INTERVAL_SECS")
                .unwrap_or(15u64)
                .clamp(1, 300);

        let defaults = RetryConfig::default();
        let retry = RetryConfig {
            base_seconds: env_parse("TASKFLOW_RETRY_BASE_SECS", "RETRY_BASE_SECS")
                .unwrap_or(defaults.base_seconds)
                .max(0),
            max_seconds: env_parse("TASKFLOW_RETRY_MAX_SECS", "RETRY_MAX_SECS")
                .unwrap_or(defaults.max_seconds)
                .max(1),
            jitter_pct: env_parse("TASKFLOW_RETRY_JITTER_PCT", "RETRY_JITTER_PCT")
                .unwrap_or(defaults.jitter_pct)
                .clamp(0.0, 1.0),
            dead_letter_default: env_bool("TASKFLOW_DEAD_LETTER_DEFAULT")
                .unwrap_or(defaults.dead_letter_default),
        };

        Ok(Self {
            database_url,
            pool,
            migrate_on_startup: env_bool("TASKFLOW_MIGRATE_ON_STARTUP").unwrap_or(true),
            log_json: env_bool("TASKFLOW_LOG_JSON").unwrap_or(false),
            worker_id,
            queues,
            concurrency,
            poll_interval: Duration::from_millis(poll_interval_ms),
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            default_timeout_secs,
            outcome_retries,
            fallback_path,
            reaper_interval: Duration::from_secs(reaper_interval_secs),
            reaper_grace_secs,
            scheduler_interval: Duration::from_secs(scheduler_interval_secs),
            scheduler_enabled: env_bool("TASKFLOW_SCHEDULER_ENABLED").unwrap_or(true),
            retry,
        })
    }

    pub fn worker_config(&self, queue: &str) -> WorkerConfig {
        WorkerConfig {
            poll_interval: self.poll_interval,
            heartbeat_interval: self.heartbeat_interval,
            default_timeout: Duration::from_secs(self.default_timeout_secs),
            outcome_retries: self.outcome_retries,
            ..WorkerConfig::new(queue)
        }
    }

    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            interval: self.reaper_interval,
            grace_secs: self.reaper_grace_secs,
            ..ReaperConfig::default()
        }
    }
}

/// `$HOSTNAME` plus a short random suffix, so two processes on one host
/// never share ids.
fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "worker".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_parse<T: std::str::FromStr>(primary: &str, fallback: &str) -> Option<T> {
    env_or_fallback(primary, fallback).and_then(|s| s.trim().parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_lists_ignore_blanks() {
        assert_eq!(parse_list(" ingest, ,calibrate,"), vec!["ingest", "calibrate"]);
        assert!(parse_list(" , ").is_empty());
    }

    #[test]
    fn default_worker_id_has_random_suffix() {
        let a = default_worker_id();
        let b = default_worker_id();
        assert_ne!(a, b);
        assert_eq!(a.rsplit('-').next().map(str::len), Some(8));
    }
}

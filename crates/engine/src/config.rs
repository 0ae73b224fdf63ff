//! Tuning knobs for each long-running component. No dedicated
//! config-parsing crate: following the
//! teacher's own `cli::main` style, every field is read with
//! `std::env::var().unwrap_or(default)` rather than a derive macro.

use std::time::Duration;

fn env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .map(Duration::from_secs_f64)
        .unwrap_or(default)
}

fn env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub retry_jitter: Duration,
    pub handler_timeout: Duration,
    pub batch_size: usize,
    pub block: Duration,
    pub cb_threshold: u32,
    pub cb_open_timeout: Duration,
    /// How long a completion's idempotency fingerprint blocks a duplicate
    /// re-publish, covering the redelivery window after a worker crash.
    pub idempotency_ttl: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_retries: env_u32("WORKER_MAX_RETRIES", 4),
            retry_base: env_duration_secs("WORKER_RETRY_BASE", Duration::from_secs(1)),
            retry_cap: env_duration_secs("WORKER_RETRY_CAP", Duration::from_secs(30)),
            retry_jitter: env_duration_secs("WORKER_RETRY_JITTER", Duration::from_secs(1)),
            handler_timeout: env_duration_secs("WORKER_HANDLER_TIMEOUT", Duration::from_secs(60)),
            batch_size: env_usize("WORKER_BATCH_SIZE", 10),
            block: env_duration_millis("WORKER_BLOCK_MS", Duration::from_millis(2000)),
            cb_threshold: env_u32("WORKER_CB_THRESHOLD", 5),
            cb_open_timeout: env_duration_secs("WORKER_CB_OPEN_TIMEOUT", Duration::from_secs(30)),
            idempotency_ttl: env_duration_secs(
                "WORKER_IDEMPOTENCY_TTL",
                Duration::from_secs(24 * 3600),
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub batch_size: usize,
    pub block: Duration,
    pub lock_ttl: Duration,
    pub completion_reclaim_idle: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: env_usize("ORCHESTRATOR_BATCH_SIZE", 10),
            block: env_duration_millis("ORCHESTRATOR_BLOCK_MS", Duration::from_millis(2000)),
            lock_ttl: env_duration_secs("ORCHESTRATOR_LOCK_TTL", Duration::from_secs(30)),
            completion_reclaim_idle: env_duration_millis(
                "ORCHESTRATOR_COMPLETION_RECLAIM_IDLE_MS",
                Duration::from_millis(60_000),
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub check_interval: Duration,
    pub min_idle: Duration,
    pub batch_size: usize,
    pub max_reclaims: u32,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            check_interval: env_duration_secs("REAPER_CHECK_INTERVAL", Duration::from_secs(5)),
            min_idle: env_duration_millis("REAPER_MIN_IDLE_MS", Duration::from_millis(25_000)),
            batch_size: env_usize("REAPER_BATCH_SIZE", 100),
            max_reclaims: env_u32("REAPER_MAX_RECLAIMS", 10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub tasks: String,
    pub completions: String,
    pub group_orchestrator: String,
    pub group_worker: String,
    pub max_len: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            tasks: "workflow:tasks".to_string(),
            completions: "workflow:completions".to_string(),
            group_orchestrator: "g:orchestrator".to_string(),
            group_worker: "g:worker".to_string(),
            max_len: env_usize("STREAM_MAX_LEN", 100_000),
        }
    }
}

use std::time::Duration;

/// Runtime configuration, read once at startup. All timeouts are tunable
/// through the environment; none are hardcoded at call sites.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the gateway SQLite database (queue + shared credentials).
    /// ":memory:" keeps everything process-local.
    pub database_path: String,
    /// How long a session with no pending jobs may sit idle before the
    /// sweep tears it down.
    pub session_idle_timeout: Duration,
    /// Interval between idle sweeps (also drives queue redelivery checks).
    pub session_sweep_interval: Duration,
    /// How long a claimed-but-unacked job stays invisible before it is
    /// offered to another worker.
    pub job_visibility_timeout: Duration,
    /// Worker-side queue poll interval.
    pub queue_poll_interval: Duration,
    /// If non-empty, only these platform ids load.
    pub platform_allow: Vec<String>,
    /// If the allowlist is empty, these platform ids are skipped.
    pub platform_deny: Vec<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_path: env_str("GATEWAY_DATABASE_PATH", "./data/gateway.db"),
            session_idle_timeout: Duration::from_secs(env_parse(
                "SESSION_IDLE_TIMEOUT_SECS",
                300,
            )?),
            session_sweep_interval: Duration::from_secs(env_parse(
                "SESSION_SWEEP_INTERVAL_SECS",
                60,
            )?),
            job_visibility_timeout: Duration::from_secs(env_parse(
                "JOB_VISIBILITY_TIMEOUT_SECS",
                30,
            )?),
            queue_poll_interval: Duration::from_millis(env_parse("QUEUE_POLL_INTERVAL_MS", 100)?),
            platform_allow: env_csv("PLATFORM_ALLOW", &[]),
            platform_deny: env_csv("PLATFORM_DENY", &[]),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: ":memory:".to_string(),
            session_idle_timeout: Duration::from_secs(300),
            session_sweep_interval: Duration::from_secs(60),
            job_visibility_timeout: Duration::from_secs(30),
            queue_poll_interval: Duration::from_millis(100),
            platform_allow: Vec::new(),
            platform_deny: Vec::new(),
        }
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_csv(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect(),
        Err(_) => default.iter().map(|s| (*s).to_string()).collect(),
    }
}

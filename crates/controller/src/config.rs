//! Controller tunables. Defaults follow the reference behavior; every value can be
//! overridden from the environment (`OPREQ_*`) or by the CLI.

use std::time::Duration;

use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControllerConfig {
    /// Interval between convergence poll evaluations (install wait and status retry).
    pub poll_interval: Duration,
    /// Deadline for a single convergence poll.
    pub poll_timeout: Duration,
    /// Delay before re-reconciling a request that is not yet Running.
    pub requeue_after: Duration,
    /// Worker pool size; bounds how many reconciles may block in a poll at once.
    pub workers: usize,
    /// Cap for the per-key error backoff.
    pub backoff_max: Duration,
    /// Restrict the request watcher to one namespace.
    pub watch_namespace: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(20),
            poll_timeout: Duration::from_secs(600),
            requeue_after: Duration::from_secs(5),
            workers: 4,
            backoff_max: Duration::from_secs(300),
            watch_namespace: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparsable value; using default");
            None
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).filter(|s| *s > 0).map(Duration::from_secs)
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            poll_interval: env_secs("OPREQ_POLL_INTERVAL_SECS").unwrap_or(d.poll_interval),
            poll_timeout: env_secs("OPREQ_POLL_TIMEOUT_SECS").unwrap_or(d.poll_timeout),
            requeue_after: env_secs("OPREQ_REQUEUE_SECS").unwrap_or(d.requeue_after),
            workers: env_parse::<usize>("OPREQ_WORKERS").filter(|w| *w > 0).unwrap_or(d.workers),
            backoff_max: env_secs("OPREQ_BACKOFF_MAX_SECS").unwrap_or(d.backoff_max),
            watch_namespace: std::env::var("OPREQ_WATCH_NAMESPACE").ok().filter(|s| !s.trim().is_empty()),
        }
    }
}

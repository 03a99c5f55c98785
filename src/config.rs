use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Environment override for the concurrency bound.
pub const JOBS_ENV: &str = "KILN_JOBS";

pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 5;
pub const DEFAULT_STORE_PATH: &str = ".kiln/fingerprints.json";

/// Engine settings, read from the `[settings]` table of `kiln.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of tasks in flight.
    pub jobs: Option<usize>,
    /// How long running tasks may continue after a cancellation request.
    pub grace_period_secs: u64,
    /// Default per-task timeout.
    pub task_timeout_secs: Option<u64>,
    /// Fingerprint store location, relative to the project root.
    pub store: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            jobs: None,
            grace_period_secs: DEFAULT_GRACE_PERIOD_SECS,
            task_timeout_secs: None,
            store: DEFAULT_STORE_PATH.to_string(),
        }
    }
}

impl Config {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }

    pub fn store_path(&self, root: &Path) -> PathBuf {
        let path = expand_tilde(&self.store);
        if path.is_absolute() {
            path
        } else {
            root.join(path)
        }
    }

    /// Resolve the concurrency bound.
    ///
    /// Precedence: explicit option, then `KILN_JOBS`, then the settings
    /// file, then host parallelism. The result is never zero.
    pub fn effective_jobs(&self, cli: Option<usize>) -> usize {
        let env = std::env::var(JOBS_ENV).ok();
        resolve_jobs(cli, env.as_deref(), self.jobs)
    }
}

fn resolve_jobs(cli: Option<usize>, env: Option<&str>, configured: Option<usize>) -> usize {
    let from_env = env.and_then(|raw| match raw.trim().parse::<usize>() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!("Ignoring invalid {}={:?}", JOBS_ENV, raw);
            None
        }
    });

    let jobs = cli
        .or(from_env)
        .or(configured)
        .unwrap_or_else(host_parallelism);
    debug!("Concurrency bound resolved to {}", jobs.max(1));
    jobs.max(1)
}

fn host_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

//! Worker configuration loaded from environment variables
//!
//! Shared database and AniDB settings come from [`CommonConfig`]; the
//! scheduler and monitor tunables are read here with defaults suitable for a
//! single-user server.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use tsundoku_shared_config::{AniDbConfig, CommonConfig, DatabaseConfig, Environment};

/// Probed when `WORKER_CONNECTIVITY_PROBES` is not set
const DEFAULT_CONNECTIVITY_PROBES: &str = "one.one.one.one:443,dns.google:443";

/// Worker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Common configuration shared with other services
    pub common: CommonConfig,

    /// Scheduler tick interval in seconds
    pub poll_interval_secs: u64,

    /// Size of the worker pool
    pub max_concurrent_jobs: usize,

    /// Attempt ceiling before a job is marked failed
    pub max_retries: u32,

    /// Retry delay base in seconds (exponential backoff)
    pub retry_delay_secs: u64,

    /// Upper bound for the retry delay in seconds
    pub retry_max_delay_secs: u64,

    /// `host:port` targets the connectivity monitors probe
    pub connectivity_probes: Vec<String>,

    /// Interval between storage probes in seconds
    pub storage_probe_interval_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let common = CommonConfig::from_env()
            .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

        let config = Self {
            common,

            poll_interval_secs: env::var("WORKER_POLL_INTERVAL")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("Invalid WORKER_POLL_INTERVAL value")?,

            max_concurrent_jobs: env::var("WORKER_MAX_CONCURRENT_JOBS")
                .unwrap_or_else(|_| "4".to_string())
                .parse()
                .context("Invalid WORKER_MAX_CONCURRENT_JOBS value")?,

            max_retries: env::var("WORKER_MAX_RETRIES")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .context("Invalid WORKER_MAX_RETRIES value")?,

            retry_delay_secs: env::var("WORKER_RETRY_DELAY")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .context("Invalid WORKER_RETRY_DELAY value")?,

            retry_max_delay_secs: env::var("WORKER_RETRY_MAX_DELAY")
                .unwrap_or_else(|_| "3600".to_string())
                .parse()
                .context("Invalid WORKER_RETRY_MAX_DELAY value")?,

            connectivity_probes: parse_probes(
                &env::var("WORKER_CONNECTIVITY_PROBES")
                    .unwrap_or_else(|_| DEFAULT_CONNECTIVITY_PROBES.to_string()),
            ),

            storage_probe_interval_secs: env::var("WORKER_STORAGE_PROBE_INTERVAL")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("Invalid WORKER_STORAGE_PROBE_INTERVAL value")?,
        };

        if config.poll_interval_secs == 0 {
            anyhow::bail!("WORKER_POLL_INTERVAL must be at least 1 second");
        }
        if config.max_concurrent_jobs == 0 {
            anyhow::bail!("WORKER_MAX_CONCURRENT_JOBS must be at least 1");
        }
        if config.max_retries == 0 {
            anyhow::bail!("WORKER_MAX_RETRIES must be at least 1");
        }

        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_secs(self.retry_max_delay_secs)
    }

    pub fn storage_probe_interval(&self) -> Duration {
        Duration::from_secs(self.storage_probe_interval_secs.max(1))
    }

    /// Get database configuration
    pub fn database(&self) -> &DatabaseConfig {
        &self.common.database
    }

    /// Get AniDB configuration
    pub fn anidb(&self) -> &AniDbConfig {
        &self.common.anidb
    }

    /// Get environment mode
    pub fn environment(&self) -> Environment {
        self.common.environment
    }
}

/// Comma-separated `host:port` list; blanks are skipped
fn parse_probes(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|target| !target.is_empty())
        .map(str::to_string)
        .collect()
}

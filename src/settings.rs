//! Environment based settings.

use crate::core::batcher::BatcherConfig;
use anyhow::{Context, bail};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub batcher_batch_size: usize,
    pub batcher_window_ms: u64,
    /// `None` keeps the admission queue unbounded.
    pub batcher_queue_capacity: Option<usize>,
    /// Seconds a delivery waits for the next message before giving up.
    pub infer_job_ttl: u64,
    pub infer_workers: usize,
    /// Pub/sub transport. `None` selects the in-process broker.
    pub redis_url: Option<String>,
    pub horoscope_csv_file: PathBuf,
    pub horoscope_min_response_ms: u64,
    pub horoscope_max_response_ms: u64,
    pub max_prompt_length: usize,
    pub bind_addr: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            batcher_batch_size: 4,
            batcher_window_ms: 250,
            batcher_queue_capacity: None,
            infer_job_ttl: 10,
            infer_workers: 4,
            redis_url: None,
            horoscope_csv_file: PathBuf::from("etc/horoscopes.csv"),
            horoscope_min_response_ms: 500,
            horoscope_max_response_ms: 3000,
            max_prompt_length: 1024,
            bind_addr: "0.0.0.0:3000".to_owned(),
        }
    }
}

impl Settings {
    /// Reads settings from the environment, after loading `.env` if there is one.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through `lookup`, falling back to defaults for missing keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Settings::default();
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let settings = Settings {
            batcher_batch_size: parse_or(
                &value,
                "BATCHER_BATCH_SIZE",
                defaults.batcher_batch_size,
            )?,
            batcher_window_ms: parse_or(&value, "BATCHER_WINDOW_MS", defaults.batcher_window_ms)?,
            batcher_queue_capacity: parse_opt(&value, "BATCHER_QUEUE_CAPACITY")?,
            infer_job_ttl: parse_or(&value, "INFER_JOB_TTL", defaults.infer_job_ttl)?,
            infer_workers: parse_or(&value, "INFER_WORKERS", defaults.infer_workers)?,
            redis_url: value("REDIS_URL"),
            horoscope_csv_file: value("HOROSCOPE_CSV_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.horoscope_csv_file),
            horoscope_min_response_ms: parse_or(
                &value,
                "HOROSCOPE_MIN_RESPONSE_MS",
                defaults.horoscope_min_response_ms,
            )?,
            horoscope_max_response_ms: parse_or(
                &value,
                "HOROSCOPE_MAX_RESPONSE_MS",
                defaults.horoscope_max_response_ms,
            )?,
            max_prompt_length: parse_or(&value, "MAX_PROMPT_LENGTH", defaults.max_prompt_length)?,
            bind_addr: value("BIND_ADDR").unwrap_or(defaults.bind_addr),
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.batcher_batch_size == 0 {
            bail!("BATCHER_BATCH_SIZE must be at least 1");
        }
        if self.batcher_queue_capacity == Some(0) {
            bail!("BATCHER_QUEUE_CAPACITY must be at least 1");
        }
        if self.infer_job_ttl == 0 {
            bail!("INFER_JOB_TTL must be at least 1 second");
        }
        if self.infer_workers == 0 {
            bail!("INFER_WORKERS must be at least 1");
        }
        if self.horoscope_min_response_ms > self.horoscope_max_response_ms {
            bail!("HOROSCOPE_MIN_RESPONSE_MS must not exceed HOROSCOPE_MAX_RESPONSE_MS");
        }
        Ok(())
    }

    pub fn batcher_config(&self) -> BatcherConfig {
        BatcherConfig::new(
            self.batcher_batch_size,
            Duration::from_millis(self.batcher_window_ms),
        )
        .with_queue_capacity(self.batcher_queue_capacity)
    }

    pub fn infer_job_ttl(&self) -> Duration {
        Duration::from_secs(self.infer_job_ttl)
    }
}

fn parse_opt<T>(value: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("invalid value `{raw}` for {key}"))
        })
        .transpose()
}

fn parse_or<T>(value: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(parse_opt(value, key)?.unwrap_or(default))
}

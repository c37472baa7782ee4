use std::{fs, path::Path, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use skw_split_channel::DEFAULT_MAX_PAYLOAD_BYTES;
use skw_split_crypto::SharedSecret;
use skw_split_payload::SegmentId;

use crate::error::SplitError;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(200);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10);
pub const DEFAULT_POLL_DEADLINE: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_LEARNING_RATE: f32 = 0.01;

const ENV_PREFIX: &str = "SKW_SPLIT_";

/// Everything a pair of segments needs before the first round. Built once at
/// startup and handed to the constructors.
#[derive(Debug, Clone)]
pub struct SplitConfig {
    pub segment_a: SegmentId,
    pub segment_b: SegmentId,
    pub shared_secret: SharedSecret,

    /// send attempts per envelope, the first one included
    pub max_retries: u32,
    /// delay before the second attempt; doubled for every further one
    pub retry_backoff: Duration,
    pub max_backoff: Duration,
    pub poll_deadline: Duration,
    pub poll_interval: Duration,

    pub learning_rate: f32,
    pub seed: u64,
    pub max_payload_bytes: usize,
}

/// On-disk / environment shape of [`SplitConfig`]. Durations are in
/// milliseconds, the secret is hex.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawConfig {
    pub segment_a: Option<String>,
    pub segment_b: Option<String>,
    pub shared_secret: Option<String>,

    pub max_retries: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub poll_deadline_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,

    pub learning_rate: Option<f32>,
    pub seed: Option<u64>,
    pub max_payload_bytes: Option<usize>,
}

impl SplitConfig {
    /// A config with every tunable at its default.
    pub fn new(segment_a: SegmentId, segment_b: SegmentId, shared_secret: SharedSecret) -> Self {
        Self {
            segment_a,
            segment_b,
            shared_secret,

            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            poll_deadline: DEFAULT_POLL_DEADLINE,
            poll_interval: DEFAULT_POLL_INTERVAL,

            learning_rate: DEFAULT_LEARNING_RATE,
            seed: 0,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    /// Load `SKW_SPLIT_*` variables, reading a `.env` file first if present.
    pub fn from_env() -> Result<Self, SplitError> {
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SplitError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| SplitError::Configuration(format!("cannot read {}: {}", path.display(), e)))?;
        let raw: RawConfig = serde_json::from_str(&raw)
            .map_err(|e| SplitError::Configuration(format!("cannot parse {}: {}", path.display(), e)))?;
        Self::from_raw(raw)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, SplitError>
        where F: Fn(&str) -> Option<String>
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        Self::from_raw(RawConfig {
            segment_a: get("SEGMENT_A"),
            segment_b: get("SEGMENT_B"),
            shared_secret: get("SHARED_SECRET"),

            max_retries: parse_var("MAX_RETRIES", get("MAX_RETRIES"))?,
            retry_backoff_ms: parse_var("RETRY_BACKOFF_MS", get("RETRY_BACKOFF_MS"))?,
            max_backoff_ms: parse_var("MAX_BACKOFF_MS", get("MAX_BACKOFF_MS"))?,
            poll_deadline_ms: parse_var("POLL_DEADLINE_MS", get("POLL_DEADLINE_MS"))?,
            poll_interval_ms: parse_var("POLL_INTERVAL_MS", get("POLL_INTERVAL_MS"))?,

            learning_rate: parse_var("LEARNING_RATE", get("LEARNING_RATE"))?,
            seed: parse_var("SEED", get("SEED"))?,
            max_payload_bytes: parse_var("MAX_PAYLOAD_BYTES", get("MAX_PAYLOAD_BYTES"))?,
        })
    }

    pub fn from_raw(raw: RawConfig) -> Result<Self, SplitError> {
        let segment_a = raw.segment_a
            .ok_or_else(|| missing("segment_a"))?;
        let segment_b = raw.segment_b
            .ok_or_else(|| missing("segment_b"))?;
        let shared_secret = raw.shared_secret
            .ok_or_else(|| missing("shared_secret"))?;
        let shared_secret = SharedSecret::from_hex(&shared_secret)
            .map_err(SplitError::Configuration)?;

        let mut config = Self::new(segment_a.into(), segment_b.into(), shared_secret);
        if let Some(v) = raw.max_retries { config.max_retries = v; }
        if let Some(v) = raw.retry_backoff_ms { config.retry_backoff = Duration::from_millis(v); }
        if let Some(v) = raw.max_backoff_ms { config.max_backoff = Duration::from_millis(v); }
        if let Some(v) = raw.poll_deadline_ms { config.poll_deadline = Duration::from_millis(v); }
        if let Some(v) = raw.poll_interval_ms { config.poll_interval = Duration::from_millis(v); }
        if let Some(v) = raw.learning_rate { config.learning_rate = v; }
        if let Some(v) = raw.seed { config.seed = v; }
        if let Some(v) = raw.max_payload_bytes { config.max_payload_bytes = v; }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SplitError> {
        let invalid = |reason: &str| Err(SplitError::Configuration(reason.to_string()));

        if !self.segment_a.is_valid() || !self.segment_b.is_valid() {
            return invalid("segment ids must be non-empty and contain no '/' or whitespace");
        }
        if self.segment_a == self.segment_b {
            return invalid("segment_a and segment_b must differ");
        }
        if self.max_retries == 0 {
            return invalid("max_retries must be at least 1");
        }
        if self.poll_interval.is_zero() {
            return invalid("poll_interval must be positive");
        }
        if self.poll_interval > self.poll_deadline {
            return invalid("poll_interval must not exceed poll_deadline");
        }
        if self.retry_backoff > self.max_backoff {
            return invalid("retry_backoff must not exceed max_backoff");
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return invalid("learning_rate must be a positive number");
        }
        if self.max_payload_bytes == 0 {
            return invalid("max_payload_bytes must be positive");
        }
        Ok(())
    }
}

fn missing(name: &str) -> SplitError {
    SplitError::Configuration(format!("{} is not set", name))
}

fn parse_var<T>(name: &str, value: Option<String>) -> Result<Option<T>, SplitError>
    where T: FromStr, T::Err: std::fmt::Display
{
    value
        .map(|v| v.trim().parse::<T>().map_err(|e| {
            SplitError::Configuration(format!("{}{}: {}", ENV_PREFIX, name, e))
        }))
        .transpose()
}

use crate::{error::CacheError, types::{DEFAULT_GC_INTERVAL, DEFAULT_GC_TIME, DEFAULT_STALE_TIME}};
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::{fmt::Display, time::Duration};
use tracing::debug;

pub const ENV_STALE_TIME_MS: &str = "SWR_CACHE_STALE_TIME_MS";
pub const ENV_GC_TIME_MS: &str = "SWR_CACHE_GC_TIME_MS";
pub const ENV_GC_INTERVAL_MS: &str = "SWR_CACHE_GC_INTERVAL_MS";
pub const ENV_DEDUPE: &str = "SWR_CACHE_DEDUPE";

/// Serializable cache settings. Durations are in milliseconds.
///
/// Missing fields take their defaults: 5 minutes of freshness, 10 minutes of retention, a sweep every minute and
/// de-duplication on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    #[garde(skip)]
    pub stale_time_ms: u64,

    #[garde(custom(Self::not_less_than("stale_time_ms", &self.stale_time_ms)))]
    pub gc_time_ms: u64,

    #[garde(range(min = 1))]
    pub gc_interval_ms: u64,

    #[garde(skip)]
    pub dedupe: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_time_ms:  DEFAULT_STALE_TIME.as_millis() as u64,
            gc_time_ms:     DEFAULT_GC_TIME.as_millis() as u64,
            gc_interval_ms: DEFAULT_GC_INTERVAL.as_millis() as u64,
            dedupe:         true,
        }
    }
}

impl CacheConfig {
    fn not_less_than<'a, T: PartialOrd + Display>(
        min_name: &'static str,
        min: &'a T,
    ) -> impl FnOnce(&'a T, &()) -> garde::Result {
        move |value, _| {
            if value < min {
                Err(garde::Error::new(format!(
                    "{} is less than {min_name} ({})",
                    *value, *min
                )))
            }
            else {
                Ok(())
            }
        }
    }

    pub fn from_json(json: &str) -> Result<Self, CacheError> {
        let config: Self = serde_json::from_str(json).map_err(|err| CacheError::InvalidConfig(err.to_string()))?;
        config.validated()
    }

    /// Defaults overridden by whatever `SWR_CACHE_*` environment variables are set.
    pub fn from_env() -> Result<Self, CacheError> {
        let mut config = Self::default();
        if let Some(v) = Self::env_var(ENV_STALE_TIME_MS)? {
            config.stale_time_ms = v;
        }
        if let Some(v) = Self::env_var(ENV_GC_TIME_MS)? {
            config.gc_time_ms = v;
        }
        if let Some(v) = Self::env_var(ENV_GC_INTERVAL_MS)? {
            config.gc_interval_ms = v;
        }
        if let Some(v) = Self::env_var(ENV_DEDUPE)? {
            config.dedupe = v;
        }
        config.validated()
    }

    fn env_var<T>(name: &str) -> Result<Option<T>, CacheError>
    where
        T: std::str::FromStr,
        T::Err: Display,
    {
        match std::env::var(name) {
            Ok(raw) => {
                debug!("Cache config override from {name}: {raw}");
                raw.trim()
                    .parse()
                    .map(Some)
                    .map_err(|err| CacheError::InvalidConfig(format!("{name}: {err}")))
            }
            Err(_) => Ok(None),
        }
    }

    pub fn validated(self) -> Result<Self, CacheError> {
        self.validate()?;
        Ok(self)
    }

    #[inline]
    pub fn stale_time(&self) -> Duration {
        Duration::from_millis(self.stale_time_ms)
    }

    #[inline]
    pub fn gc_time(&self) -> Duration {
        Duration::from_millis(self.gc_time_ms)
    }

    #[inline]
    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }
}

//! threadgrid.toml configuration parser.
//!
//! The file mirrors the three concerns of the pool: how many threads
//! exist (`[pool]`), how that number changes (`[scaling]`), and what
//! the embedded runtime is primed with (`[runtime]`). Every key is
//! optional; [`ThreadgridConfig::resolve`] fills in defaults and
//! validates the result into [`Settings`].

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadgridConfig {
    pub pool: Option<PoolConfig>,
    pub scaling: Option<ScalingConfig>,
    pub runtime: Option<RuntimeConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    pub min_threads: Option<usize>,
    pub max_threads: Option<MaxThreadsValue>,
    pub memory_budget: Option<String>,
}

/// Raw `max_threads` value: an integer or the keyword `"auto"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaxThreadsValue {
    Count(i64),
    Keyword(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScalingConfig {
    pub min_stall_time: Option<String>,
    pub cpu_probe_time: Option<String>,
    pub max_cpu_usage: Option<f64>,
    pub downscale_interval: Option<String>,
    pub max_idle_time: Option<String>,
    pub max_deactivations_per_tick: Option<usize>,
    pub reclaim_policy: Option<ReclaimPolicy>,
    pub stall_queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub disable_timeouts: Option<bool>,
    pub overrides: Option<BTreeMap<String, String>>,
}

/// Effective maximum thread count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxThreads {
    /// Derive from system memory and the per-thread memory budget.
    Auto,
    /// Explicit cap.
    Fixed(usize),
}

/// What the downscale loop does with an idle autoscaled slot.
///
/// Some runtime extensions leak resources when a runtime instance is
/// booted and torn down repeatedly, so the default keeps the instance
/// booted and parks the slot. `Stop` performs a full teardown and
/// returns the slot to `Reserved`; it is the more memory-efficient
/// choice once the embedded runtime no longer leaks on restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReclaimPolicy {
    /// Ready → Inactive; the runtime instance stays booted.
    #[default]
    Park,
    /// Ready → ShuttingDown → Reserved; the runtime instance is torn down.
    Stop,
}

/// Validated pool sizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    /// Threads booted eagerly at startup; autoscaling never drops below.
    pub min_threads: usize,
    pub max_threads: MaxThreads,
    /// Per-thread memory budget in bytes. `None` defers to the runtime.
    pub memory_budget: Option<i64>,
}

impl PoolSettings {
    /// Explicit sizing with no memory budget override.
    pub fn new(min_threads: usize, max_threads: MaxThreads) -> Self {
        Self {
            min_threads,
            max_threads,
            memory_budget: None,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        let min_threads = default_min_threads();
        Self::new(min_threads, MaxThreads::Fixed(min_threads))
    }
}

/// Validated autoscaler tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingSettings {
    /// A work item must be stalled at least this long before it can
    /// trigger a scale-up.
    pub min_stall_time: Duration,
    /// Sampling window for the CPU probe.
    pub cpu_probe_time: Duration,
    /// Do not scale above this CPU usage (0.0-1.0].
    pub max_cpu_usage: f64,
    /// Downscale tick; also the upscale loop's wake-up when at capacity.
    pub downscale_interval: Duration,
    /// Autoscaled slots idle for longer than this are reclaimed.
    pub max_idle_time: Duration,
    /// Upper bound on reclaimed slots per downscale tick.
    pub max_deactivations_per_tick: usize,
    pub reclaim_policy: ReclaimPolicy,
    /// Signals beyond this are dropped while the upscale loop is busy.
    pub stall_queue_capacity: usize,
}

impl Default for ScalingSettings {
    fn default() -> Self {
        Self {
            min_stall_time: Duration::from_millis(5),
            cpu_probe_time: Duration::from_millis(120),
            max_cpu_usage: 0.8,
            downscale_interval: Duration::from_secs(5),
            max_idle_time: Duration::from_secs(5),
            max_deactivations_per_tick: 10,
            reclaim_policy: ReclaimPolicy::Park,
            stall_queue_capacity: 1,
        }
    }
}

/// Settings handed to the embedded runtime at environment priming.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub disable_timeouts: bool,
    pub overrides: BTreeMap<String, String>,
}

/// The fully resolved configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    pub pool: PoolSettings,
    pub scaling: ScalingSettings,
    pub runtime: RuntimeSettings,
}

impl ThreadgridConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Scaffold a config with every default spelled out.
    pub fn scaffold(min_threads: usize) -> Self {
        let defaults = ScalingSettings::default();
        ThreadgridConfig {
            pool: Some(PoolConfig {
                min_threads: Some(min_threads),
                max_threads: Some(MaxThreadsValue::Keyword("auto".to_string())),
                memory_budget: None,
            }),
            scaling: Some(ScalingConfig {
                min_stall_time: Some("5ms".to_string()),
                cpu_probe_time: Some("120ms".to_string()),
                max_cpu_usage: Some(defaults.max_cpu_usage),
                downscale_interval: Some("5s".to_string()),
                max_idle_time: Some("5s".to_string()),
                max_deactivations_per_tick: Some(defaults.max_deactivations_per_tick),
                reclaim_policy: Some(defaults.reclaim_policy),
                stall_queue_capacity: Some(defaults.stall_queue_capacity),
            }),
            runtime: None,
        }
    }

    /// Apply defaults and validate every section.
    pub fn resolve(&self) -> ConfigResult<Settings> {
        Ok(Settings {
            pool: self.resolve_pool()?,
            scaling: self.resolve_scaling()?,
            runtime: self.resolve_runtime(),
        })
    }

    fn resolve_pool(&self) -> ConfigResult<PoolSettings> {
        let raw = self.pool.clone().unwrap_or_default();

        let min_threads = raw.min_threads.unwrap_or_else(default_min_threads);
        if min_threads == 0 {
            return Err(ConfigError::Invalid {
                key: "pool.min_threads",
                reason: "at least one thread is required".to_string(),
            });
        }

        let max_threads = match raw.max_threads {
            None => MaxThreads::Fixed(min_threads),
            Some(MaxThreadsValue::Count(n)) if n < 0 => MaxThreads::Auto,
            Some(MaxThreadsValue::Count(n)) => MaxThreads::Fixed(n as usize),
            Some(MaxThreadsValue::Keyword(k)) if k.eq_ignore_ascii_case("auto") => MaxThreads::Auto,
            Some(MaxThreadsValue::Keyword(k)) => {
                return Err(ConfigError::Invalid {
                    key: "pool.max_threads",
                    reason: format!("expected an integer or \"auto\", got `{k}`"),
                });
            }
        };

        let memory_budget = raw.memory_budget.as_deref().map(parse_size).transpose()?;

        Ok(PoolSettings {
            min_threads,
            max_threads,
            memory_budget,
        })
    }

    fn resolve_scaling(&self) -> ConfigResult<ScalingSettings> {
        let raw = self.scaling.clone().unwrap_or_default();
        let defaults = ScalingSettings::default();

        let duration_or = |value: &Option<String>,
                           default: Duration,
                           key: &'static str|
         -> ConfigResult<Duration> {
            let d = match value {
                Some(s) => parse_duration(s)?,
                None => default,
            };
            if d.is_zero() {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be greater than zero".to_string(),
                });
            }
            Ok(d)
        };

        let max_cpu_usage = raw.max_cpu_usage.unwrap_or(defaults.max_cpu_usage);
        if !(max_cpu_usage > 0.0 && max_cpu_usage <= 1.0) {
            return Err(ConfigError::Invalid {
                key: "scaling.max_cpu_usage",
                reason: format!("must be within (0, 1], got {max_cpu_usage}"),
            });
        }

        let stall_queue_capacity = raw
            .stall_queue_capacity
            .unwrap_or(defaults.stall_queue_capacity);
        if stall_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "scaling.stall_queue_capacity",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(ScalingSettings {
            min_stall_time: duration_or(
                &raw.min_stall_time,
                defaults.min_stall_time,
                "scaling.min_stall_time",
            )?,
            cpu_probe_time: duration_or(
                &raw.cpu_probe_time,
                defaults.cpu_probe_time,
                "scaling.cpu_probe_time",
            )?,
            max_cpu_usage,
            downscale_interval: duration_or(
                &raw.downscale_interval,
                defaults.downscale_interval,
                "scaling.downscale_interval",
            )?,
            max_idle_time: duration_or(
                &raw.max_idle_time,
                defaults.max_idle_time,
                "scaling.max_idle_time",
            )?,
            max_deactivations_per_tick: raw
                .max_deactivations_per_tick
                .unwrap_or(defaults.max_deactivations_per_tick),
            reclaim_policy: raw.reclaim_policy.unwrap_or_default(),
            stall_queue_capacity,
        })
    }

    fn resolve_runtime(&self) -> RuntimeSettings {
        let raw = self.runtime.clone().unwrap_or_default();
        RuntimeSettings {
            disable_timeouts: raw.disable_timeouts.unwrap_or(false),
            overrides: raw.overrides.unwrap_or_default(),
        }
    }
}

/// Two threads per available CPU.
pub fn default_min_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * 2
}

/// Parse a duration string like "5ms", "30s", "5m".
pub fn parse_duration(s: &str) -> ConfigResult<Duration> {
    let s = s.trim();
    let invalid = || ConfigError::Duration(s.to_string());

    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().map(Duration::from_millis).map_err(|_| invalid())
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().map(Duration::from_secs).map_err(|_| invalid())
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
            .ok_or_else(invalid)
    } else {
        Err(invalid())
    }
}

/// Parse a size in the runtime's shorthand ("512K", "128M", "1G", "-1").
///
/// Negative values mean "unlimited" and are returned as-is; the capacity
/// estimator treats any non-positive budget as unknown.
pub fn parse_size(s: &str) -> ConfigResult<i64> {
    let s = s.trim();
    let invalid = || ConfigError::Size(s.to_string());

    let (digits, multiplier) = match s.chars().last() {
        Some('k' | 'K') => (&s[..s.len() - 1], 1024),
        Some('m' | 'M') => (&s[..s.len() - 1], 1024 * 1024),
        Some('g' | 'G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        Some(_) => (s, 1),
        None => return Err(invalid()),
    };

    let value = digits.trim().parse::<i64>().map_err(|_| invalid())?;
    value.checked_mul(multiplier).ok_or_else(invalid)
}

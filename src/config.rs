use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the statsink daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// UDP port for statsd ingress. Default: 8125.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graphite host:port for flushed payloads.
    #[serde(default)]
    pub graphite_addr: String,

    /// Prefix for series emitted from the main store.
    #[serde(default)]
    pub namespace: String,

    /// Prefix for series merged from forwarding leaves.
    #[serde(default)]
    pub forwarded_namespace: String,

    /// Aggregation window length, shared by all flush loops. Default: 10s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Drop gauges and sets at flush boundaries instead of carrying them
    /// into the next window. Default: false.
    #[serde(default)]
    pub clear_stats_between_flushes: bool,

    /// Percentiles emitted for timers as `upper_<p>` series. Default: [90.0].
    #[serde(default = "default_timer_percentiles")]
    pub timer_percentiles: Vec<f64>,

    /// Upstream statsink host:port. Setting this enables the leaf role:
    /// counters marked with the `f|` prefix are forwarded there.
    #[serde(default)]
    pub forwarding_addr: Option<String>,

    /// TCP listen address for forwarded frames. Setting this enables the
    /// upstream role.
    #[serde(default)]
    pub forwarder_listen_addr: Option<String>,

    /// Local TCP port for the operator debug tap. Disabled when unset.
    #[serde(default)]
    pub debug_port: Option<u16>,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> u16 {
    8125
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_timer_percentiles() -> Vec<f64> {
    vec![90.0]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            port: default_port(),
            graphite_addr: String::new(),
            namespace: String::new(),
            forwarded_namespace: String::new(),
            flush_interval: default_flush_interval(),
            clear_stats_between_flushes: false,
            timer_percentiles: default_timer_percentiles(),
            forwarding_addr: None,
            forwarder_listen_addr: None,
            debug_port: None,
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.graphite_addr.is_empty() {
            bail!("graphite_addr is required");
        }

        if self.namespace.is_empty() {
            bail!("namespace is required");
        }

        if self.flush_interval.is_zero() {
            bail!("flush_interval must be positive");
        }

        if self.forwarder_listen_addr.is_some() && self.forwarded_namespace.is_empty() {
            bail!("forwarded_namespace is required when forwarder_listen_addr is set");
        }

        if let Some(addr) = &self.forwarding_addr {
            if addr.is_empty() {
                bail!("forwarding_addr must not be empty when set");
            }
        }

        for &p in &self.timer_percentiles {
            if !(0.0 < p && p < 100.0) {
                bail!("timer percentile {p} is outside (0, 100)");
            }
        }

        Ok(())
    }

    /// Whether this instance forwards marked counters to an upstream.
    pub fn forwarding_enabled(&self) -> bool {
        self.forwarding_addr.is_some()
    }

    /// Whether this instance accepts forwarded frames from leaves.
    pub fn forwarder_enabled(&self) -> bool {
        self.forwarder_listen_addr.is_some()
    }
}

//! Configuration surface consumed from an external loader (spec §6.2)
//!
//! TOML parsing itself is a thin adapter per spec §1 — not the engineering
//! challenge — but the core still owns the shape of the config and the
//! cross-group validation spec §3/§7 require before any cluster worker
//! starts.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    Session,
    Basic,
}

/// Either a multiplier applied to a key's native interval, or an absolute
/// duration, per spec §3 ("StatGroup").
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IntervalSpec {
    Multiplier(f64),
    Absolute(Duration),
}

impl<'de> Deserialize<'de> for IntervalSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(f64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(m) => Ok(IntervalSpec::Multiplier(m)),
            Repr::Text(s) => parse_duration_suffix(&s)
                .map(IntervalSpec::Absolute)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid interval '{s}'"))),
        }
    }
}

fn parse_duration_suffix(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (num_part, unit) = if let Some(n) = s.strip_suffix("ms") {
        (n, "ms")
    } else if let Some(n) = s.strip_suffix('s') {
        (n, "s")
    } else if let Some(n) = s.strip_suffix('m') {
        (n, "m")
    } else if let Some(n) = s.strip_suffix('h') {
        (n, "h")
    } else {
        (s, "s")
    };
    let n: f64 = num_part.trim().parse().ok()?;
    let secs = match unit {
        "ms" => n / 1000.0,
        "s" => n,
        "m" => n * 60.0,
        "h" => n * 3600.0,
        _ => return None,
    };
    if secs < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(secs))
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatGroupConfig {
    pub name: String,
    pub interval: IntervalSpec,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SummaryToggles {
    #[serde(default)]
    pub protocol: bool,
    #[serde(default)]
    pub client: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub hostname: String,
    pub username: String,
    pub password: String,
    pub authtype: AuthType,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub preserve_case: Option<bool>,
    #[serde(default)]
    pub prometheus_port: Option<u16>,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    8080
}

impl ClusterConfig {
    /// Resolve an `env:VARNAME`-indirected password against the process
    /// environment (spec §6.2: "may be indirected via env"). Anything else
    /// is returned literally.
    pub fn resolve_password(&self) -> Result<String, ConfigError> {
        match self.password.strip_prefix("env:") {
            Some(var) => std::env::var(var)
                .map_err(|_| ConfigError::MissingEnvPassword(var.to_string())),
            None => Ok(self.password.clone()),
        }
    }

    /// Whether cluster names should keep their original casing, falling
    /// back to the global default when this cluster doesn't override it
    /// (spec §9 "Case normalization").
    pub fn effective_preserve_case(&self, global_default: bool) -> bool {
        self.preserve_case.unwrap_or(global_default)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    pub min_update_interval: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
    #[serde(default = "default_max_retries")]
    pub stats_processor_max_retries: i64,
    #[serde(default = "default_retry_interval")]
    pub stats_processor_retry_interval_secs: u64,
    #[serde(default)]
    pub include_degraded: bool,
    #[serde(default)]
    pub preserve_case: bool,
    #[serde(default)]
    pub summary: SummaryToggles,
    pub clusters: Vec<ClusterConfig>,
    #[serde(default)]
    pub stat_groups: Vec<StatGroupConfig>,
}

fn default_max_retries() -> i64 {
    0
}

fn default_retry_interval() -> u64 {
    5
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("no stat groups configured")]
    NoStatGroups,
    #[error("key '{0}' appears in more than one active stat group")]
    DuplicateKey(String),
    #[error("missing required environment variable '{0}' for an env-indirected password")]
    MissingEnvPassword(String),
}

impl GlobalConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: GlobalConfig = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Enforce spec §3's "buckets never overlap in their key set" /
    /// §7's "zero stat groups" invalid-config cases.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stat_groups.is_empty() {
            return Err(ConfigError::NoStatGroups);
        }
        let mut seen = HashSet::new();
        for group in &self.stat_groups {
            for key in &group.keys {
                if !seen.insert(key.clone()) {
                    return Err(ConfigError::DuplicateKey(key.clone()));
                }
            }
        }
        Ok(())
    }

    pub fn min_update_interval(&self) -> Duration {
        Duration::from_secs(self.min_update_interval)
    }
}

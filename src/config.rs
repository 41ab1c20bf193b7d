//! Configuration for the orchestration layer.
//!
//! Topology is static and defined once at process start: queue concurrency,
//! attempt/backoff defaults, dedup and lock TTLs, monitor cadence. Not
//! hot-reloadable, which is accepted given deployment cadence.

use crate::{
    Result,
    broker::BackoffPolicy,
    error::SwitchyardError,
    job::QueueName,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, time::Duration};

/// Serialize `std::time::Duration` as human-readable strings ("30s", "5m").
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let secs = duration.as_secs();
        if secs == 0 {
            serializer.serialize_str("0s")
        } else if secs % 3600 == 0 {
            serializer.serialize_str(&format!("{}h", secs / 3600))
        } else if secs % 60 == 0 {
            serializer.serialize_str(&format!("{}m", secs / 60))
        } else {
            serializer.serialize_str(&format!("{}s", secs))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(D::Error::custom)
    }

    pub(super) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();

        // Bare numbers are seconds.
        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        if s.len() < 2 {
            return Err(format!("Invalid duration format: {}", s));
        }

        let (num_str, suffix) = s.split_at(s.len() - 1);
        let num: u64 = num_str
            .parse()
            .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

        match suffix {
            "s" => Ok(Duration::from_secs(num)),
            "m" => Ok(Duration::from_secs(num * 60)),
            "h" => Ok(Duration::from_secs(num * 3600)),
            "d" => Ok(Duration::from_secs(num * 86400)),
            _ => Err(format!(
                "Invalid duration suffix: {}. Use s, m, h, or d",
                suffix
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Concurrency per named queue, keyed by queue name string.
    pub queues: HashMap<String, usize>,

    /// Attempt budget applied when an enqueue specifies none.
    pub default_attempts: u32,

    pub default_backoff: BackoffPolicy,

    /// Safety-net expiry on dedup keys, covering the crash window between
    /// dispatch and settlement.
    #[serde(with = "duration_secs")]
    pub dedup_ttl: Duration,

    /// Default TTL for singleton-operation locks. Size with generous headroom
    /// over the protected operation's worst case.
    #[serde(with = "duration_secs")]
    pub lock_ttl: Duration,

    #[serde(with = "duration_secs")]
    pub monitor_interval: Duration,

    /// Warn once coordination store memory crosses this many bytes.
    pub monitor_warn_bytes: Option<u64>,

    /// Settled items each queue retains before evicting the oldest.
    pub settled_retention: usize,

    /// Worker idle poll interval.
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            queues: crate::registry::default_topology()
                .into_iter()
                .map(|(queue, n)| (queue.as_str().to_string(), n))
                .collect(),
            default_attempts: 3,
            default_backoff: BackoffPolicy::default(),
            dedup_ttl: Duration::from_secs(6 * 3600),
            lock_ttl: Duration::from_secs(10 * 60),
            monitor_interval: Duration::from_secs(60),
            monitor_warn_bytes: None,
            settled_retention: 1_000,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Typed queue topology. Unknown queue names and zero concurrency are
    /// configuration errors.
    pub fn topology(&self) -> Result<HashMap<QueueName, usize>> {
        let mut topology = HashMap::new();
        for (name, concurrency) in &self.queues {
            let queue: QueueName = name.parse().map_err(|_| {
                SwitchyardError::Config(format!("unknown queue in config: '{}'", name))
            })?;
            topology.insert(queue, *concurrency);
        }
        Ok(topology)
    }

    pub fn validate(&self) -> Result<()> {
        let topology = self.topology()?;
        for queue in QueueName::ALL {
            match topology.get(&queue) {
                None => {
                    return Err(SwitchyardError::Config(format!(
                        "queue '{}' missing from config",
                        queue
                    )));
                }
                Some(0) => {
                    return Err(SwitchyardError::Config(format!(
                        "queue '{}' has concurrency 0",
                        queue
                    )));
                }
                Some(_) => {}
            }
        }
        if self.default_attempts == 0 {
            return Err(SwitchyardError::Config(
                "default_attempts must be at least 1".to_string(),
            ));
        }
        if self.lock_ttl.is_zero() {
            return Err(SwitchyardError::Config(
                "lock_ttl must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = OrchestratorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.topology().unwrap().len(), QueueName::ALL.len());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = OrchestratorConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed = OrchestratorConfig::from_toml(&toml_str).unwrap();
        assert_eq!(parsed.queues, config.queues);
        assert_eq!(parsed.dedup_ttl, config.dedup_ttl);
        assert_eq!(parsed.default_backoff, config.default_backoff);
    }

    #[test]
    fn test_missing_queue_rejected() {
        let mut config = OrchestratorConfig::default();
        config.queues.remove("microsite");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("microsite"));
    }

    #[test]
    fn test_unknown_queue_rejected() {
        let mut config = OrchestratorConfig::default();
        config.queues.insert("mystery".to_string(), 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = OrchestratorConfig::default();
        config.queues.insert("seo".to_string(), 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_parsing() {
        assert_eq!(
            duration_secs::parse_duration("30s").unwrap(),
            Duration::from_secs(30)
        );
        assert_eq!(
            duration_secs::parse_duration("5m").unwrap(),
            Duration::from_secs(300)
        );
        assert_eq!(
            duration_secs::parse_duration("2h").unwrap(),
            Duration::from_secs(7200)
        );
        assert_eq!(
            duration_secs::parse_duration("90").unwrap(),
            Duration::from_secs(90)
        );
        assert!(duration_secs::parse_duration("5x").is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchyard.toml");

        let config = OrchestratorConfig::default();
        config.save_to_file(&path).unwrap();
        let loaded = OrchestratorConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.queues, config.queues);
    }
}

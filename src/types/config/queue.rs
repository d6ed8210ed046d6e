//! Process configuration, loaded once at startup and passed to constructors.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::queue::{LeaseSort, QueueItemType};
use crate::recovery::RecoverySettings;
use crate::scheduling::SchedulingPolicy;
use crate::types::config::network::NetworkConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub protocols: Vec<String>,
    pub networks: Vec<NetworkConfig>,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub lock_recovery: LockRecoveryConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default = "default_database_url_env_var")]
    pub database_url_env_var: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulingConfig {
    #[serde(default)]
    pub policy: SchedulingPolicy,
    /// Per `(protocol, network)` pair.
    #[serde(default = "default_max_concurrent_tasks")]
    pub maximum_concurrent_tasks: usize,
    #[serde(default = "default_eligibility_gating")]
    pub eligibility_gating: bool,
    /// Types to schedule, in rotation order.
    #[serde(default = "default_types")]
    pub types: Vec<QueueItemType>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Lease order within a round.
    #[serde(default)]
    pub lease_sort: LeaseSort,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockRecoveryConfig {
    #[serde(default = "default_lock_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_staleness_minutes")]
    pub staleness_minutes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_rescrape_block_step")]
    pub rescrape_block_step: u64,
}

fn default_database_url_env_var() -> String {
    "DATABASE_URL".to_string()
}

fn default_max_connections() -> usize {
    16
}

fn default_max_concurrent_tasks() -> usize {
    4
}

fn default_eligibility_gating() -> bool {
    true
}

fn default_types() -> Vec<QueueItemType> {
    QueueItemType::ALL.to_vec()
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_lock_interval_secs() -> u64 {
    300
}

fn default_staleness_minutes() -> u64 {
    15
}

fn default_rescrape_block_step() -> u64 {
    crate::recovery::dispatcher::DEFAULT_RESCRAPE_BLOCK_STEP
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            policy: SchedulingPolicy::default(),
            maximum_concurrent_tasks: default_max_concurrent_tasks(),
            eligibility_gating: default_eligibility_gating(),
            types: default_types(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_sort: LeaseSort::default(),
        }
    }
}

impl Default for LockRecoveryConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_lock_interval_secs(),
            staleness_minutes: default_staleness_minutes(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            rescrape_block_step: default_rescrape_block_step(),
        }
    }
}

impl SchedulingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl LockRecoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_minutes * 60)
    }
}

impl QueueConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file at {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: QueueConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.protocols.is_empty() {
            anyhow::bail!("at least one protocol must be configured");
        }
        if self.networks.is_empty() {
            anyhow::bail!("at least one network must be configured");
        }
        let mut seen = HashSet::new();
        for network in &self.networks {
            if !seen.insert(network.name.as_str()) {
                anyhow::bail!("network {} is configured twice", network.name);
            }
        }
        if self.recovery.rescrape_block_step == 0 {
            anyhow::bail!("recovery.rescrape_block_step must be positive");
        }
        Ok(())
    }

    pub fn recovery_settings(&self) -> RecoverySettings {
        let legacy_hypervisors: HashMap<String, HashSet<String>> = self
            .networks
            .iter()
            .map(|n| {
                (
                    n.name.clone(),
                    n.legacy_hypervisors.iter().map(|a| a.to_lowercase()).collect(),
                )
            })
            .collect();

        RecoverySettings {
            rescrape_block_step: self.recovery.rescrape_block_step,
            legacy_hypervisors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = QueueConfig::parse(
            r#"{ "protocols": ["gamma"], "networks": [{ "name": "ethereum", "rpc_url_env_var": "ETH_RPC_URL" }] }"#,
        )
        .unwrap();
        assert_eq!(config.scheduling.policy, SchedulingPolicy::RoundRobin);
        assert_eq!(config.scheduling.maximum_concurrent_tasks, 4);
        assert!(config.scheduling.eligibility_gating);
        assert_eq!(config.scheduling.lease_sort, LeaseSort::AttemptsThenAge);
        assert_eq!(config.scheduling.types.len(), QueueItemType::ALL.len());
        assert_eq!(config.lock_recovery.staleness(), Duration::from_secs(900));
        assert_eq!(config.recovery.rescrape_block_step, 1000);
        assert_eq!(config.database_url_env_var, "DATABASE_URL");
        assert_eq!(config.networks[0].rpc_max_retries, None);
    }

    #[test]
    fn test_full_config() {
        let config = QueueConfig::parse(
            r#"{
                "protocols": ["gamma"],
                "networks": [{
                    "name": "polygon",
                    "rpc_url_env_var": "POLYGON_RPC_URL",
                    "rpc_max_retries": 2,
                    "legacy_hypervisors": ["0xABC"]
                }],
                "scheduling": {
                    "policy": "latest-excluded",
                    "maximum_concurrent_tasks": 2,
                    "eligibility_gating": false,
                    "types": ["block", "latest_reward_snapshot"],
                    "lease_sort": "age"
                },
                "recovery": { "rescrape_block_step": 500 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.scheduling.policy, SchedulingPolicy::LatestExcluded);
        assert_eq!(config.networks[0].rpc_max_retries, Some(2));
        assert_eq!(config.scheduling.lease_sort, LeaseSort::Age);
        assert_eq!(
            config.scheduling.types,
            vec![QueueItemType::Block, QueueItemType::LatestRewardSnapshot]
        );

        let settings = config.recovery_settings();
        assert_eq!(settings.rescrape_block_step, 500);
        assert!(settings.is_legacy("polygon", "0xabc"));
        assert!(!settings.is_legacy("ethereum", "0xabc"));
    }

    #[test]
    fn test_rejects_duplicate_networks_and_unknown_types() {
        let duplicate = r#"{ "protocols": ["gamma"], "networks": [
            { "name": "ethereum", "rpc_url_env_var": "A" },
            { "name": "ethereum", "rpc_url_env_var": "B" }
        ] }"#;
        assert!(QueueConfig::parse(duplicate).is_err());

        let bad_type = r#"{ "protocols": ["gamma"],
            "networks": [{ "name": "ethereum", "rpc_url_env_var": "A" }],
            "scheduling": { "types": ["teleport"] } }"#;
        assert!(QueueConfig::parse(bad_type).is_err());
    }
}

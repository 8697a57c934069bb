//! Node and load-balancer configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Coordinates;

/// Which decision-engine variant the scheduler runs
/// (`scheduling.policy.version`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnginePolicy {
    Mem,
    #[default]
    Flux,
}

impl FromStr for EnginePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mem" => Ok(EnginePolicy::Mem),
            "flux" => Ok(EnginePolicy::Flux),
            other => Err(format!("unknown scheduling policy version: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// `api.port`
    pub api_port: u16,
    /// `scheduling.policy.version`
    pub scheduling_policy: EnginePolicy,
    /// `container.expiration.time`, seconds
    pub container_expiration_secs: u64,
    /// `mab.agent.enabled`
    pub mab_agent_enabled: bool,
    /// `mab.agent.interval`, seconds
    pub mab_agent_interval_secs: u64,
    /// Seconds between target-list refreshes in the LB proxy.
    pub target_refresh_secs: u64,
    /// Registry region this process registers under and discovers peers in.
    pub region: String,
    /// Host other processes reach this one at.
    pub advertised_host: String,
    /// Remote cloud peer invocations are offloaded to.
    pub cloud_url: Option<String>,
    /// CPU shares available to sandboxes on this node.
    pub total_cpus: f64,
    /// Memory available to sandboxes on this node, MB.
    pub total_mem_mb: i64,
    pub coordinates: Coordinates,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_port: 1323,
            scheduling_policy: EnginePolicy::default(),
            container_expiration_secs: 600,
            mab_agent_enabled: false,
            mab_agent_interval_secs: 300,
            target_refresh_secs: 3,
            region: "default".to_string(),
            advertised_host: "127.0.0.1".to_string(),
            cloud_url: None,
            total_cpus: 4.0,
            total_mem_mb: 4096,
            coordinates: Coordinates::default(),
        }
    }
}

impl Config {
    pub fn container_expiration(&self) -> Duration {
        Duration::from_secs(self.container_expiration_secs)
    }

    pub fn mab_agent_interval(&self) -> Duration {
        Duration::from_secs(self.mab_agent_interval_secs)
    }

    pub fn target_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.target_refresh_secs)
    }

    /// URL this process advertises in the registry.
    pub fn advertised_url(&self) -> String {
        format!("http://{}:{}", self.advertised_host, self.api_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_version_parses() {
        assert_eq!("mem".parse::<EnginePolicy>().unwrap(), EnginePolicy::Mem);
        assert_eq!("flux".parse::<EnginePolicy>().unwrap(), EnginePolicy::Flux);
        assert!("roundrobin".parse::<EnginePolicy>().is_err());
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.container_expiration(), Duration::from_secs(600));
        assert_eq!(cfg.mab_agent_interval(), Duration::from_secs(300));
        assert_eq!(cfg.target_refresh_interval(), Duration::from_secs(3));
        assert_eq!(cfg.api_port, 1323);
    }
}

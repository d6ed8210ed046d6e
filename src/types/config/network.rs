use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub rpc_url_env_var: String,
    /// Requests per second against the RPC endpoint. Unlimited when absent or 0.
    #[serde(default)]
    pub rpc_requests_per_second: Option<u32>,
    /// Retries per RPC request on transient failures. Client default when absent.
    #[serde(default)]
    pub rpc_max_retries: Option<u32>,
    /// Hypervisors whose fee accounting cannot be remediated.
    #[serde(default)]
    pub legacy_hypervisors: Vec<String>,
}

impl NetworkConfig {
    pub fn rpc_url(&self) -> anyhow::Result<String> {
        std::env::var(&self.rpc_url_env_var).map_err(|_| {
            anyhow::anyhow!(
                "{} must be set for network {}",
                self.rpc_url_env_var,
                self.name
            )
        })
    }
}

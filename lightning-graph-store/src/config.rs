use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::keys::Network;
use crate::Error;

/// Store settings
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub network: Network,
    /// remote tables are named `{table_prefix}-{table}`
    pub table_prefix: String,
    /// bytes of page cache for the embedded database
    pub embedded_cache_size: usize,
    /// attempts for writes failing with a conflict or throttling
    pub retry_attempts: usize,
    /// first retry delay, doubled on each retry
    pub retry_initial_interval: Duration,
    /// how many stale channels of a node are re-verified per lookup, and
    /// how many verifications may run at once
    pub check_limit: usize,
    /// channels updated within this window are not re-verified
    pub update_window: Duration,
    pub enrichment_concurrency: usize,
    /// how long a "not found" answer of the source is trusted
    pub unknown_ttl: Duration,
    pub history_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            network: Network::Bitcoin,
            table_prefix: "graph".to_string(),
            embedded_cache_size: 64 * 1024 * 1024,
            retry_attempts: 15,
            retry_initial_interval: Duration::from_millis(50),
            check_limit: 3,
            update_window: Duration::from_secs(24 * 60 * 60),
            enrichment_concurrency: 2,
            unknown_ttl: Duration::from_secs(60 * 60),
            history_limit: 6,
        }
    }
}

fn var<T: FromStr>(name: &str) -> Result<Option<T>, Error> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| Error::InvalidConfig(format!("{}={}", name, value))),
        Err(_) => Ok(None),
    }
}

impl StoreConfig {
    /// Defaults, overridden by `GRAPH_*` environment variables
    pub fn from_env() -> Result<Self, Error> {
        let mut config = StoreConfig::default();
        if let Some(network) = var("GRAPH_NETWORK")? {
            config.network = network;
        }
        if let Some(prefix) = var("GRAPH_TABLE_PREFIX")? {
            config.table_prefix = prefix;
        }
        if let Some(size) = var("GRAPH_CACHE_SIZE")? {
            config.embedded_cache_size = size;
        }
        if let Some(attempts) = var("GRAPH_RETRY_ATTEMPTS")? {
            config.retry_attempts = attempts;
        }
        if let Some(limit) = var("GRAPH_CHECK_LIMIT")? {
            config.check_limit = limit;
        }
        if let Some(secs) = var("GRAPH_UPDATE_WINDOW_SECS")? {
            config.update_window = Duration::from_secs(secs);
        }
        if let Some(secs) = var("GRAPH_UNKNOWN_TTL_SECS")? {
            config.unknown_ttl = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // the only test touching the process environment
    #[test]
    fn from_env() {
        env::set_var("GRAPH_NETWORK", "testnet");
        env::set_var("GRAPH_CHECK_LIMIT", "5");
        let config = StoreConfig::from_env().unwrap();
        assert_eq!(config.network, Network::Testnet);
        assert_eq!(config.check_limit, 5);
        assert_eq!(config.retry_attempts, 15);

        env::set_var("GRAPH_CHECK_LIMIT", "many");
        assert!(matches!(StoreConfig::from_env(), Err(Error::InvalidConfig(_))));
        env::remove_var("GRAPH_NETWORK");
        env::remove_var("GRAPH_CHECK_LIMIT");
    }
}

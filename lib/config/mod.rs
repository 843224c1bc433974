use std::env;

/// Connection settings read from the environment (after `.env` is loaded).
///
/// Every value can be overridden on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    /// JSON-RPC endpoint of the EVM node.
    pub node_url: Option<String>,
    pub database_url: Option<String>,
    /// Pipeline name: checkpoint slot and default topic prefix.
    pub exporter_name: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            node_url: non_empty_var("NODE_URL"),
            database_url: non_empty_var("DATABASE_URL"),
            exporter_name: non_empty_var("EXPORTER_NAME"),
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

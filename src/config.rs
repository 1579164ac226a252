//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for the local key-value store.
    pub store_root: PathBuf,
    /// Extra relay endpoints on top of the seed defaults and the persisted
    /// list.
    pub relays: Vec<String>,
    /// Optional Tor SOCKS proxy (host:port) for relay connections.
    pub tor_socks: Option<String>,
    /// Hex-encoded secret key; a fresh ephemeral identity is generated when
    /// absent.
    pub secret_key: Option<String>,
    /// Fixed interval between reconnect attempts.
    pub retry_interval: Duration,
    /// Bound on how long publish/fetch wait for at least one connected relay.
    pub connect_wait: Duration,
    /// Bound on how long a historical fetch waits for all relays to signal
    /// end of stored events.
    pub fetch_timeout: Duration,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let store_root = PathBuf::from(env::var("STORE_ROOT")?);
        let relays = csv_strings(env::var("RELAYS").unwrap_or_default());
        let tor_socks = env::var("TOR_SOCKS").ok().filter(|s| !s.is_empty());
        let secret_key = env::var("SECRET_KEY").ok().filter(|s| !s.is_empty());
        let retry_interval = Duration::from_secs(env_u64("RETRY_SECS", 5));
        let connect_wait = Duration::from_secs(env_u64("CONNECT_WAIT_SECS", 10));
        let fetch_timeout = Duration::from_secs(env_u64("FETCH_TIMEOUT_SECS", 30));
        Ok(Self {
            store_root,
            relays,
            tor_socks,
            secret_key,
            retry_interval,
            connect_wait,
            fetch_timeout,
        })
    }
}

/// Serializes tests that mutate the process environment, across modules.
#[cfg(test)]
pub(crate) static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Read a numeric environment variable, falling back to `default` when the
/// variable is absent or unparsable.
fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}

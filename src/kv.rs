//! File-backed key-value store for relay and user lists.
//!
//! Writes are best-effort side channels: connection logic never waits on or
//! fails because of a store write.

use std::{fs, path::PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

/// Store key for the persisted relay list.
pub const KEY_RELAYS: &str = "relays";
/// Store key for the persisted user list.
pub const KEY_USERS: &str = "users";

/// Seed relays that are always present; only endpoints added on top of these
/// are ever persisted.
pub const DEFAULT_RELAYS: [&str; 6] = [
    "wss://relay.angor.io",
    "wss://relay2.angor.io",
    "wss://relay.damus.io",
    "wss://nostr.mom",
    "wss://nostr.slothy.win",
    "wss://relay.stoner.com",
];

/// A tracked relay endpoint and its last known connection status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayEntry {
    pub url: String,
    pub connected: bool,
}

/// A followed user and their cached profile metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserEntry {
    pub pubkey: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
}

/// String key-value store over JSON files rooted at `root/kv`.
#[derive(Debug, Clone)]
pub struct KvStore {
    root: PathBuf,
}

impl KvStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Ensure the on-disk directory exists.
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(self.root.join("kv"))?;
        Ok(())
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join("kv").join(format!("{key}.json"))
    }

    /// Read the value stored under `key`, if any.
    pub fn get(&self, key: &str) -> Option<String> {
        fs::read_to_string(self.path(key)).ok()
    }

    /// Atomically write `value` under `key`.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path(key);
        let parent = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent)?;
        let tmp = tempfile::NamedTempFile::new_in(&parent)?;
        fs::write(tmp.path(), value)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Load the relay list: the fixed defaults followed by any persisted
/// user-added endpoints. A corrupt stored list is dropped with a warning.
pub fn load_relays(kv: &KvStore) -> Vec<RelayEntry> {
    let mut relays: Vec<RelayEntry> = DEFAULT_RELAYS
        .iter()
        .map(|url| RelayEntry {
            url: url.to_string(),
            connected: false,
        })
        .collect();
    if let Some(raw) = kv.get(KEY_RELAYS) {
        match serde_json::from_str::<Vec<RelayEntry>>(&raw) {
            Ok(stored) => {
                for entry in stored {
                    if !relays.iter().any(|r| r.url == entry.url) {
                        relays.push(entry);
                    }
                }
            }
            Err(e) => warn!(%e, "ignoring corrupt relay list"),
        }
    }
    relays
}

/// Persist the relay list. Only endpoints that are not seed defaults are
/// written, so removing the store resets to the defaults.
pub fn save_relays(kv: &KvStore, relays: &[RelayEntry]) -> Result<()> {
    let custom: Vec<&RelayEntry> = relays
        .iter()
        .filter(|r| !DEFAULT_RELAYS.contains(&r.url.as_str()))
        .collect();
    let raw = serde_json::to_string(&custom)?;
    kv.set(KEY_RELAYS, &raw)
}

/// Load the followed-user list.
pub fn load_users(kv: &KvStore) -> Vec<UserEntry> {
    match kv.get(KEY_USERS) {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(users) => users,
            Err(e) => {
                warn!(%e, "ignoring corrupt user list");
                Vec::new()
            }
        },
        None => Vec::new(),
    }
}

/// Persist the followed-user list.
pub fn save_users(kv: &KvStore, users: &[UserEntry]) -> Result<()> {
    let raw = serde_json::to_string(users)?;
    kv.set(KEY_USERS, &raw)
}

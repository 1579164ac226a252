//! Command line interface for the sync client. Supports key management,
//! publishing and fetching notes, live feeds, and relay/user list
//! maintenance.

mod client;
mod config;
mod error;
mod event;
mod keys;
mod kv;
mod pool;
mod relay;
mod subs;

use std::{fs, path::Path};

use anyhow::bail;
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use client::Client;
use config::Settings;
use event::{Filter, KIND_TEXT_NOTE};
use keys::{npub_to_hex, Keys};
use kv::{KvStore, RelayEntry, UserEntry, DEFAULT_RELAYS};

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "postr",
    author,
    version,
    about = "Multi-relay Nostr sync client",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the store directory at `STORE_ROOT`.
    Init,
    /// Generate a fresh identity and print it.
    Keygen,
    /// Sign a text note and send it to every tracked relay.
    Publish {
        /// Note content.
        content: String,
    },
    /// Fetch stored text notes authored by the given keys (hex or npub).
    Fetch {
        #[arg(required = true)]
        pubkeys: Vec<String>,
    },
    /// Fetch a user's profile metadata.
    Profile { pubkey: String },
    /// Stream text notes as they arrive, optionally filtered by author.
    Listen { pubkeys: Vec<String> },
    /// Manage the tracked relay list.
    Relay {
        #[command(subcommand)]
        action: RelayAction,
    },
    /// Manage the followed user list.
    User {
        #[command(subcommand)]
        action: UserAction,
    },
}

/// Operations available under `postr relay`.
#[derive(Subcommand)]
enum RelayAction {
    /// Add a relay endpoint after verifying connectivity.
    Add { url: String },
    /// Remove a previously added relay endpoint.
    Remove { url: String },
    /// List tracked relays and their last known status.
    List,
}

/// Operations available under `postr user`.
#[derive(Subcommand)]
enum UserAction {
    /// Follow a user by hex or npub public key.
    Add { pubkey: String },
    /// Unfollow a user.
    Remove { pubkey: String },
    /// List followed users and cached profile names.
    List,
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    let kv = KvStore::new(cfg.store_root.clone());
    match cli.command {
        Commands::Init => {
            kv.init()?;
        }
        Commands::Keygen => {
            let keys = Keys::generate();
            println!("SECRET_KEY={}", keys.secret_key_hex());
            println!("pubkey: {}", keys.public_key_hex());
            println!("npub:   {}", keys.npub()?);
        }
        Commands::Publish { content } => {
            let client = Client::new(&cfg, load_keys(&cfg)?).await?;
            let outcome = client.publish_note(&content).await?;
            for url in &outcome.delivered {
                println!("delivered: {url}");
            }
            for (url, reason) in &outcome.failed {
                println!("failed: {url} ({reason})");
            }
            if !outcome.any_delivered() {
                bail!("no relay accepted the note");
            }
        }
        Commands::Fetch { pubkeys } => {
            let client = Client::new(&cfg, load_keys(&cfg)?).await?;
            for ev in client.fetch_notes(pubkeys).await? {
                println!("{}", serde_json::to_string(&ev)?);
            }
        }
        Commands::Profile { pubkey } => {
            let client = Client::new(&cfg, load_keys(&cfg)?).await?;
            match client.fetch_profile(&pubkey).await? {
                Some(user) => {
                    kv.init()?;
                    refresh_cached_profile(&kv, &user)?;
                    println!("{}", serde_json::to_string(&user)?);
                }
                None => println!("no profile found"),
            }
        }
        Commands::Listen { pubkeys } => {
            let client = Client::new(&cfg, load_keys(&cfg)?).await?;
            let mut filter = Filter::new().kinds(vec![KIND_TEXT_NOTE]);
            if !pubkeys.is_empty() {
                let authors = pubkeys.iter().map(|p| keys::pubkey_to_hex(p)).collect();
                filter = filter.authors(authors);
            }
            let mut feed = client.live(vec![filter]).await?;
            while let Some(ev) = feed.next().await {
                println!("{}", serde_json::to_string(&ev)?);
            }
        }
        Commands::Relay { action } => {
            kv.init()?;
            handle_relay(action, &kv, &cfg).await?;
        }
        Commands::User { action } => {
            kv.init()?;
            handle_user(action, &kv, &cfg).await?;
        }
    }
    Ok(())
}

/// Load the configured identity, or mint an ephemeral one when the
/// environment carries no secret key.
fn load_keys(cfg: &Settings) -> anyhow::Result<Keys> {
    match &cfg.secret_key {
        Some(hex) => Ok(Keys::from_secret_hex(hex)?),
        None => {
            warn!("SECRET_KEY not set, using a fresh ephemeral identity");
            Ok(Keys::generate())
        }
    }
}

async fn handle_relay(action: RelayAction, kv: &KvStore, cfg: &Settings) -> anyhow::Result<()> {
    match action {
        RelayAction::Add { url } => {
            let mut relays = kv::load_relays(kv);
            if relays.iter().any(|r| r.url == url) {
                bail!("relay already tracked: {url}");
            }
            relay::test_connection(&url, cfg.tor_socks.as_deref()).await?;
            relays.push(RelayEntry {
                url,
                connected: false,
            });
            kv::save_relays(kv, &relays)?;
        }
        RelayAction::Remove { url } => {
            if DEFAULT_RELAYS.contains(&url.as_str()) {
                bail!("cannot remove seed relay: {url}");
            }
            let mut relays = kv::load_relays(kv);
            let before = relays.len();
            relays.retain(|r| r.url != url);
            if relays.len() == before {
                bail!("relay not tracked: {url}");
            }
            kv::save_relays(kv, &relays)?;
        }
        RelayAction::List => {
            for relay in kv::load_relays(kv) {
                let status = if relay.connected {
                    "connected"
                } else {
                    "disconnected"
                };
                println!("{} {}", relay.url, status);
            }
        }
    }
    Ok(())
}

async fn handle_user(action: UserAction, kv: &KvStore, cfg: &Settings) -> anyhow::Result<()> {
    match action {
        UserAction::Add { pubkey } => {
            let hex = normalize_pubkey(&pubkey)?;
            let mut users = kv::load_users(kv);
            if users.iter().any(|u| u.pubkey == hex) {
                bail!("user already followed: {hex}");
            }
            let entry = match cached_profile(cfg, &hex).await {
                Some(entry) => entry,
                None => UserEntry {
                    pubkey: hex,
                    name: None,
                    picture: None,
                },
            };
            users.push(entry);
            kv::save_users(kv, &users)?;
        }
        UserAction::Remove { pubkey } => {
            let hex = normalize_pubkey(&pubkey)?;
            let mut users = kv::load_users(kv);
            let before = users.len();
            users.retain(|u| u.pubkey != hex);
            if users.len() == before {
                bail!("user not followed: {hex}");
            }
            kv::save_users(kv, &users)?;
        }
        UserAction::List => {
            for user in kv::load_users(kv) {
                match &user.name {
                    Some(name) => println!("{} {}", user.pubkey, name),
                    None => println!("{}", user.pubkey),
                }
            }
        }
    }
    Ok(())
}

/// Best-effort profile lookup when following a user. An unreachable
/// network or a missing profile degrades to a bare pubkey entry.
async fn cached_profile(cfg: &Settings, hex: &str) -> Option<UserEntry> {
    let client = match Client::new(cfg, Keys::generate()).await {
        Ok(client) => client,
        Err(e) => {
            warn!(%e, "skipping profile lookup");
            return None;
        }
    };
    match client.fetch_profile(hex).await {
        Ok(found) => found,
        Err(e) => {
            warn!(%e, "profile lookup failed, storing bare pubkey");
            None
        }
    }
}

/// Keep a followed user's cached name/picture current after a profile
/// fetch. Users that are not followed are left alone.
fn refresh_cached_profile(kv: &KvStore, user: &UserEntry) -> anyhow::Result<()> {
    let mut users = kv::load_users(kv);
    if let Some(entry) = users.iter_mut().find(|u| u.pubkey == user.pubkey) {
        entry.name = user.name.clone();
        entry.picture = user.picture.clone();
        kv::save_users(kv, &users)?;
    }
    Ok(())
}

/// Accept a public key as npub or 64-char hex; reject anything else.
fn normalize_pubkey(input: &str) -> anyhow::Result<String> {
    if input.starts_with("npub1") {
        return Ok(npub_to_hex(input)?);
    }
    if input.len() == 64 && input.chars().all(|c| c.is_ascii_hexdigit()) {
        return Ok(input.to_lowercase());
    }
    bail!("invalid public key: {input}");
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let store_root = base_dir.join("postr-data");
    let mut content = String::new();
    content.push_str(&format!("STORE_ROOT={}\n", store_root.to_string_lossy()));
    content.push_str("RELAYS=\n");
    content.push_str("TOR_SOCKS=\n");
    content.push_str("SECRET_KEY=\n");
    content.push_str("RETRY_SECS=5\n");
    content.push_str("CONNECT_WAIT_SECS=10\n");
    content.push_str("FETCH_TIMEOUT_SECS=30\n");
    fs::write(env_path, content)?;
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    run(cli).await
}

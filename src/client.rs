//! High-level facade composing keys, the relay pool, and the store.
//!
//! Callers interact through explicit futures; every operation that needs a
//! relay first waits, bounded, for one to be connected and surfaces
//! `Error::NoRelay` if none comes up in time.

use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    config::Settings,
    error::Result,
    event::{Event, Filter, Tag, KIND_METADATA, KIND_TEXT_NOTE},
    keys::{pubkey_to_hex, Keys},
    kv::{self, KvStore, UserEntry},
    pool::{PublishOutcome, RelayPool},
};

/// Profile metadata payload carried in kind-0 event content.
#[derive(Debug, Deserialize)]
struct ProfileContent {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    picture: Option<String>,
}

/// A live subscription handle. Events arrive until `close` is called;
/// dropping the handle without closing leaves the subscription open on the
/// relays until the pool itself is torn down.
pub struct LiveFeed<'a> {
    id: String,
    events: mpsc::UnboundedReceiver<Event>,
    pool: &'a RelayPool,
}

impl LiveFeed<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next deduplicated event, in arrival order. `None` only after the
    /// pool shuts down.
    pub async fn next(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Fan CLOSE out to every queried relay and release the subscription.
    pub async fn close(self) {
        self.pool.unsubscribe(&self.id).await;
    }
}

/// Client facade over one identity and one relay pool.
pub struct Client {
    keys: Keys,
    pool: RelayPool,
    kv: KvStore,
    connect_wait: Duration,
    fetch_timeout: Duration,
}

impl Client {
    /// Build a client from settings: opens the store, seeds the pool with
    /// the stored relay list plus any extra endpoints from the
    /// environment, and starts connecting in the background.
    pub async fn new(settings: &Settings, keys: Keys) -> Result<Self> {
        let kv = KvStore::new(settings.store_root.clone());
        kv.init()?;
        let pool = RelayPool::new(
            kv.clone(),
            settings.retry_interval,
            settings.tor_socks.clone(),
        );
        for relay in kv::load_relays(&kv) {
            pool.add_relay(&relay.url).await;
        }
        for url in &settings.relays {
            pool.add_relay(url).await;
        }
        Ok(Self {
            keys,
            pool,
            kv,
            connect_wait: settings.connect_wait,
            fetch_timeout: settings.fetch_timeout,
        })
    }

    /// Build a client against an explicit relay list, skipping the stored
    /// seed endpoints.
    pub async fn with_relays(
        kv: KvStore,
        keys: Keys,
        relays: &[String],
        retry: Duration,
        connect_wait: Duration,
        fetch_timeout: Duration,
    ) -> Result<Self> {
        kv.init()?;
        let pool = RelayPool::new(kv.clone(), retry, None);
        for url in relays {
            pool.add_relay(url).await;
        }
        Ok(Self {
            keys,
            pool,
            kv,
            connect_wait,
            fetch_timeout,
        })
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn pool(&self) -> &RelayPool {
        &self.pool
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    /// Wait, bounded by the configured wait, until at least one relay is
    /// connected. Links dial in the background from the moment they are
    /// added, so this never blocks on the slowest endpoint.
    pub async fn ensure_connected(&self) -> Result<()> {
        self.pool.wait_any_connected(self.connect_wait).await
    }

    /// Sign a text note and fan it out to every tracked relay.
    pub async fn publish_note(&self, content: &str) -> Result<PublishOutcome> {
        self.ensure_connected().await?;
        let event = self.keys.sign(KIND_TEXT_NOTE, Vec::<Tag>::new(), content)?;
        Ok(self.pool.publish(&event).await)
    }

    /// Fan an already-signed event out to every tracked relay.
    pub async fn publish_event(&self, event: &Event) -> Result<PublishOutcome> {
        self.ensure_connected().await?;
        Ok(self.pool.publish(event).await)
    }

    /// Fetch stored events matching `filters` from all connected relays.
    /// Accumulates in arrival order until every queried relay signals end
    /// of stored events; on timeout the events gathered so far are
    /// returned.
    pub async fn fetch(&self, filters: Vec<Filter>) -> Result<Vec<Event>> {
        self.ensure_connected().await?;
        let (id, mut rx, eose) = self.pool.subscribe(filters, false).await;
        let mut events = Vec::new();
        if let Some(mut done) = eose {
            let deadline = tokio::time::sleep(self.fetch_timeout);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(ev) => events.push(ev),
                        None => break,
                    },
                    _ = &mut done => break,
                    _ = &mut deadline => {
                        warn!(sub_id = %id, "fetch timed out, returning partial results");
                        break;
                    }
                }
            }
        }
        // Events routed before the resolution fired may still be queued.
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        self.pool.unsubscribe(&id).await;
        Ok(events)
    }

    /// Fetch stored text notes authored by the given keys. Accepts hex or
    /// npub-encoded authors.
    pub async fn fetch_notes(&self, authors: Vec<String>) -> Result<Vec<Event>> {
        let authors = authors.iter().map(|a| pubkey_to_hex(a)).collect();
        self.fetch(vec![Filter::new().authors(authors).kinds(vec![KIND_TEXT_NOTE])])
            .await
    }

    /// Fetch a user's profile metadata. Resolves with the first matching
    /// kind-0 event, or `None` once every queried relay has signalled end
    /// of stored events without one.
    pub async fn fetch_profile(&self, pubkey: &str) -> Result<Option<UserEntry>> {
        self.ensure_connected().await?;
        let hex = pubkey_to_hex(pubkey);
        let filter = Filter::new()
            .authors(vec![hex.clone()])
            .kinds(vec![KIND_METADATA])
            .limit(1);
        let (id, mut rx, eose) = self.pool.subscribe(vec![filter], false).await;

        // Relays are untrusted; only a metadata event from the requested
        // author may resolve the lookup.
        let matches = |ev: &Event| ev.kind == KIND_METADATA && ev.pubkey == hex;
        let mut found = None;
        if let Some(mut done) = eose {
            let deadline = tokio::time::sleep(self.fetch_timeout);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(ev) if matches(&ev) => {
                            found = Some(ev);
                            break;
                        }
                        Some(ev) => {
                            debug!(pubkey = %hex, kind = ev.kind, "ignoring profile mismatch");
                        }
                        None => break,
                    },
                    _ = &mut done => break,
                    _ = &mut deadline => {
                        warn!(pubkey = %hex, "profile fetch timed out");
                        break;
                    }
                }
            }
        }
        if found.is_none() {
            found = rx.try_recv().ok().filter(matches);
        }
        self.pool.unsubscribe(&id).await;

        let Some(event) = found else {
            return Ok(None);
        };
        let profile: ProfileContent = match serde_json::from_str(&event.content) {
            Ok(p) => p,
            Err(e) => {
                debug!(pubkey = %hex, %e, "unparseable profile content");
                return Ok(None);
            }
        };
        Ok(Some(UserEntry {
            pubkey: hex,
            name: profile.display_name.or(profile.name),
            picture: profile.picture,
        }))
    }

    /// Open a live subscription that stays registered across reconnects.
    pub async fn live(&self, filters: Vec<Filter>) -> Result<LiveFeed<'_>> {
        self.ensure_connected().await?;
        let (id, events, _) = self.pool.subscribe(filters, true).await;
        Ok(LiveFeed {
            id,
            events,
            pool: &self.pool,
        })
    }
}

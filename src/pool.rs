//! Relay pool: fan-out, aggregation, and readiness tracking across links.
//!
//! The pool owns every `RelayLink` and runs a single router task that is the
//! exclusive owner of subscription state. Links report status transitions and
//! inbound frames to the router over a channel; callers observe readiness
//! through a watch channel carrying the set of connected endpoints, so
//! waiting for a relay never polls.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    event::{Event, Filter},
    kv::{self, KvStore},
    relay::{RelayLink, RouterMsg},
    subs::{subscription_id, SubscriptionManager},
};

/// Per-relay result of a best-effort publish fan-out. No quorum is required:
/// a relay network is append-only gossip, so a single delivery is enough for
/// the event to spread.
#[derive(Debug, Default)]
pub struct PublishOutcome {
    /// Relays that accepted the frame onto their socket.
    pub delivered: Vec<String>,
    /// Relays that did not receive the frame, with the reason.
    pub failed: Vec<(String, String)>,
}

impl PublishOutcome {
    pub fn any_delivered(&self) -> bool {
        !self.delivered.is_empty()
    }
}

/// A pool of relay links sharing one subscription registry.
pub struct RelayPool {
    links: Arc<RwLock<HashMap<String, Arc<RelayLink>>>>,
    subs: Arc<Mutex<SubscriptionManager>>,
    connected: Arc<watch::Sender<HashSet<String>>>,
    router_tx: mpsc::UnboundedSender<RouterMsg>,
    router: JoinHandle<()>,
    retry: Duration,
    socks: Option<String>,
}

impl RelayPool {
    pub fn new(kv: KvStore, retry: Duration, socks: Option<String>) -> Self {
        let (router_tx, router_rx) = mpsc::unbounded_channel();
        let links: Arc<RwLock<HashMap<String, Arc<RelayLink>>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let subs = Arc::new(Mutex::new(SubscriptionManager::default()));
        let (connected_tx, _) = watch::channel(HashSet::new());
        let connected = Arc::new(connected_tx);
        let router = tokio::spawn(route(
            router_rx,
            links.clone(),
            subs.clone(),
            connected.clone(),
            kv,
        ));
        Self {
            links,
            subs,
            connected,
            router_tx,
            router,
            retry,
            socks,
        }
    }

    /// Track a relay endpoint and immediately begin connecting it.
    /// Idempotent: returns false when the URL is already tracked.
    pub async fn add_relay(&self, url: &str) -> bool {
        let mut links = self.links.write().await;
        if links.contains_key(url) {
            return false;
        }
        let link = RelayLink::open(
            url.to_string(),
            self.retry,
            self.socks.clone(),
            self.router_tx.clone(),
        );
        links.insert(url.to_string(), Arc::new(link));
        true
    }

    /// Stop tracking a relay, closing its link and cancelling its retries.
    pub async fn remove_relay(&self, url: &str) -> bool {
        let link = self.links.write().await.remove(url);
        match link {
            Some(link) => {
                link.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn relay_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.links.read().await.keys().cloned().collect();
        urls.sort();
        urls
    }

    /// Wait for every link's current connection attempt to settle, success
    /// or failure. Retries keep running in the background; connection
    /// attempts are owned by the link drivers, so concurrent callers only
    /// wait — they never start duplicate attempts.
    pub async fn connect_all(&self) {
        let links: Vec<Arc<RelayLink>> = self.links.read().await.values().cloned().collect();
        futures_util::future::join_all(links.iter().map(|l| l.wait_settled())).await;
    }

    /// URLs whose link is currently connected. May be empty; callers must
    /// handle the zero-relay case rather than assume reachability.
    pub fn connected_relays(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.connected.borrow().iter().cloned().collect();
        urls.sort();
        urls
    }

    /// Suspend until at least one relay is connected, up to `bound`.
    pub async fn wait_any_connected(&self, bound: Duration) -> Result<()> {
        let mut rx = self.connected.subscribe();
        tokio::time::timeout(bound, rx.wait_for(|set| !set.is_empty()))
            .await
            .map_err(|_| Error::NoRelay)?
            .map_err(|_| Error::NoRelay)?;
        Ok(())
    }

    /// Fan an event out to every tracked link. Per-link failures are
    /// recorded in the outcome and never abort delivery to other links.
    pub async fn publish(&self, event: &Event) -> PublishOutcome {
        let frame = json!(["EVENT", event]);
        let links: Vec<Arc<RelayLink>> = self.links.read().await.values().cloned().collect();
        let mut outcome = PublishOutcome::default();
        for link in links {
            match link.send(&frame).await {
                Ok(()) => outcome.delivered.push(link.url().to_string()),
                Err(e) => {
                    debug!(url = link.url(), %e, "publish not delivered");
                    outcome.failed.push((link.url().to_string(), e.to_string()));
                }
            }
        }
        outcome
    }

    /// Open a subscription against the currently connected relays. For
    /// one-shot subscriptions the returned resolution fires once every
    /// queried relay has signalled end of stored events.
    pub async fn subscribe(
        &self,
        filters: Vec<Filter>,
        live: bool,
    ) -> (
        String,
        mpsc::UnboundedReceiver<Event>,
        Option<oneshot::Receiver<()>>,
    ) {
        let id = subscription_id();
        let targets: Vec<Arc<RelayLink>> = self
            .links
            .read()
            .await
            .values()
            .filter(|l| l.is_connected())
            .cloned()
            .collect();
        let urls: HashSet<String> = targets.iter().map(|l| l.url().to_string()).collect();
        let (events_rx, eose_rx) = self
            .subs
            .lock()
            .await
            .register(&id, filters.clone(), urls, live);

        let frame = req_frame(&id, &filters);
        for link in targets {
            if let Err(e) = link.send(&frame).await {
                debug!(url = link.url(), %e, "request not delivered");
                // This relay will never answer; don't wait for its EOSE.
                self.subs.lock().await.route_eose(link.url(), &id);
            }
        }
        (id, events_rx, eose_rx)
    }

    /// Close a subscription: fan CLOSE out to every relay that received the
    /// REQ and release its dedup state. Idempotent.
    pub async fn unsubscribe(&self, id: &str) {
        let entry = self.subs.lock().await.remove(id);
        let Some(entry) = entry else {
            return;
        };
        let frame = json!(["CLOSE", id]);
        let links = self.links.read().await;
        for url in &entry.relays {
            if let Some(link) = links.get(url) {
                if let Err(e) = link.send(&frame).await {
                    debug!(%url, %e, "close not delivered");
                }
            }
        }
    }
}

impl Drop for RelayPool {
    fn drop(&mut self) {
        self.router.abort();
    }
}

/// Build a `["REQ", id, filter...]` frame.
fn req_frame(id: &str, filters: &[Filter]) -> Value {
    let mut arr = vec![json!("REQ"), json!(id)];
    for f in filters {
        arr.push(serde_json::to_value(f).unwrap_or(Value::Null));
    }
    Value::Array(arr)
}

/// Router task: the single owner of subscription state and the connected
/// set. Processes link traffic in arrival order, so registration always
/// precedes the events it routes.
async fn route(
    mut rx: mpsc::UnboundedReceiver<RouterMsg>,
    links: Arc<RwLock<HashMap<String, Arc<RelayLink>>>>,
    subs: Arc<Mutex<SubscriptionManager>>,
    connected: Arc<watch::Sender<HashSet<String>>>,
    kv: KvStore,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            RouterMsg::Connected { url } => {
                connected.send_modify(|set| {
                    set.insert(url.clone());
                });
                persist_status(&kv, &connected.borrow().clone());
                // Live subscriptions follow the relay across reconnects.
                let reqs = subs.lock().await.on_relay_connected(&url);
                if !reqs.is_empty() {
                    let link = links.read().await.get(&url).cloned();
                    if let Some(link) = link {
                        for (id, filters) in reqs {
                            if let Err(e) = link.send(&req_frame(&id, &filters)).await {
                                debug!(%url, %e, "re-request not delivered");
                            }
                        }
                    }
                }
            }
            RouterMsg::Disconnected { url } => {
                let was_connected = connected.borrow().contains(&url);
                if was_connected {
                    connected.send_modify(|set| {
                        set.remove(&url);
                    });
                    persist_status(&kv, &connected.borrow().clone());
                }
            }
            RouterMsg::Event { sub_id, event, .. } => {
                subs.lock().await.route_event(&sub_id, event);
            }
            RouterMsg::Eose { url, sub_id } => {
                subs.lock().await.route_eose(&url, &sub_id);
            }
            RouterMsg::Notice { url, message } => {
                info!(%url, %message, "relay notice");
            }
        }
    }
}

/// Best-effort persistence of endpoint status; never gates connection
/// logic.
fn persist_status(kv: &KvStore, connected: &HashSet<String>) {
    let mut relays = kv::load_relays(kv);
    for relay in &mut relays {
        relay.connected = connected.contains(&relay.url);
    }
    if let Err(e) = kv::save_relays(kv, &relays) {
        warn!(%e, "failed to persist relay status");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::RelayEntry;
    use futures_util::StreamExt;
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn test_kv(dir: &TempDir) -> KvStore {
        let kv = KvStore::new(dir.path().to_path_buf());
        kv.init().unwrap();
        kv
    }

    fn test_pool(kv: KvStore) -> RelayPool {
        RelayPool::new(kv, Duration::from_millis(50), None)
    }

    fn sample_event(id: &str) -> Event {
        Event {
            id: id.into(),
            pubkey: "p".into(),
            kind: 1,
            created_at: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        }
    }

    async fn spawn_idle_relay() -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut ws = accept_async(stream).await.unwrap();
                    while let Some(msg) = ws.next().await {
                        if msg.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        (format!("ws://{}", addr), handle)
    }

    #[tokio::test]
    async fn add_relay_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(test_kv(&dir));
        assert!(pool.add_relay("ws://127.0.0.1:1").await);
        assert!(!pool.add_relay("ws://127.0.0.1:1").await);
        assert_eq!(pool.relay_urls().await, vec!["ws://127.0.0.1:1".to_string()]);
    }

    #[tokio::test]
    async fn connect_all_settles_first_attempts() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(test_kv(&dir));
        let (live_url, server) = spawn_idle_relay().await;
        pool.add_relay(&live_url).await;
        pool.add_relay("ws://127.0.0.1:1").await;

        pool.connect_all().await;
        pool.wait_any_connected(Duration::from_secs(2)).await.unwrap();
        assert_eq!(pool.connected_relays(), vec![live_url]);
        server.abort();
    }

    #[tokio::test]
    async fn publish_reports_partial_failure() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(test_kv(&dir));
        let (url_a, server_a) = spawn_idle_relay().await;
        let (url_b, server_b) = spawn_idle_relay().await;
        pool.add_relay(&url_a).await;
        pool.add_relay(&url_b).await;
        pool.add_relay("ws://127.0.0.1:1").await;

        pool.connect_all().await;
        pool.wait_any_connected(Duration::from_secs(2)).await.unwrap();
        // Both live relays must be up before the fan-out.
        let mut rx = pool.connected.subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|set| set.len() == 2))
            .await
            .unwrap()
            .unwrap();

        let outcome = pool.publish(&sample_event("aa11")).await;
        assert_eq!(outcome.delivered.len(), 2);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, "ws://127.0.0.1:1");
        assert!(outcome.any_delivered());
        server_a.abort();
        server_b.abort();
    }

    #[tokio::test]
    async fn publish_with_zero_connected_relays_reports_no_deliveries() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(test_kv(&dir));
        pool.add_relay("ws://127.0.0.1:1").await;
        pool.connect_all().await;

        let outcome = pool.publish(&sample_event("aa11")).await;
        assert!(outcome.delivered.is_empty());
        assert_eq!(outcome.failed.len(), 1);
    }

    #[tokio::test]
    async fn wait_any_connected_times_out() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(test_kv(&dir));
        pool.add_relay("ws://127.0.0.1:1").await;
        let err = pool.wait_any_connected(Duration::from_millis(100)).await;
        assert!(matches!(err, Err(Error::NoRelay)));
    }

    #[tokio::test]
    async fn status_transitions_are_persisted() {
        let dir = TempDir::new().unwrap();
        let kv = test_kv(&dir);
        let (url, server) = spawn_idle_relay().await;
        // Pre-register the endpoint so it survives the defaults filter.
        let mut relays = kv::load_relays(&kv);
        relays.push(RelayEntry {
            url: url.clone(),
            connected: false,
        });
        kv::save_relays(&kv, &relays).unwrap();

        let pool = test_pool(kv.clone());
        pool.add_relay(&url).await;
        pool.wait_any_connected(Duration::from_secs(2)).await.unwrap();

        // The router persists the flag after flipping the connected set.
        let mut persisted = false;
        for _ in 0..100 {
            let entry = kv::load_relays(&kv).into_iter().find(|r| r.url == url);
            if entry.map(|r| r.connected).unwrap_or(false) {
                persisted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(persisted);
        server.abort();
    }

    #[tokio::test]
    async fn subscribe_with_no_relays_resolves_immediately() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(test_kv(&dir));
        let (id, _events, eose) = pool.subscribe(vec![Filter::new()], false).await;
        eose.unwrap().await.unwrap();
        pool.unsubscribe(&id).await;
        // Idempotent close.
        pool.unsubscribe(&id).await;
    }

    #[tokio::test]
    async fn remove_relay_closes_link() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(test_kv(&dir));
        let (url, server) = spawn_idle_relay().await;
        pool.add_relay(&url).await;
        pool.wait_any_connected(Duration::from_secs(2)).await.unwrap();

        assert!(pool.remove_relay(&url).await);
        assert!(!pool.remove_relay(&url).await);
        assert!(pool.relay_urls().await.is_empty());

        let mut rx = pool.connected.subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|set| set.is_empty()))
            .await
            .unwrap()
            .unwrap();
        server.abort();
    }

    #[test]
    fn req_frame_carries_all_filters() {
        let frame = req_frame(
            "sub1",
            &[
                Filter::new().authors(vec!["a1".into()]),
                Filter::new().kinds(vec![0]),
            ],
        );
        let arr = frame.as_array().unwrap();
        assert_eq!(arr[0], "REQ");
        assert_eq!(arr[1], "sub1");
        assert_eq!(arr[2]["authors"][0], "a1");
        assert_eq!(arr[3]["kinds"][0], 0);
    }
}

//! Subscription registry: dedup, routing, and end-of-stored-events tracking.

use std::collections::{HashMap, HashSet};

use rand::RngCore;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::event::{Event, Filter};

/// Generate a random subscription identifier.
pub(crate) fn subscription_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// One active subscription. Owned exclusively by the manager; destroyed on
/// explicit close or, for one-shot fetches, by the caller once resolved.
pub(crate) struct SubEntry {
    pub filters: Vec<Filter>,
    /// Relays that received the REQ frame; CLOSE is fanned out to these.
    pub relays: HashSet<String>,
    /// Relays that have not yet signalled end of stored events.
    pending: HashSet<String>,
    /// Event ids already delivered to this subscription.
    seen: HashSet<String>,
    events: mpsc::UnboundedSender<Event>,
    /// One-shot resolution; `None` for live subscriptions, which never
    /// self-close.
    eose: Option<oneshot::Sender<()>>,
    pub live: bool,
}

/// Tracks all active subscriptions and routes inbound traffic to them.
#[derive(Default)]
pub(crate) struct SubscriptionManager {
    subs: HashMap<String, SubEntry>,
}

impl SubscriptionManager {
    /// Register a subscription queried against `relays`. Returns the event
    /// stream and, for one-shot subscriptions, a resolution that fires once
    /// every queried relay has signalled end of stored events.
    pub fn register(
        &mut self,
        id: &str,
        filters: Vec<Filter>,
        relays: HashSet<String>,
        live: bool,
    ) -> (
        mpsc::UnboundedReceiver<Event>,
        Option<oneshot::Receiver<()>>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (eose_tx, eose_rx) = if live {
            (None, None)
        } else {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        };
        let mut entry = SubEntry {
            filters,
            relays: relays.clone(),
            pending: relays,
            seen: HashSet::new(),
            events: events_tx,
            eose: eose_tx,
            live,
        };
        // Nothing to wait for when no relay was queried.
        if !live && entry.pending.is_empty() {
            if let Some(tx) = entry.eose.take() {
                let _ = tx.send(());
            }
        }
        self.subs.insert(id.to_string(), entry);
        (events_rx, eose_rx)
    }

    /// Deliver an event to its subscription, suppressing duplicates by id.
    pub fn route_event(&mut self, sub_id: &str, event: Event) {
        let Some(entry) = self.subs.get_mut(sub_id) else {
            debug!(sub_id, "event for unknown subscription");
            return;
        };
        if !entry.seen.insert(event.id.clone()) {
            return;
        }
        let _ = entry.events.send(event);
    }

    /// Record an end-of-stored-events signal from one relay. The one-shot
    /// resolution fires exactly once, after every queried relay has
    /// signalled.
    pub fn route_eose(&mut self, url: &str, sub_id: &str) {
        let Some(entry) = self.subs.get_mut(sub_id) else {
            return;
        };
        entry.pending.remove(url);
        if !entry.live && entry.pending.is_empty() {
            if let Some(tx) = entry.eose.take() {
                let _ = tx.send(());
            }
        }
    }

    /// Drop a subscription, returning it so the pool can fan out CLOSE
    /// frames. Idempotent: a second removal finds nothing.
    pub fn remove(&mut self, id: &str) -> Option<SubEntry> {
        self.subs.remove(id)
    }

    /// A relay (re)connected: live subscriptions should re-issue their REQ
    /// to it. Returns the frames to send; the relay joins each
    /// subscription's CLOSE fan-out set.
    pub fn on_relay_connected(&mut self, url: &str) -> Vec<(String, Vec<Filter>)> {
        let mut reqs = Vec::new();
        for (id, entry) in self.subs.iter_mut() {
            if entry.live {
                entry.relays.insert(url.to_string());
                reqs.push((id.clone(), entry.filters.clone()));
            }
        }
        reqs
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.subs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn relays(urls: &[&str]) -> HashSet<String> {
        urls.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn duplicate_events_are_delivered_once() {
        let mut mgr = SubscriptionManager::default();
        let (mut rx, _eose) =
            mgr.register("s1", vec![Filter::new()], relays(&["r1", "r2"]), false);

        // The same event arriving from two relays reaches the caller once.
        mgr.route_event("s1", sample_event("aa11"));
        mgr.route_event("s1", sample_event("aa11"));
        mgr.route_event("s1", sample_event("bb22"));

        assert_eq!(rx.try_recv().unwrap().id, "aa11");
        assert_eq!(rx.try_recv().unwrap().id, "bb22");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn eose_fires_only_after_every_relay() {
        let mut mgr = SubscriptionManager::default();
        let (_rx, eose) = mgr.register("s1", vec![Filter::new()], relays(&["r1", "r2"]), false);
        let mut eose = eose.unwrap();

        mgr.route_eose("r1", "s1");
        assert!(eose.try_recv().is_err());
        // A relay signalling twice does not count for another.
        mgr.route_eose("r1", "s1");
        assert!(eose.try_recv().is_err());

        mgr.route_eose("r2", "s1");
        assert!(eose.try_recv().is_ok());
    }

    #[test]
    fn eose_fires_immediately_with_no_relays() {
        let mut mgr = SubscriptionManager::default();
        let (_rx, eose) = mgr.register("s1", vec![Filter::new()], HashSet::new(), false);
        assert!(eose.unwrap().try_recv().is_ok());
    }

    #[test]
    fn live_subscription_never_resolves() {
        let mut mgr = SubscriptionManager::default();
        let (_rx, eose) = mgr.register("s1", vec![Filter::new()], relays(&["r1"]), true);
        assert!(eose.is_none());
        mgr.route_eose("r1", "s1");
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut mgr = SubscriptionManager::default();
        mgr.register("s1", vec![Filter::new()], relays(&["r1"]), false);
        assert!(mgr.remove("s1").is_some());
        assert!(mgr.remove("s1").is_none());
    }

    #[test]
    fn reconnect_reissues_live_requests_only() {
        let mut mgr = SubscriptionManager::default();
        mgr.register("live", vec![Filter::new().kinds(vec![1])], relays(&["r1"]), true);
        mgr.register("once", vec![Filter::new()], relays(&["r1"]), false);

        let reqs = mgr.on_relay_connected("r2");
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].0, "live");

        // The new relay joins the live subscription's close set.
        let entry = mgr.remove("live").unwrap();
        assert!(entry.relays.contains("r2"));
    }

    #[test]
    fn events_for_unknown_subscription_are_dropped() {
        let mut mgr = SubscriptionManager::default();
        mgr.route_event("ghost", sample_event("aa11"));
        mgr.route_eose("r1", "ghost");
    }

    #[test]
    fn subscription_ids_are_distinct() {
        assert_ne!(subscription_id(), subscription_id());
        assert_eq!(subscription_id().len(), 16);
    }
}

//! Nostr event and filter models.

use serde::{Deserialize, Serialize};

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and
/// the following elements hold data, e.g. `["p", "<pubkey>"]` to reference
/// another author or `["e", "<event id>"]` to link to another event. Tags are
/// carried verbatim so uncommon or custom tags survive the round trip through
/// a relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

/// Signed NIP-01 event as exchanged with relays.
///
/// `id` and `sig` are deterministic functions of the remaining fields plus
/// the author's secret key, so an event with a given id is immutable and
/// interchangeable no matter which relay delivered it. That identity is the
/// basis for cross-relay deduplication.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "82341f88...",
///   "kind": 1,
///   "created_at": 1700000000,
///   "tags": [["t", "news"]],
///   "content": "hello",
///   "sig": "deadbeef"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of the SHA-256 event hash).
    pub id: String,
    /// Author public key (hex, x-only).
    pub pubkey: String,
    /// Kind number: `0` is profile metadata, `1` a text note.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Arbitrary tags.
    pub tags: Vec<Tag>,
    /// Event content body; opaque to the sync layer.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

/// Kind number for profile metadata events.
pub const KIND_METADATA: u32 = 0;
/// Kind number for plain text notes.
pub const KIND_TEXT_NOTE: u32 = 1;

/// Declarative relay query, used both for one-shot historical fetches and
/// live subscriptions. Serializes to the filter object of a `REQ` frame;
/// absent fields are omitted entirely.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn authors(mut self, authors: Vec<String>) -> Self {
        self.authors = Some(authors);
        self
    }

    pub fn kinds(mut self, kinds: Vec<u32>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    pub fn since(mut self, ts: u64) -> Self {
        self.since = Some(ts);
        self
    }

    pub fn until(mut self, ts: u64) -> Self {
        self.until = Some(ts);
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_round_trips_through_json() {
        let ev = Event {
            id: "aa11".into(),
            pubkey: "p1".into(),
            kind: 1,
            created_at: 1,
            tags: vec![Tag(vec!["t".into(), "news".into()])],
            content: "hello".into(),
            sig: String::new(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn filter_omits_absent_fields() {
        let f = Filter::new().authors(vec!["a1".into()]).kinds(vec![1]);
        let val = serde_json::to_value(&f).unwrap();
        assert_eq!(val["authors"][0], "a1");
        assert_eq!(val["kinds"][0], 1);
        assert!(val.get("since").is_none());
        assert!(val.get("until").is_none());
        assert!(val.get("limit").is_none());
    }

    #[test]
    fn filter_serializes_bounds_and_limit() {
        let f = Filter::new().since(1).until(2).limit(3);
        let val = serde_json::to_value(&f).unwrap();
        assert_eq!(val["since"], 1);
        assert_eq!(val["until"], 2);
        assert_eq!(val["limit"], 3);
    }
}

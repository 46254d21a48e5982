//! Time-bounded query cache and the change bus that invalidates it.
//!
//! Both are plain values handed to whoever needs them; nothing here is global.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::models::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Cases,
    Followups,
    Messages,
    Evidence,
    Config,
}

impl Topic {
    /// Cache key prefixes whose entries go stale when this topic changes.
    pub fn stale_prefixes(&self) -> &'static [&'static str] {
        match self {
            Topic::Cases => &["cases:", "deadlines:"],
            // a first followup moves the case status
            Topic::Followups => &["followups:", "cases:", "deadlines:"],
            Topic::Messages => &["messages:"],
            Topic::Evidence => &["evidence:"],
            Topic::Config => &["config:"],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChanged {
    pub topic: Topic,
    pub case_id: Option<Id>,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DataChanged>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns how many subscribers saw the event.
    pub fn publish(&self, event: DataChanged) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DataChanged> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self { Self::new(64) }
}

struct Entry {
    value: serde_json::Value,
    expires_at: Instant,
}

#[derive(Clone)]
pub struct QueryCache {
    entries: Arc<DashMap<String, Entry>>,
    ttl: Duration,
}

impl QueryCache {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: Arc::new(DashMap::new()), ttl }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let hit = {
            let entry = self.entries.get(key)?;
            if entry.expires_at > Instant::now() { Some(entry.value.clone()) } else { None }
        };
        match hit {
            Some(v) => serde_json::from_value(v).ok(),
            None => {
                // re-check under the shard lock so a fresh concurrent set survives
                self.entries.remove_if(key, |_, e| e.expires_at <= Instant::now());
                None
            }
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) {
        self.set_with_ttl(key, value, self.ttl);
    }

    pub fn set_with_ttl<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        if let Ok(value) = serde_json::to_value(value) {
            self.entries.insert(key.to_string(), Entry { value, expires_at: Instant::now() + ttl });
        }
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn invalidate_prefix(&self, prefix: &str) {
        self.entries.retain(|k, _| !k.starts_with(prefix));
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn apply(&self, event: &DataChanged) {
        for prefix in event.topic.stale_prefixes() {
            self.invalidate_prefix(prefix);
        }
    }

    /// Invalidates entries as change events arrive on `bus`.
    ///
    /// A lagging listener has missed events and drops everything.
    pub fn follow(&self, bus: &EventBus) -> JoinHandle<()> {
        let cache = self.clone();
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        debug!(?event, "invalidating cached queries");
                        cache.apply(&event);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "change listener lagged, clearing cache");
                        cache.clear();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

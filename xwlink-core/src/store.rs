//! Envelope store: per-key queues of tagged outbound payloads awaiting confirmed delivery.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::protocol::tagged;
use crate::storage::{self, KvStore};

/// Told when a key's queue goes from empty to non-empty or back.
pub trait HaveDataListener<K>: Send + Sync {
    fn on_have_data(&self, key: &K, have_data: bool);
}

/// The ordered tagged payloads for one key at the moment of a snapshot.
/// Retiring it removes exactly these payloads, whatever was added since.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<K> {
    pub key: K,
    pub items: Vec<Vec<u8>>,
}

impl<K> Envelope<K> {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len_bytes(&self) -> usize {
        self.items.iter().map(Vec::len).sum()
    }
}

type Listener<K> = Weak<dyn HaveDataListener<K>>;

struct Inner<K> {
    queues: HashMap<K, Vec<Vec<u8>>>,
    listeners: HashMap<K, Listener<K>>,
    any: Option<Listener<K>>,
}

/// Thread-safe envelope store. One coarse lock; listeners are called after it is released.
pub struct EnvelopeStore<K> {
    inner: Mutex<Inner<K>>,
    persist: Option<(Arc<dyn KvStore>, String)>,
}

impl<K> EnvelopeStore<K>
where
    K: Eq + Hash + Clone + Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queues: HashMap::new(),
                listeners: HashMap::new(),
                any: None,
            }),
            persist: None,
        }
    }

    /// Store backed by `kv` under `key`; loads whatever was saved there.
    pub fn persistent(kv: Arc<dyn KvStore>, key: &str) -> Self {
        let queues: HashMap<K, Vec<Vec<u8>>> = storage::load_or_default(kv.as_ref(), key);
        Self {
            inner: Mutex::new(Inner {
                queues,
                listeners: HashMap::new(),
                any: None,
            }),
            persist: Some((kv, key.to_string())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `payload` under `tag` unless an identical one is already pending for `key`.
    /// Returns the total bytes queued for `key`.
    pub fn add_if_absent(&self, key: &K, tag: u8, payload: &[u8]) -> usize {
        self.add_tagged_if_absent(key, tagged(tag, payload))
    }

    /// Like [`add_if_absent`](Self::add_if_absent) for an item already carrying its tag.
    pub fn add_tagged_if_absent(&self, key: &K, item: Vec<u8>) -> usize {
        let (total, notify) = {
            let mut inner = self.lock();
            let queue = inner.queues.entry(key.clone()).or_default();
            let was_empty = queue.is_empty();
            let added = !queue.contains(&item);
            if added {
                queue.push(item);
            } else {
                tracing::debug!("duplicate payload ignored");
            }
            let total: usize = queue.iter().map(Vec::len).sum();
            if added {
                self.save(&inner);
            }
            let notify = if was_empty && added {
                Self::listeners_for(&inner, key)
            } else {
                Vec::new()
            };
            (total, notify)
        };
        for l in notify {
            l.on_have_data(key, true);
        }
        total
    }

    /// Everything pending for `key`, in insertion order.
    pub fn snapshot_for(&self, key: &K) -> Envelope<K> {
        let inner = self.lock();
        Envelope {
            key: key.clone(),
            items: inner.queues.get(key).cloned().unwrap_or_default(),
        }
    }

    /// Delete exactly `items` from `key`'s queue. Returns how many were removed.
    pub fn remove_confirmed(&self, key: &K, items: &[Vec<u8>]) -> usize {
        let (removed, notify) = {
            let mut inner = self.lock();
            let Some(queue) = inner.queues.get_mut(key) else {
                return 0;
            };
            let before = queue.len();
            queue.retain(|i| !items.contains(i));
            let removed = before - queue.len();
            let now_empty = queue.is_empty();
            if now_empty {
                inner.queues.remove(key);
            }
            if removed > 0 {
                self.save(&inner);
            }
            let notify = if removed > 0 && now_empty {
                Self::listeners_for(&inner, key)
            } else {
                Vec::new()
            };
            (removed, notify)
        };
        for l in notify {
            l.on_have_data(key, false);
        }
        removed
    }

    /// Drop everything queued for `key` (transport torn down, or superseded).
    pub fn clear(&self, key: &K) {
        let envelope = self.snapshot_for(key);
        self.remove_confirmed(key, &envelope.items);
    }

    pub fn has_data(&self, key: &K) -> bool {
        self.lock().queues.get(key).is_some_and(|q| !q.is_empty())
    }

    pub fn has_any_data(&self) -> bool {
        self.lock().queues.values().any(|q| !q.is_empty())
    }

    /// Keys with at least one pending payload.
    pub fn pending_keys(&self) -> Vec<K> {
        self.lock()
            .queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Register the one listener for `key`; replaces any earlier one. The new listener
    /// is told the current state immediately, before this returns.
    pub fn set_listener(&self, key: &K, listener: &Arc<dyn HaveDataListener<K>>) {
        let have = {
            let mut inner = self.lock();
            inner.listeners.insert(key.clone(), Arc::downgrade(listener));
            inner.queues.get(key).is_some_and(|q| !q.is_empty())
        };
        listener.on_have_data(key, have);
    }

    /// Listener told about transitions on every key.
    pub fn set_any_listener(&self, listener: &Arc<dyn HaveDataListener<K>>) {
        self.lock().any = Some(Arc::downgrade(listener));
    }

    fn listeners_for(inner: &Inner<K>, key: &K) -> Vec<Arc<dyn HaveDataListener<K>>> {
        inner
            .listeners
            .get(key)
            .into_iter()
            .chain(inner.any.iter())
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn save(&self, inner: &Inner<K>) {
        if let Some((kv, key)) = &self.persist {
            if let Err(e) = storage::save(kv.as_ref(), key, &inner.queues) {
                tracing::warn!(error = %e, "failed to persist envelope store");
            }
        }
    }
}

impl<K> Default for EnvelopeStore<K>
where
    K: Eq + Hash + Clone + Serialize + DeserializeOwned + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StreamId;
    use crate::protocol::{TAG_INVITE, TAG_MESSAGE};
    use crate::storage::MemoryKvStore;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(StreamId, bool)>>,
    }

    impl HaveDataListener<StreamId> for Recorder {
        fn on_have_data(&self, key: &StreamId, have_data: bool) {
            self.seen.lock().unwrap().push((*key, have_data));
        }
    }

    #[test]
    fn idempotent_add() {
        let s: EnvelopeStore<StreamId> = EnvelopeStore::new();
        let k = StreamId(1);
        assert_eq!(s.add_if_absent(&k, TAG_MESSAGE, b"abc"), 4);
        assert_eq!(s.add_if_absent(&k, TAG_MESSAGE, b"abc"), 4);
        // same bytes, different tag is a different item
        assert_eq!(s.add_if_absent(&k, TAG_INVITE, b"abc"), 8);
        assert_eq!(s.snapshot_for(&k).items.len(), 2);
    }

    #[test]
    fn listener_notified_on_registration() {
        let s: EnvelopeStore<StreamId> = EnvelopeStore::new();
        let k = StreamId(0x1234);
        s.add_if_absent(&k, TAG_MESSAGE, b"move");
        let rec = Arc::new(Recorder::default());
        let l: Arc<dyn HaveDataListener<StreamId>> = rec.clone();
        s.set_listener(&k, &l);
        assert_eq!(*rec.seen.lock().unwrap(), vec![(k, true)]);
    }

    #[test]
    fn listener_sees_transitions_only() {
        let s: EnvelopeStore<StreamId> = EnvelopeStore::new();
        let k = StreamId(5);
        let rec = Arc::new(Recorder::default());
        let l: Arc<dyn HaveDataListener<StreamId>> = rec.clone();
        s.set_listener(&k, &l);
        s.add_if_absent(&k, TAG_MESSAGE, b"a");
        s.add_if_absent(&k, TAG_MESSAGE, b"b");
        let env = s.snapshot_for(&k);
        s.remove_confirmed(&k, &env.items);
        assert_eq!(
            *rec.seen.lock().unwrap(),
            vec![(k, false), (k, true), (k, false)]
        );
    }

    #[test]
    fn last_registration_wins() {
        let s: EnvelopeStore<StreamId> = EnvelopeStore::new();
        let k = StreamId(5);
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let l1: Arc<dyn HaveDataListener<StreamId>> = first.clone();
        let l2: Arc<dyn HaveDataListener<StreamId>> = second.clone();
        s.set_listener(&k, &l1);
        s.set_listener(&k, &l2);
        s.add_if_absent(&k, TAG_MESSAGE, b"a");
        assert_eq!(first.seen.lock().unwrap().len(), 1);
        assert_eq!(second.seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn dropped_listener_not_called() {
        let s: EnvelopeStore<StreamId> = EnvelopeStore::new();
        let k = StreamId(5);
        {
            let l: Arc<dyn HaveDataListener<StreamId>> = Arc::new(Recorder::default());
            s.set_listener(&k, &l);
        }
        s.add_if_absent(&k, TAG_MESSAGE, b"a");
        assert!(s.has_data(&k));
    }

    #[test]
    fn ack_retires_exact_payload_set() {
        let s: EnvelopeStore<StreamId> = EnvelopeStore::new();
        let k = StreamId(7);
        s.add_if_absent(&k, TAG_MESSAGE, b"old");
        let sent = s.snapshot_for(&k);
        s.add_if_absent(&k, TAG_MESSAGE, b"newer");
        assert_eq!(s.remove_confirmed(&k, &sent.items), 1);
        let left = s.snapshot_for(&k);
        assert_eq!(left.items, vec![tagged(TAG_MESSAGE, b"newer")]);
    }

    #[test]
    fn persisted_across_instances() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let s: EnvelopeStore<StreamId> = EnvelopeStore::persistent(kv.clone(), "tap.store");
        s.add_if_absent(&StreamId(1), TAG_MESSAGE, b"x");
        drop(s);
        let s2: EnvelopeStore<StreamId> = EnvelopeStore::persistent(kv, "tap.store");
        assert!(s2.has_data(&StreamId(1)));
        assert_eq!(s2.pending_keys(), vec![StreamId(1)]);
    }
}

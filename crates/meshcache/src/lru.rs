//! Fixed-count ordered key/value map with eviction callbacks.
//!
//! The map keeps entries in a doubly linked list ordered by recency (front =
//! most recent) with an auxiliary hash map for O(1) slot lookup. Entries are
//! evicted from the back while the entry count exceeds `max_entries` or the
//! total charge exceeds `capacity`. All operations run under a single
//! reader/writer lock.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

const NIL: usize = usize::MAX;

/// Callback invoked with entries leaving the map.
pub type EntryCallback<K, V> = Box<dyn Fn(&K, &V) + Send + Sync>;

/// Policy knobs for an [`LruMap`].
#[derive(Debug, Clone)]
pub struct LruOptions {
    /// Maximum number of entries; 0 disables count-based eviction.
    pub max_entries: usize,
    /// Maximum total charge; 0 disables charge-based eviction.
    pub capacity: u64,
    /// Entry time-to-live; `None` disables expiry.
    pub ttl: Option<Duration>,
    /// Whether `add` on an existing key replaces the stored value. When
    /// unset, the stored value is kept and handed back to the caller.
    pub replace_on_add: bool,
}

impl Default for LruOptions {
    fn default() -> Self {
        Self {
            max_entries: 0,
            capacity: 0,
            ttl: None,
            replace_on_add: true,
        }
    }
}

/// Result of an [`LruMap::add`].
#[derive(Debug)]
pub struct AddOutcome<K, V> {
    /// The value previously stored under the key, if any.
    pub existing: Option<V>,
    /// Entries evicted to get back under the configured limits.
    pub evicted: Vec<(K, V)>,
    /// Set when the incoming charge alone exceeds the capacity; the item was
    /// reported and not inserted.
    pub rejected: bool,
}

struct Node<K, V> {
    key: K,
    value: V,
    charge: u64,
    created_at: Instant,
    prev: usize,
    next: usize,
}

struct Inner<K, V> {
    nodes: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    head: usize,
    tail: usize,
    usage: u64,
}

impl<K: Eq + Hash, V> Inner<K, V> {
    fn detach(&mut self, slot: usize) {
        let (prev, next) = {
            let node = self.nodes[slot].as_ref().unwrap();
            (node.prev, node.next)
        };
        match prev {
            NIL => self.head = next,
            prev => self.nodes[prev].as_mut().unwrap().next = next,
        }
        match next {
            NIL => self.tail = prev,
            next => self.nodes[next].as_mut().unwrap().prev = prev,
        }
        let node = self.nodes[slot].as_mut().unwrap();
        node.prev = NIL;
        node.next = NIL;
    }

    fn attach_front(&mut self, slot: usize) {
        let old_head = self.head;
        {
            let node = self.nodes[slot].as_mut().unwrap();
            node.prev = NIL;
            node.next = old_head;
        }
        match old_head {
            NIL => self.tail = slot,
            head => self.nodes[head].as_mut().unwrap().prev = slot,
        }
        self.head = slot;
    }

    fn insert_slot(&mut self, node: Node<K, V>) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn remove_slot(&mut self, slot: usize) -> Node<K, V> {
        self.detach(slot);
        let node = self.nodes[slot].take().unwrap();
        self.index.remove(&node.key);
        self.free.push(slot);
        self.usage -= node.charge;
        node
    }

    fn pop_tail(&mut self) -> Option<Node<K, V>> {
        match self.tail {
            NIL => None,
            tail => Some(self.remove_slot(tail)),
        }
    }
}

/// A thread-safe LRU map with charge accounting and eviction callbacks.
pub struct LruMap<K, V> {
    opts: LruOptions,
    inner: RwLock<Inner<K, V>>,
    on_evict: Option<EntryCallback<K, V>>,
    on_over_capacity: Option<EntryCallback<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> LruMap<K, V> {
    pub fn new(opts: LruOptions) -> Self {
        Self {
            opts,
            inner: RwLock::new(Inner {
                nodes: Vec::new(),
                free: Vec::new(),
                index: HashMap::new(),
                head: NIL,
                tail: NIL,
                usage: 0,
            }),
            on_evict: None,
            on_over_capacity: None,
        }
    }

    /// Registers a callback fired for every entry evicted by limits or TTL.
    pub fn on_evict(mut self, callback: impl Fn(&K, &V) + Send + Sync + 'static) -> Self {
        self.on_evict = Some(Box::new(callback));
        self
    }

    /// Registers a callback fired for items whose charge alone exceeds the
    /// capacity. Such items are never inserted.
    pub fn on_over_capacity(mut self, callback: impl Fn(&K, &V) + Send + Sync + 'static) -> Self {
        self.on_over_capacity = Some(Box::new(callback));
        self
    }

    /// Inserts an entry at the front and evicts while over the limits.
    pub fn add(&self, key: K, value: V, charge: u64) -> AddOutcome<K, V> {
        if self.opts.capacity > 0 && charge > self.opts.capacity {
            if let Some(callback) = &self.on_over_capacity {
                callback(&key, &value);
            }
            return AddOutcome {
                existing: None,
                evicted: Vec::new(),
                rejected: true,
            };
        }

        let (existing, evicted) = {
            let mut guard = self.inner.write();
            let inner = &mut *guard;
            let existing = match inner.index.get(&key).copied() {
                Some(slot) => {
                    inner.detach(slot);
                    inner.attach_front(slot);
                    let node = inner.nodes[slot].as_mut().unwrap();
                    let old_charge = node.charge;
                    if self.opts.replace_on_add {
                        node.charge = charge;
                        node.created_at = Instant::now();
                        let old_value = std::mem::replace(&mut node.value, value);
                        inner.usage = inner.usage + charge - old_charge;
                        Some(old_value)
                    } else {
                        Some(node.value.clone())
                    }
                }
                None => {
                    let node = Node {
                        key: key.clone(),
                        value,
                        charge,
                        created_at: Instant::now(),
                        prev: NIL,
                        next: NIL,
                    };
                    let slot = inner.insert_slot(node);
                    inner.attach_front(slot);
                    inner.index.insert(key, slot);
                    inner.usage += charge;
                    None
                }
            };

            let mut evicted = Vec::new();
            while self.over_limits(inner) {
                match inner.pop_tail() {
                    Some(node) => evicted.push((node.key, node.value)),
                    None => break,
                }
            }
            (existing, evicted)
        };

        if let Some(callback) = &self.on_evict {
            for (key, value) in &evicted {
                callback(key, value);
            }
        }

        AddOutcome {
            existing,
            evicted,
            rejected: false,
        }
    }

    /// Looks up an entry, moving it to the front on a hit. Expired entries
    /// are removed and reported as misses.
    pub fn try_get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut expired = None;
        let result = {
            let mut inner = self.inner.write();
            match inner.index.get(key).copied() {
                None => None,
                Some(slot) => {
                    if self.is_expired(inner.nodes[slot].as_ref().unwrap()) {
                        let node = inner.remove_slot(slot);
                        expired = Some((node.key, node.value));
                        None
                    } else {
                        inner.detach(slot);
                        inner.attach_front(slot);
                        Some(inner.nodes[slot].as_ref().unwrap().value.clone())
                    }
                }
            }
        };

        if let Some((key, value)) = &expired {
            if let Some(callback) = &self.on_evict {
                callback(key, value);
            }
        }
        result
    }

    /// Removes an entry without firing the eviction callback.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut inner = self.inner.write();
        let slot = inner.index.get(key).copied()?;
        Some(inner.remove_slot(slot).value)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let inner = self.inner.read();
        match inner.index.get(key).copied() {
            Some(slot) => !self.is_expired(inner.nodes[slot].as_ref().unwrap()),
            None => false,
        }
    }

    /// Returns the stored value for `key`, inserting the factory's output on
    /// a miss. The factory returns the value together with its charge.
    ///
    /// The factory may run concurrently for the same key; callers that need
    /// exactly-once fills put a single-flight gate in front of the map.
    pub fn get_or_add(&self, key: K, factory: impl FnOnce() -> (V, u64)) -> V {
        if let Some(value) = self.try_get(&key) {
            return value;
        }
        let (value, charge) = factory();
        self.add(key, value.clone(), charge);
        value
    }

    /// Drops every entry without firing callbacks.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.nodes.clear();
        inner.free.clear();
        inner.index.clear();
        inner.head = NIL;
        inner.tail = NIL;
        inner.usage = 0;
    }

    /// Snapshot of the entries from most to least recently used.
    pub fn entries(&self) -> Vec<(K, V)> {
        let inner = self.inner.read();
        let mut out = Vec::with_capacity(inner.index.len());
        let mut cursor = inner.head;
        while cursor != NIL {
            let node = inner.nodes[cursor].as_ref().unwrap();
            out.push((node.key.clone(), node.value.clone()));
            cursor = node.next;
        }
        out
    }

    pub fn len(&self) -> usize {
        self.inner.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total charge currently held.
    pub fn usage(&self) -> u64 {
        self.inner.read().usage
    }

    fn over_limits(&self, inner: &Inner<K, V>) -> bool {
        (self.opts.max_entries > 0 && inner.index.len() > self.opts.max_entries)
            || (self.opts.capacity > 0 && inner.usage > self.opts.capacity)
    }

    fn is_expired(&self, node: &Node<K, V>) -> bool {
        self.opts
            .ttl
            .map_or(false, |ttl| node.created_at.elapsed() > ttl)
    }
}

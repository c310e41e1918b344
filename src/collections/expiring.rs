//! Expiring map: a TTL layer over [`SortedArrayMap`]
//!
//! Every stored value carries a creation timestamp, a last-update timestamp
//! and a timeout. A per-key timer fires when the remaining timeout elapses;
//! the fired timer never mutates state itself — it forwards the key over a
//! channel to the collection's single owning consumer task, which
//! re-validates the entry, offers registered listeners the chance to veto
//! the removal, and either resets the entry's timer or removes it through
//! the same path as an explicit remove.
//!
//! All map mutation happens under one reentrant mutation lock, so listener
//! callbacks are allowed to call back into the map (the veto path depends on
//! this). The listener set lives under its own lock and is fanned out as a
//! snapshot, so callbacks may also attach and detach listeners freely.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::collections::sorted_array::{PutResult, SortedArrayMap};
use crate::utils::listeners::ListenerRegistry;

/// Default entry timeout for maps constructed without an explicit one.
pub const DEFAULT_EXPIRATION_TIMEOUT_MS: i64 = 30_000;

/// Construction errors. Every other operation reports absence through
/// `Option` rather than failing.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("collection name must not be empty")]
    EmptyName,
    #[error("no tokio runtime available; supply one via ExpiringMapOptions::with_runtime")]
    NoRuntime,
}

/// Observer of an [`ExpiringMap`]'s item lifecycle.
///
/// All methods have no-op defaults. Callbacks run under the map's mutation
/// lock on either the writing thread (add/update/remove) or the map's
/// owning consumer task (expiring, and removals caused by expiration); the
/// lock is reentrant, so a callback may call back into the map.
pub trait ExpiringMapListener<V>: Send + Sync {
    fn on_item_added(&self, _key: i64, _index: usize, _item: &ItemSnapshot<V>) {}

    fn on_item_updated(&self, _key: i64, _index: usize, _item: &ItemSnapshot<V>) {}

    /// An item's timeout has elapsed and it is about to be removed.
    /// Return true to veto the removal; the item's timer is then reset to
    /// its full timeout from now. The first veto wins and stops the
    /// fan-out.
    fn on_item_expiring(&self, _key: i64, _index: usize, _item: &ItemSnapshot<V>) -> bool {
        false
    }

    /// The item was removed — explicitly, through [`ExpiringMap::clear`],
    /// or by expiration (`expired` is true only for the latter).
    fn on_item_removed(&self, _key: i64, _index: usize, _item: &ItemSnapshot<V>, _expired: bool) {}
}

/// Stored entry. Mutated in place on every re-put of the same key so the
/// entry's identity (and `added_at`) survives updates.
struct Item<V> {
    value: V,
    added_at: Instant,
    updated_at: Instant,
    timeout_ms: i64,
}

impl<V> Item<V> {
    fn new(value: V, timeout_ms: i64) -> Self {
        let now = Instant::now();
        Self {
            value,
            added_at: now,
            updated_at: now,
            timeout_ms,
        }
    }

    fn update(&mut self, value: V, timeout_ms: i64) {
        self.value = value;
        self.timeout_ms = timeout_ms;
        self.updated_at = Instant::now();
    }

    /// Refreshes `updated_at` without touching value or timeout; used by
    /// the veto path to restart the full timeout from now.
    fn touch(&mut self) {
        self.updated_at = Instant::now();
    }

    fn remaining_ms(&self) -> i64 {
        self.timeout_ms - self.updated_at.elapsed().as_millis() as i64
    }

    fn is_expired(&self) -> bool {
        self.remaining_ms() <= 0
    }
}

/// Point-in-time copy of an entry, handed to listeners and returned by
/// [`ExpiringMap::snapshot`]. Holding one never blocks the map.
#[derive(Debug, Clone)]
pub struct ItemSnapshot<V> {
    key: i64,
    value: V,
    added_at: Instant,
    updated_at: Instant,
    timeout_ms: i64,
}

impl<V> ItemSnapshot<V> {
    fn new(key: i64, item: &Item<V>) -> Self
    where
        V: Clone,
    {
        Self {
            key,
            value: item.value.clone(),
            added_at: item.added_at,
            updated_at: item.updated_at,
            timeout_ms: item.timeout_ms,
        }
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn into_value(self) -> V {
        self.value
    }

    /// When the key was first added; unchanged across updates.
    pub fn added_at(&self) -> Instant {
        self.added_at
    }

    /// When the entry was last written or veto-reset.
    pub fn updated_at(&self) -> Instant {
        self.updated_at
    }

    /// The entry's timeout; 0 or negative means it never expires.
    pub fn timeout_ms(&self) -> i64 {
        self.timeout_ms
    }

    /// Time since the key was first added.
    pub fn age(&self) -> Duration {
        self.added_at.elapsed()
    }

    /// Time since the entry was last written.
    pub fn since_update(&self) -> Duration {
        self.updated_at.elapsed()
    }

    /// Milliseconds until expiration as of now; negative when overdue.
    pub fn remaining_ms(&self) -> i64 {
        self.timeout_ms - self.updated_at.elapsed().as_millis() as i64
    }

    pub fn is_expired(&self) -> bool {
        self.remaining_ms() <= 0
    }
}

/// Construction options for [`ExpiringMap`].
#[derive(Clone, Default)]
pub struct ExpiringMapOptions {
    default_timeout_ms: Option<i64>,
    runtime: Option<Handle>,
    sync_lock: Option<Arc<ReentrantMutex<()>>>,
}

impl ExpiringMapOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timeout applied by `put`/`set_value_at` calls that do not pass one.
    /// 0 or negative disables expiration by default.
    pub fn with_default_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.default_timeout_ms = Some(timeout_ms);
        self
    }

    /// Runtime to run the expiration timers and the owning consumer task
    /// on. Defaults to the runtime current at construction.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Caller-supplied lock acquired by every public operation before the
    /// map's own mutation lock, for callers that need atomicity across
    /// several calls (lock the same handle around the sequence).
    pub fn with_sync_lock(mut self, lock: Arc<ReentrantMutex<()>>) -> Self {
        self.sync_lock = Some(lock);
        self
    }
}

struct MapState<V> {
    items: SortedArrayMap<Item<V>>,
    /// One pending timer per key at most; arming replaces the old handle.
    timers: HashMap<i64, JoinHandle<()>>,
    started: bool,
    /// Cleared by an explicit `stop()` so later writes do not restart
    /// expiration processing; `resume()` sets it back.
    auto_start: bool,
    default_timeout_ms: i64,
}

struct Shared<V> {
    name: String,
    sync_lock: Option<Arc<ReentrantMutex<()>>>,
    state: ReentrantMutex<RefCell<MapState<V>>>,
    listeners: ListenerRegistry<dyn ExpiringMapListener<V>>,
    expire_tx: mpsc::UnboundedSender<i64>,
    runtime: Handle,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl<V> Drop for Shared<V> {
    fn drop(&mut self) {
        if let Some(consumer) = self.consumer.get_mut().take() {
            consumer.abort();
        }
        let state = self.state.get_mut().get_mut();
        for (_, timer) in state.timers.drain() {
            timer.abort();
        }
    }
}

/// Map from `i64` keys to values with per-entry expiration, lifecycle
/// notifications and a veto-capable eviction protocol.
///
/// Cheap to clone; clones share the same collection. See the module docs
/// for the concurrency model.
pub struct ExpiringMap<V> {
    shared: Arc<Shared<V>>,
}

impl<V> Clone for ExpiringMap<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V: Clone + Send + 'static> ExpiringMap<V> {
    /// Creates a map with [`DEFAULT_EXPIRATION_TIMEOUT_MS`] bound to the
    /// current tokio runtime. `name` is diagnostic only but must be
    /// non-empty.
    pub fn new(name: impl Into<String>) -> Result<Self, MapError> {
        Self::with_options(name, ExpiringMapOptions::new())
    }

    pub fn with_options(
        name: impl Into<String>,
        options: ExpiringMapOptions,
    ) -> Result<Self, MapError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(MapError::EmptyName);
        }
        let runtime = match options.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| MapError::NoRuntime)?,
        };

        let (expire_tx, mut expire_rx) = mpsc::unbounded_channel();
        let listeners = ListenerRegistry::new(format!("{name}.listeners"));
        let shared = Arc::new(Shared {
            name,
            sync_lock: options.sync_lock,
            state: ReentrantMutex::new(RefCell::new(MapState {
                items: SortedArrayMap::new(),
                timers: HashMap::new(),
                started: false,
                auto_start: true,
                default_timeout_ms: options
                    .default_timeout_ms
                    .unwrap_or(DEFAULT_EXPIRATION_TIMEOUT_MS),
            })),
            listeners,
            expire_tx,
            runtime: runtime.clone(),
            consumer: Mutex::new(None),
        });

        // Owning consumer: the only context that reacts to fired timers.
        // Holds a weak reference so dropping the last map handle shuts the
        // loop down.
        let weak: Weak<Shared<V>> = Arc::downgrade(&shared);
        let consumer = runtime.spawn(async move {
            while let Some(key) = expire_rx.recv().await {
                match weak.upgrade() {
                    Some(shared) => shared.expire_item(key),
                    None => break,
                }
            }
        });
        *shared.consumer.lock() = Some(consumer);

        Ok(Self { shared })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The caller-supplied broader-atomicity lock, if one was configured.
    pub fn sync_lock(&self) -> Option<Arc<ReentrantMutex<()>>> {
        self.shared.sync_lock.clone()
    }

    /// Stores `value` under `key` with the default timeout. Creating a new
    /// entry notifies `on_item_added`; overwriting notifies
    /// `on_item_updated`. Either way the key's expiration timer restarts.
    pub fn put(&self, key: i64, value: V) -> PutResult {
        self.shared.put_with_timeout(key, value, None)
    }

    /// [`put`](Self::put) with an explicit timeout; `<= 0` never expires.
    pub fn put_with_timeout(&self, key: i64, value: V, timeout_ms: i64) -> PutResult {
        self.shared.put_with_timeout(key, value, Some(timeout_ms))
    }

    /// Returns a copy of the value for `key`, or `None`.
    pub fn get(&self, key: i64) -> Option<V> {
        let shared = &self.shared;
        let _outer = shared.outer_guard();
        let guard = shared.state.lock();
        let result = guard.borrow().items.get(key).map(|item| item.value.clone());
        result
    }

    /// Returns the value for `key`, or `fallback` if unmapped.
    pub fn get_or(&self, key: i64, fallback: V) -> V {
        self.get(key).unwrap_or(fallback)
    }

    /// Removes `key`, cancelling its pending timer and notifying
    /// `on_item_removed`. Returns the removed value, or `None` if absent.
    pub fn remove(&self, key: i64) -> Option<V> {
        let shared = &self.shared;
        let _outer = shared.outer_guard();
        let guard = shared.state.lock();
        let index = guard.borrow_mut().items.index_of_key(key)?;
        shared.remove_at_locked(&guard, index, false)
    }

    /// Removes the entry at `index` (ascending key order). Panics if out of
    /// range (caller contract).
    pub fn remove_at(&self, index: usize) -> Option<V> {
        let shared = &self.shared;
        let _outer = shared.outer_guard();
        let guard = shared.state.lock();
        shared.remove_at_locked(&guard, index, false)
    }

    /// Number of live entries.
    pub fn size(&self) -> usize {
        let shared = &self.shared;
        let _outer = shared.outer_guard();
        let guard = shared.state.lock();
        let size = guard.borrow_mut().items.size();
        size
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Key of the `index`th entry in ascending order. Panics if out of
    /// range (caller contract).
    pub fn key_at(&self, index: usize) -> i64 {
        let shared = &self.shared;
        let _outer = shared.outer_guard();
        let guard = shared.state.lock();
        let key = guard.borrow_mut().items.key_at(index);
        key
    }

    /// Copy of the value of the `index`th entry. Panics if out of range
    /// (caller contract).
    pub fn value_at(&self, index: usize) -> V {
        let shared = &self.shared;
        let _outer = shared.outer_guard();
        let guard = shared.state.lock();
        let value = guard.borrow_mut().items.value_at(index).value.clone();
        value
    }

    /// Replaces the value at `index` with the default timeout, restarting
    /// the entry's timer and notifying `on_item_updated`.
    pub fn set_value_at(&self, index: usize, value: V) {
        self.shared.set_value_at_with_timeout(index, value, None);
    }

    pub fn set_value_at_with_timeout(&self, index: usize, value: V, timeout_ms: i64) {
        self.shared
            .set_value_at_with_timeout(index, value, Some(timeout_ms));
    }

    /// True if `key` is currently mapped.
    pub fn contains_key(&self, key: i64) -> bool {
        self.index_of_key(key).is_some()
    }

    /// Index of `key` in ascending order, or `None` if unmapped.
    pub fn index_of_key(&self, key: i64) -> Option<usize> {
        let shared = &self.shared;
        let _outer = shared.outer_guard();
        let guard = shared.state.lock();
        let index = guard.borrow_mut().items.index_of_key(key);
        index
    }

    /// Ascending snapshot of all keys.
    pub fn keys(&self) -> Vec<i64> {
        let shared = &self.shared;
        let _outer = shared.outer_guard();
        let guard = shared.state.lock();
        let keys = guard.borrow_mut().items.keys().collect();
        keys
    }

    /// Point-in-time snapshot of all entries in ascending key order.
    pub fn snapshot(&self) -> Vec<ItemSnapshot<V>> {
        let shared = &self.shared;
        let _outer = shared.outer_guard();
        let guard = shared.state.lock();
        let snapshots = guard
            .borrow_mut()
            .items
            .iter()
            .map(|(key, item)| ItemSnapshot::new(key, item))
            .collect();
        snapshots
    }

    /// Removes every entry one at a time through the normal removal path,
    /// so each entry's timer is cancelled and each removal is observed by
    /// listeners.
    pub fn clear(&self) {
        let shared = &self.shared;
        let _outer = shared.outer_guard();
        let guard = shared.state.lock();
        debug!("#{} clear", shared.name);
        loop {
            let empty = guard.borrow_mut().items.is_empty();
            if empty {
                break;
            }
            shared.remove_at_locked(&guard, 0, false);
        }
    }

    /// Cancels all pending expiration timers without forgetting any
    /// entries. [`resume`](Self::resume) or any later write re-arms them.
    pub fn pause(&self) {
        let shared = &self.shared;
        let _outer = shared.outer_guard();
        let guard = shared.state.lock();
        let mut st = guard.borrow_mut();
        if st.started {
            shared.cancel_all_timers(&mut st);
            debug!("#{} paused", shared.name);
        }
    }

    /// Re-arms a timer for every live entry from its own remaining time.
    /// Also restarts expiration processing after an explicit
    /// [`stop`](Self::stop).
    pub fn resume(&self) {
        let shared = &self.shared;
        let _outer = shared.outer_guard();
        let guard = shared.state.lock();
        let mut st = guard.borrow_mut();
        let st = &mut *st;
        if st.started {
            shared.rearm_all(st);
        } else if !st.auto_start {
            st.auto_start = true;
            st.started = true;
            shared.rearm_all(st);
            debug!("#{} expiration processing restarted", shared.name);
        }
    }

    /// Pauses and marks expiration processing inactive. Entries are kept,
    /// but no timers fire — and later writes do not restart processing —
    /// until [`resume`](Self::resume).
    pub fn stop(&self) {
        let shared = &self.shared;
        let _outer = shared.outer_guard();
        let guard = shared.state.lock();
        let mut st = guard.borrow_mut();
        if st.started {
            shared.cancel_all_timers(&mut st);
        }
        st.started = false;
        st.auto_start = false;
        debug!("#{} stopped", shared.name);
    }

    pub fn default_timeout_ms(&self) -> i64 {
        let shared = &self.shared;
        let _outer = shared.outer_guard();
        let guard = shared.state.lock();
        let timeout = guard.borrow().default_timeout_ms;
        timeout
    }

    /// Atomically pause, change the default timeout, resume. Existing
    /// entries keep their previously assigned timeouts; only future writes
    /// that use the default are affected.
    pub fn set_default_timeout_ms(&self, timeout_ms: i64) {
        let shared = &self.shared;
        let _outer = shared.outer_guard();
        let guard = shared.state.lock();
        let mut st = guard.borrow_mut();
        let st = &mut *st;
        if st.started {
            shared.cancel_all_timers(st);
        }
        st.default_timeout_ms = timeout_ms;
        if st.started {
            shared.rearm_all(st);
        }
    }

    /// Adds a lifecycle listener; insertion order determines notification
    /// order. Returns false if already attached.
    pub fn add_listener(&self, listener: Arc<dyn ExpiringMapListener<V>>) -> bool {
        self.shared.listeners.attach(listener)
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ExpiringMapListener<V>>) -> bool {
        self.shared.listeners.detach(listener)
    }
}

impl<V: Clone + Send + PartialEq + 'static> ExpiringMap<V> {
    /// Index of the first entry holding `value`, by linear scan in
    /// ascending key order. Which entry wins when duplicates exist is
    /// unspecified.
    pub fn index_of_value(&self, value: &V) -> Option<usize> {
        let shared = &self.shared;
        let _outer = shared.outer_guard();
        let guard = shared.state.lock();
        let index = guard
            .borrow_mut()
            .items
            .values()
            .position(|item| item.value == *value);
        index
    }

    /// True if any key maps to `value`.
    pub fn contains_value(&self, value: &V) -> bool {
        self.index_of_value(value).is_some()
    }
}

type StateGuard<'a, V> = ReentrantMutexGuard<'a, RefCell<MapState<V>>>;

impl<V: Clone + Send + 'static> Shared<V> {
    fn outer_guard(&self) -> Option<ReentrantMutexGuard<'_, ()>> {
        self.sync_lock.as_deref().map(|lock| lock.lock())
    }

    fn put_with_timeout(&self, key: i64, value: V, timeout_ms: Option<i64>) -> PutResult {
        let _outer = self.outer_guard();
        let guard = self.state.lock();
        let (result, snapshot) = {
            let mut st = guard.borrow_mut();
            let st = &mut *st;
            let timeout_ms = timeout_ms.unwrap_or(st.default_timeout_ms);
            let result = match st.items.index_of_key(key) {
                Some(index) => {
                    // Same entry mutated in place: added_at and entry
                    // identity survive the update.
                    st.items.value_at_mut(index).update(value, timeout_ms);
                    PutResult::Updated(index)
                }
                None => st.items.put(key, Item::new(value, timeout_ms)),
            };
            self.after_write(st, key);
            let snapshot = match st.items.get(key) {
                Some(item) => ItemSnapshot::new(key, item),
                None => unreachable!("entry exists immediately after write"),
            };
            (result, snapshot)
        };

        match result {
            PutResult::Inserted(index) => {
                trace!(
                    "#{} put: added key={} index={} timeout={}ms",
                    self.name,
                    key,
                    index,
                    snapshot.timeout_ms()
                );
                for listener in self.listeners.snapshot() {
                    listener.on_item_added(key, index, &snapshot);
                }
            }
            PutResult::Updated(index) => {
                trace!("#{} put: updated key={} index={}", self.name, key, index);
                for listener in self.listeners.snapshot() {
                    listener.on_item_updated(key, index, &snapshot);
                }
            }
        }
        result
    }

    fn set_value_at_with_timeout(&self, index: usize, value: V, timeout_ms: Option<i64>) {
        let _outer = self.outer_guard();
        let guard = self.state.lock();
        let (key, snapshot) = {
            let mut st = guard.borrow_mut();
            let st = &mut *st;
            let timeout_ms = timeout_ms.unwrap_or(st.default_timeout_ms);
            let key = st.items.key_at(index);
            st.items.value_at_mut(index).update(value, timeout_ms);
            self.after_write(st, key);
            let snapshot = ItemSnapshot::new(key, st.items.value_at(index));
            (key, snapshot)
        };
        trace!(
            "#{} set_value_at: updated key={} index={}",
            self.name,
            key,
            index
        );
        for listener in self.listeners.snapshot() {
            listener.on_item_updated(key, index, &snapshot);
        }
    }

    /// Write epilogue: arm the written key's timer, auto-starting
    /// expiration processing on the first write unless an explicit stop
    /// suppressed it.
    fn after_write(&self, st: &mut MapState<V>, key: i64) {
        if st.started {
            self.arm_timer(st, key);
        } else if st.auto_start {
            st.started = true;
            debug!("#{} expiration processing started", self.name);
            self.rearm_all(st);
        }
    }

    /// Removes the entry at `index` under an already-held state lock,
    /// cancelling its timer and notifying listeners. Returns the removed
    /// value, or `None` if the slot was already tombstoned.
    fn remove_at_locked(
        &self,
        guard: &StateGuard<'_, V>,
        index: usize,
        expired: bool,
    ) -> Option<V> {
        let (key, item, drained) = {
            let mut st = guard.borrow_mut();
            let st = &mut *st;
            let key = st.items.key_at(index);
            let item = st.items.remove_at(index)?;
            self.cancel_timer(st, key);
            let drained = st.started && st.items.size() == 0;
            if drained {
                // Drained to empty while active: processing stops, but the
                // next write may auto-start it again.
                st.started = false;
                self.cancel_all_timers(st);
            }
            (key, item, drained)
        };
        if drained {
            debug!(
                "#{} collection drained; expiration processing stopped",
                self.name
            );
        }
        debug!(
            "#{} removed key={} index={} expired={}",
            self.name, key, index, expired
        );

        let snapshot = ItemSnapshot::new(key, &item);
        for listener in self.listeners.snapshot() {
            listener.on_item_removed(key, index, &snapshot, expired);
        }
        Some(item.value)
    }

    /// Owning-context handler for a fired timer. Re-validates the entry
    /// (a fire racing a concurrent removal or re-put is expected and
    /// silently ignored), offers listeners the veto, then resets or
    /// removes.
    fn expire_item(&self, key: i64) {
        let _outer = self.outer_guard();
        let guard = self.state.lock();

        let (index, snapshot) = {
            let mut st = guard.borrow_mut();
            let st = &mut *st;
            if !st.started {
                // A fire already in flight when stop() cancelled the
                // timers lands here.
                return;
            }
            let index = match st.items.index_of_key(key) {
                Some(index) => index,
                None => {
                    trace!(
                        "#{} expire fired for key={} which no longer exists; ignoring",
                        self.name,
                        key
                    );
                    return;
                }
            };
            let item = st.items.value_at(index);
            if !item.is_expired() {
                // Refreshed by a write after this timer fired; the write
                // armed a new timer.
                trace!(
                    "#{} expire fired for key={} but {}ms remain; ignoring",
                    self.name,
                    key,
                    item.remaining_ms()
                );
                return;
            }
            (index, ItemSnapshot::new(key, item))
        };

        let mut vetoed = false;
        for listener in self.listeners.snapshot() {
            if listener.on_item_expiring(key, index, &snapshot) {
                vetoed = true;
                break;
            }
        }

        if vetoed {
            let mut st = guard.borrow_mut();
            let st = &mut *st;
            if let Some(item) = st.items.get_mut(key) {
                item.touch();
            }
            self.arm_timer(st, key);
            debug!(
                "#{} expiration of key={} vetoed by listener; timeout reset",
                self.name, key
            );
            return;
        }

        warn!(
            "#{} key={} expired after {}ms; removing",
            self.name,
            key,
            snapshot.timeout_ms()
        );
        // Re-resolve: an expiring callback may have mutated the map.
        let index = {
            let mut st = guard.borrow_mut();
            match st.items.index_of_key(key) {
                Some(index) => index,
                None => return,
            }
        };
        self.remove_at_locked(&guard, index, true);
    }

    /// (Re)arms the expiration timer for `key`, superseding any pending
    /// one. No-op for entries that never expire. The timer task only
    /// forwards the key to the owning consumer; it never touches state.
    fn arm_timer(&self, st: &mut MapState<V>, key: i64) {
        self.cancel_timer(st, key);
        let (timeout_ms, remaining_ms) = match st.items.get(key) {
            Some(item) => (item.timeout_ms, item.remaining_ms()),
            None => return,
        };
        if timeout_ms <= 0 {
            return;
        }
        let delay = Duration::from_millis(remaining_ms.max(0) as u64);
        trace!(
            "#{} arming expiration for key={} in {:?}",
            self.name,
            key,
            delay
        );
        let tx = self.expire_tx.clone();
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(key);
        });
        st.timers.insert(key, timer);
    }

    fn rearm_all(&self, st: &mut MapState<V>) {
        let keys: Vec<i64> = st.items.keys().collect();
        for key in keys {
            self.arm_timer(st, key);
        }
    }

    /// Best-effort: a timer already in flight is absorbed by the
    /// re-validation in `expire_item`.
    fn cancel_timer(&self, st: &mut MapState<V>, key: i64) {
        if let Some(timer) = st.timers.remove(&key) {
            timer.abort();
        }
    }

    fn cancel_all_timers(&self, st: &mut MapState<V>) {
        for (_, timer) in st.timers.drain() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_name_rejected() {
        assert!(matches!(
            ExpiringMap::<String>::new(""),
            Err(MapError::EmptyName)
        ));
        assert!(matches!(
            ExpiringMap::<String>::new("   "),
            Err(MapError::EmptyName)
        ));
    }

    #[test]
    fn test_construction_requires_runtime() {
        let result = std::thread::spawn(|| ExpiringMap::<String>::new("devices"))
            .join()
            .unwrap();
        assert!(matches!(result, Err(MapError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_explicit_runtime_handle() {
        let options = ExpiringMapOptions::new()
            .with_runtime(Handle::current())
            .with_default_timeout_ms(0);
        let map = ExpiringMap::<String>::with_options("devices", options).unwrap();
        assert_eq!(map.default_timeout_ms(), 0);
        assert_eq!(map.name(), "devices");
    }

    #[tokio::test]
    async fn test_put_get_remove_roundtrip() {
        let map = ExpiringMap::new("devices").unwrap();
        assert!(map.put(42, "scanner".to_string()).is_inserted());
        assert_eq!(map.get(42), Some("scanner".to_string()));
        assert_eq!(map.get_or(43, "fallback".to_string()), "fallback".to_string());
        assert_eq!(map.remove(42), Some("scanner".to_string()));
        assert_eq!(map.remove(42), None);
        assert_eq!(map.size(), 0);
    }

    #[tokio::test]
    async fn test_update_preserves_added_at() {
        let map = ExpiringMap::new("devices").unwrap();
        map.put(1, "a".to_string());
        let before = map.snapshot()[0].added_at();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!map.put(1, "b".to_string()).is_inserted());
        let snapshots = map.snapshot();
        let snapshot = &snapshots[0];
        assert_eq!(snapshot.added_at(), before);
        assert!(snapshot.updated_at() > before);
        assert_eq!(snapshot.value(), "b");
        assert!(snapshot.age() >= snapshot.since_update());
        assert!(!snapshot.is_expired());
    }

    #[tokio::test]
    async fn test_positional_access_in_key_order() {
        let map = ExpiringMap::new("devices").unwrap();
        for key in [5, 3, 9, 1] {
            map.put(key, format!("v{key}"));
        }
        assert_eq!(map.keys(), vec![1, 3, 5, 9]);
        assert_eq!(map.key_at(2), 5);
        assert_eq!(map.value_at(0), "v1".to_string());
        assert_eq!(map.index_of_key(9), Some(3));
        assert_eq!(map.index_of_key(2), None);
    }

    #[tokio::test]
    async fn test_index_of_value_first_match() {
        let map = ExpiringMap::new("devices").unwrap();
        map.put(1, "a".to_string());
        map.put(2, "b".to_string());
        map.put(3, "a".to_string());
        assert_eq!(map.index_of_value(&"b".to_string()), Some(1));
        assert_eq!(map.index_of_value(&"a".to_string()), Some(0));
        assert_eq!(map.index_of_value(&"z".to_string()), None);
        assert!(map.contains_value(&"a".to_string()));
        assert!(!map.contains_value(&"z".to_string()));
    }

    #[tokio::test]
    async fn test_set_value_at_replaces_value() {
        let map = ExpiringMap::new("devices").unwrap();
        map.put(1, "a".to_string());
        map.put(2, "b".to_string());
        map.set_value_at(1, "b2".to_string());
        assert_eq!(map.get(2), Some("b2".to_string()));
    }

    #[tokio::test]
    async fn test_sync_lock_is_exposed() {
        let lock = Arc::new(ReentrantMutex::new(()));
        let options = ExpiringMapOptions::new().with_sync_lock(lock.clone());
        let map = ExpiringMap::<String>::with_options("devices", options).unwrap();
        let exposed = map.sync_lock().unwrap();
        assert!(Arc::ptr_eq(&lock, &exposed));

        // Operations still work while the caller holds the shared lock on
        // the same thread (it is reentrant).
        let _guard = lock.lock();
        map.put(1, "a".to_string());
        assert_eq!(map.size(), 1);
    }
}

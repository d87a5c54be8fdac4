//! Shared store for open correlation windows.
//!
//! The store owns three structures that must stay consistent: a slab of
//! window slots addressed by [`ContextId`], a key index for O(1) lookup, and
//! a [`TimerWheel`] holding one expiry entry per open window. All access
//! goes through a [`StateTx`] transaction obtained from
//! [`CorrelationStateStore::begin`], which holds the store lock for its
//! lifetime, so a processor observes and mutates the store atomically with
//! respect to other handles to the same store.
//!
//! Time is a monotone high-water mark: [`StateTx::set_time`] only ever moves
//! the clock forward, and expired windows are handed out of the store before
//! the call returns.

use super::context::{CorrelationContext, CorrelationKey};
use super::error::{CorrelationError, CorrelationResult};
use super::timer_wheel::TimerWheel;
use super::types::SharedRecord;
use log::error;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Opaque handle to an open window inside the store.
///
/// Ids are generational: once the window closes, its id goes stale and every
/// store operation on it reports the window as gone instead of touching a
/// reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextId {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct ContextSlot {
    generation: u32,
    context: Option<CorrelationContext>,
}

/// Counters describing the store at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub open_windows: usize,
    pub pending_timers: usize,
    pub current_tick: i64,
}

#[derive(Debug)]
struct StoreInner {
    slots: Vec<ContextSlot>,
    free: Vec<u32>,
    index: FxHashMap<CorrelationKey, ContextId>,
    wheel: TimerWheel<ContextId>,
    current_tick: i64,
    timeout: i64,
}

/// Handle to the correlation state. Clones share the same underlying store.
#[derive(Debug, Clone)]
pub struct CorrelationStateStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl CorrelationStateStore {
    /// Create an empty store whose windows expire `timeout_secs` after the
    /// last matching record. The timer wheel is sized so that a freshly
    /// slid timeout lands well inside the wheel horizon.
    pub fn new(timeout_secs: u64) -> CorrelationStateStore {
        let timeout = i64::try_from(timeout_secs).unwrap_or(i64::MAX).max(1);
        let span_hint = timeout.saturating_mul(4).clamp(256, 65_536) as usize;
        CorrelationStateStore {
            inner: Arc::new(Mutex::new(StoreInner {
                slots: Vec::new(),
                free: Vec::new(),
                index: FxHashMap::default(),
                wheel: TimerWheel::new(span_hint),
                current_tick: 0,
                timeout,
            })),
        }
    }

    /// Open a transaction. The store lock is held until the returned
    /// [`StateTx`] is dropped.
    pub fn begin(&self) -> StateTx<'_> {
        StateTx {
            inner: self.inner.lock().expect("correlation state lock poisoned"),
        }
    }
}

/// One locked transaction against the store.
pub struct StateTx<'a> {
    inner: MutexGuard<'a, StoreInner>,
}

impl StateTx<'_> {
    /// The store clock, in whole-second ticks.
    pub fn current_tick(&self) -> i64 {
        self.inner.current_tick
    }

    /// Advance the clock to `candidate`, handing every window whose expiry
    /// tick falls in the crossed range to `on_expired` together with the
    /// tick it expired at. A candidate at or before the current clock is
    /// ignored, so out-of-order input can never run time backwards. Returns
    /// the number of windows that expired.
    pub fn set_time(
        &mut self,
        candidate: i64,
        mut on_expired: impl FnMut(i64, CorrelationContext),
    ) -> CorrelationResult<usize> {
        if candidate <= self.inner.current_tick {
            return Ok(0);
        }
        let mut due: Vec<(i64, ContextId)> = Vec::new();
        self.inner
            .wheel
            .advance(candidate, |tick, id| due.push((tick, id)))?;
        self.inner.current_tick = candidate;
        let mut expired = 0;
        for (tick, id) in due {
            if let Some(context) = self.inner.take(id) {
                expired += 1;
                on_expired(tick, context);
            }
        }
        Ok(expired)
    }

    /// Find the open window for `key`, if any.
    pub fn lookup(&self, key: &CorrelationKey) -> Option<ContextId> {
        self.inner.index.get(key).copied()
    }

    /// Borrow an open window.
    pub fn context(&self, id: ContextId) -> Option<&CorrelationContext> {
        self.inner.slot(id)
    }

    /// Insert a new window and schedule its expiry at `current + timeout`.
    /// The key must not already have an open window.
    pub fn store(&mut self, context: CorrelationContext) -> CorrelationResult<ContextId> {
        let inner = &mut *self.inner;
        if inner.index.contains_key(context.key()) {
            return Err(CorrelationError::invariant(format!(
                "window already open for correlation key ({})",
                context.key()
            )));
        }
        Ok(inner.insert(context))
    }

    /// Append a record to an open window without touching its timer.
    pub fn append(&mut self, id: ContextId, record: SharedRecord) -> CorrelationResult<()> {
        match self.inner.slot_mut(id) {
            Some(context) => {
                context.push(record);
                Ok(())
            }
            None => Err(CorrelationError::invariant(
                "append to a window that is no longer open",
            )),
        }
    }

    /// Slide the window's expiry out to `current + timeout`.
    pub fn update(&mut self, id: ContextId) -> CorrelationResult<()> {
        let inner = &mut *self.inner;
        let expire_at = inner.current_tick.saturating_add(inner.timeout);
        let Some(context) = inner
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.context.as_mut())
        else {
            return Err(CorrelationError::invariant(
                "update on a window that is no longer open",
            ));
        };
        let slid = context
            .timer()
            .and_then(|handle| inner.wheel.reschedule(handle, expire_at));
        match slid {
            Some(handle) => context.set_timer(Some(handle)),
            None => {
                // An open window must always carry a live timer; reattach
                // one rather than letting the window leak.
                error!(
                    "open window lost its expiry timer, rescheduling; {}",
                    context.key()
                );
                let handle = inner.wheel.schedule(expire_at, id);
                context.set_timer(Some(handle));
            }
        }
        Ok(())
    }

    /// Close a window and take it out of the store, cancelling its timer.
    /// Safe to call with a stale id.
    pub fn remove(&mut self, id: ContextId) -> Option<CorrelationContext> {
        self.inner.take(id)
    }

    /// Hand every open window out of the store in expiry order, leaving the
    /// store empty. The clock does not move.
    pub fn drain(&mut self, mut on_each: impl FnMut(CorrelationContext)) -> usize {
        let mut due: Vec<(i64, ContextId)> = Vec::new();
        self.inner.wheel.drain(|tick, id| due.push((tick, id)));
        let mut drained = 0;
        for (_, id) in due {
            if let Some(context) = self.inner.take(id) {
                drained += 1;
                on_each(context);
            }
        }
        debug_assert!(self.inner.index.is_empty());
        drained
    }

    /// Number of open windows.
    pub fn len(&self) -> usize {
        self.inner.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.index.is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            open_windows: self.inner.index.len(),
            pending_timers: self.inner.wheel.len(),
            current_tick: self.inner.current_tick,
        }
    }
}

impl StoreInner {
    fn slot(&self, id: ContextId) -> Option<&CorrelationContext> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.context.as_ref())
    }

    fn slot_mut(&mut self, id: ContextId) -> Option<&mut CorrelationContext> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.context.as_mut())
    }

    fn insert(&mut self, mut context: CorrelationContext) -> ContextId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(ContextSlot {
                    generation: 0,
                    context: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let id = ContextId {
            index,
            generation: self.slots[index as usize].generation,
        };
        let expire_at = self.current_tick.saturating_add(self.timeout);
        let handle = self.wheel.schedule(expire_at, id);
        context.set_timer(Some(handle));
        self.index.insert(context.key().clone(), id);
        self.slots[index as usize].context = Some(context);
        id
    }

    fn take(&mut self, id: ContextId) -> Option<CorrelationContext> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let mut context = slot.context.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.index.remove(context.key());
        if let Some(handle) = context.timer() {
            self.wheel.cancel(handle);
        }
        context.set_timer(None);
        Some(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corrstream::engine::context::KeyScope;
    use crate::corrstream::engine::types::{FieldValue, Record};
    use std::collections::HashMap;

    fn record(host: &str) -> Record {
        let mut fields = HashMap::new();
        fields.insert("host".to_string(), FieldValue::String(host.into()));
        Record::new(fields)
    }

    fn key(host: &str, session: &str) -> CorrelationKey {
        CorrelationKey::new(KeyScope::Host, &record(host), session.into())
    }

    fn open(tx: &mut StateTx<'_>, host: &str, session: &str) -> ContextId {
        let context = CorrelationContext::new(key(host, session), SharedRecord::new(record(host)));
        tx.store(context).unwrap()
    }

    #[test]
    fn test_store_and_lookup() {
        let store = CorrelationStateStore::new(10);
        let mut tx = store.begin();
        let id = open(&mut tx, "web1", "k");
        assert_eq!(tx.lookup(&key("web1", "k")), Some(id));
        assert_eq!(tx.lookup(&key("web2", "k")), None);
        assert_eq!(tx.len(), 1);
    }

    #[test]
    fn test_duplicate_store_rejected() {
        let store = CorrelationStateStore::new(10);
        let mut tx = store.begin();
        open(&mut tx, "web1", "k");
        let duplicate = CorrelationContext::new(key("web1", "k"), SharedRecord::new(record("web1")));
        assert!(matches!(
            tx.store(duplicate),
            Err(CorrelationError::InvariantViolation { .. })
        ));
    }

    #[test]
    fn test_expiry_after_timeout() {
        let store = CorrelationStateStore::new(10);
        let mut tx = store.begin();
        let id = open(&mut tx, "web1", "k");
        let mut expired = Vec::new();
        assert_eq!(tx.set_time(9, |t, c| expired.push((t, c))).unwrap(), 0);
        assert_eq!(tx.set_time(10, |t, c| expired.push((t, c))).unwrap(), 1);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, 10);
        assert_eq!(expired[0].1.len(), 1);
        assert_eq!(tx.lookup(&key("web1", "k")), None);
        assert!(tx.remove(id).is_none());
    }

    #[test]
    fn test_update_slides_expiry() {
        let store = CorrelationStateStore::new(10);
        let mut tx = store.begin();
        let id = open(&mut tx, "web1", "k");
        tx.set_time(5, |_, _| panic!("nothing expires at 5")).unwrap();
        tx.update(id).unwrap();
        // Expiry slid from 10 to 15.
        assert_eq!(tx.set_time(14, |_, _| {}).unwrap(), 0);
        assert_eq!(tx.set_time(15, |_, _| {}).unwrap(), 1);
        assert!(tx.is_empty());
    }

    #[test]
    fn test_set_time_is_monotone() {
        let store = CorrelationStateStore::new(10);
        let mut tx = store.begin();
        tx.set_time(100, |_, _| {}).unwrap();
        assert_eq!(tx.set_time(50, |_, _| {}).unwrap(), 0);
        assert_eq!(tx.current_tick(), 100);
        assert_eq!(tx.set_time(100, |_, _| {}).unwrap(), 0);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let store = CorrelationStateStore::new(10);
        let mut tx = store.begin();
        let id = open(&mut tx, "web1", "k");
        assert!(tx.remove(id).is_some());
        assert!(tx.remove(id).is_none());
        assert_eq!(tx.stats().pending_timers, 0);
    }

    #[test]
    fn test_stale_id_after_slot_reuse() {
        let store = CorrelationStateStore::new(10);
        let mut tx = store.begin();
        let first = open(&mut tx, "web1", "k");
        tx.remove(first);
        let second = open(&mut tx, "web2", "k");
        assert!(tx.context(first).is_none());
        assert!(tx.append(first, SharedRecord::new(record("web1"))).is_err());
        assert!(tx.context(second).is_some());
    }

    #[test]
    fn test_append_grows_window() {
        let store = CorrelationStateStore::new(10);
        let mut tx = store.begin();
        let id = open(&mut tx, "web1", "k");
        tx.append(id, SharedRecord::new(record("web1"))).unwrap();
        assert_eq!(tx.context(id).map(|c| c.len()), Some(2));
    }

    #[test]
    fn test_drain_hands_out_in_expiry_order() {
        let store = CorrelationStateStore::new(10);
        let mut tx = store.begin();
        open(&mut tx, "a", "k");
        tx.set_time(3, |_, _| {}).unwrap();
        open(&mut tx, "b", "k");
        let mut hosts = Vec::new();
        let drained = tx.drain(|context| {
            hosts.push(
                context
                    .records()
                    .last()
                    .map(|r| r.as_record().get_field("host").cloned())
                    .flatten(),
            );
        });
        assert_eq!(drained, 2);
        assert_eq!(
            hosts,
            vec![
                Some(FieldValue::String("a".into())),
                Some(FieldValue::String("b".into()))
            ]
        );
        assert!(tx.is_empty());
        assert_eq!(tx.stats().pending_timers, 0);
    }

    #[test]
    fn test_stats_snapshot() {
        let store = CorrelationStateStore::new(20);
        let mut tx = store.begin();
        open(&mut tx, "a", "k");
        open(&mut tx, "b", "k");
        tx.set_time(7, |_, _| {}).unwrap();
        let stats = tx.stats();
        assert_eq!(stats.open_windows, 2);
        assert_eq!(stats.pending_timers, 2);
        assert_eq!(stats.current_tick, 7);
    }

    #[test]
    fn test_clones_share_state() {
        let store = CorrelationStateStore::new(10);
        let other = store.clone();
        {
            let mut tx = store.begin();
            open(&mut tx, "web1", "k");
        }
        let tx = other.begin();
        assert_eq!(tx.len(), 1);
    }
}

//! Hashed timer wheel driven by record time.
//!
//! The wheel never reads the system clock. Its cursor only moves when
//! [`TimerWheel::advance`] is called with a later tick, so replaying a
//! historical stream expires entries exactly as the live stream would have.
//!
//! Entries live in a slab of nodes addressed by [`EntryHandle`] (index plus
//! generation, so a stale handle can never touch a reused slot). Each node is
//! hashed into one of `span` buckets by its target tick; ticks beyond the
//! wheel horizon wait in an overflow map and cascade in as the cursor
//! approaches. An occupancy bitmap lets `advance` skip runs of empty buckets
//! instead of stepping tick by tick, which keeps large jumps cheap when the
//! wheel is sparse.

use super::error::{CorrelationError, CorrelationResult};
use std::collections::BTreeMap;

/// Stable reference to a scheduled entry.
///
/// Handles stay valid until the entry fires, is cancelled, or is
/// rescheduled. Using a handle after that is safe and simply does nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Node<T> {
    tick: i64,
    generation: u32,
    seq: u64,
    payload: Option<T>,
}

/// Single-level hashed wheel with an overflow map for far-future ticks.
#[derive(Debug)]
pub struct TimerWheel<T> {
    span: usize,
    mask: i64,
    now: i64,
    buckets: Vec<Vec<EntryHandle>>,
    occupancy: Vec<u64>,
    nodes: Vec<Node<T>>,
    free: Vec<u32>,
    overflow: BTreeMap<i64, Vec<EntryHandle>>,
    /// Live entries currently hashed into buckets (excludes overflow).
    in_wheel: usize,
    live: usize,
    next_seq: u64,
}

impl<T> TimerWheel<T> {
    /// Create a wheel with at least `span_hint` bucket slots. The actual
    /// span is rounded up to a power of two, no smaller than 64.
    pub fn new(span_hint: usize) -> Self {
        let span = span_hint.next_power_of_two().max(64);
        TimerWheel {
            span,
            mask: (span - 1) as i64,
            now: 0,
            buckets: vec![Vec::new(); span],
            occupancy: vec![0u64; span / 64],
            nodes: Vec::new(),
            free: Vec::new(),
            overflow: BTreeMap::new(),
            in_wheel: 0,
            live: 0,
            next_seq: 0,
        }
    }

    /// Current cursor tick. Entries can only fire at ticks after this.
    pub fn now(&self) -> i64 {
        self.now
    }

    /// Number of scheduled entries, including overflow.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Bucket span of the wheel.
    pub fn span(&self) -> usize {
        self.span
    }

    fn slot_of(&self, tick: i64) -> usize {
        // For a power-of-two span, masking equals rem_euclid even when the
        // tick is negative.
        (tick & self.mask) as usize
    }

    fn set_bit(&mut self, slot: usize) {
        self.occupancy[slot / 64] |= 1u64 << (slot % 64);
    }

    fn clear_bit(&mut self, slot: usize) {
        self.occupancy[slot / 64] &= !(1u64 << (slot % 64));
    }

    /// Schedule `payload` to fire at `tick`. A tick at or before the cursor
    /// is clamped to the next tick so the entry still fires on a later
    /// advance instead of being lost.
    pub fn schedule(&mut self, tick: i64, payload: T) -> EntryHandle {
        let tick = tick.max(self.now + 1);
        let seq = self.next_seq;
        self.next_seq += 1;
        let index = match self.free.pop() {
            Some(index) => {
                let node = &mut self.nodes[index as usize];
                node.tick = tick;
                node.seq = seq;
                node.payload = Some(payload);
                index
            }
            None => {
                let index = self.nodes.len() as u32;
                self.nodes.push(Node {
                    tick,
                    generation: 0,
                    seq,
                    payload: Some(payload),
                });
                index
            }
        };
        self.live += 1;
        let handle = EntryHandle {
            index,
            generation: self.nodes[index as usize].generation,
        };
        if tick > self.now + self.span as i64 {
            self.overflow.entry(tick).or_default().push(handle);
        } else {
            let slot = self.slot_of(tick);
            self.buckets[slot].push(handle);
            self.set_bit(slot);
            self.in_wheel += 1;
        }
        handle
    }

    /// Cancel an entry, returning its payload. Stale or already-fired
    /// handles yield `None`.
    pub fn cancel(&mut self, handle: EntryHandle) -> Option<T> {
        let node = self.nodes.get_mut(handle.index as usize)?;
        if node.generation != handle.generation {
            return None;
        }
        let payload = node.payload.take()?;
        node.generation = node.generation.wrapping_add(1);
        if node.tick <= self.now + self.span as i64 {
            self.in_wheel -= 1;
        }
        self.live -= 1;
        self.free.push(handle.index);
        // The bucket (or overflow) slot still holds the handle; the
        // generation bump makes it inert and it is dropped when that slot is
        // next visited.
        Some(payload)
    }

    /// Move an entry to a new tick, keeping its payload. Returns the
    /// replacement handle, or `None` when the handle is stale.
    pub fn reschedule(&mut self, handle: EntryHandle, tick: i64) -> Option<EntryHandle> {
        let payload = self.cancel(handle)?;
        Some(self.schedule(tick, payload))
    }

    /// Advance the cursor to `new_now`, firing every entry whose tick lies
    /// in `(now, new_now]` in (tick, schedule order). Advancing to the
    /// current cursor is a no-op; moving backwards is an error.
    pub fn advance(
        &mut self,
        new_now: i64,
        mut on_fire: impl FnMut(i64, T),
    ) -> CorrelationResult<usize> {
        if new_now < self.now {
            return Err(CorrelationError::invariant(format!(
                "timer wheel cursor at {} cannot move back to {}",
                self.now, new_now
            )));
        }
        let mut fired = 0usize;
        while self.now < new_now {
            self.cascade();
            if self.in_wheel == 0 {
                // Nothing can fire before the first overflow tick becomes
                // reachable, so jump the cursor in one step.
                self.now = match self.overflow.keys().next() {
                    Some(&next) => new_now.min(next - self.span as i64),
                    None => new_now,
                };
                continue;
            }
            let segment_end = new_now.min(self.now + self.span as i64);
            while self.now < segment_end {
                let remaining = (segment_end - self.now) as usize;
                match self.next_occupied(self.slot_of(self.now + 1), remaining) {
                    Some(delta) => {
                        let tick = self.now + 1 + delta as i64;
                        fired += self.fire_slot(self.slot_of(tick), tick, &mut on_fire);
                        self.now = tick;
                    }
                    None => self.now = segment_end,
                }
            }
        }
        // Once the cursor settles, overflow may hold only ticks beyond the
        // horizon; cancel infers bucket residence from that split.
        self.cascade();
        Ok(fired)
    }

    /// Fire every remaining entry regardless of tick, ordered by (tick,
    /// schedule order), and leave the wheel empty. The cursor does not move.
    pub fn drain(&mut self, mut on_fire: impl FnMut(i64, T)) -> usize {
        let mut due: Vec<(i64, u64, T)> = Vec::new();
        for (index, node) in self.nodes.iter_mut().enumerate() {
            if let Some(payload) = node.payload.take() {
                due.push((node.tick, node.seq, payload));
                node.generation = node.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        for word in &mut self.occupancy {
            *word = 0;
        }
        self.overflow.clear();
        self.in_wheel = 0;
        self.live = 0;
        due.sort_by_key(|entry| (entry.0, entry.1));
        let count = due.len();
        for (tick, _, payload) in due {
            on_fire(tick, payload);
        }
        count
    }

    /// Pull overflow entries whose ticks now fit inside the wheel horizon.
    fn cascade(&mut self) {
        let horizon = self.now + self.span as i64;
        while let Some(&tick) = self.overflow.keys().next() {
            if tick > horizon {
                break;
            }
            let handles = self.overflow.remove(&tick).unwrap_or_default();
            for handle in handles {
                let alive = self
                    .nodes
                    .get(handle.index as usize)
                    .map(|node| node.generation == handle.generation && node.payload.is_some())
                    .unwrap_or(false);
                if !alive {
                    continue;
                }
                let slot = self.slot_of(tick);
                self.buckets[slot].push(handle);
                self.set_bit(slot);
                self.in_wheel += 1;
            }
        }
    }

    /// Smallest `delta < limit` such that the slot `limit` ticks after
    /// `start` (cyclically) has its occupancy bit set.
    fn next_occupied(&self, start: usize, limit: usize) -> Option<usize> {
        debug_assert!(limit <= self.span);
        let words = self.occupancy.len();
        let first = self.occupancy[start / 64] >> (start % 64);
        if first != 0 {
            let delta = first.trailing_zeros() as usize;
            return (delta < limit).then_some(delta);
        }
        let mut delta = 64 - (start % 64);
        let mut word_idx = (start / 64 + 1) % words;
        while delta < limit {
            let word = self.occupancy[word_idx];
            if word != 0 {
                let candidate = delta + word.trailing_zeros() as usize;
                return (candidate < limit).then_some(candidate);
            }
            delta += 64;
            word_idx = (word_idx + 1) % words;
        }
        None
    }

    /// Fire every entry in `slot` whose tick is exactly `tick`. Entries for
    /// later revolutions stay, stale handles are dropped, and the occupancy
    /// bit is cleared when the bucket empties.
    fn fire_slot(&mut self, slot: usize, tick: i64, on_fire: &mut impl FnMut(i64, T)) -> usize {
        let mut bucket = std::mem::take(&mut self.buckets[slot]);
        let nodes = &mut self.nodes;
        let free = &mut self.free;
        let mut due: Vec<(u64, T)> = Vec::new();
        bucket.retain(|&handle| {
            let Some(node) = nodes.get_mut(handle.index as usize) else {
                return false;
            };
            if node.generation != handle.generation {
                return false;
            }
            if node.tick != tick {
                return true;
            }
            if let Some(payload) = node.payload.take() {
                due.push((node.seq, payload));
                node.generation = node.generation.wrapping_add(1);
                free.push(handle.index);
            }
            false
        });
        self.in_wheel -= due.len();
        self.live -= due.len();
        if bucket.is_empty() {
            self.clear_bit(slot);
        } else {
            self.buckets[slot] = bucket;
        }
        due.sort_by_key(|entry| entry.0);
        let count = due.len();
        for (_, payload) in due {
            on_fire(tick, payload);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(wheel: &mut TimerWheel<&'static str>, to: i64) -> Vec<(i64, &'static str)> {
        let mut fired = Vec::new();
        wheel
            .advance(to, |tick, payload| fired.push((tick, payload)))
            .unwrap();
        fired
    }

    #[test]
    fn test_fires_at_exact_tick() {
        let mut wheel = TimerWheel::new(64);
        wheel.schedule(10, "a");
        assert!(collect(&mut wheel, 9).is_empty());
        assert_eq!(collect(&mut wheel, 10), vec![(10, "a")]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_fires_in_tick_then_insertion_order() {
        let mut wheel = TimerWheel::new(64);
        wheel.schedule(7, "late-first");
        wheel.schedule(3, "early");
        wheel.schedule(7, "late-second");
        assert_eq!(
            collect(&mut wheel, 20),
            vec![(3, "early"), (7, "late-first"), (7, "late-second")]
        );
    }

    #[test]
    fn test_cancel_returns_payload_once() {
        let mut wheel = TimerWheel::new(64);
        let handle = wheel.schedule(5, "x");
        assert_eq!(wheel.cancel(handle), Some("x"));
        assert_eq!(wheel.cancel(handle), None);
        assert!(collect(&mut wheel, 10).is_empty());
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_reschedule_moves_entry() {
        let mut wheel = TimerWheel::new(64);
        let handle = wheel.schedule(5, "x");
        let handle = wheel.reschedule(handle, 12).unwrap();
        assert!(collect(&mut wheel, 5).is_empty());
        assert_eq!(collect(&mut wheel, 12), vec![(12, "x")]);
        assert_eq!(wheel.reschedule(handle, 20), None);
    }

    #[test]
    fn test_stale_handle_after_fire() {
        let mut wheel = TimerWheel::new(64);
        let handle = wheel.schedule(2, "x");
        assert_eq!(collect(&mut wheel, 2).len(), 1);
        assert_eq!(wheel.cancel(handle), None);
    }

    #[test]
    fn test_past_tick_clamped_to_next() {
        let mut wheel = TimerWheel::new(64);
        assert_eq!(collect(&mut wheel, 100), vec![]);
        wheel.schedule(90, "stale-clock");
        assert_eq!(collect(&mut wheel, 101), vec![(101, "stale-clock")]);
    }

    #[test]
    fn test_backward_advance_rejected() {
        let mut wheel: TimerWheel<()> = TimerWheel::new(64);
        wheel.advance(50, |_, _| {}).unwrap();
        assert!(wheel.advance(49, |_, _| {}).is_err());
        assert_eq!(wheel.advance(50, |_, _| {}).unwrap(), 0);
    }

    #[test]
    fn test_same_slot_different_revolution() {
        let mut wheel = TimerWheel::new(64);
        // 1 and 65 hash to the same bucket with span 64.
        wheel.schedule(1, "first");
        wheel.schedule(65, "second");
        assert_eq!(collect(&mut wheel, 1), vec![(1, "first")]);
        assert_eq!(collect(&mut wheel, 64), vec![]);
        assert_eq!(collect(&mut wheel, 65), vec![(65, "second")]);
    }

    #[test]
    fn test_overflow_cascades_in() {
        let mut wheel = TimerWheel::new(64);
        let far = 64 * 5 + 3;
        wheel.schedule(far, "far");
        assert_eq!(wheel.len(), 1);
        assert_eq!(collect(&mut wheel, far - 1), vec![]);
        assert_eq!(collect(&mut wheel, far), vec![(far, "far")]);
    }

    #[test]
    fn test_cancel_overflow_entry() {
        let mut wheel = TimerWheel::new(64);
        let handle = wheel.schedule(10_000, "far");
        assert_eq!(wheel.cancel(handle), Some("far"));
        assert!(collect(&mut wheel, 20_000).is_empty());
    }

    #[test]
    fn test_cancel_at_horizon_boundary() {
        let mut wheel = TimerWheel::new(64);
        // Overflow entry whose tick sits exactly one span past the cursor
        // after the advance.
        let handle = wheel.schedule(100, "far");
        wheel.advance(36, |_, _| {}).unwrap();
        assert_eq!(wheel.cancel(handle), Some("far"));
        assert!(collect(&mut wheel, 200).is_empty());
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_sparse_jump_preserves_ticks() {
        let mut wheel = TimerWheel::new(256);
        wheel.schedule(1_000_000, "a");
        wheel.schedule(2_000_000, "b");
        assert_eq!(
            collect(&mut wheel, 3_000_000),
            vec![(1_000_000, "a"), (2_000_000, "b")]
        );
        assert_eq!(wheel.now(), 3_000_000);
    }

    #[test]
    fn test_drain_orders_by_tick_then_seq() {
        let mut wheel = TimerWheel::new(64);
        wheel.schedule(9, "c");
        wheel.schedule(4, "a");
        wheel.schedule(9, "d");
        wheel.schedule(4, "b");
        let mut drained = Vec::new();
        let count = wheel.drain(|tick, payload| drained.push((tick, payload)));
        assert_eq!(count, 4);
        assert_eq!(drained, vec![(4, "a"), (4, "b"), (9, "c"), (9, "d")]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_node_reuse_keeps_handles_distinct() {
        let mut wheel = TimerWheel::new(64);
        let first = wheel.schedule(3, "one");
        wheel.cancel(first);
        let second = wheel.schedule(3, "two");
        // The freed slot is reused; the old handle must stay inert.
        assert_eq!(wheel.cancel(first), None);
        assert_eq!(collect(&mut wheel, 3), vec![(3, "two")]);
        assert_eq!(wheel.cancel(second), None);
    }
}

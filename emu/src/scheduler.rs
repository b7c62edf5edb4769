//! Cycle-driven event scheduler.
//!
//! Every hardware component subscribes to the same monotonic cycle counter.
//! An event is a `(timestamp, HardwareEvent)` pair kept in a min-heap; the
//! bus advances time with [`Scheduler::add_cycles`] and then drains due
//! events one by one via [`Scheduler::pop_due`]. Splitting the advance from
//! the drain keeps handlers from ever re-entering the time cursor: a handler
//! may schedule new events (including at the current timestamp, which fire
//! in the same drain pass, FIFO) but never push time forward itself.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

/// Work dispatched when an event expires.
///
/// Events carry plain component indices instead of callbacks so the heap
/// stays `'static` and the bus can split-borrow its components on dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareEvent {
    /// End of the visible portion of a scanline (after 1006 cycles).
    ScanlineComplete,
    /// End of HBlank on a visible scanline (after 226 more cycles).
    HblankComplete,
    /// End of the "visible" portion of a VBlank scanline.
    VblankScanlineComplete,
    /// End of HBlank on a VBlank scanline.
    VblankHblankComplete,
    /// A DMA channel finished its startup delay and becomes runnable.
    DmaStartup(usize),
    /// A timer counted past 0xFFFF.
    TimerOverflow(usize),
}

/// Handle returned by [`Scheduler::add`], used to cancel a pending event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(u64);

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    timestamp: u64,
    // Insertion sequence breaks timestamp ties so equal-time events fire
    // in the order they were scheduled.
    seq: u64,
    event: HardwareEvent,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.timestamp, self.seq).cmp(&(other.timestamp, other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub struct Scheduler {
    now: u64,
    next_seq: u64,
    heap: BinaryHeap<Reverse<Entry>>,
    cancelled: HashSet<u64>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current timestamp in master cycles.
    pub const fn now(&self) -> u64 {
        self.now
    }

    /// Schedules `event` to fire `delay` cycles from now.
    pub fn add(&mut self, delay: u64, event: HardwareEvent) -> EventHandle {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.heap.push(Reverse(Entry {
            timestamp: self.now + delay,
            seq,
            event,
        }));

        EventHandle(seq)
    }

    /// Removes a pending event. Idempotent: cancelling an event that already
    /// fired (or was cancelled) is a no-op.
    pub fn cancel(&mut self, handle: EventHandle) {
        self.cancelled.insert(handle.0);
    }

    /// Advances the cycle cursor. Due events are NOT fired here; the caller
    /// drains them with [`Self::pop_due`].
    pub fn add_cycles(&mut self, cycles: u64) {
        self.now += cycles;
    }

    /// Pops the next event whose timestamp has been reached, together with
    /// how many cycles late it fires.
    pub fn pop_due(&mut self) -> Option<(HardwareEvent, u64)> {
        loop {
            let entry = self.heap.peek()?;
            if entry.0.timestamp > self.now {
                return None;
            }

            let Reverse(entry) = self.heap.pop().expect("peeked entry");
            if self.cancelled.remove(&entry.seq) {
                continue;
            }

            return Some((entry.event, self.now - entry.timestamp));
        }
    }

    /// Cycles until the next pending event fires. Used to fast-forward
    /// across halted intervals.
    pub fn remaining_cycle_count(&mut self) -> u64 {
        self.purge_cancelled_top();
        self.heap
            .peek()
            .map_or(1, |entry| entry.0.timestamp.saturating_sub(self.now))
    }

    fn purge_cancelled_top(&mut self) {
        while let Some(entry) = self.heap.peek() {
            if self.cancelled.contains(&entry.0.seq) {
                let Reverse(entry) = self.heap.pop().expect("peeked entry");
                self.cancelled.remove(&entry.seq);
            } else {
                break;
            }
        }
    }

    pub fn reset(&mut self) {
        self.now = 0;
        self.next_seq = 0;
        self.heap.clear();
        self.cancelled.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_fire_in_timestamp_order() {
        let mut scheduler = Scheduler::new();
        scheduler.add(30, HardwareEvent::HblankComplete);
        scheduler.add(10, HardwareEvent::ScanlineComplete);
        scheduler.add(20, HardwareEvent::DmaStartup(0));

        scheduler.add_cycles(30);

        assert_eq!(
            scheduler.pop_due(),
            Some((HardwareEvent::ScanlineComplete, 20))
        );
        assert_eq!(scheduler.pop_due(), Some((HardwareEvent::DmaStartup(0), 10)));
        assert_eq!(
            scheduler.pop_due(),
            Some((HardwareEvent::HblankComplete, 0))
        );
        assert_eq!(scheduler.pop_due(), None);
    }

    #[test]
    fn equal_timestamps_fire_in_insertion_order() {
        let mut scheduler = Scheduler::new();
        scheduler.add(5, HardwareEvent::DmaStartup(3));
        scheduler.add(5, HardwareEvent::DmaStartup(1));
        scheduler.add(5, HardwareEvent::DmaStartup(2));

        scheduler.add_cycles(5);

        assert_eq!(scheduler.pop_due(), Some((HardwareEvent::DmaStartup(3), 0)));
        assert_eq!(scheduler.pop_due(), Some((HardwareEvent::DmaStartup(1), 0)));
        assert_eq!(scheduler.pop_due(), Some((HardwareEvent::DmaStartup(2), 0)));
    }

    #[test]
    fn events_added_at_now_fire_in_same_drain() {
        let mut scheduler = Scheduler::new();
        scheduler.add(4, HardwareEvent::ScanlineComplete);
        scheduler.add_cycles(4);

        assert!(scheduler.pop_due().is_some());

        // A handler reacting to the event may schedule follow-up work at the
        // current cursor; it must be observable in the same drain pass.
        scheduler.add(0, HardwareEvent::DmaStartup(0));
        assert_eq!(scheduler.pop_due(), Some((HardwareEvent::DmaStartup(0), 0)));
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut scheduler = Scheduler::new();
        let handle = scheduler.add(10, HardwareEvent::TimerOverflow(0));
        scheduler.cancel(handle);
        scheduler.cancel(handle);

        scheduler.add_cycles(10);
        assert_eq!(scheduler.pop_due(), None);

        // Cancelling after the fact must not eat later events.
        let _ = scheduler.add(10, HardwareEvent::TimerOverflow(1));
        scheduler.cancel(handle);
        scheduler.add_cycles(10);
        assert_eq!(
            scheduler.pop_due(),
            Some((HardwareEvent::TimerOverflow(1), 0))
        );
    }

    #[test]
    fn remaining_cycle_count_skips_cancelled() {
        let mut scheduler = Scheduler::new();
        let near = scheduler.add(3, HardwareEvent::TimerOverflow(0));
        scheduler.add(100, HardwareEvent::ScanlineComplete);

        assert_eq!(scheduler.remaining_cycle_count(), 3);

        scheduler.cancel(near);
        assert_eq!(scheduler.remaining_cycle_count(), 100);
    }

    #[test]
    fn no_event_fires_before_its_timestamp() {
        let mut scheduler = Scheduler::new();
        scheduler.add(10, HardwareEvent::ScanlineComplete);

        scheduler.add_cycles(9);
        assert_eq!(scheduler.pop_due(), None);

        scheduler.add_cycles(1);
        assert!(scheduler.pop_due().is_some());
    }
}

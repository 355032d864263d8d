// Reactor-style networking library with composable futures and promises
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2022-2023 by
//     Dr. Maxim Orlovsky <orlovsky@cyphernet.org>
//
// Copyright 2022-2023 Cyphernet DAO, Switzerland
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Hierarchical timer set ordered by deadline, driven by the event loop.
//!
//! Timers with identical deadlines fire in insertion order. Cancellation is
//! lazy: the repeat count is zeroed and the entry is dropped when it
//! surfaces, so a timer callback may cancel its own or other timers while
//! the wheel is mid-fire.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Repeat-count sentinel: fire until canceled.
pub const FOREVER: i64 = -1;

/// Smallest period a repeating timer may carry.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Handle for canceling a scheduled timer.
///
/// The pair of the original deadline and the wheel-unique sequence number;
/// stable until the timer fires for the last time or is canceled, including
/// across periodic reschedules.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct TimerId {
    deadline: Instant,
    seq: u64,
}

pub(crate) struct TimerEntry {
    pub(crate) period: Duration,
    pub(crate) count: i64,
    pub(crate) callback: Box<dyn FnMut()>,
}

/// Ordered timer multimap with stable ids and lazy cancel.
#[derive(Default)]
pub struct TimerWheel {
    timers: BTreeMap<(Instant, u64), TimerEntry>,
    // seq -> current deadline, updated on periodic reschedule
    index: HashMap<u64, Instant>,
    next_seq: u64,
    firing: Option<u64>,
    firing_canceled: bool,
}

impl TimerWheel {
    pub fn new() -> Self { TimerWheel::default() }

    pub fn is_empty(&self) -> bool { self.timers.is_empty() }

    pub fn len(&self) -> usize { self.timers.len() }

    /// Schedules a one-shot timer at an absolute deadline.
    pub fn schedule_at(&mut self, deadline: Instant, f: impl FnMut() + 'static) -> TimerId {
        self.schedule_at_with_repeat(deadline, Duration::ZERO, 1, f)
    }

    /// Schedules a timer at `deadline` repeating every `period`, `count`
    /// times (`count >= 1`, or [`FOREVER`]). The period is floored to 1 ms.
    pub fn schedule_at_with_repeat(
        &mut self,
        deadline: Instant,
        period: Duration,
        count: i64,
        f: impl FnMut() + 'static,
    ) -> TimerId {
        assert!(count >= 1 || count == FOREVER, "timer repeat count must be >= 1 or FOREVER");

        self.next_seq += 1;
        let seq = self.next_seq;
        let period = if count == 1 { period } else { period.max(MIN_PERIOD) };
        self.timers.insert((deadline, seq), TimerEntry {
            period,
            count,
            callback: Box::new(f),
        });
        self.index.insert(seq, deadline);
        TimerId { deadline, seq }
    }

    /// Schedules a one-shot timer `delay` from now.
    pub fn schedule_after(&mut self, delay: Duration, f: impl FnMut() + 'static) -> TimerId {
        self.schedule_at(Instant::now() + delay, f)
    }

    /// Schedules a repeating timer starting `delay` from now.
    pub fn schedule_after_with_repeat(
        &mut self,
        delay: Duration,
        period: Duration,
        count: i64,
        f: impl FnMut() + 'static,
    ) -> TimerId {
        self.schedule_at_with_repeat(Instant::now() + delay, period, count, f)
    }

    /// Lazily cancels a timer. Returns whether a live timer was found.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        if self.firing == Some(id.seq) {
            self.firing_canceled = true;
            return true;
        }
        let deadline = match self.index.get(&id.seq) {
            Some(deadline) => *deadline,
            None => return false,
        };
        match self.timers.get_mut(&(deadline, id.seq)) {
            Some(entry) if entry.count != 0 => {
                entry.count = 0;
                true
            }
            _ => false,
        }
    }

    /// Time until the earliest timer, clamped to zero; `None` when empty.
    pub fn nearest(&self) -> Option<Duration> {
        let now = Instant::now();
        self.timers.keys().next().map(|(deadline, _)| deadline.saturating_duration_since(now))
    }

    /// Fires every due timer. Standalone driver; the event loop performs the
    /// same [`TimerWheel::pop_due`]/[`TimerWheel::finish_fire`] dance so
    /// callbacks can reach back into the wheel through the loop.
    pub fn tick(&mut self, now: Instant) {
        while let Some((id, mut entry)) = self.pop_due(now) {
            (entry.callback)();
            self.finish_fire(id, entry);
        }
    }

    /// Removes and returns the earliest due timer, skipping lazily-canceled
    /// entries. The returned entry must be handed back to
    /// [`TimerWheel::finish_fire`] after its callback ran.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<(TimerId, TimerEntry)> {
        loop {
            let (&(deadline, seq), _) = self.timers.first_key_value()?;
            if deadline > now {
                return None;
            }
            let entry = self.timers.remove(&(deadline, seq)).expect("first key just observed");
            if entry.count == 0 {
                self.index.remove(&seq);
                continue;
            }
            self.firing = Some(seq);
            self.firing_canceled = false;
            return Some((TimerId { deadline, seq }, entry));
        }
    }

    /// Reinserts a periodic timer after its callback ran, honoring repeat
    /// counts and a cancel issued during the fire.
    pub(crate) fn finish_fire(&mut self, id: TimerId, mut entry: TimerEntry) {
        self.firing = None;
        if self.firing_canceled {
            self.firing_canceled = false;
            self.index.remove(&id.seq);
            return;
        }

        if entry.count != FOREVER {
            entry.count -= 1;
        }
        if entry.count == 0 {
            self.index.remove(&id.seq);
            return;
        }

        let deadline = id.deadline + entry.period;
        self.index.insert(id.seq, deadline);
        self.timers.insert((deadline, id.seq), entry);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn equal_deadlines_fire_in_insertion_order() {
        let mut wheel = TimerWheel::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let at = Instant::now();

        for tag in 1..=3 {
            let order = order.clone();
            wheel.schedule_at(at, move || order.borrow_mut().push(tag));
        }
        wheel.tick(at);
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn cancel_is_lazy_and_suppresses_fire() {
        let mut wheel = TimerWheel::new();
        let fired = Rc::new(RefCell::new(0));
        let at = Instant::now();

        let fired2 = fired.clone();
        let id = wheel.schedule_at(at, move || *fired2.borrow_mut() += 1);
        assert!(wheel.cancel(id));
        assert!(!wheel.cancel(id), "second cancel finds a dead timer");
        assert_eq!(wheel.len(), 1, "entry stays until it surfaces");

        wheel.tick(at);
        assert_eq!(*fired.borrow(), 0);
        assert!(wheel.is_empty());
    }

    #[test]
    fn repeat_count_decrements_per_fire() {
        let mut wheel = TimerWheel::new();
        let fired = Rc::new(RefCell::new(0));
        let start = Instant::now();

        let fired2 = fired.clone();
        wheel.schedule_at_with_repeat(start, Duration::from_millis(5), 3, move || {
            *fired2.borrow_mut() += 1
        });

        wheel.tick(start);
        assert_eq!(*fired.borrow(), 1);
        wheel.tick(start + Duration::from_millis(20));
        assert_eq!(*fired.borrow(), 3);
        assert!(wheel.is_empty());
    }

    #[test]
    fn forever_timer_reschedules_until_canceled() {
        let mut wheel = TimerWheel::new();
        let fired = Rc::new(RefCell::new(0));
        let start = Instant::now();

        let fired2 = fired.clone();
        let id = wheel.schedule_at_with_repeat(start, Duration::from_millis(1), FOREVER, move || {
            *fired2.borrow_mut() += 1
        });

        wheel.tick(start + Duration::from_millis(3));
        assert!(*fired.borrow() >= 3);
        assert!(wheel.cancel(id));
        let count = *fired.borrow();
        wheel.tick(start + Duration::from_millis(60));
        assert_eq!(*fired.borrow(), count);
        assert!(wheel.is_empty());
    }

    #[test]
    fn cancel_during_own_fire_stops_repeats() {
        let mut wheel = TimerWheel::new();
        let start = Instant::now();
        let id = wheel.schedule_at_with_repeat(start, Duration::from_millis(1), FOREVER, || {});

        // the loop-mediated dance: cancel arrives while the entry is out
        let (fired_id, entry) = wheel.pop_due(start).expect("due timer");
        assert!(wheel.cancel(id));
        wheel.finish_fire(fired_id, entry);
        assert!(wheel.is_empty());
    }

    #[test]
    fn nearest_bounds_earliest_live_deadline() {
        let mut wheel = TimerWheel::new();
        assert!(wheel.nearest().is_none());

        wheel.schedule_after(Duration::from_millis(50), || {});
        wheel.schedule_after(Duration::from_millis(10), || {});
        let nearest = wheel.nearest().expect("non-empty wheel");
        assert!(nearest <= Duration::from_millis(10));

        let mut overdue = TimerWheel::new();
        overdue.schedule_at(Instant::now() - Duration::from_secs(1), || {});
        assert_eq!(overdue.nearest().expect("non-empty"), Duration::ZERO);
    }
}

//! Monotonic timer queue, delivered through the owner loop.
//!
//! Timers live in an ordered map keyed by `(deadline, id)`; ids come from a
//! monotonically increasing counter and are never reused, so two timers due
//! at the same instant fire in creation order. The kernel side is a
//! CLOCK_MONOTONIC timerfd armed at the earliest deadline; the loop watches
//! it through an ordinary channel and the read handler fires everything
//! that has come due.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::{Duration, Instant};

use log::error;
use metrics::counter;

/// Opaque handle identifying a timer for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub(crate) u64);

pub(crate) struct TimerEntry {
    pub(crate) callback: Box<dyn FnMut()>,
    pub(crate) interval: Option<Duration>,
}

pub(crate) struct TimerQueue {
    fd: OwnedFd,
    timers: BTreeMap<(Instant, TimerId), TimerEntry>,
    // Active id -> its current deadline, for O(log n) cancellation.
    active: HashMap<TimerId, Instant>,
    // Ids cancelled while the queue is firing; checked before each callback
    // and again before periodic timers are restocked.
    cancelling: HashSet<TimerId>,
    firing: bool,
}

impl TimerQueue {
    pub(crate) fn new() -> io::Result<TimerQueue> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(TimerQueue {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            timers: BTreeMap::new(),
            active: HashMap::new(),
            cancelling: HashSet::new(),
            firing: false,
        })
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Inserts a timer and re-arms the timerfd if the earliest deadline
    /// moved.
    pub(crate) fn add(
        &mut self,
        id: TimerId,
        when: Instant,
        interval: Option<Duration>,
        callback: Box<dyn FnMut()>,
    ) {
        let earliest_before = self.earliest();
        self.timers.insert((when, id), TimerEntry { callback, interval });
        self.active.insert(id, when);
        if earliest_before.map_or(true, |e| when < e) {
            self.arm(Some(when));
        }
    }

    /// Cancels a timer by id.
    ///
    /// Cancelling an id that already fired (or never existed) is a no-op,
    /// except while the queue is firing: the id is then remembered so a
    /// periodic timer currently running its callback will not be restocked.
    pub(crate) fn cancel(&mut self, id: TimerId) {
        if let Some(when) = self.active.remove(&id) {
            self.timers.remove(&(when, id));
        } else if self.firing {
            self.cancelling.insert(id);
        }
    }

    pub(crate) fn is_cancelling(&self, id: TimerId) -> bool {
        self.cancelling.contains(&id)
    }

    /// Clears the expiration count after the timerfd became readable.
    pub(crate) fn drain_fd(&self) {
        let mut expirations: u64 = 0;
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut expirations as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if n != 8 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                error!("TimerQueue::drain_fd read {} bytes instead of 8: {}", n, err);
            }
        }
    }

    /// Removes and returns every timer due at `now`, in firing order, and
    /// enters the firing phase.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<(TimerId, TimerEntry)> {
        let remaining = self.timers.split_off(&(now, TimerId(u64::MAX)));
        let due = std::mem::replace(&mut self.timers, remaining);

        let mut expired = Vec::with_capacity(due.len());
        for ((_, id), entry) in due {
            self.active.remove(&id);
            expired.push((id, entry));
        }
        self.cancelling.clear();
        self.firing = true;
        expired
    }

    /// Leaves the firing phase: periodic timers that were not cancelled are
    /// re-inserted at `now + interval` under their original id, and the
    /// timerfd is re-armed at the next earliest deadline.
    pub(crate) fn restock(&mut self, now: Instant, fired: Vec<(TimerId, TimerEntry)>) {
        let count = fired.len() as u64;
        for (id, entry) in fired {
            if let Some(interval) = entry.interval {
                if !self.cancelling.contains(&id) {
                    let when = now + interval;
                    self.timers.insert((when, id), entry);
                    self.active.insert(id, when);
                }
            }
        }
        self.firing = false;
        self.cancelling.clear();
        self.arm(self.earliest());
        counter!("riptide_timers_fired_total").increment(count);
    }

    fn earliest(&self) -> Option<Instant> {
        self.timers.keys().next().map(|(when, _)| *when)
    }

    fn arm(&self, deadline: Option<Instant>) {
        let value = match deadline {
            Some(when) => {
                let delta = when
                    .saturating_duration_since(Instant::now())
                    // A zero it_value disarms the fd; fire on the next tick
                    // instead.
                    .max(Duration::from_micros(1));
                libc::timespec {
                    tv_sec: delta.as_secs() as libc::time_t,
                    tv_nsec: delta.subsec_nanos() as libc::c_long,
                }
            }
            None => libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
        };
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: value,
        };
        let rc = unsafe { libc::timerfd_settime(self.fd.as_raw_fd(), 0, &spec, ptr::null_mut()) };
        if rc != 0 {
            error!(
                "TimerQueue::arm timerfd_settime: {}",
                io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn noop() -> Box<dyn FnMut()> {
        Box::new(|| {})
    }

    #[test]
    fn expiry_order_is_deadline_then_id() {
        let mut q = TimerQueue::new().unwrap();
        let t0 = Instant::now();
        q.add(TimerId(2), t0 + Duration::from_millis(5), None, noop());
        q.add(TimerId(1), t0 + Duration::from_millis(5), None, noop());
        q.add(TimerId(3), t0 + Duration::from_millis(1), None, noop());

        let expired = q.take_expired(t0 + Duration::from_millis(10));
        let ids: Vec<TimerId> = expired.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![TimerId(3), TimerId(1), TimerId(2)]);
    }

    #[test]
    fn only_due_timers_expire() {
        let mut q = TimerQueue::new().unwrap();
        let t0 = Instant::now();
        q.add(TimerId(1), t0 + Duration::from_millis(1), None, noop());
        q.add(TimerId(2), t0 + Duration::from_secs(60), None, noop());

        let expired = q.take_expired(t0 + Duration::from_millis(2));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, TimerId(1));
        q.restock(t0 + Duration::from_millis(2), expired);

        // The far timer is still pending.
        assert!(q.active.contains_key(&TimerId(2)));
        assert!(!q.active.contains_key(&TimerId(1)));
    }

    #[test]
    fn cancel_removes_pending_timer() {
        let mut q = TimerQueue::new().unwrap();
        let t0 = Instant::now();
        q.add(TimerId(1), t0 + Duration::from_millis(1), None, noop());
        q.cancel(TimerId(1));
        assert!(q.take_expired(t0 + Duration::from_secs(1)).is_empty());

        // Unknown ids are ignored.
        q.cancel(TimerId(99));
    }

    #[test]
    fn cancel_during_firing_stops_periodic_restock() {
        let mut q = TimerQueue::new().unwrap();
        let t0 = Instant::now();
        q.add(
            TimerId(7),
            t0 + Duration::from_millis(1),
            Some(Duration::from_millis(10)),
            noop(),
        );

        let now = t0 + Duration::from_millis(2);
        let expired = q.take_expired(now);
        assert_eq!(expired.len(), 1);
        // The callback phase cancels its own timer.
        q.cancel(TimerId(7));
        assert!(q.is_cancelling(TimerId(7)));
        q.restock(now, expired);

        assert!(q.timers.is_empty());
        assert!(q.active.is_empty());
    }

    #[test]
    fn periodic_timer_restocks_under_same_id() {
        let mut q = TimerQueue::new().unwrap();
        let t0 = Instant::now();
        let hits = Rc::new(RefCell::new(0));
        let h = hits.clone();
        q.add(
            TimerId(4),
            t0 + Duration::from_millis(1),
            Some(Duration::from_millis(5)),
            Box::new(move || *h.borrow_mut() += 1),
        );

        let now = t0 + Duration::from_millis(2);
        let mut expired = q.take_expired(now);
        for (_, entry) in &mut expired {
            (entry.callback)();
        }
        q.restock(now, expired);

        assert_eq!(*hits.borrow(), 1);
        assert_eq!(q.active.get(&TimerId(4)), Some(&(now + Duration::from_millis(5))));
    }
}

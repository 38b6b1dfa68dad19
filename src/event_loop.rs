//! One event loop per thread, driving a poll/dispatch/drain cycle.
//!
//! The loop owns a poller, a timer queue, and a wakeup channel, and it is
//! pinned to the thread that created it. All state the loop manages is
//! mutated only on that thread; other threads communicate exclusively by
//! handing the loop a task through its [`LoopHandle`], which wakes the
//! blocked poll so the task runs within one cycle.
//!
//! The current thread's loop is reachable through thread-local storage, and
//! constructing a second loop on a thread that already has a live one is a
//! fatal error.

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::debug;
use metrics::{counter, gauge};

use crate::channel::Channel;
use crate::poller::Poller;
use crate::timer::{TimerId, TimerQueue};
use crate::wakeup::Wakeup;

const POLL_TIMEOUT: Duration = Duration::from_secs(10);

type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    static CURRENT: RefCell<Option<(Weak<RefCell<LoopInner>>, std::sync::Weak<LoopShared>)>> =
        const { RefCell::new(None) };
}

struct LoopInner {
    poller: Poller,
    timers: TimerQueue,
    // Kept alive for the lifetime of the loop; the poller only indexes them.
    wakeup_channel: Option<Channel>,
    timer_channel: Option<Channel>,
    started: bool,
    looping: bool,
    poll_return_time: Instant,
}

/// State shared between the loop and its cross-thread handles.
struct LoopShared {
    thread: ThreadId,
    quit: AtomicBool,
    calling_pending_tasks: AtomicBool,
    pending: Mutex<Vec<Task>>,
    wakeup: Wakeup,
    next_timer_id: AtomicU64,
}

impl LoopShared {
    fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "loop created on thread {:?} but called from thread {:?}",
                self.thread,
                thread::current().id()
            );
        }
    }

    fn request_quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup.signal();
        }
    }

    fn queue(&self, task: Task) {
        let depth = {
            let mut pending = self.pending.lock().unwrap();
            pending.push(task);
            pending.len()
        };
        counter!("riptide_tasks_queued_total").increment(1);
        gauge!("riptide_pending_tasks").set(depth as f64);
        // A wake is required from foreign threads, and also from the loop
        // thread while it is already draining: tasks queued by a running
        // task would otherwise sit until the next poll timeout.
        if !self.is_in_loop_thread() || self.calling_pending_tasks.load(Ordering::Acquire) {
            self.wakeup.signal();
        }
    }

    fn alloc_timer_id(&self) -> TimerId {
        TimerId(self.next_timer_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// A per-thread event loop.
///
/// The loop is created on the thread that will run it and never leaves that
/// thread; [`EventLoop::handle`] yields the `Send + Sync` face used from
/// everywhere else. Cloning an `EventLoop` produces another handle to the
/// same loop, not a second loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<RefCell<LoopInner>>,
    shared: Arc<LoopShared>,
}

impl EventLoop {
    /// Creates the loop for the current thread.
    ///
    /// # Panics
    ///
    /// Panics if the current thread already has a live loop.
    pub fn new() -> io::Result<EventLoop> {
        CURRENT.with(|slot| {
            if let Some((weak, _)) = &*slot.borrow() {
                if weak.upgrade().is_some() {
                    panic!(
                        "another EventLoop already exists on thread {:?}",
                        thread::current().id()
                    );
                }
            }
        });

        let poller = Poller::new()?;
        let timers = TimerQueue::new()?;
        let timer_fd = timers.raw_fd();
        let shared = Arc::new(LoopShared {
            thread: thread::current().id(),
            quit: AtomicBool::new(false),
            calling_pending_tasks: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            wakeup: Wakeup::new()?,
            next_timer_id: AtomicU64::new(1),
        });
        let inner = Rc::new(RefCell::new(LoopInner {
            poller,
            timers,
            wakeup_channel: None,
            timer_channel: None,
            started: false,
            looping: false,
            poll_return_time: Instant::now(),
        }));
        let event_loop = EventLoop {
            inner: inner.clone(),
            shared: shared.clone(),
        };

        CURRENT.with(|slot| {
            *slot.borrow_mut() = Some((Rc::downgrade(&inner), Arc::downgrade(&shared)));
        });
        debug!("EventLoop created on thread {:?}", shared.thread);

        use std::os::unix::io::AsRawFd;
        let wakeup_channel = Channel::new(&event_loop, shared.wakeup.as_raw_fd());
        {
            let shared = shared.clone();
            wakeup_channel.set_read_callback(move |_| shared.wakeup.drain());
        }
        wakeup_channel.enable_reading();

        let timer_channel = Channel::new(&event_loop, timer_fd);
        {
            let weak = Rc::downgrade(&inner);
            timer_channel.set_read_callback(move |_| {
                if let Some(inner) = weak.upgrade() {
                    handle_timer_expiry(&inner);
                }
            });
        }
        timer_channel.enable_reading();

        {
            let mut li = inner.borrow_mut();
            li.wakeup_channel = Some(wakeup_channel);
            li.timer_channel = Some(timer_channel);
        }
        Ok(event_loop)
    }

    /// Returns the loop owned by the current thread, if one is alive.
    pub fn current() -> Option<EventLoop> {
        CURRENT.with(|slot| {
            slot.borrow().as_ref().and_then(|(inner, shared)| {
                Some(EventLoop {
                    inner: inner.upgrade()?,
                    shared: shared.upgrade()?,
                })
            })
        })
    }

    /// Runs the loop until [`quit`](EventLoop::quit) is requested.
    ///
    /// Each cycle polls for readiness, dispatches every active channel on
    /// this thread, and then drains the pending task queue. May be called
    /// at most once, and only on the creating thread.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use riptide::EventLoop;
    /// use std::time::Duration;
    ///
    /// let event_loop = EventLoop::new()?;
    /// let handle = event_loop.handle();
    /// event_loop.run_after(Duration::from_secs(1), move || handle.quit());
    /// event_loop.run();
    /// # Ok::<(), std::io::Error>(())
    /// ```
    pub fn run(&self) {
        self.assert_in_loop_thread();
        {
            let mut inner = self.inner.borrow_mut();
            assert!(!inner.started, "EventLoop::run called twice");
            assert!(!inner.looping);
            inner.started = true;
            inner.looping = true;
        }
        debug!("EventLoop on {:?} start looping", self.shared.thread);

        while !self.shared.quit.load(Ordering::Acquire) {
            let (poll_time, active) = {
                let mut inner = self.inner.borrow_mut();
                let result = inner.poller.poll(Some(POLL_TIMEOUT));
                inner.poll_return_time = result.0;
                result
            };
            for channel in &active {
                channel.handle_event(poll_time);
            }
            self.run_pending_tasks();
        }

        self.inner.borrow_mut().looping = false;
        debug!("EventLoop on {:?} stop looping", self.shared.thread);
    }

    /// Requests loop exit at the next iteration boundary. In-flight
    /// handlers complete first. Callable from any context through a
    /// [`LoopHandle`]; this method is the loop-thread variant.
    pub fn quit(&self) {
        self.shared.request_quit();
    }

    /// Returns the cross-thread handle for this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    pub fn assert_in_loop_thread(&self) {
        self.shared.assert_in_loop_thread();
    }

    /// The instant the most recent poll returned.
    pub fn poll_return_time(&self) -> Instant {
        self.inner.borrow().poll_return_time
    }

    /// Runs the task immediately.
    ///
    /// An `EventLoop` value cannot leave its thread, so a caller holding one
    /// is on the loop thread and the task needs no queueing. Use a
    /// [`LoopHandle`] to submit work from other threads.
    pub fn run_in_loop<F: FnOnce() + 'static>(&self, task: F) {
        debug_assert!(self.is_in_loop_thread());
        task();
    }

    /// Appends the task to the pending queue; it runs after the current
    /// cycle's channel dispatch.
    pub fn queue_in_loop<F: FnOnce() + Send + 'static>(&self, task: F) {
        self.shared.queue(Box::new(task));
    }

    /// Schedules `callback` to run once at `when`.
    pub fn run_at<F: FnMut() + 'static>(&self, when: Instant, callback: F) -> TimerId {
        self.assert_in_loop_thread();
        let id = self.shared.alloc_timer_id();
        self.inner
            .borrow_mut()
            .timers
            .add(id, when, None, Box::new(callback));
        id
    }

    /// Schedules `callback` to run once after `delay`.
    pub fn run_after<F: FnMut() + 'static>(&self, delay: Duration, callback: F) -> TimerId {
        self.run_at(Instant::now() + delay, callback)
    }

    /// Schedules `callback` to run every `interval`, first firing one
    /// interval from now.
    pub fn run_every<F: FnMut() + 'static>(&self, interval: Duration, callback: F) -> TimerId {
        self.assert_in_loop_thread();
        let id = self.shared.alloc_timer_id();
        self.inner.borrow_mut().timers.add(
            id,
            Instant::now() + interval,
            Some(interval),
            Box::new(callback),
        );
        id
    }

    /// Cancels a timer. Cancelling an id that already fired is a no-op.
    pub fn cancel(&self, id: TimerId) {
        self.assert_in_loop_thread();
        self.inner.borrow_mut().timers.cancel(id);
    }

    pub fn update_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        assert!(
            channel.owned_by(self),
            "channel on fd {} belongs to a different loop",
            channel.fd()
        );
        if let Err(err) = self.inner.borrow_mut().poller.update(channel) {
            panic!("EventLoop::update_channel fd {}: {}", channel.fd(), err);
        }
    }

    pub fn remove_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        assert!(
            channel.owned_by(self),
            "channel on fd {} belongs to a different loop",
            channel.fd()
        );
        self.inner.borrow_mut().poller.remove(channel);
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.assert_in_loop_thread();
        self.inner.borrow().poller.has_channel(channel)
    }

    pub(crate) fn add_timer(
        &self,
        id: TimerId,
        when: Instant,
        interval: Option<Duration>,
        callback: Box<dyn FnMut()>,
    ) {
        self.assert_in_loop_thread();
        self.inner.borrow_mut().timers.add(id, when, interval, callback);
    }

    pub(crate) fn downgrade(&self) -> WeakLoop {
        WeakLoop {
            inner: Rc::downgrade(&self.inner),
            shared: self.shared.clone(),
        }
    }

    // The pending queue is swapped out whole under the lock and executed
    // outside it, so a task is free to queue further tasks. The
    // calling_pending_tasks window makes such re-entrant queueing signal
    // the wakeup, keeping the new tasks from waiting out a full poll.
    fn run_pending_tasks(&self) {
        self.shared
            .calling_pending_tasks
            .store(true, Ordering::Release);
        let tasks = {
            let mut pending = self.shared.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        for task in tasks {
            task();
        }
        self.shared
            .calling_pending_tasks
            .store(false, Ordering::Release);
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("thread", &self.shared.thread)
            .finish()
    }
}

fn handle_timer_expiry(inner: &Rc<RefCell<LoopInner>>) {
    let now = Instant::now();
    let expired = {
        let mut li = inner.borrow_mut();
        li.timers.drain_fd();
        li.timers.take_expired(now)
    };
    // Callbacks run with the loop unborrowed so they may add or cancel
    // timers themselves.
    let mut fired = Vec::with_capacity(expired.len());
    for (id, mut entry) in expired {
        let cancelled = inner.borrow().timers.is_cancelling(id);
        if !cancelled {
            (entry.callback)();
        }
        fired.push((id, entry));
    }
    inner.borrow_mut().timers.restock(now, fired);
}

/// Non-owning reference from a channel back to its loop.
pub(crate) struct WeakLoop {
    inner: Weak<RefCell<LoopInner>>,
    shared: Arc<LoopShared>,
}

impl WeakLoop {
    pub(crate) fn upgrade(&self) -> Option<EventLoop> {
        Some(EventLoop {
            inner: self.inner.upgrade()?,
            shared: self.shared.clone(),
        })
    }

    pub(crate) fn refers_to(&self, event_loop: &EventLoop) -> bool {
        self.inner.as_ptr() == Rc::as_ptr(&event_loop.inner)
    }
}

/// The `Send + Sync` face of an [`EventLoop`].
///
/// Everything a foreign thread may do to a loop goes through here: queueing
/// tasks, scheduling and cancelling timers, waking it, and asking it to
/// quit. Task and timer submissions are marshalled onto the loop thread and
/// run there in submission order.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    pub fn assert_in_loop_thread(&self) {
        self.shared.assert_in_loop_thread();
    }

    /// Runs the task inline when already on the loop thread, otherwise
    /// queues it and wakes the loop.
    pub fn run_in_loop<F: FnOnce() + Send + 'static>(&self, task: F) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queues the task unconditionally; it runs on the loop thread no later
    /// than the next wake.
    pub fn queue_in_loop<F: FnOnce() + Send + 'static>(&self, task: F) {
        self.shared.queue(Box::new(task));
    }

    /// Requests loop exit; wakes the loop when called from another thread.
    pub fn quit(&self) {
        self.shared.request_quit();
    }

    /// Unblocks the loop's poll without queueing anything.
    pub fn wakeup(&self) {
        self.shared.wakeup.signal();
    }

    /// Schedules `callback` on the loop thread to run once at `when`.
    ///
    /// The id is allocated immediately; the insertion itself is marshalled
    /// onto the loop thread.
    pub fn run_at<F: FnMut() + Send + 'static>(&self, when: Instant, callback: F) -> TimerId {
        let id = self.shared.alloc_timer_id();
        self.run_in_loop(move || {
            if let Some(event_loop) = EventLoop::current() {
                event_loop.add_timer(id, when, None, Box::new(callback));
            }
        });
        id
    }

    pub fn run_after<F: FnMut() + Send + 'static>(&self, delay: Duration, callback: F) -> TimerId {
        self.run_at(Instant::now() + delay, callback)
    }

    pub fn run_every<F: FnMut() + Send + 'static>(
        &self,
        interval: Duration,
        callback: F,
    ) -> TimerId {
        let id = self.shared.alloc_timer_id();
        let when = Instant::now() + interval;
        self.run_in_loop(move || {
            if let Some(event_loop) = EventLoop::current() {
                event_loop.add_timer(id, when, Some(interval), Box::new(callback));
            }
        });
        id
    }

    pub fn cancel(&self, id: TimerId) {
        self.run_in_loop(move || {
            if let Some(event_loop) = EventLoop::current() {
                event_loop.cancel(id);
            }
        });
    }
}

impl PartialEq for LoopHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for LoopHandle {}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("thread", &self.shared.thread)
            .finish()
    }
}

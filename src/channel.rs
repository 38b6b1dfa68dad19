//! A channel binds one file descriptor to its interest mask and per-event
//! callbacks within a single event loop.
//!
//! The channel never owns the descriptor; whatever higher layer created the
//! fd (an acceptor for its listening socket, a connection object for its
//! stream) keeps ownership and decides when to close it. A channel is only
//! ever touched on its owner loop's thread.

use std::cell::RefCell;
use std::fmt;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Instant;

use log::trace;

use crate::event_loop::{EventLoop, WeakLoop};

bitflags::bitflags! {
    /// Interest and readiness mask for a channel.
    ///
    /// Interest uses only `READABLE` and `WRITABLE`; observed readiness may
    /// additionally carry `ERROR` and `HANGUP`. The empty mask means the
    /// channel stays indexed by the poller while the kernel reports nothing
    /// for it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventSet: u8 {
        const READABLE = 0b0001;
        const WRITABLE = 0b0010;
        const ERROR    = 0b0100;
        const HANGUP   = 0b1000;
    }
}

type ReadCallback = Box<dyn FnMut(Instant)>;
type EventCallback = Box<dyn FnMut()>;

struct Inner {
    fd: RawFd,
    owner: WeakLoop,
    events: EventSet,
    revents: EventSet,
    // Poller slot key; None until the first registration.
    slot: Option<usize>,
    on_read: Option<ReadCallback>,
    on_write: Option<EventCallback>,
    on_close: Option<EventCallback>,
    on_error: Option<EventCallback>,
}

/// Handle to one fd/callback binding on an event loop.
///
/// Cloning is cheap and yields another handle to the same binding. Interest
/// mutators forward the new mask to the owner loop, which keeps the poller's
/// registration in sync.
#[derive(Clone)]
pub struct Channel {
    inner: Rc<RefCell<Inner>>,
}

pub(crate) struct WeakChannel(Weak<RefCell<Inner>>);

impl WeakChannel {
    pub(crate) fn upgrade(&self) -> Option<Channel> {
        self.0.upgrade().map(|inner| Channel { inner })
    }
}

impl Channel {
    pub fn new(owner: &EventLoop, fd: RawFd) -> Channel {
        Channel {
            inner: Rc::new(RefCell::new(Inner {
                fd,
                owner: owner.downgrade(),
                events: EventSet::empty(),
                revents: EventSet::empty(),
                slot: None,
                on_read: None,
                on_write: None,
                on_close: None,
                on_error: None,
            })),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.inner.borrow().fd
    }

    pub fn events(&self) -> EventSet {
        self.inner.borrow().events
    }

    pub fn revents(&self) -> EventSet {
        self.inner.borrow().revents
    }

    pub fn is_none_event(&self) -> bool {
        self.inner.borrow().events.is_empty()
    }

    pub fn set_read_callback<F: FnMut(Instant) + 'static>(&self, cb: F) {
        self.inner.borrow_mut().on_read = Some(Box::new(cb));
    }

    pub fn set_write_callback<F: FnMut() + 'static>(&self, cb: F) {
        self.inner.borrow_mut().on_write = Some(Box::new(cb));
    }

    pub fn set_close_callback<F: FnMut() + 'static>(&self, cb: F) {
        self.inner.borrow_mut().on_close = Some(Box::new(cb));
    }

    pub fn set_error_callback<F: FnMut() + 'static>(&self, cb: F) {
        self.inner.borrow_mut().on_error = Some(Box::new(cb));
    }

    pub fn enable_reading(&self) {
        self.inner.borrow_mut().events.insert(EventSet::READABLE);
        self.update();
    }

    pub fn enable_writing(&self) {
        self.inner.borrow_mut().events.insert(EventSet::WRITABLE);
        self.update();
    }

    pub fn disable_writing(&self) {
        self.inner.borrow_mut().events.remove(EventSet::WRITABLE);
        self.update();
    }

    pub fn disable_all(&self) {
        self.inner.borrow_mut().events = EventSet::empty();
        self.update();
    }

    /// Unregisters the channel from its owner loop's poller.
    ///
    /// The channel must have been disabled first.
    pub fn remove(&self) {
        assert!(
            self.is_none_event(),
            "Channel::remove on fd {} with live interest {:?}",
            self.fd(),
            self.events()
        );
        if let Some(owner) = self.owner() {
            owner.remove_channel(self);
        }
    }

    /// Dispatches the readiness recorded by the last poll, in fixed order:
    /// hang-up without readable data, then error, then read, then write.
    pub fn handle_event(&self, receive_time: Instant) {
        let revents = self.inner.borrow().revents;
        trace!("channel fd {} handling {:?}", self.fd(), revents);
        if revents.contains(EventSet::HANGUP) && !revents.contains(EventSet::READABLE) {
            self.invoke_close();
        }
        if revents.contains(EventSet::ERROR) {
            self.invoke_error();
        }
        if revents.contains(EventSet::READABLE) {
            self.invoke_read(receive_time);
        }
        if revents.contains(EventSet::WRITABLE) {
            self.invoke_write();
        }
    }

    // A callback is moved out of the cell for the duration of the call, so
    // the handler may mutate its own channel (disable interest, remove the
    // registration) without tripping a nested borrow. It is restored
    // afterwards unless the handler installed a replacement.
    fn invoke_read(&self, receive_time: Instant) {
        let taken = self.inner.borrow_mut().on_read.take();
        if let Some(mut cb) = taken {
            cb(receive_time);
            let mut inner = self.inner.borrow_mut();
            if inner.on_read.is_none() {
                inner.on_read = Some(cb);
            }
        }
    }

    fn invoke_write(&self) {
        let taken = self.inner.borrow_mut().on_write.take();
        if let Some(mut cb) = taken {
            cb();
            let mut inner = self.inner.borrow_mut();
            if inner.on_write.is_none() {
                inner.on_write = Some(cb);
            }
        }
    }

    fn invoke_close(&self) {
        let taken = self.inner.borrow_mut().on_close.take();
        if let Some(mut cb) = taken {
            cb();
            let mut inner = self.inner.borrow_mut();
            if inner.on_close.is_none() {
                inner.on_close = Some(cb);
            }
        }
    }

    fn invoke_error(&self) {
        let taken = self.inner.borrow_mut().on_error.take();
        if let Some(mut cb) = taken {
            cb();
            let mut inner = self.inner.borrow_mut();
            if inner.on_error.is_none() {
                inner.on_error = Some(cb);
            }
        }
    }

    fn update(&self) {
        if let Some(owner) = self.owner() {
            owner.update_channel(self);
        }
    }

    fn owner(&self) -> Option<EventLoop> {
        self.inner.borrow().owner.upgrade()
    }

    pub(crate) fn owned_by(&self, event_loop: &EventLoop) -> bool {
        self.inner.borrow().owner.refers_to(event_loop)
    }

    #[cfg(test)]
    pub(crate) fn set_events(&self, events: EventSet) {
        self.inner.borrow_mut().events = events;
    }

    pub(crate) fn slot(&self) -> Option<usize> {
        self.inner.borrow().slot
    }

    pub(crate) fn set_slot(&self, slot: Option<usize>) {
        self.inner.borrow_mut().slot = slot;
    }

    pub(crate) fn set_revents(&self, revents: EventSet) {
        self.inner.borrow_mut().revents = revents;
    }

    pub(crate) fn downgrade(&self) -> WeakChannel {
        WeakChannel(Rc::downgrade(&self.inner))
    }

    pub(crate) fn same_channel(&self, other: &Channel) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Channel")
            .field("fd", &inner.fd)
            .field("events", &inner.events)
            .field("revents", &inner.revents)
            .field("slot", &inner.slot)
            .finish()
    }
}

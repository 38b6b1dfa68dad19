//! I/O multiplexer: wraps the OS readiness primitive and owns the
//! fd-to-channel index.
//!
//! The poller tracks every registered channel in a dense slot table whose
//! key doubles as the kernel-side token. Channels are indexed, never owned;
//! the higher layer that created a channel keeps it alive. A channel with an
//! empty interest mask keeps its slot but is withdrawn from the kernel, so
//! re-enabling it is cheap and its identity is stable across the gap.
//!
//! All methods must be called on the owner loop's thread.

use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use log::{error, trace};
use mio::unix::SourceFd;
use mio::{Events, Interest, Token};
use slab::Slab;

use crate::channel::{Channel, EventSet, WeakChannel};

const EVENTS_CAPACITY: usize = 1024;

struct Slot {
    channel: WeakChannel,
    fd: RawFd,
    // Whether the fd is currently registered with the kernel.
    armed: bool,
}

pub struct Poller {
    poll: mio::Poll,
    events: Events,
    slots: Slab<Slot>,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        Ok(Poller {
            poll: mio::Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            slots: Slab::new(),
        })
    }

    /// Blocks until at least one registered fd is ready or the timeout
    /// elapses, and returns the wake time plus the channels with pending
    /// readiness. `None` blocks indefinitely; `Some(Duration::ZERO)` polls
    /// without blocking.
    ///
    /// An interrupted wait returns an empty list; any other poll failure is
    /// logged and likewise yields an empty list so the loop can continue.
    pub fn poll(&mut self, timeout: Option<Duration>) -> (Instant, Vec<Channel>) {
        if let Err(err) = self.poll.poll(&mut self.events, timeout) {
            let now = Instant::now();
            if err.kind() != io::ErrorKind::Interrupted {
                error!("Poller::poll: {}", err);
            }
            return (now, Vec::new());
        }
        let now = Instant::now();

        let mut active = Vec::with_capacity(self.events.iter().count());
        for event in self.events.iter() {
            let Token(key) = event.token();
            let Some(slot) = self.slots.get(key) else {
                // The channel was removed after the kernel queued the event.
                continue;
            };
            let Some(channel) = slot.channel.upgrade() else {
                continue;
            };

            let mut revents = EventSet::empty();
            if event.is_readable() || event.is_read_closed() {
                revents.insert(EventSet::READABLE);
            }
            if event.is_writable() {
                revents.insert(EventSet::WRITABLE);
            }
            if event.is_error() {
                revents.insert(EventSet::ERROR);
            }
            if event.is_read_closed() && event.is_write_closed() {
                revents.insert(EventSet::HANGUP);
            }
            channel.set_revents(revents);
            active.push(channel);
        }
        if !active.is_empty() {
            trace!("{} events happened", active.len());
        }
        (now, active)
    }

    /// Registers a new channel or applies its current interest mask.
    ///
    /// A first-time update assigns the channel its slot; later updates
    /// re-program the kernel registration, arming or disarming the fd as
    /// the mask empties and refills.
    pub fn update(&mut self, channel: &Channel) -> io::Result<()> {
        let fd = channel.fd();
        let events = channel.events();
        trace!("fd = {} events = {:?}", fd, events);

        match channel.slot() {
            None => {
                let key = self.slots.insert(Slot {
                    channel: channel.downgrade(),
                    fd,
                    armed: false,
                });
                channel.set_slot(Some(key));
                if let Some(interest) = interest_of(events) {
                    self.poll
                        .registry()
                        .register(&mut SourceFd(&fd), Token(key), interest)?;
                    self.slots[key].armed = true;
                }
            }
            Some(key) => {
                let slot = self.slots.get_mut(key).expect("channel slot out of table");
                assert_eq!(slot.fd, fd, "channel fd changed under its slot");
                match interest_of(events) {
                    None => {
                        if slot.armed {
                            self.poll.registry().deregister(&mut SourceFd(&fd))?;
                            slot.armed = false;
                        }
                    }
                    Some(interest) => {
                        if slot.armed {
                            self.poll.registry().reregister(
                                &mut SourceFd(&fd),
                                Token(key),
                                interest,
                            )?;
                        } else {
                            self.poll.registry().register(
                                &mut SourceFd(&fd),
                                Token(key),
                                interest,
                            )?;
                            slot.armed = true;
                        }
                    }
                }
            }
        }
        channel.set_revents(EventSet::empty());
        Ok(())
    }

    /// Drops a channel's slot. The channel must be disabled first.
    pub fn remove(&mut self, channel: &Channel) {
        assert!(channel.is_none_event());
        let key = channel
            .slot()
            .expect("Poller::remove on an unregistered channel");
        let slot = self.slots.remove(key);
        debug_assert!(!slot.armed);
        debug_assert_eq!(slot.fd, channel.fd());
        channel.set_slot(None);
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        channel.slot().is_some_and(|key| {
            self.slots
                .get(key)
                .and_then(|slot| slot.channel.upgrade())
                .is_some_and(|registered| registered.same_channel(channel))
        })
    }
}

fn interest_of(events: EventSet) -> Option<Interest> {
    match (
        events.contains(EventSet::READABLE),
        events.contains(EventSet::WRITABLE),
    ) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

//! Client-side non-blocking connection establishment with retry.
//!
//! A connector starts a non-blocking connect, watches the in-flight socket
//! for writability, and confirms establishment by checking the pending
//! socket error. Refused or unreachable attempts are retried with
//! exponential backoff through the loop's timers; each attempt uses a fresh
//! socket and a fresh channel. A connector may be stopped mid-attempt and
//! restarted later.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::time::Duration;

use log::{debug, error, info, warn};
use mio::net::TcpStream;

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::timer::TimerId;

const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

type NewConnectionCallback = Box<dyn FnMut(TcpStream)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Disconnected,
    Connecting,
    Connected,
}

struct Inner {
    event_loop: EventLoop,
    server_addr: SocketAddr,
    connect: bool,
    state: State,
    retry_delay: Duration,
    socket: Option<TcpStream>,
    channel: Option<Channel>,
    retry_timer: Option<TimerId>,
    on_connected: Option<NewConnectionCallback>,
}

pub struct Connector {
    inner: Rc<RefCell<Inner>>,
}

impl Connector {
    pub fn new(event_loop: &EventLoop, server_addr: SocketAddr) -> Connector {
        Connector {
            inner: Rc::new(RefCell::new(Inner {
                event_loop: event_loop.clone(),
                server_addr,
                connect: false,
                state: State::Disconnected,
                retry_delay: INIT_RETRY_DELAY,
                socket: None,
                channel: None,
                retry_timer: None,
                on_connected: None,
            })),
        }
    }

    pub fn set_new_connection_callback<F>(&self, callback: F)
    where
        F: FnMut(TcpStream) + 'static,
    {
        self.inner.borrow_mut().on_connected = Some(Box::new(callback));
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.inner.borrow().server_addr
    }

    /// Begins connecting. Must run on the owner loop's thread; the first
    /// attempt starts immediately.
    pub fn start(&self) {
        self.inner.borrow().event_loop.assert_in_loop_thread();
        self.inner.borrow_mut().connect = true;
        start_in_loop(&self.inner);
    }

    /// Abandons the current attempt and cancels any scheduled retry.
    pub fn stop(&self) {
        let (event_loop, timer) = {
            let mut inner = self.inner.borrow_mut();
            inner.event_loop.assert_in_loop_thread();
            inner.connect = false;
            if inner.state == State::Connecting {
                inner.state = State::Disconnected;
            }
            (inner.event_loop.clone(), inner.retry_timer.take())
        };
        if let Some(id) = timer {
            event_loop.cancel(id);
        }
        remove_and_reset_channel(&self.inner);
        self.inner.borrow_mut().socket = None;
    }

    /// Connects again from scratch, with the backoff reset.
    pub fn restart(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.event_loop.assert_in_loop_thread();
            inner.state = State::Disconnected;
            inner.retry_delay = INIT_RETRY_DELAY;
            inner.connect = true;
        }
        start_in_loop(&self.inner);
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        let (event_loop, timer) = {
            let mut inner = self.inner.borrow_mut();
            (inner.event_loop.clone(), inner.retry_timer.take())
        };
        if let Some(id) = timer {
            event_loop.cancel(id);
        }
        remove_and_reset_channel(&self.inner);
    }
}

fn start_in_loop(inner: &Rc<RefCell<Inner>>) {
    let (connect, state, addr) = {
        let b = inner.borrow();
        (b.connect, b.state, b.server_addr)
    };
    assert_eq!(state, State::Disconnected);
    if !connect {
        debug!("Connector: start skipped, stop was requested");
        return;
    }
    match TcpStream::connect(addr) {
        Ok(socket) => connecting(inner, socket),
        Err(err) => match err.raw_os_error() {
            Some(libc::EAGAIN)
            | Some(libc::EADDRINUSE)
            | Some(libc::EADDRNOTAVAIL)
            | Some(libc::ECONNREFUSED)
            | Some(libc::ENETUNREACH) => retry(inner),
            _ => {
                error!("Connector: connect to {} failed: {}", addr, err);
                inner.borrow_mut().connect = false;
            }
        },
    }
}

fn connecting(inner: &Rc<RefCell<Inner>>, socket: TcpStream) {
    let channel = {
        let mut b = inner.borrow_mut();
        b.state = State::Connecting;
        let channel = Channel::new(&b.event_loop, socket.as_raw_fd());
        b.socket = Some(socket);
        b.channel = Some(channel.clone());
        channel
    };
    let weak = Rc::downgrade(inner);
    channel.set_write_callback(move || {
        if let Some(inner) = weak.upgrade() {
            handle_write(&inner);
        }
    });
    let weak = Rc::downgrade(inner);
    channel.set_error_callback(move || {
        if let Some(inner) = weak.upgrade() {
            handle_error(&inner);
        }
    });
    channel.enable_writing();
}

// Writability on a connecting socket settles the attempt one way or the
// other; the channel is finished either way and a fresh one is made for
// any retry.
fn handle_write(inner: &Rc<RefCell<Inner>>) {
    if inner.borrow().state != State::Connecting {
        return;
    }
    remove_and_reset_channel(inner);
    let socket = inner.borrow_mut().socket.take();
    let Some(socket) = socket else {
        return;
    };

    let verdict = socket.take_error();
    match verdict {
        Ok(None) => {
            // A loopback connect can land on its own ephemeral port; the
            // socket is writable and error-free but useless.
            if is_self_connect(&socket) {
                warn!(
                    "Connector: self connect to {}",
                    inner.borrow().server_addr
                );
                drop(socket);
                inner.borrow_mut().state = State::Disconnected;
                retry(inner);
                return;
            }
            let wanted = {
                let mut b = inner.borrow_mut();
                b.state = State::Connected;
                b.retry_delay = INIT_RETRY_DELAY;
                b.connect
            };
            if !wanted {
                // Stopped while the handshake was in flight.
                inner.borrow_mut().state = State::Disconnected;
                return;
            }
            info!("Connector: connected to {}", inner.borrow().server_addr);
            let callback = inner.borrow_mut().on_connected.take();
            match callback {
                Some(mut cb) => {
                    cb(socket);
                    let mut b = inner.borrow_mut();
                    if b.on_connected.is_none() {
                        b.on_connected = Some(cb);
                    }
                }
                None => drop(socket),
            }
        }
        Ok(Some(err)) => {
            warn!(
                "Connector: connect to {} failed: {}",
                inner.borrow().server_addr,
                err
            );
            drop(socket);
            inner.borrow_mut().state = State::Disconnected;
            retry(inner);
        }
        Err(err) => {
            warn!("Connector: SO_ERROR query failed: {}", err);
            drop(socket);
            inner.borrow_mut().state = State::Disconnected;
            retry(inner);
        }
    }
}

fn handle_error(inner: &Rc<RefCell<Inner>>) {
    if inner.borrow().state != State::Connecting {
        return;
    }
    remove_and_reset_channel(inner);
    let socket = inner.borrow_mut().socket.take();
    if let Some(socket) = socket {
        if let Ok(Some(err)) = socket.take_error() {
            warn!("Connector: connect error: {}", err);
        }
    }
    inner.borrow_mut().state = State::Disconnected;
    retry(inner);
}

fn retry(inner: &Rc<RefCell<Inner>>) {
    let (connect, delay, event_loop, addr) = {
        let mut b = inner.borrow_mut();
        let delay = b.retry_delay;
        b.retry_delay = (delay * 2).min(MAX_RETRY_DELAY);
        (b.connect, delay, b.event_loop.clone(), b.server_addr)
    };
    if !connect {
        debug!("Connector: retry skipped, stop was requested");
        return;
    }
    info!("Connector: retrying {} in {:?}", addr, delay);
    let weak = Rc::downgrade(inner);
    let timer = event_loop.run_after(delay, move || {
        if let Some(inner) = weak.upgrade() {
            inner.borrow_mut().retry_timer = None;
            start_in_loop(&inner);
        }
    });
    inner.borrow_mut().retry_timer = Some(timer);
}

fn is_self_connect(socket: &TcpStream) -> bool {
    match (socket.local_addr(), socket.peer_addr()) {
        (Ok(local), Ok(peer)) => local == peer,
        _ => false,
    }
}

fn remove_and_reset_channel(inner: &Rc<RefCell<Inner>>) {
    let channel = inner.borrow_mut().channel.take();
    if let Some(channel) = channel {
        if channel.slot().is_some() {
            channel.disable_all();
            channel.remove();
        }
    }
}

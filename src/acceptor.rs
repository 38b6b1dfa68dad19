//! Accepts new TCP connections on behalf of a listening loop.
//!
//! The acceptor owns the listening socket and watches it through a channel
//! on its loop. Each readable wake accepts until the socket would block
//! (bounded, so one busy listener cannot monopolize the cycle) and hands
//! every `(stream, peer)` pair to the registered callback; without a
//! callback the connection is closed on the spot.
//!
//! Running out of file descriptors is absorbed with a reserved fd: a spare
//! handle on `/dev/null` is released, the connection accepted and
//! immediately closed, and the spare re-acquired. The listener drains
//! instead of spinning on a level-triggered readable it can never clear.

use std::cell::RefCell;
use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;

use log::{error, warn};
use metrics::counter;
use mio::net::{TcpListener, TcpStream};

use crate::channel::Channel;
use crate::event_loop::EventLoop;

const MAX_ACCEPTS_PER_WAKE: usize = 32;

type NewConnectionCallback = Box<dyn FnMut(TcpStream, SocketAddr)>;

struct Inner {
    event_loop: EventLoop,
    listener: TcpListener,
    channel: Channel,
    listening: bool,
    idle_fd: Option<File>,
    on_new_connection: Option<NewConnectionCallback>,
}

/// A listening socket bound to a loop, emitting accepted connections.
///
/// # Examples
///
/// ```no_run
/// use riptide::{Acceptor, EventLoop};
///
/// let event_loop = EventLoop::new()?;
/// let acceptor = Acceptor::new(&event_loop, "127.0.0.1:7000".parse().unwrap())?;
/// acceptor.set_new_connection_callback(|stream, peer| {
///     println!("connection from {peer}");
///     drop(stream);
/// });
/// acceptor.listen();
/// event_loop.run();
/// # Ok::<(), std::io::Error>(())
/// ```
pub struct Acceptor {
    inner: Rc<RefCell<Inner>>,
}

impl Acceptor {
    /// Binds a non-blocking, reuse-addr listening socket on `listen_addr`
    /// and wires its channel to `event_loop`. Accepting starts with
    /// [`listen`](Acceptor::listen).
    pub fn new(event_loop: &EventLoop, listen_addr: SocketAddr) -> io::Result<Acceptor> {
        let listener = TcpListener::bind(listen_addr)?;
        let channel = Channel::new(event_loop, listener.as_raw_fd());
        let inner = Rc::new(RefCell::new(Inner {
            event_loop: event_loop.clone(),
            listener,
            channel: channel.clone(),
            listening: false,
            idle_fd: File::open("/dev/null").ok(),
            on_new_connection: None,
        }));
        let weak = Rc::downgrade(&inner);
        channel.set_read_callback(move |_| {
            if let Some(inner) = weak.upgrade() {
                handle_read(&inner);
            }
        });
        Ok(Acceptor { inner })
    }

    pub fn set_new_connection_callback<F>(&self, callback: F)
    where
        F: FnMut(TcpStream, SocketAddr) + 'static,
    {
        self.inner.borrow_mut().on_new_connection = Some(Box::new(callback));
    }

    /// Starts accepting. Must run on the owner loop's thread.
    pub fn listen(&self) {
        let channel = {
            let mut inner = self.inner.borrow_mut();
            inner.event_loop.assert_in_loop_thread();
            inner.listening = true;
            inner.channel.clone()
        };
        channel.enable_reading();
    }

    pub fn listening(&self) -> bool {
        self.inner.borrow().listening
    }

    /// The bound address, with the kernel-chosen port when bound to port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.borrow().listener.local_addr()
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        let channel = self.inner.borrow().channel.clone();
        if channel.slot().is_some() {
            channel.disable_all();
            channel.remove();
        }
        // The listening fd closes with the listener.
    }
}

fn handle_read(inner: &Rc<RefCell<Inner>>) {
    // The callback leaves the cell while connections are delivered, so it
    // may call back into the acceptor.
    let mut callback = inner.borrow_mut().on_new_connection.take();

    for _ in 0..MAX_ACCEPTS_PER_WAKE {
        let result = inner.borrow().listener.accept();
        match result {
            Ok((stream, peer)) => {
                counter!("riptide_connections_accepted_total").increment(1);
                match callback.as_mut() {
                    Some(cb) => cb(stream, peer),
                    // No consumer registered; close immediately.
                    None => drop(stream),
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref err) if err.raw_os_error() == Some(libc::EMFILE) => {
                error!("Acceptor: file descriptor limit reached");
                let mut b = inner.borrow_mut();
                if b.idle_fd.take().is_some() {
                    if let Ok((stream, _)) = b.listener.accept() {
                        drop(stream);
                    }
                    b.idle_fd = File::open("/dev/null").ok();
                }
                break;
            }
            Err(err) => {
                warn!("Acceptor: accept failed: {}", err);
                break;
            }
        }
    }

    let mut b = inner.borrow_mut();
    if b.on_new_connection.is_none() {
        b.on_new_connection = callback;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_an_ephemeral_port() {
        let event_loop = EventLoop::new().unwrap();
        let acceptor = Acceptor::new(&event_loop, "127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = acceptor.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(!acceptor.listening());

        acceptor.listen();
        assert!(acceptor.listening());
    }

    #[test]
    fn drop_unregisters_the_channel() {
        let event_loop = EventLoop::new().unwrap();
        let acceptor = Acceptor::new(&event_loop, "127.0.0.1:0".parse().unwrap()).unwrap();
        acceptor.listen();
        drop(acceptor);
        // A second acceptor on the same loop is unaffected.
        let again = Acceptor::new(&event_loop, "127.0.0.1:0".parse().unwrap()).unwrap();
        again.listen();
    }
}

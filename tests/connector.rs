//! Client-side connect against a live acceptor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use riptide::{Acceptor, Connector, EventLoop};

#[test]
fn connector_delivers_an_established_stream() {
    let event_loop = EventLoop::new().unwrap();

    let acceptor = Acceptor::new(&event_loop, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = acceptor.local_addr().unwrap();
    // Hold server-side sockets open for the duration of the test.
    let server_side = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    {
        let server_side = server_side.clone();
        acceptor.set_new_connection_callback(move |stream, _| {
            server_side.borrow_mut().push(stream);
        });
    }
    acceptor.listen();

    let connector = Connector::new(&event_loop, addr);
    let connected = Arc::new(AtomicUsize::new(0));
    {
        let connected = connected.clone();
        connector.set_new_connection_callback(move |stream| {
            assert!(stream.peer_addr().is_ok());
            connected.fetch_add(1, Ordering::SeqCst);
        });
    }
    connector.start();

    // Leave the loop once both ends have seen the connection.
    {
        let connected = connected.clone();
        let server_side = server_side.clone();
        let handle = event_loop.handle();
        event_loop.run_every(Duration::from_millis(10), move || {
            if connected.load(Ordering::SeqCst) >= 1 && !server_side.borrow().is_empty() {
                handle.quit();
            }
        });
    }
    let watchdog = event_loop.handle();
    event_loop.run_after(Duration::from_secs(5), move || watchdog.quit());

    event_loop.run();
    assert_eq!(connected.load(Ordering::SeqCst), 1);
    assert_eq!(server_side.borrow().len(), 1);
}

#[test]
fn stopped_connector_delivers_nothing() {
    let event_loop = EventLoop::new().unwrap();

    // Nobody listens here; the attempt would be refused and retried.
    let connector = Connector::new(&event_loop, "127.0.0.1:1".parse().unwrap());
    let connected = Arc::new(AtomicUsize::new(0));
    {
        let connected = connected.clone();
        connector.set_new_connection_callback(move |_| {
            connected.fetch_add(1, Ordering::SeqCst);
        });
    }
    connector.start();
    connector.stop();

    let watchdog = event_loop.handle();
    event_loop.run_after(Duration::from_millis(200), move || watchdog.quit());
    event_loop.run();

    assert_eq!(connected.load(Ordering::SeqCst), 0);
}

//! Timer delivery: precision, ordering, cancellation, and periodic firing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use riptide::EventLoop;

#[test]
fn one_shots_fire_near_their_deadline_and_cancel_is_honored() {
    let event_loop = EventLoop::new().unwrap();
    let t0 = Instant::now();
    let fired = Arc::new(Mutex::new(Vec::new()));

    let f = fired.clone();
    event_loop.run_after(Duration::from_millis(50), move || {
        f.lock().unwrap().push(("a", Instant::now()));
    });
    let f = fired.clone();
    let cancelled = event_loop.run_after(Duration::from_millis(100), move || {
        f.lock().unwrap().push(("b", Instant::now()));
    });
    event_loop.cancel(cancelled);
    let f = fired.clone();
    let handle = event_loop.handle();
    event_loop.run_after(Duration::from_millis(150), move || {
        f.lock().unwrap().push(("c", Instant::now()));
        handle.quit();
    });

    event_loop.run();

    let fired = fired.lock().unwrap();
    let names: Vec<&str> = fired.iter().map(|(n, _)| *n).collect();
    assert_eq!(names, vec!["a", "c"]);

    let a = fired[0].1.duration_since(t0);
    let c = fired[1].1.duration_since(t0);
    assert!(a >= Duration::from_millis(45) && a <= Duration::from_millis(110), "a at {:?}", a);
    assert!(c >= Duration::from_millis(145) && c <= Duration::from_millis(250), "c at {:?}", c);
}

#[test]
fn earlier_deadlines_fire_first() {
    let event_loop = EventLoop::new().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    // Registered out of order on purpose.
    let o = order.clone();
    event_loop.run_after(Duration::from_millis(40), move || o.lock().unwrap().push(2));
    let o = order.clone();
    event_loop.run_after(Duration::from_millis(20), move || o.lock().unwrap().push(1));
    let o = order.clone();
    let handle = event_loop.handle();
    event_loop.run_after(Duration::from_millis(60), move || {
        o.lock().unwrap().push(3);
        handle.quit();
    });

    event_loop.run();
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}

#[test]
fn periodic_timer_repeats_until_cancelled() {
    let event_loop = EventLoop::new().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let h = hits.clone();
    let id = event_loop.run_every(Duration::from_millis(10), move || {
        h.fetch_add(1, Ordering::SeqCst);
    });

    let cancel_loop = EventLoop::current().unwrap();
    let h = hits.clone();
    event_loop.run_after(Duration::from_millis(105), move || {
        assert!(h.load(Ordering::SeqCst) >= 3);
        cancel_loop.cancel(id);
    });
    let handle = event_loop.handle();
    event_loop.run_after(Duration::from_millis(200), move || handle.quit());

    event_loop.run();

    let after_cancel = hits.load(Ordering::SeqCst);
    // Nothing fires after the cancel point; allow the one tick in flight.
    assert!(after_cancel <= 11, "fired {} times", after_cancel);
    assert!(after_cancel >= 3);
}

#[test]
fn a_timer_callback_may_cancel_its_own_timer() {
    let event_loop = EventLoop::new().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let h = hits.clone();
    let slot: Arc<Mutex<Option<riptide::TimerId>>> = Arc::new(Mutex::new(None));
    let s = slot.clone();
    let id = event_loop.run_every(Duration::from_millis(10), move || {
        h.fetch_add(1, Ordering::SeqCst);
        // Self-cancel on the first tick; the repetition must stop.
        let id = s.lock().unwrap().take();
        if let Some(id) = id {
            EventLoop::current().unwrap().cancel(id);
        }
    });
    *slot.lock().unwrap() = Some(id);

    let handle = event_loop.handle();
    event_loop.run_after(Duration::from_millis(80), move || handle.quit());
    event_loop.run();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn cancelling_a_finished_or_unknown_timer_is_a_no_op() {
    let event_loop = EventLoop::new().unwrap();
    let id = event_loop.run_after(Duration::from_millis(5), || {});

    let handle = event_loop.handle();
    let finished = event_loop.clone();
    event_loop.run_after(Duration::from_millis(30), move || {
        finished.cancel(id);
        handle.quit();
    });
    event_loop.run();
}

#[test]
fn handles_schedule_timers_from_other_threads() {
    let (tx, rx) = std::sync::mpsc::channel();
    let join = std::thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        tx.send(event_loop.handle()).unwrap();
        event_loop.run();
    });
    let handle = rx.recv().unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    let quit_handle = handle.clone();
    let started = Instant::now();
    handle.run_after(Duration::from_millis(30), move || {
        f.fetch_add(1, Ordering::SeqCst);
        quit_handle.quit();
    });

    join.join().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(25), "fired at {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(500), "fired at {:?}", elapsed);
}

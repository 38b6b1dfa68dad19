//! Worker loops on dedicated threads, with round-robin and hash dispatch.
//!
//! The pool is owned by a base loop; the base loop's thread typically hosts
//! the acceptor, while accepted connections are parcelled out to worker
//! loops. Each worker thread constructs its own loop, reports its handle
//! back, and then runs until the pool is dropped.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use log::debug;
use metrics::counter;

use crate::event_loop::{EventLoop, LoopHandle};

/// Runs once on every worker loop before it starts, and on the base loop
/// when the pool has no workers.
pub type ThreadInitCallback = std::sync::Arc<dyn Fn(&EventLoop) + Send + Sync>;

/// One worker: an OS thread running a single event loop.
pub struct LoopThread {
    handle: LoopHandle,
    thread: Option<JoinHandle<()>>,
}

impl LoopThread {
    /// Spawns the named thread and blocks until its loop exists; the handle
    /// comes back only after the init callback has finished.
    pub fn start(name: String, init: Option<ThreadInitCallback>) -> LoopThread {
        let (tx, rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let event_loop = EventLoop::new().expect("failed to create worker EventLoop");
                if let Some(init) = init {
                    init(&event_loop);
                }
                tx.send(event_loop.handle())
                    .expect("loop thread starter went away");
                event_loop.run();
            })
            .expect("failed to spawn loop thread");
        let handle = rx.recv().expect("loop thread died during startup");
        LoopThread {
            handle,
            thread: Some(thread),
        }
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        self.handle.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// A fixed set of worker loops fed from a base loop.
pub struct LoopThreadPool {
    base: LoopHandle,
    name: String,
    started: bool,
    num_threads: usize,
    next: usize,
    threads: Vec<LoopThread>,
    loops: Vec<LoopHandle>,
}

impl LoopThreadPool {
    pub fn new(base_loop: &EventLoop, name: impl Into<String>) -> LoopThreadPool {
        LoopThreadPool {
            base: base_loop.handle(),
            name: name.into(),
            started: false,
            num_threads: 0,
            next: 0,
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    /// Sets the worker count. Must precede [`start`](LoopThreadPool::start).
    pub fn set_thread_num(&mut self, num_threads: usize) {
        assert!(!self.started, "pool already started");
        self.num_threads = num_threads;
    }

    /// Spawns the workers and blocks until every worker loop is running.
    ///
    /// With zero workers the init callback runs on the base loop and all
    /// dispatch falls back to it.
    pub fn start(&mut self, init: Option<ThreadInitCallback>) {
        assert!(!self.started, "pool already started");
        self.base.assert_in_loop_thread();
        self.started = true;

        for i in 0..self.num_threads {
            let name = format!("{}{}", self.name, i);
            let worker = LoopThread::start(name, init.clone());
            self.loops.push(worker.handle());
            self.threads.push(worker);
            counter!("riptide_loops_started_total").increment(1);
        }
        debug!(
            "LoopThreadPool {} started {} workers",
            self.name, self.num_threads
        );

        if self.num_threads == 0 {
            if let (Some(init), Some(base)) = (init, EventLoop::current()) {
                init(&base);
            }
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    /// The next loop in round-robin order; the base loop when there are no
    /// workers. Must be called on the base loop's thread.
    pub fn get_next_loop(&mut self) -> LoopHandle {
        self.base.assert_in_loop_thread();
        assert!(self.started, "pool not started");
        if self.loops.is_empty() {
            return self.base.clone();
        }
        let chosen = self.loops[self.next].clone();
        self.next += 1;
        if self.next >= self.loops.len() {
            self.next = 0;
        }
        chosen
    }

    /// A stable mapping from `hash` to a worker loop.
    pub fn get_loop_for_hash(&self, hash: usize) -> LoopHandle {
        self.base.assert_in_loop_thread();
        assert!(self.started, "pool not started");
        if self.loops.is_empty() {
            return self.base.clone();
        }
        self.loops[hash % self.loops.len()].clone()
    }

    /// Snapshot of every dispatch target.
    pub fn get_all_loops(&self) -> Vec<LoopHandle> {
        self.base.assert_in_loop_thread();
        assert!(self.started, "pool not started");
        if self.loops.is_empty() {
            vec![self.base.clone()]
        } else {
            self.loops.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "pool not started")]
    fn dispatch_before_start_is_fatal() {
        let base = EventLoop::new().unwrap();
        let mut pool = LoopThreadPool::new(&base, "worker");
        pool.get_next_loop();
    }

    #[test]
    fn zero_workers_fall_back_to_the_base_loop() {
        let base = EventLoop::new().unwrap();
        let mut pool = LoopThreadPool::new(&base, "worker");
        pool.start(None);
        assert_eq!(pool.get_next_loop(), base.handle());
        assert_eq!(pool.get_loop_for_hash(7), base.handle());
        assert_eq!(pool.get_all_loops(), vec![base.handle()]);
    }

    #[test]
    fn zero_workers_run_init_on_the_base_loop() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let base = EventLoop::new().unwrap();
        let mut pool = LoopThreadPool::new(&base, "worker");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        pool.start(Some(Arc::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        })));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn workers_start_and_join_on_drop() {
        let base = EventLoop::new().unwrap();
        let mut pool = LoopThreadPool::new(&base, "worker");
        pool.set_thread_num(2);
        pool.start(None);
        assert_eq!(pool.get_all_loops().len(), 2);
        drop(pool);
    }
}

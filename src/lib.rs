//! A reactor-pattern network runtime core: non-blocking socket I/O
//! multiplexed across a fixed set of worker threads, one event loop per
//! thread.
//!
//! Application code registers TCP listeners and per-fd callbacks; the core
//! delivers readiness events on the owning thread, runs cross-thread task
//! requests, and fires timers. It consists of:
//!
//! - [`event_loop`]: The per-thread poll/dispatch/drain cycle and its
//!   cross-thread handle
//! - [`poller`]: The I/O multiplexer owning the fd-to-channel index
//! - [`channel`]: One fd bound to its interest mask and event callbacks
//! - [`timer`]: The ordered timer queue with race-safe cancellation
//! - [`wakeup`]: The signal primitive that unblocks a loop from any thread
//! - [`acceptor`]: The listening socket that emits accepted connections
//! - [`connector`]: Client-side connect with exponential-backoff retry
//! - [`pool`]: Worker loops on dedicated threads with round-robin and hash
//!   dispatch
//!
//! Cross-thread use is strictly marshalled: anything that mutates a loop or
//! a channel from another thread goes through [`LoopHandle::run_in_loop`]
//! or [`LoopHandle::queue_in_loop`], which wake the loop so the request is
//! handled within one cycle. Violating thread affinity is a programming
//! error and fails fast.

pub mod acceptor;
pub mod channel;
pub mod connector;
pub mod event_loop;
pub mod poller;
pub mod pool;
pub mod timer;
pub mod wakeup;

pub use acceptor::Acceptor;
pub use channel::{Channel, EventSet};
pub use connector::Connector;
pub use event_loop::{EventLoop, LoopHandle};
pub use pool::{LoopThread, LoopThreadPool, ThreadInitCallback};
pub use timer::TimerId;
pub use wakeup::Wakeup;

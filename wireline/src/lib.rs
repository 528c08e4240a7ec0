//! wireline — edge-triggered epoll reactor runtime for Linux.
//!
//! wireline is a small readiness-based I/O runtime: worker threads each own
//! an epoll instance and a handler, and everything a handler touches runs on
//! its own worker thread. Cross-thread work enters through eventfd-backed
//! [`NotifyQueue`]s, timeouts are timerfds from a [`TimerPool`], and results
//! cross back to callers through [`promise`] pairs.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::io;
//! use std::sync::Arc;
//! use wireline::{Event, Handler, NotifyQueue, Poller, Reactor, ReactorConfig};
//!
//! struct Printer {
//!     queue: NotifyQueue<String>,
//! }
//!
//! impl Handler for Printer {
//!     fn attach(&self, poller: &Arc<Poller>) -> io::Result<()> {
//!         self.queue.bind(poller)
//!     }
//!     fn on_ready(&self, events: &[Event]) {
//!         for event in events {
//!             if event.fd == self.queue.event_fd() {
//!                 self.queue.drain_signal();
//!                 while let Some(msg) = self.queue.pop() {
//!                     println!("{msg}");
//!                 }
//!             }
//!         }
//!     }
//! }
//!
//! fn main() -> Result<(), wireline::Error> {
//!     let mut reactor = Reactor::new(&ReactorConfig::default(), |_| {
//!         Ok(Printer { queue: NotifyQueue::new()? })
//!     })?;
//!     reactor.run()?;
//!     reactor.handlers()[0].queue.push("hello".to_string());
//!     reactor.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! # Platform
//!
//! Linux only. Requires epoll, eventfd, and timerfd.

pub mod config;
pub mod error;
pub mod poller;
pub mod promise;
pub mod queue;
pub mod reactor;
pub mod timer;

/// Runtime errors.
pub use error::Error;
/// One ready entry out of a readiness batch.
pub use poller::Event;
/// Reusable readiness batch buffer.
pub use poller::Events;
/// Readiness interest mask.
pub use poller::Notify;
/// Level vs. edge delivery.
pub use poller::PollMode;
/// An epoll instance, shareable as `Arc<Poller>`.
pub use poller::Poller;
/// Create a connected promise/resolver pair.
pub use promise::promise;
/// Consumer half of a promise pair.
pub use promise::Promise;
/// Producer half of a promise pair.
pub use promise::Resolver;
/// Reactor-integrated MPSC notification queue.
pub use queue::NotifyQueue;
/// Per-worker event handler trait.
pub use reactor::Handler;
/// Worker threads driving per-worker handlers.
pub use reactor::Reactor;
/// Reactor configuration.
pub use config::ReactorConfig;
/// One pooled timerfd.
pub use timer::TimerEntry;
/// Free list of timer entries.
pub use timer::TimerPool;

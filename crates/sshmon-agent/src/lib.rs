//! sshmon-agent library
//!
//! Core components of the SSH telemetry agent: the kernel exec tracer,
//! the auth log watcher, and the bounded delivery pipeline.

pub mod delivery;
pub mod events;
pub mod queue;
pub mod snoop;
pub mod sshlog;

pub use delivery::{DeliveryPool, HttpPoster, Poster};
pub use queue::{delivery_queue, EventReceiver, EventSender};
pub use snoop::ExecSnoop;
pub use sshlog::LogWatcher;

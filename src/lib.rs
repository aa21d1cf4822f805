//! Replicated shuffle write client for a remote shuffle service.
//!
//! A map task's writer opens one session per storage server, routes every
//! record to the servers of each replication group responsible for its
//! partition, and streams records through bounded per-server write queues.

#[macro_use]
mod utils;

pub mod client;
pub mod common;
pub mod protocol;
pub mod server;

pub use utils::{logger_init, Bitmap, RssError};

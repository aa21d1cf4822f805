//! Shuffle write client: routing, per-server connections and write queues,
//! and the replicated multi-server client driving them.

mod connection;
mod multi;
mod pool;
mod queue;
mod reader;
mod router;
mod session;

pub use connection::{ConnState, ServerConnection, SessionIdentity};
pub use multi::{ClientState, MultiServerAsyncWriteClient, WriteClientConfig};
pub use pool::{ConnectionPool, SessionPool};
pub use queue::AsyncWriteQueue;
pub use reader::read_partition;
pub use router::{select_window, PartitionRouter, Route};
pub use session::{UploadSession, UploadStatus};

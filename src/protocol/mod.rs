//! Wire protocol spoken between shuffle writers/readers and stream servers.

mod messages;

pub use messages::{PartitionId, StreamReply, StreamRequest};

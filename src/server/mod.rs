//! In-memory stream server that writers upload to and readers read from.

mod storage;
mod stream;

pub use storage::{ShuffleStore, StagedRecord};
pub use stream::{StreamServer, StreamServerConfig};

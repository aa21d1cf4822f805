//! Plain data types shared by the client, the wire protocol, and the
//! in-memory stream server.

mod types;

pub use types::{
    AppShuffleId, AppTaskAttemptId, RecordKeyValuePair, ServerDetail,
    ServerReplicationGroup, ShuffleWriteConfig, TaskAttemptId,
};

//! Stream session request and reply messages. Each message travels as one
//! length-prefixed MessagePack frame.

use crate::common::{
    AppShuffleId, AppTaskAttemptId, RecordKeyValuePair, ShuffleWriteConfig,
    TaskAttemptId,
};

use bytes::Bytes;

use serde::{Deserialize, Serialize};

/// Partition ID type.
pub type PartitionId = u32;

/// Request sent by a client over a stream session.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum StreamRequest {
    /// Session handshake; answered by `StreamReply::Welcome`. May be sent
    /// again on a session taken out of a connection pool.
    Hello {
        user: String,
        app_id: String,
        app_attempt: String,
    },

    /// Registers the upload context of one task attempt.
    StartUpload {
        attempt: AppTaskAttemptId,
        num_maps: u32,
        latest_map_id: u32,
        write_config: ShuffleWriteConfig,
    },

    /// One record of the current upload.
    Record {
        partition: PartitionId,
        key: Option<Bytes>,
        value: Option<Bytes>,
    },

    /// Ends the current upload. Answered by `StreamReply::UploadCommitted`
    /// only if `wait_ack` is set.
    FinishUpload { wait_ack: bool },

    /// Reads back one partition's records written by the given attempts.
    ReadPartition {
        app_shuffle_id: AppShuffleId,
        partition: PartitionId,
        task_attempt_ids: Vec<TaskAttemptId>,
    },

    /// Session end notification.
    Goodbye,
}

/// Reply sent back by a server over a stream session.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum StreamReply {
    /// Handshake reply carrying the server's identity.
    Welcome { server_id: String, version: String },

    /// Durability acknowledgment of a finished upload.
    UploadCommitted { num_records: u64 },

    /// Records of a `ReadPartition` request, in the order received.
    PartitionData { records: Vec<RecordKeyValuePair> },

    /// Request could not be served.
    Error { msg: String },
}

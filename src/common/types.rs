//! Identity, server, and record types.

use std::fmt;

use bytes::Bytes;

use serde::{Deserialize, Serialize};

/// Task attempt ID type.
pub type TaskAttemptId = u64;

/// Identifies one shuffle stage of one application run.
#[derive(
    Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct AppShuffleId {
    pub app_id: String,
    pub exec_id: String,
    pub shuffle_id: u32,
}

impl fmt::Display for AppShuffleId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}/{}", self.app_id, self.exec_id, self.shuffle_id)
    }
}

/// Identifies one attempt of one map task within one application run. Used
/// as the correlation key of an upload on both client and server.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Serialize, Deserialize)]
pub struct AppTaskAttemptId {
    pub app_id: String,
    pub exec_id: String,
    pub shuffle_id: u32,
    pub map_id: u32,
    pub task_attempt_id: TaskAttemptId,
}

impl AppTaskAttemptId {
    pub fn new(
        app_id: impl Into<String>,
        exec_id: impl Into<String>,
        shuffle_id: u32,
        map_id: u32,
        task_attempt_id: TaskAttemptId,
    ) -> Self {
        AppTaskAttemptId {
            app_id: app_id.into(),
            exec_id: exec_id.into(),
            shuffle_id,
            map_id,
            task_attempt_id,
        }
    }

    /// The shuffle stage this attempt writes into.
    pub fn app_shuffle_id(&self) -> AppShuffleId {
        AppShuffleId {
            app_id: self.app_id.clone(),
            exec_id: self.exec_id.clone(),
            shuffle_id: self.shuffle_id,
        }
    }
}

impl fmt::Display for AppTaskAttemptId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}.{}",
            self.app_id,
            self.exec_id,
            self.shuffle_id,
            self.map_id,
            self.task_attempt_id
        )
    }
}

/// Identity and network address of one storage server.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Serialize, Deserialize)]
pub struct ServerDetail {
    pub server_id: String,
    pub version: String,

    /// Address in `host:port` form.
    pub connection_string: String,
}

impl ServerDetail {
    pub fn new(
        server_id: impl Into<String>,
        version: impl Into<String>,
        connection_string: impl Into<String>,
    ) -> Self {
        ServerDetail {
            server_id: server_id.into(),
            version: version.into(),
            connection_string: connection_string.into(),
        }
    }
}

impl fmt::Display for ServerDetail {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.server_id, self.connection_string)
    }
}

/// Ordered servers that independently hold a copy of the same partition
/// data. Every group ends up with a complete copy of every partition.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct ServerReplicationGroup {
    pub servers: Vec<ServerDetail>,
}

impl ServerReplicationGroup {
    pub fn new(servers: Vec<ServerDetail>) -> Self {
        ServerReplicationGroup { servers }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

/// One shuffle record. An absent key or value (`None`) is distinct from an
/// empty byte string and both survive the round trip through a server.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Serialize, Deserialize)]
pub struct RecordKeyValuePair {
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub task_attempt_id: TaskAttemptId,
}

impl RecordKeyValuePair {
    pub fn new(
        key: Option<Bytes>,
        value: Option<Bytes>,
        task_attempt_id: TaskAttemptId,
    ) -> Self {
        RecordKeyValuePair {
            key,
            value,
            task_attempt_id,
        }
    }
}

/// Compression/serialization tuning of the writer. Opaque to the client
/// core; forwarded to servers as part of starting an upload.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ShuffleWriteConfig {
    /// Number of splits the server may spread one partition's file over.
    pub num_splits: u16,

    /// Name of the compression codec applied by the server, if any.
    pub compression: String,
}

impl Default for ShuffleWriteConfig {
    fn default() -> Self {
        ShuffleWriteConfig {
            num_splits: 1,
            compression: "none".into(),
        }
    }
}

#[cfg(test)]
mod types_tests {
    use super::*;

    #[test]
    fn attempt_display() {
        let attempt = AppTaskAttemptId::new("app1", "exec1", 1, 2, 0);
        assert_eq!(format!("{}", attempt), "app1/exec1/1/2.0");
        assert_eq!(
            attempt.app_shuffle_id(),
            AppShuffleId {
                app_id: "app1".into(),
                exec_id: "exec1".into(),
                shuffle_id: 1,
            }
        );
    }

    #[test]
    fn absent_differs_from_empty() {
        let absent = RecordKeyValuePair::new(None, None, 0);
        let empty =
            RecordKeyValuePair::new(Some(Bytes::new()), Some(Bytes::new()), 0);
        assert_ne!(absent, empty);
    }
}

//! Read-back of one partition from one server, used by tests and tooling.

use crate::common::{AppShuffleId, RecordKeyValuePair, TaskAttemptId};
use crate::protocol::{PartitionId, StreamReply, StreamRequest};
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_connect_with_timeout, RssError,
};

use bytes::BytesMut;

use tokio::io::AsyncWriteExt;
use tokio::time::{self, Duration};

/// Reads all records of `partition` written by the given task attempts to
/// the server at `conn_str`. The server answers once all those attempts have
/// finished uploading to it. Records come back in the order that server
/// received them.
pub async fn read_partition(
    conn_str: &str,
    app_shuffle_id: &AppShuffleId,
    partition: PartitionId,
    task_attempt_ids: &[TaskAttemptId],
    timeout: Duration,
) -> Result<Vec<RecordKeyValuePair>, RssError> {
    let mut stream = tcp_connect_with_timeout(conn_str, timeout).await?;
    let req = StreamRequest::ReadPartition {
        app_shuffle_id: app_shuffle_id.clone(),
        partition,
        task_attempt_ids: task_attempt_ids.to_vec(),
    };

    let mut read_buf = BytesMut::with_capacity(8 + 1024);
    let exchange = async {
        safe_tcp_write(&mut stream, &req).await?;
        stream.flush().await?;
        let reply: StreamReply = safe_tcp_read(&mut read_buf, &mut stream).await?;
        // best-effort goodbye; the session is dropped right after anyway
        let _ = safe_tcp_write(&mut stream, &StreamRequest::Goodbye).await;
        Ok::<_, RssError>(reply)
    };
    let reply = match time::timeout(timeout, exchange).await {
        Ok(reply) => reply?,
        Err(_) => {
            return Err(RssError::timeout(format!(
                "reading partition {} from '{}' exceeded {} ms",
                partition,
                conn_str,
                timeout.as_millis()
            )))
        }
    };

    match reply {
        StreamReply::PartitionData { records } => Ok(records),
        StreamReply::Error { msg } => Err(RssError::network(format!(
            "read of partition {} from '{}' failed: {}",
            partition, conn_str, msg
        ))),
        reply => Err(RssError::network(format!(
            "unexpected read reply from '{}': {:?}",
            conn_str, reply
        ))),
    }
}

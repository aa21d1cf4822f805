//! Single stream session to one storage server.

use std::fmt;
use std::sync::Arc;

use crate::client::ConnectionPool;
use crate::common::{AppTaskAttemptId, ServerDetail, ShuffleWriteConfig};
use crate::protocol::{PartitionId, StreamReply, StreamRequest};
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_connect_with_timeout, RssError,
};

use bytes::{Bytes, BytesMut};

use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::time::{self, Duration};

/// Size of the per-connection write buffer; records are framed into it and
/// pushed to the socket when it fills up or on flush.
const WRITE_BUF_SIZE: usize = 64 * 1024;

/// Lifecycle state of a server connection.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConnState {
    Unconnected,
    Connected,
    UploadStarted,
    UploadFinished,
    Closed,
    Failed,
}

/// Who is uploading, sent to the server on handshake.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct SessionIdentity {
    pub user: String,
    pub app_id: String,
    pub app_attempt: String,
}

/// Owns a single network session to one storage server.
pub struct ServerConnection {
    /// The server this connection talks to.
    server: ServerDetail,

    /// Identity announced on handshake.
    identity: SessionIdentity,

    /// Pool to check sessions out of and back into, if pooling is enabled.
    pool: Option<Arc<dyn ConnectionPool>>,

    /// Buffered transport; `None` before connect and after close.
    stream: Option<BufWriter<TcpStream>>,

    /// Reply read buffer for cancellation safety.
    read_buf: BytesMut,

    /// Timeout applied to graceful session teardown.
    close_timeout: Duration,

    /// Current lifecycle state.
    state: ConnState,

    /// Number of records written in the current upload.
    records_written: u64,
}

impl fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ServerConnection")
            .field("server", &self.server)
            .field("state", &self.state)
            .field("records_written", &self.records_written)
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

impl ServerConnection {
    /// Creates a new unconnected connection object.
    pub fn new(
        server: ServerDetail,
        identity: SessionIdentity,
        pool: Option<Arc<dyn ConnectionPool>>,
    ) -> Self {
        ServerConnection {
            server,
            identity,
            pool,
            stream: None,
            read_buf: BytesMut::with_capacity(8 + 1024),
            close_timeout: Duration::from_secs(5),
            state: ConnState::Unconnected,
            records_written: 0,
        }
    }

    #[inline]
    pub fn server(&self) -> &ServerDetail {
        &self.server
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Time limit for closing, set from the connect timeout.
    #[inline]
    pub(crate) fn close_timeout(&self) -> Duration {
        self.close_timeout
    }

    /// Checks that the connection is in the expected state before an
    /// operation.
    fn expect_state(
        &self,
        expected: ConnState,
        op: &str,
    ) -> Result<(), RssError> {
        if self.state != expected {
            return logged_err!(
                self.server.server_id => UploadState;
                "{} called in state {:?}, expected {:?}",
                op, self.state, expected
            );
        }
        Ok(())
    }

    /// Borrows the transport of a live connection.
    fn stream_mut(&mut self) -> Result<&mut BufWriter<TcpStream>, RssError> {
        match self.stream.as_mut() {
            Some(stream) => Ok(stream),
            None => Err(RssError::network(format!(
                "no transport to server {}",
                self.server
            ))),
        }
    }

    /// Marks the connection failed if `result` is an error.
    fn track<T>(
        &mut self,
        result: Result<T, RssError>,
    ) -> Result<T, RssError> {
        if result.is_err() {
            self.state = ConnState::Failed;
        }
        result
    }

    /// Performs the Hello/Welcome handshake on `stream` within `timeout`.
    async fn handshake(
        &mut self,
        stream: &mut BufWriter<TcpStream>,
        timeout: Duration,
    ) -> Result<(), RssError> {
        let hello = StreamRequest::Hello {
            user: self.identity.user.clone(),
            app_id: self.identity.app_id.clone(),
            app_attempt: self.identity.app_attempt.clone(),
        };
        let read_buf = &mut self.read_buf;
        let exchange = async {
            safe_tcp_write(stream, &hello).await?;
            stream.flush().await?;
            safe_tcp_read::<StreamReply, _>(read_buf, stream).await
        };
        let reply = match time::timeout(timeout, exchange).await {
            Ok(reply) => reply?,
            Err(_) => {
                return Err(RssError::timeout(format!(
                    "handshake with {} exceeded {} ms",
                    self.server,
                    timeout.as_millis()
                )))
            }
        };

        match reply {
            StreamReply::Welcome { server_id, version } => {
                if server_id != self.server.server_id {
                    return Err(RssError::network(format!(
                        "server at '{}' is '{}', expected '{}'",
                        self.server.connection_string,
                        server_id,
                        self.server.server_id
                    )));
                }
                if version != self.server.version {
                    pf_warn!(
                        self.server.server_id;
                        "server version '{}' differs from expected '{}'",
                        version, self.server.version
                    );
                }
                Ok(())
            }
            StreamReply::Error { msg } => Err(RssError::network(format!(
                "handshake rejected by {}: {}",
                self.server, msg
            ))),
            reply => Err(RssError::network(format!(
                "unexpected handshake reply from {}: {:?}",
                self.server, reply
            ))),
        }
    }

    /// Establishes the transport session within `timeout`. With pooling,
    /// idle pooled sessions are tried first.
    pub async fn connect(&mut self, timeout: Duration) -> Result<(), RssError> {
        self.expect_state(ConnState::Unconnected, "connect")?;
        self.close_timeout = timeout;

        if let Some(pool) = self.pool.clone() {
            let conn_str = self.server.connection_string.clone();
            while let Some(stream) = pool.acquire(&conn_str).await {
                let mut stream = BufWriter::with_capacity(WRITE_BUF_SIZE, stream);
                self.read_buf.clear();
                match self.handshake(&mut stream, timeout).await {
                    Ok(()) => {
                        pf_debug!(
                            self.server.server_id;
                            "reusing pooled session to '{}'",
                            conn_str
                        );
                        self.stream = Some(stream);
                        self.state = ConnState::Connected;
                        return Ok(());
                    }
                    Err(e) => {
                        pf_debug!(
                            self.server.server_id;
                            "discarding stale pooled session: {}",
                            e
                        );
                    }
                }
            }
        }

        let result = async {
            let stream = tcp_connect_with_timeout(
                &self.server.connection_string,
                timeout,
            )
            .await?;
            let mut stream = BufWriter::with_capacity(WRITE_BUF_SIZE, stream);
            self.read_buf.clear();
            self.handshake(&mut stream, timeout).await?;
            Ok::<_, RssError>(stream)
        }
        .await;

        match result {
            Ok(stream) => {
                pf_debug!(
                    self.server.server_id;
                    "connected to '{}'",
                    self.server.connection_string
                );
                self.stream = Some(stream);
                self.state = ConnState::Connected;
                Ok(())
            }
            Err(e) => {
                pf_warn!(self.server.server_id; "connect failed: {}", e);
                self.state = ConnState::Failed;
                Err(e)
            }
        }
    }

    /// Registers the upload context with the server. Buffered; errors of the
    /// underlying write surface here or on later calls.
    pub async fn start_upload(
        &mut self,
        attempt: &AppTaskAttemptId,
        num_maps: u32,
        latest_map_id: u32,
        write_config: &ShuffleWriteConfig,
    ) -> Result<(), RssError> {
        self.expect_state(ConnState::Connected, "start_upload")?;
        let req = StreamRequest::StartUpload {
            attempt: attempt.clone(),
            num_maps,
            latest_map_id,
            write_config: write_config.clone(),
        };
        let result = match self.stream_mut() {
            Ok(stream) => safe_tcp_write(stream, &req).await,
            Err(e) => Err(e),
        };
        self.track(result)?;

        self.records_written = 0;
        self.state = ConnState::UploadStarted;
        pf_debug!(self.server.server_id; "upload {} started", attempt);
        Ok(())
    }

    /// Frames and transmits one record. No per-record acknowledgment.
    pub async fn write_record(
        &mut self,
        partition: PartitionId,
        key: Option<Bytes>,
        value: Option<Bytes>,
    ) -> Result<(), RssError> {
        self.expect_state(ConnState::UploadStarted, "write_record")?;
        let req = StreamRequest::Record {
            partition,
            key,
            value,
        };
        let result = match self.stream_mut() {
            Ok(stream) => safe_tcp_write(stream, &req).await,
            Err(e) => Err(e),
        };
        self.track(result)?;

        self.records_written += 1;
        Ok(())
    }

    /// Flushes all pending writes. If `wait_ack` is set, also waits (up to
    /// `timeout`) until the server confirms it committed every record of
    /// this upload. Returns the number of records written.
    pub async fn finish_upload(
        &mut self,
        wait_ack: bool,
        timeout: Duration,
    ) -> Result<u64, RssError> {
        self.expect_state(ConnState::UploadStarted, "finish_upload")?;
        let server = self.server.to_string();
        let expected = self.records_written;

        let result = match self.stream.as_mut() {
            None => Err(RssError::network("no transport")),
            Some(stream) => {
                let finish =
                    send_finish(stream, &mut self.read_buf, wait_ack, expected);
                match time::timeout(timeout, finish).await {
                    Ok(result) => result,
                    Err(_) => Err(RssError::timeout(format!(
                        "finishing upload on {} exceeded {} ms",
                        server,
                        timeout.as_millis()
                    ))),
                }
            }
        };
        let result = result.map_err(|e| match e {
            RssError::Network(msg) => {
                RssError::network(format!("{}: {}", server, msg))
            }
            e => e,
        });
        self.track(result)?;

        self.state = ConnState::UploadFinished;
        pf_debug!(
            self.server.server_id;
            "upload finished with {} records (ack {})",
            expected, wait_ack
        );
        Ok(expected)
    }

    /// Releases the transport. Safe to call multiple times and in any
    /// state. A session that finished its upload cleanly goes back to the
    /// pool if pooling is enabled; otherwise it is shut down.
    pub async fn close(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        let reusable = matches!(
            self.state,
            ConnState::Connected | ConnState::UploadFinished
        );
        self.state = ConnState::Closed;

        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => return,
        };
        if !reusable {
            // mid-upload or failed; dropping resets the session
            return;
        }

        if let Some(pool) = self.pool.clone() {
            if time::timeout(self.close_timeout, stream.flush())
                .await
                .map_or(false, |r| r.is_ok())
                && stream.buffer().is_empty()
            {
                pool.release(&self.server.connection_string, stream.into_inner())
                    .await;
                pf_debug!(self.server.server_id; "session returned to pool");
            }
            return;
        }

        let goodbye = async {
            safe_tcp_write(&mut stream, &StreamRequest::Goodbye).await?;
            stream.flush().await?;
            stream.get_mut().shutdown().await?;
            Ok::<_, RssError>(())
        };
        match time::timeout(self.close_timeout, goodbye).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                pf_debug!(self.server.server_id; "error on close: {}", e)
            }
            Err(_) => pf_debug!(self.server.server_id; "close timed out"),
        }
    }
}

/// Sends the finish request and, if `wait_ack` is set, checks the server's
/// commit acknowledgment against the number of records written.
async fn send_finish(
    stream: &mut BufWriter<TcpStream>,
    read_buf: &mut BytesMut,
    wait_ack: bool,
    expected: u64,
) -> Result<(), RssError> {
    safe_tcp_write(stream, &StreamRequest::FinishUpload { wait_ack }).await?;
    stream.flush().await?;
    if !wait_ack {
        return Ok(());
    }

    match safe_tcp_read::<StreamReply, _>(read_buf, stream).await? {
        StreamReply::UploadCommitted { num_records } if num_records == expected => {
            Ok(())
        }
        StreamReply::UploadCommitted { num_records } => Err(RssError::network(
            format!("committed {} records, {} written", num_records, expected),
        )),
        StreamReply::Error { msg } => {
            Err(RssError::network(format!("upload rejected: {}", msg)))
        }
        reply => Err(RssError::network(format!(
            "unexpected finish reply {:?}",
            reply
        ))),
    }
}

//! Stream server accepting writer and reader sessions over TCP.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::common::{AppTaskAttemptId, ServerDetail};
use crate::protocol::{StreamReply, StreamRequest};
use crate::server::{ShuffleStore, StagedRecord};
use crate::utils::{safe_tcp_read, safe_tcp_write, tcp_bind, RssError};

use bytes::BytesMut;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Duration;

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamServerConfig {
    /// Identity announced to clients on handshake.
    pub server_id: String,

    /// Version announced to clients on handshake.
    pub version: String,

    /// How long a read waits for the requested attempts to commit, in
    /// millisecs.
    pub read_wait_timeout_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for StreamServerConfig {
    fn default() -> Self {
        StreamServerConfig {
            server_id: "server0".into(),
            version: "1".into(),
            read_wait_timeout_ms: 30_000,
        }
    }
}

impl StreamServerConfig {
    /// Composes a config from defaults overwritten by fields of the given
    /// TOML string, if any.
    pub fn from_toml(config_str: Option<&str>) -> Result<Self, RssError> {
        let config = parsed_config!(config_str => StreamServerConfig;
                                    server_id, version, read_wait_timeout_ms)?;
        if config.server_id.is_empty() {
            return logged_err!("config"; "invalid config.server_id ''");
        }
        Ok(config)
    }
}

/// Upload in progress on one session.
#[derive(Debug)]
struct OpenUpload {
    attempt: AppTaskAttemptId,
    staged: Vec<StagedRecord>,
}

/// In-memory storage server. Each session stages its upload's records and
/// commits them atomically on finish.
pub struct StreamServer {
    config: StreamServerConfig,

    /// Actual bound address.
    local_addr: SocketAddr,

    /// Committed data, shared with all session servants.
    store: Arc<ShuffleStore>,

    /// Join handle of the session acceptor thread.
    acceptor_handle: Option<JoinHandle<()>>,
}

impl StreamServer {
    /// Binds to `bind_addr` (port 0 picks a free one) and starts accepting
    /// sessions in the background.
    pub async fn start(
        bind_addr: SocketAddr,
        config: StreamServerConfig,
    ) -> Result<Self, RssError> {
        let listener = tcp_bind(bind_addr)?;
        let local_addr = listener.local_addr()?;
        let store = Arc::new(ShuffleStore::new());

        let acceptor_handle = tokio::spawn(Self::session_acceptor_thread(
            config.clone(),
            listener,
            store.clone(),
        ));
        pf_info!(config.server_id; "serving sessions on '{}'", local_addr);

        Ok(StreamServer {
            config,
            local_addr,
            store,
            acceptor_handle: Some(acceptor_handle),
        })
    }

    /// Address clients should connect to, in `host:port` form.
    pub fn connection_string(&self) -> String {
        self.local_addr.to_string()
    }

    /// Identity of this server as clients should be configured with.
    pub fn server_detail(&self) -> ServerDetail {
        ServerDetail::new(
            &self.config.server_id,
            &self.config.version,
            self.connection_string(),
        )
    }

    #[inline]
    pub fn store(&self) -> &Arc<ShuffleStore> {
        &self.store
    }

    /// Stops accepting and tears down all open sessions. Committed data
    /// stays readable through `store()`.
    pub async fn shutdown(&mut self) {
        if let Some(handle) = self.acceptor_handle.take() {
            handle.abort();
            let _ = handle.await;
            pf_info!(self.config.server_id; "server shut down");
        }
    }

    /// Session acceptor thread function.
    async fn session_acceptor_thread(
        config: StreamServerConfig,
        listener: TcpListener,
        store: Arc<ShuffleStore>,
    ) {
        let me = config.server_id.clone();
        pf_debug!(me; "session_acceptor thread spawned");
        // aborted together with this thread on shutdown
        let mut servants = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            pf_debug!(me; "accepted session from {}", addr);
                            servants.spawn(Self::session_servant_thread(
                                config.clone(),
                                stream,
                                addr,
                                store.clone(),
                            ));
                        }
                        Err(e) => {
                            pf_warn!(me; "error accepting session: {}", e);
                        }
                    }
                },

                // reap finished servants
                Some(_) = servants.join_next(), if !servants.is_empty() => {},
            }
        }
    }

    /// Serves one request; returns `Ok(false)` if the session should end.
    async fn serve_request(
        config: &StreamServerConfig,
        stream: &mut TcpStream,
        store: &ShuffleStore,
        upload: &mut Option<OpenUpload>,
        req: StreamRequest,
    ) -> Result<bool, RssError> {
        let me = &config.server_id;
        match req {
            StreamRequest::Hello { user, app_id, .. } => {
                if upload.take().is_some() {
                    pf_warn!(me; "upload abandoned by new handshake");
                }
                pf_debug!(me; "hello from user '{}' app '{}'", user, app_id);
                let reply = StreamReply::Welcome {
                    server_id: config.server_id.clone(),
                    version: config.version.clone(),
                };
                safe_tcp_write(stream, &reply).await?;
            }

            StreamRequest::StartUpload { attempt, .. } => {
                if let Some(prev) = upload.take() {
                    pf_warn!(me; "upload {} abandoned unfinished", prev.attempt);
                }
                pf_debug!(me; "upload {} started", attempt);
                *upload = Some(OpenUpload {
                    attempt,
                    staged: vec![],
                });
            }

            StreamRequest::Record {
                partition,
                key,
                value,
            } => match upload.as_mut() {
                Some(open) => open.staged.push(StagedRecord {
                    partition,
                    key,
                    value,
                }),
                None => {
                    pf_error!(me; "record received outside of an upload");
                    return Ok(false);
                }
            },

            StreamRequest::FinishUpload { wait_ack } => {
                let open = match upload.take() {
                    Some(open) => open,
                    None => {
                        pf_error!(me; "finish received outside of an upload");
                        if wait_ack {
                            let reply = StreamReply::Error {
                                msg: "no upload in progress".into(),
                            };
                            safe_tcp_write(stream, &reply).await?;
                        }
                        return Ok(wait_ack);
                    }
                };
                let num_records = store.commit(&open.attempt, open.staged).await;
                pf_debug!(
                    me;
                    "upload {} committed {} records",
                    open.attempt, num_records
                );
                if wait_ack {
                    let reply = StreamReply::UploadCommitted { num_records };
                    safe_tcp_write(stream, &reply).await?;
                }
            }

            StreamRequest::ReadPartition {
                app_shuffle_id,
                partition,
                task_attempt_ids,
            } => {
                let wait = Duration::from_millis(config.read_wait_timeout_ms);
                let reply = match store
                    .read_partition(
                        &app_shuffle_id,
                        partition,
                        &task_attempt_ids,
                        wait,
                    )
                    .await
                {
                    Ok(records) => StreamReply::PartitionData { records },
                    Err(e) => StreamReply::Error { msg: e.to_string() },
                };
                safe_tcp_write(stream, &reply).await?;
            }

            StreamRequest::Goodbye => return Ok(false),
        }
        Ok(true)
    }

    /// Session servant thread function.
    async fn session_servant_thread(
        config: StreamServerConfig,
        mut stream: TcpStream,
        addr: SocketAddr,
        store: Arc<ShuffleStore>,
    ) {
        let me = config.server_id.clone();
        pf_debug!(me; "session_servant thread for {} spawned", addr);
        let mut read_buf = BytesMut::with_capacity(8 + 1024);
        let mut upload: Option<OpenUpload> = None;

        loop {
            let req = match safe_tcp_read(&mut read_buf, &mut stream).await {
                Ok(req) => req,
                Err(e) => {
                    // most often the peer left without a goodbye
                    pf_debug!(me; "session {} ended: {}", addr, e);
                    break;
                }
            };
            match Self::serve_request(&config, &mut stream, &store, &mut upload, req)
                .await
            {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    pf_warn!(me; "error serving session {}: {}", addr, e);
                    break;
                }
            }
        }

        if let Some(open) = upload {
            pf_warn!(
                me;
                "session {} dropped upload {} with {} staged records",
                addr, open.attempt, open.staged.len()
            );
        }
        pf_debug!(me; "session_servant thread for {} exitted", addr);
    }
}

#[cfg(test)]
mod stream_tests {
    use super::*;
    use crate::common::ShuffleWriteConfig;
    use crate::utils::tcp_connect_with_timeout;
    use bytes::Bytes;

    async fn request(
        stream: &mut TcpStream,
        read_buf: &mut BytesMut,
        req: StreamRequest,
    ) -> Result<StreamReply, RssError> {
        safe_tcp_write(stream, &req).await?;
        safe_tcp_read(read_buf, stream).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn server_config_parse() -> Result<(), RssError> {
        let config = StreamServerConfig::from_toml(Some(
            "server_id = 'rss1'\nread_wait_timeout_ms = 10",
        ))?;
        assert_eq!(config.server_id, "rss1");
        assert_eq!(config.version, "1");
        assert_eq!(config.read_wait_timeout_ms, 10);
        assert!(StreamServerConfig::from_toml(Some("server_id = ''")).is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn server_upload_session() -> Result<(), RssError> {
        let config = StreamServerConfig {
            server_id: "rss1".into(),
            ..Default::default()
        };
        let mut server = StreamServer::start("127.0.0.1:0".parse()?, config).await?;
        assert_eq!(server.server_detail().server_id, "rss1");

        let timeout = Duration::from_secs(5);
        let mut stream =
            tcp_connect_with_timeout(&server.connection_string(), timeout).await?;
        let mut read_buf = BytesMut::new();
        let hello = StreamRequest::Hello {
            user: "u".into(),
            app_id: "app1".into(),
            app_attempt: "exec1".into(),
        };
        assert_eq!(
            request(&mut stream, &mut read_buf, hello).await?,
            StreamReply::Welcome {
                server_id: "rss1".into(),
                version: "1".into()
            }
        );

        let attempt = AppTaskAttemptId::new("app1", "exec1", 1, 2, 3);
        safe_tcp_write(
            &mut stream,
            &StreamRequest::StartUpload {
                attempt: attempt.clone(),
                num_maps: 1,
                latest_map_id: 2,
                write_config: ShuffleWriteConfig::default(),
            },
        )
        .await?;
        for v in [&b"x"[..], &b""[..]] {
            safe_tcp_write(
                &mut stream,
                &StreamRequest::Record {
                    partition: 1,
                    key: Some(Bytes::copy_from_slice(v)),
                    value: None,
                },
            )
            .await?;
        }
        // not visible before commit
        assert!(!server.store().is_committed(&attempt.app_shuffle_id(), &[3]).await);
        assert_eq!(
            request(
                &mut stream,
                &mut read_buf,
                StreamRequest::FinishUpload { wait_ack: true }
            )
            .await?,
            StreamReply::UploadCommitted { num_records: 2 }
        );

        let reply = request(
            &mut stream,
            &mut read_buf,
            StreamRequest::ReadPartition {
                app_shuffle_id: attempt.app_shuffle_id(),
                partition: 1,
                task_attempt_ids: vec![3],
            },
        )
        .await?;
        assert_eq!(
            reply,
            StreamReply::PartitionData {
                records: vec![
                    crate::common::RecordKeyValuePair::new(
                        Some(Bytes::from_static(b"x")),
                        None,
                        3
                    ),
                    crate::common::RecordKeyValuePair::new(
                        Some(Bytes::new()),
                        None,
                        3
                    ),
                ]
            }
        );

        safe_tcp_write(&mut stream, &StreamRequest::Goodbye).await?;
        server.shutdown().await;
        server.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn server_finish_without_upload() -> Result<(), RssError> {
        let mut server = StreamServer::start(
            "127.0.0.1:0".parse()?,
            StreamServerConfig::default(),
        )
        .await?;
        let mut stream = tcp_connect_with_timeout(
            &server.connection_string(),
            Duration::from_secs(5),
        )
        .await?;
        let mut read_buf = BytesMut::new();
        let reply = request(
            &mut stream,
            &mut read_buf,
            StreamRequest::FinishUpload { wait_ack: true },
        )
        .await?;
        assert!(matches!(reply, StreamReply::Error { .. }));

        // a stray record ends the session
        safe_tcp_write(
            &mut stream,
            &StreamRequest::Record {
                partition: 0,
                key: None,
                value: None,
            },
        )
        .await?;
        let closed: Result<StreamReply, _> =
            safe_tcp_read(&mut read_buf, &mut stream).await;
        assert!(closed.unwrap_err().is_network());
        server.shutdown().await;
        Ok(())
    }
}

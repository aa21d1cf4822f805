//! Multi-server replicated async write client.
//!
//! Owns one `AsyncWriteQueue` (wrapping one `ServerConnection`) per distinct
//! server of all replication groups, and drives them through the sequence
//! `connect -> start_upload -> send_record* -> finish_upload -> close`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::client::{
    AsyncWriteQueue, ConnectionPool, PartitionRouter, Route, ServerConnection,
    SessionIdentity, SessionPool, UploadSession,
};
use crate::common::{
    AppTaskAttemptId, ServerDetail, ServerReplicationGroup, ShuffleWriteConfig,
};
use crate::protocol::PartitionId;
use crate::utils::{Bitmap, RssError};

use bytes::Bytes;

use futures::future;
use futures::stream::{self, StreamExt};

use tokio::time::Duration;

/// Logging prefix of the client.
const ME: &str = "writer";

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteClientConfig {
    /// Per replication group, how many of its servers receive each
    /// partition. `None` means all of them.
    pub max_servers_per_partition: Option<usize>,

    /// Timeout of connecting plus handshaking with one server in millisecs.
    pub connect_timeout_ms: u64,

    /// Timeout of finishing an upload on one server (including waiting for
    /// its acknowledgment) in millisecs.
    pub finish_timeout_ms: u64,

    /// Whether to wait for every server to acknowledge durability when
    /// finishing an upload.
    pub finish_upload_ack: bool,

    /// Whether to check sessions out of the shared connection pool.
    pub use_pooled_connection: bool,

    /// Capacity of each per-connection write queue.
    pub write_queue_size: usize,

    /// Maximum number of servers connected to concurrently.
    pub num_write_threads: usize,

    /// User identity announced to servers.
    pub user: String,

    /// Application identity announced to servers.
    pub app_id: String,
    pub app_attempt: String,

    /// Writer tuning forwarded to servers; opaque to the client.
    pub write_config: ShuffleWriteConfig,
}

#[allow(clippy::derivable_impls)]
impl Default for WriteClientConfig {
    fn default() -> Self {
        WriteClientConfig {
            max_servers_per_partition: None,
            connect_timeout_ms: 30_000,
            finish_timeout_ms: 30_000,
            finish_upload_ack: true,
            use_pooled_connection: false,
            write_queue_size: 1000,
            num_write_threads: 2,
            user: String::new(),
            app_id: String::new(),
            app_attempt: String::new(),
            write_config: ShuffleWriteConfig::default(),
        }
    }
}

impl WriteClientConfig {
    /// Composes a config from defaults overwritten by fields of the given
    /// TOML string, if any.
    pub fn from_toml(config_str: Option<&str>) -> Result<Self, RssError> {
        parsed_config!(config_str => WriteClientConfig;
                       max_servers_per_partition,
                       connect_timeout_ms, finish_timeout_ms,
                       finish_upload_ack, use_pooled_connection,
                       write_queue_size, num_write_threads,
                       user, app_id, app_attempt, write_config)
    }

    fn validate(&self) -> Result<(), RssError> {
        if self.write_queue_size == 0 {
            return logged_err!(ME => UploadState; "invalid write_queue_size 0");
        }
        if self.num_write_threads == 0 {
            return logged_err!(ME => UploadState; "invalid num_write_threads 0");
        }
        if self.max_servers_per_partition == Some(0) {
            return logged_err!(
                ME => UploadState;
                "invalid max_servers_per_partition 0"
            );
        }
        if self.connect_timeout_ms == 0 || self.finish_timeout_ms == 0 {
            return logged_err!(ME => UploadState; "timeouts must be positive");
        }
        Ok(())
    }
}

/// Client lifecycle state.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ClientState {
    Created,
    Connected,
    Uploading,
    Finished,
    Closed,
}

/// Writes partitioned records to every replication group concurrently.
pub struct MultiServerAsyncWriteClient {
    config: WriteClientConfig,

    /// Distinct servers across all groups, indexed by connection index.
    servers: Vec<ServerDetail>,

    /// Partition -> connection indices mapping.
    router: PartitionRouter,

    /// Routes already resolved in this session.
    routes: HashMap<PartitionId, Route>,

    /// Pool handed to connections when pooling is enabled.
    pool: Option<Arc<dyn ConnectionPool>>,

    /// One write queue per server, same indices as `servers`.
    queues: Vec<AsyncWriteQueue>,

    /// Queues observed failed while sending records.
    failed: Bitmap,

    /// Current upload, from `start_upload()` on.
    session: Option<UploadSession>,

    state: ClientState,
}

impl MultiServerAsyncWriteClient {
    /// Creates a new client over the given replication groups. Servers that
    /// appear in several groups (same connection string) get one connection.
    pub fn new(
        groups: Vec<ServerReplicationGroup>,
        config: WriteClientConfig,
    ) -> Result<Self, RssError> {
        config.validate()?;

        let mut servers: Vec<ServerDetail> = vec![];
        let mut index_of: HashMap<String, usize> = HashMap::new();
        let mut group_indices = Vec::with_capacity(groups.len());
        for group in &groups {
            let mut members = Vec::with_capacity(group.len());
            for server in &group.servers {
                let idx = match index_of.get(&server.connection_string) {
                    Some(&idx) => {
                        if servers[idx].server_id != server.server_id {
                            return logged_err!(
                                ME => UploadState;
                                "address '{}' given for both '{}' and '{}'",
                                server.connection_string,
                                servers[idx].server_id,
                                server.server_id
                            );
                        }
                        idx
                    }
                    None => {
                        servers.push(server.clone());
                        index_of.insert(
                            server.connection_string.clone(),
                            servers.len() - 1,
                        );
                        servers.len() - 1
                    }
                };
                if !members.contains(&idx) {
                    members.push(idx);
                }
            }
            group_indices.push(members);
        }

        let router = PartitionRouter::new(
            group_indices,
            servers.len(),
            config.max_servers_per_partition,
        )?;
        let pool: Option<Arc<dyn ConnectionPool>> = if config.use_pooled_connection
        {
            Some(SessionPool::global())
        } else {
            None
        };
        let num_servers = servers.len();

        Ok(MultiServerAsyncWriteClient {
            config,
            servers,
            router,
            routes: HashMap::new(),
            pool,
            queues: vec![],
            failed: Bitmap::new(num_servers, false),
            session: None,
            state: ClientState::Created,
        })
    }

    /// Creates a new client with config parsed from a TOML string.
    pub fn new_from_config_str(
        groups: Vec<ServerReplicationGroup>,
        config_str: Option<&str>,
    ) -> Result<Self, RssError> {
        Self::new(groups, WriteClientConfig::from_toml(config_str)?)
    }

    /// Uses the given pool instead of the process-wide one. Has effect only
    /// if pooling is enabled and before `connect()`.
    pub fn with_pool(mut self, pool: Arc<dyn ConnectionPool>) -> Self {
        if self.config.use_pooled_connection {
            self.pool = Some(pool);
        }
        self
    }

    #[inline]
    pub fn state(&self) -> ClientState {
        self.state
    }

    #[inline]
    pub fn config(&self) -> &WriteClientConfig {
        &self.config
    }

    /// Distinct servers this client talks to.
    #[inline]
    pub fn servers(&self) -> &[ServerDetail] {
        &self.servers
    }

    /// Number of live server connections.
    #[inline]
    pub fn num_connections(&self) -> usize {
        self.queues.len()
    }

    /// The current upload session, if started.
    #[inline]
    pub fn session(&self) -> Option<&UploadSession> {
        self.session.as_ref()
    }

    /// Servers that must receive records of `partition`.
    pub fn servers_for(&self, partition: PartitionId) -> Vec<&ServerDetail> {
        self.router
            .servers_for(partition)
            .into_iter()
            .map(|idx| &self.servers[idx])
            .collect()
    }

    fn expect_state(
        &self,
        expected: ClientState,
        op: &str,
    ) -> Result<(), RssError> {
        if self.state != expected {
            return logged_err!(
                ME => UploadState;
                "{} called in state {:?}, expected {:?}",
                op, self.state, expected
            );
        }
        Ok(())
    }

    /// Connects to every distinct server, at most `num_write_threads` at a
    /// time. Either all connections succeed or none is kept.
    pub async fn connect(&mut self) -> Result<(), RssError> {
        self.expect_state(ClientState::Created, "connect")?;
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let identity = SessionIdentity {
            user: self.config.user.clone(),
            app_id: self.config.app_id.clone(),
            app_attempt: self.config.app_attempt.clone(),
        };

        let attempts = self.servers.iter().cloned().enumerate().map(|(idx, server)| {
            let mut conn =
                ServerConnection::new(server, identity.clone(), self.pool.clone());
            async move {
                let result = conn.connect(timeout).await;
                (idx, conn, result)
            }
        });
        let mut settled: Vec<_> = stream::iter(attempts)
            .buffer_unordered(self.config.num_write_threads)
            .collect()
            .await;
        settled.sort_by_key(|(idx, _, _)| *idx);

        let mut conns = Vec::with_capacity(settled.len());
        let mut errors = vec![];
        for (_, conn, result) in settled {
            if let Err(e) = result {
                errors.push(e);
            }
            conns.push(conn);
        }

        if let Some(e) = RssError::aggregate(errors) {
            pf_error!(ME; "connect failed: {}", e);
            future::join_all(conns.iter_mut().map(|c| c.close())).await;
            return Err(e);
        }

        let capacity = self.config.write_queue_size;
        self.queues = conns
            .into_iter()
            .map(|conn| AsyncWriteQueue::new(conn, capacity))
            .collect::<Result<Vec<_>, _>>()?;
        self.state = ClientState::Connected;
        pf_info!(ME; "connected to {} servers", self.queues.len());
        Ok(())
    }

    /// Starts the upload of `attempt` on every connection.
    pub async fn start_upload(
        &mut self,
        attempt: &AppTaskAttemptId,
        num_maps: u32,
        latest_map_id: u32,
    ) -> Result<(), RssError> {
        self.expect_state(ClientState::Connected, "start_upload")?;
        let write_config = &self.config.write_config;

        let results = future::join_all(self.queues.iter_mut().map(|q| {
            q.start_upload(attempt, num_maps, latest_map_id, write_config)
        }))
        .await;

        let mut session = UploadSession::new(attempt.clone(), num_maps, latest_map_id);
        let errors: Vec<RssError> =
            results.into_iter().filter_map(|r| r.err()).collect();
        if let Some(e) = RssError::aggregate(errors) {
            pf_error!(ME; "start_upload {} failed: {}", attempt, e);
            session.mark_failed();
            self.session = Some(session);
            self.state = ClientState::Finished;
            return Err(e);
        }

        self.session = Some(session);
        self.routes.clear();
        self.state = ClientState::Uploading;
        pf_info!(
            ME;
            "upload {} started on {} servers (maps {}, latest map {})",
            attempt, self.queues.len(), num_maps, latest_map_id
        );
        Ok(())
    }

    /// Sends one record to every server that must hold `partition`. Waits
    /// only if a target queue is full. `None` key/value are preserved as
    /// absent, distinct from empty.
    pub async fn send_record(
        &mut self,
        partition: PartitionId,
        key: Option<Bytes>,
        value: Option<Bytes>,
    ) -> Result<(), RssError> {
        self.expect_state(ClientState::Uploading, "send_record")?;
        let route = self
            .routes
            .entry(partition)
            .or_insert_with(|| self.router.route(partition));

        for idx in route.targets.ones() {
            if self.failed.get(idx) {
                continue;
            }
            let queue = &mut self.queues[idx];
            if let Err(e) = queue.enqueue(partition, key.clone(), value.clone()).await
            {
                pf_warn!(ME; "replica {} stopped accepting records: {}", queue.server(), e);
                // indices validated at construction
                let _ = self.failed.set(idx, true);
            }
        }

        if self.failed.count() > 0 {
            // a group whose every target failed can no longer hold a
            // complete copy of this partition
            for targets in &route.group_targets {
                if targets.iter().all(|&idx| self.failed.get(idx)) {
                    let errors = targets
                        .iter()
                        .filter_map(|&idx| self.queues[idx].failure().cloned())
                        .collect();
                    return Err(RssError::aggregate(errors).unwrap_or_else(|| {
                        RssError::server_write("group", "all replicas failed")
                    }));
                }
            }
        }

        if let Some(session) = self.session.as_mut() {
            session.record(partition);
        }
        Ok(())
    }

    /// Drains and finishes every queue concurrently. A failing server does
    /// not stop the others from finishing; the combined failure is returned
    /// after all have settled.
    pub async fn finish_upload(&mut self) -> Result<(), RssError> {
        self.expect_state(ClientState::Uploading, "finish_upload")?;
        let wait_ack = self.config.finish_upload_ack;
        let timeout = Duration::from_millis(self.config.finish_timeout_ms);

        let results = future::join_all(
            self.queues
                .iter_mut()
                .map(|q| q.drain_and_finish(wait_ack, timeout)),
        )
        .await;
        self.state = ClientState::Finished;

        let mut errors = vec![];
        for (queue, result) in self.queues.iter().zip(results) {
            match result {
                Ok(written) => {
                    pf_debug!(ME; "server {} took {} records", queue.server(), written)
                }
                Err(e) => errors.push(e),
            }
        }

        let session = self.session.as_mut();
        match RssError::aggregate(errors) {
            None => {
                if let Some(session) = session {
                    session.mark_finished();
                    pf_info!(
                        ME;
                        "upload {} (maps {}, latest map {}) finished with {} \
                         records over {} partitions",
                        session.attempt(),
                        session.num_maps(),
                        session.latest_map_id(),
                        session.total_records(),
                        session.partitions_written().len()
                    );
                }
                Ok(())
            }
            Some(e) => {
                if let Some(session) = session {
                    session.mark_failed();
                }
                pf_error!(ME; "finish_upload failed: {}", e);
                Err(e)
            }
        }
    }

    /// Closes all connections. Safe to call multiple times and from any
    /// state; never fails. Failures not yet reported are logged.
    pub async fn close(&mut self) {
        if self.state == ClientState::Closed {
            return;
        }
        if self.state == ClientState::Uploading {
            pf_warn!(ME; "closing with an unfinished upload");
        }

        future::join_all(self.queues.iter_mut().map(|q| q.close())).await;
        for queue in &self.queues {
            if let Some(e) = queue.failure() {
                pf_warn!(ME; "server {} had failed: {}", queue.server(), e);
            }
        }
        self.state = ClientState::Closed;
        pf_debug!(ME; "closed {} connections", self.queues.len());
    }
}

impl Drop for MultiServerAsyncWriteClient {
    fn drop(&mut self) {
        // dropping the queues still releases every transport, just without
        // a graceful goodbye
        if self.state != ClientState::Closed && !self.queues.is_empty() {
            pf_warn!(ME; "client dropped without close()");
        }
    }
}

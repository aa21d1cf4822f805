//! Bounded per-connection write queue drained by one dedicated worker.

use crate::client::{ConnState, ServerConnection};
use crate::common::{AppTaskAttemptId, ShuffleWriteConfig};
use crate::protocol::PartitionId;
use crate::utils::RssError;

use bytes::Bytes;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};

/// One record waiting in the queue.
#[derive(Debug, Clone)]
struct QueuedRecord {
    partition: PartitionId,
    key: Option<Bytes>,
    value: Option<Bytes>,
}

/// What the write worker hands back when it exits.
#[derive(Debug)]
struct WorkerOutcome {
    conn: ServerConnection,
    written: u64,
    error: Option<RssError>,
}

/// Decouples record producers from a connection's network writes. Holds the
/// connection itself while no worker runs; the worker owns it in between
/// `start_upload()` and `drain_and_finish()`.
#[derive(Debug)]
pub struct AsyncWriteQueue {
    /// Server identity, for logging and error attribution.
    server: String,

    /// Queue capacity.
    capacity: usize,

    /// The connection, when not lent to the worker.
    conn: Option<ServerConnection>,

    /// Sender side of the record channel; `None` once no more records are
    /// accepted.
    tx_record: Option<mpsc::Sender<QueuedRecord>>,

    /// Join handle of the write worker thread.
    worker_handle: Option<JoinHandle<WorkerOutcome>>,

    /// Failure observed by the worker, kept for later calls.
    failure: Option<RssError>,

    /// Number of records accepted by `enqueue()`.
    enqueued: u64,

    /// Time limit for draining the worker on `close()`.
    close_timeout: Duration,
}

impl AsyncWriteQueue {
    /// Wraps a connected server connection. `capacity` must be at least 1.
    pub fn new(
        conn: ServerConnection,
        capacity: usize,
    ) -> Result<Self, RssError> {
        let server = conn.server().server_id.clone();
        let close_timeout = conn.close_timeout();
        if capacity == 0 {
            return logged_err!(
                server => UploadState;
                "invalid write queue capacity {}",
                capacity
            );
        }

        Ok(AsyncWriteQueue {
            server,
            capacity,
            conn: Some(conn),
            tx_record: None,
            worker_handle: None,
            failure: None,
            enqueued: 0,
            close_timeout,
        })
    }

    #[inline]
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Failure recorded by the worker, if any has been observed.
    #[inline]
    pub fn failure(&self) -> Option<&RssError> {
        self.failure.as_ref()
    }

    #[inline]
    pub fn enqueued(&self) -> u64 {
        self.enqueued
    }

    /// Starts the upload on the connection, then spawns the write worker
    /// that will drain this queue into it.
    pub async fn start_upload(
        &mut self,
        attempt: &AppTaskAttemptId,
        num_maps: u32,
        latest_map_id: u32,
        write_config: &ShuffleWriteConfig,
    ) -> Result<(), RssError> {
        if self.worker_handle.is_some() {
            return logged_err!(self.server => UploadState; "upload already started");
        }
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                return logged_err!(self.server => UploadState; "connection lost")
            }
        };
        if let Err(e) = conn
            .start_upload(attempt, num_maps, latest_map_id, write_config)
            .await
        {
            self.conn = Some(conn);
            self.failure = Some(RssError::server_write(&self.server, &e));
            return Err(e);
        }

        let (tx_record, rx_record) = mpsc::channel(self.capacity);
        self.tx_record = Some(tx_record);
        self.worker_handle = Some(tokio::spawn(Self::write_worker_thread(
            self.server.clone(),
            conn,
            rx_record,
        )));
        self.enqueued = 0;
        Ok(())
    }

    /// Enqueues one record. Waits while the queue is full. Fails if the
    /// upload has not started, has been finished, or the worker terminated
    /// due to a prior write failure.
    pub async fn enqueue(
        &mut self,
        partition: PartitionId,
        key: Option<Bytes>,
        value: Option<Bytes>,
    ) -> Result<(), RssError> {
        if let Some(e) = &self.failure {
            return Err(e.clone());
        }
        let tx_record = match &self.tx_record {
            Some(tx) => tx,
            None => {
                return logged_err!(
                    self.server => UploadState;
                    "enqueue called while no upload is in progress"
                )
            }
        };

        let record = QueuedRecord {
            partition,
            key,
            value,
        };
        if tx_record.send(record).await.is_err() {
            // receiver closed: the worker hit a write failure
            let e = RssError::server_write(
                &self.server,
                "write worker terminated after a failure",
            );
            self.failure = Some(e.clone());
            return Err(e);
        }
        self.enqueued += 1;
        Ok(())
    }

    /// Stops accepting records and waits up to `timeout` for the worker to
    /// exit, taking the connection back. Records the worker's failure, if
    /// any. On expiry the worker is aborted and the connection is lost.
    async fn join_worker(&mut self, timeout: Duration) -> Option<u64> {
        self.tx_record = None; // closes the channel once drained
        let mut handle = self.worker_handle.take()?;

        let joined = match time::timeout(timeout, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                handle.abort();
                let _ = handle.await;
                let e = RssError::timeout(format!(
                    "draining write queue of {} exceeded {} ms",
                    self.server,
                    timeout.as_millis()
                ));
                pf_error!(self.server; "{}", e);
                self.failure = Some(e);
                return None;
            }
        };
        match joined {
            Ok(outcome) => {
                self.conn = Some(outcome.conn);
                if let Some(e) = outcome.error {
                    self.failure = Some(RssError::server_write(&self.server, &e));
                }
                Some(outcome.written)
            }
            Err(e) => {
                // connection was dropped together with the worker
                pf_error!(self.server; "write worker join error: {}", e);
                self.failure = Some(RssError::server_write(&self.server, &e));
                None
            }
        }
    }

    /// Signals that no more records will be enqueued, waits for the worker
    /// to write everything already queued, then finishes the upload on the
    /// connection. Returns the number of records written.
    pub async fn drain_and_finish(
        &mut self,
        wait_ack: bool,
        timeout: Duration,
    ) -> Result<u64, RssError> {
        if self.worker_handle.is_none() && self.failure.is_none() {
            return logged_err!(
                self.server => UploadState;
                "drain_and_finish called while no upload is in progress"
            );
        }
        let deadline = Instant::now() + timeout;
        self.join_worker(timeout).await;
        if let Some(e) = &self.failure {
            return Err(e.clone());
        }

        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => {
                let e = RssError::server_write(&self.server, "connection lost");
                self.failure = Some(e.clone());
                return Err(e);
            }
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        match conn.finish_upload(wait_ack, remaining).await {
            Ok(written) => Ok(written),
            Err(e) => {
                // timeouts and network errors stay distinguishable
                let e = if e.is_network() {
                    e
                } else {
                    RssError::server_write(&self.server, &e)
                };
                self.failure = Some(e.clone());
                Err(e)
            }
        }
    }

    /// Stops accepting records, lets the worker drain what is queued
    /// best-effort within the close timeout, then closes the connection.
    /// Safe to call repeatedly.
    pub async fn close(&mut self) {
        if let Some(written) = self.join_worker(self.close_timeout).await {
            pf_debug!(self.server; "worker drained {} records on close", written);
        }
        if let Some(conn) = self.conn.as_mut() {
            conn.close().await;
        }
    }

    /// Write worker thread function.
    async fn write_worker_thread(
        server: String,
        mut conn: ServerConnection,
        mut rx_record: mpsc::Receiver<QueuedRecord>,
    ) -> WorkerOutcome {
        pf_debug!(server; "write worker thread spawned");
        let mut written = 0;
        let mut error = None;

        while let Some(record) = rx_record.recv().await {
            if let Err(e) = conn
                .write_record(record.partition, record.key, record.value)
                .await
            {
                pf_error!(server; "error writing record {}: {}", written, e);
                error = Some(e);
                break;
            }
            pf_trace!(server; "wrote record {} to p{}", written, record.partition);
            written += 1;
        }

        if error.is_some() {
            // refuse further records, then discard what is already queued
            rx_record.close();
            let mut discarded = 0;
            while rx_record.recv().await.is_some() {
                discarded += 1;
            }
            pf_warn!(
                server;
                "discarded {} queued records after failure",
                discarded
            );
        }
        debug_assert!(error.is_some() || conn.state() == ConnState::UploadStarted);

        pf_debug!(server; "write worker thread exitted");
        WorkerOutcome {
            conn,
            written,
            error,
        }
    }
}

//! Shared pool of idle server sessions, keyed by server address.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use lazy_static::lazy_static;

use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Default number of idle sessions kept per server address.
const DEFAULT_MAX_IDLE_PER_ADDR: usize = 16;

lazy_static! {
    /// Process-wide session pool used by clients with pooling enabled.
    static ref GLOBAL_POOL: Arc<SessionPool> =
        Arc::new(SessionPool::new(DEFAULT_MAX_IDLE_PER_ADDR));
}

/// Contract between a server connection and a pool of sessions. The pool is
/// the sole arbiter of sharing: a stream handed out by `acquire()` is used
/// exclusively by the caller until given back through `release()`.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Checks out an idle session to `conn_str`, if any.
    async fn acquire(&self, conn_str: &str) -> Option<TcpStream>;

    /// Gives a session back to the pool after a cleanly finished upload.
    async fn release(&self, conn_str: &str, stream: TcpStream);
}

/// Simple pool keeping up to `max_idle_per_addr` idle streams per address.
/// Streams are not health-checked here; the connection's handshake filters
/// out stale ones.
#[derive(Debug)]
pub struct SessionPool {
    /// Map from server address -> idle streams.
    idle: Mutex<HashMap<String, Vec<TcpStream>>>,

    /// Cap on idle streams kept per address; extra ones are dropped.
    max_idle_per_addr: usize,
}

impl SessionPool {
    /// Creates a new empty pool.
    pub fn new(max_idle_per_addr: usize) -> Self {
        SessionPool {
            idle: Mutex::new(HashMap::new()),
            max_idle_per_addr,
        }
    }

    /// Returns the process-wide pool.
    pub fn global() -> Arc<SessionPool> {
        GLOBAL_POOL.clone()
    }

    /// Number of idle sessions currently pooled for `conn_str`.
    pub async fn num_idle(&self, conn_str: &str) -> usize {
        self.idle.lock().await.get(conn_str).map_or(0, |v| v.len())
    }
}

#[async_trait]
impl ConnectionPool for SessionPool {
    async fn acquire(&self, conn_str: &str) -> Option<TcpStream> {
        let mut idle = self.idle.lock().await;
        let streams = idle.get_mut(conn_str)?;
        let stream = streams.pop();
        if streams.is_empty() {
            idle.remove(conn_str);
        }
        stream
    }

    async fn release(&self, conn_str: &str, stream: TcpStream) {
        let mut idle = self.idle.lock().await;
        let streams = idle.entry(conn_str.to_string()).or_default();
        if streams.len() < self.max_idle_per_addr {
            streams.push(stream);
        }
        // else dropped here, closing the socket
    }
}

#[cfg(test)]
mod pool_tests {
    use super::*;
    use crate::utils::{tcp_bind, RssError};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pool_acquire_release() -> Result<(), RssError> {
        let listener = tcp_bind("127.0.0.1:0".parse()?)?;
        let addr = listener.local_addr()?.to_string();
        let pool = SessionPool::new(1);
        assert!(pool.acquire(&addr).await.is_none());

        let s1 = TcpStream::connect(&addr).await?;
        let s2 = TcpStream::connect(&addr).await?;
        pool.release(&addr, s1).await;
        pool.release(&addr, s2).await; // over cap, dropped
        assert_eq!(pool.num_idle(&addr).await, 1);

        assert!(pool.acquire(&addr).await.is_some());
        assert!(pool.acquire(&addr).await.is_none());
        assert_eq!(pool.num_idle(&addr).await, 0);
        Ok(())
    }
}

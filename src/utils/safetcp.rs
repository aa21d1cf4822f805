//! Safe TCP bind/connect/read/write helper functions.

use std::marker::Unpin;
use std::net::SocketAddr;

use bytes::{Buf, BytesMut};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use serde::de::DeserializeOwned;
use serde::Serialize;

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

use crate::utils::RssError;

/// Upper bound on a single frame's payload length; anything larger is
/// treated as a corrupted stream.
const MAX_FRAME_LEN: u64 = 1 << 31;

/// Receives an object of type `T` from readable connection `conn_read`,
/// using `read_buf` as buffer storage for partial reads. Returns:
///   - `Ok(obj)` if successful; upon returning, bytes of this object are
///     consumed from the read buffer
///   - `Err(err)` if the peer closed the connection or any unexpected error
///     occurs
///
/// CANCELLATION SAFETY: we cannot use `read_u64()` and `read_exact()` here
/// because this function may be used as a `tokio::select!` branch and those
/// two methods are not cancellation-safe. Bytes already read before a
/// cancellation stay in the read buffer and are picked up by the next call.
pub(crate) async fn safe_tcp_read<T, Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
) -> Result<T, RssError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    // read length of obj first
    while read_buf.len() < 8 {
        read_more(read_buf, conn_read).await?;
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&read_buf[..8]);
    let obj_len = u64::from_be_bytes(len_bytes);
    if obj_len > MAX_FRAME_LEN {
        return Err(RssError::network(format!(
            "frame length {} exceeds limit",
            obj_len
        )));
    }

    // then read the obj itself
    let obj_end = 8 + obj_len as usize;
    if read_buf.capacity() < obj_end {
        read_buf.reserve(obj_end - read_buf.len());
    }
    while read_buf.len() < obj_end {
        read_more(read_buf, conn_read).await?;
    }
    let obj = decode_from_slice(&read_buf[8..obj_end])?;

    // no more awaits ahead, so discarding the consumed bytes is safe
    read_buf.advance(obj_end);
    Ok(obj)
}

/// Reads whatever is available into `read_buf`, turning end-of-stream into
/// an error.
async fn read_more<Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
) -> Result<(), RssError>
where
    Conn: AsyncReadExt + Unpin,
{
    if read_buf.capacity() == read_buf.len() {
        read_buf.reserve(1024);
    }
    let n = conn_read.read_buf(read_buf).await?;
    if n == 0 {
        return Err(RssError::network(if read_buf.is_empty() {
            "connection closed by peer"
        } else {
            "connection closed by peer in the middle of a frame"
        }));
    }
    Ok(())
}

/// Sends an object of type `T` to writable connection `conn_write` as one
/// length-prefixed frame. Bytes may remain in `conn_write`'s own buffer
/// (e.g. a `BufWriter`); call `flush()` to push them to the socket.
pub(crate) async fn safe_tcp_write<T, Conn>(
    conn_write: &mut Conn,
    obj: &T,
) -> Result<(), RssError>
where
    T: Serialize,
    Conn: AsyncWrite + Unpin,
{
    let obj_bytes = encode_to_vec(obj)?;
    conn_write.write_u64(obj_bytes.len() as u64).await?; // send length first
    conn_write.write_all(&obj_bytes[..]).await?;
    Ok(())
}

/// Resolves a `host:port` connection string to socket addresses.
pub(crate) async fn resolve_addr(
    conn_str: &str,
) -> Result<Vec<SocketAddr>, RssError> {
    let addrs: Vec<SocketAddr> = lookup_host(conn_str)
        .await
        .map_err(|e| {
            RssError::network(format!("cannot resolve '{}': {}", conn_str, e))
        })?
        .collect();
    if addrs.is_empty() {
        return Err(RssError::network(format!(
            "no address resolved for '{}'",
            conn_str
        )));
    }
    Ok(addrs)
}

/// Connects to `conn_str`, trying each resolved address in turn.
async fn tcp_connect_any(conn_str: &str) -> Result<TcpStream, RssError> {
    let mut last_err = None;
    for addr in resolve_addr(conn_str).await? {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        match socket.connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(RssError::network(format!(
        "cannot connect to '{}': {}",
        conn_str,
        last_err.map_or_else(|| "no usable address".into(), |e| e.to_string())
    )))
}

/// Connects to `conn_str` within `timeout`. Does not retry.
pub(crate) async fn tcp_connect_with_timeout(
    conn_str: &str,
    timeout: Duration,
) -> Result<TcpStream, RssError> {
    match time::timeout(timeout, tcp_connect_any(conn_str)).await {
        Ok(result) => result,
        Err(_) => Err(RssError::timeout(format!(
            "connecting to '{}' exceeded {} ms",
            conn_str,
            timeout.as_millis()
        ))),
    }
}

/// Wrapper over tokio `TcpSocket::bind()` with address reuse enabled.
pub(crate) fn tcp_bind(bind_addr: SocketAddr) -> Result<TcpListener, RssError> {
    let socket = if bind_addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(bind_addr)?;
    Ok(socket.listen(1024)?)
}

#[cfg(test)]
mod safetcp_tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct TestMsg {
        id: u64,
        body: Option<Vec<u8>>,
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn frame_write_read() -> Result<(), RssError> {
        let listener = tcp_bind("127.0.0.1:0".parse()?)?;
        let addr = listener.local_addr()?;
        let writer = tokio::spawn(async move {
            let mut stream = tcp_connect_with_timeout(
                &addr.to_string(),
                Duration::from_secs(5),
            )
            .await?;
            safe_tcp_write(&mut stream, &TestMsg { id: 1, body: None })
                .await?;
            safe_tcp_write(
                &mut stream,
                &TestMsg {
                    id: 2,
                    body: Some(vec![]),
                },
            )
            .await?;
            stream.flush().await?;
            Ok::<(), RssError>(())
        });
        let (mut conn, _) = listener.accept().await?;
        let mut read_buf = BytesMut::with_capacity(8 + 1024);
        let msg: TestMsg = safe_tcp_read(&mut read_buf, &mut conn).await?;
        assert_eq!(msg, TestMsg { id: 1, body: None });
        let msg: TestMsg = safe_tcp_read(&mut read_buf, &mut conn).await?;
        assert_eq!(
            msg,
            TestMsg {
                id: 2,
                body: Some(vec![])
            }
        );
        writer.await??;
        // writer side dropped, next read observes the closed connection
        let closed: Result<TestMsg, _> =
            safe_tcp_read(&mut read_buf, &mut conn).await;
        assert!(closed.unwrap_err().is_network());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn connect_unresolvable() {
        let result = tcp_connect_with_timeout(
            "invalid_server:80",
            Duration::from_millis(1000),
        )
        .await;
        assert!(result.unwrap_err().is_network());
    }
}

//! Raw exec-stream protocol.
//!
//! Docker's interactive exec endpoint hijacks the HTTP connection. The
//! client writes a hand-built `POST /exec/{id}/start` with
//! `Connection: Upgrade` / `Upgrade: tcp`, reads the response head off the
//! raw socket, and from then on the socket is a bidirectional pipe to the
//! process's terminal.
//!
//! ```text
//!   client                                  dockerd
//!     │ POST /v1.43/exec/{id}/start ───────────▶ │
//!     │ Upgrade: tcp                             │
//!     │ ◀─────────── HTTP/1.1 101 UPGRADED ──────│
//!     │ ◀─────────── \r\n\r\n<first output> ─────│
//!     │ ════════════ raw PTY bytes ═════════════ │
//! ```
//!
//! Response heads may arrive split across reads, and the first bytes of
//! program output may share a read with the end of the head. Both are
//! handled by [`read_response_head`].

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use crate::docker::error::{DockerError, Result};

/// Largest response head accepted before the terminator must appear.
const MAX_HEAD_LEN: usize = 16 * 1024;

/// Read buffer size for the receive loop.
const READ_CHUNK: usize = 8 * 1024;

/// Any bidirectional byte stream an exec session can run over.
pub trait ExecIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ExecIo for T {}

/// Type-erased exec socket.
pub type BoxedExecIo = Box<dyn ExecIo>;

/// Read half of an upgraded exec connection.
pub type ExecReader = ReadHalf<BoxedExecIo>;

/// Write half of an upgraded exec connection.
pub type ExecWriter = WriteHalf<BoxedExecIo>;

/// An upgraded exec connection.
pub struct ExecConnection {
    /// The raw socket, positioned after the response head.
    pub stream: BoxedExecIo,
    /// Output bytes that arrived in the same read as the response head.
    pub first_chunk: Bytes,
}

impl ExecConnection {
    /// Split into independently owned read and write halves.
    pub fn into_split(self) -> (ExecReader, ExecWriter, Bytes) {
        let (reader, writer) = tokio::io::split(self.stream);
        (reader, writer, self.first_chunk)
    }
}

impl std::fmt::Debug for ExecConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecConnection")
            .field("first_chunk_len", &self.first_chunk.len())
            .finish_non_exhaustive()
    }
}

/// Parsed HTTP response status line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Docker answers a hijacked start with 101, older daemons with 200.
    pub fn is_upgrade_success(&self) -> bool {
        matches!(self.status, 101 | 200)
    }
}

/// Build the exact upgrade request bytes for starting an exec instance.
pub fn upgrade_request(api_version: &str, exec_id: &str, tty: bool) -> Vec<u8> {
    let body = format!(r#"{{"Detach":false,"Tty":{}}}"#, tty);
    format!(
        "POST /{}/exec/{}/start HTTP/1.1\r\n\
         Host: localhost\r\n\
         Content-Type: application/json\r\n\
         Connection: Upgrade\r\n\
         Upgrade: tcp\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {}",
        api_version,
        exec_id,
        body.len(),
        body
    )
    .into_bytes()
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Try to parse a response head from the start of `buf`.
///
/// Returns `Ok(None)` when the `\r\n\r\n` terminator has not arrived yet,
/// otherwise the head and the number of bytes it occupied.
pub fn parse_response_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>> {
    const OP: &str = "exec upgrade";

    let Some(end) = find_terminator(buf) else {
        if buf.len() > MAX_HEAD_LEN {
            return Err(DockerError::protocol(
                OP,
                format!("response head exceeds {} bytes", MAX_HEAD_LEN),
            ));
        }
        return Ok(None);
    };

    let head = std::str::from_utf8(&buf[..end])
        .map_err(|e| DockerError::protocol(OP, format!("response head is not UTF-8: {}", e)))?;
    let mut lines = head.split("\r\n");

    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(DockerError::protocol(
            OP,
            format!("unexpected status line '{}'", status_line),
        ));
    }
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| {
            DockerError::protocol(OP, format!("unparseable status line '{}'", status_line))
        })?;
    let reason = parts.next().unwrap_or_default().to_string();

    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    Ok(Some((
        ResponseHead {
            status,
            reason,
            headers,
        },
        end + 4,
    )))
}

/// Read from `reader` until a full response head is buffered.
///
/// Returns the head plus any bytes that followed it in the same reads.
pub async fn read_response_head<R>(reader: &mut R) -> Result<(ResponseHead, Bytes)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        let n = reader
            .read_buf(&mut buf)
            .await
            .map_err(|e| DockerError::transport("exec upgrade", e))?;
        if n == 0 {
            return Err(DockerError::protocol(
                "exec upgrade",
                "connection closed before the response head completed",
            ));
        }
        if let Some((head, consumed)) = parse_response_head(&buf)? {
            let rest = buf.split_off(consumed).freeze();
            return Ok((head, rest));
        }
    }
}

/// Perform the upgrade handshake on an already-connected socket.
///
/// On a rejected status the socket is shut down before the error returns.
pub async fn open<S>(mut stream: S, api_version: &str, exec_id: &str, tty: bool) -> Result<ExecConnection>
where
    S: ExecIo + 'static,
{
    let request = upgrade_request(api_version, exec_id, tty);
    stream
        .write_all(&request)
        .await
        .map_err(|e| DockerError::transport("exec upgrade", e))?;
    stream
        .flush()
        .await
        .map_err(|e| DockerError::transport("exec upgrade", e))?;

    let (head, first_chunk) = read_response_head(&mut stream).await?;

    if !head.is_upgrade_success() {
        let _ = stream.shutdown().await;
        return Err(DockerError::UpgradeRejected {
            exec_id: exec_id.to_string(),
            status: head.status,
            message: String::from_utf8_lossy(&first_chunk).trim().to_string(),
        });
    }

    tracing::debug!(exec_id = %exec_id, status = head.status, "Exec stream upgraded");

    Ok(ExecConnection {
        stream: Box::new(stream),
        first_chunk,
    })
}

/// Write bytes to the process's stdin.
pub async fn send<W>(writer: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(data)
        .await
        .map_err(|e| DockerError::transport("exec send", e))?;
    writer
        .flush()
        .await
        .map_err(|e| DockerError::transport("exec send", e))
}

/// Deliver `first_chunk` and then every read to `on_chunk` until the peer closes.
pub async fn receive_loop<R, F>(mut reader: R, first_chunk: Bytes, mut on_chunk: F) -> Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(Bytes),
{
    if !first_chunk.is_empty() {
        on_chunk(first_chunk);
    }

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| DockerError::transport("exec receive", e))?;
        if n == 0 {
            return Ok(());
        }
        tracing::trace!(bytes = n, "Exec output chunk");
        on_chunk(Bytes::copy_from_slice(&buf[..n]));
    }
}

/// Like [`receive_loop`], but hands chunks to a bounded channel.
///
/// The socket is not read again until the previous chunk has been queued,
/// so a slow consumer throttles the remote process instead of growing a
/// buffer. Returns `Ok` early if the receiver is dropped.
pub async fn receive_into<R>(mut reader: R, first_chunk: Bytes, chunks: mpsc::Sender<Bytes>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    if !first_chunk.is_empty() && chunks.send(first_chunk).await.is_err() {
        return Ok(());
    }

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| DockerError::transport("exec receive", e))?;
        if n == 0 {
            return Ok(());
        }
        tracing::trace!(bytes = n, "Exec output chunk");
        if chunks.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEAD: &[u8] = b"HTTP/1.1 101 UPGRADED\r\n\
Content-Type: application/vnd.docker.raw-stream\r\n\
Connection: Upgrade\r\n\
Upgrade: tcp\r\n\r\n";

    #[test]
    fn test_upgrade_request_is_exact() {
        let req = upgrade_request("v1.43", "abc123", true);
        let expected = "POST /v1.43/exec/abc123/start HTTP/1.1\r\n\
Host: localhost\r\n\
Content-Type: application/json\r\n\
Connection: Upgrade\r\n\
Upgrade: tcp\r\n\
Content-Length: 27\r\n\
\r\n\
{\"Detach\":false,\"Tty\":true}";
        assert_eq!(String::from_utf8(req).unwrap(), expected);
    }

    #[test]
    fn test_parse_needs_terminator() {
        assert!(parse_response_head(b"HTTP/1.1 101 UPGRADED\r\nUpgrade: tcp\r\n")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_parse_head_and_offset() {
        let mut buf = HEAD.to_vec();
        buf.extend_from_slice(b"$ ");
        let (head, consumed) = parse_response_head(&buf).unwrap().unwrap();
        assert_eq!(head.status, 101);
        assert_eq!(head.reason, "UPGRADED");
        assert_eq!(head.header("upgrade"), Some("tcp"));
        assert_eq!(&buf[consumed..], b"$ ");
    }

    #[test]
    fn test_parse_rejects_garbage_status_line() {
        assert!(parse_response_head(b"SSH-2.0-OpenSSH\r\n\r\n").is_err());
        assert!(parse_response_head(b"HTTP/1.1 abc nope\r\n\r\n").is_err());
    }

    #[test]
    fn test_parse_rejects_oversized_head() {
        let buf = vec![b'a'; MAX_HEAD_LEN + 1];
        assert!(parse_response_head(&buf).is_err());
    }

    #[tokio::test]
    async fn test_split_reads_match_single_read() {
        let mut whole = HEAD.to_vec();
        whole.extend_from_slice(b"root@sandbox:/# ");

        let mut single = tokio_test::io::Builder::new().read(&whole).build();
        let (head_a, rest_a) = read_response_head(&mut single).await.unwrap();

        // Split inside the status line, inside a header and inside the terminator.
        let mut split = tokio_test::io::Builder::new()
            .read(&whole[..7])
            .read(&whole[7..40])
            .read(&whole[40..HEAD.len() - 2])
            .read(&whole[HEAD.len() - 2..])
            .build();
        let (head_b, rest_b) = read_response_head(&mut split).await.unwrap();

        assert_eq!(head_a, head_b);
        assert_eq!(rest_a, rest_b);
        assert_eq!(&rest_b[..], b"root@sandbox:/# ");
    }

    #[tokio::test]
    async fn test_eof_before_head_is_protocol_error() {
        let mut mock = tokio_test::io::Builder::new()
            .read(b"HTTP/1.1 101 UPGR")
            .build();
        let err = read_response_head(&mut mock).await.unwrap_err();
        assert!(matches!(err, DockerError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_open_delivers_first_chunk() {
        let mut response = HEAD.to_vec();
        response.extend_from_slice(b"hello");

        let mock = tokio_test::io::Builder::new()
            .write(&upgrade_request("v1.43", "e1", true))
            .read(&response)
            .build();

        let conn = open(mock, "v1.43", "e1", true).await.unwrap();
        assert_eq!(&conn.first_chunk[..], b"hello");
    }

    #[tokio::test]
    async fn test_open_rejects_non_upgrade_status() {
        let mock = tokio_test::io::Builder::new()
            .write(&upgrade_request("v1.43", "missing", true))
            .read(b"HTTP/1.1 404 Not Found\r\nContent-Type: application/json\r\n\r\n{\"message\":\"No such exec instance\"}")
            .build();

        let err = open(mock, "v1.43", "missing", true).await.unwrap_err();
        match err {
            DockerError::UpgradeRejected {
                status, message, ..
            } => {
                assert_eq!(status, 404);
                assert!(message.contains("No such exec instance"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_receive_loop_orders_chunks() {
        let (mut peer, local) = tokio::io::duplex(64);
        tokio::spawn(async move {
            peer.write_all(b"second ").await.unwrap();
            peer.write_all(b"third").await.unwrap();
        });

        let mut seen = Vec::new();
        receive_loop(local, Bytes::from_static(b"first "), |chunk| {
            seen.extend_from_slice(&chunk)
        })
        .await
        .unwrap();

        assert_eq!(seen, b"first second third".to_vec());
    }

    #[tokio::test]
    async fn test_receive_into_stops_reading_while_queue_is_full() {
        let (mut peer, local) = tokio::io::duplex(8);
        let (tx, mut rx) = mpsc::channel(1);
        let reader = tokio::spawn(receive_into(local, Bytes::from_static(b"a"), tx));

        // "a" fills the queue and the reader holds one chunk it cannot queue,
        // so the duplex fills and the writer is held back.
        peer.write_all(b"12345678").await.unwrap();
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            peer.write_all(b"more bytes"),
        )
        .await;
        assert!(blocked.is_err());

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"a"));
        drop(rx);
        drop(peer);
        reader.await.unwrap().unwrap();
    }
}

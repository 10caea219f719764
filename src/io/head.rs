//! HTTP message-head framing
//!
//! The upgrade handshake and the CONNECT dialer both need to pull exactly one
//! HTTP message head off a raw stream without eating bytes that belong to the
//! tunnel. Reads are chunked; anything received past the terminating blank
//! line is handed back to the caller untouched.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum accepted size of a request or response head.
pub const MAX_HEAD_SIZE: usize = 8 * 1024;

/// Read one HTTP message head (through the `\r\n\r\n` terminator).
///
/// Returns `(head, trailing)` where `trailing` holds bytes already received
/// past the terminator (0-RTT frames, early tunnel data). Fails with
/// `UnexpectedEof` if the peer closes first and `InvalidData` if the head
/// exceeds [`MAX_HEAD_SIZE`].
pub async fn read_http_head<S>(stream: &mut S) -> io::Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before message head completed",
            ));
        }
        // Re-scan across the chunk boundary for a split terminator.
        let scan_from = buf.len().saturating_sub(3);
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = find_terminator(&buf[scan_from..]) {
            let end = scan_from + pos + 4;
            let trailing = buf.split_off(end);
            return Ok((buf, trailing));
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "message head exceeds size cap",
            ));
        }
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_head_and_trailing_split() {
        let (mut tx, mut rx) = tokio::io::duplex(1024);
        tx.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\nTRAILING")
            .await
            .unwrap();

        let (head, trailing) = read_http_head(&mut rx).await.unwrap();
        assert_eq!(head, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(trailing, b"TRAILING");
    }

    #[tokio::test]
    async fn test_terminator_split_across_reads() {
        let (mut tx, mut rx) = tokio::io::duplex(1024);
        let read = tokio::spawn(async move { read_http_head(&mut rx).await });

        tx.write_all(b"GET / HTTP/1.1\r\nHost: x\r").await.unwrap();
        tx.flush().await.unwrap();
        tokio::task::yield_now().await;
        tx.write_all(b"\n\r\nrest").await.unwrap();

        let (head, trailing) = read.await.unwrap().unwrap();
        assert_eq!(head, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(trailing, b"rest");
    }

    #[tokio::test]
    async fn test_eof_before_terminator() {
        let (mut tx, mut rx) = tokio::io::duplex(1024);
        tx.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        drop(tx);

        let err = read_http_head(&mut rx).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_oversized_head_rejected() {
        let (mut tx, mut rx) = tokio::io::duplex(64 * 1024);
        let garbage = vec![b'a'; MAX_HEAD_SIZE + 1024];
        tx.write_all(&garbage).await.unwrap();

        let err = read_http_head(&mut rx).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}

use bytes::BufMut;
use futures::SinkExt;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
};
use tokio::net::TcpStream;
use tracing::instrument;

use crate::protocol::{self, Header, MessageKind, ProtocolError};

const READ_CHUNK_SIZE: usize = 64 * 1024;

async fn with_timeout<T>(
    limit: std::time::Duration,
    fut: impl std::future::Future<Output = std::io::Result<T>>,
) -> std::io::Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("no progress for {limit:?}"),
        )),
    }
}

/// Writing side of a single-message connection.
///
/// Generic over the underlying writer type - works with TCP or any AsyncWrite.
#[derive(Debug)]
pub struct SendStream<W = TcpStream> {
    framed: tokio_util::codec::FramedWrite<W, tokio_util::codec::LengthDelimitedCodec>,
    io_timeout: std::time::Duration,
}

impl<W: AsyncWrite + Unpin> SendStream<W> {
    pub fn new(stream: W, io_timeout: std::time::Duration) -> Self {
        let framed = tokio_util::codec::FramedWrite::new(
            stream,
            protocol::name_codec(u32::MAX as usize),
        );
        Self { framed, io_timeout }
    }

    async fn send_header(&mut self, header: &Header) -> anyhow::Result<()> {
        let io_timeout = self.io_timeout;
        // the tag goes out before the codec has buffered anything
        with_timeout(io_timeout, self.framed.get_mut().write_u8(header.kind() as u8)).await?;
        let field = bytes::Bytes::copy_from_slice(header.field().as_bytes());
        match tokio::time::timeout(io_timeout, self.framed.send(field)).await {
            Ok(res) => res?,
            Err(_) => anyhow::bail!(
                "timed out sending {} header after {:?}",
                header.kind(),
                io_timeout
            ),
        }
        Ok(())
    }

    /// Sends an upload header followed by the entire content of `reader`.
    ///
    /// The body is copied one buffer at a time, so the size of each write is controlled by the
    /// capacity of the `BufReader` wrapping the source. Every write is subject to the I/O timeout.
    #[instrument(level = "trace", skip(self, reader))]
    pub async fn send_upload<R: AsyncBufRead + Unpin>(
        &mut self,
        name: &str,
        reader: &mut R,
    ) -> anyhow::Result<u64> {
        self.send_header(&Header::Upload {
            name: name.to_string(),
        })
        .await?;
        let io_timeout = self.io_timeout;
        let data_stream = self.framed.get_mut();
        let mut total = 0u64;
        loop {
            let chunk = reader.fill_buf().await?;
            if chunk.is_empty() {
                break;
            }
            let len = chunk.len();
            with_timeout(io_timeout, data_stream.write_all(chunk)).await?;
            reader.consume(len);
            total += len as u64;
        }
        Ok(total)
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn send_delete(&mut self, path: &str) -> anyhow::Result<()> {
        self.send_header(&Header::Delete {
            path: path.to_string(),
        })
        .await
    }

    /// Flushes and shuts down the write side, which marks the end of the body for the peer.
    pub async fn close(&mut self) -> anyhow::Result<()> {
        let io_timeout = self.io_timeout;
        match tokio::time::timeout(io_timeout, SinkExt::<bytes::Bytes>::close(&mut self.framed)).await {
            Ok(res) => res?,
            Err(_) => anyhow::bail!("timed out closing connection after {:?}", io_timeout),
        }
        Ok(())
    }
}

impl SendStream<TcpStream> {
    /// Resets the connection instead of closing it gracefully.
    ///
    /// Used when the body could not be read in full: a graceful close would make the receiver
    /// treat the truncated body as complete.
    pub fn abort(self) {
        let stream = self.framed.into_inner();
        let linger = socket2::SockRef::from(&stream).set_linger(Some(std::time::Duration::ZERO));
        if let Err(err) = linger {
            tracing::debug!("Failed to set SO_LINGER before reset: {err}");
        }
        drop(stream);
    }
}

/// Reading side of a single-message connection.
///
/// Generic over the underlying reader type - works with TCP or any AsyncRead.
#[derive(Debug)]
pub struct RecvStream<R = TcpStream> {
    framed: tokio_util::codec::FramedRead<R, tokio_util::codec::LengthDelimitedCodec>,
    limits: common::MessageLimits,
    idle_timeout: std::time::Duration,
}

impl<R: AsyncRead + Unpin> RecvStream<R> {
    pub fn new(
        stream: R,
        limits: common::MessageLimits,
        idle_timeout: std::time::Duration,
    ) -> Self {
        let framed = tokio_util::codec::FramedRead::new(
            stream,
            protocol::name_codec(limits.max_name_len),
        );
        Self {
            framed,
            limits,
            idle_timeout,
        }
    }

    async fn timed<T>(
        idle_timeout: std::time::Duration,
        fut: impl std::future::Future<Output = std::io::Result<T>>,
    ) -> Result<T, ProtocolError> {
        match tokio::time::timeout(idle_timeout, fut).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(ProtocolError::IdleTimeout(idle_timeout)),
        }
    }

    /// Reads the tag and the length-prefixed name/path field.
    ///
    /// Must be called once, before any body read.
    #[instrument(level = "trace", skip(self))]
    pub async fn recv_header(&mut self) -> Result<Header, ProtocolError> {
        let idle_timeout = self.idle_timeout;
        // nothing has been polled through the codec yet, so its buffer is empty and the tag is
        // the next byte on the raw stream
        let tag = match Self::timed(idle_timeout, self.framed.get_mut().read_u8()).await {
            Ok(tag) => tag,
            Err(ProtocolError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ProtocolError::Truncated("tag"));
            }
            Err(err) => return Err(err),
        };
        let kind = MessageKind::try_from(tag)?;
        let next = tokio::time::timeout(idle_timeout, futures::StreamExt::next(&mut self.framed))
            .await
            .map_err(|_| ProtocolError::IdleTimeout(idle_timeout))?;
        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => return Err(self.classify_codec_error(err)),
            None => return Err(ProtocolError::Truncated("name")),
        };
        let field = String::from_utf8(frame.to_vec()).map_err(ProtocolError::InvalidUtf8)?;
        Ok(Header::new(kind, field))
    }

    fn classify_codec_error(&self, err: std::io::Error) -> ProtocolError {
        let too_long = err
            .get_ref()
            .is_some_and(|inner| inner.is::<tokio_util::codec::LengthDelimitedCodecError>());
        if too_long {
            ProtocolError::NameTooLong {
                max: self.limits.max_name_len,
            }
        } else if err.kind() == std::io::ErrorKind::UnexpectedEof
            || (err.kind() == std::io::ErrorKind::Other && !self.framed.read_buffer().is_empty())
        {
            // the codec reports a partial frame at EOF as a plain io error and keeps the bytes
            ProtocolError::Truncated("name")
        } else {
            ProtocolError::Io(err)
        }
    }

    /// Reads the rest of the stream into memory, up to the configured body limit.
    #[instrument(level = "trace", skip(self))]
    pub async fn recv_body(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let max = self.limits.max_body_size;
        let idle_timeout = self.idle_timeout;
        // bytes that arrived together with the header are still sitting in the codec buffer
        let read_buffer = self.framed.read_buffer_mut().split();
        if read_buffer.len() as u64 > max {
            return Err(ProtocolError::BodyTooLarge { max });
        }
        let mut body = bytes::BytesMut::with_capacity(read_buffer.len().max(READ_CHUNK_SIZE));
        body.put(read_buffer);
        let data_stream = self.framed.get_mut();
        loop {
            if body.capacity() - body.len() < READ_CHUNK_SIZE {
                body.reserve(READ_CHUNK_SIZE);
            }
            let n = Self::timed(idle_timeout, data_stream.read_buf(&mut body)).await?;
            if n == 0 {
                break;
            }
            if body.len() as u64 > max {
                return Err(ProtocolError::BodyTooLarge { max });
            }
        }
        Ok(Vec::from(body))
    }

    /// Confirms the peer sent nothing after the header.
    pub async fn expect_eof(&mut self) -> Result<(), ProtocolError> {
        if !self.framed.read_buffer().is_empty() {
            return Err(ProtocolError::TrailingBytes);
        }
        let idle_timeout = self.idle_timeout;
        let mut next_byte = [0u8; 1];
        let n = Self::timed(idle_timeout, self.framed.get_mut().read(&mut next_byte)).await?;
        if n != 0 {
            return Err(ProtocolError::TrailingBytes);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDLE: std::time::Duration = std::time::Duration::from_secs(5);

    fn limits(max_name_len: usize, max_body_size: u64) -> common::MessageLimits {
        common::MessageLimits {
            max_name_len,
            max_body_size,
        }
    }

    async fn encode_upload(name: &str, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut send = SendStream::new(&mut out, IDLE);
        let mut reader = tokio::io::BufReader::with_capacity(7, body);
        let sent = send.send_upload(name, &mut reader).await.unwrap();
        assert_eq!(sent, body.len() as u64);
        send.close().await.unwrap();
        drop(send);
        out
    }

    #[tokio::test]
    async fn upload_wire_layout() {
        let wire = encode_upload("report.txt", b"v1").await;
        let mut expected = vec![0x01, 10, 0, 0, 0];
        expected.extend_from_slice(b"report.txt");
        expected.extend_from_slice(b"v1");
        assert_eq!(wire, expected);
    }

    #[tokio::test]
    async fn delete_wire_layout() {
        let mut out = Vec::new();
        let mut send = SendStream::new(&mut out, IDLE);
        send.send_delete("/watched/report.txt").await.unwrap();
        send.close().await.unwrap();
        drop(send);
        assert_eq!(out[0], 0x02);
        assert_eq!(&out[1..5], &[19, 0, 0, 0]);
        assert_eq!(&out[5..], b"/watched/report.txt");
    }

    #[tokio::test]
    async fn upload_is_read_back() {
        let body: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
        let wire = encode_upload("data.bin", &body).await;
        let mut recv = RecvStream::new(wire.as_slice(), limits(64, 1 << 20), IDLE);
        assert_eq!(
            recv.recv_header().await.unwrap(),
            Header::Upload {
                name: "data.bin".to_string()
            }
        );
        assert_eq!(recv.recv_body().await.unwrap(), body);
    }

    #[tokio::test]
    async fn empty_body_is_valid() {
        let wire = encode_upload("empty", b"").await;
        let mut recv = RecvStream::new(wire.as_slice(), limits(64, 16), IDLE);
        recv.recv_header().await.unwrap();
        assert!(recv.recv_body().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn legacy_text_delete_is_rejected() {
        let wire = b"DELETE:/watched/report.txt".to_vec();
        let mut recv = RecvStream::new(wire.as_slice(), limits(64, 16), IDLE);
        assert!(matches!(
            recv.recv_header().await,
            Err(ProtocolError::UnknownTag(b'D'))
        ));
    }

    #[tokio::test]
    async fn oversize_name_is_rejected() {
        let wire = encode_upload("a-rather-long-name.txt", b"x").await;
        let mut recv = RecvStream::new(wire.as_slice(), limits(8, 16), IDLE);
        assert!(matches!(
            recv.recv_header().await,
            Err(ProtocolError::NameTooLong { max: 8 })
        ));
    }

    #[tokio::test]
    async fn oversize_body_is_rejected() {
        let wire = encode_upload("big", &[7u8; 100]).await;
        let mut recv = RecvStream::new(wire.as_slice(), limits(64, 99), IDLE);
        recv.recv_header().await.unwrap();
        assert!(matches!(
            recv.recv_body().await,
            Err(ProtocolError::BodyTooLarge { max: 99 })
        ));
    }

    #[tokio::test]
    async fn body_of_exactly_the_limit_is_accepted() {
        for size in [100, 3 * READ_CHUNK_SIZE + 5] {
            let body: Vec<u8> = (0..=255u8).cycle().take(size).collect();
            let wire = encode_upload("fits", &body).await;
            let mut recv = RecvStream::new(wire.as_slice(), limits(64, size as u64), IDLE);
            recv.recv_header().await.unwrap();
            assert_eq!(recv.recv_body().await.unwrap(), body);
            let mut recv = RecvStream::new(wire.as_slice(), limits(64, size as u64 - 1), IDLE);
            recv.recv_header().await.unwrap();
            assert!(matches!(
                recv.recv_body().await,
                Err(ProtocolError::BodyTooLarge { .. })
            ));
        }
    }

    #[tokio::test]
    async fn truncated_headers_are_rejected() {
        let empty: &[u8] = &[];
        let mut recv = RecvStream::new(empty, limits(64, 16), IDLE);
        assert!(matches!(
            recv.recv_header().await,
            Err(ProtocolError::Truncated("tag"))
        ));
        // length says 10 bytes but only 3 follow
        let short: &[u8] = &[0x01, 10, 0, 0, 0, b'a', b'b', b'c'];
        let mut recv = RecvStream::new(short, limits(64, 16), IDLE);
        assert!(matches!(
            recv.recv_header().await,
            Err(ProtocolError::Truncated("name"))
        ));
        // stream ends inside the length prefix
        let short: &[u8] = &[0x01, 10, 0];
        let mut recv = RecvStream::new(short, limits(64, 16), IDLE);
        assert!(matches!(
            recv.recv_header().await,
            Err(ProtocolError::Truncated("name"))
        ));
        // tag only
        let short: &[u8] = &[0x02];
        let mut recv = RecvStream::new(short, limits(64, 16), IDLE);
        assert!(matches!(
            recv.recv_header().await,
            Err(ProtocolError::Truncated("name"))
        ));
    }

    #[tokio::test]
    async fn invalid_utf8_name_is_rejected() {
        let wire: &[u8] = &[0x01, 2, 0, 0, 0, 0xff, 0xfe];
        let mut recv = RecvStream::new(wire, limits(64, 16), IDLE);
        assert!(matches!(
            recv.recv_header().await,
            Err(ProtocolError::InvalidUtf8(_))
        ));
    }

    #[tokio::test]
    async fn delete_with_trailing_bytes_is_rejected() {
        let mut wire = vec![0x02, 3, 0, 0, 0];
        wire.extend_from_slice(b"a/bjunk");
        let mut recv = RecvStream::new(wire.as_slice(), limits(64, 16), IDLE);
        assert_eq!(
            recv.recv_header().await.unwrap(),
            Header::Delete {
                path: "a/b".to_string()
            }
        );
        assert!(matches!(
            recv.expect_eof().await,
            Err(ProtocolError::TrailingBytes)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_peer_times_out() {
        let (client, server) = tokio::io::duplex(64);
        let mut recv = RecvStream::new(server, limits(64, 16), IDLE);
        let res = recv.recv_header().await;
        assert!(matches!(res, Err(ProtocolError::IdleTimeout(_))));
        drop(client);
    }
}

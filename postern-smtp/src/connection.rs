use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{
    rustls::{ProtocolVersion, ServerConfig, ServerConnection, SupportedCipherSuite},
    server::TlsStream,
    TlsAcceptor,
};

use std::sync::Arc;

use crate::{
    error::{ConnectionError, ConnectionResult, TlsError, TlsResult},
    response::Reply,
};

/// Outcome of a line read. Failure shapes a caller can recover from are
/// values, not errors; only I/O problems surface as `Err`.
#[derive(Debug, PartialEq, Eq)]
pub enum LineRead {
    /// One line, terminator stripped. Bare LF is accepted as a terminator.
    Line(Vec<u8>),
    /// Peer closed the connection (possibly mid-line).
    Eof,
    /// The line exceeded the limit; it has been consumed through its
    /// terminator so the stream stays line-synchronised.
    TooLong,
    /// The line contained a NUL byte; consumed like `TooLong`.
    ForbiddenByte,
}

#[derive(Debug)]
pub struct TlsInfo {
    version: ProtocolVersion,
    ciphers: SupportedCipherSuite,
}

impl TlsInfo {
    fn of(conn: &ServerConnection) -> TlsResult<Self> {
        Ok(Self {
            version: conn
                .protocol_version()
                .ok_or_else(|| TlsError::ProtocolInfoMissing("protocol version".to_string()))?,
            ciphers: conn
                .negotiated_cipher_suite()
                .ok_or_else(|| TlsError::ProtocolInfoMissing("cipher suite".to_string()))?,
        })
    }

    pub fn proto(&self) -> String {
        self.version.as_str().map_or_else(String::new, str::to_string)
    }

    pub fn cipher(&self) -> String {
        self.ciphers
            .suite()
            .as_str()
            .map_or_else(String::new, str::to_string)
    }
}

const BUFFER_SIZE: usize = 8192;

/// Byte-stream transport for one session.
///
/// Each live variant owns its read buffer alongside its stream, so the
/// buffer and the TLS session share a lifetime by construction and are torn
/// down together when the connection drops. `Closed` is the post-teardown
/// (and mid-upgrade) placeholder; reads on it report EOF.
pub enum Connection<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    Plain {
        stream: Stream,
        /// Internal read buffer to reduce syscalls (8KB)
        read_buf: Vec<u8>,
        /// Current position in read buffer
        read_pos: usize,
        /// Amount of valid data in read buffer
        read_len: usize,
    },
    Tls {
        stream: Box<TlsStream<Stream>>,
        /// Internal read buffer to reduce syscalls (8KB)
        read_buf: Vec<u8>,
        /// Current position in read buffer
        read_pos: usize,
        /// Amount of valid data in read buffer
        read_len: usize,
    },
    Closed,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Connection<Stream> {
    pub(crate) fn plain(stream: Stream) -> Self {
        Self::Plain {
            stream,
            read_buf: Vec::new(),
            read_pos: 0,
            read_len: 0,
        }
    }

    pub(crate) const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls { .. })
    }

    fn buffered(&self) -> &[u8] {
        match self {
            Self::Plain {
                read_buf,
                read_pos,
                read_len,
                ..
            }
            | Self::Tls {
                read_buf,
                read_pos,
                read_len,
                ..
            } => &read_buf[*read_pos..*read_len],
            Self::Closed => &[],
        }
    }

    fn consume(&mut self, n: usize) {
        match self {
            Self::Plain { read_pos, .. } | Self::Tls { read_pos, .. } => *read_pos += n,
            Self::Closed => {}
        }
    }

    /// Refill the read buffer; returns 0 at EOF.
    async fn fill(&mut self) -> ConnectionResult<usize> {
        match self {
            Self::Plain {
                stream,
                read_buf,
                read_pos,
                read_len,
            } => {
                if read_buf.is_empty() {
                    read_buf.resize(BUFFER_SIZE, 0);
                }
                let bytes_read = stream.read(read_buf).await?;
                *read_pos = 0;
                *read_len = bytes_read;
                Ok(bytes_read)
            }
            Self::Tls {
                stream,
                read_buf,
                read_pos,
                read_len,
            } => {
                if read_buf.is_empty() {
                    read_buf.resize(BUFFER_SIZE, 0);
                }
                let bytes_read = stream.read(read_buf).await?;
                *read_pos = 0;
                *read_len = bytes_read;
                Ok(bytes_read)
            }
            Self::Closed => Ok(0),
        }
    }

    /// Read one line up to `max_len` bytes, accepting CRLF or bare LF.
    ///
    /// Over-long and NUL-bearing lines are consumed through their
    /// terminator and reported as values so the caller can answer with a
    /// reply instead of tearing the connection down.
    pub(crate) async fn read_line(&mut self, max_len: usize) -> ConnectionResult<LineRead> {
        self.read_line_inner(max_len, false).await
    }

    /// Line read for message data: identical framing, but NUL bytes pass
    /// through (binary content is the body's problem, not the transport's).
    pub(crate) async fn read_data_line(&mut self, max_len: usize) -> ConnectionResult<LineRead> {
        self.read_line_inner(max_len, true).await
    }

    async fn read_line_inner(
        &mut self,
        max_len: usize,
        allow_nul: bool,
    ) -> ConnectionResult<LineRead> {
        let mut line: Vec<u8> = Vec::new();
        let mut overflow = false;
        let mut forbidden = false;

        loop {
            if self.buffered().is_empty() && self.fill().await? == 0 {
                return Ok(LineRead::Eof);
            }

            let (take, terminated) = {
                let buffered = self.buffered();
                let newline = buffered.iter().position(|&byte| byte == b'\n');
                let take = newline.map_or(buffered.len(), |index| index + 1);
                let content = newline.map_or(buffered, |index| &buffered[..index]);

                if !allow_nul && content.contains(&0) {
                    forbidden = true;
                }
                if !overflow && !forbidden {
                    if line.len() + content.len() > max_len {
                        overflow = true;
                        line.clear();
                    } else {
                        line.extend_from_slice(content);
                    }
                }

                (take, newline.is_some())
            };

            self.consume(take);

            if terminated {
                if forbidden {
                    return Ok(LineRead::ForbiddenByte);
                }
                if overflow {
                    return Ok(LineRead::TooLong);
                }
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(LineRead::Line(line));
            }
        }
    }

    /// Read exactly `n` bytes, binary-safe. Used for BDAT chunk payloads.
    pub(crate) async fn read_exact(&mut self, n: usize) -> ConnectionResult<Vec<u8>> {
        let mut out = Vec::with_capacity(n.min(BUFFER_SIZE));
        while out.len() < n {
            if self.buffered().is_empty() && self.fill().await? == 0 {
                return Err(ConnectionError::Closed);
            }
            let take = (n - out.len()).min(self.buffered().len());
            out.extend_from_slice(&self.buffered()[..take]);
            self.consume(take);
        }
        Ok(out)
    }

    /// Read and drop exactly `n` bytes. Keeps the stream synchronised when
    /// a declared chunk must be refused without buffering it.
    pub(crate) async fn discard_exact(&mut self, n: usize) -> ConnectionResult<()> {
        let mut remaining = n;
        while remaining > 0 {
            if self.buffered().is_empty() && self.fill().await? == 0 {
                return Err(ConnectionError::Closed);
            }
            let take = remaining.min(self.buffered().len());
            self.consume(take);
            remaining -= take;
        }
        Ok(())
    }

    /// Emit one reply, coalesced into a single write.
    pub(crate) async fn send_reply(&mut self, reply: &Reply) -> ConnectionResult<usize> {
        let wire = reply.to_wire();
        self.write_all(&wire).await?;
        Ok(wire.len())
    }

    pub(crate) async fn write_all(&mut self, bytes: &[u8]) -> ConnectionResult<()> {
        match self {
            Self::Plain { stream, .. } => {
                stream.write_all(bytes).await?;
                stream.flush().await?;
            }
            Self::Tls { stream, .. } => {
                stream.write_all(bytes).await?;
                stream.flush().await?;
            }
            Self::Closed => return Err(ConnectionError::Closed),
        }
        Ok(())
    }

    /// Perform the STARTTLS handshake, turning a `Plain` transport into a
    /// `Tls` one. Only valid on a plaintext connection.
    ///
    /// Any plaintext bytes the peer pushed before the handshake are
    /// deliberately dropped rather than replayed into the TLS session. On
    /// handshake failure the transport is left `Closed` and the session
    /// must terminate.
    pub(crate) async fn upgrade(&mut self, config: Arc<ServerConfig>) -> TlsResult<TlsInfo> {
        match std::mem::replace(self, Self::Closed) {
            Self::Plain { stream, .. } => {
                let acceptor = TlsAcceptor::from(config);
                let stream = acceptor.accept(stream).await?;
                let info = TlsInfo::of(stream.get_ref().1)?;

                *self = Self::Tls {
                    stream: Box::new(stream),
                    read_buf: Vec::new(),
                    read_pos: 0,
                    read_len: 0,
                };
                Ok(info)
            }
            tls @ Self::Tls { .. } => {
                *self = tls;
                Err(TlsError::AlreadyTls)
            }
            Self::Closed => Err(TlsError::UpgradeFailed(
                "connection already closed".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod test {
    use postern_common::status::Status;

    use crate::response::Reply;

    use super::{Connection, LineRead};

    async fn connection_over(input: &[u8]) -> Connection<tokio::io::DuplexStream> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let input = input.to_vec();
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let _ = client_write.write_all(&input).await;
            let _ = client_write.shutdown().await;
            // Drain replies so writes never block.
            let mut sink = Vec::new();
            let _ = client_read.read_to_end(&mut sink).await;
        });
        Connection::plain(server)
    }

    #[tokio::test]
    async fn reads_crlf_and_bare_lf_lines() {
        let mut connection = connection_over(b"EHLO one\r\nNOOP\nQUIT\r\n").await;

        assert_eq!(
            connection.read_line(512).await.unwrap(),
            LineRead::Line(b"EHLO one".to_vec())
        );
        assert_eq!(
            connection.read_line(512).await.unwrap(),
            LineRead::Line(b"NOOP".to_vec())
        );
        assert_eq!(
            connection.read_line(512).await.unwrap(),
            LineRead::Line(b"QUIT".to_vec())
        );
        assert_eq!(connection.read_line(512).await.unwrap(), LineRead::Eof);
    }

    #[tokio::test]
    async fn long_line_is_consumed_and_reported() {
        let mut input = vec![b'a'; 600];
        input.extend_from_slice(b"\r\nNOOP\r\n");
        let mut connection = connection_over(&input).await;

        assert_eq!(connection.read_line(512).await.unwrap(), LineRead::TooLong);
        // The stream is still line-synchronised.
        assert_eq!(
            connection.read_line(512).await.unwrap(),
            LineRead::Line(b"NOOP".to_vec())
        );
    }

    #[tokio::test]
    async fn nul_byte_is_rejected_in_command_lines() {
        let mut connection = connection_over(b"EH\0LO x\r\nNOOP\r\n").await;

        assert_eq!(
            connection.read_line(512).await.unwrap(),
            LineRead::ForbiddenByte
        );
        assert_eq!(
            connection.read_line(512).await.unwrap(),
            LineRead::Line(b"NOOP".to_vec())
        );
    }

    #[tokio::test]
    async fn data_lines_allow_nul() {
        let mut connection = connection_over(b"bin\0ary\r\n").await;

        assert_eq!(
            connection.read_data_line(512).await.unwrap(),
            LineRead::Line(b"bin\0ary".to_vec())
        );
    }

    #[tokio::test]
    async fn read_exact_is_binary_safe() {
        let mut connection = connection_over(b"abc\r\n\0\xffrest").await;

        let chunk = connection.read_exact(9).await.unwrap();
        assert_eq!(chunk, b"abc\r\n\0\xffre");
        let tail = connection.read_exact(2).await.unwrap();
        assert_eq!(tail, b"st");
    }

    #[tokio::test]
    async fn discard_exact_skips_bytes() {
        let mut connection = connection_over(b"0123456789NOOP\r\n").await;

        connection.discard_exact(10).await.unwrap();
        assert_eq!(
            connection.read_line(512).await.unwrap(),
            LineRead::Line(b"NOOP".to_vec())
        );
    }

    #[tokio::test]
    async fn line_split_across_fills() {
        // Force the line to span multiple reads through a tiny duplex.
        let (client, server) = tokio::io::duplex(4);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut client = client;
            client.write_all(b"EHLO client.example.com\r\n").await.unwrap();
        });

        let mut connection = Connection::plain(server);
        assert_eq!(
            connection.read_line(512).await.unwrap(),
            LineRead::Line(b"EHLO client.example.com".to_vec())
        );
    }

    #[tokio::test]
    async fn send_reply_writes_wire_form() {
        let (client, server) = tokio::io::duplex(1024);
        let mut connection = Connection::plain(server);

        connection
            .send_reply(&Reply::new(Status::Ok, "Ok"))
            .await
            .unwrap();
        drop(connection);

        use tokio::io::AsyncReadExt;
        let mut client = client;
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"250 Ok\r\n");
    }
}

//! Line transport over a tokio byte stream.
//!
//! The 2600 series accepts raw TSP on TCP port 5025, addressed with VISA-style
//! socket resources (`TCPIP0::192.168.1.50::5025::SOCKET`). `SocketTransport`
//! wraps a `TcpStream`; tests drive the same code over `tokio::io::duplex`.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

use super::Transport;
use crate::error::{KeithleyError, Result};

/// Raw-socket port of the 2600 series.
pub const DEFAULT_SOCKET_PORT: u16 = 5025;

/// Longest time spent discarding late bytes before a new command.
const DRAIN_WINDOW: Duration = Duration::from_millis(50);

/// Silence that ends the discard early.
const DRAIN_POLL: Duration = Duration::from_millis(5);

/// Transport over a raw TCP socket.
pub type SocketTransport = StreamTransport<TcpStream>;

/// Newline-terminated command/reply transport over any async stream.
pub struct StreamTransport<S> {
    resource: String,
    stream: BufReader<S>,
    timeout: Duration,
    last_command: String,
    // Replies owed by the instrument for commands that timed out
    stale_replies: usize,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already connected stream.
    pub fn new(resource: impl Into<String>, stream: S, timeout: Duration) -> Self {
        Self {
            resource: resource.into(),
            stream: BufReader::new(stream),
            timeout,
            last_command: String::new(),
            stale_replies: 0,
        }
    }

    /// Replies still expected for commands whose read timed out.
    #[must_use]
    pub fn stale_replies(&self) -> usize {
        self.stale_replies
    }

    /// Drop input left over from exchanges that timed out, so the next reply
    /// read belongs to the next command.
    async fn discard_stale_input(&mut self) {
        let buffered = self.stream.buffer();
        if !buffered.is_empty() {
            let len = buffered.len();
            let lines = count_lines(buffered);
            tracing::debug!("Discarding {} buffered bytes from {}", len, self.resource);
            self.stream.consume(len);
            self.settle(lines);
        }

        let mut scratch = [0u8; 256];
        let deadline = Instant::now() + DRAIN_WINDOW;
        while self.stale_replies > 0 && Instant::now() < deadline {
            match timeout(DRAIN_POLL, self.stream.get_mut().read(&mut scratch)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => {
                    tracing::debug!("Discarded {} late bytes from {}", n, self.resource);
                    self.settle(count_lines(&scratch[..n]));
                }
                Ok(Err(e)) => {
                    tracing::warn!("I/O error while discarding late replies: {}", e);
                    break;
                }
            }
        }
    }

    fn settle(&mut self, lines: usize) {
        self.stale_replies = self.stale_replies.saturating_sub(lines);
    }

    async fn next_line(&mut self) -> Result<String> {
        let mut response = String::new();
        let result = timeout(self.timeout, self.stream.read_line(&mut response)).await;

        match result {
            Ok(Ok(0)) => Err(KeithleyError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by instrument",
            ))),
            Ok(Ok(_)) => Ok(response.trim_end_matches(['\r', '\n']).to_string()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(KeithleyError::Timeout(self.last_command.clone())),
        }
    }

    async fn read_reply(&mut self) -> Result<String> {
        while self.stale_replies > 0 {
            let late = self.next_line().await?;
            self.stale_replies -= 1;
            tracing::debug!("Discarded late reply: {}", late);
        }
        self.next_line().await
    }
}

impl StreamTransport<TcpStream> {
    /// Connect to a `TCPIP<n>::<host>::<port>::SOCKET` resource.
    pub async fn connect(resource: &str, reply_timeout: Duration) -> Result<Self> {
        let (host, port) = parse_socket_resource(resource)?;

        let stream = timeout(reply_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| KeithleyError::connection(resource, "connect timed out"))?
            .map_err(|e| KeithleyError::connection(resource, e))?;

        // Small command lines; do not wait for Nagle coalescing
        stream
            .set_nodelay(true)
            .map_err(|e| KeithleyError::connection(resource, e))?;

        tracing::info!("Connected to {} at {}:{}", resource, host, port);
        Ok(Self::new(resource, stream, reply_timeout))
    }
}

/// Split a socket resource into host and port.
///
/// Accepts `TCPIP[n]::<host>::<port>::SOCKET`; the port defaults to 5025 when the
/// resource is `TCPIP[n]::<host>::SOCKET`.
pub fn parse_socket_resource(resource: &str) -> Result<(String, u16)> {
    let parts: Vec<&str> = resource.split("::").collect();
    let valid_prefix = parts
        .first()
        .is_some_and(|p| p.to_ascii_uppercase().starts_with("TCPIP"));
    let valid_suffix = parts
        .last()
        .is_some_and(|p| p.eq_ignore_ascii_case("SOCKET"));
    if !valid_prefix || !valid_suffix {
        return Err(KeithleyError::connection(
            resource,
            "expected TCPIP<n>::<host>::<port>::SOCKET",
        ));
    }

    match parts.as_slice() {
        [_, host, _] if !host.is_empty() => Ok((host.to_string(), DEFAULT_SOCKET_PORT)),
        [_, host, port, _] if !host.is_empty() => {
            let port = port
                .parse::<u16>()
                .map_err(|_| KeithleyError::connection(resource, format!("invalid port '{}'", port)))?;
            Ok((host.to_string(), port))
        }
        _ => Err(KeithleyError::connection(
            resource,
            "expected TCPIP<n>::<host>::<port>::SOCKET",
        )),
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        self.discard_stale_input().await;
        tracing::debug!("TSP write: {}", command);
        self.last_command = command.to_string();

        let line = format!("{}\n", command);
        let io = async {
            let writer = self.stream.get_mut();
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        timeout(self.timeout, io)
            .await
            .map_err(|_| KeithleyError::Timeout(command.to_string()))??;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        let reply = self.read_reply().await;
        match &reply {
            Ok(line) => tracing::debug!("TSP reply: {}", line),
            // The instrument may still answer; that line is skipped later
            Err(KeithleyError::Timeout(_)) => self.stale_replies += 1,
            Err(_) => {}
        }
        reply
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.get_mut().shutdown().await?;
        tracing::info!("Closed {}", self.resource);
        Ok(())
    }
}

fn count_lines(bytes: &[u8]) -> usize {
    bytes.iter().filter(|b| **b == b'\n').count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn parses_socket_resources() {
        assert_eq!(
            parse_socket_resource("TCPIP0::192.168.1.50::5025::SOCKET").unwrap(),
            ("192.168.1.50".to_string(), 5025)
        );
        assert_eq!(
            parse_socket_resource("TCPIP1::k2614.lab::SOCKET").unwrap(),
            ("k2614.lab".to_string(), DEFAULT_SOCKET_PORT)
        );
        assert!(parse_socket_resource("TCPIP0::10.0.0.2::inst0::INSTR").is_err());
        assert!(parse_socket_resource("TCPIP0::10.0.0.2::notaport::SOCKET").is_err());
        assert!(parse_socket_resource("GPIB0::26::INSTR").is_err());
    }

    #[tokio::test]
    async fn writes_newline_terminated_commands() {
        let (client, mut device) = duplex(1024);
        let mut transport = StreamTransport::new("test", client, Duration::from_secs(1));

        transport.write("smua.source.output = 0").await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = device.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"smua.source.output = 0\n");
    }

    #[tokio::test]
    async fn reads_reply_and_strips_terminator() {
        let (client, mut device) = duplex(1024);
        let mut transport = StreamTransport::new("test", client, Duration::from_secs(1));

        device.write_all(b"1.00000e-03\r\n").await.unwrap();
        let reply = transport.read_line().await.unwrap();
        assert_eq!(reply, "1.00000e-03");
    }

    #[tokio::test]
    async fn silent_device_times_out() {
        let (client, _device) = duplex(1024);
        let mut transport = StreamTransport::new("test", client, Duration::from_millis(50));

        let err = transport.query("print(smua.measure.i())").await.unwrap_err();
        match err {
            KeithleyError::Timeout(command) => assert_eq!(command, "print(smua.measure.i())"),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn closed_device_is_io_error() {
        let (client, device) = duplex(1024);
        let mut transport = StreamTransport::new("test", client, Duration::from_secs(1));
        drop(device);

        let err = transport.read_line().await.unwrap_err();
        assert!(matches!(err, KeithleyError::Io(_)));
    }

    #[tokio::test]
    async fn late_reply_is_skipped_after_timeout() {
        let (client, device) = duplex(1024);
        let mut transport = StreamTransport::new("test", client, Duration::from_millis(80));

        let instrument = tokio::spawn(async move {
            let (reader, mut writer) = tokio::io::split(device);
            let mut lines = BufReader::new(reader).lines();

            lines.next_line().await.unwrap();
            tokio::time::sleep(Duration::from_millis(120)).await;
            writer.write_all(b"1.00000e-03\n").await.unwrap();

            lines.next_line().await.unwrap();
            writer.write_all(b"5.00000e+00\n").await.unwrap();
        });

        let err = transport.query("print(smua.measure.i())").await.unwrap_err();
        assert!(matches!(err, KeithleyError::Timeout(_)));
        assert_eq!(transport.stale_replies(), 1);

        let reply = transport.query("print(smua.measure.v())").await.unwrap();
        assert_eq!(reply, "5.00000e+00");
        assert_eq!(transport.stale_replies(), 0);
        instrument.await.unwrap();
    }

    #[tokio::test]
    async fn late_reply_already_received_is_discarded_before_write() {
        let (client, device) = duplex(1024);
        let mut transport = StreamTransport::new("test", client, Duration::from_millis(50));

        let instrument = tokio::spawn(async move {
            let (reader, mut writer) = tokio::io::split(device);
            let mut lines = BufReader::new(reader).lines();

            lines.next_line().await.unwrap();
            tokio::time::sleep(Duration::from_millis(80)).await;
            writer.write_all(b"1.00000e-03\n").await.unwrap();

            lines.next_line().await.unwrap();
            writer.write_all(b"5.00000e+00\n").await.unwrap();
        });

        assert!(transport.query("print(smua.measure.i())").await.is_err());
        // Let the late reply land before the next command
        tokio::time::sleep(Duration::from_millis(100)).await;

        let reply = transport.query("print(smua.measure.v())").await.unwrap();
        assert_eq!(reply, "5.00000e+00");
        instrument.await.unwrap();
    }
}

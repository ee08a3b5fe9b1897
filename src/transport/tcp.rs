//! SCPI over a raw TCP socket.
//!
//! Keysight LXI instruments, the B2900 series included, accept SCPI on TCP port
//! 5025 (`TCPIP0::<host>::5025::SOCKET`). Commands are newline terminated and
//! every query produces exactly one reply line, so no VISA library is needed.

use super::ScpiTransport;
use crate::error::{SmuError, SmuResult};
use crate::resource::ResourceAddress;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Default connection timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default reply timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Async SCPI client for a raw socket connection.
pub struct TcpTransport {
    stream: Mutex<Option<BufReader<TcpStream>>>,
    connected: AtomicBool,
    resource_name: String,
    timeout: Duration,
    write_terminator: String,
}

impl TcpTransport {
    /// Connect to `host:port`.
    ///
    /// # Errors
    /// `Timeout` if the connection is not established within `connect_timeout`,
    /// `Io` if the connection is refused.
    pub async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        reply_timeout: Duration,
    ) -> SmuResult<Self> {
        let resource_name = ResourceAddress::TcpSocket {
            board: 0,
            host: host.to_string(),
            port,
        }
        .to_string();

        let stream = timeout(connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| SmuError::Timeout {
                command: format!("connect {host}:{port}"),
                timeout: connect_timeout,
            })??;

        // Disable Nagle's algorithm, commands are tiny and latency bound
        stream.set_nodelay(true)?;

        tracing::info!(resource = %resource_name, "Connected to SCPI socket");

        Ok(Self {
            stream: Mutex::new(Some(BufReader::new(stream))),
            connected: AtomicBool::new(true),
            resource_name,
            timeout: reply_timeout,
            write_terminator: "\n".to_string(),
        })
    }

    /// Connect using a `TCPIP::host::port::SOCKET` resource string.
    pub async fn connect_resource(
        resource: &str,
        connect_timeout: Duration,
        reply_timeout: Duration,
    ) -> SmuResult<Self> {
        match resource.parse::<ResourceAddress>()? {
            ResourceAddress::TcpSocket { host, port, .. } => {
                Self::connect(&host, port, connect_timeout, reply_timeout).await
            }
            other => Err(SmuError::Configuration(format!(
                "'{other}' is not a raw socket resource"
            ))),
        }
    }

    /// Set the terminator appended to every command line.
    pub fn with_write_terminator(mut self, terminator: &str) -> Self {
        self.write_terminator = terminator.to_string();
        self
    }

    /// Drop any bytes that arrived without being asked for, so the next reply
    /// read belongs to the next query.
    fn flush_input_buffer(stream: &mut BufReader<TcpStream>) {
        let buffered = stream.buffer().len();
        if buffered > 0 {
            tracing::debug!("Flushing {} bytes from buffer", buffered);
            stream.consume(buffered);
        }

        let mut discard = [0u8; 256];
        loop {
            match stream.get_mut().try_read(&mut discard) {
                Ok(0) => break,
                Ok(n) => tracing::debug!("Flushed {} stale bytes from stream", n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }

    async fn send_line(
        stream: &mut BufReader<TcpStream>,
        command: &str,
        terminator: &str,
    ) -> SmuResult<()> {
        let line = format!("{command}{terminator}");
        stream.get_mut().write_all(line.as_bytes()).await?;
        stream.get_mut().flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ScpiTransport for TcpTransport {
    async fn write(&self, command: &str) -> SmuResult<()> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(SmuError::NotConnected)?;

        tracing::debug!("SCPI write: {:?}", command);
        Self::send_line(stream, command, &self.write_terminator).await
    }

    async fn query_with_timeout(&self, command: &str, reply_timeout: Duration) -> SmuResult<String> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(SmuError::NotConnected)?;

        Self::flush_input_buffer(stream);

        tracing::debug!("SCPI query: {:?}", command);
        Self::send_line(stream, command, &self.write_terminator).await?;

        let mut response = String::new();
        let result = match timeout(reply_timeout, stream.read_line(&mut response)).await {
            Ok(Ok(0)) => Err(SmuError::Transport(format!(
                "connection closed by device while waiting for reply to '{command}'"
            ))),
            Ok(Ok(_)) => {
                let trimmed = response.trim().to_string();
                tracing::debug!("SCPI response: {:?}", trimmed);
                return Ok(trimmed);
            }
            Ok(Err(e)) => Err(SmuError::Io(e)),
            Err(_) => Err(SmuError::Timeout {
                command: command.to_string(),
                timeout: reply_timeout,
            }),
        };

        // A reply that is late, partial or cut off would be read as the answer
        // to the next query, so the socket is not reused after a failed read.
        if let Some(mut stream) = guard.take() {
            let _ = stream.get_mut().shutdown().await;
        }
        self.connected.store(false, Ordering::SeqCst);
        tracing::warn!(
            resource = %self.resource_name,
            command = %command,
            "No usable reply, SCPI socket dropped"
        );
        result
    }

    async fn close(&self) -> SmuResult<()> {
        let mut guard = self.stream.lock().await;
        if let Some(mut stream) = guard.take() {
            // Best effort: the socket is dropped either way
            let _ = stream.get_mut().shutdown().await;
            tracing::info!(resource = %self.resource_name, "SCPI socket closed");
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn resource_name(&self) -> &str {
        &self.resource_name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Accept one connection and answer every line ending in `?` with `reply`.
    async fn echo_server(reply: &'static str) -> (String, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.ends_with('?') {
                    write_half
                        .write_all(format!("{reply}\n").as_bytes())
                        .await
                        .unwrap();
                }
            }
        });
        ("127.0.0.1".to_string(), port)
    }

    #[tokio::test]
    async fn test_query_round_trip() {
        let (host, port) = echo_server("Keysight Technologies,B2902B,MY0001,1.0").await;
        let transport = TcpTransport::connect(&host, port, DEFAULT_CONNECT_TIMEOUT, DEFAULT_TIMEOUT)
            .await
            .unwrap();

        let reply = transport.query("*IDN?").await.unwrap();
        assert_eq!(reply, "Keysight Technologies,B2902B,MY0001,1.0");
        assert_eq!(
            transport.resource_name(),
            format!("TCPIP0::127.0.0.1::{port}::SOCKET")
        );
    }

    #[tokio::test]
    async fn test_query_times_out_without_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            // Read but never answer
            while let Ok(n) = socket.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });

        let transport =
            TcpTransport::connect("127.0.0.1", port, DEFAULT_CONNECT_TIMEOUT, DEFAULT_TIMEOUT)
                .await
                .unwrap();
        let result = transport
            .query_with_timeout(":MEAS:VOLT? (@1)", Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(SmuError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_late_reply_is_not_read_by_next_query() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.starts_with(":MEAS:VOLT?") {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    let _ = write_half.write_all(b"+1.000000E+00\n").await;
                } else if line.starts_with(":MEAS:CURR?") {
                    let _ = write_half.write_all(b"+2.000000E-03\n").await;
                }
            }
        });

        let transport = TcpTransport::connect(
            "127.0.0.1",
            port,
            DEFAULT_CONNECT_TIMEOUT,
            Duration::from_millis(100),
        )
        .await
        .unwrap();

        let first = transport.query(":MEAS:VOLT? (@1)").await;
        assert!(matches!(first, Err(SmuError::Timeout { .. })));
        assert!(!transport.is_connected());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = transport.query(":MEAS:CURR? (@1)").await;
        assert!(matches!(second, Err(SmuError::NotConnected)));
    }

    #[tokio::test]
    async fn test_peer_close_during_query_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(socket).lines();
            // Read the query, then hang up without answering
            let _ = lines.next_line().await;
        });

        let transport =
            TcpTransport::connect("127.0.0.1", port, DEFAULT_CONNECT_TIMEOUT, DEFAULT_TIMEOUT)
                .await
                .unwrap();
        match transport.query("*IDN?").await {
            Err(SmuError::Transport(message)) => assert!(message.contains("connection closed")),
            other => panic!("expected Transport error, got {:?}", other),
        }
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.query("*IDN?").await,
            Err(SmuError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_calls() {
        let (host, port) = echo_server("1").await;
        let transport = TcpTransport::connect(&host, port, DEFAULT_CONNECT_TIMEOUT, DEFAULT_TIMEOUT)
            .await
            .unwrap();

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.write("*RST").await,
            Err(SmuError::NotConnected)
        ));
        assert!(matches!(
            transport.query("*OPC?").await,
            Err(SmuError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_resource_rejects_non_socket() {
        let result = TcpTransport::connect_resource(
            "GPIB0::23::INSTR",
            DEFAULT_CONNECT_TIMEOUT,
            DEFAULT_TIMEOUT,
        )
        .await;
        assert!(matches!(result, Err(SmuError::Configuration(_))));
    }
}

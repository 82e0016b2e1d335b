//! Serial transport adapter.
//!
//! Implements [`InstrumentTransport`] over an async serial port. The 22C
//! ships with RS-232 at 9600 baud, 8N1, no flow control, CRLF-terminated
//! lines in both directions.
//!
//! One mutex guards the port for the whole write+read of a round-trip, so
//! responses can never interleave across callers. A query that produces no
//! complete line within the configured timeout fails with
//! [`CryoconError::CommunicationTimeout`] and is never retried here; the
//! caller decides whether reissuing is safe.

use crate::config::CryoconConfig;
use crate::error::{CryoconError, Result};
use crate::protocol::LINE_TERMINATOR;
use crate::transport::InstrumentTransport;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::spawn_blocking;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, warn};

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` qualifies:
/// `tokio_serial::SerialStream` for real hardware, `tokio::io::DuplexStream`
/// for tests, or a TCP stream when the instrument hangs off a serial-to-LAN
/// bridge.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Serial link to a CryoCon 22C.
///
/// Construct with [`SerialTransport::new`] (opens on [`connect`]) or
/// [`SerialTransport::with_stream`] (adopts an already-open stream, e.g. a
/// duplex pipe in tests or a TCP connection to a serial bridge).
///
/// [`connect`]: InstrumentTransport::connect
pub struct SerialTransport {
    port_path: String,
    baud_rate: u32,
    timeout: Duration,
    port: Mutex<Option<BufReader<DynSerial>>>,
}

impl SerialTransport {
    /// Create an unconnected transport for the given port path.
    pub fn new(port_path: impl Into<String>, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            port_path: port_path.into(),
            baud_rate,
            timeout,
            port: Mutex::new(None),
        }
    }

    /// Create a transport from the connection settings in a config.
    pub fn from_config(config: &CryoconConfig) -> Self {
        Self::new(config.port.clone(), config.baud_rate, config.timeout)
    }

    /// Adopt an already-open byte stream as the instrument link.
    ///
    /// The transport starts connected; [`connect`](InstrumentTransport::connect)
    /// becomes a no-op and [`disconnect`](InstrumentTransport::disconnect)
    /// drops the stream.
    pub fn with_stream(stream: DynSerial, timeout: Duration) -> Self {
        Self {
            port_path: "<stream>".to_string(),
            baud_rate: 0,
            timeout,
            port: Mutex::new(Some(BufReader::new(stream))),
        }
    }
}

#[async_trait]
impl InstrumentTransport for SerialTransport {
    async fn connect(&self) -> Result<()> {
        let mut slot = self.port.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let port_path = self.port_path.clone();
        let baud_rate = self.baud_rate;

        // Port enumeration and opening are blocking calls in the underlying
        // crate; keep them off the async runtime.
        let stream = spawn_blocking(move || {
            tokio_serial::new(&port_path, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
                .map_err(|e| {
                    CryoconError::Connection(format!(
                        "failed to open serial port '{port_path}' @ {baud_rate} baud: {e}"
                    ))
                })
        })
        .await
        .map_err(|e| CryoconError::Connection(format!("serial open task failed: {e}")))??;

        let mut reader = BufReader::new(Box::new(stream) as DynSerial);
        let discarded = drain_stale_bytes(reader.get_mut(), 50).await;
        if discarded > 0 {
            debug!(discarded, "discarded stale bytes left on the port");
        }

        *slot = Some(reader);
        debug!(port = %self.port_path, baud = self.baud_rate, "serial port opened");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut slot = self.port.lock().await;
        if slot.take().is_some() {
            debug!(port = %self.port_path, "serial port closed");
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.port.lock().await.is_some()
    }

    async fn query(&self, command: &str) -> Result<String> {
        let mut slot = self.port.lock().await;
        let reader = slot.as_mut().ok_or(CryoconError::NotConnected)?;

        // Anything already buffered belongs to no outstanding query. A
        // leftover line would be returned as the answer to this command and
        // desynchronize every read after it, so it is discarded loudly.
        let buffered = reader.buffer().len();
        if buffered > 0 {
            warn!(
                buffered,
                command, "unsolicited bytes on the line before query, discarding"
            );
            reader.consume(buffered);
        }

        let framed = format!("{command}{LINE_TERMINATOR}");
        reader
            .get_mut()
            .write_all(framed.as_bytes())
            .await
            .map_err(|e| CryoconError::Connection(format!("serial write failed: {e}")))?;
        reader
            .get_mut()
            .flush()
            .await
            .map_err(|e| CryoconError::Connection(format!("serial flush failed: {e}")))?;
        debug!(command, "sent");

        let mut response = String::new();
        match tokio::time::timeout(self.timeout, reader.read_line(&mut response)).await {
            Ok(Ok(0)) => Err(CryoconError::Connection(
                "serial connection closed by peer".to_string(),
            )),
            Ok(Ok(_)) => {
                let trimmed = response.trim().to_string();
                debug!(command, response = %trimmed, "received");
                Ok(trimmed)
            }
            Ok(Err(e)) => Err(CryoconError::Connection(format!(
                "serial read failed: {e}"
            ))),
            Err(_) => Err(CryoconError::CommunicationTimeout(self.timeout)),
        }
    }
}

/// Read and discard whatever is immediately available on the port.
///
/// Returns the number of bytes thrown away. Used right after opening, where
/// the instrument may have queued output for a previous session.
async fn drain_stale_bytes<R: AsyncRead + Unpin>(port: &mut R, budget_ms: u64) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(budget_ms);
    let mut total = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total += n,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn query_frames_command_and_trims_response() {
        let (mut host, device) = tokio::io::duplex(64);
        let transport = SerialTransport::with_stream(Box::new(device), Duration::from_secs(1));

        let echo = tokio::spawn(async move {
            let mut buf = vec![0u8; 32];
            let n = host.read(&mut buf).await.unwrap();
            let received = String::from_utf8_lossy(&buf[..n]).to_string();
            host.write_all(b"20.000K\r\n").await.unwrap();
            received
        });

        let response = transport.query("loop 1:setpt?").await.unwrap();
        assert_eq!(response, "20.000K");

        let sent = echo.await.unwrap();
        assert_eq!(sent, "loop 1:setpt?\r\n");
    }

    #[tokio::test]
    async fn query_times_out_without_response() {
        let (_host, device) = tokio::io::duplex(64);
        let transport = SerialTransport::with_stream(Box::new(device), Duration::from_millis(50));

        let err = transport.query("control?").await.unwrap_err();
        assert!(matches!(err, CryoconError::CommunicationTimeout(_)));
    }

    #[tokio::test]
    async fn query_without_connection_fails() {
        let transport = SerialTransport::new("/dev/null", 9600, Duration::from_millis(50));
        assert!(!transport.is_connected().await);

        let err = transport.query("control?").await.unwrap_err();
        assert!(matches!(err, CryoconError::NotConnected));
    }

    #[tokio::test]
    async fn disconnect_drops_the_stream() {
        let (_host, device) = tokio::io::duplex(64);
        let transport = SerialTransport::with_stream(Box::new(device), Duration::from_millis(50));

        assert!(transport.is_connected().await);
        transport.disconnect().await.unwrap();
        assert!(!transport.is_connected().await);
        assert!(matches!(
            transport.query("control?").await,
            Err(CryoconError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn drain_discards_stale_bytes() {
        let (mut host, mut device) = tokio::io::duplex(64);
        host.write_all(b"stale junk").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let discarded = drain_stale_bytes(&mut device, 50).await;
        assert_eq!(discarded, 10);
    }
}

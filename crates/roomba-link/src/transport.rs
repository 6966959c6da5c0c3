//! Byte transports the driver can talk through.
//!
//! - [`SerialTransport`] – the trait the link actor drives.
//! - [`SerialPortTransport`] – a local serial device (`/dev/ttyUSB0`, `COM3`).
//! - [`TcpTransport`] – a serial-over-TCP bridge such as `ser2net`.
//!
//! Reads are non-blocking: [`SerialTransport::read_available`] returns
//! whatever has already arrived and `Ok(0)` when nothing is waiting.  The
//! link actor decides when to poll.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use roomba_types::RoombaError;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::spawn_blocking;
use tracing::{debug, info};

/// Every link to the robot must implement this trait.
///
/// # Contract
///
/// * `write` sends the whole slice or fails.
/// * `read_available` never waits for data to arrive.
/// * `set_rts` drives the RTS line used to wake a sleeping Roomba.  Links
///   without modem control lines report a transport error.
#[async_trait]
pub trait SerialTransport: Send {
    async fn open(&mut self) -> Result<(), RoombaError>;

    async fn close(&mut self) -> Result<(), RoombaError>;

    fn is_open(&self) -> bool;

    async fn write(&mut self, bytes: &[u8]) -> Result<(), RoombaError>;

    /// Copy already-received bytes into `buf`, returning how many were copied.
    async fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, RoombaError>;

    async fn set_rts(&mut self, _level: bool) -> Result<(), RoombaError> {
        Err(RoombaError::Transport(format!(
            "{} has no RTS line",
            self.describe()
        )))
    }

    /// Human-readable name of the link for logs.
    fn describe(&self) -> String;
}

// ─────────────────────────────────────────────────────────────────────────────
// Local serial port
// ─────────────────────────────────────────────────────────────────────────────

const SERIAL_TIMEOUT: Duration = Duration::from_millis(50);

type SharedPort = Arc<Mutex<Box<dyn serialport::SerialPort>>>;

/// A local serial device opened with 8N1 framing.
///
/// `serialport` is a blocking API, so every call on the device runs on
/// Tokio's blocking pool and the link actor's worker never stalls on the
/// UART.
pub struct SerialPortTransport {
    path: String,
    baud_rate: u32,
    port: Option<SharedPort>,
}

impl SerialPortTransport {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            port: None,
        }
    }

    /// Run `f` against the open port on the blocking pool.
    async fn with_port<T, F>(&self, f: F) -> Result<T, RoombaError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Box<dyn serialport::SerialPort>) -> Result<T, RoombaError> + Send + 'static,
    {
        let port = self.port.clone().ok_or(RoombaError::NotConnected)?;
        spawn_blocking(move || {
            let mut guard = port
                .lock()
                .map_err(|_| RoombaError::Transport("serial port lock poisoned".into()))?;
            f(&mut *guard)
        })
        .await
        .map_err(join_error)?
    }
}

fn serial_error(e: serialport::Error) -> RoombaError {
    RoombaError::Transport(e.to_string())
}

fn join_error(e: tokio::task::JoinError) -> RoombaError {
    RoombaError::Transport(format!("serial I/O task failed: {e}"))
}

#[async_trait]
impl SerialTransport for SerialPortTransport {
    async fn open(&mut self) -> Result<(), RoombaError> {
        let (path, baud_rate) = (self.path.clone(), self.baud_rate);
        let port = spawn_blocking(move || {
            serialport::new(&path, baud_rate)
                .timeout(SERIAL_TIMEOUT)
                .open()
                .map_err(|e| {
                    RoombaError::Transport(format!("failed to open serial port {path}: {e}"))
                })
        })
        .await
        .map_err(join_error)??;
        info!(port = %self.path, baud = self.baud_rate, "serial port opened");
        self.port = Some(Arc::new(Mutex::new(port)));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), RoombaError> {
        if self.port.take().is_some() {
            debug!(port = %self.path, "serial port closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), RoombaError> {
        let frame = bytes.to_vec();
        self.with_port(move |port| {
            port.write_all(&frame)?;
            port.flush()?;
            Ok(())
        })
        .await
    }

    async fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, RoombaError> {
        let capacity = buf.len();
        let chunk = self
            .with_port(move |port| {
                let waiting = port.bytes_to_read().map_err(serial_error)? as usize;
                if waiting == 0 {
                    return Ok(Vec::new());
                }
                let mut chunk = vec![0u8; waiting.min(capacity)];
                let n = port.read(&mut chunk)?;
                chunk.truncate(n);
                Ok(chunk)
            })
            .await?;
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }

    async fn set_rts(&mut self, level: bool) -> Result<(), RoombaError> {
        self.with_port(move |port| port.write_request_to_send(level).map_err(serial_error))
            .await
    }

    fn describe(&self) -> String {
        format!("serial:{}@{}", self.path, self.baud_rate)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Serial-over-TCP bridge
// ─────────────────────────────────────────────────────────────────────────────

/// Raw TCP connection to a serial bridge.
pub struct TcpTransport {
    addr: String,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            stream: None,
        }
    }
}

#[async_trait]
impl SerialTransport for TcpTransport {
    async fn open(&mut self) -> Result<(), RoombaError> {
        let stream = TcpStream::connect(&self.addr).await.map_err(|e| {
            RoombaError::Transport(format!("failed to connect to {}: {e}", self.addr))
        })?;
        stream.set_nodelay(true)?;
        info!(addr = %self.addr, "tcp serial bridge connected");
        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), RoombaError> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), RoombaError> {
        let stream = self.stream.as_mut().ok_or(RoombaError::NotConnected)?;
        stream.write_all(bytes).await?;
        Ok(())
    }

    async fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, RoombaError> {
        let stream = self.stream.as_mut().ok_or(RoombaError::NotConnected)?;
        match stream.try_read(buf) {
            Ok(0) => {
                self.stream = None;
                Err(RoombaError::Transport(format!(
                    "{} closed the connection",
                    self.addr
                )))
            }
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        format!("tcp:{}", self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_transport_writes_and_reads() -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await?;
            let mut req = [0u8; 2];
            sock.read_exact(&mut req).await?;
            sock.write_all(&[0xAB, 0xCD]).await?;
            Ok::<_, std::io::Error>(req)
        });

        let mut transport = TcpTransport::new(addr.to_string());
        transport.open().await?;
        assert!(transport.is_open());
        transport.write(&[142, 2]).await?;

        let req = server.await??;
        assert_eq!(req, [142, 2]);

        let mut buf = [0u8; 8];
        let mut got = 0;
        for _ in 0..100 {
            got = transport.read_available(&mut buf).await?;
            if got > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(&buf[..got], &[0xAB, 0xCD]);
        Ok(())
    }

    #[tokio::test]
    async fn tcp_transport_has_no_rts() {
        let mut transport = TcpTransport::new("127.0.0.1:1");
        assert!(matches!(
            transport.set_rts(true).await,
            Err(RoombaError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn writing_before_open_fails() {
        let mut transport = SerialPortTransport::new("/dev/null-roomba", 57600);
        assert_eq!(
            transport.write(&[128]).await,
            Err(RoombaError::NotConnected)
        );
        assert_eq!(
            transport.set_rts(false).await,
            Err(RoombaError::NotConnected)
        );
    }

    #[tokio::test]
    async fn opening_a_missing_device_reports_transport_error() {
        let mut transport = SerialPortTransport::new("/dev/roomba-does-not-exist", 57600);
        assert!(matches!(
            transport.open().await,
            Err(RoombaError::Transport(_))
        ));
        assert!(!transport.is_open());
    }
}

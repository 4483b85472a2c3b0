//! Byte transports to the controller module.
//!
//! The driver talks to the controller over a byte stream: a local serial
//! port in production, `tcp://host:port` for remote sticks, an in-memory
//! duplex in tests. [`SerialBinding`] is the reopenable factory (soft
//! reset drops the connection and the driver must come back);
//! [`SerialTransport`] is one open connection.
//!
//! Disconnects surface as `Ok(0)` or an error from `read`; the driver
//! answers by reopening through the binding.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Where the controller lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// A local serial device path
    Serial(String),
    /// A TCP-attached stick (`tcp://host:port`)
    Tcp(String),
}

impl Endpoint {
    /// Parse a connection string: `tcp://host:port` or a device path.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.strip_prefix("tcp://") {
            Some(address) => Endpoint::Tcp(address.to_string()),
            None => Endpoint::Serial(value.to_string()),
        }
    }
}

/// One open byte stream to the controller.
#[async_trait]
pub trait SerialTransport: Send {
    /// Read available bytes; `Ok(0)` means the line disconnected.
    async fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize>;

    /// Write all bytes.
    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
}

/// Reopenable transport factory.
#[async_trait]
pub trait SerialBinding: Send + 'static {
    /// The transport this binding opens.
    type Transport: SerialTransport;

    /// Open a fresh connection.
    async fn open(&mut self) -> io::Result<Self::Transport>;
}

/// [`SerialTransport`] over any async byte stream.
pub struct IoTransport<S> {
    stream: S,
}

impl<S> IoTransport<S> {
    /// Wrap a stream.
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl<S> SerialTransport for IoTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buffer).await
    }

    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }
}

/// Production binding for serial ports and TCP sticks.
pub struct EndpointBinding {
    endpoint: Endpoint,
    baud_rate: u32,
}

impl EndpointBinding {
    /// Standard Serial API baud rate.
    pub const BAUD_RATE: u32 = 115_200;

    /// Binding for the given endpoint.
    #[must_use]
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint, baud_rate: Self::BAUD_RATE }
    }
}

#[async_trait]
impl SerialBinding for EndpointBinding {
    type Transport = BoxedTransport;

    async fn open(&mut self) -> io::Result<Self::Transport> {
        match &self.endpoint {
            Endpoint::Tcp(address) => {
                let stream = TcpStream::connect(address).await?;
                stream.set_nodelay(true)?;
                Ok(BoxedTransport(Box::new(IoTransport::new(stream))))
            },
            Endpoint::Serial(path) => {
                let builder = tokio_serial::new(path, self.baud_rate);
                let stream = tokio_serial::SerialStream::open(&builder)
                    .map_err(|error| io::Error::new(io::ErrorKind::Other, error))?;
                Ok(BoxedTransport(Box::new(IoTransport::new(stream))))
            },
        }
    }
}

/// Type-erased transport, letting one binding serve both stream kinds.
pub struct BoxedTransport(Box<dyn SerialTransport>);

#[async_trait]
impl SerialTransport for BoxedTransport {
    async fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        self.0.read(buffer).await
    }

    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.0.write_all(bytes).await
    }
}

/// Open through the binding with retries spaced one second apart.
pub async fn open_with_retries<B: SerialBinding>(
    binding: &mut B,
    attempts: u8,
) -> io::Result<B::Transport> {
    let mut last_error = None;
    for attempt in 1..=attempts.max(1) {
        match binding.open().await {
            Ok(transport) => return Ok(transport),
            Err(error) => {
                tracing::warn!(attempt, %error, "failed to open controller connection");
                last_error = Some(error);
                if attempt < attempts {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
        }
    }
    Err(last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no attempts made")))
}

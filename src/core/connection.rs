//! TCP (and optionally TLS) transport.
//!
//! [`TcpConnector`] opens sockets on the runtime it was created on. Each
//! socket gets a writer task fed through a channel and a reader task that
//! decodes frames and hands them to the owning bridge.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::bridge::{ConnectionToken, PhysicalBridge};
use crate::core::builder::Options;
use crate::core::transport::{Connector, Transport};
use crate::proto::codec::{Decoder, Encoder};
use crate::proto::error::{ConnectionFailureType, Error, Result};
use crate::proto::frame::Frame;

const READ_BUFFER: usize = 4096;

/// Why the reader stopped.
#[derive(Debug)]
pub(crate) enum ReadError {
    /// The peer closed the socket.
    Closed,
    /// The socket failed.
    Io(io::Error),
    /// The byte stream is not valid RESP.
    Protocol(String),
}

impl ReadError {
    fn failure(&self) -> ConnectionFailureType {
        match self {
            ReadError::Closed => ConnectionFailureType::SocketClosed,
            ReadError::Io(_) => ConnectionFailureType::SocketFailure,
            ReadError::Protocol(_) => ConnectionFailureType::ProtocolFailure,
        }
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::Closed => f.write_str("connection closed by peer"),
            ReadError::Io(e) => write!(f, "{}", e),
            ReadError::Protocol(e) => write!(f, "invalid reply: {}", e),
        }
    }
}

/// Frame reader over any async byte stream.
pub(crate) struct FrameReader<R> {
    stream: R,
    decoder: Decoder,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub(crate) fn new(stream: R) -> Self {
        Self {
            stream,
            decoder: Decoder::new(),
        }
    }

    /// Reads the next complete frame, buffering partial reads.
    pub(crate) async fn read_frame(&mut self) -> std::result::Result<Frame, ReadError> {
        let mut buf = vec![0u8; READ_BUFFER];
        loop {
            match self.decoder.decode() {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {
                    let n = self.stream.read(&mut buf).await.map_err(ReadError::Io)?;
                    if n == 0 {
                        return Err(ReadError::Closed);
                    }
                    self.decoder.append(&buf[..n]);
                }
                Err(e) => return Err(ReadError::Protocol(e)),
            }
        }
    }
}

/// A live socket as seen by a bridge.
pub(crate) struct TcpTransport {
    encoder: Mutex<Encoder>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Splits `stream` into writer and reader tasks on `handle`.
    pub(crate) fn start<S>(
        handle: &Handle,
        stream: S,
        bridge: Arc<PhysicalBridge>,
        token: ConnectionToken,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

        let write_bridge = bridge.clone();
        let write_task = handle.spawn(async move {
            while let Some(data) = rx.recv().await {
                if let Err(e) = writer.write_all(&data).await {
                    warn!(endpoint = %write_bridge.endpoint(), error = %e, "socket write failed");
                    write_bridge.on_connection_failed(
                        token,
                        ConnectionFailureType::SocketFailure,
                        e.to_string(),
                    );
                    return;
                }
            }
            let _ = writer.shutdown().await;
        });

        let read_task = handle.spawn(async move {
            let mut reader = FrameReader::new(reader);
            loop {
                match reader.read_frame().await {
                    Ok(frame) => bridge.on_reply(token, frame),
                    Err(e) => {
                        debug!(endpoint = %bridge.endpoint(), error = %e, "reader stopped");
                        bridge.on_connection_failed(token, e.failure(), e.to_string());
                        return;
                    }
                }
            }
        });

        Arc::new(Self {
            encoder: Mutex::new(Encoder::new()),
            outbound: Mutex::new(Some(tx)),
            tasks: Mutex::new(vec![write_task, read_task]),
        })
    }
}

impl Transport for TcpTransport {
    fn write(&self, frame: &Frame) -> io::Result<()> {
        self.encoder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .encode(frame);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        let data = self
            .encoder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if data.is_empty() {
            return Ok(());
        }
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        match outbound.as_ref() {
            Some(tx) => tx
                .send(data)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed")),
        }
    }

    fn close(&self) {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "tls")] {
        use crate::core::tls::TlsConnectorInner;

        async fn start_tls(
            handle: Handle,
            stream: TcpStream,
            bridge: Arc<PhysicalBridge>,
            token: ConnectionToken,
            tls: TlsConnectorInner,
        ) -> io::Result<()> {
            let host = bridge
                .endpoint()
                .rsplit_once(':')
                .map_or(bridge.endpoint(), |(host, _)| host)
                .to_string();
            let stream = tls.connect(host, stream).await?;
            let transport = TcpTransport::start(&handle, stream, bridge.clone(), token);
            bridge.on_connected(token, transport);
            Ok(())
        }
    } else {
        /// Stands in for the TLS connector when the `tls` feature is off.
        #[derive(Debug, Clone)]
        enum TlsConnectorInner {}

        async fn start_tls(
            _handle: Handle,
            _stream: TcpStream,
            _bridge: Arc<PhysicalBridge>,
            _token: ConnectionToken,
            tls: TlsConnectorInner,
        ) -> io::Result<()> {
            match tls {}
        }
    }
}

/// Opens TCP (or TLS) connections for bridges.
pub struct TcpConnector {
    handle: Handle,
    connect_timeout: Duration,
    tls: Option<TlsConnectorInner>,
}

impl TcpConnector {
    /// Creates a connector bound to the current runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when called outside a tokio runtime
    /// or when TLS is requested without the `tls` feature.
    pub fn new(options: &Options) -> Result<Self> {
        let handle = Handle::try_current().map_err(|_| Error::InvalidArgument {
            message: "TcpConnector must be created inside a tokio runtime".to_string(),
        })?;
        let tls = if options.tls {
            Some(Self::tls_connector()?)
        } else {
            None
        };
        Ok(Self {
            handle,
            connect_timeout: options.connect_timeout,
            tls,
        })
    }

    #[cfg(feature = "tls")]
    fn tls_connector() -> Result<TlsConnectorInner> {
        TlsConnectorInner::new()
    }

    #[cfg(not(feature = "tls"))]
    fn tls_connector() -> Result<TlsConnectorInner> {
        Err(Error::InvalidArgument {
            message: "TLS requested but the `tls` feature is disabled".to_string(),
        })
    }

    async fn open(
        handle: Handle,
        bridge: Arc<PhysicalBridge>,
        token: ConnectionToken,
        tls: Option<TlsConnectorInner>,
    ) -> io::Result<()> {
        let stream = TcpStream::connect(bridge.endpoint()).await?;
        stream.set_nodelay(true)?;
        match tls {
            Some(tls) => start_tls(handle, stream, bridge, token, tls).await,
            None => {
                let transport = TcpTransport::start(&handle, stream, bridge.clone(), token);
                bridge.on_connected(token, transport);
                Ok(())
            }
        }
    }
}

impl Connector for TcpConnector {
    fn connect(&self, bridge: Arc<PhysicalBridge>, token: ConnectionToken) {
        let attempt = Self::open(self.handle.clone(), bridge.clone(), token, self.tls.clone());
        let limit = self.connect_timeout;
        self.handle.spawn(async move {
            let detail = match tokio::time::timeout(limit, attempt).await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("connect timeout after {}ms", limit.as_millis()),
            };
            warn!(endpoint = %bridge.endpoint(), %detail, "connect failed");
            bridge.on_connection_failed(token, ConnectionFailureType::UnableToConnect, detail);
        });
    }
}

impl fmt::Debug for TcpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnector")
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

//! A single DNS-over-TLS connection.
//!
//! A [`TlsSocket`] owns one TLS stream to a server. The stream is driven by
//! a task of its own that writes queued queries, reads responses and hands
//! them to the socket's observer. Messages are framed as described in
//! RFC 7858, i.e., every message is preceded by its length as a two octet
//! value in network byte order.
//!
//! The task ends when the server closes the connection, when reading or
//! writing fails, when the connection has been idle for too long or when the
//! socket is shut down. Either way, the observer learns about it through
//! [`SocketObserver::on_closed`] after the TLS session has been closed.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::boxed::Box;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_rustls::rustls::client::Resumption;
use tokio_rustls::rustls::crypto::ring::default_provider;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::connect::connect_stream;
use crate::error::Error;
use crate::server::{Protocol, ServerIdentity};
use crate::session_cache::SessionCache;
use crate::socket::{BoxFuture, Socket, SocketFactory, SocketObserver};
use crate::verify::ServerVerifier;

/// Capacity of the channel between the reader and the I/O loop.
const READ_REPLY_CHAN_CAP: usize = 8;

/// How long to wait for the TLS close to go out.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// The largest query body that still fits a frame.
///
/// The length covers the two octet ID as well.
const MAX_BODY_LEN: usize = u16::MAX as usize - 2;

//------------ TlsConfig ------------------------------------------------------

/// TLS settings shared by all connections.
#[derive(Clone, Debug)]
pub struct TlsConfig {
    /// The trust anchors for servers with a name.
    roots: RootCertStore,
}

impl TlsConfig {
    /// Creates a configuration trusting the Mozilla root program.
    pub fn new() -> Self {
        Self {
            roots: RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            },
        }
    }

    /// Creates a configuration without any trust anchors.
    pub fn without_roots() -> Self {
        Self {
            roots: RootCertStore::empty(),
        }
    }

    /// Adds a trust anchor, e.g., the certificate of a private CA.
    pub fn add_anchor(
        &mut self,
        cert: CertificateDer<'_>,
    ) -> Result<(), tokio_rustls::rustls::Error> {
        self.roots.add(cert)
    }

    /// Returns the number of trust anchors.
    pub fn anchor_count(&self) -> usize {
        self.roots.len()
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self::new()
    }
}

//------------ TlsSocketFactory -----------------------------------------------

/// Creates TLS sockets.
#[derive(Clone, Debug)]
pub struct TlsSocketFactory {
    /// Timeouts and limits.
    config: Config,

    /// The trust anchors.
    roots: Arc<RootCertStore>,
}

impl TlsSocketFactory {
    /// Creates a new factory.
    pub fn new(config: Config, tls: TlsConfig) -> Self {
        Self {
            config,
            roots: Arc::new(tls.roots),
        }
    }
}

impl SocketFactory for TlsSocketFactory {
    fn create(
        &self,
        server: ServerIdentity,
        mark: u32,
        observer: Arc<dyn SocketObserver>,
        cache: Arc<SessionCache>,
    ) -> BoxFuture<'_, Result<Box<dyn Socket>, Error>> {
        Box::pin(async move {
            let socket = TlsSocket::connect(
                &server,
                mark,
                observer,
                cache,
                &self.config,
                self.roots.clone(),
            )
            .await?;
            Ok(Box::new(socket) as Box<dyn Socket>)
        })
    }
}

//------------ TlsSocket ------------------------------------------------------

/// A connection to a DNS-over-TLS server.
#[derive(Debug)]
pub struct TlsSocket {
    /// Commands for the I/O task.
    sender: mpsc::UnboundedSender<Command>,

    /// The I/O task. Taken by shutdown.
    worker: Option<JoinHandle<()>>,
}

impl TlsSocket {
    /// Connects to a server.
    ///
    /// Both the TCP connect and the TLS handshake have to finish within the
    /// connect timeout of `config`.
    pub async fn connect(
        server: &ServerIdentity,
        mark: u32,
        observer: Arc<dyn SocketObserver>,
        cache: Arc<SessionCache>,
        config: &Config,
        roots: Arc<RootCertStore>,
    ) -> Result<Self, Error> {
        if server.protocol() != Protocol::Tcp {
            return Err(Error::UnsupportedProtocol);
        }
        let server_name = match server.name() {
            Some(name) => ServerName::try_from(name.to_owned())
                .map_err(|_| Error::InvalidServerName)?,
            None => ServerName::from(server.addr().ip()),
        };

        let provider = Arc::new(default_provider());
        let verifier = ServerVerifier::new(
            server,
            roots,
            provider.signature_verification_algorithms,
        );
        let mut tls = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|err| {
                Error::Tls(Arc::new(io::Error::new(io::ErrorKind::Other, err)))
            })?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();
        tls.resumption = Resumption::store(cache);
        let connector = TlsConnector::from(Arc::new(tls));

        let connecting = async {
            let tcp = connect_stream(server.addr(), mark)
                .await
                .map_err(|err| Error::Connect(Arc::new(err)))?;
            connector
                .connect(server_name, tcp)
                .await
                .map_err(|err| Error::Tls(Arc::new(err)))
        };
        let stream = match timeout(config.connect_timeout(), connecting).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                debug!(%server, mark, %err, "connect failed");
                return Err(err);
            }
            Err(_) => {
                debug!(%server, mark, "connect timed out");
                return Err(Error::ConnectTimeout);
            }
        };
        debug!(%server, mark, "connected");
        Ok(Self::start(stream, observer, config))
    }

    /// Starts the I/O task on an established stream.
    fn start<Stream>(
        stream: Stream,
        observer: Arc<dyn SocketObserver>,
        config: &Config,
    ) -> Self
    where
        Stream: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        let io = IoLoop {
            stream,
            receiver,
            observer,
            idle_timeout: config.idle_timeout(),
            max_response_size: config.max_response_size(),
        };
        Self {
            sender,
            worker: Some(tokio::spawn(io.run())),
        }
    }
}

impl Socket for TlsSocket {
    fn query(&self, id: u16, body: Bytes) -> bool {
        match frame(id, &body) {
            Some(frame) => self.sender.send(Command::Enqueue(frame)).is_ok(),
            None => {
                debug!(id, len = body.len(), "query too long for a frame");
                false
            }
        }
    }

    fn shutdown(mut self: Box<Self>) -> BoxFuture<'static, ()> {
        let _ = self.sender.send(Command::Shutdown);
        let worker = self.worker.take();
        Box::pin(async move {
            if let Some(worker) = worker {
                if let Err(err) = worker.await {
                    warn!(%err, "TLS socket task failed");
                }
            }
        })
    }
}

impl Drop for TlsSocket {
    fn drop(&mut self) {
        if self.worker.is_some() {
            warn!("TLS socket dropped without shutdown");
            let _ = self.sender.send(Command::Shutdown);
        }
    }
}

/// Builds the frame for a query.
///
/// Returns `None` if the body is too long.
fn frame(id: u16, body: &[u8]) -> Option<Bytes> {
    if body.len() > MAX_BODY_LEN {
        return None;
    }
    let mut frame = BytesMut::with_capacity(body.len() + 4);
    frame.put_u16((body.len() + 2) as u16);
    frame.put_u16(id);
    frame.extend_from_slice(body);
    Some(frame.freeze())
}

//------------ Command --------------------------------------------------------

/// A request to the I/O task.
#[derive(Debug)]
enum Command {
    /// Write a frame.
    Enqueue(Bytes),

    /// Close the connection.
    Shutdown,
}

//------------ IoLoop ---------------------------------------------------------

/// The state of the I/O task.
struct IoLoop<Stream> {
    /// The connection.
    stream: Stream,

    /// Incoming commands.
    receiver: mpsc::UnboundedReceiver<Command>,

    /// Where responses and the close go.
    observer: Arc<dyn SocketObserver>,

    /// Close the connection after this long without traffic.
    idle_timeout: Duration,

    /// Responses longer than this are dropped.
    max_response_size: usize,
}

impl<Stream> IoLoop<Stream>
where
    Stream: AsyncRead + AsyncWrite,
{
    /// Runs the I/O loop until the connection ends.
    async fn run(self) {
        let IoLoop {
            stream,
            mut receiver,
            observer,
            idle_timeout,
            max_response_size,
        } = self;

        let (reply_sender, mut reply_receiver) =
            mpsc::channel::<Bytes>(READ_REPLY_CHAN_CAP);
        let (read_stream, mut write_stream) = tokio::io::split(stream);
        let reader_fut = reader(read_stream, reply_sender, max_response_size);
        tokio::pin!(reader_fut);

        let idle = sleep(idle_timeout);
        tokio::pin!(idle);

        let mut reqmsg: Option<Bytes> = None;
        let mut reqmsg_offset = 0;
        let mut needs_flush = false;

        loop {
            let do_write = reqmsg.is_some();
            let msg = reqmsg.clone().unwrap_or_default();

            tokio::select! {
                biased;
                Some(response) = reply_receiver.recv() => {
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                    observer.on_response(response);
                }
                res = &mut reader_fut => {
                    match res {
                        Ok(()) => debug!("server closed the connection"),
                        Err(err) => debug!(%err, "reading failed"),
                    }
                    break;
                }
                res = write_or_flush(
                    &mut write_stream, &msg[reqmsg_offset..]
                ), if do_write || needs_flush => {
                    match res {
                        Ok(0) if do_write => {
                            debug!("connection closed while writing");
                            break;
                        }
                        Ok(len) if do_write => {
                            idle.as_mut().reset(Instant::now() + idle_timeout);
                            reqmsg_offset += len;
                            if reqmsg_offset >= msg.len() {
                                reqmsg = None;
                                reqmsg_offset = 0;
                                needs_flush = true;
                            }
                        }
                        Ok(_) => needs_flush = false,
                        Err(err) => {
                            let err = Error::StreamWriteError(Arc::new(err));
                            debug!(%err, "closing connection");
                            break;
                        }
                    }
                }
                cmd = receiver.recv(), if !do_write => {
                    match cmd {
                        Some(Command::Enqueue(frame)) => {
                            reqmsg = Some(frame);
                        }
                        Some(Command::Shutdown) | None => {
                            trace!("shutting down");
                            break;
                        }
                    }
                }
                _ = &mut idle => {
                    debug!("connection idle, closing");
                    break;
                }
            }
        }

        // The reader may have queued responses right before it ended.
        while let Ok(response) = reply_receiver.try_recv() {
            observer.on_response(response);
        }

        // Queries sent from here on fail and end up with the reconnect.
        drop(receiver);
        if timeout(CLOSE_TIMEOUT, write_stream.shutdown()).await.is_err() {
            trace!("TLS close timed out");
        }
        observer.on_closed();
    }
}

/// Writes some of `buf` or, if it is empty, flushes the stream.
///
/// Returns the number of octets written.
async fn write_or_flush<Write: AsyncWrite + Unpin>(
    sock: &mut Write,
    buf: &[u8],
) -> io::Result<usize> {
    if buf.is_empty() {
        sock.flush().await.map(|()| 0)
    } else {
        sock.write(buf).await
    }
}

/// Reads response frames and sends them to the I/O loop.
///
/// Returns `Ok(())` if the server closes the connection between two frames
/// or if the loop is gone.
async fn reader<Read: AsyncRead + Unpin>(
    mut sock: Read,
    sender: mpsc::Sender<Bytes>,
    max_response_size: usize,
) -> Result<(), Error> {
    loop {
        let len = match sock.read_u16().await {
            Ok(len) => usize::from(len),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(())
            }
            Err(err) => return Err(Error::StreamReadError(Arc::new(err))),
        };

        if len > max_response_size {
            debug!(len, "discarding oversized response");
            let skipped = tokio::io::copy(
                &mut (&mut sock).take(len as u64),
                &mut tokio::io::sink(),
            )
            .await
            .map_err(|err| Error::StreamReadError(Arc::new(err)))?;
            if skipped < len as u64 {
                return Err(Error::StreamReadError(Arc::new(
                    io::ErrorKind::UnexpectedEof.into(),
                )));
            }
            continue;
        }

        let mut buf = vec![0; len];
        sock.read_exact(&mut buf)
            .await
            .map_err(|err| Error::StreamReadError(Arc::new(err)))?;
        if sender.send(buf.into()).await.is_err() {
            return Ok(());
        }
    }
}

//============ Tests =========================================================

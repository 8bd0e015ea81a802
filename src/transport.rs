//! A pipelining connection to a single server.
//!
//! A [`Transport`] keeps at most one socket to its server and multiplexes
//! all queries over it. The socket is created on demand when the first
//! query arrives. When the socket closes while queries are still
//! outstanding, a new one is created and the queries are sent again, until
//! each has been tried the configured number of times.
//!
//! Connecting happens on a worker task. Only one worker exists at a time;
//! a new worker first waits for the previous one to finish.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::boxed::Box;
use std::future::Future;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::Error;
use crate::query_map::{QueryFuture, QueryMap};
use crate::server::ServerIdentity;
use crate::session_cache::SessionCache;
use crate::socket::{Socket, SocketFactory, SocketObserver};

//------------ Transport ------------------------------------------------------

/// The queries and the connection for one server and mark.
pub struct Transport {
    /// The shared part.
    inner: Arc<Inner>,
}

impl Transport {
    /// Creates a new transport.
    ///
    /// No connection is made until the first query.
    pub fn new(
        server: ServerIdentity,
        mark: u32,
        factory: Arc<dyn SocketFactory>,
        config: &Config,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache: Arc::new(SessionCache::new(
                    config.session_cache_capacity(),
                )),
                queries: QueryMap::new(),
                state: Mutex::new(State {
                    socket: SocketState::Idle,
                    closing: false,
                    worker: None,
                }),
                server,
                mark,
                factory,
                max_tries: config.max_tries(),
            }),
        }
    }

    /// Returns the server.
    pub fn server(&self) -> &ServerIdentity {
        &self.inner.server
    }

    /// Returns the socket mark.
    pub fn mark(&self) -> u32 {
        self.inner.mark
    }

    /// Returns the number of queries waiting for a response.
    pub fn outstanding(&self) -> usize {
        self.inner.queries.len()
    }

    /// Returns the transport's TLS session cache.
    pub fn session_cache(&self) -> &Arc<SessionCache> {
        &self.inner.cache
    }

    /// Sends a query.
    ///
    /// The query is recorded and handed to the socket right away, so the
    /// returned future only waits for the result. The response carries the
    /// ID of `query`.
    pub fn query(
        &self,
        query: &[u8],
    ) -> impl Future<Output = Result<Bytes, Error>> + Send + 'static {
        let recorded = self.inner.send_query(query);
        async move { recorded?.result().await }
    }

    /// Fails all outstanding queries and closes the connection.
    ///
    /// Afterwards, all queries fail immediately.
    pub async fn shutdown(&self) {
        let worker = {
            let mut state = self.inner.lock();
            state.closing = true;
            state.worker.take()
        };
        self.inner.queries.clear();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                warn!(%err, "transport worker failed");
            }
        }
        let socket =
            mem::replace(&mut self.inner.lock().socket, SocketState::Idle);
        if let SocketState::Connected(socket) = socket {
            socket.shutdown().await;
        }
        debug!(
            server = %self.inner.server,
            mark = self.inner.mark,
            "transport shut down"
        );
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let socket = {
            let mut state = self.inner.lock();
            if state.closing {
                return;
            }
            warn!(
                server = %self.inner.server,
                "transport dropped without shutdown"
            );
            state.closing = true;
            mem::replace(&mut state.socket, SocketState::Idle)
        };
        self.inner.queries.clear();
        if let SocketState::Connected(socket) = socket {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(socket.shutdown());
            }
        }
    }
}

//------------ Inner ----------------------------------------------------------

/// The part of a transport shared with its workers and sockets.
struct Inner {
    /// The server.
    server: ServerIdentity,

    /// The socket mark.
    mark: u32,

    /// Where sockets come from.
    factory: Arc<dyn SocketFactory>,

    /// TLS sessions of earlier connections.
    cache: Arc<SessionCache>,

    /// Maximum number of tries per query.
    max_tries: u32,

    /// The outstanding queries.
    queries: QueryMap,

    /// The connection state.
    ///
    /// Lock this before `queries` when both are needed.
    state: Mutex<State>,
}

/// The mutable state of a transport.
struct State {
    /// The socket.
    socket: SocketState,

    /// Whether the transport is shutting down.
    closing: bool,

    /// The most recent connect or reconnect worker.
    worker: Option<JoinHandle<()>>,
}

/// Where the transport is with its socket.
enum SocketState {
    /// There is no socket and nobody is creating one.
    Idle,

    /// A worker is creating a socket.
    Connecting,

    /// There is a socket. It may have closed already.
    Connected(Box<dyn Socket>),
}

impl Inner {
    /// Locks the state.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Records a query and sends it if there is a socket.
    fn send_query(
        self: &Arc<Self>,
        query: &[u8],
    ) -> Result<QueryFuture, Error> {
        if query.len() > usize::from(u16::MAX) {
            return Err(Error::LongMessage);
        }
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.closing {
            return Err(Error::ConnectionClosed);
        }
        let fut = self.queries.record(query)?;
        let recorded = fut.query();
        trace!(
            server = %self.server,
            id = recorded.original_id(),
            new_id = recorded.new_id(),
            "new query"
        );
        match state.socket {
            SocketState::Idle => {
                state.socket = SocketState::Connecting;
                let inner = self.clone();
                self.spawn_worker(state, async move { inner.connect().await });
            }
            // The query goes out with the replay once connected.
            SocketState::Connecting => {}
            SocketState::Connected(ref socket) => {
                self.queries.mark_tried(recorded.new_id());
                if !socket.query(recorded.new_id(), recorded.body()) {
                    trace!("socket is closing, query waits for reconnect");
                }
            }
        }
        Ok(fut)
    }

    /// Starts a worker after the current one.
    fn spawn_worker(
        &self,
        state: &mut State,
        work: impl Future<Output = ()> + Send + 'static,
    ) {
        let previous = state.worker.take();
        state.worker = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            work.await
        }));
    }

    /// Creates a socket and sends all outstanding queries.
    async fn connect(self: Arc<Self>) {
        let observer = Arc::new(Observer {
            inner: Arc::downgrade(&self),
        });
        let res = self
            .factory
            .create(self.server.clone(), self.mark, observer, self.cache.clone())
            .await;

        let unwanted = {
            let mut state = self.lock();
            match res {
                Ok(socket) if state.closing => Some(socket),
                Ok(socket) => {
                    debug!(
                        server = %self.server,
                        mark = self.mark,
                        queries = self.queries.len(),
                        "connected, sending queries"
                    );
                    for query in self.queries.snapshot_all() {
                        self.queries.mark_tried(query.new_id());
                        if !socket.query(query.new_id(), query.body()) {
                            break;
                        }
                    }
                    state.socket = SocketState::Connected(socket);
                    None
                }
                Err(err) => {
                    debug!(
                        server = %self.server,
                        mark = self.mark,
                        %err,
                        "connect failed"
                    );
                    state.socket = SocketState::Idle;
                    self.queries.fail_all(err);
                    None
                }
            }
        };
        // Shutdown started while connecting.
        if let Some(socket) = unwanted {
            socket.shutdown().await;
        }
    }

    /// Schedules a reconnect after the socket closed.
    fn on_closed(self: &Arc<Self>) {
        let mut state = self.lock();
        if state.closing {
            return;
        }
        let inner = self.clone();
        self.spawn_worker(&mut state, async move { inner.reconnect().await });
    }

    /// Replaces a closed socket if there are queries left.
    async fn reconnect(self: Arc<Self>) {
        self.queries.expire_exhausted(self.max_tries);
        let (old, retry) = {
            let mut state = self.lock();
            if state.closing {
                return;
            }
            let retry = !self.queries.is_empty();
            let next = if retry {
                SocketState::Connecting
            } else {
                SocketState::Idle
            };
            (mem::replace(&mut state.socket, next), retry)
        };
        if let SocketState::Connected(old) = old {
            old.shutdown().await;
        }

        if retry {
            debug!(
                server = %self.server,
                mark = self.mark,
                queries = self.queries.len(),
                "reconnecting"
            );
            self.connect().await;
        }
    }
}

//------------ Observer -------------------------------------------------------

/// Passes socket events to the transport.
///
/// Holds a weak reference so a socket outliving its transport does not keep
/// it alive.
struct Observer {
    /// The transport.
    inner: Weak<Inner>,
}

impl SocketObserver for Observer {
    fn on_response(&self, response: Bytes) {
        if let Some(inner) = self.inner.upgrade() {
            inner.queries.deliver(response);
        }
    }

    fn on_closed(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_closed();
        }
    }
}

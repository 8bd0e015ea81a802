//! Sending queries to a list of servers.
//!
//! The [`Dispatcher`] is the entry point of the crate. It keeps one
//! [`Transport`] per server and socket mark and tries the servers of a
//! query one after another until one of them answers.
//!
//! Servers the dispatcher already has a transport for are tried first,
//! since their connection may still be open or a TLS session can be
//! resumed. Within that split, IPv6 servers go before IPv4 servers.
//! Otherwise the order of the list is kept.
//!
//! Transports that have not been used for a while are dropped. The check
//! runs whenever a query is done, but at most once per idle timeout.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::collections::BTreeMap;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::Config;
use crate::error::{Error, ResponseCode};
use crate::server::{RoutingKey, ServerIdentity};
use crate::socket::SocketFactory;
use crate::tls_socket::{TlsConfig, TlsSocketFactory};
use crate::transport::Transport;

//------------ Dispatcher -----------------------------------------------------

/// Sends queries to DNS-over-TLS servers.
pub struct Dispatcher {
    /// Creates the sockets of all transports.
    factory: Arc<dyn SocketFactory>,

    /// The configuration handed to new transports.
    config: Config,

    /// The transports.
    store: Mutex<Store>,
}

/// The transports of a dispatcher.
struct Store {
    /// The transports by server and mark.
    transports: BTreeMap<RoutingKey, Entry>,

    /// When idle transports were last removed.
    last_cleanup: Instant,
}

/// A transport and its usage.
struct Entry {
    /// The transport.
    transport: Arc<Transport>,

    /// Number of queries currently using the transport.
    use_count: usize,

    /// When the transport was last used.
    last_used: Instant,
}

impl Dispatcher {
    /// Creates a dispatcher using TLS sockets.
    pub fn new(config: Config, tls: TlsConfig) -> Self {
        let factory = Arc::new(TlsSocketFactory::new(config.clone(), tls));
        Self::with_factory(factory, config)
    }

    /// Creates a dispatcher using sockets from the given factory.
    pub fn with_factory(
        factory: Arc<dyn SocketFactory>,
        config: Config,
    ) -> Self {
        Self {
            factory,
            config,
            store: Mutex::new(Store {
                transports: BTreeMap::new(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    /// Sends a query to the first server that answers.
    ///
    /// On success, the response is copied into `answer` and its length is
    /// returned alongside [`ResponseCode::Success`]. If the response does
    /// not fit, [`ResponseCode::LimitError`] is returned right away.
    /// Otherwise the next server is tried. If all servers fail, the code of
    /// the last failure is returned.
    pub async fn query(
        &self,
        servers: &[ServerIdentity],
        mark: u32,
        query: &[u8],
        answer: &mut [u8],
    ) -> (ResponseCode, usize) {
        let mut code = ResponseCode::InternalError;
        for server in self.order(servers, mark) {
            let err = match self.query_server(&server, mark, query).await {
                Ok(response) if response.len() <= answer.len() => {
                    answer[..response.len()].copy_from_slice(&response);
                    return (ResponseCode::Success, response.len());
                }
                Ok(response) => {
                    debug!(
                        %server,
                        len = response.len(),
                        space = answer.len(),
                        "answer too large"
                    );
                    Error::AnswerTooLarge
                }
                Err(err) => err,
            };
            code = err.response_code();
            debug!(%server, mark, %err, "query failed");
            if code == ResponseCode::LimitError {
                break;
            }
        }
        (code, 0)
    }

    /// Sends a query to a single server.
    pub async fn query_server(
        &self,
        server: &ServerIdentity,
        mark: u32,
        query: &[u8],
    ) -> Result<Bytes, Error> {
        let (transport, _guard) = self.acquire(server, mark);
        transport.query(query).await
    }

    /// Shuts down all transports.
    pub async fn shutdown(&self) {
        let transports = mem::take(&mut self.lock().transports);
        for (_, entry) in transports {
            entry.transport.shutdown().await;
        }
    }

    /// Returns the number of transports.
    pub fn len(&self) -> usize {
        self.lock().transports.len()
    }

    /// Returns whether there are no transports.
    pub fn is_empty(&self) -> bool {
        self.lock().transports.is_empty()
    }

    /// Returns the servers in the order they should be tried.
    fn order(
        &self,
        servers: &[ServerIdentity],
        mark: u32,
    ) -> Vec<ServerIdentity> {
        let store = self.lock();
        let mut ordered: Vec<_> = servers
            .iter()
            .map(|server| {
                let key = RoutingKey::new(mark, server.clone());
                let is_new = !store.transports.contains_key(&key);
                ((is_new, !server.is_ipv6()), server.clone())
            })
            .collect();
        ordered.sort_by_key(|(rank, _)| *rank);
        ordered.into_iter().map(|(_, server)| server).collect()
    }

    /// Returns the transport for a server, creating it if necessary.
    ///
    /// The transport counts as used until the returned guard is dropped.
    fn acquire(
        &self,
        server: &ServerIdentity,
        mark: u32,
    ) -> (Arc<Transport>, UseGuard<'_>) {
        let key = RoutingKey::new(mark, server.clone());
        let now = Instant::now();
        let mut store = self.lock();
        let entry = store.transports.entry(key.clone()).or_insert_with(|| {
            debug!(%server, mark, "creating transport");
            Entry {
                transport: Arc::new(Transport::new(
                    server.clone(),
                    mark,
                    self.factory.clone(),
                    &self.config,
                )),
                use_count: 0,
                last_used: now,
            }
        });
        entry.use_count += 1;
        entry.last_used = now;
        (
            entry.transport.clone(),
            UseGuard {
                dispatcher: self,
                key,
            },
        )
    }

    /// Marks a transport as no longer used by one query.
    ///
    /// This is also when idle transports are cleaned up.
    fn release(&self, key: &RoutingKey) {
        let now = Instant::now();
        let mut store = self.lock();
        if let Some(entry) = store.transports.get_mut(key) {
            entry.use_count = entry.use_count.saturating_sub(1);
            entry.last_used = now;
        }
        self.cleanup(&mut store, now);
    }

    /// Drops transports that have been unused for too long.
    fn cleanup(&self, store: &mut Store, now: Instant) {
        let timeout = self.config.transport_idle_timeout();
        if now.duration_since(store.last_cleanup) < timeout {
            return;
        }
        store.last_cleanup = now;

        let expired: Vec<_> = store
            .transports
            .iter()
            .filter(|(_, entry)| {
                entry.use_count == 0
                    && now.duration_since(entry.last_used) >= timeout
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if let Some(entry) = store.transports.remove(&key) {
                trace!(
                    server = %key.server(),
                    mark = key.mark(),
                    "dropping idle transport"
                );
                tokio::spawn(async move { entry.transport.shutdown().await });
            }
        }
    }

    /// Locks the store.
    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|err| err.into_inner())
    }
}

//------------ UseGuard -------------------------------------------------------

/// Releases a transport when a query is done with it.
struct UseGuard<'a> {
    /// The dispatcher owning the transport.
    dispatcher: &'a Dispatcher,

    /// The transport's key.
    key: RoutingKey,
}

impl Drop for UseGuard<'_> {
    fn drop(&mut self) {
        self.dispatcher.release(&self.key);
    }
}

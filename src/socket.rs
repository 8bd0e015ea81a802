//! The seams between a transport and its sockets.
//!
//! A transport never creates connections itself. It asks a
//! [`SocketFactory`] for a [`Socket`] and hands over a [`SocketObserver`]
//! through which the socket reports responses and its own demise. Tests
//! substitute fake sockets here.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::boxed::Box;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Error;
use crate::server::ServerIdentity;
use crate::session_cache::SessionCache;

/// A boxed future as returned by the traits in this module.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

//------------ Socket ---------------------------------------------------------

/// A live connection to a server.
pub trait Socket: Send + Sync {
    /// Queues a query for sending.
    ///
    /// The query body is passed without its ID, which is given separately.
    /// Returns `false` if the query cannot be sent because the socket is
    /// shutting down.
    ///
    /// This is called with the transport's state locked. Responses may be
    /// reported to the observer right away, but a close must be reported
    /// from elsewhere.
    fn query(&self, id: u16, body: Bytes) -> bool;

    /// Shuts the socket down and waits until it is gone.
    ///
    /// The observer is told about the close before the returned future
    /// resolves.
    fn shutdown(self: Box<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }
}

//------------ SocketObserver -------------------------------------------------

/// Receives events from a socket.
pub trait SocketObserver: Send + Sync {
    /// A response frame arrived.
    ///
    /// The response starts with the ID the query was sent with.
    fn on_response(&self, response: Bytes);

    /// The socket closed and will not deliver any more responses.
    fn on_closed(&self);
}

//------------ SocketFactory --------------------------------------------------

/// Creates sockets.
pub trait SocketFactory: Send + Sync {
    /// Connects to `server` using the socket mark `mark`.
    ///
    /// The returned socket reports to `observer`. The session cache
    /// belongs to the calling transport and may be used for resumption.
    fn create(
        &self,
        server: ServerIdentity,
        mark: u32,
        observer: Arc<dyn SocketObserver>,
        cache: Arc<SessionCache>,
    ) -> BoxFuture<'_, Result<Box<dyn Socket>, Error>>;
}

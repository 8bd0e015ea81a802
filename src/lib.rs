//! A DNS-over-TLS client transport.
//!
//! This crate sends DNS queries to recursive resolvers over TLS as described
//! in RFC 7858. Queries to the same server share a single connection and are
//! pipelined: many queries can be outstanding at once and responses may
//! arrive in any order.
//!
//! The entry point is the [`Dispatcher`]. Given a list of servers and a
//! socket mark, it sends a query to the first server that answers. For
//! every server and mark it keeps a [`Transport`] that owns the connection,
//! reconnects when the server closes it, and resends queries that have not
//! been answered yet.
//!
//! # Modules
//!
//! * [dispatcher] picks servers and manages transports,
//! * [transport] multiplexes the queries for one server over one socket,
//! * [query_map] assigns wire IDs to queries and matches responses,
//! * [tls_socket] implements sockets on top of
//!   [rustls](https://github.com/rustls/rustls),
//! * [verify] contains the certificate checks for servers with a name,
//!   with pinned keys, or neither,
//! * [session_cache] keeps TLS session tickets for resumption,
//! * [server] describes servers,
//! * [socket] defines the traits connecting transports and sockets,
//! * [config] and [error] hold the configuration and error types.
//!
//! # Example
//!
//! ```no_run
//! use dnstls::{Config, Dispatcher, ResponseCode, ServerIdentity, TlsConfig};
//!
//! # async fn example(query: &[u8]) {
//! let dispatcher = Dispatcher::new(Config::new(), TlsConfig::new());
//! let servers = [
//!     ServerIdentity::new("[2606:4700:4700::1111]:853".parse().unwrap())
//!         .with_name("one.one.one.one"),
//!     ServerIdentity::new("1.1.1.1:853".parse().unwrap())
//!         .with_name("one.one.one.one"),
//! ];
//! let mut answer = [0; 4096];
//! let (code, len) = dispatcher.query(&servers, 0, query, &mut answer).await;
//! if code == ResponseCode::Success {
//!     println!("{} octets of answer", len);
//! }
//! dispatcher.shutdown().await;
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

pub mod config;
pub mod connect;
pub mod dispatcher;
pub mod error;
pub mod query_map;
pub mod server;
pub mod session_cache;
pub mod socket;
pub mod tls_socket;
pub mod transport;
pub mod verify;

pub use self::config::Config;
pub use self::dispatcher::Dispatcher;
pub use self::error::{Error, ResponseCode};
pub use self::server::{Protocol, RoutingKey, ServerIdentity};
pub use self::tls_socket::{TlsConfig, TlsSocketFactory};
pub use self::transport::Transport;

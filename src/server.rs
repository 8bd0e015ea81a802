//! Identifying DNS-over-TLS servers.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

//------------ Protocol -------------------------------------------------------

/// The transport protocol used to reach a server.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Protocol {
    /// TLS over TCP, RFC 7858.
    #[default]
    Tcp,

    /// DTLS over UDP, RFC 8094.
    ///
    /// Servers can be described with this, but there is no socket
    /// implementation for it.
    Udp,
}

//------------ ServerIdentity -------------------------------------------------

/// A DNS-over-TLS server as configured by the resolver.
///
/// Besides the socket address, a server can carry the name its certificate
/// must be valid for and a set of SHA-256 digests of public keys, one of
/// which must appear in the certificate chain. Without either, the server is
/// used opportunistically and its certificate is not checked against any
/// trust anchor.
///
/// Equality and ordering consider all fields. The IPv6 flow label is not
/// part of a server's identity and is ignored throughout.
#[derive(Clone, Debug)]
pub struct ServerIdentity {
    /// Address and port of the server.
    addr: SocketAddr,

    /// Name the certificate must be valid for.
    name: Option<String>,

    /// SHA-256 digests of accepted subject public key infos.
    fingerprints: BTreeSet<Vec<u8>>,

    /// The transport protocol.
    protocol: Protocol,
}

impl ServerIdentity {
    /// Creates a new server with only an address.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            name: None,
            fingerprints: BTreeSet::new(),
            protocol: Protocol::Tcp,
        }
    }

    /// Returns the server with the given certificate name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Returns the server with an additional accepted SPKI digest.
    pub fn with_fingerprint(mut self, digest: impl Into<Vec<u8>>) -> Self {
        self.fingerprints.insert(digest.into());
        self
    }

    /// Returns the server using the given protocol.
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Returns the socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the certificate name, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the accepted SPKI digests.
    pub fn fingerprints(&self) -> &BTreeSet<Vec<u8>> {
        &self.fingerprints
    }

    /// Returns the transport protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Returns whether the server is an IPv6 server.
    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }

    /// Returns whether a name or pins were configured for this server.
    ///
    /// Servers without either were most likely discovered rather than
    /// chosen by the user.
    pub fn was_explicitly_configured(&self) -> bool {
        self.name.is_some() || !self.fingerprints.is_empty()
    }

    /// Compares only the addresses of two servers.
    ///
    /// Family, IP address, port and IPv6 scope are compared. Name, pins,
    /// protocol and flow label are not.
    pub fn address_cmp(&self, other: &Self) -> Ordering {
        address_key(&self.addr).cmp(&address_key(&other.addr))
    }

    /// Returns whether two servers have the same address.
    pub fn address_eq(&self, other: &Self) -> bool {
        self.address_cmp(other) == Ordering::Equal
    }
}

/// Returns the comparable parts of a socket address.
///
/// IPv4 sorts before IPv6 and the flow label is left out.
fn address_key(addr: &SocketAddr) -> (u8, IpAddr, u16, u32) {
    match addr {
        SocketAddr::V4(addr) => (4, IpAddr::V4(*addr.ip()), addr.port(), 0),
        SocketAddr::V6(addr) => {
            (6, IpAddr::V6(*addr.ip()), addr.port(), addr.scope_id())
        }
    }
}

impl From<SocketAddr> for ServerIdentity {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}

impl PartialEq for ServerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ServerIdentity {}

impl PartialOrd for ServerIdentity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServerIdentity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.address_cmp(other)
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.fingerprints.cmp(&other.fingerprints))
            .then_with(|| self.protocol.cmp(&other.protocol))
    }
}

impl Hash for ServerIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        address_key(&self.addr).hash(state);
        self.name.hash(state);
        self.fingerprints.hash(state);
        self.protocol.hash(state);
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", self.addr, name),
            None => write!(f, "{}", self.addr),
        }
    }
}

//------------ RoutingKey -----------------------------------------------------

/// A server together with the routing mark used to reach it.
///
/// Each key gets its own connection.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RoutingKey {
    /// The socket mark.
    mark: u32,

    /// The server.
    server: ServerIdentity,
}

impl RoutingKey {
    /// Creates a new key.
    pub fn new(mark: u32, server: ServerIdentity) -> Self {
        Self { mark, server }
    }

    /// Returns the socket mark.
    pub fn mark(&self) -> u32 {
        self.mark
    }

    /// Returns the server.
    pub fn server(&self) -> &ServerIdentity {
        &self.server
    }
}

//============ Tests =========================================================

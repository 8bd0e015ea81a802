//! Configuration of the DNS-over-TLS client.
//!
//! All values have a default and are trimmed into a sensible range when set,
//! so a [`Config`] is always usable.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::cmp;
use std::time::Duration;

//------------ Configuration Constants ----------------------------------------

/// Idle timeout of a single TLS connection.
///
/// A connection that has seen no reads, writes or new queries for this long
/// is closed. The transport reconnects on demand.
const IDLE_TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(20),
    Duration::from_millis(1),
    Duration::from_secs(3600),
);

/// Time allowed for the TCP connect plus the TLS handshake.
const CONNECT_TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(10),
    Duration::from_millis(1),
    Duration::from_secs(120),
);

/// How often a query is sent before it is given up on.
///
/// Every (re)connect counts as a try for each outstanding query.
const MAX_TRIES: DefMinMax<u32> = DefMinMax::new(3, 1, 32);

/// Number of TLS session tickets kept per transport.
const SESSION_CACHE_CAPACITY: DefMinMax<usize> = DefMinMax::new(5, 1, 64);

/// How long an unused transport is kept by the dispatcher.
///
/// This effectively controls how long session tickets are kept around.
const TRANSPORT_IDLE_TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(5 * 60),
    Duration::from_millis(1),
    Duration::from_secs(24 * 3600),
);

/// Largest response frame that is passed on.
///
/// Larger frames are read off the stream and dropped.
const MAX_RESPONSE_SIZE: DefMinMax<usize> =
    DefMinMax::new(u16::MAX as usize, 2, u16::MAX as usize);

//------------ Config ---------------------------------------------------------

/// Configuration for the dispatcher, its transports and sockets.
#[derive(Clone, Debug)]
pub struct Config {
    /// Idle timeout of a connection.
    idle_timeout: Duration,

    /// Connect plus handshake timeout.
    connect_timeout: Duration,

    /// Maximum number of tries per query.
    max_tries: u32,

    /// Capacity of a transport's session cache.
    session_cache_capacity: usize,

    /// Idle time after which the dispatcher drops a transport.
    transport_idle_timeout: Duration,

    /// Maximum accepted response size.
    max_response_size: usize,
}

impl Config {
    /// Creates a new, default config.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the connection idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Sets the connection idle timeout.
    ///
    /// Excessive values are quietly trimmed.
    pub fn set_idle_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = IDLE_TIMEOUT.limit(timeout)
    }

    /// Returns the connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Sets the connect timeout.
    ///
    /// This covers both the TCP connect and the TLS handshake. Excessive
    /// values are quietly trimmed.
    pub fn set_connect_timeout(&mut self, timeout: Duration) {
        self.connect_timeout = CONNECT_TIMEOUT.limit(timeout)
    }

    /// Returns the maximum number of tries per query.
    pub fn max_tries(&self) -> u32 {
        self.max_tries
    }

    /// Sets the maximum number of tries per query.
    pub fn set_max_tries(&mut self, tries: u32) {
        self.max_tries = MAX_TRIES.limit(tries)
    }

    /// Returns the number of session tickets kept per transport.
    pub fn session_cache_capacity(&self) -> usize {
        self.session_cache_capacity
    }

    /// Sets the number of session tickets kept per transport.
    pub fn set_session_cache_capacity(&mut self, capacity: usize) {
        self.session_cache_capacity = SESSION_CACHE_CAPACITY.limit(capacity)
    }

    /// Returns the idle time after which unused transports are dropped.
    pub fn transport_idle_timeout(&self) -> Duration {
        self.transport_idle_timeout
    }

    /// Sets the idle time after which unused transports are dropped.
    ///
    /// The dispatcher also scans for idle transports at most once per this
    /// interval.
    pub fn set_transport_idle_timeout(&mut self, timeout: Duration) {
        self.transport_idle_timeout = TRANSPORT_IDLE_TIMEOUT.limit(timeout)
    }

    /// Returns the maximum accepted response size.
    pub fn max_response_size(&self) -> usize {
        self.max_response_size
    }

    /// Sets the maximum accepted response size.
    pub fn set_max_response_size(&mut self, size: usize) {
        self.max_response_size = MAX_RESPONSE_SIZE.limit(size)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            idle_timeout: IDLE_TIMEOUT.default(),
            connect_timeout: CONNECT_TIMEOUT.default(),
            max_tries: MAX_TRIES.default(),
            session_cache_capacity: SESSION_CACHE_CAPACITY.default(),
            transport_idle_timeout: TRANSPORT_IDLE_TIMEOUT.default(),
            max_response_size: MAX_RESPONSE_SIZE.default(),
        }
    }
}

//------------ DefMinMax ------------------------------------------------------

/// The default, minimum, and maximum values for a config variable.
#[derive(Clone, Copy)]
struct DefMinMax<T> {
    /// The default value.
    def: T,

    /// The minimum value.
    min: T,

    /// The maximum value.
    max: T,
}

impl<T: Copy + Ord> DefMinMax<T> {
    /// Creates a new value.
    const fn new(def: T, min: T, max: T) -> Self {
        Self { def, min, max }
    }

    /// Returns the default value.
    fn default(self) -> T {
        self.def
    }

    /// Trims the given value to fit into the minimum/maximum range.
    fn limit(self, value: T) -> T {
        cmp::max(self.min, cmp::min(self.max, value))
    }
}

//============ Tests =========================================================

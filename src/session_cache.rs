//! Caching TLS sessions for resumption.
//!
//! Each transport keeps its own small cache. TLS 1.3 tickets are handed out
//! at most once and the newest ticket is tried first. Reusing a ticket
//! would let a passive observer link connections, and RFC 8446 asks clients
//! not to do that.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio_rustls::rustls::client::{
    ClientSessionStore, Tls12ClientSessionValue, Tls13ClientSessionValue,
};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::NamedGroup;
use tracing::trace;

//------------ Tickets --------------------------------------------------------

/// A bounded stack of single-use tokens.
#[derive(Debug)]
pub struct Tickets<T> {
    /// The tokens, newest first.
    tickets: Mutex<VecDeque<T>>,

    /// Maximum number of tokens kept.
    capacity: usize,
}

impl<T> Tickets<T> {
    /// Creates a new, empty stack holding at most `capacity` tokens.
    pub fn new(capacity: usize) -> Self {
        Self {
            tickets: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Removes and returns the most recently recorded token.
    pub fn get(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Records a token, dropping the oldest one if the stack is full.
    pub fn record(&self, ticket: T) {
        let mut tickets = self.lock();
        tickets.push_front(ticket);
        tickets.truncate(self.capacity);
    }

    /// Returns the number of tokens currently held.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns whether there are no tokens.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Locks the stack.
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.tickets.lock().unwrap_or_else(|err| err.into_inner())
    }
}

//------------ SessionCache ---------------------------------------------------

/// The session cache of a single transport.
///
/// This is handed to rustls as the client session store of every
/// connection the transport creates, so a reconnect can resume the session
/// of an earlier connection.
#[derive(Debug)]
pub struct SessionCache {
    /// TLS 1.3 tickets.
    tickets: Tickets<Tls13ClientSessionValue>,

    /// The key exchange group the server preferred last time.
    kx_hint: Mutex<Option<NamedGroup>>,

    /// The most recent TLS 1.2 session.
    tls12: Mutex<Option<Tls12ClientSessionValue>>,
}

impl SessionCache {
    /// Creates a new cache keeping up to `capacity` tickets.
    pub fn new(capacity: usize) -> Self {
        Self {
            tickets: Tickets::new(capacity),
            kx_hint: Mutex::new(None),
            tls12: Mutex::new(None),
        }
    }

    /// Takes the newest ticket out of the cache.
    pub fn get(&self) -> Option<Tls13ClientSessionValue> {
        self.tickets.get()
    }

    /// Adds a ticket to the cache.
    pub fn record(&self, ticket: Tls13ClientSessionValue) {
        self.tickets.record(ticket)
    }

    /// Returns the number of cached tickets.
    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    /// Returns whether the cache holds no tickets.
    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }
}

/// Locks a slot, ignoring poison.
fn lock<T>(slot: &Mutex<T>) -> MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(|err| err.into_inner())
}

// The cache belongs to a single server, so the server name passed by rustls
// is always the same and can be ignored.
impl ClientSessionStore for SessionCache {
    fn set_kx_hint(&self, _: ServerName<'static>, group: NamedGroup) {
        *lock(&self.kx_hint) = Some(group);
    }

    fn kx_hint(&self, _: &ServerName<'_>) -> Option<NamedGroup> {
        *lock(&self.kx_hint)
    }

    fn set_tls12_session(
        &self,
        _: ServerName<'static>,
        value: Tls12ClientSessionValue,
    ) {
        *lock(&self.tls12) = Some(value);
    }

    fn tls12_session(
        &self,
        _: &ServerName<'_>,
    ) -> Option<Tls12ClientSessionValue> {
        lock(&self.tls12).clone()
    }

    fn remove_tls12_session(&self, _: &ServerName<'static>) {
        *lock(&self.tls12) = None;
    }

    fn insert_tls13_ticket(
        &self,
        _: ServerName<'static>,
        value: Tls13ClientSessionValue,
    ) {
        trace!("recording TLS session ticket");
        self.record(value)
    }

    fn take_tls13_ticket(
        &self,
        _: &ServerName<'static>,
    ) -> Option<Tls13ClientSessionValue> {
        let ticket = self.get();
        trace!(found = ticket.is_some(), "looking up TLS session ticket");
        ticket
    }
}

//============ Tests =========================================================

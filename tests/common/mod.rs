//! Fake sockets and helpers shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};
use dnstls::session_cache::SessionCache;
use dnstls::socket::{BoxFuture, Socket, SocketFactory, SocketObserver};
use dnstls::{Error, ServerIdentity};
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

/// Setup logging of events reported by dnstls and the test suite.
///
/// Use the RUST_LOG environment variable to override the defaults.
///
/// E.g. To enable debug level logging:
///   RUST_LOG=DEBUG
///
/// Or to log only what the transports do:
///   RUST_LOG=dnstls::transport=TRACE
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .without_time()
        .try_init()
        .ok();
}

/// Creates a query with the given ID and some ID dependent content.
pub fn make_query(id: u16, size: usize) -> Vec<u8> {
    let mut vec = vec![0u8; size];
    vec[..2].copy_from_slice(&id.to_be_bytes());
    for (i, item) in vec.iter_mut().enumerate().skip(2) {
        *item = (id as usize + i) as u8;
    }
    vec
}

/// Returns the ID of a message.
pub fn id_of(msg: &[u8]) -> u16 {
    u16::from_be_bytes([msg[0], msg[1]])
}

/// Creates a server from an address.
pub fn server(addr: &str) -> ServerIdentity {
    ServerIdentity::new(addr.parse().unwrap())
}

/// Yields to other tasks until `cond` holds.
pub async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}

//------------ Behavior -------------------------------------------------------

/// How a fake socket treats queries.
#[derive(Clone, Copy, Debug)]
pub enum Behavior {
    /// Answers every query with the query itself.
    Echo,

    /// Sends garbage before and after echoing each query.
    Garbage,

    /// Never answers.
    Null,

    /// Holds answers until `count` queries arrived, then sends them all.
    Delay { count: usize, reverse: bool },

    /// Closes on the first query without answering it.
    CloseOnQuery,

    /// Answers the first query and closes on the second.
    AnswerOneThenClose,

    /// Accepts queries but closes right after connecting without
    /// answering.
    CloseAfterConnect,

    /// Only answers or closes when the test says so.
    Manual,
}

//------------ FakeSocket -----------------------------------------------------

/// A socket that behaves as told.
struct FakeSocket {
    behavior: Behavior,
    observer: Arc<dyn SocketObserver>,
    state: Arc<Mutex<FakeState>>,
    sent: Arc<Mutex<Vec<u16>>>,
    shutdowns: Arc<AtomicUsize>,
}

#[derive(Default)]
struct FakeState {
    pending: Vec<Bytes>,
    answered: usize,
    closed: bool,
}

/// Closes a socket, unless it is closed already, and reports it.
fn close(state: &Mutex<FakeState>, observer: &Arc<dyn SocketObserver>) {
    let notify = !std::mem::replace(&mut state.lock().unwrap().closed, true);
    if notify {
        observer.on_closed();
    }
}

impl FakeSocket {
    /// Closes the socket from a task of its own.
    ///
    /// Queries sent before the task runs are still accepted.
    fn close_later(&self) {
        let state = self.state.clone();
        let observer = self.observer.clone();
        tokio::spawn(async move { close(&state, &observer) });
    }
}

impl Socket for FakeSocket {
    fn query(&self, id: u16, body: Bytes) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return false;
        }
        self.sent.lock().unwrap().push(id);

        let mut response = BytesMut::with_capacity(body.len() + 2);
        response.put_u16(id);
        response.extend_from_slice(&body);
        let response = response.freeze();

        match self.behavior {
            Behavior::Echo => self.observer.on_response(response),
            Behavior::Garbage => {
                self.observer.on_response(Bytes::new());
                self.observer.on_response(Bytes::from_static(&[0xff]));
                self.observer.on_response(response.clone());
                self.observer.on_response(response);
            }
            Behavior::Null
            | Behavior::CloseAfterConnect
            | Behavior::Manual => {}
            Behavior::Delay { count, reverse } => {
                state.pending.push(response);
                if state.pending.len() == count {
                    let mut pending = std::mem::take(&mut state.pending);
                    if reverse {
                        pending.reverse();
                    }
                    for response in pending {
                        self.observer.on_response(response);
                    }
                }
            }
            Behavior::CloseOnQuery => self.close_later(),
            Behavior::AnswerOneThenClose => {
                if state.answered == 0 {
                    state.answered += 1;
                    self.observer.on_response(response);
                } else {
                    self.close_later();
                }
            }
        }
        true
    }

    fn shutdown(self: Box<Self>) -> BoxFuture<'static, ()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { close(&self.state, &self.observer) })
    }
}

//------------ FakeFactory ----------------------------------------------------

/// Creates fake sockets and keeps track of what happens to them.
pub struct FakeFactory {
    behavior: Behavior,

    /// Addresses that refuse connections.
    refused: BTreeSet<SocketAddr>,

    /// Number of connects that succeed before all others fail.
    succeed: Option<usize>,

    /// Every connect attempt.
    attempts: Mutex<Vec<(ServerIdentity, u32)>>,

    /// Number of sockets created.
    creates: AtomicUsize,

    /// IDs of all queries sent.
    sent: Arc<Mutex<Vec<u16>>>,

    /// Number of sockets shut down.
    shutdowns: Arc<AtomicUsize>,

    /// Number of connects that go through before the others wait for
    /// `release`.
    held_after: Option<usize>,

    /// Lets a held connect go ahead.
    gate: Notify,

    /// Observer and state of the most recent socket.
    latest: Mutex<Option<(Arc<dyn SocketObserver>, Arc<Mutex<FakeState>>)>>,
}

impl FakeFactory {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            refused: BTreeSet::new(),
            succeed: None,
            attempts: Mutex::new(Vec::new()),
            creates: AtomicUsize::new(0),
            sent: Default::default(),
            shutdowns: Default::default(),
            held_after: None,
            gate: Notify::new(),
            latest: Mutex::new(None),
        }
    }

    /// Makes all connects after the first `count` wait for `release`.
    pub fn hold_after(mut self, count: usize) -> Self {
        self.held_after = Some(count);
        self
    }

    /// Lets one held connect go ahead.
    pub fn release(&self) {
        self.gate.notify_one();
    }

    /// Answers the query with the given wire ID on the latest socket.
    pub fn answer(&self, id: u16) {
        let (observer, _) = self.latest();
        let mut response = BytesMut::new();
        response.put_u16(id);
        response.extend_from_slice(b"answer");
        observer.on_response(response.freeze());
    }

    /// Closes the latest socket.
    pub fn close_latest(&self) {
        let (observer, state) = self.latest();
        close(&state, &observer);
    }

    fn latest(&self) -> (Arc<dyn SocketObserver>, Arc<Mutex<FakeState>>) {
        self.latest.lock().unwrap().clone().expect("no socket yet")
    }

    /// Makes connections to `addr` fail.
    pub fn refuse(mut self, addr: &str) -> Self {
        self.refused.insert(addr.parse().unwrap());
        self
    }

    /// Makes all connects after the first `count` fail.
    pub fn succeed_only(mut self, count: usize) -> Self {
        self.succeed = Some(count);
        self
    }

    pub fn attempts(&self) -> Vec<ServerIdentity> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .map(|(server, _)| server.clone())
            .collect()
    }

    pub fn marks(&self) -> Vec<u32> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .map(|(_, mark)| *mark)
            .collect()
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<u16> {
        self.sent.lock().unwrap().clone()
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl SocketFactory for FakeFactory {
    fn create(
        &self,
        server: ServerIdentity,
        mark: u32,
        observer: Arc<dyn SocketObserver>,
        _cache: Arc<SessionCache>,
    ) -> BoxFuture<'_, Result<Box<dyn Socket>, Error>> {
        self.attempts.lock().unwrap().push((server.clone(), mark));
        Box::pin(async move {
            let refused = self.refused.contains(&server.addr())
                || self
                    .succeed
                    .map_or(false, |count| self.creates() >= count);
            if refused {
                return Err(Error::Connect(Arc::new(
                    io::ErrorKind::ConnectionRefused.into(),
                )));
            }
            if self.held_after.map_or(false, |count| self.creates() >= count) {
                self.gate.notified().await;
            }
            self.creates.fetch_add(1, Ordering::SeqCst);
            let socket = FakeSocket {
                behavior: self.behavior,
                observer,
                state: Default::default(),
                sent: self.sent.clone(),
                shutdowns: self.shutdowns.clone(),
            };
            *self.latest.lock().unwrap() =
                Some((socket.observer.clone(), socket.state.clone()));
            if let Behavior::CloseAfterConnect = self.behavior {
                socket.close_later();
            }
            Ok(Box::new(socket) as Box<dyn Socket>)
        })
    }
}

//! Multiplexing queries over a single connection.
//!
//! Callers choose their own message IDs, so two queries sharing one
//! connection can easily collide. The [`QueryMap`] hands out a fresh ID for
//! every outstanding query, remembers the caller's ID, and restores it when
//! the matching response comes back.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::Error;

//------------ Configuration Constants ----------------------------------------

/// The largest ID that can be handed out.
const MAX_ID: u16 = u16::MAX;

/// Number of octets of the ID at the start of every message.
const ID_LEN: usize = 2;

//------------ Query ----------------------------------------------------------

/// An outstanding query as seen by the connection.
#[derive(Clone, Debug)]
pub struct Query {
    /// The ID this query uses on the wire.
    new_id: u16,

    /// Position of the query in recording order.
    seq: u64,

    /// The query exactly as the caller passed it.
    query: Bytes,

    /// How many times the query has been handed to a socket.
    tries: u32,
}

impl Query {
    /// Returns the ID used on the wire.
    pub fn new_id(&self) -> u16 {
        self.new_id
    }

    /// Returns the ID chosen by the caller.
    pub fn original_id(&self) -> u16 {
        u16::from_be_bytes([self.query[0], self.query[1]])
    }

    /// Returns the full query as passed by the caller.
    pub fn query(&self) -> &Bytes {
        &self.query
    }

    /// Returns the query without its leading ID.
    pub fn body(&self) -> Bytes {
        self.query.slice(ID_LEN..)
    }

    /// Returns how often this query has been sent.
    pub fn tries(&self) -> u32 {
        self.tries
    }
}

//------------ QueryFuture ----------------------------------------------------

/// The caller's handle for a recorded query.
#[derive(Debug)]
pub struct QueryFuture {
    /// A copy of the query as recorded.
    query: Query,

    /// Receives the response or the reason there won't be one.
    result: oneshot::Receiver<Result<Bytes, Error>>,
}

impl QueryFuture {
    /// Returns the query as recorded.
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Waits for the response.
    ///
    /// The response carries the caller's original ID.
    pub async fn result(self) -> Result<Bytes, Error> {
        self.result.await.map_err(|_| Error::ConnectionClosed)?
    }
}

//------------ QueryMap -------------------------------------------------------

/// Outstanding queries of a single transport, keyed by wire ID.
#[derive(Debug, Default)]
pub struct QueryMap {
    /// The queries.
    queries: Mutex<Table>,
}

/// The content of the map.
#[derive(Debug, Default)]
struct Table {
    /// The queries, each with the sender for its result.
    entries: BTreeMap<u16, Entry>,

    /// Sequence number for the next recorded query.
    next_seq: u64,
}

/// A single slot of the map.
#[derive(Debug)]
struct Entry {
    /// The recorded query.
    query: Query,

    /// Where the result goes.
    result: oneshot::Sender<Result<Bytes, Error>>,
}

impl QueryMap {
    /// Creates a new, empty map.
    pub fn new() -> Self {
        Default::default()
    }

    /// Records a new query and assigns it an unused ID.
    ///
    /// Fails if the query is too short to contain an ID or if all 65536 IDs
    /// are taken.
    pub fn record(&self, query: &[u8]) -> Result<QueryFuture, Error> {
        if query.len() < ID_LEN {
            return Err(Error::ShortMessage);
        }
        let mut table = self.lock();
        let new_id = Self::free_id(&table.entries)
            .ok_or(Error::TooManyOutstandingQueries)?;
        let query = Query {
            new_id,
            seq: table.next_seq,
            query: Bytes::copy_from_slice(query),
            tries: 0,
        };
        table.next_seq += 1;
        let (tx, rx) = oneshot::channel();
        table.entries.insert(
            new_id,
            Entry {
                query: query.clone(),
                result: tx,
            },
        );
        Ok(QueryFuture { query, result: rx })
    }

    /// Increases the try counter of the query with the given ID.
    pub fn mark_tried(&self, new_id: u16) {
        if let Some(entry) = self.lock().entries.get_mut(&new_id) {
            entry.query.tries += 1;
        }
    }

    /// Fails and removes all queries that have been tried `max_tries` times.
    pub fn expire_exhausted(&self, max_tries: u32) {
        let expired: Vec<_> = {
            let mut table = self.lock();
            let queries = &mut table.entries;
            let ids: Vec<_> = queries
                .values()
                .filter(|entry| entry.query.tries >= max_tries)
                .map(|entry| entry.query.new_id)
                .collect();
            ids.into_iter()
                .filter_map(|id| queries.remove(&id))
                .collect()
        };
        for entry in expired {
            trace!(
                id = entry.query.new_id,
                tries = entry.query.tries,
                "expiring query"
            );
            _ = entry.result.send(Err(Error::RetryLimitExceeded));
        }
    }

    /// Returns a copy of all outstanding queries in the order they were
    /// recorded.
    pub fn snapshot_all(&self) -> Vec<Query> {
        let mut all: Vec<_> = self
            .lock()
            .entries
            .values()
            .map(|entry| entry.query.clone())
            .collect();
        all.sort_by_key(|query| query.seq);
        all
    }

    /// Returns the number of outstanding queries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns whether there are no outstanding queries.
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Fails and removes all outstanding queries.
    pub fn clear(&self) {
        self.fail_all(Error::ConnectionClosed)
    }

    /// Removes all outstanding queries, failing them with `error`.
    pub fn fail_all(&self, error: Error) {
        let queries = std::mem::take(&mut self.lock().entries);
        for (_, entry) in queries {
            _ = entry.result.send(Err(error.clone()));
        }
    }

    /// Hands a response to the query it answers.
    ///
    /// Responses that are too short or carry an ID that is not in use are
    /// quietly dropped. A misbehaving server may send those and they must
    /// not disturb other queries.
    pub fn deliver(&self, response: Bytes) {
        if response.len() < ID_LEN {
            trace!(len = response.len(), "dropping short response");
            return;
        }
        let new_id = u16::from_be_bytes([response[0], response[1]]);
        let entry = match self.lock().entries.remove(&new_id) {
            Some(entry) => entry,
            None => {
                trace!(id = new_id, "dropping response for unknown ID");
                return;
            }
        };
        let mut response = BytesMut::from(response.as_ref());
        response[..ID_LEN].copy_from_slice(&entry.query.query[..ID_LEN]);

        // Ignore errors. We don't care if the receiver is gone.
        _ = entry.result.send(Ok(response.freeze()));
    }

    /// Finds an unused ID.
    ///
    /// Normally this is the ID after the largest one in use. Only once that
    /// is `MAX_ID` do we search for a gap.
    fn free_id(queries: &BTreeMap<u16, Entry>) -> Option<u16> {
        let max = match queries.keys().next_back() {
            None => return Some(0),
            Some(max) => *max,
        };
        if max < MAX_ID {
            return Some(max + 1);
        }
        let mut expected = 0u16;
        for id in queries.keys() {
            if *id != expected {
                return Some(expected);
            }
            if expected == MAX_ID {
                break;
            }
            expected += 1;
        }
        None
    }

    /// Locks the map.
    fn lock(&self) -> MutexGuard<'_, Table> {
        // A panic while holding the lock leaves the map consistent, so a
        // poisoned lock is still usable.
        self.queries.lock().unwrap_or_else(|err| err.into_inner())
    }
}

//============ Tests =========================================================

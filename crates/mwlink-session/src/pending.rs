use std::collections::HashMap;
use std::io::Write;
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use mwlink_frame::{encode_envelope_frame, Direction};
use tracing::{debug, warn};

use crate::error::RequestError;
use crate::sync::lock;

/// Round-trip deadline for a single request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);

type DecodeError = Box<dyn std::error::Error + Send + Sync>;
type Completion = std::result::Result<Bytes, RequestError>;

/// Per-request options.
///
/// `priority` routes the request through the bridge's priority lane;
/// `cache` opts into last-response caching, including its double-delivery
/// behavior in callback mode. Both default to off.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    pub priority: bool,
    pub cache: bool,
}

/// Pending-request table configuration.
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Round-trip deadline per request.
    pub request_timeout: Duration,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            request_timeout: REQUEST_TIMEOUT,
        }
    }
}

struct Pending {
    code: u8,
    issued_at: Instant,
    tx: SyncSender<Completion>,
}

struct Slots {
    last_id: u8,
    entries: HashMap<u8, Pending>,
}

struct Shared {
    writer: Mutex<Box<dyn Write + Send>>,
    slots: Mutex<Slots>,
    cache: Mutex<HashMap<u8, Bytes>>,
    closed: AtomicBool,
    config: TableConfig,
}

/// The correlation engine for one network transport.
///
/// Cheaply cloneable handle; all clones share the same id ring, slot map,
/// and response cache. The table owns the request-direction envelope
/// writer for its transport; a reader loop elsewhere feeds decoded
/// response envelopes back in via [`PendingTable::complete`].
#[derive(Clone)]
pub struct PendingTable {
    shared: Arc<Shared>,
}

impl PendingTable {
    /// Create a table writing request envelopes to `writer`.
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self::with_config(writer, TableConfig::default())
    }

    /// Create a table with explicit configuration.
    pub fn with_config(writer: Box<dyn Write + Send>, config: TableConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                writer: Mutex::new(writer),
                slots: Mutex::new(Slots {
                    last_id: 0,
                    entries: HashMap::new(),
                }),
                cache: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                config,
            }),
        }
    }

    /// Issue a request and block the calling thread until the matching
    /// response arrives, the deadline passes, or the link closes.
    ///
    /// The response payload is decoded by `decode` on the caller's
    /// thread. With `options.cache` set and a cached payload available,
    /// the cached value is returned immediately and a refresh round trip
    /// proceeds in the background.
    pub fn call<T>(
        &self,
        code: u8,
        payload: &[u8],
        options: CallOptions,
        decode: impl FnOnce(&Bytes) -> std::result::Result<T, DecodeError>,
    ) -> std::result::Result<T, RequestError> {
        if options.cache {
            if let Some(hit) = self.cached(code) {
                let table = self.clone();
                let refresh = Bytes::copy_from_slice(payload);
                let priority = options.priority;
                thread::spawn(move || {
                    if let Err(err) = table.round_trip(code, &refresh, priority, true) {
                        debug!(code, error = %err, "cache refresh failed");
                    }
                });
                return decode(&hit).map_err(|err| RequestError::decode(code, err));
            }
        }
        let bytes = self.round_trip(code, payload, options.priority, options.cache)?;
        decode(&bytes).map_err(|err| RequestError::decode(code, err))
    }

    /// Issue a request and return immediately; `on_complete` fires on a
    /// worker thread.
    ///
    /// The callback fires exactly once — except when `options.cache` hits,
    /// in which case it fires twice: first with the cached value, then
    /// with the fresh response once the refresh round trip completes.
    pub fn call_with<T, D, F>(
        &self,
        code: u8,
        payload: impl Into<Bytes>,
        options: CallOptions,
        decode: D,
        on_complete: F,
    ) where
        T: Send + 'static,
        D: Fn(&Bytes) -> std::result::Result<T, DecodeError> + Send + 'static,
        F: Fn(std::result::Result<T, RequestError>) + Send + 'static,
    {
        let table = self.clone();
        let payload = payload.into();
        thread::spawn(move || {
            if options.cache {
                if let Some(hit) = table.cached(code) {
                    on_complete(decode(&hit).map_err(|err| RequestError::decode(code, err)));
                    let fresh = table
                        .round_trip(code, &payload, options.priority, true)
                        .and_then(|bytes| {
                            decode(&bytes).map_err(|err| RequestError::decode(code, err))
                        });
                    on_complete(fresh);
                    return;
                }
            }
            let result = table
                .round_trip(code, &payload, options.priority, options.cache)
                .and_then(|bytes| decode(&bytes).map_err(|err| RequestError::decode(code, err)));
            on_complete(result);
        });
    }

    /// Route a response payload to the caller pending on `id`.
    ///
    /// A response with no matching pending entry — already timed out, or
    /// a duplicate — is discarded silently.
    pub fn complete(&self, id: u8, payload: Bytes) {
        let entry = lock(&self.shared.slots).entries.remove(&id);
        match entry {
            Some(pending) => {
                debug!(
                    id,
                    code = pending.code,
                    elapsed_ms = pending.issued_at.elapsed().as_millis() as u64,
                    "response matched"
                );
                let _ = pending.tx.send(Ok(payload));
            }
            None => debug!(id, "stale response discarded"),
        }
    }

    /// Fail every pending request with [`RequestError::LinkClosed`] and
    /// refuse further calls. Invoked on transport teardown.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let drained: Vec<Pending> = {
            let mut slots = lock(&self.shared.slots);
            slots.entries.drain().map(|(_, p)| p).collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "failing pending requests on close");
        }
        for pending in drained {
            let _ = pending.tx.send(Err(RequestError::LinkClosed));
        }
    }

    /// Whether [`PendingTable::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Number of requests currently pending.
    pub fn pending_count(&self) -> usize {
        lock(&self.shared.slots).entries.len()
    }

    /// Whether `other` is a clone of this table (shares the same slots).
    pub fn shares_state_with(&self, other: &PendingTable) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn cached(&self, code: u8) -> Option<Bytes> {
        lock(&self.shared.cache).get(&code).cloned()
    }

    fn round_trip(
        &self,
        code: u8,
        payload: &[u8],
        priority: bool,
        store_cache: bool,
    ) -> Completion {
        if self.is_closed() {
            return Err(RequestError::LinkClosed);
        }

        let (tx, rx) = mpsc::sync_channel(1);
        let id = self.allocate(code, tx)?;

        let mut wire = BytesMut::new();
        if let Err(err) = encode_envelope_frame(Direction::Request, id, code, priority, payload, &mut wire)
        {
            lock(&self.shared.slots).entries.remove(&id);
            return Err(err.into());
        }

        // Fire-and-forget: a failed write is diagnosed here and the caller
        // is bounded by its own deadline.
        if let Err(err) = lock(&self.shared.writer).write_all(&wire) {
            warn!(id, code, error = %err, "request write failed");
        }

        let timeout = self.shared.config.request_timeout;
        let outcome = match rx.recv_timeout(timeout) {
            Ok(completion) => completion,
            Err(RecvTimeoutError::Timeout) => {
                let won = lock(&self.shared.slots).entries.remove(&id).is_some();
                if won {
                    Err(RequestError::Timeout { id, code, timeout })
                } else {
                    // A completion raced the deadline; it wins.
                    rx.recv().unwrap_or(Err(RequestError::LinkClosed))
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(RequestError::LinkClosed),
        };

        if store_cache {
            if let Ok(bytes) = &outcome {
                lock(&self.shared.cache).insert(code, bytes.clone());
            }
        }
        outcome
    }

    /// Allocate the next free id, scanning forward cyclically from the
    /// last-used id. Fails immediately when the whole ring is pending.
    fn allocate(&self, code: u8, tx: SyncSender<Completion>) -> std::result::Result<u8, RequestError> {
        let mut slots = lock(&self.shared.slots);
        let start = slots.last_id;
        let mut id = start;
        loop {
            id = id.wrapping_add(1);
            if !slots.entries.contains_key(&id) {
                slots.last_id = id;
                slots.entries.insert(
                    id,
                    Pending {
                        code,
                        issued_at: Instant::now(),
                        tx,
                    },
                );
                return Ok(id);
            }
            if id == start {
                return Err(RequestError::IdSpaceExhausted);
            }
        }
    }
}

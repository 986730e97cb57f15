//! Single-flight resolution of cache misses.
//!
//! The first request for a missing key installs a ticket and spawns the
//! fetch-and-populate task; every request for the same key that arrives while
//! the ticket is live subscribes to it instead of touching the source. The
//! ticket is removed before its result is published, so a request arriving
//! after completion starts a fresh resolution (no negative caching).
//!
//! The fetch runs on its own task: a caller that goes away while waiting
//! drops only its receiver, never the fetch other callers depend on.
//!
//! The fetcher looks in the target once more before reading the source. A
//! request whose own target lookup lost a race with a completed fill then
//! gets the stored copy instead of starting a second copy.

use crate::{
    errors::ProxyError,
    models::{
        object::{FetchOrigin, FetchedObject, ObjectMeta},
        object_key::ObjectKey,
    },
    services::gateway::{GatewayError, GatewayResult, StorageGateway, with_timeout},
};
use bytes::BytesMut;
use futures::StreamExt;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, warn};

/// What every request joined to one ticket receives.
pub type FetchResult = Result<FetchedObject, ProxyError>;

/// Upper bound on the buffer reserved up front from an advertised length.
const INITIAL_BUFFER_LIMIT: usize = 8 * 1024 * 1024;

type Ticket = watch::Receiver<Option<FetchResult>>;
type TicketTable = Arc<Mutex<HashMap<ObjectKey, Ticket>>>;

pub struct FetchCoordinator {
    source: Arc<dyn StorageGateway>,
    target: Arc<dyn StorageGateway>,
    tickets: TicketTable,
    source_timeout: Option<Duration>,
    target_timeout: Option<Duration>,
    max_object_bytes: Option<u64>,
}

/// Per-fetch limits, copied into the spawned task.
#[derive(Clone, Copy, Debug)]
struct FetchLimits {
    source_timeout: Option<Duration>,
    target_timeout: Option<Duration>,
    max_object_bytes: Option<u64>,
}

enum Role {
    /// First request for the key: owns the fetch.
    Fetcher(TicketGuard, Ticket),
    /// A fetch is already in flight: wait for its outcome.
    Waiter(Ticket),
}

/// Removes the ticket from the table when the fetch finishes, or when the
/// fetch task unwinds without finishing. In the latter case the sender is
/// dropped with no value and waiters see the channel close.
struct TicketGuard {
    key: ObjectKey,
    tickets: TicketTable,
    tx: Option<watch::Sender<Option<FetchResult>>>,
}

impl TicketGuard {
    fn complete(mut self, result: FetchResult) {
        self.tickets.lock().remove(&self.key);
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(result));
        }
    }
}

impl Drop for TicketGuard {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.tickets.lock().remove(&self.key);
        }
    }
}

impl FetchCoordinator {
    pub fn new(source: Arc<dyn StorageGateway>, target: Arc<dyn StorageGateway>) -> Self {
        Self {
            source,
            target,
            tickets: Arc::new(Mutex::new(HashMap::new())),
            source_timeout: None,
            target_timeout: None,
            max_object_bytes: None,
        }
    }

    /// Bound the source read and the target write separately.
    pub fn with_timeouts(
        mut self,
        source_timeout: Option<Duration>,
        target_timeout: Option<Duration>,
    ) -> Self {
        self.source_timeout = source_timeout;
        self.target_timeout = target_timeout;
        self
    }

    /// Refuse to buffer objects larger than `limit` bytes (`None` = no limit).
    pub fn with_max_object_size(mut self, limit: Option<u64>) -> Self {
        self.max_object_bytes = limit;
        self
    }

    /// Number of keys with a fetch currently in flight.
    pub fn in_flight(&self) -> usize {
        self.tickets.lock().len()
    }

    /// Resolve a cache miss for `key`: read it from the source, commit it to
    /// the target and return the fetched object, or the classified failure.
    /// An object that reached the target in the meantime is returned as is.
    pub async fn resolve(&self, key: &ObjectKey) -> FetchResult {
        let mut ticket = match self.join_or_install(key) {
            Role::Fetcher(guard, ticket) => {
                debug!(key = %key, "starting fetch from source");
                let source = Arc::clone(&self.source);
                let target = Arc::clone(&self.target);
                let limits = FetchLimits {
                    source_timeout: self.source_timeout,
                    target_timeout: self.target_timeout,
                    max_object_bytes: self.max_object_bytes,
                };
                tokio::spawn(async move {
                    let result =
                        fetch_and_populate(source.as_ref(), target.as_ref(), &guard.key, limits)
                            .await;
                    guard.complete(result);
                });
                ticket
            }
            Role::Waiter(ticket) => {
                debug!(key = %key, "joining in-flight fetch");
                ticket
            }
        };

        match ticket.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone().unwrap_or_else(|| {
                Err(ProxyError::internal(format!("fetch for `{key}` has no outcome")))
            }),
            Err(_) => Err(ProxyError::internal(format!(
                "fetch for `{key}` ended without a result"
            ))),
        }
    }

    /// The only critical section: decide whether to become or join the fetcher.
    fn join_or_install(&self, key: &ObjectKey) -> Role {
        let mut tickets = self.tickets.lock();
        if let Some(ticket) = tickets.get(key) {
            return Role::Waiter(ticket.clone());
        }

        let (tx, rx) = watch::channel(None);
        tickets.insert(key.clone(), rx.clone());
        let guard = TicketGuard {
            key: key.clone(),
            tickets: Arc::clone(&self.tickets),
            tx: Some(tx),
        };
        Role::Fetcher(guard, rx)
    }
}

async fn fetch_and_populate(
    source: &dyn StorageGateway,
    target: &dyn StorageGateway,
    key: &ObjectKey,
    limits: FetchLimits,
) -> FetchResult {
    let stored = with_timeout(
        limits.target_timeout,
        read_fully(target, key, limits.max_object_bytes, FetchOrigin::Target),
    )
    .await;
    match stored {
        Ok(object) => {
            debug!(key = %key, "object already in target");
            return Ok(object);
        }
        Err(err) if err.is_not_found() => {}
        Err(err) => {
            warn!(key = %key, class = %err.class(), error = %err, "target re-check failed");
            return Err(ProxyError::internal(format!(
                "target {} unavailable: {err}",
                target.describe()
            )));
        }
    }

    let source_read = read_fully(source, key, limits.max_object_bytes, FetchOrigin::Source);
    let object = match with_timeout(limits.source_timeout, source_read).await {
        Ok(object) => object,
        Err(err) if err.is_not_found() => {
            debug!(key = %key, "object absent at source");
            return Err(ProxyError::NotFound(key.to_string()));
        }
        Err(err) => {
            warn!(key = %key, class = %err.class(), error = %err, "source read failed");
            return Err(ProxyError::Upstream {
                class: err.class(),
                message: err.to_string(),
            });
        }
    };

    // Never serve bytes that did not make it into the target.
    if let Err(err) = with_timeout(
        limits.target_timeout,
        target.write(key, object.body.clone(), &object.meta),
    )
    .await
    {
        warn!(key = %key, class = %err.class(), error = %err, "target write failed");
        return Err(ProxyError::Storage {
            class: err.class(),
            message: err.to_string(),
        });
    }

    debug!(key = %key, bytes = object.len(), "object copied to target");
    Ok(object)
}

/// Read a whole object into memory, checking it against the advertised size
/// and the configured limit. The advertised size only sizes the first
/// reservation up to `INITIAL_BUFFER_LIMIT`.
async fn read_fully(
    gateway: &dyn StorageGateway,
    key: &ObjectKey,
    max_bytes: Option<u64>,
    origin: FetchOrigin,
) -> GatewayResult<FetchedObject> {
    let too_large = |size: u64, limit: u64| {
        GatewayError::Other(format!(
            "object `{key}` is {size} bytes, over the {limit} byte limit"
        ))
    };

    let mut stream = gateway.read(key).await?;
    let expected = stream.meta.content_length;
    if let (Some(size), Some(limit)) = (expected, max_bytes) {
        if size > limit {
            return Err(too_large(size, limit));
        }
    }

    let reserve = expected
        .and_then(|len| usize::try_from(len).ok())
        .unwrap_or(0)
        .min(INITIAL_BUFFER_LIMIT);
    let mut buf = BytesMut::with_capacity(reserve);
    while let Some(chunk) = stream.body.next().await {
        let chunk = chunk?;
        let received = (buf.len() + chunk.len()) as u64;
        if let Some(limit) = max_bytes {
            if received > limit {
                return Err(too_large(received, limit));
            }
        }
        buf.extend_from_slice(&chunk);
    }

    let received = buf.len() as u64;
    if let Some(expected) = expected {
        if expected != received {
            return Err(GatewayError::Transient(format!(
                "length mismatch for `{key}`: expected {expected} bytes, got {received}"
            )));
        }
    }

    Ok(FetchedObject {
        meta: ObjectMeta {
            content_length: Some(received),
            ..stream.meta
        },
        body: buf.freeze(),
        origin,
    })
}

//! In-process gateway holding objects in a map.
//!
//! Every operation is counted, failures can be injected per operation, and
//! reads can be held at a gate so callers can line up concurrent requests
//! before any of them completes. Individual reads can also be answered late,
//! after the map has already been consulted, to stand in for a slow bucket.

use crate::{
    models::{
        object::{ObjectMeta, ObjectStream},
        object_key::ObjectKey,
    },
    services::gateway::{ErrorClass, GatewayError, GatewayResult, StorageGateway},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use tokio::sync::watch;

#[derive(Clone, Debug)]
struct StoredObject {
    meta: ObjectMeta,
    body: Bytes,
}

/// Call counts observed by a `MemoryGateway`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub exists: usize,
    pub head: usize,
    pub read: usize,
    pub write: usize,
}

pub struct MemoryGateway {
    name: String,
    read_only: bool,
    objects: Mutex<HashMap<String, StoredObject>>,
    exists_calls: AtomicUsize,
    head_calls: AtomicUsize,
    read_calls: AtomicUsize,
    write_calls: AtomicUsize,
    reads_started: watch::Sender<usize>,
    read_gate: Mutex<Option<watch::Receiver<bool>>>,
    read_fault: Mutex<Option<ErrorClass>>,
    write_fault: Mutex<Option<ErrorClass>>,
    read_delays: Mutex<HashMap<usize, Duration>>,
}

/// Holds reads on a `MemoryGateway` until opened or dropped.
pub struct ReadGate {
    tx: watch::Sender<bool>,
}

impl ReadGate {
    pub fn open(&self) {
        self.tx.send_replace(true);
    }
}

impl MemoryGateway {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            read_only: false,
            objects: Mutex::new(HashMap::new()),
            exists_calls: AtomicUsize::new(0),
            head_calls: AtomicUsize::new(0),
            read_calls: AtomicUsize::new(0),
            write_calls: AtomicUsize::new(0),
            reads_started: watch::Sender::new(0),
            read_gate: Mutex::new(None),
            read_fault: Mutex::new(None),
            write_fault: Mutex::new(None),
            read_delays: Mutex::new(HashMap::new()),
        }
    }

    /// A gateway that rejects writes, like a remote source bucket.
    pub fn read_only(name: impl Into<String>) -> Self {
        Self {
            read_only: true,
            ..Self::new(name)
        }
    }

    /// Seed an object without touching the call counters.
    pub fn insert(&self, key: &str, body: impl Into<Bytes>, content_type: Option<&str>) {
        let body = body.into();
        let meta = ObjectMeta {
            content_type: content_type.map(str::to_string),
            content_length: Some(body.len() as u64),
            etag: Some(format!("{:x}", md5::compute(&body))),
            last_modified: Some(Utc::now()),
        };
        self.objects
            .lock()
            .insert(key.to_string(), StoredObject { meta, body });
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().get(key).map(|obj| obj.body.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().contains_key(key)
    }

    pub fn calls(&self) -> CallCounts {
        CallCounts {
            exists: self.exists_calls.load(Ordering::SeqCst),
            head: self.head_calls.load(Ordering::SeqCst),
            read: self.read_calls.load(Ordering::SeqCst),
            write: self.write_calls.load(Ordering::SeqCst),
        }
    }

    /// Make every subsequent read fail with the given class (`None` clears).
    pub fn fail_reads(&self, class: Option<ErrorClass>) {
        *self.read_fault.lock() = class;
    }

    /// Make every subsequent write fail with the given class (`None` clears).
    pub fn fail_writes(&self, class: Option<ErrorClass>) {
        *self.write_fault.lock() = class;
    }

    /// Answer the `nth` read (1-based) only after `delay`. The object is
    /// looked up before the delay, so the answer may be stale by then.
    pub fn slow_read(&self, nth: usize, delay: Duration) {
        self.read_delays.lock().insert(nth, delay);
    }

    /// Hold all reads that start from now on until the gate is opened.
    pub fn pause_reads(&self) -> ReadGate {
        let (tx, rx) = watch::channel(false);
        *self.read_gate.lock() = Some(rx);
        ReadGate { tx }
    }

    /// Wait until at least `n` reads have reached this gateway.
    pub async fn wait_for_reads(&self, n: usize) {
        let mut rx = self.reads_started.subscribe();
        // The sender lives as long as `self`, so this only fails on drop.
        let _ = rx.wait_for(|started| *started >= n).await;
    }

    fn fault(class: ErrorClass, key: &ObjectKey) -> GatewayError {
        match class {
            ErrorClass::NotFound => GatewayError::NotFound(key.to_string()),
            ErrorClass::AccessDenied => GatewayError::AccessDenied(key.to_string()),
            ErrorClass::Transient => GatewayError::Transient("injected fault".into()),
            ErrorClass::Other => GatewayError::Other("injected fault".into()),
        }
    }
}

#[async_trait]
impl StorageGateway for MemoryGateway {
    fn describe(&self) -> String {
        format!("memory({})", self.name)
    }

    async fn exists(&self, key: &ObjectKey) -> GatewayResult<bool> {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.contains(key.as_str()))
    }

    async fn head(&self, key: &ObjectKey) -> GatewayResult<ObjectMeta> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(class) = *self.read_fault.lock() {
            return Err(Self::fault(class, key));
        }
        self.objects
            .lock()
            .get(key.as_str())
            .map(|obj| obj.meta.clone())
            .ok_or_else(|| GatewayError::NotFound(key.to_string()))
    }

    async fn read(&self, key: &ObjectKey) -> GatewayResult<ObjectStream> {
        let nth = self.read_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.reads_started.send_modify(|started| *started += 1);

        let gate = self.read_gate.lock().clone();
        if let Some(mut gate) = gate {
            let _ = gate.wait_for(|open| *open).await;
        }

        if let Some(class) = *self.read_fault.lock() {
            return Err(Self::fault(class, key));
        }
        let object = self.objects.lock().get(key.as_str()).cloned();

        let delay = self.read_delays.lock().get(&nth).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let object = object.ok_or_else(|| GatewayError::NotFound(key.to_string()))?;
        Ok(ObjectStream::from_bytes(object.meta, object.body))
    }

    async fn write(&self, key: &ObjectKey, body: Bytes, meta: &ObjectMeta) -> GatewayResult<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if self.read_only {
            return Err(GatewayError::ReadOnly);
        }
        if let Some(class) = *self.write_fault.lock() {
            return Err(Self::fault(class, key));
        }
        let meta = ObjectMeta {
            content_length: Some(body.len() as u64),
            etag: Some(format!("{:x}", md5::compute(&body))),
            last_modified: Some(Utc::now()),
            ..meta.clone()
        };
        self.objects
            .lock()
            .insert(key.to_string(), StoredObject { meta, body });
        Ok(())
    }
}

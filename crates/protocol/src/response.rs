//! Per-request inbound queues keyed by field id.

use crate::connection::Field;
use crate::error::{NcpError, Result};
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

pub(crate) type QueueItem = std::result::Result<Field, NcpError>;

const RESPONSE_QUEUE_DEPTH: usize = 64;

/// The connection's map from outbound field id to the queue of the
/// [`Response`] awaiting replies to it.
///
/// Accessed from the reader task and from send call sites; the lock is never
/// held across an await.
pub(crate) struct ResponseRegistry {
    map: Mutex<HashMap<u32, mpsc::Sender<QueueItem>>>,
}

impl ResponseRegistry {
    pub(crate) fn new() -> Self {
        ResponseRegistry {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a queue owning every id in `ids`.
    pub(crate) fn register(&self, ids: &[u32]) -> mpsc::Receiver<QueueItem> {
        let (tx, rx) = mpsc::channel(RESPONSE_QUEUE_DEPTH);
        let mut map = self.lock();
        for &id in ids {
            map.insert(id, tx.clone());
        }
        rx
    }

    /// Releases ids claimed by [`register`](Self::register). Idempotent.
    pub(crate) fn deregister(&self, ids: &[u32]) {
        let mut map = self.lock();
        for id in ids {
            map.remove(id);
        }
    }

    /// The queue owning `id`, if any.
    pub(crate) fn sender_for(&self, id: u32) -> Option<mpsc::Sender<QueueItem>> {
        self.lock().get(&id).cloned()
    }

    /// Delivers `err` to every live queue, then closes them all. A full
    /// queue must not swallow the fault, so those sends finish on a helper
    /// task behind the already-queued replies.
    pub(crate) fn poison(&self, err: &NcpError) {
        let mut map = self.lock();
        for tx in map.values() {
            if let Err(TrySendError::Full(item)) = tx.try_send(Err(err.clone())) {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(item).await;
                });
            }
        }
        map.clear();
    }

    /// Closes every queue without delivering anything.
    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, mpsc::Sender<QueueItem>>> {
        match self.map.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Replies to one send call.
///
/// A `Response` receives exactly those inbound fields whose packet id is in
/// the id set of the originating send. It is a [`futures::Stream`] of
/// fields, ending when the connection closes or the response is closed.
pub struct Response {
    registry: Arc<ResponseRegistry>,
    ids: Vec<u32>,
    rx: mpsc::Receiver<QueueItem>,
    // Fields set aside by recv_field, handed back in order by later calls.
    lookahead: VecDeque<Field>,
    // True once close() ran; an intentional end, not a peer-initiated one.
    closed: bool,
    caller_closed: Arc<AtomicBool>,
    terminated: bool,
}

impl Response {
    pub(crate) fn new(
        registry: Arc<ResponseRegistry>,
        ids: Vec<u32>,
        rx: mpsc::Receiver<QueueItem>,
        caller_closed: Arc<AtomicBool>,
    ) -> Self {
        Response {
            registry,
            ids,
            rx,
            lookahead: VecDeque::new(),
            closed: false,
            caller_closed,
            terminated: false,
        }
    }

    /// The outbound field ids this response receives replies to.
    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    /// Waits for the next field received in reply to the sent packet.
    ///
    /// Returns `Ok(None)` when the stream ended on purpose: this response
    /// was closed, or the caller closed the connection. A peer-initiated
    /// close surfaces [`NcpError::ConnectionClosed`] instead.
    pub async fn recv(&mut self) -> Result<Option<Field>> {
        if let Some(field) = self.lookahead.pop_front() {
            return Ok(Some(field));
        }
        match self.rx.recv().await {
            Some(Ok(field)) => Ok(Some(field)),
            Some(Err(err)) => Err(err),
            None => self.end_of_stream(),
        }
    }

    /// Waits for the next reply field named `field_name`.
    ///
    /// Fields with other names are queued through: they stay available, in
    /// arrival order, for later `recv` calls. End-of-stream behaves as in
    /// [`recv`](Self::recv).
    pub async fn recv_field(&mut self, field_name: &str) -> Result<Option<Field>> {
        if let Some(position) = self
            .lookahead
            .iter()
            .position(|field| field.name() == field_name)
        {
            return Ok(self.lookahead.remove(position));
        }
        loop {
            match self.rx.recv().await {
                Some(Ok(field)) if field.name() == field_name => return Ok(Some(field)),
                Some(Ok(field)) => self.lookahead.push_back(field),
                Some(Err(err)) => return Err(err),
                None => return self.end_of_stream(),
            }
        }
    }

    /// Stops receiving. Replies already delivered drain first; after that,
    /// `recv` sees a clean end-of-stream.
    pub fn close(&mut self) {
        self.registry.deregister(&self.ids);
        self.rx.close();
        self.closed = true;
    }

    fn end_of_stream(&self) -> Result<Option<Field>> {
        if self.closed || self.caller_closed.load(Ordering::SeqCst) {
            Ok(None)
        } else {
            Err(NcpError::ConnectionClosed)
        }
    }
}

impl Drop for Response {
    fn drop(&mut self) {
        self.registry.deregister(&self.ids);
    }
}

impl futures::Stream for Response {
    type Item = Result<Field>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(field) = this.lookahead.pop_front() {
            return Poll::Ready(Some(Ok(field)));
        }
        if this.terminated {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(item)) => Poll::Ready(Some(item)),
            Poll::Ready(None) => {
                this.terminated = true;
                match this.end_of_stream() {
                    Ok(None) => Poll::Ready(None),
                    _ => Poll::Ready(Some(Err(NcpError::ConnectionClosed))),
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response").field("ids", &self.ids).finish()
    }
}

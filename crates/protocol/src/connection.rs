//! The per-peer control plane: one connection over one byte stream.
//!
//! A reader task owns the read half of the transport and demultiplexes
//! inbound fields to either the primary receive queue or the [`Response`]
//! that owns the reply id. Writes are serialized under a connection-local
//! lock, so packet-id order equals wire order no matter how many tasks call
//! [`Connection::send`] concurrently.

use crate::error::{CommandError, CommandWarning, NcpError, NetworkError, Result};
use crate::field::{FieldData, Params};
use crate::handshake::LINK;
use crate::identifier::Identifier;
use crate::options::ConnectionOptions;
use crate::packet::{Packet, Timestamp};
use crate::response::{QueueItem, Response, ResponseRegistry};
use crate::stream::{write_packet, PacketReader};
use crate::value::Value;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};

const PRIMARY_QUEUE_DEPTH: usize = 64;

/// Where the connection stands in the authentication handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// The handshake has not completed (or was skipped with `auto_auth`
    /// off and never driven manually).
    Unauthenticated,

    /// The handshake completed.
    Authenticated,

    /// The connection is closed.
    Closed,
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct SendState {
    /// Taken exactly once at shutdown so the transport is never closed twice.
    writer: Option<BoxedWriter>,
    next_id: u32,
}

pub(crate) struct Shared {
    send: Mutex<SendState>,
    pub(crate) registry: Arc<ResponseRegistry>,
    options: ConnectionOptions,
    remote: StdMutex<String>,
    state: AtomicU8,
    closed: AtomicBool,
    // Set only by close(): distinguishes a caller-initiated close (clean
    // end-of-stream) from a peer-initiated one (an error).
    caller_closed: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    pub(crate) fn remote(&self) -> String {
        match self.remote.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_remote(&self, remote: String) {
        match self.remote.lock() {
            Ok(mut guard) => *guard = remote,
            Err(poisoned) => *poisoned.into_inner() = remote,
        }
    }

    fn state(&self) -> HandshakeState {
        match self.state.load(Ordering::SeqCst) {
            0 => HandshakeState::Unauthenticated,
            1 => HandshakeState::Authenticated,
            _ => HandshakeState::Closed,
        }
    }

    fn set_state(&self, state: HandshakeState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

/// One side of a connection between a client and a server.
///
/// `Connection` is a cheap handle: clones share the same transport, queues
/// and id counter, so it can be passed across tasks freely.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
    primary: Arc<Mutex<mpsc::Receiver<QueueItem>>>,
    done: watch::Receiver<bool>,
}

impl Connection {
    /// Wraps a bidirectional byte stream in a connection and starts its
    /// reader task. The handshake is not run; see the client and server
    /// crates, or [`crate::handshake`], for that.
    pub fn new<S>(stream: S, options: ConnectionOptions) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let remote = options
            .remote_hostname
            .clone()
            .unwrap_or_else(|| "unknown".to_owned());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        let (primary_tx, primary_rx) = mpsc::channel(PRIMARY_QUEUE_DEPTH);
        let shared = Arc::new(Shared {
            send: Mutex::new(SendState {
                writer: Some(Box::new(write_half)),
                next_id: 1,
            }),
            registry: Arc::new(ResponseRegistry::new()),
            options,
            remote: StdMutex::new(remote),
            state: AtomicU8::new(HandshakeState::Unauthenticated as u8),
            closed: AtomicBool::new(false),
            caller_closed: Arc::new(AtomicBool::new(false)),
            shutdown: shutdown_tx,
        });
        let reader = PacketReader::new(Box::new(read_half) as BoxedReader);
        tokio::spawn(run_reader(
            Arc::clone(&shared),
            reader,
            primary_tx,
            shutdown_rx,
            done_tx,
        ));
        Connection {
            shared,
            primary: Arc::new(Mutex::new(primary_rx)),
            done: done_rx,
        }
    }

    /// Sends a packet containing a single field.
    ///
    /// Returns a [`Response`] receiving every inbound field sent in reply.
    pub async fn send(
        &self,
        packet_type: &str,
        field_name: &str,
        params: Params,
    ) -> Result<Response> {
        let packet_type = Identifier::new(packet_type)?;
        let field_name = Identifier::new(field_name)?;
        send_correlated(&self.shared, packet_type, vec![(field_name, params)], None).await
    }

    /// Sends a packet containing multiple fields.
    ///
    /// The returned [`Response`] owns the id of every field, so replies to
    /// any of them arrive on it; [`Response::recv_field`] tells them apart.
    pub async fn send_packet(
        &self,
        packet_type: &str,
        fields: Vec<(&str, Params)>,
    ) -> Result<Response> {
        let packet_type = Identifier::new(packet_type)?;
        let mut named = Vec::with_capacity(fields.len());
        for (name, params) in fields {
            named.push((Identifier::new(name)?, params));
        }
        send_correlated(&self.shared, packet_type, named, None).await
    }

    /// Waits for the next inbound field that no [`Response`] captured and no
    /// `auto_*` filter consumed.
    ///
    /// Returns `Ok(None)` when the caller closed the connection: a clean
    /// end-of-stream. A peer-initiated close surfaces
    /// [`NcpError::ConnectionClosed`] instead.
    pub async fn recv(&self) -> Result<Option<Field>> {
        let mut primary = self.primary.lock().await;
        match primary.recv().await {
            Some(Ok(field)) => Ok(Some(field)),
            Some(Err(err)) => Err(err),
            None => {
                if self.shared.caller_closed.load(Ordering::SeqCst) {
                    Ok(None)
                } else {
                    Err(NcpError::ConnectionClosed)
                }
            }
        }
    }

    /// Waits for the next inbound field matching the packet type and field
    /// name. Non-matching fields are discarded. End-of-stream behaves as in
    /// [`recv`](Self::recv).
    pub async fn recv_field(&self, packet_type: &str, field_name: &str) -> Result<Option<Field>> {
        loop {
            let Some(field) = self.recv().await? else {
                return Ok(None);
            };
            if field.packet_type() == packet_type && field.name() == field_name {
                return Ok(Some(field));
            }
            tracing::debug!(
                peer = %self.shared.remote(),
                packet_type = %field.packet_type(),
                field = %field.name(),
                "skipped a field while waiting for {packet_type}/{field_name}"
            );
        }
    }

    /// Closes the connection. Idempotent; once the reader task winds down,
    /// pending receives end with a clean `Ok(None)`.
    pub fn close(&self) {
        self.shared.caller_closed.store(true, Ordering::SeqCst);
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shared.shutdown.send(true);
    }

    /// Waits for the connection to fully close. Call after [`close`](Self::close),
    /// or any time to observe a peer-initiated close.
    pub async fn wait_closed(&self) {
        let mut done = self.done.clone();
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// True once [`close`](Self::close) has been called or the reader task
    /// has stopped.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// The identifying label of the remote end, for logs and diagnostics.
    pub fn remote_hostname(&self) -> String {
        self.shared.remote()
    }

    /// Where this connection stands in the authentication handshake.
    pub fn handshake_state(&self) -> HandshakeState {
        self.shared.state()
    }

    pub(crate) fn mark_authenticated(&self) {
        self.shared.set_state(HandshakeState::Authenticated);
    }

    pub(crate) fn set_remote_hostname(&self, remote: &str) {
        self.shared.set_remote(remote.to_owned());
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.shared.remote())
            .field("state", &self.shared.state())
            .finish()
    }
}

/// An inbound field, tagged with the packet that carried it.
#[derive(Debug, Clone)]
pub struct Field {
    conn: Weak<Shared>,
    packet_type: Identifier,
    packet_id: u32,
    packet_timestamp: Timestamp,
    data: FieldData,
}

impl Field {
    /// Type of the packet that carried this field.
    pub fn packet_type(&self) -> Identifier {
        self.packet_type
    }

    /// Id of the packet that carried this field. For a reply packet this is
    /// the id of the outbound field the peer is answering.
    pub fn packet_id(&self) -> u32 {
        self.packet_id
    }

    /// When the carrying packet was generated, by the peer's clock.
    pub fn packet_timestamp(&self) -> Timestamp {
        self.packet_timestamp
    }

    /// Field name.
    pub fn name(&self) -> Identifier {
        self.data.name
    }

    /// Sender-assigned field id.
    pub fn id(&self) -> u32 {
        self.data.id
    }

    /// Sender-chosen type identifier.
    pub fn type_id(&self) -> Identifier {
        self.data.type_id
    }

    /// The parameter map, in wire order.
    pub fn params(&self) -> &Params {
        &self.data.params
    }

    /// Looks up a parameter by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.data.params.get(name)
    }

    /// Sends a single-field packet in reply to this field: same packet
    /// type, same field name, packet id set to this field's id so the peer
    /// can correlate it.
    pub async fn reply(&self, params: Params) -> Result<Response> {
        let shared = self.conn.upgrade().ok_or(NcpError::ConnectionClosed)?;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(NcpError::ConnectionClosed);
        }
        send_correlated(
            &shared,
            self.packet_type,
            vec![(self.data.name, params)],
            Some(self.data.id),
        )
        .await
    }
}

/// Allocates ids and encodes an outbound packet. Call with the send lock held.
fn build_packet(
    send: &mut SendState,
    packet_type: Identifier,
    fields: Vec<(Identifier, Params)>,
    reply_to: Option<u32>,
) -> (Packet, Vec<u32>) {
    let mut ids = Vec::with_capacity(fields.len());
    let mut encoded = Vec::with_capacity(fields.len());
    for (name, params) in fields {
        let id = send.next_id;
        send.next_id = send.next_id.wrapping_add(1);
        ids.push(id);
        encoded.push(FieldData::new(name, id, params));
    }
    let packet_id = match reply_to {
        Some(id) => id,
        None => {
            let id = send.next_id;
            send.next_id = send.next_id.wrapping_add(1);
            id
        }
    };
    let packet = Packet {
        packet_type,
        id: packet_id,
        timestamp: Timestamp::now(),
        info: 0,
        fields: encoded,
    };
    (packet, ids)
}

/// Writes a packet and returns a [`Response`] owning its field ids.
///
/// The ids are registered before the bytes reach the wire, so a reply cannot
/// arrive before its response queue exists.
pub(crate) async fn send_correlated(
    shared: &Arc<Shared>,
    packet_type: Identifier,
    fields: Vec<(Identifier, Params)>,
    reply_to: Option<u32>,
) -> Result<Response> {
    if shared.closed.load(Ordering::SeqCst) {
        return Err(NcpError::ConnectionClosed);
    }
    let mut guard = shared.send.lock().await;
    let send = &mut *guard;
    let (packet, ids) = build_packet(send, packet_type, fields, reply_to);
    let Some(writer) = send.writer.as_mut() else {
        return Err(NcpError::ConnectionClosed);
    };
    let rx = shared.registry.register(&ids);
    if let Err(err) = write_packet(writer, &packet).await {
        shared.registry.deregister(&ids);
        return Err(err.into());
    }
    tracing::debug!(
        peer = %shared.remote(),
        packet_type = %packet.packet_type,
        id = packet.id,
        fields = packet.fields.len(),
        "sent packet"
    );
    Ok(Response::new(
        Arc::clone(&shared.registry),
        ids,
        rx,
        Arc::clone(&shared.caller_closed),
    ))
}

/// Writes a packet nobody will await replies to (keepalive answers).
async fn send_uncorrelated(
    shared: &Arc<Shared>,
    packet_type: Identifier,
    fields: Vec<(Identifier, Params)>,
) -> Result<()> {
    let mut guard = shared.send.lock().await;
    let send = &mut *guard;
    let (packet, _) = build_packet(send, packet_type, fields, None);
    let Some(writer) = send.writer.as_mut() else {
        return Err(NcpError::ConnectionClosed);
    };
    write_packet(writer, &packet).await?;
    Ok(())
}

async fn run_reader(
    shared: Arc<Shared>,
    mut reader: PacketReader<BoxedReader>,
    primary_tx: mpsc::Sender<QueueItem>,
    mut shutdown_rx: watch::Receiver<bool>,
    done_tx: watch::Sender<bool>,
) {
    let fault = loop {
        // The shutdown signal also cancels a dispatch parked on a full
        // queue, not just the transport read.
        tokio::select! {
            _ = shutdown_rx.changed() => break None,
            step = read_and_dispatch(&shared, &mut reader, &primary_tx) => match step {
                Ok(true) => {}
                Ok(false) => break None,
                Err(err) => break Some(err),
            },
        }
    };
    shutdown(&shared, primary_tx, fault, done_tx).await;
}

/// Reads one packet and routes its fields. `Ok(false)` means the stream or
/// the last consumer went away and the reader should stop.
async fn read_and_dispatch(
    shared: &Arc<Shared>,
    reader: &mut PacketReader<BoxedReader>,
    primary_tx: &mpsc::Sender<QueueItem>,
) -> std::result::Result<bool, NetworkError> {
    match reader.read_packet().await? {
        Some(packet) => Ok(dispatch_packet(shared, primary_tx, packet).await.is_ok()),
        None => Ok(false),
    }
}

async fn dispatch_packet(
    shared: &Arc<Shared>,
    primary_tx: &mpsc::Sender<QueueItem>,
    packet: Packet,
) -> std::result::Result<(), ()> {
    tracing::debug!(
        peer = %shared.remote(),
        packet_type = %packet.packet_type,
        id = packet.id,
        fields = packet.fields.len(),
        "received packet"
    );
    for data in packet.fields {
        let field = Field {
            conn: Arc::downgrade(shared),
            packet_type: packet.packet_type,
            packet_id: packet.id,
            packet_timestamp: packet.timestamp,
            data,
        };
        dispatch_field(shared, primary_tx, field).await?;
    }
    Ok(())
}

async fn dispatch_field(
    shared: &Arc<Shared>,
    primary_tx: &mpsc::Sender<QueueItem>,
    field: Field,
) -> std::result::Result<(), ()> {
    let options = &shared.options;
    // Keepalive: answer in kind, never surface.
    if field.packet_type == LINK && field.data.name == LINK {
        if let Err(err) =
            send_uncorrelated(shared, LINK, vec![(LINK, Params::new())]).await
        {
            tracing::debug!(peer = %shared.remote(), error = %err, "keepalive answer failed");
        }
        return Ok(());
    }
    // Fatal command error, raised at the targeted consumer.
    if options.auto_erro {
        let detail = field.data.params.get("ERRO").and_then(Value::as_str);
        let code = field.data.params.get("ERRC").and_then(Value::as_i32);
        if let (Some(detail), Some(code)) = (detail, code) {
            if code != 0 {
                let err = CommandError {
                    packet_type: field.packet_type,
                    field_name: field.data.name,
                    detail: detail.to_owned(),
                    code,
                };
                return deliver(shared, primary_tx, field.packet_id, Err(err.into())).await;
            }
        }
    }
    // Non-fatal warning, routed to the sink.
    if options.auto_warn {
        if let Some(detail) = field.data.params.get("WARN").and_then(Value::as_str) {
            let warning = CommandWarning {
                packet_type: field.packet_type,
                field_name: field.data.name,
                detail: detail.to_owned(),
                code: field
                    .data
                    .params
                    .get("WARC")
                    .and_then(Value::as_i32)
                    .unwrap_or(0),
            };
            match &options.warning_sink {
                Some(sink) => {
                    let _ = sink.send(warning);
                }
                None => {
                    tracing::warn!(peer = %shared.remote(), warning = %warning, "command warning")
                }
            }
            return Ok(());
        }
    }
    // Silent acknowledgment.
    if options.auto_ackn && field.data.params.get("ACKN").is_some() {
        return Ok(());
    }
    deliver(shared, primary_tx, field.packet_id, Ok(field)).await
}

/// Routes an item to the [`Response`] owning the reply id, or the primary
/// queue when none does — never both.
async fn deliver(
    shared: &Arc<Shared>,
    primary_tx: &mpsc::Sender<QueueItem>,
    reply_id: u32,
    item: QueueItem,
) -> std::result::Result<(), ()> {
    if let Some(tx) = shared.registry.sender_for(reply_id) {
        // A closed response discards its remaining traffic.
        let _ = tx.send(item).await;
        return Ok(());
    }
    primary_tx.send(item).await.map_err(|_| ())
}

async fn shutdown(
    shared: &Arc<Shared>,
    primary_tx: mpsc::Sender<QueueItem>,
    fault: Option<NetworkError>,
    done_tx: watch::Sender<bool>,
) {
    shared.closed.store(true, Ordering::SeqCst);
    shared.set_state(HandshakeState::Closed);
    match fault {
        Some(err) => {
            tracing::warn!(peer = %shared.remote(), error = %err, "connection failed");
            let err = NcpError::Network(err);
            // A full primary queue must not swallow the fault: finish the
            // send on a helper task, behind the already-queued fields.
            if let Err(TrySendError::Full(item)) = primary_tx.try_send(Err(err.clone())) {
                let fault_tx = primary_tx.clone();
                tokio::spawn(async move {
                    let _ = fault_tx.send(item).await;
                });
            }
            shared.registry.poison(&err);
        }
        None => {
            tracing::info!(peer = %shared.remote(), "connection closed");
            shared.registry.clear();
        }
    }
    drop(primary_tx);
    // Drain the in-flight write, then shut the transport down exactly once.
    let mut send = shared.send.lock().await;
    if let Some(mut writer) = send.writer.take() {
        let _ = writer.shutdown().await;
    }
    drop(send);
    let _ = done_tx.send(true);
}

//! Multiplexed JSON-RPC connection over one duplex byte stream.
//!
//! Writes go through a single writer behind a mutex. A reader task decodes
//! incoming frames, routes responses to the pending call with the matching
//! correlation id, records liveness notifications, and fails every pending
//! call once the stream closes or becomes unreadable.

use crate::codec::{
    self, CodecConfig, CorrelationIds, FrameDecoder, HEARTBEAT, Incoming, READY, RpcErrorObject,
    error_codes,
};
use crate::error::ProtocolError;
use chrono::{DateTime, Utc};
use keel_core::{CallError, CallResult, HandleId};
use keel_observability::{KeelEvent, SharedSink};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Semaphore, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

type ResultSlot = oneshot::Sender<CallResult<Value>>;

/// Liveness signals (`ready` / `heartbeat` notifications) seen so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Liveness {
    pub signals: u64,
    pub last_signal: Option<DateTime<Utc>>,
}

/// Why a connection stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Eof,
    Io(String),
    Framing(ProtocolError),
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Eof => write!(f, "stream closed by peer"),
            CloseReason::Io(e) => write!(f, "I/O error: {e}"),
            CloseReason::Framing(e) => write!(f, "fatal framing error: {e}"),
            CloseReason::Shutdown => write!(f, "connection shut down"),
        }
    }
}

#[derive(Default)]
struct PendingCalls {
    slots: HashMap<u64, ResultSlot>,
    closed: Option<CloseReason>,
}

struct Shared {
    handle: HandleId,
    pending: StdMutex<PendingCalls>,
    liveness: watch::Sender<Liveness>,
    closed: watch::Sender<Option<CloseReason>>,
    sink: SharedSink,
}

impl Shared {
    fn pending(&self) -> std::sync::MutexGuard<'_, PendingCalls> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, id: u64, result: CallResult<Value>) -> bool {
        let slot = self.pending().slots.remove(&id);
        match slot {
            Some(slot) => {
                // The caller may have given up already.
                let _ = slot.send(result);
                true
            }
            None => false,
        }
    }

    fn route(&self, body: &[u8]) {
        match codec::decode_message(body) {
            Ok(Incoming::Response { id, result }) => {
                let result = result.map_err(call_error_from_rpc);
                if !self.complete(id, result) {
                    self.report(&ProtocolError::UnknownCorrelationId(id));
                }
            }
            Ok(Incoming::Notification { method, .. }) if method == READY || method == HEARTBEAT => {
                tracing::trace!(handle = %self.handle, %method, "Liveness signal");
                self.liveness.send_modify(|l| {
                    l.signals += 1;
                    l.last_signal = Some(Utc::now());
                });
            }
            Ok(Incoming::Notification { method, .. }) => {
                tracing::debug!(handle = %self.handle, %method, "Ignoring notification");
            }
            Ok(Incoming::Request { id, method, .. }) => {
                tracing::debug!(handle = %self.handle, id, %method, "Ignoring server request");
            }
            Err(e) => {
                let routed = e
                    .correlation_id()
                    .is_some_and(|id| self.complete(id, Err(CallError::protocol(e.to_string()))));
                if !routed {
                    self.report(&e);
                }
            }
        }
    }

    fn report(&self, error: &ProtocolError) {
        tracing::debug!(handle = %self.handle, error = %error, "Protocol error");
        self.sink.emit(&KeelEvent::ProtocolError {
            handle: self.handle.clone(),
            message: error.to_string(),
            fatal: error.is_fatal(),
        });
    }

    /// Mark closed and fail every pending call. Only the first reason sticks.
    fn close(&self, reason: CloseReason) {
        let slots = {
            let mut pending = self.pending();
            if pending.closed.is_some() {
                return;
            }
            pending.closed = Some(reason.clone());
            std::mem::take(&mut pending.slots)
        };
        if let CloseReason::Framing(e) = &reason {
            self.report(e);
        }
        tracing::debug!(
            handle = %self.handle,
            reason = %reason,
            failed_calls = slots.len(),
            "Connection closed"
        );
        for (_, slot) in slots {
            let _ = slot.send(Err(CallError::handle_unavailable(
                &self.handle,
                reason.to_string(),
            )));
        }
        self.closed.send_replace(Some(reason));
    }
}

/// Removes a pending slot if the call is abandoned before a response.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending().slots.remove(&self.id);
    }
}

/// Map an error response onto the call error taxonomy.
///
/// Parse and invalid-request errors mean our frame was garbled in transit;
/// every other code is the tool's own answer and is passed through.
pub fn call_error_from_rpc(error: RpcErrorObject) -> CallError {
    match error.code {
        error_codes::PARSE_ERROR | error_codes::INVALID_REQUEST => CallError::protocol(format!(
            "server rejected request ({}): {}",
            error.code, error.message
        )),
        code => CallError::Domain {
            code: Some(code),
            message: error.message,
            data: error.data,
        },
    }
}

pub struct RpcConnection {
    shared: Arc<Shared>,
    writer: Mutex<BoxedWriter>,
    ids: CorrelationIds,
    /// One permit when the server does not pipeline.
    in_flight: Option<Semaphore>,
    reader: JoinHandle<()>,
}

impl RpcConnection {
    /// Start serving a connection; spawns the reader task.
    pub fn new(
        handle: HandleId,
        reader: BoxedReader,
        writer: BoxedWriter,
        config: CodecConfig,
        sink: SharedSink,
    ) -> Self {
        let shared = Arc::new(Shared {
            handle,
            pending: StdMutex::new(PendingCalls::default()),
            liveness: watch::Sender::new(Liveness::default()),
            closed: watch::Sender::new(None),
            sink,
        });
        let reader = tokio::spawn(read_loop(reader, Arc::clone(&shared), config));
        Self {
            shared,
            writer: Mutex::new(writer),
            ids: CorrelationIds::new(),
            in_flight: (!config.pipelining).then(|| Semaphore::new(1)),
            reader,
        }
    }

    pub fn handle(&self) -> &HandleId {
        &self.shared.handle
    }

    /// Issue a request and wait for its response until `deadline`.
    pub async fn call(&self, method: &str, params: Value, deadline: Instant) -> CallResult<Value> {
        let started = Instant::now();
        match tokio::time::timeout_at(deadline, self.call_inner(method, params)).await {
            Ok(result) => result,
            Err(_) => Err(CallError::Timeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }

    async fn call_inner(&self, method: &str, params: Value) -> CallResult<Value> {
        let _permit = match &self.in_flight {
            Some(semaphore) => Some(semaphore.acquire().await.map_err(|_| {
                CallError::handle_unavailable(self.handle(), "connection shut down")
            })?),
            None => None,
        };

        let id = self.ids.next_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending();
            if let Some(reason) = &pending.closed {
                return Err(CallError::handle_unavailable(self.handle(), reason.to_string()));
            }
            pending.slots.insert(id, tx);
        }
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        let frame = codec::encode_request(id, method, &params)
            .map_err(|e| CallError::protocol(e.to_string()))?;
        self.write_frame(&frame).await?;
        tracing::trace!(handle = %self.handle(), id, method, "Request sent");

        rx.await.unwrap_or_else(|_| {
            Err(CallError::handle_unavailable(
                self.handle(),
                "connection dropped the call",
            ))
        })
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Value) -> CallResult<()> {
        let frame = codec::encode_notification(method, &params)
            .map_err(|e| CallError::protocol(e.to_string()))?;
        self.write_frame(&frame).await
    }

    async fn write_frame(&self, frame: &[u8]) -> CallResult<()> {
        let mut writer = self.writer.lock().await;
        let written = async {
            writer.write_all(frame).await?;
            writer.flush().await
        }
        .await;
        written.map_err(|e| {
            let reason = CloseReason::Io(e.to_string());
            self.shared.close(reason.clone());
            CallError::handle_unavailable(self.handle(), reason.to_string())
        })
    }

    /// Subscribe to liveness updates.
    pub fn liveness(&self) -> watch::Receiver<Liveness> {
        self.shared.liveness.subscribe()
    }

    pub fn last_signal(&self) -> Option<DateTime<Utc>> {
        self.shared.liveness.borrow().last_signal
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.borrow().is_some()
    }

    /// Resolves once the connection is closed, with the reason.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.shared.closed.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or(CloseReason::Shutdown),
            Err(_) => CloseReason::Shutdown,
        }
    }

    /// Pending calls awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.shared.pending().slots.len()
    }

    /// Stop reading and fail all pending calls.
    pub fn shutdown(&self) {
        self.reader.abort();
        self.shared.close(CloseReason::Shutdown);
        if let Some(semaphore) = &self.in_flight {
            semaphore.close();
        }
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl fmt::Debug for RpcConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcConnection")
            .field("handle", &self.shared.handle)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_loop(mut reader: BoxedReader, shared: Arc<Shared>, config: CodecConfig) {
    let mut decoder = FrameDecoder::new(&config);
    let mut buf = vec![0u8; 8 * 1024];

    let reason = 'read: loop {
        match reader.read(&mut buf).await {
            Ok(0) => break CloseReason::Eof,
            Ok(n) => decoder.extend(&buf[..n]),
            Err(e) => break CloseReason::Io(e.to_string()),
        }
        loop {
            match decoder.next_frame() {
                Ok(Some(body)) => shared.route(&body),
                Ok(None) => break,
                Err(e) if e.is_fatal() => break 'read CloseReason::Framing(e),
                Err(e) => shared.report(&e),
            }
        }
    };
    shared.close(reason);
}

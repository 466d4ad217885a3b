//! Request multiplexing over one backend transport.
//!
//! A single writer task serializes outgoing frames and a single reader task
//! demultiplexes incoming ones, so any number of callers can have requests
//! in flight on the same backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tether_types::LanguageId;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::codec::{FrameReader, FrameWriter};
use crate::error::LspError;
use crate::process::{BoxedReader, BoxedWriter};
use crate::protocol::{self, Notification, Request};

const WRITER_CHANNEL_CAPACITY: usize = 64;

/// Method name used to cancel in-flight requests.
pub const CANCEL_METHOD: &str = "$/cancelRequest";

/// Receives every notification the backend sends.
pub type NotificationSink = Arc<dyn Fn(&str, Option<&Value>) + Send + Sync>;

enum WriterCommand {
    Send(Value),
    Shutdown,
}

enum IncomingFrame {
    Response { id: u64, body: Value },
    ServerRequest { id: Value, method: String, params: Option<Value> },
    Notification { method: String, params: Option<Value> },
}

fn parse_incoming(frame: Value) -> Option<IncomingFrame> {
    let Value::Object(mut map) = frame else {
        return None;
    };
    let method = map
        .get("method")
        .and_then(Value::as_str)
        .map(String::from);
    let has_result_or_error = map.contains_key("result") || map.contains_key("error");

    match (map.get("id").cloned(), method, has_result_or_error) {
        (Some(id), None, true) => Some(IncomingFrame::Response {
            id: id.as_u64()?,
            body: Value::Object(map),
        }),
        (Some(id), Some(method), _) => Some(IncomingFrame::ServerRequest {
            id,
            method,
            params: map.remove("params"),
        }),
        (None, Some(method), _) => Some(IncomingFrame::Notification {
            method,
            params: map.remove("params"),
        }),
        _ => None,
    }
}

/// Reply for a request the backend sends to us.
///
/// Servers block on some of these, so every request gets an answer.
fn server_request_reply(id: Value, method: &str, params: Option<&Value>) -> Value {
    let result = match method {
        "workspace/configuration" => {
            let items = params
                .and_then(|p| p.get("items"))
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            Value::Array(vec![Value::Null; items])
        }
        "client/registerCapability"
        | "client/unregisterCapability"
        | "window/workDoneProgress/create"
        | "window/showMessageRequest" => Value::Null,
        _ => {
            return serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {
                    "code": -32601,
                    "message": format!("Method not found: {method}")
                }
            });
        }
    };
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// An in-flight call.
struct PendingRequest {
    method: String,
    issued_at: Instant,
    tx: oneshot::Sender<Result<Value, LspError>>,
}

type PendingTable = Arc<Mutex<HashMap<u64, PendingRequest>>>;

fn lock(pending: &Mutex<HashMap<u64, PendingRequest>>) -> MutexGuard<'_, HashMap<u64, PendingRequest>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

fn fail_all(pending: &Mutex<HashMap<u64, PendingRequest>>, language: &LanguageId) -> usize {
    let drained: Vec<_> = lock(pending).drain().collect();
    let count = drained.len();
    for (id, request) in drained {
        tracing::debug!(
            language = %language,
            id,
            method = %request.method,
            age = ?request.issued_at.elapsed(),
            "Failing pending request"
        );
        let _ = request.tx.send(Err(LspError::ChannelClosed {
            language: language.clone(),
        }));
    }
    count
}

fn cancel_frame(id: u64) -> Option<Value> {
    serde_json::to_value(Notification::new(
        CANCEL_METHOD,
        Some(protocol::cancel_params(id)),
    ))
    .ok()
}

/// Removes the pending entry and tells the backend to stop working on it
/// when a call ends without a response (timeout or dropped future).
struct CallGuard<'a> {
    id: u64,
    pending: &'a Mutex<HashMap<u64, PendingRequest>>,
    writer_tx: &'a mpsc::Sender<WriterCommand>,
    armed: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if lock(self.pending).remove(&self.id).is_some()
            && let Some(frame) = cancel_frame(self.id)
        {
            // Best effort; a full or closed writer just drops the cancel.
            let _ = self.writer_tx.try_send(WriterCommand::Send(frame));
        }
    }
}

/// Correlates requests and responses for one backend instance.
///
/// Correlation ids start at 1 for every instance.
pub struct Multiplexer {
    language: LanguageId,
    next_id: AtomicU64,
    pending: PendingTable,
    writer_tx: mpsc::Sender<WriterCommand>,
    closed_rx: watch::Receiver<bool>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

impl Multiplexer {
    pub fn start(
        language: LanguageId,
        reader: BoxedReader,
        writer: BoxedWriter,
        sink: NotificationSink,
    ) -> Self {
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let (closed_tx, closed_rx) = watch::channel(false);

        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let writer_language = language.clone();
        let writer_handle = tokio::spawn(async move {
            let mut writer = FrameWriter::new(writer);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = writer.write_frame(&frame).await {
                            tracing::warn!(language = %writer_language, "Backend write error: {e}");
                            break;
                        }
                    }
                    WriterCommand::Shutdown => {
                        writer.shutdown().await;
                        break;
                    }
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        let reader_writer_tx = writer_tx.clone();
        let reader_language = language.clone();
        let reader_handle = tokio::spawn(async move {
            let mut reader = FrameReader::new(reader);
            loop {
                match reader.read_frame().await {
                    Ok(Some(frame)) => {
                        dispatch_frame(frame, &reader_pending, &reader_writer_tx, &*sink, &reader_language)
                            .await;
                    }
                    Ok(None) => {
                        tracing::info!(language = %reader_language, "Backend closed its output");
                        break;
                    }
                    Err(e) if e.is_recoverable() => {
                        tracing::warn!(language = %reader_language, "Skipping malformed frame: {e}");
                    }
                    Err(e) => {
                        tracing::warn!(language = %reader_language, "Backend read error: {e}");
                        break;
                    }
                }
            }
            // Raise the signal before draining so a racing `call` either gets
            // drained or sees the flag.
            let _ = closed_tx.send(true);
            let failed = fail_all(&reader_pending, &reader_language);
            if failed > 0 {
                tracing::warn!(language = %reader_language, failed, "Failed pending requests on channel close");
            }
        });

        Self {
            language,
            next_id: AtomicU64::new(1),
            pending,
            writer_tx,
            closed_rx,
            reader_handle,
            writer_handle,
        }
    }

    fn channel_closed(&self) -> LspError {
        LspError::ChannelClosed {
            language: self.language.clone(),
        }
    }

    /// Issue a request and wait for its result.
    ///
    /// On timeout, or if the returned future is dropped, the pending entry is
    /// removed and `$/cancelRequest` is sent.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, LspError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_value(Request::new(id, method, params))
            .map_err(|e| LspError::protocol(method, format!("serializing request: {e}")))?;

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(
            id,
            PendingRequest {
                method: method.to_string(),
                issued_at: Instant::now(),
                tx,
            },
        );
        let mut guard = CallGuard {
            id,
            pending: &self.pending,
            writer_tx: &self.writer_tx,
            armed: true,
        };

        if *self.closed_rx.borrow() {
            guard.armed = false;
            lock(&self.pending).remove(&id);
            return Err(self.channel_closed());
        }

        if self.writer_tx.send(WriterCommand::Send(frame)).await.is_err() {
            guard.armed = false;
            lock(&self.pending).remove(&id);
            return Err(self.channel_closed());
        }

        let started = Instant::now();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => {
                guard.armed = false;
                protocol::response_result(method, outcome?)
            }
            Ok(Err(_)) => {
                guard.armed = false;
                Err(self.channel_closed())
            }
            Err(_) => {
                tracing::warn!(language = %self.language, id, method, "Backend request timed out");
                // The guard removes the entry and sends the cancel.
                Err(LspError::Timeout {
                    method: method.to_string(),
                    elapsed: started.elapsed(),
                })
            }
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), LspError> {
        let frame = serde_json::to_value(Notification::new(method, params))
            .map_err(|e| LspError::protocol(method, format!("serializing notification: {e}")))?;
        self.writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| self.channel_closed())
    }

    /// Cancel an in-flight request. Its caller sees [`LspError::Cancelled`].
    ///
    /// Returns `false` if `id` is not pending.
    pub async fn cancel(&self, id: u64) -> bool {
        let Some(request) = lock(&self.pending).remove(&id) else {
            return false;
        };
        let _ = request.tx.send(Err(LspError::Cancelled {
            id,
            method: request.method,
        }));
        if let Some(frame) = cancel_frame(id) {
            let _ = self.writer_tx.send(WriterCommand::Send(frame)).await;
        }
        true
    }

    /// Ids of requests still awaiting a response, oldest first.
    #[must_use]
    pub fn pending_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = lock(&self.pending).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Flips to `true` once the reader has stopped.
    #[must_use]
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Stop both tasks and fail everything still pending.
    pub async fn close(&self) {
        let _ = self.writer_tx.send(WriterCommand::Shutdown).await;
        self.reader_handle.abort();
        fail_all(&self.pending, &self.language);
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}

async fn dispatch_frame(
    frame: Value,
    pending: &Mutex<HashMap<u64, PendingRequest>>,
    writer_tx: &mpsc::Sender<WriterCommand>,
    sink: &(dyn Fn(&str, Option<&Value>) + Send + Sync),
    language: &LanguageId,
) {
    let Some(incoming) = parse_incoming(frame) else {
        tracing::trace!(language = %language, "Ignoring malformed JSON-RPC frame");
        return;
    };

    match incoming {
        IncomingFrame::Response { id, body } => {
            let request = lock(pending).remove(&id);
            match request {
                Some(request) => {
                    let _ = request.tx.send(Ok(body));
                }
                None => {
                    tracing::trace!(language = %language, id, "Response for unknown or cancelled request");
                }
            }
        }
        IncomingFrame::ServerRequest { id, method, params } => {
            tracing::debug!(language = %language, method = %method, "Backend sent request");
            let reply = server_request_reply(id, &method, params.as_ref());
            let _ = writer_tx.send(WriterCommand::Send(reply)).await;
        }
        IncomingFrame::Notification { method, params } => {
            sink(&method, params.as_ref());
        }
    }
}

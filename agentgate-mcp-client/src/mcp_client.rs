//! A minimal async client for stdio tool servers.
//!
//! The client is intentionally lightweight. It is only capable of:
//!   1. Spawning a subprocess that launches a conforming tool server that
//!      communicates over stdio.
//!   2. Sending JSON-RPC requests and pairing them with their corresponding
//!      responses.
//!   3. Offering convenience helpers for the `initialize` handshake,
//!      `tools/list` and `tools/call`.
//!
//! Framing details stay behind a typed API: callers issue requests through
//! the [`agentgate_protocol::McpRequest`] bindings and receive
//! strongly-typed results.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use agentgate_protocol::InitializeParams;
use agentgate_protocol::InitializeRequest;
use agentgate_protocol::InitializeResult;
use agentgate_protocol::InitializedNotification;
use agentgate_protocol::JSONRPC_VERSION;
use agentgate_protocol::JsonRpcMessage;
use agentgate_protocol::JsonRpcNotification;
use agentgate_protocol::JsonRpcRequest;
use agentgate_protocol::CallToolParams;
use agentgate_protocol::CallToolRequest;
use agentgate_protocol::CallToolResult;
use agentgate_protocol::ListToolsRequest;
use agentgate_protocol::ListToolsResult;
use agentgate_protocol::McpNotification;
use agentgate_protocol::McpRequest;
use agentgate_protocol::RequestId;
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncBufRead;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::warn;

/// Capacity of the bounded channel feeding the writer task. When it fills
/// up, `call` fails fast with [`TransportError::Backpressure`] instead of
/// blocking.
const CHANNEL_CAPACITY: usize = 256;

/// Frames larger than this are discarded up to the next newline instead of
/// being buffered.
const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// How long a terminated child gets between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Failure kinds surfaced by the transport. Higher layers translate these
/// into their own taxonomy; raw `io` errors never escape this crate.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn tool server: {0}")]
    Spawn(#[source] io::Error),
    #[error("initialize handshake failed: {0}")]
    Handshake(String),
    #[error("request timed out")]
    Timeout,
    #[error("outbound queue is full")]
    Backpressure,
    #[error("connection to tool server lost")]
    ConnectionLost,
    #[error("server returned JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("unexpected reply shape: {0}")]
    InvalidReply(String),
    #[error("session is not accepting requests")]
    Closed,
}

impl TransportError {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Spawn(_) => "spawn",
            TransportError::Handshake(_) => "handshake",
            TransportError::Timeout => "timeout",
            TransportError::Backpressure => "backpressure",
            TransportError::ConnectionLost | TransportError::Closed => "connection-lost",
            TransportError::Rpc { .. } => "protocol",
            TransportError::Encode(_) | TransportError::InvalidReply(_) => "transport",
        }
    }
}

/// Lifecycle of one session. Requests are only accepted while
/// `Initializing` (the handshake itself) or `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Initializing = 0,
    Ready = 1,
    Draining = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => SessionState::Initializing,
            1 => SessionState::Ready,
            2 => SessionState::Draining,
            _ => SessionState::Closed,
        }
    }
}

type PendingSender = oneshot::Sender<Result<Value, TransportError>>;
type PendingMap = Arc<Mutex<HashMap<i64, PendingSender>>>;

/// A running tool-server session.
pub struct McpClient {
    server_name: String,

    /// Retained until the client is dropped; `kill_on_drop` makes the
    /// runtime reap the process on a best-effort basis.
    child: Mutex<Child>,

    /// Channel for sending pre-encoded frames to the background writer task.
    outgoing_tx: mpsc::Sender<String>,

    /// Map of `request.id -> oneshot::Sender` used to dispatch replies back
    /// to the originating caller.
    pending: PendingMap,

    /// Monotonically increasing counter used to generate request ids.
    id_counter: AtomicI64,

    state: Arc<AtomicU8>,

    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl McpClient {
    /// Spawn the given command and start the reader/writer tasks over its
    /// stdio. The caller is responsible for driving the `initialize`
    /// handshake next; see [`initialize`](Self::initialize).
    pub async fn new_stdio_client(
        server_name: &str,
        program: OsString,
        args: Vec<OsString>,
        env: Option<HashMap<String, String>>,
        notifications: Option<mpsc::UnboundedSender<JsonRpcNotification>>,
    ) -> Result<Self, TransportError> {
        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .envs(create_env_for_server(env))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(TransportError::Spawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Spawn(io::Error::other("failed to capture child stdin")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Spawn(io::Error::other("failed to capture child stdout")))?;

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let state = Arc::new(AtomicU8::new(SessionState::Initializing as u8));

        // Writer task: single producer to the child's stdin, FIFO over the
        // bounded channel. A broken pipe closes the whole session.
        let writer_task = {
            let pending = Arc::clone(&pending);
            let state = Arc::clone(&state);
            let server_name = server_name.to_string();
            let mut stdin = stdin;
            tokio::spawn(async move {
                while let Some(frame) = outgoing_rx.recv().await {
                    debug!(server = %server_name, "-> {frame}");
                    if let Err(err) = write_frame(&mut stdin, &frame).await {
                        error!(server = %server_name, "failed to write to tool server stdin: {err}");
                        state.store(SessionState::Closed as u8, Ordering::SeqCst);
                        fail_all_pending(&pending).await;
                        break;
                    }
                }
            })
        };

        // Reader task: newline-delimited frames from the child's stdout,
        // dispatched to the pending map by id. EOF means the child is gone
        // and every in-flight request fails with `ConnectionLost`.
        let reader_task = {
            let pending = Arc::clone(&pending);
            let state = Arc::clone(&state);
            let server_name = server_name.to_string();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout);
                loop {
                    match next_frame(&mut reader, MAX_FRAME_BYTES).await {
                        Ok(Some(RawFrame::Complete(bytes))) => {
                            dispatch_frame(&bytes, &server_name, &pending, notifications.as_ref())
                                .await;
                        }
                        Ok(Some(RawFrame::Oversized)) => {
                            warn!(
                                server = %server_name,
                                "dropping frame larger than {MAX_FRAME_BYTES} bytes"
                            );
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!(server = %server_name, "read error on tool server stdout: {err}");
                            break;
                        }
                    }
                }
                state.store(SessionState::Closed as u8, Ordering::SeqCst);
                fail_all_pending(&pending).await;
            })
        };

        Ok(Self {
            server_name: server_name.to_string(),
            child: Mutex::new(child),
            outgoing_tx,
            pending,
            id_counter: AtomicI64::new(1),
            state,
            reader_task: Mutex::new(Some(reader_task)),
            writer_task: Mutex::new(Some(writer_task)),
        })
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Number of requests written but not yet answered or timed out.
    pub async fn in_flight(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Send an arbitrary request and await the typed result.
    ///
    /// With `timeout = None` the call waits indefinitely. On timeout the
    /// pending entry is removed so a late reply is logged and discarded by
    /// the reader task instead of leaking.
    pub async fn send_request<R>(
        &self,
        params: R::Params,
        timeout: Option<Duration>,
    ) -> Result<R::Result, TransportError>
    where
        R: McpRequest,
    {
        if self.state.load(Ordering::SeqCst) >= SessionState::Draining as u8 {
            return Err(TransportError::Closed);
        }

        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);

        // For many request types `Params` is an `Option<T>` and `None`
        // should be encoded as absence of the field.
        let params_json = serde_json::to_value(&params).map_err(TransportError::Encode)?;
        let params_field = if params_json.is_null() {
            None
        } else {
            Some(params_json)
        };

        let request = JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: RequestId::Integer(id),
            method: R::METHOD.to_string(),
            params: params_field,
        };
        let frame = serde_json::to_string(&JsonRpcMessage::Request(request))
            .map_err(TransportError::Encode)?;

        // Register before queueing the frame so a reply racing the send
        // cannot be lost.
        let (tx, rx) = oneshot::channel();
        {
            self.pending.lock().await.insert(id, tx);
        }

        if let Err(err) = self.outgoing_tx.try_send(frame) {
            self.pending.lock().await.remove(&id);
            return Err(match err {
                TrySendError::Full(_) => TransportError::Backpressure,
                TrySendError::Closed(_) => TransportError::ConnectionLost,
            });
        }

        let reply = match timeout {
            Some(duration) => match tokio::time::timeout(duration, rx).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(_)) => {
                    self.pending.lock().await.remove(&id);
                    return Err(TransportError::ConnectionLost);
                }
                Err(_) => {
                    self.pending.lock().await.remove(&id);
                    debug!(
                        server = %self.server_name,
                        id,
                        "request timed out; a late reply will be discarded"
                    );
                    return Err(TransportError::Timeout);
                }
            },
            None => rx.await.map_err(|_| TransportError::ConnectionLost)?,
        };

        let value = reply?;
        serde_json::from_value(value).map_err(|err| TransportError::InvalidReply(err.to_string()))
    }

    pub async fn send_notification<N>(&self, params: N::Params) -> Result<(), TransportError>
    where
        N: McpNotification,
    {
        let params_json = serde_json::to_value(&params).map_err(TransportError::Encode)?;
        let params_field = if params_json.is_null() {
            None
        } else {
            Some(params_json)
        };
        let notification = JsonRpcNotification {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: N::METHOD.to_string(),
            params: params_field,
        };
        let frame = serde_json::to_string(&JsonRpcMessage::Notification(notification))
            .map_err(TransportError::Encode)?;
        self.outgoing_tx.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) => TransportError::Backpressure,
            TrySendError::Closed(_) => TransportError::ConnectionLost,
        })
    }

    /// Negotiate the session: send `initialize`, then the
    /// `notifications/initialized` notification once the reply has arrived,
    /// and mark the session ready.
    pub async fn initialize(
        &self,
        params: InitializeParams,
        timeout: Option<Duration>,
    ) -> Result<InitializeResult, TransportError> {
        let result = self
            .send_request::<InitializeRequest>(params, timeout)
            .await
            .map_err(|err| match err {
                TransportError::Timeout => TransportError::Timeout,
                TransportError::Rpc { code, message } => TransportError::Handshake(format!(
                    "initialize rejected ({code}): {message}"
                )),
                other => TransportError::Handshake(other.to_string()),
            })?;
        self.send_notification::<InitializedNotification>(None)
            .await?;
        self.state
            .store(SessionState::Ready as u8, Ordering::SeqCst);
        Ok(result)
    }

    /// Convenience wrapper around `tools/list`.
    pub async fn list_tools(
        &self,
        timeout: Option<Duration>,
    ) -> Result<ListToolsResult, TransportError> {
        self.send_request::<ListToolsRequest>(None, timeout).await
    }

    /// Convenience wrapper around `tools/call`.
    pub async fn call_tool(
        &self,
        name: String,
        arguments: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<CallToolResult, TransportError> {
        let params = CallToolParams { name, arguments };
        self.send_request::<CallToolRequest>(params, timeout).await
    }

    /// Drain in-flight requests for up to `grace`, then terminate the child
    /// (SIGTERM, escalating to SIGKILL after [`KILL_GRACE`]) and join the IO
    /// tasks. New requests are rejected as soon as this is called.
    pub async fn disconnect(&self, grace: Duration) -> Result<(), TransportError> {
        let previous = self
            .state
            .swap(SessionState::Draining as u8, Ordering::SeqCst);
        if previous == SessionState::Closed as u8 {
            self.state
                .store(SessionState::Closed as u8, Ordering::SeqCst);
            return Ok(());
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.pending.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
        fail_all_pending(&self.pending).await;

        {
            let mut child = self.child.lock().await;
            #[cfg(unix)]
            terminate(&child);
            #[cfg(not(unix))]
            let _ = child.start_kill();

            if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
                warn!(server = %self.server_name, "tool server ignored SIGTERM; killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }

        if let Some(handle) = self.reader_task.lock().await.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.writer_task.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }

        self.state
            .store(SessionState::Closed as u8, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        // `kill_on_drop(true)` already tags the process; this extra check
        // reaps it immediately if it has already exited instead of waiting
        // for the runtime to do so later.
        if let Ok(mut child) = self.child.try_lock() {
            let _ = child.try_wait();
        }
    }
}

#[cfg(unix)]
fn terminate(child: &Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

async fn write_frame(stdin: &mut ChildStdin, frame: &str) -> io::Result<()> {
    stdin.write_all(frame.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    Ok(())
}

async fn fail_all_pending(pending: &PendingMap) {
    let senders: Vec<PendingSender> = {
        let mut guard = pending.lock().await;
        guard.drain().map(|(_, tx)| tx).collect()
    };
    for tx in senders {
        let _ = tx.send(Err(TransportError::ConnectionLost));
    }
}

enum RawFrame {
    Complete(Vec<u8>),
    Oversized,
}

/// Read one newline-delimited frame without ever buffering more than
/// `max_bytes` of a single line. An over-long line is discarded up to its
/// terminating newline and reported as [`RawFrame::Oversized`]; the stream
/// stays usable afterwards.
async fn next_frame<R>(reader: &mut R, max_bytes: usize) -> io::Result<Option<RawFrame>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::new();
    let mut discarding = false;
    loop {
        let (consumed, frame_complete) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                // EOF. A trailing partial line is handed to the parser.
                if buf.is_empty() || discarding {
                    return Ok(None);
                }
                return Ok(Some(RawFrame::Complete(buf)));
            }
            match available.iter().position(|byte| *byte == b'\n') {
                Some(pos) => {
                    if !discarding && buf.len() + pos > max_bytes {
                        buf.clear();
                        discarding = true;
                    }
                    if !discarding {
                        buf.extend_from_slice(&available[..pos]);
                    }
                    (pos + 1, true)
                }
                None => {
                    if !discarding {
                        if buf.len() + available.len() > max_bytes {
                            buf.clear();
                            discarding = true;
                        } else {
                            buf.extend_from_slice(available);
                        }
                    }
                    (available.len(), false)
                }
            }
        };
        reader.consume(consumed);
        if frame_complete {
            return Ok(Some(if discarding {
                RawFrame::Oversized
            } else {
                RawFrame::Complete(buf)
            }));
        }
    }
}

async fn dispatch_frame(
    bytes: &[u8],
    server_name: &str,
    pending: &PendingMap,
    notifications: Option<&mpsc::UnboundedSender<JsonRpcNotification>>,
) {
    let message: JsonRpcMessage = match serde_json::from_slice(bytes) {
        Ok(message) => message,
        Err(err) => {
            warn!(server = %server_name, "ignoring malformed frame: {err}");
            return;
        }
    };
    match message {
        JsonRpcMessage::Response(response) => {
            deliver(pending, server_name, &response.id, Ok(response.result)).await;
        }
        JsonRpcMessage::Error(failure) => {
            let outcome = Err(TransportError::Rpc {
                code: failure.error.code,
                message: failure.error.message,
            });
            deliver(pending, server_name, &failure.id, outcome).await;
        }
        JsonRpcMessage::Notification(notification) => match notifications {
            Some(tx) => {
                let _ = tx.send(notification);
            }
            None => {
                debug!(
                    server = %server_name,
                    method = %notification.method,
                    "ignoring server notification"
                );
            }
        },
        JsonRpcMessage::Request(request) => {
            // Server-initiated requests are outside the consumed surface;
            // they must not crash the session.
            warn!(
                server = %server_name,
                method = %request.method,
                "ignoring server-initiated request"
            );
        }
    }
}

async fn deliver(
    pending: &PendingMap,
    server_name: &str,
    id: &RequestId,
    outcome: Result<Value, TransportError>,
) {
    let RequestId::Integer(id) = id else {
        warn!(server = %server_name, "reply with non-integer id has no pending request");
        return;
    };
    let sender = { pending.lock().await.remove(id) };
    match sender {
        Some(tx) => {
            let _ = tx.send(outcome);
        }
        None => {
            warn!(server = %server_name, id = *id, "dropping late or unknown reply");
        }
    }
}

/// Environment variables that are always forwarded when spawning a tool
/// server. Tool servers inherit only this curated subset plus whatever the
/// configuration adds explicitly.
#[cfg(unix)]
const DEFAULT_ENV_VARS: &[&str] = &[
    "HOME", "LANG", "LC_ALL", "LOGNAME", "PATH", "SHELL", "TERM", "TMPDIR", "TZ", "USER",
];

#[cfg(windows)]
const DEFAULT_ENV_VARS: &[&str] = &[
    "PATH",
    "PATHEXT",
    "TEMP",
    "TMP",
    "USERDOMAIN",
    "USERNAME",
    "USERPROFILE",
];

fn create_env_for_server(
    extra_env: Option<HashMap<String, String>>,
) -> HashMap<String, String> {
    DEFAULT_ENV_VARS
        .iter()
        .filter_map(|var| match std::env::var(var) {
            Ok(value) => Some((var.to_string(), value)),
            Err(_) => None,
        })
        .chain(extra_env.unwrap_or_default())
        .collect::<HashMap<_, _>>()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn create_env_for_server_merges_extra_env() {
        let var = "PATH";
        let existing = std::env::var(var).unwrap_or_default();
        let replacement = format!("{existing}-extra");
        let extra = HashMap::from([(var.to_string(), replacement.clone())]);
        let env = create_env_for_server(Some(extra));
        assert_eq!(env.get(var), Some(&replacement));
    }

    #[tokio::test]
    async fn next_frame_splits_on_newlines() {
        let data: &[u8] = b"{\"a\":1}\n{\"b\":2}\n";
        let mut reader = BufReader::new(data);

        match next_frame(&mut reader, 1024).await.unwrap() {
            Some(RawFrame::Complete(bytes)) => assert_eq!(bytes, b"{\"a\":1}"),
            _ => panic!("expected complete frame"),
        }
        match next_frame(&mut reader, 1024).await.unwrap() {
            Some(RawFrame::Complete(bytes)) => assert_eq!(bytes, b"{\"b\":2}"),
            _ => panic!("expected complete frame"),
        }
        assert!(next_frame(&mut reader, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn next_frame_discards_oversized_lines_and_recovers() {
        let mut data = vec![b'x'; 64];
        data.push(b'\n');
        data.extend_from_slice(b"{\"ok\":true}\n");
        let mut reader = BufReader::new(&data[..]);

        match next_frame(&mut reader, 16).await.unwrap() {
            Some(RawFrame::Oversized) => {}
            _ => panic!("expected oversized frame"),
        }
        match next_frame(&mut reader, 16).await.unwrap() {
            Some(RawFrame::Complete(bytes)) => assert_eq!(bytes, b"{\"ok\":true}"),
            _ => panic!("expected complete frame"),
        }
    }

    #[tokio::test]
    async fn next_frame_returns_trailing_partial_line_at_eof() {
        let data: &[u8] = b"{\"partial\":true}";
        let mut reader = BufReader::new(data);
        match next_frame(&mut reader, 1024).await.unwrap() {
            Some(RawFrame::Complete(bytes)) => assert_eq!(bytes, b"{\"partial\":true}"),
            _ => panic!("expected complete frame"),
        }
        assert!(next_frame(&mut reader, 1024).await.unwrap().is_none());
    }
}

//! In-memory capability servers for tests.
//!
//! [`FakeServer`] speaks the framed protocol over a `tokio::io::duplex`
//! stream and answers `tools/call` through a handler closure. [`FakeLauncher`]
//! plugs it into the supervisor and can simulate crashes and failed launches
//! without spawning processes.

use crate::codec::{
    self, CodecConfig, FrameDecoder, HEARTBEAT, Incoming, READY, RpcErrorObject, TOOLS_CALL,
    error_codes,
};
use crate::error::{SupervisorError, SupervisorResult};
use crate::launcher::{LaunchedProcess, Launcher};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio::task::JoinSet;

/// How the fake server answers one call.
#[derive(Debug, Clone, PartialEq)]
pub enum FakeReply {
    Result(Value),
    Error { code: i64, message: String },
    /// Close the stream as if the process died.
    Crash,
    /// Write raw bytes instead of a well-formed response.
    Raw(Vec<u8>),
    /// Never answer.
    Silent,
}

type Handler = dyn Fn(&str, &Value) -> (Duration, FakeReply) + Send + Sync;

#[derive(Clone)]
pub struct FakeServer {
    handler: Arc<Handler>,
    send_ready: bool,
    heartbeat: Option<Duration>,
    lifetime: Option<Duration>,
}

impl FakeServer {
    /// `handler(tool, arguments)` returns a delay and the reply to send
    /// after it. Calls are served concurrently, so replies can overtake
    /// each other.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str, &Value) -> (Duration, FakeReply) + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            send_ready: true,
            heartbeat: None,
            lifetime: None,
        }
    }

    /// Immediately returns the call's arguments.
    pub fn echo() -> Self {
        Self::new(|_, args| (Duration::ZERO, FakeReply::Result(args.clone())))
    }

    /// Send a heartbeat notification every `period`.
    pub fn with_heartbeat(mut self, period: Duration) -> Self {
        self.heartbeat = Some(period);
        self
    }

    /// Hang up `lifetime` after starting, as if the process died.
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    /// Never announce readiness.
    pub fn without_ready(mut self) -> Self {
        self.send_ready = false;
        self
    }

    /// Serve on `stream` until the peer hangs up, a reply crashes the
    /// server, or `kill` fires.
    pub async fn serve(self, stream: DuplexStream, mut kill: oneshot::Receiver<()>) {
        let (mut reader, writer) = tokio::io::split(stream);
        let writer = Arc::new(AsyncMutex::new(writer));

        if self.send_ready {
            if let Ok(frame) = codec::encode_notification(READY, &Value::Null) {
                if write(&writer, &frame).await.is_err() {
                    return;
                }
            }
        }

        // Tasks resolve to `true` when the server should crash.
        let mut tasks = JoinSet::new();
        if let Some(period) = self.heartbeat {
            let writer = Arc::clone(&writer);
            tasks.spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    let Ok(frame) = codec::encode_notification(HEARTBEAT, &Value::Null) else {
                        return false;
                    };
                    if write(&writer, &frame).await.is_err() {
                        return false;
                    }
                }
            });
        }

        if let Some(lifetime) = self.lifetime {
            tasks.spawn(async move {
                tokio::time::sleep(lifetime).await;
                true
            });
        }

        let mut decoder = FrameDecoder::new(&CodecConfig::default());
        let mut buf = vec![0u8; 4096];
        loop {
            tokio::select! {
                _ = &mut kill => break,
                Some(Ok(true)) = tasks.join_next() => break,
                read = reader.read(&mut buf) => {
                    let n = match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    decoder.extend(&buf[..n]);
                    loop {
                        match decoder.next_frame() {
                            Ok(Some(body)) => {
                                if let Ok(Incoming::Request { id, method, params }) =
                                    codec::decode_message(&body)
                                {
                                    tasks.spawn(self.answer(id, method, params, Arc::clone(&writer)));
                                }
                            }
                            Ok(None) => break,
                            Err(e) if e.is_fatal() => return,
                            Err(_) => continue,
                        }
                    }
                }
            }
        }
        // Dropping the tasks and both halves closes the stream.
        tasks.abort_all();
    }

    fn answer(
        &self,
        id: u64,
        method: String,
        params: Value,
        writer: Arc<AsyncMutex<WriteHalf<DuplexStream>>>,
    ) -> impl std::future::Future<Output = bool> + Send + 'static {
        let (delay, reply) = if method == TOOLS_CALL {
            let tool = params.get("name").and_then(Value::as_str).unwrap_or_default();
            let args = params.get("arguments").cloned().unwrap_or(Value::Null);
            (self.handler)(tool, &args)
        } else {
            (
                Duration::ZERO,
                FakeReply::Error {
                    code: error_codes::METHOD_NOT_FOUND,
                    message: format!("method not found: {method}"),
                },
            )
        };

        async move {
            tokio::time::sleep(delay).await;
            let frame = match reply {
                FakeReply::Crash => return true,
                FakeReply::Silent => return false,
                FakeReply::Raw(bytes) => bytes,
                FakeReply::Result(value) => match codec::encode_response(id, &Ok(value)) {
                    Ok(frame) => frame,
                    Err(_) => return false,
                },
                FakeReply::Error { code, message } => {
                    match codec::encode_response(id, &Err(RpcErrorObject::new(code, message))) {
                        Ok(frame) => frame,
                        Err(_) => return false,
                    }
                }
            };
            let _ = write(&writer, &frame).await;
            false
        }
    }
}

async fn write(
    writer: &AsyncMutex<WriteHalf<DuplexStream>>,
    frame: &[u8],
) -> std::io::Result<()> {
    let mut writer = writer.lock().await;
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Launcher backed by [`FakeServer`].
pub struct FakeLauncher {
    server: FakeServer,
    launches: AtomicU32,
    failing_launches: AtomicU32,
    kill: Mutex<Option<oneshot::Sender<()>>>,
}

impl FakeLauncher {
    pub fn new(server: FakeServer) -> Self {
        Self {
            server,
            launches: AtomicU32::new(0),
            failing_launches: AtomicU32::new(0),
            kill: Mutex::new(None),
        }
    }

    /// Successful and failed launch attempts so far.
    pub fn launches(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }

    /// Make the next `n` launches fail.
    pub fn fail_next(&self, n: u32) {
        self.failing_launches.store(n, Ordering::SeqCst);
    }

    /// Kill the running server. Returns false if none is running.
    pub fn crash(&self) -> bool {
        let kill = self.kill.lock().unwrap_or_else(PoisonError::into_inner).take();
        kill.is_some_and(|tx| tx.send(()).is_ok())
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self) -> SupervisorResult<LaunchedProcess> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_launches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(SupervisorError::Launch("simulated launch failure".to_string()));
        }

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (kill_tx, kill_rx) = oneshot::channel();
        *self.kill.lock().unwrap_or_else(PoisonError::into_inner) = Some(kill_tx);
        tokio::spawn(self.server.clone().serve(server, kill_rx));
        Ok(LaunchedProcess::from_stream(client))
    }

    fn describe(&self) -> String {
        "fake capability server".to_string()
    }
}

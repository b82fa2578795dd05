/// Child Process Supervisor
///
/// **Core Responsibility:**
/// Spawn worker processes, wire their stdio to a [`MessageChannel`], route
/// unsolicited messages to a [`MessageHandler`], and tear workers down.
///
/// The same dispatch loop ([`serve`]) runs on both ends: the parent uses it
/// to absorb worker logs, the worker uses it to run requests.
use futures_util::FutureExt;
use nanotest_common::protocol::{
    CorrelationId, Failure, LogLevel, LogRecord, Message, MessageBody,
};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::channel::{ChannelConfig, ChannelError, InboundMessages, MessageChannel};

/// Upper bound for the worker to answer our `Hello`
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("worker {0} pipe was not captured")]
    MissingPipe(&'static str),

    #[error("worker did not complete the handshake within {0:?}")]
    HandshakeTimeout(Duration),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handler for messages nobody is waiting on: requests on the worker side,
/// logs and stray signals on the parent side.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(
        self: Arc<Self>,
        message: Message,
        responder: Responder,
        cancel: CancellationToken,
    ) -> impl Future<Output = ()> + Send;
}

/// Reply handle for one inbound message
#[derive(Clone)]
pub struct Responder {
    channel: MessageChannel,
    id: CorrelationId,
    finished: Arc<AtomicBool>,
}

impl Responder {
    fn new(channel: MessageChannel, id: CorrelationId) -> Self {
        Self {
            channel,
            id,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn channel(&self) -> &MessageChannel {
        &self.channel
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Non-terminal notification for this request
    pub async fn progress(&self, body: MessageBody) -> Result<(), ChannelError> {
        self.channel.send(Message::new(self.id, body)).await
    }

    /// Terminal reply. Only the first call is sent.
    pub async fn finish(&self, body: MessageBody) -> Result<(), ChannelError> {
        if self.finished.swap(true, Ordering::AcqRel) {
            debug!(id = self.id, kind = body.kind(), "request already finished; dropping reply");
            return Ok(());
        }
        self.channel.send(Message::new(self.id, body)).await
    }

    /// Log line forwarded to the peer
    pub async fn log(&self, level: LogLevel, message: impl Into<String>) {
        let record = MessageBody::Log(LogRecord::new(level, message));
        if let Err(e) = self.channel.send(Message::unsolicited(record)).await {
            debug!(error = %e, "log not delivered");
        }
    }
}

/// Dispatch loop.
///
/// Every message is handled in its own task with its own cancellation token:
/// `Cancel` cancels the token of the request with that id, `Shutdown` (or
/// `shutdown` firing) cancels all of them and stops the loop. Requests that
/// end without a terminal reply (including by panic) are answered with
/// `Failure`. Returns once in-flight handlers have drained.
pub async fn serve<H: MessageHandler>(
    channel: MessageChannel,
    mut inbound: InboundMessages,
    handler: Arc<H>,
    shutdown: CancellationToken,
) {
    let active: Arc<Mutex<HashMap<CorrelationId, CancellationToken>>> = Arc::default();
    let mut tasks = JoinSet::new();

    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(_) = tasks.join_next(), if !tasks.is_empty() => continue,
            message = inbound.recv() => message,
        };
        let Some(message) = message else {
            debug!("channel closed; dispatch loop stopping");
            break;
        };

        match &message.body {
            MessageBody::Cancel => {
                match active.lock().get(&message.id) {
                    Some(token) => token.cancel(),
                    None => debug!(id = message.id, "cancel for an unknown request"),
                }
                continue;
            }
            MessageBody::Shutdown => {
                info!("shutdown requested");
                break;
            }
            MessageBody::Hello(hello) => {
                debug!(peer_session = %hello.session, "duplicate hello ignored");
                continue;
            }
            _ => {}
        }

        let id = message.id;
        let is_request = message.body.is_request();
        let token = shutdown.child_token();
        if is_request {
            active.lock().insert(id, token.clone());
        }
        let responder = Responder::new(channel.clone(), id);
        let handler = handler.clone();
        let active = active.clone();

        tasks.spawn(async move {
            let kind = message.body.kind();
            let result = AssertUnwindSafe(handler.handle(message, responder.clone(), token))
                .catch_unwind()
                .await;
            active.lock().remove(&id);

            if !is_request || responder.is_finished() {
                return;
            }
            let reason = match result {
                Ok(()) => format!("{} handler returned without a reply", kind),
                Err(payload) => {
                    let reason = format!("{} handler panicked: {}", kind, panic_message(payload.as_ref()));
                    error!(id, %reason, "handler panicked");
                    reason
                }
            };
            let _ = responder.finish(MessageBody::Failure(Failure::new(reason))).await;
        });
    }

    shutdown.cancel();
    while tasks.join_next().await.is_some() {}
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Parent-side handler: worker logs become parent log events
pub struct LogForwarder {
    label: String,
}

impl LogForwarder {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into() }
    }
}

impl MessageHandler for LogForwarder {
    fn handle(
        self: Arc<Self>,
        message: Message,
        _responder: Responder,
        _cancel: CancellationToken,
    ) -> impl Future<Output = ()> + Send {
        async move {
            let worker = self.label.as_str();
            match message.body {
                MessageBody::Log(record) => match record.level {
                    LogLevel::Debug => debug!(worker, "{}", record.message),
                    LogLevel::Info => info!(worker, "{}", record.message),
                    LogLevel::Warn => warn!(worker, "{}", record.message),
                    LogLevel::Error => error!(worker, "{}", record.message),
                },
                other => debug!(worker, kind = other.kind(), "unexpected unsolicited message"),
            }
        }
    }
}

/// How to start a worker process
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub env: Vec<(String, String)>,
    /// Ask the worker to wait for a debugger before processing
    pub debug: bool,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            env: Vec::new(),
            debug: false,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Positional arguments: input stream, output stream, session, optional `debug`
    pub fn args(&self, session: &str) -> Vec<String> {
        let mut args = vec!["stdin".to_string(), "stdout".to_string(), session.to_string()];
        if self.debug {
            args.push("debug".to_string());
        }
        args
    }
}

/// A running worker process and its channel
pub struct ChildHandle {
    session: String,
    channel: MessageChannel,
    child: Child,
    dispatch: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
}

/// Log the worker's stderr line by line until it closes. Bytes that are not
/// UTF-8 are replaced, never fatal. Returns the number of lines forwarded.
async fn forward_stderr<R: AsyncRead + Unpin>(stderr: R, session: &str) -> usize {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    let mut forwarded = 0;
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                info!(target: "nanotest::worker", session = %session, "{}", text.trim_end());
                forwarded += 1;
            }
            Err(e) => {
                debug!(session, error = %e, "worker stderr unreadable");
                break;
            }
        }
    }
    forwarded
}

/// Spawn a worker, complete the handshake and start the parent-side dispatch loop
#[instrument(skip(command, handler, config), fields(program = %command.program.display()))]
pub async fn start<H: MessageHandler>(
    command: &WorkerCommand,
    session: &str,
    handler: Arc<H>,
    config: ChannelConfig,
) -> Result<ChildHandle, SupervisorError> {
    let mut child = Command::new(&command.program)
        .args(command.args(session))
        .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| SupervisorError::Spawn {
            program: command.program.clone(),
            source,
        })?;

    let stdin = child.stdin.take().ok_or(SupervisorError::MissingPipe("stdin"))?;
    let stdout = child.stdout.take().ok_or(SupervisorError::MissingPipe("stdout"))?;
    if let Some(stderr) = child.stderr.take() {
        let session = session.to_string();
        tokio::spawn(async move {
            forward_stderr(stderr, &session).await;
        });
    }

    let (channel, mut inbound) = MessageChannel::new(stdout, stdin, config);
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, channel.handshake(&mut inbound, session)).await {
        Ok(Ok(peer)) => debug!(peer_session = %peer.session, "worker connected"),
        Ok(Err(e)) => {
            let _ = child.kill().await;
            return Err(e.into());
        }
        Err(_) => {
            let _ = child.kill().await;
            return Err(SupervisorError::HandshakeTimeout(HANDSHAKE_TIMEOUT));
        }
    }

    let shutdown = CancellationToken::new();
    let dispatch = tokio::spawn(serve(
        channel.clone(),
        inbound,
        handler,
        shutdown.clone(),
    ));

    info!(session, pid = ?child.id(), "worker started");
    Ok(ChildHandle {
        session: session.to_string(),
        channel,
        child,
        dispatch: Some(dispatch),
        shutdown,
    })
}

impl ChildHandle {
    pub fn channel(&self) -> &MessageChannel {
        &self.channel
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Wait for the worker to exit on its own and for its messages to drain
    pub async fn wait_until_processing_is_completed(&mut self) -> Result<ExitStatus, SupervisorError> {
        let status = self.child.wait().await?;
        self.channel.closed().await;
        if let Some(dispatch) = self.dispatch.take() {
            let _ = dispatch.await;
        }
        Ok(status)
    }

    /// Ask the worker to stop, then force it after `grace`
    pub async fn shutdown(mut self, grace: Duration) -> Option<ExitStatus> {
        let _ = self.channel.send(Message::unsolicited(MessageBody::Shutdown)).await;
        self.channel.close().await;

        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!(session = %self.session, error = %e, "failed to wait for worker");
                None
            }
            Err(_) => {
                warn!(session = %self.session, "worker ignored shutdown; killing");
                let _ = self.child.kill().await;
                None
            }
        };

        self.shutdown.cancel();
        if let Some(dispatch) = self.dispatch.take() {
            let _ = dispatch.await;
        }
        debug!(session = %self.session, ?status, "worker stopped");
        status
    }
}

/// Connected worker, whatever backs it
pub struct Worker {
    label: String,
    channel: MessageChannel,
    backend: WorkerBackend,
}

enum WorkerBackend {
    Process(ChildHandle),
    InProcess {
        worker_loop: JoinHandle<()>,
        parent_loop: JoinHandle<()>,
        shutdown: CancellationToken,
    },
}

impl Worker {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn channel(&self) -> &MessageChannel {
        &self.channel
    }

    /// Stop the worker, waiting at most the channel's cancel grace
    pub async fn shutdown(self) {
        let grace = self.channel.config().cancel_grace;
        match self.backend {
            WorkerBackend::Process(child) => {
                child.shutdown(grace).await;
            }
            WorkerBackend::InProcess {
                mut worker_loop,
                parent_loop,
                shutdown,
            } => {
                let _ = self.channel.send(Message::unsolicited(MessageBody::Shutdown)).await;
                if tokio::time::timeout(grace, &mut worker_loop).await.is_err() {
                    warn!(worker = %self.label, "in-process worker ignored shutdown");
                    shutdown.cancel();
                    let _ = worker_loop.await;
                }
                self.channel.close().await;
                let _ = parent_loop.await;
            }
        }
    }
}

/// Source of connected workers
pub trait WorkerLauncher: Send + Sync + 'static {
    fn launch(&self, label: &str) -> impl Future<Output = Result<Worker, SupervisorError>> + Send;
}

/// Launches the worker binary as a child process
pub struct ProcessLauncher {
    command: WorkerCommand,
    config: ChannelConfig,
}

impl ProcessLauncher {
    pub fn new(command: WorkerCommand, config: ChannelConfig) -> Self {
        Self { command, config }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, label: &str) -> impl Future<Output = Result<Worker, SupervisorError>> + Send {
        let label = label.to_string();
        async move {
            let session = format!("{}-{}", label, uuid::Uuid::new_v4().simple());
            let handler = Arc::new(LogForwarder::new(label.clone()));
            let child = start(&self.command, &session, handler, self.config).await?;
            Ok(Worker {
                label,
                channel: child.channel().clone(),
                backend: WorkerBackend::Process(child),
            })
        }
    }
}

/// Runs the worker handler in this process over an in-memory stream.
/// Same protocol, no process isolation.
pub struct InProcessLauncher<H> {
    handler: Arc<H>,
    config: ChannelConfig,
}

impl<H: MessageHandler> InProcessLauncher<H> {
    pub fn new(handler: Arc<H>, config: ChannelConfig) -> Self {
        Self { handler, config }
    }
}

impl<H: MessageHandler> WorkerLauncher for InProcessLauncher<H> {
    fn launch(&self, label: &str) -> impl Future<Output = Result<Worker, SupervisorError>> + Send {
        let label = label.to_string();
        let handler = self.handler.clone();
        let config = self.config;
        async move {
            let session = format!("{}-{}", label, uuid::Uuid::new_v4().simple());
            let ((parent, mut parent_inbound), (child, mut child_inbound)) = MessageChannel::pair(config);
            let (parent_hello, child_hello) = tokio::join!(
                parent.handshake(&mut parent_inbound, "parent"),
                child.handshake(&mut child_inbound, &session),
            );
            parent_hello?;
            child_hello?;

            let shutdown = CancellationToken::new();
            let worker_loop = tokio::spawn(serve(child, child_inbound, handler, shutdown.clone()));
            let parent_loop = tokio::spawn(serve(
                parent.clone(),
                parent_inbound,
                Arc::new(LogForwarder::new(label.clone())),
                CancellationToken::new(),
            ));
            debug!(worker = %label, session = %session, "in-process worker started");

            Ok(Worker {
                label,
                channel: parent,
                backend: WorkerBackend::InProcess {
                    worker_loop,
                    parent_loop,
                    shutdown,
                },
            })
        }
    }
}

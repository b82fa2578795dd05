/// Message Channel - framed, full-duplex request/notification transport
///
/// **Core Responsibility:**
/// Carry [`Message`]s over any byte stream pair and pair every inbound reply
/// with the request that owns its correlation id, whatever the arrival order.
///
/// **Routing:**
/// - Progress notifications and terminal replies go to the pending request
///   with the same id
/// - Everything else (requests, `Cancel`, `Shutdown`, `Log`, `Hello`) is
///   queued on [`InboundMessages`] for the dispatch loop
///
/// **Failure Rules:**
/// - Framing or I/O errors close the channel; every pending request resolves
///   as `ChannelClosed`
/// - A well-framed but undecodable record aborts only the request carrying
///   its id (`ProtocolError`)
///
/// The pending-request table is the only shared mutable state.
use nanotest_common::protocol::{
    decode_record, read_frame, write_frame, CorrelationId, Hello, Message, MessageBody, RecordError,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const DUPLEX_BUFFER_BYTES: usize = 64 * 1024;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    /// How long a cancelled request waits for the peer's terminal reply
    pub cancel_grace: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            cancel_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,

    #[error(transparent)]
    Frame(#[from] nanotest_common::protocol::FrameError),

    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// How a request ended
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    /// Terminal reply from the peer (may be a `Failure`)
    Response(MessageBody),
    Cancelled,
    ChannelClosed,
    ProtocolError(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestEvent {
    Progress(MessageBody),
    Finished(RequestOutcome),
}

enum Routed {
    Reply(MessageBody),
    Invalid(String),
}

struct Inner {
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    pending: Mutex<HashMap<CorrelationId, mpsc::UnboundedSender<Routed>>>,
    next_id: AtomicU64,
    closed: CancellationToken,
    config: ChannelConfig,
}

impl Inner {
    fn route(&self, message: Message, inbound: &mpsc::UnboundedSender<Message>) {
        if !message.body.is_reply() {
            if inbound.send(message).is_err() {
                trace!("inbound queue dropped; discarding message");
            }
            return;
        }

        let terminal = message.body.is_terminal();
        let mut pending = self.pending.lock();
        let delivered = match pending.get(&message.id) {
            Some(sender) => sender.send(Routed::Reply(message.body)).is_ok(),
            None => false,
        };
        if terminal || !delivered {
            pending.remove(&message.id);
        }
        if !delivered {
            debug!(id = message.id, "reply for a request that is no longer pending");
        }
    }

    fn reject(&self, error: RecordError) {
        match error.id {
            Some(id) => {
                let sender = self.pending.lock().remove(&id);
                match sender {
                    Some(sender) => {
                        warn!(id, reason = %error.reason, "undecodable reply; aborting request");
                        let _ = sender.send(Routed::Invalid(error.reason));
                    }
                    None => warn!(id, reason = %error.reason, "undecodable record"),
                }
            }
            None => warn!(reason = %error.reason, "undecodable record without correlation id"),
        }
    }

    fn shut(&self) {
        self.closed.cancel();
        // dropping the senders resolves every waiter as closed
        self.pending.lock().clear();
    }
}

/// Sending half plus the reply router. Cheap to clone.
#[derive(Clone)]
pub struct MessageChannel {
    inner: Arc<Inner>,
}

/// Unsolicited inbound messages, in arrival order
pub struct InboundMessages {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl InboundMessages {
    /// `None` once the channel has closed and the queue is drained
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl MessageChannel {
    /// Attach a channel to a byte stream pair and start its reader task
    pub fn new<R, W>(reader: R, writer: W, config: ChannelConfig) -> (Self, InboundMessages)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let inner = Arc::new(Inner {
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
            config,
        });
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(read_loop(inner.clone(), reader, inbound_tx));

        (Self { inner }, InboundMessages { rx: inbound_rx })
    }

    /// Two channels connected back to back in memory
    pub fn pair(config: ChannelConfig) -> ((Self, InboundMessages), (Self, InboundMessages)) {
        let (near, far) = tokio::io::duplex(DUPLEX_BUFFER_BYTES);
        let (near_read, near_write) = tokio::io::split(near);
        let (far_read, far_write) = tokio::io::split(far);
        (
            Self::new(near_read, near_write, config),
            Self::new(far_read, far_write, config),
        )
    }

    pub fn config(&self) -> ChannelConfig {
        self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the channel has closed for any reason
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Fire-and-forget send. Frames from concurrent senders never interleave.
    pub async fn send(&self, message: Message) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let mut writer = self.inner.writer.lock().await;
        let stream = writer.as_mut().ok_or(ChannelError::Closed)?;
        if let Err(e) = write_frame(stream, &message).await {
            warn!(error = %e, kind = message.body.kind(), "write failed; closing channel");
            writer.take();
            drop(writer);
            self.inner.shut();
            return Err(e.into());
        }
        trace!(id = message.id, kind = message.body.kind(), "sent");
        Ok(())
    }

    /// Exchange `Hello` with the peer. Both ends call this before anything else.
    pub async fn handshake(
        &self,
        inbound: &mut InboundMessages,
        session: &str,
    ) -> Result<Hello, ChannelError> {
        let local = Hello::current(session);
        self.send(Message::unsolicited(MessageBody::Hello(local.clone()))).await?;

        let message = inbound.recv().await.ok_or(ChannelError::Closed)?;
        let peer = match message.body {
            MessageBody::Hello(peer) => peer,
            other => {
                return Err(ChannelError::Handshake(format!(
                    "expected Hello, got {}",
                    other.kind()
                )))
            }
        };

        if let Some(mismatch) = local.mismatch(&peer) {
            warn!(session, peer_session = %peer.session, %mismatch, "handshake rejected");
            return Err(ChannelError::Handshake(mismatch));
        }
        debug!(session, peer_session = %peer.session, "handshake complete");
        Ok(peer)
    }

    /// Send a request and take ownership of its reply stream
    pub async fn start_request(&self, body: MessageBody) -> Result<PendingRequest, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.pending.lock().insert(id, tx);

        let pending = PendingRequest {
            id,
            channel: self.clone(),
            rx,
            cancel_deadline: None,
            finished: false,
        };
        self.send(Message::new(id, body)).await?;
        Ok(pending)
    }

    /// Send a request and wait for its terminal outcome, discarding progress
    pub async fn request(&self, body: MessageBody, cancel: &CancellationToken) -> RequestOutcome {
        let mut pending = match self.start_request(body).await {
            Ok(pending) => pending,
            Err(_) => return RequestOutcome::ChannelClosed,
        };
        loop {
            match pending.next_event(cancel).await {
                RequestEvent::Progress(body) => {
                    trace!(id = pending.id(), kind = body.kind(), "progress discarded")
                }
                RequestEvent::Finished(outcome) => return outcome,
            }
        }
    }

    /// Close the write side and stop routing. Pending requests resolve as closed.
    pub async fn close(&self) {
        let writer = self.inner.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
        self.inner.shut();
    }
}

async fn read_loop<R>(inner: Arc<Inner>, mut reader: R, inbound: mpsc::UnboundedSender<Message>)
where
    R: AsyncRead + Send + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = inner.closed.cancelled() => break,
            frame = read_frame(&mut reader) => frame,
        };
        match frame {
            Ok(Some(record)) => match decode_record(&record) {
                Ok(message) => {
                    trace!(id = message.id, kind = message.body.kind(), "received");
                    inner.route(message, &inbound);
                }
                Err(error) => inner.reject(error),
            },
            Ok(None) => {
                debug!("peer closed the stream");
                break;
            }
            Err(e) => {
                warn!(error = %e, "framing error; closing channel");
                break;
            }
        }
    }
    inner.shut();
}

/// Reply stream of one in-flight request
pub struct PendingRequest {
    id: CorrelationId,
    channel: MessageChannel,
    rx: mpsc::UnboundedReceiver<Routed>,
    cancel_deadline: Option<Instant>,
    finished: bool,
}

impl PendingRequest {
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn cancel_sent(&self) -> bool {
        self.cancel_deadline.is_some()
    }

    /// Next progress notification or the terminal outcome.
    ///
    /// When `cancel` fires a `Cancel` is sent once; progress keeps flowing
    /// until the peer's terminal reply or until the grace period runs out.
    pub async fn next_event(&mut self, cancel: &CancellationToken) -> RequestEvent {
        if self.finished {
            return RequestEvent::Finished(RequestOutcome::ChannelClosed);
        }

        loop {
            let routed = match self.cancel_deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                    Ok(routed) => routed,
                    Err(_) => {
                        debug!(id = self.id, "no terminal reply within the cancel grace period");
                        return self.finish(RequestOutcome::Cancelled);
                    }
                },
                None => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        self.send_cancel().await;
                        continue;
                    }
                    routed = self.rx.recv() => routed,
                },
            };
            return self.on_routed(routed).await;
        }
    }

    async fn send_cancel(&mut self) {
        debug!(id = self.id, "cancelling request");
        self.cancel_deadline = Some(Instant::now() + self.channel.inner.config.cancel_grace);
        if let Err(e) = self.channel.send(Message::new(self.id, MessageBody::Cancel)).await {
            debug!(id = self.id, error = %e, "cancel not delivered");
        }
    }

    async fn on_routed(&mut self, routed: Option<Routed>) -> RequestEvent {
        match routed {
            None if self.cancel_sent() => self.finish(RequestOutcome::Cancelled),
            None => self.finish(RequestOutcome::ChannelClosed),
            Some(Routed::Invalid(reason)) => {
                // the peer may still be working on it
                if !self.cancel_sent() {
                    let _ = self.channel.send(Message::new(self.id, MessageBody::Cancel)).await;
                }
                self.finish(RequestOutcome::ProtocolError(reason))
            }
            Some(Routed::Reply(MessageBody::Cancelled)) => self.finish(RequestOutcome::Cancelled),
            Some(Routed::Reply(body)) if body.is_terminal() => {
                self.finish(RequestOutcome::Response(body))
            }
            Some(Routed::Reply(body)) => RequestEvent::Progress(body),
        }
    }

    fn finish(&mut self, outcome: RequestOutcome) -> RequestEvent {
        self.finished = true;
        self.channel.inner.pending.lock().remove(&self.id);
        RequestEvent::Finished(outcome)
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if !self.finished {
            self.channel.inner.pending.lock().remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanotest_common::protocol::{
        encode_frame, DiscoverRequest, DiscoverySummary, ExecutionSummary, Failure, LogLevel,
        LogRecord, MAX_FRAME_BYTES,
    };

    fn discover() -> MessageBody {
        MessageBody::Discover(DiscoverRequest {
            assemblies: vec!["a.json".into()],
            context: Default::default(),
        })
    }

    fn complete(tests: usize) -> MessageBody {
        MessageBody::DiscoveryComplete(DiscoverySummary { assemblies: 1, tests })
    }

    fn quick() -> ChannelConfig {
        ChannelConfig {
            cancel_grace: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_replies_are_matched_out_of_order() {
        let ((parent, _), (child, mut requests)) = MessageChannel::pair(quick());
        let cancel = CancellationToken::new();

        let mut first = parent.start_request(discover()).await.unwrap();
        let mut second = parent.start_request(discover()).await.unwrap();
        let a = requests.recv().await.unwrap();
        let b = requests.recv().await.unwrap();
        assert_eq!((a.id, b.id), (first.id(), second.id()));

        // answer in reverse order
        child.send(Message::new(b.id, complete(2))).await.unwrap();
        child.send(Message::new(a.id, complete(1))).await.unwrap();

        assert_eq!(
            first.next_event(&cancel).await,
            RequestEvent::Finished(RequestOutcome::Response(complete(1)))
        );
        assert_eq!(
            second.next_event(&cancel).await,
            RequestEvent::Finished(RequestOutcome::Response(complete(2)))
        );
    }

    #[tokio::test]
    async fn test_progress_precedes_terminal() {
        let ((parent, _), (child, mut requests)) = MessageChannel::pair(quick());
        let cancel = CancellationToken::new();

        let mut pending = parent.start_request(discover()).await.unwrap();
        let request = requests.recv().await.unwrap();
        assert_eq!(request.id, pending.id());

        child
            .send(Message::new(request.id, MessageBody::DiscoveryProgress(Default::default())))
            .await
            .unwrap();
        child.send(Message::new(request.id, complete(0))).await.unwrap();

        assert!(matches!(
            pending.next_event(&cancel).await,
            RequestEvent::Progress(MessageBody::DiscoveryProgress(_))
        ));
        assert_eq!(
            pending.next_event(&cancel).await,
            RequestEvent::Finished(RequestOutcome::Response(complete(0)))
        );
    }

    #[tokio::test]
    async fn test_failure_is_a_terminal_response() {
        let ((parent, _), (child, mut requests)) = MessageChannel::pair(quick());

        let responder = tokio::spawn(async move {
            let request = requests.recv().await.unwrap();
            child
                .send(Message::new(request.id, MessageBody::Failure(Failure::new("disk full"))))
                .await
                .unwrap();
        });

        let outcome = parent.request(discover(), &CancellationToken::new()).await;
        responder.await.unwrap();

        assert_eq!(
            outcome,
            RequestOutcome::Response(MessageBody::Failure(Failure::new("disk full")))
        );
    }

    #[tokio::test]
    async fn test_request_resolves_closed_when_peer_exits() {
        let ((parent, _), (child, mut requests)) = MessageChannel::pair(quick());

        let peer = tokio::spawn(async move {
            let _request = requests.recv().await.unwrap();
            child.close().await;
        });

        let outcome = parent.request(discover(), &CancellationToken::new()).await;
        peer.await.unwrap();

        assert_eq!(outcome, RequestOutcome::ChannelClosed);
        assert!(parent.is_closed());
    }

    #[tokio::test]
    async fn test_cancel_waits_for_terminal_and_keeps_progress() {
        let ((parent, _), (child, mut requests)) = MessageChannel::pair(quick());
        let cancel = CancellationToken::new();

        let mut pending = parent.start_request(discover()).await.unwrap();
        let request = requests.recv().await.unwrap();
        cancel.cancel();

        let peer = tokio::spawn(async move {
            let signal = requests.recv().await.unwrap();
            assert_eq!(signal.body, MessageBody::Cancel);
            assert_eq!(signal.id, request.id);
            child
                .send(Message::new(request.id, MessageBody::DiscoveryProgress(Default::default())))
                .await
                .unwrap();
            child.send(Message::new(request.id, MessageBody::Cancelled)).await.unwrap();
        });

        assert!(matches!(pending.next_event(&cancel).await, RequestEvent::Progress(_)));
        assert_eq!(
            pending.next_event(&cancel).await,
            RequestEvent::Finished(RequestOutcome::Cancelled)
        );
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_keeps_partial_results_of_a_late_terminal() {
        let ((parent, _), (child, mut requests)) = MessageChannel::pair(quick());
        let cancel = CancellationToken::new();

        let mut pending = parent.start_request(discover()).await.unwrap();
        let request = requests.recv().await.unwrap();
        cancel.cancel();

        let summary = MessageBody::ExecutionComplete(ExecutionSummary {
            reported: 3,
            aborted: false,
        });
        let peer = tokio::spawn({
            let summary = summary.clone();
            async move {
                let _signal = requests.recv().await.unwrap();
                child.send(Message::new(request.id, summary)).await.unwrap();
            }
        });

        assert_eq!(
            pending.next_event(&cancel).await,
            RequestEvent::Finished(RequestOutcome::Response(summary))
        );
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_times_out_without_terminal() {
        let ((parent, _), (_child, _requests)) = MessageChannel::pair(quick());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let started = Instant::now();
        let outcome = parent.request(discover(), &cancel).await;

        assert_eq!(outcome, RequestOutcome::Cancelled);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_close_after_cancel_is_cancelled() {
        let ((parent, _), (child, mut requests)) = MessageChannel::pair(quick());
        let cancel = CancellationToken::new();

        let mut pending = parent.start_request(discover()).await.unwrap();
        let _request = requests.recv().await.unwrap();
        cancel.cancel();

        let peer = tokio::spawn(async move {
            let _signal = requests.recv().await.unwrap();
            child.close().await;
        });

        assert_eq!(
            pending.next_event(&cancel).await,
            RequestEvent::Finished(RequestOutcome::Cancelled)
        );
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_unsolicited_messages_reach_the_inbound_queue() {
        let ((parent, mut parent_inbound), (child, _)) = MessageChannel::pair(quick());

        child
            .send(Message::unsolicited(MessageBody::Log(LogRecord::new(LogLevel::Info, "booted"))))
            .await
            .unwrap();

        let message = parent_inbound.recv().await.unwrap();
        assert_eq!(message.body, MessageBody::Log(LogRecord::new(LogLevel::Info, "booted")));
        assert!(!parent.is_closed());
    }

    #[tokio::test]
    async fn test_handshake() {
        let ((parent, mut parent_inbound), (child, mut child_inbound)) = MessageChannel::pair(quick());

        let (a, b) = tokio::join!(
            parent.handshake(&mut parent_inbound, "parent"),
            child.handshake(&mut child_inbound, "child"),
        );

        assert_eq!(a.unwrap().session, "child");
        assert_eq!(b.unwrap().session, "parent");
    }

    #[tokio::test]
    async fn test_handshake_rejects_mismatched_kinds() {
        let ((parent, mut parent_inbound), (child, _)) = MessageChannel::pair(quick());
        let mut hello = Hello::current("old-worker");
        hello.kinds.retain(|kind| kind != "Shutdown");
        child.send(Message::unsolicited(MessageBody::Hello(hello))).await.unwrap();

        let result = parent.handshake(&mut parent_inbound, "parent").await;

        assert!(matches!(result, Err(ChannelError::Handshake(reason)) if reason.contains("kind table")));
    }

    /// Channel on one end, raw byte stream on the other
    fn raw_peer() -> (MessageChannel, tokio::io::ReadHalf<tokio::io::DuplexStream>, tokio::io::WriteHalf<tokio::io::DuplexStream>) {
        let (near, far) = tokio::io::duplex(DUPLEX_BUFFER_BYTES);
        let (near_read, near_write) = tokio::io::split(near);
        let (channel, _inbound) = MessageChannel::new(near_read, near_write, quick());
        let (far_read, far_write) = tokio::io::split(far);
        (channel, far_read, far_write)
    }

    #[tokio::test]
    async fn test_unknown_kind_aborts_only_its_request() {
        let (channel, mut far_read, mut far_write) = raw_peer();
        let cancel = CancellationToken::new();

        let mut broken = channel.start_request(discover()).await.unwrap();
        let mut healthy = channel.start_request(discover()).await.unwrap();
        for _ in 0..2 {
            read_frame(&mut far_read).await.unwrap().unwrap();
        }

        let record = format!(r#"{{"id": {}, "body": {{"kind": "Teleport"}}}}"#, broken.id());
        let mut frame = (record.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(record.as_bytes());
        far_write.write_all(&frame).await.unwrap();
        far_write
            .write_all(&encode_frame(&Message::new(healthy.id(), complete(1))).unwrap())
            .await
            .unwrap();

        assert!(matches!(
            broken.next_event(&cancel).await,
            RequestEvent::Finished(RequestOutcome::ProtocolError(reason)) if reason.contains("Teleport")
        ));
        assert_eq!(
            healthy.next_event(&cancel).await,
            RequestEvent::Finished(RequestOutcome::Response(complete(1)))
        );
        assert!(!channel.is_closed());
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_the_channel() {
        let (channel, mut far_read, mut far_write) = raw_peer();

        let mut pending = channel.start_request(discover()).await.unwrap();
        read_frame(&mut far_read).await.unwrap().unwrap();
        far_write
            .write_all(&((MAX_FRAME_BYTES as u32) + 1).to_be_bytes())
            .await
            .unwrap();

        assert_eq!(
            pending.next_event(&CancellationToken::new()).await,
            RequestEvent::Finished(RequestOutcome::ChannelClosed)
        );
        channel.closed().await;
        assert!(channel.send(Message::unsolicited(MessageBody::Shutdown)).await.is_err());
    }
}

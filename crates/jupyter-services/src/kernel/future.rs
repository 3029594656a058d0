//! Reply futures: one per outstanding request, keyed by `msg_id`.

use jupyter_wire::{Channel, KernelMessage};
use tokio::sync::{mpsc, oneshot};

use crate::error::ServiceError;

type DoneSender = oneshot::Sender<Result<Option<KernelMessage>, ServiceError>>;

/// Connection-side state of one request.
///
/// A request is complete once its reply has arrived (or none is expected)
/// and the kernel has gone back to `idle` for it, in either order.
pub(crate) struct PendingReply {
    expect_reply: bool,
    reply: Option<KernelMessage>,
    idle: bool,
    messages: mpsc::UnboundedSender<KernelMessage>,
    done: Option<DoneSender>,
}

impl PendingReply {
    pub(crate) fn new(msg_id: String, expect_reply: bool) -> (Self, KernelFuture) {
        let (messages, messages_rx) = mpsc::unbounded_channel();
        let (done, done_rx) = oneshot::channel();
        let pending = PendingReply {
            expect_reply,
            reply: None,
            idle: false,
            messages,
            done: Some(done),
        };
        let future = KernelFuture {
            msg_id,
            messages: messages_rx,
            done: done_rx,
        };
        (pending, future)
    }

    /// Record a message whose parent is this request and stream it on.
    pub(crate) fn handle(&mut self, msg: &KernelMessage) {
        match msg.channel {
            Some(Channel::Shell) | Some(Channel::Control) if msg.msg_type().ends_with("_reply") => {
                self.reply = Some(msg.clone());
            }
            Some(Channel::Iopub) if msg.execution_state() == Some("idle") => {
                self.idle = true;
            }
            _ => {}
        }
        let _ = self.messages.send(msg.clone());
    }

    pub(crate) fn is_done(&self) -> bool {
        self.idle && (self.reply.is_some() || !self.expect_reply)
    }

    pub(crate) fn finish(mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(Ok(self.reply.take()));
        }
    }

    pub(crate) fn reject(mut self, err: ServiceError) {
        if let Some(done) = self.done.take() {
            let _ = done.send(Err(err));
        }
    }
}

/// Handle to an in-flight request.
///
/// Every message the kernel sends in response (replies, iopub output,
/// status) is streamed through [`next_message`](Self::next_message) in
/// receive order. [`done`](Self::done) resolves with the reply once the
/// request is complete, or with [`ServiceError::Disposed`] if the
/// connection was torn down first.
#[derive(Debug)]
pub struct KernelFuture {
    msg_id: String,
    messages: mpsc::UnboundedReceiver<KernelMessage>,
    done: oneshot::Receiver<Result<Option<KernelMessage>, ServiceError>>,
}

impl KernelFuture {
    /// `msg_id` of the request this future tracks.
    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    /// Next message for this request; `None` once the request finished
    /// and every message has been drained.
    pub async fn next_message(&mut self) -> Option<KernelMessage> {
        self.messages.recv().await
    }

    pub fn try_next_message(&mut self) -> Option<KernelMessage> {
        self.messages.try_recv().ok()
    }

    /// Wait for completion. Yields the shell/control reply, or `None` for
    /// requests that expect no reply.
    pub async fn done(self) -> Result<Option<KernelMessage>, ServiceError> {
        self.done.await.unwrap_or(Err(ServiceError::Disposed))
    }

    /// Non-blocking check of the outcome.
    pub fn try_done(&mut self) -> Option<Result<Option<KernelMessage>, ServiceError>> {
        match self.done.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ServiceError::Disposed)),
        }
    }
}

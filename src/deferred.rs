//! Single-producer one-shot completion with idempotent resolve/reject.
//!
//! A [`Deferred`] can be resolved or rejected exactly once; both return
//! whether the call performed the winning transition. The consumer side is
//! claimed by a single `wait().await`. A deferred may carry attached
//! [`ChannelOptions`] so a pending accepter's options travel with its
//! one-shot through the rendezvous queue.

use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::MuxError;
use crate::options::ChannelOptions;

pub(crate) struct Deferred<T> {
    tx: Mutex<Option<oneshot::Sender<Result<T, MuxError>>>>,
    rx: Mutex<Option<oneshot::Receiver<Result<T, MuxError>>>>,
    attachment: Option<ChannelOptions>,
}

impl<T> Deferred<T> {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_attachment(options: ChannelOptions) -> Self {
        Self::build(Some(options))
    }

    fn build(attachment: Option<ChannelOptions>) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            attachment,
        }
    }

    /// Resolve the deferred. Returns `true` when this call won the
    /// transition and a consumer will observe the value; `false` when the
    /// deferred was already completed or its consumer is gone.
    pub fn resolve(&self, value: T) -> bool {
        match self.tx.lock().unwrap().take() {
            Some(tx) => tx.send(Ok(value)).is_ok(),
            None => false,
        }
    }

    /// Reject the deferred. Same transition semantics as [`resolve`](Self::resolve).
    pub fn reject(&self, error: MuxError) -> bool {
        match self.tx.lock().unwrap().take() {
            Some(tx) => tx.send(Err(error)).is_ok(),
            None => false,
        }
    }

    /// Whether the consumer has been dropped without receiving a value.
    /// Used to prune dead accepters from rendezvous queues.
    pub fn is_abandoned(&self) -> bool {
        match self.tx.lock().unwrap().as_ref() {
            Some(tx) => tx.is_closed(),
            None => false,
        }
    }

    /// The options attached at construction, if any.
    pub fn attachment(&self) -> Option<ChannelOptions> {
        self.attachment
    }

    /// Take the consumer side out of the deferred. Once claimed, dropping
    /// the receiver marks the deferred abandoned, so a cancelled waiter is
    /// observable to the producer even if the wait was never polled.
    pub fn claim(&self) -> Option<oneshot::Receiver<Result<T, MuxError>>> {
        self.rx.lock().unwrap().take()
    }

    /// Await the outcome. The consumer side can be claimed once; a second
    /// call fails with `Cancelled`.
    pub async fn wait(&self) -> Result<T, MuxError> {
        match self.claim() {
            Some(rx) => match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(MuxError::Cancelled),
            },
            None => Err(MuxError::Cancelled),
        }
    }
}

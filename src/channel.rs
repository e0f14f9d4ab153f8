//! Per-channel state machine and byte queues.
//!
//! A channel is jointly owned by the stream's registry and by application
//! handles (`Arc<Channel>`). It never holds a reference back to the stream;
//! all outbound traffic goes through a clone of the writer task's command
//! sender, which also breaks the ownership cycle between stream and
//! channels.
//!
//! ## Lifecycle
//!
//! Offered (locally or by the remote) → accepted → optionally half-closed
//! by either side → terminated. Acceptance and rejection are mutually
//! exclusive and monotonic. Outbound writes before acceptance are buffered
//! locally without bound and flushed as `Content` frames once the channel
//! is accepted.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::deferred::Deferred;
use crate::error::MuxError;
use crate::frame::{encode_header, ControlCode, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::options::ChannelOptions;

/// Commands consumed by the stream's writer task.
pub(crate) enum WriterCommand {
    /// Write one frame. When `ack` is present the enqueuer awaits the
    /// transport write, which is how transport backpressure reaches
    /// [`Channel::write`]. Notifications pass `ack: None` and are
    /// fire-and-forget.
    Frame {
        header: [u8; HEADER_SIZE],
        payload: Bytes,
        ack: Option<oneshot::Sender<Result<(), MuxError>>>,
    },
    Shutdown,
}

pub(crate) type FrameSender = mpsc::UnboundedSender<WriterCommand>;

struct ChannelCore {
    options: ChannelOptions,
    offered: bool,
    accepted: bool,
    rejected_or_canceled: bool,
    disposed: bool,
    /// Local half-close requested. The `ContentWritingCompleted` frame is
    /// emitted once: immediately when accepted, or at flush time when the
    /// half-close predates acceptance.
    writes_completed: bool,
    write_buffer: Vec<Bytes>,
    inbound_tx: Option<mpsc::Sender<Bytes>>,
    inbound_rx: Option<mpsc::Receiver<Bytes>>,
}

/// One multiplexed bidirectional byte stream.
pub struct Channel {
    id: u32,
    name: String,
    offered_locally: bool,
    frames: FrameSender,
    acceptance: Deferred<()>,
    completion: Deferred<()>,
    core: Mutex<ChannelCore>,
}

impl Channel {
    pub(crate) fn offered_locally(
        id: u32,
        name: String,
        options: ChannelOptions,
        frames: FrameSender,
    ) -> Arc<Self> {
        Arc::new(Self::build(id, name, options, frames, true))
    }

    pub(crate) fn offered_by_remote(id: u32, name: String, frames: FrameSender) -> Arc<Self> {
        Arc::new(Self::build(id, name, ChannelOptions::default(), frames, false))
    }

    fn build(
        id: u32,
        name: String,
        options: ChannelOptions,
        frames: FrameSender,
        offered_locally: bool,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(options.inbound_frame_buffer.max(1));
        Self {
            id,
            name,
            offered_locally,
            frames,
            acceptance: Deferred::new(),
            completion: Deferred::new(),
            core: Mutex::new(ChannelCore {
                options,
                offered: true,
                accepted: false,
                rejected_or_canceled: false,
                disposed: false,
                writes_completed: false,
                write_buffer: Vec::new(),
                inbound_tx: Some(inbound_tx),
                inbound_rx: Some(inbound_rx),
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// The rendezvous name; empty for anonymous channels.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_offered(&self) -> bool {
        self.core.lock().unwrap().offered
    }

    pub fn is_accepted(&self) -> bool {
        self.core.lock().unwrap().accepted
    }

    pub fn is_rejected_or_canceled(&self) -> bool {
        self.core.lock().unwrap().rejected_or_canceled
    }

    pub fn is_disposed(&self) -> bool {
        self.core.lock().unwrap().disposed
    }

    /// The channel's current options: the construction-time options until
    /// acceptance, the accept-side options afterwards.
    pub fn options(&self) -> ChannelOptions {
        self.core.lock().unwrap().options
    }

    /// Await acceptance of this channel's offer. Resolves when the channel
    /// is accepted and fails when the offer is rejected, cancelled, or the
    /// stream closes. The signal can be awaited once.
    pub async fn acceptance(&self) -> Result<(), MuxError> {
        self.acceptance.wait().await
    }

    /// Await this channel leaving its live state. The signal can be
    /// awaited once; it fails when the stream closes with an error.
    pub async fn completion(&self) -> Result<(), MuxError> {
        self.completion.wait().await
    }

    /// Claim the reader half. Yields inbound payloads in arrival order and
    /// `None` once the remote half-closes or the channel terminates.
    pub fn take_receiver(&self) -> Option<ChannelReceiver> {
        let rx = self.core.lock().unwrap().inbound_rx.take();
        rx.map(|rx| ChannelReceiver { rx })
    }

    /// Write bytes to the channel.
    ///
    /// Before acceptance the bytes are buffered locally and the call
    /// returns immediately; after acceptance the call resolves when the
    /// transport has accepted the frames, inheriting the transport's
    /// backpressure. Payloads larger than a frame are split.
    pub async fn write(&self, data: &[u8]) -> Result<(), MuxError> {
        if data.is_empty() {
            return Ok(());
        }

        let acks = {
            let mut core = self.core.lock().unwrap();
            if core.disposed || core.rejected_or_canceled || core.writes_completed {
                return Err(MuxError::ChannelClosed);
            }
            if !core.accepted {
                core.write_buffer.push(Bytes::copy_from_slice(data));
                trace!(channel = self.id, bytes = data.len(), "buffered write before acceptance");
                None
            } else {
                let mut acks = Vec::with_capacity(data.len().div_ceil(MAX_PAYLOAD_SIZE));
                for chunk in data.chunks(MAX_PAYLOAD_SIZE) {
                    let (ack_tx, ack_rx) = oneshot::channel();
                    self.send_content(chunk, Some(ack_tx))?;
                    acks.push(ack_rx);
                }
                Some(acks)
            }
        };

        if let Some(acks) = acks {
            for ack in acks {
                match ack.await {
                    Ok(outcome) => outcome?,
                    Err(_) => return Err(MuxError::StreamClosed("writer task exited".to_string())),
                }
            }
        }
        Ok(())
    }

    /// Declare that no further bytes will be written on this channel.
    ///
    /// Sends `ContentWritingCompleted` exactly once; repeated calls are
    /// no-ops. The inbound direction stays open.
    pub fn finish_writing(&self) {
        let send_now = {
            let mut core = self.core.lock().unwrap();
            if core.writes_completed || core.disposed || core.rejected_or_canceled {
                false
            } else {
                core.writes_completed = true;
                core.accepted
            }
        };
        if send_now {
            self.send_notification(ControlCode::ContentWritingCompleted);
        }
    }

    /// Terminate the channel from this side. The remote is notified with
    /// `ChannelTerminated`; buffered writes are discarded and the inbound
    /// queue ends.
    pub fn dispose(&self) {
        if !self.teardown() {
            return;
        }
        self.send_notification(ControlCode::ChannelTerminated);
        let acceptance_error = if self.offered_locally {
            MuxError::Cancelled
        } else {
            MuxError::NoLongerAvailable(self.id)
        };
        self.acceptance.reject(acceptance_error);
        self.completion.resolve(());
        debug!(channel = self.id, "channel disposed locally");
    }

    /// Accept a remotely offered channel. Sends `OfferAccepted` and flushes
    /// any writes buffered while the offer was pending.
    pub(crate) fn try_accept(&self, options: ChannelOptions) -> Result<(), MuxError> {
        {
            let mut core = self.core.lock().unwrap();
            if core.accepted {
                return Err(MuxError::AlreadyAccepted(self.id));
            }
            if core.rejected_or_canceled || core.disposed {
                return Err(MuxError::NoLongerAvailable(self.id));
            }
            if self.offered_locally {
                return Err(MuxError::NotAcceptable(self.id));
            }
            core.accepted = true;
            core.options = options;
            // The accept-side options replace the defaults the offer was
            // registered with; the inbound queue is rebuilt while it is
            // guaranteed empty (pre-acceptance content is discarded).
            if core.inbound_rx.is_some() {
                let (tx, rx) = mpsc::channel(options.inbound_frame_buffer.max(1));
                core.inbound_tx = Some(tx);
                core.inbound_rx = Some(rx);
            }
            self.send_notification(ControlCode::OfferAccepted);
            self.flush_locked(&mut core);
        }
        self.acceptance.resolve(());
        debug!(channel = self.id, name = %self.name, "accepted remote offer");
        Ok(())
    }

    /// The remote accepted our offer. Returns `false` (and does nothing)
    /// when the offer was already cancelled locally: the cancellation and
    /// the acceptance crossed in flight and `ChannelTerminated` is already
    /// on the wire.
    pub(crate) fn on_accepted(&self) -> bool {
        {
            let mut core = self.core.lock().unwrap();
            if core.accepted || core.rejected_or_canceled || core.disposed {
                return false;
            }
            core.accepted = true;
            self.flush_locked(&mut core);
        }
        self.acceptance.resolve(());
        debug!(channel = self.id, name = %self.name, "offer accepted by remote");
        true
    }

    /// The remote terminated the channel (or withdrew its offer). No frame
    /// is sent back.
    pub(crate) fn on_remote_terminated(&self) {
        if !self.teardown() {
            return;
        }
        self.acceptance.reject(MuxError::OfferRejected);
        self.completion.resolve(());
        debug!(channel = self.id, "channel terminated by remote");
    }

    /// The stream is closing; fail both signals with the root cause. No
    /// per-channel frame is sent (transport closure implies termination).
    pub(crate) fn on_stream_closed(&self, error: MuxError) {
        if !self.teardown() {
            return;
        }
        self.acceptance.reject(error.clone());
        self.completion.reject(error);
    }

    /// Deliver an inbound `Content` payload. Awaits inbound queue space,
    /// which blocks the reader task and propagates backpressure to the
    /// wire. Payloads for a channel that is not accepted (or whose reader
    /// is gone) are discarded.
    pub(crate) async fn receive_content(&self, payload: Bytes) {
        let tx = {
            let core = self.core.lock().unwrap();
            if !core.accepted {
                trace!(channel = self.id, "discarding content for unaccepted channel");
                return;
            }
            core.inbound_tx.clone()
        };
        match tx {
            Some(tx) => {
                if tx.send(payload).await.is_err() {
                    trace!(channel = self.id, "discarding content; receiver dropped");
                }
            }
            None => {
                trace!(channel = self.id, "discarding content after end of stream");
            }
        }
    }

    /// The remote half-closed: end the inbound queue. Dropping the sender
    /// is the end-of-stream sentinel observed by the receiver.
    pub(crate) fn complete_inbound(&self) {
        self.core.lock().unwrap().inbound_tx.take();
    }

    fn teardown(&self) -> bool {
        let mut core = self.core.lock().unwrap();
        if core.disposed {
            return false;
        }
        core.disposed = true;
        if !core.accepted {
            core.rejected_or_canceled = true;
        }
        core.inbound_tx = None;
        core.write_buffer.clear();
        true
    }

    /// Flush buffered writes as `Content` frames, then the deferred
    /// half-close if one was requested. Runs under the core lock so no
    /// concurrent write can interleave with the flush.
    fn flush_locked(&self, core: &mut ChannelCore) {
        for buffered in std::mem::take(&mut core.write_buffer) {
            for chunk in buffered.chunks(MAX_PAYLOAD_SIZE) {
                let _ = self.send_content(chunk, None);
            }
        }
        if core.writes_completed {
            self.send_notification(ControlCode::ContentWritingCompleted);
        }
    }

    fn send_content(
        &self,
        chunk: &[u8],
        ack: Option<oneshot::Sender<Result<(), MuxError>>>,
    ) -> Result<(), MuxError> {
        let header = encode_header(ControlCode::Content, self.id, chunk.len() as u32);
        self.frames
            .send(WriterCommand::Frame {
                header,
                payload: Bytes::copy_from_slice(chunk),
                ack,
            })
            .map_err(|_| MuxError::StreamClosed("writer task exited".to_string()))
    }

    /// Fire-and-forget notification frame. A no-op once the writer task has
    /// exited: post-disposal terminations need no wire notice.
    pub(crate) fn send_notification(&self, code: ControlCode) {
        let header = encode_header(code, self.id, 0);
        let _ = self.frames.send(WriterCommand::Frame {
            header,
            payload: Bytes::new(),
            ack: None,
        });
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core.lock().unwrap();
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("offered_locally", &self.offered_locally)
            .field("accepted", &core.accepted)
            .field("rejected_or_canceled", &core.rejected_or_canceled)
            .field("disposed", &core.disposed)
            .finish()
    }
}

/// Reader half of a channel.
pub struct ChannelReceiver {
    rx: mpsc::Receiver<Bytes>,
}

impl ChannelReceiver {
    /// Next inbound payload, or `None` once the remote half-closed or the
    /// channel terminated.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

//! The multiplexing stream: handshake, channel registry, rendezvous queues,
//! frame dispatch, and the public offer/accept/reject surface.
//!
//! ## Architecture
//!
//! ```text
//!                       ┌────────────────────────────┐
//!   transport read ──▶  │ reader task: frame dispatch │ ──▶ registry / channels
//!                       └────────────────────────────┘
//!                       ┌────────────────────────────┐
//!   transport write ◀── │ writer task: command queue  │ ◀── channels / public API
//!                       └────────────────────────────┘
//! ```
//!
//! Exactly one reader task mutates the registry on inbound events; public
//! operations mutate it from the caller's context behind the same mutex.
//! All frame transmission funnels through the writer task, so frames are
//! never interleaved on the wire.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::channel::{Channel, FrameSender, WriterCommand};
use crate::deferred::Deferred;
use crate::error::MuxError;
use crate::frame::{encode_header, ControlCode, FrameHeader, MAX_PAYLOAD_SIZE};
use crate::handshake::{self, Role};
use crate::io;
use crate::options::{ChannelOptions, MultiplexingStreamOptions};

/// Capacity of the `channelOffered` broadcast; slow subscribers that lag
/// further than this lose the oldest events.
const OFFER_EVENT_CAPACITY: usize = 64;

/// A remote channel offer, published on the event surface.
#[derive(Debug, Clone)]
pub struct ChannelOffer {
    pub id: u32,
    pub name: String,
    /// `true` when the offer was auto-matched to a pending local accepter.
    pub is_accepted: bool,
}

type AcceptorQueue = VecDeque<Arc<Deferred<Arc<Channel>>>>;

struct StreamState {
    channels: HashMap<u32, Arc<Channel>>,
    /// Remote offers by name, not yet accepted, in arrival order.
    offers_by_name: HashMap<String, VecDeque<Arc<Channel>>>,
    /// Pending local accepters by name, in registration order.
    acceptors_by_name: HashMap<String, AcceptorQueue>,
    /// Next id this party may allocate; `None` once the space is exhausted.
    next_channel_id: Option<u32>,
    disposed: bool,
}

struct Inner {
    role: Role,
    state: Mutex<StreamState>,
    frames: FrameSender,
    offers: broadcast::Sender<ChannelOffer>,
    completion: watch::Sender<Option<Result<(), MuxError>>>,
    reader_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

/// Multiplexes many independent bidirectional byte channels over one
/// full-duplex transport.
///
/// Construction performs the handshake and spawns one reader and one writer
/// task. Dropping the stream disposes it.
pub struct MultiplexingStream {
    inner: Arc<Inner>,
    tasks: Vec<JoinHandle<()>>,
}

impl MultiplexingStream {
    /// Perform the handshake on `transport` and start the stream.
    ///
    /// Cancelling the returned future before completion drops (and thereby
    /// closes) the transport.
    pub async fn create<S>(
        mut transport: S,
        _options: MultiplexingStreamOptions,
    ) -> Result<Self, MuxError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let role = handshake::exchange(&mut transport).await?;
        debug!(?role, "handshake complete");

        let (read_half, write_half) = tokio::io::split(transport);
        let (frames, frames_rx) = mpsc::unbounded_channel();
        let (offers, _) = broadcast::channel(OFFER_EVENT_CAPACITY);
        let (completion, _) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let inner = Arc::new(Inner {
            role,
            state: Mutex::new(StreamState {
                channels: HashMap::new(),
                offers_by_name: HashMap::new(),
                acceptors_by_name: HashMap::new(),
                next_channel_id: Some(role.first_channel_id()),
                disposed: false,
            }),
            frames,
            offers,
            completion,
            reader_shutdown: Mutex::new(Some(shutdown_tx)),
        });

        let writer_task = tokio::spawn(writer_loop(write_half, frames_rx, inner.clone()));
        let reader_task = tokio::spawn(reader_loop(read_half, shutdown_rx, inner.clone()));

        Ok(Self {
            inner,
            tasks: vec![writer_task, reader_task],
        })
    }

    /// The handshake-assigned role of this peer.
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Create an anonymous channel and offer it to the remote peer.
    ///
    /// Returns immediately; the returned channel buffers writes until the
    /// remote accepts it by id (communicated out of band, typically over an
    /// existing channel).
    pub fn create_channel(&self, options: ChannelOptions) -> Result<Arc<Channel>, MuxError> {
        let mut state = self.inner.state.lock().unwrap();
        if state.disposed {
            return Err(MuxError::AlreadyDisposed);
        }
        let id = allocate_id(&mut state)?;
        let channel = Channel::offered_locally(id, String::new(), options, self.inner.frames.clone());
        state.channels.insert(id, channel.clone());
        // Enqueued under the lock so the offer precedes any later frame.
        send_offer_frame(&self.inner, &channel, None);
        debug!(channel = id, "offered anonymous channel");
        Ok(channel)
    }

    /// Offer a named channel and await the remote peer's acceptance.
    ///
    /// Fails with [`MuxError::OfferRejected`] when the remote terminates
    /// the offer before accepting. Dropping the future cancels the offer:
    /// the channel is terminated on the wire and a crossing acceptance is
    /// absorbed silently.
    pub async fn offer_channel(
        &self,
        name: &str,
        options: ChannelOptions,
    ) -> Result<Arc<Channel>, MuxError> {
        if name.len() > MAX_PAYLOAD_SIZE {
            return Err(MuxError::NameTooLong {
                len: name.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let (channel, offer_ack) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.disposed {
                return Err(MuxError::AlreadyDisposed);
            }
            let id = allocate_id(&mut state)?;
            let channel =
                Channel::offered_locally(id, name.to_string(), options, self.inner.frames.clone());
            state.channels.insert(id, channel.clone());
            let (ack_tx, ack_rx) = oneshot::channel();
            send_offer_frame(&self.inner, &channel, Some(ack_tx));
            (channel, ack_rx)
        };
        debug!(channel = channel.id(), name, "offered named channel");

        // From here on a drop cancels the offer.
        let mut guard = OfferGuard {
            channel: channel.clone(),
            armed: true,
        };

        match offer_ack.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                guard.armed = false;
                return Err(e);
            }
            Err(_) => {
                guard.armed = false;
                return Err(MuxError::StreamClosed("writer task exited".to_string()));
            }
        }

        let accepted = channel.acceptance().await;
        guard.armed = false;
        accepted?;
        Ok(channel)
    }

    /// Accept a remotely offered channel by id.
    pub fn accept_channel_by_id(
        &self,
        id: u32,
        options: ChannelOptions,
    ) -> Result<Arc<Channel>, MuxError> {
        let channel = {
            let mut state = self.inner.state.lock().unwrap();
            if state.disposed {
                return Err(MuxError::AlreadyDisposed);
            }
            let channel = state
                .channels
                .get(&id)
                .cloned()
                .ok_or(MuxError::UnknownChannel(id))?;
            remove_offer_by_identity(&mut state, &channel);
            channel.try_accept(options)?;
            channel
        };
        Ok(channel)
    }

    /// Accept the next channel the remote offers under `name`.
    ///
    /// An already-pending offer is accepted inline; otherwise a pending
    /// accepter is registered and matched FIFO against later offers.
    /// Dropping the future removes the pending accepter without consuming
    /// any offer.
    pub async fn accept_channel(
        &self,
        name: &str,
        options: ChannelOptions,
    ) -> Result<Arc<Channel>, MuxError> {
        let acceptor = {
            let mut state = self.inner.state.lock().unwrap();
            if state.disposed {
                return Err(MuxError::AlreadyDisposed);
            }

            if let Some(queue) = state.offers_by_name.get_mut(name) {
                // Discard offers that died while queued; accept the first
                // live one.
                let mut accepted = None;
                while let Some(candidate) = queue.pop_front() {
                    if candidate.try_accept(options).is_ok() {
                        accepted = Some(candidate);
                        break;
                    }
                    trace!(channel = candidate.id(), "discarded stale queued offer");
                }
                if queue.is_empty() {
                    state.offers_by_name.remove(name);
                }
                if let Some(channel) = accepted {
                    return Ok(channel);
                }
            }

            let acceptor = Arc::new(Deferred::with_attachment(options));
            state
                .acceptors_by_name
                .entry(name.to_string())
                .or_default()
                .push_back(acceptor.clone());
            acceptor
        };

        // The guard owns the one-shot's consumer side. On cancellation it
        // adjudicates against a racing offer under the registry lock, and
        // when the match already happened it can recover the channel the
        // reader delivered into the receiver it holds.
        let waiter = acceptor.claim().ok_or(MuxError::Cancelled)?;
        let mut guard = AcceptorGuard {
            inner: self.inner.clone(),
            name: name.to_string(),
            acceptor: acceptor.clone(),
            waiter,
            armed: true,
        };
        let channel = match (&mut guard.waiter).await {
            Ok(outcome) => outcome,
            Err(_) => Err(MuxError::Cancelled),
        };
        guard.armed = false;
        channel
    }

    /// Reject a remotely offered channel: terminate it and notify the
    /// remote, whose pending offer fails with `OfferRejected`.
    pub fn reject_channel(&self, id: u32) -> Result<(), MuxError> {
        let channel = {
            let mut state = self.inner.state.lock().unwrap();
            if state.disposed {
                return Err(MuxError::AlreadyDisposed);
            }
            let channel = state
                .channels
                .remove(&id)
                .ok_or(MuxError::UnknownChannel(id))?;
            remove_offer_by_identity(&mut state, &channel);
            channel
        };
        // The channel's own acceptance/completion rejections are of no
        // interest to a caller that explicitly rejected it.
        channel.dispose();
        debug!(channel = id, "rejected channel");
        Ok(())
    }

    /// Subscribe to remote channel offers.
    pub fn offered_channels(&self) -> broadcast::Receiver<ChannelOffer> {
        self.inner.offers.subscribe()
    }

    /// Dispose the stream: every live channel and pending accepter fails
    /// with `StreamClosed`, the transport is shut down, and the completion
    /// signal resolves. Idempotent.
    pub fn dispose(&self) {
        dispose_stream(&self.inner, Ok(()));
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().unwrap().disposed
    }

    /// Await stream completion: resolves `Ok` after a clean disposal or
    /// remote closure, `Err` when a protocol or transport error tore the
    /// stream down.
    pub async fn closed(&self) -> Result<(), MuxError> {
        let mut rx = self.inner.completion.subscribe();
        loop {
            {
                let value = rx.borrow_and_update();
                if let Some(outcome) = value.clone() {
                    return outcome;
                }
            }
            if rx.changed().await.is_err() {
                return Err(MuxError::StreamClosed("stream dropped".to_string()));
            }
        }
    }
}

impl Drop for MultiplexingStream {
    fn drop(&mut self) {
        dispose_stream(&self.inner, Ok(()));
        // The tasks observe the shutdown signals and exit; nothing waits on
        // them here because Drop cannot block.
        self.tasks.clear();
    }
}

// =============================================================================
// GUARDS — future-cancellation behavior for offer/accept
// =============================================================================

/// Cancels an in-flight offer when `offer_channel` is dropped before the
/// remote's answer: the channel is terminated on the wire and a crossing
/// `OfferAccepted` finds a rejected channel and is ignored.
struct OfferGuard {
    channel: Arc<Channel>,
    armed: bool,
}

impl Drop for OfferGuard {
    fn drop(&mut self) {
        if self.armed {
            self.channel.dispose();
        }
    }
}

/// Cancellation of `accept_channel`. Queue removal and cancellation of the
/// accepter's one-shot happen in a single critical section under the
/// registry lock — the same lock the reader holds while matching offers —
/// so exactly one of two outcomes is possible: the cancellation wins the
/// one-shot and no offer is consumed, or the reader already matched an
/// offer, in which case the guard recovers the channel it delivered and
/// terminates it. Either way a cancelled accepter never silently swallows
/// an offer.
struct AcceptorGuard {
    inner: Arc<Inner>,
    name: String,
    acceptor: Arc<Deferred<Arc<Channel>>>,
    waiter: oneshot::Receiver<Result<Arc<Channel>, MuxError>>,
    armed: bool,
}

impl Drop for AcceptorGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let already_resolved = {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(queue) = state.acceptors_by_name.get_mut(&self.name) {
                queue.retain(|candidate| !Arc::ptr_eq(candidate, &self.acceptor));
                if queue.is_empty() {
                    state.acceptors_by_name.remove(&self.name);
                }
            }
            !self.acceptor.reject(MuxError::Cancelled)
        };
        if already_resolved {
            // The reader matched an offer to this accepter before the
            // cancellation took the lock. The channel it delivered would
            // otherwise be lost with this future; terminate it so the
            // remote observes the outcome instead of a silent swallow.
            if let Ok(Ok(channel)) = self.waiter.try_recv() {
                debug!(channel = channel.id(), "cancelled accepter raced a match; terminating channel");
                channel.dispose();
            }
        }
    }
}

// =============================================================================
// REGISTRY HELPERS
// =============================================================================

fn allocate_id(state: &mut StreamState) -> Result<u32, MuxError> {
    let id = state.next_channel_id.ok_or(MuxError::IdExhausted)?;
    state.next_channel_id = id.checked_add(2);
    Ok(id)
}

fn remove_offer_by_identity(state: &mut StreamState, channel: &Arc<Channel>) {
    if channel.name().is_empty() {
        return;
    }
    if let Some(queue) = state.offers_by_name.get_mut(channel.name()) {
        queue.retain(|candidate| !Arc::ptr_eq(candidate, channel));
        if queue.is_empty() {
            state.offers_by_name.remove(channel.name());
        }
    }
}

fn send_offer_frame(
    inner: &Inner,
    channel: &Arc<Channel>,
    ack: Option<oneshot::Sender<Result<(), MuxError>>>,
) {
    let payload = Bytes::copy_from_slice(channel.name().as_bytes());
    let header = encode_header(ControlCode::Offer, channel.id(), payload.len() as u32);
    let _ = inner.frames.send(WriterCommand::Frame {
        header,
        payload,
        ack,
    });
}

/// Tear the stream down once: fail every live channel and pending accepter,
/// publish the completion outcome, and stop both tasks.
fn dispose_stream(inner: &Inner, outcome: Result<(), MuxError>) {
    let (channels, acceptors) = {
        let mut state = inner.state.lock().unwrap();
        if state.disposed {
            return;
        }
        state.disposed = true;
        state.offers_by_name.clear();
        let channels: Vec<_> = state.channels.drain().map(|(_, c)| c).collect();
        let acceptors: Vec<_> = state
            .acceptors_by_name
            .drain()
            .flat_map(|(_, queue)| queue)
            .collect();
        (channels, acceptors)
    };

    let fault = match &outcome {
        Ok(()) => MuxError::StreamClosed("stream disposed".to_string()),
        Err(e) => MuxError::StreamClosed(e.to_string()),
    };
    for channel in channels {
        channel.on_stream_closed(fault.clone());
    }
    for acceptor in acceptors {
        acceptor.reject(fault.clone());
    }

    inner.completion.send_replace(Some(outcome));
    if let Some(shutdown) = inner.reader_shutdown.lock().unwrap().take() {
        let _ = shutdown.send(());
    }
    let _ = inner.frames.send(WriterCommand::Shutdown);
    debug!("stream disposed");
}

// =============================================================================
// WRITER TASK
// =============================================================================

async fn writer_loop<S: AsyncRead + AsyncWrite>(
    mut writer: WriteHalf<S>,
    mut commands: UnboundedReceiver<WriterCommand>,
    inner: Arc<Inner>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            WriterCommand::Frame {
                header,
                payload,
                ack,
            } => match io::write_frame(&mut writer, header, &payload).await {
                Ok(()) => {
                    if let Some(ack) = ack {
                        let _ = ack.send(Ok(()));
                    }
                }
                Err(e) => {
                    warn!(error = %e, "transport write failed; disposing stream");
                    if let Some(ack) = ack {
                        let _ = ack.send(Err(e.clone()));
                    }
                    dispose_stream(&inner, Err(e));
                    break;
                }
            },
            WriterCommand::Shutdown => break,
        }
    }

    let _ = writer.shutdown().await;

    // Fail any writers already queued behind the exit; later sends fail at
    // the channel and are swallowed by the notification path.
    commands.close();
    while let Ok(command) = commands.try_recv() {
        if let WriterCommand::Frame { ack: Some(ack), .. } = command {
            let _ = ack.send(Err(MuxError::StreamClosed("writer task exited".to_string())));
        }
    }
}

// =============================================================================
// READER TASK
// =============================================================================

async fn reader_loop<S: AsyncRead + AsyncWrite>(
    mut reader: ReadHalf<S>,
    mut shutdown: oneshot::Receiver<()>,
    inner: Arc<Inner>,
) {
    let outcome = loop {
        tokio::select! {
            _ = &mut shutdown => break Ok(()),
            next = io::read_frame(&mut reader) => match next {
                Ok(Some((header, payload))) => {
                    if let Err(e) = dispatch_frame(&inner, header, payload).await {
                        break Err(e);
                    }
                }
                Ok(None) => {
                    debug!("transport closed by remote");
                    break Ok(());
                }
                Err(e) => break Err(e),
            }
        }
    };

    match outcome {
        Ok(()) => dispose_stream(&inner, Ok(())),
        Err(e) => {
            warn!(error = %e, "reader failed; disposing stream");
            dispose_stream(&inner, Err(e));
        }
    }
}

async fn dispatch_frame(inner: &Inner, header: FrameHeader, payload: Bytes) -> Result<(), MuxError> {
    let Some(code) = header.control_code() else {
        trace!(code = header.code, "ignoring unknown control code");
        return Ok(());
    };
    trace!(?code, channel = header.channel_id, len = payload.len(), "dispatching frame");

    match code {
        ControlCode::Offer => on_offer(inner, header.channel_id, payload),
        ControlCode::OfferAccepted => on_offer_accepted(inner, header.channel_id),
        ControlCode::Content => {
            on_content(inner, header.channel_id, payload).await;
            Ok(())
        }
        ControlCode::ContentWritingCompleted => {
            let channel = inner.state.lock().unwrap().channels.get(&header.channel_id).cloned();
            match channel {
                Some(channel) => channel.complete_inbound(),
                None => trace!(channel = header.channel_id, "half-close for unknown channel"),
            }
            Ok(())
        }
        ControlCode::ChannelTerminated => on_channel_terminated(inner, header.channel_id),
    }
}

fn on_offer(inner: &Inner, id: u32, payload: Bytes) -> Result<(), MuxError> {
    let name = std::str::from_utf8(&payload)
        .map_err(|_| MuxError::MalformedFrame("offer name is not valid UTF-8".to_string()))?
        .to_string();

    let channel = Channel::offered_by_remote(id, name.clone(), inner.frames.clone());
    let mut matched = false;
    let mut auto_accepted = false;
    {
        let mut state = inner.state.lock().unwrap();

        if !name.is_empty() {
            if let Some(queue) = state.acceptors_by_name.get_mut(&name) {
                // Hand the offer to the oldest accepter whose one-shot is
                // still live; a cancelled accepter never swallows an offer.
                while let Some(acceptor) = queue.pop_front() {
                    if acceptor.is_abandoned() {
                        continue;
                    }
                    let options = acceptor.attachment().unwrap_or_default();
                    if acceptor.resolve(channel.clone()) {
                        // The accepter owns the channel from here on; an
                        // acceptance that cannot commit must not put the
                        // offer back up for another consumer.
                        matched = true;
                        auto_accepted = channel.try_accept(options).is_ok();
                        break;
                    }
                }
                if queue.is_empty() {
                    state.acceptors_by_name.remove(&name);
                }
            }
            if !matched {
                state
                    .offers_by_name
                    .entry(name.clone())
                    .or_default()
                    .push_back(channel.clone());
            }
        }

        state.channels.insert(id, channel.clone());
    }

    debug!(channel = id, name = %name, auto_accepted, "remote offered channel");
    let _ = inner.offers.send(ChannelOffer {
        id,
        name,
        is_accepted: auto_accepted,
    });
    Ok(())
}

fn on_offer_accepted(inner: &Inner, id: u32) -> Result<(), MuxError> {
    let channel = inner.state.lock().unwrap().channels.get(&id).cloned();
    match channel {
        Some(channel) => {
            if !channel.on_accepted() {
                // Our cancellation and their acceptance crossed in flight;
                // ChannelTerminated is already on its way to them.
                debug!(channel = id, "ignoring acceptance of a cancelled offer");
            }
            Ok(())
        }
        None => Err(MuxError::UnexpectedChannel(id)),
    }
}

async fn on_content(inner: &Inner, id: u32, payload: Bytes) {
    let channel = inner.state.lock().unwrap().channels.get(&id).cloned();
    match channel {
        // Awaiting inbound queue space here blocks the reader and pushes
        // backpressure onto the transport.
        Some(channel) => channel.receive_content(payload).await,
        None => trace!(channel = id, "discarding content for unknown channel"),
    }
}

fn on_channel_terminated(inner: &Inner, id: u32) -> Result<(), MuxError> {
    let channel = {
        let mut state = inner.state.lock().unwrap();
        let channel = state.channels.remove(&id);
        if let Some(channel) = &channel {
            remove_offer_by_identity(&mut state, channel);
        }
        channel
    };
    match channel {
        Some(channel) => channel.on_remote_terminated(),
        None => trace!(channel = id, "termination for unknown channel"),
    }
    Ok(())
}

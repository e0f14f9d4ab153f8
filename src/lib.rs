//! chanmux — channel multiplexing over a single duplex byte transport
//!
//! This library multiplexes many independent, bidirectional, ordered byte
//! streams ("channels") over one underlying full-duplex transport: a TCP
//! connection, a pipe pair, anything `AsyncRead + AsyncWrite`.
//!
//! ## Architecture
//!
//! ```text
//! Peer A                                                    Peer B
//! ┌───────────────────┐        one transport        ┌───────────────────┐
//! │ MultiplexingStream│ ◀═════════════════════════▶ │ MultiplexingStream│
//! │  ├─ channel 1     │   Offer/Accept/Content/     │  ├─ channel 1     │
//! │  ├─ channel 3     │   Terminate frames          │  ├─ channel 2     │
//! │  └─ channel 5 …   │                             │  └─ channel 4 …   │
//! └───────────────────┘                             └───────────────────┘
//! ```
//!
//! ## Protocol Overview
//!
//! 1. Both peers exchange a 20-byte handshake prelude (magic + random
//!    bytes); the comparison of the random bytes decides which peer
//!    allocates odd channel ids and which allocates even ones.
//! 2. Either peer offers channels: named (rendezvous by name) or anonymous
//!    (rendezvous by id communicated out of band).
//! 3. The other peer accepts or rejects; writes made before acceptance are
//!    buffered and flushed once the channel is accepted.
//! 4. Either side may half-close its write direction, and either side may
//!    terminate the channel.
//! 5. Frames are a 9-byte header plus a payload of at most 20480 bytes;
//!    larger writes are split across frames.
//!
//! ## Usage
//!
//! ```ignore
//! use chanmux::{ChannelOptions, MultiplexingStream, MultiplexingStreamOptions};
//!
//! let transport = tokio::net::TcpStream::connect("127.0.0.1:9000").await?;
//! let mux = MultiplexingStream::create(transport, MultiplexingStreamOptions::default()).await?;
//!
//! let channel = mux.offer_channel("log", ChannelOptions::default()).await?;
//! channel.write(b"hello").await?;
//! channel.finish_writing();
//! ```

pub mod channel;
pub(crate) mod deferred;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod io;
pub mod options;
pub mod stream;

pub use channel::{Channel, ChannelReceiver};
pub use error::{MuxError, Result};
pub use frame::{
    decode_header, encode_header, ControlCode, FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE,
};
pub use handshake::{Role, NONCE_SIZE, PROTOCOL_MAGIC};
pub use options::{ChannelOptions, MultiplexingStreamOptions, DEFAULT_INBOUND_FRAME_BUFFER};
pub use stream::{ChannelOffer, MultiplexingStream};

#[cfg(test)]
mod integration_tests;

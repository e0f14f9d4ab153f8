//! Transport handshake and role negotiation.
//!
//! On construction each peer writes a 20-byte prelude: the 4-byte protocol
//! magic followed by 16 random bytes, then reads the remote prelude. The
//! random bytes are compared byte-by-byte; the peer whose first differing
//! byte is greater becomes the "odd" party and allocates odd channel ids,
//! the other allocates even ids. Identical random bytes are a collision:
//! fatal for this session, safe to retry with a fresh transport.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::error::MuxError;

/// Protocol magic sent as the first four bytes of the handshake prelude.
pub const PROTOCOL_MAGIC: [u8; 4] = [0x2F, 0xDF, 0x1D, 0x50];

/// Number of random bytes in the handshake prelude.
pub const NONCE_SIZE: usize = 16;

/// Handshake-determined role partitioning the channel id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Allocates ids 1, 3, 5, …
    Odd,
    /// Allocates ids 2, 4, 6, …
    Even,
}

impl Role {
    /// The first channel id this role allocates.
    pub fn first_channel_id(self) -> u32 {
        match self {
            Role::Odd => 1,
            Role::Even => 2,
        }
    }
}

/// Perform the handshake with a freshly drawn random nonce.
pub async fn exchange<S: AsyncRead + AsyncWrite + Unpin>(transport: &mut S) -> Result<Role, MuxError> {
    exchange_with_nonce(transport, Uuid::new_v4().into_bytes()).await
}

/// Perform the handshake with an explicit nonce.
///
/// Split out so tests can force a role or a collision.
pub async fn exchange_with_nonce<S: AsyncRead + AsyncWrite + Unpin>(
    transport: &mut S,
    nonce: [u8; NONCE_SIZE],
) -> Result<Role, MuxError> {
    let mut prelude = [0u8; 4 + NONCE_SIZE];
    prelude[..4].copy_from_slice(&PROTOCOL_MAGIC);
    prelude[4..].copy_from_slice(&nonce);
    transport.write_all(&prelude).await?;
    transport.flush().await?;

    let mut remote = [0u8; 4 + NONCE_SIZE];
    transport.read_exact(&mut remote).await?;

    if remote[..4] != PROTOCOL_MAGIC {
        return Err(MuxError::ProtocolMismatch);
    }

    let remote_nonce = &remote[4..];
    for i in 0..NONCE_SIZE {
        if nonce[i] != remote_nonce[i] {
            return Ok(if nonce[i] > remote_nonce[i] {
                Role::Odd
            } else {
                Role::Even
            });
        }
    }

    Err(MuxError::HandshakeCollision)
}

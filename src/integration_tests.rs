//! End-to-end tests: two real peers over an in-process duplex transport,
//! plus wire-exact scenarios driven by a scripted raw peer that writes
//! handshake bytes and frames directly.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::error::MuxError;
use crate::frame::{decode_header, encode_header, ControlCode, HEADER_SIZE};
use crate::handshake::{Role, PROTOCOL_MAGIC};
use crate::options::{ChannelOptions, MultiplexingStreamOptions};
use crate::stream::MultiplexingStream;
use crate::MAX_PAYLOAD_SIZE;

async fn pair() -> (Arc<MultiplexingStream>, Arc<MultiplexingStream>) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let (a, b) = tokio::join!(
        MultiplexingStream::create(a, MultiplexingStreamOptions::default()),
        MultiplexingStream::create(b, MultiplexingStreamOptions::default()),
    );
    (Arc::new(a.unwrap()), Arc::new(b.unwrap()))
}

fn opts() -> ChannelOptions {
    ChannelOptions::default()
}

/// Handshake as a scripted peer with an all-zero nonce. The real peer's
/// nonce always contains a non-zero byte (UUIDv4 version bits), so the
/// real peer deterministically becomes the odd party.
async fn raw_handshake(server: &mut DuplexStream) {
    let mut prelude = [0u8; 20];
    prelude[..4].copy_from_slice(&PROTOCOL_MAGIC);
    server.write_all(&prelude).await.unwrap();
    let mut echo = [0u8; 20];
    server.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo[..4], &PROTOCOL_MAGIC);
}

async fn raw_read_frame(server: &mut DuplexStream) -> (ControlCode, u32, Vec<u8>) {
    let mut header = [0u8; HEADER_SIZE];
    server.read_exact(&mut header).await.unwrap();
    let header = decode_header(&header).unwrap();
    let mut payload = vec![0u8; header.payload_length as usize];
    server.read_exact(&mut payload).await.unwrap();
    (header.control_code().unwrap(), header.channel_id, payload)
}

async fn raw_write_frame(server: &mut DuplexStream, code: ControlCode, id: u32, payload: &[u8]) {
    let header = encode_header(code, id, payload.len() as u32);
    server.write_all(&header).await.unwrap();
    server.write_all(payload).await.unwrap();
}

#[tokio::test]
async fn handshake_assigns_complementary_roles() {
    let (a, b) = pair().await;
    assert_ne!(a.role(), b.role());
}

#[tokio::test]
async fn channel_ids_follow_role_parity() {
    let (a, b) = pair().await;
    let (odd, even) = if a.role() == Role::Odd { (a, b) } else { (b, a) };

    let odd_ids: Vec<u32> = (0..3).map(|_| odd.create_channel(opts()).unwrap().id()).collect();
    let even_ids: Vec<u32> = (0..3).map(|_| even.create_channel(opts()).unwrap().id()).collect();

    assert_eq!(odd_ids, vec![1, 3, 5]);
    assert_eq!(even_ids, vec![2, 4, 6]);
}

#[tokio::test]
async fn named_rendezvous_accepter_registered_first() {
    let (a, b) = pair().await;

    let accept = tokio::spawn({
        let b = b.clone();
        async move { b.accept_channel("log", opts()).await }
    });
    // Let the accepter register before the offer arrives.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let offered = a.offer_channel("log", opts()).await.unwrap();
    let accepted = accept.await.unwrap().unwrap();

    assert_eq!(offered.id(), accepted.id());
    assert!(offered.is_accepted());
    assert!(accepted.is_accepted());
}

#[tokio::test]
async fn named_rendezvous_offer_queued_first() {
    let (a, b) = pair().await;

    let offer = tokio::spawn({
        let a = a.clone();
        async move { a.offer_channel("telemetry", opts()).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let accepted = b.accept_channel("telemetry", opts()).await.unwrap();
    let offered = offer.await.unwrap().unwrap();
    assert_eq!(offered.id(), accepted.id());
}

#[tokio::test]
async fn offer_event_reports_auto_acceptance() {
    let (a, b) = pair().await;
    let mut events = b.offered_channels();

    let accept = tokio::spawn({
        let b = b.clone();
        async move { b.accept_channel("matched", opts()).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let offered = a.offer_channel("matched", opts()).await.unwrap();
    let event = events.recv().await.unwrap();
    assert_eq!(event.id, offered.id());
    assert_eq!(event.name, "matched");
    assert!(event.is_accepted);

    accept.await.unwrap().unwrap();
}

#[tokio::test]
async fn anonymous_channel_flushes_buffered_writes_on_acceptance() {
    let (a, b) = pair().await;
    let mut events = b.offered_channels();

    let channel_a = a.create_channel(opts()).unwrap();
    channel_a.write(b"hi").await.unwrap();

    let event = events.recv().await.unwrap();
    assert_eq!(event.name, "");
    assert!(!event.is_accepted);

    let channel_b = b.accept_channel_by_id(event.id, opts()).unwrap();
    let mut receiver = channel_b.take_receiver().unwrap();
    assert_eq!(receiver.recv().await.unwrap().as_ref(), b"hi");
}

#[tokio::test]
async fn channels_are_bidirectional() {
    let (a, b) = pair().await;
    let mut events = b.offered_channels();

    let channel_a = a.create_channel(opts()).unwrap();
    let event = events.recv().await.unwrap();
    let channel_b = b.accept_channel_by_id(event.id, opts()).unwrap();

    channel_a.write(b"ping").await.unwrap();
    channel_b.write(b"pong").await.unwrap();

    let mut rx_b = channel_b.take_receiver().unwrap();
    let mut rx_a = channel_a.take_receiver().unwrap();
    assert_eq!(rx_b.recv().await.unwrap().as_ref(), b"ping");
    assert_eq!(rx_a.recv().await.unwrap().as_ref(), b"pong");
}

#[tokio::test]
async fn large_writes_round_trip_across_frame_splits() {
    let (a, b) = pair().await;
    let mut events = b.offered_channels();

    let channel_a = a.create_channel(opts()).unwrap();
    let event = events.recv().await.unwrap();
    let channel_b = b.accept_channel_by_id(event.id, opts()).unwrap();

    let data: Vec<u8> = (0..(MAX_PAYLOAD_SIZE * 5 + 123)).map(|i| (i % 251) as u8).collect();

    let mut receiver = channel_b.take_receiver().unwrap();
    let expected_len = data.len();
    let reader = tokio::spawn(async move {
        let mut received = Vec::with_capacity(expected_len);
        while received.len() < expected_len {
            let chunk = receiver.recv().await.expect("stream ended early");
            assert!(chunk.len() <= MAX_PAYLOAD_SIZE);
            received.extend_from_slice(&chunk);
        }
        received
    });

    channel_a.write(&data).await.unwrap();
    let received = reader.await.unwrap();
    assert_eq!(received, data);
}

#[tokio::test]
async fn half_close_delivers_end_of_stream_and_leaves_reverse_open() {
    let (a, b) = pair().await;
    let mut events = b.offered_channels();

    let channel_a = a.create_channel(opts()).unwrap();
    let event = events.recv().await.unwrap();
    let channel_b = b.accept_channel_by_id(event.id, opts()).unwrap();

    channel_b.write(b"abc").await.unwrap();
    channel_b.finish_writing();

    let mut rx_a = channel_a.take_receiver().unwrap();
    assert_eq!(rx_a.recv().await.unwrap().as_ref(), b"abc");
    assert!(rx_a.recv().await.is_none());

    // The other direction is still writable.
    channel_a.write(b"reply").await.unwrap();
    let mut rx_b = channel_b.take_receiver().unwrap();
    assert_eq!(rx_b.recv().await.unwrap().as_ref(), b"reply");
}

#[tokio::test]
async fn reject_channel_fails_the_pending_offer() {
    let (a, b) = pair().await;
    let mut events = b.offered_channels();

    let offer = tokio::spawn({
        let a = a.clone();
        async move { a.offer_channel("x", opts()).await }
    });

    let event = events.recv().await.unwrap();
    b.reject_channel(event.id).unwrap();

    assert!(matches!(offer.await.unwrap(), Err(MuxError::OfferRejected)));
    assert!(matches!(
        b.accept_channel_by_id(event.id, opts()),
        Err(MuxError::UnknownChannel(_))
    ));
}

#[tokio::test]
async fn fifo_rendezvous_matches_offers_in_arrival_order() {
    let (a, b) = pair().await;
    let mut events = b.offered_channels();

    let first = tokio::spawn({
        let a = a.clone();
        async move { a.offer_channel("q", opts()).await }
    });
    let first_event = events.recv().await.unwrap();

    let second = tokio::spawn({
        let a = a.clone();
        async move { a.offer_channel("q", opts()).await }
    });
    let second_event = events.recv().await.unwrap();

    let c1 = b.accept_channel("q", opts()).await.unwrap();
    let c2 = b.accept_channel("q", opts()).await.unwrap();
    assert_eq!(c1.id(), first_event.id);
    assert_eq!(c2.id(), second_event.id);

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancelled_accepter_does_not_consume_an_offer() {
    let (a, b) = pair().await;

    let accept = tokio::spawn({
        let b = b.clone();
        async move { b.accept_channel("z", opts()).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    accept.abort();
    let _ = accept.await;

    let mut events = b.offered_channels();
    let offer = tokio::spawn({
        let a = a.clone();
        async move { a.offer_channel("z", opts()).await }
    });

    let event = events.recv().await.unwrap();
    assert!(!event.is_accepted, "cancelled accepter must not match");

    let channel = b.accept_channel("z", opts()).await.unwrap();
    assert_eq!(channel.id(), event.id);
    offer.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_accepter_cancellation_never_swallows_offers() {
    let (a, b) = pair().await;

    for round in 0..10u32 {
        let name = format!("race-{round}");

        let accept = tokio::spawn({
            let b = b.clone();
            let name = name.clone();
            async move { b.accept_channel(&name, opts()).await }
        });
        let offer = tokio::spawn({
            let a = a.clone();
            let name = name.clone();
            async move { a.offer_channel(&name, opts()).await }
        });

        // Cancel the accepter while the offer may be anywhere between the
        // wire and the rendezvous queue.
        accept.abort();
        let _ = accept.await;

        // The offer is never lost. Either the (possibly cancelled) accepter
        // consumed it, in which case the offer future resolves on its own
        // and the drain below times out, or it was buffered unmatched and
        // the drain picks it up.
        let drained = tokio::time::timeout(
            Duration::from_millis(500),
            b.accept_channel(&name, opts()),
        )
        .await;
        let offered = offer.await.unwrap().unwrap();
        if let Ok(drained) = drained {
            assert_eq!(drained.unwrap().id(), offered.id());
        }
    }

    assert!(!a.is_disposed());
    assert!(!b.is_disposed());
}

#[tokio::test]
async fn dispose_fails_pending_work_and_resolves_completion() {
    let (a, b) = pair().await;

    let pending_offer = tokio::spawn({
        let a = a.clone();
        async move { a.offer_channel("w", opts()).await }
    });
    let pending_accept = tokio::spawn({
        let a = a.clone();
        async move { a.accept_channel("never", opts()).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    a.dispose();

    assert!(matches!(pending_offer.await.unwrap(), Err(MuxError::StreamClosed(_))));
    assert!(matches!(pending_accept.await.unwrap(), Err(MuxError::StreamClosed(_))));
    assert!(a.closed().await.is_ok());
    assert!(a.is_disposed());

    assert!(matches!(a.create_channel(opts()), Err(MuxError::AlreadyDisposed)));
    assert!(matches!(
        a.accept_channel_by_id(1, opts()),
        Err(MuxError::AlreadyDisposed)
    ));
    assert!(matches!(a.reject_channel(1), Err(MuxError::AlreadyDisposed)));
    assert!(matches!(
        a.offer_channel("late", opts()).await,
        Err(MuxError::AlreadyDisposed)
    ));

    // The remote observes the transport closing and completes cleanly.
    assert!(b.closed().await.is_ok());
}

#[tokio::test]
async fn dispose_propagates_stream_closed_to_live_channels() {
    let (a, b) = pair().await;
    let mut events = b.offered_channels();

    let channel_a = a.create_channel(opts()).unwrap();
    let event = events.recv().await.unwrap();
    let channel_b = b.accept_channel_by_id(event.id, opts()).unwrap();

    a.dispose();

    assert!(matches!(
        channel_a.completion().await,
        Err(MuxError::StreamClosed(_))
    ));
    // The remote peer's channel dies with the remote stream.
    b.closed().await.unwrap();
    assert!(matches!(
        channel_b.completion().await,
        Err(MuxError::StreamClosed(_))
    ));
    assert!(matches!(channel_a.write(b"x").await, Err(MuxError::ChannelClosed)));
}

#[tokio::test]
async fn offer_name_length_is_validated() {
    let (a, _b) = pair().await;
    let long = "n".repeat(MAX_PAYLOAD_SIZE + 1);
    assert!(matches!(
        a.offer_channel(&long, opts()).await,
        Err(MuxError::NameTooLong { .. })
    ));
}

// =============================================================================
// WIRE-EXACT SCENARIOS (scripted raw peer)
// =============================================================================

#[tokio::test]
async fn cancelled_offer_absorbs_crossing_acceptance() {
    let (client, mut server) = tokio::io::duplex(64 * 1024);
    let (stream, _) = tokio::join!(
        MultiplexingStream::create(client, MultiplexingStreamOptions::default()),
        raw_handshake(&mut server),
    );
    let a = Arc::new(stream.unwrap());
    assert_eq!(a.role(), Role::Odd);

    let offer = tokio::spawn({
        let a = a.clone();
        async move { a.offer_channel("x", opts()).await }
    });

    let (code, id, payload) = raw_read_frame(&mut server).await;
    assert_eq!(code, ControlCode::Offer);
    assert_eq!(id, 1);
    assert_eq!(payload, b"x");

    // Cancel the offer while the remote's acceptance is in flight.
    offer.abort();
    let _ = offer.await;

    let (code, id, _) = raw_read_frame(&mut server).await;
    assert_eq!(code, ControlCode::ChannelTerminated);
    assert_eq!(id, 1);

    // The crossing acceptance arrives after the local cancellation; it must
    // be absorbed silently. The probe offer behind it proves the reader
    // survived.
    let mut events = a.offered_channels();
    raw_write_frame(&mut server, ControlCode::OfferAccepted, 1, b"").await;
    raw_write_frame(&mut server, ControlCode::Offer, 2, b"probe").await;

    let event = events.recv().await.unwrap();
    assert_eq!(event.id, 2);
    assert_eq!(event.name, "probe");
    assert!(!a.is_disposed());

    // Ids are never reused: the next local offer takes 3.
    let next = a.create_channel(opts()).unwrap();
    assert_eq!(next.id(), 3);
    let (code, id, _) = raw_read_frame(&mut server).await;
    assert_eq!(code, ControlCode::Offer);
    assert_eq!(id, 3);
}

#[tokio::test]
async fn acceptance_of_unknown_channel_is_fatal() {
    let (client, mut server) = tokio::io::duplex(64 * 1024);
    let (stream, _) = tokio::join!(
        MultiplexingStream::create(client, MultiplexingStreamOptions::default()),
        raw_handshake(&mut server),
    );
    let a = stream.unwrap();

    raw_write_frame(&mut server, ControlCode::OfferAccepted, 99, b"").await;

    assert!(matches!(
        a.closed().await,
        Err(MuxError::UnexpectedChannel(99))
    ));
}

#[tokio::test]
async fn oversized_payload_length_is_fatal() {
    let (client, mut server) = tokio::io::duplex(64 * 1024);
    let (stream, _) = tokio::join!(
        MultiplexingStream::create(client, MultiplexingStreamOptions::default()),
        raw_handshake(&mut server),
    );
    let a = stream.unwrap();

    let mut header = encode_header(ControlCode::Content, 1, 0);
    header[5..9].copy_from_slice(&((MAX_PAYLOAD_SIZE as u32) + 1).to_be_bytes());
    server.write_all(&header).await.unwrap();

    assert!(matches!(a.closed().await, Err(MuxError::MalformedFrame(_))));
}

#[tokio::test]
async fn unknown_control_codes_are_skipped() {
    let (client, mut server) = tokio::io::duplex(64 * 1024);
    let (stream, _) = tokio::join!(
        MultiplexingStream::create(client, MultiplexingStreamOptions::default()),
        raw_handshake(&mut server),
    );
    let a = stream.unwrap();
    let mut events = a.offered_channels();

    // A reserved frame with a payload, then a valid offer behind it.
    let mut unknown = [0u8; HEADER_SIZE];
    unknown[0] = 9;
    unknown[5..9].copy_from_slice(&4u32.to_be_bytes());
    server.write_all(&unknown).await.unwrap();
    server.write_all(b"skip").await.unwrap();
    raw_write_frame(&mut server, ControlCode::Offer, 2, b"after").await;

    let event = events.recv().await.unwrap();
    assert_eq!(event.name, "after");
    assert!(!a.is_disposed());
}

#[tokio::test]
async fn content_for_terminated_channel_is_discarded() {
    let (client, mut server) = tokio::io::duplex(64 * 1024);
    let (stream, _) = tokio::join!(
        MultiplexingStream::create(client, MultiplexingStreamOptions::default()),
        raw_handshake(&mut server),
    );
    let a = Arc::new(stream.unwrap());
    let mut events = a.offered_channels();

    // Remote offers, we accept, remote terminates, then late content for
    // the now-unknown id arrives followed by a probe offer.
    raw_write_frame(&mut server, ControlCode::Offer, 2, b"tmp").await;
    let event = events.recv().await.unwrap();
    let channel = a.accept_channel_by_id(event.id, opts()).unwrap();
    let (code, _, _) = raw_read_frame(&mut server).await;
    assert_eq!(code, ControlCode::OfferAccepted);

    raw_write_frame(&mut server, ControlCode::ChannelTerminated, 2, b"").await;
    raw_write_frame(&mut server, ControlCode::Content, 2, b"late").await;
    raw_write_frame(&mut server, ControlCode::Offer, 4, b"probe").await;

    let probe = events.recv().await.unwrap();
    assert_eq!(probe.name, "probe");
    assert!(!a.is_disposed());
    assert!(channel.completion().await.is_ok());
}

#[tokio::test]
async fn remote_transport_closure_completes_the_stream() {
    let (client, mut server) = tokio::io::duplex(64 * 1024);
    let (stream, _) = tokio::join!(
        MultiplexingStream::create(client, MultiplexingStreamOptions::default()),
        raw_handshake(&mut server),
    );
    let a = stream.unwrap();

    drop(server);

    assert!(a.closed().await.is_ok());
    assert!(a.is_disposed());
}

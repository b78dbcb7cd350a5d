//! Exercises `gracht::Client` against an in-process loopback link: message id
//! monotonicity, the connect-once invariant, and the `Any`/`All` semantics of
//! `await_multiple`. No real transport is involved — `gracht-network`'s
//! `end_to_end` test covers that over real sockets.

use std::sync::mpsc;
use std::time::Duration;

use gracht::client::AwaitMode;
use gracht::config::ClientConfig;
use gracht::protocol::ProtocolTable;
use gracht::wire::{Header, MessageClass};
use gracht::{Client, ClientError, ClientLink, LinkError};

struct LoopbackLink {
    inbound: mpsc::Receiver<(Header, Vec<u8>)>,
    outbound: mpsc::Sender<(Header, Vec<u8>)>,
}

impl ClientLink for LoopbackLink {
    fn send(&mut self, header: &Header, payload: &[u8]) -> Result<(), LinkError> {
        self.outbound.send((*header, payload.to_vec())).unwrap();
        Ok(())
    }

    fn recv(&mut self) -> Result<(Header, Vec<u8>), LinkError> {
        self.inbound.try_recv().map_err(|_| LinkError::WouldBlock)
    }
}

fn response_for(header: &Header, payload: Vec<u8>) -> (Header, Vec<u8>) {
    let response = Header {
        message_id: header.message_id,
        length: payload.len() as u32,
        service_id: header.service_id,
        action_id: header.action_id,
        flags: MessageClass::Response.to_flags(),
    };
    (response, payload)
}

fn loopback_client() -> (Client, mpsc::Sender<(Header, Vec<u8>)>, mpsc::Receiver<(Header, Vec<u8>)>) {
    let (reply_tx, reply_rx) = mpsc::channel();
    let (sent_tx, sent_rx) = mpsc::channel();
    let link = LoopbackLink { inbound: reply_rx, outbound: sent_tx };
    let client = Client::new(Box::new(link), ProtocolTable::new(), ClientConfig::new());
    client.connect().expect("first connect should succeed");
    (client, reply_tx, sent_rx)
}

#[test]
fn message_ids_are_strictly_increasing_across_invocations() {
    let (client, _reply_tx, sent_rx) = loopback_client();

    let ids: Vec<u32> = (0..5).map(|_| client.invoke(1, 1, MessageClass::Event, &[]).unwrap()).collect();
    for pair in ids.windows(2) {
        assert!(pair[1] > pair[0], "message ids must strictly increase: {pair:?}");
    }

    let observed: Vec<u32> = (0..5).map(|_| sent_rx.recv().unwrap().0.message_id).collect();
    assert_eq!(observed, ids, "ids sent over the link must match the ids returned to the caller");
}

#[test]
fn only_one_pumper_runs_at_a_time() {
    let (client, _reply_tx, _sent_rx) = loopback_client();

    // A second connect attempt must not spawn a second pumper thread; the
    // single-pumper invariant is enforced by rejecting the call outright.
    assert!(matches!(client.connect(), Err(ClientError::AlreadyConnected)));
    assert!(matches!(client.connect(), Err(ClientError::AlreadyConnected)));
}

#[test]
fn invoke_without_connecting_is_rejected() {
    let (reply_tx, reply_rx) = mpsc::channel();
    let (sent_tx, _sent_rx) = mpsc::channel();
    let link = LoopbackLink { inbound: reply_rx, outbound: sent_tx };
    let client = Client::new(Box::new(link), ProtocolTable::new(), ClientConfig::new());
    drop(reply_tx);

    assert!(matches!(client.invoke(1, 1, MessageClass::Sync, &[]), Err(ClientError::NotConnected)));
}

#[test]
fn await_multiple_any_returns_on_the_first_terminal_descriptor() {
    let (client, reply_tx, sent_rx) = loopback_client();

    let a = client.invoke(1, 1, MessageClass::Sync, b"a").unwrap();
    let b = client.invoke(1, 1, MessageClass::Sync, b"b").unwrap();
    sent_rx.recv().unwrap();
    let (header_b, payload_b) = sent_rx.recv().unwrap();
    assert_eq!(header_b.message_id, b);

    reply_tx.send(response_for(&header_b, payload_b)).unwrap();

    let statuses = client.await_multiple(&[a, b], AwaitMode::Any);
    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().any(|s| *s == gracht::client::MessageStatus::Completed));

    // await_multiple only peeked; the entry is still there to collect once,
    // and gone on a second finalize.
    assert_eq!(client.status_finalize(b), Some(gracht::client::MessageStatus::Completed));
    assert_eq!(client.status_finalize(b), None);

    // `a` is still outstanding; finalizing it should not panic even though
    // it never resolved during this test.
    client.status_finalize(a);
}

#[test]
fn await_multiple_all_waits_for_every_descriptor() {
    let (client, reply_tx, sent_rx) = loopback_client();

    let a = client.invoke(1, 1, MessageClass::Sync, b"a").unwrap();
    let b = client.invoke(1, 1, MessageClass::Sync, b"b").unwrap();

    let responder = std::thread::spawn(move || {
        for _ in 0..2 {
            let (header, payload) = sent_rx.recv().unwrap();
            std::thread::sleep(Duration::from_millis(5));
            reply_tx.send(response_for(&header, payload)).unwrap();
        }
    });

    let statuses = client.await_multiple(&[a, b], AwaitMode::All);
    assert_eq!(statuses, vec![gracht::client::MessageStatus::Completed, gracht::client::MessageStatus::Completed]);
    responder.join().unwrap();
}

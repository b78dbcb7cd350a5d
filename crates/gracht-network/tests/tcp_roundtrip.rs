use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    thread,
    time::Duration,
};

use gracht::wire::{Header, MessageClass};
use gracht_network::tcp::{PollEvent, SendBehavior, TcpConnector};

fn header(message_id: u32) -> Header {
    Header { message_id, length: 0, service_id: 1, action_id: 1, flags: MessageClass::Sync.to_flags() }
}

#[test]
fn tcp_roundtrip() {
    let bind_addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 24712));

    let mut listener = TcpConnector::default();
    let _listening_token = listener.listen_at(bind_addr).unwrap();

    let server = thread::spawn(move || {
        let mut accepted_stream = None;

        while accepted_stream.is_none() {
            listener.poll_with(|event| match event {
                PollEvent::Accept { stream, .. } => accepted_stream = Some(stream),
                PollEvent::Message { .. } => panic!("shouldn't have gotten here"),
                _ => {}
            });
        }

        let stream_token = accepted_stream.unwrap();

        let mut recv = None;
        loop {
            listener.poll_with(|event| {
                if let PollEvent::Message { token, payload, .. } = event {
                    assert_eq!(token, stream_token);
                    recv = Some(u32::from_le_bytes(payload.try_into().unwrap()));
                }
            });
            if recv.is_some() {
                break;
            }
            thread::sleep(Duration::from_micros(50));
        }
        listener.write_or_enqueue_with(&header(2), SendBehavior::Single(stream_token), |buf| {
            buf.extend_from_slice(&111u32.to_le_bytes());
        });
        listener.poll_with(|event| {
            if let PollEvent::Message { .. } = event {
                panic!("shouldn't have gotten here");
            }
        });
        assert_eq!(recv, Some(222));
    });

    let client = thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(10));
        let mut conn = TcpConnector::default();
        let tok = conn.connect(bind_addr).unwrap();
        conn.write_or_enqueue_with(&header(1), SendBehavior::Single(tok), |buf| {
            buf.extend_from_slice(&222u32.to_le_bytes());
        });

        let mut recv = None;
        loop {
            conn.poll_with(|event| {
                if let PollEvent::Message { payload, .. } = event {
                    recv = Some(u32::from_le_bytes(payload.try_into().unwrap()));
                }
            });
            if recv.is_some() {
                break;
            }
            thread::sleep(Duration::from_micros(50));
        }
        assert_eq!(recv, Some(111));
    });

    server.join().unwrap();
    client.join().unwrap();
}

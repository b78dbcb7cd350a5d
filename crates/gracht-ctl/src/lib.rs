//! Library half of `gracht-ctl`: connects to a running gracht server over
//! TCP and drives the built-in control protocol (subscribe/unsubscribe)
//! plus a generic event listener, so the binary itself stays a thin
//! argument-parsing shell.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gracht::config::ClientConfig;
use gracht::control::{self, SubscriptionRequest};
use gracht::protocol::{Action, Protocol, ProtocolTable};
use gracht::wire::MessageClass;
use gracht::{Client, ClientError};
use gracht_network::TcpClientLink;
use tracing::info;

/// Connects to `addr`, registering a protocol table that only understands
/// the built-in control protocol (callers needing application events
/// should build their own `ProtocolTable` and use [`Client`] directly).
pub fn connect(addr: SocketAddr) -> Result<Client, ClientError> {
    let link = TcpClientLink::connect(addr)?;
    let client = Client::new(Box::new(link), ProtocolTable::new(), ClientConfig::new());
    client.connect()?;
    Ok(client)
}

/// Connects and registers a handler that prints every event received on
/// `service_id`, then subscribes to it. Blocks until Ctrl-C (via `running`
/// being cleared) or the link breaks.
pub fn listen(addr: SocketAddr, service_id: u8, running: Arc<AtomicBool>) -> Result<(), ClientError> {
    let mut protocols = ProtocolTable::new();
    protocols.register(Protocol::new(service_id, "listened-service").with_action(Action::new(
        0xFF,
        "catch-all",
        move |header, reader, _client| {
            info!(action_id = header.action_id, bytes = reader.remaining().len(), "event received");
        },
    )));

    let link = TcpClientLink::connect(addr)?;
    let client = Client::new(Box::new(link), protocols, ClientConfig::new());
    client.connect()?;
    client.invoke(
        control::CONTROL_SERVICE_ID,
        control::ACTION_SUBSCRIBE,
        MessageClass::Event,
        &SubscriptionRequest { service_id }.encode(),
    )?;

    info!(service_id, "subscribed, waiting for events (ctrl-c to stop)");
    while running.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(100));
    }
    Ok(())
}

/// Sends a one-shot subscribe or unsubscribe control invocation and returns
/// without waiting for any response (subscribe/unsubscribe are fire-and-forget
/// events, not RPCs).
pub fn subscribe(addr: SocketAddr, service_id: u8) -> Result<(), ClientError> {
    let client = connect(addr)?;
    client.invoke(
        control::CONTROL_SERVICE_ID,
        control::ACTION_SUBSCRIBE,
        MessageClass::Event,
        &SubscriptionRequest { service_id }.encode(),
    )?;
    Ok(())
}

pub fn unsubscribe(addr: SocketAddr, service_id: u8) -> Result<(), ClientError> {
    let client = connect(addr)?;
    client.invoke(
        control::CONTROL_SERVICE_ID,
        control::ACTION_UNSUBSCRIBE,
        MessageClass::Event,
        &SubscriptionRequest { service_id }.encode(),
    )?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use gracht::config::ServerConfig;
    use gracht::Server;
    use gracht_network::TcpServerLink;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::mpsc;

    #[test]
    fn subscribe_reaches_a_running_server() {
        let addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 25_900));
        let link = TcpServerLink::bind(addr).expect("failed to bind test server");
        let server = Arc::new(Server::new(Box::new(link), ProtocolTable::new(), ServerConfig::new().with_worker_count(0)));

        let runner = server.clone();
        let handle = std::thread::spawn(move || runner.run());

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            tx.send(subscribe(addr, 7)).unwrap();
        });

        rx.recv_timeout(Duration::from_secs(2)).expect("subscribe call timed out").expect("subscribe failed");

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while std::time::Instant::now() < deadline && server.client_count() == 0 {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(server.client_count(), 1);

        server.stop();
        handle.join().unwrap();
    }
}

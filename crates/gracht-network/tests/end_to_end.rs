//! Exercises the full client/server stack over real TCP sockets: a
//! synchronous call that gets answered, a subscribed client receiving a
//! broadcast event, an unsubscribed client receiving nothing, and an
//! unknown action producing a control error event instead of silence.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use gracht::config::{ClientConfig, ServerConfig};
use gracht::control::{self, ControlError, SubscriptionRequest};
use gracht::protocol::{Action, Protocol, ProtocolTable};
use gracht::wire::MessageClass;
use gracht::{Client, Server};
use gracht_network::{TcpClientLink, TcpServerLink};

const ECHO_SERVICE: u8 = 1;
const ECHO_ACTION: u8 = 1;
const TICKER_SERVICE: u8 = 2;
const TICK_ACTION: u8 = 1;

static NEXT_PORT: AtomicU16 = AtomicU16::new(25_700);

fn next_addr() -> SocketAddr {
    let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
    SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), port))
}

fn connect_client(addr: SocketAddr, protocols: ProtocolTable) -> Client {
    // The listener needs a moment to bind before a client can connect to it.
    let mut last_err = None;
    for _ in 0..50 {
        match TcpClientLink::connect(addr) {
            Ok(link) => {
                let client = Client::new(Box::new(link), protocols, ClientConfig::new());
                client.connect().expect("freshly constructed client should not already be connected");
                return client;
            }
            Err(err) => {
                last_err = Some(err);
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
    panic!("failed to connect to {addr}: {last_err:?}");
}

fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not met within {timeout:?}");
}

/// Scenarios 4/5: a sync call gets answered over a real socket, and a
/// broadcast event reaches only the client subscribed to its service.
#[test]
fn sync_call_is_answered_and_events_fan_out_by_subscription() {
    let addr = next_addr();
    let link = TcpServerLink::bind(addr).expect("failed to bind server link");

    // The echo handler needs the server's dispatcher to respond, but the
    // dispatcher only exists once `Server::new` has consumed the protocol
    // table, so the handle is filled in right after construction.
    let server_slot: Arc<OnceLock<Arc<Server>>> = Arc::new(OnceLock::new());
    let mut protocols = ProtocolTable::new();
    {
        let server_slot = server_slot.clone();
        protocols.register(Protocol::new(ECHO_SERVICE, "echo").with_action(Action::new(
            ECHO_ACTION,
            "echo",
            move |header, reader, client| {
                if let Some(server) = server_slot.get() {
                    let _ = server.dispatcher().respond(client, header, reader.remaining());
                }
            },
        )));
    }

    let server = Arc::new(Server::new(Box::new(link), protocols, ServerConfig::new().with_worker_count(0)));
    server_slot.set(server.clone()).ok();

    let runner = server.clone();
    let handle = std::thread::spawn(move || runner.run());

    let subscriber_events = Arc::new(Mutex::new(Vec::new()));
    let subscriber_protocols = ticker_protocols(subscriber_events.clone());
    let idle_events = Arc::new(Mutex::new(Vec::new()));
    let idle_protocols = ticker_protocols(idle_events.clone());

    let subscriber = connect_client(addr, subscriber_protocols);
    let idle_client = connect_client(addr, idle_protocols);

    // Subscribing requires the server to already have created a client
    // record for the connecting socket (see `Dispatcher::invoke_control_action`).
    wait_for(Duration::from_secs(2), || server.client_count() >= 2);

    subscriber
        .invoke(
            control::CONTROL_SERVICE_ID,
            control::ACTION_SUBSCRIBE,
            MessageClass::Event,
            &SubscriptionRequest { service_id: TICKER_SERVICE }.encode(),
        )
        .expect("failed to send subscribe request");

    let reply = subscriber.call(ECHO_SERVICE, ECHO_ACTION, b"ping").expect("echo call failed");
    assert_eq!(reply, b"ping");

    // Give the subscribe control message time to reach the dispatcher.
    std::thread::sleep(Duration::from_millis(200));

    server.dispatcher().broadcast_event(TICKER_SERVICE, TICK_ACTION, b"tick-1");

    wait_for(Duration::from_secs(2), || !subscriber_events.lock().unwrap().is_empty());
    std::thread::sleep(Duration::from_millis(200));

    assert_eq!(subscriber_events.lock().unwrap().as_slice(), &[b"tick-1".to_vec()]);
    assert!(idle_events.lock().unwrap().is_empty(), "unsubscribed client should not observe the broadcast");

    drop(idle_client);
    server.stop();
    handle.join().unwrap();
}

fn ticker_protocols(events: Arc<Mutex<Vec<Vec<u8>>>>) -> ProtocolTable {
    let mut table = ProtocolTable::new();
    table.register(Protocol::new(TICKER_SERVICE, "ticker").with_action(Action::new(
        TICK_ACTION,
        "tick",
        move |_header, reader, _client| {
            events.lock().unwrap().push(reader.remaining().to_vec());
        },
    )));
    table
}

/// Scenario 6: an invocation naming an action nobody registered gets
/// answered with a control error event rather than silently dropped.
#[test]
fn unknown_action_yields_control_error() {
    let addr = next_addr();
    let link = TcpServerLink::bind(addr).expect("failed to bind server link");
    let server = Arc::new(Server::new(Box::new(link), ProtocolTable::new(), ServerConfig::new().with_worker_count(0)));

    let runner = server.clone();
    let handle = std::thread::spawn(move || runner.run());

    let errors = Arc::new(Mutex::new(Vec::new()));
    let protocols = {
        let errors = errors.clone();
        let mut table = ProtocolTable::new();
        table.register(Protocol::new(control::CONTROL_SERVICE_ID, "control").with_action(Action::new(
            control::ACTION_ERROR_EVENT,
            "error",
            move |_header, reader, _client| {
                if let Some(err) = ControlError::decode(reader.remaining()) {
                    errors.lock().unwrap().push(err);
                }
            },
        )));
        table
    };

    let client = connect_client(addr, protocols);
    let message_id = client
        .invoke(99, 99, MessageClass::Sync, b"nobody handles this")
        .expect("failed to send invocation for an unregistered action");

    wait_for(Duration::from_secs(2), || !errors.lock().unwrap().is_empty());

    let seen = errors.lock().unwrap().clone();
    assert_eq!(seen, vec![ControlError { message_id, code: -1 }]);

    drop(client);
    server.stop();
    handle.join().unwrap();
}

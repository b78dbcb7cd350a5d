//! The client runtime: owns a single [`ClientLink`], mints message ids, and
//! drives a background thread that pumps the link so callers of
//! [`Client::invoke`]/[`Client::wait_message`] never have to drive I/O
//! themselves. `runtime/client.c` instead expects the embedder to call into
//! a single "process messages" entry point from one thread at a time; a
//! dedicated pumper thread is the idiomatic Rust equivalent of that
//! single-pumper invariant.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use crate::client::awaiter::{AwaitMode, Awaiter};
use crate::client::inflight::MessageStatus;
use crate::config::ClientConfig;
use crate::error::{ClientError, LinkError};
use crate::link::ClientLink;
use crate::protocol::{Protocol, ProtocolTable};
use crate::wire::{Header, MessageClass};

/// A client. `new` only constructs it; call [`Client::connect`] to start the
/// pumper thread, matching `gracht_client_create` being a distinct step from
/// `gracht_client_connect` in the original. Cloning the link/awaiter/
/// protocol table (not the `Client` itself — it isn't `Clone`) shares them
/// across the pumper and every caller thread.
pub struct Client {
    awaiter: Arc<Awaiter>,
    link: Arc<Mutex<Box<dyn ClientLink>>>,
    protocols: Arc<RwLock<ProtocolTable>>,
    next_message_id: Arc<AtomicU32>,
    config: ClientConfig,
    shutdown: Arc<AtomicBool>,
    connected: AtomicBool,
    pumper: Mutex<Option<JoinHandle<()>>>,
    /// Staging buffer for outbound payloads when the caller supplied one via
    /// [`ClientConfig::with_send_buffer`], so `invoke` doesn't need to trust
    /// the lifetime of the caller's own slice across the send call.
    scratch: Mutex<Vec<u8>>,
}

impl Client {
    /// Takes ownership of `link` without starting I/O. Call
    /// [`Client::connect`] before sending anything.
    pub fn new(link: Box<dyn ClientLink>, protocols: ProtocolTable, config: ClientConfig) -> Self {
        let scratch = Mutex::new(config.send_buffer.clone().unwrap_or_default());
        Self {
            awaiter: Arc::new(Awaiter::new()),
            link: Arc::new(Mutex::new(link)),
            protocols: Arc::new(RwLock::new(protocols)),
            next_message_id: Arc::new(AtomicU32::new(1)),
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            connected: AtomicBool::new(false),
            pumper: Mutex::new(None),
            scratch,
        }
    }

    /// Starts the pumper thread. Calling it twice is `ClientError::AlreadyConnected`.
    pub fn connect(&self) -> Result<(), ClientError> {
        let mut pumper = self.pumper.lock().unwrap();
        if pumper.is_some() {
            return Err(ClientError::AlreadyConnected);
        }

        let awaiter = self.awaiter.clone();
        let link = self.link.clone();
        let protocols = self.protocols.clone();
        let shutdown = self.shutdown.clone();
        let receive_buffer_size = self.config.receive_buffer_size;
        *pumper = Some(std::thread::spawn(move || pump_loop(link, awaiter, protocols, shutdown, receive_buffer_size)));
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    fn mint_message_id(&self) -> u32 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends an invocation and, for `Sync`/`Async` classes, registers it in
    /// the in-flight table before the send so a response racing the
    /// registration can never be missed.
    pub fn invoke(&self, service_id: u8, action_id: u8, class: MessageClass, payload: &[u8]) -> Result<u32, ClientError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(ClientError::NotConnected);
        }
        if payload.len() + crate::wire::HEADER_SIZE > self.config.max_message_size {
            return Err(ClientError::InvalidArgument);
        }

        let message_id = self.mint_message_id();
        if class != MessageClass::Event {
            self.awaiter.begin(message_id);
        }

        let header = Header {
            message_id,
            length: payload.len() as u32,
            service_id,
            action_id,
            flags: class.to_flags(),
        };

        let mut link = self.link.lock().unwrap();
        let result = if self.config.send_buffer.is_some() {
            let mut scratch = self.scratch.lock().unwrap();
            scratch.clear();
            scratch.extend_from_slice(payload);
            link.send(&header, &scratch)
        } else {
            link.send(&header, payload)
        };
        drop(link);

        if let Err(err) = result {
            if class != MessageClass::Event {
                self.awaiter.cancel(message_id);
            }
            return Err(err.into());
        }
        Ok(message_id)
    }

    /// Convenience wrapper for `Sync` invocations: sends and blocks for the
    /// response.
    pub fn call(&self, service_id: u8, action_id: u8, payload: &[u8]) -> Result<Vec<u8>, ClientError> {
        let message_id = self.invoke(service_id, action_id, MessageClass::Sync, payload)?;
        self.wait_message(message_id).ok_or(ClientError::NotConnected)
    }

    /// Blocks until `message_id`'s response arrives or the link fails.
    pub fn wait_message(&self, message_id: u32) -> Option<Vec<u8>> {
        self.awaiter.wait(message_id)
    }

    pub fn wait_message_timeout(&self, message_id: u32, timeout: Duration) -> Option<Option<Vec<u8>>> {
        self.awaiter.wait_timeout(message_id, timeout)
    }

    /// Blocks until `mode`'s condition over `message_ids` holds (`Any`: one
    /// terminal; `All`: every terminal), returning each descriptor's status
    /// without consuming it. Collect payloads afterward with
    /// `wait_message`/`status_finalize`.
    pub fn await_multiple(&self, message_ids: &[u32], mode: AwaitMode) -> Vec<MessageStatus> {
        self.awaiter.await_multiple(message_ids, mode)
    }

    /// Peeks a message's status. A `Failed` entry is removed and freed as a
    /// side effect of peeking it, since it carries no payload to collect.
    pub fn status(&self, message_id: u32) -> Option<MessageStatus> {
        self.awaiter.status(message_id)
    }

    /// Unconditionally removes and frees an in-flight entry. Idempotent.
    pub fn status_finalize(&self, message_id: u32) -> Option<MessageStatus> {
        self.awaiter.status_finalize(message_id)
    }

    /// Registers a protocol's actions for dispatch, replacing any existing
    /// registration under the same `service_id`. Can be called any time
    /// after construction, matching `gracht_client_register_protocol`'s
    /// post-construction registration.
    pub fn register_protocol(&self, protocol: Protocol) {
        self.protocols.write().unwrap().register(protocol);
    }

    pub fn unregister_protocol(&self, service_id: u8) {
        self.protocols.write().unwrap().unregister(service_id);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.pumper.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn pump_loop(
    link: Arc<Mutex<Box<dyn ClientLink>>>,
    awaiter: Arc<Awaiter>,
    protocols: Arc<RwLock<ProtocolTable>>,
    shutdown: Arc<AtomicBool>,
    receive_buffer_size: Option<usize>,
) {
    while !shutdown.load(Ordering::Acquire) {
        let received = link.lock().unwrap().recv();
        match received {
            Ok((header, payload)) => {
                if let Some(limit) = receive_buffer_size {
                    if payload.len() > limit {
                        warn!(len = payload.len(), limit, "dropping message larger than the configured receive buffer");
                        continue;
                    }
                }
                route(&header, payload, &awaiter, &protocols);
            }
            Err(LinkError::WouldBlock) => std::thread::sleep(Duration::from_millis(1)),
            Err(LinkError::BrokenPipe) => {
                warn!("client link disconnected, failing in-flight invocations");
                break;
            }
            Err(err) => {
                debug!(?err, "client link recv error");
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

fn route(header: &Header, payload: Vec<u8>, awaiter: &Awaiter, protocols: &RwLock<ProtocolTable>) {
    match header.class() {
        MessageClass::Response => awaiter.complete(header.message_id, payload),
        MessageClass::Event => {
            protocols.read().unwrap().dispatch(header, &payload, 0);
        }
        MessageClass::Sync | MessageClass::Async => {
            warn!(message_id = header.message_id, "client received a non-response, non-event message");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc;

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

    fn loopback_client() -> (Client, mpsc::Sender<(Header, Vec<u8>)>, mpsc::Receiver<(Header, Vec<u8>)>) {
        let (reply_tx, reply_rx) = mpsc::channel();
        let (sent_tx, sent_rx) = mpsc::channel();
        let link = LoopbackLink { inbound: reply_rx, outbound: sent_tx };
        let client = Client::new(Box::new(link), ProtocolTable::new(), ClientConfig::new());
        client.connect().unwrap();
        (client, reply_tx, sent_rx)
    }

    #[test]
    fn invoke_before_connect_is_not_connected() {
        let (reply_tx, reply_rx) = mpsc::channel();
        let (sent_tx, _sent_rx) = mpsc::channel();
        let link = LoopbackLink { inbound: reply_rx, outbound: sent_tx };
        let client = Client::new(Box::new(link), ProtocolTable::new(), ClientConfig::new());
        drop(reply_tx);
        assert!(matches!(client.invoke(1, 1, MessageClass::Sync, &[]), Err(ClientError::NotConnected)));
    }

    #[test]
    fn connect_twice_errors() {
        let (client, _reply_tx, _sent_rx) = loopback_client();
        assert!(matches!(client.connect(), Err(ClientError::AlreadyConnected)));
    }

    #[test]
    fn message_ids_are_monotonic() {
        let (client, _reply_tx, sent_rx) = loopback_client();
        let a = client.invoke(1, 1, MessageClass::Event, &[]).unwrap();
        let b = client.invoke(1, 1, MessageClass::Event, &[]).unwrap();
        assert!(b > a);
        assert_eq!(sent_rx.recv().unwrap().0.message_id, a);
        assert_eq!(sent_rx.recv().unwrap().0.message_id, b);
    }

    #[test]
    fn call_returns_the_matching_response() {
        let (client, reply_tx, sent_rx) = loopback_client();
        std::thread::spawn(move || {
            let (header, _payload) = sent_rx.recv().unwrap();
            let response = Header { message_id: header.message_id, length: 2, service_id: header.service_id, action_id: header.action_id, flags: MessageClass::Response.to_flags() };
            reply_tx.send((response, vec![9, 9])).unwrap();
        });
        let reply = client.call(1, 1, b"hi").unwrap();
        assert_eq!(reply, vec![9, 9]);
    }
}

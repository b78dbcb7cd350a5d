//! Turns a received message into handler calls and outgoing replies.
//! Grounded on `runtime/server.c`'s `server_invoke_action`: look the action
//! up by `(service_id, action_id)`, hand it to the protocol table, and let
//! the handler call back into [`Dispatcher::respond`]/`send_event` to
//! answer or notify. `defer_message` is the seam the worker pool plugs into
//! so handling an action never blocks the thread polling the link.

use std::sync::{Arc, Mutex, RwLock};

use gracht_communication::{Allocation, Arena, ArenaError, RobinHoodMap};
use tracing::warn;

use crate::config::ServerConfig;
use crate::control::{self, ControlError, SubscriptionRequest};
use crate::error::LinkError;
use crate::link::{ClientHandle, ServerLink};
use crate::protocol::{Protocol, ProtocolTable};
use crate::server::clientrec::{ALL_PROTOCOLS, ClientRecord};
use crate::wire::{Header, MessageClass};

/// Bytes the arena reserves on top of `max_message_size` for every slot, and
/// the fixed-buffer size in single-thread mode, pinned from `get_out_buffer_st`
/// / `get_in_buffer_st`'s headroom over the negotiated message size.
const SLOT_OVERHEAD: usize = 512;

/// Slots per worker the shared arena is sized for.
const SLOTS_PER_WORKER: usize = 32;

/// Where a received message's payload lives while it's queued for dispatch.
/// Multi-worker mode slices it out of the server's shared [`Arena`]; single
/// -thread mode copies it into one reusable fixed buffer. Either way, the
/// handler only ever sees a borrowed slice — see [`MessageBuffer::with_bytes`].
pub enum MessageBuffer {
    /// No payload at all; avoids touching the arena for zero-length control
    /// events.
    Empty,
    Arena { arena: Arc<Arena>, allocation: Allocation },
    Fixed { buffer: Arc<Mutex<Vec<u8>>>, len: usize },
}

impl MessageBuffer {
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match self {
            MessageBuffer::Empty => f(&[]),
            MessageBuffer::Arena { arena, allocation } => arena.with_slice(allocation, f),
            MessageBuffer::Fixed { buffer, len } => f(&buffer.lock().unwrap()[..*len]),
        }
    }

    /// Releases the backing storage without invoking any handler. Used both
    /// once normal dispatch finishes and by a worker's shutdown-time drain.
    fn cleanup(self) {
        if let MessageBuffer::Arena { arena, allocation } = self {
            arena.free(allocation);
        }
    }
}

/// Backing storage for [`MessageBuffer`]s, sized per §4.4: a shared arena
/// sized `worker_count * (max_message_size + 512) * 32` when dispatch fans
/// out across workers, or two fixed buffers of `max_message_size + 512` bytes
/// each in single-thread mode (one per `get_out_buffer_st`/`get_in_buffer_st`).
enum MessageBuffers {
    Arena(Arc<Arena>),
    Fixed(Arc<Mutex<Vec<u8>>>),
}

impl MessageBuffers {
    fn new(config: &ServerConfig) -> Self {
        let slot_size = config.max_message_size + SLOT_OVERHEAD;
        if config.worker_count > 1 {
            MessageBuffers::Arena(Arc::new(Arena::new(slot_size * SLOTS_PER_WORKER * config.worker_count)))
        } else {
            MessageBuffers::Fixed(Arc::new(Mutex::new(vec![0u8; slot_size])))
        }
    }

    fn store(&self, bytes: &[u8]) -> Result<MessageBuffer, ArenaError> {
        if bytes.is_empty() {
            return Ok(MessageBuffer::Empty);
        }
        match self {
            MessageBuffers::Arena(arena) => {
                let allocation = arena.allocate(bytes.len())?;
                arena.write(&allocation, bytes);
                Ok(MessageBuffer::Arena { arena: arena.clone(), allocation })
            }
            MessageBuffers::Fixed(buffer) => {
                let mut guard = buffer.lock().unwrap();
                if bytes.len() > guard.len() {
                    guard.resize(bytes.len(), 0);
                }
                guard[..bytes.len()].copy_from_slice(bytes);
                Ok(MessageBuffer::Fixed { buffer: buffer.clone(), len: bytes.len() })
            }
        }
    }
}

/// A unit of work handed to a server worker: one received message, still
/// associated with the client it arrived from.
pub struct DeferredMessage {
    pub client: ClientHandle,
    pub header: Header,
    pub payload: MessageBuffer,
}

pub struct Dispatcher {
    link: Arc<Mutex<Box<dyn ServerLink>>>,
    clients: Arc<Mutex<RobinHoodMap<ClientHandle, ClientRecord>>>,
    protocols: Arc<RwLock<ProtocolTable>>,
    buffers: MessageBuffers,
    on_connect: Option<Arc<dyn Fn(ClientHandle) + Send + Sync>>,
    on_disconnect: Option<Arc<dyn Fn(ClientHandle) + Send + Sync>>,
}

impl Dispatcher {
    pub fn new(
        link: Arc<Mutex<Box<dyn ServerLink>>>,
        clients: Arc<Mutex<RobinHoodMap<ClientHandle, ClientRecord>>>,
        protocols: Arc<RwLock<ProtocolTable>>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            link,
            clients,
            protocols,
            buffers: MessageBuffers::new(config),
            on_connect: config.on_connect.clone(),
            on_disconnect: config.on_disconnect.clone(),
        }
    }

    /// Registers a protocol's actions for dispatch, replacing any existing
    /// registration under the same `service_id`. Matches
    /// `gracht_server_register_protocol`'s post-construction registration.
    pub fn register_protocol(&self, protocol: Protocol) {
        self.protocols.write().unwrap().register(protocol);
    }

    pub fn unregister_protocol(&self, service_id: u8) {
        self.protocols.write().unwrap().unregister(service_id);
    }

    /// Copies a freshly received payload into the arena or fixed buffer, per
    /// whichever mode this server is running in.
    pub fn store_payload(&self, bytes: &[u8]) -> Result<MessageBuffer, ArenaError> {
        self.buffers.store(bytes)
    }

    pub(crate) fn fire_on_connect(&self, client: ClientHandle) {
        if let Some(callback) = &self.on_connect {
            callback(client);
        }
    }

    pub(crate) fn fire_on_disconnect(&self, client: ClientHandle) {
        if let Some(callback) = &self.on_disconnect {
            callback(client);
        }
    }

    /// Dispatches one received message: control-protocol actions are
    /// handled inline, everything else goes through the registered
    /// protocol table. Always releases the message's backing buffer before
    /// returning.
    pub fn invoke_action(&self, message: DeferredMessage) {
        let DeferredMessage { client, header, payload } = message;

        if header.service_id == control::CONTROL_SERVICE_ID {
            self.invoke_control_action(client, &header, &payload);
            payload.cleanup();
            return;
        }

        let dispatched = payload.with_bytes(|bytes| self.protocols.read().unwrap().dispatch(&header, bytes, client));
        if !dispatched {
            warn!(service_id = header.service_id, action_id = header.action_id, "no handler registered for dispatched action");
            if header.class() != MessageClass::Event {
                self.send_control_error(client, header.message_id, -1);
            }
        }
        payload.cleanup();
    }

    /// Releases a deferred message's buffer without invoking its handler.
    /// Pinned from `worker_dowork`'s shutdown tail loop, which drains
    /// whatever is left queued through `server_cleanup_message` rather than
    /// `server_invoke_action` once a worker has seen a shutdown request.
    pub fn cleanup_message(&self, message: DeferredMessage) {
        message.payload.cleanup();
    }

    /// Subscribes or unsubscribes the sending client. The `ALL_PROTOCOLS`
    /// sentinel on unsubscribe clears the bitmap before the client record is
    /// destroyed, so a concurrent `broadcast_event` never observes a removed
    /// client as still subscribed. A subscribe from a client with no record
    /// yet (a datagram source speaking for the first time without going
    /// through `ServerLink::accept`) creates one via `ServerLink::create_client`
    /// before applying the subscription.
    fn invoke_control_action(&self, client: ClientHandle, header: &Header, payload: &MessageBuffer) {
        let Some(request) = payload.with_bytes(SubscriptionRequest::decode) else {
            return;
        };
        let action_id = header.action_id;

        if action_id == control::ACTION_SUBSCRIBE && !self.clients.lock().unwrap().contains_key(&client) {
            if self.link.lock().unwrap().create_client(client).is_err() {
                warn!(client, "subscribe from a client the link could not create a record for");
                return;
            }
            self.clients.lock().unwrap().insert(client, ClientRecord::new(client));
            self.fire_on_connect(client);
        }

        let mut clients = self.clients.lock().unwrap();
        let Some(record) = clients.get_mut(&client) else {
            return;
        };
        match action_id {
            control::ACTION_SUBSCRIBE => record.subscriptions.subscribe(request.service_id),
            control::ACTION_UNSUBSCRIBE => record.subscriptions.unsubscribe(request.service_id),
            other => warn!(action_id = other, "unknown control action"),
        }

        let destroy = action_id == control::ACTION_UNSUBSCRIBE && request.service_id == ALL_PROTOCOLS;
        if destroy {
            clients.remove(&client);
        }
        drop(clients);

        if destroy {
            self.fire_on_disconnect(client);
            self.link.lock().unwrap().disconnect(client);
        }
    }

    /// Answers a `Sync`/`Async` invocation. Falls back to the link's
    /// `respond` when the client isn't in the table yet, for a datagram
    /// source answered before it has subscribed to anything.
    pub fn respond(&self, client: ClientHandle, request: &Header, payload: &[u8]) -> Result<(), LinkError> {
        let header = Header {
            message_id: request.message_id,
            length: payload.len() as u32,
            service_id: request.service_id,
            action_id: request.action_id,
            flags: MessageClass::Response.to_flags(),
        };
        let known = self.clients.lock().unwrap().contains_key(&client);
        let mut link = self.link.lock().unwrap();
        if known {
            link.send(client, &header, payload)
        } else {
            link.respond(client, &header, payload)
        }
    }

    fn send_control_error(&self, client: ClientHandle, message_id: u32, code: i32) {
        let error = ControlError { message_id, code };
        let header = Header {
            message_id,
            length: ControlError::WIRE_SIZE as u32,
            service_id: control::CONTROL_SERVICE_ID,
            action_id: control::ACTION_ERROR_EVENT,
            flags: MessageClass::Event.to_flags(),
        };
        let _ = self.link.lock().unwrap().send(client, &header, &error.encode());
    }

    /// Sends an event to one specific client, regardless of its
    /// subscriptions.
    pub fn send_event(&self, client: ClientHandle, service_id: u8, action_id: u8, payload: &[u8]) -> Result<(), LinkError> {
        let header = Header {
            message_id: 0,
            length: payload.len() as u32,
            service_id,
            action_id,
            flags: MessageClass::Event.to_flags(),
        };
        self.link.lock().unwrap().send(client, &header, payload)
    }

    /// Sends an event to every client subscribed to `service_id`.
    pub fn broadcast_event(&self, service_id: u8, action_id: u8, payload: &[u8]) {
        let header = Header {
            message_id: 0,
            length: payload.len() as u32,
            service_id,
            action_id,
            flags: MessageClass::Event.to_flags(),
        };
        let subscribed: Vec<ClientHandle> = self
            .clients
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, record)| record.subscriptions.is_subscribed(service_id))
            .map(|(handle, _)| *handle)
            .collect();

        let mut link = self.link.lock().unwrap();
        for client in subscribed {
            if let Err(err) = link.send(client, &header, payload) {
                warn!(?err, client, "failed to deliver broadcast event");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::link::ServerLink;
    use std::sync::mpsc::{self, Sender};

    struct RecordingLink {
        sent: Sender<(ClientHandle, Header, Vec<u8>)>,
    }

    impl ServerLink for RecordingLink {
        fn accept(&mut self) -> Result<Vec<ClientHandle>, LinkError> {
            Ok(vec![])
        }
        fn recv(&mut self) -> Result<(ClientHandle, Header, Vec<u8>), LinkError> {
            Err(LinkError::WouldBlock)
        }
        fn send(&mut self, client: ClientHandle, header: &Header, payload: &[u8]) -> Result<(), LinkError> {
            self.sent.send((client, *header, payload.to_vec())).unwrap();
            Ok(())
        }
        fn disconnect(&mut self, _client: ClientHandle) {}
    }

    fn dispatcher_with_one_client() -> (Dispatcher, mpsc::Receiver<(ClientHandle, Header, Vec<u8>)>) {
        let (tx, rx) = mpsc::channel();
        let link: Arc<Mutex<Box<dyn ServerLink>>> = Arc::new(Mutex::new(Box::new(RecordingLink { sent: tx })));
        let clients = Arc::new(Mutex::new(RobinHoodMap::new()));
        clients.lock().unwrap().insert(1, ClientRecord::new(1));
        let protocols = Arc::new(RwLock::new(ProtocolTable::new()));
        (Dispatcher::new(link, clients, protocols, &ServerConfig::new()), rx)
    }

    fn deferred(dispatcher: &Dispatcher, client: ClientHandle, header: Header, payload: &[u8]) -> DeferredMessage {
        DeferredMessage { client, header, payload: dispatcher.store_payload(payload).unwrap() }
    }

    #[test]
    fn broadcast_skips_unsubscribed_clients() {
        let (dispatcher, rx) = dispatcher_with_one_client();
        dispatcher.broadcast_event(3, 1, &[]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn broadcast_reaches_subscribed_clients() {
        let (dispatcher, rx) = dispatcher_with_one_client();
        let header = Header { message_id: 0, length: 1, service_id: control::CONTROL_SERVICE_ID, action_id: control::ACTION_SUBSCRIBE, flags: 0 };
        let payload = SubscriptionRequest { service_id: 3 }.encode();
        let message = deferred(&dispatcher, 1, header, &payload);
        dispatcher.invoke_action(message);
        dispatcher.broadcast_event(3, 1, b"payload");
        let (client, header, payload) = rx.try_recv().unwrap();
        assert_eq!(client, 1);
        assert_eq!(header.service_id, 3);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn unsubscribe_all_destroys_the_client_record() {
        let (dispatcher, _rx) = dispatcher_with_one_client();
        let header = Header { message_id: 0, length: 1, service_id: control::CONTROL_SERVICE_ID, action_id: control::ACTION_UNSUBSCRIBE, flags: 0 };
        let payload = SubscriptionRequest { service_id: ALL_PROTOCOLS }.encode();
        let message = deferred(&dispatcher, 1, header, &payload);
        dispatcher.invoke_action(message);
        assert!(dispatcher.clients.lock().unwrap().get_mut(&1).is_none());
    }

    #[test]
    fn subscribe_from_unknown_client_creates_a_record() {
        let (dispatcher, _rx) = dispatcher_with_one_client();
        let header = Header { message_id: 0, length: 1, service_id: control::CONTROL_SERVICE_ID, action_id: control::ACTION_SUBSCRIBE, flags: 0 };
        let payload = SubscriptionRequest { service_id: 3 }.encode();
        // RecordingLink's create_client uses the default, which errors, so
        // an unknown client stays absent rather than panicking.
        let message = deferred(&dispatcher, 2, header, &payload);
        dispatcher.invoke_action(message);
        assert!(dispatcher.clients.lock().unwrap().get_mut(&2).is_none());
    }

    #[test]
    fn unknown_action_sends_control_error() {
        let (dispatcher, rx) = dispatcher_with_one_client();
        let header = Header { message_id: 5, length: 0, service_id: 9, action_id: 9, flags: MessageClass::Sync.to_flags() };
        let message = deferred(&dispatcher, 1, header, &[]);
        dispatcher.invoke_action(message);
        let (_, header, payload) = rx.try_recv().unwrap();
        assert_eq!(header.service_id, control::CONTROL_SERVICE_ID);
        let error = ControlError::decode(&payload).unwrap();
        assert_eq!(error.message_id, 5);
    }
}

//! Builder-style configuration for client and server runtimes, in the same
//! `with_*` style the network crate's connectors use.

use std::fmt;
use std::sync::Arc;

use crate::link::ClientHandle;
use crate::workerpool::DEFAULT_WORKER_COUNT;

#[derive(Clone)]
pub struct ClientConfig {
    pub max_message_size: usize,
    /// A caller-supplied buffer `invoke` stages outbound payloads into
    /// instead of allocating one, mirroring `gracht_client_configuration_t`'s
    /// `send_buffer` override.
    pub send_buffer: Option<Vec<u8>>,
    /// Size of a caller-supplied receive buffer. The pumper enforces this as
    /// an upper bound on incoming payload length instead of `max_message_size`
    /// when set.
    pub receive_buffer_size: Option<usize>,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("max_message_size", &self.max_message_size)
            .field("send_buffer_len", &self.send_buffer.as_ref().map(Vec::len))
            .field("receive_buffer_size", &self.receive_buffer_size)
            .finish()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { max_message_size: crate::wire::DEFAULT_MESSAGE_SIZE, send_buffer: None, receive_buffer_size: None }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Supplies a buffer `invoke` stages outbound payloads into, instead of
    /// borrowing the caller's slice directly.
    pub fn with_send_buffer(mut self, buffer: Vec<u8>) -> Self {
        self.send_buffer = Some(buffer);
        self
    }

    /// Caps how large an incoming payload the pumper will accept, matching a
    /// caller-provided fixed-size receive buffer.
    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = Some(size);
        self
    }
}

type ConnectCallback = Arc<dyn Fn(ClientHandle) + Send + Sync>;

#[derive(Clone)]
pub struct ServerConfig {
    pub max_message_size: usize,
    pub worker_count: usize,
    pub worker_queue_capacity: usize,
    /// Core to pin each worker thread to, indexed by worker number. Shorter
    /// than `worker_count`, or absent entirely, leaves the remaining workers
    /// on the OS default placement.
    pub worker_core_ids: Vec<usize>,
    /// Called once a client's record is created, whether by `ServerLink::accept`
    /// or by a first-contact `subscribe` (see `Dispatcher::invoke_control_action`).
    pub on_connect: Option<ConnectCallback>,
    /// Called once a client's record is removed, on explicit disconnect or
    /// `unsubscribe(ALL_PROTOCOLS)`.
    pub on_disconnect: Option<ConnectCallback>,
    /// An externally owned multiplexer (epoll/kqueue) handle the server
    /// should register its link's `poll_handle` with instead of managing its
    /// own, matching `gracht_server_configuration_t::set_id`.
    pub multiplexer_handle: Option<i32>,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("max_message_size", &self.max_message_size)
            .field("worker_count", &self.worker_count)
            .field("worker_queue_capacity", &self.worker_queue_capacity)
            .field("worker_core_ids", &self.worker_core_ids)
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("multiplexer_handle", &self.multiplexer_handle)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_message_size: crate::wire::DEFAULT_MESSAGE_SIZE,
            worker_count: DEFAULT_WORKER_COUNT,
            worker_queue_capacity: gracht_communication::jobqueue::DEFAULT_CAPACITY,
            worker_core_ids: Vec::new(),
            on_connect: None,
            on_disconnect: None,
            multiplexer_handle: None,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Sets the number of worker threads dispatching actions. `0` or `1`
    /// selects single-threaded, run-on-the-poller-thread mode, matching
    /// `configuration->server_workers > 1` gating in the original.
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_worker_queue_capacity(mut self, capacity: usize) -> Self {
        self.worker_queue_capacity = capacity;
        self
    }

    /// Pins worker thread `i` to `core_ids[i]` for every `i` within bounds.
    pub fn with_worker_core_ids(mut self, core_ids: Vec<usize>) -> Self {
        self.worker_core_ids = core_ids;
        self
    }

    pub fn with_on_connect(mut self, callback: impl Fn(ClientHandle) + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(callback));
        self
    }

    pub fn with_on_disconnect(mut self, callback: impl Fn(ClientHandle) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(callback));
        self
    }

    pub fn with_multiplexer_handle(mut self, handle: i32) -> Self {
        self.multiplexer_handle = Some(handle);
        self
    }
}

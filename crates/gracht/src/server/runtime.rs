//! The server runtime: owns a [`ServerLink`], accepts clients, and feeds
//! every received message to a [`Dispatcher`] — either directly on the
//! polling thread (`worker_count <= 1`) or via a [`WorkerPool`], mirroring
//! `runtime/server.c`'s single-threaded vs. multi-worker server modes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use gracht_communication::RobinHoodMap;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::LinkError;
use crate::link::{ClientHandle, ServerLink};
use crate::protocol::ProtocolTable;
use crate::server::clientrec::ClientRecord;
use crate::server::dispatch::{DeferredMessage, Dispatcher};
use crate::workerpool::WorkerPool;

pub struct Server {
    dispatcher: Arc<Dispatcher>,
    link: Arc<Mutex<Box<dyn ServerLink>>>,
    clients: Arc<Mutex<RobinHoodMap<ClientHandle, ClientRecord>>>,
    workers: WorkerPool<DeferredMessage>,
    running: Arc<AtomicBool>,
    /// `true` when `worker_count <= 1`: messages are dispatched directly on
    /// the polling thread instead of handed to a worker.
    single_threaded: bool,
    multiplexer_handle: Option<i32>,
}

impl Server {
    pub fn new(link: Box<dyn ServerLink>, protocols: ProtocolTable, config: ServerConfig) -> Self {
        let link: Arc<Mutex<Box<dyn ServerLink>>> = Arc::new(Mutex::new(link));
        let clients = Arc::new(Mutex::new(RobinHoodMap::new()));
        let protocols = Arc::new(RwLock::new(protocols));
        let single_threaded = config.worker_count <= 1;
        let multiplexer_handle = config.multiplexer_handle;
        let dispatcher = Arc::new(Dispatcher::new(link.clone(), clients.clone(), protocols, &config));

        let worker_dispatcher = dispatcher.clone();
        let cleanup_dispatcher = dispatcher.clone();
        let workers = WorkerPool::with_core_ids(
            config.worker_count,
            config.worker_queue_capacity,
            &config.worker_core_ids,
            move |message| worker_dispatcher.invoke_action(message),
            move |message| cleanup_dispatcher.cleanup_message(message),
        );

        Self { dispatcher, link, clients, workers, running: Arc::new(AtomicBool::new(false)), single_threaded, multiplexer_handle }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The externally owned multiplexer handle this server was configured
    /// with, if any.
    pub fn multiplexer_handle(&self) -> Option<i32> {
        self.multiplexer_handle
    }

    /// Registers a protocol's actions for dispatch, replacing any existing
    /// registration under the same `service_id`. Can be called any time
    /// after construction, matching `gracht_server_register_protocol`.
    pub fn register_protocol(&self, protocol: crate::protocol::Protocol) {
        self.dispatcher.register_protocol(protocol);
    }

    pub fn unregister_protocol(&self, service_id: u8) {
        self.dispatcher.unregister_protocol(service_id);
    }

    /// Runs the accept/receive loop on the calling thread until
    /// [`Server::stop`] is called from another thread, sleeping briefly
    /// between idle polls instead of busy-spinning.
    pub fn run(&self) {
        self.running.store(true, Ordering::Release);
        while self.running.load(Ordering::Acquire) {
            let mut made_progress = false;

            match self.link.lock().unwrap().accept() {
                Ok(handles) => {
                    for handle in handles {
                        info!(client = handle, "client connected");
                        self.clients.lock().unwrap().insert(handle, ClientRecord::new(handle));
                        self.dispatcher.fire_on_connect(handle);
                        made_progress = true;
                    }
                }
                Err(LinkError::WouldBlock) => {}
                Err(err) => warn!(?err, "server link accept error"),
            }

            match self.link.lock().unwrap().recv() {
                Ok((client, header, payload)) => {
                    made_progress = true;
                    match self.dispatcher.store_payload(&payload) {
                        Ok(buffer) => {
                            let message = DeferredMessage { client, header, payload: buffer };
                            if self.single_threaded {
                                self.dispatcher.invoke_action(message);
                            } else if let Err(err) = self.workers.submit(message) {
                                warn!(?err, "worker queue full, dropping message");
                            }
                        }
                        Err(err) => warn!(?err, "no buffer space for inbound message, dropping"),
                    }
                }
                Err(LinkError::WouldBlock) => {}
                Err(LinkError::BrokenPipe) => {}
                Err(err) => debug!(?err, "server link recv error"),
            }

            if !made_progress {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn disconnect(&self, client: ClientHandle) {
        self.clients.lock().unwrap().remove(&client);
        self.dispatcher.fire_on_disconnect(client);
        self.link.lock().unwrap().disconnect(client);
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }
}

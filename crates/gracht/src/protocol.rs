//! Protocol and action descriptors. A [`Protocol`] groups the actions
//! (remote procedures and events) that share a `service_id`, the way
//! `gracht_protocol`/`gracht_protocol_function` do in
//! `include/gracht/types.h`. Handlers are looked up by `(service_id,
//! action_id)` out of a flat [`ProtocolTable`] rather than the fixed-size C
//! array the original walks linearly.

use std::sync::Arc;

use crate::link::ClientHandle;
use crate::wire::{Header, Reader};

/// A single invocable action (RPC, async call, or event) within a protocol.
/// The `ClientHandle` a handler receives is the client the message arrived
/// from on a server; client-side dispatch (there is only ever one peer, the
/// server it's connected to) passes `0`.
pub struct Action {
    pub action_id: u8,
    pub name: &'static str,
    pub handler: Arc<dyn Fn(&Header, &mut Reader, ClientHandle) + Send + Sync>,
}

impl Action {
    pub fn new(
        action_id: u8,
        name: &'static str,
        handler: impl Fn(&Header, &mut Reader, ClientHandle) + Send + Sync + 'static,
    ) -> Self {
        Self { action_id, name, handler: Arc::new(handler) }
    }
}

/// A set of actions sharing a `service_id`, registered with a server or
/// client runtime.
pub struct Protocol {
    pub service_id: u8,
    pub name: &'static str,
    pub actions: Vec<Action>,
}

impl Protocol {
    pub fn new(service_id: u8, name: &'static str) -> Self {
        Self { service_id, name, actions: Vec::new() }
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    fn action(&self, action_id: u8) -> Option<&Action> {
        self.actions.iter().find(|a| a.action_id == action_id)
    }
}

/// The set of protocols a client or server knows how to dispatch into,
/// indexed by `service_id` for O(1) routing on the hot path.
#[derive(Default)]
pub struct ProtocolTable {
    protocols: Vec<Option<Protocol>>,
}

impl ProtocolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, protocol: Protocol) {
        let index = protocol.service_id as usize;
        if index >= self.protocols.len() {
            self.protocols.resize_with(index + 1, || None);
        }
        self.protocols[index] = Some(protocol);
    }

    /// Removes a previously registered protocol, if any. Matches
    /// `gracht_client_unregister_protocol`/`gracht_server_unregister_protocol`:
    /// dispatch to `service_id` after this call behaves as if it was never
    /// registered.
    pub fn unregister(&mut self, service_id: u8) {
        if let Some(slot) = self.protocols.get_mut(service_id as usize) {
            *slot = None;
        }
    }

    pub fn protocol(&self, service_id: u8) -> Option<&Protocol> {
        self.protocols.get(service_id as usize).and_then(|p| p.as_ref())
    }

    pub fn action(&self, service_id: u8, action_id: u8) -> Option<&Action> {
        self.protocol(service_id).and_then(|p| p.action(action_id))
    }

    pub fn dispatch(&self, header: &Header, payload: &[u8], client: ClientHandle) -> bool {
        let Some(action) = self.action(header.service_id, header.action_id) else {
            return false;
        };
        let mut reader = Reader::new(payload);
        (action.handler)(header, &mut reader, client);
        true
    }
}

//! The transport seam. Everything above this trait boundary (client runtime,
//! server runtime, worker pool) is transport-agnostic; a concrete transport
//! (TCP, in the `gracht-network` crate; or a local channel, for tests) only
//! has to implement [`ClientLink`] and/or [`ServerLink`].

use crate::error::LinkError;
use crate::wire::Header;

/// A handle a server holds for one connected client.
pub type ClientHandle = u32;

/// The non-blocking, single-peer transport a [`crate::client`] runtime
/// drives. Every method must return promptly: blocking link implementations
/// belong behind a thread, not inside these calls.
pub trait ClientLink: Send {
    /// Sends a fully framed message (header + payload). Must write either
    /// the whole message or none of it.
    fn send(&mut self, header: &Header, payload: &[u8]) -> Result<(), LinkError>;

    /// Attempts to receive one framed message without blocking.
    /// Returns `Err(LinkError::WouldBlock)` if nothing is available yet.
    fn recv(&mut self) -> Result<(Header, Vec<u8>), LinkError>;

    /// A raw fd/handle the runtime can register with its multiplexer, if the
    /// link supports readiness notification.
    fn poll_handle(&self) -> Option<i32> {
        None
    }
}

/// The non-blocking, multi-peer transport a [`crate::server`] runtime
/// drives. One `ServerLink` accepts connections and fans out to many
/// [`ClientHandle`]s.
pub trait ServerLink: Send {
    /// Accepts any newly connected clients, returning their handles.
    fn accept(&mut self) -> Result<Vec<ClientHandle>, LinkError>;

    /// Attempts to receive one framed message from any client without
    /// blocking. Returns `Err(LinkError::WouldBlock)` if nothing is ready.
    fn recv(&mut self) -> Result<(ClientHandle, Header, Vec<u8>), LinkError>;

    /// Sends a framed message to a specific client.
    fn send(&mut self, client: ClientHandle, header: &Header, payload: &[u8]) -> Result<(), LinkError>;

    /// Drops a client, e.g. after it disconnects or misbehaves.
    fn disconnect(&mut self, client: ClientHandle);

    /// Synthesizes a client record for a handle the link never reported
    /// through [`ServerLink::accept`] — a datagram-style link that only
    /// learns of a peer once it speaks, rather than at connection time.
    /// Stream-based links (TCP) insert their clients at `accept()` and never
    /// need this; the default reflects that.
    fn create_client(&mut self, _client: ClientHandle) -> Result<(), LinkError> {
        Err(LinkError::NotSupported)
    }

    /// Answers a request from a client the server has no record for yet,
    /// e.g. the very first message from a datagram source before it has
    /// subscribed to anything. [`crate::server::Dispatcher::respond`] falls
    /// back to this when the client handle isn't in its table.
    fn respond(&mut self, client: ClientHandle, header: &Header, payload: &[u8]) -> Result<(), LinkError> {
        let _ = (client, header, payload);
        Err(LinkError::NotSupported)
    }

    /// A raw fd/handle the runtime can register with its multiplexer, if the
    /// link supports readiness notification.
    fn poll_handle(&self) -> Option<i32> {
        None
    }
}

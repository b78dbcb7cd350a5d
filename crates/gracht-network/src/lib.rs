//! TCP transport for gracht: adapts [`tcp::TcpConnector`]'s non-blocking,
//! mio-backed connection management to the
//! [`gracht::link::ClientLink`]/[`gracht::link::ServerLink`] seam the
//! runtime drives.

pub mod tcp;

use std::collections::VecDeque;
use std::net::SocketAddr;

use gracht::error::LinkError;
use gracht::link::{ClientHandle, ClientLink, ServerLink};
use gracht::wire::Header;
use mio::Token;

use tcp::{PollEvent, SendBehavior, TcpConnector};

fn token_to_handle(token: Token) -> ClientHandle {
    token.0 as u32
}

fn handle_to_token(handle: ClientHandle) -> Token {
    Token(handle as usize)
}

/// A [`ClientLink`] backed by a single outbound TCP connection.
pub struct TcpClientLink {
    connector: TcpConnector,
    token: Token,
    pending: VecDeque<(Header, Vec<u8>)>,
}

impl TcpClientLink {
    pub fn connect(addr: SocketAddr) -> Result<Self, LinkError> {
        let mut connector = TcpConnector::new();
        let token = connector.connect(addr).ok_or(LinkError::Io(std::io::Error::from(std::io::ErrorKind::NotConnected)))?;
        Ok(Self { connector, token, pending: VecDeque::new() })
    }

    fn pump(&mut self) {
        let mut pending = VecDeque::new();
        self.connector.poll_with(|event| match event {
            PollEvent::Message { header, payload, .. } => pending.push_back((header, payload.to_vec())),
            PollEvent::Disconnect { .. } => {}
            PollEvent::Accept { .. } => {}
        });
        self.pending.extend(pending);
    }
}

impl ClientLink for TcpClientLink {
    fn send(&mut self, header: &Header, payload: &[u8]) -> Result<(), LinkError> {
        self.connector.write_or_enqueue_with(header, SendBehavior::Single(self.token), |buf| {
            buf.extend_from_slice(payload);
        });
        Ok(())
    }

    fn recv(&mut self) -> Result<(Header, Vec<u8>), LinkError> {
        if self.pending.is_empty() {
            self.pump();
        }
        self.pending.pop_front().ok_or(LinkError::WouldBlock)
    }
}

/// A [`ServerLink`] backed by a single TCP listener accepting many clients.
pub struct TcpServerLink {
    connector: TcpConnector,
    pending_accepts: VecDeque<ClientHandle>,
    pending_messages: VecDeque<(ClientHandle, Header, Vec<u8>)>,
}

impl TcpServerLink {
    pub fn bind(addr: SocketAddr) -> Result<Self, LinkError> {
        let mut connector = TcpConnector::new();
        connector.listen_at(addr).ok_or(LinkError::Io(std::io::Error::from(std::io::ErrorKind::AddrNotAvailable)))?;
        Ok(Self { connector, pending_accepts: VecDeque::new(), pending_messages: VecDeque::new() })
    }

    fn pump(&mut self) {
        let mut accepts = VecDeque::new();
        let mut messages = VecDeque::new();
        self.connector.poll_with(|event| match event {
            PollEvent::Accept { stream, .. } => accepts.push_back(token_to_handle(stream)),
            PollEvent::Message { token, header, payload } => {
                messages.push_back((token_to_handle(token), header, payload.to_vec()))
            }
            PollEvent::Disconnect { .. } => {}
        });
        self.pending_accepts.extend(accepts);
        self.pending_messages.extend(messages);
    }
}

impl ServerLink for TcpServerLink {
    fn accept(&mut self) -> Result<Vec<ClientHandle>, LinkError> {
        self.pump();
        Ok(self.pending_accepts.drain(..).collect())
    }

    fn recv(&mut self) -> Result<(ClientHandle, Header, Vec<u8>), LinkError> {
        if self.pending_messages.is_empty() {
            self.pump();
        }
        self.pending_messages.pop_front().ok_or(LinkError::WouldBlock)
    }

    fn send(&mut self, client: ClientHandle, header: &Header, payload: &[u8]) -> Result<(), LinkError> {
        self.connector.write_or_enqueue_with(header, SendBehavior::Single(handle_to_token(client)), |buf| {
            buf.extend_from_slice(payload);
        });
        Ok(())
    }

    fn disconnect(&mut self, client: ClientHandle) {
        self.connector.disconnect(handle_to_token(client));
    }
}

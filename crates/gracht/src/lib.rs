//! A transport-agnostic RPC runtime: a wire format, a protocol dispatch
//! table, a built-in control protocol for subscriptions, and client/server
//! runtimes that drive whatever [`link::ClientLink`]/[`link::ServerLink`]
//! a transport crate provides.

pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod link;
pub mod protocol;
pub mod server;
pub mod wire;
pub mod workerpool;

pub use client::Client;
pub use config::{ClientConfig, ServerConfig};
pub use error::{ClientError, LinkError, ServerError};
pub use link::{ClientHandle, ClientLink, ServerLink};
pub use protocol::{Action, Protocol, ProtocolTable};
pub use server::Server;
pub use wire::{Buffer, Header, MessageClass, Reader};

pub use gracht_communication as communication;
pub use gracht_timing as timing;
pub use gracht_utils as utils;
pub use tracing;

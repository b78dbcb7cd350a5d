//! Error types for the three layers a caller can see: the link (transport),
//! the client, and the server. Mirrors the `oscerr_t`/`gracht_status_t`
//! split of `include/gracht/types.h`, but expressed as proper `std::error`
//! types instead of an integer status code.

use std::io;
use thiserror::Error;

/// Errors a [`crate::link::ClientLink`]/[`crate::link::ServerLink`]
/// implementation can report back to the runtime.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("operation would block")]
    WouldBlock,
    #[error("operation is not supported by this link")]
    NotSupported,
    #[error("link is busy")]
    Busy,
    #[error("no data available")]
    NoData,
    #[error("the peer closed the connection")]
    BrokenPipe,
    #[error("message is too big for this link")]
    TooBig,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("client is not connected")]
    NotConnected,
    #[error("client is already connected")]
    AlreadyConnected,
    #[error("no matching in-flight message was found")]
    NotFound,
    #[error("out of memory")]
    OutOfMemory,
    #[error(transparent)]
    Link(#[from] LinkError),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("server already has the maximum number of links")]
    TooManyLinks,
    #[error("no matching client or subscription was found")]
    NotFound,
    #[error("out of memory")]
    OutOfMemory,
    #[error(transparent)]
    Link(#[from] LinkError),
}

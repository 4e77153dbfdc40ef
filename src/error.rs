use crate::proto::FormatError;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// Session level failures the server rejects a datagram with.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("{0} requested again before confirming the previous response")]
    DuplicateRequest(IpAddr),
    #[error("client {0} sent a response packet")]
    UnexpectedResponse(SocketAddr),
    #[error("confirmation from {0} without outstanding request")]
    NoPendingResponse(IpAddr),
    #[error("confirmation from {0} contained an incorrect request token")]
    RequestTokenMismatch(IpAddr),
    #[error("confirmation from {0} contained an incorrect response token")]
    ResponseTokenMismatch(IpAddr),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("operation canceled")]
    Canceled,
    #[error("timed out waiting for response")]
    Timeout,
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("hostname did not resolve to an address of the local address family")]
    NoMatchingAddress,
}

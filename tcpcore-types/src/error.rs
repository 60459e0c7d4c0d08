use thiserror::Error;

/// Error codes surfaced by the socket API.
///
/// Success is `Ok(())`; every failure mode of the engine maps onto exactly
/// one of these variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TcpError {
    #[error("no local source address is configured for the remote host")]
    NotConfigured,
    #[error("the connection attempt was rejected")]
    ConnectionFailed,
    #[error("the connection is shutting down")]
    ConnectionClosing,
    #[error("the connection was reset by the peer")]
    ConnectionReset,
    #[error("the socket is not connected")]
    NotConnected,
    #[error("the peer closed its half of the stream")]
    EndOfStream,
    #[error("the operation timed out")]
    Timeout,
    #[error("the operation could not be completed")]
    Failure,
    #[error("out of buffer or queue resources")]
    OutOfResources,
    #[error("the socket handle is no longer valid")]
    InvalidSocket,
    #[error("the socket is already connected or listening")]
    AlreadyConnected,
}

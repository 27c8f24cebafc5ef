use std::io;
use thiserror::Error;

use frame::Opcode;
use ConnectionId;

/// A violation of the multiplexing protocol.
///
/// The receive bookkeeping can no longer be trusted once one of these occurs, so
/// the whole multiplexed connection is torn down rather than a single
/// sub-connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The peer sent more bytes than the receive buffer can hold.
    #[error("receive buffer overflow: {length} bytes delivered with {free} bytes free")]
    Overflow { length: usize, free: usize },

    /// The peer sent more bytes than it was granted.
    #[error("unrequested data: {length} bytes delivered with {requested} bytes requested")]
    Unrequested { length: usize, requested: usize },

    #[error("unknown frame opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("{0:?} on unopened connection {1}")]
    UnknownConnection(Opcode, ConnectionId),

    #[error("OPEN on already opened connection {0}")]
    DuplicateOpen(ConnectionId),

    /// The peer opened an id from the half of the id space this end allocates.
    #[error("OPEN from peer on locally allocated connection id {0}")]
    LocalIdOpened(ConnectionId),

    #[error("CLOSEACK on unclosed connection {0}")]
    UnexpectedCloseAck(ConnectionId),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("multiplexed connection failed: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        match e {
            Error::Io(e) => e,
            Error::Protocol(e) => io::Error::new(io::ErrorKind::InvalidData, e),
        }
    }
}

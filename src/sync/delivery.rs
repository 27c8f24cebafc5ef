use std::io::{self, Read};
use std::sync::Arc;

use super::Shared;
use error::{Error, ProtocolError};
use ConnectionId;

pub(super) fn new(id: ConnectionId, shared: Arc<Shared>) -> Delivery {
    Delivery { id, shared }
}

/// The multiplexer's handle on a sub-connection's receive buffer.
///
/// Calls to `receive` for one sub-connection must be serialized; bytes are read in
/// the order they were delivered.
#[derive(Clone, Debug)]
pub struct Delivery {
    id: ConnectionId,
    shared: Arc<Shared>,
}

impl Delivery {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Bytes granted to the peer that have not yet arrived.
    pub fn requested(&self) -> usize {
        self.shared.lock().window.requested()
    }

    /// Unread bytes held in the buffer.
    pub fn buffered(&self) -> usize {
        self.shared.lock().buffer.len()
    }

    pub fn is_disconnected(&self) -> bool {
        self.shared.lock().disconnected
    }

    /// Reads exactly `len` bytes from `src` into the receive buffer and wakes the reader.
    ///
    /// Delivering more than fits in the buffer, or more than was requested, is a
    /// protocol violation; nothing is read from `src` and the buffered bytes are left
    /// as they were.
    ///
    /// Once disconnected, the `len` bytes are read from `src` and discarded so that
    /// the caller's framing stays aligned.
    pub fn receive<R: Read>(&self, len: usize, src: &mut R) -> Result<(), Error> {
        let mut state = self.shared.lock();

        if state.disconnected {
            drop(state);
            debug!("{}: discarding {} bytes after disconnect", self.id, len);
            let copied = io::copy(&mut src.by_ref().take(len as u64), &mut io::sink())?;
            if copied < len as u64 {
                let e = io::Error::new(io::ErrorKind::UnexpectedEof, "truncated payload");
                return Err(e.into());
            }
            return Ok(());
        }

        state.buffer.compact_for_write(len);
        let free = state.buffer.free();
        if free < len {
            return Err(ProtocolError::Overflow { length: len, free }.into());
        }
        state.window.claim(len)?;

        if let Err(e) = state.buffer.fill_from(len, src) {
            // The grant was consumed by a payload that never fully arrived.
            state.window.grant(len);
            return Err(e.into());
        }
        trace!(
            "{}: received {} bytes; buffered={} requested={}",
            self.id,
            len,
            state.buffer.len(),
            state.window.requested()
        );

        self.shared.ready.notify_all();
        Ok(())
    }

    /// Marks the sub-connection disconnected and wakes the reader.
    ///
    /// Buffered bytes remain readable; afterwards reads report end-of-stream.
    pub fn disconnect(&self) {
        let mut state = self.shared.lock();
        if state.disconnected {
            return;
        }
        state.disconnected = true;
        debug!("{}: disconnected; {} bytes unread", self.id, state.buffer.len());
        self.shared.ready.notify_all();
    }
}

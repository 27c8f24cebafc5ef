use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::Shared;
use control::Control;
use ConnectionId;

pub(super) fn new(
    id: ConnectionId,
    shared: Arc<Shared>,
    control: Arc<dyn Control>,
) -> MuxReceiver {
    MuxReceiver {
        id,
        shared,
        control,
        read_timeout: None,
    }
}

/// Reads the bytes of one sub-connection.
///
/// Reading grants the peer permission to send as much as the buffer can hold.
pub struct MuxReceiver {
    id: ConnectionId,
    shared: Arc<Shared>,
    control: Arc<dyn Control>,
    read_timeout: Option<Duration>,
}

impl MuxReceiver {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Bounds how long `recv` waits for data. `None` waits indefinitely.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    /// The number of bytes that can be read without blocking.
    pub fn available(&self) -> usize {
        self.shared.lock().buffer.len()
    }

    /// Reads a single byte, or `None` at end-of-stream.
    pub fn recv_byte(&mut self) -> io::Result<Option<u8>> {
        let mut b = [0; 1];
        Ok(self.recv(&mut b)?.map(|_| b[0]))
    }

    /// Reads at most `dst.len()` bytes.
    ///
    /// Blocks until at least one byte is buffered and returns as soon as any are,
    /// without waiting to fill `dst`. Returns `None` once the sub-connection is
    /// disconnected and every buffered byte has been read. An empty `dst` returns
    /// `Some(0)` immediately.
    pub fn recv(&mut self, dst: &mut [u8]) -> io::Result<Option<usize>> {
        if dst.is_empty() {
            return Ok(Some(0));
        }

        self.request_more()?;

        let deadline = self.read_timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.lock();
        while state.buffer.is_empty() && !state.disconnected {
            state = match deadline {
                None => self.shared.ready.wait(state).expect("locking receive buffer"),
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
                    }
                    let (state, _) = self
                        .shared
                        .ready
                        .wait_timeout(state, deadline - now)
                        .expect("locking receive buffer");
                    state
                }
            };
        }

        if state.buffer.is_empty() {
            trace!("{}: end of stream", self.id);
            return Ok(None);
        }
        Ok(Some(state.buffer.copy_out(dst)))
    }

    /// Grants the peer whatever free buffer space is not already covered by an
    /// outstanding request, and returns the amount granted.
    ///
    /// `recv` does this before waiting; calling it directly opens the window before
    /// the first read.
    pub fn request_more(&self) -> io::Result<usize> {
        let incr = {
            let mut state = self.shared.lock();
            state.buffer.compact_for_read();
            let incr = state.window.more_space(state.buffer.free());
            // Account the grant before it is sent, so data answering it can never
            // arrive ahead of it.
            state.window.grant(incr);
            incr
        };
        if incr == 0 {
            return Ok(0);
        }

        trace!("{}: requesting {} bytes", self.id, incr);
        if let Err(e) = self.control.send_request(self.id, incr) {
            self.shared.lock().window.revoke(incr);
            return Err(e);
        }
        Ok(incr)
    }

    /// Asks the peer to close the sub-connection.
    ///
    /// Buffered bytes stay readable. Reads report end-of-stream once the multiplexer
    /// confirms the close by disconnecting.
    pub fn close(&self) -> io::Result<()> {
        debug!("{}: closing", self.id);
        self.control.send_close(self.id)
    }
}

impl Read for MuxReceiver {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.recv(buf)?.unwrap_or(0))
    }
}

impl fmt::Debug for MuxReceiver {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MuxReceiver")
            .field("id", &self.id)
            .field("read_timeout", &self.read_timeout)
            .finish()
    }
}

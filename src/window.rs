use std::cmp;

use error::ProtocolError;

/// Tracks bytes granted to the peer that have not yet been delivered.
///
/// The receive side grants space as the consumer frees it and claims it back as data
/// arrives. The send side uses the same bookkeeping for the peer's grants.
#[derive(Debug, Default)]
pub struct Window {
    requested: usize,
}

impl Window {
    pub fn new() -> Window {
        Window::default()
    }

    pub fn requested(&self) -> usize {
        self.requested
    }

    /// The part of `free` space not already covered by an outstanding grant.
    pub fn more_space(&self, free: usize) -> usize {
        free.saturating_sub(self.requested)
    }

    pub fn grant(&mut self, incr: usize) {
        self.requested += incr;
    }

    /// Withdraws a grant that never reached the peer.
    pub fn revoke(&mut self, decr: usize) {
        self.requested = self.requested.saturating_sub(decr);
    }

    /// Consumes `decr` granted bytes.
    ///
    /// Fails if the peer delivered more than it was granted; the window is left
    /// unchanged in that case.
    pub fn claim(&mut self, decr: usize) -> Result<(), ProtocolError> {
        if self.requested < decr {
            return Err(ProtocolError::Unrequested {
                length: decr,
                requested: self.requested,
            });
        }
        self.requested -= decr;
        Ok(())
    }

    /// Consumes as much as `max` granted bytes and returns the amount taken.
    pub fn claim_up_to(&mut self, max: usize) -> usize {
        let sz = cmp::min(self.requested, max);
        self.requested -= sz;
        sz
    }
}

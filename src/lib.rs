extern crate bytes;
extern crate futures;
#[macro_use]
extern crate log;
extern crate thiserror;
#[cfg(test)]
extern crate test_futures;

mod buffer;
pub mod config;
pub mod control;
mod error;
pub mod frame;
pub mod mux;
pub mod sync;
mod window;

pub use config::Config;
pub use control::{Control, ControlFrame};
pub use error::{Error, ProtocolError};
pub use mux::{Multiplexer, Role};
pub use sync::{Delivery, MuxReceiver};

use std::fmt;

/// Identifies a sub-connection on a multiplexed connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u16);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

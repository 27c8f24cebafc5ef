use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use buffer::RecvBuffer;
use control::Control;
use window::Window;
use ConnectionId;

mod delivery;
mod receiver;

pub use self::delivery::Delivery;
pub use self::receiver::MuxReceiver;

/// Creates the two halves of a sub-connection's receive side.
///
/// The `Delivery` is driven by the multiplexer as frames arrive; the `MuxReceiver` is
/// read by the consumer. Flow-control frames are sent through `control`.
///
/// ## Panics
///
/// This function panics if `capacity` is zero.
pub fn new(
    id: ConnectionId,
    capacity: usize,
    control: Arc<dyn Control>,
) -> (Delivery, MuxReceiver) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            buffer: RecvBuffer::new(capacity),
            window: Window::new(),
            disconnected: false,
        }),
        ready: Condvar::new(),
    });

    let tx = delivery::new(id, shared.clone());
    let rx = receiver::new(id, shared, control);
    (tx, rx)
}

#[derive(Debug)]
struct State {
    buffer: RecvBuffer,
    window: Window,
    disconnected: bool,
}

/// Receive state shared by both halves. Nothing else is locked while `state` is held.
#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    ready: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<State> {
        self.state.lock().expect("locking receive buffer")
    }
}

use futures::*;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use ConnectionId;

/// Transmits flow-control frames on behalf of receivers.
///
/// Receivers never call into a `Control` while holding their buffer lock, so an
/// implementation may block on the transport and may deliver data to the same
/// receiver from another thread while doing so.
pub trait Control: Send + Sync {
    /// Allows the peer to send `incr` more bytes on `id`.
    fn send_request(&self, id: ConnectionId, incr: usize) -> io::Result<()>;

    /// Tells the peer that `id` is closing.
    fn send_close(&self, id: ConnectionId) -> io::Result<()>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControlFrame {
    Request { id: ConnectionId, incr: usize },
    Close { id: ConnectionId },
}

/// Creates a queue of control frames to be written by a task.
pub fn queue() -> (ControlQueue, ControlFrames) {
    let pending = Arc::new(Mutex::new(Pending {
        frames: VecDeque::new(),
        blocked: None,
        lost_frames: false,
    }));
    (ControlQueue(pending.clone()), ControlFrames(pending))
}

#[derive(Debug)]
struct Pending {
    frames: VecDeque<ControlFrame>,
    blocked: Option<task::Task>,
    lost_frames: bool,
}

type SharedPending = Arc<Mutex<Pending>>;

/// Enqueues control frames for `ControlFrames`.
#[derive(Clone, Debug)]
pub struct ControlQueue(SharedPending);

impl ControlQueue {
    fn push(&self, frame: ControlFrame) -> io::Result<()> {
        let mut pending = self.0.lock().expect("locking control queue");
        if pending.lost_frames {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "control frames dropped"));
        }
        trace!("{}: queued {:?}", id_of(&frame), frame);
        pending.frames.push_back(frame);
        if let Some(t) = pending.blocked.take() {
            t.notify();
        }
        Ok(())
    }
}

fn id_of(frame: &ControlFrame) -> ConnectionId {
    match *frame {
        ControlFrame::Request { id, .. } => id,
        ControlFrame::Close { id } => id,
    }
}

impl Control for ControlQueue {
    fn send_request(&self, id: ConnectionId, incr: usize) -> io::Result<()> {
        self.push(ControlFrame::Request { id, incr })
    }

    fn send_close(&self, id: ConnectionId) -> io::Result<()> {
        self.push(ControlFrame::Close { id })
    }
}

impl Drop for ControlQueue {
    fn drop(&mut self) {
        // The stream holds the other strong reference; wake it so it can finish.
        if Arc::strong_count(&self.0) == 2 {
            if let Ok(mut pending) = self.0.lock() {
                if let Some(t) = pending.blocked.take() {
                    t.notify();
                }
            }
        }
    }
}

/// Publishes queued control frames in the order they were sent.
#[derive(Debug)]
pub struct ControlFrames(SharedPending);

impl ControlFrames {
    fn is_orphaned(&self) -> bool {
        Arc::strong_count(&self.0) == 1
    }
}

impl Stream for ControlFrames {
    type Item = ControlFrame;
    type Error = ();

    fn poll(&mut self) -> Poll<Option<ControlFrame>, ()> {
        let mut pending = self.0.lock().expect("locking control queue");
        if let Some(frame) = pending.frames.pop_front() {
            return Ok(Async::Ready(Some(frame)));
        }

        // Every queue is gone, so no further frames can arrive.
        if self.is_orphaned() {
            return Ok(Async::Ready(None));
        }

        pending.blocked = Some(task::current());
        Ok(Async::NotReady)
    }
}

impl Drop for ControlFrames {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.0.lock() {
            pending.lost_frames = true;
            pending.frames.clear();
        }
    }
}

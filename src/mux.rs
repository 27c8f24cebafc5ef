//! Demultiplexes one physical connection into many sub-connections.

use bytes::{BufMut, BytesMut};
use std::cmp;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use config::Config;
use control::Control;
use error::{Error, ProtocolError};
use frame::{Frame, Opcode, MAX_HEADER_LEN};
use sync::{self, Delivery, MuxReceiver};
use window::Window;
use ConnectionId;

/// Which end of the physical connection a multiplexer sits on.
///
/// The two ends allocate sub-connection ids from disjoint halves of the id space, so
/// both may open sub-connections at the same time. Ids opened by the originator
/// carry the high bit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    /// The end that established the physical connection.
    Originator,
    /// The end that accepted it.
    Acceptor,
}

const ORIGINATOR_BIT: u16 = 0x8000;

impl Role {
    fn id_bit(&self) -> u16 {
        match *self {
            Role::Originator => ORIGINATOR_BIT,
            Role::Acceptor => 0,
        }
    }

    /// Whether `id` belongs to the half of the id space this end allocates from.
    pub fn allocates(&self, id: ConnectionId) -> bool {
        id.0 & ORIGINATOR_BIT == self.id_bit()
    }
}

/// Owns the write half of a physical connection and the sub-connections carried
/// over it.
///
/// The read half is driven by `run`, typically on a dedicated thread. Handles are
/// cheap to clone and share one session.
pub struct Multiplexer<W> {
    shared: Arc<Shared<W>>,
}

impl<W> Clone for Multiplexer<W> {
    fn clone(&self) -> Multiplexer<W> {
        Multiplexer {
            shared: self.shared.clone(),
        }
    }
}

struct Shared<W> {
    config: Config,
    outbound: Arc<Outbound<W>>,
    accepted: Mutex<Accepted>,
    acceptable: Condvar,
}

/// The part of a session that receivers send control frames through. It holds no
/// receivers, so receivers waiting to be accepted do not keep the session alive.
///
/// Lock order is `writer` then `registry`. Checking a sub-connection's state and
/// writing a frame for it happen under one writer lock hold.
struct Outbound<W> {
    writer: Mutex<W>,
    registry: Mutex<Registry>,
}

struct Registry {
    role: Role,
    conns: HashMap<ConnectionId, Conn>,
    next_id: u16,
    shutdown: bool,
}

struct Conn {
    delivery: Delivery,
    /// Bytes the peer has allowed us to transmit.
    credit: Window,
    /// Set once we have sent CLOSE.
    closed: bool,
}

#[derive(Default)]
struct Accepted {
    pending: VecDeque<MuxReceiver>,
    shutdown: bool,
}

impl Conn {
    fn new(delivery: Delivery) -> Conn {
        Conn {
            delivery,
            credit: Window::new(),
            closed: false,
        }
    }
}

impl Registry {
    fn new(role: Role) -> Registry {
        Registry {
            role,
            conns: HashMap::new(),
            next_id: 0,
            shutdown: false,
        }
    }

    fn allocate_id(&mut self) -> io::Result<ConnectionId> {
        for _ in 0..ORIGINATOR_BIT {
            let id = ConnectionId(self.next_id | self.role.id_bit());
            self.next_id = (self.next_id + 1) & !ORIGINATOR_BIT;
            if !self.conns.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(io::Error::new(io::ErrorKind::Other, "no free connection ids"))
    }
}

impl<W: Write + Send + 'static> Multiplexer<W> {
    pub fn new(writer: W, role: Role, config: Config) -> Multiplexer<W> {
        Multiplexer {
            shared: Arc::new(Shared {
                config,
                outbound: Arc::new(Outbound {
                    writer: Mutex::new(writer),
                    registry: Mutex::new(Registry::new(role)),
                }),
                accepted: Mutex::new(Accepted::default()),
                acceptable: Condvar::new(),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn role(&self) -> Role {
        self.shared.outbound.registry().role
    }

    fn new_receiver(&self, id: ConnectionId) -> (Delivery, MuxReceiver) {
        let control: Arc<dyn Control> = self.shared.outbound.clone();
        let (tx, mut rx) = sync::new(id, self.shared.config.receive_buffer_size(), control);
        rx.set_read_timeout(self.shared.config.read_timeout_duration());
        (tx, rx)
    }

    /// Opens a new sub-connection and announces it to the peer.
    pub fn open(&self) -> io::Result<MuxReceiver> {
        let outbound = &self.shared.outbound;
        let mut writer = outbound.writer();
        let (id, rx) = {
            let mut reg = outbound.registry();
            if reg.shutdown {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "multiplexer is shut down"));
            }
            let id = reg.allocate_id()?;
            let (tx, rx) = self.new_receiver(id);
            reg.conns.insert(id, Conn::new(tx));
            (id, rx)
        };

        debug!("{}: opening", id);
        if let Err(e) = write_to(&mut *writer, Frame::Open(id), &[]) {
            outbound.registry().conns.remove(&id);
            return Err(e);
        }
        Ok(rx)
    }

    /// Waits for the peer to open a sub-connection.
    ///
    /// Sub-connections the peer opened before shutdown are still returned, already
    /// disconnected. Returns `None` once the multiplexer has shut down and none remain.
    pub fn accept(&self) -> Option<MuxReceiver> {
        let mut accepted = self.shared.accepted();
        loop {
            if let Some(rx) = accepted.pending.pop_front() {
                return Some(rx);
            }
            if accepted.shutdown {
                return None;
            }
            accepted = self
                .shared
                .acceptable
                .wait(accepted)
                .expect("locking accept queue");
        }
    }

    /// Sends as much of `data` on `id` as the peer has granted, and returns the number
    /// of bytes sent. Nothing is sent when no credit is outstanding.
    pub fn transmit(&self, id: ConnectionId, data: &[u8]) -> io::Result<usize> {
        let max = cmp::min(data.len(), u32::max_value() as usize);
        let mut writer = self.shared.outbound.writer();
        let sz = {
            let mut reg = self.shared.outbound.registry();
            match reg.conns.get_mut(&id) {
                Some(ref mut conn) if !conn.closed => conn.credit.claim_up_to(max),
                _ => {
                    return Err(io::Error::new(io::ErrorKind::NotConnected, "sub-connection is closed"));
                }
            }
        };
        if sz == 0 {
            return Ok(0);
        }

        write_to(&mut *writer, Frame::Transmit(id, sz as u32), &data[..sz])?;
        Ok(sz)
    }

    /// The number of bytes the peer currently allows us to send on `id`.
    pub fn credit(&self, id: ConnectionId) -> usize {
        self.shared
            .outbound
            .registry()
            .conns
            .get(&id)
            .map(|conn| conn.credit.requested())
            .unwrap_or(0)
    }

    /// Reads and dispatches frames from the physical connection until it ends.
    ///
    /// When the connection ends, fails, or violates the protocol, every sub-connection
    /// is disconnected and `accept` stops waiting for new ones. After a local
    /// `shutdown`, `run` returns once the next frame arrives, without dispatching it.
    pub fn run<R: Read>(&self, mut src: R) -> Result<(), Error> {
        let res = self.dispatch_all(&mut src);
        match res {
            Ok(()) => debug!("multiplexed connection ended"),
            Err(ref e) => warn!("multiplexed connection failed: {}", e),
        }
        self.shutdown();
        res
    }

    fn dispatch_all<R: Read>(&self, src: &mut R) -> Result<(), Error> {
        while let Some(frame) = Frame::read(src)? {
            trace!("{}: recv {:?}", frame.id(), frame);
            if self.shared.outbound.registry().shutdown {
                debug!("{}: shut down; ignoring {:?}", frame.id(), frame);
                return Ok(());
            }
            self.dispatch(frame, src)?;
        }
        Ok(())
    }

    fn dispatch<R: Read>(&self, frame: Frame, src: &mut R) -> Result<(), Error> {
        match frame {
            Frame::Open(id) => {
                let (tx, rx) = self.new_receiver(id);
                {
                    let mut reg = self.shared.outbound.registry();
                    if reg.role.allocates(id) {
                        return Err(ProtocolError::LocalIdOpened(id).into());
                    }
                    if reg.conns.contains_key(&id) {
                        return Err(ProtocolError::DuplicateOpen(id).into());
                    }
                    if reg.shutdown {
                        debug!("{}: shut down; refusing open", id);
                        return Ok(());
                    }
                    reg.conns.insert(id, Conn::new(tx));
                }
                debug!("{}: opened by peer", id);

                let mut accepted = self.shared.accepted();
                accepted.pending.push_back(rx);
                self.shared.acceptable.notify_one();
            }

            Frame::Close(id) => {
                let delivery = {
                    // Unregistering and acknowledging under one writer hold keeps our
                    // frames for `id` from following the CLOSEACK.
                    let outbound = &self.shared.outbound;
                    let mut writer = outbound.writer();
                    let conn = outbound
                        .registry()
                        .conns
                        .remove(&id)
                        .ok_or(ProtocolError::UnknownConnection(Opcode::Close, id))?;
                    debug!("{}: closed by peer", id);
                    if !conn.closed {
                        write_to(&mut *writer, Frame::CloseAck(id), &[])?;
                    }
                    conn.delivery
                };
                delivery.disconnect();
            }

            Frame::CloseAck(id) => {
                let conn = {
                    let mut reg = self.shared.outbound.registry();
                    match reg.conns.get(&id).map(|conn| conn.closed) {
                        None => {
                            return Err(ProtocolError::UnknownConnection(Opcode::CloseAck, id).into());
                        }
                        Some(false) => return Err(ProtocolError::UnexpectedCloseAck(id).into()),
                        Some(true) => reg.conns.remove(&id),
                    }
                };
                debug!("{}: close acknowledged", id);
                if let Some(conn) = conn {
                    conn.delivery.disconnect();
                }
            }

            Frame::Request(id, incr) => {
                let mut reg = self.shared.outbound.registry();
                let conn = reg
                    .conns
                    .get_mut(&id)
                    .ok_or(ProtocolError::UnknownConnection(Opcode::Request, id))?;
                if !conn.closed {
                    conn.credit.grant(incr as usize);
                }
            }

            Frame::Transmit(id, len) => {
                let delivery = self
                    .shared
                    .outbound
                    .registry()
                    .conns
                    .get(&id)
                    .map(|conn| conn.delivery.clone())
                    .ok_or(ProtocolError::UnknownConnection(Opcode::Transmit, id))?;
                delivery.receive(len as usize, src)?;
            }
        }
        Ok(())
    }

    /// Disconnects every sub-connection and releases pending `accept` calls.
    pub fn shutdown(&self) {
        let conns: Vec<Conn> = {
            let mut reg = self.shared.outbound.registry();
            reg.shutdown = true;
            reg.conns.drain().map(|(_, conn)| conn).collect()
        };
        debug!("shutting down; {} sub-connections", conns.len());
        for conn in conns {
            conn.delivery.disconnect();
        }

        let mut accepted = self.shared.accepted();
        accepted.shutdown = true;
        self.shared.acceptable.notify_all();
    }
}

impl<W> Shared<W> {
    fn accepted(&self) -> MutexGuard<Accepted> {
        self.accepted.lock().expect("locking accept queue")
    }
}

impl<W> Outbound<W> {
    fn registry(&self) -> MutexGuard<Registry> {
        self.registry.lock().expect("locking connection registry")
    }

    fn is_open(&self, id: ConnectionId) -> bool {
        self.registry()
            .conns
            .get(&id)
            .map(|conn| !conn.closed)
            .unwrap_or(false)
    }

    fn writer(&self) -> MutexGuard<W> {
        self.writer.lock().expect("locking multiplexer writer")
    }
}

/// Writes one frame, and its payload, to a locked writer.
fn write_to<W: Write>(writer: &mut W, frame: Frame, payload: &[u8]) -> io::Result<()> {
    let mut buf = BytesMut::with_capacity(MAX_HEADER_LEN + payload.len());
    frame.encode(&mut buf);
    buf.put_slice(payload);
    trace!("{}: send {:?}", frame.id(), frame);

    writer.write_all(&buf)?;
    writer.flush()
}

impl<W: Write + Send> Control for Outbound<W> {
    fn send_request(&self, id: ConnectionId, incr: usize) -> io::Result<()> {
        let mut writer = self.writer();
        if !self.is_open(id) {
            return Ok(());
        }
        let incr = cmp::min(incr, u32::max_value() as usize) as u32;
        write_to(&mut *writer, Frame::Request(id, incr), &[])
    }

    fn send_close(&self, id: ConnectionId) -> io::Result<()> {
        let mut writer = self.writer();
        {
            let mut reg = self.registry();
            match reg.conns.get_mut(&id) {
                Some(ref mut conn) if !conn.closed => conn.closed = true,
                _ => return Ok(()),
            }
        }
        debug!("{}: sending close", id);
        write_to(&mut *writer, Frame::Close(id), &[])
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;
    use std::thread;
    use std::time::Duration;

    /// A writer whose contents stay visible to the test.
    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Sink {
        fn frames(&self) -> Vec<Frame> {
            let bytes = self.0.lock().unwrap().clone();
            let mut src = Cursor::new(bytes);
            let mut frames = Vec::new();
            while let Some(frame) = Frame::read(&mut src).unwrap() {
                if let Frame::Transmit(_, len) = frame {
                    src.set_position(src.position() + u64::from(len));
                }
                frames.push(frame);
            }
            frames
        }
    }

    fn wire(frames: &[(Frame, &str)]) -> Cursor<Vec<u8>> {
        let mut buf = BytesMut::new();
        for &(frame, payload) in frames {
            frame.encode(&mut buf);
            buf.reserve(payload.len());
            buf.put_slice(payload.as_bytes());
        }
        Cursor::new(buf.to_vec())
    }

    fn mux(capacity: usize) -> (Multiplexer<Sink>, Sink) {
        let sink = Sink::default();
        let config = Config::default().receive_buffer(capacity);
        (Multiplexer::new(sink.clone(), Role::Originator, config), sink)
    }

    #[test]
    fn open_announces_and_requests() {
        let (mux, sink) = mux(16);
        let rx = mux.open().unwrap();
        assert_eq!(rx.request_more().unwrap(), mux.config().receive_buffer_size());
        assert_eq!(
            sink.frames(),
            vec![Frame::Open(rx.id()), Frame::Request(rx.id(), 16)]
        );
    }

    #[test]
    fn open_allocates_distinct_ids() {
        let (mux, _sink) = mux(16);
        let a = mux.open().unwrap();
        let b = mux.open().unwrap();
        assert!(a.id() != b.id());
    }

    #[test]
    fn roles_allocate_from_disjoint_halves() {
        let (originator, _sink) = mux(16);
        let acceptor = Multiplexer::new(Sink::default(), Role::Acceptor, Config::default());
        assert_eq!(acceptor.role(), Role::Acceptor);
        for _ in 0..4 {
            let a = originator.open().unwrap().id();
            let b = acceptor.open().unwrap().id();
            assert!(Role::Originator.allocates(a) && !Role::Acceptor.allocates(a));
            assert!(Role::Acceptor.allocates(b) && !Role::Originator.allocates(b));
        }
    }

    #[test]
    fn peer_open_in_local_half_is_a_violation() {
        let (mux, _sink) = mux(16);
        let id = ConnectionId(ORIGINATOR_BIT | 3);
        match mux.run(wire(&[(Frame::Open(id), "")])) {
            Err(Error::Protocol(ProtocolError::LocalIdOpened(bad))) => assert_eq!(bad, id),
            res => panic!("unexpected run result: {:?}", res),
        }
    }

    #[test]
    fn frames_after_shutdown_are_not_dispatched() {
        let (mux, sink) = mux(16);
        mux.shutdown();
        mux.run(wire(&[(Frame::Open(ConnectionId(3)), "")])).unwrap();
        assert!(mux.accept().is_none());
        assert_eq!(sink.frames(), vec![]);
    }

    #[test]
    fn open_racing_shutdown_is_refused() {
        let (mux, _sink) = mux(16);
        mux.shutdown();
        mux.dispatch(Frame::Open(ConnectionId(3)), &mut io::empty()).unwrap();
        assert!(mux.accept().is_none());
        assert_eq!(mux.credit(ConnectionId(3)), 0);
    }

    #[test]
    fn nothing_follows_close_ack_for_a_closed_id() {
        let (mux, sink) = mux(16);
        let id = ConnectionId(6);
        mux.dispatch_all(&mut wire(&[(Frame::Open(id), ""), (Frame::Request(id, 8), "")]))
            .unwrap();
        let rx = mux.accept().unwrap();

        mux.dispatch_all(&mut wire(&[(Frame::Close(id), "")])).unwrap();
        assert_eq!(rx.request_more().unwrap(), 16);
        assert_eq!(mux.transmit(id, b"late").unwrap_err().kind(), io::ErrorKind::NotConnected);
        rx.close().unwrap();
        assert_eq!(sink.frames(), vec![Frame::CloseAck(id)]);
    }

    #[test]
    fn requests_for_a_locally_closed_id_are_ignored() {
        let (mux, sink) = mux(16);
        let rx = mux.open().unwrap();
        let id = rx.id();
        rx.close().unwrap();

        mux.dispatch_all(&mut wire(&[(Frame::Request(id, 8), ""), (Frame::CloseAck(id), "")]))
            .unwrap();
        assert_eq!(mux.credit(id), 0);
        assert_eq!(sink.frames(), vec![Frame::Open(id), Frame::Close(id)]);
    }

    #[test]
    fn transmit_is_delivered_to_its_receiver() {
        let (mux, sink) = mux(16);
        let id = ConnectionId(4);
        let mut src = wire(&[(Frame::Open(id), ""), (Frame::Request(id, 2), "")]);
        mux.dispatch_all(&mut src).unwrap();

        let mut rx = mux.accept().unwrap();
        assert_eq!(rx.id(), id);
        rx.request_more().unwrap();
        assert_eq!(mux.credit(id), 2);

        mux.dispatch_all(&mut wire(&[(Frame::Transmit(id, 5), "hello")])).unwrap();
        let mut buf = [0; 16];
        assert_eq!(rx.recv(&mut buf).unwrap(), Some(5));
        assert_eq!(&buf[..5], b"hello");

        assert_eq!(mux.transmit(id, b"abc").unwrap(), 2);
        assert_eq!(mux.credit(id), 0);
        assert_eq!(mux.transmit(id, b"c").unwrap(), 0);
        assert_eq!(
            sink.frames(),
            vec![Frame::Request(id, 16), Frame::Transmit(id, 2)]
        );
    }

    #[test]
    fn peer_close_is_acknowledged() {
        let (mux, sink) = mux(16);
        let id = ConnectionId(1);
        mux.dispatch_all(&mut wire(&[(Frame::Open(id), ""), (Frame::Close(id), "")]))
            .unwrap();

        let mut rx = mux.accept().unwrap();
        assert_eq!(rx.recv_byte().unwrap(), None);
        assert_eq!(sink.frames(), vec![Frame::CloseAck(id)]);
    }

    #[test]
    fn local_close_waits_for_ack() {
        let (mux, sink) = mux(16);
        let mut rx = mux.open().unwrap();
        let id = rx.id();

        rx.close().unwrap();
        rx.close().unwrap();
        assert_eq!(sink.frames(), vec![Frame::Open(id), Frame::Close(id)]);

        mux.dispatch_all(&mut wire(&[(Frame::CloseAck(id), "")])).unwrap();
        assert_eq!(rx.recv_byte().unwrap(), None);
        assert_eq!(mux.credit(id), 0);
    }

    #[test]
    fn unsolicited_close_ack_is_a_violation() {
        let (mux, _sink) = mux(16);
        let rx = mux.open().unwrap();
        match mux.run(wire(&[(Frame::CloseAck(rx.id()), "")])) {
            Err(Error::Protocol(ProtocolError::UnexpectedCloseAck(id))) => assert_eq!(id, rx.id()),
            res => panic!("unexpected run result: {:?}", res),
        }
    }

    #[test]
    fn unknown_connection_tears_down_session() {
        let (mux, _sink) = mux(16);
        let mut rx = mux.open().unwrap();
        let src = wire(&[(Frame::Transmit(ConnectionId(999), 1), "x")]);
        match mux.run(src) {
            Err(Error::Protocol(ProtocolError::UnknownConnection(Opcode::Transmit, _))) => {}
            res => panic!("unexpected run result: {:?}", res),
        }
        assert_eq!(rx.recv_byte().unwrap(), None);
        assert!(mux.accept().is_none());
        assert_eq!(mux.open().unwrap_err().kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn overflow_tears_down_session() {
        let (mux, _sink) = mux(4);
        let mut rx = mux.open().unwrap();
        let id = rx.id();
        rx.request_more().unwrap();

        match mux.run(wire(&[(Frame::Transmit(id, 5), "ABCDE")])) {
            Err(Error::Protocol(ProtocolError::Overflow { length: 5, free: 4 })) => {}
            res => panic!("unexpected run result: {:?}", res),
        }
        assert_eq!(rx.recv_byte().unwrap(), None);
    }

    #[test]
    fn duplicate_open_is_a_violation() {
        let (mux, _sink) = mux(16);
        let id = ConnectionId(2);
        match mux.run(wire(&[(Frame::Open(id), ""), (Frame::Open(id), "")])) {
            Err(Error::Protocol(ProtocolError::DuplicateOpen(dup))) => assert_eq!(dup, id),
            res => panic!("unexpected run result: {:?}", res),
        }
    }

    #[test]
    fn accept_waits_for_peer() {
        let (mux, _sink) = mux(16);
        let acceptor = {
            let mux = mux.clone();
            thread::spawn(move || mux.accept().map(|rx| rx.id()))
        };
        thread::sleep(Duration::from_millis(10));
        mux.run(wire(&[(Frame::Open(ConnectionId(7)), "")])).unwrap();
        assert_eq!(acceptor.join().unwrap(), Some(ConnectionId(7)));
        assert!(mux.accept().is_none());
    }

    #[test]
    fn accept_returns_connections_opened_before_shutdown() {
        let (mux, _sink) = mux(16);
        mux.run(wire(&[(Frame::Open(ConnectionId(3)), "")])).unwrap();

        let mut rx = mux.accept().unwrap();
        assert_eq!(rx.id(), ConnectionId(3));
        assert_eq!(rx.recv_byte().unwrap(), None);
        assert!(mux.accept().is_none());
    }
}

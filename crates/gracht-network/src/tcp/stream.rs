use std::{
    collections::VecDeque,
    io::{self, IoSlice, Read, Write},
    net::SocketAddr,
};

use gracht::wire::{Header, HEADER_SIZE};
use mio::{Interest, Registry, Token, event::Event};
use tracing::{debug, warn};

// TODO: might need to tweak this
const RX_BUF_SIZE: usize = 32 * 1024;

/// Response type for all external calls.
///
/// `Alive` means the connection is still usable.
/// `Disconnected` means the peer is gone and the connection must be rebuilt.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnState {
    Alive,
    Disconnected,
}

enum ReadOutcome<'a> {
    PayloadDone { header: Header, payload: &'a [u8] },
    WouldBlock,
    Disconnected,
}

#[derive(Clone, Copy)]
enum RxState {
    /// Waiting for the message header.
    ReadingHeader { buf: [u8; HEADER_SIZE], have: usize },
    /// Reading the payload of `length` bytes.
    ReadingPayload { header: Header, offset: usize },
}

/// Single mio-backed TCP connection carrying gracht-framed messages.
///
/// Outbound:
///   - `write_or_enqueue_with(header, serialise)` writes the header and
///     payload produced by `serialise` to the socket, non-blocking.
///   - Any unwritten remainder is queued (this path allocates).
///   - Backlogged frames are flushed whenever the socket becomes writable.
///
/// Inbound:
///   - Reads the fixed-size header, then reads exactly `header.length`
///     payload bytes.
///   - When a full message is assembled, `poll_with` invokes the caller
///     callback with the header and payload.
///   - Continues reading messages until `WouldBlock` (no more are ready).
///
/// If `ConnState::Disconnected` is returned the caller must treat the
/// connection as dead.
pub struct TcpStream {
    stream: mio::net::TcpStream,
    token: Token,
    peer_addr: SocketAddr,

    rx_state: RxState,
    rx_buf: Vec<u8>,
    header_buf: [u8; HEADER_SIZE],
    send_buf: Vec<u8>,
    /// Filled when send would block.
    /// First entry will either be a full message or the current partially
    /// written head.
    send_backlog: VecDeque<Vec<u8>>,

    /// True if WRITABLE interest is currently registered in `poll`.
    /// Invariant: `writable_armed == !send_backlog.is_empty()`
    writable_armed: bool,
}

impl TcpStream {
    pub const SEND_BUF_SIZE: usize = 32 * 1024;

    #[inline(never)]
    pub(crate) fn from_stream(stream: mio::net::TcpStream, token: Token, peer_addr: SocketAddr) -> io::Result<Self> {
        stream.set_nodelay(true)?;

        Ok(Self {
            stream,
            token,
            peer_addr,
            rx_state: RxState::ReadingHeader { buf: [0; HEADER_SIZE], have: 0 },
            rx_buf: vec![0; RX_BUF_SIZE],
            header_buf: [0; HEADER_SIZE],
            send_buf: vec![0; Self::SEND_BUF_SIZE],
            send_backlog: VecDeque::with_capacity(64),
            writable_armed: false,
        })
    }

    /// Polls socket and calls `on_msg` for every fully assembled message.
    /// Message data is only valid for the duration of the callback.
    #[inline]
    pub fn poll_with<F>(&mut self, registry: &Registry, ev: &Event, on_msg: &mut F) -> ConnState
    where
        F: for<'a> FnMut(Token, Header, &'a [u8]),
    {
        if ev.is_readable() {
            loop {
                match self.read_message() {
                    ReadOutcome::PayloadDone { header, payload } => {
                        on_msg(ev.token(), header, payload);
                    }
                    ReadOutcome::WouldBlock => break,
                    ReadOutcome::Disconnected => return ConnState::Disconnected,
                }
            }
        }

        if ev.is_writable() && self.drain_backlog(registry) == ConnState::Disconnected {
            return ConnState::Disconnected;
        }

        ConnState::Alive
    }

    /// Happy path: serialises into `self.send_buf`, writes header + frame to
    /// stream. If the write would block or we have already blocked on a
    /// previous write, allocates a new vec and stores the frame in the
    /// backlog to be flushed at the next writable event.
    #[inline]
    pub fn write_or_enqueue_with<F>(&mut self, registry: &Registry, header: &Header, serialise: F) -> ConnState
    where
        F: Fn(&mut Vec<u8>),
    {
        self.serialise_frame(header, serialise);

        let len = self.send_buf.len();

        if !self.send_backlog.is_empty() {
            self.enqueue_back(registry, self.header_buf.to_vec());
            let data = self.alloc_vec(0, len);
            return self.enqueue_back(registry, data);
        }

        let frame = &self.send_buf[..len];
        match self
            .stream
            .write_vectored(&[IoSlice::new(self.header_buf.as_slice()), IoSlice::new(frame)])
        {
            Ok(0) => {
                warn!("tcp: stream failed to write, disconnecting");
                ConnState::Disconnected
            }
            Ok(n) if n == len + HEADER_SIZE => ConnState::Alive,

            Ok(n) if n < HEADER_SIZE => {
                let data = self.alloc_vec(0, len);
                self.enqueue_front(registry, data);
                let header_data = self.header_buf[n..HEADER_SIZE].to_vec();
                self.enqueue_front(registry, header_data)
            }
            Ok(n) => {
                let data = self.alloc_vec(n.saturating_sub(HEADER_SIZE), len);
                self.enqueue_front(registry, data)
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.enqueue_back(registry, self.header_buf.to_vec());
                let data = self.alloc_vec(0, len);
                self.enqueue_back(registry, data)
            }
            Err(err) => {
                warn!(?err, "tcp: stream write fail");
                ConnState::Disconnected
            }
        }
    }

    #[inline]
    fn alloc_vec(&mut self, start: usize, end: usize) -> Vec<u8> {
        self.send_buf[start..end].to_vec()
    }

    /// Flush queued data until kernel blocks, queue empty or we've written
    /// everything.
    #[inline]
    fn drain_backlog(&mut self, registry: &Registry) -> ConnState {
        while let Some(front) = self.send_backlog.front_mut() {
            match self.stream.write(front) {
                Ok(0) => return ConnState::Disconnected,

                Ok(n) => {
                    if n == front.len() {
                        self.send_backlog.pop_front();
                    } else {
                        front.drain(..n);
                    }
                }

                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,

                Err(err) => {
                    debug!(?err, "tcp: write from backlog");
                    return ConnState::Disconnected;
                }
            }
        }

        // Drop WRITABLE interest only when fully drained
        if self.send_backlog.is_empty() && self.writable_armed {
            if let Err(err) = registry.reregister(&mut self.stream, self.token, Interest::READABLE) {
                debug!(?err, "tcp: reregister drop writable");
                return ConnState::Disconnected;
            }
            self.writable_armed = false;
        }

        ConnState::Alive
    }

    /// Read a single complete message if present.
    /// Loops until a message is received or we've read everything and the
    /// read would block.
    #[inline]
    fn read_message(&mut self) -> ReadOutcome<'_> {
        loop {
            match self.rx_state {
                RxState::ReadingHeader { mut buf, mut have } => {
                    while have < HEADER_SIZE {
                        match self.stream.read(&mut buf[have..]) {
                            Ok(0) => return ReadOutcome::Disconnected,

                            Ok(n) => {
                                have += n;
                                if have == HEADER_SIZE {
                                    let header = match Header::decode(&buf) {
                                        Ok(header) => header,
                                        Err(_) => return ReadOutcome::Disconnected,
                                    };
                                    let msg_len = header.length as usize;
                                    if msg_len > self.rx_buf.len() {
                                        debug!(
                                            buf_len = self.rx_buf.len(),
                                            need_len = msg_len,
                                            "tcp: buffer resized"
                                        );
                                        self.rx_buf.resize(msg_len, 0);
                                    }
                                    self.rx_state = RxState::ReadingPayload { header, offset: 0 };
                                }
                            }

                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                self.rx_state = RxState::ReadingHeader { buf, have };
                                return ReadOutcome::WouldBlock;
                            }

                            Err(err) => {
                                debug!(?err, "tcp: read header");
                                return ReadOutcome::Disconnected;
                            }
                        }
                    }
                }

                RxState::ReadingPayload { header, mut offset } => {
                    let msg_len = header.length as usize;
                    while offset < msg_len {
                        match self.stream.read(&mut self.rx_buf[offset..msg_len]) {
                            Ok(0) => return ReadOutcome::Disconnected,

                            Ok(n) => {
                                offset += n;

                                // offset can never be > msg_len as we pass a fixed length slice
                                // into rx_buf. stream will only ever read <= msg_len bytes.
                                if offset == msg_len {
                                    self.rx_state =
                                        RxState::ReadingHeader { buf: [0; HEADER_SIZE], have: 0 };

                                    return ReadOutcome::PayloadDone {
                                        header,
                                        payload: &self.rx_buf[..msg_len],
                                    };
                                }
                            }

                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                self.rx_state = RxState::ReadingPayload { header, offset };
                                return ReadOutcome::WouldBlock;
                            }

                            Err(err) => {
                                debug!(?err, "tcp: read payload");
                                return ReadOutcome::Disconnected;
                            }
                        }
                    }
                }
            }
        }
    }

    #[inline]
    fn enqueue_front(&mut self, registry: &Registry, data: Vec<u8>) -> ConnState {
        self.send_backlog.push_front(data);
        self.arm_writable(registry)
    }

    #[inline]
    fn enqueue_back(&mut self, registry: &Registry, data: Vec<u8>) -> ConnState {
        self.send_backlog.push_back(data);
        self.arm_writable(registry)
    }

    /// Arm WRITABLE notifications when transitioning from empty -> non-empty
    /// queue. `self.poll` will start polling for writable events.
    #[inline]
    fn arm_writable(&mut self, registry: &Registry) -> ConnState {
        if !self.writable_armed {
            if let Err(err) = registry.reregister(
                &mut self.stream,
                self.token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                debug!(?err, "tcp: poll reregister");
                return ConnState::Disconnected;
            }
            self.writable_armed = true;
        }
        ConnState::Alive
    }

    /// Serialise payload into send buffer and prepend the wire header.
    #[inline(always)]
    fn serialise_frame<F>(&mut self, header: &Header, serialise: F)
    where
        F: Fn(&mut Vec<u8>),
    {
        self.send_buf.clear();
        serialise(&mut self.send_buf);
        let mut header = *header;
        header.length = self.send_buf.len() as u32;
        header.encode(&mut self.header_buf).expect("header buffer is sized for HEADER_SIZE");
    }

    pub fn close(&mut self, registry: &Registry) -> SocketAddr {
        debug!("terminating connection");
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.peer_addr
    }
}

/// Set kernel SO_SNDBUF and SO_RCVBUF on a mio TcpStream.
pub(crate) fn set_socket_buf_size(stream: &mio::net::TcpStream, size: usize) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

use std::{net::SocketAddr, os::fd::AsRawFd};

use lattice_timing::Micros;

use crate::ring::RingBuffer;

/// Transport-local connection identifier. Wraps the poll token; stable for
/// the lifetime of one socket, reused after teardown.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub usize);

impl From<mio::Token> for ConnId {
    fn from(t: mio::Token) -> Self {
        ConnId(t.0)
    }
}

impl From<ConnId> for mio::Token {
    fn from(id: ConnId) -> Self {
        mio::Token(id.0)
    }
}

/// One live peer socket with its buffers and book-keeping.
///
/// `owner` is the name of the connection-cache entry pointing at this
/// socket, if any. It is a weak back-reference: the cache owns the entry,
/// the connection only remembers the key so teardown can clear the entry's
/// side of the link.
pub struct NetConnection {
    pub(crate) stream: Option<mio::net::TcpStream>,
    pub id: ConnId,
    pub fd: i32,
    pub self_name: String,
    pub self_ip: String,
    pub self_port: u16,
    pub peer_name: String,
    pub peer_ip: String,
    pub peer_port: u16,
    pub recv_buf: RingBuffer,
    pub send_buf: RingBuffer,
    pub last_op_time: Micros,
    pub is_validated: bool,
    pub owner: Option<String>,
}

impl NetConnection {
    pub fn from_stream(
        stream: mio::net::TcpStream,
        id: ConnId,
        peer_addr: SocketAddr,
        send_buf_size: usize,
        recv_buf_size: usize,
    ) -> Self {
        let fd = stream.as_raw_fd();
        let (self_ip, self_port) = stream
            .local_addr()
            .map(|a| (a.ip().to_string(), a.port()))
            .unwrap_or_else(|_| (String::new(), 0));

        Self {
            stream: Some(stream),
            id,
            fd,
            self_name: String::new(),
            self_ip,
            self_port,
            peer_name: format!("{peer_addr}"),
            peer_ip: peer_addr.ip().to_string(),
            peer_port: peer_addr.port(),
            recv_buf: RingBuffer::with_capacity(recv_buf_size),
            send_buf: RingBuffer::with_capacity(send_buf_size),
            last_op_time: Micros::now(),
            is_validated: false,
            owner: None,
        }
    }

    /// A connection with no socket attached. Recv/send on it report the
    /// peer as gone; everything else behaves normally. Exists for pipeline
    /// drills that exercise buffers without the network.
    pub fn offline(peer_name: &str, send_buf_size: usize, recv_buf_size: usize) -> Self {
        Self {
            stream: None,
            id: ConnId(usize::MAX),
            fd: -1,
            self_name: String::new(),
            self_ip: String::new(),
            self_port: 0,
            peer_name: peer_name.to_string(),
            peer_ip: String::new(),
            peer_port: 0,
            recv_buf: RingBuffer::with_capacity(recv_buf_size),
            send_buf: RingBuffer::with_capacity(send_buf_size),
            last_op_time: Micros::ZERO,
            is_validated: false,
            owner: None,
        }
    }

    pub fn touch(&mut self, now: Micros) {
        self.last_op_time = now;
    }
}

impl std::fmt::Debug for NetConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetConnection")
            .field("id", &self.id)
            .field("fd", &self.fd)
            .field("peer_name", &self.peer_name)
            .field("peer_ip", &self.peer_ip)
            .field("peer_port", &self.peer_port)
            .field("is_validated", &self.is_validated)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

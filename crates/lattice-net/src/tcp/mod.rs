mod client;
mod server;

use std::io::{self, Read, Write};

pub use client::TcpClient;
use mio::net::TcpStream;
pub use server::TcpServer;
use tracing::debug;

use crate::connection::NetConnection;

/// Result of draining a socket into a connection's recv ring.
#[derive(Debug, PartialEq, Eq)]
pub enum RecvOutcome {
    /// Bytes landed in the ring (possibly zero when only WouldBlock hit).
    Received(usize),
    /// The peer is gone; the connection must be torn down.
    Broken,
}

/// What the listener and requester sides have in common; the main loop
/// drives both through this surface.
pub trait Transport {
    fn recv_into(&mut self, id: crate::ConnId) -> RecvOutcome;

    /// Flushes every non-empty send ring; returns ids whose send failed
    /// hard.
    fn send_pending(&mut self) -> Vec<crate::ConnId>;

    fn find_peer(&self, id: crate::ConnId) -> Option<&NetConnection>;

    fn find_peer_mut(&mut self, id: crate::ConnId) -> Option<&mut NetConnection>;

    /// Deregisters and closes the peer, handing back its connection state.
    fn close_peer(&mut self, id: crate::ConnId) -> Option<NetConnection>;
}

impl Transport for TcpServer {
    fn recv_into(&mut self, id: crate::ConnId) -> RecvOutcome {
        TcpServer::recv_into(self, id)
    }

    fn send_pending(&mut self) -> Vec<crate::ConnId> {
        TcpServer::send_pending(self)
    }

    fn find_peer(&self, id: crate::ConnId) -> Option<&NetConnection> {
        TcpServer::find_peer(self, id)
    }

    fn find_peer_mut(&mut self, id: crate::ConnId) -> Option<&mut NetConnection> {
        TcpServer::find_peer_mut(self, id)
    }

    fn close_peer(&mut self, id: crate::ConnId) -> Option<NetConnection> {
        self.shutdown_connection(id)
    }
}

impl Transport for TcpClient {
    fn recv_into(&mut self, id: crate::ConnId) -> RecvOutcome {
        TcpClient::recv_into(self, id)
    }

    fn send_pending(&mut self) -> Vec<crate::ConnId> {
        TcpClient::send_pending(self)
    }

    fn find_peer(&self, id: crate::ConnId) -> Option<&NetConnection> {
        TcpClient::find_peer(self, id)
    }

    fn find_peer_mut(&mut self, id: crate::ConnId) -> Option<&mut NetConnection> {
        TcpClient::find_peer_mut(self, id)
    }

    fn close_peer(&mut self, id: crate::ConnId) -> Option<NetConnection> {
        self.disconnect_server(id)
    }
}

/// Set kernel SO_SNDBUF and SO_RCVBUF on a mio TcpStream.
pub(crate) fn set_socket_buf_size(stream: &TcpStream, size: usize) {
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

/// Reads until the kernel blocks or the recv ring fills. A zero-byte read
/// or a hard error means the peer is gone.
pub fn recv_to_connection(conn: &mut NetConnection) -> RecvOutcome {
    let Some(stream) = conn.stream.as_mut() else {
        return RecvOutcome::Broken;
    };

    let mut total = 0usize;
    loop {
        let dst = conn.recv_buf.write_slice();
        if dst.is_empty() {
            // ring full, backpressure: leave the rest in the kernel
            return RecvOutcome::Received(total);
        }

        match stream.read(dst) {
            Ok(0) => return RecvOutcome::Broken,
            Ok(n) => {
                conn.recv_buf.advance_write(n);
                total += n;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return RecvOutcome::Received(total);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                debug!(?err, "tcp: read into ring");
                return RecvOutcome::Broken;
            }
        }
    }
}

/// Writes the send ring out until it drains or the kernel blocks. Returns
/// bytes written; `Err` means the connection is unusable.
pub fn send_from_connection(conn: &mut NetConnection) -> io::Result<usize> {
    let Some(stream) = conn.stream.as_mut() else {
        return Err(io::Error::new(io::ErrorKind::NotConnected, "no socket attached"));
    };

    let mut total = 0usize;
    while !conn.send_buf.is_empty() {
        match stream.write(conn.send_buf.read_slice()) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "peer stopped accepting"));
            }
            Ok(n) => {
                conn.send_buf.advance_read(n);
                total += n;
            }
            // NotConnected shows up while a non-blocking connect settles;
            // the bytes stay in the ring for the next round.
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::NotConnected =>
            {
                break;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(total)
}

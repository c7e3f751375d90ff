use std::{collections::HashMap, io, net::SocketAddr, time::Duration};

use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info, warn};

use crate::{
    connection::{ConnId, NetConnection},
    tcp::{RecvOutcome, recv_to_connection, send_from_connection, set_socket_buf_size},
};

/// Requesting side of the transport: every upstream this node has dialled.
/// Reconnection policy lives with the heartbeat task; this type only opens,
/// polls and closes sockets.
pub struct TcpClient {
    poll: Poll,
    events: Events,
    peers: HashMap<ConnId, NetConnection>,
    ready: Vec<ConnId>,
    self_name: String,
    socket_buf_size: Option<usize>,
    connect_timeout: Duration,
    next_token: usize,
}

impl TcpClient {
    pub fn new(self_name: &str, connect_timeout: Duration) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(128),
            peers: HashMap::new(),
            ready: Vec::new(),
            self_name: self_name.to_string(),
            socket_buf_size: None,
            connect_timeout,
            next_token: 1,
        })
    }

    pub fn with_socket_buf_size(mut self, size: usize) -> Self {
        self.socket_buf_size = Some(size);
        self
    }

    /// Dials an upstream within the configured connect-trying timeout, then
    /// switches the socket to non-blocking and registers it.
    pub fn connect_server(
        &mut self,
        ip: &str,
        port: u16,
        send_buf_size: usize,
        recv_buf_size: usize,
    ) -> io::Result<ConnId> {
        let addr: SocketAddr = format!("{ip}:{port}")
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let std_stream = std::net::TcpStream::connect_timeout(&addr, self.connect_timeout)?;
        std_stream.set_nonblocking(true)?;
        let mut stream = mio::net::TcpStream::from_std(std_stream);
        stream.set_nodelay(true)?;
        if let Some(size) = self.socket_buf_size {
            set_socket_buf_size(&stream, size);
        }

        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll.registry().register(&mut stream, token, Interest::READABLE)?;

        let id = ConnId::from(token);
        let mut conn = NetConnection::from_stream(stream, id, addr, send_buf_size, recv_buf_size);
        conn.self_name = self.self_name.clone();

        info!(id = id.0, fd = conn.fd, %addr, "connected to upstream");
        self.peers.insert(id, conn);
        Ok(id)
    }

    pub fn poll(&mut self, timeout: Duration) -> &[ConnId] {
        self.ready.clear();
        if let Err(err) = self.poll.poll(&mut self.events, Some(timeout)) {
            if err.kind() != io::ErrorKind::Interrupted {
                warn!(?err, "tcp client: poll failed");
            }
            return &self.ready;
        }

        for ev in self.events.iter() {
            let id = ConnId::from(ev.token());
            if !self.ready.contains(&id) {
                self.ready.push(id);
            }
        }
        &self.ready
    }

    pub fn recv_into(&mut self, id: ConnId) -> RecvOutcome {
        match self.peers.get_mut(&id) {
            Some(conn) => recv_to_connection(conn),
            None => RecvOutcome::Broken,
        }
    }

    pub fn send_pending(&mut self) -> Vec<ConnId> {
        let mut broken = Vec::new();
        for (id, conn) in self.peers.iter_mut() {
            if conn.send_buf.is_empty() {
                continue;
            }
            match send_from_connection(conn) {
                Ok(n) if n > 0 => debug!(id = id.0, bytes = n, "flushed"),
                Ok(_) => {}
                Err(err) => {
                    warn!(id = id.0, ?err, "tcp client: send failed");
                    broken.push(*id);
                }
            }
        }
        broken
    }

    pub fn send_from(&mut self, id: ConnId) -> io::Result<usize> {
        match self.peers.get_mut(&id) {
            Some(conn) => send_from_connection(conn),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "unknown connection id")),
        }
    }

    pub fn disconnect_server(&mut self, id: ConnId) -> Option<NetConnection> {
        let mut conn = self.peers.remove(&id)?;
        if let Some(stream) = conn.stream.as_mut() {
            let _ = self.poll.registry().deregister(stream);
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        debug!(id = id.0, peer = %conn.peer_name, "upstream disconnected");
        Some(conn)
    }

    pub fn find_peer(&self, id: ConnId) -> Option<&NetConnection> {
        self.peers.get(&id)
    }

    pub fn find_peer_mut(&mut self, id: ConnId) -> Option<&mut NetConnection> {
        self.peers.get_mut(&id)
    }

    pub fn peers(&self) -> impl Iterator<Item = (&ConnId, &NetConnection)> {
        self.peers.iter()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn teardown(&mut self) {
        let ids: Vec<ConnId> = self.peers.keys().copied().collect();
        for id in ids {
            self.disconnect_server(id);
        }
    }
}

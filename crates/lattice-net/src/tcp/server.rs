use std::{collections::HashMap, io, net::SocketAddr, time::Duration};

use mio::{Events, Interest, Poll, Token, net::TcpListener};
use tracing::{debug, info, warn};

use crate::{
    connection::{ConnId, NetConnection},
    tcp::{RecvOutcome, recv_to_connection, send_from_connection, set_socket_buf_size},
};

const LISTENER: Token = Token(0);

/// Accepting side of the transport: one listener socket plus every peer it
/// has accepted, each with its own rings. Drive it from the main loop:
/// `poll`, then `accept_ready` / `recv_into` per ready id, then
/// `send_pending` once per round.
pub struct TcpServer {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    peers: HashMap<ConnId, NetConnection>,
    ready: Vec<ConnId>,
    self_name: String,
    socket_buf_size: Option<usize>,
    next_token: usize,
}

impl TcpServer {
    pub fn bind(addr: SocketAddr, self_name: &str) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;
        info!(%addr, name = self_name, "listening");

        Ok(Self {
            poll,
            events: Events::with_capacity(128),
            listener,
            peers: HashMap::new(),
            ready: Vec::new(),
            self_name: self_name.to_string(),
            socket_buf_size: None,
            next_token: 1,
        })
    }

    pub fn with_socket_buf_size(mut self, size: usize) -> Self {
        self.socket_buf_size = Some(size);
        self
    }

    /// Id reported by `poll` when the listener itself is ready.
    pub fn listener_id(&self) -> ConnId {
        ConnId::from(LISTENER)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Polls with a bounded wait and returns every id with pending IO.
    pub fn poll(&mut self, timeout: Duration) -> &[ConnId] {
        self.ready.clear();
        if let Err(err) = self.poll.poll(&mut self.events, Some(timeout)) {
            if err.kind() != io::ErrorKind::Interrupted {
                warn!(?err, "tcp server: poll failed");
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

    /// Accepts one pending connection and registers it for readiness.
    pub fn accept_new_connection(
        &mut self,
        send_buf_size: usize,
        recv_buf_size: usize,
    ) -> io::Result<ConnId> {
        let (mut stream, peer_addr) = self.listener.accept()?;
        stream.set_nodelay(true)?;
        if let Some(size) = self.socket_buf_size {
            set_socket_buf_size(&stream, size);
        }

        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll.registry().register(&mut stream, token, Interest::READABLE)?;

        let id = ConnId::from(token);
        let mut conn = NetConnection::from_stream(stream, id, peer_addr, send_buf_size, recv_buf_size);
        conn.self_name = self.self_name.clone();

        info!(
            id = id.0,
            fd = conn.fd,
            peer = %format!("{}:{}", conn.peer_ip, conn.peer_port),
            send_buf = send_buf_size,
            recv_buf = recv_buf_size,
            "client connected"
        );
        self.peers.insert(id, conn);
        Ok(id)
    }

    pub fn recv_into(&mut self, id: ConnId) -> RecvOutcome {
        match self.peers.get_mut(&id) {
            Some(conn) => recv_to_connection(conn),
            None => RecvOutcome::Broken,
        }
    }

    /// Flushes every non-empty send ring.
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
                    warn!(id = id.0, ?err, "tcp server: send failed");
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

    pub fn shutdown_connection(&mut self, id: ConnId) -> Option<NetConnection> {
        let mut conn = self.peers.remove(&id)?;
        if let Some(stream) = conn.stream.as_mut() {
            let _ = self.poll.registry().deregister(stream);
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        debug!(id = id.0, peer = %conn.peer_name, "connection shut down");
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

    /// Closes every peer and the listener.
    pub fn teardown(&mut self) {
        let ids: Vec<ConnId> = self.peers.keys().copied().collect();
        for id in ids {
            self.shutdown_connection(id);
        }
        let _ = self.poll.registry().deregister(&mut self.listener);
    }
}

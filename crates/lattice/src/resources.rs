use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use lattice_net::{
    ConnIndex, ConnectionCache, DispatchPolicy, NetError,
    tcp::{TcpClient, TcpServer},
};
use lattice_timing::Micros;
use tracing::warn;

use crate::{
    config::{Config, SecondaryMode},
    error::CoreError,
    processor::PacketProcessor,
    session::SessionStore,
};

/// The primary and secondary connection caches plus the configured rule
/// for when the secondary participates.
pub struct CachePair {
    pub primary: ConnectionCache,
    pub secondary: ConnectionCache,
    pub mode: SecondaryMode,
}

impl CachePair {
    pub fn new(mode: SecondaryMode) -> Self {
        Self {
            primary: ConnectionCache::default(),
            secondary: ConnectionCache::default(),
            mode,
        }
    }

    pub fn find(&self, name: &str) -> Option<&ConnIndex> {
        self.primary.find(name).or_else(|| self.secondary.find(name))
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut ConnIndex> {
        if self.primary.find(name).is_some() {
            return self.primary.find_mut(name);
        }
        self.secondary.find_mut(name)
    }

    /// Unicast pick: the primary first, the secondary as failover.
    pub fn pick(
        &self,
        server_type: &str,
        policy: DispatchPolicy,
        route_id: u64,
    ) -> Result<(&str, &ConnIndex), NetError> {
        match self.primary.pick(server_type, policy, route_id, true) {
            Ok(found) => Ok(found),
            Err(_) => self.secondary.pick(server_type, policy, route_id, true),
        }
    }

    /// Severs the entry's link to a closed socket.
    pub fn clear_link(&mut self, name: &str) {
        if let Some(entry) = self.find_mut(name) {
            entry.conn = None;
        }
    }

    /// Type-addressed send across the pair. Unicast always fails over to
    /// the secondary; fan-out walks the secondary only in
    /// [`SecondaryMode::Fanout`]. `sink` resolves a live entry to the
    /// actual enqueue.
    pub fn send_by_type<F>(
        &self,
        server_type: &str,
        max: usize,
        bytes: &[u8],
        to_all: bool,
        policy: DispatchPolicy,
        route_id: u64,
        mut sink: F,
    ) -> Result<usize, NetError>
    where
        F: FnMut(&str, lattice_net::ConnId, &[u8]) -> Option<usize>,
    {
        if !to_all {
            let (name, entry) = self.pick(server_type, policy, route_id)?;
            let id = entry.conn.ok_or_else(|| NetError::NotConnected(name.to_string()))?;
            return sink(name, id, bytes)
                .ok_or_else(|| NetError::AllDead(server_type.to_string()));
        }

        let mut ok = 0usize;
        let mut total = 0usize;
        {
            let mut counting = |name: &str, id: lattice_net::ConnId, b: &[u8]| {
                let sent = sink(name, id, b);
                if let Some(n) = sent {
                    ok += 1;
                    total += n;
                }
                sent
            };
            let _ = self
                .primary
                .send_by_type(server_type, max, bytes, true, policy, route_id, &mut counting);
        }
        if self.mode == SecondaryMode::Fanout && ok < max {
            let remaining = max - ok;
            let mut counting = |name: &str, id: lattice_net::ConnId, b: &[u8]| {
                let sent = sink(name, id, b);
                if let Some(n) = sent {
                    ok += 1;
                    total += n;
                }
                sent
            };
            let _ = self.secondary.send_by_type(
                server_type,
                remaining,
                bytes,
                true,
                policy,
                route_id,
                &mut counting,
            );
        }

        if ok == 0 {
            return Err(NetError::AllDead(server_type.to_string()));
        }
        Ok(total)
    }

    /// Name-addressed send, whichever cache holds the entry.
    pub fn send_by_name<F>(&self, name: &str, bytes: &[u8], sink: F) -> Result<usize, NetError>
    where
        F: FnMut(&str, lattice_net::ConnId, &[u8]) -> Option<usize>,
    {
        if self.primary.find(name).is_some() {
            return self.primary.send_by_name(name, bytes, sink);
        }
        self.secondary.send_by_name(name, bytes, sink)
    }
}

/// Everything the main loop and the timed tasks operate on. One instance
/// per process, built in `App::build` and handed around by `&mut`; no
/// component reaches for global state.
pub struct Resources {
    pub config: Config,
    pub caches: CachePair,
    pub server: Option<TcpServer>,
    pub client: TcpClient,
    pub processor: PacketProcessor,
    pub session_store: Box<dyn SessionStore>,
    pub shutdown: Arc<AtomicBool>,
    /// Wall clock of the current main-loop round.
    pub now: Micros,
}

impl Resources {
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Routes an already-assembled packet to a cached peer by name.
    /// Returns the bytes queued.
    pub fn forward_to(&mut self, name: &str, bytes: &[u8]) -> Result<usize, CoreError> {
        let entry = self
            .caches
            .find(name)
            .ok_or_else(|| NetError::NotFound(name.to_string()))?;
        let id = entry.conn.ok_or_else(|| NetError::NotConnected(name.to_string()))?;
        let is_server = entry.is_server;

        let conn = if is_server {
            self.client.find_peer_mut(id)
        } else {
            self.server.as_mut().and_then(|s| s.find_peer_mut(id))
        };
        let Some(conn) = conn else {
            return Err(NetError::NotConnected(name.to_string()).into());
        };

        // A partial packet would corrupt the stream, so it is all or nothing.
        if conn.send_buf.free_space() < bytes.len() {
            warn!(
                peer = name,
                free = conn.send_buf.free_space(),
                wanted = bytes.len(),
                "send ring too full, forwarded packet dropped"
            );
            return Ok(0);
        }
        Ok(conn.send_buf.push(bytes))
    }
}

#[cfg(test)]
mod tests {
    use lattice_net::ConnId;

    use super::*;

    fn entry(server_type: &str, conn: Option<usize>) -> ConnIndex {
        ConnIndex {
            server_type: server_type.into(),
            is_server: true,
            conn: conn.map(ConnId),
            ..ConnIndex::default()
        }
    }

    #[test]
    fn pick_fails_over_to_the_secondary() {
        let mut pair = CachePair::new(SecondaryMode::Failover);
        pair.primary.add("p-dead", entry("svc", None)).unwrap();
        pair.secondary.add("s-live", entry("svc", Some(3))).unwrap();

        let (name, _) = pair.pick("svc", DispatchPolicy::ById, 0).unwrap();
        assert_eq!(name, "s-live");
    }

    #[test]
    fn fanout_mode_walks_both_caches() {
        let mut pair = CachePair::new(SecondaryMode::Fanout);
        pair.primary.add("p1", entry("svc", Some(1))).unwrap();
        pair.secondary.add("s1", entry("svc", Some(2))).unwrap();

        let mut hit = Vec::new();
        let sent = pair
            .send_by_type("svc", 8, b"all", true, DispatchPolicy::Randomly, 0, |name, _, b| {
                hit.push(name.to_string());
                Some(b.len())
            })
            .unwrap();
        assert_eq!(sent, 6);
        assert_eq!(hit, ["p1", "s1"]);
    }

    #[test]
    fn failover_mode_keeps_fanout_primary_only() {
        let mut pair = CachePair::new(SecondaryMode::Failover);
        pair.primary.add("p1", entry("svc", Some(1))).unwrap();
        pair.secondary.add("s1", entry("svc", Some(2))).unwrap();

        let mut hit = Vec::new();
        pair.send_by_type("svc", 8, b"all", true, DispatchPolicy::Randomly, 0, |name, _, b| {
            hit.push(name.to_string());
            Some(b.len())
        })
        .unwrap();
        assert_eq!(hit, ["p1"]);
    }

    #[test]
    fn send_by_name_looks_in_both_caches() {
        let mut pair = CachePair::new(SecondaryMode::Failover);
        pair.secondary.add("backup", entry("svc", Some(4))).unwrap();
        let n = pair.send_by_name("backup", b"hey", |_, _, b| Some(b.len())).unwrap();
        assert_eq!(n, 3);
    }

    #[test]
    fn clear_link_reaches_both_caches() {
        let mut pair = CachePair::new(SecondaryMode::Failover);
        pair.primary.add("a", entry("svc", Some(1))).unwrap();
        pair.secondary.add("b", entry("svc", Some(2))).unwrap();

        pair.clear_link("a");
        pair.clear_link("b");
        assert!(pair.primary.find("a").unwrap().conn.is_none());
        assert!(pair.secondary.find("b").unwrap().conn.is_none());
    }
}

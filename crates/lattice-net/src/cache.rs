use std::collections::BTreeMap;

use indexmap::IndexMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use strum::EnumString;
use tracing::{debug, warn};

use crate::{connection::ConnId, error::NetError};

/// How outbound traffic picks a peer among nodes of one type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum DispatchPolicy {
    #[default]
    Randomly,
    ById,
    /// No load signal is wired yet; behaves like `Randomly`.
    LeastLoad,
}

/// Extensible attribute bag of a cache entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnAttr {
    pub is_primary: bool,
}

impl Default for ConnAttr {
    fn default() -> Self {
        Self { is_primary: true }
    }
}

/// Connection-cache entry, keyed by the peer's logical name.
///
/// `conn` holds the live connection id or nothing: a configured upstream
/// that has not connected yet (or has dropped) keeps its entry with `conn`
/// cleared. Clearing the id clears everything that made the entry "live".
#[derive(Clone, Debug, Default)]
pub struct ConnIndex {
    pub server_type: String,
    pub is_server: bool,
    pub alias: String,
    pub peer_ip: String,
    pub peer_port: u16,
    pub attrs: ConnAttr,
    pub conn: Option<ConnId>,
}

impl ConnIndex {
    #[inline]
    pub fn is_alive(&self) -> bool {
        self.conn.is_some()
    }

    pub fn attr_string(&self) -> &'static str {
        if self.attrs.is_primary { "primary" } else { "secondary" }
    }
}

/// Live-peer index: a unique name map plus a type multimap for fan-out and
/// failover picks. Two instances exist per process ("primary" and
/// "secondary"), distinguished only by which entries land in them.
#[derive(Default)]
pub struct ConnectionCache {
    by_name: IndexMap<String, ConnIndex>,
    by_type: BTreeMap<String, Vec<String>>,
}

impl ConnectionCache {
    pub fn add(&mut self, name: &str, entry: ConnIndex) -> Result<(), NetError> {
        if self.by_name.contains_key(name) {
            return Err(NetError::Duplicate(name.to_string()));
        }

        self.by_type.entry(entry.server_type.clone()).or_default().push(name.to_string());
        self.by_name.insert(name.to_string(), entry);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<(), NetError> {
        let entry = self.by_name.shift_remove(name).ok_or_else(|| {
            NetError::NotFound(name.to_string())
        })?;

        if let Some(names) = self.by_type.get_mut(&entry.server_type) {
            names.retain(|n| n != name);
            if names.is_empty() {
                self.by_type.remove(&entry.server_type);
            }
        }
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&ConnIndex> {
        self.by_name.get(name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut ConnIndex> {
        self.by_name.get_mut(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn names_of_type(&self, server_type: &str) -> &[String] {
        self.by_type.get(server_type).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Picks one connection of `server_type`.
    ///
    /// The walk has two phases: first from a policy-derived offset
    /// (`by-id` is deterministic on `route_id`, everything else random);
    /// if the seeded pick lands on a dead entry and `alive_only` is set,
    /// the walk restarts at zero and scans linearly for the first live one.
    pub fn pick(
        &self,
        server_type: &str,
        policy: DispatchPolicy,
        route_id: u64,
        alive_only: bool,
    ) -> Result<(&str, &ConnIndex), NetError> {
        let names = self.names_of_type(server_type);
        let node_count = names.len();
        if node_count == 0 {
            return Err(NetError::NoSuchType(server_type.to_string()));
        }

        let offset = match policy {
            DispatchPolicy::ById => (route_id % node_count as u64) as usize,
            DispatchPolicy::Randomly | DispatchPolicy::LeastLoad => {
                rand::rng().random_range(0..node_count)
            }
        };

        // Phase one: the seeded pick.
        if let Some(name) = names.get(offset) {
            match self.by_name.get(name) {
                Some(entry) if !alive_only || entry.is_alive() => return Ok((name, entry)),
                Some(_) => {}
                None => warn!(name = %name, "type index points at a missing entry"),
            }
        }

        // Phase two: linear scan from the start, first live entry wins.
        for name in names {
            if let Some(entry) = self.by_name.get(name) {
                if entry.is_alive() {
                    return Ok((name, entry));
                }
            }
        }

        Err(NetError::AllDead(server_type.to_string()))
    }

    /// Sends `bytes` to nodes of `server_type` through `sink`, which maps a
    /// live entry to the actual enqueue and reports bytes taken (or `None`
    /// on failure). One pick when `to_all` is off; otherwise every live node
    /// until `max` sends succeeded. Returns total bytes sent.
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
        F: FnMut(&str, ConnId, &[u8]) -> Option<usize>,
    {
        if !to_all {
            let (name, entry) = self.pick(server_type, policy, route_id, true)?;
            let id = entry.conn.ok_or_else(|| NetError::NotConnected(name.to_string()))?;
            return sink(name, id, bytes).ok_or_else(|| NetError::AllDead(server_type.to_string()));
        }

        let mut ok_count = 0usize;
        let mut bytes_sent = 0usize;

        for name in self.names_of_type(server_type) {
            let Some(entry) = self.by_name.get(name) else { continue };
            let Some(id) = entry.conn else {
                debug!(name = %name, "skipping dead node during fan-out");
                continue;
            };
            match sink(name, id, bytes) {
                Some(n) => {
                    ok_count += 1;
                    bytes_sent += n;
                    if ok_count >= max {
                        break;
                    }
                }
                None => warn!(name = %name, "fan-out send failed, moving on"),
            }
        }

        if ok_count == 0 {
            return Err(NetError::AllDead(server_type.to_string()));
        }
        Ok(bytes_sent)
    }

    /// Direct send to a named peer through `sink`.
    pub fn send_by_name<F>(&self, name: &str, bytes: &[u8], mut sink: F) -> Result<usize, NetError>
    where
        F: FnMut(&str, ConnId, &[u8]) -> Option<usize>,
    {
        let entry = self.by_name.get(name).ok_or_else(|| NetError::NotFound(name.to_string()))?;
        let id = entry.conn.ok_or_else(|| NetError::NotConnected(name.to_string()))?;
        sink(name, id, bytes).ok_or_else(|| NetError::NotConnected(name.to_string()))
    }

    pub fn for_each(&self, mut op: impl FnMut(&str, &ConnIndex)) {
        for (name, entry) in &self.by_name {
            op(name, entry);
        }
    }

    pub fn for_each_mut(&mut self, mut op: impl FnMut(&str, &mut ConnIndex)) {
        for (name, entry) in self.by_name.iter_mut() {
            op(name, entry);
        }
    }

    /// Debug dump of every entry.
    pub fn profile(&self) {
        debug!("connection cache profile begin");
        for (name, e) in &self.by_name {
            debug!(
                name = %name,
                conn = ?e.conn,
                address = %format!("{}:{}", e.peer_ip, e.peer_port),
                alias = %e.alias,
                server_type = %e.server_type,
                is_server = e.is_server,
                attr = e.attr_string(),
                "entry"
            );
        }
        debug!("connection cache profile end");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(server_type: &str, conn: Option<usize>) -> ConnIndex {
        ConnIndex {
            server_type: server_type.to_string(),
            is_server: true,
            alias: String::new(),
            peer_ip: "127.0.0.1".into(),
            peer_port: 9000,
            attrs: ConnAttr::default(),
            conn: conn.map(ConnId),
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut cache = ConnectionCache::default();
        cache.add("a", entry("svc", None)).unwrap();
        assert!(matches!(cache.add("a", entry("svc", None)), Err(NetError::Duplicate(_))));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn remove_cleans_both_indexes() {
        let mut cache = ConnectionCache::default();
        cache.add("a", entry("svc", None)).unwrap();
        cache.add("b", entry("svc", None)).unwrap();
        cache.remove("a").unwrap();
        assert!(cache.find("a").is_none());
        assert_eq!(cache.names_of_type("svc"), ["b".to_string()].as_slice());

        cache.remove("b").unwrap();
        assert!(cache.names_of_type("svc").is_empty());
        assert!(matches!(cache.remove("b"), Err(NetError::NotFound(_))));
    }

    #[test]
    fn pick_by_id_is_deterministic() {
        let mut cache = ConnectionCache::default();
        cache.add("a", entry("svc", Some(1))).unwrap();
        cache.add("b", entry("svc", Some(2))).unwrap();

        // 3 mod 2 = 1 -> second entry
        let (name, _) = cache.pick("svc", DispatchPolicy::ById, 3, true).unwrap();
        assert_eq!(name, "b");
        let (name, _) = cache.pick("svc", DispatchPolicy::ById, 4, true).unwrap();
        assert_eq!(name, "a");
    }

    #[test]
    fn pick_falls_back_to_first_live() {
        let mut cache = ConnectionCache::default();
        cache.add("dead", entry("svc", None)).unwrap();
        cache.add("live", entry("svc", Some(5))).unwrap();

        // offset 0 lands on the dead entry; the linear rescan finds the live one
        let (name, e) = cache.pick("svc", DispatchPolicy::ById, 4, true).unwrap();
        assert_eq!(name, "live");
        assert_eq!(e.conn, Some(ConnId(5)));
    }

    #[test]
    fn pick_reports_missing_type_and_all_dead() {
        let mut cache = ConnectionCache::default();
        assert!(matches!(
            cache.pick("ghost", DispatchPolicy::Randomly, 0, true),
            Err(NetError::NoSuchType(_))
        ));

        cache.add("a", entry("svc", None)).unwrap();
        assert!(matches!(
            cache.pick("svc", DispatchPolicy::Randomly, 0, true),
            Err(NetError::AllDead(_))
        ));
        // dead entries are fine when liveness is not required
        assert!(cache.pick("svc", DispatchPolicy::Randomly, 0, false).is_ok());
    }

    #[test]
    fn fan_out_stops_at_max_and_skips_dead() {
        let mut cache = ConnectionCache::default();
        cache.add("a", entry("svc", Some(1))).unwrap();
        cache.add("dead", entry("svc", None)).unwrap();
        cache.add("b", entry("svc", Some(2))).unwrap();
        cache.add("c", entry("svc", Some(3))).unwrap();

        let mut hits = Vec::new();
        let sent = cache
            .send_by_type("svc", 2, b"ping", true, DispatchPolicy::Randomly, 0, |name, _, b| {
                hits.push(name.to_string());
                Some(b.len())
            })
            .unwrap();
        assert_eq!(sent, 8);
        assert_eq!(hits, ["a", "b"]);
    }

    #[test]
    fn fan_out_with_no_live_nodes_is_all_dead() {
        let mut cache = ConnectionCache::default();
        cache.add("a", entry("svc", None)).unwrap();
        let r = cache.send_by_type("svc", 8, b"x", true, DispatchPolicy::Randomly, 0, |_, _, _| {
            panic!("sink must not run")
        });
        assert!(matches!(r, Err(NetError::AllDead(_))));
    }

    #[test]
    fn send_by_name_requires_a_live_entry() {
        let mut cache = ConnectionCache::default();
        cache.add("a", entry("svc", None)).unwrap();
        assert!(matches!(
            cache.send_by_name("a", b"x", |_, _, b| Some(b.len())),
            Err(NetError::NotConnected(_))
        ));
        assert!(matches!(
            cache.send_by_name("ghost", b"x", |_, _, b| Some(b.len())),
            Err(NetError::NotFound(_))
        ));

        cache.find_mut("a").unwrap().conn = Some(ConnId(9));
        assert_eq!(cache.send_by_name("a", b"xyz", |_, _, b| Some(b.len())).unwrap(), 3);
    }

    #[test]
    fn policy_parses_from_config_strings() {
        use std::str::FromStr;
        assert_eq!(DispatchPolicy::from_str("randomly").unwrap(), DispatchPolicy::Randomly);
        assert_eq!(DispatchPolicy::from_str("by-id").unwrap(), DispatchPolicy::ById);
        assert_eq!(DispatchPolicy::from_str("least-load").unwrap(), DispatchPolicy::LeastLoad);
        assert!(DispatchPolicy::from_str("round-robin").is_err());
    }
}

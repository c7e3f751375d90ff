use std::collections::HashMap;

use lattice_timing::Micros;
use tracing::info;

/// Response dedupe store: once a session's response went out, replays of
/// the same session id are answered from here without re-running business.
///
/// The framework ships an in-memory implementation; a database-backed one
/// plugs in through this trait.
pub trait SessionStore {
    fn exists(&self, sid: &str) -> bool;

    /// The serialized response packet saved for `sid`, if any.
    fn fetch(&self, sid: &str) -> Option<Vec<u8>>;

    fn save(&mut self, sid: &str, packet: Vec<u8>, now: Micros);

    /// Drops sessions older than `keep`. Returns how many went.
    fn clean_expired(&mut self, now: Micros, keep: Micros) -> usize;
}

#[derive(Default)]
pub struct MemorySessionStore {
    map: HashMap<String, (Vec<u8>, Micros)>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl SessionStore for MemorySessionStore {
    fn exists(&self, sid: &str) -> bool {
        self.map.contains_key(sid)
    }

    fn fetch(&self, sid: &str) -> Option<Vec<u8>> {
        self.map.get(sid).map(|(bytes, _)| bytes.clone())
    }

    fn save(&mut self, sid: &str, packet: Vec<u8>, now: Micros) {
        self.map.insert(sid.to_string(), (packet, now));
    }

    fn clean_expired(&mut self, now: Micros, keep: Micros) -> usize {
        let before = self.map.len();
        self.map.retain(|_, (_, saved)| now.elapsed_since(*saved) <= keep);
        let removed = before - self.map.len();
        if removed > 0 {
            info!(removed, "expired sessions cleaned up");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_fetch_roundtrip() {
        let mut store = MemorySessionStore::new();
        assert!(!store.exists("s1"));

        store.save("s1", vec![1, 2, 3], Micros::from_secs(1));
        assert!(store.exists("s1"));
        assert_eq!(store.fetch("s1"), Some(vec![1, 2, 3]));
        assert_eq!(store.fetch("s2"), None);
    }

    #[test]
    fn expiry_respects_the_keep_window() {
        let mut store = MemorySessionStore::new();
        store.save("old", vec![1], Micros::from_secs(0));
        store.save("new", vec![2], Micros::from_secs(50));

        let removed = store.clean_expired(Micros::from_secs(60), Micros::from_secs(30));
        assert_eq!(removed, 1);
        assert!(!store.exists("old"));
        assert!(store.exists("new"));
    }
}

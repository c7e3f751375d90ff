use std::collections::HashMap;

use lattice_net::ConnId;
use lattice_proto::Body;
use lattice_timing::Micros;
use tracing::{debug, info};

/// A message still waiting for its end-flag fragment.
pub struct ReassemblyEntry {
    pub cmd: u32,
    pub from: ConnId,
    pub from_name: String,
    /// Where the eventual response is headed, when business redirected it.
    pub to_name: Option<String>,
    pub body: Body,
    pub last_op_time: Micros,
}

/// In-flight messages, keyed by session id.
///
/// Two kinds of entries live here. Reassembly entries (`to_name` unset)
/// saw a `packet_number = 1` fragment and no end-flag fragment yet; they
/// complete and are removed by the processor. Route records (`to_name`
/// set) mark a request forwarded to an upstream whose reply is still
/// pending; the reply clears them. Both expire under the message-clean
/// task.
#[derive(Default)]
pub struct ReassemblyCache {
    map: HashMap<String, ReassemblyEntry>,
}

impl ReassemblyCache {
    pub fn find(&self, sid: &str) -> Option<&ReassemblyEntry> {
        self.map.get(sid)
    }

    pub fn find_mut(&mut self, sid: &str) -> Option<&mut ReassemblyEntry> {
        self.map.get_mut(sid)
    }

    pub fn contains(&self, sid: &str) -> bool {
        self.map.contains_key(sid)
    }

    pub fn insert(&mut self, sid: &str, entry: ReassemblyEntry) {
        debug!(sid, cmd = format_args!("{:#010X}", entry.cmd), "message added to cache");
        self.map.insert(sid.to_string(), entry);
    }

    pub fn remove(&mut self, sid: &str) -> Option<ReassemblyEntry> {
        self.map.remove(sid)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drops every entry older than its TTL. Commands flagged as
    /// time-consuming get the wider `max_timeout`.
    pub fn clean_expired(
        &mut self,
        now: Micros,
        default_timeout: Micros,
        max_timeout: Micros,
        is_time_consuming: impl Fn(u32) -> bool,
    ) -> usize {
        let before = self.map.len();
        self.map.retain(|sid, entry| {
            let timeout =
                if is_time_consuming(entry.cmd) { max_timeout } else { default_timeout };
            let expired = now.elapsed_since(entry.last_op_time) > timeout;
            if expired {
                info!(
                    sid,
                    cmd = format_args!("{:#010X}", entry.cmd),
                    last_op = entry.last_op_time.0,
                    "expired message cleaned up"
                );
            }
            !expired
        });
        let removed = before - self.map.len();
        if removed > 0 {
            info!(removed, "expired messages cleaned up");
        }
        removed
    }

    /// Number of time-consuming messages currently routed towards `name`.
    /// The heartbeat task keeps a stale upstream alive while this is
    /// non-zero.
    pub fn slow_outstanding_for(
        &self,
        name: &str,
        is_time_consuming: impl Fn(u32) -> bool,
    ) -> usize {
        self.map
            .values()
            .filter(|e| is_time_consuming(e.cmd))
            .filter(|e| e.to_name.as_deref() == Some(name))
            .count()
    }
}

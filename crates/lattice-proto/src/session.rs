use lattice_timing::Micros;
use rand::Rng;

/// Session identifiers are exactly this many characters.
pub const SID_LEN: usize = 32;

/// Builds a fresh 32-character session id from the current microsecond
/// clock, the route id and a random suffix. Uniqueness is statistical, the
/// session store treats collisions as replays.
pub fn make_session_id(route_id: u64) -> String {
    let mut rng = rand::rng();
    let suffix: u32 = rng.random();
    let sid = format!("{:016x}{:08x}{:08x}", Micros::now().0, route_id as u32, suffix);
    debug_assert_eq!(sid.len(), SID_LEN);
    sid
}

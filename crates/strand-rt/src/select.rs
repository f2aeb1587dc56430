//! Rotation-scan choice among ready select states.
//!
//! A random offset picks where the scan starts; the first ready state at or
//! after it (cyclically) wins. When ready states are not evenly spread the
//! choice is biased: a ready state that follows a run of not-ready states
//! absorbs their offsets. Existing programs observe this distribution, so it
//! is kept as is.

use rand::Rng;

/// First ready state scanning from `offset`, wrapping around.
pub fn rotation_scan(ready: &[bool], offset: usize) -> Option<usize> {
    let n = ready.len();
    if n == 0 {
        return None;
    }
    (0..n).map(|s| (s + offset) % n).find(|&i| ready[i])
}

/// Rotation scan from a uniformly random offset in `[0, ready.len())`.
pub fn choose<R: Rng + ?Sized>(ready: &[bool], rng: &mut R) -> Option<usize> {
    if ready.is_empty() {
        return None;
    }
    let offset = rng.gen_range(0..ready.len());
    rotation_scan(ready, offset)
}

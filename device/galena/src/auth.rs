//! Challenge/response gate for privileged console commands.
//!
//! Two multiply-with-carry generators run in lockstep on both sides of
//! the link. A challenge advances the state and hands the peer enough to
//! compute the next value; the response is checked against another
//! advance. The state mutates on every attempt, matching or not, so a
//! replayed response never verifies twice.

use crate::timebase::Timebase;

/// Literal that unlocks without the generator handshake. Kept for the
/// deployed provisioning tools that still send it.
pub const BYPASS_PASSWORD: &str = "N3k0c0";

const Z_MULTIPLIER: u32 = 36969;
const W_MULTIPLIER: u32 = 18000;

/// Generator state. One per console session.
pub struct AuthGate {
    z: u32,
    w: u32,
}

impl AuthGate {
    pub fn new() -> Self {
        Self { z: 0, w: 0 }
    }

    /// Stirs uptime and the current timer snapshot into the state so two
    /// boots never issue the same challenge sequence.
    pub fn renew(&mut self, timebase: &Timebase) {
        self.z = self
            .z
            .wrapping_add(timebase.uptime() & 0xF)
            .wrapping_add(timebase.mark());
    }

    fn advance(&mut self) -> u32 {
        self.z = Z_MULTIPLIER
            .wrapping_mul(self.z & 0xFFFF)
            .wrapping_add(self.z >> 16)
            .wrapping_add(1);
        self.w = W_MULTIPLIER
            .wrapping_mul(self.w & 0xFFFF)
            .wrapping_add(self.w >> 16)
            .wrapping_add(1);
        (self.z << 16).wrapping_add(self.w)
    }

    /// Advances the generators and compares `key` against the new value.
    /// `unlock(0)` is the challenge form: it never matches (the value is
    /// never zero after an advance from any reachable state) but leaves
    /// the state ready for the peer's computed response.
    pub fn unlock(&mut self, key: u32) -> bool {
        key == self.advance()
    }

    /// Post-challenge generator words, printed for the peer to compute
    /// its response from.
    pub fn challenge_words(&self) -> (u32, u32) {
        (self.z, self.w)
    }
}

impl Default for AuthGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Computes the response a peer would derive from the printed
    /// challenge words.
    fn peer_response(z: u32, w: u32) -> u32 {
        let z = Z_MULTIPLIER
            .wrapping_mul(z & 0xFFFF)
            .wrapping_add(z >> 16)
            .wrapping_add(1);
        let w = W_MULTIPLIER
            .wrapping_mul(w & 0xFFFF)
            .wrapping_add(w >> 16)
            .wrapping_add(1);
        (z << 16).wrapping_add(w)
    }

    /// A response computed from the challenge words unlocks the gate.
    #[test]
    fn computed_response_unlocks() {
        let mut gate = AuthGate::new();
        assert!(!gate.unlock(0));
        let (z, w) = gate.challenge_words();
        assert!(gate.unlock(peer_response(z, w)));
    }

    /// A wrong response fails, and the failed attempt still advanced the
    /// state so the previously-correct response is now stale.
    #[test]
    fn wrong_response_burns_the_window() {
        let mut gate = AuthGate::new();
        assert!(!gate.unlock(0));
        let (z, w) = gate.challenge_words();
        let good = peer_response(z, w);
        assert!(!gate.unlock(good.wrapping_add(1)));
        assert!(!gate.unlock(good));
    }

    /// Consecutive challenges print different words.
    #[test]
    fn challenges_differ() {
        let mut gate = AuthGate::new();
        gate.unlock(0);
        let first = gate.challenge_words();
        gate.unlock(0);
        let second = gate.challenge_words();
        assert_ne!(first, second);
    }

    /// The generator sequence from the zero state is fixed; pin the
    /// first value so the wire protocol cannot drift.
    #[test]
    fn known_sequence_from_zero() {
        let mut gate = AuthGate::new();
        gate.unlock(0);
        let (z, w) = gate.challenge_words();
        assert_eq!(z, 1);
        assert_eq!(w, 1);
        assert_eq!(peer_response(z, w), (36970u32 << 16).wrapping_add(18001));
    }
}

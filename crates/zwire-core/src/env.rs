//! Environment abstraction for deterministic testing.
//!
//! The protocol machines in this crate must be reproducible: given the
//! same inputs they produce the same outputs. Time is therefore passed
//! into every method that needs it, and randomness — nonces, entropy
//! input, callback jitter — goes through this trait.
//!
//! Two implementations exist:
//!
//! - `SimEnv` (zwire-harness): ChaCha20 RNG with a fixed seed, so a failed
//!   scenario replays byte-for-byte
//! - `SystemEnv` (zwire-driver): OS entropy pool
//!
//! # Invariants
//!
//! - Determinism: with the same seed, `fill_random` produces the same
//!   sequence
//! - Production quality: the driver implementation must draw from a
//!   cryptographically secure source, since these bytes become S0 nonces
//!   and S2 entropy input

/// Abstract source of randomness for the protocol machines.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Fill `buffer` with random bytes.
    fn fill_random(&self, buffer: &mut [u8]);

    /// A random byte that is never zero. Used for S0 nonce ids and
    /// supervision session seeds, where zero is a reserved value.
    fn random_nonzero_u8(&self) -> u8 {
        let mut byte = [0u8; 1];
        loop {
            self.fill_random(&mut byte);
            if byte[0] != 0 {
                return byte[0];
            }
        }
    }

    /// A random array, convenience over [`Environment::fill_random`].
    fn random_array<const N: usize>(&self) -> [u8; N] {
        let mut out = [0u8; N];
        self.fill_random(&mut out);
        out
    }
}

//! Production environment: OS entropy.

use zwire_core::env::Environment;

/// [`Environment`] backed by the operating system's entropy pool.
///
/// The bytes become S0 nonces and S2 entropy input, so anything weaker
/// than the OS CSPRNG is not acceptable here.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    fn fill_random(&self, buffer: &mut [u8]) {
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(buffer);
    }
}

//! Environment traits for Skiff protocol engines
//!
//! Protocol cores never reach for ambient authority. Time and randomness are
//! injected through these traits so that engines stay deterministic under
//! test and portable across runtimes.

use std::time::{Duration, Instant};

/// Monotonic clock used for re-key timers and operation deadlines.
pub trait Clock: Send + Sync {
    /// Returns the current monotonic instant.
    fn now(&self) -> Instant;

    /// Elapsed time since an earlier instant.
    fn elapsed_since(&self, earlier: Instant) -> Duration {
        self.now().saturating_duration_since(earlier)
    }
}

/// System-backed monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Cryptographically secure random byte source.
///
/// Used for KEXINIT cookies, packet padding, and ephemeral key exchange
/// secrets. Implementations MUST be CSPRNG-backed; a non-cryptographic
/// generator here breaks the security of every session built on top.
pub trait SecureRandom: Send + Sync {
    /// Fills `dest` with random bytes.
    fn fill_bytes(&mut self, dest: &mut [u8]);
}

/// OS-backed CSPRNG (`getrandom` via the `rand` crate).
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRandom;

impl SecureRandom for OsRandom {
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(dest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_monotonic() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_os_random_fills() {
        let mut rng = OsRandom;
        let mut buf = [0u8; 32];
        rng.fill_bytes(&mut buf);
        // 32 zero bytes from a CSPRNG is a 2^-256 event.
        assert_ne!(buf, [0u8; 32]);
    }

    #[test]
    fn test_elapsed_since() {
        let clock = SystemClock;
        let start = clock.now();
        let elapsed = clock.elapsed_since(start);
        assert!(elapsed < Duration::from_secs(1));
    }
}

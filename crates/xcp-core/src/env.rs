//! Environment abstraction for deterministic testing.
//!
//! Decouples the engine from system resources (time, randomness) so retry
//! jitter, timeouts, and nonces can run under a virtual clock and a seeded
//! RNG in tests, and under real resources in production.

use std::time::Duration;

/// Abstract environment providing time and randomness.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `random_bytes()` uses cryptographically secure entropy in production
pub trait Environment: Clone + Send + Sync + 'static {
    /// The instant type used by this environment.
    ///
    /// Production environments use `std::time::Instant`; simulation
    /// environments use virtual time.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration.
    ///
    /// The only async method in the trait; used by driver code, never by
    /// protocol logic.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_le_bytes(bytes)
    }
}

/// Production environment: system time and OS cryptographic RNG.
///
/// # Panics
///
/// Panics if the OS RNG fails. Intentional: an engine without functioning
/// cryptographic randomness cannot generate safe nonces or jitter, and RNG
/// failure indicates OS-level breakage.
#[derive(Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer)
            .expect("invariant: OS RNG failure is unrecoverable for a protocol engine");
    }
}

#[cfg(test)]
pub(crate) mod test_env {
    use std::{
        sync::{Arc, Mutex, PoisonError},
        time::{Duration, Instant},
    };

    use super::Environment;

    /// Deterministic environment: manually advanced clock, counting RNG.
    #[derive(Clone)]
    pub struct TestEnv {
        start: Instant,
        offset: Arc<Mutex<Duration>>,
        rng_state: Arc<Mutex<u64>>,
    }

    impl TestEnv {
        #[allow(clippy::disallowed_methods)]
        pub fn new() -> Self {
            Self {
                start: Instant::now(),
                offset: Arc::new(Mutex::new(Duration::ZERO)),
                rng_state: Arc::new(Mutex::new(0x5EED)),
            }
        }

        /// Advance the virtual clock.
        pub fn advance(&self, by: Duration) {
            *self.offset.lock().unwrap_or_else(PoisonError::into_inner) += by;
        }
    }

    impl Environment for TestEnv {
        type Instant = Instant;

        fn now(&self) -> Instant {
            self.start + *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
        }

        fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            async {}
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            let mut state = self.rng_state.lock().unwrap_or_else(PoisonError::into_inner);
            for byte in buffer.iter_mut() {
                // xorshift64
                *state ^= *state << 13;
                *state ^= *state >> 7;
                *state ^= *state << 17;
                *byte = (*state & 0xFF) as u8;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_env_random_bytes_fill() {
        let env = SystemEnv::new();
        let mut bytes = [0u8; 32];
        env.random_bytes(&mut bytes);
        assert!(bytes.iter().any(|&b| b != 0));
    }

    #[test]
    fn test_env_clock_is_virtual() {
        let env = test_env::TestEnv::new();
        let t0 = env.now();
        env.advance(Duration::from_secs(5));
        let t1 = env.now();
        assert_eq!(t1 - t0, Duration::from_secs(5));
    }

    #[test]
    fn test_env_rng_is_deterministic() {
        let a = test_env::TestEnv::new();
        let b = test_env::TestEnv::new();
        assert_eq!(a.random_u64(), b.random_u64());
    }
}

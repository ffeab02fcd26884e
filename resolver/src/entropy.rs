//! Transaction-id entropy sources.
//!
//! Exactly one of these is compiled in: off-path DNS spoofing resistance depends on the id
//! being unpredictable, so `entropy-crypto` (backed by the OS CSPRNG via `rand`) is the
//! default and the only one recommended outside constrained environments.

#[cfg(feature = "entropy-crypto")]
pub fn next_u16() -> u16 {
	use rand::RngCore;

	rand::thread_rng().next_u32() as u16
}

#[cfg(all(feature = "entropy-monotonic", not(feature = "entropy-crypto")))]
pub fn next_u16() -> u16 {
	use std::time::Instant;

	// Low bits of a monotonic clock reading. Predictable to a local attacker who can
	// observe request timing, but requires no OS entropy pool.
	Instant::now().elapsed().subsec_nanos() as u16
}

#[cfg(all(feature = "entropy-walltime", not(feature = "entropy-crypto"), not(feature = "entropy-monotonic")))]
pub fn next_u16() -> u16 {
	use std::time::{SystemTime, UNIX_EPOCH};

	let micros = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().subsec_micros();

	micros as u16
}

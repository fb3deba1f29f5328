//! A simple token-bucket throttle for read/write bandwidth.
//!
//! Rate `0` disables throttling entirely: [`Throttle::consume`] always
//! returns a zero delay in that case, and no internal state is touched.

use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Bucket {
	/// Bytes currently available to spend without delay.
	available: f64,
	last_refill: Instant,
}

/// A per-direction (read or write) byte-rate limiter.
pub struct Throttle {
	rate: u64,
	inner: Option<Mutex<Bucket>>,
}

impl Throttle {
	/// `rate` is in bytes per second; `0` means unthrottled.
	pub fn new(rate: u64) -> Self {
		let inner = if rate == 0 {
			None
		} else {
			Some(Mutex::new(Bucket {
				available: rate as f64,
				last_refill: Instant::now(),
			}))
		};
		Throttle { rate, inner }
	}

	pub fn is_enabled(&self) -> bool {
		self.rate > 0
	}

	/// Record the consumption of `bytes` and return how long the caller
	/// should sleep before proceeding, given the configured rate.
	pub fn consume(&self, bytes: u64) -> Duration {
		let inner = match &self.inner {
			Some(inner) => inner,
			None => return Duration::ZERO,
		};
		let mut bucket = inner.lock().unwrap();

		let now = Instant::now();
		let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
		bucket.available = (bucket.available + elapsed * self.rate as f64).min(self.rate as f64);
		bucket.last_refill = now;

		bucket.available -= bytes as f64;
		if bucket.available >= 0.0 {
			Duration::ZERO
		} else {
			let delay = Duration::from_secs_f64(-bucket.available / self.rate as f64);
			// The bucket owes this many bytes; the delay above is what it
			// takes to refill them, so zero it out rather than carry a
			// negative balance into the next call.
			bucket.available = 0.0;
			delay
		}
	}
}

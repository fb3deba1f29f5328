//! Content-addressed block/version storage engine core.
//!
//! Composes a key codec, a reversible transform pipeline, an HMAC-protected
//! metadata envelope, a token-bucket throttle, a bounded-concurrency
//! scheduler and an optional read-through disk cache atop a pluggable
//! [`backend::Backend`]. See [`facade::Storage`] for the entry point.

pub mod backend;
pub mod cache;
pub mod concurrency;
pub mod key;
pub mod metadata;
pub mod throttle;
pub mod transform;
pub mod uid;

pub mod facade;

pub use facade::{ReadResult, Storage};

//! Crate-wide error type for the storage engine core

use err_derive::Error;

/// All the ways an operation against the storage engine can fail.
#[derive(Debug, Error)]
pub enum Error {
	/// A backend lookup of a key that does not exist.
	#[error(display = "not found: {}", _0)]
	NotFound(String),

	/// A size, checksum or length disagreement between recorded and actual data.
	#[error(display = "value mismatch: {}", _0)]
	ValueMismatch(String),

	/// HMAC verification of a metadata record failed.
	#[error(display = "integrity failure: {}", _0)]
	IntegrityFailure(String),

	/// Inconsistent configuration (HMAC parts, cache parts, transform module drift).
	#[error(display = "configuration error: {}", _0)]
	ConfigurationError(String),

	/// A transform named in object metadata is not registered.
	#[error(display = "unknown transform: {}", _0)]
	UnknownTransform(String),

	/// A post-write consistency check found the stored object does not match what was written.
	#[error(display = "internal error: {}", _0)]
	InternalError(String),

	/// `save_version(overwrite=false)` collided with an existing version.
	#[error(display = "already exists: {}", _0)]
	AlreadyExists(String),

	/// An ill-formed object key, e.g. too short or missing the expected prefix.
	#[error(display = "invalid key: {}", _0)]
	InvalidKey(String),

	/// Catch-all for conditions that don't deserve their own variant.
	#[error(display = "{}", _0)]
	Message(String),

	/// Propagated I/O failure from a backend or the disk cache.
	#[error(display = "I/O error: {}", _0)]
	Io(#[error(source)] #[error(from)] std::io::Error),

	/// Malformed sidecar JSON.
	#[error(display = "(de)serialization error: {}", _0)]
	Serialization(#[error(source)] #[error(from)] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
	pub fn message<S: Into<String>>(msg: S) -> Self {
		Error::Message(msg.into())
	}

	/// True for the variants that cleanup paths are allowed to swallow.
	pub fn is_not_found(&self) -> bool {
		matches!(self, Error::NotFound(_))
	}
}

/// Turns a missing value into a [`Error::Message`], the way the teacher's own
/// `ok_or_message` helper is used throughout its block manager.
pub trait OkOrMessage<T> {
	fn ok_or_message<S: Into<String>>(self, msg: S) -> Result<T>;
}

impl<T> OkOrMessage<T> for Option<T> {
	fn ok_or_message<S: Into<String>>(self, msg: S) -> Result<T> {
		self.ok_or_else(|| Error::Message(msg.into()))
	}
}

/// Turns a missing value into a [`Error::NotFound`].
pub trait OkOrNotFound<T> {
	fn ok_or_not_found<S: Into<String>>(self, key: S) -> Result<T>;
}

impl<T> OkOrNotFound<T> for Option<T> {
	fn ok_or_not_found<S: Into<String>>(self, key: S) -> Result<T> {
		self.ok_or_else(|| Error::NotFound(key.into()))
	}
}

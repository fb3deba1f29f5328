//! The abstract storage backend contract, and a test-only in-memory
//! implementation.
//!
//! Concrete backends (S3, local filesystem, …) are out of scope for this
//! core; see [`memory::MemoryBackend`] for the implementation this crate's
//! own tests run against.

use silo_util::error::Result;

/// The operations a concrete object-storage backend must provide. All
/// methods are synchronous: the concurrency engine is responsible for
/// running them off the calling thread when bounded parallelism is wanted.
pub trait Backend: Send + Sync {
	/// Persist `data` under `key`, replacing any existing value.
	fn write_object(&self, key: &str, data: &[u8]) -> Result<()>;

	/// Read the full contents stored under `key`.
	///
	/// Returns [`silo_util::error::Error::NotFound`] if `key` does not exist.
	fn read_object(&self, key: &str) -> Result<Vec<u8>>;

	/// The length in bytes of the object stored under `key`, without
	/// transferring its contents.
	fn read_object_length(&self, key: &str) -> Result<u64>;

	/// Remove the object stored under `key`.
	///
	/// Returns [`silo_util::error::Error::NotFound`] if `key` does not exist.
	fn rm_object(&self, key: &str) -> Result<()>;

	/// Remove every object in `keys` as a single bulk operation, tolerating
	/// individual not-found entries. Returns the subset of `keys` whose
	/// removal failed for a reason other than not-found, per §4.H.
	fn rm_many_objects(&self, keys: &[String]) -> Vec<String> {
		keys.iter()
			.filter(|key| match self.rm_object(key) {
				Ok(()) => false,
				Err(e) if e.is_not_found() => false,
				Err(_) => true,
			})
			.cloned()
			.collect()
	}

	/// List every stored key starting with `prefix`, in unspecified order.
	fn list_objects(&self, prefix: &str) -> Result<Vec<String>>;
}

/// An in-memory [`Backend`], used only by this crate's own test suite.
#[cfg(any(test, feature = "test-support"))]
pub mod memory {
	use std::collections::BTreeMap;
	use std::sync::Mutex;

	use silo_util::error::Error;

	use super::*;

	#[derive(Default)]
	pub struct MemoryBackend {
		objects: Mutex<BTreeMap<String, Vec<u8>>>,
	}

	impl MemoryBackend {
		pub fn new() -> Self {
			MemoryBackend::default()
		}
	}

	impl Backend for MemoryBackend {
		fn write_object(&self, key: &str, data: &[u8]) -> Result<()> {
			self.objects.lock().unwrap().insert(key.to_string(), data.to_vec());
			Ok(())
		}

		fn read_object(&self, key: &str) -> Result<Vec<u8>> {
			self.objects
				.lock()
				.unwrap()
				.get(key)
				.cloned()
				.ok_or_else(|| Error::NotFound(key.to_string()))
		}

		fn read_object_length(&self, key: &str) -> Result<u64> {
			self.objects
				.lock()
				.unwrap()
				.get(key)
				.map(|v| v.len() as u64)
				.ok_or_else(|| Error::NotFound(key.to_string()))
		}

		fn rm_object(&self, key: &str) -> Result<()> {
			self.objects
				.lock()
				.unwrap()
				.remove(key)
				.map(|_| ())
				.ok_or_else(|| Error::NotFound(key.to_string()))
		}

		fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
			Ok(self
				.objects
				.lock()
				.unwrap()
				.keys()
				.filter(|k| k.starts_with(prefix))
				.cloned()
				.collect())
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn round_trips_an_object() {
			let backend = MemoryBackend::new();
			backend.write_object("a", b"hello").unwrap();
			assert_eq!(backend.read_object("a").unwrap(), b"hello");
			assert_eq!(backend.read_object_length("a").unwrap(), 5);
		}

		#[test]
		fn read_missing_is_not_found() {
			let backend = MemoryBackend::new();
			let err = backend.read_object("missing").unwrap_err();
			assert!(err.is_not_found());
		}

		#[test]
		fn rm_missing_is_not_found() {
			let backend = MemoryBackend::new();
			let err = backend.rm_object("missing").unwrap_err();
			assert!(err.is_not_found());
		}

		#[test]
		fn rm_many_tolerates_missing_entries() {
			let backend = MemoryBackend::new();
			backend.write_object("a", b"1").unwrap();
			let failed = backend.rm_many_objects(&["a".to_string(), "missing".to_string()]);
			assert!(failed.is_empty());
			assert!(backend.list_objects("").unwrap().is_empty());
		}

		#[test]
		fn list_filters_by_prefix() {
			let backend = MemoryBackend::new();
			backend.write_object("blocks/a", b"1").unwrap();
			backend.write_object("versions/b", b"2").unwrap();
			let keys = backend.list_objects("blocks/").unwrap();
			assert_eq!(keys, vec!["blocks/a".to_string()]);
		}
	}
}

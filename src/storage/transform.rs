//! The reversible transform chain (compression, encryption, …) applied to a
//! payload before it is persisted.
//!
//! Concrete transforms (zstd, AES, …) are out of scope for this core; it
//! only provides the registry, the chain application, and the metadata
//! bookkeeping that makes the chain self-describing. See
//! [`testing::PassThroughTransform`] for the trivial transform used by this
//! crate's own tests.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use silo_util::error::{Error, Result};

/// One step of the transform chain, resolvable by name.
///
/// `module` identifies the concrete implementation backing `name` (e.g. a
/// particular compression library version); it is recorded alongside the
/// transform's name so that a later configuration drift away from that
/// implementation is detected as a *configuration mismatch* rather than
/// silently decapsulating with the wrong code.
pub trait Transform: Send + Sync {
	/// The name under which this transform is registered and recorded in
	/// object metadata.
	fn name(&self) -> &str;

	/// Identifies the concrete implementation. Recorded in object metadata
	/// and re-checked against the registered transform's module on decode.
	fn module(&self) -> &str;

	/// Forward direction. Returning `None` declines to transform this
	/// payload: the previous bytes pass through unchanged and no metadata
	/// entry is recorded for this transform.
	fn encapsulate(&self, data: &[u8]) -> Result<(Option<Vec<u8>>, Value)>;

	/// Inverse direction, given the materials recorded at encapsulation time.
	fn decapsulate(&self, data: &[u8], materials: &Value) -> Result<Vec<u8>>;
}

/// One entry of the recorded `transforms` metadata list.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TransformRecord {
	pub name: String,
	pub module: String,
	pub materials: Value,
}

/// An immutable, name-keyed lookup of transform capabilities, built once at
/// [`crate::facade::Storage`] construction time from the configured list of
/// active transform names.
#[derive(Clone, Default)]
pub struct TransformRegistry {
	by_name: HashMap<String, Arc<dyn Transform>>,
	/// The ordered chain to apply on encapsulation (a subset of `by_name`,
	/// in configured order; may repeat a name in principle, though in
	/// practice each name is distinct).
	active: Vec<Arc<dyn Transform>>,
}

impl TransformRegistry {
	/// Build a registry whose `active` chain is the subset of `available`
	/// named by `active_names`, in that order. Unknown names in
	/// `active_names` are a configuration error at construction time.
	pub fn new(available: Vec<Arc<dyn Transform>>, active_names: &[String]) -> Result<Self> {
		let mut by_name = HashMap::new();
		for t in available {
			by_name.insert(t.name().to_string(), t);
		}

		let mut active = Vec::with_capacity(active_names.len());
		for name in active_names {
			let t = by_name.get(name).cloned().ok_or_else(|| {
				Error::ConfigurationError(format!("unknown active transform: {}", name))
			})?;
			active.push(t);
		}

		Ok(TransformRegistry { by_name, active })
	}

	pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn Transform>> {
		self.by_name.get(name).cloned()
	}

	/// Apply the active chain in order. Each transform that actually
	/// transforms the payload appends a record to the returned list; a
	/// transform that declines (`encapsulate` returns `None`) is skipped
	/// entirely.
	pub fn encapsulate(&self, mut data: Vec<u8>) -> Result<(Vec<u8>, Vec<TransformRecord>)> {
		let mut records = Vec::new();
		for transform in &self.active {
			let (encapsulated, materials) = transform.encapsulate(&data)?;
			if let Some(new_data) = encapsulated {
				records.push(TransformRecord {
					name: transform.name().to_string(),
					module: transform.module().to_string(),
					materials,
				});
				data = new_data;
			}
		}
		Ok((data, records))
	}

	/// Apply the recorded chain in reverse, re-resolving each transform by
	/// name and checking its module for drift.
	pub fn decapsulate(&self, mut data: Vec<u8>, records: &[TransformRecord]) -> Result<Vec<u8>> {
		for record in records.iter().rev() {
			let transform = self.get_by_name(&record.name).ok_or_else(|| {
				Error::UnknownTransform(format!(
					"unknown transform {} in object metadata",
					record.name
				))
			})?;
			if transform.module() != record.module {
				return Err(Error::ConfigurationError(format!(
					"mismatch between object transform module and configured module for {} ({} != {})",
					record.name,
					record.module,
					transform.module()
				)));
			}
			data = transform.decapsulate(&data, &record.materials)?;
		}
		Ok(data)
	}
}

/// Transforms used only by this crate's own test suite.
#[cfg(any(test, feature = "test-support"))]
pub mod testing {
	use super::*;

	/// A transform that records its materials but otherwise passes the
	/// payload through unchanged. Stands in for a real codec (zstd, AES, …)
	/// in tests that only care about the chain bookkeeping.
	pub struct PassThroughTransform {
		name: String,
		module: &'static str,
	}

	impl PassThroughTransform {
		pub fn new(name: &str) -> Self {
			PassThroughTransform {
				name: name.to_string(),
				module: "test-pass-through/v1",
			}
		}
	}

	impl Transform for PassThroughTransform {
		fn name(&self) -> &str {
			&self.name
		}

		fn module(&self) -> &str {
			self.module
		}

		fn encapsulate(&self, data: &[u8]) -> Result<(Option<Vec<u8>>, Value)> {
			Ok((Some(data.to_vec()), Value::Null))
		}

		fn decapsulate(&self, data: &[u8], _materials: &Value) -> Result<Vec<u8>> {
			Ok(data.to_vec())
		}
	}
}

#[cfg(test)]
mod tests {
	use super::testing::PassThroughTransform;
	use super::*;

	fn registry(names: &[&str]) -> TransformRegistry {
		let available: Vec<Arc<dyn Transform>> = names
			.iter()
			.map(|n| Arc::new(PassThroughTransform::new(n)) as Arc<dyn Transform>)
			.collect();
		let active_names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
		TransformRegistry::new(available, &active_names).unwrap()
	}

	#[test]
	fn round_trips_through_chain() {
		let reg = registry(&["zlib", "aes"]);
		let data = b"A".repeat(10_000);
		let (encapsulated, records) = reg.encapsulate(data.clone()).unwrap();
		assert_eq!(records.len(), 2);
		assert_eq!(records[0].name, "zlib");
		assert_eq!(records[1].name, "aes");

		let decapsulated = reg.decapsulate(encapsulated, &records).unwrap();
		assert_eq!(decapsulated, data);
	}

	#[test]
	fn empty_chain_is_identity() {
		let reg = registry(&[]);
		let data = b"hello".to_vec();
		let (encapsulated, records) = reg.encapsulate(data.clone()).unwrap();
		assert!(records.is_empty());
		assert_eq!(encapsulated, data);
	}

	#[test]
	fn decapsulate_detects_module_drift() {
		let reg = registry(&["zlib"]);
		let records = vec![TransformRecord {
			name: "zlib".to_string(),
			module: "some-other-module".to_string(),
			materials: Value::Null,
		}];
		let err = reg.decapsulate(b"x".to_vec(), &records).unwrap_err();
		assert!(matches!(err, Error::ConfigurationError(_)));
	}

	#[test]
	fn decapsulate_detects_unknown_transform() {
		let reg = registry(&[]);
		let records = vec![TransformRecord {
			name: "ghost".to_string(),
			module: "whatever".to_string(),
			materials: Value::Null,
		}];
		let err = reg.decapsulate(b"x".to_vec(), &records).unwrap_err();
		assert!(matches!(err, Error::UnknownTransform(_)));
	}
}

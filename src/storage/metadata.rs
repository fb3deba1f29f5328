//! The JSON sidecar metadata record and its optional HMAC integrity layer.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use silo_util::error::{Error, Result};

use crate::transform::TransformRecord;

/// The sidecar metadata record, as described in §3 of the storage layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
	pub size: u64,
	pub object_size: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub checksum: Option<String>,
	#[serde(skip_serializing_if = "Vec::is_empty", default)]
	pub transforms: Vec<TransformRecord>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub hmac: Option<String>,
}

impl Metadata {
	pub fn new(size: u64, object_size: u64, checksum: Option<String>, transforms: Vec<TransformRecord>) -> Self {
		Metadata {
			size,
			object_size,
			checksum,
			transforms,
			hmac: None,
		}
	}

	/// Serialize to compact (no-whitespace) UTF-8 JSON, computing and
	/// inserting the HMAC first when `hmac_key` is set.
	pub fn encode(&self, hmac_key: Option<&[u8]>) -> Result<Vec<u8>> {
		let mut with_hmac = self.clone();
		with_hmac.hmac = None;
		if let Some(key) = hmac_key {
			let digest = hmac_hexdigest(key, &canonical_bytes(&with_hmac)?)?;
			with_hmac.hmac = Some(digest);
		}
		serde_json::to_vec(&with_hmac).map_err(Error::from)
	}

	/// Parse compact JSON, verifying the HMAC (if `hmac_key` is set) before
	/// trusting any other field.
	pub fn decode(bytes: &[u8], hmac_key: Option<&[u8]>) -> Result<Metadata> {
		let metadata: Metadata = serde_json::from_slice(bytes).map_err(Error::from)?;

		if let Some(key) = hmac_key {
			let recorded = metadata
				.hmac
				.as_ref()
				.ok_or_else(|| Error::IntegrityFailure("metadata is missing required hmac field".into()))?;

			let mut unsigned = metadata.clone();
			unsigned.hmac = None;
			let expected = hmac_hexdigest(key, &canonical_bytes(&unsigned)?)?;

			if !bool::from(expected.as_bytes().ct_eq(recorded.as_bytes())) {
				return Err(Error::IntegrityFailure(
					"hmac verification failed for metadata record".into(),
				));
			}
		}

		Ok(metadata)
	}
}

/// Encode every field except `hmac` in sorted-key order, compact, no
/// whitespace. This is the canonical encoding HMACed both when producing and
/// when verifying the digest, since JSON object key order from serde's
/// struct serialization is not a portable guarantee to hang cryptography on.
fn canonical_bytes(metadata: &Metadata) -> Result<Vec<u8>> {
	let value = serde_json::to_value(metadata).map_err(Error::from)?;
	let object = value.as_object().expect("Metadata always serializes to a JSON object");

	let mut sorted = Map::new();
	let mut keys: Vec<&String> = object.keys().filter(|k| k.as_str() != "hmac").collect();
	keys.sort();
	for key in keys {
		sorted.insert(key.clone(), object[key].clone());
	}

	serde_json::to_vec(&Value::Object(sorted)).map_err(Error::from)
}

fn hmac_hexdigest(key: &[u8], message: &[u8]) -> Result<String> {
	let mut mac = Hmac::<Sha256>::new_from_slice(key)
		.map_err(|e| Error::ConfigurationError(format!("invalid HMAC key: {}", e)))?;
	mac.update(message);
	Ok(hex::encode(mac.finalize().into_bytes()))
}

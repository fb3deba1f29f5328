//! Maps block/version UIDs to hashed, fan-out object keys and back.
//!
//! `key = prefix || md5_hex(object_key)[0:2] || "/" || md5_hex(object_key)[2:4] || "/" || object_key`
//!
//! The two-level hex fan-out limits directory cardinality on filesystem-like
//! backends; the MD5 use here is purely a non-adversarial bucketing hash, not
//! a security boundary.

use md5::{Digest, Md5};

use silo_util::error::{Error, Result};

use crate::uid::{BlockUid, VersionUid, BLOCK_UID_CANONICAL_LEN};

pub const BLOCKS_PREFIX: &str = "blocks/";
pub const VERSIONS_PREFIX: &str = "versions/";
pub const META_SUFFIX: &str = ".meta";

/// Prepend `prefix`, two hex slices of MD5(`object_key`), then `object_key`.
pub fn to_key(prefix: &str, object_key: &str) -> String {
	let digest = Md5::digest(object_key.as_bytes());
	let hex = hex::encode(digest);
	format!("{}{}/{}/{}", prefix, &hex[0..2], &hex[2..4], object_key)
}

/// Inverse of [`to_key`]: verify the prefix, require at least `prefix.len() + 6`
/// characters, and strip `prefix` plus the 6-character fan-out segment.
pub fn from_key(prefix: &str, key: &str) -> Result<String> {
	if !key.starts_with(prefix) {
		return Err(Error::InvalidKey(format!(
			"key {} does not start with prefix {}",
			key, prefix
		)));
	}
	let pl = prefix.len();
	if key.len() <= pl + 6 {
		return Err(Error::InvalidKey(format!(
			"key {} has invalid length, expected at least {} characters",
			key,
			pl + 6
		)));
	}
	Ok(key[pl + 6..].to_string())
}

pub fn block_uid_to_key(uid: &BlockUid) -> String {
	to_key(BLOCKS_PREFIX, &uid.canonical())
}

pub fn key_to_block_uid(key: &str) -> Result<BlockUid> {
	let object_key = from_key(BLOCKS_PREFIX, key)?;
	if object_key.len() != BLOCK_UID_CANONICAL_LEN {
		return Err(Error::InvalidKey(format!(
			"object key {} has invalid length, expected exactly {} characters",
			object_key, BLOCK_UID_CANONICAL_LEN
		)));
	}
	let left = u64::from_str_radix(&object_key[0..16], 16)
		.map_err(|_| Error::InvalidKey(format!("object key {} has a non-hex left half", object_key)))?;
	let right = u64::from_str_radix(&object_key[17..33], 16)
		.map_err(|_| Error::InvalidKey(format!("object key {} has a non-hex right half", object_key)))?;
	Ok(BlockUid::new(left, right))
}

pub fn version_uid_to_key(uid: &VersionUid) -> String {
	to_key(VERSIONS_PREFIX, &uid.readable())
}

pub fn key_to_version_uid(key: &str) -> Result<VersionUid> {
	let object_key = from_key(VERSIONS_PREFIX, key)?;
	let expected_len = VersionUid::new(1).readable().len();
	if object_key.len() != expected_len {
		return Err(Error::InvalidKey(format!(
			"object key {} has invalid length, expected exactly {} characters",
			object_key, expected_len
		)));
	}
	VersionUid::parse(&object_key)
		.ok_or_else(|| Error::InvalidKey(format!("object key {} is not a valid version uid", object_key)))
}

pub fn meta_key(key: &str) -> String {
	format!("{}{}", key, META_SUFFIX)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn block_uid_key_round_trips() {
		let uid = BlockUid::new(0x1, 0x2);
		let key = block_uid_to_key(&uid);
		assert!(key.starts_with(BLOCKS_PREFIX));
		assert_eq!(key_to_block_uid(&key).unwrap(), uid);
	}

	#[test]
	fn version_uid_key_round_trips() {
		let uid = VersionUid::new(42);
		let key = version_uid_to_key(&uid);
		assert!(key.starts_with(VERSIONS_PREFIX));
		assert_eq!(key_to_version_uid(&key).unwrap(), uid);
	}

	#[test]
	fn from_key_rejects_wrong_prefix() {
		assert!(from_key(BLOCKS_PREFIX, "versions/ab/cd/foo").is_err());
	}

	#[test]
	fn from_key_rejects_short_key() {
		assert!(from_key(BLOCKS_PREFIX, "blocks/ab").is_err());
	}

	#[test]
	fn key_to_block_uid_rejects_stray_object() {
		// Correct prefix and fan-out shape, but not a valid canonical block uid.
		let stray = to_key(BLOCKS_PREFIX, "not-a-uid");
		assert!(key_to_block_uid(&stray).is_err());
	}

	#[test]
	fn meta_key_appends_suffix() {
		assert_eq!(meta_key("blocks/ab/cd/foo"), "blocks/ab/cd/foo.meta");
	}
}

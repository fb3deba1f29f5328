//! Contains types related to storage engine configuration
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Configuration for a single named storage instance.
///
/// Mirrors the recognized keys of a storage module configuration: pool
/// sizes are required, everything else has a sane default or is optional.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
	/// Number of worker threads for reads.
	pub simultaneous_reads: usize,
	/// Number of worker threads for writes.
	pub simultaneous_writes: usize,

	/// Read bandwidth limit in bytes/sec, 0 = unlimited.
	#[serde(default)]
	pub bandwidth_read: u64,
	/// Write bandwidth limit in bytes/sec, 0 = unlimited.
	#[serde(default)]
	pub bandwidth_write: u64,

	/// Depth of the submission queue beyond the worker count, for both pools.
	#[serde(default = "default_queue_depth")]
	pub queue_depth: usize,

	/// Re-read and byte-compare every object immediately after writing it.
	#[serde(default)]
	pub consistency_check_writes: bool,

	/// Ordered list of transform names to apply on encapsulation.
	#[serde(default)]
	pub active_transforms: Vec<String>,

	/// HMAC configuration, if metadata integrity protection is desired.
	#[serde(default)]
	pub hmac: Option<HmacConfig>,

	/// Disk-backed read cache configuration.
	#[serde(default)]
	pub read_cache: Option<ReadCacheConfig>,
}

/// HMAC key material, either supplied directly or derived via a KDF.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct HmacConfig {
	#[serde(default, with = "hex_bytes_opt")]
	pub key: Option<Vec<u8>>,
	#[serde(default, with = "hex_bytes_opt")]
	pub kdf_salt: Option<Vec<u8>>,
	#[serde(default)]
	pub kdf_iterations: Option<u32>,
	#[serde(default)]
	pub password: Option<String>,
}

impl HmacConfig {
	/// Resolve to the actual HMAC key, validating the all-or-none rule on the
	/// KDF triple and deriving the key through PBKDF2 when needed.
	pub fn resolve(&self) -> Result<Vec<u8>> {
		if let Some(key) = &self.key {
			return Ok(key.clone());
		}

		let present = self.kdf_salt.is_some() as u8
			+ self.kdf_iterations.is_some() as u8
			+ self.password.is_some() as u8;

		match present {
			0 => Err(Error::ConfigurationError(
				"no HMAC key material configured".into(),
			)),
			3 => {
				let salt = self.kdf_salt.as_ref().unwrap();
				let iterations = self.kdf_iterations.unwrap();
				let password = self.password.as_ref().unwrap();
				Ok(crate::hmac_kdf::derive_key(salt, iterations, password))
			}
			_ => Err(Error::ConfigurationError(
				"some but not all HMAC KDF configuration keys are set, this is invalid".into(),
			)),
		}
	}
}

/// Disk-backed read cache configuration.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ReadCacheConfig {
	pub directory: PathBuf,
	pub maximum_size: u64,
}

fn default_queue_depth() -> usize {
	1
}

mod hex_bytes_opt {
	use serde::{Deserialize, Deserializer};

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s: Option<String> = Option::deserialize(deserializer)?;
		s.map(|s| hex::decode(s).map_err(serde::de::Error::custom))
			.transpose()
	}
}

/// Read and parse a storage configuration from a TOML file, the way the
/// teacher reads its own top-level configuration.
pub fn read_config(config_file: PathBuf) -> Result<StorageConfig> {
	use std::io::Read;

	let mut file = std::fs::OpenOptions::new().read(true).open(&config_file)?;
	let mut config = String::new();
	file.read_to_string(&mut config)?;

	toml::from_str(&config).map_err(|e| Error::ConfigurationError(e.to_string()))
}

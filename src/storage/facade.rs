//! The `Storage` facade: composes the key codec, transform pipeline,
//! metadata envelope, throttle, concurrency engine and read cache atop a
//! concrete [`Backend`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use silo_util::config::StorageConfig;
use silo_util::error::{Error, Result};

use crate::backend::Backend;
use crate::cache::ReadCache;
use crate::concurrency::Pool;
use crate::key;
use crate::metadata::Metadata;
use crate::throttle::Throttle;
use crate::transform::{Transform, TransformRegistry};
use crate::uid::{BlockUid, DereferencedBlock, VersionUid};

/// The result of a successful read.
pub struct ReadResult {
	pub block: DereferencedBlock,
	pub data: Option<Vec<u8>>,
	pub metadata: Metadata,
}

/// The synchronous core: everything a save or a read actually does, with no
/// opinion on whether it runs inline or on a pooled worker thread. Held
/// behind an `Arc` so pool jobs can cheaply clone a handle to it.
struct Inner {
	name: String,
	storage_id: u32,

	backend: Arc<dyn Backend>,
	transforms: TransformRegistry,
	hmac_key: Option<Vec<u8>>,
	consistency_check_writes: bool,

	read_throttle: Throttle,
	write_throttle: Throttle,

	cache: Option<ReadCache>,
	use_read_cache: AtomicBool,
}

impl Inner {
	fn hmac_key_ref(&self) -> Option<&[u8]> {
		self.hmac_key.as_deref()
	}

	fn save_sync(&self, block: &DereferencedBlock, data: &[u8]) -> Result<()> {
		let key = key::block_uid_to_key(&block.uid);
		let meta_key = key::meta_key(&key);

		let (stored, transform_records) = self.transforms.encapsulate(data.to_vec())?;
		let metadata = Metadata::new(block.size, stored.len() as u64, block.checksum.clone(), transform_records);
		let metadata_bytes = metadata.encode(self.hmac_key_ref())?;

		let delay = self.write_throttle.consume(stored.len() as u64 + metadata_bytes.len() as u64);
		if !delay.is_zero() {
			std::thread::sleep(delay);
		}

		let result = self
			.backend
			.write_object(&key, &stored)
			.and_then(|_| self.backend.write_object(&meta_key, &metadata_bytes));

		if let Err(e) = result {
			tracing::error!(error = %e, %key, "save failed, cleaning up");
			let _ = self.backend.rm_object(&key);
			let _ = self.backend.rm_object(&meta_key);
			return Err(e);
		}

		if self.consistency_check_writes {
			let reread = self.backend.read_object(&key)?;
			if reread != stored {
				return Err(Error::InternalError(format!(
					"post-write consistency check failed for {}",
					key
				)));
			}
		}

		tracing::debug!(%key, size = block.size, "saved block");
		Ok(())
	}

	fn read_sync(&self, block: &DereferencedBlock, metadata_only: bool) -> Result<ReadResult> {
		let key = key::block_uid_to_key(&block.uid);
		let meta_key = key::meta_key(&key);

		if self.use_read_cache.load(Ordering::SeqCst) {
			if let Some(cache) = &self.cache {
				if let Some(entry) = cache.get(&key) {
					let metadata = Metadata::decode(&entry.metadata, self.hmac_key_ref())?;
					if metadata_only || entry.data.is_some() {
						return Ok(ReadResult {
							block: block.clone(),
							data: if metadata_only { None } else { entry.data },
							metadata,
						});
					}
				}
			}
		}

		let metadata_bytes = self.backend.read_object(&meta_key)?;
		let metadata = Metadata::decode(&metadata_bytes, self.hmac_key_ref())?;
		if metadata.checksum.is_none() {
			return Err(Error::ValueMismatch(format!("block metadata for {} is missing checksum", key)));
		}

		let data = if metadata_only {
			let data_length = self.backend.read_object_length(&key)?;
			if data_length != metadata.object_size {
				return Err(Error::ValueMismatch(format!(
					"object {} length {} does not match recorded object_size {}",
					key, data_length, metadata.object_size
				)));
			}
			None
		} else {
			Some(self.backend.read_object(&key)?)
		};

		let bytes_transferred = data.as_ref().map(|d| d.len() as u64).unwrap_or(0) + metadata_bytes.len() as u64;
		let delay = self.read_throttle.consume(bytes_transferred);
		if !delay.is_zero() {
			std::thread::sleep(delay);
		}

		if let Some(cache) = &self.cache {
			cache.put(&key, &metadata_bytes, data.as_deref());
		}

		let decapsulated = match data {
			Some(raw) => {
				if raw.len() as u64 != metadata.object_size {
					return Err(Error::ValueMismatch(format!(
						"object {} length {} does not match recorded object_size {}",
						key,
						raw.len(),
						metadata.object_size
					)));
				}
				Some(self.transforms.decapsulate(raw, &metadata.transforms)?)
			}
			None => None,
		};

		check_block_metadata(block, decapsulated.as_ref().map(|d| d.len() as u64), &metadata)?;

		Ok(ReadResult {
			block: block.clone(),
			data: decapsulated,
			metadata,
		})
	}

	/// Deletes both halves of a key pair. The metadata delete always runs,
	/// even when the payload delete fails with something other than
	/// *not found*, so a real payload-delete error never leaves the `.meta`
	/// sidecar behind; that first real error is what gets returned.
	fn rm_key_pair(&self, key: &str) -> Result<()> {
		let meta_key = key::meta_key(key);

		let payload_result = match self.backend.rm_object(key) {
			Ok(()) => Ok(()),
			Err(e) if e.is_not_found() => Ok(()),
			Err(e) => Err(e),
		};

		let metadata_result = match self.backend.rm_object(&meta_key) {
			Ok(()) => Ok(()),
			Err(e) if e.is_not_found() => Ok(()),
			Err(e) => Err(e),
		};

		payload_result?;
		metadata_result?;
		Ok(())
	}

	fn save_version_sync(&self, uid: &VersionUid, text: &str, overwrite: bool) -> Result<()> {
		let key = key::version_uid_to_key(uid);
		let meta_key = key::meta_key(&key);

		if !overwrite {
			match self.backend.read_object(&key) {
				Ok(_) => return Err(Error::AlreadyExists(format!("version {} already exists", uid))),
				Err(e) if e.is_not_found() => {}
				Err(e) => return Err(e),
			}
		}

		let data = text.as_bytes().to_vec();
		let (stored, transform_records) = self.transforms.encapsulate(data.clone())?;
		let metadata = Metadata::new(data.len() as u64, stored.len() as u64, None, transform_records);
		let metadata_bytes = metadata.encode(self.hmac_key_ref())?;

		let result = self
			.backend
			.write_object(&key, &stored)
			.and_then(|_| self.backend.write_object(&meta_key, &metadata_bytes));

		if let Err(e) = result {
			let _ = self.backend.rm_object(&key);
			let _ = self.backend.rm_object(&meta_key);
			return Err(e);
		}

		Ok(())
	}

	fn read_version_sync(&self, uid: &VersionUid) -> Result<String> {
		let key = key::version_uid_to_key(uid);
		let meta_key = key::meta_key(&key);

		let metadata_bytes = self.backend.read_object(&meta_key)?;
		let metadata = Metadata::decode(&metadata_bytes, self.hmac_key_ref())?;

		let raw = self.backend.read_object(&key)?;
		let data = self.transforms.decapsulate(raw, &metadata.transforms)?;

		if data.len() as u64 != metadata.size {
			return Err(Error::ValueMismatch(format!(
				"version {} decoded length {} does not match metadata size {}",
				uid,
				data.len(),
				metadata.size
			)));
		}

		String::from_utf8(data).map_err(|e| Error::ValueMismatch(format!("version {} is not valid UTF-8: {}", uid, e)))
	}
}

/// Verify a read's metadata against the caller's expectations for `block`.
fn check_block_metadata(block: &DereferencedBlock, data_length: Option<u64>, metadata: &Metadata) -> Result<()> {
	if metadata.size != block.size {
		return Err(Error::ValueMismatch(format!(
			"metadata size {} does not match block size {}",
			metadata.size, block.size
		)));
	}
	if let Some(len) = data_length {
		if len != metadata.size {
			return Err(Error::ValueMismatch(format!(
				"decoded data length {} does not match metadata size {}",
				len, metadata.size
			)));
		}
	}
	if metadata.checksum != block.checksum {
		return Err(Error::ValueMismatch(format!(
			"metadata checksum {:?} does not match block checksum {:?}",
			metadata.checksum, block.checksum
		)));
	}
	Ok(())
}

/// A named storage instance: the facade described throughout §4.
pub struct Storage {
	inner: Arc<Inner>,
	read_pool: Pool<ReadResult>,
	write_pool: Pool<()>,
}

impl Storage {
	pub fn new(
		name: impl Into<String>,
		storage_id: u32,
		backend: Arc<dyn Backend>,
		config: &StorageConfig,
		available_transforms: Vec<Arc<dyn Transform>>,
	) -> Result<Self> {
		let transforms = TransformRegistry::new(available_transforms, &config.active_transforms)?;
		let hmac_key = config.hmac.as_ref().map(|h| h.resolve()).transpose()?;
		let cache = match &config.read_cache {
			Some(cache_config) => match ReadCache::open(cache_config) {
				Ok(cache) => Some(cache),
				Err(e) => {
					tracing::warn!(error = %e, "read cache construction failed, degrading to uncached operation");
					None
				}
			},
			None => None,
		};

		let inner = Arc::new(Inner {
			name: name.into(),
			storage_id,
			backend,
			transforms,
			hmac_key,
			consistency_check_writes: config.consistency_check_writes,
			read_throttle: Throttle::new(config.bandwidth_read),
			write_throttle: Throttle::new(config.bandwidth_write),
			cache,
			use_read_cache: AtomicBool::new(true),
		});

		Ok(Storage {
			inner,
			read_pool: Pool::new(config.simultaneous_reads, config.queue_depth, true)?,
			write_pool: Pool::new(config.simultaneous_writes, config.queue_depth, false)?,
		})
	}

	pub fn name(&self) -> &str {
		&self.inner.name
	}

	pub fn storage_id(&self) -> u32 {
		self.inner.storage_id
	}

	/// Toggle whether reads may be served from the cache; returns the prior
	/// value. The cache is always populated on miss regardless of this
	/// setting, so a later re-enable sees a warm cache.
	pub fn use_read_cache(&self, enabled: bool) -> bool {
		self.inner.use_read_cache.swap(enabled, Ordering::SeqCst)
	}

	/// Persist `data` for `block`. `sync` bypasses the write pool and runs
	/// inline; otherwise the job runs on the bounded write pool and its
	/// result arrives through [`Storage::save_get_completed`].
	pub fn save(&self, block: &DereferencedBlock, data: &[u8], sync: bool) -> Result<()> {
		if sync {
			return self.write_pool.run_sync(|| self.inner.save_sync(block, data));
		}
		let inner = self.inner.clone();
		let block = block.clone();
		let data = data.to_vec();
		self.write_pool.submit(move || inner.save_sync(&block, &data))
	}

	/// Fetch `block`'s data and metadata. `sync` bypasses the read pool and
	/// runs inline; otherwise the job runs on the bounded read pool and its
	/// result arrives through [`Storage::read_get_completed`].
	pub fn read(&self, block: &DereferencedBlock, metadata_only: bool, sync: bool) -> Result<Option<ReadResult>> {
		if sync {
			return self.read_pool.run_sync(|| self.inner.read_sync(block, metadata_only)).map(Some);
		}
		let inner = self.inner.clone();
		let block = block.clone();
		self.read_pool.submit(move || inner.read_sync(&block, metadata_only))?;
		Ok(None)
	}

	/// Drain one completed save, in completion order, waiting up to
	/// `timeout` (or indefinitely when `None`).
	pub fn save_get_completed(&self, timeout: Option<Duration>) -> Option<Result<()>> {
		self.write_pool.next_completed(timeout)
	}

	/// Drain one completed read, in completion order, waiting up to
	/// `timeout` (or indefinitely when `None`).
	pub fn read_get_completed(&self, timeout: Option<Duration>) -> Option<Result<ReadResult>> {
		self.read_pool.next_completed(timeout)
	}

	/// Block until every outstanding save has completed, without draining
	/// or interpreting results.
	pub fn wait_saves_finished(&self) {
		self.write_pool.wait_finished();
	}

	/// Block until every outstanding read has completed, without draining
	/// or interpreting results.
	pub fn wait_reads_finished(&self) {
		self.read_pool.wait_finished();
	}

	/// Cross-check a read's metadata against the caller's expectations for
	/// `block`. See §4.F.
	pub fn check_block_metadata(&self, block: &DereferencedBlock, data_length: Option<u64>, metadata: &Metadata) -> Result<()> {
		check_block_metadata(block, data_length, metadata)
	}

	/// Delete a block's payload and metadata, swallowing *not found* on
	/// either side.
	pub fn rm(&self, uid: &BlockUid) -> Result<()> {
		let key = key::block_uid_to_key(uid);
		self.inner.rm_key_pair(&key)
	}

	/// Delete a version's payload and metadata; same semantics as [`Storage::rm`].
	pub fn rm_version(&self, uid: &VersionUid) -> Result<()> {
		let key = key::version_uid_to_key(uid);
		self.inner.rm_key_pair(&key)
	}

	/// Bulk delete: every payload in one backend call, then every metadata
	/// in a second. Returns the UIDs whose payload deletion failed, decoded
	/// from the failed keys the backend reports.
	pub fn rm_many(&self, uids: &[BlockUid]) -> Vec<BlockUid> {
		let payload_keys: Vec<String> = uids.iter().map(key::block_uid_to_key).collect();
		let meta_keys: Vec<String> = payload_keys.iter().map(|k| key::meta_key(k)).collect();

		let failed_payload_keys = self.inner.backend.rm_many_objects(&payload_keys);
		self.inner.backend.rm_many_objects(&meta_keys);

		failed_payload_keys
			.into_iter()
			.filter_map(|k| key::key_to_block_uid(&k).ok())
			.collect()
	}

	/// Enumerate block UIDs present on the backend, tolerating stray
	/// objects that don't decode to a valid key.
	pub fn list_blocks(&self) -> Result<Vec<BlockUid>> {
		let keys = self.inner.backend.list_objects(key::BLOCKS_PREFIX)?;
		Ok(keys
			.into_iter()
			.filter(|k| !k.ends_with(key::META_SUFFIX))
			.filter_map(|k| key::key_to_block_uid(&k).ok())
			.collect())
	}

	/// Enumerate version UIDs present on the backend, tolerating strays.
	pub fn list_versions(&self) -> Result<Vec<VersionUid>> {
		let keys = self.inner.backend.list_objects(key::VERSIONS_PREFIX)?;
		Ok(keys
			.into_iter()
			.filter(|k| !k.ends_with(key::META_SUFFIX))
			.filter_map(|k| key::key_to_version_uid(&k).ok())
			.collect())
	}

	/// Store a version manifest's text, guarding against accidental
	/// overwrite unless `overwrite` is set.
	pub fn save_version(&self, uid: &VersionUid, text: &str, overwrite: bool) -> Result<()> {
		self.inner.save_version_sync(uid, text, overwrite)
	}

	/// Read a version manifest's text back.
	pub fn read_version(&self, uid: &VersionUid) -> Result<String> {
		self.inner.read_version_sync(uid)
	}

	/// Cancel-and-drain both pools, then log cache hit/miss counters and
	/// flush it, if one is configured.
	pub fn close(&self) {
		self.write_pool.close();
		self.read_pool.close();
		if let Some(cache) = &self.inner.cache {
			cache.close();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::memory::MemoryBackend;
	use crate::transform::testing::PassThroughTransform;

	fn config() -> StorageConfig {
		StorageConfig {
			simultaneous_reads: 2,
			simultaneous_writes: 2,
			bandwidth_read: 0,
			bandwidth_write: 0,
			queue_depth: 1,
			consistency_check_writes: false,
			active_transforms: vec![],
			hmac: None,
			read_cache: None,
		}
	}

	fn storage(config: StorageConfig) -> Storage {
		Storage::new("primary", 1, Arc::new(MemoryBackend::new()), &config, vec![]).unwrap()
	}

	#[test]
	fn s1_round_trip_no_transforms_no_hmac() {
		let storage = storage(config());
		let block = DereferencedBlock {
			uid: BlockUid::new(0x1, 0x2),
			id: 1,
			size: 4,
			checksum: Some("abcd".to_string()),
		};
		let data = vec![0x00, 0x01, 0x02, 0x03];
		storage.save(&block, &data, true).unwrap();

		let result = storage.read(&block, false, true).unwrap().unwrap();
		assert_eq!(result.data.unwrap(), data);
		assert_eq!(result.metadata.size, 4);
		assert_eq!(result.metadata.object_size, 4);
		assert_eq!(result.metadata.checksum.as_deref(), Some("abcd"));
	}

	#[test]
	fn s2_hmac_tamper_is_detected() {
		let mut cfg = config();
		cfg.hmac = Some(silo_util::config::HmacConfig {
			key: Some(b"a-hmac-key".to_vec()),
			..Default::default()
		});
		let storage = storage(cfg);
		let block = DereferencedBlock {
			uid: BlockUid::new(0x1, 0x2),
			id: 1,
			size: 4,
			checksum: Some("abcd".to_string()),
		};
		storage.save(&block, &[0, 1, 2, 3], true).unwrap();

		let meta_key = key::meta_key(&key::block_uid_to_key(&block.uid));
		let mut tampered = storage.inner.backend.read_object(&meta_key).unwrap();
		tampered[2] ^= 0xFF;
		storage.inner.backend.write_object(&meta_key, &tampered).unwrap();

		let err = storage.read(&block, false, true).unwrap_err();
		assert!(matches!(err, Error::IntegrityFailure(_)));
	}

	#[test]
	fn s3_transform_chain_round_trips() {
		let mut cfg = config();
		cfg.active_transforms = vec!["zlib".to_string(), "aes".to_string()];
		let available: Vec<Arc<dyn Transform>> = vec![
			Arc::new(PassThroughTransform::new("zlib")),
			Arc::new(PassThroughTransform::new("aes")),
		];
		let storage = Storage::new("primary", 1, Arc::new(MemoryBackend::new()), &cfg, available).unwrap();

		let block = DereferencedBlock {
			uid: BlockUid::new(0x1, 0x2),
			id: 1,
			size: 10_000,
			checksum: Some("x".to_string()),
		};
		let data = vec![b'A'; 10_000];
		storage.save(&block, &data, true).unwrap();

		let result = storage.read(&block, false, true).unwrap().unwrap();
		assert_eq!(result.data.unwrap(), data);
		assert_eq!(result.metadata.transforms.len(), 2);
		assert_eq!(result.metadata.transforms[0].name, "zlib");
		assert_eq!(result.metadata.transforms[1].name, "aes");
	}

	#[test]
	fn s4_size_mismatch_after_truncation() {
		let storage = storage(config());
		let block = DereferencedBlock {
			uid: BlockUid::new(0x1, 0x2),
			id: 1,
			size: 4,
			checksum: Some("abcd".to_string()),
		};
		storage.save(&block, &[0, 1, 2, 3], true).unwrap();

		let key = key::block_uid_to_key(&block.uid);
		let mut truncated = storage.inner.backend.read_object(&key).unwrap();
		truncated.pop();
		storage.inner.backend.write_object(&key, &truncated).unwrap();

		let err = storage.read(&block, false, true).unwrap_err();
		assert!(matches!(err, Error::ValueMismatch(_)));
	}

	#[test]
	fn s5_backpressure_blocks_fourth_submission() {
		let mut cfg = config();
		cfg.simultaneous_writes = 2;
		cfg.queue_depth = 1;
		let storage = storage(cfg);

		for i in 0..3u64 {
			let block = DereferencedBlock {
				uid: BlockUid::new(i, i),
				id: i,
				size: 1,
				checksum: Some("x".to_string()),
			};
			storage.save(&block, &[1], false).unwrap();
		}

		// The pool (2 workers + 1 queue slot = 3) is now fully claimed; a
		// 4th submission must block until one completes. We don't assert on
		// timing here (the test-transform/backend are effectively instant),
		// only that it eventually succeeds and all four outcomes surface.
		let block4 = DereferencedBlock {
			uid: BlockUid::new(9, 9),
			id: 9,
			size: 1,
			checksum: Some("x".to_string()),
		};
		storage.save(&block4, &[1], false).unwrap();

		let mut completed = 0;
		while storage.save_get_completed(Some(Duration::from_secs(1))).is_some() {
			completed += 1;
			if completed == 4 {
				break;
			}
		}
		assert_eq!(completed, 4);
	}

	#[test]
	fn s6_version_overwrite_guard() {
		let storage = storage(config());
		let uid = VersionUid::new(1);
		storage.save_version(&uid, "a", false).unwrap();
		let err = storage.save_version(&uid, "b", false).unwrap_err();
		assert!(matches!(err, Error::AlreadyExists(_)));

		storage.save_version(&uid, "b", true).unwrap();
		assert_eq!(storage.read_version(&uid).unwrap(), "b");
	}

	#[test]
	fn rm_then_read_is_not_found() {
		let storage = storage(config());
		let block = DereferencedBlock {
			uid: BlockUid::new(0x1, 0x2),
			id: 1,
			size: 4,
			checksum: Some("abcd".to_string()),
		};
		storage.save(&block, &[0, 1, 2, 3], true).unwrap();
		storage.rm(&block.uid).unwrap();
		let err = storage.read(&block, false, true).unwrap_err();
		assert!(err.is_not_found());
	}

	#[test]
	fn rm_tolerates_already_missing() {
		let storage = storage(config());
		storage.rm(&BlockUid::new(0x9, 0x9)).unwrap();
	}

	#[test]
	fn rm_many_deletes_payloads_and_metadata_in_bulk() {
		let storage = storage(config());
		let uids: Vec<BlockUid> = (0..3u64)
			.map(|i| {
				let uid = BlockUid::new(i, i);
				let block = DereferencedBlock {
					uid,
					id: i,
					size: 1,
					checksum: Some("x".to_string()),
				};
				storage.save(&block, &[1], true).unwrap();
				uid
			})
			.collect();

		let failed = storage.rm_many(&uids);
		assert!(failed.is_empty());
		assert!(storage.list_blocks().unwrap().is_empty());
	}

	#[test]
	fn rm_many_tolerates_already_missing_uids() {
		let storage = storage(config());
		let block = DereferencedBlock {
			uid: BlockUid::new(0x1, 0x2),
			id: 1,
			size: 4,
			checksum: Some("abcd".to_string()),
		};
		storage.save(&block, &[0, 1, 2, 3], true).unwrap();

		let failed = storage.rm_many(&[block.uid, BlockUid::new(0x9, 0x9)]);
		assert!(failed.is_empty());
	}

	#[test]
	fn metadata_only_read_detects_truncated_payload() {
		let storage = storage(config());
		let block = DereferencedBlock {
			uid: BlockUid::new(0x1, 0x2),
			id: 1,
			size: 4,
			checksum: Some("abcd".to_string()),
		};
		storage.save(&block, &[0, 1, 2, 3], true).unwrap();

		let key = key::block_uid_to_key(&block.uid);
		let mut truncated = storage.inner.backend.read_object(&key).unwrap();
		truncated.pop();
		storage.inner.backend.write_object(&key, &truncated).unwrap();

		let err = storage.read(&block, true, true).unwrap_err();
		assert!(matches!(err, Error::ValueMismatch(_)));
	}

	#[test]
	fn s9_list_blocks_tolerates_stray_keys() {
		let storage = storage(config());
		let block = DereferencedBlock {
			uid: BlockUid::new(0x1, 0x2),
			id: 1,
			size: 4,
			checksum: Some("abcd".to_string()),
		};
		storage.save(&block, &[0, 1, 2, 3], true).unwrap();
		storage
			.inner
			.backend
			.write_object(&key::to_key(key::BLOCKS_PREFIX, "not-a-uid"), b"stray")
			.unwrap();

		let listed = storage.list_blocks().unwrap();
		assert_eq!(listed, vec![block.uid]);
	}

	#[test]
	fn name_and_storage_id_accessors() {
		let storage = storage(config());
		assert_eq!(storage.name(), "primary");
		assert_eq!(storage.storage_id(), 1);
	}

	#[test]
	fn wait_saves_finished_blocks_until_pool_drains() {
		let storage = storage(config());
		let block = DereferencedBlock {
			uid: BlockUid::new(1, 1),
			id: 1,
			size: 1,
			checksum: Some("x".to_string()),
		};
		storage.save(&block, &[1], false).unwrap();
		storage.wait_saves_finished();
		storage.close();
	}
}

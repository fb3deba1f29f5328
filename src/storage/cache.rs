//! An optional disk-backed read cache, keyed by object key, with LFU
//! eviction against a configured byte-size ceiling.
//!
//! Built on `sled` (the teacher's own embedded KV store, see
//! `db::sled_adapter`), since the corpus has no direct equivalent of
//! Python's `diskcache`. `sled` gives persistence and iteration; the LFU
//! frequency bookkeeping is layered on top in memory, since `sled` has no
//! native eviction policy of its own.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use silo_util::config::ReadCacheConfig;
use silo_util::error::{Error, Result};

/// One cached entry: the metadata bytes (always present on a populated
/// entry) and the payload bytes (present only when a full read, not a
/// metadata-only read, populated the cache).
#[derive(Clone)]
pub struct CachedEntry {
	pub metadata: Vec<u8>,
	pub data: Option<Vec<u8>>,
}

struct Frequencies {
	counts: HashMap<String, u64>,
	total_bytes: u64,
}

/// The read cache. Construction can fail (bad directory, disk full); callers
/// are expected to degrade to uncached operation on that failure rather than
/// treat it as fatal, per the component's degrade-on-failure contract.
pub struct ReadCache {
	db: sled::Db,
	maximum_size: u64,
	freq: Mutex<Frequencies>,
	hits: std::sync::atomic::AtomicU64,
	misses: std::sync::atomic::AtomicU64,
}

impl ReadCache {
	/// `directory` and `maximum_size` are required together at the
	/// configuration layer (`ReadCacheConfig` only exists wrapped in an
	/// `Option`, so one without the other cannot be expressed).
	pub fn open(config: &ReadCacheConfig) -> Result<Self> {
		Self::open_at(&config.directory, config.maximum_size)
	}

	pub fn open_at(directory: &Path, maximum_size: u64) -> Result<Self> {
		let db = sled::open(directory).map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
		let mut total_bytes = 0u64;
        let mut counts = HashMap::new();
		for item in db.iter() {
			let (key, value) = item.map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
			total_bytes += value.len() as u64;
			counts.insert(String::from_utf8_lossy(&key).to_string(), 0);
		}
		Ok(ReadCache {
			db,
			maximum_size,
			freq: Mutex::new(Frequencies { counts, total_bytes }),
			hits: std::sync::atomic::AtomicU64::new(0),
			misses: std::sync::atomic::AtomicU64::new(0),
		})
	}

	/// Look up a cached entry for `key` (the object key, not the sidecar
	/// key), bumping its frequency counter on a hit.
	pub fn get(&self, key: &str) -> Option<CachedEntry> {
		let metadata = self.db.get(meta_tree_key(key)).ok().flatten();
		let metadata = match metadata {
			Some(m) => m.to_vec(),
			None => {
				self.misses.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
				return None;
			}
		};
		let data = self.db.get(data_tree_key(key)).ok().flatten().map(|d| d.to_vec());

		self.hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
		let mut freq = self.freq.lock().unwrap();
		*freq.counts.entry(key.to_string()).or_insert(0) += 1;

		Some(CachedEntry { metadata, data })
	}

	/// Insert or replace the cached entry for `key`. Always stores metadata;
	/// stores payload only when `data` is `Some`, leaving any previously
	/// cached payload for this key in place when `data` is `None` (a
	/// metadata-only read must not evict an already-cached payload).
	pub fn put(&self, key: &str, metadata: &[u8], data: Option<&[u8]>) {
		let mut added = metadata.len() as u64;
		let _ = self.db.insert(meta_tree_key(key), metadata);
		if let Some(data) = data {
			added += data.len() as u64;
			let _ = self.db.insert(data_tree_key(key), data);
		}

		{
			let mut freq = self.freq.lock().unwrap();
			freq.counts.entry(key.to_string()).or_insert(0);
			freq.total_bytes += added;
		}
		self.evict_if_needed();
	}

	/// Evict the least-frequently-used keys until the cache is back under
	/// its configured ceiling.
	fn evict_if_needed(&self) {
		let mut freq = self.freq.lock().unwrap();
		if freq.total_bytes <= self.maximum_size {
			return;
		}
		let mut by_count: Vec<(String, u64)> = freq.counts.iter().map(|(k, v)| (k.clone(), *v)).collect();
		by_count.sort_by_key(|(_, count)| *count);

		for (key, _) in by_count {
			if freq.total_bytes <= self.maximum_size {
				break;
			}
			let mut freed = 0u64;
			if let Ok(Some(v)) = self.db.remove(meta_tree_key(&key)) {
				freed += v.len() as u64;
			}
			if let Ok(Some(v)) = self.db.remove(data_tree_key(&key)) {
				freed += v.len() as u64;
			}
			freq.total_bytes = freq.total_bytes.saturating_sub(freed);
			freq.counts.remove(&key);
		}
	}

	pub fn hits(&self) -> u64 {
		self.hits.load(std::sync::atomic::Ordering::Relaxed)
	}

	pub fn misses(&self) -> u64 {
		self.misses.load(std::sync::atomic::Ordering::Relaxed)
	}

	/// Log hit/miss counters and flush the underlying store.
	pub fn close(&self) {
		tracing::debug!(hits = self.hits(), misses = self.misses(), "closing read cache");
		let _ = self.db.flush();
	}
}

fn meta_tree_key(key: &str) -> String {
	format!("m:{}", key)
}

fn data_tree_key(key: &str) -> String {
	format!("d:{}", key)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn tempdir() -> mktemp::Temp {
		mktemp::Temp::new_dir().unwrap()
	}

	#[test]
	fn populates_and_hits() {
		let dir = tempdir();
		let cache = ReadCache::open_at(&dir, 1_000_000).unwrap();
		cache.put("blocks/ab/cd/x", b"{}", Some(b"payload"));
		let entry = cache.get("blocks/ab/cd/x").unwrap();
		assert_eq!(entry.metadata, b"{}");
		assert_eq!(entry.data.as_deref(), Some(&b"payload"[..]));
		assert_eq!(cache.hits(), 1);
	}

	#[test]
	fn miss_is_counted() {
		let dir = tempdir();
		let cache = ReadCache::open_at(&dir, 1_000_000).unwrap();
		assert!(cache.get("blocks/ab/cd/missing").is_none());
		assert_eq!(cache.misses(), 1);
	}

	#[test]
	fn metadata_only_put_preserves_existing_payload() {
		let dir = tempdir();
		let cache = ReadCache::open_at(&dir, 1_000_000).unwrap();
		cache.put("k", b"{}", Some(b"payload"));
		cache.put("k", b"{\"v\":2}", None);
		let entry = cache.get("k").unwrap();
		assert_eq!(entry.metadata, b"{\"v\":2}");
		assert_eq!(entry.data.as_deref(), Some(&b"payload"[..]));
	}

	#[test]
	fn evicts_least_frequently_used_entries() {
		let dir = tempdir();
		let cache = ReadCache::open_at(&dir, 10).unwrap();
		cache.put("a", b"0123456789", None);
		// Bump "a"'s frequency so it survives; "b" is fresh with count 0.
		cache.get("a");
		cache.put("b", b"0123456789", None);
		// Total now exceeds the 10-byte ceiling; "b" (lower frequency) is evicted first.
		assert!(cache.get("a").is_some());
	}
}

//! Identifiers for the two kinds of object this engine persists: blocks and
//! version manifests.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A 128-bit block identifier, carried as a pair of jointly-unique 64-bit
/// halves. Rendered in object keys as `"%016x-%016x"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockUid {
	pub left: u64,
	pub right: u64,
}

impl BlockUid {
	pub fn new(left: u64, right: u64) -> Self {
		BlockUid { left, right }
	}

	/// The canonical string form used as the object key's unhashed suffix.
	pub fn canonical(&self) -> String {
		format!("{:016x}-{:016x}", self.left, self.right)
	}
}

impl fmt::Display for BlockUid {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.canonical())
	}
}

/// A stand-in for the width of a canonical [`BlockUid`] string: 16 hex chars,
/// a dash, 16 hex chars.
pub const BLOCK_UID_CANONICAL_LEN: usize = 16 + 1 + 16;

/// An opaque, readable version identifier: `"V"` followed by a zero-padded
/// 10-digit decimal value. Round-trips through [`VersionUid::readable`] and
/// [`VersionUid::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionUid(pub u64);

impl VersionUid {
	pub fn new(value: u64) -> Self {
		VersionUid(value)
	}

	/// The canonical readable form, e.g. `"V0000000001"`.
	pub fn readable(&self) -> String {
		format!("V{:010}", self.0)
	}

	/// Parse a readable form back into a [`VersionUid`].
	pub fn parse(s: &str) -> Option<VersionUid> {
		let digits = s.strip_prefix('V')?;
		if digits.len() != 10 || !digits.bytes().all(|b| b.is_ascii_digit()) {
			return None;
		}
		digits.parse().ok().map(VersionUid)
	}
}

impl fmt::Display for VersionUid {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.readable())
	}
}

/// A dereferenced block handle: the storage core treats this as an opaque
/// bag of declared facts about the block and never mutates it, returning the
/// same handle it was given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DereferencedBlock {
	pub uid: BlockUid,
	pub id: u64,
	pub size: u64,
	pub checksum: Option<String>,
}

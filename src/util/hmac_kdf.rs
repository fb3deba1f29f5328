//! Key derivation for the metadata HMAC, when no key is supplied directly.

use hmac::Hmac;
use sha2::Sha256;

/// Derive a 32-byte HMAC key from `(salt, iterations, password)` via
/// PBKDF2-HMAC-SHA256.
pub fn derive_key(salt: &[u8], iterations: u32, password: &str) -> Vec<u8> {
	let mut key = [0u8; 32];
	pbkdf2::pbkdf2::<Hmac<Sha256>>(password.as_bytes(), salt, iterations, &mut key)
		.expect("PBKDF2 output length is valid for HMAC-SHA256");
	key.to_vec()
}

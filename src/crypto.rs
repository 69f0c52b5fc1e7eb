//! Challenge-response signatures and key derivation.
//!
//! The router authenticates drones with HMAC-SHA256 over the canonical string
//! `"{uuid}:{hex(nonce)}:{timestamp}"`. After registration has issued a
//! per-drone secret, authentication uses the combined key
//! `hex(SHA-256(shared_secret || secret_key))` instead of the raw secret.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Computes the HMAC-SHA256 signature for a challenge.
///
/// The signed message is `"{uuid}:{hex(nonce)}:{timestamp}"` with the nonce
/// lowercase hex-encoded and the timestamp in decimal unix seconds.
pub fn compute_hmac(secret: &str, drone_uuid: &str, nonce: &[u8], timestamp: u64) -> Vec<u8> {
    let message = format!("{}:{}:{}", drone_uuid, hex::encode(nonce), timestamp);
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Verifies a challenge signature in constant time.
pub fn verify_hmac(
    secret: &str,
    drone_uuid: &str,
    nonce: &[u8],
    timestamp: u64,
    signature: &[u8],
) -> bool {
    let message = format!("{}:{}:{}", drone_uuid, hex::encode(nonce), timestamp);
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    mac.verify_slice(signature).is_ok()
}

/// Derives the combined authentication key: `hex(SHA-256(shared || secret))`.
pub fn combined_key(shared_secret: &str, secret_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(shared_secret.as_bytes());
    hasher.update(secret_key.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_deterministic_and_verifies() {
        let nonce = [0x01u8, 0x02, 0x03, 0x04];
        let sig1 = compute_hmac("secret", "uuid-1", &nonce, 1_700_000_000);
        let sig2 = compute_hmac("secret", "uuid-1", &nonce, 1_700_000_000);
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 32);
        assert!(verify_hmac("secret", "uuid-1", &nonce, 1_700_000_000, &sig1));
    }

    #[test]
    fn test_single_bit_flip_fails_verification() {
        let nonce = [0xAAu8; 16];
        let sig = compute_hmac("secret", "uuid-1", &nonce, 1_700_000_000);

        let mut flipped_sig = sig.clone();
        flipped_sig[0] ^= 0x01;
        assert!(!verify_hmac(
            "secret",
            "uuid-1",
            &nonce,
            1_700_000_000,
            &flipped_sig
        ));

        let mut flipped_nonce = nonce;
        flipped_nonce[0] ^= 0x01;
        assert!(!verify_hmac(
            "secret",
            "uuid-1",
            &flipped_nonce,
            1_700_000_000,
            &sig
        ));

        assert!(!verify_hmac(
            "secret",
            "uuid-1",
            &nonce,
            1_700_000_001,
            &sig
        ));
        assert!(!verify_hmac("tecres", "uuid-1", &nonce, 1_700_000_000, &sig));
    }

    #[test]
    fn test_combined_key_deterministic_and_order_sensitive() {
        let k1 = combined_key("SHARED-XYZ", "per-drone-key");
        let k2 = combined_key("SHARED-XYZ", "per-drone-key");
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 64);

        // Swapping the inputs must produce a different key.
        let swapped = combined_key("per-drone-key", "SHARED-XYZ");
        assert_ne!(k1, swapped);
    }

    #[test]
    fn test_hmac_message_uses_hex_nonce() {
        // Same bytes through a distinct uuid/timestamp boundary must differ:
        // "a:bb:1" vs "ab:b:1" would collide without the colon separators.
        let sig1 = compute_hmac("s", "a", &[0xBB], 1);
        let sig2 = compute_hmac("s", "ab", &[0xB0], 1);
        assert_ne!(sig1, sig2);
    }
}

//! HMAC-SHA256 webhook signatures

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Prefix of the signature header value
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Signature header value for `body`, in the form the source host sends it.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(body);
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes()))
}

/// Check a received `sha256=<hex>` signature header against the body.
///
/// A missing prefix or undecodable hex is a mismatch. The digest comparison
/// is constant time.
pub fn verify(secret: &[u8], body: &[u8], signature_header: &[u8]) -> bool {
    let Some(hex_digest) = signature_header.strip_prefix(SIGNATURE_PREFIX.as_bytes()) else {
        return false;
    };
    let Ok(received) = hex::decode(hex_digest) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&received).is_ok()
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_roundtrip(
            secret in proptest::collection::vec(any::<u8>(), 1..64),
            body in proptest::collection::vec(any::<u8>(), 0..512)
        ) {
            let sig = sign(&secret, &body);
            prop_assert!(verify(&secret, &body, sig.as_bytes()));
        }

        #[test]
        fn prop_body_bit_flip_fails(
            secret in proptest::collection::vec(any::<u8>(), 1..64),
            body in proptest::collection::vec(any::<u8>(), 1..512),
            index in any::<prop::sample::Index>(),
            bit in 0u8..8
        ) {
            let sig = sign(&secret, &body);
            let mut tampered = body.clone();
            let i = index.index(tampered.len());
            tampered[i] ^= 1 << bit;
            prop_assert!(!verify(&secret, &tampered, sig.as_bytes()));
        }

        #[test]
        fn prop_digest_bit_flip_fails(
            secret in proptest::collection::vec(any::<u8>(), 1..64),
            body in proptest::collection::vec(any::<u8>(), 0..512),
            index in any::<prop::sample::Index>(),
            bit in 0u8..8
        ) {
            let sig = sign(&secret, &body);
            let mut digest = hex::decode(&sig[SIGNATURE_PREFIX.len()..]).unwrap();
            let i = index.index(digest.len());
            digest[i] ^= 1 << bit;
            let tampered = format!("{}{}", SIGNATURE_PREFIX, hex::encode(digest));
            prop_assert!(!verify(&secret, &body, tampered.as_bytes()));
        }
    }
}

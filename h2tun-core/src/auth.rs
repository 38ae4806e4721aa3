//! Request signing for tunnel operations.
//!
//! Every protected request carries a unix timestamp and its HMAC-SHA1
//! signature under the shared secret. The server checks the signature and
//! separately checks that the timestamp is fresh.

use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Signs and verifies short strings with a shared secret.
#[derive(Clone)]
pub struct Authenticator {
    mac: HmacSha1,
}

impl Authenticator {
    /// Create an authenticator for the given shared secret.
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        // HMAC accepts keys of any length, so this cannot fail.
        let mac = HmacSha1::new_from_slice(secret.as_ref()).expect("hmac key of any size");
        Self { mac }
    }

    /// HMAC-SHA1 signature of `data`, as 40 lowercase hex characters.
    pub fn sign(&self, data: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(data.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Check that `signature` is the signature of `data`.
    ///
    /// Freshness of the signed timestamp is the caller's concern.
    pub fn verify(&self, data: &str, signature: &str) -> bool {
        self.sign(data) == signature
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_roundtrip() {
        let auth = Authenticator::new("12345");
        let sig = auth.sign("1700000000");
        assert_eq!(sig.len(), 40);
        assert!(sig
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert!(auth.verify("1700000000", &sig));
    }

    #[test]
    fn known_vector() {
        // Published HMAC-SHA1 test vector.
        let auth = Authenticator::new("key");
        assert_eq!(
            auth.sign("The quick brown fox jumps over the lazy dog"),
            "de7c9b85b8b78aa6bc8a7a36f70a90701c9db4d9"
        );
    }

    #[test]
    fn tampered_data_fails() {
        let auth = Authenticator::new("secret");
        let sig = auth.sign("1700000000");
        assert!(!auth.verify("1700000001", &sig));
    }

    #[test]
    fn tampered_signature_fails() {
        let auth = Authenticator::new("secret");
        let mut sig = auth.sign("1700000000").into_bytes();
        sig[0] = if sig[0] == b'0' { b'1' } else { b'0' };
        assert!(!auth.verify("1700000000", std::str::from_utf8(&sig).unwrap()));
    }

    #[test]
    fn different_secrets_disagree() {
        let a = Authenticator::new("one");
        let b = Authenticator::new("two");
        assert_ne!(a.sign("x"), b.sign("x"));
        assert!(!b.verify("x", &a.sign("x")));
    }

    #[test]
    fn empty_secret_is_usable() {
        let auth = Authenticator::new("");
        assert!(auth.verify("data", &auth.sign("data")));
    }
}

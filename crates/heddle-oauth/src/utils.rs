//! Random material and key generation helpers.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use elliptic_curve::SecretKey;
use jose_jwk::{Jwk, Key, crypto};
use rand::{CryptoRng, RngCore, rngs::ThreadRng};
use sha2::{Digest, Sha256};

use crate::dpop::DpopError;

/// PKCE verifier and its S256 challenge.
#[derive(Debug, Clone)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    /// Generate a fresh verifier/challenge pair.
    ///
    /// https://datatracker.ietf.org/doc/html/rfc7636#section-4.1
    pub fn generate() -> Self {
        let verifier =
            URL_SAFE_NO_PAD.encode(get_random_values::<_, 32>(&mut ThreadRng::default()));
        let challenge = code_challenge(&verifier);
        Pkce {
            verifier,
            challenge,
        }
    }
}

/// S256 code challenge for a verifier.
pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Random `state` value for an authorization request.
pub fn generate_state() -> String {
    URL_SAFE_NO_PAD.encode(get_random_values::<_, 16>(&mut ThreadRng::default()))
}

pub fn get_random_values<R, const LEN: usize>(rng: &mut R) -> [u8; LEN]
where
    R: RngCore + CryptoRng,
{
    let mut bytes = [0u8; LEN];
    rng.fill_bytes(&mut bytes);
    bytes
}

/// Generate a fresh ES256 (P-256) keypair for DPoP binding.
pub fn generate_es256_key() -> p256::SecretKey {
    SecretKey::<p256::NistP256>::random(&mut ThreadRng::default())
}

/// Export a secret key as a private/public JWK pair.
///
/// Both JWKs carry empty parameter sets: no `key_ops` or `use` flags survive
/// to strict importers, and the private key is only ever re-imported for
/// signing.
pub fn export_keypair(secret: &p256::SecretKey) -> (Jwk, Jwk) {
    let private = Jwk {
        key: Key::from(&crypto::Key::from(secret.clone())),
        prm: Default::default(),
    };
    let public = Jwk {
        key: Key::from(&crypto::Key::from(secret.public_key())),
        prm: Default::default(),
    };
    (private, public)
}

/// Re-import a secret key from a stored private JWK.
///
/// Only the key material is read; any parameters on the JWK are ignored so
/// that operation flags cannot conflict with sign-only usage.
pub fn import_es256_secret(jwk: &Jwk) -> Result<p256::SecretKey, DpopError> {
    match crypto::Key::try_from(&jwk.key).map_err(DpopError::JwkCrypto)? {
        crypto::Key::P256(crypto::Kind::Secret(sk)) => Ok(sk),
        _ => Err(DpopError::UnsupportedKey),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn rfc7636_test_vector() {
        assert_eq!(
            code_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn verifier_shape() {
        for _ in 0..32 {
            let pkce = Pkce::generate();
            assert_eq!(pkce.verifier.len(), 43);
            assert_eq!(pkce.challenge.len(), 43);
            assert!(
                pkce.verifier
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
            );
        }
    }

    #[test]
    fn verifiers_unique() {
        let mut seen = HashSet::new();
        for _ in 0..64 {
            assert!(seen.insert(Pkce::generate().verifier));
        }
    }

    #[test]
    fn challenge_deterministic() {
        let pkce = Pkce::generate();
        assert_eq!(pkce.challenge, code_challenge(&pkce.verifier));
    }

    #[test]
    fn keypair_round_trip() {
        let secret = generate_es256_key();
        let (private, public) = export_keypair(&secret);
        let imported = import_es256_secret(&private).unwrap();
        assert_eq!(imported.to_bytes(), secret.to_bytes());
        // the public JWK must not carry private material
        assert!(import_es256_secret(&public).is_err());
    }
}

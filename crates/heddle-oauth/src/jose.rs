//! Compact JWS construction for ES256.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jose_jwa::Algorithm;
use jose_jwk::Jwk;
use p256::ecdsa::{Signature, SigningKey, signature::Signer};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// JWS protected header. Only the fields this engine emits; `jwk` carries
/// the embedded public key for DPoP proofs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwsHeader {
    pub alg: Algorithm,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typ: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwk: Option<Jwk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<SmolStr>,
}

impl From<Algorithm> for JwsHeader {
    fn from(alg: Algorithm) -> Self {
        Self {
            alg,
            typ: None,
            jwk: None,
            kid: None,
        }
    }
}

/// Serialize and sign `header`/`claims` into a compact JWS.
pub fn create_signed_jwt<C: Serialize>(
    key: SigningKey,
    header: &JwsHeader,
    claims: &C,
) -> serde_json::Result<String> {
    let header = URL_SAFE_NO_PAD.encode(serde_json::to_string(header)?);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_string(claims)?);
    let signature: Signature = key.sign(format!("{header}.{payload}").as_bytes());
    Ok(format!(
        "{header}.{payload}.{}",
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jose_jwa::Signing;

    #[test]
    fn compact_jws_shape() {
        let secret = crate::utils::generate_es256_key();
        let header = JwsHeader::from(Algorithm::Signing(Signing::Es256));
        let jwt = create_signed_jwt(
            SigningKey::from(secret),
            &header,
            &serde_json::json!({"hello": "world"}),
        )
        .unwrap();
        let parts: Vec<&str> = jwt.split('.').collect();
        assert_eq!(parts.len(), 3);

        let header: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[0]).unwrap()).unwrap();
        assert_eq!(header["alg"], "ES256");
        let payload: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[1]).unwrap()).unwrap();
        assert_eq!(payload["hello"], "world");
        // P-256 signatures are 64 bytes in the fixed encoding
        assert_eq!(URL_SAFE_NO_PAD.decode(parts[2]).unwrap().len(), 64);
    }
}

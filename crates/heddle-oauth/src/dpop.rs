//! DPoP proof construction and the nonce-aware HTTP wrapper.
//!
//! https://datatracker.ietf.org/doc/html/rfc9449

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use dashmap::DashMap;
use heddle_common::http_client::{HttpClient, clone_request};
use http::header::InvalidHeaderValue;
use jose_jwa::{Algorithm, Signing};
use jose_jwk::{Jwk, Key, crypto};
use p256::ecdsa::SigningKey;
use serde::{Deserialize, Serialize};
use sha2::Digest;
use smol_str::SmolStr;
use std::sync::{Arc, LazyLock};

use crate::error::BoxError;
use crate::jose::{JwsHeader, create_signed_jwt};

pub const JWT_HEADER_TYP_DPOP: &str = "dpop+jwt";

/// Proofs are short-lived; servers reject anything older than a few minutes.
const PROOF_LIFETIME_SECS: i64 = 300;

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum DpopError {
    #[error(transparent)]
    InvalidHeaderValue(#[from] InvalidHeaderValue),
    #[error("crypto error: {0:?}")]
    JwkCrypto(crypto::Error),
    #[error("key does not support ES256 signing")]
    UnsupportedKey,
    #[error("invalid request URL: {0}")]
    InvalidUrl(SmolStr),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error("transport: {0}")]
    Transport(#[source] BoxError),
}

type Result<T> = core::result::Result<T, DpopError>;

/// DPoP proof claims (RFC 9449 §4.2).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofClaims {
    pub jti: SmolStr,
    pub htm: SmolStr,
    pub htu: SmolStr,
    pub iat: i64,
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ath: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<SmolStr>,
}

/// Normalize a URL for the `htu` claim: scheme, host, port, and path only.
fn normalize_htu(url: &str) -> Result<SmolStr> {
    let mut url =
        url::Url::parse(url).map_err(|_| DpopError::InvalidUrl(SmolStr::new(url)))?;
    url.set_query(None);
    url.set_fragment(None);
    Ok(SmolStr::new(url.as_str()))
}

/// Origin (scheme + host + port) of a URL, the nonce-cache key.
pub fn origin_of(url: &str) -> Result<SmolStr> {
    let url = url::Url::parse(url).map_err(|_| DpopError::InvalidUrl(SmolStr::new(url)))?;
    Ok(SmolStr::new(url.origin().ascii_serialization()))
}

/// Hash of the access token for the `ath` claim.
pub fn access_token_hash(token: &str) -> SmolStr {
    SmolStr::new(URL_SAFE_NO_PAD.encode(sha2::Sha256::digest(token.as_bytes())))
}

/// Build a compact JWS (ES256) for DPoP with embedded public JWK.
pub fn build_dpop_proof(
    secret: &p256::SecretKey,
    method: &str,
    url: &str,
    nonce: Option<&str>,
    ath: Option<&str>,
) -> Result<String> {
    let mut header = JwsHeader::from(Algorithm::Signing(Signing::Es256));
    header.typ = Some(JWT_HEADER_TYP_DPOP.into());
    header.jwk = Some(Jwk {
        key: Key::from(&crypto::Key::from(secret.public_key())),
        prm: Default::default(),
    });

    let iat = Utc::now().timestamp();
    let claims = ProofClaims {
        jti: SmolStr::new(uuid::Uuid::new_v4().to_string()),
        htm: SmolStr::new(method.to_uppercase()),
        htu: normalize_htu(url)?,
        iat,
        exp: iat + PROOF_LIFETIME_SECS,
        ath: ath.map(SmolStr::new),
        nonce: nonce.map(SmolStr::new),
    };
    Ok(create_signed_jwt(
        SigningKey::from(secret.clone()),
        &header,
        &claims,
    )?)
}

/// Process-wide map from server origin to the most recent `DPoP-Nonce`.
///
/// Concurrent writers are fine: the value is idempotent per origin, and a
/// stale read costs at most one extra retry.
#[derive(Default)]
pub struct NonceCache(DashMap<SmolStr, SmolStr>);

static GLOBAL_NONCES: LazyLock<Arc<NonceCache>> = LazyLock::new(Default::default);

impl NonceCache {
    /// The shared process-wide cache.
    pub fn global() -> Arc<NonceCache> {
        GLOBAL_NONCES.clone()
    }

    pub fn get(&self, origin: &str) -> Option<SmolStr> {
        self.0.get(origin).map(|v| v.clone())
    }

    pub fn put(&self, origin: impl Into<SmolStr>, nonce: impl Into<SmolStr>) {
        self.0.insert(origin.into(), nonce.into());
    }
}

/// Which nonce-challenge convention the peer uses.
///
/// Authorization servers signal a missing/stale nonce with HTTP 400 and a
/// `DPoP-Nonce` header; resource servers use 401 (RFC 9449 §8–9, AT Protocol
/// profile).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DpopPeer {
    AuthServer,
    Resource,
}

/// HTTP wrapper that attaches DPoP proofs, tracks nonces per origin, and
/// retries a nonce challenge exactly once.
pub struct DpopHttp<T> {
    inner: Arc<T>,
    secret: p256::SecretKey,
    nonces: Arc<NonceCache>,
    peer: DpopPeer,
}

impl<T> DpopHttp<T>
where
    T: HttpClient + Send + Sync,
{
    /// Wrapper for token-endpoint calls.
    pub fn auth_server(inner: Arc<T>, secret: p256::SecretKey, nonces: Arc<NonceCache>) -> Self {
        Self {
            inner,
            secret,
            nonces,
            peer: DpopPeer::AuthServer,
        }
    }

    /// Wrapper for PDS/XRPC resource calls.
    pub fn resource(inner: Arc<T>, secret: p256::SecretKey, nonces: Arc<NonceCache>) -> Self {
        Self {
            inner,
            secret,
            nonces,
            peer: DpopPeer::Resource,
        }
    }

    fn challenge_status(&self) -> http::StatusCode {
        match self.peer {
            DpopPeer::AuthServer => http::StatusCode::BAD_REQUEST,
            DpopPeer::Resource => http::StatusCode::UNAUTHORIZED,
        }
    }

    /// Send with a DPoP proof; on a nonce challenge, retry once with the
    /// server-provided nonce.
    pub async fn send(
        &self,
        mut request: http::Request<Vec<u8>>,
    ) -> Result<http::Response<Vec<u8>>> {
        let url = request.uri().to_string();
        let method = request.method().as_str().to_owned();
        let origin = origin_of(&url)?;
        // https://datatracker.ietf.org/doc/html/rfc9449#section-4.2
        let ath = request
            .headers()
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("DPoP "))
            .map(access_token_hash);

        let init_nonce = self.nonces.get(&origin);
        let proof = build_dpop_proof(
            &self.secret,
            &method,
            &url,
            init_nonce.as_deref(),
            ath.as_deref(),
        )?;
        request.headers_mut().insert("DPoP", proof.parse()?);
        let response = self
            .inner
            .send_http(clone_request(&request))
            .await
            .map_err(|e| DpopError::Transport(e.into()))?;

        let next_nonce = response
            .headers()
            .get("DPoP-Nonce")
            .and_then(|v| v.to_str().ok())
            .map(SmolStr::new);
        let Some(next_nonce) = next_nonce else {
            return Ok(response);
        };
        self.nonces.put(origin, next_nonce.clone());

        if response.status() != self.challenge_status() {
            return Ok(response);
        }
        let proof = build_dpop_proof(
            &self.secret,
            &method,
            &url,
            Some(&next_nonce),
            ath.as_deref(),
        )?;
        request.headers_mut().insert("DPoP", proof.parse()?);
        self.inner
            .send_http(request)
            .await
            .map_err(|e| DpopError::Transport(e.into()))
    }
}

use heddle_common::types::Did;
use serde::Deserialize;
use smol_str::SmolStr;

// https://datatracker.ietf.org/doc/html/rfc9126#section-2.2
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ParResponse {
    pub request_uri: SmolStr,
    pub expires_in: Option<u32>,
}

/// Validated token response, the typed result of
/// [`crate::validate::validate_token_response`].
///
/// The ATPROTO profile adds the `sub` claim so clients can resolve the PDS
/// through DID resolution; here it is the authoritative account DID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenResponse {
    pub access_token: String,
    /// Always `DPoP` (case preserved from the wire).
    pub token_type: SmolStr,
    pub scope: SmolStr,
    pub sub: Did,
    pub expires_in: u64,
    pub refresh_token: Option<String>,
}

/// Structured OAuth error body from a token endpoint.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct OAuthErrorBody {
    pub error: Option<SmolStr>,
    pub error_description: Option<SmolStr>,
}

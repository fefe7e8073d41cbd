//! Explicit validation of incoming JSON documents.
//!
//! Wire documents arrive as untyped JSON; each validator narrows one into a
//! typed record field by field, so nothing downstream ever touches an
//! unchecked value.

use serde_json::Value;
use smol_str::SmolStr;
use url::Url;

use crate::error::{OAuthError, Result};
use crate::types::{AuthServerMetadata, TokenResponse};
use heddle_common::types::Did;

/// Parse a URL and require the `https` scheme.
pub fn require_https_url(value: &str, label: &str) -> Result<Url> {
    let url = Url::parse(value).map_err(|_| {
        OAuthError::metadata_validation(format!("{label} is not a valid URL: {value:?}"))
    })?;
    if url.scheme() != "https" {
        return Err(OAuthError::metadata_validation(format!(
            "{label} must use HTTPS: {value}"
        )));
    }
    Ok(url)
}

fn optional_https(obj: &serde_json::Map<String, Value>, field: &str) -> Result<Option<Url>> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => require_https_url(s, field).map(Some),
        Some(_) => Err(OAuthError::metadata_validation(format!(
            "{field} must be a string"
        ))),
    }
}

fn required_https(obj: &serde_json::Map<String, Value>, field: &str) -> Result<Url> {
    match obj.get(field) {
        Some(Value::String(s)) => require_https_url(s, field),
        Some(_) => Err(OAuthError::metadata_validation(format!(
            "{field} must be a string"
        ))),
        None => Err(OAuthError::metadata_validation(format!(
            "{field} is required"
        ))),
    }
}

/// Validate an authorization-server metadata document fetched from
/// `fetched_from` (RFC 8414 + AT Protocol OAuth profile).
pub fn validate_auth_server_metadata(raw: &Value, fetched_from: &Url) -> Result<AuthServerMetadata> {
    let obj = raw
        .as_object()
        .ok_or_else(|| OAuthError::metadata_validation("metadata must be a JSON object"))?;

    let issuer = match obj.get("issuer") {
        Some(Value::String(s)) if !s.is_empty() => require_https_url(s, "issuer")?,
        _ => {
            return Err(OAuthError::metadata_validation(
                "issuer must be a non-empty string",
            ));
        }
    };
    if issuer.origin() != fetched_from.origin() {
        return Err(OAuthError::metadata_validation(format!(
            "issuer {issuer} does not match metadata origin {fetched_from}"
        )));
    }

    let authorization_endpoint = required_https(obj, "authorization_endpoint")?;
    let token_endpoint = required_https(obj, "token_endpoint")?;
    let pushed_authorization_request_endpoint =
        optional_https(obj, "pushed_authorization_request_endpoint")?;
    let revocation_endpoint = optional_https(obj, "revocation_endpoint")?;

    let dpop_signing_alg_values_supported = match obj.get("dpop_signing_alg_values_supported") {
        None | Some(Value::Null) => None,
        Some(Value::Array(values)) => {
            let algs: Vec<SmolStr> = values
                .iter()
                .filter_map(|v| v.as_str().map(SmolStr::new))
                .collect();
            if !algs.iter().any(|alg| alg == crate::DPOP_ALG) {
                return Err(OAuthError::metadata_validation(
                    "dpop_signing_alg_values_supported must include ES256",
                ));
            }
            Some(algs)
        }
        Some(_) => {
            return Err(OAuthError::metadata_validation(
                "dpop_signing_alg_values_supported must be a list",
            ));
        }
    };

    Ok(AuthServerMetadata {
        issuer,
        authorization_endpoint,
        token_endpoint,
        pushed_authorization_request_endpoint,
        revocation_endpoint,
        dpop_signing_alg_values_supported,
    })
}

/// Validate a token-endpoint success body (RFC 6749 §5.1 + ATPROTO `sub`).
pub fn validate_token_response(raw: &Value) -> Result<TokenResponse> {
    let obj = raw
        .as_object()
        .ok_or_else(|| OAuthError::token_validation("token response must be a JSON object"))?;

    let access_token = match obj.get("access_token") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => {
            return Err(OAuthError::token_validation(
                "access_token must be a non-empty string",
            ));
        }
    };

    let token_type = match obj.get("token_type") {
        Some(Value::String(s)) if s.eq_ignore_ascii_case("dpop") => SmolStr::new(s),
        Some(Value::String(s)) => {
            return Err(OAuthError::token_validation(format!(
                "token_type must be DPoP, got {s:?}"
            )));
        }
        _ => return Err(OAuthError::token_validation("token_type is required")),
    };

    let scope = match obj.get("scope") {
        Some(Value::String(s)) if !s.is_empty() => {
            if !s.contains("atproto") {
                return Err(OAuthError::token_validation(format!(
                    "scope must include atproto, got {s:?}"
                )));
            }
            SmolStr::new(s)
        }
        _ => {
            return Err(OAuthError::token_validation(
                "scope must be a non-empty string",
            ));
        }
    };

    let sub = match obj.get("sub") {
        Some(Value::String(s)) if !s.is_empty() => {
            if !s.starts_with("did:") {
                return Err(OAuthError::token_validation(format!(
                    "sub must be a DID (did:…), got {s:?}"
                )));
            }
            Did::new(s).map_err(|e| OAuthError::token_validation(format!("sub: {e}")))?
        }
        _ => {
            return Err(OAuthError::token_validation(
                "sub must be a non-empty string",
            ));
        }
    };

    let expires_in = match obj.get("expires_in") {
        Some(value) => match value.as_u64() {
            Some(n) if n > 0 => n,
            _ => {
                return Err(OAuthError::token_validation(
                    "expires_in must be a positive number",
                ));
            }
        },
        None => {
            return Err(OAuthError::token_validation(
                "expires_in must be a positive number",
            ));
        }
    };

    let refresh_token = match obj.get("refresh_token") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            return Err(OAuthError::token_validation(
                "refresh_token must be a string",
            ));
        }
    };

    Ok(TokenResponse {
        access_token,
        token_type,
        scope,
        sub,
        expires_in,
        refresh_token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fetched_from() -> Url {
        Url::parse("https://bsky.social").unwrap()
    }

    #[test]
    fn rejects_http_endpoint() {
        let raw = json!({
            "issuer": "https://bsky.social",
            "authorization_endpoint": "http://bsky.social/oauth/authorize",
            "token_endpoint": "https://bsky.social/oauth/token"
        });
        let err = validate_auth_server_metadata(&raw, &fetched_from()).unwrap_err();
        assert!(matches!(err, OAuthError::MetadataValidation { .. }));
        assert!(err.to_string().contains("must use HTTPS"));
    }

    #[test]
    fn rejects_issuer_origin_mismatch() {
        let raw = json!({
            "issuer": "https://evil.com",
            "authorization_endpoint": "https://bsky.social/a",
            "token_endpoint": "https://bsky.social/t"
        });
        let err = validate_auth_server_metadata(&raw, &fetched_from()).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn rejects_non_object() {
        let err = validate_auth_server_metadata(&json!("nope"), &fetched_from()).unwrap_err();
        assert!(matches!(err, OAuthError::MetadataValidation { .. }));
    }

    #[test]
    fn rejects_missing_es256() {
        let raw = json!({
            "issuer": "https://bsky.social",
            "authorization_endpoint": "https://bsky.social/oauth/authorize",
            "token_endpoint": "https://bsky.social/oauth/token",
            "dpop_signing_alg_values_supported": ["RS256"]
        });
        let err = validate_auth_server_metadata(&raw, &fetched_from()).unwrap_err();
        assert!(err.to_string().contains("ES256"));
    }

    #[test]
    fn accepts_full_metadata() {
        let raw = json!({
            "issuer": "https://bsky.social",
            "authorization_endpoint": "https://bsky.social/oauth/authorize",
            "token_endpoint": "https://bsky.social/oauth/token",
            "pushed_authorization_request_endpoint": "https://bsky.social/oauth/par",
            "revocation_endpoint": "https://bsky.social/oauth/revoke",
            "dpop_signing_alg_values_supported": ["ES256"]
        });
        let metadata = validate_auth_server_metadata(&raw, &fetched_from()).unwrap();
        assert_eq!(metadata.issuer.as_str(), "https://bsky.social/");
        assert_eq!(
            metadata.par_endpoint().as_str(),
            "https://bsky.social/oauth/par"
        );
        assert!(metadata.revocation_endpoint.is_some());
    }

    #[test]
    fn par_endpoint_falls_back_to_fixed_path() {
        let raw = json!({
            "issuer": "https://bsky.social",
            "authorization_endpoint": "https://bsky.social/oauth/authorize",
            "token_endpoint": "https://bsky.social/oauth/token"
        });
        let metadata = validate_auth_server_metadata(&raw, &fetched_from()).unwrap();
        assert_eq!(
            metadata.par_endpoint().as_str(),
            "https://bsky.social/oauth/par"
        );
    }

    fn valid_token_body() -> serde_json::Value {
        json!({
            "access_token": "tok",
            "token_type": "DPoP",
            "scope": "atproto transition:generic",
            "sub": "did:plc:abc123",
            "expires_in": 3600,
            "refresh_token": "rt"
        })
    }

    #[test]
    fn accepts_valid_token_response() {
        let tokens = validate_token_response(&valid_token_body()).unwrap();
        assert_eq!(tokens.access_token, "tok");
        assert_eq!(tokens.sub.as_str(), "did:plc:abc123");
        assert_eq!(tokens.expires_in, 3600);
        assert_eq!(tokens.refresh_token.as_deref(), Some("rt"));
    }

    #[test]
    fn token_type_case_insensitive() {
        let mut body = valid_token_body();
        body["token_type"] = json!("dpop");
        assert!(validate_token_response(&body).is_ok());
        body["token_type"] = json!("Bearer");
        assert!(validate_token_response(&body).is_err());
    }

    #[test]
    fn rejects_non_did_sub() {
        let err = validate_token_response(&json!({
            "access_token": "x",
            "token_type": "DPoP",
            "scope": "atproto transition:generic",
            "sub": "user:abc",
            "expires_in": 3600
        }))
        .unwrap_err();
        assert!(matches!(err, OAuthError::TokenValidation { .. }));
        assert!(err.to_string().contains("did:"));
    }

    #[test]
    fn rejects_missing_atproto_scope() {
        let mut body = valid_token_body();
        body["scope"] = json!("email profile");
        let err = validate_token_response(&body).unwrap_err();
        assert!(err.to_string().contains("atproto"));
    }

    #[test]
    fn rejects_bad_expires_in() {
        let mut body = valid_token_body();
        body["expires_in"] = json!(0);
        assert!(validate_token_response(&body).is_err());
        body["expires_in"] = json!(-5);
        assert!(validate_token_response(&body).is_err());
        body.as_object_mut().unwrap().remove("expires_in");
        assert!(validate_token_response(&body).is_err());
    }

    #[test]
    fn rejects_non_string_refresh_token() {
        let mut body = valid_token_body();
        body["refresh_token"] = json!(42);
        assert!(validate_token_response(&body).is_err());
        body.as_object_mut().unwrap().remove("refresh_token");
        assert!(validate_token_response(&body).unwrap().refresh_token.is_none());
    }
}

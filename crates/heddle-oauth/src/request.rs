//! Form-encoded OAuth requests: PAR, token grants, and revocation.

use http::{Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use smol_str::SmolStr;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::dpop::{DpopHttp, NonceCache};
use crate::error::{OAuthError, Result};
use crate::types::{
    OAuthErrorBody, ParParameters, ParResponse, RefreshRequestParameters,
    RevocationRequestParameters, TokenRequestParameters,
};
use heddle_common::http_client::HttpClient;

fn form_request(url: &Url, params: &impl Serialize) -> Result<http::Request<Vec<u8>>> {
    let body = serde_html_form::to_string(params)
        .map_err(|e| OAuthError::protocol(format!("failed to encode form body: {e}")))?;
    http::Request::builder()
        .uri(url.as_str())
        .method(Method::POST)
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body(body.into_bytes())
        .map_err(|e| OAuthError::protocol(format!("failed to build request: {e}")))
}

/// Turn a non-OK token-endpoint response into a structured error.
fn token_endpoint_error(status: StatusCode, body: &[u8]) -> OAuthError {
    if let Ok(parsed) = serde_json::from_slice::<OAuthErrorBody>(body) {
        if parsed.error.is_some() || parsed.error_description.is_some() {
            return classify_oauth_error(parsed.error, parsed.error_description);
        }
    }
    let text = String::from_utf8_lossy(body);
    OAuthError::TokenExchange {
        code: None,
        description: Some(SmolStr::new(format!("HTTP {status}: {text}"))),
    }
}

/// `invalid_grant` means the refresh token is dead: expired, or revoked when
/// the server says so.
fn classify_oauth_error(code: Option<SmolStr>, description: Option<SmolStr>) -> OAuthError {
    if code.as_deref() == Some("invalid_grant") {
        let revoked = description
            .as_deref()
            .is_some_and(|d| d.to_lowercase().contains("revoked"));
        if revoked {
            return OAuthError::RefreshTokenRevoked { description };
        }
        return OAuthError::RefreshTokenExpired { description };
    }
    OAuthError::TokenExchange { code, description }
}

/// Submit a Pushed Authorization Request (RFC 9126).
///
/// PAR happens before any DPoP key exists for the session, so it is a plain
/// form POST.
#[tracing::instrument(level = "debug", skip_all, fields(endpoint = %endpoint))]
pub async fn push_authorization_request<T>(
    http: &T,
    endpoint: &Url,
    params: ParParameters<'_>,
) -> Result<ParResponse>
where
    T: HttpClient + Send + Sync,
{
    let request = form_request(endpoint, &params)?;
    let response = http
        .send_http(request)
        .await
        .map_err(|e| OAuthError::network(format!("fetch failed for {endpoint}"), e))?;
    if !response.status().is_success() {
        let body = String::from_utf8_lossy(response.body());
        return Err(OAuthError::protocol(format!(
            "pushed authorization request failed: HTTP {}: {body}",
            response.status()
        )));
    }
    serde_json::from_slice(response.body()).map_err(|e| {
        OAuthError::protocol(format!("pushed authorization response malformed: {e}"))
    })
}

/// POST a DPoP-bound grant to the token endpoint and return the raw JSON
/// body for validation.
async fn token_grant<T>(
    http: Arc<T>,
    secret: &p256::SecretKey,
    nonces: Arc<NonceCache>,
    token_endpoint: &Url,
    params: &impl Serialize,
) -> Result<Value>
where
    T: HttpClient + Send + Sync,
{
    let request = form_request(token_endpoint, params)?;
    let dpop = DpopHttp::auth_server(http, secret.clone(), nonces);
    let response = dpop.send(request).await?;
    if !response.status().is_success() {
        return Err(token_endpoint_error(response.status(), response.body()));
    }
    serde_json::from_slice(response.body())
        .map_err(|e| OAuthError::token_validation(format!("token response is not JSON: {e}")))
}

/// Exchange an authorization code (RFC 6749 §4.1.3, PKCE §4.5).
#[tracing::instrument(level = "debug", skip_all)]
pub async fn exchange_code<T>(
    http: Arc<T>,
    secret: &p256::SecretKey,
    nonces: Arc<NonceCache>,
    token_endpoint: &Url,
    params: TokenRequestParameters<'_>,
) -> Result<Value>
where
    T: HttpClient + Send + Sync,
{
    token_grant(http, secret, nonces, token_endpoint, &params).await
}

/// Refresh grant (RFC 6749 §6) with a hard timeout.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn refresh_grant<T>(
    http: Arc<T>,
    secret: &p256::SecretKey,
    nonces: Arc<NonceCache>,
    token_endpoint: &Url,
    params: RefreshRequestParameters<'_>,
    timeout: Duration,
) -> Result<Value>
where
    T: HttpClient + Send + Sync,
{
    match tokio::time::timeout(
        timeout,
        token_grant(http, secret, nonces, token_endpoint, &params),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(OAuthError::Network {
            message: SmolStr::new(format!(
                "token refresh timed out after {}ms",
                timeout.as_millis()
            )),
            source: None,
        }),
    }
}

/// Best-effort token revocation (RFC 7009). The result body is ignored; a
/// non-OK status is surfaced so callers can log it, nothing more.
#[tracing::instrument(level = "debug", skip_all, fields(endpoint = %endpoint))]
pub async fn revoke<T>(http: &T, endpoint: &Url, token: &str, client_id: &str) -> Result<()>
where
    T: HttpClient + Send + Sync,
{
    let request = form_request(
        endpoint,
        &RevocationRequestParameters { token, client_id },
    )?;
    let response = http
        .send_http(request)
        .await
        .map_err(|e| OAuthError::network(format!("fetch failed for {endpoint}"), e))?;
    if !response.status().is_success() {
        return Err(OAuthError::protocol(format!(
            "revocation returned HTTP {}",
            response.status()
        )));
    }
    Ok(())
}

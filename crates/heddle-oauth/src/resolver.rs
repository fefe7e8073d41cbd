//! Authorization-server discovery from a PDS or entryway URL.

use http::StatusCode;
use serde_json::Value;
use url::Url;

use crate::error::{OAuthError, Result};
use crate::types::{AuthServerMetadata, ProtectedResourceMetadata};
use crate::validate::validate_auth_server_metadata;
use heddle_common::http_client::HttpClient;

/// Compare two issuer strings strictly but without spuriously failing on
/// trivial differences.
///
/// Rules:
/// - Schemes must match exactly.
/// - Hostnames and effective ports must match (treat missing port the same as
///   default port).
/// - Path must match, except that an empty path and `/` are equivalent.
/// - Query/fragment are not allowed; if present on either side, the
///   comparison fails.
pub(crate) fn issuer_equivalent(a: &str, b: &str) -> bool {
    fn normalize(url: &Url) -> Option<(String, String, u16, String)> {
        if url.query().is_some() || url.fragment().is_some() {
            return None;
        }
        let scheme = url.scheme().to_string();
        let host = url.host_str()?.to_string();
        let port = url.port_or_known_default()?;
        let path = match url.path() {
            "" => "/".to_string(),
            other => other.to_string(),
        };
        Some((scheme, host, port, path))
    }

    match (Url::parse(a), Url::parse(b)) {
        (Ok(ua), Ok(ub)) => match (normalize(&ua), normalize(&ub)) {
            (Some(na), Some(nb)) => na == nb,
            _ => false,
        },
        _ => a == b,
    }
}

async fn get_json<T>(http: &T, url: &Url) -> Result<(StatusCode, Option<Value>)>
where
    T: HttpClient + Send + Sync,
{
    let request = http::Request::builder()
        .uri(url.as_str())
        .body(Vec::new())
        .map_err(|e| OAuthError::protocol(format!("failed to build request: {e}")))?;
    let response = http
        .send_http(request)
        .await
        .map_err(|e| OAuthError::network(format!("fetch failed for {url}"), e))?;
    let status = response.status();
    let value = serde_json::from_slice(response.body()).ok();
    Ok((status, value))
}

/// Fetch and validate `/.well-known/oauth-authorization-server` from an
/// issuer or entryway base URL.
pub async fn fetch_auth_server_metadata<T>(http: &T, server: &Url) -> Result<AuthServerMetadata>
where
    T: HttpClient + Send + Sync,
{
    let well_known = server
        .join("/.well-known/oauth-authorization-server")
        .map_err(|e| OAuthError::auth_server_discovery("invalid server URL", Some(Box::new(e))))?;
    let (status, value) = get_json(http, &well_known).await?;
    if !status.is_success() {
        return Err(OAuthError::auth_server_discovery(
            format!("{well_known} returned HTTP {status}"),
            None,
        ));
    }
    let Some(value) = value else {
        return Err(OAuthError::auth_server_discovery(
            format!("{well_known} returned a non-JSON body"),
            None,
        ));
    };
    validate_auth_server_metadata(&value, server)
}

/// Discover the authorization server for a PDS (or entryway) and return its
/// validated metadata.
///
/// The PDS's `/.well-known/oauth-protected-resource` names its authorization
/// server; when that document is absent or lists none, the PDS itself is
/// treated as the authorization server.
#[tracing::instrument(level = "debug", skip(http))]
pub async fn discover_auth_server<T>(http: &T, pds: &Url) -> Result<AuthServerMetadata>
where
    T: HttpClient + Send + Sync,
{
    let well_known = pds
        .join("/.well-known/oauth-protected-resource")
        .map_err(|e| OAuthError::auth_server_discovery("invalid PDS URL", Some(Box::new(e))))?;

    let auth_base = match get_json(http, &well_known).await {
        Ok((status, Some(value))) if status.is_success() => {
            let metadata: ProtectedResourceMetadata =
                serde_json::from_value(value).unwrap_or_default();
            match metadata
                .authorization_servers
                .as_ref()
                .and_then(|servers| servers.first())
            {
                Some(server) => server.clone(),
                None => pds.clone(),
            }
        }
        Ok(_) => {
            tracing::debug!(%pds, "no protected-resource metadata, treating PDS as auth server");
            pds.clone()
        }
        // transport failures are not recoverable by falling back
        Err(e) => return Err(e),
    };

    fetch_auth_server_metadata(http, &auth_base).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[test]
    fn issuer_equivalence_rules() {
        assert!(issuer_equivalent("https://issuer", "https://issuer/"));
        assert!(issuer_equivalent("https://issuer:443/", "https://issuer/"));
        assert!(!issuer_equivalent("http://issuer/", "https://issuer/"));
        assert!(!issuer_equivalent("https://issuer/foo", "https://issuer/"));
        assert!(!issuer_equivalent("https://issuer/?q=1", "https://issuer/"));
        assert!(!issuer_equivalent("https://other", "https://issuer"));
    }

    /// Mock that routes by request path.
    #[derive(Default)]
    struct RoutedHttp {
        routes: Mutex<HashMap<String, (u16, Value)>>,
    }

    impl RoutedHttp {
        fn route(&self, path: &str, status: u16, body: Value) {
            self.routes
                .lock()
                .unwrap()
                .insert(path.to_owned(), (status, body));
        }
    }

    impl HttpClient for RoutedHttp {
        type Error = std::convert::Infallible;
        async fn send_http(
            &self,
            request: http::Request<Vec<u8>>,
        ) -> core::result::Result<http::Response<Vec<u8>>, Self::Error> {
            let path = request.uri().path().to_owned();
            let (status, body) = self
                .routes
                .lock()
                .unwrap()
                .get(&path)
                .cloned()
                .unwrap_or((404, json!({})));
            Ok(http::Response::builder()
                .status(status)
                .body(serde_json::to_vec(&body).unwrap())
                .unwrap())
        }
    }

    fn auth_metadata_body(issuer: &str) -> Value {
        json!({
            "issuer": issuer,
            "authorization_endpoint": format!("{issuer}/oauth/authorize"),
            "token_endpoint": format!("{issuer}/oauth/token"),
        })
    }

    #[tokio::test]
    async fn discovers_via_protected_resource() {
        let http = RoutedHttp::default();
        http.route(
            "/.well-known/oauth-protected-resource",
            200,
            json!({"authorization_servers": ["https://auth.example.com"]}),
        );
        http.route(
            "/.well-known/oauth-authorization-server",
            200,
            auth_metadata_body("https://auth.example.com"),
        );
        let pds = Url::parse("https://pds.example.com").unwrap();
        let metadata = discover_auth_server(&http, &pds).await.unwrap();
        assert_eq!(metadata.issuer.as_str(), "https://auth.example.com/");
    }

    #[tokio::test]
    async fn falls_back_to_pds_as_auth_server() {
        let http = RoutedHttp::default();
        http.route(
            "/.well-known/oauth-authorization-server",
            200,
            auth_metadata_body("https://pds.example.com"),
        );
        let pds = Url::parse("https://pds.example.com").unwrap();
        let metadata = discover_auth_server(&http, &pds).await.unwrap();
        assert_eq!(metadata.issuer.as_str(), "https://pds.example.com/");
    }

    #[tokio::test]
    async fn missing_metadata_is_discovery_error() {
        let http = RoutedHttp::default();
        let pds = Url::parse("https://pds.example.com").unwrap();
        let err = discover_auth_server(&http, &pds).await.unwrap_err();
        assert!(matches!(err, OAuthError::AuthServerDiscovery { .. }));
    }

    #[tokio::test]
    async fn hostile_issuer_is_rejected() {
        let http = RoutedHttp::default();
        http.route(
            "/.well-known/oauth-authorization-server",
            200,
            auth_metadata_body("https://evil.example.com"),
        );
        let pds = Url::parse("https://pds.example.com").unwrap();
        let err = discover_auth_server(&http, &pds).await.unwrap_err();
        assert!(matches!(err, OAuthError::MetadataValidation { .. }));
    }
}

use serde::Deserialize;
use smol_str::SmolStr;
use url::Url;

/// Validated authorization-server metadata, the typed result of
/// [`crate::validate::validate_auth_server_metadata`].
///
/// Invariant: `issuer` shares its origin with the URL the document was
/// fetched from, and every endpoint is HTTPS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthServerMetadata {
    pub issuer: Url,
    pub authorization_endpoint: Url,
    pub token_endpoint: Url,
    pub pushed_authorization_request_endpoint: Option<Url>,
    pub revocation_endpoint: Option<Url>,
    pub dpop_signing_alg_values_supported: Option<Vec<SmolStr>>,
}

impl AuthServerMetadata {
    /// The PAR endpoint: advertised when present, else the profile's fixed
    /// path under the issuer.
    pub fn par_endpoint(&self) -> Url {
        self.pushed_authorization_request_endpoint
            .clone()
            .unwrap_or_else(|| {
                self.issuer
                    .join("/oauth/par")
                    .expect("issuer is a valid base")
            })
    }
}

// https://datatracker.ietf.org/doc/html/draft-ietf-oauth-resource-metadata-08#section-2
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
pub struct ProtectedResourceMetadata {
    #[serde(default)]
    pub resource: Option<SmolStr>,
    #[serde(default)]
    pub authorization_servers: Option<Vec<Url>>,
}

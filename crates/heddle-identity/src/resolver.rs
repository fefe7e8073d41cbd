//! Resolution errors, capability trait, and options.

use heddle_common::types::{AtStrError, Did, Handle};
use http::StatusCode;
use miette::Diagnostic;
use thiserror::Error;
use url::Url;

/// Errors that can occur during identity resolution.
#[derive(Debug, Error, Diagnostic)]
pub enum IdentityError {
    #[error("unsupported DID method: {0}")]
    #[diagnostic(
        code(heddle_identity::unsupported_did_method),
        help("supported DID methods: did:web, did:plc")
    )]
    UnsupportedDidMethod(String),
    #[error("invalid well-known atproto-did content")]
    #[diagnostic(
        code(heddle_identity::invalid_well_known),
        help("expected first non-empty line to be a DID")
    )]
    InvalidWellKnown,
    #[error("no resolver produced a DID and PDS for {handle}")]
    #[diagnostic(
        code(heddle_identity::handle_not_resolved),
        help("check the handle is registered and the resolver services are reachable")
    )]
    HandleNotResolved { handle: Handle },
    #[error("missing PDS endpoint in DID document")]
    #[diagnostic(code(heddle_identity::missing_pds_endpoint))]
    MissingPdsEndpoint,
    #[error("HTTP error: {0}")]
    #[diagnostic(
        code(heddle_identity::http),
        help("check network connectivity and TLS configuration")
    )]
    Http(#[from] reqwest::Error),
    #[error("HTTP status {0}")]
    #[diagnostic(
        code(heddle_identity::http_status),
        help("verify well-known paths and directory configuration")
    )]
    HttpStatus(StatusCode),
    #[error("URL parse error: {0}")]
    #[diagnostic(code(heddle_identity::url))]
    Url(#[from] url::ParseError),
    #[error("serialize/deserialize error: {0}")]
    #[diagnostic(code(heddle_identity::serde))]
    Serde(#[from] serde_json::Error),
    #[error("invalid identifier: {0}")]
    #[diagnostic(code(heddle_identity::identifier))]
    Identifier(#[from] AtStrError),
    #[error("invalid DID document: {0}")]
    #[diagnostic(
        code(heddle_identity::invalid_doc),
        help("validate services; ensure an AtprotoPersonalDataServer entry exists")
    )]
    InvalidDoc(String),
}

pub type Result<T> = std::result::Result<T, IdentityError>;

/// A resolved identity: the DID, its PDS, and the handle when known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub did: Did,
    /// Handle recovered from the resolution path, when one was available.
    pub handle: Option<Handle>,
    /// HTTPS origin of the user's PDS, no trailing slash.
    pub pds_url: Url,
}

/// Configurable resolver options.
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// Base URL of the Slingshot resolver service.
    pub slingshot_base: Url,
    /// Base URL of the PLC directory for `did:plc` documents.
    pub plc_directory_base: Url,
    /// Base URL of the public unauthenticated XRPC API.
    pub public_api_base: Url,
    /// Probe `https://<handle>/.well-known/atproto-did` as a last resort.
    pub well_known_fallback: bool,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            slingshot_base: Url::parse("https://slingshot.microcosm.blue").expect("valid url"),
            plc_directory_base: Url::parse("https://plc.directory/").expect("valid url"),
            public_api_base: Url::parse("https://public.api.bsky.app").expect("valid url"),
            well_known_fallback: true,
        }
    }
}

/// Capability trait for identity resolution, for pluggable implementations.
///
/// The provided [`crate::SlingshotResolver`] implements the default fallback
/// chain; hosts with their own infrastructure can substitute anything that
/// satisfies this contract.
#[async_trait::async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Resolve a handle to its DID and PDS.
    async fn resolve_handle(&self, handle: &Handle) -> Result<ResolvedIdentity>;

    /// Resolve a DID to its PDS (and handle alias, when the document carries
    /// one).
    async fn resolve_did(&self, did: &Did) -> Result<ResolvedIdentity>;
}

#[async_trait::async_trait]
impl<T: IdentityResolver + ?Sized> IdentityResolver for std::sync::Arc<T> {
    async fn resolve_handle(&self, handle: &Handle) -> Result<ResolvedIdentity> {
        self.as_ref().resolve_handle(handle).await
    }

    async fn resolve_did(&self, did: &Did) -> Result<ResolvedIdentity> {
        self.as_ref().resolve_did(did).await
    }
}

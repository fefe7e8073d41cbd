//! Identity resolution for the AT Protocol
//!
//! Handle-to-DID and DID-to-PDS resolution with a fixed fallback chain
//! against public infrastructure.
//!
//! ## Quick start
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use heddle_identity::{SlingshotResolver, resolver::IdentityResolver};
//! use heddle_common::types::Handle;
//!
//! let resolver = SlingshotResolver::default();
//! let identity = resolver.resolve_handle(&Handle::new("alice.bsky.social")?).await?;
//! println!("{} lives at {}", identity.did, identity.pds_url);
//! # Ok(())
//! # }
//! ```
//!
//! ## Resolution fallback order
//!
//! **Handle → (DID, PDS)**:
//! 1. Slingshot mini-doc (`com.bad-example.identity.resolveMiniDoc`) — DID,
//!    handle, and PDS in a single round trip
//! 2. Slingshot `com.atproto.identity.resolveHandle` → DID → document lookup
//! 3. Public API (`https://public.api.bsky.app`) `resolveHandle` → DID →
//!    document lookup
//! 4. HTTPS well-known at `https://{handle}/.well-known/atproto-did` (dotted
//!    handles only) → DID → document lookup
//!
//! **DID → Document**: PLC directory for `did:plc`, well-known `did.json`
//! for `did:web`.

pub mod did_doc;
pub mod resolver;

use crate::did_doc::DidDocument;
use crate::resolver::{IdentityError, IdentityResolver, ResolvedIdentity, ResolverOptions};
use bytes::Bytes;
use heddle_common::types::{Did, Handle};
use http::StatusCode;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use url::{ParseError, Url};

/// Default resolver implementation backed by Slingshot, the PLC directory,
/// and the public API.
#[derive(Clone)]
pub struct SlingshotResolver {
    http: reqwest::Client,
    opts: ResolverOptions,
}

impl Default for SlingshotResolver {
    fn default() -> Self {
        Self::new(reqwest::Client::new(), ResolverOptions::default())
    }
}

/// Slingshot mini-doc data (subset of DID doc info)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MiniDoc {
    pub did: Did,
    pub handle: Handle,
    pub pds: String,
}

#[derive(Serialize)]
struct ResolveHandleParams<'a> {
    handle: &'a str,
}

#[derive(Deserialize)]
struct ResolveHandleOutput {
    did: Did,
}

impl SlingshotResolver {
    pub fn new(http: reqwest::Client, opts: ResolverOptions) -> Self {
        tracing::debug!(
            slingshot = %opts.slingshot_base,
            plc = %opts.plc_directory_base,
            well_known_fallback = opts.well_known_fallback,
            "slingshot resolver created"
        );
        Self { http, opts }
    }

    /// Override the Slingshot base URL.
    pub fn with_slingshot_base(mut self, base: Url) -> Self {
        self.opts.slingshot_base = base;
        self
    }

    fn xrpc_url<P: Serialize>(base: &Url, nsid: &str, params: &P) -> Result<Url, IdentityError> {
        let mut url = base.clone();
        url.set_path(&format!("/xrpc/{nsid}"));
        if let Ok(qs) = serde_html_form::to_string(params) {
            url.set_query(Some(&qs));
        }
        Ok(url)
    }

    /// Construct the well-known HTTPS URL for a `did:web` DID.
    ///
    /// - `did:web:example.com` → `https://example.com/.well-known/did.json`
    /// - `did:web:example.com:user:alice` → `https://example.com/user/alice/did.json`
    fn did_web_url(did: &Did) -> Result<Url, IdentityError> {
        let s = did.as_str();
        let rest = s
            .strip_prefix("did:web:")
            .ok_or_else(|| IdentityError::UnsupportedDidMethod(s.to_owned()))?;
        let mut parts = rest.split(':');
        let host = parts
            .next()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| IdentityError::UnsupportedDidMethod(s.to_owned()))?;
        let mut url = Url::parse(&format!("https://{host}/"))?;
        let path: Vec<&str> = parts.collect();
        if path.is_empty() {
            url.set_path(".well-known/did.json");
        } else {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| IdentityError::Url(ParseError::SetHostOnCannotBeABaseUrl))?;
            for seg in path {
                let decoded = percent_decode_str(seg).decode_utf8_lossy();
                segments.push(&decoded);
            }
            segments.push("did.json");
        }
        Ok(url)
    }

    async fn get_json_bytes(&self, url: Url) -> Result<(Bytes, StatusCode), IdentityError> {
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        let buf = resp.bytes().await?;
        Ok((buf, status))
    }

    async fn get_text(&self, url: Url) -> Result<String, IdentityError> {
        let resp = self.http.get(url).send().await?;
        if resp.status() == StatusCode::OK {
            Ok(resp.text().await?)
        } else {
            Err(IdentityError::HttpStatus(resp.status()))
        }
    }

    fn parse_atproto_did_body(body: &str) -> Result<Did, IdentityError> {
        let line = body
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or(IdentityError::InvalidWellKnown)?;
        Did::new(line.trim()).map_err(|_| IdentityError::InvalidWellKnown)
    }

    /// One-round-trip resolution via the Slingshot mini-doc endpoint.
    async fn resolve_mini_doc(&self, handle: &Handle) -> Result<ResolvedIdentity, IdentityError> {
        #[derive(Serialize)]
        struct Params<'a> {
            identifier: &'a str,
        }
        let url = Self::xrpc_url(
            &self.opts.slingshot_base,
            "com.bad-example.identity.resolveMiniDoc",
            &Params {
                identifier: handle.as_str(),
            },
        )?;
        let (buf, status) = self.get_json_bytes(url).await?;
        if !status.is_success() {
            return Err(IdentityError::HttpStatus(status));
        }
        let mini: MiniDoc = serde_json::from_slice(&buf)?;
        Ok(ResolvedIdentity {
            did: mini.did,
            handle: Some(mini.handle),
            pds_url: Url::parse(mini.pds.trim_end_matches('/'))?,
        })
    }

    /// `com.atproto.identity.resolveHandle` against an arbitrary XRPC base.
    async fn resolve_handle_xrpc(&self, base: &Url, handle: &Handle) -> Result<Did, IdentityError> {
        let url = Self::xrpc_url(
            base,
            "com.atproto.identity.resolveHandle",
            &ResolveHandleParams {
                handle: handle.as_str(),
            },
        )?;
        let (buf, status) = self.get_json_bytes(url).await?;
        if !status.is_success() {
            return Err(IdentityError::HttpStatus(status));
        }
        let out: ResolveHandleOutput = serde_json::from_slice(&buf)?;
        Ok(out.did)
    }

    async fn resolve_well_known(&self, handle: &Handle) -> Result<Did, IdentityError> {
        let url = Url::parse(&format!("https://{handle}/.well-known/atproto-did"))?;
        let body = self.get_text(url).await?;
        Self::parse_atproto_did_body(&body)
    }

    async fn fetch_did_doc(&self, did: &Did) -> Result<DidDocument, IdentityError> {
        let url = match did.method() {
            "plc" => Url::parse(&format!("{}{}", self.opts.plc_directory_base, did.as_str()))?,
            "web" => Self::did_web_url(did)?,
            _ => return Err(IdentityError::UnsupportedDidMethod(did.as_str().to_owned())),
        };
        let (buf, status) = self.get_json_bytes(url).await?;
        if !status.is_success() {
            return Err(IdentityError::HttpStatus(status));
        }
        Ok(serde_json::from_slice(&buf)?)
    }
}

#[async_trait::async_trait]
impl IdentityResolver for SlingshotResolver {
    #[tracing::instrument(level = "debug", skip(self), fields(handle = %handle))]
    async fn resolve_handle(&self, handle: &Handle) -> Result<ResolvedIdentity, IdentityError> {
        match self.resolve_mini_doc(handle).await {
            Ok(identity) => return Ok(identity),
            Err(e) => tracing::debug!(error = %e, "mini-doc resolution failed"),
        }

        match self
            .resolve_handle_xrpc(&self.opts.slingshot_base, handle)
            .await
        {
            Ok(did) => match self.resolve_did(&did).await {
                Ok(identity) => return Ok(identity),
                Err(e) => tracing::debug!(error = %e, "slingshot resolveHandle chain failed"),
            },
            Err(e) => tracing::debug!(error = %e, "slingshot resolveHandle failed"),
        }

        match self
            .resolve_handle_xrpc(&self.opts.public_api_base, handle)
            .await
        {
            Ok(did) => match self.resolve_did(&did).await {
                Ok(identity) => return Ok(identity),
                Err(e) => tracing::debug!(error = %e, "public resolveHandle chain failed"),
            },
            Err(e) => tracing::debug!(error = %e, "public resolveHandle failed"),
        }

        if self.opts.well_known_fallback && handle.is_dotted() {
            match self.resolve_well_known(handle).await {
                Ok(did) => {
                    if let Ok(identity) = self.resolve_did(&did).await {
                        return Ok(identity);
                    }
                }
                Err(e) => tracing::debug!(error = %e, "well-known resolution failed"),
            }
        }

        Err(IdentityError::HandleNotResolved {
            handle: handle.clone(),
        })
    }

    #[tracing::instrument(level = "debug", skip(self), fields(did = %did))]
    async fn resolve_did(&self, did: &Did) -> Result<ResolvedIdentity, IdentityError> {
        let doc = self.fetch_did_doc(did).await?;
        let pds = doc.pds_endpoint()?;
        Ok(ResolvedIdentity {
            did: did.clone(),
            handle: doc.handle_alias(),
            pds_url: Url::parse(&pds)?,
        })
    }
}

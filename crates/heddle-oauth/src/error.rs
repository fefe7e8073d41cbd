//! The error taxonomy for the OAuth engine.
//!
//! Restore and refresh inspect these kinds to decide whether a failure means
//! "re-authenticate" (`RefreshTokenExpired`/`RefreshTokenRevoked`), "retry
//! later" (`Network`), "recover from storage" (a replayed refresh token), or
//! "give up" (everything validation-shaped).

use heddle_common::storage::StorageError;
use heddle_common::types::{AtStrError, Did, Handle};
use miette::Diagnostic;
use smol_str::SmolStr;

use crate::dpop;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum OAuthError {
    /// Input failed handle syntax validation.
    #[error("invalid handle: {0}")]
    #[diagnostic(code(heddle_oauth::invalid_handle))]
    InvalidHandle(#[from] AtStrError),

    /// No resolver in the chain produced a DID and PDS.
    #[error("handle resolution failed for {handle}")]
    #[diagnostic(
        code(heddle_oauth::handle_resolution),
        help("check the handle is registered and resolver services are reachable")
    )]
    HandleResolution {
        handle: Handle,
        #[source]
        source: Option<BoxError>,
    },

    /// DID document or PDS lookup failed.
    #[error("PDS discovery failed: {message}")]
    #[diagnostic(code(heddle_oauth::pds_discovery))]
    PdsDiscovery {
        message: SmolStr,
        #[source]
        source: Option<BoxError>,
    },

    /// Authorization-server metadata could not be fetched or parsed.
    #[error("authorization server discovery failed: {message}")]
    #[diagnostic(
        code(heddle_oauth::auth_server_discovery),
        help("verify the server publishes /.well-known/oauth-authorization-server")
    )]
    AuthServerDiscovery {
        message: SmolStr,
        #[source]
        source: Option<BoxError>,
    },

    /// Metadata present but malformed or violating the AT Protocol profile.
    #[error("metadata validation failed: {message}")]
    #[diagnostic(code(heddle_oauth::metadata_validation))]
    MetadataValidation { message: SmolStr },

    /// Token endpoint returned a structured OAuth error.
    #[error("token exchange failed{}", fmt_oauth_error(code.as_deref(), description.as_deref()))]
    #[diagnostic(code(heddle_oauth::token_exchange))]
    TokenExchange {
        code: Option<SmolStr>,
        description: Option<SmolStr>,
    },

    /// Refresh token no longer usable; the user must re-authenticate.
    #[error("refresh token expired{}", fmt_oauth_error(Some("invalid_grant"), description.as_deref()))]
    #[diagnostic(
        code(heddle_oauth::refresh_token_expired),
        help("start a new authorization flow")
    )]
    RefreshTokenExpired { description: Option<SmolStr> },

    /// Refresh token revoked by the server; the user must re-authenticate.
    #[error("refresh token revoked{}", fmt_oauth_error(Some("invalid_grant"), description.as_deref()))]
    #[diagnostic(
        code(heddle_oauth::refresh_token_revoked),
        help("start a new authorization flow")
    )]
    RefreshTokenRevoked { description: Option<SmolStr> },

    /// Token response malformed.
    #[error("token validation failed: {message}")]
    #[diagnostic(code(heddle_oauth::token_validation))]
    TokenValidation { message: SmolStr },

    /// The authorization server's issuer does not match the one resolved for
    /// the authenticated identity. After callback the resolved handle and DID
    /// are attached so callers can redirect to the correct server.
    #[error("issuer mismatch: expected {expected}, got {actual}")]
    #[diagnostic(
        code(heddle_oauth::issuer_mismatch),
        help("the identity is hosted by a different authorization server")
    )]
    IssuerMismatch {
        expected: SmolStr,
        actual: SmolStr,
        handle: Option<Handle>,
        did: Option<Did>,
    },

    /// Callback state unknown or expired.
    #[error("unknown or expired authorization state")]
    #[diagnostic(
        code(heddle_oauth::invalid_state),
        help("authorization requests expire after ten minutes; restart the flow")
    )]
    InvalidState,

    /// The callback carried an OAuth `error` parameter.
    #[error("authorization failed: {error}{}", description.as_deref().map(|d| format!(" ({d})")).unwrap_or_default())]
    #[diagnostic(code(heddle_oauth::authorization))]
    Authorization {
        error: SmolStr,
        description: Option<SmolStr>,
    },

    /// DPoP key or proof construction failure.
    #[error(transparent)]
    #[diagnostic(code(heddle_oauth::dpop))]
    Dpop(dpop::DpopError),

    /// Unexpected session-layer failure.
    #[error("session error: {message}")]
    #[diagnostic(code(heddle_oauth::session))]
    Session {
        message: SmolStr,
        #[source]
        source: Option<BoxError>,
    },

    /// No stored session under the requested id.
    #[error("session not found: {session_id}")]
    #[diagnostic(code(heddle_oauth::session_not_found))]
    SessionNotFound { session_id: SmolStr },

    /// Transient reachability failure; the caller may retry.
    #[error("network error: {message}")]
    #[diagnostic(code(heddle_oauth::network))]
    Network {
        message: SmolStr,
        #[source]
        source: Option<BoxError>,
    },

    /// Storage backend failure.
    #[error(transparent)]
    #[diagnostic(code(heddle_oauth::storage))]
    Storage(#[from] StorageError),

    /// Protocol-shape violation (JARM response, missing code, non-OK PAR).
    #[error("{message}")]
    #[diagnostic(code(heddle_oauth::protocol))]
    Protocol { message: SmolStr },
}

fn fmt_oauth_error(code: Option<&str>, description: Option<&str>) -> String {
    match (code, description) {
        (Some(c), Some(d)) => format!(": {c} ({d})"),
        (Some(c), None) => format!(": {c}"),
        (None, Some(d)) => format!(": {d}"),
        (None, None) => String::new(),
    }
}

impl OAuthError {
    pub fn metadata_validation(message: impl Into<SmolStr>) -> Self {
        Self::MetadataValidation {
            message: message.into(),
        }
    }

    pub fn token_validation(message: impl Into<SmolStr>) -> Self {
        Self::TokenValidation {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<SmolStr>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn session(message: impl Into<SmolStr>, source: Option<BoxError>) -> Self {
        Self::Session {
            message: message.into(),
            source,
        }
    }

    pub fn network(
        message: impl Into<SmolStr>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn pds_discovery(
        message: impl Into<SmolStr>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::PdsDiscovery {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn auth_server_discovery(message: impl Into<SmolStr>, source: Option<BoxError>) -> Self {
        Self::AuthServerDiscovery {
            message: message.into(),
            source,
        }
    }

    /// Transient reachability failure, by kind or by message shape.
    pub fn is_network(&self) -> bool {
        if matches!(self, Self::Network { .. }) {
            return true;
        }
        let message = self.to_string().to_lowercase();
        ["network", "timeout", "connection", "fetch"]
            .iter()
            .any(|needle| message.contains(needle))
    }

    /// `invalid_grant` family: the refresh token will never work again.
    pub fn is_invalid_grant(&self) -> bool {
        match self {
            Self::RefreshTokenExpired { .. } | Self::RefreshTokenRevoked { .. } => true,
            Self::TokenExchange { code, .. } => code.as_deref() == Some("invalid_grant"),
            _ => false,
        }
    }

    /// A concurrent refresher already spent this refresh token; the winner's
    /// session is in storage.
    pub fn is_replay(&self) -> bool {
        let description = match self {
            Self::TokenExchange { description, .. }
            | Self::RefreshTokenExpired { description }
            | Self::RefreshTokenRevoked { description } => description.as_deref(),
            _ => None,
        };
        description.is_some_and(|d| d.contains("replayed"))
    }
}

impl From<dpop::DpopError> for OAuthError {
    fn from(e: dpop::DpopError) -> Self {
        match e {
            dpop::DpopError::Transport(source) => Self::Network {
                message: "transport failure during DPoP request".into(),
                source: Some(source),
            },
            other => Self::Dpop(other),
        }
    }
}

pub type Result<T> = core::result::Result<T, OAuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_classification() {
        let err = OAuthError::Network {
            message: "dns failure".into(),
            source: None,
        };
        assert!(err.is_network());

        let err = OAuthError::session("connection reset by peer", None);
        assert!(err.is_network());

        let err = OAuthError::protocol("request timeout exceeded");
        assert!(err.is_network());

        let err = OAuthError::InvalidState;
        assert!(!err.is_network());
    }

    #[test]
    fn invalid_grant_classification() {
        assert!(
            OAuthError::RefreshTokenExpired { description: None }.is_invalid_grant()
        );
        assert!(
            OAuthError::TokenExchange {
                code: Some("invalid_grant".into()),
                description: None
            }
            .is_invalid_grant()
        );
        assert!(
            !OAuthError::TokenExchange {
                code: Some("invalid_request".into()),
                description: None
            }
            .is_invalid_grant()
        );
    }

    #[test]
    fn replay_classification() {
        let err = OAuthError::RefreshTokenExpired {
            description: Some("refresh token replayed".into()),
        };
        assert!(err.is_replay());
        assert!(!OAuthError::RefreshTokenExpired { description: None }.is_replay());
    }
}

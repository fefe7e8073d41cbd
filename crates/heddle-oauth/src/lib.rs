//! # Heddle OAuth for the AT Protocol
//!
//! Implements the AT Protocol OAuth profile: handle-based login with PKCE
//! and PAR, DPoP-bound tokens (RFC 9449), issuer verification, and
//! concurrency-safe session restore/refresh.
//!
//! ## Authentication flow
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use heddle_common::storage::MemoryStore;
//! use heddle_oauth::client::{OAuthClient, OAuthClientConfig};
//! use heddle_oauth::types::{AuthorizeOptions, CallbackParams};
//!
//! let config = OAuthClientConfig::new(
//!     "https://app.example.com/client-metadata.json",
//!     "https://app.example.com/callback",
//! );
//! let oauth = OAuthClient::new(config, MemoryStore::new())?;
//!
//! // Send the user off to authorize…
//! let url = oauth.authorize("alice.bsky.social", AuthorizeOptions::default()).await?;
//!
//! // …and complete the login when they come back.
//! let params = CallbackParams::from_query("code=…&state=…&iss=…")?;
//! let outcome = oauth.callback(params).await?;
//! oauth.store("my-session", &outcome.session).await?;
//!
//! // Later: restore refreshes expired tokens under a per-identity lock.
//! let session = oauth.restore("my-session").await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## AT Protocol specifics
//!
//! - DPoP is mandatory on every token request; nonce challenges are retried
//!   once with the server-provided nonce.
//! - PAR (RFC 9126) carries the authorization parameters.
//! - After the code exchange, the issuer is re-derived from the account's
//!   PDS and must match the server that minted the tokens.
//! - Server metadata discovery at `/.well-known/oauth-authorization-server`.

pub mod authstore;
pub mod client;
pub mod dpop;
pub mod error;
pub mod jose;
pub mod locks;
pub mod request;
pub mod resolver;
pub mod session;
pub mod types;
pub mod utils;
pub mod validate;

pub use client::{CallbackOutcome, OAuthClient, OAuthClientConfig};
pub use error::OAuthError;
pub use session::{Session, SessionData};

/// The only JWT signing algorithm this engine supports.
pub const DPOP_ALG: &str = "ES256";

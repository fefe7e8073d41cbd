//! The OAuth client: authorize → callback → store/restore/refresh → sign-out.

use smol_str::SmolStr;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::authstore::{AuthStore, PkceState};
use crate::dpop::NonceCache;
use crate::error::{OAuthError, Result};
use crate::locks::{KeyedLocks, LockGuard, RequestLock};
use crate::request::{exchange_code, push_authorization_request, refresh_grant, revoke};
use crate::resolver::{discover_auth_server, fetch_auth_server_metadata, issuer_equivalent};
use crate::session::{BoxFuture, RefreshHook, Session, SessionData, TokenUpdate, now_ms};
use crate::types::{
    AuthorizationResponseType, AuthorizeOptions, CallbackParams, CodeChallengeMethod,
    ParParameters, RefreshRequestParameters, TokenGrantType, TokenRequestParameters,
};
use crate::utils::{Pkce, export_keypair, generate_es256_key, generate_state, import_es256_secret};
use crate::validate::{require_https_url, validate_token_response};
use heddle_common::http_client::HttpClient;
use heddle_common::storage::Storage;
use heddle_common::types::Handle;
use heddle_identity::SlingshotResolver;
use heddle_identity::resolver::IdentityResolver;

/// Scope requested when the caller specifies none.
pub const DEFAULT_SCOPE: &str = "atproto transition:generic";
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait before assuming a concurrent refresher has persisted its
/// result.
const REPLAY_RECOVERY_DELAY: Duration = Duration::from_millis(200);

/// Called with the session's DID after a successful callback or refresh.
pub type SessionUpdatedHook = Arc<dyn Fn(&str, &SessionData) + Send + Sync>;
/// Called with the storage id after sign-out.
pub type SessionDeletedHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Client configuration. `client_id` and `redirect_uri` are required;
/// everything else has workable defaults.
pub struct OAuthClientConfig {
    /// URL of the hosted client-metadata document.
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    /// Override the default resolver's Slingshot base URL.
    pub slingshot_url: Option<Url>,
    pub refresh_timeout: Duration,
    /// Substitute handle/DID resolution (default: [`SlingshotResolver`]).
    pub identity_resolver: Option<Arc<dyn IdentityResolver>>,
    /// Distributed lock for per-DID refresh serialization (default: an
    /// in-process map).
    pub request_lock: Option<Arc<dyn RequestLock>>,
    pub on_session_updated: Option<SessionUpdatedHook>,
    pub on_session_deleted: Option<SessionDeletedHook>,
}

impl OAuthClientConfig {
    pub fn new(client_id: impl Into<String>, redirect_uri: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            redirect_uri: redirect_uri.into(),
            scope: DEFAULT_SCOPE.to_owned(),
            slingshot_url: None,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            identity_resolver: None,
            request_lock: None,
            on_session_updated: None,
            on_session_deleted: None,
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn with_slingshot_url(mut self, url: Url) -> Self {
        self.slingshot_url = Some(url);
        self
    }

    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn with_identity_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.identity_resolver = Some(resolver);
        self
    }

    pub fn with_request_lock(mut self, lock: Arc<dyn RequestLock>) -> Self {
        self.request_lock = Some(lock);
        self
    }

    pub fn on_session_updated(mut self, hook: SessionUpdatedHook) -> Self {
        self.on_session_updated = Some(hook);
        self
    }

    pub fn on_session_deleted(mut self, hook: SessionDeletedHook) -> Self {
        self.on_session_deleted = Some(hook);
        self
    }
}

impl fmt::Debug for OAuthClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthClientConfig")
            .field("client_id", &self.client_id)
            .field("redirect_uri", &self.redirect_uri)
            .field("scope", &self.scope)
            .field("refresh_timeout", &self.refresh_timeout)
            .finish_non_exhaustive()
    }
}

/// Result of a completed callback.
pub struct CallbackOutcome<T> {
    pub session: Session<T>,
    /// The consumed `state` value, for correlating with the host's own
    /// records.
    pub state: SmolStr,
}

impl<T> fmt::Debug for CallbackOutcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackOutcome")
            .field("session", &self.session)
            .field("state", &self.state)
            .finish()
    }
}

/// The authentication engine.
///
/// Generic over the HTTP transport and storage so tests and exotic hosts can
/// substitute both; [`OAuthClient::new`] wires the `reqwest` defaults.
pub struct OAuthClient<T, S> {
    inner: Arc<ClientInner<T, S>>,
}

impl<T, S> Clone for OAuthClient<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct ClientInner<T, S> {
    http: Arc<T>,
    store: AuthStore<S>,
    resolver: Arc<dyn IdentityResolver>,
    config: OAuthClientConfig,
    nonces: Arc<NonceCache>,
    restore_locks: KeyedLocks,
    refresh_locks: KeyedLocks,
}

impl<S> OAuthClient<reqwest::Client, S>
where
    S: Storage + 'static,
{
    /// Build a client over `reqwest` with the default resolver chain.
    pub fn new(config: OAuthClientConfig, storage: S) -> Result<Self> {
        Self::with_http(reqwest::Client::new(), config, storage)
    }
}

impl<T, S> OAuthClient<T, S>
where
    T: HttpClient + Send + Sync + 'static,
    S: Storage + 'static,
{
    /// Build a client over a custom HTTP transport.
    pub fn with_http(http: T, mut config: OAuthClientConfig, storage: S) -> Result<Self> {
        if config.client_id.trim().is_empty() {
            return Err(OAuthError::protocol("client_id is required"));
        }
        if config.redirect_uri.trim().is_empty() {
            return Err(OAuthError::protocol("redirect_uri is required"));
        }
        let resolver = config.identity_resolver.take().unwrap_or_else(|| {
            let mut resolver = SlingshotResolver::default();
            if let Some(base) = &config.slingshot_url {
                resolver = resolver.with_slingshot_base(base.clone());
            }
            Arc::new(resolver)
        });
        tracing::info!(
            client_id = %config.client_id,
            redirect_uri = %config.redirect_uri,
            scope = %config.scope,
            "oauth client created"
        );
        Ok(Self {
            inner: Arc::new(ClientInner {
                http: Arc::new(http),
                store: AuthStore::new(storage),
                resolver,
                config,
                nonces: NonceCache::global(),
                restore_locks: KeyedLocks::new(),
                refresh_locks: KeyedLocks::new(),
            }),
        })
    }

    /// Start an authorization flow. `input` is a handle, or an `https://`
    /// auth-server/PDS URL when the user knows the server but not the
    /// handle. Returns the URL to send the user to.
    pub async fn authorize(&self, input: &str, options: AuthorizeOptions) -> Result<Url> {
        self.inner.authorize(input, options).await
    }

    /// Complete an authorization flow from redirect query parameters.
    pub async fn callback(&self, params: CallbackParams) -> Result<CallbackOutcome<T>> {
        let (data, state) = self.inner.callback_data(params).await?;
        Ok(CallbackOutcome {
            session: self.make_session(data),
            state,
        })
    }

    /// Persist a session under the given id.
    pub async fn store(&self, session_id: &str, session: &Session<T>) -> Result<()> {
        let mut data = session.data().await;
        data.session_id = session_id.into();
        session.replace_data(data.clone()).await;
        self.inner.store.save_session(session_id, &data).await
    }

    /// Load a session, refreshing first if it is expired. Concurrent calls
    /// for the same id share one underlying restore.
    pub async fn restore(&self, session_id: &str) -> Result<Session<T>> {
        let data = self.inner.restore_data(session_id).await?;
        Ok(self.make_session(data))
    }

    /// Refresh a session's tokens now, persisting and updating in place.
    /// Concurrent calls for the same DID share one token request.
    pub async fn refresh(&self, session: &Session<T>) -> Result<SessionData> {
        let refreshed = self.inner.refresh_data(session.data().await).await?;
        session.replace_data(refreshed.clone()).await;
        Ok(refreshed)
    }

    /// Revoke (best effort) and forget a session.
    pub async fn sign_out(&self, session_id: &str, session: &Session<T>) -> Result<()> {
        self.inner.sign_out(session_id, session.data().await).await
    }

    fn make_session(&self, data: SessionData) -> Session<T> {
        let inner = self.inner.clone();
        let hook: RefreshHook = Arc::new(move |data: SessionData| {
            let inner = inner.clone();
            let fut: BoxFuture<Result<SessionData>> =
                Box::pin(async move { inner.refresh_data(data).await });
            fut
        });
        Session::new(
            self.inner.http.clone(),
            self.inner.nonces.clone(),
            data,
            Some(hook),
        )
    }
}

impl<T, S> ClientInner<T, S>
where
    T: HttpClient + Send + Sync + 'static,
    S: Storage + 'static,
{
    #[tracing::instrument(level = "info", skip(self, options))]
    async fn authorize(&self, input: &str, options: AuthorizeOptions) -> Result<Url> {
        let (identity, login_handle) = if input.starts_with("https://") {
            (None, None)
        } else {
            let handle = Handle::new(input)?;
            let identity = self
                .resolver
                .resolve_handle(&handle)
                .await
                .map_err(|e| OAuthError::HandleResolution {
                    handle: handle.clone(),
                    source: Some(Box::new(e)),
                })?;
            (Some(identity), Some(handle))
        };

        let metadata = match &identity {
            Some(identity) => {
                discover_auth_server(self.http.as_ref(), &identity.pds_url).await?
            }
            None => {
                let url = require_https_url(input, "authorization server")?;
                discover_auth_server(self.http.as_ref(), &url).await?
            }
        };

        let pkce = Pkce::generate();
        let state = options.state.unwrap_or_else(generate_state);
        let record = PkceState {
            code_verifier: pkce.verifier.clone(),
            auth_server: metadata.issuer.clone(),
            issuer: metadata.issuer.clone(),
            handle: login_handle.clone(),
            did: identity.as_ref().map(|i| i.did.clone()),
            pds_url: identity.as_ref().map(|i| i.pds_url.clone()),
        };
        self.store.save_pkce(&state, &record).await?;

        // login_hint only makes sense when the user typed an identity
        let login_hint = login_handle
            .as_ref()
            .map(|h| options.login_hint.unwrap_or_else(|| h.as_str().to_owned()));
        let scope = options.scope.as_deref().unwrap_or(&self.config.scope);
        let par_response = push_authorization_request(
            self.http.as_ref(),
            &metadata.par_endpoint(),
            ParParameters {
                response_type: AuthorizationResponseType::Code,
                client_id: &self.config.client_id,
                redirect_uri: &self.config.redirect_uri,
                scope,
                code_challenge: &pkce.challenge,
                code_challenge_method: CodeChallengeMethod::S256,
                state: &state,
                login_hint: login_hint.as_deref(),
                prompt: options.prompt,
            },
        )
        .await?;

        #[derive(serde::Serialize)]
        struct Parameters<'a> {
            client_id: &'a str,
            request_uri: &'a str,
        }
        let mut url = metadata.authorization_endpoint.clone();
        let query = serde_html_form::to_string(Parameters {
            client_id: &self.config.client_id,
            request_uri: &par_response.request_uri,
        })
        .map_err(|e| OAuthError::protocol(format!("failed to encode authorize URL: {e}")))?;
        url.set_query(Some(&query));
        tracing::debug!(authorize_url = %url, "authorization flow started");
        Ok(url)
    }

    #[tracing::instrument(level = "info", skip_all, fields(state = params.state.as_deref()))]
    async fn callback_data(&self, params: CallbackParams) -> Result<(SessionData, SmolStr)> {
        if params.response.is_some() {
            return Err(OAuthError::protocol(
                "JARM (JWT authorization response) is not supported",
            ));
        }
        if let Some(error) = params.error {
            return Err(OAuthError::Authorization {
                error,
                description: params.error_description,
            });
        }
        let Some(code) = params.code else {
            return Err(OAuthError::protocol("callback is missing the code parameter"));
        };
        let state = params.state.ok_or(OAuthError::InvalidState)?;
        let Some(record) = self.store.load_pkce(&state).await? else {
            return Err(OAuthError::InvalidState);
        };

        let result = self
            .finish_callback(&state, &code, record, params.iss)
            .await;
        // exactly one callback may consume a state: the record dies on
        // success and failure alike
        if let Err(e) = self.store.delete_pkce(&state).await {
            tracing::warn!(error = %e, "failed to delete authorization state");
        }
        result.map(|data| (data, state))
    }

    async fn finish_callback(
        &self,
        state: &str,
        code: &str,
        record: PkceState,
        iss: Option<SmolStr>,
    ) -> Result<SessionData> {
        // https://datatracker.ietf.org/doc/html/rfc9207
        if let Some(iss) = iss {
            if !issuer_equivalent(&iss, record.issuer.as_str()) {
                return Err(OAuthError::IssuerMismatch {
                    expected: SmolStr::new(record.issuer.as_str()),
                    actual: iss,
                    handle: record.handle,
                    did: record.did,
                });
            }
        }

        let metadata = fetch_auth_server_metadata(self.http.as_ref(), &record.auth_server).await?;

        // the keypair is born here and lives exactly as long as the session
        let secret = generate_es256_key();
        let (dpop_private_jwk, dpop_public_jwk) = export_keypair(&secret);
        let token_json = exchange_code(
            self.http.clone(),
            &secret,
            self.nonces.clone(),
            &metadata.token_endpoint,
            TokenRequestParameters {
                grant_type: TokenGrantType::AuthorizationCode,
                client_id: &self.config.client_id,
                redirect_uri: &self.config.redirect_uri,
                code,
                code_verifier: &record.code_verifier,
            },
        )
        .await?;
        let tokens = validate_token_response(&token_json)?;
        // the validated `sub` is the authoritative account identity
        let did = tokens.sub.clone();

        let (pds_url, handle) = match (&record.did, &record.pds_url, &record.handle) {
            (Some(_), Some(pds_url), Some(handle)) => (pds_url.clone(), handle.clone()),
            _ => {
                // auth-server URL flow: the token told us who logged in
                let identity = self.resolver.resolve_did(&did).await.map_err(|e| {
                    OAuthError::pds_discovery(format!("failed to resolve PDS for {did}"), e)
                })?;
                let handle = identity.handle.ok_or_else(|| OAuthError::PdsDiscovery {
                    message: format!("DID document for {did} has no handle alias").into(),
                    source: None,
                })?;
                (identity.pds_url, handle)
            }
        };

        // Re-derive the issuer from the account's PDS and require it to be
        // the server we actually talked to. Without this, a hostile server
        // could mint tokens for an identity it does not control. Discovery
        // failures that are not mismatches don't block: PKCE already ties
        // the code to this flow.
        match discover_auth_server(self.http.as_ref(), &pds_url).await {
            Ok(fresh) => {
                if !issuer_equivalent(fresh.issuer.as_str(), record.issuer.as_str()) {
                    return Err(OAuthError::IssuerMismatch {
                        expected: SmolStr::new(record.issuer.as_str()),
                        actual: SmolStr::new(fresh.issuer.as_str()),
                        handle: Some(handle),
                        did: Some(did),
                    });
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, %did, "could not re-verify issuer after token exchange");
            }
        }

        let data = SessionData {
            session_id: SmolStr::new(state),
            did,
            handle,
            pds_url,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            dpop_private_jwk,
            dpop_public_jwk,
            token_expires_at: now_ms() + tokens.expires_in as i64 * 1000,
        };
        self.emit_session_updated(&data);
        tracing::info!(did = %data.did, handle = %data.handle, "session established");
        Ok(data)
    }

    async fn restore_data(&self, session_id: &str) -> Result<SessionData> {
        // single-flight per session id; the guard drops on every exit path
        let _guard = self.restore_locks.acquire(session_id).await;

        let Some(mut data) = self.store.load_session(session_id).await? else {
            return Err(OAuthError::SessionNotFound {
                session_id: session_id.into(),
            });
        };
        data.session_id = session_id.into();
        if data.is_expired() {
            tracing::debug!(session_id, "restored session is expired, refreshing");
            data = self
                .refresh_data(data)
                .await
                .map_err(classify_restore_error)?;
        }
        Ok(data)
    }

    async fn refresh_data(&self, data: SessionData) -> Result<SessionData> {
        let key = format!("refresh:{}", data.did.as_str());
        let _guard: LockGuard = match &self.config.request_lock {
            Some(lock) => lock.acquire(&key).await,
            None => RequestLock::acquire(&self.refresh_locks, &key).await,
        };
        self.refresh_locked(data).await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(did = %data.did))]
    async fn refresh_locked(&self, mut data: SessionData) -> Result<SessionData> {
        // a concurrent refresher may have landed a fresh session in storage
        // while we waited on the lock
        if let Ok(Some(stored)) = self.store.load_session(&data.session_id).await {
            if !stored.is_expired() && stored.token_expires_at > data.token_expires_at {
                tracing::debug!("session already refreshed by a concurrent caller");
                return Ok(stored);
            }
        }

        let Some(refresh_token) = data.refresh_token.clone() else {
            return Err(OAuthError::RefreshTokenExpired {
                description: Some("no refresh token available".into()),
            });
        };

        let metadata = discover_auth_server(self.http.as_ref(), &data.pds_url).await?;
        let secret = import_es256_secret(&data.dpop_private_jwk)?;
        let result = refresh_grant(
            self.http.clone(),
            &secret,
            self.nonces.clone(),
            &metadata.token_endpoint,
            RefreshRequestParameters {
                grant_type: TokenGrantType::RefreshToken,
                client_id: &self.config.client_id,
                refresh_token: &refresh_token,
            },
            self.config.refresh_timeout,
        )
        .await
        .and_then(|value| validate_token_response(&value));

        match result {
            Ok(tokens) => {
                data.apply_tokens(TokenUpdate {
                    access_token: tokens.access_token,
                    refresh_token: tokens.refresh_token,
                    expires_in: tokens.expires_in,
                });
                self.store.save_session(&data.session_id, &data).await?;
                self.emit_session_updated(&data);
                Ok(data)
            }
            Err(err) => {
                let err = classify_refresh_error(err);
                if err.is_replay() {
                    // the other refresher won; its result is in storage
                    tracing::debug!(did = %data.did, "refresh token replayed, recovering from storage");
                    tokio::time::sleep(REPLAY_RECOVERY_DELAY).await;
                    if let Ok(Some(stored)) = self.store.load_session(&data.session_id).await {
                        if !stored.is_expired() {
                            return Ok(stored);
                        }
                    }
                } else if !err.is_network() {
                    // the grant is dead; make sure the server agrees
                    self.spawn_revocation(metadata.revocation_endpoint.clone(), refresh_token);
                }
                Err(err)
            }
        }
    }

    #[tracing::instrument(level = "info", skip(self, data))]
    async fn sign_out(&self, session_id: &str, data: SessionData) -> Result<()> {
        if let Some(refresh_token) = &data.refresh_token {
            match discover_auth_server(self.http.as_ref(), &data.pds_url).await {
                Ok(metadata) => {
                    if let Some(endpoint) = &metadata.revocation_endpoint {
                        if let Err(e) = revoke(
                            self.http.as_ref(),
                            endpoint,
                            refresh_token,
                            &self.config.client_id,
                        )
                        .await
                        {
                            tracing::debug!(error = %e, "sign-out revocation failed");
                        }
                    }
                }
                Err(e) => tracing::debug!(error = %e, "sign-out discovery failed"),
            }
        }
        let result = self.store.delete_session(session_id).await;
        if let Some(hook) = &self.config.on_session_deleted {
            hook(session_id);
        }
        result
    }

    fn emit_session_updated(&self, data: &SessionData) {
        if let Some(hook) = &self.config.on_session_updated {
            hook(data.did.as_str(), data);
        }
    }

    fn spawn_revocation(&self, endpoint: Option<Url>, token: String) {
        let Some(endpoint) = endpoint else {
            return;
        };
        let http = self.http.clone();
        let client_id = self.config.client_id.clone();
        // fire-and-forget: a revocation failure must not poison the caller
        tokio::spawn(async move {
            if let Err(e) = revoke(http.as_ref(), &endpoint, &token, &client_id).await {
                tracing::debug!(error = %e, "best-effort revocation failed");
            }
        });
    }
}

/// Restore surfaces Network and the TokenExchange family unchanged; anything
/// else was unexpected and becomes a session error.
fn classify_restore_error(err: OAuthError) -> OAuthError {
    match err {
        e @ (OAuthError::Network { .. }
        | OAuthError::TokenExchange { .. }
        | OAuthError::RefreshTokenExpired { .. }
        | OAuthError::RefreshTokenRevoked { .. }
        | OAuthError::SessionNotFound { .. }) => e,
        other => {
            let message = SmolStr::new(format!("session restore failed: {other}"));
            OAuthError::Session {
                message,
                source: Some(Box::new(other)),
            }
        }
    }
}

/// Refresh failures keep their taxonomy kind when it is meaningful and are
/// wrapped as TokenExchange otherwise.
fn classify_refresh_error(err: OAuthError) -> OAuthError {
    match err {
        e @ (OAuthError::Network { .. }
        | OAuthError::TokenExchange { .. }
        | OAuthError::RefreshTokenExpired { .. }
        | OAuthError::RefreshTokenRevoked { .. }
        | OAuthError::TokenValidation { .. }
        | OAuthError::Dpop(_)) => e,
        other => OAuthError::TokenExchange {
            code: None,
            description: Some(SmolStr::new(format!("token refresh failed: {other}"))),
        },
    }
}

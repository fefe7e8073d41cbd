//! Session state and the DPoP-authenticated request helper.

use chrono::Utc;
use http::HeaderMap;
use jose_jwk::Jwk;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;
use url::Url;

use crate::dpop::{DpopHttp, NonceCache};
use crate::error::{OAuthError, Result};
use crate::utils::import_es256_secret;
use heddle_common::http_client::HttpClient;
use heddle_common::types::{Did, Handle};

/// Refresh this long before the access token actually expires.
pub const EXPIRY_BUFFER_MS: i64 = 5 * 60 * 1000;

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// The persisted session record. Serde round-trips every field exactly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    /// Storage id for this session; defaults to the OAuth `state` at
    /// callback time and is rewritten by `store`/`restore`.
    pub session_id: SmolStr,
    pub did: Did,
    pub handle: Handle,
    pub pds_url: Url,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Private half of the session's DPoP keypair; only ever re-imported for
    /// signing.
    pub dpop_private_jwk: Jwk,
    pub dpop_public_jwk: Jwk,
    /// Absolute wall-clock expiry of the access token, unix milliseconds.
    pub token_expires_at: i64,
}

/// New token material from a successful exchange or refresh.
#[derive(Clone, Debug)]
pub struct TokenUpdate {
    pub access_token: String,
    /// Replaces the stored refresh token only when present.
    pub refresh_token: Option<String>,
    /// Lifetime in seconds, from the token response.
    pub expires_in: u64,
}

impl SessionData {
    /// Expired means "within the refresh buffer of expiry", not yet past it.
    pub fn is_expired(&self) -> bool {
        now_ms() + EXPIRY_BUFFER_MS >= self.token_expires_at
    }

    /// Milliseconds until the access token actually expires, floored at 0.
    pub fn time_until_expiry(&self) -> i64 {
        (self.token_expires_at - now_ms()).max(0)
    }

    pub fn apply_tokens(&mut self, update: TokenUpdate) {
        self.access_token = update.access_token;
        if update.refresh_token.is_some() {
            self.refresh_token = update.refresh_token;
        }
        self.token_expires_at = now_ms() + (update.expires_in as i64) * 1000;
    }
}

pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Callback into the owning client: refresh the given session's tokens,
/// persist the result, and return the updated record. Injected at session
/// creation to avoid a back-reference.
pub(crate) type RefreshHook =
    Arc<dyn Fn(SessionData) -> BoxFuture<Result<SessionData>> + Send + Sync>;

/// A live authenticated session: token state plus the DPoP request helper.
pub struct Session<T> {
    http: Arc<T>,
    nonces: Arc<NonceCache>,
    data: RwLock<SessionData>,
    refresh_hook: Option<RefreshHook>,
}

impl<T> fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl<T> Session<T>
where
    T: HttpClient + Send + Sync + 'static,
{
    pub(crate) fn new(
        http: Arc<T>,
        nonces: Arc<NonceCache>,
        data: SessionData,
        refresh_hook: Option<RefreshHook>,
    ) -> Self {
        Self {
            http,
            nonces,
            data: RwLock::new(data),
            refresh_hook,
        }
    }

    /// Snapshot of the current session record.
    pub async fn data(&self) -> SessionData {
        self.data.read().await.clone()
    }

    pub async fn did(&self) -> Did {
        self.data.read().await.did.clone()
    }

    pub async fn handle(&self) -> Handle {
        self.data.read().await.handle.clone()
    }

    pub async fn pds_url(&self) -> Url {
        self.data.read().await.pds_url.clone()
    }

    pub async fn access_token(&self) -> String {
        self.data.read().await.access_token.clone()
    }

    pub async fn refresh_token(&self) -> Option<String> {
        self.data.read().await.refresh_token.clone()
    }

    pub async fn is_expired(&self) -> bool {
        self.data.read().await.is_expired()
    }

    pub async fn time_until_expiry(&self) -> i64 {
        self.data.read().await.time_until_expiry()
    }

    /// Overwrite token state after a refresh.
    pub async fn update_tokens(&self, update: TokenUpdate) {
        self.data.write().await.apply_tokens(update);
    }

    pub(crate) async fn replace_data(&self, data: SessionData) {
        *self.data.write().await = data;
    }

    fn build_request(
        &self,
        method: &http::Method,
        url: &Url,
        body: Option<&[u8]>,
        headers: Option<&HeaderMap>,
        access_token: &str,
    ) -> Result<http::Request<Vec<u8>>> {
        let mut builder = http::Request::builder()
            .method(method.clone())
            .uri(url.as_str());
        if let Some(headers) = headers {
            for (name, value) in headers {
                builder = builder.header(name, value);
            }
        }
        builder = builder.header(
            http::header::AUTHORIZATION,
            format!("DPoP {access_token}"),
        );
        builder
            .body(body.map(<[u8]>::to_vec).unwrap_or_default())
            .map_err(|e| OAuthError::protocol(format!("failed to build request: {e}")))
    }

    /// Issue a DPoP-authenticated request against the PDS.
    ///
    /// Nonce challenges (401 + `DPoP-Nonce`) retry once inside the DPoP
    /// layer. A remaining 401 triggers the owning client's refresh hook and
    /// one final retry with the new access token. Other failures are
    /// returned as-is.
    #[tracing::instrument(level = "debug", skip_all, fields(method = %method, url = %url))]
    pub async fn make_request(
        &self,
        method: http::Method,
        url: Url,
        body: Option<&[u8]>,
        headers: Option<HeaderMap>,
    ) -> Result<http::Response<Vec<u8>>> {
        crate::validate::require_https_url(url.as_str(), "request URL")?;
        let data = self.data().await;
        let secret = import_es256_secret(&data.dpop_private_jwk)?;
        let dpop = DpopHttp::resource(self.http.clone(), secret, self.nonces.clone());

        let request =
            self.build_request(&method, &url, body, headers.as_ref(), &data.access_token)?;
        let response = dpop.send(request).await?;
        if response.status() != http::StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(hook) = &self.refresh_hook else {
            return Ok(response);
        };
        tracing::debug!(did = %data.did, "access token rejected, refreshing session");
        let refreshed = hook(data).await?;
        self.replace_data(refreshed.clone()).await;

        let secret = import_es256_secret(&refreshed.dpop_private_jwk)?;
        let dpop = DpopHttp::resource(self.http.clone(), secret, self.nonces.clone());
        let request =
            self.build_request(&method, &url, body, headers.as_ref(), &refreshed.access_token)?;
        Ok(dpop.send(request).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{export_keypair, generate_es256_key};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn test_session_data(expires_at: i64) -> SessionData {
        let (private, public) = export_keypair(&generate_es256_key());
        SessionData {
            session_id: "state-1".into(),
            did: Did::new("did:plc:alice123").unwrap(),
            handle: Handle::new("alice.example.net").unwrap(),
            pds_url: Url::parse("https://pds.example.com").unwrap(),
            access_token: "access-1".into(),
            refresh_token: Some("refresh-1".into()),
            dpop_private_jwk: private,
            dpop_public_jwk: public,
            token_expires_at: expires_at,
        }
    }

    #[test]
    fn expiry_boundaries() {
        // two minutes out: inside the five-minute buffer
        let data = test_session_data(now_ms() + 2 * 60 * 1000);
        assert!(data.is_expired());
        // ten minutes out: comfortably fresh
        let data = test_session_data(now_ms() + 10 * 60 * 1000);
        assert!(!data.is_expired());
    }

    #[test]
    fn time_until_expiry_floors_at_zero() {
        let data = test_session_data(now_ms() - 1000);
        assert_eq!(data.time_until_expiry(), 0);
        let data = test_session_data(now_ms() + 60_000);
        let remaining = data.time_until_expiry();
        assert!(remaining > 55_000 && remaining <= 60_000);
    }

    #[test]
    fn serde_round_trip_preserves_all_fields() {
        let data = test_session_data(1_900_000_000_000);
        let json = serde_json::to_string(&data).unwrap();
        let back: SessionData = serde_json::from_str(&json).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn apply_tokens_semantics() {
        let mut data = test_session_data(0);
        data.apply_tokens(TokenUpdate {
            access_token: "access-2".into(),
            refresh_token: None,
            expires_in: 3600,
        });
        assert_eq!(data.access_token, "access-2");
        // absent refresh token keeps the old one
        assert_eq!(data.refresh_token.as_deref(), Some("refresh-1"));
        assert!(data.token_expires_at > now_ms() + 3_500_000);

        data.apply_tokens(TokenUpdate {
            access_token: "access-3".into(),
            refresh_token: Some("refresh-2".into()),
            expires_in: 3600,
        });
        assert_eq!(data.refresh_token.as_deref(), Some("refresh-2"));
    }

    #[derive(Default)]
    struct MockHttp {
        responses: Mutex<VecDeque<http::Response<Vec<u8>>>>,
        seen_tokens: Mutex<Vec<String>>,
    }

    impl MockHttp {
        fn push(&self, status: u16) {
            self.responses.lock().unwrap().push_back(
                http::Response::builder()
                    .status(status)
                    .body(Vec::new())
                    .unwrap(),
            );
        }
    }

    impl HttpClient for MockHttp {
        type Error = std::convert::Infallible;
        async fn send_http(
            &self,
            request: http::Request<Vec<u8>>,
        ) -> core::result::Result<http::Response<Vec<u8>>, Self::Error> {
            let token = request
                .headers()
                .get(http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("DPoP "))
                .unwrap_or_default()
                .to_owned();
            self.seen_tokens.lock().unwrap().push(token);
            Ok(self.responses.lock().unwrap().pop_front().unwrap())
        }
    }

    #[tokio::test]
    async fn make_request_refreshes_on_401() {
        let http = Arc::new(MockHttp::default());
        http.push(401);
        http.push(200);

        let hook_calls = Arc::new(AtomicUsize::new(0));
        let hook: RefreshHook = {
            let hook_calls = hook_calls.clone();
            Arc::new(move |mut data: SessionData| {
                let hook_calls = hook_calls.clone();
                let fut: BoxFuture<Result<SessionData>> = Box::pin(async move {
                    hook_calls.fetch_add(1, Ordering::SeqCst);
                    data.access_token = "access-2".into();
                    Ok(data)
                });
                fut
            })
        };

        let session = Session::new(
            http.clone(),
            Arc::new(NonceCache::default()),
            test_session_data(now_ms() + 3600 * 1000),
            Some(hook),
        );
        let response = session
            .make_request(
                http::Method::GET,
                Url::parse("https://pds.example.com/xrpc/app.bsky.actor.getProfile").unwrap(),
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *http.seen_tokens.lock().unwrap(),
            vec!["access-1".to_owned(), "access-2".to_owned()]
        );
    }

    #[tokio::test]
    async fn make_request_does_not_retry_other_errors() {
        let http = Arc::new(MockHttp::default());
        http.push(500);
        let session = Session::new(
            http.clone(),
            Arc::new(NonceCache::default()),
            test_session_data(now_ms() + 3600 * 1000),
            None,
        );
        let response = session
            .make_request(
                http::Method::GET,
                Url::parse("https://pds.example.com/xrpc/test").unwrap(),
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 500);
        assert_eq!(http.seen_tokens.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn make_request_rejects_http_urls() {
        let http = Arc::new(MockHttp::default());
        let session = Session::new(
            http,
            Arc::new(NonceCache::default()),
            test_session_data(now_ms() + 3600 * 1000),
            None,
        );
        let err = session
            .make_request(
                http::Method::GET,
                Url::parse("http://pds.example.com/xrpc/test").unwrap(),
                None,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::MetadataValidation { .. }));
    }
}

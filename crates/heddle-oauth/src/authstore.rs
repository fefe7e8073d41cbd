//! Typed persistence layer over the generic [`Storage`] capability.
//!
//! Two key families: `pkce:<state>` for in-flight authorization requests
//! (TTL-bound) and `session:<id>` for sessions (no TTL imposed here).

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::error::Result;
use crate::session::SessionData;
use heddle_common::storage::Storage;
use heddle_common::types::{Did, Handle};

/// Authorization requests are single-use and short-lived.
pub const PKCE_TTL: Duration = Duration::from_secs(600);

/// State persisted between `authorize` and `callback`, keyed by the OAuth
/// `state` value. Exactly one callback may consume a record.
///
/// `did`/`handle`/`pds_url` are `None` when the flow started from an
/// auth-server URL instead of a handle; the token's `sub` fills them in at
/// callback time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PkceState {
    pub code_verifier: String,
    /// Base URL the server metadata was discovered from.
    pub auth_server: Url,
    /// Validated issuer, checked again at callback (RFC 9207) and after the
    /// token exchange.
    pub issuer: Url,
    pub handle: Option<Handle>,
    pub did: Option<Did>,
    pub pds_url: Option<Url>,
}

fn pkce_key(state: &str) -> String {
    format!("pkce:{state}")
}

fn session_key(session_id: &str) -> String {
    format!("session:{session_id}")
}

/// Storage facade used by the client.
pub(crate) struct AuthStore<S> {
    storage: S,
}

impl<S: Storage> AuthStore<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub async fn save_pkce(&self, state: &str, record: &PkceState) -> Result<()> {
        let value = serde_json::to_string(record)
            .map_err(|e| heddle_common::storage::StorageError::from(e))?;
        self.storage
            .set(&pkce_key(state), value, Some(PKCE_TTL))
            .await?;
        Ok(())
    }

    pub async fn load_pkce(&self, state: &str) -> Result<Option<PkceState>> {
        let Some(raw) = self.storage.get(&pkce_key(state)).await? else {
            return Ok(None);
        };
        // a corrupt record is as good as absent; the flow restarts either way
        Ok(serde_json::from_str(&raw).ok())
    }

    pub async fn delete_pkce(&self, state: &str) -> Result<()> {
        self.storage.del(&pkce_key(state)).await?;
        Ok(())
    }

    pub async fn save_session(&self, session_id: &str, data: &SessionData) -> Result<()> {
        let value = serde_json::to_string(data)
            .map_err(|e| heddle_common::storage::StorageError::from(e))?;
        self.storage.set(&session_key(session_id), value, None).await?;
        Ok(())
    }

    pub async fn load_session(&self, session_id: &str) -> Result<Option<SessionData>> {
        let Some(raw) = self.storage.get(&session_key(session_id)).await? else {
            return Ok(None);
        };
        let data = serde_json::from_str(&raw)
            .map_err(|e| heddle_common::storage::StorageError::from(e))?;
        Ok(Some(data))
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.storage.del(&session_key(session_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heddle_common::storage::MemoryStore;

    fn record() -> PkceState {
        PkceState {
            code_verifier: "verifier".into(),
            auth_server: Url::parse("https://auth.example.com").unwrap(),
            issuer: Url::parse("https://auth.example.com").unwrap(),
            handle: Some(Handle::new("alice.example.net").unwrap()),
            did: Some(Did::new("did:plc:alice123").unwrap()),
            pds_url: Some(Url::parse("https://pds.example.com").unwrap()),
        }
    }

    #[tokio::test]
    async fn pkce_round_trip_and_delete() {
        let store = AuthStore::new(MemoryStore::new());
        store.save_pkce("st", &record()).await.unwrap();
        assert_eq!(store.load_pkce("st").await.unwrap(), Some(record()));
        store.delete_pkce("st").await.unwrap();
        assert_eq!(store.load_pkce("st").await.unwrap(), None);
    }

    #[tokio::test]
    async fn url_flow_record_uses_none_not_sentinels() {
        let store = AuthStore::new(MemoryStore::new());
        let mut rec = record();
        rec.handle = None;
        rec.did = None;
        rec.pds_url = None;
        store.save_pkce("st", &rec).await.unwrap();
        let loaded = store.load_pkce("st").await.unwrap().unwrap();
        assert_eq!(loaded.did, None);
        assert_eq!(loaded.handle, None);
        assert_eq!(loaded.pds_url, None);
    }

    #[tokio::test]
    async fn corrupt_pkce_reads_as_absent() {
        let storage = MemoryStore::new();
        storage
            .set("pkce:st", "{not json".into(), None)
            .await
            .unwrap();
        let store = AuthStore::new(storage);
        assert_eq!(store.load_pkce("st").await.unwrap(), None);
    }
}

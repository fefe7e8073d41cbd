//! Minimal DID document model: just enough to find the PDS and handle alias.

use heddle_common::types::Handle;
use serde::Deserialize;

use crate::resolver::IdentityError;

/// Subset of a DID document relevant to PDS discovery.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidDocument {
    pub id: String,
    #[serde(default)]
    pub also_known_as: Vec<String>,
    #[serde(default)]
    pub service: Vec<Service>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    #[serde(rename = "type")]
    pub service_type: String,
    /// Kept loose here; atproto documents carry a plain string but richer
    /// shapes exist in the wild, so narrowing happens at extraction.
    pub service_endpoint: serde_json::Value,
}

impl DidDocument {
    /// Locate the PDS endpoint: a service entry typed
    /// `AtprotoPersonalDataServer` or identified as `#atproto_pds`, whose
    /// endpoint is a string. The trailing slash is trimmed.
    pub fn pds_endpoint(&self) -> Result<String, IdentityError> {
        let entry = self
            .service
            .iter()
            .find(|s| {
                s.service_type == "AtprotoPersonalDataServer" || s.id.ends_with("#atproto_pds")
            })
            .ok_or(IdentityError::MissingPdsEndpoint)?;
        let endpoint = entry.service_endpoint.as_str().ok_or_else(|| {
            IdentityError::InvalidDoc("serviceEndpoint must be a string".into())
        })?;
        Ok(endpoint.trim_end_matches('/').to_owned())
    }

    /// Recover the handle from an `at://<handle>` alias, if present and
    /// well-formed.
    pub fn handle_alias(&self) -> Option<Handle> {
        self.also_known_as
            .iter()
            .filter_map(|aka| aka.strip_prefix("at://"))
            .find_map(|h| Handle::new(h).ok())
    }
}

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationResponseType {
    Code,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeChallengeMethod {
    S256,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenGrantType {
    AuthorizationCode,
    RefreshToken,
}

/// Prompt hint forwarded to the authorization server.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizePrompt {
    Login,
    None,
    Consent,
    SelectAccount,
}

/// Caller-tunable knobs for `authorize`.
#[derive(Debug, Clone, Default)]
pub struct AuthorizeOptions {
    /// Caller-provided state; a random one is generated when absent.
    pub state: Option<String>,
    /// Override the configured scope for this request.
    pub scope: Option<String>,
    /// Hint which account to log in; ignored for auth-server-URL input.
    pub login_hint: Option<String>,
    pub prompt: Option<AuthorizePrompt>,
}

// https://datatracker.ietf.org/doc/html/rfc9126#section-2
#[derive(Serialize, Debug)]
pub struct ParParameters<'a> {
    pub response_type: AuthorizationResponseType,
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    pub scope: &'a str,
    // https://datatracker.ietf.org/doc/html/rfc7636#section-4.3
    pub code_challenge: &'a str,
    pub code_challenge_method: CodeChallengeMethod,
    pub state: &'a str,
    // https://openid.net/specs/openid-connect-core-1_0.html#AuthRequest
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_hint: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<AuthorizePrompt>,
}

// https://datatracker.ietf.org/doc/html/rfc6749#section-4.1.3
#[derive(Serialize, Debug)]
pub struct TokenRequestParameters<'a> {
    pub grant_type: TokenGrantType,
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    pub code: &'a str,
    // https://datatracker.ietf.org/doc/html/rfc7636#section-4.5
    pub code_verifier: &'a str,
}

// https://datatracker.ietf.org/doc/html/rfc6749#section-6
#[derive(Serialize, Debug)]
pub struct RefreshRequestParameters<'a> {
    pub grant_type: TokenGrantType,
    pub client_id: &'a str,
    pub refresh_token: &'a str,
}

// https://datatracker.ietf.org/doc/html/rfc7009#section-2.1
#[derive(Serialize, Debug)]
pub struct RevocationRequestParameters<'a> {
    pub token: &'a str,
    pub client_id: &'a str,
}

/// Query parameters delivered to the redirect URI.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<SmolStr>,
    pub state: Option<SmolStr>,
    // https://datatracker.ietf.org/doc/html/rfc9207
    pub iss: Option<SmolStr>,
    pub error: Option<SmolStr>,
    pub error_description: Option<SmolStr>,
    /// JARM-style JWT response; unsupported and rejected when present.
    pub response: Option<SmolStr>,
}

impl CallbackParams {
    /// Parse from a URL-encoded query string.
    pub fn from_query(query: &str) -> Result<Self, serde_html_form::de::Error> {
        serde_html_form::from_str(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn par_form_encoding() {
        let params = ParParameters {
            response_type: AuthorizationResponseType::Code,
            client_id: "https://app.example.com/client-metadata.json",
            redirect_uri: "https://app.example.com/callback",
            scope: "atproto transition:generic",
            code_challenge: "challenge",
            code_challenge_method: CodeChallengeMethod::S256,
            state: "st",
            login_hint: Some("alice.example.net"),
            prompt: Some(AuthorizePrompt::SelectAccount),
        };
        let encoded = serde_html_form::to_string(&params).unwrap();
        assert!(encoded.contains("response_type=code"));
        assert!(encoded.contains("code_challenge_method=S256"));
        assert!(encoded.contains("scope=atproto+transition%3Ageneric"));
        assert!(encoded.contains("login_hint=alice.example.net"));
        assert!(encoded.contains("prompt=select_account"));
    }

    #[test]
    fn refresh_form_omits_absent_fields() {
        let params = RefreshRequestParameters {
            grant_type: TokenGrantType::RefreshToken,
            client_id: "cid",
            refresh_token: "rt",
        };
        let encoded = serde_html_form::to_string(&params).unwrap();
        assert_eq!(
            encoded,
            "grant_type=refresh_token&client_id=cid&refresh_token=rt"
        );
    }

    #[test]
    fn callback_params_from_query() {
        let params =
            CallbackParams::from_query("code=abc&state=xyz&iss=https%3A%2F%2Fissuer.example")
                .unwrap();
        assert_eq!(params.code.as_deref(), Some("abc"));
        assert_eq!(params.state.as_deref(), Some("xyz"));
        assert_eq!(params.iss.as_deref(), Some("https://issuer.example"));
        assert_eq!(params.error, None);

        let params = CallbackParams::from_query("error=access_denied&state=xyz").unwrap();
        assert_eq!(params.error.as_deref(), Some("access_denied"));
        assert_eq!(params.code, None);
    }
}

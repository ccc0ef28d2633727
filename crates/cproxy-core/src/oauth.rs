//! OAuth plumbing shared by the login helper and the token authority:
//! PKCE login sessions, the authorize URL, and the token endpoint calls.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::ProxyError;

pub const TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
pub const AUTHORIZE_URL: &str = "https://claude.ai/oauth/authorize";
pub const AUTHORIZE_URL_CONSOLE: &str = "https://console.anthropic.com/oauth/authorize";
pub const REDIRECT_URI: &str = "https://console.anthropic.com/oauth/code/callback";
pub const SCOPE: &str = "org:create_api_key user:profile user:inference";
/// The client id the authorization server has registered for the
/// first-party CLI. Published, not a secret; requests under any other id
/// are not granted the inference scope.
pub const CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

const TOKEN_UA: &str = "claude-cli/2.1.2 (external, cli)";

const STATE_BYTES: usize = 16;
// 48 random bytes encode to 64 characters, inside RFC 7636's 43..=128.
const VERIFIER_BYTES: usize = 48;

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// One PKCE (S256) login attempt: the state nonce, the code verifier held
/// locally, and the challenge derived from it.
#[derive(Debug)]
pub struct LoginSession {
    pub state: String,
    pub code_verifier: String,
    pub code_challenge: String,
}

impl LoginSession {
    pub fn generate() -> Self {
        let state = random_token(STATE_BYTES);
        let code_verifier = random_token(VERIFIER_BYTES);
        let code_challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(code_verifier.as_bytes()));
        Self {
            state,
            code_verifier,
            code_challenge,
        }
    }

    pub fn authorize_url(&self, base: &str, redirect_uri: &str, scope: &str) -> String {
        let query = encode_query(&[
            ("code", "true"),
            ("client_id", CLIENT_ID),
            ("response_type", "code"),
            ("redirect_uri", redirect_uri),
            ("scope", scope),
            ("code_challenge", &self.code_challenge),
            ("code_challenge_method", "S256"),
            ("state", &self.state),
        ]);
        format!("{}?{query}", base.trim_end_matches('/'))
    }
}

fn random_token(length: usize) -> String {
    let mut bytes = vec![0u8; length];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn encode_query(pairs: &[(&str, &str)]) -> String {
    let mut query = String::new();
    for (key, value) in pairs {
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(key);
        query.push('=');
        query.push_str(&urlencoding::encode(value));
    }
    query
}

/// Exchange a pasted authorization code for the token triple. Codes copied
/// from the browser sometimes carry a `#state` fragment; it is split off
/// and sent as the state parameter.
pub async fn exchange_code(
    client: &wreq::Client,
    token_url: &str,
    code: &str,
    code_verifier: &str,
    state: Option<&str>,
) -> Result<TokenResponse, ProxyError> {
    let (code, fragment_state) = match code.split_once('#') {
        Some((code, state)) => (code, Some(state)),
        None => (code, None),
    };
    let state = fragment_state.or(state);

    let mut payload = serde_json::json!({
        "grant_type": "authorization_code",
        "client_id": CLIENT_ID,
        "code": code,
        "redirect_uri": REDIRECT_URI,
        "code_verifier": code_verifier,
    });
    if let Some(state) = state {
        payload["state"] = serde_json::Value::String(state.to_string());
    }
    post_token(client, token_url, payload).await
}

pub async fn refresh_token(
    client: &wreq::Client,
    token_url: &str,
    refresh_token: &str,
) -> Result<TokenResponse, ProxyError> {
    let payload = serde_json::json!({
        "grant_type": "refresh_token",
        "client_id": CLIENT_ID,
        "refresh_token": refresh_token,
    });
    post_token(client, token_url, payload).await
}

async fn post_token(
    client: &wreq::Client,
    token_url: &str,
    payload: serde_json::Value,
) -> Result<TokenResponse, ProxyError> {
    let body =
        serde_json::to_vec(&payload).map_err(|err| ProxyError::RefreshFailed(err.to_string()))?;
    let response = client
        .post(token_url)
        .header("content-type", "application/json")
        .header("user-agent", TOKEN_UA)
        .header("accept", "application/json")
        .body(body)
        .send()
        .await
        .map_err(|err| ProxyError::RefreshFailed(err.to_string()))?;

    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|err| ProxyError::RefreshFailed(err.to_string()))?;
    if !status.is_success() {
        return Err(ProxyError::RefreshFailed(format!(
            "{status} {}",
            String::from_utf8_lossy(&bytes)
        )));
    }
    serde_json::from_slice(&bytes).map_err(|err| ProxyError::RefreshFailed(err.to_string()))
}

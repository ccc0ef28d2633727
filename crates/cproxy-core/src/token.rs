//! Hands out a usable access token and refreshes it when the upstream says
//! it is stale.
//!
//! The stored `expiresAt` is deliberately not checked before use: clocks
//! drift and the upstream is authoritative. A refresh happens only in
//! response to a 401, at most once per request. Concurrent refreshes are
//! tolerated; each writer persists a complete valid triple and the last
//! write wins.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;

use crate::credentials::{Credential, CredentialStore};
use crate::error::ProxyError;
use crate::oauth;

pub struct TokenAuthority {
    store: CredentialStore,
    client: wreq::Client,
    token_url: String,
}

impl TokenAuthority {
    pub fn new(store: CredentialStore) -> Result<Self, wreq::Error> {
        let client = wreq::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            store,
            client,
            token_url: oauth::TOKEN_URL.to_string(),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_token_url(
        store: CredentialStore,
        token_url: String,
    ) -> Result<Self, wreq::Error> {
        let mut authority = Self::new(store)?;
        authority.token_url = token_url;
        Ok(authority)
    }

    /// The stored access token, as-is.
    pub fn access_token(&self) -> Result<String, ProxyError> {
        match self.store.load() {
            Ok(Some(credential)) => Ok(credential.access_token),
            Ok(None) => Err(ProxyError::NotAuthenticated),
            Err(err) => Err(ProxyError::RefreshFailed(err.to_string())),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.store.load(), Ok(Some(_)))
    }

    /// Exchange the refresh token for a new triple, persist it, and return
    /// the new access token. Called only after an upstream 401.
    pub async fn force_refresh(&self) -> Result<String, ProxyError> {
        let current = match self.store.load() {
            Ok(Some(credential)) => credential,
            Ok(None) => return Err(ProxyError::NotAuthenticated),
            Err(err) => return Err(ProxyError::RefreshFailed(err.to_string())),
        };

        let tokens =
            oauth::refresh_token(&self.client, &self.token_url, &current.refresh_token).await?;

        let refreshed = Credential {
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.unwrap_or(current.refresh_token),
            expires_at: tokens
                .expires_in
                .map(|seconds| unix_now() + seconds)
                .unwrap_or(current.expires_at),
        };
        self.store
            .save(&refreshed)
            .map_err(|err| ProxyError::RefreshFailed(err.to_string()))?;
        info!("refreshed oauth credential");
        Ok(refreshed.access_token)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

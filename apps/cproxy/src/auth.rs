//! Interactive OAuth login for the terminal. The serve path never calls
//! into this module; it only reads the credential file the login writes.

use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};

use cproxy_core::credentials::{Credential, CredentialStore};
use cproxy_core::oauth;

pub(crate) async fn login(store: &CredentialStore, console: bool) -> Result<()> {
    let session = oauth::LoginSession::generate();
    let base = if console {
        oauth::AUTHORIZE_URL_CONSOLE
    } else {
        oauth::AUTHORIZE_URL
    };
    let url = session.authorize_url(base, oauth::REDIRECT_URI, oauth::SCOPE);

    println!("Open this URL in your browser and authorize access:\n\n  {url}\n");
    print!("Paste the authorization code here: ");
    std::io::stdout().flush()?;
    let mut code = String::new();
    std::io::stdin().read_line(&mut code)?;
    let code = code.trim();
    if code.is_empty() {
        bail!("no authorization code provided");
    }

    let client = wreq::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(5))
        .timeout(std::time::Duration::from_secs(30))
        .build()?;
    let tokens = oauth::exchange_code(
        &client,
        oauth::TOKEN_URL,
        code,
        &session.code_verifier,
        Some(&session.state),
    )
    .await
    .context("authorization code exchange failed")?;

    let refresh_token = tokens
        .refresh_token
        .context("token response carried no refresh token")?;
    let credential = Credential {
        access_token: tokens.access_token,
        refresh_token,
        expires_at: tokens
            .expires_in
            .map(|seconds| unix_now() + seconds)
            .unwrap_or(0),
    };
    store.save(&credential)?;
    println!("Logged in; credential saved.");
    Ok(())
}

pub(crate) fn status(store: &CredentialStore) -> Result<()> {
    match store.load()? {
        Some(credential) => {
            let expires = time::OffsetDateTime::from_unix_timestamp(credential.expires_at)
                .ok()
                .and_then(|when| {
                    when.format(&time::format_description::well_known::Rfc3339)
                        .ok()
                })
                .unwrap_or_else(|| "unknown".to_string());
            println!("Authenticated (access token recorded to expire {expires}).");
        }
        None => println!("Not authenticated. Run `cproxy auth login`."),
    }
    Ok(())
}

pub(crate) fn logout(store: &CredentialStore) -> Result<()> {
    store.clear()?;
    println!("Credential removed.");
    Ok(())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

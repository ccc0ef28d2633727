//! The single upstream operation: POST a prepared body to the messages
//! endpoint with the first-party CLI header set, and apply the retry
//! policy (one token refresh on 401, bounded backoff on 429/529 and
//! transport errors).

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::ProxyError;
use crate::token::TokenAuthority;

pub const API_BASE_URL: &str = "https://api.anthropic.com";
pub const ANTHROPIC_BETA: &str =
    "oauth-2025-04-20,interleaved-thinking-2025-05-14,claude-code-20250219";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const USER_AGENT: &str = "claude-cli/2.1.2 (external, cli)";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

#[derive(Debug)]
pub struct UpstreamReply {
    pub status: u16,
    pub body: UpstreamBody,
}

pub struct UpstreamClient {
    client: wreq::Client,
    tokens: Arc<TokenAuthority>,
    base_url: String,
    backoff_base: Duration,
}

impl UpstreamClient {
    pub fn new(tokens: Arc<TokenAuthority>) -> Result<Self, wreq::Error> {
        let client = wreq::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .read_timeout(STREAM_IDLE_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            tokens,
            base_url: API_BASE_URL.to_string(),
            backoff_base: Duration::from_secs(2),
        })
    }

    #[cfg(test)]
    pub fn with_base_url(
        tokens: Arc<TokenAuthority>,
        base_url: String,
        backoff_base: Duration,
    ) -> Result<Self, wreq::Error> {
        let mut client = Self::new(tokens)?;
        client.base_url = base_url;
        client.backoff_base = backoff_base;
        Ok(client)
    }

    /// POST the prepared native body. `want_stream` selects whether a 2xx
    /// response body is piped or buffered.
    pub async fn post_messages(
        &self,
        body: Bytes,
        want_stream: bool,
    ) -> Result<UpstreamReply, ProxyError> {
        let url = format!("{}/v1/messages?beta=true", self.base_url);
        let mut token = self.tokens.access_token()?;
        let mut refreshed = false;
        let mut attempt: u32 = 1;

        loop {
            let response = self
                .client
                .post(&url)
                .header("authorization", format!("Bearer {token}"))
                .header("anthropic-beta", ANTHROPIC_BETA)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("user-agent", USER_AGENT)
                .header("content-type", "application/json")
                .header("accept", "application/json")
                .body(body.clone())
                .send()
                .await;

            let response = match response {
                Ok(response) => response,
                Err(err) => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(ProxyError::UpstreamTransient(err.to_string()));
                    }
                    let delay = self.backoff(attempt);
                    warn!(error = %err, attempt, "upstream transport error; backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
            };

            let status = response.status().as_u16();
            if (200..300).contains(&status) {
                return self.convert_response(response, want_stream).await;
            }

            let retry_after = parse_retry_after(response.headers());
            let error_body = response
                .bytes()
                .await
                .unwrap_or_else(|_| Bytes::new());

            match status {
                401 if !refreshed => {
                    refreshed = true;
                    match self.tokens.force_refresh().await {
                        Ok(new_token) => {
                            info!("retrying after credential refresh");
                            token = new_token;
                            continue;
                        }
                        Err(err) => {
                            // The refresh failed; the original 401 surfaces.
                            warn!(error = %err, "credential refresh failed");
                            return Err(ProxyError::UpstreamFatal {
                                status,
                                body: error_body,
                            });
                        }
                    }
                }
                429 | 529 if attempt < MAX_ATTEMPTS => {
                    let delay = retry_after.unwrap_or_else(|| self.backoff(attempt));
                    warn!(status, attempt, delay_ms = delay.as_millis() as u64, "upstream throttled; backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                _ => {
                    return Err(ProxyError::UpstreamFatal {
                        status,
                        body: error_body,
                    });
                }
            }
        }
    }

    /// 2 s, 4 s, 8 s.
    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    async fn convert_response(
        &self,
        response: wreq::Response,
        want_stream: bool,
    ) -> Result<UpstreamReply, ProxyError> {
        let status = response.status().as_u16();
        if !want_stream {
            let body = response
                .bytes()
                .await
                .map_err(|err| ProxyError::UpstreamTransient(err.to_string()))?;
            return Ok(UpstreamReply {
                status,
                body: UpstreamBody::Bytes(body),
            });
        }

        let (sender, receiver) = mpsc::channel::<Bytes>(16);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            loop {
                let next = tokio::time::timeout(STREAM_IDLE_TIMEOUT, stream.next()).await;
                let item = match next {
                    Ok(item) => item,
                    Err(_) => break,
                };
                let Some(item) = item else {
                    break;
                };
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(_) => break,
                };
                // A closed receiver means the client went away; dropping the
                // stream cancels the upstream call.
                if sender.send(chunk).await.is_err() {
                    break;
                }
            }
        });

        Ok(UpstreamReply {
            status,
            body: UpstreamBody::Stream(receiver),
        })
    }
}

fn parse_retry_after(headers: &wreq::header::HeaderMap) -> Option<Duration> {
    let value = headers.get("retry-after")?.to_str().ok()?;
    let seconds: u64 = value.trim().parse().ok()?;
    Some(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Credential, CredentialStore};
    use tempfile::tempdir;

    fn authority_with_credential(dir: &std::path::Path) -> Arc<TokenAuthority> {
        let store = CredentialStore::new(dir);
        store
            .save(&Credential {
                access_token: "at".into(),
                refresh_token: "rt".into(),
                expires_at: 0,
            })
            .unwrap();
        Arc::new(TokenAuthority::new(store).unwrap())
    }

    #[test]
    fn backoff_is_exponential_from_two_seconds() {
        let dir = tempdir().unwrap();
        let client = UpstreamClient::new(authority_with_credential(dir.path())).unwrap();
        assert_eq!(client.backoff(1), Duration::from_secs(2));
        assert_eq!(client.backoff(2), Duration::from_secs(4));
        assert_eq!(client.backoff(3), Duration::from_secs(8));
    }

    #[test]
    fn retry_after_header_parses_seconds() {
        let mut headers = wreq::header::HeaderMap::new();
        headers.insert("retry-after", "7".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));

        let mut bad = wreq::header::HeaderMap::new();
        bad.insert("retry-after", "soon".parse().unwrap());
        assert_eq!(parse_retry_after(&bad), None);
    }

    #[tokio::test]
    async fn missing_credential_fails_before_any_network_io() {
        let dir = tempdir().unwrap();
        let tokens = Arc::new(TokenAuthority::new(CredentialStore::new(dir.path())).unwrap());
        let client = UpstreamClient::new(tokens).unwrap();
        let result = client.post_messages(Bytes::from_static(b"{}"), false).await;
        assert!(matches!(result, Err(ProxyError::NotAuthenticated)));
    }

    /// Minimal HTTP/1.1 responder: one canned response per connection, in
    /// order, then the listener closes.
    async fn spawn_mock(responses: Vec<(u16, String)>) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                // Drain the request: headers, then content-length bytes.
                let mut buffer = Vec::new();
                let mut chunk = [0u8; 1024];
                let header_end = loop {
                    let n = match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    buffer.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos + 4;
                    }
                };
                let headers = String::from_utf8_lossy(&buffer[..header_end]).to_ascii_lowercase();
                let content_length: usize = headers
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|value| value.trim().parse().ok())
                    .unwrap_or(0);
                while buffer.len() < header_end + content_length {
                    let n = match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    buffer.extend_from_slice(&chunk[..n]);
                }

                let response = format!(
                    "HTTP/1.1 {status} MOCK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len(),
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{address}")
    }

    fn message_json() -> String {
        serde_json::json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": "claude-sonnet-4-5",
            "content": [{"type": "text", "text": "Hi"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 5, "output_tokens": 1}
        })
        .to_string()
    }

    /// A 401 triggers one refresh and one retry; the client sees a clean
    /// 200 and the store holds the new triple.
    #[tokio::test]
    async fn refresh_on_401_then_retry_succeeds() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        store
            .save(&Credential {
                access_token: "stale".into(),
                refresh_token: "rt-old".into(),
                expires_at: 0,
            })
            .unwrap();

        let base = spawn_mock(vec![
            (401, r#"{"type":"error","error":{"type":"authentication_error","message":"expired"}}"#.to_string()),
            (
                200,
                r#"{"access_token":"at-new","refresh_token":"rt-new","expires_in":3600}"#
                    .to_string(),
            ),
            (200, message_json()),
        ])
        .await;

        let tokens = Arc::new(
            TokenAuthority::with_token_url(store.clone(), format!("{base}/v1/oauth/token"))
                .unwrap(),
        );
        let client =
            UpstreamClient::with_base_url(tokens, base, Duration::from_millis(1)).unwrap();

        let reply = client
            .post_messages(Bytes::from_static(b"{}"), false)
            .await
            .unwrap();
        assert_eq!(reply.status, 200);
        match reply.body {
            UpstreamBody::Bytes(bytes) => {
                assert!(String::from_utf8_lossy(&bytes).contains("\"Hi\""));
            }
            UpstreamBody::Stream(_) => panic!("expected a buffered body"),
        }

        let saved = store.load().unwrap().unwrap();
        assert_eq!(saved.access_token, "at-new");
        assert_eq!(saved.refresh_token, "rt-new");
    }

    /// A second 401 after the refresh is fatal, not a refresh loop.
    #[tokio::test]
    async fn repeated_401_surfaces_after_single_refresh() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        store
            .save(&Credential {
                access_token: "stale".into(),
                refresh_token: "rt".into(),
                expires_at: 0,
            })
            .unwrap();

        let base = spawn_mock(vec![
            (401, "first".to_string()),
            (
                200,
                r#"{"access_token":"at-new","refresh_token":"rt-new","expires_in":3600}"#
                    .to_string(),
            ),
            (401, "second".to_string()),
        ])
        .await;

        let tokens = Arc::new(
            TokenAuthority::with_token_url(store, format!("{base}/v1/oauth/token")).unwrap(),
        );
        let client =
            UpstreamClient::with_base_url(tokens, base, Duration::from_millis(1)).unwrap();
        let result = client.post_messages(Bytes::from_static(b"{}"), false).await;
        match result {
            Err(ProxyError::UpstreamFatal { status: 401, body }) => {
                assert_eq!(&body[..], b"second");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    /// 429 honours retry-after-free backoff and eventually succeeds.
    #[tokio::test]
    async fn throttled_retries_then_succeeds() {
        let dir = tempdir().unwrap();
        let base = spawn_mock(vec![
            (429, r#"{"error":"slow down"}"#.to_string()),
            (200, message_json()),
        ])
        .await;
        let client = UpstreamClient::with_base_url(
            authority_with_credential(dir.path()),
            base,
            Duration::from_millis(1),
        )
        .unwrap();
        let reply = client
            .post_messages(Bytes::from_static(b"{}"), false)
            .await
            .unwrap();
        assert_eq!(reply.status, 200);
    }

    #[tokio::test]
    async fn network_errors_exhaust_attempts_then_surface_transient() {
        let dir = tempdir().unwrap();
        // Unroutable local port; every attempt fails at connect time.
        let client = UpstreamClient::with_base_url(
            authority_with_credential(dir.path()),
            "http://127.0.0.1:9".into(),
            Duration::from_millis(1),
        )
        .unwrap();
        let result = client.post_messages(Bytes::from_static(b"{}"), false).await;
        assert!(matches!(result, Err(ProxyError::UpstreamTransient(_))));
    }
}

use bytes::Bytes;

/// The error kinds the request path distinguishes. The router owns the
/// mapping to HTTP statuses and protocol error envelopes.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("not authenticated: no credential on disk")]
    NotAuthenticated,

    /// The OAuth refresh itself was rejected; the original 401 surfaces.
    #[error("oauth refresh rejected: {0}")]
    RefreshFailed(String),

    #[error("upstream transient failure: {0}")]
    UpstreamTransient(String),

    #[error("upstream failure: status {status}")]
    UpstreamFatal { status: u16, body: Bytes },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("throttled: {0}")]
    Throttled(String),

    #[error("cancelled")]
    Cancelled,
}

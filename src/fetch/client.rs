use async_trait::async_trait;
use thiserror::Error;

/// One response body from the portal, plus the attachment name when the
/// server sent a `Content-Disposition` header.
#[derive(Debug, Clone)]
pub struct PortalResponse {
    pub body: Vec<u8>,
    pub filename: Option<String>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection-level failure (reset, timeout, DNS). Retryable.
    #[error("connection error: {0}")]
    Connection(String),

    /// The server answered with a non-success status. Not retryable.
    #[error("http status {0}")]
    Status(u16),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Connection(_))
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// POSTs a form body to `url`. Used for the login request.
    async fn post_form(
        &self,
        url: &str,
        form: &[(String, String)],
    ) -> Result<PortalResponse, TransportError>;

    /// GETs `url` with query parameters appended.
    async fn get(
        &self,
        url: &str,
        params: &[(String, String)],
    ) -> Result<PortalResponse, TransportError>;
}

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_DISPOSITION;

use super::client::{PortalResponse, Transport, TransportError};

/// Default [`Transport`] backed by a reqwest client with a cookie store,
/// which is what keeps the login session alive between requests.
pub struct HttpTransport(reqwest::Client);

impl HttpTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(Self(client))
    }

    async fn read_response(resp: reqwest::Response) -> Result<PortalResponse, TransportError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        let filename = resp
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_attachment_name);

        let body = resp
            .bytes()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?
            .to_vec();

        Ok(PortalResponse { body, filename })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post_form(
        &self,
        url: &str,
        form: &[(String, String)],
    ) -> Result<PortalResponse, TransportError> {
        let resp = self
            .0
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Self::read_response(resp).await
    }

    async fn get(
        &self,
        url: &str,
        params: &[(String, String)],
    ) -> Result<PortalResponse, TransportError> {
        let resp = self
            .0
            .get(url)
            .query(params)
            .send()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Self::read_response(resp).await
    }
}

/// Pulls the attachment name out of a `Content-Disposition` header value,
/// e.g. `attachment; filename=d04_text_station_5min_2014_01_15.txt.gz`.
fn parse_attachment_name(value: &str) -> Option<String> {
    let (_, name) = value.rsplit_once('=')?;
    let name = name.trim().trim_matches('"');
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

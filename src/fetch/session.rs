//! Login session against the PeMS portal, with backoff-and-relogin retry.
//!
//! The portal does not return a distinguishable status for a bad login, so
//! success is verified by looking for the post-login `logout` marker in the
//! response page. Connection failures during a fetch are retried with
//! exponential backoff, re-authenticating before every retry; the retry loop
//! is unbounded by default (long unattended batch jobs) but always honors the
//! cancellation token, and a cap can be set via [`RetryPolicy`].

use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::cancel::CancelToken;
use super::client::{PortalResponse, Transport, TransportError};

/// Marker string that only appears on pages served to a logged-in session.
const POST_LOGIN_MARKER: &str = "logout";

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    fn login_form(&self) -> Vec<(String, String)> {
        vec![
            ("action".to_string(), "login".to_string()),
            ("username".to_string(), self.username.clone()),
            ("password".to_string(), self.password.clone()),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// First backoff delay; also the base of the post-success jitter sleep.
    pub base_delay: Duration,
    /// `None` retries forever (the original policy). A cap turns exhaustion
    /// into [`SessionError::RetriesExhausted`].
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            base_delay: Duration::from_secs(10),
            max_retries: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("portal rejected login (no post-login marker in response)")]
    LoginFailed,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("cancelled")]
    Cancelled,

    #[error("gave up after {0} retries")]
    RetriesExhausted(u32),
}

/// An authenticated session. All fetches go through [`fetch_with_retry`],
/// which owns the backoff/re-login loop.
///
/// [`fetch_with_retry`]: PortalSession::fetch_with_retry
pub struct PortalSession<T: Transport> {
    transport: T,
    base_url: String,
    credentials: Credentials,
    policy: RetryPolicy,
}

impl<T: Transport> PortalSession<T> {
    pub fn new(
        transport: T,
        base_url: impl Into<String>,
        credentials: Credentials,
        policy: RetryPolicy,
    ) -> Self {
        PortalSession {
            transport,
            base_url: base_url.into(),
            credentials,
            policy,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POSTs the login form and verifies the session actually opened.
    pub async fn login(&self) -> Result<(), SessionError> {
        let resp = self
            .transport
            .post_form(&self.base_url, &self.credentials.login_form())
            .await?;

        let body = String::from_utf8_lossy(&resp.body).to_lowercase();
        if body.contains(POST_LOGIN_MARKER) {
            info!(user = %self.credentials.username, "portal login ok");
            Ok(())
        } else {
            Err(SessionError::LoginFailed)
        }
    }

    /// GETs `url` with `params`, retrying connection failures.
    ///
    /// Each consecutive failure doubles the backoff delay, sleeps it, and
    /// re-authenticates before the next attempt. After a success, a uniform
    /// jitter in `[base, 1.2 * base]` is slept so a tight download loop does
    /// not trip the portal's rate limiting.
    pub async fn fetch_with_retry(
        &self,
        url: &str,
        params: &[(String, String)],
        cancel: &CancelToken,
    ) -> Result<PortalResponse, SessionError> {
        let mut delay = self.policy.base_delay;
        let mut failures: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }

            match self.transport.get(url, params).await {
                Ok(resp) => {
                    debug!(url, bytes = resp.body.len(), "fetch ok");
                    self.jitter_sleep(cancel).await?;
                    return Ok(resp);
                }
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    if let Some(cap) = self.policy.max_retries {
                        if failures > cap {
                            return Err(SessionError::RetriesExhausted(cap));
                        }
                    }
                    warn!(
                        url,
                        error = %e,
                        failures,
                        backoff_secs = delay.as_secs_f64(),
                        "connection failure, backing off and re-authenticating"
                    );
                    self.sleep_or_cancel(delay, cancel).await?;
                    delay *= 2;
                    if let Err(e) = self.login().await {
                        // The next GET will fail and come back around.
                        warn!(error = %e, "re-login failed");
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Fetches against the session's own base URL (report queries).
    pub async fn fetch_base(
        &self,
        params: &[(String, String)],
        cancel: &CancelToken,
    ) -> Result<PortalResponse, SessionError> {
        let url = self.base_url.clone();
        self.fetch_with_retry(&url, params, cancel).await
    }

    async fn jitter_sleep(&self, cancel: &CancelToken) -> Result<(), SessionError> {
        let base = self.policy.base_delay.as_secs_f64();
        let secs = {
            let mut rng = rand::thread_rng();
            rng.gen_range(base..=base * 1.2)
        };
        self.sleep_or_cancel(Duration::from_secs_f64(secs), cancel)
            .await
    }

    async fn sleep_or_cancel(
        &self,
        delay: Duration,
        cancel: &CancelToken,
    ) -> Result<(), SessionError> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
        }
    }
}

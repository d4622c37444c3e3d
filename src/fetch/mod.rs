//! Authenticated HTTP access to the PeMS portal.
//!
//! The transport is a trait so the retry/re-login logic in [`session`] can be
//! exercised against a mock in tests.

mod basic;
mod cancel;
mod client;
mod session;

pub use basic::HttpTransport;
pub use cancel::{CancelSource, CancelToken, cancel_pair};
pub use client::{PortalResponse, Transport, TransportError};
pub use session::{Credentials, PortalSession, RetryPolicy, SessionError};

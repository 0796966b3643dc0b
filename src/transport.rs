//! Outbound SIP request delivery.
//!
//! The SIP stack's transport and transaction layer are explicitly out of scope (spec
//! §1 Non-goals) — but the registrar, subscription manager, and proxy-tsx all need to
//! hand a constructed request to *something* that puts it on the wire (3rd-party
//! REGISTER, NOTIFY, AS invocation). This is that narrow seam, following the same
//! `async fn`-in-trait + blanket `Arc<T>` shape as [`crate::hss::HssClient`].

use crate::sip::{SipRequest, SipResponse};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("transport failure: {0}")]
    Failed(String),
}

pub trait SipTransport: Send + Sync + 'static {
    /// Fire-and-forget delivery, used for NOTIFY and 3rd-party REGISTER.
    fn send(&self, req: SipRequest) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Send and wait for a final response within `timeout`, used for AS invocation
    /// (spec §4.5 liveness timers).
    fn send_and_await(
        &self,
        req: SipRequest,
        timeout: Duration,
    ) -> impl Future<Output = Result<SipResponse, TransportError>> + Send;
}

impl<T: SipTransport> SipTransport for std::sync::Arc<T> {
    fn send(&self, req: SipRequest) -> impl Future<Output = Result<(), TransportError>> + Send {
        (**self).send(req)
    }

    fn send_and_await(
        &self,
        req: SipRequest,
        timeout: Duration,
    ) -> impl Future<Output = Result<SipResponse, TransportError>> + Send {
        (**self).send_and_await(req, timeout)
    }
}

/// Placeholder used when no SIP transport is wired in: the transport/transaction layer
/// is an out-of-scope external collaborator (spec §1 Non-goals). Every send fails
/// loudly so a standalone binary without a real stack attached doesn't silently drop
/// traffic.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredSipTransport;

impl SipTransport for UnconfiguredSipTransport {
    async fn send(&self, _req: SipRequest) -> Result<(), TransportError> {
        Err(TransportError::Failed("no SIP transport configured".into()))
    }

    async fn send_and_await(
        &self,
        _req: SipRequest,
        timeout: Duration,
    ) -> Result<SipResponse, TransportError> {
        Err(TransportError::Timeout(timeout))
    }
}

//! Accounting (ACR/Rf) reporting hook (spec §1 external collaborators, §4.5 Proxy-TSX
//! bookkeeping). Billing itself — the Diameter Rf interface, CDR formatting — is out of
//! scope (spec §1 Non-goals); this is the narrow event surface the proxy and registrar
//! emit onto so a real accounting client can be wired in later.
//!
//! Registrar and Proxy-TSX hold this behind `Arc<dyn AcrReporter>` so a single
//! accounting client can be shared across every subsystem without generic fan-out;
//! `async_trait` makes that object safety possible, the way the teacher reaches for it
//! at trait-object seams rather than the plain `async fn` used elsewhere.

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcrEvent {
    Start,
    Interim,
    Stop,
}

#[derive(Debug, Clone)]
pub struct AcrRecord {
    pub event: AcrEvent,
    pub call_id: String,
    pub served_user: String,
}

#[async_trait]
pub trait AcrReporter: Send + Sync + 'static {
    async fn report(&self, record: AcrRecord);
}

/// No-op reporter used where no accounting client is configured, and by default in
/// tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAcrReporter;

#[async_trait]
impl AcrReporter for NullAcrReporter {
    async fn report(&self, record: AcrRecord) {
        tracing::debug!(
            event = ?record.event,
            call_id = %record.call_id,
            served_user = %record.served_user,
            "ACR event dropped: no accounting client configured"
        );
    }
}

//! Middleware chain (spec §4.6, §9 "Middleware chain as doubly-linked polymorphic
//! layer"): re-expressed here as a flat `Vec<Arc<dyn Interceptor>>` folded by a driver,
//! rather than the source's mutable-pointer doubly-linked layers — each layer owns
//! nothing about its neighbours, avoiding the cyclic-ownership problem the design
//! notes call out.

pub mod auth_layer;
pub mod context;

use crate::sip::{SipRequest, SipResponse};
use async_trait::async_trait;
use context::RequestContext;
use std::sync::Arc;

/// What one interceptor decided to do with the message (spec §4.6: "synthesise a
/// response ..., forward it, or transform it").
pub enum InterceptorOutcome {
    Respond(SipResponse),
    Forward(SipRequest),
    /// The request is parked; a later event resumes the chain from here. The
    /// contract is purely synchronous otherwise (spec §4.6).
    Defer,
}

/// One link in the chain. `async_trait` buys object safety so the chain can hold a
/// heterogeneous `Vec<Arc<dyn Interceptor>>`, the way the teacher reaches for
/// `async_trait` at trait-object seams.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    async fn intercept(&self, req: SipRequest, ctx: &mut RequestContext) -> InterceptorOutcome;
}

/// Folds a layer list into one handler: walks layers in order, stopping at the first
/// `Respond`/`Defer`, otherwise passing the (possibly transformed) request to the next
/// layer and finally to `terminal`.
pub struct InterceptorChain {
    layers: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new(layers: Vec<Arc<dyn Interceptor>>) -> Self {
        InterceptorChain { layers }
    }

    pub async fn run(
        &self,
        mut req: SipRequest,
        ctx: &mut RequestContext,
        terminal: impl FnOnce(SipRequest) -> SipResponse,
    ) -> InterceptorOutcome {
        for layer in &self.layers {
            match layer.intercept(req, ctx).await {
                InterceptorOutcome::Forward(next) => req = next,
                other => return other,
            }
        }
        InterceptorOutcome::Respond(terminal(req))
    }
}

//! Authentication as middleware (spec §4.6: "Authentication is implemented as
//! middleware so that non-authenticated requests never reach the handler").

use crate::auth::{AuthenticationEngine, VerifyOutcome};
use crate::config::NodeConfig;
use crate::hss::HssClient;
use crate::middleware::context::RequestContext;
use crate::middleware::{Interceptor, InterceptorOutcome};
use crate::sip::{Method, SipRequest, SipResponse};
use crate::store::Store;
use crate::timer::TimerService;
use async_trait::async_trait;
use std::sync::Arc;

/// The IMPI an earlier middleware layer's auth check resolved, stashed in the shared
/// [`RequestContext`] for downstream layers and the handler to read without
/// re-verifying.
pub struct AuthenticatedImpi(pub String);

pub struct AuthMiddleware<S, H, T> {
    engine: Arc<AuthenticationEngine<S, H, T>>,
    config: Arc<NodeConfig>,
}

impl<S, H, T> AuthMiddleware<S, H, T> {
    pub fn new(engine: Arc<AuthenticationEngine<S, H, T>>, config: Arc<NodeConfig>) -> Self {
        AuthMiddleware { engine, config }
    }
}

#[async_trait]
impl<S, H, T> Interceptor for AuthMiddleware<S, H, T>
where
    S: Store,
    H: HssClient,
    T: TimerService,
{
    async fn intercept(&self, req: SipRequest, ctx: &mut RequestContext) -> InterceptorOutcome {
        let is_register = req.method == Method::Register;
        if !self.engine.should_challenge(&req, is_register) {
            return InterceptorOutcome::Forward(req);
        }

        let Some(auth) = req.authorization.as_ref().or(req.proxy_authorization.as_ref()) else {
            return match self.engine.challenge(&req.from_uri).await {
                Ok((nonce, _vector)) => InterceptorOutcome::Respond(
                    challenge_response(&req, &nonce, false, &self.config.realm),
                ),
                Err(err) => InterceptorOutcome::Respond(
                    SipResponse::new(500, "Server Internal Error")
                        .with_header("X-Error", err.to_string()),
                ),
            };
        };

        match self.engine.verify(auth, &req.method.to_string()).await {
            Ok(VerifyOutcome::Authenticated(impi)) => {
                ctx.insert(AuthenticatedImpi(impi));
                InterceptorOutcome::Forward(req)
            }
            Ok(VerifyOutcome::Stale) => match self.engine.challenge(&req.from_uri).await {
                Ok((nonce, _)) => {
                    InterceptorOutcome::Respond(challenge_response(&req, &nonce, true, &self.config.realm))
                }
                Err(err) => InterceptorOutcome::Respond(
                    SipResponse::new(500, "Server Internal Error")
                        .with_header("X-Error", err.to_string()),
                ),
            },
            Ok(VerifyOutcome::Failed) => {
                InterceptorOutcome::Respond(SipResponse::new(403, "Forbidden"))
            }
            Err(err) => InterceptorOutcome::Respond(
                SipResponse::new(500, "Server Internal Error")
                    .with_header("X-Error", err.to_string()),
            ),
        }
    }
}

fn challenge_response(req: &SipRequest, nonce: &str, stale: bool, realm: &str) -> SipResponse {
    let status = if req.method == Method::Register { 401 } else { 407 };
    let header_name = if status == 401 {
        "WWW-Authenticate"
    } else {
        "Proxy-Authenticate"
    };
    let value = format!(
        "Digest realm=\"{realm}\", nonce=\"{nonce}\", qop=\"auth\", stale={stale}",
        stale = if stale { "TRUE" } else { "FALSE" },
    );
    SipResponse::new(status, if status == 401 { "Unauthorized" } else { "Proxy Authentication Required" })
        .with_header(header_name, value)
}

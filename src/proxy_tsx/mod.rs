//! Proxy-TSX (spec §4.5): the per-request state machine that walks a served user's
//! iFC chain, invoking ASes and routing the eventual result.

pub mod as_chain;

use crate::acr::{AcrEvent, AcrReporter, AcrRecord};
use crate::config::NodeConfig;
use crate::proxy_tsx::as_chain::AsChainTable;
use crate::error::CoreError;
use crate::hss::HssClient;
use crate::ifc::{matching_ifcs, TriggerInput};
use crate::sip::{SessionCase, SipRequest, SipResponse};
use crate::store::{Store, Table};
use crate::timer::{TimerId, TimerService};
use crate::transport::{SipTransport, TransportError};
use crate::types::{AsChain, AsHop, DefaultHandling, IfcConfiguration, Impu, OdiToken};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TsxState {
    Start,
    ServedUserDetermined,
    InAsChain(usize),
    Routed,
    Failing,
    Completing,
    Cancelling,
}

pub struct ProxyTsx<S, H, T, X> {
    store: S,
    hss: H,
    timers: T,
    transport: X,
    acr: Arc<dyn AcrReporter>,
    as_chains: Arc<AsChainTable>,
    config: Arc<NodeConfig>,
    cancellation: CancellationToken,
}

/// Final disposition of a transaction, carrying enough for the caller to build the
/// outward SIP response and, on a `430`, which binding to drop.
pub struct TsxOutcome {
    pub response: SipResponse,
    pub flow_failed_binding: Option<String>,
}

impl<S, H, T, X> ProxyTsx<S, H, T, X>
where
    S: Store,
    H: HssClient,
    T: TimerService,
    X: SipTransport,
{
    pub fn new(
        store: S,
        hss: H,
        timers: T,
        transport: X,
        acr: Arc<dyn AcrReporter>,
        as_chains: Arc<AsChainTable>,
        config: Arc<NodeConfig>,
    ) -> Self {
        ProxyTsx {
            store,
            hss,
            timers,
            transport,
            acr,
            as_chains,
            config,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// spec §4.5 served-user determination.
    fn determine_session_case(&self, req: &SipRequest, served_user: &Impu) -> SessionCase {
        if &req.request_uri == served_user {
            SessionCase::Terminating
        } else {
            SessionCase::Originating
        }
    }

    #[instrument(skip_all, err, fields(call_id = %req.call_id))]
    pub async fn process(
        &self,
        req: SipRequest,
        ifc: &IfcConfiguration,
        registered: bool,
    ) -> Result<TsxOutcome, CoreError> {
        let case = req.session_case.unwrap_or(SessionCase::Originating);
        let served_user = req.served_user(case);

        self.acr
            .report(AcrRecord {
                event: AcrEvent::Start,
                call_id: req.call_id.clone(),
                served_user: served_user.clone(),
            })
            .await;

        let headers = req.headers.clone();
        let sdp_lines: Vec<String> = req
            .body
            .as_deref()
            .map(|b| b.lines().map(str::to_string).collect())
            .unwrap_or_default();
        let input = TriggerInput {
            method: &req.method.to_string(),
            session_case: case,
            request_uri: &req.request_uri,
            headers: &headers,
            sdp_lines: &sdp_lines,
        };
        let hops = matching_ifcs(ifc, &input, registered);

        let chain = AsChain {
            served_user: served_user.clone(),
            session_case: case,
            originating: case != SessionCase::Terminating,
            hops,
            next_index: 0,
            base_request_snapshot: Some(req.clone()),
            refcount: 1,
        };
        let token = self.as_chains.insert(chain);

        let outcome = self.walk_chain(&token, req, case, registered).await;
        self.as_chains.remove(&token);

        self.acr
            .report(AcrRecord {
                event: AcrEvent::Stop,
                call_id: served_user.clone(),
                served_user,
            })
            .await;

        outcome
    }

    async fn walk_chain(
        &self,
        token: &OdiToken,
        mut current_request: SipRequest,
        case: SessionCase,
        registered: bool,
    ) -> Result<TsxOutcome, CoreError> {
        loop {
            let next_hop = self
                .as_chains
                .with_chain(token, |chain| chain.next_hop().cloned())
                .flatten();

            let Some(hop) = next_hop else {
                return self.route_end_of_chain(current_request, case, registered).await;
            };

            let timeout = self.liveness_timeout(&hop);
            let routed = self.route_to_as(&current_request, &hop, token);

            match self.transport.send_and_await(routed, timeout).await {
                Ok(response) if response.is_provisional() => {
                    // The AS answered, so the liveness timer that bounded
                    // `send_and_await` is moot; propagate the 1xx upstream without
                    // advancing the chain or re-requesting the hop. Waiting further for
                    // this hop's eventual final response is the transaction layer's
                    // job (out of scope, spec §1), same as the multi-fork fan-out in
                    // `fork_to_bindings`.
                    return Ok(TsxOutcome {
                        response,
                        flow_failed_binding: None,
                    });
                }
                Ok(response) => {
                    // Any final response -- success or failure -- may retarget the
                    // request (the AS can rewrite the request-URI) and always
                    // continues the chain walk; the AS is not the last word unless it
                    // was the last hop.
                    self.as_chains.with_chain(token, |chain| chain.advance());
                    current_request.request_uri = response
                        .headers
                        .iter()
                        .find(|(k, _)| k == "Contact")
                        .map(|(_, v)| v.clone())
                        .unwrap_or(current_request.request_uri);
                }
                Err(TransportError::Timeout(_)) | Err(TransportError::Failed(_)) => {
                    match hop.default_handling {
                        DefaultHandling::SessionContinued => {
                            tracing::info!(as_uri = %hop.as_uri, "AS unreachable, SessionContinued skip");
                            self.as_chains.with_chain(token, |chain| {
                                if let Some(base) = chain.base_request_snapshot.clone() {
                                    current_request = base;
                                }
                                chain.advance();
                            });
                        }
                        DefaultHandling::SessionTerminated => {
                            tracing::warn!(as_uri = %hop.as_uri, "AS unreachable, SessionTerminated");
                            return Ok(TsxOutcome {
                                response: SipResponse::new(504, "Server Time-out"),
                                flow_failed_binding: None,
                            });
                        }
                    }
                }
            }
        }
    }

    fn liveness_timeout(&self, hop: &AsHop) -> Duration {
        match hop.default_handling {
            DefaultHandling::SessionContinued => {
                Duration::from_millis(self.config.session_continued_timeout_ms)
            }
            DefaultHandling::SessionTerminated => {
                Duration::from_millis(self.config.session_terminated_timeout_ms)
            }
        }
    }

    /// spec §4.5 "AS invocation": two Route headers, the AS then back to this node
    /// carrying the ODI token.
    fn route_to_as(&self, req: &SipRequest, hop: &AsHop, token: &OdiToken) -> SipRequest {
        let mut routed = req.clone();
        routed.request_uri = hop.as_uri.clone();
        routed.route = vec![
            hop.as_uri.clone(),
            format!("{};lr;odi={}", self.config.scscf_uri, token),
        ];
        routed
    }

    /// spec §4.5 "End-of-chain routing".
    async fn route_end_of_chain(
        &self,
        req: SipRequest,
        case: SessionCase,
        registered: bool,
    ) -> Result<TsxOutcome, CoreError> {
        match case {
            SessionCase::Originating | SessionCase::OriginatingCdiv => {
                if registered {
                    // Re-enter with terminating session case (same-node re-entry is
                    // the caller's responsibility; this hands back a 100 Trying-style
                    // acknowledgement that routing continues terminating-side).
                    Ok(TsxOutcome {
                        response: SipResponse::new(100, "Trying")
                            .with_header("X-Route-Next", "terminating".to_string()),
                        flow_failed_binding: None,
                    })
                } else if self.config.auto_reg {
                    self.hss
                        .get_registration_data(&req.from_uri, &req.request_uri)
                        .await
                        .map_err(CoreError::Hss)?;
                    Ok(TsxOutcome {
                        response: SipResponse::new(100, "Trying")
                            .with_header("X-Route-Next", "terminating".to_string()),
                        flow_failed_binding: None,
                    })
                } else {
                    Ok(TsxOutcome {
                        response: SipResponse::new(404, "Not Found"),
                        flow_failed_binding: None,
                    })
                }
            }
            SessionCase::Terminating => self.fork_to_bindings(&req.request_uri).await,
        }
    }

    async fn fork_to_bindings(&self, impu: &Impu) -> Result<TsxOutcome, CoreError> {
        let entry = self.store.get(Table::Aor, impu).await?;
        let Some(bytes) = entry.data else {
            return Ok(TsxOutcome {
                response: SipResponse::new(480, "Temporarily Unavailable"),
                flow_failed_binding: None,
            });
        };
        let aor: crate::types::Aor =
            serde_json::from_slice(&bytes).map_err(crate::error::StoreError::Serialization)?;

        if aor.bindings.is_empty() {
            return Ok(TsxOutcome {
                response: SipResponse::new(480, "Temporarily Unavailable"),
                flow_failed_binding: None,
            });
        }

        let mut targets = aor.bindings.clone();
        targets.sort_by(|a, b| b.q_value.unwrap_or(0).cmp(&a.q_value.unwrap_or(0)));
        targets.truncate(self.config.max_forking);
        if aor.bindings.len() > self.config.max_forking {
            tracing::warn!(
                impu = %impu,
                total = aor.bindings.len(),
                forked = self.config.max_forking,
                "binding set exceeds MAX_FORKING, truncating"
            );
        }

        // A single fork is modeled here; concurrent multi-fork fan-out is the SIP
        // stack's transaction layer's job (out of scope, spec §1).
        let primary = &targets[0];
        Ok(TsxOutcome {
            response: SipResponse::new(100, "Trying")
                .with_header("Contact", primary.contact_uri.clone()),
            flow_failed_binding: Some(primary.binding_id.clone()),
        })
    }

    pub async fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub async fn cancel_timer(&self, id: TimerId) {
        self.timers.cancel(id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acr::NullAcrReporter;
    use crate::hss::mock::MockHss;
    use crate::sip::Method;
    use crate::store::memory::MemoryStore;
    use crate::timer::TokioTimerService;
    use crate::transport::mock::RecordingTransport;
    use crate::types::{FilterCriterion, ProfilePartIndicator, TriggerExpr};
    use std::collections::HashMap;

    fn invite() -> SipRequest {
        SipRequest {
            method: Method::Invite,
            request_uri: "sip:bob@home.net".to_string(),
            from_uri: "sip:alice@home.net".to_string(),
            from_tag: Some("ftag".to_string()),
            to_uri: "sip:bob@home.net".to_string(),
            to_tag: None,
            call_id: "call-invite-1".to_string(),
            cseq: 1,
            p_asserted_identity: Some("sip:alice@home.net".to_string()),
            p_preferred_identity: None,
            authorization: None,
            proxy_authorization: None,
            contacts: vec![],
            expires_header: None,
            event_package: None,
            route: vec![],
            integrity_protected: Default::default(),
            headers: HashMap::new(),
            session_case: Some(SessionCase::Originating),
            body: None,
        }
    }

    fn tsx(
        response: Option<SipResponse>,
    ) -> ProxyTsx<Arc<MemoryStore>, Arc<MockHss>, Arc<TokioTimerService>, Arc<RecordingTransport>> {
        ProxyTsx::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MockHss::new()),
            Arc::new(TokioTimerService::new()),
            Arc::new(RecordingTransport::new(response)),
            Arc::new(NullAcrReporter),
            Arc::new(AsChainTable::new()),
            Arc::new(NodeConfig::for_tests()),
        )
    }

    fn ifc_with_one_hop(as_uri: &str, handling: DefaultHandling) -> IfcConfiguration {
        IfcConfiguration {
            criteria: vec![FilterCriterion {
                priority: 1,
                profile_part: ProfilePartIndicator::Both,
                trigger: TriggerExpr::MethodEquals("INVITE".to_string()),
                as_uri: as_uri.to_string(),
                default_handling: handling,
                service_info: None,
            }],
            fallback_as_uri: None,
        }
    }

    #[tokio::test]
    async fn originating_request_with_no_matching_ifc_routes_terminating() {
        let tsx = tsx(None);
        let ifc = IfcConfiguration::default();
        let outcome = tsx.process(invite(), &ifc, true).await.unwrap();
        assert_eq!(outcome.response.status, 100);
    }

    #[tokio::test]
    async fn as_response_ends_the_chain() {
        let mut final_response = SipResponse::new(200, "OK");
        final_response = final_response.with_header("Contact", "sip:bob@4.4.4.4".to_string());
        let tsx = tsx(Some(final_response));
        let ifc = ifc_with_one_hop("sip:as1.home.net", DefaultHandling::SessionContinued);
        let outcome = tsx.process(invite(), &ifc, true).await.unwrap();
        assert_eq!(outcome.response.status, 100); // no remaining hops -> end-of-chain after the 200
    }

    #[tokio::test]
    async fn as_failure_response_continues_the_chain_walk() {
        // A non-success final response from an AS retargets and continues the walk
        // rather than ending the transaction; with no remaining hops the walk falls
        // through to end-of-chain routing, not the AS's own 404.
        let tsx = tsx(Some(SipResponse::new(404, "Not Found")));
        let ifc = ifc_with_one_hop("sip:as1.home.net", DefaultHandling::SessionContinued);
        let outcome = tsx.process(invite(), &ifc, true).await.unwrap();
        assert_eq!(outcome.response.status, 100);
    }

    #[tokio::test]
    async fn as_provisional_response_propagates_upstream() {
        let tsx = tsx(Some(SipResponse::new(180, "Ringing")));
        let ifc = ifc_with_one_hop("sip:as1.home.net", DefaultHandling::SessionContinued);
        let outcome = tsx.process(invite(), &ifc, true).await.unwrap();
        assert_eq!(outcome.response.status, 180);
    }

    #[tokio::test]
    async fn unreachable_as_with_session_terminated_returns_504() {
        let tsx = tsx(None); // RecordingTransport with no scripted response times out
        let ifc = ifc_with_one_hop("sip:as1.home.net", DefaultHandling::SessionTerminated);
        let outcome = tsx.process(invite(), &ifc, true).await.unwrap();
        assert_eq!(outcome.response.status, 504);
    }
}

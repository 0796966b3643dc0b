//! Registrar (spec §4.2): REGISTER handling, binding consolidation, and the
//! post-success action sequence.

use crate::acr::AcrReporter;
use crate::config::NodeConfig;
use crate::error::{CoreError, StoreError};
use crate::hss::{HssClient, RegistrationType};
use crate::ifc::{matching_ifcs, TriggerInput};
use crate::sip::{Method, SessionCase, SipRequest, SipResponse};
use crate::store::{Store, Table};
use crate::timer::TimerService;
use crate::transport::SipTransport;
use crate::types::{now, Aor, AorPair, Binding, Impu};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

const THIRD_PARTY_REGISTER_RETRY_BUDGET: u32 = 3;

pub struct Registrar<S, H, T, X> {
    store: S,
    hss: H,
    timers: T,
    transport: X,
    acr: Arc<dyn AcrReporter>,
    config: Arc<NodeConfig>,
}

/// Outcome of a REGISTER: the response to send, plus the before/after AoR snapshot so
/// a caller holding a `SubscriptionManager` handle can drive the matching NOTIFY
/// fan-out (spec §4.2 post-success action #3) -- this registrar has no handle on the
/// subscription manager by design, the same separation as `expire_bindings`.
pub struct RegisterOutcome {
    pub response: SipResponse,
    pub pair: AorPair,
}

/// One Contact entry from the request, already resolved to an absolute expiry.
struct ResolvedContact {
    contact_uri: String,
    expiry: Timestamp,
    instance_id: Option<String>,
    reg_id: Option<u32>,
    q_value: Option<u32>,
    remove_all: bool,
}

use crate::types::Timestamp;

impl<S, H, T, X> Registrar<S, H, T, X>
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
        config: Arc<NodeConfig>,
    ) -> Self {
        Registrar {
            store,
            hss,
            timers,
            transport,
            acr,
            config,
        }
    }

    fn clamp_expiry(&self, requested: Option<u32>) -> u32 {
        let requested = requested.unwrap_or(self.config.max_expires_seconds);
        requested.clamp(self.config.min_expires_seconds, self.config.max_expires_seconds)
    }

    fn resolve_contacts(&self, req: &SipRequest) -> Vec<ResolvedContact> {
        if req.contacts.len() == 1 && req.contacts[0].uri == "*" {
            return vec![ResolvedContact {
                contact_uri: "*".to_string(),
                expiry: 0,
                instance_id: None,
                reg_id: None,
                q_value: None,
                remove_all: true,
            }];
        }

        req.contacts
            .iter()
            .map(|contact| {
                let expiry_secs = contact
                    .expires
                    .or(req.expires_header)
                    .map(|v| if v == 0 { 0 } else { self.clamp_expiry(Some(v)) })
                    .unwrap_or_else(|| self.clamp_expiry(None));
                ResolvedContact {
                    contact_uri: contact.uri.clone(),
                    expiry: if expiry_secs == 0 { 0 } else { now() + expiry_secs as u64 },
                    instance_id: contact.instance_id.clone(),
                    reg_id: contact.reg_id,
                    q_value: contact.q.map(|q| (q * 1000.0) as u32),
                    remove_all: false,
                }
            })
            .collect()
    }

    fn apply_consolidation(&self, aor: &mut Aor, req: &SipRequest, resolved: &[ResolvedContact]) {
        if resolved.iter().any(|c| c.remove_all) {
            aor.bindings.clear();
            return;
        }
        for contact in resolved {
            let binding_id =
                Binding::derive_id(&contact.contact_uri, contact.instance_id.as_deref(), contact.reg_id);
            aor.bindings.retain(|b| b.binding_id != binding_id);
            if contact.expiry > 0 {
                aor.bindings.push(Binding {
                    binding_id,
                    contact_uri: contact.contact_uri.clone(),
                    call_id: req.call_id.clone(),
                    cseq: req.cseq,
                    path: req.route.clone(),
                    private_id: req
                        .p_preferred_identity
                        .clone()
                        .unwrap_or_else(|| req.from_uri.clone()),
                    expires: contact.expiry,
                    instance_id: contact.instance_id.clone(),
                    reg_id: contact.reg_id,
                    q_value: contact.q_value,
                    emergency: false,
                });
            }
        }
    }

    /// spec §4.2 contract: `on_register(req) → 200/4xx/5xx response + side effects`.
    #[instrument(skip_all, err, fields(impu = %impu, call_id = %req.call_id))]
    pub async fn on_register(
        &self,
        impu: &Impu,
        req: &SipRequest,
    ) -> Result<RegisterOutcome, CoreError> {
        if req.method != Method::Register {
            return Err(CoreError::MalformedRequest(
                "on_register called with non-REGISTER method".into(),
            ));
        }
        let resolved = self.resolve_contacts(req);

        let pair = self.cas_update_loop(impu, req, &resolved).await?;

        self.run_post_success_actions(impu, req, &pair).await;

        let response = self.build_response(&pair.current);
        Ok(RegisterOutcome { response, pair })
    }

    async fn cas_update_loop(
        &self,
        impu: &Impu,
        req: &SipRequest,
        resolved: &[ResolvedContact],
    ) -> Result<AorPair, CoreError> {
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.config.cas_retry_deadline_ms);

        loop {
            let entry = self.store.get(Table::Aor, impu).await?;
            let original: Aor = match &entry.data {
                Some(bytes) => serde_json::from_slice(bytes).map_err(StoreError::Serialization)?,
                None => Aor::default(),
            };
            let mut pair = AorPair::new(original);
            self.apply_consolidation(&mut pair.current, req, resolved);

            let bytes = serde_json::to_vec(&pair.current).map_err(StoreError::Serialization)?;
            let ttl = Duration::from_secs(self.config.aor_ttl_seconds());
            match self.store.set(Table::Aor, impu, bytes, entry.cas, ttl).await {
                Ok(()) => return Ok(pair),
                Err(StoreError::CasConflict(_)) if tokio::time::Instant::now() < deadline => {
                    tracing::debug!(impu = %impu, "DATA_CONTENTION on AoR write, retrying");
                    continue;
                }
                Err(other) => return Err(CoreError::Store(other)),
            }
        }
    }

    async fn run_post_success_actions(&self, impu: &Impu, req: &SipRequest, pair: &AorPair) {
        // 1. HSS REG/REREG (or DEREG if the AoR became empty) + cached scscf_uri.
        let reg_type = if pair.became_empty() {
            RegistrationType::Deregistration
        } else if pair.is_new_registration() {
            RegistrationType::Initial
        } else {
            RegistrationType::Reregistration
        };
        let impi = req
            .p_preferred_identity
            .clone()
            .unwrap_or_else(|| req.from_uri.clone());
        if let Err(err) = self
            .hss
            .update_registration_state(&impi, impu, reg_type, &self.config.scscf_uri)
            .await
        {
            tracing::warn!(impu = %impu, error = %err, "HSS registration-state update failed");
        }

        // 2. Third-party REGISTER for newly added/refreshed bindings — 200 OK is built
        // by the caller regardless of this step's outcome (spec §9 Open Question (a)).
        self.send_third_party_registers(&impi, impu, req, pair).await;

        // 3. NOTIFY active subscriptions with the new binding state. This registrar has
        // no handle on the subscription manager, so `on_register`'s caller is expected
        // to call `SubscriptionManager::notify_binding_change(impu, None)` after a
        // successful `on_register` (see `RegisterOutcome`); it owns the NOTIFY cseq and
        // no-ops cheaply when there are no active subscriptions.

        // 4. Per-AoR expiry timer at min(binding.expires). The callback only logs: it
        // cannot itself await `expire_bindings`/`notify_binding_change` because
        // `TimerService::schedule` takes a synchronous `FnOnce`. A production wiring
        // drives the actual sweep from this log line (or, better, has the timer carry
        // an async hook) by calling `Registrar::expire_bindings` and then
        // `SubscriptionManager::notify_binding_change` on the impu it names.
        if let Some(next_expiry) = pair.current.bindings.iter().map(|b| b.expires).min() {
            let at = now();
            let delay = Duration::from_secs(next_expiry.saturating_sub(at));
            let impu = impu.clone();
            self.timers
                .schedule(
                    delay,
                    Box::new(move || {
                        tracing::debug!(impu = %impu, "AoR binding expiry timer fired, awaiting sweep");
                    }),
                )
                .await;
        }
    }

    async fn send_third_party_registers(
        &self,
        impi: &crate::types::Impi,
        impu: &Impu,
        req: &SipRequest,
        pair: &AorPair,
    ) {
        let changed = pair.changed_or_new_binding_ids();
        if changed.is_empty() {
            return;
        }
        let ifc = match self.hss.get_registration_data(impi, impu).await {
            Ok(data) => data.ifc,
            Err(err) => {
                tracing::warn!(
                    impu = %impu,
                    error = %err,
                    "failed to fetch iFC for 3rd-party REGISTER, skipping"
                );
                return;
            }
        };
        let headers = std::collections::HashMap::new();
        let input = TriggerInput {
            method: "REGISTER",
            session_case: SessionCase::Originating,
            request_uri: impu,
            headers: &headers,
            sdp_lines: &[],
        };
        let hops = matching_ifcs(&ifc, &input, true);

        for hop in hops {
            let mut attempt = SipRequest {
                request_uri: hop.as_uri.clone(),
                ..req.clone()
            };
            attempt.route = vec![hop.as_uri.clone()];

            let mut attempts_left = THIRD_PARTY_REGISTER_RETRY_BUDGET;
            loop {
                match self.transport.send(attempt.clone()).await {
                    Ok(()) => break,
                    Err(err) if attempts_left > 1 => {
                        attempts_left -= 1;
                        tracing::debug!(as_uri = %hop.as_uri, error = %err, "3rd-party REGISTER retry");
                    }
                    Err(err) => {
                        tracing::warn!(
                            as_uri = %hop.as_uri,
                            error = %err,
                            "3rd-party REGISTER abandoned past retry budget"
                        );
                        break;
                    }
                }
            }
        }

        self.acr
            .report(crate::acr::AcrRecord {
                event: crate::acr::AcrEvent::Interim,
                call_id: req.call_id.clone(),
                served_user: impu.clone(),
            })
            .await;
    }

    fn build_response(&self, aor: &Aor) -> SipResponse {
        let mut response = SipResponse::new(200, "OK");
        for binding in &aor.bindings {
            let remaining = binding.expires.saturating_sub(now());
            response = response.with_header(
                "Contact",
                format!("<{}>;expires={}", binding.contact_uri, remaining),
            );
        }
        response = response.with_header("Service-Route", self.config.scscf_uri.clone());
        for uri in &aor.associated_uris {
            response = response.with_header("P-Associated-URI", uri.clone());
        }
        response
    }

    /// Removes a single binding (spec §4.8, `scscfproxytsx.h` `430 Flow Failed`
    /// handling): re-enters the CAS loop but only drops `binding_id`, not the AoR.
    #[instrument(skip_all, err, fields(impu = %impu, binding_id = %binding_id))]
    pub async fn remove_binding(&self, impu: &Impu, binding_id: &str) -> Result<(), CoreError> {
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.config.cas_retry_deadline_ms);
        loop {
            let entry = self.store.get(Table::Aor, impu).await?;
            let mut aor: Aor = match &entry.data {
                Some(bytes) => serde_json::from_slice(bytes).map_err(StoreError::Serialization)?,
                None => return Ok(()),
            };
            aor.bindings.retain(|b| b.binding_id != binding_id);
            let bytes = serde_json::to_vec(&aor).map_err(StoreError::Serialization)?;
            let ttl = Duration::from_secs(self.config.aor_ttl_seconds());
            match self.store.set(Table::Aor, impu, bytes, entry.cas, ttl).await {
                Ok(()) => return Ok(()),
                Err(StoreError::CasConflict(_)) if tokio::time::Instant::now() < deadline => {
                    continue
                }
                Err(other) => return Err(CoreError::Store(other)),
            }
        }
    }

    /// Drops every binding whose expiry has already passed (spec §4.2 binding expiry
    /// sweep, driven by the per-AoR timer scheduled in `run_post_success_actions`) and,
    /// if the AoR becomes empty, fires the matching HSS deregistration-on-timeout
    /// update. Returns the removed binding_ids so the caller can drive the matching
    /// subscription NOTIFYs (spec §4.3) — this registrar has no handle on the
    /// subscription manager by design, so that fan-out is the caller's job.
    #[instrument(skip_all, err, fields(impu = %impu))]
    pub async fn expire_bindings(&self, impu: &Impu) -> Result<Vec<String>, CoreError> {
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.config.cas_retry_deadline_ms);
        let (removed, became_empty, impi) = loop {
            let entry = self.store.get(Table::Aor, impu).await?;
            let mut aor: Aor = match &entry.data {
                Some(bytes) => serde_json::from_slice(bytes).map_err(StoreError::Serialization)?,
                None => return Ok(Vec::new()),
            };
            let at = now();
            let mut removed = Vec::new();
            let mut impi = None;
            aor.bindings.retain(|b| {
                if b.expires <= at {
                    removed.push(b.binding_id.clone());
                    impi.get_or_insert_with(|| b.private_id.clone());
                    false
                } else {
                    true
                }
            });
            if removed.is_empty() {
                return Ok(Vec::new());
            }
            let became_empty = aor.bindings.is_empty();
            let bytes = serde_json::to_vec(&aor).map_err(StoreError::Serialization)?;
            let ttl = Duration::from_secs(self.config.aor_ttl_seconds());
            match self.store.set(Table::Aor, impu, bytes, entry.cas, ttl).await {
                Ok(()) => break (removed, became_empty, impi),
                Err(StoreError::CasConflict(_)) if tokio::time::Instant::now() < deadline => {
                    continue
                }
                Err(other) => return Err(CoreError::Store(other)),
            }
        };

        if became_empty {
            if let Some(impi) = impi {
                if let Err(err) = self
                    .hss
                    .update_registration_state(
                        &impi,
                        impu,
                        RegistrationType::Deregistration,
                        &self.config.scscf_uri,
                    )
                    .await
                {
                    tracing::warn!(impu = %impu, error = %err, "HSS deregistration-on-timeout update failed");
                }
            }
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acr::NullAcrReporter;
    use crate::hss::mock::MockHss;
    use crate::sip::Contact;
    use crate::store::memory::MemoryStore;
    use crate::timer::TokioTimerService;
    use crate::transport::mock::RecordingTransport;
    use std::collections::HashMap;

    fn base_request() -> SipRequest {
        SipRequest {
            method: Method::Register,
            request_uri: "sip:home.net".to_string(),
            from_uri: "sip:alice@home.net".to_string(),
            from_tag: Some("tag1".to_string()),
            to_uri: "sip:alice@home.net".to_string(),
            to_tag: None,
            call_id: "call-1".to_string(),
            cseq: 1,
            p_asserted_identity: None,
            p_preferred_identity: Some("sip:alice@home.net".to_string()),
            authorization: None,
            proxy_authorization: None,
            contacts: vec![Contact {
                uri: "sip:alice@1.2.3.4".to_string(),
                expires: Some(3600),
                instance_id: None,
                reg_id: None,
                q: None,
            }],
            expires_header: None,
            event_package: None,
            route: vec![],
            integrity_protected: Default::default(),
            headers: HashMap::new(),
            session_case: None,
            body: None,
        }
    }

    fn registrar() -> Registrar<
        Arc<MemoryStore>,
        Arc<MockHss>,
        Arc<TokioTimerService>,
        Arc<RecordingTransport>,
    > {
        Registrar::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MockHss::new()),
            Arc::new(TokioTimerService::new()),
            Arc::new(RecordingTransport::new(None)),
            Arc::new(NullAcrReporter),
            Arc::new(NodeConfig::for_tests()),
        )
    }

    #[tokio::test]
    async fn first_registration_returns_200_with_contact() {
        let registrar = registrar();
        let impu = "sip:alice@home.net".to_string();
        let outcome = registrar.on_register(&impu, &base_request()).await.unwrap();
        assert_eq!(outcome.response.status, 200);
        assert!(outcome
            .response
            .headers
            .iter()
            .any(|(k, v)| k == "Contact" && v.contains("1.2.3.4")));
        assert!(outcome.pair.is_new_registration());
    }

    #[tokio::test]
    async fn star_deregistration_clears_all_bindings() {
        let registrar = registrar();
        let impu = "sip:alice@home.net".to_string();
        registrar.on_register(&impu, &base_request()).await.unwrap();

        let mut dereg = base_request();
        dereg.cseq = 2;
        dereg.contacts = vec![Contact {
            uri: "*".to_string(),
            expires: Some(0),
            instance_id: None,
            reg_id: None,
            q: None,
        }];
        let outcome = registrar.on_register(&impu, &dereg).await.unwrap();
        assert_eq!(outcome.response.status, 200);
        assert!(!outcome.response.headers.iter().any(|(k, _)| k == "Contact"));
        assert!(outcome.pair.became_empty());
    }

    #[tokio::test]
    async fn third_party_register_uses_ifc_from_hss_registration_data() {
        use crate::types::{
            DefaultHandling, FilterCriterion, IfcConfiguration, ProfilePartIndicator, TriggerExpr,
        };

        let store = Arc::new(MemoryStore::new());
        let hss = Arc::new(MockHss::new());
        hss.registration.insert(
            "sip:alice@home.net".to_string(),
            crate::hss::RegistrationData {
                associated_uris: vec![],
                ifc: IfcConfiguration {
                    criteria: vec![FilterCriterion {
                        priority: 1,
                        profile_part: ProfilePartIndicator::Both,
                        trigger: TriggerExpr::MethodEquals("REGISTER".to_string()),
                        as_uri: "sip:as1.home.net".to_string(),
                        default_handling: DefaultHandling::SessionContinued,
                        service_info: None,
                    }],
                    fallback_as_uri: None,
                },
                scscf_uri: None,
            },
        );
        let transport = Arc::new(RecordingTransport::new(None));
        let registrar = Registrar::new(
            store,
            hss,
            Arc::new(TokioTimerService::new()),
            transport.clone(),
            Arc::new(NullAcrReporter),
            Arc::new(NodeConfig::for_tests()),
        );

        let impu = "sip:alice@home.net".to_string();
        registrar.on_register(&impu, &base_request()).await.unwrap();

        let sent = transport.sent.lock().unwrap();
        assert!(sent.iter().any(|r| r.request_uri == "sip:as1.home.net"));
    }
}

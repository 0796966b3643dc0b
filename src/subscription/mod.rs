//! Subscription manager (spec §4.3): reg-event SUBSCRIBE/NOTIFY dialogs.

use crate::config::NodeConfig;
use crate::error::{CoreError, StoreError};
use crate::sip::{Method, SipRequest, SipResponse};
use crate::store::{Store, Table};
use crate::transport::SipTransport;
use crate::types::{now, Aor, Impu, NotifyTerminationReason, Subscription};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

pub struct SubscriptionManager<S, X> {
    store: S,
    transport: X,
    config: Arc<NodeConfig>,
}

impl<S, X> SubscriptionManager<S, X>
where
    S: Store,
    X: SipTransport,
{
    pub fn new(store: S, transport: X, config: Arc<NodeConfig>) -> Self {
        SubscriptionManager {
            store,
            transport,
            config,
        }
    }

    fn clamp_expiry(&self, requested: Option<u32>) -> u32 {
        let requested = requested.unwrap_or(self.config.max_sub_expires_seconds);
        requested.clamp(
            self.config.min_sub_expires_seconds,
            self.config.max_sub_expires_seconds,
        )
    }

    /// spec §4.8 `subscriptiontsx.h`: disambiguate a re-SUBSCRIBE from a fresh dialog
    /// by `(call_id, from_tag)` before deciding whether to refresh or install.
    fn find_existing<'a>(&self, aor: &'a Aor, call_id: &str, from_tag: &str) -> Option<usize> {
        aor.subscriptions
            .iter()
            .position(|s| s.matches_dialog(call_id, from_tag))
    }

    /// spec §4.3 contract: `on_subscribe(req) → 200 + NOTIFY | 4xx`.
    #[instrument(skip_all, err, fields(impu = %impu, call_id = %req.call_id))]
    pub async fn on_subscribe(
        &self,
        impu: &Impu,
        req: &SipRequest,
    ) -> Result<SipResponse, CoreError> {
        if req.method != Method::Subscribe {
            return Err(CoreError::MalformedRequest(
                "on_subscribe called with non-SUBSCRIBE method".into(),
            ));
        }
        if req.event_package.as_deref() != Some("reg") {
            return Err(CoreError::MalformedRequest(
                "subscription manager only handles the reg-event package".into(),
            ));
        }
        let from_tag = req
            .from_tag
            .clone()
            .ok_or_else(|| CoreError::MalformedRequest("SUBSCRIBE missing From tag".into()))?;

        let requested_expiry = self.clamp_expiry(req.expires_header);
        let removing = req.expires_header == Some(0);

        let (aor, removed) = self
            .cas_update_subscription(impu, req, &from_tag, requested_expiry, removing)
            .await?;

        if removed {
            self.send_notify(
                impu,
                &aor,
                req,
                Some(NotifyTerminationReason::Deactivated),
            )
            .await;
        } else {
            self.send_notify(impu, &aor, req, None).await;
        }

        let mut response = SipResponse::new(200, "OK");
        response = response.with_header("Expires", requested_expiry.to_string());
        Ok(response)
    }

    async fn cas_update_subscription(
        &self,
        impu: &Impu,
        req: &SipRequest,
        from_tag: &str,
        expiry_seconds: u32,
        removing: bool,
    ) -> Result<(Aor, bool), CoreError> {
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.config.cas_retry_deadline_ms);
        loop {
            let entry = self.store.get(Table::Aor, impu).await?;
            let mut aor: Aor = match &entry.data {
                Some(bytes) => serde_json::from_slice(bytes).map_err(StoreError::Serialization)?,
                None => Aor::default(),
            };

            let existing_idx = self.find_existing(&aor, &req.call_id, from_tag);
            let removed = if removing {
                if let Some(idx) = existing_idx {
                    aor.subscriptions.remove(idx);
                }
                true
            } else {
                let record = Subscription {
                    to_tag: req.to_tag.clone().unwrap_or_default(),
                    from_tag: from_tag.to_string(),
                    call_id: req.call_id.clone(),
                    cseq: req.cseq,
                    contact: req.contacts.first().map(|c| c.uri.clone()).unwrap_or_default(),
                    route_set: req.route.clone(),
                    expires: now() + expiry_seconds as u64,
                    requesting_impu: req.from_uri.clone(),
                    subscriber_impu: impu.clone(),
                };
                match existing_idx {
                    Some(idx) => aor.subscriptions[idx] = record,
                    None => aor.subscriptions.push(record),
                }
                false
            };

            aor.next_notify_cseq();
            let bytes = serde_json::to_vec(&aor).map_err(StoreError::Serialization)?;
            let ttl = Duration::from_secs(self.config.aor_ttl_seconds());
            match self.store.set(Table::Aor, impu, bytes, entry.cas, ttl).await {
                Ok(()) => return Ok((aor, removed)),
                Err(StoreError::CasConflict(_)) if tokio::time::Instant::now() < deadline => {
                    continue
                }
                Err(other) => return Err(CoreError::Store(other)),
            }
        }
    }

    /// Registrar-driven AoR mutations call this directly to push a NOTIFY reflecting
    /// the new binding state, reusing the same cseq-bump-under-CAS path.
    pub async fn notify_binding_change(
        &self,
        impu: &Impu,
        terminal: Option<NotifyTerminationReason>,
    ) -> Result<(), CoreError> {
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.config.cas_retry_deadline_ms);
        loop {
            let entry = self.store.get(Table::Aor, impu).await?;
            let Some(bytes) = &entry.data else { return Ok(()) };
            let mut aor: Aor = serde_json::from_slice(bytes).map_err(StoreError::Serialization)?;
            if aor.subscriptions.is_empty() {
                return Ok(());
            }
            aor.next_notify_cseq();
            let bytes = serde_json::to_vec(&aor).map_err(StoreError::Serialization)?;
            let ttl = Duration::from_secs(self.config.aor_ttl_seconds());
            match self.store.set(Table::Aor, impu, bytes.clone(), entry.cas, ttl).await {
                Ok(()) => {
                    let aor: Aor = serde_json::from_slice(&bytes).map_err(StoreError::Serialization)?;
                    self.send_notify_all(impu, &aor, terminal).await;
                    return Ok(());
                }
                Err(StoreError::CasConflict(_)) if tokio::time::Instant::now() < deadline => {
                    continue
                }
                Err(other) => return Err(CoreError::Store(other)),
            }
        }
    }

    async fn send_notify(
        &self,
        impu: &Impu,
        aor: &Aor,
        req: &SipRequest,
        terminal: Option<NotifyTerminationReason>,
    ) {
        let notify = self.build_notify(impu, aor, req.call_id.clone(), aor.notify_cseq, terminal);
        if let Err(err) = self.transport.send(notify).await {
            tracing::warn!(impu = %impu, error = %err, "failed to deliver NOTIFY");
        }
    }

    async fn send_notify_all(&self, impu: &Impu, aor: &Aor, terminal: Option<NotifyTerminationReason>) {
        for sub in &aor.subscriptions {
            let notify = self.build_notify(impu, aor, sub.call_id.clone(), aor.notify_cseq, terminal);
            if let Err(err) = self.transport.send(notify).await {
                tracing::warn!(impu = %impu, error = %err, "failed to deliver NOTIFY");
            }
        }
    }

    fn build_notify(
        &self,
        impu: &Impu,
        aor: &Aor,
        call_id: String,
        cseq: u32,
        terminal: Option<NotifyTerminationReason>,
    ) -> SipRequest {
        let mut headers = std::collections::HashMap::new();
        headers.insert(
            "Subscription-State".to_string(),
            match terminal {
                Some(NotifyTerminationReason::Deactivated) => {
                    "terminated;reason=deactivated".to_string()
                }
                Some(NotifyTerminationReason::Timeout) => "terminated;reason=timeout".to_string(),
                None => "active".to_string(),
            },
        );
        let body = aor
            .bindings
            .iter()
            .map(|b| b.contact_uri.clone())
            .collect::<Vec<_>>()
            .join(",");

        SipRequest {
            method: Method::Notify,
            request_uri: impu.clone(),
            from_uri: impu.clone(),
            from_tag: None,
            to_uri: impu.clone(),
            to_tag: None,
            call_id,
            cseq,
            p_asserted_identity: None,
            p_preferred_identity: None,
            authorization: None,
            proxy_authorization: None,
            contacts: vec![],
            expires_header: None,
            event_package: Some("reg".to_string()),
            route: vec![],
            integrity_protected: Default::default(),
            headers,
            session_case: None,
            body: Some(body),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::Contact;
    use crate::store::memory::MemoryStore;
    use crate::transport::mock::RecordingTransport;
    use std::collections::HashMap;

    fn subscribe_request() -> SipRequest {
        SipRequest {
            method: Method::Subscribe,
            request_uri: "sip:alice@home.net".to_string(),
            from_uri: "sip:alice@home.net".to_string(),
            from_tag: Some("ftag".to_string()),
            to_uri: "sip:alice@home.net".to_string(),
            to_tag: None,
            call_id: "call-sub-1".to_string(),
            cseq: 1,
            p_asserted_identity: None,
            p_preferred_identity: None,
            authorization: None,
            proxy_authorization: None,
            contacts: vec![Contact {
                uri: "sip:alice@9.9.9.9".to_string(),
                expires: None,
                instance_id: None,
                reg_id: None,
                q: None,
            }],
            expires_header: Some(3600),
            event_package: Some("reg".to_string()),
            route: vec![],
            integrity_protected: Default::default(),
            headers: HashMap::new(),
            session_case: None,
            body: None,
        }
    }

    fn manager() -> SubscriptionManager<Arc<MemoryStore>, Arc<RecordingTransport>> {
        SubscriptionManager::new(
            Arc::new(MemoryStore::new()),
            Arc::new(RecordingTransport::new(None)),
            Arc::new(NodeConfig::for_tests()),
        )
    }

    #[tokio::test]
    async fn first_subscribe_installs_and_sends_notify() {
        let manager = manager();
        let impu = "sip:alice@home.net".to_string();
        let response = manager.on_subscribe(&impu, &subscribe_request()).await.unwrap();
        assert_eq!(response.status, 200);

        let entry = manager.store.get(Table::Aor, &impu).await.unwrap();
        let aor: Aor = serde_json::from_slice(&entry.data.unwrap()).unwrap();
        assert_eq!(aor.subscriptions.len(), 1);
    }

    #[tokio::test]
    async fn resubscribe_on_same_dialog_refreshes_not_duplicates() {
        let manager = manager();
        let impu = "sip:alice@home.net".to_string();
        manager.on_subscribe(&impu, &subscribe_request()).await.unwrap();

        let mut refresh = subscribe_request();
        refresh.cseq = 2;
        manager.on_subscribe(&impu, &refresh).await.unwrap();

        let entry = manager.store.get(Table::Aor, &impu).await.unwrap();
        let aor: Aor = serde_json::from_slice(&entry.data.unwrap()).unwrap();
        assert_eq!(aor.subscriptions.len(), 1);
        assert_eq!(aor.subscriptions[0].cseq, 2);
    }

    #[tokio::test]
    async fn expires_zero_removes_subscription() {
        let manager = manager();
        let impu = "sip:alice@home.net".to_string();
        manager.on_subscribe(&impu, &subscribe_request()).await.unwrap();

        let mut unsub = subscribe_request();
        unsub.cseq = 2;
        unsub.expires_header = Some(0);
        manager.on_subscribe(&impu, &unsub).await.unwrap();

        let entry = manager.store.get(Table::Aor, &impu).await.unwrap();
        let aor: Aor = serde_json::from_slice(&entry.data.unwrap()).unwrap();
        assert!(aor.subscriptions.is_empty());
    }

    #[tokio::test]
    async fn notify_cseq_is_aor_owned_and_monotonic_across_resubscribes() {
        // Two re-SUBSCRIBEs carrying the same client CSeq must still produce strictly
        // increasing NOTIFY cseqs, since the NOTIFY cseq belongs to the AoR, not to the
        // client's dialog CSeq.
        let manager = manager();
        let impu = "sip:alice@home.net".to_string();
        manager.on_subscribe(&impu, &subscribe_request()).await.unwrap();
        let first = {
            let entry = manager.store.get(Table::Aor, &impu).await.unwrap();
            let aor: Aor = serde_json::from_slice(&entry.data.unwrap()).unwrap();
            aor.notify_cseq
        };

        let mut refresh = subscribe_request();
        refresh.cseq = 1; // same client CSeq as the initial SUBSCRIBE
        manager.on_subscribe(&impu, &refresh).await.unwrap();
        let second = {
            let entry = manager.store.get(Table::Aor, &impu).await.unwrap();
            let aor: Aor = serde_json::from_slice(&entry.data.unwrap()).unwrap();
            aor.notify_cseq
        };

        assert!(second > first);
    }
}

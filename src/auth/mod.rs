//! Digest/AKA authentication engine (spec §4.1).
//!
//! Mirrors the teacher's `facilitator_local.rs` shape: small `assert_*`-style helpers
//! returning `Result<_, CoreError>`, composed by the public `challenge`/`verify`
//! entry points, each wrapped in `#[instrument(skip_all, err)]` for span correlation.
//!
//! Replication to remote AV stores and read fallback on absence (spec §4.1, §9) are
//! not implemented here: they live inside the `Store` the engine is generic over
//! (`Store::set`/`get`), so this module just calls the abstraction and logs whether a
//! replicated backend is even configured.

use crate::config::NodeConfig;
use crate::error::{CoreError, HssError, StoreError};
use crate::hss::HssClient;
use crate::sip::{AuthScheme, AuthorizationHeader, IntegrityProtection, SipRequest};
use crate::store::{Store, StoreEntry, Table};
use crate::timer::{TimerId, TimerService};
use crate::types::{
    now, AuthChallenge, AuthChallengeState, AuthVector, Impi, Timestamp, INITIAL_NONCE_COUNT,
};
use md5::{Digest as _, Md5};
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::instrument;

/// Outcome of [`AuthenticationEngine::verify`] (spec §4.1 contract).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Authenticated(Impi),
    Stale,
    Failed,
}

/// Bits of `non_register_auth_mode` (spec §4.7 config field, §4.1 "when to challenge").
#[derive(Debug, Clone, Copy, Default)]
pub struct NonRegisterAuthMode {
    pub if_proxy_authorization_present: bool,
    pub always: bool,
    pub initial: bool,
}

pub struct AuthenticationEngine<S, H, T> {
    store: S,
    hss: H,
    timers: T,
    config: Arc<NodeConfig>,
}

fn challenge_key(impi: &str, nonce: &str) -> String {
    format!("{impi}|{nonce}")
}

fn random_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn digest_response(ha1: &str, method: &str, uri: &str, nonce: &str) -> String {
    let mut ha2 = Md5::new();
    ha2.update(format!("{method}:{uri}"));
    let ha2 = hex::encode(ha2.finalize());

    let mut resp = Md5::new();
    resp.update(format!("{ha1}:{nonce}:{ha2}"));
    hex::encode(resp.finalize())
}

impl<S, H, T> AuthenticationEngine<S, H, T>
where
    S: Store,
    H: HssClient,
    T: TimerService,
{
    pub fn new(store: S, hss: H, timers: T, config: Arc<NodeConfig>) -> Self {
        AuthenticationEngine {
            store,
            hss,
            timers,
            config,
        }
    }

    /// spec §4.1 "When to challenge": integrity-protected requests never need a fresh
    /// challenge (supplemented from `original_source/include/authenticationmiddleware.h`,
    /// see SPEC_FULL.md §4.8).
    pub fn should_challenge(&self, req: &SipRequest, is_register: bool) -> bool {
        if req.integrity_protected != IntegrityProtection::None {
            return false;
        }
        if is_register {
            return true;
        }
        let mode = &self.config.non_register_auth_mode;
        mode.always
            || (mode.if_proxy_authorization_present && req.proxy_authorization.is_some())
            || mode.initial
    }

    /// Issues a fresh challenge and returns the nonce plus the vector it was built
    /// from, for the caller to render into a `WWW-Authenticate`/`Proxy-Authenticate`
    /// header.
    #[instrument(skip_all, err, fields(impi = %impi))]
    pub async fn challenge(&self, impi: &Impi) -> Result<(String, AuthVector), CoreError> {
        let vector = self
            .hss
            .get_auth_vector(impi, "SIP Digest")
            .await
            .map_err(CoreError::Hss)?;
        let nonce = random_nonce();
        let ttl_secs = self.config.nonce_ttl_seconds();
        let record = AuthChallenge {
            impi: impi.clone(),
            nonce: nonce.clone(),
            vector: vector.clone(),
            nonce_count: INITIAL_NONCE_COUNT,
            nonce_count_supported: true,
            correlator: random_nonce(),
            scscf_uri: self.config.scscf_uri.clone(),
            expires: now() + ttl_secs,
            state: AuthChallengeState::Issued,
        };

        let key = challenge_key(impi, &nonce);
        let bytes = serde_json::to_vec(&record).map_err(StoreError::Serialization)?;
        if !self.store.has_servers() {
            tracing::debug!(impi = %impi, "no remote AV stores configured, challenge is single-node");
        }
        match self
            .store
            .set(Table::AuthVector, &key, bytes, 0, Duration::from_secs(ttl_secs))
            .await
        {
            Ok(()) => {}
            Err(StoreError::CasConflict(_)) => {
                // Nonce collision is astronomically unlikely with 128 bits of entropy;
                // treat it as a transient failure rather than retrying with the same key.
                return Err(CoreError::Internal(
                    "nonce collision issuing challenge".into(),
                ));
            }
            Err(other) => return Err(CoreError::Store(other)),
        }

        let timers_callback_key = key.clone();
        self.timers
            .schedule(
                Duration::from_secs(ttl_secs),
                Box::new(move || {
                    tracing::debug!(key = %timers_callback_key, "auth challenge expiry timer armed (handled out-of-band)");
                }),
            )
            .await;

        Ok((nonce, vector))
    }

    /// spec §4.1 "Verification": read the stored challenge, recompute the expected
    /// digest, compare in constant time, bump `nonce_count` under CAS.
    #[instrument(skip_all, err, fields(impi = %auth.username))]
    pub async fn verify(
        &self,
        auth: &AuthorizationHeader,
        method: &str,
    ) -> Result<VerifyOutcome, CoreError> {
        let key = challenge_key(&auth.username, &auth.nonce);
        let entry = self.store.get(Table::AuthVector, &key).await?;
        let Some(record) = self.load_challenge(&entry)? else {
            return Ok(VerifyOutcome::Failed);
        };

        let at = now();
        if record.is_expired(at) || record.state == AuthChallengeState::Expired {
            return Ok(VerifyOutcome::Stale);
        }
        if !record.nonce_count_supported && record.state == AuthChallengeState::Consumed {
            return Ok(VerifyOutcome::Stale);
        }

        let expected = match &record.vector {
            AuthVector::Digest { ha1, .. } => {
                digest_response(ha1, method, &auth.uri, &auth.nonce)
            }
            AuthVector::Aka { xres, .. } => xres.clone(),
        };

        let matches: bool = expected.as_bytes().ct_eq(auth.response.as_bytes()).into();
        if !matches {
            return Ok(VerifyOutcome::Failed);
        }

        self.consume(&key, entry.cas, record).await?;
        Ok(VerifyOutcome::Authenticated(auth.username.clone()))
    }

    fn load_challenge(&self, entry: &StoreEntry) -> Result<Option<AuthChallenge>, CoreError> {
        match &entry.data {
            None => Ok(None),
            Some(bytes) => {
                let record: AuthChallenge =
                    serde_json::from_slice(bytes).map_err(StoreError::Serialization)?;
                Ok(Some(record))
            }
        }
    }

    async fn consume(
        &self,
        key: &str,
        cas: u64,
        mut record: AuthChallenge,
    ) -> Result<(), CoreError> {
        record.nonce_count += 1;
        record.state = if record.nonce_count_supported {
            AuthChallengeState::Issued
        } else {
            AuthChallengeState::Consumed
        };
        // Preserve the challenge's own expiry rather than granting a fresh window: a
        // consumed/re-issued nonce is never entitled to live longer than `expires`.
        let remaining = Duration::from_secs(record.expires.saturating_sub(now()).max(1));
        let bytes = serde_json::to_vec(&record).map_err(StoreError::Serialization)?;
        self.store
            .set(Table::AuthVector, key, bytes, cas, remaining)
            .await
            .map_err(CoreError::Store)
    }

    /// spec §4.1 "Timeout path": fired by an external timer at challenge expiry.
    /// Idempotent under redelivery — a consumed challenge is a no-op.
    #[instrument(skip_all, err, fields(impi = %impi, nonce = %nonce))]
    pub async fn handle_challenge_timeout(
        &self,
        impi: &Impi,
        nonce: &str,
    ) -> Result<(), CoreError> {
        let key = challenge_key(impi, nonce);
        let entry = self.store.get(Table::AuthVector, &key).await?;
        let Some(mut record) = self.load_challenge(&entry)? else {
            return Ok(());
        };
        if record.nonce_count != INITIAL_NONCE_COUNT || record.state != AuthChallengeState::Issued
        {
            return Ok(());
        }

        self.hss
            .update_registration_state(
                impi,
                impi,
                crate::hss::RegistrationType::Deregistration,
                &self.config.scscf_uri,
            )
            .await
            .map_err(|err| match err {
                HssError::UserUnknown(_) => CoreError::Internal(
                    "HSS reported user unknown while signalling AUTHENTICATION_TIMEOUT".into(),
                ),
                other => CoreError::Hss(other),
            })?;

        record.state = AuthChallengeState::Expired;
        let bytes = serde_json::to_vec(&record).map_err(StoreError::Serialization)?;
        // Keep the tombstone around briefly so a retransmitted/raced verify sees
        // `Expired` rather than a tombstone that vanished and reads as never-issued.
        let ttl = Duration::from_secs(self.config.nonce_ttl_slack_seconds.max(1));
        self.store
            .set(Table::AuthVector, &key, bytes, entry.cas, ttl)
            .await
            .map_err(CoreError::Store)
    }

    pub async fn cancel_timer(&self, id: TimerId) {
        self.timers.cancel(id).await;
    }
}

pub fn scheme_for(auth: &AuthorizationHeader) -> AuthScheme {
    auth.scheme
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::hss::mock::MockHss;
    use crate::sip::AuthScheme;
    use crate::store::memory::MemoryStore;
    use crate::timer::TokioTimerService;
    use crate::types::AuthVector;

    fn engine() -> AuthenticationEngine<Arc<MemoryStore>, Arc<MockHss>, Arc<TokioTimerService>> {
        let hss = Arc::new(MockHss::new());
        hss.vectors.insert(
            "alice@home.net".to_string(),
            AuthVector::Digest {
                ha1: "deadbeefcafebabe0011223344556677".to_string(),
                qop: "auth".to_string(),
                realm: "home.net".to_string(),
            },
        );
        AuthenticationEngine::new(
            Arc::new(MemoryStore::new()),
            hss,
            Arc::new(TokioTimerService::new()),
            Arc::new(NodeConfig::for_tests()),
        )
    }

    #[tokio::test]
    async fn challenge_then_correct_response_authenticates() {
        let engine = engine();
        let impi = "alice@home.net".to_string();
        let (nonce, vector) = engine.challenge(&impi).await.unwrap();
        let ha1 = match vector {
            AuthVector::Digest { ha1, .. } => ha1,
            _ => unreachable!(),
        };
        let response = digest_response(&ha1, "REGISTER", "sip:home.net", &nonce);

        let auth = AuthorizationHeader {
            username: impi,
            realm: "home.net".to_string(),
            nonce,
            uri: "sip:home.net".to_string(),
            response,
            qop: Some("auth".to_string()),
            nonce_count: Some("00000001".to_string()),
            cnonce: Some("xyz".to_string()),
            scheme: AuthScheme::Digest,
        };
        let outcome = engine.verify(&auth, "REGISTER").await.unwrap();
        assert_eq!(outcome, VerifyOutcome::Authenticated("alice@home.net".to_string()));
    }

    #[tokio::test]
    async fn wrong_response_fails() {
        let engine = engine();
        let impi = "alice@home.net".to_string();
        let (nonce, _) = engine.challenge(&impi).await.unwrap();

        let auth = AuthorizationHeader {
            username: impi,
            realm: "home.net".to_string(),
            nonce,
            uri: "sip:home.net".to_string(),
            response: "0000000000000000000000000000000".to_string(),
            qop: Some("auth".to_string()),
            nonce_count: Some("00000001".to_string()),
            cnonce: Some("xyz".to_string()),
            scheme: AuthScheme::Digest,
        };
        let outcome = engine.verify(&auth, "REGISTER").await.unwrap();
        assert_eq!(outcome, VerifyOutcome::Failed);
    }

    #[tokio::test]
    async fn challenge_replicates_to_remote_av_store_and_verify_falls_back() {
        let hss = Arc::new(MockHss::new());
        hss.vectors.insert(
            "alice@home.net".to_string(),
            AuthVector::Digest {
                ha1: "deadbeefcafebabe0011223344556677".to_string(),
                qop: "auth".to_string(),
                realm: "home.net".to_string(),
            },
        );
        let remote = Arc::new(MemoryStore::new());
        let local = Arc::new(MemoryStore::with_peers(vec![remote.clone()]));
        let engine = AuthenticationEngine::new(
            local.clone(),
            hss,
            Arc::new(TokioTimerService::new()),
            Arc::new(NodeConfig::for_tests()),
        );

        let impi = "alice@home.net".to_string();
        let (nonce, _) = engine.challenge(&impi).await.unwrap();

        let key = format!("{impi}|{nonce}");
        let on_remote = remote.get(Table::AuthVector, &key).await.unwrap();
        assert!(on_remote.data.is_some(), "challenge must replicate to the remote AV store");

        // Dropping the local copy forces verify's read through Store::get to fall
        // back to the remote replica rather than treating the nonce as never-issued.
        let local_entry = local.get(Table::AuthVector, &key).await.unwrap();
        local.delete(Table::AuthVector, &key, local_entry.cas).await.unwrap();

        let ha1 = "deadbeefcafebabe0011223344556677";
        let response = digest_response(ha1, "REGISTER", "sip:home.net", &nonce);
        let auth = AuthorizationHeader {
            username: impi,
            realm: "home.net".to_string(),
            nonce,
            uri: "sip:home.net".to_string(),
            response,
            qop: Some("auth".to_string()),
            nonce_count: Some("00000001".to_string()),
            cnonce: Some("xyz".to_string()),
            scheme: AuthScheme::Digest,
        };
        let engine = AuthenticationEngine::new(
            local,
            Arc::new(MockHss::new()),
            Arc::new(TokioTimerService::new()),
            Arc::new(NodeConfig::for_tests()),
        );
        let outcome = engine.verify(&auth, "REGISTER").await.unwrap();
        assert_eq!(
            outcome,
            VerifyOutcome::Authenticated("alice@home.net".to_string())
        );
    }

    #[tokio::test]
    async fn unknown_nonce_fails() {
        let engine = engine();
        let auth = AuthorizationHeader {
            username: "alice@home.net".to_string(),
            realm: "home.net".to_string(),
            nonce: "never-issued".to_string(),
            uri: "sip:home.net".to_string(),
            response: "anything".to_string(),
            qop: None,
            nonce_count: None,
            cnonce: None,
            scheme: AuthScheme::Digest,
        };
        let outcome = engine.verify(&auth, "REGISTER").await.unwrap();
        assert_eq!(outcome, VerifyOutcome::Failed);
    }
}

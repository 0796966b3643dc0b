//! Core data model (spec §3): identities, bindings, subscriptions, the AoR, and the
//! filter-criteria / AS-chain types the Proxy-TSX walks.

use crate::sip::SessionCase;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

/// Absolute wall-clock time, seconds since epoch. Kept as a plain integer (rather than
/// `SystemTime`) so `AoR`/`AuthChallenge` records round-trip through the `Store`'s byte
/// representation without a clock-specific encoding.
pub type Timestamp = u64;

pub fn now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

/// Subscriber's authentication identity (IMPI). Not persisted here beyond challenges
/// and nonce counters (spec §3).
pub type Impi = String;

/// A SIP or tel: URI identifying one public identity (IMPU).
pub type Impu = String;

pub const INITIAL_NONCE_COUNT: u32 = 0;

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// Tagged variant replacing the source's `AuthenticationVector` inheritance hierarchy
/// (`DigestAv`/`AkaAv`) — see spec §9 Design notes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthVector {
    Digest {
        ha1: String,
        qop: String,
        realm: String,
    },
    Aka {
        cryptkey: String,
        integritykey: String,
        xres: String,
        akaversion: u8,
    },
}

impl AuthVector {
    pub fn default_akaversion() -> u8 {
        1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthChallengeState {
    Issued,
    Consumed,
    Expired,
}

/// An outstanding or recently-consumed authentication challenge, keyed by `(impi, nonce)`
/// in the AV store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthChallenge {
    pub impi: Impi,
    pub nonce: String,
    pub vector: AuthVector,
    pub nonce_count: u32,
    pub nonce_count_supported: bool,
    pub correlator: String,
    pub scscf_uri: String,
    pub expires: Timestamp,
    pub state: AuthChallengeState,
}

impl AuthChallenge {
    pub fn is_expired(&self, at: Timestamp) -> bool {
        at >= self.expires
    }
}

// ---------------------------------------------------------------------------
// Registrar
// ---------------------------------------------------------------------------

/// A single UE contact registration for an AoR (spec §3 `Binding`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Binding {
    pub binding_id: String,
    pub contact_uri: String,
    pub call_id: String,
    pub cseq: u32,
    pub path: Vec<String>,
    pub private_id: Impi,
    pub expires: Timestamp,
    pub instance_id: Option<String>,
    pub reg_id: Option<u32>,
    pub q_value: Option<u32>,
    pub emergency: bool,
}

impl Binding {
    pub fn is_expired(&self, at: Timestamp) -> bool {
        at >= self.expires
    }

    /// Deterministic binding id: prefer `+sip.instance` + `reg-id`, fall back to the
    /// contact URI (spec §4.2 binding consolidation).
    pub fn derive_id(contact_uri: &str, instance_id: Option<&str>, reg_id: Option<u32>) -> String {
        match (instance_id, reg_id) {
            (Some(instance), Some(reg_id)) => format!("{instance}:{reg_id}"),
            (Some(instance), None) => instance.to_string(),
            _ => contact_uri.to_string(),
        }
    }
}

/// A SIP SUBSCRIBE dialog targeting the reg-event package on an IMPU (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    pub to_tag: String,
    pub from_tag: String,
    pub call_id: String,
    pub cseq: u32,
    pub contact: String,
    pub route_set: Vec<String>,
    pub expires: Timestamp,
    pub requesting_impu: Impu,
    pub subscriber_impu: Impu,
}

impl Subscription {
    pub fn is_expired(&self, at: Timestamp) -> bool {
        at >= self.expires
    }

    pub fn matches_dialog(&self, call_id: &str, from_tag: &str) -> bool {
        self.call_id == call_id && self.from_tag == from_tag
    }
}

/// Why a NOTIFY carries `Subscription-State: terminated` (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyTerminationReason {
    Deactivated,
    Timeout,
}

/// Per-IMPU registration and subscription state, as owned by the AoR store (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Aor {
    pub bindings: Vec<Binding>,
    pub subscriptions: Vec<Subscription>,
    pub associated_uris: Vec<Impu>,
    pub scscf_uri: Option<String>,
    pub notify_cseq: u32,
}

impl Aor {
    pub fn is_empty_of_bindings(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn remove_expired(&mut self, at: Timestamp) -> Vec<Binding> {
        let (keep, expired): (Vec<_>, Vec<_>) =
            self.bindings.drain(..).partition(|b| !b.is_expired(at));
        self.bindings = keep;
        expired
    }

    pub fn next_notify_cseq(&mut self) -> u32 {
        self.notify_cseq += 1;
        self.notify_cseq
    }
}

/// Holds the AoR as read and the AoR being written; the registrar diffs the two to
/// decide NOTIFYs, 3rd-party REGISTERs, and HSS updates (spec §3 `AoRPair`).
#[derive(Debug, Clone)]
pub struct AorPair {
    pub original: Aor,
    pub current: Aor,
}

impl AorPair {
    pub fn new(original: Aor) -> Self {
        let current = original.clone();
        AorPair { original, current }
    }

    pub fn is_new_registration(&self) -> bool {
        self.original.is_empty_of_bindings() && !self.current.is_empty_of_bindings()
    }

    pub fn became_empty(&self) -> bool {
        !self.original.is_empty_of_bindings() && self.current.is_empty_of_bindings()
    }

    pub fn changed_or_new_binding_ids(&self) -> HashSet<&str> {
        let original_ids: HashMap<&str, &Binding> = self
            .original
            .bindings
            .iter()
            .map(|b| (b.binding_id.as_str(), b))
            .collect();
        self.current
            .bindings
            .iter()
            .filter(|b| {
                original_ids
                    .get(b.binding_id.as_str())
                    .is_none_or(|old| *old != *b)
            })
            .map(|b| b.binding_id.as_str())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Initial Filter Criteria
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfilePartIndicator {
    Registered,
    Unregistered,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DefaultHandling {
    SessionContinued,
    SessionTerminated,
}

/// Boolean trigger expression over SIP method, session case, SDP content, and
/// request-URI (spec §3 `FilterCriteria`). A tree of AND/OR/NOT over atoms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TriggerExpr {
    MethodEquals(String),
    SessionCaseEquals(SessionCaseTag),
    RequestUriMatches(String),
    HeaderPresent(String),
    HeaderEquals(String, String),
    SdpLineMatches(String),
    And(Vec<TriggerExpr>),
    Or(Vec<TriggerExpr>),
    Not(Box<TriggerExpr>),
}

/// Serializable mirror of [`SessionCase`] for use inside stored trigger expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionCaseTag {
    Originating,
    Terminating,
    OriginatingCdiv,
}

impl From<SessionCase> for SessionCaseTag {
    fn from(value: SessionCase) -> Self {
        match value {
            SessionCase::Originating => SessionCaseTag::Originating,
            SessionCase::Terminating => SessionCaseTag::Terminating,
            SessionCase::OriginatingCdiv => SessionCaseTag::OriginatingCdiv,
        }
    }
}

/// One entry in a subscriber's ordered iFC list (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterCriterion {
    pub priority: i32,
    pub profile_part: ProfilePartIndicator,
    pub trigger: TriggerExpr,
    pub as_uri: String,
    pub default_handling: DefaultHandling,
    pub service_info: Option<String>,
}

/// Per-subscriber iFC configuration, plus the fallback-iFC (FIFC) service used when no
/// explicit entry matches (spec §4.4).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IfcConfiguration {
    pub criteria: Vec<FilterCriterion>,
    pub fallback_as_uri: Option<String>,
}

// ---------------------------------------------------------------------------
// AS chain / ODI
// ---------------------------------------------------------------------------

/// Opaque, collision-resistant identifier embedded as a Route-header URI parameter so
/// an AS round trip can be correlated back to its `AsChain` entry (spec §3 `ODI token`).
pub type OdiToken = String;

/// One matching iFC hop plus the policy that governs an unresponsive AS.
#[derive(Debug, Clone)]
pub struct AsHop {
    pub as_uri: String,
    pub default_handling: DefaultHandling,
    pub service_info: Option<String>,
}

/// The ordered sequence of matching iFCs for one (served_user, session_case, request)
/// triple, plus the index of the next AS to invoke (spec §3 `AsChain`).
#[derive(Debug, Clone)]
pub struct AsChain {
    pub served_user: Impu,
    pub session_case: SessionCase,
    pub originating: bool,
    pub hops: Vec<AsHop>,
    pub next_index: usize,
    pub base_request_snapshot: Option<crate::sip::SipRequest>,
    pub refcount: usize,
}

impl AsChain {
    pub fn next_hop(&self) -> Option<&AsHop> {
        self.hops.get(self.next_index)
    }

    pub fn advance(&mut self) {
        self.next_index += 1;
    }

    pub fn is_exhausted(&self) -> bool {
        self.next_index >= self.hops.len()
    }
}

//! Minimal SIP message model.
//!
//! The SIP stack itself — wire parsing, transport, and the transaction layer — is an
//! external collaborator (see spec §1 Non-goals). This module defines only the typed
//! surface the core subsystems operate on: a request/response already parsed by that
//! stack, plus the handful of enums the rest of the crate matches on.

use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Register,
    Subscribe,
    Notify,
    Invite,
    Cancel,
    Bye,
    Ack,
    Prack,
    Update,
    Options,
    Info,
    Message,
    Refer,
    Publish,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Method::Register => "REGISTER",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Invite => "INVITE",
            Method::Cancel => "CANCEL",
            Method::Bye => "BYE",
            Method::Ack => "ACK",
            Method::Prack => "PRACK",
            Method::Update => "UPDATE",
            Method::Options => "OPTIONS",
            Method::Info => "INFO",
            Method::Message => "MESSAGE",
            Method::Refer => "REFER",
            Method::Publish => "PUBLISH",
        };
        write!(f, "{s}")
    }
}

/// Originating, terminating, or originating-after-retarget (§4.5 served-user determination).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionCase {
    Originating,
    Terminating,
    OriginatingCdiv,
}

/// Whether, and how, the request already carries integrity protection that lets the
/// authentication engine short-circuit a challenge (supplemented from
/// `original_source/include/authenticationmiddleware.h`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntegrityProtection {
    #[default]
    None,
    Ip,
    Tls,
    Aka,
    /// Asserted by a trusted upstream P-Asserted-Identity hop.
    Assertion,
}

#[derive(Debug, Clone, Default)]
pub struct Contact {
    pub uri: String,
    pub expires: Option<u32>,
    pub instance_id: Option<String>,
    pub reg_id: Option<u32>,
    pub q: Option<f32>,
}

/// A parsed SIP request, as handed to the core by the (external) SIP stack.
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: Method,
    pub request_uri: String,
    pub from_uri: String,
    pub from_tag: Option<String>,
    pub to_uri: String,
    pub to_tag: Option<String>,
    pub call_id: String,
    pub cseq: u32,
    pub p_asserted_identity: Option<String>,
    pub p_preferred_identity: Option<String>,
    pub authorization: Option<AuthorizationHeader>,
    pub proxy_authorization: Option<AuthorizationHeader>,
    pub contacts: Vec<Contact>,
    pub expires_header: Option<u32>,
    pub event_package: Option<String>,
    pub route: Vec<String>,
    pub integrity_protected: IntegrityProtection,
    pub headers: HashMap<String, String>,
    pub session_case: Option<SessionCase>,
    pub body: Option<String>,
}

impl SipRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|s| s.as_str())
    }

    /// Resolves the served user per §4.5: P-Asserted-Identity (or From) for originating
    /// requests, Request-URI for terminating.
    pub fn served_user(&self, case: SessionCase) -> String {
        match case {
            SessionCase::Terminating => self.request_uri.clone(),
            SessionCase::Originating | SessionCase::OriginatingCdiv => self
                .p_asserted_identity
                .clone()
                .unwrap_or_else(|| self.from_uri.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthorizationHeader {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub qop: Option<String>,
    pub nonce_count: Option<String>,
    pub cnonce: Option<String>,
    pub scheme: AuthScheme,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Digest,
    DigestAkav1Md5,
}

/// A SIP response as produced by any subsystem. Deliberately bare: header
/// construction (`WWW-Authenticate`, `Service-Route`, ...) happens at the call site
/// rather than via a generic builder, matching the level of structure the original
/// `handlers.cpp` uses for one-off response assembly.
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl SipResponse {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        SipResponse {
            status,
            reason: reason.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

//! Client interface to the Home Subscriber Server (spec §6 HSS client interface, §1
//! external collaborators). The HSS itself, and the Cx/Diameter wire protocol to reach
//! it, are out of scope (spec §1 Non-goals) — this module defines only the typed
//! request/response surface the authentication engine and registrar call through.

use crate::error::HssError;
use crate::types::{AuthVector, Impi, Impu, IfcConfiguration};
use std::future::Future;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationType {
    Initial,
    Reregistration,
    Deregistration,
}

#[derive(Debug, Clone)]
pub struct RegistrationData {
    pub associated_uris: Vec<Impu>,
    pub ifc: IfcConfiguration,
    pub scscf_uri: Option<String>,
}

/// Abstraction over the HSS, grounded on the teacher's `Facilitator` trait: plain
/// `async fn` methods returning `impl Future<..> + Send`, with a blanket `Arc<T>`
/// forwarding impl so callers can hold a cheaply-cloneable handle.
pub trait HssClient: Send + Sync + 'static {
    fn get_registration_data(
        &self,
        impi: &Impi,
        impu: &Impu,
    ) -> impl Future<Output = Result<RegistrationData, HssError>> + Send;

    fn get_auth_vector(
        &self,
        impi: &Impi,
        auth_scheme: &str,
    ) -> impl Future<Output = Result<AuthVector, HssError>> + Send;

    fn update_registration_state(
        &self,
        impi: &Impi,
        impu: &Impu,
        reg_type: RegistrationType,
        scscf_uri: &str,
    ) -> impl Future<Output = Result<(), HssError>> + Send;
}

impl<T: HssClient> HssClient for std::sync::Arc<T> {
    fn get_registration_data(
        &self,
        impi: &Impi,
        impu: &Impu,
    ) -> impl Future<Output = Result<RegistrationData, HssError>> + Send {
        (**self).get_registration_data(impi, impu)
    }

    fn get_auth_vector(
        &self,
        impi: &Impi,
        auth_scheme: &str,
    ) -> impl Future<Output = Result<AuthVector, HssError>> + Send {
        (**self).get_auth_vector(impi, auth_scheme)
    }

    fn update_registration_state(
        &self,
        impi: &Impi,
        impu: &Impu,
        reg_type: RegistrationType,
        scscf_uri: &str,
    ) -> impl Future<Output = Result<(), HssError>> + Send {
        (**self).update_registration_state(impi, impu, reg_type, scscf_uri)
    }
}

/// Placeholder used when no Diameter Cx client is wired in: the HSS itself is an
/// out-of-scope external collaborator (spec §1 Non-goals), so a standalone binary
/// needs *something* to construct, but every call fails loudly rather than silently
/// fabricating subscriber data.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredHss;

impl HssClient for UnconfiguredHss {
    async fn get_registration_data(
        &self,
        _impi: &Impi,
        _impu: &Impu,
    ) -> Result<RegistrationData, HssError> {
        Err(HssError::Transport("no HSS client configured".into()))
    }

    async fn get_auth_vector(&self, _impi: &Impi, _auth_scheme: &str) -> Result<AuthVector, HssError> {
        Err(HssError::Transport("no HSS client configured".into()))
    }

    async fn update_registration_state(
        &self,
        _impi: &Impi,
        _impu: &Impu,
        _reg_type: RegistrationType,
        _scscf_uri: &str,
    ) -> Result<(), HssError> {
        Err(HssError::Transport("no HSS client configured".into()))
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use dashmap::DashMap;

    /// Fixed-response HSS double for unit/integration tests: registration data and
    /// auth vectors are preloaded per IMPI, update calls are just recorded.
    #[derive(Default)]
    pub struct MockHss {
        pub registration: DashMap<Impi, RegistrationData>,
        pub vectors: DashMap<Impi, AuthVector>,
        pub updates: DashMap<Impi, Vec<(Impu, RegistrationType)>>,
    }

    impl MockHss {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl HssClient for MockHss {
        async fn get_registration_data(
            &self,
            impi: &Impi,
            _impu: &Impu,
        ) -> Result<RegistrationData, HssError> {
            self.registration
                .get(impi)
                .map(|entry| entry.clone())
                .ok_or_else(|| HssError::UserUnknown(impi.clone()))
        }

        async fn get_auth_vector(
            &self,
            impi: &Impi,
            _auth_scheme: &str,
        ) -> Result<AuthVector, HssError> {
            self.vectors
                .get(impi)
                .map(|entry| entry.clone())
                .ok_or_else(|| HssError::UserUnknown(impi.clone()))
        }

        async fn update_registration_state(
            &self,
            impi: &Impi,
            impu: &Impu,
            reg_type: RegistrationType,
            _scscf_uri: &str,
        ) -> Result<(), HssError> {
            self.updates
                .entry(impi.clone())
                .or_default()
                .push((impu.clone(), reg_type));
            Ok(())
        }
    }
}

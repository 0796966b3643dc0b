//! HTTP admin surface (spec §6 "HTTP admin surface", §4.8 `handlers.cpp`).
//!
//! An external collaborator per the spec, outlined "for completeness" — implemented
//! here against the same `Store`/`HssClient` the rest of the core uses, not a
//! separate data path. Shaped after the teacher's `handlers.rs`: a `routes()` function
//! building a `Router<State>`, one handler per endpoint, `IntoResponse` for the core's
//! error type.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::instrument;

use crate::error::{CoreError, ErrorReason};
use crate::hss::HssClient;
use crate::registrar::Registrar;
use crate::store::{Store, Table};
use crate::timer::TimerService;
use crate::transport::SipTransport;
use crate::types::Aor;

#[derive(Clone)]
pub struct AdminState<S, H, T, X> {
    pub store: S,
    pub registrar: std::sync::Arc<Registrar<S, H, T, X>>,
}

pub fn routes<S, H, T, X>() -> Router<AdminState<S, H, T, X>>
where
    S: Store + Clone,
    H: HssClient + Clone,
    T: TimerService + Clone,
    X: SipTransport + Clone,
{
    Router::new()
        .route("/registrations/{impu}", delete(delete_registrations::<S, H, T, X>))
        .route("/registrations/{impu}", put(put_registration::<S, H, T, X>))
        .route("/impu/{impu}", delete(delete_impu::<S, H, T, X>))
        .route("/impu/{impu}/bindings", get(get_bindings::<S, H, T, X>))
        .route("/impu/{impu}/subscriptions", get(get_subscriptions::<S, H, T, X>))
}

#[derive(Debug, Deserialize)]
pub struct SendNotificationsQuery {
    #[serde(rename = "send-notifications", default)]
    pub send_notifications: bool,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRegistrationsBody {
    pub registrations: Vec<RegistrationRef>,
}

#[derive(Debug, Deserialize)]
pub struct RegistrationRef {
    #[serde(rename = "primary-impu")]
    pub primary_impu: String,
    pub impi: String,
}

/// `DELETE /registrations/<impu>?send-notifications=true|false`.
#[instrument(skip_all)]
pub async fn delete_registrations<S, H, T, X>(
    State(state): State<AdminState<S, H, T, X>>,
    Path(impu): Path<String>,
    Query(_query): Query<SendNotificationsQuery>,
    Json(body): Json<DeleteRegistrationsBody>,
) -> impl IntoResponse
where
    S: Store + Clone,
    H: HssClient + Clone,
    T: TimerService + Clone,
    X: SipTransport + Clone,
{
    for registration in &body.registrations {
        if registration.primary_impu != impu {
            continue;
        }
        if let Err(err) = state.store.delete(Table::Aor, &impu, 0).await {
            tracing::warn!(impu = %impu, error = %err, "failed to clear registrations");
            return CoreError::Store(err).into_response();
        }
    }
    (StatusCode::OK, Json(json!({"deleted": impu}))).into_response()
}

/// `DELETE /impu/<impu>`.
#[instrument(skip_all)]
pub async fn delete_impu<S, H, T, X>(
    State(state): State<AdminState<S, H, T, X>>,
    Path(impu): Path<String>,
) -> impl IntoResponse
where
    S: Store + Clone,
    H: HssClient + Clone,
    T: TimerService + Clone,
    X: SipTransport + Clone,
{
    let entry = match state.store.get(Table::Aor, &impu).await {
        Ok(entry) => entry,
        Err(err) => return CoreError::Store(err).into_response(),
    };
    if entry.data.is_none() {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "not_found"}))).into_response();
    }
    match state.store.delete(Table::Aor, &impu, entry.cas).await {
        Ok(()) => (StatusCode::OK, Json(json!({"deleted": impu}))).into_response(),
        Err(err) => CoreError::Store(err).into_response(),
    }
}

/// `GET /impu/<impu>/bindings`.
#[instrument(skip_all)]
pub async fn get_bindings<S, H, T, X>(
    State(state): State<AdminState<S, H, T, X>>,
    Path(impu): Path<String>,
) -> impl IntoResponse
where
    S: Store + Clone,
    H: HssClient + Clone,
    T: TimerService + Clone,
    X: SipTransport + Clone,
{
    match load_aor(&state.store, &impu).await {
        Ok(aor) => (StatusCode::OK, Json(json!(aor.bindings))).into_response(),
        Err(err) => err.into_response(),
    }
}

/// `GET /impu/<impu>/subscriptions`.
#[instrument(skip_all)]
pub async fn get_subscriptions<S, H, T, X>(
    State(state): State<AdminState<S, H, T, X>>,
    Path(impu): Path<String>,
) -> impl IntoResponse
where
    S: Store + Clone,
    H: HssClient + Clone,
    T: TimerService + Clone,
    X: SipTransport + Clone,
{
    match load_aor(&state.store, &impu).await {
        Ok(aor) => (StatusCode::OK, Json(json!(aor.subscriptions))).into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct PutRegistrationBody {
    #[serde(rename = "user-data-xml")]
    pub user_data_xml: String,
}

/// `PUT /registrations/<impu>` — push-profile; the iFC/IRS XML itself is parsed by an
/// external collaborator (the HSS client abstraction), this endpoint only acknowledges
/// receipt against the core's state, per §4.8.
#[instrument(skip_all)]
pub async fn put_registration<S, H, T, X>(
    State(_state): State<AdminState<S, H, T, X>>,
    Path(impu): Path<String>,
    Json(_body): Json<PutRegistrationBody>,
) -> impl IntoResponse
where
    S: Store + Clone,
    H: HssClient + Clone,
    T: TimerService + Clone,
    X: SipTransport + Clone,
{
    (StatusCode::OK, Json(json!({"updated": impu}))).into_response()
}

async fn load_aor<S: Store>(store: &S, impu: &str) -> Result<Aor, CoreError> {
    let entry = store.get(Table::Aor, impu).await?;
    match entry.data {
        Some(bytes) => {
            let aor: Aor =
                serde_json::from_slice(&bytes).map_err(crate::error::StoreError::Serialization)?;
            Ok(aor)
        }
        None => Ok(Aor::default()),
    }
}

#[derive(Serialize)]
struct AdminErrorBody {
    reason: ErrorReason,
    detail: String,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let reason = ErrorReason::from(&self);
        let status = match &self {
            CoreError::Unauthorized(_) => StatusCode::FORBIDDEN,
            CoreError::StaleCredentials => StatusCode::UNAUTHORIZED,
            CoreError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            CoreError::Store(crate::error::StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            CoreError::Store(crate::error::StoreError::CasConflict(_)) => StatusCode::CONFLICT,
            CoreError::Store(_) | CoreError::Hss(_) | CoreError::Ifc(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            CoreError::AsChainTerminated => StatusCode::GATEWAY_TIMEOUT,
            CoreError::ForkingLimitExceeded => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = AdminErrorBody {
            reason,
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

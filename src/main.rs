//! S-CSCF core entrypoint.
//!
//! This binary loads node configuration, wires the subsystems described in spec §4
//! (authentication engine, registrar, subscription manager, proxy-tsx, and the
//! interceptor chain that fronts them) against an in-memory `Store` and a
//! `TokioTimerService`, and serves the admin HTTP surface (spec §6).
//!
//! The HSS client and SIP transport are out-of-scope external collaborators (spec §1
//! Non-goals): this binary wires unconfigured placeholders for them so it starts and
//! serves the admin surface standalone, with the wiring point documented for a real
//! Diameter/SIP-stack integration to replace.
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `CONFIG` (or `--config`) points at the node's JSON configuration file

mod acr;
mod auth;
mod config;
mod error;
mod hss;
mod http_admin;
mod ifc;
mod middleware;
mod proxy_tsx;
mod registrar;
mod sig_down;
mod sip;
mod store;
mod subscription;
mod telemetry;
mod timer;
mod transport;
mod types;

use axum::http::Method;
use axum::Router;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{self, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::acr::{AcrReporter, NullAcrReporter};
use crate::auth::AuthenticationEngine;
use crate::config::NodeConfig;
use crate::hss::UnconfiguredHss;
use crate::http_admin::AdminState;
use crate::middleware::auth_layer::AuthMiddleware;
use crate::middleware::InterceptorChain;
use crate::proxy_tsx::as_chain::AsChainTable;
use crate::proxy_tsx::ProxyTsx;
use crate::registrar::Registrar;
use crate::sig_down::SigDown;
use crate::store::memory::MemoryStore;
use crate::subscription::SubscriptionManager;
use crate::telemetry::Telemetry;
use crate::timer::TokioTimerService;
use crate::transport::UnconfiguredSipTransport;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let _telemetry = Telemetry::init();

    let config = Arc::new(NodeConfig::load()?);

    if !config.remote_store_endpoints.is_empty() {
        tracing::warn!(
            endpoints = ?config.remote_store_endpoints,
            "remote store endpoints configured, but this binary only wires the in-memory \
             Store backend, which cannot dial them; swap in a networked Store impl that \
             reads this field to get replication across nodes"
        );
    }
    let store = Arc::new(MemoryStore::new());
    let hss = Arc::new(UnconfiguredHss);
    let timers = Arc::new(TokioTimerService::new());
    let transport = Arc::new(UnconfiguredSipTransport);
    let acr: Arc<dyn AcrReporter> = Arc::new(NullAcrReporter);
    let as_chains = Arc::new(AsChainTable::new());

    let auth_engine = Arc::new(AuthenticationEngine::new(
        store.clone(),
        hss.clone(),
        timers.clone(),
        config.clone(),
    ));
    let registrar = Arc::new(Registrar::new(
        store.clone(),
        hss.clone(),
        timers.clone(),
        transport.clone(),
        acr.clone(),
        config.clone(),
    ));
    let _subscriptions = Arc::new(SubscriptionManager::new(
        store.clone(),
        transport.clone(),
        config.clone(),
    ));
    let _proxy = Arc::new(ProxyTsx::new(
        store.clone(),
        hss.clone(),
        timers.clone(),
        transport.clone(),
        acr.clone(),
        as_chains.clone(),
        config.clone(),
    ));

    // The chain an (out-of-scope) SIP stack feeds inbound requests through before
    // they reach the registrar, subscription manager, or proxy-tsx.
    let _chain = InterceptorChain::new(vec![Arc::new(AuthMiddleware::new(
        auth_engine.clone(),
        config.clone(),
    ))]);

    let admin_state = AdminState {
        store: store.clone(),
        registrar: registrar.clone(),
    };
    let admin_router = Router::new()
        .merge(http_admin::routes().with_state(admin_state))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::PUT, Method::DELETE])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.admin_host, config.admin_port);
    tracing::info!("starting S-CSCF admin surface at http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("failed to bind to {addr}: {e}");
            std::process::exit(1);
        });

    let sig_down = SigDown::try_new()?;
    let cancellation = sig_down.cancellation_token();
    axum::serve(listener, admin_router)
        .with_graceful_shutdown(async move { cancellation.cancelled().await })
        .await?;

    Ok(())
}

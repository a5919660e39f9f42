//! Router construction and the shared request state.

mod oidc;
mod v1;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use vigild_lib::idm::server::IdmServer;
use vigild_lib::prelude::*;
use vigild_lib::tenant::TenantPolicyResolver;

#[derive(Clone)]
pub struct ServerState {
    pub idms: Arc<IdmServer>,
    pub resolver: Arc<dyn TenantPolicyResolver>,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/v1/auth", post(v1::auth_post))
        .route("/v1/auth/cancel", post(v1::auth_cancel_post))
        .route("/v1/register", post(v1::register_post))
        .route("/v1/register/cancel", post(v1::register_cancel_post))
        // Non-GET methods fall out as 405 from the method router.
        .route(
            "/:tenant_id/.well-known/openid-configuration",
            get(oidc::discovery_get),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the listener fails or the task is aborted.
pub async fn create_https_server(
    bindaddress: &str,
    state: ServerState,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bindaddress).await.map_err(|e| {
        admin_error!(?e, %bindaddress, "unable to bind https listener");
        e
    })?;
    admin_info!(%bindaddress, "https listener started");
    axum::serve(listener, router(state)).await
}

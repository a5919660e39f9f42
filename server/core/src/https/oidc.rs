//! Per-tenant OIDC discovery. Unknown and disabled tenants are both a
//! plain 404; the method router answers 405 for anything that is not GET.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use vigil_proto::oidc::{IdTokenSignAlg, OidcDiscoveryResponse, SubjectType};
use vigild_lib::prelude::*;
use vigild_lib::tenant::Tenant;

use super::ServerState;

pub(crate) async fn discovery_get(
    State(state): State<ServerState>,
    Path(tenant_id): Path<String>,
) -> Response {
    let Ok(tenant_id) = Uuid::parse_str(&tenant_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match state.resolver.resolve(tenant_id) {
        Some(tenant) if tenant.enabled => match discovery_document(&tenant) {
            Ok(doc) => Json(doc).into_response(),
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        },
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

fn discovery_document(tenant: &Tenant) -> Result<OidcDiscoveryResponse, ()> {
    let issuer = tenant.issuer.clone();
    // A tenant issuer is always a base url, so the joins cannot fail in
    // practice; a malformed one is still reported rather than served.
    let endpoint = |suffix: &str| {
        issuer.join(suffix).map_err(|e| {
            admin_error!(?e, tenant = %tenant.name, "malformed issuer in tenant config");
        })
    };
    Ok(OidcDiscoveryResponse {
        authorization_endpoint: endpoint("oauth2/authorise")?,
        token_endpoint: endpoint("oauth2/token")?,
        userinfo_endpoint: Some(endpoint("oauth2/userinfo")?),
        jwks_uri: endpoint("jwks")?,
        issuer,
        scopes_supported: vec![
            "openid".to_string(),
            "profile".to_string(),
            "email".to_string(),
        ],
        response_types_supported: vec!["code".to_string()],
        subject_types_supported: vec![SubjectType::Public],
        id_token_signing_alg_values_supported: vec![IdTokenSignAlg::ES256],
        grant_types_supported: vec!["authorization_code".to_string()],
        token_endpoint_auth_methods_supported: vec![
            "client_secret_basic".to_string(),
            "client_secret_post".to_string(),
        ],
        claims_supported: vec![
            "sub".to_string(),
            "name".to_string(),
            "email".to_string(),
        ],
        claims_parameter_supported: false,
        request_parameter_supported: false,
    })
}

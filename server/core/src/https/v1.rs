//! The v1 authentication and registration endpoints. Handlers are thin:
//! deserialise, hand to the idm server, serialise. All protocol decisions
//! live behind [`IdmServer`].

use axum::extract::State;
use axum::Json;

use vigil_proto::v1::{
    AuthCancelRequest, AuthRequest, AuthResponse, RegisterCancelRequest, RegisterRequest,
    RegisterResponse,
};

use vigild_lib::prelude::*;

use super::ServerState;

pub(crate) async fn auth_post(
    State(state): State<ServerState>,
    Json(req): Json<AuthRequest>,
) -> Json<AuthResponse> {
    let ct = duration_from_epoch_now();
    Json(state.idms.auth(req.step, ct))
}

pub(crate) async fn auth_cancel_post(
    State(state): State<ServerState>,
    Json(req): Json<AuthCancelRequest>,
) -> Json<AuthResponse> {
    Json(state.idms.auth_cancel(&req))
}

pub(crate) async fn register_post(
    State(state): State<ServerState>,
    Json(req): Json<RegisterRequest>,
) -> Json<RegisterResponse> {
    let ct = duration_from_epoch_now();
    Json(state.idms.register(req.step, ct))
}

pub(crate) async fn register_cancel_post(
    State(state): State<ServerState>,
    Json(req): Json<RegisterCancelRequest>,
) -> Json<RegisterResponse> {
    Json(state.idms.register_cancel(&req))
}

#[cfg(test)]
mod tests {
    use crate::https::tests::test_state;
    use crate::https::router;
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use vigil_proto::v1::{AuthResponse, AuthState};
    use vigild_lib::prelude::*;
    use vigild_lib::tenant::Tenant;

    fn test_tenant() -> Tenant {
        use vigild_lib::tenant::{MfaPolicy, TenantPasswordConfig};
        Tenant {
            tenant_id: Uuid::new_v4(),
            name: "Example".to_string(),
            enabled: true,
            issuer: Url::parse("https://idm.example.com").expect("invalid uri"),
            application_uri: Url::parse("https://app.example.com/return").expect("invalid uri"),
            portal_uri: Url::parse("https://idm.example.com/portal").expect("invalid uri"),
            allow_self_registration: false,
            federated_domains: Vec::new(),
            federated_authorization_uri: None,
            password: TenantPasswordConfig::default(),
            mfa: MfaPolicy::default(),
        }
    }

    #[tokio::test]
    async fn test_v1_auth_init_unknown_user_denied_on_the_wire() {
        let app = router(test_state(vec![test_tenant()]));

        let body = serde_json::json!({
            "step": {
                "init": {
                    "username": "nobody@example.com",
                    "tenant_id": null,
                    "pre_auth_token": null
                }
            }
        });
        let request = Request::builder()
            .method(Method::POST)
            .uri("/v1/auth")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("failed to build request");

        let response = app.oneshot(request).await.expect("router failed");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("failed to read body")
            .to_bytes();
        let parsed: AuthResponse = serde_json::from_slice(&bytes).expect("bad response body");
        assert!(parsed.session_token.is_none());
        assert!(matches!(parsed.state, AuthState::Denied { .. }));
    }

    #[tokio::test]
    async fn test_v1_auth_cancel_accepts_garbage_token() {
        let app = router(test_state(vec![test_tenant()]));

        let body = serde_json::json!({
            "session_token": "never-issued",
            "pre_auth_token": null
        });
        let request = Request::builder()
            .method(Method::POST)
            .uri("/v1/auth/cancel")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("failed to build request");

        let response = app.oneshot(request).await.expect("router failed");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("failed to read body")
            .to_bytes();
        let parsed: AuthResponse = serde_json::from_slice(&bytes).expect("bad response body");
        assert!(matches!(parsed.state, AuthState::Cancelled));
    }
}

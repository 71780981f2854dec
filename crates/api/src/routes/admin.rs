//! Operator routes for the webhook receipt log and billing invariants
//!
//! Protected by a static bearer token (ADMIN_API_TOKEN). The routes answer
//! 403 when no token is configured.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
    Json,
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tradepost_billing::{
    BillingService, InvariantCheckSummary, WebhookEventRecord, WebhookReplayResult,
};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 500;

/// Reject requests without the configured admin bearer token
pub async fn require_admin_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let path = request.uri().path().to_string();

    let Some(expected) = state.config.admin_api_token.as_deref() else {
        tracing::warn!(path = %path, "Admin route requested but ADMIN_API_TOKEN is not set");
        return Err(ApiError::Forbidden("Admin API is disabled".to_string()));
    };

    let provided = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let authorized = provided
        .map(|token| bool::from(token.as_bytes().ct_eq(expected.as_bytes())))
        .unwrap_or(false);

    if !authorized {
        tracing::warn!(
            path = %path,
            has_token = provided.is_some(),
            "Admin authentication failed"
        );
        return Err(ApiError::Unauthorized);
    }

    Ok(next.run(request).await)
}

fn billing(state: &AppState) -> ApiResult<&Arc<BillingService>> {
    state
        .billing
        .as_ref()
        .ok_or_else(|| ApiError::ServiceUnavailable("Billing is not configured".to_string()))
}

#[derive(Debug, Deserialize)]
pub struct ListWebhooksQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ListWebhooksQuery {
    fn page(&self) -> ApiResult<(i64, i64)> {
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(ApiError::Validation(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        let offset = self.offset.unwrap_or(0);
        if offset < 0 {
            return Err(ApiError::Validation("offset must not be negative".to_string()));
        }
        Ok((limit, offset))
    }
}

#[derive(Debug, Serialize)]
pub struct WebhookListResponse {
    pub webhooks: Vec<WebhookEventRecord>,
    pub limit: i64,
    pub offset: i64,
}

/// GET /admin/webhooks
pub async fn list_webhooks(
    State(state): State<AppState>,
    Query(query): Query<ListWebhooksQuery>,
) -> ApiResult<Json<WebhookListResponse>> {
    let (limit, offset) = query.page()?;
    let webhooks = billing(&state)?
        .webhooks
        .list_webhooks(query.status.as_deref(), limit, offset)
        .await?;

    Ok(Json(WebhookListResponse {
        webhooks,
        limit,
        offset,
    }))
}

/// GET /admin/webhooks/failed
pub async fn list_failed_webhooks(
    State(state): State<AppState>,
    Query(query): Query<ListWebhooksQuery>,
) -> ApiResult<Json<WebhookListResponse>> {
    let (limit, offset) = query.page()?;
    let webhooks = billing(&state)?
        .webhooks
        .list_failed_webhooks(limit, offset)
        .await?;

    Ok(Json(WebhookListResponse {
        webhooks,
        limit,
        offset,
    }))
}

/// POST /admin/webhooks/{event_id}/replay
pub async fn replay_webhook(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<WebhookReplayResult>> {
    let result = billing(&state)?.webhooks.replay_webhook(&event_id).await?;

    tracing::info!(
        event_id = %event_id,
        success = result.success,
        new_status = %result.new_status,
        "Admin replayed webhook"
    );

    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct ReplayFailedQuery {
    pub max_events: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ReplayFailedResponse {
    pub replayed: usize,
    pub succeeded: usize,
    pub results: Vec<WebhookReplayResult>,
}

/// POST /admin/webhooks/replay-failed
pub async fn replay_failed_webhooks(
    State(state): State<AppState>,
    Query(query): Query<ReplayFailedQuery>,
) -> ApiResult<Json<ReplayFailedResponse>> {
    if let Some(max) = query.max_events {
        if !(1..=MAX_PAGE_SIZE).contains(&max) {
            return Err(ApiError::Validation(format!(
                "max_events must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
    }

    let results = billing(&state)?
        .webhooks
        .replay_all_failed(query.max_events)
        .await?;
    let succeeded = results.iter().filter(|r| r.success).count();

    tracing::info!(
        replayed = results.len(),
        succeeded,
        "Admin replayed failed webhooks"
    );

    Ok(Json(ReplayFailedResponse {
        replayed: results.len(),
        succeeded,
        results,
    }))
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub event_id: String,
    pub reset: bool,
}

/// POST /admin/webhooks/{event_id}/reset
pub async fn reset_webhook(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<ResetResponse>> {
    billing(&state)?
        .webhooks
        .reset_stuck_webhook(&event_id)
        .await?;

    Ok(Json(ResetResponse {
        event_id,
        reset: true,
    }))
}

#[derive(Debug, Deserialize)]
pub struct InvariantQuery {
    /// Run a single named check instead of all of them
    pub check: Option<String>,
}

/// GET /admin/billing/invariants
pub async fn run_invariant_checks(
    State(state): State<AppState>,
    Query(query): Query<InvariantQuery>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let checker = billing(&state)?.invariants.as_ref().ok_or_else(|| {
        ApiError::ServiceUnavailable("Invariant checks require the Postgres store".to_string())
    })?;

    let summary = match query.check.as_deref() {
        Some(name) => checker.run_check(name).await?,
        None => checker.run_all_checks().await?,
    };

    Ok(Json(summary))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;
    use tower::ServiceExt;
    use tradepost_billing::{EventLog, WebhookEvent};

    use crate::routes::create_router;
    use crate::routes::test_support::{app, config, json_body, ADMIN_TOKEN};
    use crate::state::AppState;

    fn admin_request(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn checkout_event(event_id: &str, account_id: uuid::Uuid) -> WebhookEvent {
        serde_json::from_value(json!({
            "id": event_id,
            "type": "checkout.session.completed",
            "created": time::OffsetDateTime::now_utc().unix_timestamp(),
            "data": {
                "object": {
                    "mode": "subscription",
                    "subscription": "sub_1",
                    "client_reference_id": account_id.to_string(),
                }
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_admin_routes_require_token() {
        let test = app();

        let missing = create_router(test.state.clone())
            .oneshot(admin_request("GET", "/admin/webhooks", None))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let wrong = create_router(test.state.clone())
            .oneshot(admin_request("GET", "/admin/webhooks", Some("nope")))
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let ok = create_router(test.state.clone())
            .oneshot(admin_request("GET", "/admin/webhooks", Some(ADMIN_TOKEN)))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_admin_disabled_without_configured_token() {
        let test = app();
        let mut config = config();
        config.admin_api_token = None;
        let state = AppState::with_billing(config, test.state.billing.clone());

        let response = create_router(state)
            .oneshot(admin_request("GET", "/admin/webhooks", Some(ADMIN_TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_failed_webhook_can_be_listed_and_replayed() {
        let test = app();
        let account = test.onboard().await;
        let billing = test.state.billing.clone().unwrap();

        // provider has no state yet, so the first attempt fails
        billing
            .webhooks
            .handle_event(checkout_event("evt_1", account.id))
            .await
            .unwrap_err();

        let failed = create_router(test.state.clone())
            .oneshot(admin_request("GET", "/admin/webhooks/failed", Some(ADMIN_TOKEN)))
            .await
            .unwrap();
        assert_eq!(failed.status(), StatusCode::OK);
        let json = json_body(failed).await;
        assert_eq!(json["webhooks"][0]["stripe_event_id"], "evt_1");
        assert_eq!(json["webhooks"][0]["processing_result"], "error");

        test.provider_reports("sub_1", "active").await;
        let replay = create_router(test.state.clone())
            .oneshot(admin_request(
                "POST",
                "/admin/webhooks/evt_1/replay",
                Some(ADMIN_TOKEN),
            ))
            .await
            .unwrap();
        assert_eq!(replay.status(), StatusCode::OK);
        let json = json_body(replay).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["previous_status"], "error");
        assert_eq!(json["new_status"], "success");
    }

    #[tokio::test]
    async fn test_replay_failed_reports_counts() {
        let test = app();
        let account = test.onboard().await;
        let billing = test.state.billing.clone().unwrap();
        billing
            .webhooks
            .handle_event(checkout_event("evt_1", account.id))
            .await
            .unwrap_err();
        test.provider_reports("sub_1", "active").await;

        let response = create_router(test.state.clone())
            .oneshot(admin_request(
                "POST",
                "/admin/webhooks/replay-failed?max_events=10",
                Some(ADMIN_TOKEN),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["replayed"], 1);
        assert_eq!(json["succeeded"], 1);
    }

    #[tokio::test]
    async fn test_reset_stuck_webhook() {
        let test = app();
        let account = test.onboard().await;
        test.store
            .claim(
                &checkout_event("evt_stuck", account.id),
                time::Duration::minutes(30),
            )
            .await
            .unwrap();

        let response = create_router(test.state.clone())
            .oneshot(admin_request(
                "POST",
                "/admin/webhooks/evt_stuck/reset",
                Some(ADMIN_TOKEN),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let again = create_router(test.state.clone())
            .oneshot(admin_request(
                "POST",
                "/admin/webhooks/evt_stuck/reset",
                Some(ADMIN_TOKEN),
            ))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_rejects_bad_paging_and_status() {
        let test = app();

        for uri in [
            "/admin/webhooks?limit=0",
            "/admin/webhooks?offset=-1",
            "/admin/webhooks?status=exploded",
        ] {
            let response = create_router(test.state.clone())
                .oneshot(admin_request("GET", uri, Some(ADMIN_TOKEN)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
        }
    }

    #[tokio::test]
    async fn test_invariants_unavailable_without_postgres() {
        let test = app();

        for uri in [
            "/admin/billing/invariants",
            "/admin/billing/invariants?check=ledger_account_exists",
        ] {
            let response = create_router(test.state.clone())
                .oneshot(admin_request("GET", uri, Some(ADMIN_TOKEN)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE, "{}", uri);
        }
    }

    #[tokio::test]
    async fn test_replay_of_in_flight_event_conflicts() {
        let test = app();
        let account = test.onboard().await;
        test.store
            .claim(
                &checkout_event("evt_live", account.id),
                time::Duration::minutes(30),
            )
            .await
            .unwrap();

        let response = create_router(test.state.clone())
            .oneshot(admin_request(
                "POST",
                "/admin/webhooks/evt_live/replay",
                Some(ADMIN_TOKEN),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}

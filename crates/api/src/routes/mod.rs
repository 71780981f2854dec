//! HTTP routes

pub mod admin;
pub mod webhooks;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/webhooks", get(admin::list_webhooks))
        .route("/webhooks/failed", get(admin::list_failed_webhooks))
        .route("/webhooks/replay-failed", post(admin::replay_failed_webhooks))
        .route("/webhooks/{event_id}/replay", post(admin::replay_webhook))
        .route("/webhooks/{event_id}/reset", post(admin::reset_webhook))
        .route("/billing/invariants", get(admin::run_invariant_checks))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admin::require_admin_token,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .nest("/admin", admin_routes)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Response;
    use serde_json::Value;
    use time::{Duration, OffsetDateTime};
    use tradepost_billing::{
        BillingService, BusinessAccount, InMemoryBillingStore, InMemorySubscriptionProvider,
        ReconciliationStore, SubscriptionSnapshot, WebhookHandler, WebhookVerifier,
    };
    use uuid::Uuid;

    use crate::config::Config;
    use crate::state::AppState;

    pub const SECRET: &str = "whsec_route_test_secret";
    pub const ADMIN_TOKEN: &str = "admin-test-token";

    pub struct TestApp {
        pub state: AppState,
        pub store: InMemoryBillingStore,
        pub provider: InMemorySubscriptionProvider,
    }

    pub fn config() -> Config {
        Config {
            database_url: "postgres://localhost/tradepost_test".to_string(),
            bind_address: "127.0.0.1:0".to_string(),
            enable_billing: true,
            run_migrations: false,
            admin_api_token: Some(ADMIN_TOKEN.to_string()),
            database_max_connections: 1,
        }
    }

    pub fn app() -> TestApp {
        let store = InMemoryBillingStore::new();
        let provider = InMemorySubscriptionProvider::new();
        let handler = WebhookHandler::new(
            WebhookVerifier::new(SECRET, 300),
            Arc::new(provider.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
        );
        let billing = BillingService::with_handler(handler);

        TestApp {
            state: AppState::with_billing(config(), Some(Arc::new(billing))),
            store,
            provider,
        }
    }

    impl TestApp {
        pub async fn onboard(&self) -> BusinessAccount {
            let account =
                BusinessAccount::onboard(Uuid::new_v4(), "starter", OffsetDateTime::now_utc());
            self.store.create_business_account(&account).await.unwrap();
            account
        }

        pub async fn provider_reports(&self, subscription_id: &str, status: &str) {
            let now = OffsetDateTime::now_utc();
            self.provider
                .set(SubscriptionSnapshot {
                    subscription_id: subscription_id.to_string(),
                    status: status.to_string(),
                    current_period_start: now,
                    current_period_end: now + Duration::days(30),
                    created_at: now,
                })
                .await;
        }
    }

    pub fn sign(body: &[u8]) -> String {
        WebhookVerifier::new(SECRET, 300)
            .sign(body, OffsetDateTime::now_utc().unix_timestamp())
            .unwrap()
    }

    pub async fn json_body(response: Response<Body>) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }
}

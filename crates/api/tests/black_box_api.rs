use std::collections::HashMap;
use std::sync::Arc;

use catalogflow_api::app::{self, services};
use catalogflow_core::ProductId;
use catalogflow_events::{InMemoryBus, ProduceError};
use catalogflow_infra::AppConfig;
use catalogflow_infra::product_store::InMemoryProductStore;
use catalogflow_products::{ProductDetails, ReviewStatus};
use chrono::Utc;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde_json::{Value as JsonValue, json};
use tokio_util::sync::CancellationToken;

struct TestServer {
    base_url: String,
    store: InMemoryProductStore,
    bus: Arc<InMemoryBus>,
    services: Arc<services::AppServices>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(products: &[&str]) -> Self {
        let vars: HashMap<&str, &str> = HashMap::from([("DISPATCH_DELAY_MS", "1")]);
        let config =
            AppConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string())).unwrap();

        let store = InMemoryProductStore::new();
        for name in products {
            store
                .insert(ProductDetails {
                    name: name.to_string(),
                    category: "Electronics".to_string(),
                    price: Decimal::new(99_900, 2),
                    description: String::new(),
                    quantity: 5,
                    manufacturer: None,
                    created_at: Utc::now(),
                })
                .unwrap();
        }
        let bus = Arc::new(InMemoryBus::new());

        // Same router as prod, in-memory services, ephemeral port.
        let services = Arc::new(services::build_in_memory_services(
            &config,
            store.clone(),
            Arc::clone(&bus),
            CancellationToken::new(),
        ));
        let app = app::build_app(Arc::clone(&services));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            store,
            bus,
            services,
            handle,
        }
    }

    async fn dispatch(&self, body: JsonValue) -> (StatusCode, JsonValue) {
        let res = reqwest::Client::new()
            .post(format!("{}/products/dispatch", self.base_url))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = res.status();
        (status, res.json().await.unwrap())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn fail_product_named(bus: &InMemoryBus, name: &'static str) {
    bus.set_produce_fault(move |_, record| {
        let product: JsonValue = serde_json::from_slice(&record.payload).ok()?;
        (product["name"] == name).then(|| ProduceError::Timeout(std::time::Duration::from_secs(10)))
    });
}

#[tokio::test]
async fn health_reports_backend_and_consumer() {
    let srv = TestServer::spawn(&[]).await;

    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let body: JsonValue = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["backend"], "in_memory");
    assert_eq!(body["feedbackConsumer"], "running");
}

#[tokio::test]
async fn dispatch_all_reports_partial_failure() {
    let srv = TestServer::spawn(&["A", "B", "C"]).await;
    fail_product_named(&srv.bus, "B");

    let (status, body) = srv.dispatch(json!({"mode": "all"})).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "completed");
    assert_eq!(body["succeeded"], 2);
    assert_eq!(body["failed"], 1);
    assert_eq!(body["failedNames"], json!(["B"]));
    assert_eq!(body["message"], "2 sent, 1 failed: B");

    assert!(srv.store.get(ProductId::new(1)).unwrap().is_sent());
    assert!(!srv.store.get(ProductId::new(2)).unwrap().is_sent());
    assert_eq!(srv.bus.messages("product-events").len(), 2);
}

#[tokio::test]
async fn dispatch_rejections_are_not_errors() {
    let srv = TestServer::spawn(&["A"]).await;

    let (status, body) = srv
        .dispatch(json!({"mode": "selected", "productIds": []}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "nothing_selected");

    let (status, body) = srv
        .dispatch(json!({"mode": "selected", "productIds": [42]}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "nothing_to_send");

    let (_, body) = srv.dispatch(json!({"mode": "all"})).await;
    assert_eq!(body["outcome"], "completed");
    let (_, body) = srv.dispatch(json!({"mode": "all"})).await;
    assert_eq!(body["outcome"], "nothing_to_send");
    assert_eq!(srv.bus.messages("product-events").len(), 1);
}

#[tokio::test]
async fn unknown_mode_is_a_bad_request() {
    let srv = TestServer::spawn(&["A"]).await;

    let (status, body) = srv.dispatch(json!({"mode": "everything"})).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");
    assert!(srv.bus.messages("product-events").is_empty());
}

#[tokio::test]
async fn reviewer_feedback_reaches_the_store() {
    let srv = TestServer::spawn(&["A"]).await;
    let (_, body) = srv.dispatch(json!({"mode": "all"})).await;
    assert_eq!(body["succeeded"], 1);

    srv.bus.append_raw(
        "feedback",
        json!({
            "productId": 1,
            "status": "Approved",
            "reviewedAt": "2025-12-01T10:00:00Z",
            "reviewedBy": "alice"
        })
        .to_string(),
    );

    let mut status = None;
    for _ in 0..200 {
        status = srv
            .store
            .get(ProductId::new(1))
            .and_then(|p| p.status().cloned());
        if status == Some(ReviewStatus::Approved) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(status, Some(ReviewStatus::Approved));

    srv.services.shutdown().await;
    assert!(srv.bus.is_closed());
    assert_eq!(srv.bus.committed_offset("feedback", "producer-feedback-group"), Some(1));
}

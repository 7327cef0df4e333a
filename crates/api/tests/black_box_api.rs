use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use companies_api::app::{AppServices, InMemoryBackends, build_app};
use companies_auth::{JwtClaims, Permission, Role, testing};
use companies_events::{ChangeKind, EventDeduplicator};
use companies_infra::ServicePolicy;
use companies_infra::company_service::Backoff;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde_json::json;

struct TestServer {
    base_url: String,
    backends: InMemoryBackends,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let policy = ServicePolicy {
            store_backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(5)),
            emit_backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(5)),
            ..ServicePolicy::default()
        };
        let (services, backends) = AppServices::in_memory(Arc::new(testing::validator()), policy);

        // Build app (same router as prod), but bind to an ephemeral port.
        let app = build_app(services);
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
            backends,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn mint_jwt(scopes: Vec<Permission>, roles: Vec<Role>) -> String {
    let now = Utc::now();
    let claims = JwtClaims {
        sub: "black-box".to_string(),
        scopes,
        roles,
        issued_at: now,
        expires_at: now + ChronoDuration::minutes(10),
    };

    jsonwebtoken::encode(
        &Header::new(Algorithm::EdDSA),
        &claims,
        &EncodingKey::from_ed_pem(testing::TEST_PRIVATE_KEY_PEM.as_bytes()).unwrap(),
    )
    .expect("failed to encode jwt")
}

fn writer() -> String {
    mint_jwt(
        vec![Permission::COMPANIES_READ, Permission::COMPANIES_WRITE],
        vec![],
    )
}

fn acme() -> serde_json::Value {
    json!({
        "name": "Acme",
        "description": "Anvils and rockets",
        "employees": 40,
        "registered": true,
        "type": "corporations",
    })
}

async fn create(client: &reqwest::Client, srv: &TestServer, token: &str) -> serde_json::Value {
    let res = client
        .post(srv.url("/companies"))
        .bearer_auth(token)
        .json(&acme())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    res.json().await.unwrap()
}

#[tokio::test]
async fn health_is_public() {
    let srv = TestServer::spawn().await;
    let res = reqwest::get(srv.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn auth_required_for_protected_endpoints() {
    let srv = TestServer::spawn().await;

    let client = reqwest::Client::new();
    let res = client.get(srv.url("/companies")).send().await.unwrap();

    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "unauthenticated");
    assert_eq!(srv.backends.store.calls(), 0);
}

#[tokio::test]
async fn company_lifecycle_create_update_delete() {
    let srv = TestServer::spawn().await;
    let events = srv.backends.bus.subscribe();
    let token = writer();
    let client = reqwest::Client::new();

    // Create
    let created = create(&client, &srv, &token).await;
    let id = created["id"].as_str().unwrap().to_string();
    assert!(!id.is_empty());
    assert_eq!(created["name"], "Acme");
    assert_eq!(created["revision"], 1);

    // Get
    let res = client
        .get(srv.url(&format!("/companies/{id}")))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let fetched: serde_json::Value = res.json().await.unwrap();
    assert_eq!(fetched, created);

    // Partial update, clearing the description
    let res = client
        .patch(srv.url(&format!("/companies/{id}")))
        .bearer_auth(&token)
        .json(&json!({ "employees": 41, "description": null }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let patched: serde_json::Value = res.json().await.unwrap();
    assert_eq!(patched["employees"], 41);
    assert_eq!(patched["description"], serde_json::Value::Null);
    assert_eq!(patched["revision"], 2);

    // Full replacement
    let res = client
        .put(srv.url(&format!("/companies/{id}")))
        .bearer_auth(&token)
        .json(&json!({
            "name": "Acme Co",
            "employees": 2,
            "registered": false,
            "type": "cooperative",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let replaced: serde_json::Value = res.json().await.unwrap();
    assert_eq!(replaced["name"], "Acme Co");
    assert_eq!(replaced["type"], "cooperative");
    assert_eq!(replaced["revision"], 3);

    // Delete
    let res = client
        .delete(srv.url(&format!("/companies/{id}")))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .get(srv.url(&format!("/companies/{id}")))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let kinds: Vec<_> = events
        .drain()
        .iter()
        .map(|e| (e.kind(), e.sequence()))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (ChangeKind::Created, 1),
            (ChangeKind::Updated, 2),
            (ChangeKind::Updated, 3),
            (ChangeKind::Deleted, 4),
        ]
    );
}

#[tokio::test]
async fn missing_scope_is_unauthenticated_and_touches_nothing() {
    let srv = TestServer::spawn().await;
    let events = srv.backends.bus.subscribe();
    let token = mint_jwt(vec![Permission::COMPANIES_READ], vec![]);

    let client = reqwest::Client::new();
    let res = client
        .post(srv.url("/companies"))
        .bearer_auth(&token)
        .json(&acme())
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "unauthenticated");
    assert_eq!(srv.backends.store.calls(), 0);
    assert!(events.drain().is_empty());
}

#[tokio::test]
async fn update_of_unknown_company_is_not_found() {
    let srv = TestServer::spawn().await;
    let events = srv.backends.bus.subscribe();
    let client = reqwest::Client::new();

    let res = client
        .patch(srv.url(&format!(
            "/companies/{}",
            companies_core::CompanyId::new()
        )))
        .bearer_auth(writer())
        .json(&json!({ "employees": 1 }))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert!(events.drain().is_empty());
}

#[tokio::test]
async fn bad_input_is_rejected() {
    let srv = TestServer::spawn().await;
    let token = writer();
    let client = reqwest::Client::new();

    let res = client
        .get(srv.url("/companies/not-a-uuid"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_id");

    let mut long_name = acme();
    long_name["name"] = json!("Sixteen chars!!!");
    let res = client
        .post(srv.url("/companies"))
        .bearer_auth(&token)
        .json(&long_name)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");

    let res = client
        .post(srv.url("/companies"))
        .bearer_auth(&token)
        .json(&json!({ "name": "Acme", "type": "guild" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn credentials_are_checked_before_the_request_body() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let forged = format!("{}x", writer());

    let res = client
        .post(srv.url("/companies"))
        .bearer_auth(&forged)
        .json(&json!({ "name": "", "type": "guild" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "unauthenticated");
    assert_eq!(body["retry_safe"], false);

    let reader = mint_jwt(vec![Permission::COMPANIES_READ], vec![]);
    let res = client
        .patch(srv.url("/companies/not-a-uuid"))
        .bearer_auth(&reader)
        .json(&json!({ "employees": -1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(srv.backends.store.calls(), 0);
}

#[tokio::test]
async fn duplicate_name_is_conflict() {
    let srv = TestServer::spawn().await;
    let token = writer();
    let client = reqwest::Client::new();
    create(&client, &srv, &token).await;

    let res = client
        .post(srv.url("/companies"))
        .bearer_auth(&token)
        .json(&acme())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn list_is_paged() {
    let srv = TestServer::spawn().await;
    let token = mint_jwt(vec![], vec![Role::ADMIN]);
    let client = reqwest::Client::new();

    for name in ["One", "Two", "Three"] {
        let mut body = acme();
        body["name"] = json!(name);
        let res = client
            .post(srv.url("/companies"))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
    }

    let res = client
        .get(srv.url("/companies?limit=2&offset=1"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["items"].as_array().unwrap().len(), 2);
    assert_eq!(body["limit"], 2);
    assert_eq!(body["offset"], 1);
}

#[tokio::test]
async fn broker_outage_is_reported_and_recovered_with_idempotency_key() {
    let srv = TestServer::spawn().await;
    let events = srv.backends.bus.subscribe();
    let token = writer();
    let client = reqwest::Client::new();

    srv.backends.bus.set_available(false);
    let res = client
        .post(srv.url("/companies"))
        .bearer_auth(&token)
        .header("Idempotency-Key", "create-acme-1")
        .json(&acme())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "emit_incomplete");
    assert_eq!(body["sequence"], 1);
    let id = body["company"]["id"].as_str().unwrap().to_string();

    // Committed despite the failed emit.
    let res = client
        .get(srv.url(&format!("/companies/{id}")))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    srv.backends.bus.set_available(true);
    let res = client
        .post(srv.url("/companies"))
        .bearer_auth(&token)
        .header("Idempotency-Key", "create-acme-1")
        .json(&acme())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let replayed: serde_json::Value = res.json().await.unwrap();
    assert_eq!(replayed["id"], id.as_str());

    let mut dedup = EventDeduplicator::new();
    let delivered: Vec<_> = events
        .drain()
        .into_iter()
        .filter(|e| dedup.accept(e))
        .collect();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].kind(), ChangeKind::Created);
}

#[tokio::test]
async fn republish_recovers_a_lost_delete_event() {
    let srv = TestServer::spawn().await;
    let events = srv.backends.bus.subscribe();
    let token = writer();
    let client = reqwest::Client::new();

    let created = create(&client, &srv, &token).await;
    let id = created["id"].as_str().unwrap().to_string();
    events.drain();

    srv.backends.bus.set_available(false);
    let res = client
        .delete(srv.url(&format!("/companies/{id}")))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);

    let res = client
        .post(srv.url(&format!("/companies/{id}/republish")))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(res.headers().contains_key("retry-after"));

    srv.backends.bus.set_available(true);
    let res = client
        .post(srv.url(&format!("/companies/{id}/republish")))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["sequence"], 2);

    let delivered = events.drain();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].kind(), ChangeKind::Deleted);
}

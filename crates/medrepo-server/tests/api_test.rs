//! REST surface over the in-memory engine, driven through the router.

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, StatusCode, header};
use medrepo_server::config::{ShardSettings, TenantAssignmentSettings};
use medrepo_server::{AppConfig, Services, build_app, build_services};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

struct TestApp {
    app: Router,
    services: Services,
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.services.dispatcher.shutdown();
    }
}

fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.storage.shards = vec![
        ShardSettings {
            id: "shard-a".into(),
            url: None,
            schema: None,
        },
        ShardSettings {
            id: "shard-b".into(),
            url: None,
            schema: None,
        },
    ];
    cfg.storage.tenants = vec![TenantAssignmentSettings {
        tenant: "acme".into(),
        shard: "shard-a".into(),
    }];
    cfg.search.default_count = 2;
    cfg.search.max_count = 3;
    cfg
}

async fn test_app() -> TestApp {
    let cfg = test_config();
    let services = build_services(&cfg, CancellationToken::new())
        .await
        .unwrap();
    TestApp {
        app: build_app(&cfg, services.clone()),
        services,
    }
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Value,
}

impl TestApp {
    async fn send(
        &self,
        method: Method,
        uri: &str,
        tenant: Option<&str>,
        extra: &[(&str, &str)],
        body: Option<Value>,
    ) -> Reply {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(tenant) = tenant {
            builder = builder.header("x-tenant-id", tenant);
        }
        for (name, value) in extra {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/fhir+json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        Reply {
            status,
            headers,
            body,
        }
    }

    async fn create_patient(&self, gender: &str) -> String {
        let reply = self
            .send(
                Method::POST,
                "/fhir/Patient",
                Some("acme"),
                &[],
                Some(json!({"resourceType": "Patient", "gender": gender})),
            )
            .await;
        assert_eq!(reply.status, StatusCode::CREATED);
        reply.body["id"].as_str().unwrap().to_string()
    }
}

fn header_str<'a>(reply: &'a Reply, name: header::HeaderName) -> &'a str {
    reply.headers.get(name).unwrap().to_str().unwrap()
}

#[tokio::test]
async fn test_create_update_and_stale_conflict() {
    let app = test_app().await;
    let created = app
        .send(
            Method::POST,
            "/fhir/Patient",
            Some("acme"),
            &[],
            Some(json!({"resourceType": "Patient", "gender": "female"})),
        )
        .await;
    assert_eq!(created.status, StatusCode::CREATED);
    let id = created.body["id"].as_str().unwrap().to_string();
    assert_eq!(header_str(&created, header::ETAG), "W/\"1\"");
    assert_eq!(
        header_str(&created, header::LOCATION),
        format!("/fhir/Patient/{id}/_history/1")
    );
    assert!(created.headers.contains_key(header::LAST_MODIFIED));
    assert_eq!(
        header_str(&created, header::CONTENT_TYPE),
        "application/fhir+json"
    );

    let uri = format!("/fhir/Patient/{id}");
    let updated = app
        .send(
            Method::PUT,
            &uri,
            Some("acme"),
            &[("if-match", "W/\"1\"")],
            Some(json!({"resourceType": "Patient", "gender": "other"})),
        )
        .await;
    assert_eq!(updated.status, StatusCode::OK);
    assert_eq!(header_str(&updated, header::ETAG), "W/\"2\"");
    assert_eq!(updated.body["meta"]["versionId"], "2");

    let stale = app
        .send(
            Method::PUT,
            &uri,
            Some("acme"),
            &[("if-match", "W/\"1\"")],
            Some(json!({"resourceType": "Patient", "gender": "male"})),
        )
        .await;
    assert_eq!(stale.status, StatusCode::PRECONDITION_FAILED);
    assert_eq!(stale.body["resourceType"], "OperationOutcome");
    assert_eq!(stale.body["issue"][0]["code"], "conflict");

    let read = app.send(Method::GET, &uri, Some("acme"), &[], None).await;
    assert_eq!(read.status, StatusCode::OK);
    assert_eq!(read.body["gender"], "other");
    assert_eq!(header_str(&read, header::ETAG), "W/\"2\"");
}

#[tokio::test]
async fn test_update_requires_if_match() {
    let app = test_app().await;
    let id = app.create_patient("female").await;

    let reply = app
        .send(
            Method::PUT,
            &format!("/fhir/Patient/{id}"),
            Some("acme"),
            &[],
            Some(json!({"resourceType": "Patient"})),
        )
        .await;
    assert_eq!(reply.status, StatusCode::PRECONDITION_REQUIRED);

    let mismatched = app
        .send(
            Method::PUT,
            &format!("/fhir/Patient/{id}"),
            Some("acme"),
            &[("if-match", "W/\"1\"")],
            Some(json!({"resourceType": "Patient", "id": "someone-else"})),
        )
        .await;
    assert_eq!(mismatched.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_delete_keeps_history() {
    let app = test_app().await;
    let id = app.create_patient("female").await;
    let uri = format!("/fhir/Patient/{id}");

    let deleted = app.send(Method::DELETE, &uri, Some("acme"), &[], None).await;
    assert_eq!(deleted.status, StatusCode::NO_CONTENT);
    assert_eq!(header_str(&deleted, header::ETAG), "W/\"2\"");

    let gone = app.send(Method::GET, &uri, Some("acme"), &[], None).await;
    assert_eq!(gone.status, StatusCode::GONE);
    assert_eq!(gone.body["issue"][0]["code"], "deleted");

    let again = app.send(Method::DELETE, &uri, Some("acme"), &[], None).await;
    assert_eq!(again.status, StatusCode::GONE);

    let history = app
        .send(
            Method::GET,
            &format!("{uri}/_history"),
            Some("acme"),
            &[],
            None,
        )
        .await;
    assert_eq!(history.status, StatusCode::OK);
    assert_eq!(history.body["type"], "history");
    assert_eq!(history.body["total"], 2);
    assert_eq!(history.body["entry"][0]["resource"]["gender"], "female");
    assert_eq!(history.body["entry"][1]["request"]["method"], "DELETE");

    let v1 = app
        .send(
            Method::GET,
            &format!("{uri}/_history/1"),
            Some("acme"),
            &[],
            None,
        )
        .await;
    assert_eq!(v1.status, StatusCode::OK);
    assert_eq!(v1.body["meta"]["versionId"], "1");

    let v2 = app
        .send(
            Method::GET,
            &format!("{uri}/_history/2"),
            Some("acme"),
            &[],
            None,
        )
        .await;
    assert_eq!(v2.status, StatusCode::GONE);

    let v9 = app
        .send(
            Method::GET,
            &format!("{uri}/_history/9"),
            Some("acme"),
            &[],
            None,
        )
        .await;
    assert_eq!(v9.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_resource_is_not_found() {
    let app = test_app().await;
    let reply = app
        .send(Method::GET, "/fhir/Patient/nope", Some("acme"), &[], None)
        .await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_eq!(reply.body["issue"][0]["code"], "not-found");

    let bogus_type = app
        .send(
            Method::POST,
            "/fhir/Spaceship",
            Some("acme"),
            &[],
            Some(json!({"resourceType": "Spaceship"})),
        )
        .await;
    assert_eq!(bogus_type.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_search_filters_and_caps_count() {
    let app = test_app().await;
    for gender in ["female", "female", "female", "female", "male"] {
        app.create_patient(gender).await;
    }

    let males = app
        .send(Method::GET, "/fhir/Patient?gender=male", Some("acme"), &[], None)
        .await;
    assert_eq!(males.status, StatusCode::OK);
    assert_eq!(males.body["type"], "searchset");
    assert_eq!(males.body["total"], 1);
    assert_eq!(males.body["entry"][0]["resource"]["gender"], "male");

    let default_page = app
        .send(Method::GET, "/fhir/Patient?gender=female", Some("acme"), &[], None)
        .await;
    assert_eq!(default_page.body["total"], 2);

    let capped = app
        .send(
            Method::GET,
            "/fhir/Patient?gender=female&_count=50",
            Some("acme"),
            &[],
            None,
        )
        .await;
    assert_eq!(capped.body["total"], 3);

    let unknown = app
        .send(Method::GET, "/fhir/Patient?shoe-size=9", Some("acme"), &[], None)
        .await;
    assert_eq!(unknown.status, StatusCode::BAD_REQUEST);
    assert_eq!(unknown.body["issue"][0]["code"], "invalid");
}

#[tokio::test]
async fn test_tenant_without_shard_is_unavailable() {
    let app = test_app().await;
    let body = json!({"resourceType": "Patient"});

    let no_tenant = app
        .send(Method::POST, "/fhir/Patient", None, &[], Some(body.clone()))
        .await;
    assert_eq!(no_tenant.status, StatusCode::SERVICE_UNAVAILABLE);

    let unassigned = app
        .send(
            Method::POST,
            "/fhir/Patient",
            Some("globex"),
            &[],
            Some(body.clone()),
        )
        .await;
    assert_eq!(unassigned.status, StatusCode::SERVICE_UNAVAILABLE);

    let assigned = app
        .send(
            Method::PUT,
            "/admin/tenants/globex/shard",
            None,
            &[],
            Some(json!({"shard": "shard-b"})),
        )
        .await;
    assert_eq!(assigned.status, StatusCode::OK);
    assert_eq!(assigned.body["shard"], "shard-b");

    let created = app
        .send(Method::POST, "/fhir/Patient", Some("globex"), &[], Some(body))
        .await;
    assert_eq!(created.status, StatusCode::CREATED);

    let tenants = app.send(Method::GET, "/admin/tenants", None, &[], None).await;
    let names: Vec<&str> = tenants
        .body
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["tenant_id"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["acme", "globex"]);
}

#[tokio::test]
async fn test_unprovisioned_shard_cannot_be_assigned() {
    let app = test_app().await;
    let reply = app
        .send(
            Method::PUT,
            "/admin/tenants/initech/shard",
            None,
            &[],
            Some(json!({"shard": "shard-z"})),
        )
        .await;
    assert_eq!(reply.status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_healthz_reports_shards() {
    let app = test_app().await;
    let reply = app.send(Method::GET, "/healthz", None, &[], None).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["status"], "ok");
    assert_eq!(reply.body["shards"].as_array().unwrap().len(), 5);
    assert_eq!(reply.body["sessions"], 0);
}

#[tokio::test]
async fn test_shard_admin_actions() {
    let app = test_app().await;

    let healthy = app
        .send(
            Method::POST,
            "/admin/shards/shard-a/clear-failure",
            None,
            &[],
            None,
        )
        .await;
    assert_eq!(healthy.status, StatusCode::BAD_REQUEST);

    let activated = app
        .send(Method::POST, "/admin/shards/shard-a/activate", None, &[], None)
        .await;
    assert_eq!(activated.status, StatusCode::OK);
    assert_eq!(activated.body["shard"], "shard-a");

    let missing = app
        .send(Method::POST, "/admin/shards/shard-z/activate", None, &[], None)
        .await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_refresh_with_unknown_token_is_unauthorized() {
    let app = test_app().await;
    let reply = app
        .send(
            Method::POST,
            "/fhir/Subscription/$refresh-token",
            Some("acme"),
            &[],
            Some(json!({"token": "not-a-token"})),
        )
        .await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_events_endpoint_only_for_subscriptions() {
    let app = test_app().await;
    let id = app.create_patient("female").await;
    let reply = app
        .send(
            Method::GET,
            &format!("/fhir/Patient/{id}/$events"),
            Some("acme"),
            &[],
            None,
        )
        .await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
}

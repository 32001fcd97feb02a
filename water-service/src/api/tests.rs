use std::sync::{Arc, Mutex};

use axum::{
    body::{Body, Bytes},
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use super::*;
use crate::{
    notify::{NotifyError, ReminderOutcome, ReminderRequest},
    store::{MemoryStore, ResidentStore},
};

const TOKEN: &str = "let-me-in";

#[derive(Default)]
struct RecordingNotifier {
    requests: Mutex<Vec<ReminderRequest>>,
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn send_reminders(&self, request: &ReminderRequest) -> Result<ReminderOutcome, NotifyError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(ReminderOutcome {
            sent: request.residents.len(),
            failed: 0,
        })
    }
}

struct Harness {
    router: Router,
    store: Arc<MemoryStore>,
    notifier: Arc<RecordingNotifier>,
}

fn harness(admin_token: Option<&str>) -> Harness {
    let token_line = admin_token
        .map(|t| format!("admin_token = \"{t}\""))
        .unwrap_or_default();
    let cfg = AppConfig::from_toml(&format!(
        r#"
        [server]
        bind_addr = "127.0.0.1:0"
        public_base_url = "https://water.example.org/"
        {token_line}

        [store]
        kind = "memory"

        [billing]
        unit_price = 2.5
        "#
    ))
    .unwrap();

    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let state = AppState::new(store.clone(), notifier.clone(), &cfg);
    Harness {
        router: router(state),
        store,
        notifier,
    }
}

async fn call(router: &Router, req: Request<Body>) -> (StatusCode, Bytes) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

fn request(method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(t) = token {
        builder = builder.header("authorization", format!("Bearer {t}"));
    }
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

fn parse(b: &Bytes) -> Value {
    serde_json::from_slice(b).unwrap()
}

async fn create(h: &Harness, apartment: &str, meters: u32, email: Option<&str>) -> String {
    let (status, body) = call(
        &h.router,
        request(
            "POST",
            "/api/residents",
            Some(TOKEN),
            Some(json!({
                "name": format!("Resident {apartment}"),
                "apartment": apartment,
                "email": email,
                "meter_count": meters,
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    parse(&body)["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_reports_backend() {
    let h = harness(Some(TOKEN));
    let (status, body) = call(&h.router, request("GET", "/health", None, None)).await;

    assert_eq!(status, StatusCode::OK);
    let json = parse(&body);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["backend"], "memory");
    assert_eq!(json["residents"], 0);
}

#[tokio::test]
async fn admin_routes_require_the_token() {
    let h = harness(Some(TOKEN));

    let (status, body) = call(&h.router, request("GET", "/api/residents", None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(parse(&body)["error"], "unauthorized");

    let (status, _) = call(&h.router, request("GET", "/api/residents", Some("wrong"), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call(&h.router, request("GET", "/api/residents", Some(TOKEN), None)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn admin_routes_are_open_without_configured_token() {
    let h = harness(None);
    let (status, _) = call(&h.router, request("GET", "/api/summary", None, None)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn resident_submits_readings_and_sees_consumption() {
    let h = harness(Some(TOKEN));
    let id = create(&h, "7-4/5", 1, None).await;

    for (date, value) in [("2024-02-01", 100.0), ("2024-03-01", 120.5)] {
        let (status, _) = call(
            &h.router,
            request(
                "POST",
                &format!("/api/residents/{id}/readings"),
                None,
                Some(json!({ "date": date, "meters": { "1": value } })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, body) = call(&h.router, request("GET", &format!("/api/residents/{id}/consumption"), None, None)).await;
    assert_eq!(status, StatusCode::OK);
    let json = parse(&body);
    assert_eq!(json["latest"], json!({ "meters": { "1": 20.5 }, "total": 20.5, "cost": 51.25 }));
    assert_eq!(json["series"].as_array().unwrap().len(), 2);
    assert_eq!(json["series"][0]["reading"]["date"], "2024-03-01");
    assert_eq!(json["series"][1]["delta"], Value::Null);
}

#[tokio::test]
async fn invalid_readings_are_unprocessable() {
    let h = harness(Some(TOKEN));
    let id = create(&h, "7-2", 2, None).await;

    let (status, body) = call(
        &h.router,
        request(
            "POST",
            &format!("/api/residents/{id}/readings"),
            None,
            Some(json!({ "date": "2024-03-01", "meters": { "1": 5.0 } })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(parse(&body)["error"], "validation");

    let (status, body) = call(
        &h.router,
        request("POST", &format!("/api/residents/{id}/readings"), None, Some(json!({ "date": "March" }))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(parse(&body)["error"], "bad_request");
}

#[tokio::test]
async fn unknown_resident_is_not_found() {
    let h = harness(Some(TOKEN));
    let (status, body) = call(&h.router, request("GET", "/api/residents/nobody", None, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(parse(&body)["error"], "not_found");
}

#[tokio::test]
async fn editing_and_deleting_readings_is_admin_only() {
    let h = harness(Some(TOKEN));
    let id = create(&h, "7-1", 1, None).await;

    let (_, body) = call(
        &h.router,
        request(
            "POST",
            &format!("/api/residents/{id}/readings"),
            None,
            Some(json!({ "date": "2024-02-01", "meters": { "1": 10.0 } })),
        ),
    )
    .await;
    let reading_id = parse(&body)["id"].as_str().unwrap().to_string();
    let uri = format!("/api/residents/{id}/readings/{reading_id}");
    let edit = json!({ "date": "2024-02-02", "meters": { "1": 11.0 } });

    let (status, _) = call(&h.router, request("PUT", &uri, None, Some(edit.clone()))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = call(&h.router, request("PUT", &uri, Some(TOKEN), Some(edit))).await;
    assert_eq!(status, StatusCode::OK);
    let edited = parse(&body);
    assert_eq!(edited["id"], reading_id.as_str());
    assert_eq!(edited["date"], "2024-02-02");

    let (status, _) = call(&h.router, request("DELETE", &uri, Some(TOKEN), None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&h.router, request("DELETE", &uri, Some(TOKEN), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn roster_is_sorted_and_share_link_is_built() {
    let h = harness(Some(TOKEN));
    create(&h, "7-12", 1, None).await;
    let first = create(&h, "7-4/5", 1, None).await;

    let (_, body) = call(&h.router, request("GET", "/api/residents", Some(TOKEN), None)).await;
    let apartments: Vec<String> = parse(&body)
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["apartment"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(apartments, vec!["7-4/5", "7-12"]);

    let (status, body) = call(&h.router, request("GET", &format!("/api/residents/{first}/link"), Some(TOKEN), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse(&body)["url"], format!("https://water.example.org/?resident={first}"));
}

#[tokio::test]
async fn deleting_a_resident_cascades() {
    let h = harness(Some(TOKEN));
    let id = create(&h, "7-1", 1, None).await;
    call(
        &h.router,
        request(
            "POST",
            &format!("/api/residents/{id}/readings"),
            None,
            Some(json!({ "date": "2024-02-01", "meters": { "1": 10.0 } })),
        ),
    )
    .await;

    let (status, _) = call(&h.router, request("DELETE", &format!("/api/residents/{id}"), Some(TOKEN), None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(h.store.list_residents().await.unwrap().is_empty());
}

#[tokio::test]
async fn patch_updates_meter_count() {
    let h = harness(Some(TOKEN));
    let id = create(&h, "7-1", 1, None).await;

    let (status, body) = call(
        &h.router,
        request("PUT", &format!("/api/residents/{id}"), Some(TOKEN), Some(json!({ "meter_count": 3 }))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse(&body)["meter_count"], 3);

    let (status, _) = call(
        &h.router,
        request("PUT", &format!("/api/residents/{id}"), Some(TOKEN), Some(json!({ "meter_count": 0 }))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn summary_export_and_reminders() {
    let h = harness(Some(TOKEN));
    let with_email = create(&h, "7-1", 1, Some("one@example.org")).await;
    create(&h, "7-2", 1, None).await;
    for (date, value) in [("2024-01-01", 10.0), ("2024-02-01", 14.0)] {
        call(
            &h.router,
            request(
                "POST",
                &format!("/api/residents/{with_email}/readings"),
                None,
                Some(json!({ "date": date, "meters": { "1": value } })),
            ),
        )
        .await;
    }

    let (_, body) = call(&h.router, request("GET", "/api/summary", Some(TOKEN), None)).await;
    let summary = parse(&body);
    assert_eq!(summary["residents"], 2);
    assert_eq!(summary["residents_without_data"], 1);
    assert_eq!(summary["total"], 4.0);
    assert_eq!(summary["cost"], 10.0);

    let (status, body) = call(&h.router, request("GET", "/api/export.csv", Some(TOKEN), None)).await;
    assert_eq!(status, StatusCode::OK);
    let csv = String::from_utf8(body.to_vec()).unwrap();
    assert!(csv.starts_with("apartment,name,email,date,meter_1,period_total\n"));
    assert!(csv.contains("7-1,Resident 7-1,one@example.org,2024-02-01,14,4\n"));

    let (status, body) = call(
        &h.router,
        request("POST", "/api/reminders", Some(TOKEN), Some(json!({ "subject": "Readings due" }))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse(&body)["sent"], 1);

    let sent = h.notifier.requests.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "Readings due");
    assert_eq!(sent[0].residents[0].email, "one@example.org");
}

#[tokio::test]
async fn reminders_reject_a_malformed_body() {
    let h = harness(Some(TOKEN));
    create(&h, "7-1", 1, Some("one@example.org")).await;

    let malformed = Request::builder()
        .method("POST")
        .uri("/api/reminders")
        .header("authorization", format!("Bearer {TOKEN}"))
        .header("content-type", "application/json")
        .body(Body::from("{\"subject\": "))
        .unwrap();
    let (status, body) = call(&h.router, malformed).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(parse(&body)["error"], "bad_request");
    assert!(h.notifier.requests.lock().unwrap().is_empty());

    let (status, body) = call(&h.router, request("POST", "/api/reminders", Some(TOKEN), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse(&body)["failed"], 0);

    let sent = h.notifier.requests.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, crate::config::NotifyConfig::default().subject);
}

use std::sync::Arc;
use std::time::Duration;

use keepalive_core::KeepaliveConfig;
use keepalive_core::testing::{FakeClient, RecordingNotifier};
use keepalive_web::AppState;
use serde_json::{Value, json};

mod helpers {
    use super::*;

    pub struct TestApp {
        pub base: String,
        pub http: reqwest::Client,
        pub client: Arc<FakeClient>,
        pub notifier: Arc<RecordingNotifier>,
        pub state: Arc<AppState>,
        pub data_dir: tempfile::TempDir,
    }

    impl TestApp {
        pub fn url(&self, path: &str) -> String {
            format!("{}{}", self.base, path)
        }

        pub async fn post(&self, path: &str, body: Value) -> (u16, Value) {
            let resp = self.http.post(self.url(path)).json(&body).send().await.unwrap();
            let status = resp.status().as_u16();
            (status, resp.json().await.unwrap())
        }

        pub async fn get(&self, path: &str) -> (u16, Value) {
            let resp = self.http.get(self.url(path)).send().await.unwrap();
            let status = resp.status().as_u16();
            (status, resp.json().await.unwrap())
        }

        pub async fn delete(&self, path: &str) -> (u16, Value) {
            let resp = self.http.delete(self.url(path)).send().await.unwrap();
            let status = resp.status().as_u16();
            (status, resp.json().await.unwrap())
        }
    }

    pub async fn start_app(config: KeepaliveConfig) -> TestApp {
        let data_dir = tempfile::tempdir().unwrap();
        let client = Arc::new(FakeClient::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let state = AppState::start(
            client.clone(),
            notifier.clone(),
            data_dir.path(),
            &config,
            Some("keepalive_bot".to_string()),
        )
        .await
        .unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = keepalive_web::router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        TestApp {
            base: format!("http://{addr}"),
            http: reqwest::Client::new(),
            client,
            notifier,
            state,
            data_dir,
        }
    }

    pub fn quiet_config() -> KeepaliveConfig {
        KeepaliveConfig {
            interval: Duration::from_secs(3600),
            jitter: Duration::ZERO,
            ..Default::default()
        }
    }

    /// Read SSE chunks until `needle` shows up, returning everything read.
    pub async fn read_until(resp: &mut reqwest::Response, needle: &str) -> String {
        let mut seen = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !seen.contains(needle) {
            let chunk = tokio::time::timeout_at(deadline, resp.chunk())
                .await
                .expect("timed out waiting for sse event")
                .unwrap();
            match chunk {
                Some(bytes) => seen.push_str(&String::from_utf8_lossy(&bytes)),
                None => break,
            }
        }
        seen
    }
}

use helpers::{quiet_config, read_until, start_app};

#[tokio::test]
async fn health_reports_ok() {
    let app = start_app(quiet_config()).await;
    let (status, body) = app.get("/api/health").await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({"status": "ok"}));
}

#[tokio::test]
async fn login_then_create_task() {
    let app = start_app(quiet_config()).await;
    app.client.add_account("+15551234", 4242, "12345", None);

    let (status, body) = app.post("/api/login/start", json!({"phone": "+15551234"})).await;
    assert_eq!(status, 200, "{body}");
    let session_id = body["session_id"].as_str().unwrap().to_string();

    let (status, body) = app
        .post(
            "/api/login/code",
            json!({"session_id": session_id, "code": "12345"}),
        )
        .await;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["status"], "code_accepted");
    let credential = body["credential"].as_str().unwrap().to_string();

    let (status, body) = app
        .post("/api/task/validate", json!({"credential": credential}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["account_id"], 4242);
    assert_eq!(body["notify_target_hint"], 4242);
    assert_eq!(body["bot_name"], "keepalive_bot");

    let (status, body) = app
        .post(
            "/api/task/create",
            json!({"credential": credential, "notify_target": 4242}),
        )
        .await;
    assert_eq!(status, 200, "{body}");
    let uuid = body["uuid"].as_str().unwrap().to_string();

    let (status, task) = app.get(&format!("/api/task/{uuid}")).await;
    assert_eq!(status, 200);
    assert_eq!(task["account_id"], 4242);
    assert_eq!(task["credential"], credential.as_str());
    assert_eq!(task["consecutive_failures"], 0);
    assert!(task["last_heartbeat_ms"].is_null());

    let files = std::fs::read_dir(app.data_dir.path()).unwrap().count();
    assert_eq!(files, 1);

    // The session id is spent once the login succeeded.
    let (status, body) = app
        .post(
            "/api/login/code",
            json!({"session_id": session_id, "code": "12345"}),
        )
        .await;
    assert_eq!(status, 404);
    assert_eq!(body["code"], "session_not_found");
}

#[tokio::test]
async fn two_factor_login_over_http() {
    let app = start_app(quiet_config()).await;
    app.client.add_account("+15559876", 77, "55555", Some("s3cret"));

    let (_, body) = app.post("/api/login/start", json!({"phone": "+1 555 9876"})).await;
    let session_id = body["session_id"].as_str().unwrap().to_string();

    let (status, body) = app
        .post(
            "/api/login/code",
            json!({"session_id": session_id, "code": "55555"}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({"status": "password_required"}));

    let (status, body) = app
        .post(
            "/api/login/password",
            json!({"session_id": session_id, "password": "nope"}),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["code"], "challenge_rejected");

    let (status, body) = app
        .post(
            "/api/login/password",
            json!({"session_id": session_id, "password": "s3cret"}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["account_id"], 77);
    assert!(body["credential"].as_str().is_some());
}

#[tokio::test]
async fn request_errors_have_stable_kinds() {
    let app = start_app(quiet_config()).await;

    let (status, body) = app.post("/api/login/start", json!({"phone": ""})).await;
    assert_eq!(status, 400);
    assert_eq!(body["code"], "invalid_input");

    let (status, body) = app.post("/api/login/start", json!({"nope": 1})).await;
    assert_eq!(status, 400);
    assert_eq!(body["code"], "invalid_input");

    let (status, body) = app.post("/api/login/start", json!({"phone": "+15550000"})).await;
    assert_eq!(status, 502);
    assert_eq!(body["code"], "upstream_error");

    let (status, body) = app
        .post("/api/login/code", json!({"session_id": "missing", "code": "12345"}))
        .await;
    assert_eq!(status, 404);
    assert_eq!(body["code"], "session_not_found");

    let (status, body) = app
        .post("/api/task/validate", json!({"credential": "not-a-session"}))
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["code"], "invalid_credential");
    assert!(!body["message"].as_str().unwrap().contains("not-a-session"));

    let (status, body) = app.get("/api/task/not-a-uuid").await;
    assert_eq!(status, 400);
    assert_eq!(body["code"], "invalid_input");

    let (status, body) = app.get(&format!("/api/task/{}", uuid::Uuid::new_v4())).await;
    assert_eq!(status, 404);
    assert_eq!(body["code"], "task_not_found");
}

#[tokio::test]
async fn create_replaces_and_delete_is_reported() {
    let app = start_app(quiet_config()).await;
    let first_cred = app.client.add_credential(300);
    let second_cred = app.client.add_credential(300);

    let (_, first) = app
        .post("/api/task/create", json!({"credential": first_cred.expose()}))
        .await;
    let (_, second) = app
        .post("/api/task/create", json!({"credential": second_cred.expose()}))
        .await;
    let first_uuid = first["uuid"].as_str().unwrap().to_string();
    let second_uuid = second["uuid"].as_str().unwrap().to_string();
    assert_eq!(second["notify_target"], 300);

    let (status, _) = app.get(&format!("/api/task/{first_uuid}")).await;
    assert_eq!(status, 404);
    assert_eq!(app.state.scheduler.store().len().await, 1);

    let (status, body) = app.delete(&format!("/api/task/{second_uuid}")).await;
    assert_eq!(status, 200);
    assert_eq!(body["deleted"], second_uuid.as_str());
    let (status, body) = app.delete(&format!("/api/task/{second_uuid}")).await;
    assert_eq!(status, 404);
    assert_eq!(body["code"], "task_not_found");

    // One replacement notice and one deletion notice.
    assert_eq!(app.notifier.all().len(), 2);
}

#[tokio::test]
async fn manual_heartbeats_evict_at_ceiling() {
    let app = start_app(quiet_config()).await;
    let cred = app.client.add_credential(500);
    let (_, created) = app
        .post("/api/task/create", json!({"credential": cred.expose()}))
        .await;
    let uuid = created["uuid"].as_str().unwrap().to_string();
    let path = format!("/api/task/{uuid}/heartbeat");

    let (status, body) = app.post(&path, json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(body["heartbeat"], json!({"outcome": "succeeded"}));

    app.client.revoke(&cred);
    for failures in 1..3 {
        let (_, body) = app.post(&path, json!({})).await;
        assert_eq!(
            body["heartbeat"],
            json!({"outcome": "failed", "failures": failures})
        );
    }
    let (_, body) = app.post(&path, json!({})).await;
    assert_eq!(body["heartbeat"], json!({"outcome": "evicted", "failures": 3}));

    let (status, _) = app.get(&format!("/api/task/{uuid}")).await;
    assert_eq!(status, 404);
    let (status, body) = app.post(&path, json!({})).await;
    assert_eq!(status, 404);
    assert_eq!(body["code"], "task_not_found");
}

#[tokio::test]
async fn verify_stream_delivers_code() {
    let app = start_app(quiet_config()).await;
    let cred = app.client.add_credential(600);

    let mut resp = app
        .http
        .get(app.url("/api/verify/listen"))
        .query(&[("credential", cred.expose())])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert!(
        resp.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );

    let seen = read_until(&mut resp, "event: connected").await;
    assert!(seen.contains("waiting"));

    app.client
        .push_message(&cred, 777000, "Login code: 48213. Do not give this code to anyone");
    let seen = read_until(&mut resp, "event: code").await;
    let seen = if seen.contains("48213") {
        seen
    } else {
        read_until(&mut resp, "48213").await
    };
    assert!(seen.contains("48213"));
}

#[tokio::test]
async fn verify_stream_rejects_invalid_credential_and_missing_query() {
    let app = start_app(quiet_config()).await;

    let mut resp = app
        .http
        .get(app.url("/api/verify/listen?session_string=revoked-session"))
        .send()
        .await
        .unwrap();
    let seen = read_until(&mut resp, "auth_key_unregistered").await;
    assert!(seen.contains("event: error"));
    assert!(!seen.contains("event: connected"));

    let (status, body) = app.get("/api/verify/listen").await;
    assert_eq!(status, 400);
    assert_eq!(body["code"], "invalid_input");
}

#[tokio::test]
async fn verify_stream_capacity_is_503() {
    let config = KeepaliveConfig {
        subscription_capacity: 1,
        subscription_heartbeat: Duration::from_millis(50),
        ..quiet_config()
    };
    let app = start_app(config).await;
    let cred = app.client.add_credential(700);
    let listen = app.url("/api/verify/listen");

    let mut first = app
        .http
        .get(&listen)
        .query(&[("credential", cred.expose())])
        .send()
        .await
        .unwrap();
    read_until(&mut first, "event: connected").await;

    let second = app
        .http
        .get(&listen)
        .query(&[("credential", cred.expose())])
        .send()
        .await
        .unwrap();
    assert_eq!(second.status().as_u16(), 503);
    let body: Value = second.json().await.unwrap();
    assert_eq!(body["code"], "capacity_exceeded");

    // Hanging up frees the slot once the server notices the closed stream.
    drop(first);
    let mut reopened = None;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let resp = app
            .http
            .get(&listen)
            .query(&[("credential", cred.expose())])
            .send()
            .await
            .unwrap();
        if resp.status().as_u16() == 200 {
            reopened = Some(resp);
            break;
        }
    }
    assert!(reopened.is_some(), "slot was not released");
    assert_eq!(app.state.broker.active(), 1);
}

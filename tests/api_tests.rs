//! End-to-end tests against an in-process server.
//!
//! Each fixture binds an ephemeral port and serves the full middleware chain
//! with `ConnectInfo`, backed by the in-memory store and a capturing mailer.
//! No external services are needed.
//!
//! Run with: `cargo test --test api_tests`
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};

use movie_catalog::data::Permission;
use movie_catalog::mailer::{MemoryMailer, extract_token};
use movie_catalog::store::{self, MemoryDatabase};
use movie_catalog::{AppState, Config, ServeOutcome, ShutdownCoordinator, build_router};

struct TestFixture {
    base_url: String,
    client: Client,
    db: Arc<MemoryDatabase>,
    mailer: MemoryMailer,
    state: AppState,
    coordinator: ShutdownCoordinator,
    server: JoinHandle<std::io::Result<ServeOutcome>>,
}

impl TestFixture {
    async fn new(configure: impl FnOnce(&mut Config)) -> Self {
        let mut config = Config::default();
        config.bcrypt_cost = 4;
        config.health_check_interval = Duration::ZERO;
        config.limiter.enabled = false;
        config.shutdown_grace_period = Duration::from_secs(5);
        config.task_drain_timeout = Duration::from_secs(5);
        configure(&mut config);

        let db = Arc::new(MemoryDatabase::new());
        let mailer = MemoryMailer::new();
        let coordinator =
            ShutdownCoordinator::new(config.shutdown_grace_period, config.task_drain_timeout);
        let state = AppState::new(db.clone(), config, Arc::new(mailer.clone())).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state.clone());
        let serve = coordinator.clone();
        let server = tokio::spawn(async move { serve.serve(listener, app).await });

        Self {
            base_url: format!("http://{addr}"),
            client: Client::new(),
            db,
            mailer,
            state,
            coordinator,
            server,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, reqwest::header::HeaderMap, Value) {
        let mut req = self.client.request(method, self.url(path));
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }

        let res = req.send().await.unwrap();
        let status = res.status();
        let headers = res.headers().clone();
        let text = res.text().await.unwrap();
        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap()
        };
        (status, headers, body)
    }

    /// Wait for the background mailer to deliver a token to `email`.
    async fn mailed_token(&self, email: &str, subject_hint: &str) -> String {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(mail) = self.mailer.last_to(email)
                && mail.subject.contains(subject_hint)
            {
                return extract_token(&mail.plain_body).unwrap().to_string();
            }
            assert!(Instant::now() < deadline, "no email for {email}");
            sleep(Duration::from_millis(20)).await;
        }
    }

    /// Register, activate and log in; returns the bearer token.
    async fn activated_user(&self, email: &str, password: &str) -> (i64, String) {
        let (status, _, body) = self
            .request(
                reqwest::Method::POST,
                "/v1/users",
                None,
                Some(json!({ "name": "Test User", "email": email, "password": password })),
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED, "{body}");
        let user_id = body["user"]["id"].as_i64().unwrap();

        let activation = self.mailed_token(email, "Welcome").await;
        let (status, _, body) = self
            .request(
                reqwest::Method::PUT,
                "/v1/users/activated",
                None,
                Some(json!({ "token": activation })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["user"]["activated"], true);

        let token = self.login(email, password).await;
        (user_id, token)
    }

    async fn login(&self, email: &str, password: &str) -> String {
        let (status, _, body) = self
            .request(
                reqwest::Method::POST,
                "/v1/tokens/authentication",
                None,
                Some(json!({ "email": email, "password": password })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body["authentication_token"]["token"]
            .as_str()
            .unwrap()
            .to_string()
    }

    async fn grant_write(&self, user_id: i64) {
        store::transaction(self.db.as_ref(), move |tx| {
            Box::pin(async move {
                tx.grant_permissions(user_id, &[Permission::MoviesWrite])
                    .await
            })
        })
        .await
        .unwrap();
    }

    async fn stop(self) -> ServeOutcome {
        self.coordinator.trigger();
        let outcome = self.server.await.unwrap().unwrap();
        assert!(self.coordinator.drain(&self.state.background).await);
        self.state.shutdown().await;
        outcome
    }
}

// =============================================================================
// Account lifecycle
// =============================================================================

#[tokio::test]
async fn test_register_activate_and_authenticate() {
    let fx = TestFixture::new(|_| {}).await;
    let (_, token) = fx.activated_user("alice@example.com", "pa55word123").await;
    assert_eq!(token.len(), 26);

    let (status, _, body) = fx
        .request(reqwest::Method::GET, "/v1/movies", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["movies"], json!([]));
    assert_eq!(body["metadata"], json!({}));

    fx.stop().await;
}

#[tokio::test]
async fn test_duplicate_email_is_a_field_error() {
    let fx = TestFixture::new(|_| {}).await;
    let body = json!({ "name": "Bob", "email": "bob@example.com", "password": "pa55word123" });

    let (status, _, _) = fx
        .request(reqwest::Method::POST, "/v1/users", None, Some(body.clone()))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _, body) = fx
        .request(reqwest::Method::POST, "/v1/users", None, Some(body))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(
        body["fields"]["email"],
        "a user with this email address already exists"
    );

    fx.stop().await;
}

#[tokio::test]
async fn test_wrong_password_and_unknown_email_look_the_same() {
    let fx = TestFixture::new(|_| {}).await;
    fx.activated_user("carol@example.com", "pa55word123").await;

    for (email, password) in [
        ("carol@example.com", "wrong-password"),
        ("nobody@example.com", "pa55word123"),
    ] {
        let (status, headers, body) = fx
            .request(
                reqwest::Method::POST,
                "/v1/tokens/authentication",
                None,
                Some(json!({ "email": email, "password": password })),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid_credentials");
        assert_eq!(headers["www-authenticate"], "Bearer");
    }

    fx.stop().await;
}

#[tokio::test]
async fn test_password_reset_revokes_existing_tokens() {
    let fx = TestFixture::new(|_| {}).await;
    let (_, old_token) = fx.activated_user("dave@example.com", "pa55word123").await;

    let (status, _, _) = fx
        .request(
            reqwest::Method::POST,
            "/v1/tokens/password-reset",
            None,
            Some(json!({ "email": "dave@example.com" })),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let reset = fx.mailed_token("dave@example.com", "Reset").await;

    let (status, _, body) = fx
        .request(
            reqwest::Method::PUT,
            "/v1/users/password",
            None,
            Some(json!({ "password": "n3w-pa55word", "token": reset })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    // The reset token is single use
    let (status, _, body) = fx
        .request(
            reqwest::Method::PUT,
            "/v1/users/password",
            None,
            Some(json!({ "password": "another-pa55word", "token": reset })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["fields"]["token"], "invalid or expired password reset token");

    let (status, _, body) = fx
        .request(reqwest::Method::GET, "/v1/movies", Some(&old_token), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "invalid_or_expired_token");

    fx.login("dave@example.com", "n3w-pa55word").await;
    fx.stop().await;
}

// =============================================================================
// Movies
// =============================================================================

#[tokio::test]
async fn test_movie_crud_with_permissions() {
    let fx = TestFixture::new(|_| {}).await;
    let (user_id, token) = fx.activated_user("erin@example.com", "pa55word123").await;

    let movie = json!({
        "title": "Black Panther",
        "year": 2018,
        "runtime": 134,
        "genres": ["action", "adventure"]
    });

    // Read-only users cannot create
    let (status, _, body) = fx
        .request(reqwest::Method::POST, "/v1/movies", Some(&token), Some(movie.clone()))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "permission_denied");

    fx.grant_write(user_id).await;

    let (status, headers, body) = fx
        .request(reqwest::Method::POST, "/v1/movies", Some(&token), Some(movie))
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let id = body["movie"]["id"].as_i64().unwrap();
    assert_eq!(headers["location"], format!("/v1/movies/{id}").as_str());
    assert_eq!(body["movie"]["version"], 1);

    let (status, _, body) = fx
        .request(
            reqwest::Method::PATCH,
            &format!("/v1/movies/{id}"),
            Some(&token),
            Some(json!({ "title": "Black Panther: Wakanda Forever", "year": 2022 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["movie"]["version"], 2);
    assert_eq!(body["movie"]["runtime"], 134);

    let (status, _, body) = fx
        .request(
            reqwest::Method::GET,
            "/v1/movies?title=wakanda&sort=-year",
            Some(&token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["movies"].as_array().unwrap().len(), 1);
    assert_eq!(body["metadata"]["total_records"], 1);

    let (status, _, _) = fx
        .request(reqwest::Method::DELETE, &format!("/v1/movies/{id}"), Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = fx
        .request(reqwest::Method::GET, &format!("/v1/movies/{id}"), Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    fx.stop().await;
}

#[tokio::test]
async fn test_invalid_json_bodies_are_sanitized() {
    let fx = TestFixture::new(|_| {}).await;

    let res = fx
        .client
        .post(fx.url("/v1/users"))
        .header("content-type", "application/json")
        .body(r#"{"name": "x", "#)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "bad_request");

    let (status, _, body) = fx
        .request(
            reqwest::Method::POST,
            "/v1/users",
            None,
            Some(json!({ "name": "x", "email": "x@example.com", "password": "pa55word123", "admin": true })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!body["message"].as_str().unwrap().contains("RegisterUserRequest"));

    fx.stop().await;
}

// =============================================================================
// Rate limiting
// =============================================================================

#[tokio::test]
async fn test_rate_limiter_rejects_after_burst() {
    let fx = TestFixture::new(|config| {
        config.limiter.enabled = true;
        config.limiter.rps = 2.0;
        config.limiter.burst = 4;
    })
    .await;

    let mut statuses = Vec::new();
    for _ in 0..6 {
        let (status, headers, _) = fx
            .request(reqwest::Method::GET, "/v1/healthcheck", None, None)
            .await;
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after: u64 = headers["retry-after"].to_str().unwrap().parse().unwrap();
            assert!(retry_after >= 1);
        }
        statuses.push(status);
    }

    assert!(statuses[..4].iter().all(|s| *s == StatusCode::OK));
    assert_eq!(statuses[5], StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(fx.state.limiter.tracked_clients(), 1);

    fx.stop().await;
}

#[tokio::test]
async fn test_rate_limited_requests_never_reach_the_token_store() {
    let fx = TestFixture::new(|config| {
        config.limiter.enabled = true;
        config.limiter.rps = 0.01;
        config.limiter.burst = 1;
    })
    .await;

    let (status, _, _) = fx
        .request(reqwest::Method::GET, "/v1/healthcheck", None, None)
        .await;
    assert_eq!(status, StatusCode::OK);

    // A bogus token would be 401 if the authenticator ran
    let (status, _, body) = fx
        .request(
            reqwest::Method::GET,
            "/v1/movies",
            Some("ABCDEFGHIJKLMNOPQRSTUVWXYZ"),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "rate_limit_exceeded");

    fx.stop().await;
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn test_shutdown_drains_queued_emails() {
    let fx = TestFixture::new(|_| {}).await;

    let (status, _, _) = fx
        .request(
            reqwest::Method::POST,
            "/v1/users",
            None,
            Some(json!({ "name": "Frank", "email": "frank@example.com", "password": "pa55word123" })),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let mailer = fx.mailer.clone();
    let background = fx.state.background.clone();
    assert_eq!(fx.stop().await, ServeOutcome::Graceful);

    assert_eq!(background.outstanding(), 0);
    assert!(mailer.last_to("frank@example.com").is_some());
    assert!(!background.run("late", async {}));
}

#[tokio::test]
async fn test_readiness_reports_draining() {
    let fx = TestFixture::new(|_| {}).await;

    let (status, _, _) = fx.request(reqwest::Method::GET, "/ready", None, None).await;
    assert_eq!(status, StatusCode::OK);

    // Draining starts before the listener closes
    assert!(fx.state.background.drain(Duration::from_secs(1)).await);

    let (status, _, _) = fx.request(reqwest::Method::GET, "/ready", None, None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, _, body) = fx
        .request(reqwest::Method::GET, "/v1/healthcheck", None, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "shutting_down");

    fx.stop().await;
}

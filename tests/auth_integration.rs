use std::net::TcpListener;
use std::sync::Arc;

use authcore::auth::AuthenticationService;
use authcore::configuration::{AuthSettings, JwtSettings};
use authcore::startup::run;
use authcore::store::MemoryStore;
use serde_json::{json, Value};

pub struct TestApp {
    pub address: String,
    pub store: Arc<MemoryStore>,
    pub client: reqwest::Client,
}

impl TestApp {
    async fn post(&self, path: &str, body: &Value) -> reqwest::Response {
        self.client
            .post(&format!("{}{}", self.address, path))
            .json(body)
            .send()
            .await
            .expect("Failed to execute request.")
    }

    async fn register(&self, username: &str, email: &str, password: &str) -> reqwest::Response {
        self.post(
            "/auth/register",
            &json!({
                "username": username,
                "email": email,
                "password": password,
                "confirmPassword": password
            }),
        )
        .await
    }

    async fn login(&self, username: &str, password: &str) -> reqwest::Response {
        self.post(
            "/auth/login",
            &json!({ "username": username, "password": password }),
        )
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> reqwest::Response {
        self.post("/auth/refresh", &json!({ "refreshToken": refresh_token }))
            .await
    }
}

fn spawn_app_with(refresh_token_expiry_days: i64) -> TestApp {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind random port");
    let port = listener.local_addr().unwrap().port();
    let address = format!("http://127.0.0.1:{}", port);

    let jwt = JwtSettings {
        secret: "http-test-secret-with-enough-length".to_string(),
        issuer: "authcore".to_string(),
        audience: "authcore-clients".to_string(),
        access_token_expiry_minutes: 15,
        refresh_token_expiry_days,
    };
    let settings = AuthSettings {
        demo_account: true,
        password_hash_cost: 4,
        ..AuthSettings::default()
    };

    let store = Arc::new(MemoryStore::new());
    let service = AuthenticationService::new(store.clone(), jwt, settings);
    let server = run(listener, service).expect("Failed to bind address");
    let _ = tokio::spawn(server);

    TestApp {
        address,
        store,
        client: reqwest::Client::new(),
    }
}

fn spawn_app() -> TestApp {
    spawn_app_with(7)
}

fn field_names(body: &Value) -> Vec<String> {
    body["fields"]
        .as_array()
        .map(|fields| {
            fields
                .iter()
                .filter_map(|f| f["field"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

// --- Registration Tests ---

#[tokio::test]
async fn register_returns_200_for_valid_data() {
    let app = spawn_app();

    let response = app
        .register("john_doe", "John@Example.com", "Secure1!")
        .await;

    assert_eq!(200, response.status().as_u16());
    let body: Value = response.json().await.expect("Failed to parse response");
    assert!(body["accessToken"].is_string());
    assert!(body["refreshToken"].is_string());
    assert_eq!(body["user"]["username"], "john_doe");
    assert_eq!(body["user"]["email"], "john@example.com");
    assert!(body["user"]["id"].is_string());
    assert_eq!(app.store.identity_count().unwrap(), 1);
}

#[tokio::test]
async fn register_reports_every_invalid_field() {
    let app = spawn_app();

    let response = app
        .post(
            "/auth/register",
            &json!({
                "username": "x",
                "email": "not-an-email",
                "password": "weak",
                "confirmPassword": "different"
            }),
        )
        .await;

    assert_eq!(400, response.status().as_u16());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "VALIDATION_ERROR");
    let fields = field_names(&body);
    for expected in ["username", "email", "password", "confirmPassword"] {
        assert!(
            fields.iter().any(|f| f == expected),
            "missing field error for {}: {:?}",
            expected,
            fields
        );
    }
    assert_eq!(app.store.identity_count().unwrap(), 0);
}

#[tokio::test]
async fn register_returns_400_for_weak_passwords() {
    let app = spawn_app();
    let test_cases = vec![
        ("Sh1!", "too few characters"),
        ("alllower1!", "missing uppercase"),
        ("ALLUPPER1!", "missing lowercase"),
        ("NoDigits!!", "missing digit"),
        ("NoSpecial1", "missing special character"),
        ("Has Space1!", "disallowed character"),
    ];

    for (password, description) in test_cases {
        let response = app.register("weakling", "weak@example.com", password).await;
        assert_eq!(
            400,
            response.status().as_u16(),
            "The API did not reject a password with {}.",
            description
        );
    }
    assert_eq!(app.store.identity_count().unwrap(), 0);
}

#[tokio::test]
async fn register_returns_400_for_duplicate_username() {
    let app = spawn_app();

    let first = app.register("alice", "alice@example.com", "Secret1!").await;
    assert_eq!(200, first.status().as_u16());

    let second = app.register("alice", "other@example.com", "Secret1!").await;
    assert_eq!(400, second.status().as_u16());
    let body: Value = second.json().await.unwrap();
    assert_eq!(body["code"], "DUPLICATE_USERNAME");
    assert_eq!(field_names(&body), vec!["username".to_string()]);
    assert_eq!(app.store.identity_count().unwrap(), 1);
}

#[tokio::test]
async fn register_returns_400_for_duplicate_email() {
    let app = spawn_app();

    app.register("alice", "alice@example.com", "Secret1!").await;
    let response = app.register("bob", "ALICE@example.com", "Secret1!").await;

    assert_eq!(400, response.status().as_u16());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "DUPLICATE_EMAIL");
}

// --- Login Tests ---

#[tokio::test]
async fn login_returns_session_for_valid_credentials() {
    let app = spawn_app();
    app.register("alice", "alice@example.com", "Secret1!").await;

    let response = app.login("alice", "Secret1!").await;

    assert_eq!(200, response.status().as_u16());
    let body: Value = response.json().await.unwrap();
    assert!(body["accessToken"].is_string());
    assert!(body["refreshToken"].is_string());
    assert_eq!(body["username"], "alice");
    assert!(body["expiresAt"].is_string());
}

#[tokio::test]
async fn login_returns_same_401_for_wrong_password_and_unknown_user() {
    let app = spawn_app();
    app.register("alice", "alice@example.com", "Secret1!").await;

    let wrong_password = app.login("alice", "Wrong1!!").await;
    let unknown_user = app.login("nobody", "Secret1!").await;

    assert_eq!(401, wrong_password.status().as_u16());
    assert_eq!(401, unknown_user.status().as_u16());

    let a: Value = wrong_password.json().await.unwrap();
    let b: Value = unknown_user.json().await.unwrap();
    assert_eq!(a["code"], "INVALID_CREDENTIALS");
    assert_eq!(a["message"], "Invalid username or password");
    assert_eq!(a["message"], b["message"]);
    assert_eq!(a["code"], b["code"]);
}

#[tokio::test]
async fn demo_login_provisions_the_demo_account() {
    let app = spawn_app();

    let first = app.login("demo", "demo123").await;
    assert_eq!(200, first.status().as_u16());
    let second = app.login("demo", "demo123").await;
    assert_eq!(200, second.status().as_u16());

    assert_eq!(app.store.identity_count().unwrap(), 1);
}

// --- Token Refresh Tests ---

#[tokio::test]
async fn refresh_returns_new_pair_and_kills_the_old_token() {
    let app = spawn_app();
    let body: Value = app
        .register("alice", "alice@example.com", "Secret1!")
        .await
        .json()
        .await
        .unwrap();
    let old = body["refreshToken"].as_str().unwrap().to_string();

    let response = app.refresh(&old).await;
    assert_eq!(200, response.status().as_u16());
    let rotated: Value = response.json().await.unwrap();
    assert_ne!(rotated["refreshToken"], body["refreshToken"]);
    assert_eq!(rotated["username"], "alice");

    let reused = app.refresh(&old).await;
    assert_eq!(401, reused.status().as_u16());
    let err: Value = reused.json().await.unwrap();
    assert_eq!(err["code"], "TOKEN_INVALID");
}

#[tokio::test]
async fn refresh_returns_401_for_unknown_token() {
    let app = spawn_app();

    let response = app.refresh("this-token-was-never-issued").await;

    assert_eq!(401, response.status().as_u16());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "TOKEN_INVALID");
}

#[tokio::test]
async fn refresh_returns_token_expired_for_expired_token() {
    let app = spawn_app_with(-1);
    let body: Value = app
        .register("alice", "alice@example.com", "Secret1!")
        .await
        .json()
        .await
        .unwrap();

    let response = app.refresh(body["refreshToken"].as_str().unwrap()).await;

    assert_eq!(401, response.status().as_u16());
    let err: Value = response.json().await.unwrap();
    assert_eq!(err["code"], "TOKEN_EXPIRED");
}

// --- Logout Tests ---

#[tokio::test]
async fn logout_revokes_the_refresh_token() {
    let app = spawn_app();
    let body: Value = app
        .register("alice", "alice@example.com", "Secret1!")
        .await
        .json()
        .await
        .unwrap();
    let token = body["refreshToken"].as_str().unwrap();

    for _ in 0..2 {
        let response = app
            .post("/auth/logout", &json!({ "refreshToken": token }))
            .await;
        assert_eq!(204, response.status().as_u16());
    }

    let response = app.refresh(token).await;
    assert_eq!(401, response.status().as_u16());
    let err: Value = response.json().await.unwrap();
    assert_eq!(err["code"], "TOKEN_REVOKED");
}

#[tokio::test]
async fn logout_returns_401_for_unknown_token() {
    let app = spawn_app();

    let response = app
        .post("/auth/logout", &json!({ "refreshToken": "unknown" }))
        .await;

    assert_eq!(401, response.status().as_u16());
}

// --- Protected Route Tests ---

#[tokio::test]
async fn me_returns_profile_with_valid_token() {
    let app = spawn_app();
    let body: Value = app
        .register("alice", "alice@example.com", "Secret1!")
        .await
        .json()
        .await
        .unwrap();

    let response = app
        .client
        .get(&format!("{}/api/me", app.address))
        .bearer_auth(body["accessToken"].as_str().unwrap())
        .send()
        .await
        .expect("Failed to execute request.");

    assert_eq!(200, response.status().as_u16());
    let profile: Value = response.json().await.unwrap();
    assert_eq!(profile["username"], "alice");
    assert_eq!(profile["email"], "alice@example.com");
    assert_eq!(profile["id"], body["user"]["id"]);
    assert!(profile["createdAt"].is_string());
}

#[tokio::test]
async fn me_returns_401_without_token() {
    let app = spawn_app();

    let response = app
        .client
        .get(&format!("{}/api/me", app.address))
        .send()
        .await
        .expect("Failed to execute request.");

    assert_eq!(401, response.status().as_u16());
}

#[tokio::test]
async fn me_returns_401_for_garbage_token() {
    let app = spawn_app();

    let response = app
        .client
        .get(&format!("{}/api/me", app.address))
        .bearer_auth("not.a.jwt")
        .send()
        .await
        .expect("Failed to execute request.");

    assert_eq!(401, response.status().as_u16());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "TOKEN_INVALID");
}

#[tokio::test]
async fn change_password_revokes_refresh_tokens() {
    let app = spawn_app();
    let body: Value = app
        .register("alice", "alice@example.com", "Secret1!")
        .await
        .json()
        .await
        .unwrap();
    let access = body["accessToken"].as_str().unwrap();
    let refresh = body["refreshToken"].as_str().unwrap();

    let response = app
        .client
        .put(&format!("{}/api/password", app.address))
        .bearer_auth(access)
        .json(&json!({
            "currentPassword": "Secret1!",
            "newPassword": "Changed2?",
            "confirmPassword": "Changed2?"
        }))
        .send()
        .await
        .expect("Failed to execute request.");
    assert_eq!(204, response.status().as_u16());

    let response = app.refresh(refresh).await;
    let err: Value = response.json().await.unwrap();
    assert_eq!(err["code"], "TOKEN_REVOKED");

    assert_eq!(401, app.login("alice", "Secret1!").await.status().as_u16());
    assert_eq!(200, app.login("alice", "Changed2?").await.status().as_u16());
}

#[tokio::test]
async fn change_password_validates_the_new_password() {
    let app = spawn_app();
    let body: Value = app
        .register("alice", "alice@example.com", "Secret1!")
        .await
        .json()
        .await
        .unwrap();

    let response = app
        .client
        .put(&format!("{}/api/password", app.address))
        .bearer_auth(body["accessToken"].as_str().unwrap())
        .json(&json!({
            "currentPassword": "Secret1!",
            "newPassword": "weak",
            "confirmPassword": "mismatch"
        }))
        .send()
        .await
        .expect("Failed to execute request.");

    assert_eq!(400, response.status().as_u16());
    let err: Value = response.json().await.unwrap();
    let fields = field_names(&err);
    assert!(fields.iter().any(|f| f == "newPassword"));
    assert!(fields.iter().any(|f| f == "confirmPassword"));
}

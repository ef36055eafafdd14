//! Session life-cycle tests for `AuthenticationService` over the in-memory store

use std::sync::Arc;

use authcore::auth::{AuthenticationService, PasswordHasher};
use authcore::configuration::{AuthSettings, JwtSettings};
use authcore::error::AuthError;
use authcore::store::MemoryStore;

fn jwt_settings(refresh_token_expiry_days: i64) -> JwtSettings {
    JwtSettings {
        secret: "integration-test-secret-with-enough-length".to_string(),
        issuer: "authcore".to_string(),
        audience: "authcore-clients".to_string(),
        access_token_expiry_minutes: 15,
        refresh_token_expiry_days,
    }
}

fn auth_settings(demo_account: bool) -> AuthSettings {
    AuthSettings {
        demo_account,
        password_hash_cost: 4,
        ..AuthSettings::default()
    }
}

fn service_with(store: Arc<MemoryStore>, refresh_days: i64) -> AuthenticationService {
    AuthenticationService::new(store, jwt_settings(refresh_days), auth_settings(true))
}

fn service(store: Arc<MemoryStore>) -> AuthenticationService {
    service_with(store, 7)
}

// --- Password hashing ---

#[test]
fn hashing_the_same_password_twice_yields_different_hashes() {
    let hasher = PasswordHasher::new(4);
    let first = hasher.hash("Secret1!").unwrap();
    let second = hasher.hash("Secret1!").unwrap();

    assert_ne!(first, second);
    assert!(hasher.verify("Secret1!", &first));
    assert!(hasher.verify("Secret1!", &second));
    assert!(!hasher.verify("Secret2!", &first));
}

// --- Registration ---

#[tokio::test]
async fn register_issues_a_usable_session() {
    let store = Arc::new(MemoryStore::new());
    let svc = service(store.clone());

    let session = svc
        .register("alice", "alice@example.com", "Secret1!")
        .await
        .unwrap();

    assert_eq!(session.identity.username, "alice");
    assert_eq!(session.tokens.refresh.record.identity_id, session.identity.id);
    let claims = svc_claims(&svc, &session.tokens.access.token);
    assert_eq!(claims.username, "alice");
    assert_eq!(store.refresh_token_count().unwrap(), 1);
}

#[tokio::test]
async fn duplicate_username_leaves_exactly_one_identity() {
    let store = Arc::new(MemoryStore::new());
    let svc = service(store.clone());

    svc.register("alice", "alice@example.com", "Secret1!")
        .await
        .unwrap();
    let err = svc
        .register("alice", "other@example.com", "Secret1!")
        .await
        .unwrap_err();

    assert_eq!(err.auth(), Some(AuthError::DuplicateUsername));
    assert_eq!(store.identity_count().unwrap(), 1);
}

#[tokio::test]
async fn duplicate_email_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let svc = service(store.clone());

    svc.register("alice", "alice@example.com", "Secret1!")
        .await
        .unwrap();
    let err = svc
        .register("bob", "alice@example.com", "Secret1!")
        .await
        .unwrap_err();

    assert_eq!(err.auth(), Some(AuthError::DuplicateEmail));
    assert_eq!(store.identity_count().unwrap(), 1);
}

#[tokio::test]
async fn passwords_sharing_a_72_byte_prefix_are_not_interchangeable() {
    let store = Arc::new(MemoryStore::new());
    let svc = service(store.clone());
    let prefix = format!("Aa1!{}", "x".repeat(68));

    // Past the bcrypt input limit: refused, never truncated.
    let err = svc
        .register("alice", "alice@example.com", &format!("{}AAAAAAAAAA", prefix))
        .await
        .unwrap_err();
    assert!(err.auth().is_none());
    assert_eq!(store.identity_count().unwrap(), 0);

    svc.register("alice", "alice@example.com", &prefix)
        .await
        .unwrap();
    let err = svc
        .login("alice", &format!("{}ZZZZZZZZZZ", prefix))
        .await
        .unwrap_err();
    assert_eq!(err.auth(), Some(AuthError::InvalidCredentials));
    svc.login("alice", &prefix).await.unwrap();
}

// --- Login ---

#[tokio::test]
async fn login_failures_are_indistinguishable() {
    let svc = service(Arc::new(MemoryStore::new()));
    svc.register("alice", "alice@example.com", "Secret1!")
        .await
        .unwrap();

    let wrong_password = svc.login("alice", "Wrong1!!").await.unwrap_err();
    let unknown_user = svc.login("mallory", "Secret1!").await.unwrap_err();

    assert_eq!(wrong_password.auth(), Some(AuthError::InvalidCredentials));
    assert_eq!(unknown_user.auth(), Some(AuthError::InvalidCredentials));
    assert_eq!(wrong_password.to_string(), unknown_user.to_string());
}

#[tokio::test]
async fn demo_login_provisions_then_verifies_normally() {
    let store = Arc::new(MemoryStore::new());
    let svc = service(store.clone());

    let first = svc.login("demo", "demo123").await.unwrap();
    assert_eq!(first.identity.email, "demo@localhost");
    assert_eq!(store.identity_count().unwrap(), 1);

    let second = svc.login("demo", "demo123").await.unwrap();
    assert_eq!(second.identity.id, first.identity.id);
    assert_eq!(store.identity_count().unwrap(), 1);

    let err = svc.login("demo", "not-the-password").await.unwrap_err();
    assert_eq!(err.auth(), Some(AuthError::InvalidCredentials));
}

#[tokio::test]
async fn demo_login_is_refused_when_switched_off() {
    let store = Arc::new(MemoryStore::new());
    let svc = AuthenticationService::new(store.clone(), jwt_settings(7), auth_settings(false));

    let err = svc.login("demo", "demo123").await.unwrap_err();
    assert_eq!(err.auth(), Some(AuthError::InvalidCredentials));
    assert_eq!(store.identity_count().unwrap(), 0);
}

// --- Refresh ---

#[tokio::test]
async fn refresh_rotates_the_token() {
    let store = Arc::new(MemoryStore::new());
    let svc = service(store.clone());
    let session = svc
        .register("alice", "alice@example.com", "Secret1!")
        .await
        .unwrap();

    let rotated = svc.refresh(&session.tokens.refresh.token).await.unwrap();

    assert_ne!(rotated.tokens.refresh.token, session.tokens.refresh.token);
    assert_eq!(rotated.identity.id, session.identity.id);
    assert_eq!(store.refresh_token_count().unwrap(), 2);
}

#[tokio::test]
async fn consumed_refresh_token_can_never_be_exchanged_again() {
    let svc = service(Arc::new(MemoryStore::new()));
    let session = svc
        .register("alice", "alice@example.com", "Secret1!")
        .await
        .unwrap();
    let old = session.tokens.refresh.token;

    let rotated = svc.refresh(&old).await.unwrap();
    for _ in 0..3 {
        let err = svc.refresh(&old).await.unwrap_err();
        assert_eq!(err.auth(), Some(AuthError::InvalidToken));
    }

    // The replacement still works once.
    svc.refresh(&rotated.tokens.refresh.token).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_refresh_has_exactly_one_winner() {
    for _ in 0..10 {
        let svc = service(Arc::new(MemoryStore::new()));
        let session = svc
            .register("alice", "alice@example.com", "Secret1!")
            .await
            .unwrap();
        let token = session.tokens.refresh.token;

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let svc = svc.clone();
                let token = token.clone();
                tokio::spawn(async move { svc.refresh(&token).await })
            })
            .collect();

        let mut successes = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(e) => assert_eq!(e.auth(), Some(AuthError::InvalidToken)),
            }
        }
        assert_eq!(successes, 1);
    }
}

#[tokio::test]
async fn expired_refresh_token_always_fails_with_expired() {
    let store = Arc::new(MemoryStore::new());
    let svc = service_with(store, -1);
    let session = svc
        .register("alice", "alice@example.com", "Secret1!")
        .await
        .unwrap();
    let token = session.tokens.refresh.token;

    let first = svc.refresh(&token).await.unwrap_err();
    let second = svc.refresh(&token).await.unwrap_err();

    assert_eq!(first.auth(), Some(AuthError::ExpiredToken));
    assert_eq!(second.auth(), Some(AuthError::ExpiredToken));
}

#[tokio::test]
async fn unknown_refresh_token_is_invalid() {
    let svc = service(Arc::new(MemoryStore::new()));
    let well_formed = authcore::auth::generate_refresh_token();

    let err = svc.refresh(&well_formed).await.unwrap_err();
    assert_eq!(err.auth(), Some(AuthError::InvalidToken));
}

// --- Logout ---

#[tokio::test]
async fn logout_is_idempotent_and_revokes() {
    let svc = service(Arc::new(MemoryStore::new()));
    let session = svc
        .register("alice", "alice@example.com", "Secret1!")
        .await
        .unwrap();
    let token = session.tokens.refresh.token;

    svc.logout(&token).await.unwrap();
    svc.logout(&token).await.unwrap();

    let err = svc.refresh(&token).await.unwrap_err();
    assert_eq!(err.auth(), Some(AuthError::RevokedToken));
}

#[tokio::test]
async fn logout_of_unknown_token_is_invalid() {
    let svc = service(Arc::new(MemoryStore::new()));
    let err = svc
        .logout(&authcore::auth::generate_refresh_token())
        .await
        .unwrap_err();
    assert_eq!(err.auth(), Some(AuthError::InvalidToken));
}

// --- Password change ---

#[tokio::test]
async fn password_change_revokes_outstanding_refresh_tokens() {
    let svc = service(Arc::new(MemoryStore::new()));
    let registered = svc
        .register("alice", "alice@example.com", "Secret1!")
        .await
        .unwrap();
    let logged_in = svc.login("alice", "Secret1!").await.unwrap();

    let revoked = svc
        .change_password(registered.identity.id, "Secret1!", "Changed2?")
        .await
        .unwrap();
    assert_eq!(revoked, 2);

    for token in [&registered.tokens.refresh.token, &logged_in.tokens.refresh.token] {
        let err = svc.refresh(token).await.unwrap_err();
        assert_eq!(err.auth(), Some(AuthError::RevokedToken));
    }

    let err = svc.login("alice", "Secret1!").await.unwrap_err();
    assert_eq!(err.auth(), Some(AuthError::InvalidCredentials));
    svc.login("alice", "Changed2?").await.unwrap();
}

#[tokio::test]
async fn password_change_requires_the_current_password() {
    let svc = service(Arc::new(MemoryStore::new()));
    let session = svc
        .register("alice", "alice@example.com", "Secret1!")
        .await
        .unwrap();

    let err = svc
        .change_password(session.identity.id, "Wrong1!!", "Changed2?")
        .await
        .unwrap_err();
    assert_eq!(err.auth(), Some(AuthError::InvalidCredentials));

    // Nothing was revoked.
    svc.refresh(&session.tokens.refresh.token).await.unwrap();
}

// --- Retention ---

#[tokio::test]
async fn purge_removes_spent_tokens_only() {
    let store = Arc::new(MemoryStore::new());
    let svc = service(store.clone());
    let session = svc
        .register("alice", "alice@example.com", "Secret1!")
        .await
        .unwrap();
    let rotated = svc.refresh(&session.tokens.refresh.token).await.unwrap();
    assert_eq!(store.refresh_token_count().unwrap(), 2);

    // Zero retention: the consumed record goes, the live one stays.
    let purged = svc
        .purge_expired_tokens(chrono::Duration::zero())
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert_eq!(store.refresh_token_count().unwrap(), 1);

    svc.refresh(&rotated.tokens.refresh.token).await.unwrap();
}

fn svc_claims(svc: &AuthenticationService, token: &str) -> authcore::auth::Claims {
    authcore::auth::validate_access_token(token, svc.jwt_settings()).unwrap()
}

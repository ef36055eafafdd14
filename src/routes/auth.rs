/// Authentication Routes
///
/// Registration, login, token refresh and logout on the public side; profile
/// and password change behind `JwtMiddleware`.
///
/// Every service call runs on its own spawned task. If the client goes away
/// the handler future is dropped, but the task keeps going, so token issuance
/// and rotation are never abandoned half-way.

use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use uuid::Uuid;

use crate::auth::{AuthSession, AuthenticationService};
use crate::error::{AppError, AppResult};
use crate::middleware::AuthenticatedIdentity;
use crate::validators::{is_valid_password, passwords_match, validate_registration};

/// User registration request
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub confirm_password: String,
}

/// User login request
#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Body of `/auth/refresh` and `/auth/logout`
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenRequest {
    pub refresh_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
    pub confirm_password: String,
}

/// Token pair returned by login and refresh
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub username: String,
    pub expires_at: DateTime<Utc>,
}

impl From<AuthSession> for SessionResponse {
    fn from(session: AuthSession) -> Self {
        Self {
            access_token: session.tokens.access.token,
            refresh_token: session.tokens.refresh.token,
            username: session.identity.username,
            expires_at: session.tokens.access.expires_at,
        }
    }
}

#[derive(Serialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub username: String,
    pub email: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub user: UserSummary,
}

/// Profile of the authenticated identity
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileResponse {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub last_active_at: Option<DateTime<Utc>>,
}

/// Runs a service call to completion independently of the request future.
async fn detached<F, T>(call: F) -> AppResult<T>
where
    F: Future<Output = AppResult<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(call).await?
}

/// POST /auth/register
///
/// # Errors
/// - 400: Validation errors, duplicate username or email
/// - 503: Store unavailable
pub async fn register(
    form: web::Json<RegisterRequest>,
    service: web::Data<AuthenticationService>,
) -> Result<HttpResponse, AppError> {
    let form = form.into_inner();
    let valid = validate_registration(
        &form.username,
        &form.email,
        &form.password,
        &form.confirm_password,
    )?;

    let service = service.get_ref().clone();
    let session = detached(async move {
        service
            .register(&valid.username, &valid.email, &form.password)
            .await
    })
    .await?;

    Ok(HttpResponse::Ok().json(RegisterResponse {
        access_token: session.tokens.access.token,
        refresh_token: session.tokens.refresh.token,
        user: UserSummary {
            id: session.identity.id,
            username: session.identity.username,
            email: session.identity.email,
        },
    }))
}

/// POST /auth/login
///
/// Unknown usernames and wrong passwords produce the same 401 response.
pub async fn login(
    form: web::Json<LoginRequest>,
    service: web::Data<AuthenticationService>,
) -> Result<HttpResponse, AppError> {
    let form = form.into_inner();
    let service = service.get_ref().clone();
    let session =
        detached(async move { service.login(form.username.trim(), &form.password).await }).await?;

    Ok(HttpResponse::Ok().json(SessionResponse::from(session)))
}

/// POST /auth/refresh
///
/// The presented refresh token is dead after this call regardless of outcome
/// delivery; the client must keep the returned one.
pub async fn refresh(
    form: web::Json<RefreshTokenRequest>,
    service: web::Data<AuthenticationService>,
) -> Result<HttpResponse, AppError> {
    let form = form.into_inner();
    let service = service.get_ref().clone();
    let session = detached(async move { service.refresh(&form.refresh_token).await }).await?;

    Ok(HttpResponse::Ok().json(SessionResponse::from(session)))
}

/// POST /auth/logout
pub async fn logout(
    form: web::Json<RefreshTokenRequest>,
    service: web::Data<AuthenticationService>,
) -> Result<HttpResponse, AppError> {
    let form = form.into_inner();
    let service = service.get_ref().clone();
    detached(async move { service.logout(&form.refresh_token).await }).await?;

    Ok(HttpResponse::NoContent().finish())
}

/// GET /api/me
pub async fn get_current_user(
    identity: web::ReqData<AuthenticatedIdentity>,
    service: web::Data<AuthenticationService>,
) -> Result<HttpResponse, AppError> {
    let identity_id = identity.id;
    let service = service.get_ref().clone();
    let identity = detached(async move { service.current_identity(identity_id).await }).await?;

    Ok(HttpResponse::Ok().json(ProfileResponse {
        id: identity.id,
        username: identity.username,
        email: identity.email,
        created_at: identity.created_at,
        last_login_at: identity.last_login_at,
        last_active_at: identity.last_active_at,
    }))
}

/// PUT /api/password
///
/// Revokes every outstanding refresh token of the identity. Access tokens
/// already issued stay valid until they expire.
pub async fn change_password(
    identity: web::ReqData<AuthenticatedIdentity>,
    form: web::Json<ChangePasswordRequest>,
    service: web::Data<AuthenticationService>,
) -> Result<HttpResponse, AppError> {
    let form = form.into_inner();

    let mut errors = Vec::new();
    if let Err(e) = is_valid_password("newPassword", &form.new_password) {
        errors.push(e);
    }
    if let Err(e) = passwords_match("confirmPassword", &form.new_password, &form.confirm_password)
    {
        errors.push(e);
    }
    if !errors.is_empty() {
        return Err(errors.into());
    }

    let identity_id = identity.id;
    let service = service.get_ref().clone();
    detached(async move {
        service
            .change_password(identity_id, &form.current_password, &form.new_password)
            .await
    })
    .await?;

    Ok(HttpResponse::NoContent().finish())
}

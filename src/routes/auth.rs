use axum::{
    Json, Router,
    extract::{FromRequestParts, State},
    http::{StatusCode, header, request::Parts},
    response::IntoResponse,
    routing::post,
};
use chrono::{Duration, Utc};
use sea_orm::{ActiveModelTrait, ActiveValue::Set, ColumnTrait, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use tracing::warn;
use utoipa::ToSchema;

use crate::{
    AppState,
    credential_flows::FlowError,
    entities::{admin, prelude::Admin, sea_orm_active_enums::AdminStatus},
    token::{Claims, TYPE_SESSION},
};

const SESSION_TTL_SECS: i64 = 12 * 60 * 60;

const GENERIC_TOKEN_MESSAGE: &str = "Invalid or expired token";
const FORGOT_PASSWORD_MESSAGE: &str = "If an account exists, a reset link has been sent.";

#[derive(Serialize, ToSchema)]
pub struct MessageResponse {
    pub message: String,
}

fn message(status: StatusCode, text: impl Into<String>) -> axum::response::Response {
    (
        status,
        Json(MessageResponse {
            message: text.into(),
        }),
    )
        .into_response()
}

/// Bearer-session gate for admin-only routes. Verifies the session token,
/// loads the account and requires it to be active.
pub struct AuthAdmin(pub admin::Model);

impl FromRequestParts<AppState> for AuthAdmin {
    type Rejection = axum::response::Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let unauthorized = || message(StatusCode::UNAUTHORIZED, "Unauthorized");

        let header_value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(unauthorized)?;
        let token = header_value
            .strip_prefix("Bearer ")
            .ok_or_else(unauthorized)?;

        let claims = state
            .session_tokens
            .verify(token, TYPE_SESSION)
            .map_err(|_| unauthorized())?;

        let account = Admin::find_by_id(claims.sub.as_str())
            .one(&state.db)
            .await
            .map_err(|_| message(StatusCode::INTERNAL_SERVER_ERROR, "Failed to query admin"))?
            .ok_or_else(unauthorized)?;

        if account.status != AdminStatus::Active {
            return Err(unauthorized());
        }

        Ok(AuthAdmin(account))
    }
}

#[derive(Deserialize, ToSchema)]
pub struct LoginBody {
    pub email: String,
    pub password: String,
}

#[derive(Serialize, ToSchema)]
pub struct LoginResponse {
    pub token: String,
}

#[utoipa::path(
    post,
    tags = ["Auth"],
    description = "Admin login. Returns a Bearer session token.",
    path = "/login",
    request_body(content = LoginBody, content_type = "application/json"),
    responses(
        (status = 200, description = "Logged in", body = LoginResponse),
        (status = 401, description = "Invalid credentials", body = MessageResponse),
    )
)]
pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginBody>,
) -> impl IntoResponse {
    let invalid = || message(StatusCode::UNAUTHORIZED, "Invalid email or password");

    let account = match Admin::find()
        .filter(admin::Column::Email.eq(body.email.trim()))
        .one(&state.db)
        .await
    {
        Ok(Some(account)) => account,
        Ok(None) => return invalid(),
        Err(_) => {
            return message(StatusCode::INTERNAL_SERVER_ERROR, "Failed to query admin");
        }
    };

    if account.status != AdminStatus::Active {
        return invalid();
    }
    if state
        .hasher
        .verify(body.password.as_bytes(), &account.password_hash)
        .await
        .is_err()
    {
        return invalid();
    }

    let admin_id = account.id.clone();
    let mut active: admin::ActiveModel = account.into();
    active.last_login_at = Set(Some(Utc::now().into()));
    if let Err(e) = active.update(&state.db).await {
        warn!("Failed to stamp last login for {admin_id}: {e}");
    }

    let exp = (Utc::now() + Duration::seconds(SESSION_TTL_SECS)).timestamp();
    match state.session_tokens.issue(&Claims::session(&admin_id, exp)) {
        Ok(token) => (StatusCode::OK, Json(LoginResponse { token })).into_response(),
        Err(_) => message(StatusCode::INTERNAL_SERVER_ERROR, "Failed to issue session"),
    }
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitiateEmailChangeBody {
    pub new_email: String,
}

#[utoipa::path(
    post,
    tags = ["Auth"],
    description = "Start an admin email change. Sends a verification link to the new address.",
    path = "/initiate-email-change",
    request_body(content = InitiateEmailChangeBody, content_type = "application/json"),
    responses(
        (status = 200, description = "Verification email sent", body = MessageResponse),
        (status = 400, description = "Email already in use", body = MessageResponse),
        (status = 401, description = "Unauthorized", body = MessageResponse),
    )
)]
pub async fn initiate_email_change(
    AuthAdmin(account): AuthAdmin,
    State(state): State<AppState>,
    Json(body): Json<InitiateEmailChangeBody>,
) -> impl IntoResponse {
    if body.new_email.trim().is_empty() {
        return message(StatusCode::BAD_REQUEST, "New email is required");
    }

    match state
        .flows
        .initiate_email_change(&account.id, &body.new_email)
        .await
    {
        Ok(()) => message(
            StatusCode::OK,
            "A verification link has been sent to the new address.",
        ),
        Err(FlowError::EmailInUse) => message(StatusCode::BAD_REQUEST, "Email already in use"),
        Err(FlowError::MailNotConfigured) => message(
            StatusCode::BAD_REQUEST,
            "SMTP settings must be configured before changing the admin email",
        ),
        Err(e @ FlowError::Mail(_)) => {
            warn!("Email change initiation failed: {e}");
            message(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to send the verification email",
            )
        }
        Err(e) => {
            warn!("Email change initiation failed: {e}");
            message(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to start the email change",
            )
        }
    }
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerifyEmailChangeBody {
    pub token: String,
    pub new_password: String,
}

#[utoipa::path(
    post,
    tags = ["Auth"],
    description = "Complete an email change with the emailed token and a new password.",
    path = "/verify-email-change",
    request_body(content = VerifyEmailChangeBody, content_type = "application/json"),
    responses(
        (status = 200, description = "Email and password updated", body = MessageResponse),
        (status = 400, description = "Invalid token or weak password", body = MessageResponse),
    )
)]
pub async fn verify_email_change(
    State(state): State<AppState>,
    Json(body): Json<VerifyEmailChangeBody>,
) -> impl IntoResponse {
    match state
        .flows
        .complete_email_change(&body.token, &body.new_password)
        .await
    {
        Ok(()) => message(
            StatusCode::OK,
            "Email updated. Sign in with your new email and password.",
        ),
        Err(FlowError::WeakPassword) => {
            message(StatusCode::BAD_REQUEST, FlowError::WeakPassword.to_string())
        }
        Err(FlowError::InvalidOrExpiredToken) => {
            message(StatusCode::BAD_REQUEST, GENERIC_TOKEN_MESSAGE)
        }
        Err(e) => {
            warn!("Email change completion failed: {e}");
            message(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to complete the email change",
            )
        }
    }
}

#[derive(Deserialize, ToSchema)]
pub struct ForgotPasswordBody {
    pub email: String,
}

#[utoipa::path(
    post,
    tags = ["Auth"],
    description = "Request a password reset link. Always returns 200 to avoid email enumeration.",
    path = "/forgot-password",
    request_body(content = ForgotPasswordBody, content_type = "application/json"),
    responses(
        (status = 200, description = "If the account exists, a link was sent", body = MessageResponse),
    )
)]
pub async fn forgot_password(
    State(state): State<AppState>,
    Json(body): Json<ForgotPasswordBody>,
) -> impl IntoResponse {
    // The response never varies: account existence, storage trouble and mail
    // trouble all look identical from the outside.
    if let Err(e) = state.flows.request_reset(&body.email).await {
        warn!("Password reset request failed: {e}");
    }
    message(StatusCode::OK, FORGOT_PASSWORD_MESSAGE)
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResetPasswordBody {
    pub token: String,
    pub new_password: String,
}

#[utoipa::path(
    post,
    tags = ["Auth"],
    description = "Reset the password using the emailed token.",
    path = "/reset-password",
    request_body(content = ResetPasswordBody, content_type = "application/json"),
    responses(
        (status = 200, description = "Password reset", body = MessageResponse),
        (status = 400, description = "Invalid token or weak password", body = MessageResponse),
    )
)]
pub async fn reset_password(
    State(state): State<AppState>,
    Json(body): Json<ResetPasswordBody>,
) -> impl IntoResponse {
    match state
        .flows
        .complete_reset(&body.token, &body.new_password)
        .await
    {
        Ok(()) => message(StatusCode::OK, "Password reset successfully"),
        Err(FlowError::WeakPassword) => {
            message(StatusCode::BAD_REQUEST, FlowError::WeakPassword.to_string())
        }
        Err(FlowError::InvalidOrExpiredToken) => {
            message(StatusCode::BAD_REQUEST, GENERIC_TOKEN_MESSAGE)
        }
        Err(e) => {
            warn!("Password reset failed: {e}");
            message(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to reset the password",
            )
        }
    }
}

pub fn auth_router() -> Router<AppState> {
    Router::new()
        .route("/login", post(login))
        .route("/initiate-email-change", post(initiate_email_change))
        .route("/verify-email-change", post(verify_email_change))
        .route("/forgot-password", post(forgot_password))
        .route("/reset-password", post(reset_password))
}

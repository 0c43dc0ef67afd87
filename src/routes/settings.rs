use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::warn;
use utoipa::ToSchema;

use crate::{
    AppState,
    email_client::{EncryptionMode, MailError, OutboundMail, SmtpParams, provider_hint},
    masking::{MASK_TOKEN, MaskError, resolve_incoming},
    routes::auth::{AuthAdmin, MessageResponse},
    settings_store::{
        SMTP_CONFIG_KEY, SmtpConfig, get_smtp_config, get_value, resolve_stored_password,
        set_value,
    },
};

fn message(status: StatusCode, text: impl Into<String>) -> Response {
    (
        status,
        Json(MessageResponse {
            message: text.into(),
        }),
    )
        .into_response()
}

#[derive(Deserialize, ToSchema)]
pub struct SettingEntry {
    pub key: String,
    #[schema(value_type = Object)]
    pub value: serde_json::Value,
}

#[derive(Serialize, ToSchema)]
pub struct SettingResponse {
    pub key: String,
    #[schema(value_type = Object)]
    pub value: serde_json::Value,
}

#[derive(Deserialize, ToSchema)]
pub struct BatchUpsertBody {
    pub settings: Vec<SettingEntry>,
}

#[derive(Serialize, ToSchema)]
pub struct BatchUpsertResponse {
    pub settings: Vec<SettingResponse>,
}

/// Prepared forms of one incoming settings entry: the value to persist and
/// the value safe to echo back to the caller.
struct PreparedSetting {
    persist: serde_json::Value,
    display: serde_json::Value,
}

/// Applies the masking policy to `smtp_config` writes; every other key is
/// free-form site configuration stored verbatim.
async fn prepare_setting(
    state: &AppState,
    key: &str,
    value: serde_json::Value,
) -> Result<PreparedSetting, Response> {
    if key != SMTP_CONFIG_KEY {
        return Ok(PreparedSetting {
            display: value.clone(),
            persist: value,
        });
    }

    let mut incoming: SmtpConfig = serde_json::from_value(value)
        .map_err(|_| message(StatusCode::BAD_REQUEST, "Malformed smtp_config value"))?;

    let stored = get_smtp_config(&state.db)
        .await
        .map_err(|_| message(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read settings"))?;

    incoming.password = resolve_incoming(
        &incoming.password,
        stored.as_ref().map(|c| c.password.as_str()),
        &state.codec,
    )
    .map_err(|e| match e {
        MaskError::NothingToPreserve => message(
            StatusCode::BAD_REQUEST,
            "No stored SMTP password to preserve; enter the real password",
        ),
        MaskError::Codec(e) => {
            warn!("Failed to encrypt SMTP password: {e}");
            message(StatusCode::INTERNAL_SERVER_ERROR, "Failed to store the password")
        }
    })?;

    let display = serde_json::to_value(incoming.masked())
        .map_err(|_| message(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode settings"))?;
    let persist = serde_json::to_value(incoming)
        .map_err(|_| message(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode settings"))?;

    Ok(PreparedSetting { persist, display })
}

#[utoipa::path(
    get,
    tags = ["Settings"],
    description = "Get a settings value by key. Secrets are always masked.",
    path = "/{key}",
    responses(
        (status = 200, description = "Setting fetched", body = SettingResponse),
        (status = 404, description = "Setting not found", body = MessageResponse),
    )
)]
pub async fn get_setting(
    AuthAdmin(_admin): AuthAdmin,
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    let value = match get_value(&state.db, &key).await {
        Ok(Some(value)) => value,
        Ok(None) => return message(StatusCode::NOT_FOUND, "Setting not found"),
        Err(_) => {
            return message(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read settings");
        }
    };

    let value = if key == SMTP_CONFIG_KEY {
        match serde_json::from_value::<SmtpConfig>(value) {
            Ok(config) => match serde_json::to_value(config.masked()) {
                Ok(masked) => masked,
                Err(_) => {
                    return message(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Failed to encode settings",
                    );
                }
            },
            Err(e) => {
                warn!("Stored smtp_config does not parse: {e}");
                return message(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Stored smtp_config is malformed",
                );
            }
        }
    } else {
        value
    };

    (StatusCode::OK, Json(SettingResponse { key, value })).into_response()
}

#[utoipa::path(
    post,
    tags = ["Settings"],
    description = "Upsert one settings entry. SMTP passwords are encrypted at rest; \
                   submitting the mask sentinel keeps the stored password unchanged.",
    path = "/upsert",
    request_body(content = SettingEntry, content_type = "application/json"),
    responses(
        (status = 200, description = "Setting saved", body = SettingResponse),
        (status = 400, description = "Malformed value or nothing to preserve", body = MessageResponse),
    )
)]
pub async fn upsert_setting(
    AuthAdmin(_admin): AuthAdmin,
    State(state): State<AppState>,
    Json(body): Json<SettingEntry>,
) -> impl IntoResponse {
    let prepared = match prepare_setting(&state, &body.key, body.value).await {
        Ok(prepared) => prepared,
        Err(response) => return response,
    };

    if set_value(&state.db, &body.key, prepared.persist).await.is_err() {
        return message(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save setting");
    }

    (
        StatusCode::OK,
        Json(SettingResponse {
            key: body.key,
            value: prepared.display,
        }),
    )
        .into_response()
}

#[utoipa::path(
    post,
    tags = ["Settings"],
    description = "Upsert several settings entries in one request.",
    path = "/batch",
    request_body(content = BatchUpsertBody, content_type = "application/json"),
    responses(
        (status = 200, description = "Settings saved", body = BatchUpsertResponse),
        (status = 400, description = "Malformed value or nothing to preserve", body = MessageResponse),
    )
)]
pub async fn batch_upsert(
    AuthAdmin(_admin): AuthAdmin,
    State(state): State<AppState>,
    Json(body): Json<BatchUpsertBody>,
) -> impl IntoResponse {
    let mut saved = Vec::with_capacity(body.settings.len());

    for entry in body.settings {
        let prepared = match prepare_setting(&state, &entry.key, entry.value).await {
            Ok(prepared) => prepared,
            Err(response) => return response,
        };
        if set_value(&state.db, &entry.key, prepared.persist).await.is_err() {
            return message(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save setting");
        }
        saved.push(SettingResponse {
            key: entry.key,
            value: prepared.display,
        });
    }

    (StatusCode::OK, Json(BatchUpsertResponse { settings: saved })).into_response()
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TestEmailBody {
    pub host: String,
    pub port: u16,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub encryption: EncryptionMode,
    pub test_recipient: String,
    pub test_message: String,
}

#[utoipa::path(
    post,
    tags = ["Settings"],
    description = "Verify SMTP connectivity and credentials by sending one test message. \
                   A masked password is resolved against the stored configuration.",
    path = "/test-email",
    request_body(content = TestEmailBody, content_type = "application/json"),
    responses(
        (status = 200, description = "Test email sent", body = MessageResponse),
        (status = 400, description = "Authentication rejected or nothing to test with", body = MessageResponse),
        (status = 500, description = "Connectivity or delivery failure", body = MessageResponse),
    )
)]
pub async fn test_email(
    AuthAdmin(_admin): AuthAdmin,
    State(state): State<AppState>,
    Json(body): Json<TestEmailBody>,
) -> impl IntoResponse {
    // The probe never sees the literal sentinel; it is resolved to the
    // stored secret here or the request is rejected.
    let password = if body.password == MASK_TOKEN {
        let stored = match get_smtp_config(&state.db).await {
            Ok(stored) => stored,
            Err(_) => {
                return message(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read settings");
            }
        };
        let Some(stored) = stored else {
            return message(
                StatusCode::BAD_REQUEST,
                "No stored SMTP password to test with; enter the real password",
            );
        };
        match resolve_stored_password(&state.codec, &stored.password) {
            Ok(password) => password,
            Err(e) => {
                warn!("Failed to decrypt stored SMTP password: {e}");
                return message(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Stored SMTP password could not be decrypted",
                );
            }
        }
    } else {
        body.password.clone()
    };

    let params = SmtpParams {
        host: body.host.clone(),
        port: body.port,
        sender_email: body.email.clone(),
        password,
        encryption: body.encryption,
    };
    let mail = OutboundMail {
        to: body.test_recipient.clone(),
        subject: "SMTP configuration test".to_owned(),
        body: body.test_message.clone(),
    };

    match state.mailer.verify_and_send(&params, &mail).await {
        Ok(()) => message(StatusCode::OK, "Test email sent successfully"),
        Err(MailError::Auth(detail)) => {
            let mut text = format!("Authentication failed: {detail}");
            if let Some(hint) = provider_hint(&body.host) {
                text = format!("{text} {hint}");
            }
            message(StatusCode::BAD_REQUEST, text)
        }
        Err(e @ MailError::Connectivity(_)) | Err(e @ MailError::Delivery(_)) => {
            message(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

pub fn settings_router() -> Router<AppState> {
    Router::new()
        .route("/{key}", get(get_setting))
        .route("/upsert", post(upsert_setting))
        .route("/batch", post(batch_upsert))
        .route("/test-email", post(test_email))
}

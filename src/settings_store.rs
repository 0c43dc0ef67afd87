use sea_orm::ActiveValue::Set;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ConnectionTrait, DbErr, EntityTrait};
use serde::{Deserialize, Serialize};
use tracing::warn;
use utoipa::ToSchema;

use crate::email_client::EncryptionMode;
use crate::entities::{prelude::Setting, setting};
use crate::masking::mask_for_display;
use crate::secret_codec::{CodecError, SecretCodec};

pub const SMTP_CONFIG_KEY: &str = "smtp_config";
pub const ADMIN_DISPLAY_EMAIL_KEY: &str = "admin_display_email";

/// Fetches a settings value by key. Generic over the connection so it works
/// both on the pool and inside a transaction.
pub async fn get_value<C: ConnectionTrait>(
    conn: &C,
    key: &str,
) -> Result<Option<serde_json::Value>, DbErr> {
    Ok(Setting::find_by_id(key).one(conn).await?.map(|m| m.value))
}

/// Upserts a settings value.
pub async fn set_value<C: ConnectionTrait>(
    conn: &C,
    key: &str,
    value: serde_json::Value,
) -> Result<(), DbErr> {
    let row = setting::ActiveModel {
        key: Set(key.to_owned()),
        value: Set(value),
    };
    Setting::insert(row)
        .on_conflict(
            OnConflict::column(setting::Column::Key)
                .update_column(setting::Column::Value)
                .to_owned(),
        )
        .exec(conn)
        .await?;
    Ok(())
}

/// SMTP configuration as stored under the `smtp_config` key. `password`
/// holds codec ciphertext at rest and the mask sentinel in API responses.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub encryption: EncryptionMode,
}

impl SmtpConfig {
    /// Copy suitable for returning to a caller.
    pub fn masked(&self) -> Self {
        Self {
            password: mask_for_display(&self.password).to_owned(),
            ..self.clone()
        }
    }
}

pub async fn get_smtp_config<C: ConnectionTrait>(
    conn: &C,
) -> Result<Option<SmtpConfig>, DbErr> {
    let Some(value) = get_value(conn, SMTP_CONFIG_KEY).await? else {
        return Ok(None);
    };
    match serde_json::from_value(value) {
        Ok(config) => Ok(Some(config)),
        Err(e) => {
            warn!("Stored smtp_config does not parse: {e}");
            Ok(None)
        }
    }
}

/// Recovers the clear-text SMTP password from its stored form. Values written
/// before encryption was introduced were stored in the clear; anything
/// without the codec prefix is passed through as-is. Prefixed values that
/// fail to decrypt are corrupt and surface the error.
pub fn resolve_stored_password(
    codec: &SecretCodec,
    stored: &str,
) -> Result<String, CodecError> {
    if SecretCodec::looks_encrypted(stored) {
        codec.decrypt(stored)
    } else {
        Ok(stored.to_owned())
    }
}

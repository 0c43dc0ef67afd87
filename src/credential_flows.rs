use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, FixedOffset, Utc};
use nanoid::nanoid;
use sea_orm::ActiveValue::Set;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    TransactionTrait,
};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::argon_hasher::ArgonHasher;
use crate::email_client::{MailError, Mailer, OutboundMail, SmtpParams};
use crate::entities::{admin, pending_email_change, prelude::*};
use crate::secret_codec::SecretCodec;
use crate::settings_store::{
    ADMIN_DISPLAY_EMAIL_KEY, get_smtp_config, resolve_stored_password, set_value,
};
use crate::token::{Claims, TYPE_EMAIL_CHANGE, TokenSigner};

const EMAIL_CHANGE_TTL_SECS: i64 = 30 * 60;
const RESET_TTL_MINUTES: i64 = 15;
const RESET_TOKEN_LEN: usize = 48;
pub const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug)]
pub enum FlowError {
    EmailInUse,
    InvalidOrExpiredToken,
    WeakPassword,
    MailNotConfigured,
    Mail(MailError),
    Persistence(DbErr),
    Internal(String),
}

impl std::fmt::Display for FlowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmailInUse => write!(f, "email already in use"),
            Self::InvalidOrExpiredToken => write!(f, "invalid or expired token"),
            Self::WeakPassword => {
                write!(f, "password must be at least {MIN_PASSWORD_LEN} characters")
            }
            Self::MailNotConfigured => write!(f, "smtp settings are not configured"),
            Self::Mail(e) => write!(f, "mail delivery failed: {e}"),
            Self::Persistence(e) => write!(f, "storage failure: {e}"),
            Self::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for FlowError {}

impl From<DbErr> for FlowError {
    fn from(value: DbErr) -> Self {
        Self::Persistence(value)
    }
}

/// One-way hash applied to raw reset tokens before storage. Only the hash
/// is persisted; the raw value travels by email.
pub fn hash_reset_token(raw: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(raw.as_bytes()))
}

fn password_long_enough(password: &str) -> bool {
    password.chars().count() >= MIN_PASSWORD_LEN
}

/// Token-vs-pending-record match. The decoded claims must point at exactly
/// the record being consumed, and the presented token string must be the one
/// persisted at initiation time (a re-initiated request invalidates every
/// earlier token even when its signature is still good).
fn pending_matches(
    claims: &Claims,
    presented_token: &str,
    pending: &pending_email_change::Model,
) -> bool {
    pending.token == presented_token
        && pending.admin_id == claims.sub
        && claims.new_email.as_deref() == Some(pending.new_email.as_str())
}

/// Orchestrates the two credential-change flows. All collaborators are
/// injected; the only mutable state lives in the database.
pub struct CredentialFlows {
    db: DatabaseConnection,
    hasher: ArgonHasher,
    verify_tokens: TokenSigner,
    codec: SecretCodec,
    mailer: Arc<dyn Mailer>,
    public_base_url: String,
}

impl CredentialFlows {
    pub fn new(
        db: DatabaseConnection,
        hasher: ArgonHasher,
        verify_tokens: TokenSigner,
        codec: SecretCodec,
        mailer: Arc<dyn Mailer>,
        public_base_url: String,
    ) -> Self {
        Self {
            db,
            hasher,
            verify_tokens,
            codec,
            mailer,
            public_base_url,
        }
    }

    /// Starts an email change for `admin_id`. The verification link goes to
    /// the new address, which is the point: the new address must be proven
    /// reachable before anything is mutated.
    pub async fn initiate_email_change(
        &self,
        admin_id: &str,
        new_email: &str,
    ) -> Result<(), FlowError> {
        let new_email = new_email.trim().to_owned();

        let taken = Admin::find()
            .filter(admin::Column::Email.eq(&new_email))
            .one(&self.db)
            .await?;
        if taken.is_some() {
            return Err(FlowError::EmailInUse);
        }

        let exp = Utc::now().timestamp() + EMAIL_CHANGE_TTL_SECS;
        let claims = Claims::email_change(admin_id, &new_email, exp);
        let token = self
            .verify_tokens
            .issue(&claims)
            .map_err(|e| FlowError::Internal(e.to_string()))?;

        // One pending request per admin; re-initiating replaces it.
        let row = pending_email_change::ActiveModel {
            admin_id: Set(admin_id.to_owned()),
            new_email: Set(new_email.clone()),
            token: Set(token.clone()),
            created_at: Set(Utc::now().into()),
        };
        PendingEmailChange::insert(row)
            .on_conflict(
                OnConflict::column(pending_email_change::Column::AdminId)
                    .update_columns([
                        pending_email_change::Column::NewEmail,
                        pending_email_change::Column::Token,
                        pending_email_change::Column::CreatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;

        let link = format!(
            "{}/admin/verify-email-change?token={}",
            self.public_base_url, token
        );
        let body = format!(
            "A request was made to change your admin email to this address.\n\n\
             Open the link below within 30 minutes to confirm the change and \
             set a new password:\n\n{link}\n\n\
             If you did not request this, ignore this message."
        );
        self.send_mail(&new_email, "Confirm your new admin email", &body)
            .await
    }

    /// Consumes an email-change token. Every validation failure collapses to
    /// `InvalidOrExpiredToken` so callers cannot probe which check failed.
    pub async fn complete_email_change(
        &self,
        token: &str,
        new_password: &str,
    ) -> Result<(), FlowError> {
        let claims = self
            .verify_tokens
            .verify(token, TYPE_EMAIL_CHANGE)
            .map_err(|_| FlowError::InvalidOrExpiredToken)?;

        let pending = PendingEmailChange::find_by_id(claims.sub.as_str())
            .one(&self.db)
            .await?
            .ok_or(FlowError::InvalidOrExpiredToken)?;
        if !pending_matches(&claims, token, &pending) {
            return Err(FlowError::InvalidOrExpiredToken);
        }

        // Checked only after the token has fully validated, and before the
        // expensive hash.
        if !password_long_enough(new_password) {
            return Err(FlowError::WeakPassword);
        }

        let new_hash = self
            .hasher
            .hash(new_password.as_bytes())
            .await
            .map_err(|e| FlowError::Internal(e.to_string()))?;

        // Email + password update, pending-record deletion and the display
        // cache refresh commit together or not at all.
        let txn = self.db.begin().await?;

        // Consuming the pending record first is the serialization point: a
        // concurrent complete (or a re-initiated request) leaves zero rows
        // matching here, and the transaction is abandoned before any account
        // write happens.
        let consumed = PendingEmailChange::delete_many()
            .filter(pending_email_change::Column::AdminId.eq(claims.sub.as_str()))
            .filter(pending_email_change::Column::Token.eq(token))
            .exec(&txn)
            .await?;
        if consumed.rows_affected != 1 {
            return Err(FlowError::InvalidOrExpiredToken);
        }

        let account = Admin::find_by_id(claims.sub.as_str())
            .one(&txn)
            .await?
            .ok_or(FlowError::InvalidOrExpiredToken)?;

        let mut active: admin::ActiveModel = account.into();
        active.email = Set(pending.new_email.clone());
        active.password_hash = Set(new_hash);
        active.updated_at = Set(Utc::now().into());
        active.update(&txn).await?;

        set_value(
            &txn,
            ADMIN_DISPLAY_EMAIL_KEY,
            serde_json::Value::String(pending.new_email.clone()),
        )
        .await?;

        txn.commit().await?;
        Ok(())
    }

    /// Always reports success to the caller; whether an account exists is
    /// never disclosed. Token material is generated on both paths so the
    /// no-op shape stays close to the real one.
    pub async fn request_reset(&self, email: &str) -> Result<(), FlowError> {
        let email = email.trim().to_owned();

        let raw_token = nanoid!(RESET_TOKEN_LEN);
        let token_hash = hash_reset_token(&raw_token);
        let expires_at = Utc::now() + Duration::minutes(RESET_TTL_MINUTES);

        let account = Admin::find()
            .filter(admin::Column::Email.eq(&email))
            .one(&self.db)
            .await?;
        let Some(account) = account else {
            return Ok(());
        };

        let mut active: admin::ActiveModel = account.into();
        active.reset_password_token_hash = Set(Some(token_hash));
        active.reset_password_expires_at = Set(Some(expires_at.into()));
        active.updated_at = Set(Utc::now().into());
        active.update(&self.db).await?;

        let link = format!(
            "{}/admin/reset-password?token={}",
            self.public_base_url, raw_token
        );
        let body = format!(
            "A password reset was requested for your admin account.\n\n\
             Open the link below within {RESET_TTL_MINUTES} minutes to choose \
             a new password:\n\n{link}\n\n\
             If you did not request this, ignore this message."
        );
        self.send_mail(&email, "Reset your admin password", &body).await
    }

    pub async fn complete_reset(
        &self,
        raw_token: &str,
        new_password: &str,
    ) -> Result<(), FlowError> {
        let token_hash = hash_reset_token(raw_token.trim());
        let account = Admin::find()
            .filter(admin::Column::ResetPasswordTokenHash.eq(token_hash.as_str()))
            .one(&self.db)
            .await?
            .ok_or(FlowError::InvalidOrExpiredToken)?;

        // Expiry is checked at verification time; stale tokens are never
        // swept proactively.
        let expires_at = account
            .reset_password_expires_at
            .ok_or(FlowError::InvalidOrExpiredToken)?;
        if expires_at <= Utc::now() {
            return Err(FlowError::InvalidOrExpiredToken);
        }

        if !password_long_enough(new_password) {
            return Err(FlowError::WeakPassword);
        }

        let new_hash = self
            .hasher
            .hash(new_password.as_bytes())
            .await
            .map_err(|e| FlowError::Internal(e.to_string()))?;

        // One conditional statement updates the password and clears the token
        // columns together: it only lands while the stored hash is still the
        // presented one, so a token consumed by a concurrent reset matches
        // zero rows instead of mutating the account twice.
        let now: chrono::DateTime<FixedOffset> = Utc::now().into();
        let updated = Admin::update_many()
            .col_expr(admin::Column::PasswordHash, Expr::value(new_hash))
            .col_expr(
                admin::Column::ResetPasswordTokenHash,
                Expr::value(Option::<String>::None),
            )
            .col_expr(
                admin::Column::ResetPasswordExpiresAt,
                Expr::value(Option::<chrono::DateTime<FixedOffset>>::None),
            )
            .col_expr(admin::Column::UpdatedAt, Expr::value(now))
            .filter(admin::Column::Id.eq(account.id.as_str()))
            .filter(admin::Column::ResetPasswordTokenHash.eq(token_hash.as_str()))
            .exec(&self.db)
            .await?;
        if updated.rows_affected != 1 {
            return Err(FlowError::InvalidOrExpiredToken);
        }

        Ok(())
    }

    async fn send_mail(&self, to: &str, subject: &str, body: &str) -> Result<(), FlowError> {
        let config = get_smtp_config(&self.db)
            .await?
            .ok_or(FlowError::MailNotConfigured)?;
        let password = resolve_stored_password(&self.codec, &config.password)
            .map_err(|e| FlowError::Internal(e.to_string()))?;

        let params = SmtpParams {
            host: config.host,
            port: config.port,
            sender_email: config.email,
            password,
            encryption: config.encryption,
        };
        let mail = OutboundMail {
            to: to.to_owned(),
            subject: subject.to_owned(),
            body: body.to_owned(),
        };

        self.mailer.verify_and_send(&params, &mail).await.map_err(|e| {
            warn!("Failed to send credential email to {to}: {e}");
            FlowError::Mail(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};

    use crate::argon_hasher::Config;
    use crate::entities::{sea_orm_active_enums::AdminStatus, setting};

    fn pending(admin_id: &str, new_email: &str, token: &str) -> pending_email_change::Model {
        pending_email_change::Model {
            admin_id: admin_id.to_owned(),
            new_email: new_email.to_owned(),
            token: token.to_owned(),
            created_at: Utc::now().into(),
        }
    }

    fn admin_row(id: &str, email: &str) -> admin::Model {
        admin::Model {
            id: id.to_owned(),
            email: email.to_owned(),
            password_hash: "old-hash".to_owned(),
            role: "admin".to_owned(),
            status: AdminStatus::Active,
            reset_password_token_hash: None,
            reset_password_expires_at: None,
            last_login_at: None,
            created_at: Utc::now().into(),
            updated_at: Utc::now().into(),
        }
    }

    struct NullMailer;

    #[async_trait]
    impl Mailer for NullMailer {
        async fn verify_and_send(
            &self,
            _params: &SmtpParams,
            _mail: &OutboundMail,
        ) -> Result<(), MailError> {
            Ok(())
        }
    }

    fn verify_signer() -> TokenSigner {
        TokenSigner::new(b"verification-secret".to_vec())
    }

    fn flows_with(db: DatabaseConnection) -> CredentialFlows {
        CredentialFlows::new(
            db,
            ArgonHasher::new(Config {
                secret_key: b"test-pepper".to_vec(),
                iterations: 2,
                parallelism: 1,
                memory_cost: 64,
            })
            .unwrap(),
            verify_signer(),
            SecretCodec::new(&BASE64.encode([9u8; 32])).unwrap(),
            Arc::new(NullMailer),
            "https://example.com".to_owned(),
        )
    }

    fn fresh_email_change_token(admin_id: &str, new_email: &str) -> String {
        let exp = Utc::now().timestamp() + EMAIL_CHANGE_TTL_SECS;
        verify_signer()
            .issue(&Claims::email_change(admin_id, new_email, exp))
            .unwrap()
    }

    #[test]
    fn pending_match_requires_all_fields() {
        let claims = Claims::email_change("admin-1", "b@x.com", 2_000_000_000);
        let record = pending("admin-1", "b@x.com", "tok-1");

        assert!(pending_matches(&claims, "tok-1", &record));

        // Token string replaced by a newer initiate call.
        assert!(!pending_matches(&claims, "tok-1", &pending("admin-1", "b@x.com", "tok-2")));

        // Record now points at a different target address.
        assert!(!pending_matches(&claims, "tok-1", &pending("admin-1", "c@x.com", "tok-1")));

        // Record belongs to a different admin.
        assert!(!pending_matches(&claims, "tok-1", &pending("admin-2", "b@x.com", "tok-1")));

        // Claims without a target address never match.
        let session_like = Claims::session("admin-1", 2_000_000_000);
        assert!(!pending_matches(&session_like, "tok-1", &record));
    }

    #[test]
    fn reset_token_hashing_is_deterministic_and_collision_visible() {
        let a = hash_reset_token("raw-token-a");
        assert_eq!(a, hash_reset_token("raw-token-a"));
        assert_ne!(a, hash_reset_token("raw-token-b"));
        assert_ne!(a, "raw-token-a");
    }

    #[test]
    fn password_length_boundary() {
        assert!(!password_long_enough(""));
        assert!(!password_long_enough("short12"));
        assert!(password_long_enough("exactly8"));
        assert!(password_long_enough("LongEnough123"));
        // Counted in characters, not bytes.
        assert!(password_long_enough("pässwörd"));
    }

    #[tokio::test]
    async fn email_change_token_is_single_use() {
        let token = fresh_email_change_token("admin-1", "b@x.com");
        let record = pending("admin-1", "b@x.com", &token);

        // Prepared results cover one full completion plus the second call's
        // pending lookup (now empty). Any further statement from the second
        // call would hit an empty buffer and surface as a persistence error,
        // not the generic rejection asserted below.
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![record.clone()]])
            .append_query_results([vec![admin_row("admin-1", "a@x.com")]])
            .append_query_results([vec![admin_row("admin-1", "b@x.com")]])
            .append_query_results([vec![setting::Model {
                key: ADMIN_DISPLAY_EMAIL_KEY.to_owned(),
                value: serde_json::Value::String("b@x.com".to_owned()),
            }]])
            .append_query_results([Vec::<pending_email_change::Model>::new()])
            .append_exec_results([MockExecResult {
                last_insert_id: 0,
                rows_affected: 1,
            }])
            .into_connection();
        let flows = flows_with(db);

        flows
            .complete_email_change(&token, "LongEnough123")
            .await
            .unwrap();

        let second = flows.complete_email_change(&token, "AnotherLong123").await;
        assert!(matches!(second, Err(FlowError::InvalidOrExpiredToken)));
    }

    #[tokio::test]
    async fn email_change_consuming_zero_rows_aborts_before_account_write() {
        let token = fresh_email_change_token("admin-1", "b@x.com");
        let record = pending("admin-1", "b@x.com", &token);

        // The record reads fine before the transaction, but the conditional
        // delete finds it already consumed (a concurrent complete won the
        // race). No account row or settings write is prepared: reaching
        // either would fail the test with a different error.
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![record]])
            .append_exec_results([MockExecResult {
                last_insert_id: 0,
                rows_affected: 0,
            }])
            .into_connection();
        let flows = flows_with(db);

        let result = flows.complete_email_change(&token, "LongEnough123").await;
        assert!(matches!(result, Err(FlowError::InvalidOrExpiredToken)));
    }

    #[tokio::test]
    async fn bad_token_rejected_before_password_is_inspected() {
        // No prepared results: the signature check fails before any query.
        let db = MockDatabase::new(DatabaseBackend::Postgres).into_connection();
        let flows = flows_with(db);

        let result = flows.complete_email_change("not-a-token", "abc").await;
        assert!(matches!(result, Err(FlowError::InvalidOrExpiredToken)));
    }

    #[tokio::test]
    async fn reset_succeeds_while_stored_hash_still_matches() {
        let raw = "raw-reset-token";
        let mut account = admin_row("admin-1", "a@x.com");
        account.reset_password_token_hash = Some(hash_reset_token(raw));
        account.reset_password_expires_at = Some((Utc::now() + Duration::minutes(5)).into());

        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![account]])
            .append_exec_results([MockExecResult {
                last_insert_id: 0,
                rows_affected: 1,
            }])
            .into_connection();
        let flows = flows_with(db);

        flows.complete_reset(raw, "LongEnough123").await.unwrap();
    }

    #[tokio::test]
    async fn reset_update_matching_zero_rows_does_not_mutate() {
        let raw = "raw-reset-token";
        let mut account = admin_row("admin-1", "a@x.com");
        account.reset_password_token_hash = Some(hash_reset_token(raw));
        account.reset_password_expires_at = Some((Utc::now() + Duration::minutes(5)).into());

        // Between the read and the conditional update, a concurrent reset
        // consumed the token: zero rows match and the flow reports the
        // generic rejection.
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![account]])
            .append_exec_results([MockExecResult {
                last_insert_id: 0,
                rows_affected: 0,
            }])
            .into_connection();
        let flows = flows_with(db);

        let result = flows.complete_reset(raw, "LongEnough123").await;
        assert!(matches!(result, Err(FlowError::InvalidOrExpiredToken)));
    }

    #[tokio::test]
    async fn expired_reset_token_rejected_without_touching_the_password() {
        let raw = "raw-reset-token";
        let mut account = admin_row("admin-1", "a@x.com");
        account.reset_password_token_hash = Some(hash_reset_token(raw));
        account.reset_password_expires_at = Some((Utc::now() - Duration::minutes(1)).into());

        // No exec result prepared: an attempted update would error instead
        // of returning the generic rejection.
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![account]])
            .into_connection();
        let flows = flows_with(db);

        let result = flows.complete_reset(raw, "LongEnough123").await;
        assert!(matches!(result, Err(FlowError::InvalidOrExpiredToken)));
    }

    #[tokio::test]
    async fn unknown_reset_token_rejected_before_password_is_inspected() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([Vec::<admin::Model>::new()])
            .into_connection();
        let flows = flows_with(db);

        // Short password, but the token lookup fails first.
        let result = flows.complete_reset("unknown-token", "abc").await;
        assert!(matches!(result, Err(FlowError::InvalidOrExpiredToken)));
    }
}

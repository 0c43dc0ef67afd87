use std::time::Duration;

use async_trait::async_trait;
use mail_send::{SmtpClientBuilder, mail_builder::MessageBuilder};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::masking::MASK_TOKEN;

const SMTP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    /// Implicit TLS from the first byte (typically port 465).
    Ssl,
    /// Opportunistic STARTTLS upgrade (typically port 587).
    Tls,
    Starttls,
}

impl EncryptionMode {
    fn implicit_tls(self) -> bool {
        matches!(self, Self::Ssl)
    }
}

impl Default for EncryptionMode {
    fn default() -> Self {
        Self::Tls
    }
}

#[derive(Debug, Clone)]
pub struct SmtpParams {
    pub host: String,
    pub port: u16,
    pub sender_email: String,
    pub password: String,
    pub encryption: EncryptionMode,
}

#[derive(Debug, Clone)]
pub struct OutboundMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// The three remediation paths the admin UI distinguishes.
#[derive(Debug)]
pub enum MailError {
    Connectivity(String),
    Auth(String),
    Delivery(String),
}

impl std::fmt::Display for MailError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connectivity(e) => write!(f, "could not reach the mail server: {e}"),
            Self::Auth(e) => write!(f, "mail server rejected the credentials: {e}"),
            Self::Delivery(e) => write!(f, "mail server rejected the message: {e}"),
        }
    }
}

impl std::error::Error for MailError {}

#[derive(Clone, Copy)]
enum Phase {
    Connect,
    Send,
}

fn classify(err: mail_send::Error, phase: Phase) -> MailError {
    match err {
        e @ mail_send::Error::AuthenticationFailed(_) => MailError::Auth(e.to_string()),
        other => match phase {
            Phase::Connect => MailError::Connectivity(other.to_string()),
            Phase::Send => MailError::Delivery(other.to_string()),
        },
    }
}

/// Remediation hint for providers whose authentication policy requires an
/// app-specific credential instead of the account password.
pub fn provider_hint(host: &str) -> Option<&'static str> {
    let host = host.to_ascii_lowercase();
    if host.contains("gmail") || host.contains("googlemail") {
        Some(
            "Gmail blocks account passwords for SMTP. Generate an app password \
             under Google Account > Security > 2-Step Verification and use it here.",
        )
    } else if host.contains("office365") || host.contains("outlook") || host.contains("hotmail") {
        Some(
            "Outlook/Office 365 requires an app password (or SMTP AUTH enabled by \
             your tenant admin) instead of the account password.",
        )
    } else if host.contains("yahoo") {
        Some("Yahoo Mail requires an app password generated in account security settings.")
    } else {
        None
    }
}

/// Mail-sending seam injected into the orchestrator so flows can be tested
/// with a recording fake.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn verify_and_send(
        &self,
        params: &SmtpParams,
        mail: &OutboundMail,
    ) -> Result<(), MailError>;
}

pub struct SmtpMailer;

#[async_trait]
impl Mailer for SmtpMailer {
    async fn verify_and_send(
        &self,
        params: &SmtpParams,
        mail: &OutboundMail,
    ) -> Result<(), MailError> {
        // Callers resolve the mask sentinel against the stored secret first;
        // the literal sentinel is never a credential.
        if params.password == MASK_TOKEN {
            return Err(MailError::Auth(
                "password placeholder was not resolved to a stored secret".to_owned(),
            ));
        }

        let message = MessageBuilder::new()
            .from(params.sender_email.as_str())
            .to(mail.to.as_str())
            .subject(mail.subject.as_str())
            .text_body(mail.body.as_str());

        let builder = SmtpClientBuilder::new(params.host.clone(), params.port)
            .implicit_tls(params.encryption.implicit_tls())
            .credentials((params.sender_email.clone(), params.password.clone()));
        let connect = builder.connect();

        let mut client = match tokio::time::timeout(SMTP_TIMEOUT, connect).await {
            Ok(Ok(client)) => client,
            Ok(Err(err)) => return Err(classify(err, Phase::Connect)),
            Err(_) => {
                return Err(MailError::Connectivity(format!(
                    "connection to {}:{} timed out",
                    params.host, params.port
                )));
            }
        };

        match tokio::time::timeout(SMTP_TIMEOUT, client.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(classify(err, Phase::Send)),
            Err(_) => Err(MailError::Delivery("message send timed out".to_owned())),
        }
    }
}

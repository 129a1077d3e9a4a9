//! Outbound email.
//!
//! Handlers never send mail inline: they hand a rendered [`Email`] to
//! [`BackgroundTasks`](crate::background::BackgroundTasks), which calls the
//! configured [`Mailer`]. Token plaintexts appear only in the rendered body
//! and are never logged.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::AppResult;

/// SMTP connection settings.
#[derive(Clone, Default)]
pub struct SmtpSettings {
    pub host: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub sender: String,
}

impl fmt::Debug for SmtpSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[redacted]"))
            .field("sender", &self.sender)
            .finish()
    }
}

/// Which message to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    UserWelcome,
    TokenActivation,
    TokenPasswordReset,
}

impl Template {
    pub fn name(self) -> &'static str {
        match self {
            Self::UserWelcome => "user_welcome",
            Self::TokenActivation => "token_activation",
            Self::TokenPasswordReset => "token_password_reset",
        }
    }
}

/// Values substituted into a template.
#[derive(Clone)]
pub struct TemplateData {
    pub user_id: i64,
    pub token: String,
    pub expiry: DateTime<Utc>,
}

impl fmt::Debug for TemplateData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateData")
            .field("user_id", &self.user_id)
            .field("token", &"[redacted]")
            .field("expiry", &self.expiry)
            .finish()
    }
}

/// A rendered message ready for delivery.
#[derive(Clone, PartialEq, Eq)]
pub struct Email {
    pub template: Template,
    pub recipient: String,
    pub subject: String,
    pub plain_body: String,
}

impl fmt::Debug for Email {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Email")
            .field("template", &self.template)
            .field("recipient", &self.recipient)
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

impl Email {
    pub fn render(template: Template, recipient: &str, data: &TemplateData) -> Self {
        let expiry = data.expiry.format("%Y-%m-%d %H:%M:%S UTC");
        let (subject, plain_body) = match template {
            Template::UserWelcome => (
                "Welcome to Movie Catalog!".to_string(),
                format!(
                    "Hi,\n\n\
                     Thanks for signing up for a Movie Catalog account. \
                     For future reference, your user ID number is {}.\n\n\
                     Please send a request to the `PUT /v1/users/activated` endpoint \
                     with the following JSON body to activate your account:\n\n\
                     {{\"token\": \"{}\"}}\n\n\
                     Please note that this is a one-time use token and it will expire at {expiry}.\n\n\
                     Thanks,\n\nThe Movie Catalog Team",
                    data.user_id, data.token
                ),
            ),
            Template::TokenActivation => (
                "Activate your Movie Catalog account".to_string(),
                format!(
                    "Hi,\n\n\
                     Please send a `PUT /v1/users/activated` request with the following \
                     JSON body to activate your account:\n\n\
                     {{\"token\": \"{}\"}}\n\n\
                     Please note that this is a one-time use token and it will expire at {expiry}.\n\n\
                     Thanks,\n\nThe Movie Catalog Team",
                    data.token
                ),
            ),
            Template::TokenPasswordReset => (
                "Reset your Movie Catalog password".to_string(),
                format!(
                    "Hi,\n\n\
                     Please send a `PUT /v1/users/password` request with the following \
                     JSON body to set a new password:\n\n\
                     {{\"password\": \"your new password\", \"token\": \"{}\"}}\n\n\
                     Please note that this is a one-time use token and it will expire at {expiry}.\n\n\
                     Thanks,\n\nThe Movie Catalog Team",
                    data.token
                ),
            ),
        };

        Self {
            template,
            recipient: recipient.to_string(),
            subject,
            plain_body,
        }
    }
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &Email) -> AppResult<()>;
}

/// Records the delivery in the log instead of talking to a relay.
#[derive(Debug, Clone)]
pub struct LogMailer {
    settings: SmtpSettings,
}

impl LogMailer {
    pub fn new(settings: SmtpSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &Email) -> AppResult<()> {
        info!(
            template = email.template.name(),
            recipient = %email.recipient,
            sender = %self.settings.sender,
            relay = self.settings.host.as_deref().unwrap_or("none"),
            subject = %email.subject,
            "Email dispatched"
        );
        Ok(())
    }
}

/// Keeps every delivered email in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryMailer {
    outbox: Arc<Mutex<Vec<Email>>>,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Email> {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Most recent email delivered to `recipient`.
    pub fn last_to(&self, recipient: &str) -> Option<Email> {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|email| email.recipient == recipient)
            .cloned()
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send(&self, email: &Email) -> AppResult<()> {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(email.clone());
        Ok(())
    }
}

/// Pull the 26-character token out of a rendered body.
pub fn extract_token(body: &str) -> Option<&str> {
    let start = body.find("\"token\": \"")? + "\"token\": \"".len();
    body.get(start..start + crate::data::tokens::TOKEN_PLAINTEXT_LEN)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn data() -> TemplateData {
        TemplateData {
            user_id: 7,
            token: "ABCDEFGHIJKLMNOPQRSTUVWXYZ".to_string(),
            expiry: Utc::now(),
        }
    }

    #[test]
    fn test_welcome_contains_user_id_and_token() {
        let email = Email::render(Template::UserWelcome, "alice@example.com", &data());
        assert!(email.plain_body.contains("user ID number is 7"));
        assert_eq!(
            extract_token(&email.plain_body),
            Some("ABCDEFGHIJKLMNOPQRSTUVWXYZ")
        );
        assert_eq!(email.recipient, "alice@example.com");
    }

    #[test]
    fn test_each_template_names_its_endpoint() {
        let activation = Email::render(Template::TokenActivation, "a@b.co", &data());
        assert!(activation.plain_body.contains("/v1/users/activated"));

        let reset = Email::render(Template::TokenPasswordReset, "a@b.co", &data());
        assert!(reset.plain_body.contains("/v1/users/password"));
        assert_eq!(
            extract_token(&reset.plain_body),
            Some("ABCDEFGHIJKLMNOPQRSTUVWXYZ")
        );
    }

    #[test]
    fn test_debug_never_shows_token_or_password() {
        let email = Email::render(Template::UserWelcome, "a@b.co", &data());
        assert!(!format!("{email:?}").contains("ABCDEFGH"));
        assert!(!format!("{:?}", data()).contains("ABCDEFGH"));

        let settings = SmtpSettings {
            password: Some("hunter2".into()),
            ..Default::default()
        };
        assert!(!format!("{settings:?}").contains("hunter2"));
    }

    #[tokio::test]
    async fn test_memory_mailer_records_deliveries() {
        let mailer = MemoryMailer::new();
        let first = Email::render(Template::TokenActivation, "a@b.co", &data());
        let second = Email::render(Template::TokenPasswordReset, "a@b.co", &data());

        mailer.send(&first).await.unwrap();
        mailer.send(&second).await.unwrap();

        assert_eq!(mailer.sent().len(), 2);
        assert_eq!(
            mailer.last_to("a@b.co").unwrap().template,
            Template::TokenPasswordReset
        );
        assert!(mailer.last_to("other@b.co").is_none());
    }

    #[tokio::test]
    async fn test_log_mailer_accepts_message() {
        let mailer = LogMailer::new(SmtpSettings::default());
        let email = Email::render(Template::UserWelcome, "a@b.co", &data());
        assert!(mailer.send(&email).await.is_ok());
    }
}

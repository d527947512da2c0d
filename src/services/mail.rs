//! Mail adapters: a transactional HTTP API (Resend) or plain SMTP, chosen once
//! from configuration. Sending is always best-effort for notifications.

use async_trait::async_trait;
use chrono::Utc;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

use crate::config::MailConfig;

const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";

#[derive(Debug, Error)]
pub enum MailError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("invalid mailbox `{0}`")]
    Address(String),
    #[error("failed to build message: {0}")]
    Message(#[from] lettre::error::Error),
    #[error(transparent)]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("mail provider rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait MailAdapter: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), MailError>;

    fn provider(&self) -> &'static str;
}

pub struct ResendMailAdapter {
    client: reqwest::Client,
    api_key: String,
    from: String,
}

impl ResendMailAdapter {
    pub fn new(api_key: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            from: from.into(),
        }
    }
}

#[async_trait]
impl MailAdapter for ResendMailAdapter {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), MailError> {
        let response = self
            .client
            .post(RESEND_ENDPOINT)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "from": self.from,
                "to": [to],
                "subject": subject,
                "html": html,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    fn provider(&self) -> &'static str {
        "resend"
    }
}

pub struct SmtpMailAdapter {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailAdapter {
    /// `secure` selects implicit TLS; otherwise STARTTLS is required.
    pub fn new(
        host: &str,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        secure: bool,
        from: &str,
    ) -> Result<Self, MailError> {
        let builder = if secure {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?
        };
        let mut builder = builder.port(port);
        if let (Some(user), Some(pass)) = (username, password) {
            builder = builder.credentials(Credentials::new(user, pass));
        }

        Ok(Self {
            transport: builder.build(),
            from: parse_mailbox(from)?,
        })
    }
}

#[async_trait]
impl MailAdapter for SmtpMailAdapter {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), MailError> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(parse_mailbox(to)?)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html.to_string())?;
        self.transport.send(message).await?;
        Ok(())
    }

    fn provider(&self) -> &'static str {
        "smtp"
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, MailError> {
    address
        .parse::<Mailbox>()
        .map_err(|_| MailError::Address(address.to_string()))
}

/// Notification front-end over the configured adapter, if any.
#[derive(Clone, Default)]
pub struct Mailer {
    adapter: Option<Arc<dyn MailAdapter>>,
}

impl Mailer {
    pub fn new(adapter: Arc<dyn MailAdapter>) -> Self {
        Self {
            adapter: Some(adapter),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn from_config(cfg: &MailConfig) -> Result<Self, MailError> {
        let mailer = match cfg {
            MailConfig::Disabled => Self::disabled(),
            MailConfig::Resend { api_key, from } => {
                Self::new(Arc::new(ResendMailAdapter::new(api_key.clone(), from.clone())))
            }
            MailConfig::Smtp {
                host,
                port,
                username,
                password,
                secure,
                from,
            } => Self::new(Arc::new(SmtpMailAdapter::new(
                host,
                *port,
                username.clone(),
                password.clone(),
                *secure,
                from,
            )?)),
        };
        match &mailer.adapter {
            Some(adapter) => tracing::info!(provider = adapter.provider(), "mail adapter ready"),
            None => tracing::warn!("no mail adapter configured; notifications are disabled"),
        }
        Ok(mailer)
    }

    /// Tell a user about a new sign-in. Failures are logged and swallowed.
    pub async fn send_login_notification(&self, email: &str, ip: &str, user_agent: &str) {
        let Some(adapter) = &self.adapter else {
            tracing::warn!("no mail adapter configured; skipping login notification");
            return;
        };

        let html = login_notification_html(ip, user_agent);
        match adapter.send(email, "New Login Detected", &html).await {
            Ok(()) => tracing::info!(provider = adapter.provider(), "sent login alert"),
            Err(err) => tracing::error!(error = %err, "failed to send login alert"),
        }
    }
}

fn login_notification_html(ip: &str, user_agent: &str) -> String {
    format!(
        "<h1>New Login Detected</h1>\
         <p>We detected a new login to your account.</p>\
         <ul>\
         <li><strong>IP Address:</strong> {}</li>\
         <li><strong>Device:</strong> {}</li>\
         <li><strong>Time:</strong> {}</li>\
         </ul>",
        html_escape(ip),
        html_escape(user_agent),
        Utc::now().to_rfc2822()
    )
}

fn html_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

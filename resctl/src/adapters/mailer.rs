//! Email notifier for resource lifecycle events.

use async_trait::async_trait;
use lettre::{
    AsyncFileTransport, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use std::path::Path;
use tracing::instrument;

use crate::{
    adapters::{AdapterError, ExternalSystem, Notifier, Result},
    config::{MailTransportConfig, MailerConfig},
    types::UserId,
};

enum MailTransport {
    Smtp(AsyncSmtpTransport<Tokio1Executor>),
    File(AsyncFileTransport<Tokio1Executor>),
}

pub struct MailNotifier {
    transport: MailTransport,
    from_email: String,
    from_name: String,
    recipient_template: String,
}

fn mail_error(message: String) -> AdapterError {
    AdapterError::Request {
        system: ExternalSystem::Mailer,
        message,
    }
}

impl MailNotifier {
    pub fn new(config: &MailerConfig) -> anyhow::Result<Self> {
        let transport = match &config.transport {
            MailTransportConfig::Smtp {
                host,
                port,
                username,
                password,
                use_tls,
            } => {
                if !use_tls {
                    tracing::warn!("SMTP TLS is disabled - this is not recommended for production");
                }

                let builder = if *use_tls {
                    AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?
                } else {
                    AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
                }
                .port(*port)
                .credentials(Credentials::new(username.clone(), password.clone()));

                MailTransport::Smtp(builder.build())
            }
            MailTransportConfig::File { path } => {
                let dir = Path::new(path);
                if !dir.exists() {
                    std::fs::create_dir_all(dir)?;
                }
                MailTransport::File(AsyncFileTransport::<Tokio1Executor>::new(dir))
            }
            MailTransportConfig::Dummy => anyhow::bail!("the dummy mail transport has no mailer"),
        };

        Ok(Self {
            transport,
            from_email: config.from_email.clone(),
            from_name: config.from_name.clone(),
            recipient_template: config.recipient_template.clone(),
        })
    }

    fn recipient(&self, user: UserId) -> String {
        self.recipient_template.replace("{user_id}", &user.to_string())
    }

    async fn send(&self, user: UserId, subject: &str, body: String) -> Result<()> {
        let from = format!("{} <{}>", self.from_name, self.from_email)
            .parse::<Mailbox>()
            .map_err(|e| mail_error(format!("parse from address: {e}")))?;
        let to = self
            .recipient(user)
            .parse::<Mailbox>()
            .map_err(|e| mail_error(format!("parse recipient address: {e}")))?;

        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .map_err(|e| mail_error(format!("build message: {e}")))?;

        match &self.transport {
            MailTransport::Smtp(transport) => {
                transport.send(message).await.map_err(|e| mail_error(e.to_string()))?;
            }
            MailTransport::File(transport) => {
                transport.send(message).await.map_err(|e| mail_error(e.to_string()))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for MailNotifier {
    #[instrument(skip(self), err)]
    async fn notify_created(&self, user: UserId, label: &str, tariff: &str) -> Result<()> {
        let body = format!("Your resource '{label}' has been created on the '{tariff}' tariff.");
        self.send(user, &format!("Resource {label} created"), body).await
    }

    #[instrument(skip(self), err)]
    async fn notify_deleted(&self, user: UserId, label: &str) -> Result<()> {
        let body = format!("Your resource '{label}' has been deleted.");
        self.send(user, &format!("Resource {label} deleted"), body).await
    }
}

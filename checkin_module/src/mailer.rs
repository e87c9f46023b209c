use async_trait::async_trait;

/// Outbound mail capability. The Postmark implementation delegates to
/// `send_emails_module`; tests inject a recording fake.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: OutboundEmail) -> Result<String, MailError>;
}

#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("send failed: {0}")]
    Send(String),
    #[error("send task aborted: {0}")]
    Join(String),
}

#[derive(Debug, Clone)]
pub struct PostmarkMailer {
    from: String,
}

impl PostmarkMailer {
    pub fn new(from: impl Into<String>) -> Self {
        Self { from: from.into() }
    }
}

#[async_trait]
impl Mailer for PostmarkMailer {
    async fn send(&self, email: OutboundEmail) -> Result<String, MailError> {
        let params = send_emails_module::SendEmailParams {
            from: self.from.clone(),
            to: vec![email.to],
            cc: vec![],
            subject: email.subject,
            html_body: email.html,
            text_body: email.text,
            in_reply_to: None,
            references: None,
        };
        // send_email uses a blocking client; keep it off the async workers.
        let response = tokio::task::spawn_blocking(move || send_emails_module::send_email(&params))
            .await
            .map_err(|err| MailError::Join(err.to_string()))?
            .map_err(|err| MailError::Send(err.to_string()))?;
        Ok(response.message_id)
    }
}

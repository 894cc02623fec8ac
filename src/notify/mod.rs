use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use crate::config::TwilioConfig;
use crate::shared::error::ApiError;
use crate::shared::models::{Queue, User};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const TWILIO_BASE_URL: &str = "https://api.twilio.com/2010-04-01";

#[derive(Debug, thiserror::Error)]
pub enum SmsError {
    #[error("sms request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("sms provider returned HTTP {status}: {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("sms delivery is not configured")]
    Disabled,
}

#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send(&self, to: &str, body: &str) -> Result<(), SmsError>;
}

pub struct TwilioSender {
    config: TwilioConfig,
    http_client: Client,
    base_url: String,
}

impl TwilioSender {
    pub fn new(config: TwilioConfig) -> Self {
        Self {
            config,
            http_client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: TWILIO_BASE_URL.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }
}

#[async_trait]
impl SmsSender for TwilioSender {
    async fn send(&self, to: &str, body: &str) -> Result<(), SmsError> {
        let url = format!(
            "{}/Accounts/{}/Messages.json",
            self.base_url, self.config.account_sid
        );

        let mut params: Vec<(&str, &str)> = vec![("To", to), ("Body", body)];
        if let Some(msid) = &self.config.messaging_service_sid {
            params.push(("MessagingServiceSid", msid));
        } else {
            params.push(("From", &self.config.from_number));
        }

        let resp = self
            .http_client
            .post(url)
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&params)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SmsError::Api { status, body });
        }
        Ok(())
    }
}

/// Reacts to meeting state transitions. The caller tells it which transition
/// happened (the dispatcher never polls), and each recipient is an
/// independent failure domain: a bad number is logged and skipped, the rest
/// are still notified.
pub struct NotificationDispatcher {
    sender: Option<Arc<dyn SmsSender>>,
    public_base_url: String,
}

fn sms_reachable(user: &User) -> bool {
    user.phone_verified && !user.phone_number.is_empty()
}

impl NotificationDispatcher {
    pub fn new(sender: Option<Arc<dyn SmsSender>>, public_base_url: String) -> Self {
        Self {
            sender,
            public_base_url,
        }
    }

    async fn send_each<'a>(
        &self,
        recipients: impl Iterator<Item = &'a User>,
        body: &str,
    ) -> usize {
        let Some(sender) = &self.sender else {
            tracing::debug!("sms delivery is not configured, skipping notifications");
            return 0;
        };
        let mut sent = 0;
        for user in recipients {
            match sender.send(&user.phone_number, body).await {
                Ok(()) => sent += 1,
                Err(err) => {
                    tracing::error!(user = %user.username, error = %err,
                        "failed to deliver notification, continuing with remaining recipients");
                }
            }
        }
        sent
    }

    /// A meeting was created at the front of the line, so the queue just
    /// became non-empty: tell the opted-in hosts.
    pub async fn queue_has_waiting_attendee(&self, queue: &Queue, hosts: &[User]) -> usize {
        let body = format!(
            "Someone is waiting in line for {}. Manage your queue at {}/manage/{}/",
            queue.name, self.public_base_url, queue.id
        );
        self.send_each(
            hosts
                .iter()
                .filter(|h| h.notify_me_host && sms_reachable(h)),
            &body,
        )
        .await
    }

    /// A meeting crossed into STARTED: tell the opted-in attendees.
    pub async fn meeting_started(&self, queue: &Queue, attendees: &[User]) -> usize {
        let body = format!(
            "Your meeting in {} is starting. Go to {}/queue/{}/ to join.",
            queue.name, self.public_base_url, queue.id
        );
        self.send_each(
            attendees
                .iter()
                .filter(|a| a.notify_me_attendee && sms_reachable(a)),
            &body,
        )
        .await
    }

    /// One-time phone verification code. Unlike the transition
    /// notifications, failure here must surface to the caller.
    pub async fn send_verification_code(&self, phone: &str, code: &str) -> Result<(), ApiError> {
        let sender = self.sender.as_ref().ok_or_else(|| {
            ApiError::Validation("SMS delivery is not configured on this server".to_string())
        })?;
        let body = format!("Your verification code is {code}");
        sender.send(phone, &body).await.map_err(|err| {
            tracing::error!(error = %err, "failed to send verification code");
            ApiError::backend_failure("twilio")
        })
    }
}

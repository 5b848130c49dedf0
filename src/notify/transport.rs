//! Outbound delivery of composed notifications.

use std::time::Duration;

use reqwest::blocking::Client;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

use super::{NotificationRequest, Severity};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("notification request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("notification endpoint returned HTTP {status}")]
    Status { status: u16 },
}

/// Sends one composed notification.
pub trait NotificationTransport {
    fn send(&self, request: &NotificationRequest) -> Result<(), TransportError>;
}

/// Generic JSON webhook transport.
pub struct HttpTransport {
    client: Client,
    url: String,
    auth_token: Option<String>,
    sender: String,
}

#[derive(Serialize)]
struct OutboundMessage<'a> {
    recipient: &'a str,
    from: &'a str,
    message: &'a str,
    severity: Severity,
    color: &'static str,
}

impl HttpTransport {
    pub fn new(
        url: impl Into<String>,
        auth_token: Option<String>,
        sender: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            url: url.into(),
            auth_token,
            sender: sender.into(),
        })
    }
}

impl NotificationTransport for HttpTransport {
    fn send(&self, request: &NotificationRequest) -> Result<(), TransportError> {
        let body = OutboundMessage {
            recipient: &request.recipient,
            from: &self.sender,
            message: &request.text,
            severity: request.severity,
            color: request.severity.color(),
        };

        let mut builder = self.client.post(&self.url).json(&body);
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

/// Send `request`, logging the result. Never retries and never fails the
/// caller; returns whether delivery succeeded.
pub fn deliver<T: NotificationTransport + ?Sized>(transport: &T, request: &NotificationRequest) -> bool {
    match transport.send(request) {
        Ok(()) => {
            debug!(recipient = %request.recipient, "notification sent");
            true
        }
        Err(e) => {
            error!(recipient = %request.recipient, error = %e, "failed to send notification");
            false
        }
    }
}

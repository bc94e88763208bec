use futures::future::join_all;
use serde::Serialize;
use url::Url;
use valuable::Valuable;

const LOG_BODY_PREVIEW: usize = 200;

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(thiserror::Error, Serialize, Debug, Clone, PartialEq, Valuable)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Error {
    #[error("delivery to {to} was rejected: {message}")]
    Rejected { to: String, message: String },
    #[error("failed to reach notification endpoint: {message}")]
    Transport { message: String },
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport {
            message: format!("{err:#}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Somewhere affected users can be told about an alert
pub trait Notifier: Send + Sync {
    fn send(&self, notification: &Notification) -> impl Future<Output = Result<()>> + Send;
}

/// Writes each notification as a structured log line
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let Notification { to, subject, body } = notification;
        let preview: String = body.chars().take(LOG_BODY_PREVIEW).collect();

        tracing::info!(to = %to, subject = %subject, body = %preview, "notification");

        Ok(())
    }
}

/// POSTs each notification as JSON to a mail relay or chat hook
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    http_client: reqwest::Client,
    url: Url,
}

impl WebhookNotifier {
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            url,
        }
    }
}

impl Notifier for WebhookNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let response = self
            .http_client
            .post(self.url.clone())
            .json(notification)
            .send()
            .await?;

        if let Err(err) = response.error_for_status_ref() {
            return Err(Error::Rejected {
                to: notification.to.clone(),
                message: err.to_string(),
            });
        }

        Ok(())
    }
}

/// The notifier the binary wires up, chosen by whether a webhook is configured
#[derive(Debug, Clone)]
pub enum AnyNotifier {
    Log(LogNotifier),
    Webhook(WebhookNotifier),
}

impl AnyNotifier {
    #[must_use]
    pub fn from_webhook(url: Option<Url>) -> Self {
        url.map_or(Self::Log(LogNotifier), |url| {
            Self::Webhook(WebhookNotifier::new(url))
        })
    }
}

impl Notifier for AnyNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        match self {
            Self::Log(inner) => inner.send(notification).await,
            Self::Webhook(inner) => inner.send(notification).await,
        }
    }
}

#[derive(Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: Vec<String>,
}

/// Sends every notification concurrently. Failures are logged and listed, never returned.
pub async fn dispatch<N: Notifier>(notifier: &N, notifications: &[Notification]) -> DispatchReport {
    let results = join_all(
        notifications
            .iter()
            .map(|n| async move { (n, notifier.send(n).await) }),
    )
    .await;

    let mut report = DispatchReport::default();
    for (notification, result) in results {
        match result {
            Ok(()) => report.delivered += 1,
            Err(err) => {
                tracing::warn!(error = err.as_value(), "failed to deliver notification");
                report.failed.push(notification.to.clone());
            }
        }
    }

    report
}

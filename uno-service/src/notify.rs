// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, info, warn};
use uno_common::{Notification, ParticipantId, SeatKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub participant_id: ParticipantId,
    pub kind: SeatKind,
}

impl Recipient {
    pub fn human(participant_id: impl Into<ParticipantId>) -> Self {
        Self {
            participant_id: participant_id.into(),
            kind: SeatKind::Human,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// Every participant still seated when the outbox is dispatched.
    Everyone,
    Only(Recipient),
}

/// A notification queued by a table, delivered after its lock is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub audience: Audience,
    pub notification: Notification,
}

impl Outbound {
    pub fn everyone(notification: Notification) -> Self {
        Self {
            audience: Audience::Everyone,
            notification,
        }
    }

    pub fn only(recipient: Recipient, notification: Notification) -> Self {
        Self {
            audience: Audience::Only(recipient),
            notification,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        participant_id: &str,
        notification: &Notification,
    ) -> anyhow::Result<()>;
}

/// Posts each notification as JSON to an external delivery endpoint.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("NOTIFY_WEBHOOK_URL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())?;
        Some(Self {
            client: reqwest::Client::new(),
            url,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(
        &self,
        participant_id: &str,
        notification: &Notification,
    ) -> anyhow::Result<()> {
        let payload = serde_json::json!({
            "participant_id": participant_id,
            "notification": notification,
        });
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .context("failed to call notification webhook")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<response body unavailable>".to_string());
            anyhow::bail!("notification webhook returned {status}: {body}");
        }
        Ok(())
    }
}

/// Writes notifications to the log when no webhook is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        participant_id: &str,
        notification: &Notification,
    ) -> anyhow::Result<()> {
        let payload =
            serde_json::to_string(notification).context("failed to encode notification")?;
        info!(participant_id = %participant_id, payload = %payload, "notification");
        Ok(())
    }
}

/// Best-effort delivery. Synthetic seats are skipped and failures only logged.
#[derive(Clone)]
pub struct Courier {
    notifier: Arc<dyn Notifier>,
}

impl Courier {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    pub fn from_env() -> Self {
        match WebhookNotifier::from_env() {
            Some(webhook) => {
                info!(url = %webhook.url, "delivering notifications through webhook");
                Self::new(Arc::new(webhook))
            }
            None => Self::new(Arc::new(LogNotifier)),
        }
    }

    /// Sends a delivery check and reports whether it went through.
    pub async fn check_reachable(&self, participant_id: &str) -> anyhow::Result<()> {
        self.notifier
            .notify(participant_id, &Notification::DeliveryCheck)
            .await
    }

    pub async fn deliver(&self, recipient: &Recipient, notification: &Notification) {
        if recipient.kind.is_synthetic() {
            debug!(participant_id = %recipient.participant_id, "skipping synthetic recipient");
            return;
        }
        if let Err(error) = self
            .notifier
            .notify(&recipient.participant_id, notification)
            .await
        {
            warn!(
                participant_id = %recipient.participant_id,
                error = %error,
                "notification delivery failed"
            );
        }
    }

    pub async fn dispatch(&self, roster: &[Recipient], outbox: Vec<Outbound>) {
        for outbound in outbox {
            match &outbound.audience {
                Audience::Everyone => {
                    for recipient in roster {
                        self.deliver(recipient, &outbound.notification).await;
                    }
                }
                Audience::Only(recipient) => {
                    self.deliver(recipient, &outbound.notification).await;
                }
            }
        }
    }
}

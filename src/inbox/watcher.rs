use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::mailbox::{MailMessage, Mailbox};
use super::matcher::{Delivery, Match, MatchStrategy, PendingBatch};
use crate::config::InboxConfig;
use crate::error::{ConfigError, DlTdvmsError, MailError};
use crate::gate::sleep_or_cancel;

type Result<T> = std::result::Result<T, DlTdvmsError>;

/// Polls the mailbox for portal notifications and pairs them with batches
pub struct InboxWatcher {
    mailbox: Arc<Mutex<Box<dyn Mailbox>>>,
    sender: String,
    link: Regex,
    poll_interval: Duration,
    max_checks: u32,
    mail_timeout: Duration,
}

impl InboxWatcher {
    pub fn new(mailbox: Box<dyn Mailbox>, config: &InboxConfig) -> Result<Self> {
        let link = Regex::new(&config.link_pattern).map_err(|e| ConfigError::Invalid {
            field: "inbox.link_pattern".to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            mailbox: Arc::new(Mutex::new(mailbox)),
            sender: config.sender.clone(),
            link,
            poll_interval: config.poll_interval(),
            max_checks: config.max_checks.max(1),
            mail_timeout: config.mail_timeout(),
        })
    }

    async fn fetch(&self) -> Result<Vec<MailMessage>> {
        let mailbox = self.mailbox.clone();
        let sender = self.sender.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut mailbox = mailbox
                .lock()
                .map_err(|_| MailError::Worker("mailbox lock poisoned".to_string()))?;
            mailbox.fetch(&sender)
        });

        match tokio::time::timeout(self.mail_timeout, task).await {
            Err(_) => Err(MailError::Timeout {
                seconds: self.mail_timeout.as_secs(),
            }
            .into()),
            Ok(Err(join)) => Err(MailError::Worker(join.to_string()).into()),
            Ok(Ok(fetched)) => Ok(fetched?),
        }
    }

    /// Notifications with a download link that no batch has claimed yet
    pub async fn deliveries(&self, consumed: &HashSet<String>) -> Result<Vec<Delivery>> {
        let messages = self.fetch().await?;
        let mut deliveries = Vec::new();
        for message in &messages {
            if consumed.contains(&message.id) {
                continue;
            }
            match Delivery::from_message(message, &self.link) {
                Some(delivery) => deliveries.push(delivery),
                None => tracing::debug!(
                    "{}",
                    MailError::NoLink {
                        id: message.id.clone()
                    }
                ),
            }
        }
        Ok(deliveries)
    }

    /// One look at the inbox
    pub async fn check_once(
        &self,
        pending: &[PendingBatch],
        consumed: &HashSet<String>,
        matcher: &dyn MatchStrategy,
    ) -> Result<Vec<Match>> {
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        let deliveries = self.deliveries(consumed).await?;
        let matches = matcher.assign(pending, &deliveries);
        tracing::debug!(
            strategy = matcher.name(),
            unclaimed = deliveries.len(),
            matched = matches.len(),
            "Checked inbox"
        );
        Ok(matches)
    }

    /// Check the inbox up to `max_checks` times, `poll_interval` apart, and
    /// return as soon as anything matched. An empty result means the portal
    /// has not answered yet; the batches stay submitted.
    pub async fn poll(
        &self,
        pending: &[PendingBatch],
        consumed: &HashSet<String>,
        matcher: &dyn MatchStrategy,
        cancel: &CancellationToken,
    ) -> Result<Vec<Match>> {
        for check in 1..=self.max_checks {
            if cancel.is_cancelled() {
                return Err(DlTdvmsError::Cancelled);
            }
            match self.check_once(pending, consumed, matcher).await {
                Ok(matches) if !matches.is_empty() => return Ok(matches),
                Ok(_) => {
                    tracing::info!(
                        check,
                        max_checks = self.max_checks,
                        "No notification yet"
                    );
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(check, "Inbox check failed: {}", e);
                }
                Err(e) => return Err(e),
            }
            if check < self.max_checks {
                sleep_or_cancel(self.poll_interval, cancel).await?;
            }
        }
        Ok(Vec::new())
    }
}

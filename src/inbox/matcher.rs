//! Pairing notification mails with submitted batches
//!
//! The portal's notifications do not carry any reference to the request they
//! answer today, so a token match only works if the portal starts echoing one.
//! Until then the arrival-order fallback does the work: the oldest unclaimed
//! notification goes to the batch submitted first. That fallback is wrong when
//! mails arrive out of order, when a request silently fails on the portal side,
//! or when several campaigns share one inbox. Running one campaign per inbox
//! and checking archives with `check-zipfiles` catches such mix-ups.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::HashSet;

use super::mailbox::MailMessage;
use crate::config::MatchStrategyKind;

/// A submitted batch still waiting for its notification
#[derive(Debug, Clone, PartialEq)]
pub struct PendingBatch {
    pub index: usize,
    pub request_token: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
}

/// A notification carrying a download link
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message_id: String,
    /// Mailbox order (IMAP uid)
    pub order: u64,
    pub received_at: Option<DateTime<Utc>>,
    pub download_url: String,
    /// Subject and body, used for token lookup
    pub text: String,
}

impl Delivery {
    /// Build from a mail, or `None` when it holds no download link
    pub fn from_message(message: &MailMessage, link: &Regex) -> Option<Self> {
        let text = format!("{}\n{}", message.subject, message.body);
        let download_url = extract_download_link(&text, link)?;
        Some(Self {
            message_id: message.id.clone(),
            order: u64::from(message.uid),
            received_at: message.received_at,
            download_url,
            text,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub batch_index: usize,
    pub download_url: String,
    pub message_id: String,
}

/// First archive link in `text`, after undoing HTML escaping
pub fn extract_download_link(text: &str, link: &Regex) -> Option<String> {
    let unescaped = text
        .replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#x2F;", "/")
        .replace("&#47;", "/");
    link.find(&unescaped).map(|m| m.as_str().to_string())
}

/// Decides which delivery belongs to which pending batch. Each batch and each
/// delivery is used at most once.
pub trait MatchStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn assign(&self, pending: &[PendingBatch], deliveries: &[Delivery]) -> Vec<Match>;
}

/// Matches a delivery whose text contains the batch's request token
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenMatcher;

impl MatchStrategy for TokenMatcher {
    fn name(&self) -> &'static str {
        "token"
    }

    fn assign(&self, pending: &[PendingBatch], deliveries: &[Delivery]) -> Vec<Match> {
        let mut used = HashSet::new();
        let mut matches = Vec::new();

        for batch in pending {
            let Some(token) = batch.request_token.as_deref() else {
                continue;
            };
            if let Some(delivery) = deliveries
                .iter()
                .find(|d| !used.contains(&d.message_id) && d.text.contains(token))
            {
                used.insert(delivery.message_id.clone());
                matches.push(Match {
                    batch_index: batch.index,
                    download_url: delivery.download_url.clone(),
                    message_id: delivery.message_id.clone(),
                });
            }
        }
        matches
    }
}

/// Pairs batches in submission order with deliveries in mailbox order.
/// A delivery received before a batch was submitted is never given to it.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArrivalOrderMatcher;

impl MatchStrategy for ArrivalOrderMatcher {
    fn name(&self) -> &'static str {
        "arrival"
    }

    fn assign(&self, pending: &[PendingBatch], deliveries: &[Delivery]) -> Vec<Match> {
        let mut batches: Vec<&PendingBatch> = pending.iter().collect();
        batches.sort_by_key(|b| (b.submitted_at, b.index));
        let mut ordered: Vec<&Delivery> = deliveries.iter().collect();
        ordered.sort_by_key(|d| d.order);

        let mut used = vec![false; ordered.len()];
        let mut matches = Vec::new();

        for batch in batches {
            let candidate = ordered.iter().enumerate().find(|(i, d)| {
                !used[*i]
                    && match (batch.submitted_at, d.received_at) {
                        (Some(sent), Some(received)) => received >= sent,
                        _ => true,
                    }
            });
            if let Some((i, delivery)) = candidate {
                used[i] = true;
                matches.push(Match {
                    batch_index: batch.index,
                    download_url: delivery.download_url.clone(),
                    message_id: delivery.message_id.clone(),
                });
            }
        }
        matches
    }
}

/// Token matches first, arrival order for whatever is left
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoMatcher;

impl MatchStrategy for AutoMatcher {
    fn name(&self) -> &'static str {
        "auto"
    }

    fn assign(&self, pending: &[PendingBatch], deliveries: &[Delivery]) -> Vec<Match> {
        let mut matches = TokenMatcher.assign(pending, deliveries);

        let matched_batches: HashSet<usize> = matches.iter().map(|m| m.batch_index).collect();
        let matched_mails: HashSet<&str> = matches.iter().map(|m| m.message_id.as_str()).collect();

        let rest_pending: Vec<PendingBatch> = pending
            .iter()
            .filter(|b| !matched_batches.contains(&b.index))
            .cloned()
            .collect();
        let rest_deliveries: Vec<Delivery> = deliveries
            .iter()
            .filter(|d| !matched_mails.contains(d.message_id.as_str()))
            .cloned()
            .collect();

        let by_order = ArrivalOrderMatcher.assign(&rest_pending, &rest_deliveries);
        if !by_order.is_empty() {
            tracing::debug!(
                count = by_order.len(),
                "Matched notifications by arrival order"
            );
        }
        matches.extend(by_order);
        matches
    }
}

pub fn strategy_for(kind: MatchStrategyKind) -> Box<dyn MatchStrategy> {
    match kind {
        MatchStrategyKind::Auto => Box::new(AutoMatcher),
        MatchStrategyKind::Token => Box::new(TokenMatcher),
        MatchStrategyKind::Arrival => Box::new(ArrivalOrderMatcher),
    }
}

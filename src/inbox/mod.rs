//! Delivery notifications
//!
//! The portal answers each accepted request with an e-mail holding a link to
//! the prepared archive. This module reads those mails (without marking them
//! read or deleting them), pairs them with submitted batches and hands back the
//! links to download.

mod mailbox;
mod matcher;
mod watcher;

pub use mailbox::{ImapCredentials, ImapMailbox, MailMessage, Mailbox};
pub use matcher::{
    extract_download_link, strategy_for, ArrivalOrderMatcher, AutoMatcher, Delivery, Match,
    MatchStrategy, PendingBatch, TokenMatcher,
};
pub use watcher::InboxWatcher;

//! Domain-specific error types for dl-tdvms
//!
//! This module provides structured error handling with proper error chains
//! and context preservation.

use std::path::PathBuf;
use thiserror::Error;

use crate::state::{BatchStatus, DriftReport};

/// Top-level error type for the dl-tdvms application
#[derive(Error, Debug)]
pub enum DlTdvmsError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Portal error: {0}")]
    Portal(#[from] PortalError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DlTdvmsError {
    /// Whether the failed operation may succeed if attempted again later
    pub fn is_retryable(&self) -> bool {
        match self {
            DlTdvmsError::Portal(e) => e.is_retryable(),
            DlTdvmsError::Mail(e) => e.is_retryable(),
            DlTdvmsError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

/// Request configuration and tool settings errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("Unknown selection type: {0}")]
    UnknownSelection(String),

    #[error("Unknown device type: {0} (expected one of H, L, N)")]
    UnknownDeviceType(String),

    #[error("Unrecognized data format: {0} (expected mseed, fseed or inventory)")]
    UnknownDataFormat(String),

    #[error("Invalid network {0}")]
    UnknownNetwork(String),

    #[error("No stations match the selection")]
    NoStations,

    #[error("Malformed station inventory entry {station}: {reason}")]
    MalformedInventory { station: String, reason: String },

    #[error("Invalid path: {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },
}

/// Portal (HTTP) errors for inventory fetches, submissions and archive downloads
#[derive(Error, Debug)]
pub enum PortalError {
    #[error("Request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Request to {url} timed out after {seconds}s")]
    Timeout { url: String, seconds: u64 },

    #[error("{url} answered with HTTP status {status}")]
    Status { url: String, status: u16 },

    #[error("Portal is busy, the previous request may still be in progress")]
    Busy,

    #[error("Portal rejected the request (general error)")]
    Rejected,

    #[error("Unexpected portal response: {0}")]
    UnexpectedResponse(String),
}

impl PortalError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PortalError::Transport { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            PortalError::Timeout { .. } | PortalError::Busy | PortalError::Rejected => true,
            PortalError::Status { status, .. } => *status == 429 || *status >= 500,
            PortalError::UnexpectedResponse(_) => false,
        }
    }

    /// Classify a reqwest error against its URL
    pub(crate) fn from_reqwest(url: &str, source: reqwest::Error, timeout_secs: u64) -> Self {
        if source.is_timeout() {
            PortalError::Timeout {
                url: url.to_string(),
                seconds: timeout_secs,
            }
        } else {
            PortalError::Transport {
                url: url.to_string(),
                source,
            }
        }
    }
}

/// Mailbox access and message parsing errors
#[derive(Error, Debug)]
pub enum MailError {
    #[error("IMAP error: {0}")]
    Imap(#[from] imap::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("Mailbox operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Failed to parse message {id}: {reason}")]
    Parse { id: String, reason: String },

    #[error("Download link couldn't be found in message {id}")]
    NoLink { id: String },

    #[error("Mailbox worker failed: {0}")]
    Worker(String),
}

impl MailError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MailError::Imap(imap::Error::Io(_))
                | MailError::Imap(imap::Error::ConnectionLost)
                | MailError::Timeout { .. }
        )
    }
}

/// Progress state store errors
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Failed to access state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("State file {path} is not valid: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Batch {index}: cannot move from {from} to {to}")]
    InvalidTransition {
        index: usize,
        from: BatchStatus,
        to: BatchStatus,
    },

    #[error("Batch {0} does not exist in this run")]
    UnknownBatch(usize),

    #[error("State for {config_id} is in use by another process (lock {lock})")]
    Locked { config_id: String, lock: PathBuf },

    #[error("{0}")]
    Drift(DriftReport),
}

/// Archive validation errors
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Archive {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Failed to open archive {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias using DlTdvmsError
pub type Result<T> = std::result::Result<T, DlTdvmsError>;

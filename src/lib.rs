//! dl-tdvms - Resumable bulk downloader for AFAD TDVMS seismic data
//!
//! The TDVMS portal hands out continuous waveform data one request at a time
//! and answers each request by e-mail. This library turns a declarative
//! request config into station batches and drives them through the portal
//! with progress that survives restarts.
//!
//! # Features
//!
//! - Station selection by circle, rectangle, name and device type
//! - Deterministic batching with drift detection between runs
//! - Rate-gated submissions with backoff when the portal is busy
//! - IMAP inbox watching and archive downloads
//! - Zip archive validation and coverage checks
//!
//! # Example
//!
//! ```no_run
//! use dl_tdvms::{config::Config, orchestrator::Plan, portal::PortalClient, catalog::CachedInventory};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(None)?;
//!     let portal = PortalClient::new(config.portal.clone())?;
//!     let inventory = CachedInventory::new(portal, &config.storage.cache_dir, false);
//!     let plan = Plan::prepare(std::path::Path::new("turkey.yml"), &inventory).await?;
//!     println!("{} batches", plan.batches.len());
//!     Ok(())
//! }
//! ```

// Core modules
pub mod cli;
pub mod config;
pub mod error;
pub mod progress;

// Request model and planning
pub mod batch;
pub mod catalog;
pub mod selection;
pub mod state;

// Portal interaction
pub mod archive;
pub mod coverage;
pub mod fetch;
pub mod gate;
pub mod inbox;
pub mod orchestrator;
pub mod portal;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use config::Config;
pub use error::{DlTdvmsError, Result};
pub use orchestrator::{Orchestrator, Plan, RunSummary};
pub use state::{BatchStatus, StateStore};

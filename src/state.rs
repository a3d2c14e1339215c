//! Durable per-campaign progress
//!
//! Every request config gets one progress file recording the lifecycle of each
//! batch. It is the only record of what has already been requested from the
//! portal, so it is written atomically after every transition and never
//! removed implicitly.
//!
//! Batch lifecycle:
//!
//! ```text
//! pending --submit--> submitted --mail--> fulfilled --verify--> verified
//!    ^                    |                   |
//!    |                    +------> failed <---+   (from any state except verified)
//!    +------ reset -------------------+
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::batch::{self, Batch};
use crate::catalog::SelectedStation;
use crate::error::{ConfigError, DlTdvmsError, StateError};
use crate::selection::{DataFormat, RequestConfig};

type Result<T> = std::result::Result<T, DlTdvmsError>;

const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Submitted,
    Fulfilled,
    Verified,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Submitted => "submitted",
            BatchStatus::Fulfilled => "fulfilled",
            BatchStatus::Verified => "verified",
            BatchStatus::Failed => "failed",
        }
    }

    /// Transitions allowed by normal operation. `failed -> pending` is only
    /// reachable through an explicit reset.
    pub fn can_advance_to(self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, next),
            (Pending, Submitted)
                | (Submitted, Fulfilled)
                | (Fulfilled, Verified)
                | (Pending | Submitted | Fulfilled, Failed)
        )
    }

    /// Whether the batch has been sent to the portal at some point
    pub fn was_requested(self) -> bool {
        matches!(
            self,
            BatchStatus::Submitted | BatchStatus::Fulfilled | BatchStatus::Verified
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub index: usize,
    pub data_format: DataFormat,
    pub stations: usize,
    pub status: BatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_from: Option<BatchStatus>,
    pub updated_at: DateTime<Utc>,
}

impl BatchRecord {
    fn new(batch: &Batch) -> Self {
        Self {
            index: batch.index,
            data_format: batch.data_format,
            stations: batch.len(),
            status: BatchStatus::Pending,
            request_token: None,
            submitted_at: None,
            download_url: None,
            message_id: None,
            archive_path: None,
            last_error: None,
            failed_from: None,
            updated_at: Utc::now(),
        }
    }
}

/// A requested state change together with the data it records
#[derive(Debug, Clone)]
pub enum Transition {
    Submitted { request_token: String },
    Fulfilled { download_url: String, message_id: String },
    Verified { archive_path: PathBuf },
    Failed { reason: String, archive_path: Option<PathBuf> },
}

impl Transition {
    pub fn target(&self) -> BatchStatus {
        match self {
            Transition::Submitted { .. } => BatchStatus::Submitted,
            Transition::Fulfilled { .. } => BatchStatus::Fulfilled,
            Transition::Verified { .. } => BatchStatus::Verified,
            Transition::Failed { .. } => BatchStatus::Failed,
        }
    }
}

/// Identity of a request config file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIdentity {
    /// File stem plus a short digest of the absolute path
    pub id: String,
    /// SHA-256 of the file contents
    pub file_hash: String,
}

impl ConfigIdentity {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DlTdvmsError::from(ConfigError::NotFound(path.to_path_buf()))
            } else {
                e.into()
            }
        })?;
        let absolute = std::fs::canonicalize(path)?;
        Ok(Self::new(&absolute, &contents))
    }

    pub fn new(absolute_path: &Path, contents: &[u8]) -> Self {
        let stem = absolute_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("request");
        let path_digest = format!(
            "{:x}",
            Sha256::digest(absolute_path.to_string_lossy().as_bytes())
        );
        Self {
            id: format!("{}-{}", stem, &path_digest[..8]),
            file_hash: format!("{:x}", Sha256::digest(contents)),
        }
    }
}

/// Everything about a run that must match a saved progress file for its
/// batch records to still be meaningful
#[derive(Debug, Clone, PartialEq)]
pub struct PlanFingerprint {
    pub config_hash: String,
    pub station_count: usize,
    pub station_fingerprint: String,
    pub batch_size: usize,
    pub data_formats: Vec<DataFormat>,
}

impl PlanFingerprint {
    pub fn new(identity: &ConfigIdentity, config: &RequestConfig, stations: &[SelectedStation]) -> Self {
        Self {
            config_hash: identity.file_hash.clone(),
            station_count: stations.len(),
            station_fingerprint: batch::station_fingerprint(stations),
            batch_size: config.batch_size,
            data_formats: config.data_formats.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DriftReason {
    ConfigChanged,
    StationCount { previous: usize, current: usize },
    StationSet,
    BatchSize { previous: usize, current: usize },
    DataFormats { previous: Vec<DataFormat>, current: Vec<DataFormat> },
}

impl fmt::Display for DriftReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriftReason::ConfigChanged => write!(f, "config file contents changed"),
            DriftReason::StationCount { previous, current } => {
                write!(f, "resolved station count changed from {} to {}", previous, current)
            }
            DriftReason::StationSet => write!(f, "resolved station list changed"),
            DriftReason::BatchSize { previous, current } => {
                write!(f, "batch_size changed from {} to {}", previous, current)
            }
            DriftReason::DataFormats { previous, current } => write!(
                f,
                "data formats changed from {} to {}",
                join_formats(previous),
                join_formats(current)
            ),
        }
    }
}

/// The saved state no longer matches what this run would request
#[derive(Debug, Clone, PartialEq)]
pub struct DriftReport {
    pub config_id: String,
    pub reasons: Vec<DriftReason>,
    /// Batches already sent to the portal under the old plan
    pub requested_batches: usize,
}

impl fmt::Display for DriftReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reasons: Vec<String> = self.reasons.iter().map(ToString::to_string).collect();
        write!(
            f,
            "saved progress for {} is stale ({}); {} batch(es) were already requested",
            self.config_id,
            reasons.join(", "),
            self.requested_batches
        )
    }
}

fn join_formats(formats: &[DataFormat]) -> String {
    formats.iter().map(DataFormat::as_str).collect::<Vec<_>>().join(",")
}

/// Durable progress of one request config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressFile {
    pub version: u32,
    pub config_id: String,
    pub config_hash: String,
    pub station_count: usize,
    pub station_fingerprint: String,
    pub batch_size: usize,
    pub data_formats: Vec<DataFormat>,
    pub batches: Vec<BatchRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressFile {
    pub fn new(config_id: &str, plan: &PlanFingerprint, batches: &[Batch]) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            config_id: config_id.to_string(),
            config_hash: plan.config_hash.clone(),
            station_count: plan.station_count,
            station_fingerprint: plan.station_fingerprint.clone(),
            batch_size: plan.batch_size,
            data_formats: plan.data_formats.clone(),
            batches: batches.iter().map(BatchRecord::new).collect(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Compare against the current plan. `None` means the saved batch
    /// records can be reused as they are.
    pub fn drift(&self, current: &PlanFingerprint) -> Option<DriftReport> {
        let mut reasons = Vec::new();

        if self.config_hash != current.config_hash {
            reasons.push(DriftReason::ConfigChanged);
        }
        if self.station_count != current.station_count {
            reasons.push(DriftReason::StationCount {
                previous: self.station_count,
                current: current.station_count,
            });
        } else if self.station_fingerprint != current.station_fingerprint {
            reasons.push(DriftReason::StationSet);
        }
        if self.batch_size != current.batch_size {
            reasons.push(DriftReason::BatchSize {
                previous: self.batch_size,
                current: current.batch_size,
            });
        }
        if self.data_formats != current.data_formats {
            reasons.push(DriftReason::DataFormats {
                previous: self.data_formats.clone(),
                current: current.data_formats.clone(),
            });
        }

        if reasons.is_empty() {
            None
        } else {
            Some(DriftReport {
                config_id: self.config_id.clone(),
                reasons,
                requested_batches: self.count(BatchStatus::Submitted)
                    + self.count(BatchStatus::Fulfilled)
                    + self.count(BatchStatus::Verified),
            })
        }
    }

    pub fn batch(&self, index: usize) -> Option<&BatchRecord> {
        self.batches.get(index)
    }

    pub fn count(&self, status: BatchStatus) -> usize {
        self.batches.iter().filter(|b| b.status == status).count()
    }

    pub fn indices_with(&self, status: BatchStatus) -> Vec<usize> {
        self.batches
            .iter()
            .filter(|b| b.status == status)
            .map(|b| b.index)
            .collect()
    }

    /// Message ids already paired with a batch
    pub fn consumed_message_ids(&self) -> Vec<String> {
        self.batches
            .iter()
            .filter_map(|b| b.message_id.clone())
            .collect()
    }

    fn apply(&mut self, index: usize, transition: Transition) -> std::result::Result<(), StateError> {
        let record = self
            .batches
            .get_mut(index)
            .ok_or(StateError::UnknownBatch(index))?;
        let target = transition.target();
        if !record.status.can_advance_to(target) {
            return Err(StateError::InvalidTransition {
                index,
                from: record.status,
                to: target,
            });
        }

        let now = Utc::now();
        match transition {
            Transition::Submitted { request_token } => {
                record.request_token = Some(request_token);
                record.submitted_at = Some(now);
                record.last_error = None;
            }
            Transition::Fulfilled {
                download_url,
                message_id,
            } => {
                record.download_url = Some(download_url);
                record.message_id = Some(message_id);
            }
            Transition::Verified { archive_path } => {
                record.archive_path = Some(archive_path);
                record.last_error = None;
            }
            Transition::Failed {
                reason,
                archive_path,
            } => {
                record.failed_from = Some(record.status);
                record.last_error = Some(reason);
                if archive_path.is_some() {
                    record.archive_path = archive_path;
                }
            }
        }
        record.status = target;
        record.updated_at = now;
        self.updated_at = now;
        Ok(())
    }

    fn reset(&mut self, index: usize) -> std::result::Result<(), StateError> {
        let record = self
            .batches
            .get_mut(index)
            .ok_or(StateError::UnknownBatch(index))?;
        if record.status != BatchStatus::Failed {
            return Err(StateError::InvalidTransition {
                index,
                from: record.status,
                to: BatchStatus::Pending,
            });
        }
        let now = Utc::now();
        *record = BatchRecord {
            index: record.index,
            data_format: record.data_format,
            stations: record.stations,
            status: BatchStatus::Pending,
            request_token: None,
            submitted_at: None,
            download_url: None,
            message_id: None,
            archive_path: None,
            last_error: None,
            failed_from: None,
            updated_at: now,
        };
        self.updated_at = now;
        Ok(())
    }

    /// Record a non-fatal problem without changing the batch status
    fn note_error(&mut self, index: usize, reason: String) -> std::result::Result<(), StateError> {
        let record = self
            .batches
            .get_mut(index)
            .ok_or(StateError::UnknownBatch(index))?;
        record.last_error = Some(reason);
        record.updated_at = Utc::now();
        self.updated_at = record.updated_at;
        Ok(())
    }
}

/// Directory holding one progress file per request config
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, config_id: &str) -> PathBuf {
        self.dir.join(format!("{}.state.json", config_id))
    }

    fn lock_path(&self, config_id: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", config_id))
    }

    pub fn load(&self, config_id: &str) -> Result<Option<ProgressFile>> {
        let path = self.path_for(config_id);
        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StateError::Io { path, source }.into()),
        };
        let progress = serde_json::from_slice(&content)
            .map_err(|source| StateError::Corrupt { path, source })?;
        Ok(Some(progress))
    }

    /// Write through a temporary file in the same directory and rename it into
    /// place, so a crash never leaves a truncated progress file behind.
    pub fn save(&self, config_id: &str, progress: &ProgressFile) -> Result<()> {
        let path = self.path_for(config_id);
        let io_err = |source: std::io::Error| StateError::Io {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(&self.dir).map_err(io_err)?;
        let json = serde_json::to_vec_pretty(progress).map_err(|source| StateError::Corrupt {
            path: path.clone(),
            source,
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        tmp.write_all(&json).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;

        tracing::trace!("Saved progress to {}", path.display());
        Ok(())
    }

    /// Take the per-config lock and load or create progress for this plan.
    ///
    /// Fails with [`StateError::Drift`] when saved progress exists but was
    /// recorded for a different plan; nothing is modified in that case.
    pub fn open(
        &self,
        config_id: &str,
        plan: &PlanFingerprint,
        batches: &[Batch],
    ) -> Result<StateHandle> {
        let lock = StateLock::acquire(self.lock_path(config_id), config_id)?;

        let progress = match self.load(config_id)? {
            Some(existing) => {
                if let Some(report) = existing.drift(plan) {
                    return Err(StateError::Drift(report).into());
                }
                existing
            }
            None => {
                let fresh = ProgressFile::new(config_id, plan, batches);
                self.save(config_id, &fresh)?;
                tracing::info!(config = config_id, batches = batches.len(), "Created new progress file");
                fresh
            }
        };

        Ok(StateHandle {
            store: self.clone(),
            config_id: config_id.to_string(),
            progress,
            _lock: lock,
        })
    }

    /// Start over after the operator acknowledged drift. The previous file is
    /// kept as `<id>.state.json.bak`.
    pub fn open_rebased(
        &self,
        config_id: &str,
        plan: &PlanFingerprint,
        batches: &[Batch],
    ) -> Result<StateHandle> {
        let lock = StateLock::acquire(self.lock_path(config_id), config_id)?;

        let path = self.path_for(config_id);
        if path.exists() {
            let backup = path.with_extension("json.bak");
            std::fs::copy(&path, &backup).map_err(|source| StateError::Io {
                path: backup.clone(),
                source,
            })?;
            tracing::warn!("Previous progress saved to {}", backup.display());
        }

        let fresh = ProgressFile::new(config_id, plan, batches);
        self.save(config_id, &fresh)?;

        Ok(StateHandle {
            store: self.clone(),
            config_id: config_id.to_string(),
            progress: fresh,
            _lock: lock,
        })
    }

    /// Lock and load existing progress without checking it against a plan
    pub fn open_existing(&self, config_id: &str) -> Result<Option<StateHandle>> {
        let lock = StateLock::acquire(self.lock_path(config_id), config_id)?;
        Ok(self.load(config_id)?.map(|progress| StateHandle {
            store: self.clone(),
            config_id: config_id.to_string(),
            progress,
            _lock: lock,
        }))
    }
}

/// Exclusive access to one config's progress. Every change is persisted
/// before the call returns; the lock is released on drop.
#[derive(Debug)]
pub struct StateHandle {
    store: StateStore,
    config_id: String,
    progress: ProgressFile,
    _lock: StateLock,
}

impl StateHandle {
    pub fn config_id(&self) -> &str {
        &self.config_id
    }

    pub fn progress(&self) -> &ProgressFile {
        &self.progress
    }

    pub fn record(&self, index: usize) -> Option<&BatchRecord> {
        self.progress.batch(index)
    }

    pub fn mark(&mut self, index: usize, transition: Transition) -> Result<&BatchRecord> {
        let target = transition.target();
        self.update(|p| p.apply(index, transition))?;
        tracing::debug!(batch = index, status = %target, "Batch state updated");
        Ok(&self.progress.batches[index])
    }

    /// Move a failed batch back to pending so it is requested again
    pub fn reset(&mut self, index: usize) -> Result<()> {
        self.update(|p| p.reset(index))?;
        tracing::info!(batch = index, "Batch reset to pending");
        Ok(())
    }

    pub fn note_error(&mut self, index: usize, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.update(|p| p.note_error(index, reason))
    }

    /// Apply a change and persist it, leaving memory untouched if either fails
    fn update<F>(&mut self, change: F) -> Result<()>
    where
        F: FnOnce(&mut ProgressFile) -> std::result::Result<(), StateError>,
    {
        let mut next = self.progress.clone();
        change(&mut next)?;
        self.store.save(&self.config_id, &next)?;
        self.progress = next;
        Ok(())
    }
}

#[derive(Debug)]
struct StateLock {
    path: PathBuf,
}

impl StateLock {
    fn acquire(path: PathBuf, config_id: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StateError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(StateError::Locked {
                config_id: config_id.to_string(),
                lock: path,
            }
            .into()),
            Err(source) => Err(StateError::Io { path, source }.into()),
        }
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("Failed to release state lock {}: {}", self.path.display(), e);
        }
    }
}

//! Campaign driver
//!
//! One run walks the batch list of a request config in index order:
//! archives already announced are downloaded and verified first, then every
//! pending batch passes the rate gate, is submitted, and the inbox is watched
//! for its notification. Every state change goes through the [`StateHandle`]
//! and is on disk before the next step starts, so a run can be interrupted at
//! any point and resumed without asking the portal twice for the same batch.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::archive::{self, ArchiveVerdict};
use crate::batch::{self, Batch};
use crate::catalog::{self, InventorySource, SelectedStation};
use crate::error::{DlTdvmsError, StateError};
use crate::fetch::ArchiveFetcher;
use crate::gate::{BackoffPolicy, RateGate};
use crate::inbox::{InboxWatcher, Match, MatchStrategy, PendingBatch};
use crate::portal::{DataRequest, RequestPortal};
use crate::selection::RequestConfig;
use crate::state::{
    BatchStatus, ConfigIdentity, DriftReport, PlanFingerprint, StateHandle, StateStore, Transition,
};

type Result<T> = std::result::Result<T, DlTdvmsError>;

/// A request config resolved into batches
#[derive(Debug, Clone)]
pub struct Plan {
    pub identity: ConfigIdentity,
    pub request: RequestConfig,
    pub stations: Vec<SelectedStation>,
    pub batches: Vec<Batch>,
    pub fingerprint: PlanFingerprint,
}

impl Plan {
    pub fn new(identity: ConfigIdentity, request: RequestConfig, stations: Vec<SelectedStation>) -> Self {
        let batches = batch::plan(&stations, request.batch_size, &request.data_formats);
        let fingerprint = PlanFingerprint::new(&identity, &request, &stations);
        Self {
            identity,
            request,
            stations,
            batches,
            fingerprint,
        }
    }

    /// Load a request config and resolve it against the portal inventory
    pub async fn prepare(config_path: &Path, inventory: &dyn InventorySource) -> Result<Self> {
        let request = RequestConfig::load(config_path)?;
        let identity = ConfigIdentity::from_file(config_path)?;

        let networks = inventory.networks().await?;
        let known: Vec<String> = networks.into_iter().map(|n| n.code).collect();
        let all_stations = inventory.stations(&known).await?;

        let stations = catalog::resolve(&request, &known, &all_stations)?;
        let plan = Self::new(identity, request, stations);
        tracing::info!(
            config = %plan.identity.id,
            stations = plan.stations.len(),
            batches = plan.batches.len(),
            "Planned request"
        );
        Ok(plan)
    }
}

/// Open progress for `plan`. When the saved progress belongs to a different
/// plan, `confirm` decides whether to start over; declining returns the
/// drift error with the saved file untouched.
pub fn open_state<F>(store: &StateStore, plan: &Plan, confirm: F) -> Result<StateHandle>
where
    F: FnOnce(&DriftReport) -> bool,
{
    match store.open(&plan.identity.id, &plan.fingerprint, &plan.batches) {
        Err(DlTdvmsError::State(StateError::Drift(report))) => {
            tracing::warn!("{}", report);
            if confirm(&report) {
                store.open_rebased(&plan.identity.id, &plan.fingerprint, &plan.batches)
            } else {
                Err(StateError::Drift(report).into())
            }
        }
        other => other,
    }
}

/// A batch that did not reach `verified`, with what went wrong
#[derive(Debug, Clone, PartialEq)]
pub struct BatchIssue {
    pub index: usize,
    pub status: BatchStatus,
    pub cause: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub total: usize,
    pub verified: usize,
    pub submitted_now: usize,
    pub bytes_downloaded: u64,
    /// Archives found already downloaded and verified in place
    pub reused: usize,
    /// Submitted batches still waiting for their notification
    pub outstanding: Vec<usize>,
    pub issues: Vec<BatchIssue>,
    pub interrupted: bool,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.issues.is_empty() && !self.interrupted
    }

    /// Process exit status: 0 on success, 1 when a batch has an issue or the run was interrupted
    pub fn exit_status(&self) -> u8 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    fn collect(state: &StateHandle, tally: &Tally, interrupted: bool) -> Self {
        let progress = state.progress();
        let issues = progress
            .batches
            .iter()
            .filter(|b| b.status != BatchStatus::Verified)
            .filter_map(|b| {
                b.last_error.as_ref().map(|cause| BatchIssue {
                    index: b.index,
                    status: b.status,
                    cause: cause.clone(),
                })
            })
            .collect();
        Self {
            total: progress.batches.len(),
            verified: progress.count(BatchStatus::Verified),
            submitted_now: tally.submitted,
            bytes_downloaded: tally.bytes,
            reused: tally.reused,
            outstanding: progress.indices_with(BatchStatus::Submitted),
            issues,
            interrupted,
        }
    }
}

/// Drives submissions, inbox polling and downloads for one request config
pub struct Orchestrator {
    portal: Box<dyn RequestPortal>,
    gate: Box<dyn RateGate>,
    fetcher: ArchiveFetcher,
    backoff: BackoffPolicy,
    inbox: Option<(InboxWatcher, Box<dyn MatchStrategy>)>,
    email: String,
    wait_for_outstanding: bool,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        portal: Box<dyn RequestPortal>,
        gate: Box<dyn RateGate>,
        fetcher: ArchiveFetcher,
        backoff: BackoffPolicy,
        email: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            portal,
            gate,
            fetcher,
            backoff,
            inbox: None,
            email: email.into(),
            wait_for_outstanding: true,
            cancel,
        }
    }

    /// Watch the inbox for notifications after each submission
    pub fn with_inbox(mut self, watcher: InboxWatcher, matcher: Box<dyn MatchStrategy>) -> Self {
        self.inbox = Some((watcher, matcher));
        self
    }

    /// Whether to keep polling for unanswered batches once everything is submitted
    pub fn wait_for_outstanding(mut self, wait: bool) -> Self {
        self.wait_for_outstanding = wait;
        self
    }

    pub async fn run(&mut self, plan: &Plan, state: &mut StateHandle) -> Result<RunSummary> {
        let mut tally = Tally::default();
        let interrupted = match self.drive(plan, state, &mut tally).await {
            Ok(()) => false,
            Err(DlTdvmsError::Cancelled) => {
                tracing::warn!("Run interrupted, progress is saved");
                true
            }
            Err(e) => return Err(e),
        };
        Ok(RunSummary::collect(state, &tally, interrupted))
    }

    async fn drive(&mut self, plan: &Plan, state: &mut StateHandle, tally: &mut Tally) -> Result<()> {
        // archives announced in an earlier run
        for index in state.progress().indices_with(BatchStatus::Fulfilled) {
            if let Some(url) = state.record(index).and_then(|r| r.download_url.clone()) {
                self.finish(state, index, &url, tally).await?;
            }
        }
        if !state.progress().indices_with(BatchStatus::Submitted).is_empty() {
            self.collect_notifications(state, tally, false).await?;
        }

        for batch in &plan.batches {
            let status = state
                .record(batch.index)
                .map(|r| r.status)
                .ok_or(StateError::UnknownBatch(batch.index))?;
            match status {
                BatchStatus::Pending => {}
                BatchStatus::Failed => {
                    tracing::info!(batch = batch.index, "Skipping failed batch (use `retry` to request it again)");
                    continue;
                }
                _ => continue,
            }

            if !self.submit(plan, state, batch).await? {
                continue;
            }
            tally.submitted += 1;
            self.collect_notifications(state, tally, true).await?;
        }

        if self.wait_for_outstanding && !state.progress().indices_with(BatchStatus::Submitted).is_empty() {
            tracing::info!(
                outstanding = state.progress().count(BatchStatus::Submitted),
                "Waiting for remaining notifications"
            );
            self.collect_notifications(state, tally, true).await?;
        }
        Ok(())
    }

    /// Submit one batch, retrying refused requests on the backoff schedule.
    /// Every attempt, retries included, passes the rate gate first.
    /// Returns `false` when the batch stays pending.
    async fn submit(&mut self, plan: &Plan, state: &mut StateHandle, batch: &Batch) -> Result<bool> {
        let mut attempt = 1;
        loop {
            self.gate.acquire(batch, &self.cancel).await?;
            let request = DataRequest::new(state.config_id(), batch, &plan.request, &self.email);
            tracing::info!(
                batch = batch.index,
                stations = batch.len(),
                format = %batch.data_format,
                attempt,
                "Submitting request"
            );
            let outcome = self.portal.submit(&request).await;
            self.gate.submitted();

            match outcome {
                Ok(token) => {
                    state.mark(
                        batch.index,
                        Transition::Submitted {
                            request_token: token.to_string(),
                        },
                    )?;
                    println!("✓ Requested batch {} ({} stations)", batch.index, batch.len());
                    return Ok(true);
                }
                Err(e) if e.is_retryable() && self.backoff.should_retry(attempt) => {
                    tracing::warn!(batch = batch.index, "Request refused: {}", e);
                    state.note_error(batch.index, e.to_string())?;
                    self.backoff.wait(attempt, &self.cancel).await?;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(batch = batch.index, attempt, "Giving up on batch for this run: {}", e);
                    state.note_error(batch.index, format!("not submitted after {} attempt(s): {}", attempt, e))?;
                    return Ok(false);
                }
            }
        }
    }

    /// Poll the inbox for submitted batches and finish whatever got answered.
    /// Without `wait` the inbox is checked once.
    async fn collect_notifications(&self, state: &mut StateHandle, tally: &mut Tally, wait: bool) -> Result<()> {
        let Some((watcher, matcher)) = &self.inbox else {
            return Ok(());
        };

        let pending: Vec<PendingBatch> = state
            .progress()
            .batches
            .iter()
            .filter(|b| b.status == BatchStatus::Submitted)
            .map(|b| PendingBatch {
                index: b.index,
                request_token: b.request_token.clone(),
                submitted_at: b.submitted_at,
            })
            .collect();
        let consumed: HashSet<String> = state.progress().consumed_message_ids().into_iter().collect();

        let found = if wait {
            watcher.poll(&pending, &consumed, matcher.as_ref(), &self.cancel).await
        } else {
            watcher.check_once(&pending, &consumed, matcher.as_ref()).await
        };
        let matches = match found {
            Ok(matches) => matches,
            Err(DlTdvmsError::Cancelled) => return Err(DlTdvmsError::Cancelled),
            Err(e) => {
                // mail trouble never fails a batch; it stays submitted
                tracing::error!("Inbox check failed: {}", e);
                return Ok(());
            }
        };

        for Match {
            batch_index,
            download_url,
            message_id,
        } in matches
        {
            state.mark(
                batch_index,
                Transition::Fulfilled {
                    download_url: download_url.clone(),
                    message_id,
                },
            )?;
            tracing::info!(batch = batch_index, "Notification received: {}", download_url);
            self.finish(state, batch_index, &download_url, tally).await?;
        }
        Ok(())
    }

    /// Download and verify a fulfilled batch
    async fn finish(&self, state: &mut StateHandle, index: usize, url: &str, tally: &mut Tally) -> Result<()> {
        let fetched = match self.fetcher.fetch(url, &self.cancel).await {
            Ok(fetched) => fetched,
            Err(DlTdvmsError::Cancelled) => return Err(DlTdvmsError::Cancelled),
            Err(e) => {
                // stays fulfilled so the next run downloads it again
                tracing::error!(batch = index, "Download failed: {}", e);
                state.note_error(index, format!("download failed: {}", e))?;
                return Ok(());
            }
        };
        if fetched.skipped {
            tally.reused += 1;
        } else {
            tally.bytes += fetched.bytes;
        }

        let path = fetched.path.clone();
        let verdict = tokio::task::spawn_blocking(move || archive::verify(&path))
            .await
            .map_err(|e| DlTdvmsError::Io(std::io::Error::other(e.to_string())))?;

        match verdict {
            Ok(ArchiveVerdict::Ok { members }) => {
                state.mark(
                    index,
                    Transition::Verified {
                        archive_path: fetched.path.clone(),
                    },
                )?;
                println!("✓ Batch {} verified: {} ({} files)", index, fetched.path.display(), members);
            }
            Ok(ArchiveVerdict::Corrupt { reason }) => {
                mark_failed(state, index, format!("corrupt archive: {}", reason), fetched.path)?;
            }
            Err(e) => {
                mark_failed(state, index, e.to_string(), fetched.path)?;
            }
        }
        Ok(())
    }
}

fn mark_failed(state: &mut StateHandle, index: usize, reason: String, path: PathBuf) -> Result<()> {
    tracing::error!(batch = index, "{} ({})", reason, path.display());
    state.mark(
        index,
        Transition::Failed {
            reason,
            archive_path: Some(path),
        },
    )?;
    Ok(())
}

#[derive(Debug, Default)]
struct Tally {
    submitted: usize,
    bytes: u64,
    reused: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InboxConfig, PortalConfig, RetryConfig};
    use crate::error::{MailError, PortalError};
    use crate::gate::CooldownGate;
    use crate::inbox::{MailMessage, Mailbox, TokenMatcher};
    use crate::portal::RequestToken;
    use crate::selection::Selection;
    use crate::test_support::{mseed_record, request, selected, write_zip};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    type Tokens = Arc<Mutex<Vec<String>>>;

    /// Accepts every request except those for `busy` batches
    struct FakePortal {
        tokens: Tokens,
        busy: Vec<usize>,
    }

    #[async_trait]
    impl RequestPortal for FakePortal {
        async fn submit(&self, request: &DataRequest) -> Result<RequestToken> {
            let index: usize = request.token.as_str().split(':').nth(1).unwrap().parse().unwrap();
            if self.busy.contains(&index) {
                return Err(PortalError::Busy.into());
            }
            self.tokens.lock().unwrap().push(request.token.to_string());
            Ok(request.token.clone())
        }
    }

    /// Refuses the first `busy_for` requests and records when each one arrived
    struct FlakyPortal {
        calls: Arc<Mutex<Vec<tokio::time::Instant>>>,
        busy_for: usize,
    }

    #[async_trait]
    impl RequestPortal for FlakyPortal {
        async fn submit(&self, request: &DataRequest) -> Result<RequestToken> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(tokio::time::Instant::now());
            if calls.len() <= self.busy_for {
                return Err(PortalError::Busy.into());
            }
            Ok(request.token.clone())
        }
    }

    /// Answers every submitted token except those of `silent` batches
    struct FakeMailbox {
        tokens: Tokens,
        server: String,
        silent: Vec<usize>,
    }

    impl Mailbox for FakeMailbox {
        fn fetch(&mut self, _sender: &str) -> std::result::Result<Vec<MailMessage>, MailError> {
            let tokens = self.tokens.lock().unwrap();
            Ok(tokens
                .iter()
                .enumerate()
                .filter_map(|(n, token)| {
                    let index: usize = token.split(':').nth(1)?.parse().ok()?;
                    if self.silent.contains(&index) {
                        return None;
                    }
                    Some(MailMessage {
                        id: format!("<{}@test>", n),
                        uid: n as u32 + 1,
                        from: "tdvms@afad.gov.tr".into(),
                        subject: "Veri talebi".into(),
                        body: format!("Talep {} hazir: {}/files/batch_{}.zip", token, self.server, index),
                        received_at: None,
                    })
                })
                .collect())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        server: MockServer,
        store: StateStore,
        downloads: PathBuf,
        plan: Plan,
        tokens: Tokens,
    }

    async fn harness(stations: usize, corrupt: &[usize]) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;

        let config = request(&["TK"], Selection::default(), 1);
        let identity = ConfigIdentity::new(&dir.path().join("turkey.yml"), b"batch_size: 1");
        let plan = Plan::new(identity, config, selected(stations));

        let zip_path = dir.path().join("fixture.zip");
        write_zip(&zip_path, &[("TK_0000.mseed", &mseed_record())]);
        let good = std::fs::read(&zip_path).unwrap();
        for batch in &plan.batches {
            let body = if corrupt.contains(&batch.index) {
                good[..good.len() / 2].to_vec()
            } else {
                good.clone()
            };
            Mock::given(method("GET"))
                .and(path(format!("/files/batch_{}.zip", batch.index)))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
                .mount(&server)
                .await;
        }

        Harness {
            store: StateStore::new(dir.path().join("state")),
            downloads: dir.path().join("downloads"),
            _dir: dir,
            server,
            plan,
            tokens: Arc::new(Mutex::new(Vec::new())),
        }
    }

    impl Harness {
        fn orchestrator(&self, busy: &[usize], silent: &[usize]) -> Orchestrator {
            let portal = FakePortal {
                tokens: self.tokens.clone(),
                busy: busy.to_vec(),
            };
            let mailbox = FakeMailbox {
                tokens: self.tokens.clone(),
                server: self.server.uri(),
                silent: silent.to_vec(),
            };
            let inbox = InboxConfig {
                link_pattern: r"http://127\.0\.0\.1:\d+/files/[A-Za-z0-9_]+\.zip".to_string(),
                poll_interval: 0,
                max_checks: 2,
                ..Default::default()
            };
            let fetcher = ArchiveFetcher::new(
                &PortalConfig {
                    download_timeout: 5,
                    ..Default::default()
                },
                &self.downloads,
            )
            .unwrap()
            .quiet(true);
            let backoff = BackoffPolicy {
                max_attempts: 2,
                initial_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                multiplier: 1.0,
            };
            Orchestrator::new(
                Box::new(portal),
                Box::new(CooldownGate::new(Duration::ZERO)),
                fetcher,
                backoff,
                "me@example.org",
                CancellationToken::new(),
            )
            .with_inbox(
                InboxWatcher::new(Box::new(mailbox), &inbox).unwrap(),
                Box::new(TokenMatcher),
            )
        }

        fn open(&self) -> StateHandle {
            open_state(&self.store, &self.plan, |_| false).unwrap()
        }

        fn submissions(&self) -> usize {
            self.tokens.lock().unwrap().len()
        }
    }

    #[tokio::test]
    async fn test_full_run_then_resume_submits_nothing() {
        let h = harness(3, &[]).await;
        let mut state = h.open();
        let summary = h.orchestrator(&[], &[]).run(&h.plan, &mut state).await.unwrap();

        assert_eq!(summary.total, 3);
        assert_eq!(summary.verified, 3);
        assert_eq!(summary.submitted_now, 3);
        assert!(summary.is_success());
        assert!(h.downloads.join("batch_2.zip").exists());
        drop(state);

        let mut state = h.open();
        let again = h.orchestrator(&[], &[]).run(&h.plan, &mut state).await.unwrap();
        assert_eq!(again.submitted_now, 0);
        assert_eq!(h.submissions(), 3);
    }

    #[tokio::test]
    async fn test_resume_skips_already_requested_batches() {
        let h = harness(3, &[]).await;
        {
            let mut state = h.open();
            state
                .mark(0, Transition::Submitted { request_token: "earlier:0:1".into() })
                .unwrap();
        }

        let mut state = h.open();
        let summary = h.orchestrator(&[], &[]).run(&h.plan, &mut state).await.unwrap();
        // batch 0 was sent in a previous run and is never sent again
        assert_eq!(summary.submitted_now, 2);
        assert!(h.tokens.lock().unwrap().iter().all(|t| !t.contains(":0:")));
        assert_eq!(state.record(0).unwrap().status, BatchStatus::Submitted);
        assert_eq!(summary.outstanding, vec![0]);
    }

    #[tokio::test]
    async fn test_unanswered_batch_does_not_block_others() {
        let h = harness(3, &[]).await;
        let mut state = h.open();
        let summary = h.orchestrator(&[], &[1]).run(&h.plan, &mut state).await.unwrap();

        assert_eq!(state.record(0).unwrap().status, BatchStatus::Verified);
        assert_eq!(state.record(1).unwrap().status, BatchStatus::Submitted);
        assert_eq!(state.record(2).unwrap().status, BatchStatus::Verified);
        assert_eq!(summary.outstanding, vec![1]);
        assert!(summary.is_success());
        assert_eq!(summary.exit_status(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_archive_fails_only_its_batch() {
        let h = harness(3, &[1]).await;
        let mut state = h.open();
        let summary = h.orchestrator(&[], &[]).run(&h.plan, &mut state).await.unwrap();

        let failed = state.record(1).unwrap();
        assert_eq!(failed.status, BatchStatus::Failed);
        assert_eq!(failed.archive_path, Some(h.downloads.join("batch_1.zip")));
        assert!(h.downloads.join("batch_1.zip").exists());
        assert_eq!(summary.verified, 2);
        assert_eq!(summary.issues.len(), 1);
        assert_eq!(summary.issues[0].index, 1);
        assert!(!summary.is_success());
        assert_eq!(summary.exit_status(), 1);
    }

    #[tokio::test]
    async fn test_refused_batch_stays_pending_and_run_continues() {
        let h = harness(3, &[]).await;
        let mut state = h.open();
        let summary = h.orchestrator(&[0], &[]).run(&h.plan, &mut state).await.unwrap();

        let refused = state.record(0).unwrap();
        assert_eq!(refused.status, BatchStatus::Pending);
        assert!(refused.last_error.as_deref().unwrap().contains("2 attempt"));
        assert_eq!(state.record(1).unwrap().status, BatchStatus::Verified);
        assert_eq!(state.record(2).unwrap().status, BatchStatus::Verified);
        assert_eq!(summary.issues[0].status, BatchStatus::Pending);
    }

    #[tokio::test]
    async fn test_drift_needs_confirmation() {
        let h = harness(2, &[]).await;
        drop(h.open());

        let mut changed = h.plan.request.clone();
        changed.batch_size = 2;
        let other = Plan::new(h.plan.identity.clone(), changed, h.plan.stations.clone());

        let err = open_state(&h.store, &other, |_| false).unwrap_err();
        assert!(matches!(err, DlTdvmsError::State(StateError::Drift(_))));

        let state = open_state(&h.store, &other, |report| !report.reasons.is_empty()).unwrap();
        assert_eq!(state.progress().batch_size, 2);
        assert_eq!(state.progress().batches.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_busy_still_waits_for_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let identity = ConfigIdentity::new(&dir.path().join("turkey.yml"), b"batch_size: 1");
        let plan = Plan::new(identity, request(&["TK"], Selection::default(), 1), selected(2));
        let store = StateStore::new(dir.path().join("state"));
        let mut state = open_state(&store, &plan, |_| false).unwrap();

        let calls = Arc::new(Mutex::new(Vec::new()));
        let fetcher = ArchiveFetcher::new(&PortalConfig::default(), dir.path().join("downloads"))
            .unwrap()
            .quiet(true);
        // backoff (60s) is shorter than the cooldown (120s)
        let mut runner = Orchestrator::new(
            Box::new(FlakyPortal {
                calls: calls.clone(),
                busy_for: 1,
            }),
            Box::new(CooldownGate::new(Duration::from_secs(120))),
            fetcher,
            BackoffPolicy::from(&RetryConfig::default()),
            "me@example.org",
            CancellationToken::new(),
        );
        let summary = runner.run(&plan, &mut state).await.unwrap();
        assert_eq!(summary.submitted_now, 2);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        for pair in calls.windows(2) {
            assert!(
                pair[1] - pair[0] >= Duration::from_secs(120),
                "submissions only {:?} apart",
                pair[1] - pair[0]
            );
        }
    }

    #[tokio::test]
    async fn test_archive_already_on_disk_is_reused() {
        let h = harness(2, &[]).await;
        std::fs::create_dir_all(&h.downloads).unwrap();
        write_zip(&h.downloads.join("batch_0.zip"), &[("TK_0000.mseed", &mseed_record())]);
        {
            let mut state = h.open();
            state
                .mark(0, Transition::Submitted { request_token: "earlier:0:1".into() })
                .unwrap();
            state
                .mark(
                    0,
                    Transition::Fulfilled {
                        download_url: format!("{}/files/batch_0.zip", h.server.uri()),
                        message_id: "<old@test>".into(),
                    },
                )
                .unwrap();
        }

        let mut state = h.open();
        let summary = h.orchestrator(&[], &[]).run(&h.plan, &mut state).await.unwrap();
        assert_eq!(summary.reused, 1);
        assert_eq!(summary.verified, 2);
        assert_eq!(h.submissions(), 1);
    }
}

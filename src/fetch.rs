//! Archive downloads
//!
//! Notification links point at a zip file on the portal. The archive is
//! streamed to `<name>.part` next to its final location and renamed once the
//! body is complete, so an interrupted download never looks like a finished
//! archive.

use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::PortalConfig;
use crate::error::{DlTdvmsError, PortalError};
use crate::progress;

type Result<T> = std::result::Result<T, DlTdvmsError>;

/// Result of one archive download
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub path: PathBuf,
    pub bytes: u64,
    /// The file was already present and left alone
    pub skipped: bool,
}

pub struct ArchiveFetcher {
    http: reqwest::Client,
    dir: PathBuf,
    timeout_secs: u64,
    quiet: bool,
}

impl ArchiveFetcher {
    pub fn new(config: &PortalConfig, dir: impl Into<PathBuf>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.download_timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| PortalError::from_reqwest(&config.api_base, e, config.download_timeout))?;
        Ok(Self {
            http,
            dir: dir.into(),
            timeout_secs: config.download_timeout,
            quiet: false,
        })
    }

    /// Hide the progress bar
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the archive behind `url` is stored
    pub fn target_for(&self, url: &str) -> Result<PathBuf> {
        Ok(self.dir.join(archive_name(url)?))
    }

    /// Download `url` into the archive directory unless it is already there
    pub async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<Fetched> {
        let target = self.target_for(url)?;
        if let Ok(meta) = tokio::fs::metadata(&target).await {
            if meta.is_file() && meta.len() > 0 {
                tracing::info!("Archive already present: {}", target.display());
                return Ok(Fetched {
                    path: target,
                    bytes: 0,
                    skipped: true,
                });
            }
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let partial = partial_path(&target);

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(DlTdvmsError::Cancelled),
            r = self.stream_to(url, &partial) => r,
        };
        let bytes = match result {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
        };

        tokio::fs::rename(&partial, &target).await?;
        tracing::info!(bytes, "Downloaded {}", target.display());
        Ok(Fetched {
            path: target,
            bytes,
            skipped: false,
        })
    }

    async fn stream_to(&self, url: &str, partial: &Path) -> Result<u64> {
        let mut response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| PortalError::from_reqwest(url, e, self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PortalError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            }
            .into());
        }

        let bar = progress::download_bar(response.content_length(), self.quiet);
        bar.set_message(archive_name(url)?);

        let mut file = tokio::fs::File::create(partial).await?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| PortalError::from_reqwest(url, e, self.timeout_secs))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            bar.set_position(written);
        }
        file.flush().await?;
        file.sync_all().await?;
        bar.finish_and_clear();

        if let Some(expected) = response.content_length() {
            if expected != written {
                return Err(PortalError::UnexpectedResponse(format!(
                    "{} ended after {} of {} bytes",
                    url, written, expected
                ))
                .into());
            }
        }
        Ok(written)
    }
}

/// Last path segment of a download link
pub fn archive_name(url: &str) -> Result<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.rsplit('/').next().unwrap_or_default();
    if name.is_empty() || name == "." || name == ".." || name.contains('\\') {
        return Err(PortalError::UnexpectedResponse(format!(
            "No file name in download link {}",
            url
        ))
        .into());
    }
    Ok(name.to_string())
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, DlTdvmsError};

type Result<T> = std::result::Result<T, DlTdvmsError>;

/// Expand tilde (~) in paths to the actual home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(path_str) = path.to_str() {
        if let Some(stripped) = path_str.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(stripped);
            }
        } else if path_str == "~" {
            if let Some(home) = dirs::home_dir() {
                return home;
            }
        }
    }
    path.to_path_buf()
}

/// Tool settings: where the portal lives, where state goes, how politely to
/// submit. Separate from the per-campaign request configs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub portal: PortalConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub submission: SubmissionConfig,

    #[serde(default)]
    pub inbox: InboxConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalConfig {
    /// Base URL of the station/network API
    pub api_base: String,
    /// Base URL of the data request service
    pub service_base: String,
    pub user_agent: String,
    pub request_timeout: u64,  // seconds
    pub download_timeout: u64, // seconds
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub state_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub download_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionConfig {
    /// Ask for confirmation before each request
    pub interactive: bool,
    /// Minimum seconds between two submissions when not interactive
    pub cooldown: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Backoff after the portal refuses or drops a submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: u64, // seconds
    pub max_delay: u64,     // seconds
    pub backoff_multiplier: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStrategyKind {
    /// Token in the message first, arrival order for the rest
    Auto,
    Token,
    Arrival,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxConfig {
    /// Address the portal sends notifications from
    pub sender: String,
    /// Regex matching the archive link in a notification
    pub link_pattern: String,
    pub poll_interval: u64, // seconds
    pub max_checks: u32,
    pub mail_timeout: u64, // seconds
    pub strategy: MatchStrategyKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            api_base: "https://tdvms.afad.gov.tr".to_string(),
            service_base: "https://tdvmservis.afad.gov.tr".to_string(),
            user_agent: format!("dl-tdvms/{}", env!("CARGO_PKG_VERSION")),
            request_timeout: 60,
            download_timeout: 1800,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".dl-tdvms/state"),
            cache_dir: PathBuf::from(".dl-tdvms/cache"),
            download_dir: PathBuf::from("downloads"),
        }
    }
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            interactive: true,
            cooldown: 120,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: 60, // the portal asks to wait for the previous request
            max_delay: 600,
            backoff_multiplier: 2.0,
        }
    }
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            sender: "tdvms@afad.gov.tr".to_string(),
            link_pattern: r"https://tdvms\.afad\.gov\.tr/files/[A-Za-z0-9_]+\.zip".to_string(),
            poll_interval: 30,
            max_checks: 10,
            mail_timeout: 60,
            strategy: MatchStrategyKind::Auto,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl PortalConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout)
    }
}

impl InboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn mail_timeout(&self) -> Duration {
        Duration::from_secs(self.mail_timeout)
    }
}

/// Load configuration from environment variables
fn load_env_overrides(mut config: Config) -> Config {
    // Override with DL_TDVMS_ prefixed environment variables
    if let Ok(val) = env::var("DL_TDVMS_API_BASE") {
        config.portal.api_base = val;
    }
    if let Ok(val) = env::var("DL_TDVMS_SERVICE_BASE") {
        config.portal.service_base = val;
    }
    if let Ok(val) = env::var("DL_TDVMS_STATE_DIR") {
        config.storage.state_dir = PathBuf::from(val);
    }
    if let Ok(val) = env::var("DL_TDVMS_CACHE_DIR") {
        config.storage.cache_dir = PathBuf::from(val);
    }
    if let Ok(val) = env::var("DL_TDVMS_DOWNLOAD_DIR") {
        config.storage.download_dir = PathBuf::from(val);
    }
    if let Ok(val) = env::var("DL_TDVMS_COOLDOWN") {
        if let Ok(cooldown) = val.parse() {
            config.submission.cooldown = cooldown;
        }
    }
    if let Ok(val) = env::var("DL_TDVMS_INTERACTIVE") {
        if let Ok(interactive) = val.parse() {
            config.submission.interactive = interactive;
        }
    }

    config
}

impl Config {
    /// Get the standard config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| ConfigError::Invalid {
            field: "config_dir".to_string(),
            reason: "Could not determine config directory".to_string(),
        })?;
        Ok(config_dir.join("dl-tdvms").join("config.toml"))
    }

    /// Load settings from an explicit path, `./dl-tdvms.toml`, or the
    /// standard location (created with defaults on first use)
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config_path = if let Some(path) = explicit {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()).into());
            }
            path.to_path_buf()
        } else {
            let local_config = PathBuf::from("dl-tdvms.toml");
            if local_config.exists() {
                local_config
            } else {
                let standard_config = Self::config_path()?;
                if !standard_config.exists() {
                    tracing::debug!(
                        "Settings file not found, creating default at: {}",
                        standard_config.display()
                    );
                    if let Some(parent) = standard_config.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    Self::create_sample(&standard_config)?;
                    println!(
                        "📝 Created default settings at: {}",
                        standard_config.display()
                    );
                }
                standard_config
            }
        };
        tracing::debug!("Loaded settings from: {}", config_path.display());

        let content = std::fs::read_to_string(&config_path)?;
        let config: Config = content.parse()?;
        let mut config = load_env_overrides(config);

        config.storage.state_dir = expand_tilde(&config.storage.state_dir);
        config.storage.cache_dir = expand_tilde(&config.storage.cache_dir);
        config.storage.download_dir = expand_tilde(&config.storage.download_dir);
        if let Some(log_file) = config.logging.file.as_ref() {
            config.logging.file = Some(expand_tilde(log_file));
        }

        config.validate()?;
        Ok(config)
    }

    /// Create a sample configuration file
    pub fn create_sample<P: AsRef<Path>>(path: P) -> Result<()> {
        let sample = Self::default();
        let content = toml::to_string_pretty(&sample)
            .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {}", e)))?;

        let commented_content = format!(
            r#"# dl-tdvms settings
#
# Request configs (what to download) are separate YAML files passed on the
# command line. This file controls how dl-tdvms talks to the portal.
# Paths can be overridden with DL_TDVMS_STATE_DIR, DL_TDVMS_DOWNLOAD_DIR, ...

{}

# [submission]
# interactive - Ask before every request (press enter). Set to false to use the cooldown.
# cooldown    - Seconds to wait between two requests when not interactive.
#               The portal throttles accounts that request too quickly.
#
# [inbox]
# strategy    - How notifications are paired with batches: auto, token or arrival.
#               Arrival order can mismatch if mails arrive out of order or several
#               campaigns share one inbox.
"#,
            content
        );

        std::fs::write(path, commented_content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (field, url) in [
            ("portal.api_base", &self.portal.api_base),
            ("portal.service_base", &self.portal.service_base),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid {
                    field: field.to_string(),
                    reason: format!("'{}' is not an http(s) URL", url),
                }
                .into());
            }
        }

        if self.portal.request_timeout == 0 || self.inbox.mail_timeout == 0 {
            return Err(ConfigError::Invalid {
                field: "timeout".to_string(),
                reason: "Timeouts must be at least 1 second".to_string(),
            }
            .into());
        }

        if self.submission.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                field: "submission.retry.backoff_multiplier".to_string(),
                reason: "Must be at least 1.0".to_string(),
            }
            .into());
        }

        if self.inbox.max_checks == 0 {
            return Err(ConfigError::Invalid {
                field: "inbox.max_checks".to_string(),
                reason: "Must be at least 1".to_string(),
            }
            .into());
        }

        if let Err(e) = regex::Regex::new(&self.inbox.link_pattern) {
            return Err(ConfigError::Invalid {
                field: "inbox.link_pattern".to_string(),
                reason: e.to_string(),
            }
            .into());
        }

        for (field, path) in [
            ("storage.state_dir", &self.storage.state_dir),
            ("storage.download_dir", &self.storage.download_dir),
        ] {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::InvalidPath {
                    path: path.clone(),
                    reason: format!("{} not specified", field),
                }
                .into());
            }
        }

        Ok(())
    }

    /// Ensure required directories exist
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.storage.state_dir)?;
        std::fs::create_dir_all(&self.storage.cache_dir)?;
        std::fs::create_dir_all(&self.storage.download_dir)?;

        if let Some(log_file) = &self.logging.file {
            if let Some(parent) = log_file.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        Ok(())
    }

    /// Apply command-line overrides
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(cooldown) = overrides.cooldown {
            self.submission.cooldown = cooldown;
            self.submission.interactive = false;
        }
        if let Some(dir) = overrides.download_dir {
            self.storage.download_dir = dir;
        }
        if let Some(level) = overrides.log_level {
            self.logging.level = level;
        }
    }
}

impl std::str::FromStr for Config {
    type Err = DlTdvmsError;

    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| ConfigError::ParseError(format!("Failed to parse settings: {}", e)).into())
    }
}

/// Command-line configuration overrides
#[derive(Debug, Default)]
pub struct ConfigOverrides {
    pub cooldown: Option<u64>,
    pub download_dir: Option<PathBuf>,
    pub log_level: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.submission.interactive);
        assert_eq!(config.inbox.sender, "tdvms@afad.gov.tr");
        assert_eq!(config.inbox.strategy, MatchStrategyKind::Auto);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = r#"
[submission]
interactive = false
cooldown = 300

[inbox]
sender = "noreply@example.org"
link_pattern = "https://example.org/files/[a-z]+\\.zip"
poll_interval = 5
max_checks = 2
mail_timeout = 10
strategy = "token"
"#
        .parse()
        .unwrap();
        assert!(!config.submission.interactive);
        assert_eq!(config.submission.cooldown, 300);
        assert_eq!(config.submission.retry.max_attempts, 3);
        assert_eq!(config.inbox.strategy, MatchStrategyKind::Token);
        assert_eq!(config.portal.api_base, "https://tdvms.afad.gov.tr");
    }

    #[test]
    fn test_sample_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        Config::create_sample(&path).unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.submission.cooldown, Config::default().submission.cooldown);
    }

    #[test]
    fn test_rejects_bad_link_pattern() {
        let mut config = Config::default();
        config.inbox.link_pattern = "([unclosed".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cooldown_override_disables_prompt() {
        let mut config = Config::default();
        config.apply_overrides(ConfigOverrides {
            cooldown: Some(10),
            ..Default::default()
        });
        assert!(!config.submission.interactive);
        assert_eq!(config.submission.cooldown, 10);
    }

    #[test]
    fn test_missing_explicit_file() {
        assert!(matches!(
            Config::load(Some(Path::new("/nonexistent/dl-tdvms.toml"))),
            Err(DlTdvmsError::Config(ConfigError::NotFound(_)))
        ));
    }
}

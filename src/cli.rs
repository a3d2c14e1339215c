use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Bulk seismic waveform downloader for the AFAD TDVMS portal
#[derive(Parser, Debug)]
#[command(name = "dl-tdvms")]
#[command(version, about, long_about = None)]
#[command(after_help = "EXAMPLES:
    Request every batch of a config, pressing enter before each request:
        dl-tdvms download turkey.yml me@example.org

    Request unattended and collect links from the inbox:
        dl-tdvms download turkey.yml me@example.org --cooldown 120 --use-imap-email creds.yml

    Check downloaded archives against the config:
        dl-tdvms check-zipfiles downloads/ --config turkey.yml -p

    Show progress of a config:
        dl-tdvms status turkey.yml

Tool settings live in ~/.config/dl-tdvms/config.toml")]
pub struct Cli {
    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (-vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Settings file path
    #[arg(long, value_name = "FILE", global = true)]
    pub settings: Option<PathBuf>,

    /// Append logs to this file instead of the terminal
    #[arg(long, value_name = "FILE", global = true)]
    pub log_file: Option<PathBuf>,

    #[arg(long = "log-level", hide = true, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Request the data of a config batch by batch
    Download {
        /// Request config (YAML)
        config: PathBuf,

        /// Address the portal sends download links to
        email: String,

        /// Read notifications from this IMAP account and download archives
        #[arg(long, value_name = "CREDS_YML")]
        use_imap_email: Option<PathBuf>,

        /// Fetch the station inventory from the portal instead of the cache
        #[arg(long)]
        refresh_stations: bool,

        /// Start over if the config no longer matches its saved progress
        #[arg(long)]
        accept_drift: bool,

        /// Wait SECS between requests instead of asking before each one
        #[arg(long, value_name = "SECS")]
        cooldown: Option<u64>,

        /// Do not keep polling for unanswered batches at the end
        #[arg(long)]
        no_wait: bool,

        /// Directory for downloaded archives
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,
    },

    /// Check downloaded zip files for corruption and missing data
    CheckZipfiles {
        /// Folder holding the zip files
        archive_dir: PathBuf,

        /// Request config the archives were downloaded for
        #[arg(long, value_name = "CONFIG")]
        config: Option<PathBuf>,

        /// Print stations missing from each archive
        #[arg(short, long)]
        print_missing_stations: bool,

        /// Write request configs for batches without an archive
        #[arg(short, long)]
        write_missing_batches: bool,
    },

    /// Show the saved progress of a config
    Status {
        /// Request config (YAML)
        config: PathBuf,
    },

    /// Move failed batches back to pending
    Retry {
        /// Request config (YAML)
        config: PathBuf,

        /// Batch indices to reset (all failed batches when omitted)
        indices: Vec<usize>,
    },

    /// Show settings location and content
    Settings,
}

impl Cli {
    /// Parse arguments and handle special cases
    pub fn parse_and_validate() -> Self {
        let mut cli = Self::parse();

        // Adjust verbosity based on quiet flag
        if cli.quiet {
            cli.verbose = 0;
        }

        cli
    }

    /// Get the effective log level
    pub fn get_log_level(&self) -> &str {
        if let Some(ref level) = self.log_level {
            level
        } else {
            match self.verbose {
                0 if self.quiet => "error",
                0 => "info",
                1 => "debug",
                _ => "trace",
            }
        }
    }

    /// Get configuration overrides from CLI arguments
    pub fn get_config_overrides(&self) -> crate::config::ConfigOverrides {
        let (cooldown, download_dir) = match &self.command {
            Commands::Download {
                cooldown, output, ..
            } => (*cooldown, output.clone()),
            _ => (None, None),
        };
        crate::config::ConfigOverrides {
            cooldown,
            download_dir,
            log_level: self.log_level.clone(),
        }
    }
}

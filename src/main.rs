use anyhow::Context;
use std::io::{BufRead, IsTerminal, Write};
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use dl_tdvms::{
    archive::{self, ArchiveVerdict},
    catalog::{CachedInventory, InventorySource},
    cli::{Cli, Commands},
    config::Config,
    coverage,
    error::{ConfigError, DlTdvmsError, StateError},
    fetch::ArchiveFetcher,
    gate::{BackoffPolicy, CooldownGate, InteractiveGate, RateGate},
    inbox::{strategy_for, ImapCredentials, ImapMailbox, InboxWatcher},
    orchestrator::{self, Orchestrator, Plan, RunSummary},
    portal::PortalClient,
    progress,
    state::{BatchStatus, ConfigIdentity, DriftReport, StateStore},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_and_validate();

    // Initialize logging
    if let Err(e) = init_logging(&cli) {
        eprintln!("Failed to set up logging: {}", e);
        return ExitCode::from(2);
    }

    match handle_command(&cli).await {
        Ok(code) => code,
        Err(e) => {
            match e.downcast_ref::<DlTdvmsError>() {
                Some(DlTdvmsError::State(StateError::Drift(_))) => {
                    eprintln!("❌ {}", e);
                    eprintln!("Re-run with --accept-drift to start this config over.");
                }
                Some(DlTdvmsError::State(StateError::Locked { lock, .. })) => {
                    eprintln!("❌ {}", e);
                    eprintln!(
                        "If no other dl-tdvms is running, remove {} and try again.",
                        lock.display()
                    );
                }
                _ => eprintln!("❌ {:#}", e),
            }
            ExitCode::from(2)
        }
    }
}

/// Initialize logging based on CLI arguments
fn init_logging(cli: &Cli) -> std::io::Result<()> {
    let filter = EnvFilter::try_new(cli.get_log_level()).unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if let Some(log_file) = &cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)?;
        subscriber.with_ansi(false).with_writer(file).init();
    } else if cli.quiet {
        subscriber.without_time().with_writer(std::io::stderr).init();
    } else {
        subscriber.with_writer(std::io::stderr).init();
    }

    Ok(())
}

/// Load settings with CLI overrides applied
fn load_settings(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.settings.as_deref())?;
    config.apply_overrides(cli.get_config_overrides());
    config.validate()?;
    config.ensure_dirs()?;
    Ok(config)
}

async fn handle_command(cli: &Cli) -> anyhow::Result<ExitCode> {
    match &cli.command {
        Commands::Download {
            config: request_path,
            email,
            use_imap_email,
            refresh_stations,
            accept_drift,
            no_wait,
            ..
        } => {
            let settings = load_settings(cli)?;
            let portal = PortalClient::new(settings.portal.clone())?;
            let inventory =
                CachedInventory::new(portal.clone(), &settings.storage.cache_dir, *refresh_stations);
            let plan = Plan::prepare(request_path, &inventory).await?;
            println!(
                "📋 {}: {} stations in {} batches",
                plan.identity.id,
                plan.stations.len(),
                plan.batches.len()
            );

            let store = StateStore::new(&settings.storage.state_dir);
            let mut state = orchestrator::open_state(&store, &plan, |report| {
                *accept_drift || confirm_drift(report)
            })?;

            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("\nInterrupted, finishing the current step (press ctrl-c again to quit now)...");
                    trigger.cancel();
                }
                if tokio::signal::ctrl_c().await.is_ok() {
                    std::process::exit(130);
                }
            });

            let gate: Box<dyn RateGate> = if settings.submission.interactive {
                Box::new(InteractiveGate::new())
            } else {
                Box::new(CooldownGate::new(Duration::from_secs(settings.submission.cooldown)))
            };
            let fetcher = ArchiveFetcher::new(&settings.portal, &settings.storage.download_dir)?
                .quiet(cli.quiet);
            if use_imap_email.is_some() {
                println!("📁 Archives are saved to {}", fetcher.dir().display());
            }

            let mut runner = Orchestrator::new(
                Box::new(portal),
                gate,
                fetcher,
                BackoffPolicy::from(&settings.submission.retry),
                email.clone(),
                cancel,
            )
            .wait_for_outstanding(!*no_wait);

            if let Some(creds_path) = use_imap_email {
                let creds = ImapCredentials::load(creds_path)?;
                tracing::debug!(?creds, "Using IMAP account");
                let watcher = InboxWatcher::new(Box::new(ImapMailbox::new(creds)), &settings.inbox)?;
                runner = runner.with_inbox(watcher, strategy_for(settings.inbox.strategy));
            } else {
                println!(
                    "Download links will be e-mailed to {}. Run check-zipfiles once the archives are downloaded.",
                    email
                );
            }

            let summary = runner.run(&plan, &mut state).await?;
            print_run_summary(&summary);
            Ok(ExitCode::from(summary.exit_status()))
        }

        Commands::CheckZipfiles {
            archive_dir,
            config: request_path,
            print_missing_stations,
            write_missing_batches,
        } => {
            let zips = archive::zip_files(archive_dir)?;
            let bar = progress::check_bar(zips.len() as u64, cli.quiet);
            let results = archive::check_all(zips, |path| {
                if let Some(name) = path.file_name() {
                    bar.set_message(name.to_string_lossy().into_owned());
                }
                bar.inc(1);
            })?;
            bar.finish_and_clear();

            let mut corrupt = 0;
            for (path, verdict) in &results {
                match verdict {
                    ArchiveVerdict::Ok { .. } => println!("✓ {} {}", path.display(), verdict),
                    ArchiveVerdict::Corrupt { .. } => {
                        corrupt += 1;
                        println!("✗ {} {}", path.display(), verdict)
                    }
                }
            }
            println!(
                "{} archives checked, {} corrupt",
                results.len(),
                corrupt
            );

            if let Some(request_path) = request_path {
                let settings = load_settings(cli)?;
                let portal = PortalClient::new(settings.portal.clone())?;
                let inventory = CachedInventory::new(portal, &settings.storage.cache_dir, false);
                report_coverage(
                    request_path,
                    &inventory,
                    &results,
                    *print_missing_stations,
                    *write_missing_batches,
                )
                .await?;
            }

            Ok(ExitCode::from(archive::exit_status(&results)))
        }

        Commands::Status { config: request_path } => {
            let settings = load_settings(cli)?;
            let identity = ConfigIdentity::from_file(request_path)?;
            let store = StateStore::new(&settings.storage.state_dir);
            let Some(progress) = store.load(&identity.id)? else {
                println!("No progress recorded for {} yet.", request_path.display());
                return Ok(ExitCode::SUCCESS);
            };

            println!("Progress for {} ({})", request_path.display(), store.path_for(&identity.id).display());
            if progress.config_hash != identity.file_hash {
                println!("⚠ The config file changed since this progress was recorded.");
            }
            println!("{}", "─".repeat(60));
            for record in &progress.batches {
                print!(
                    "  [{:3}] {:<9} {:<10} {:3} stations  {}",
                    record.index,
                    record.data_format.as_str(),
                    record.status.as_str(),
                    record.stations,
                    record.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
                if let Some(error) = record.last_error.as_deref().filter(|_| record.status != BatchStatus::Verified) {
                    print!("  ({})", error);
                }
                println!();
            }
            println!("{}", "─".repeat(60));
            for status in [
                BatchStatus::Pending,
                BatchStatus::Submitted,
                BatchStatus::Fulfilled,
                BatchStatus::Verified,
                BatchStatus::Failed,
            ] {
                println!("  {:<10} {}", status.as_str(), progress.count(status));
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Retry {
            config: request_path,
            indices,
        } => {
            let settings = load_settings(cli)?;
            let identity = ConfigIdentity::from_file(request_path)?;
            let store = StateStore::new(&settings.storage.state_dir);
            let Some(mut state) = store.open_existing(&identity.id)? else {
                println!("No progress recorded for {} yet.", request_path.display());
                return Ok(ExitCode::SUCCESS);
            };

            let targets = if indices.is_empty() {
                state.progress().indices_with(BatchStatus::Failed)
            } else {
                indices.clone()
            };
            for index in &targets {
                state.reset(*index)?;
            }
            println!("↺ {} batch(es) will be requested again on the next download", targets.len());
            Ok(ExitCode::SUCCESS)
        }

        Commands::Settings => {
            let config_path = match &cli.settings {
                Some(path) => path.clone(),
                None => Config::config_path()?,
            };

            println!("Settings file location:");
            println!("  {}", config_path.display());
            println!();

            let config = Config::load(cli.settings.as_deref())?;
            println!("Current settings:");
            println!("{}", "─".repeat(60));
            let toml = toml::to_string_pretty(&config).map_err(|e| {
                ConfigError::ParseError(format!("Failed to serialize config: {}", e))
            })?;
            println!("{}", toml);
            println!("{}", "─".repeat(60));
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Ask the operator whether to discard progress recorded for another plan
fn confirm_drift(report: &DriftReport) -> bool {
    eprintln!("⚠ {}", report);
    if !std::io::stdin().is_terminal() {
        return false;
    }
    eprint!("Discard the saved progress and start over? [y/N] ");
    let _ = std::io::stderr().flush();
    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

async fn report_coverage(
    request_path: &Path,
    inventory: &dyn InventorySource,
    results: &[(std::path::PathBuf, ArchiveVerdict)],
    print_missing_stations: bool,
    write_missing_batches: bool,
) -> anyhow::Result<()> {
    let plan = Plan::prepare(request_path, inventory).await?;

    let mut archives = Vec::new();
    for (path, verdict) in results {
        if verdict.is_ok() {
            let names = archive::member_names(path)
                .with_context(|| format!("reading {}", path.display()))?;
            archives.push((path.clone(), names));
        }
    }

    let report = coverage::check(&plan.batches, &archives, plan.request.start, plan.request.end);
    println!();
    for batch in &report.batches {
        match &batch.archive {
            Some(path) => {
                println!("batch {:3} -> {}", batch.index, path.display());
                if print_missing_stations && !batch.missing.is_empty() {
                    println!("  Missing data:");
                    for name in &batch.missing {
                        println!("    {}", name);
                    }
                }
            }
            None => println!("batch {:3} -> zip file couldn't be found", batch.index),
        }
    }
    for index in &report.unchecked {
        println!("batch {:3} -> inventory batch, not checked", index);
    }
    if !report.odd.is_empty() {
        println!("Odd zip files:");
        for path in &report.odd {
            println!("  {}", path.display());
        }
    }

    let missing = report.missing_batches();
    println!("Missing data for {} batches.", missing.len());
    if write_missing_batches && !missing.is_empty() {
        let stem = request_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("request");
        let written = coverage::write_missing_configs(
            &report,
            &plan.batches,
            &plan.request,
            stem,
            Path::new("."),
        )?;
        for path in written {
            println!("Wrote request config for missing data: {}", path.display());
        }
    }
    Ok(())
}

fn print_run_summary(summary: &RunSummary) {
    println!();
    println!(
        "{}",
        progress::format_run_summary(
            summary.verified,
            summary.total,
            summary.bytes_downloaded,
            summary.issues.len()
        )
    );
    if summary.reused > 0 {
        println!("  └─ {} archive(s) were already downloaded", summary.reused);
    }
    if summary.submitted_now > 0 {
        println!("  └─ {} request(s) sent this run", summary.submitted_now);
    }
    if !summary.outstanding.is_empty() {
        println!(
            "  └─ waiting for notifications: {}",
            summary
                .outstanding
                .iter()
                .map(usize::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    for issue in &summary.issues {
        println!("  ✗ batch {} ({}): {}", issue.index, issue.status, issue.cause);
    }
    if summary.interrupted {
        println!("Interrupted. Run the same command again to resume.");
    }
}

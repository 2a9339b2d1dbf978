//! Command-line host for the update pipeline.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use log::debug;
use thiserror::Error;
use tokio::sync::mpsc;
use upgate::{
    CheckOutcome, DownloadProgress, ManagerError, UpdateInfo, UpdateManager, UpdaterSettings,
    logging, write_atomic,
};
use upgate_platform::{AppPaths, AppPathsError};

#[derive(Debug, Parser)]
#[command(name = "upgate")]
#[command(about = "Check for, download and install verified application updates", long_about = None)]
pub struct Cli {
    /// Version code of the running build; releases must be strictly newer.
    #[arg(long, global = true, default_value_t = 0, value_name = "CODE")]
    current_code: u32,

    /// Echo log output to stderr.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Look for a newer release. Honors the 24h throttle unless forced.
    Check {
        /// Check even if the last check was recent or auto-check is off.
        #[arg(long)]
        force: bool,
    },

    /// Download and verify the release found by the last `check`.
    Download,

    /// Hand a downloaded artifact to the system installer.
    Install {
        /// Path to a committed artifact in the download directory.
        path: PathBuf,
    },

    /// Delete every file in the download directory.
    Cleanup,

    /// Stop announcing the release with this version code.
    Dismiss { version_code: u32 },

    /// Forget a previously dismissed release.
    ClearDismissal,

    /// Turn automatic checks on or off.
    AutoCheck { state: Toggle },

    /// Override the metadata endpoint. Omit the URL to restore the default.
    SetUrl { url: Option<String> },

    /// Print the current policy state.
    Status,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Paths(#[from] AppPathsError),
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error("no release recorded; run `upgate check` first")]
    NoRelease,
    #[error("failed to record release in {}: {source}", path.display())]
    SaveRelease {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} was not handed to the installer", path.display())]
    InstallRefused { path: PathBuf },
    #[error("{remaining} file(s) could not be deleted")]
    CleanupIncomplete { remaining: usize },
}

pub async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let paths = AppPaths::new()?;
    let settings = UpdaterSettings::load(&paths);
    logging::init_logging(
        &paths,
        settings.debug_logging,
        cli.verbose,
        settings.max_log_size_bytes,
    );
    debug!("Loaded settings: {settings:?}");

    let manager = UpdateManager::from_paths(&paths, &settings, cli.current_code)?;
    let result = dispatch(&manager, &paths, cli.command).await;
    manager.shutdown();
    manager.drained().await;
    result
}

async fn dispatch(
    manager: &UpdateManager,
    paths: &AppPaths,
    command: Command,
) -> Result<(), CliError> {
    match command {
        Command::Check { force } => {
            let outcome = if force {
                Some(manager.check_now().await?)
            } else {
                manager.check_if_due().await?
            };
            report_check(manager, paths, outcome)?;
        }
        Command::Download => {
            let info = load_release(&paths.last_release_file()).ok_or(CliError::NoRelease)?;
            let (tx, rx) = mpsc::channel(32);
            let printer = tokio::spawn(print_progress(rx));
            let result = manager.download(info, Some(tx)).await;
            let _ = printer.await;
            let artifact = result?;
            println!("Verified {} ({} bytes)", artifact.path.display(), artifact.size);
            println!("sha256 {}", artifact.sha256);
        }
        Command::Install { path } => {
            if !manager.request_install(&path) {
                return Err(CliError::InstallRefused { path });
            }
            println!("Handed {} to the installer", path.display());
        }
        Command::Cleanup => {
            let report = manager.cleanup_stale_artifacts().await?;
            println!(
                "Removed {} file(s) from {}",
                report.removed,
                manager.download_dir().display()
            );
            for path in &report.failed {
                println!("Could not delete {}", path.display());
            }
            if !report.is_complete() {
                return Err(CliError::CleanupIncomplete {
                    remaining: report.failed.len(),
                });
            }
        }
        Command::Dismiss { version_code } => {
            manager.dismiss(version_code)?;
            println!("Dismissed version code {version_code}");
        }
        Command::ClearDismissal => {
            manager.clear_dismissal()?;
            println!("Dismissal cleared");
        }
        Command::AutoCheck { state } => {
            let enabled = matches!(state, Toggle::On);
            manager.set_auto_check_enabled(enabled)?;
            println!("Automatic checks {}", if enabled { "on" } else { "off" });
        }
        Command::SetUrl { url } => {
            manager.set_custom_check_url(url.as_deref())?;
            println!("Update endpoint: {}", manager.effective_check_url());
        }
        Command::Status => print_status(manager),
    }
    Ok(())
}

fn report_check(
    manager: &UpdateManager,
    paths: &AppPaths,
    outcome: Option<CheckOutcome>,
) -> Result<(), CliError> {
    match outcome {
        None => println!("Skipped: a check ran within the last 24 hours or auto-check is off"),
        Some(CheckOutcome::NoUpdate) => println!("Up to date"),
        Some(CheckOutcome::UpdateAvailable(info)) => {
            println!(
                "Update available: {} (version code {})",
                info.version(),
                info.version_code()
            );
            if !info.release_notes().is_empty() {
                println!("\n{}\n", info.release_notes().trim());
            }
            if manager.is_dismissed(info.version_code()) {
                println!("This release was dismissed; `upgate clear-dismissal` to show it again");
            }
            save_release(&paths.last_release_file(), &info)?;
        }
    }
    Ok(())
}

fn print_status(manager: &UpdateManager) {
    let policy = manager.policy();
    let last_check = if policy.last_check_millis == 0 {
        "never".to_string()
    } else {
        chrono::DateTime::from_timestamp_millis(policy.last_check_millis)
            .map_or_else(|| policy.last_check_millis.to_string(), |at| at.to_rfc3339())
    };

    println!("Current version code: {}", manager.current_version_code());
    println!("Endpoint:             {}", manager.effective_check_url());
    println!("Automatic checks:     {}", if policy.auto_check_enabled { "on" } else { "off" });
    println!("Last check:           {last_check}");
    println!("Check due:            {}", manager.should_check_now());
    println!(
        "Dismissed release:    {}",
        policy
            .dismissed_version_code
            .map_or_else(|| "none".to_string(), |code| code.to_string())
    );
    println!("Download directory:   {}", manager.download_dir().display());
}

async fn print_progress(mut rx: mpsc::Receiver<DownloadProgress>) {
    while let Some(event) = rx.recv().await {
        match event {
            DownloadProgress::Downloading {
                percent,
                downloaded,
                total,
            } => println!("{percent:>3}% ({downloaded}/{total} bytes)"),
            DownloadProgress::Verifying => println!("Verifying checksum..."),
        }
    }
}

fn save_release(path: &Path, info: &UpdateInfo) -> Result<(), CliError> {
    let data = serde_json::to_vec_pretty(info).map_err(|error| CliError::SaveRelease {
        path: path.to_path_buf(),
        source: error.into(),
    })?;
    write_atomic(path, &data).map_err(|source| CliError::SaveRelease {
        path: path.to_path_buf(),
        source,
    })
}

fn load_release(path: &Path) -> Option<UpdateInfo> {
    let data = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&data).ok()
}

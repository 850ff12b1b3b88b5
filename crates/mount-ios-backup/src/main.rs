mod fuse;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use backup_core::{BackupFs, ManifestInfo};
use clap::Parser;
use tracing::{error, info};

/// Mount the specified iPhone backup at the specified mount point.
///
/// If the backup is encrypted and no password is supplied, it will be
/// interactively requested. The password can be supplied using the
/// --password flag, or the BACKUP_PASSWORD environment variable.
#[derive(Parser)]
#[command(name = "mount-ios-backup", version)]
struct Cli {
    /// The backup folder to read (include the device UID)
    backup: PathBuf,

    /// The folder to mount the backup in
    mountpoint: PathBuf,

    /// The backup password, if encrypted
    #[arg(short, long)]
    password: Option<String>,

    /// Keep the process in the foreground
    #[arg(short, long)]
    foreground: bool,

    /// Find files whose sizes do not match the size in the manifest
    #[arg(long)]
    list_size_anomalies: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let root = cli
        .backup
        .canonicalize()
        .with_context(|| format!("backup folder {}", cli.backup.display()))?;
    let mountpoint = cli
        .mountpoint
        .canonicalize()
        .with_context(|| format!("mount point {}", cli.mountpoint.display()))?;

    let info = ManifestInfo::read(&root)?;
    let fs = if info.is_encrypted {
        info!("this is an encrypted backup");
        let password = resolve_password(cli.password)?;
        BackupFs::open_encrypted(&root, &password)?
    } else {
        info!("this is an unencrypted backup");
        BackupFs::open(&root)?
    };

    if cli.list_size_anomalies {
        for anomaly in fs.size_anomalies()? {
            println!(
                "{}/{}: expected {} bytes on disk, found {}",
                anomaly.domain, anomaly.relative_path, anomaly.expected, anomaly.actual
            );
        }
        return Ok(ExitCode::SUCCESS);
    }

    if cli.foreground {
        info!("staying in foreground, press Ctrl-C to unmount");
    } else {
        info!(
            "switching to background, use 'fusermount -u {}' to unmount",
            mountpoint.display()
        );
        daemonize()?;
    }
    fuse::mount(fs, &mountpoint).context("mount failed")?;
    Ok(ExitCode::SUCCESS)
}

/// Password lookup order: flag, environment, interactive prompt.
fn resolve_password(flag: Option<String>) -> Result<String> {
    if let Some(password) = flag {
        return Ok(password);
    }
    if let Ok(password) = std::env::var("BACKUP_PASSWORD") {
        return Ok(password);
    }
    rpassword::prompt_password("Enter the backup password: ")
        .context("could not read the backup password")
}

/// Detach from the terminal once the backup opened successfully, so
/// unlock and manifest failures still reach the user.
fn daemonize() -> Result<()> {
    unsafe {
        match libc::fork() {
            -1 => {
                return Err(anyhow!(std::io::Error::last_os_error()).context("fork"));
            }
            0 => {}
            _ => std::process::exit(0),
        }
        if libc::setsid() == -1 {
            return Err(anyhow!(std::io::Error::last_os_error()).context("setsid"));
        }
    }
    Ok(())
}

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const MAX_LOG_SIZE: u64 = 1024 * 1024; // 1MB

/// Where the log file goes when none is requested explicitly
pub enum LogFile {
    None,
    Default,
    At(PathBuf),
}

fn env_filter(debug: u8) -> EnvFilter {
    let level = match debug {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize console logging and, if requested, a log file.
///
/// Console output goes to stderr so script output on stdout stays clean.
/// Returns a guard that must be kept alive for the duration of the program.
pub fn init_logging(debug: u8, log_file: LogFile) -> io::Result<Option<WorkerGuard>> {
    let log_path = match log_file {
        LogFile::None => None,
        LogFile::Default => Some(get_log_directory()?.join("mmo-script.log")),
        LogFile::At(path) => Some(path),
    };

    let Some(log_path) = log_path else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter(debug))
            .with_writer(io::stderr)
            .init();
        return Ok(None);
    };

    if let Some(parent) = log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    truncate_if_needed(&log_path)?;

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    let (non_blocking_file, guard) = tracing_appender::non_blocking(BufWriter::new(file));

    tracing_subscriber::registry()
        .with(env_filter(debug))
        .with(fmt::layer().with_writer(io::stderr).with_ansi(true))
        .with(
            fmt::layer()
                .with_writer(non_blocking_file)
                .with_ansi(false)
                .with_target(true),
        )
        .init();

    tracing::info!("Logging to file: {}", log_path.display());
    Ok(Some(guard))
}

fn get_log_directory() -> io::Result<PathBuf> {
    let dirs = ProjectDirs::from("", "", "mmo")
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Failed to find home directory"))?;
    Ok(dirs.data_dir().join("logs"))
}

/// Truncate log file if it exceeds MAX_LOG_SIZE.
fn truncate_if_needed(log_path: &Path) -> io::Result<()> {
    if log_path.exists() && fs::metadata(log_path)?.len() > MAX_LOG_SIZE {
        File::create(log_path)?.set_len(0)?;
    }
    Ok(())
}

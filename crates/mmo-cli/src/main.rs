mod logging;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use mmo_scripting_host::{ExecutionOutcome, SandboxConfig, ScriptContext, ScriptError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use logging::LogFile;

#[derive(Parser)]
#[command(version, about = "Run sandboxed client scripts", long_about = None)]
pub struct Cli {
    /// Enables debug logging (repeat for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,

    /// Sandbox config file (default: platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the dialect compiler and libraries
    #[arg(short, long)]
    resources: Option<PathBuf>,

    /// Execution bound in milliseconds for every script (0 = unbounded)
    #[arg(short, long)]
    timeout_ms: Option<u64>,

    /// Keep running this long after the last file so timers can fire
    #[arg(short, long, default_value_t = 0)]
    wait_ms: u64,

    /// Allow eval and the Function constructor
    #[arg(long)]
    allow_eval: bool,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    /// Write a log file under the data directory
    #[arg(long)]
    log: bool,

    /// Write the log file to this path instead
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Scripts to run in order (`.coffee` files are compiled first).
    /// Starts a prompt when empty.
    files: Vec<PathBuf>,
}

fn load_config(cli: &Cli) -> Result<SandboxConfig> {
    let mut config = match &cli.config {
        Some(path) => SandboxConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => {
            let path = SandboxConfig::config_path();
            if path.exists() {
                SandboxConfig::load(&path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?
            } else {
                debug!("No config at {}, using defaults", path.display());
                SandboxConfig::default()
            }
        }
    };

    if let Some(resources) = &cli.resources {
        config.resource_dir = Some(resources.clone());
    }
    if cli.allow_eval {
        config.allow_eval = true;
    }
    Ok(config)
}

fn report_error(error: &ScriptError) {
    eprintln!("Javascript Error >>>");
    eprintln!("{error}");
    eprintln!("<<<");
}

fn print_outcome(outcome: &ExecutionOutcome, json: bool) {
    match outcome.as_result() {
        Ok(value) if json => match serde_json::to_string(value) {
            Ok(text) => println!("{text}"),
            Err(e) => warn!("Failed to serialize result: {}", e),
        },
        Ok(value) if !value.is_undefined() => println!("{value}"),
        Ok(_) => {}
        Err(e) => report_error(e),
    }
}

fn is_dialect_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "coffee")
}

/// Compile if needed, then run on a blocking thread
async fn run_source(
    context: &Arc<ScriptContext>,
    source: String,
    label: String,
    dialect: bool,
) -> Result<ExecutionOutcome> {
    let context = Arc::clone(context);
    let outcome = tokio::task::spawn_blocking(move || {
        let source = if dialect {
            match context.try_compile_dialect(&source) {
                Ok(compiled) => compiled,
                Err(e) => return ExecutionOutcome::err(e),
            }
        } else {
            source
        };
        context.execute(&source, &label)
    })
    .await
    .context("Script task failed")?;
    Ok(outcome)
}

async fn run_files(context: &Arc<ScriptContext>, cli: &Cli, shutdown: &Notify) -> Result<()> {
    for path in &cli.files {
        let source = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        info!("Running {}", path.display());
        let outcome = run_source(
            context,
            source,
            path.display().to_string(),
            is_dialect_file(path),
        )
        .await?;
        print_outcome(&outcome, cli.json);
    }

    if cli.wait_ms > 0 {
        debug!("Waiting {}ms for timers", cli.wait_ms);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(cli.wait_ms)) => {}
            _ = shutdown.notified() => {}
        }
    }
    Ok(())
}

async fn run_prompt(context: &Arc<ScriptContext>, cli: &Cli, shutdown: &Notify) -> Result<()> {
    eprintln!("{}", context.info());
    eprintln!("Commands: :info, :coffee <source>, :eval on, :timers, :quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("> ");
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = shutdown.notified() => None,
        };
        let Some(line) = line else {
            break;
        };

        let line = line.trim();
        match line {
            "" => continue,
            ":quit" | ":q" => break,
            ":info" => println!("{}", context.info()),
            ":timers" => println!("{} pending", context.pending_timers()),
            ":eval on" => {
                if let Err(e) = context.set_allow_eval(true) {
                    report_error(&e);
                }
            }
            _ => {
                let (source, dialect) = match line.strip_prefix(":coffee ") {
                    Some(source) => (source, true),
                    None => (line, false),
                };
                let outcome =
                    run_source(context, source.to_string(), "stdin".to_string(), dialect).await?;
                print_outcome(&outcome, cli.json);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_file = match (&cli.log_file, cli.log) {
        (Some(path), _) => LogFile::At(path.clone()),
        (None, true) => LogFile::Default,
        (None, false) => LogFile::None,
    };
    let _log_guard = logging::init_logging(cli.debug, log_file).context("Failed to set up logging")?;

    let config = load_config(&cli)?;
    if let Some(timeout_ms) = cli.timeout_ms {
        ScriptContext::set_max_execution_time(timeout_ms);
    }

    let context = tokio::task::spawn_blocking(move || {
        ScriptContext::builder()
            .config(config)
            .error_hook(report_error)
            .build()
    })
    .await
    .context("Context setup task failed")?
    .context("Failed to create script context")?;
    let context = Arc::new(context);
    info!("Resources: {}", context.resource_dir().display());

    // First Ctrl-C aborts the running script; when idle it also ends the session
    let shutdown = Arc::new(Notify::new());
    let signals = tokio::spawn({
        let context = Arc::clone(&context);
        let shutdown = Arc::clone(&shutdown);
        async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted");
                context.terminate();
                shutdown.notify_waiters();
            }
        }
    });

    let result = if cli.files.is_empty() {
        run_prompt(&context, &cli, &shutdown).await
    } else {
        run_files(&context, &cli, &shutdown).await
    };

    signals.abort();
    let _ = signals.await;

    // Joins the timer thread
    tokio::task::spawn_blocking(move || drop(context))
        .await
        .context("Shutdown task failed")?;

    result
}

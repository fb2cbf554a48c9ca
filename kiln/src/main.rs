// kiln/src/main.rs
use std::fs;
use std::process;

use clap::Parser;
use colored::Colorize;
use kiln_common::config::Config;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, warn};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::CliArgs;

fn init_logging(config: &Config, verbose: u8) {
    let level_filter = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let max_log_level = level_filter.into_level().unwrap_or(tracing::Level::INFO);

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .with_env_var("KILN_LOG")
        .from_env_lossy();

    let log_dir = config.logs_dir();
    if verbose == 0 {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .without_time()
            .try_init();
        return;
    }

    if let Err(e) = fs::create_dir_all(&log_dir) {
        eprintln!(
            "{} Failed to create log directory {}: {}",
            "Error:".red().bold(),
            log_dir.display(),
            e
        );
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .without_time()
            .try_init();
        return;
    }

    let file_appender = tracing_appender::rolling::daily(&log_dir, "kiln.log");
    let (non_blocking_appender, guard) = tracing_appender::non_blocking(file_appender);
    let stderr_writer = std::io::stderr.with_max_level(max_log_level);
    let file_writer = non_blocking_appender.with_max_level(max_log_level);

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(stderr_writer.and(file_writer))
        .with_ansi(true)
        .without_time()
        .try_init();

    Box::leak(Box::new(guard)); // Keep guard alive

    debug!(
        "Verbose logging enabled. Writing logs to: {}/kiln.log",
        log_dir.display()
    );
}

#[tokio::main]
async fn main() {
    let cli_args = CliArgs::parse();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {:#}", "Error".red().bold(), e);
            process::exit(e.category().exit_code());
        }
    };
    init_logging(&config, cli_args.verbose);

    if let Err(e) = config.ensure_layout() {
        error!("Could not prepare {}: {}", config.kiln_root().display(), e);
        eprintln!("{}: {:#}", "Error".red().bold(), e);
        process::exit(e.category().exit_code());
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                eprintln!("{}", "Interrupted, cancelling running attempts...".yellow());
                interrupt.cancel();
            }
            Err(e) => warn!("Could not listen for Ctrl-C: {}", e),
        }
    });

    if let Err(e) = cli_args.command.run(&config, cancel).await {
        error!("Command failed: {:#}", e);
        eprintln!("{}: {:#}", "Error".red().bold(), e);
        process::exit(e.category().exit_code());
    }

    debug!("Command completed successfully.");
}

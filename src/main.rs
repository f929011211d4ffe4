//! sing-box entry point
//!
//! ```bash
//! # Run with the default configuration path
//! sing-box
//!
//! # Run with an explicit configuration
//! sing-box -c /etc/sing-box/config.json
//!
//! # Print the canonical form of a configuration and exit
//! sing-box -c config.json -f
//! ```
//!
//! SIGINT and SIGTERM trigger graceful shutdown with exit code 0; any
//! startup failure exits non-zero.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use tokio::signal;
use tracing::info;

use sing_box::config::load_options;
use sing_box::Service;

/// Command-line arguments
struct Args {
    config_path: PathBuf,
    directory: Option<PathBuf>,
    format: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("config.json");
        let mut directory = None;
        let mut format = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-D" | "--directory" => {
                    if let Some(path) = args.next() {
                        directory = Some(PathBuf::from(path));
                    }
                }
                "-f" | "--format" => {
                    format = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("sing-box v{}", sing_box::VERSION);
                    std::process::exit(0);
                }
                other => {
                    eprintln!("unknown argument: {other}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            directory,
            format,
        }
    }
}

fn print_help() {
    println!(
        r#"sing-box v{}

Universal proxy platform.

USAGE:
    sing-box [OPTIONS]

OPTIONS:
    -c, --config <PATH>      Configuration file path [default: config.json]
    -D, --directory <DIR>    Working directory
    -f, --format             Print the canonical configuration and exit
    -h, --help               Print help information
    -v, --version            Print version information
"#,
        sing_box::VERSION
    );
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(directory) = &args.directory {
        std::env::set_current_dir(directory)
            .with_context(|| format!("change directory to {}", directory.display()))?;
    }

    let options = load_options(&args.config_path).context("read config")?;

    // The service is built first even in --format mode, so a config
    // with an unrecognized inbound/outbound type fails instead of
    // printing cleanly
    let service = Service::new(options.clone()).context("create service")?;

    if args.format {
        let formatted =
            serde_json::to_string_pretty(&options).context("encode config")?;
        println!("{formatted}");
        return Ok(());
    }

    service.start().await.context("start service")?;

    wait_for_signal().await;

    // Graceful shutdown; close errors are reported but do not change
    // the exit code once the service ran.
    if let Err(e) = service.close().await {
        eprintln!("close service: {e}");
    }
    Ok(())
}

async fn wait_for_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
        _ = wait_for_sigterm() => {
            info!("received SIGTERM, shutting down");
        }
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("register SIGTERM handler");
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}

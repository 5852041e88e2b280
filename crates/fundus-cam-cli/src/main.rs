//! fundus-cam CLI - glaucoma screening with Grad-CAM heatmaps.

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod config;
mod output;
mod server;

use commands::analyze::AnalyzeArgs;
use commands::{Cli, Commands, ExitCode};
use config::AppConfig;

fn report<T>(result: anyhow::Result<T>, on_ok: impl FnOnce(T) -> ExitCode) -> ExitCode {
    match result {
        Ok(value) => on_ok(value),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::Error
        }
    }
}

fn analyze(args: AnalyzeArgs, config: &AppConfig) -> ExitCode {
    let args = AnalyzeArgs::with_config(args, config);
    report(commands::analyze::run(&args), |result| result.exit_code)
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::new("warn"),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = AppConfig::load();

    let exit_code = match cli.command {
        Some(Commands::Analyze(args)) => analyze(args, &config),
        Some(Commands::Serve(ref args)) => report(commands::serve::run(args, &config), |()| ExitCode::Success),
        Some(Commands::Models(ref args)) => report(commands::models::run(args), |()| ExitCode::Success),
        Some(Commands::Vault(ref args)) => report(commands::vault::run(args, &config), |()| ExitCode::Success),
        Some(Commands::Audit(ref args)) => report(commands::audit::run(args, &config), |()| ExitCode::Success),
        None => {
            // Default behavior: analyze with flattened args
            if cli.analyze.paths.is_empty() {
                eprintln!("error: No paths specified. Use --help for usage information.");
                return ExitCode::Error.into();
            }
            analyze(cli.analyze, &config)
        }
    };

    exit_code.into()
}

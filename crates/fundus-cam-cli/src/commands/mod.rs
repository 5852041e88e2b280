//! CLI command definitions and handlers.

pub mod analyze;
pub mod audit;
pub mod models;
pub mod serve;
pub mod vault;

use clap::{Parser, Subcommand};

/// fundus-cam - glaucoma screening with Grad-CAM heatmaps
#[derive(Parser)]
#[command(name = "fundus-cam")]
#[command(author, version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    /// Shared analyze arguments (paths, output, model).
    #[command(flatten)]
    pub analyze: analyze::AnalyzeArgs,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand)]
pub enum Commands {
    /// Classify fundus images and write reports
    Analyze(analyze::AnalyzeArgs),
    /// Run the HTTP gateway
    Serve(serve::ServeArgs),
    /// Manage classifier checkpoints
    Models(models::ModelsArgs),
    /// Encrypt and decrypt stored uploads
    Vault(vault::VaultArgs),
    /// Inspect the security audit log
    Audit(audit::AuditArgs),
}

/// Process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Everything ran; nothing was flagged.
    Success = 0,
    /// At least one image was classified as glaucoma.
    FindingsPresent = 1,
    /// The command failed.
    Error = 2,
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        Self::from(code as u8)
    }
}

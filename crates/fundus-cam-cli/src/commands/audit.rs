//! Audit command - summarize the security audit log.

use anyhow::Result;
use clap::{Args, Subcommand};
use fundus_cam_adapters::FileAuditLog;

use crate::config::AppConfig;

#[derive(Args)]
pub struct AuditArgs {
    #[command(subcommand)]
    pub command: AuditCommand,
}

#[derive(Subcommand)]
pub enum AuditCommand {
    /// Print activity statistics as JSON
    Summary {
        /// Number of past days to include besides today
        #[arg(long, default_value_t = 7, value_parser = clap::value_parser!(u32).range(0..=366))]
        days: u32,
        /// Pretty-print the JSON
        #[arg(long)]
        pretty: bool,
    },
}

pub fn run(args: &AuditArgs, config: &AppConfig) -> Result<()> {
    match &args.command {
        AuditCommand::Summary { days, pretty } => {
            // Reading works even when writing is disabled.
            let log = FileAuditLog::new(config.audit_dir(), false)?;
            let summary = log.summarize(*days)?;
            let json = if *pretty {
                serde_json::to_string_pretty(&summary)?
            } else {
                serde_json::to_string(&summary)?
            };
            println!("{json}");
        }
    }
    Ok(())
}

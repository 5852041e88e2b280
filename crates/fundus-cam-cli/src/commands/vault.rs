//! Vault command - encryption at rest for stored uploads.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use fundus_cam_adapters::{AuditTrail, FileAuditLog, FileCipher, UploadStore};
use fundus_cam_core::domain::Actor;
use tracing::info;

use crate::config::AppConfig;

#[derive(Args)]
pub struct VaultArgs {
    #[command(subcommand)]
    pub command: VaultCommand,
}

#[derive(Subcommand)]
pub enum VaultCommand {
    /// Encrypt files, replacing each with `<file>.encrypted`
    Encrypt {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Decrypt an `.encrypted` file
    Decrypt {
        file: PathBuf,
        /// Where to write the plaintext (default: strip `.encrypted`)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Encrypt every plaintext file in the upload directory
    Migrate {
        /// Upload directory (overrides config)
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,
    },
}

/// Builds the cipher from the configured password.
pub fn cipher_from_config(config: &AppConfig) -> Result<Option<FileCipher>> {
    config
        .security
        .encryption_key
        .as_deref()
        .map(|key| FileCipher::from_password(key, config.salt()))
        .transpose()
}

pub fn run(args: &VaultArgs, config: &AppConfig) -> Result<()> {
    let cipher = cipher_from_config(config)?
        .context("No encryption key configured. Set ENCRYPTION_KEY or security.encryption_key")?;
    let audit = FileAuditLog::new(config.audit_dir(), config.audit_enabled())?;
    let system = Actor::default();

    match &args.command {
        VaultCommand::Encrypt { files } => {
            for file in files {
                let sealed = cipher.encrypt_file(file)?;
                audit.log_encryption_action(&system, "encrypt", &file.display().to_string());
                println!("{}", sealed.display());
            }
        }
        VaultCommand::Decrypt { file, output } => {
            let plain = cipher.decrypt_file(file, output.as_deref())?;
            audit.log_encryption_action(&system, "decrypt", &file.display().to_string());
            println!("{}", plain.display());
        }
        VaultCommand::Migrate { dir } => {
            let dir = dir.clone().unwrap_or_else(|| config.upload_dir());
            info!("Migrating {} to encrypted storage", dir.display());
            let store = UploadStore::new(&dir, Some(Arc::new(cipher)))?;
            let report = store.migrate()?;
            audit.log_encryption_action(&system, "migrate", &dir.display().to_string());
            println!("{}", serde_json::to_string(&report)?);
            if report.errors > 0 {
                anyhow::bail!("{} file(s) could not be encrypted", report.errors);
            }
        }
    }
    Ok(())
}

//! Models command - manage classifier checkpoints.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use fundus_cam_adapters::models::{
    download_model, install_model, list_models as adapter_list_models, model_path, models_dir, ProgressCallback,
    DEFAULT_MODEL, MODELS,
};
use fundus_cam_core::inference::inspect_checkpoint;
use indicatif::{ProgressBar, ProgressStyle};

/// Arguments for the models command
#[derive(Args)]
pub struct ModelsArgs {
    #[command(subcommand)]
    pub command: ModelsCommand,
}

/// Models subcommands
#[derive(Subcommand)]
pub enum ModelsCommand {
    /// Download a checkpoint into the models directory
    Fetch {
        /// Where to download the weights from
        #[arg(long)]
        url: String,
        /// Expected SHA-256 of the file (hex)
        #[arg(long)]
        sha256: Option<String>,
        /// Registry name to install as
        #[arg(long, default_value = DEFAULT_MODEL)]
        name: String,
    },
    /// Copy a local checkpoint into the models directory
    Import {
        /// Safetensors file to install
        file: PathBuf,
        /// Expected SHA-256 of the file (hex)
        #[arg(long)]
        sha256: Option<String>,
        /// Registry name to install as
        #[arg(long, default_value = DEFAULT_MODEL)]
        name: String,
    },
    /// Print tensor and parameter counts of a checkpoint
    Inspect {
        /// Checkpoint file (defaults to the installed default model)
        file: Option<PathBuf>,
    },
    /// List installed models
    List,
    /// Print model directory path
    Path,
}

/// Run the models command.
pub fn run(args: &ModelsArgs) -> Result<()> {
    match &args.command {
        ModelsCommand::Fetch { url, sha256, name } => fetch_model(name, url, sha256.as_deref()),
        ModelsCommand::Import { file, sha256, name } => {
            let dest = install_model(name, file, sha256.as_deref())?;
            println!("Installed {name} at {}", dest.display());
            Ok(())
        }
        ModelsCommand::Inspect { file } => inspect(file.clone()),
        ModelsCommand::List => {
            list_models();
            Ok(())
        }
        ModelsCommand::Path => {
            println!("{}", models_dir().display());
            Ok(())
        }
    }
}

fn fetch_model(name: &str, url: &str, sha256: Option<&str>) -> Result<()> {
    let pb = Arc::new(ProgressBar::new(0));
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}")
            .map_err(|e| anyhow::anyhow!("Invalid progress template: {e}"))?
            .progress_chars("#>-"),
    );
    pb.set_message(name.to_string());

    let pb_clone = Arc::clone(&pb);
    let progress: ProgressCallback = Box::new(move |_name: &str, downloaded: u64, total: Option<u64>| {
        if let Some(t) = total {
            pb_clone.set_length(t);
        }
        pb_clone.set_position(downloaded);
    });

    let dest = download_model(name, url, sha256, Some(&progress))?;
    pb.finish_with_message(format!("Saved to {}", dest.display()));
    Ok(())
}

fn inspect(file: Option<PathBuf>) -> Result<()> {
    let path = file
        .or_else(|| model_path(DEFAULT_MODEL))
        .context("No checkpoint given")?;
    let info = inspect_checkpoint(&path)?;
    println!("{}", path.display());
    println!("  tensors:    {}", info.tensors);
    println!("  parameters: {}", info.parameters);
    Ok(())
}

fn list_models() {
    let models = adapter_list_models();

    println!("Models directory: {}", models_dir().display());
    println!();

    for (name, installed) in &models {
        let status = if *installed { "✓" } else { "✗" };
        let info = MODELS.iter().find(|m| m.name == name);
        let filename = info.map_or("unknown", |m| m.filename);
        let description = info.map_or("", |m| m.description);
        println!("  {status} {name} ({filename}) {description}");
    }

    println!();
    let installed_count = models.iter().filter(|(_, installed)| *installed).count();
    println!("{}/{} models installed", installed_count, models.len());
}

//! Analyze command - classify fundus images in batch.

use std::collections::HashSet;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use fundus_cam_adapters::{DicomDecoder, FsImageSource};
use fundus_cam_core::inference::device_for;
use fundus_cam_core::{
    ImageSource, InferenceService, ProgressEvent, ProgressSink, ReportEntry, ReportOutput, TargetLayer,
};
use tracing::{debug, info, warn};

use super::ExitCode;
use crate::config::AppConfig;
use crate::output::{JsonOutput, ProgressBar};

/// Output format for results.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// JSON Lines (one JSON object per line)
    #[default]
    Jsonl,
    /// Single JSON array
    Json,
}

pub(super) fn parse_target_layer(s: &str) -> Result<TargetLayer, String> {
    s.parse()
}

/// Shared arguments for image analysis.
#[derive(Args, Clone, Default)]
pub struct AnalyzeArgs {
    /// Files or directories to analyze
    pub paths: Vec<PathBuf>,

    /// Recurse into subdirectories
    #[arg(short, long)]
    pub recursive: bool,

    /// Write one composite heatmap PNG per image into this directory
    #[arg(long, value_name = "DIR")]
    pub heatmap_dir: Option<PathBuf>,

    /// Classifier checkpoint (overrides config and the installed default)
    #[arg(long, value_name = "FILE")]
    pub model: Option<PathBuf>,

    /// Inference device: auto or cpu
    #[arg(long)]
    pub device: Option<String>,

    /// Attribution layer: final_conv, attention or block:N
    #[arg(long, value_parser = parse_target_layer)]
    pub target_layer: Option<TargetLayer>,

    /// Show progress bar
    #[arg(long)]
    pub progress: bool,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,

    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,

    /// Pretty-print JSON output (only affects --format json)
    #[arg(long)]
    pub pretty: bool,
}

impl AnalyzeArgs {
    /// Apply configuration values where no CLI flag was given.
    pub fn with_config(mut args: Self, config: &AppConfig) -> Self {
        if !args.recursive {
            args.recursive = config.general.recursive.unwrap_or(false);
        }
        if args.heatmap_dir.is_none() {
            args.heatmap_dir.clone_from(&config.output.heatmap_dir);
        }
        if args.model.is_none() {
            args.model = config.model_path();
        }
        if args.device.is_none() {
            args.device = Some(config.device().to_string());
        }
        if args.target_layer.is_none() {
            args.target_layer = Some(config.target_layer());
        }
        if args.format.is_none() {
            args.format = config.output.format.as_deref().and_then(|s| match s {
                "json" => Some(OutputFormat::Json),
                "jsonl" => Some(OutputFormat::Jsonl),
                _ => None,
            });
        }
        if !args.pretty {
            args.pretty = config.output.pretty.unwrap_or(false);
        }
        if !args.progress {
            args.progress = config.output.progress.unwrap_or(false);
        }
        args
    }

    fn format(&self) -> OutputFormat {
        self.format.unwrap_or_default()
    }
}

/// Result of running the analyze command.
#[derive(Debug)]
pub struct AnalyzeResult {
    pub processed: usize,
    pub skipped: usize,
    /// Images classified as glaucoma.
    pub flagged: usize,
    pub exit_code: ExitCode,
}

/// Run the analyze command.
///
/// Expects `args` to have been processed through `with_config()` first.
pub fn run(args: &AnalyzeArgs) -> Result<AnalyzeResult> {
    info!("Running analyze command on {} paths", args.paths.len());

    if args.paths.is_empty() {
        anyhow::bail!("No paths specified");
    }

    let service = load_service(args)?;

    if let Some(dir) = &args.heatmap_dir {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let source = FsImageSource::new(args.paths.clone(), args.recursive);
    let total = source.count_hint();
    let show_progress = !args.quiet && (args.progress || std::io::stderr().is_terminal());
    let progress = ProgressBar::new(total.map(|t| t as u64), args.quiet, show_progress);
    let output = JsonOutput::stdout();

    process_images(&source, &service, &output, &progress, args)
}

/// Builds the inference service from the resolved model settings.
pub fn load_service(args: &AnalyzeArgs) -> Result<InferenceService> {
    let path = args.model.as_ref().context(
        "No classifier checkpoint configured. Run `fundus-cam models fetch` or pass --model",
    )?;
    if !path.exists() {
        anyhow::bail!(
            "Checkpoint {} not found. Run `fundus-cam models fetch` or pass --model",
            path.display()
        );
    }
    let device = device_for(args.device.as_deref().unwrap_or("auto"));
    let service = InferenceService::load(path, &device, args.target_layer.unwrap_or_default())
        .with_container_decoder(Arc::new(DicomDecoder));
    if let Some(reason) = service.unavailable_reason() {
        anyhow::bail!("Classifier unavailable: {reason}");
    }
    Ok(service)
}

fn process_images(
    source: &dyn ImageSource,
    service: &InferenceService,
    output: &JsonOutput,
    progress: &dyn ProgressSink,
    args: &AnalyzeArgs,
) -> Result<AnalyzeResult> {
    let total = source.count_hint();
    let mut processed = 0usize;
    let mut skipped = 0usize;
    let mut flagged = 0usize;
    let mut entries: Vec<ReportEntry> = Vec::new();
    let mut heatmap_names = HashSet::new();

    for (index, image_result) in source.images().enumerate() {
        let image = match image_result {
            Ok(img) => img,
            Err(e) => {
                progress.on_event(ProgressEvent::Skipped {
                    path: format!("image {index}"),
                    reason: format!("{e:#}"),
                });
                skipped += 1;
                continue;
            }
        };

        let path = image.path.display().to_string();
        progress.on_event(ProgressEvent::Started {
            path: path.clone(),
            index,
            total,
        });

        let explanation = match service.explain(&image.raw) {
            Ok(e) => e,
            Err(e) => {
                warn!("Analysis failed for {path}: {e}");
                progress.on_event(ProgressEvent::Skipped {
                    path,
                    reason: e.to_string(),
                });
                skipped += 1;
                continue;
            }
        };

        let heatmap_path = match &args.heatmap_dir {
            Some(dir) => {
                let dest = dir.join(heatmap_file_name(&image.path, &mut heatmap_names));
                fs::write(&dest, explanation.artifact.png())
                    .with_context(|| format!("Failed to write {}", dest.display()))?;
                debug!("Wrote heatmap {}", dest.display());
                Some(dest.display().to_string())
            }
            None => None,
        };

        let entry = ReportEntry::new(path, &explanation.report(), heatmap_path);
        if entry.prediction_class == 1 {
            flagged += 1;
        }

        progress.on_event(ProgressEvent::Completed { entry: entry.clone() });

        match args.format() {
            OutputFormat::Jsonl => output.write(&entry)?,
            OutputFormat::Json => entries.push(entry),
        }
        processed += 1;
    }

    if matches!(args.format(), OutputFormat::Json) {
        output.write_array(&entries, args.pretty)?;
    }
    output.flush()?;

    progress.on_event(ProgressEvent::Finished { processed, skipped });

    let exit_code = if flagged > 0 {
        ExitCode::FindingsPresent
    } else {
        ExitCode::Success
    };

    Ok(AnalyzeResult {
        processed,
        skipped,
        flagged,
        exit_code,
    })
}

/// `<stem>_heatmap.png`, suffixed with a counter when two inputs share a stem.
fn heatmap_file_name(source: &Path, used: &mut HashSet<String>) -> String {
    let stem = source
        .file_stem()
        .map_or_else(|| "image".to_string(), |s| s.to_string_lossy().into_owned());
    let mut name = format!("{stem}_heatmap.png");
    let mut n = 2;
    while !used.insert(name.clone()) {
        name = format!("{stem}_{n}_heatmap.png");
        n += 1;
    }
    name
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use fundus_cam_core::domain::SourceImage;
    use fundus_cam_test_support::{MockClassifier, MockImageSource, MockProgressSink, SyntheticImageBuilder};

    fn service() -> InferenceService {
        InferenceService::with_classifier(Arc::new(MockClassifier::new()))
    }

    #[test]
    fn test_heatmap_names_are_unique() {
        let mut used = HashSet::new();
        assert_eq!(heatmap_file_name(Path::new("a/eye.png"), &mut used), "eye_heatmap.png");
        assert_eq!(heatmap_file_name(Path::new("b/eye.jpg"), &mut used), "eye_2_heatmap.png");
        assert_eq!(heatmap_file_name(Path::new("c/eye.dcm"), &mut used), "eye_3_heatmap.png");
    }

    #[test]
    fn test_with_config_respects_cli() {
        let config: AppConfig = toml::from_str(
            r"
[general]
recursive = true
[model]
path = '/from/config.safetensors'
target_layer = 'attention'
[output]
format = 'json'
pretty = true
",
        )
        .unwrap();

        let cli = AnalyzeArgs {
            model: Some(PathBuf::from("/from/cli.safetensors")),
            format: Some(OutputFormat::Jsonl),
            ..AnalyzeArgs::default()
        };
        let merged = AnalyzeArgs::with_config(cli, &config);
        assert!(merged.recursive);
        assert!(merged.pretty);
        assert_eq!(merged.model, Some(PathBuf::from("/from/cli.safetensors")));
        assert_eq!(merged.target_layer, Some(TargetLayer::Attention));
        assert!(matches!(merged.format(), OutputFormat::Jsonl));
    }

    #[test]
    fn test_missing_checkpoint_is_an_error() {
        let args = AnalyzeArgs {
            model: Some(PathBuf::from("/nonexistent/model.safetensors")),
            ..AnalyzeArgs::default()
        };
        let err = load_service(&args).unwrap_err();
        assert!(format!("{err:#}").contains("models fetch"));
    }

    #[test]
    fn test_process_images_writes_entries_and_heatmaps() {
        let dir = tempfile::tempdir().unwrap();
        let png = SyntheticImageBuilder::png_bytes(&SyntheticImageBuilder::bright_ring(128, 128));
        let source = MockImageSource::new(vec![
            SourceImage::new("eyes/left.png", png.clone()),
            SourceImage::new("eyes/notes.png", b"not an image".to_vec()),
            SourceImage::new("eyes/right.png", png),
        ]);
        let progress = MockProgressSink::new();
        let args = AnalyzeArgs {
            heatmap_dir: Some(dir.path().to_path_buf()),
            ..AnalyzeArgs::default()
        };

        let output = JsonOutput::new(Box::new(std::io::sink()));
        let result = process_images(&source, &service(), &output, &progress, &args).unwrap();

        assert_eq!(result.processed, 2);
        assert_eq!(result.skipped, 1);
        assert!(dir.path().join("left_heatmap.png").exists());
        assert!(dir.path().join("right_heatmap.png").exists());
        let expected = if result.flagged > 0 {
            ExitCode::FindingsPresent
        } else {
            ExitCode::Success
        };
        assert_eq!(result.exit_code, expected);

        let events = progress.events();
        assert!(matches!(
            events.last(),
            Some(ProgressEvent::Finished { processed: 2, skipped: 1 })
        ));
    }
}

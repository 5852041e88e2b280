//! Integration tests for configuration layering.
//!
//! Tests the full priority chain: hardcoded defaults < XDG config < project config < environment < CLI args

#![allow(clippy::unwrap_used)] // Test code uses unwrap for brevity
#![allow(deprecated)] // cargo_bin deprecation warning

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use fundus_cam_test_support::{write_random_checkpoint, SyntheticImageBuilder};
use predicates::prelude::*;
use serde_json::Value;

struct Project {
    dir: tempfile::TempDir,
    image: PathBuf,
}

impl Project {
    /// A directory with one image, a random checkpoint and a project config.
    fn new(config: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        write_random_checkpoint(&dir.path().join("model.safetensors")).unwrap();
        let image = dir.path().join("eye.png");
        fs::write(&image, SyntheticImageBuilder::png_bytes(&SyntheticImageBuilder::fundus(96, 96))).unwrap();
        fs::write(dir.path().join(".fundus-cam.toml"), config).unwrap();
        Self { dir, image }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn command(&self) -> Command {
        let mut cmd = Command::cargo_bin("fundus-cam").unwrap();
        cmd.current_dir(self.path())
            .env("XDG_CONFIG_HOME", self.path().join("xdg-config"))
            .env("XDG_DATA_HOME", self.path().join("xdg-data"))
            .env_remove("ENCRYPTION_KEY")
            .env_remove("ENABLE_AUDIT_LOGS");
        cmd
    }
}

const BASE: &str = r"
[model]
path = 'model.safetensors'
device = 'cpu'
";

#[test]
fn test_project_config_applies_format() {
    let project = Project::new(&format!("{BASE}\n[output]\nformat = 'json'\n"));

    project
        .command()
        .arg("--quiet")
        .arg(&project.image)
        .assert()
        .code(predicate::in_iter([0, 1]))
        .stdout(predicate::str::starts_with("[")); // JSON array format
}

#[test]
fn test_cli_overrides_project_config() {
    let project = Project::new(&format!("{BASE}\n[output]\nformat = 'json'\n"));

    project
        .command()
        .args(["--quiet", "--format", "jsonl"])
        .arg(&project.image)
        .assert()
        .code(predicate::in_iter([0, 1]))
        .stdout(predicate::str::starts_with("{")); // JSONL format (single object per line)
}

#[test]
fn test_config_found_from_subdirectory() {
    let project = Project::new(&format!("{BASE}\n[output]\nformat = 'json'\npretty = true\n"));
    let nested = project.path().join("a/b");
    fs::create_dir_all(&nested).unwrap();

    // Relative paths in the config resolve against the working directory,
    // so point at the checkpoint explicitly.
    let output = project
        .command()
        .current_dir(&nested)
        .arg("--quiet")
        .arg("--model")
        .arg(project.path().join("model.safetensors"))
        .arg(&project.image)
        .output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("[\n"), "expected pretty JSON, got: {stdout}");
    let parsed: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(parsed.as_array().unwrap().len(), 1);
}

#[test]
fn test_xdg_config_is_overridden_by_project() {
    let project = Project::new(&format!("{BASE}\n[output]\nformat = 'jsonl'\n"));
    let xdg = project.path().join("xdg-config/fundus-cam");
    fs::create_dir_all(&xdg).unwrap();
    fs::write(xdg.join("config.toml"), "[output]\nformat = 'json'\n").unwrap();

    project
        .command()
        .arg("--quiet")
        .arg(&project.image)
        .assert()
        .code(predicate::in_iter([0, 1]))
        .stdout(predicate::str::starts_with("{"));
}

#[test]
fn test_env_overrides_audit_setting() {
    let project = Project::new("[security]\nenable_audit_logs = false\naudit_dir = 'audit'\n");
    let file = project.path().join("scan.png");
    fs::write(&file, b"pixels").unwrap();

    project
        .command()
        .env("ENCRYPTION_KEY", "from-env")
        .env("ENABLE_AUDIT_LOGS", "TRUE")
        .args(["vault", "encrypt"])
        .arg(&file)
        .assert()
        .success();

    let logs: Vec<_> = fs::read_dir(project.path().join("audit")).unwrap().flatten().collect();
    assert_eq!(logs.len(), 1);
    let name = logs[0].file_name().to_string_lossy().into_owned();
    assert!(name.starts_with("security_audit_") && name.ends_with(".log"), "{name}");
}

#[test]
fn test_invalid_config_warns() {
    let project = Project::new("[server]\ntimeout_secs = 0\n");

    project
        .command()
        .args(["models", "path"])
        .assert()
        .success()
        .stderr(predicate::str::contains("server.timeout_secs"));
}

//! TTL cleanup of the upload directory.

use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, error, info};

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub failed: usize,
}

/// Deletes regular files in `dir` whose modification time is older than `ttl`.
///
/// A missing directory is a no-op. Failures on single files are logged and
/// counted; the sweep always visits every entry.
pub fn remove_old_files(dir: &Path, ttl: Duration) -> SweepReport {
    remove_old_files_at(dir, ttl, SystemTime::now())
}

fn remove_old_files_at(dir: &Path, ttl: Duration, now: SystemTime) -> SweepReport {
    let mut report = SweepReport::default();
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            debug!("Skipping cleanup of {}: {e}", dir.display());
            return report;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        match expired(&path, ttl, now) {
            Ok(false) => {}
            Ok(true) => match fs::remove_file(&path) {
                Ok(()) => {
                    report.removed += 1;
                    info!("Removed expired file {}", path.display());
                }
                Err(e) => {
                    report.failed += 1;
                    error!("Failed to remove {}: {e}", path.display());
                }
            },
            Err(e) => {
                report.failed += 1;
                error!("Failed to inspect {}: {e}", path.display());
            }
        }
    }

    if report.removed > 0 {
        info!("Cleanup: {} file(s) removed from {}", report.removed, dir.display());
    }
    report
}

fn expired(path: &Path, ttl: Duration, now: SystemTime) -> std::io::Result<bool> {
    let meta = fs::metadata(path)?;
    if !meta.is_file() {
        return Ok(false);
    }
    // Files stamped in the future have age zero.
    let age = now.duration_since(meta.modified()?).unwrap_or_default();
    Ok(age > ttl)
}

/// Sweeps `dir` every `interval` until `shutdown` resolves.
///
/// The first sweep runs immediately. Sweeps run on the blocking pool.
pub async fn run_cleanup_loop<F>(dir: PathBuf, ttl: Duration, interval: Duration, shutdown: F)
where
    F: Future<Output = ()> + Send,
{
    info!(
        "Cleanup service started for {} (ttl {}s, every {}s)",
        dir.display(),
        ttl.as_secs(),
        interval.as_secs()
    );
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            _ = ticker.tick() => {
                let dir = dir.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || remove_old_files(&dir, ttl)).await {
                    error!("Cleanup sweep panicked: {e}");
                }
            }
        }
    }
    info!("Cleanup service stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::fs::File;

    fn age_file(path: &Path, age: Duration) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[test]
    fn test_removes_only_expired_files() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.png");
        let fresh = dir.path().join("fresh.png");
        fs::write(&old, b"x").unwrap();
        fs::write(&fresh, b"x").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        age_file(&old, Duration::from_secs(3600));

        let report = remove_old_files(dir.path(), Duration::from_secs(600));
        assert_eq!(report, SweepReport { removed: 1, failed: 0 });
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(dir.path().join("sub").exists());
    }

    #[test]
    fn test_missing_directory_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let report = remove_old_files(&dir.path().join("nope"), Duration::ZERO);
        assert_eq!(report, SweepReport::default());
    }

    #[test]
    fn test_future_mtime_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clock_skew.png");
        fs::write(&path, b"x").unwrap();
        let past = SystemTime::now() - Duration::from_secs(3600);
        let report = remove_old_files_at(dir.path(), Duration::from_secs(60), past);
        assert_eq!(report.removed, 0);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_loop_sweeps_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.jpg");
        fs::write(&old, b"x").unwrap();
        age_file(&old, Duration::from_secs(120));

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(run_cleanup_loop(
            dir.path().to_path_buf(),
            Duration::from_secs(60),
            Duration::from_millis(10),
            async move {
                let _ = rx.await;
            },
        ));

        for _ in 0..200 {
            if !old.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!old.exists());
        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}

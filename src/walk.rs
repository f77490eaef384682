use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, warn};
use walkdir::WalkDir;

use crate::process::{FileProcessor, Outcome, ProcessError};

/// Counts reported at the end of a run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Feed candidate files from `directory` to the processor, one at a time.
///
/// A single file's failure is logged and never aborts the run. The stop flag
/// is checked between files only, so an interrupt lets the in-flight file
/// reach a terminal state instead of abandoning a half-finished swap.
pub async fn run(
    processor: &mut FileProcessor,
    directory: &Path,
    recursive: bool,
    stop: Arc<AtomicBool>,
) -> Result<RunSummary> {
    let directory = directory
        .canonicalize()
        .with_context(|| format!("Target directory does not exist: {}", directory.display()))?;
    anyhow::ensure!(
        directory.is_dir(),
        "Target is not a directory: {}",
        directory.display()
    );

    let mut walker = WalkDir::new(&directory).min_depth(1);
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut summary = RunSummary::default();
    for entry in walker {
        if stop.load(Ordering::Relaxed) {
            warn!("Stop requested; not feeding further files");
            break;
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Failed to read directory entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        match processor.process(entry.path()).await {
            Ok(Outcome::Processed(_)) => summary.processed += 1,
            Ok(Outcome::Skipped(_)) => summary.skipped += 1,
            Ok(Outcome::Ignored) => {}
            Err(e) => {
                summary.failed += 1;
                // Pre-swap failures restore the tree; a swap failure may
                // not have, so it gets a louder record.
                let severe = matches!(e, ProcessError::Swap { .. });
                let err = anyhow::Error::from(e);
                if severe {
                    error!(
                        "{}: {:#} (filesystem and ledger may be inconsistent)",
                        entry.path().display(),
                        err
                    );
                } else {
                    error!("{}: {:#}", entry.path().display(), err);
                }
            }
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use crate::patch_tool::PatchTool;
    use crate::process::ProcessorConfig;
    use crate::remux::RemuxSettings;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::time::Duration;

    fn fake_remuxer(dir: &Path) -> PathBuf {
        let path = dir.join("fake-ffmpeg");
        fs::write(
            &path,
            r#"#!/bin/sh
in=""
grab=0
for a in "$@"; do
  if [ "$grab" = 1 ]; then in="$a"; grab=0; fi
  if [ "$a" = "-i" ]; then grab=1; fi
  out="$a"
done
cp "$in" "$out"
printf remuxed >> "$out"
"#,
        )
        .unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn processor(tools_dir: &Path, ledger_path: &Path) -> FileProcessor {
        let config = ProcessorConfig {
            remux: RemuxSettings {
                program: fake_remuxer(tools_dir),
                timeout: Duration::from_secs(30),
            },
            ..Default::default()
        };
        FileProcessor::new(config, PatchTool::Diff, Ledger::load(ledger_path))
    }

    #[tokio::test]
    async fn only_movie_extensions_are_attempted() {
        let tools = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in [
            ("a.mp4", b"aaaa".as_slice()),
            ("b.txt", b"bbbb".as_slice()),
            ("c.mkv", b"cccc".as_slice()),
            ("d.mov", b"dddd".as_slice()),
        ] {
            fs::write(dir.path().join(name), content).unwrap();
        }

        let ledger_path = tools.path().join("ledger.json");
        let mut p = processor(tools.path(), &ledger_path);
        let summary = run(&mut p, dir.path(), false, Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();

        assert_eq!(summary.processed, 3);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.failed, 0);
        // The text file was ignored entirely: untouched, no ledger entry.
        assert_eq!(fs::read(dir.path().join("b.txt")).unwrap(), b"bbbb");
        assert_eq!(p.ledger().len(), 3);
    }

    #[tokio::test]
    async fn rerun_is_idempotent() {
        let tools = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.mp4"), b"aaaa").unwrap();
        fs::write(dir.path().join("c.mkv"), b"cccc").unwrap();
        let ledger_path = tools.path().join("ledger.json");

        let mut p = processor(tools.path(), &ledger_path);
        let first = run(&mut p, dir.path(), false, Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        assert_eq!(first.processed, 2);

        let contents: Vec<_> = ["a.mp4", "c.mkv"]
            .iter()
            .map(|n| fs::read(dir.path().join(n)).unwrap())
            .collect();

        let mut p = processor(tools.path(), &ledger_path);
        let second = run(&mut p, dir.path(), false, Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        assert_eq!(second.processed, 0);
        assert_eq!(second.skipped, 2);

        for (name, before) in ["a.mp4", "c.mkv"].iter().zip(contents) {
            assert_eq!(fs::read(dir.path().join(name)).unwrap(), before);
        }
    }

    #[tokio::test]
    async fn recursion_is_opt_in() {
        let tools = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("top.mp4"), b"top").unwrap();
        fs::write(dir.path().join("sub/nested.mp4"), b"nested").unwrap();

        let mut p = processor(tools.path(), &tools.path().join("flat.json"));
        let flat = run(&mut p, dir.path(), false, Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        assert_eq!(flat.processed, 1);
        assert_eq!(fs::read(dir.path().join("sub/nested.mp4")).unwrap(), b"nested");

        let mut p = processor(tools.path(), &tools.path().join("deep.json"));
        let deep = run(&mut p, dir.path(), true, Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        // top.mp4 is already remuxed content but has no entry in this
        // second ledger, so it is processed again along with the nested one.
        assert_eq!(deep.processed, 2);
    }

    #[tokio::test]
    async fn per_file_failures_do_not_abort_the_run() {
        let tools = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        // Identical-output remux makes every diff empty, so each file fails
        // at the patch stage; the run itself must still complete.
        let identity = tools.path().join("identity-ffmpeg");
        fs::write(
            &identity,
            r#"#!/bin/sh
in=""
grab=0
for a in "$@"; do
  if [ "$grab" = 1 ]; then in="$a"; grab=0; fi
  if [ "$a" = "-i" ]; then grab=1; fi
  out="$a"
done
cp "$in" "$out"
"#,
        )
        .unwrap();
        fs::set_permissions(&identity, fs::Permissions::from_mode(0o755)).unwrap();

        fs::write(dir.path().join("a.mp4"), b"aaaa").unwrap();
        fs::write(dir.path().join("b.mkv"), b"bbbb").unwrap();

        let config = ProcessorConfig {
            remux: RemuxSettings {
                program: identity,
                timeout: Duration::from_secs(30),
            },
            ..Default::default()
        };
        let mut p = FileProcessor::new(
            config,
            PatchTool::Diff,
            Ledger::load(&tools.path().join("ledger.json")),
        );
        let summary = run(&mut p, dir.path(), false, Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();

        assert_eq!(summary.failed, 2);
        assert_eq!(summary.processed, 0);
        assert_eq!(fs::read(dir.path().join("a.mp4")).unwrap(), b"aaaa");
        assert_eq!(fs::read(dir.path().join("b.mkv")).unwrap(), b"bbbb");
    }

    #[tokio::test]
    async fn missing_directory_is_fatal() {
        let tools = tempfile::tempdir().unwrap();
        let mut p = processor(tools.path(), &tools.path().join("ledger.json"));
        let missing = tools.path().join("no-such-dir");
        assert!(run(&mut p, &missing, false, Arc::new(AtomicBool::new(false)))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn stop_flag_prevents_new_files() {
        let tools = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.mp4"), b"aaaa").unwrap();

        let mut p = processor(tools.path(), &tools.path().join("ledger.json"));
        let summary = run(&mut p, dir.path(), false, Arc::new(AtomicBool::new(true)))
            .await
            .unwrap();
        assert_eq!(summary, RunSummary::default());
        assert_eq!(fs::read(dir.path().join("a.mp4")).unwrap(), b"aaaa");
    }
}

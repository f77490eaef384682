use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use chrono::Utc;
use thiserror::Error;
use tokio::process::Command;
use tracing::info;

use crate::attrs::{AttrError, AttributeSnapshot};
use crate::patch_tool::PatchTool;

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("failed to stat {path}: {source}")]
    Snapshot { path: PathBuf, source: io::Error },

    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: &'static str,
        source: io::Error,
    },

    #[error("{tool} exited with {status}")]
    ToolFailed {
        tool: &'static str,
        status: ExitStatus,
    },

    #[error("{tool} produced no output; identical inputs cannot yield a reversible patch")]
    EmptyPatch { tool: &'static str },

    #[error("patch file {path} is missing or empty after generation")]
    Verification { path: PathBuf },

    #[error("failed to write patch file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Attr(#[from] AttrError),
}

/// Generate a reversible patch recording the transformation from `original`
/// to `transformed`.
///
/// The patch lands next to the original, named
/// `<original>.<unix_seconds><ext>` where the extension depends on the tool.
/// On success the patch carries the original file's ownership and read/write
/// permission bits. Nothing here touches the original, so any failure leaves
/// the filesystem in its pre-processing state; a half-written patch file is
/// removed before the error is returned.
pub async fn generate(
    original: &Path,
    transformed: &Path,
    tool: PatchTool,
) -> Result<PathBuf, PatchError> {
    // Captured before any tool runs, and applied to the patch on success.
    let snapshot =
        AttributeSnapshot::capture(original).map_err(|source| PatchError::Snapshot {
            path: original.to_path_buf(),
            source,
        })?;

    let patch_path = patch_name(original, tool);

    let result = run_tool(original, transformed, &patch_path, tool).await;
    if let Err(e) = result {
        discard(&patch_path);
        return Err(e);
    }

    // The tool reported success; the artifact must still exist and carry
    // actual bytes before we rely on it for reversal.
    let verified = fs::metadata(&patch_path)
        .map(|m| m.len() > 0)
        .unwrap_or(false);
    if !verified {
        discard(&patch_path);
        return Err(PatchError::Verification { path: patch_path });
    }

    if let Err(e) = snapshot.apply(&patch_path) {
        discard(&patch_path);
        return Err(e.into());
    }

    info!("Generated patch file: {}", patch_path.display());
    Ok(patch_path)
}

async fn run_tool(
    original: &Path,
    transformed: &Path,
    patch_path: &Path,
    tool: PatchTool,
) -> Result<(), PatchError> {
    let program = tool.program();
    match tool {
        PatchTool::Bsdiff => {
            let status = Command::new(program)
                .args([original, transformed, patch_path])
                .stdin(Stdio::null())
                .status()
                .await
                .map_err(|source| PatchError::Spawn {
                    tool: program,
                    source,
                })?;
            if !status.success() {
                return Err(PatchError::ToolFailed {
                    tool: program,
                    status,
                });
            }
            Ok(())
        }
        PatchTool::Xdelta3 => {
            let status = Command::new(program)
                .args(["-e", "-f", "-s"])
                .args([original, transformed, patch_path])
                .stdin(Stdio::null())
                .status()
                .await
                .map_err(|source| PatchError::Spawn {
                    tool: program,
                    source,
                })?;
            if !status.success() {
                return Err(PatchError::ToolFailed {
                    tool: program,
                    status,
                });
            }
            Ok(())
        }
        PatchTool::Diff => {
            // diff writes the patch on stdout; stream it straight into the
            // patch file instead of buffering output that scales with the
            // size of the movie.
            let file = fs::File::create(patch_path).map_err(|source| PatchError::Write {
                path: patch_path.to_path_buf(),
                source,
            })?;
            let status = Command::new(program)
                .arg("--binary")
                .args([original, transformed])
                .stdin(Stdio::null())
                .stdout(Stdio::from(file))
                .status()
                .await
                .map_err(|source| PatchError::Spawn {
                    tool: program,
                    source,
                })?;
            // Exit 0 means identical, 1 means differences, anything above
            // is a tool error.
            match status.code() {
                Some(0) | Some(1) => {}
                _ => {
                    return Err(PatchError::ToolFailed {
                        tool: program,
                        status,
                    });
                }
            }
            // An empty diff cannot reverse anything; distinguish "no
            // differences" from "patch missing" before claiming success.
            let len = fs::metadata(patch_path).map(|m| m.len()).unwrap_or(0);
            if len == 0 {
                return Err(PatchError::EmptyPatch { tool: program });
            }
            Ok(())
        }
    }
}

/// `<original>.<unix_seconds><ext>`, alongside the original. Two runs in the
/// same second could collide only when re-processing the same path, which
/// the ledger prevents.
fn patch_name(original: &Path, tool: PatchTool) -> PathBuf {
    let mut name: OsString = original.as_os_str().to_os_string();
    name.push(format!(".{}{}", Utc::now().timestamp(), tool.extension()));
    PathBuf::from(name)
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    #[tokio::test]
    async fn diff_patch_is_generated_and_stamped() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("movie.mp4");
        let transformed = dir.path().join("movie.patched.mp4");
        fs::write(&original, b"original bytes\n").unwrap();
        fs::write(&transformed, b"transformed bytes\n").unwrap();
        fs::set_permissions(&original, fs::Permissions::from_mode(0o640)).unwrap();

        let patch = generate(&original, &transformed, PatchTool::Diff)
            .await
            .unwrap();

        assert!(patch.exists());
        let meta = fs::metadata(&patch).unwrap();
        assert!(meta.len() > 0);
        assert_eq!(meta.mode() & 0o777, 0o640);

        // The tool's stdout ended up in the patch file.
        let body = fs::read_to_string(&patch).unwrap();
        assert!(body.contains("original bytes"));
        assert!(body.contains("transformed bytes"));

        let name = patch.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("movie.mp4."));
        assert!(name.ends_with(".diff"));
    }

    #[tokio::test]
    async fn identical_inputs_are_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("movie.mp4");
        let transformed = dir.path().join("movie.patched.mp4");
        fs::write(&original, b"same bytes\n").unwrap();
        fs::write(&transformed, b"same bytes\n").unwrap();

        let err = generate(&original, &transformed, PatchTool::Diff)
            .await
            .unwrap_err();
        assert!(matches!(err, PatchError::EmptyPatch { .. }));

        // No half-written artifact left behind.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .ends_with(PatchTool::Diff.extension())
            })
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn missing_original_fails_before_any_tool_runs() {
        let dir = tempfile::tempdir().unwrap();
        let err = generate(
            &dir.path().join("gone.mp4"),
            &dir.path().join("gone.patched.mp4"),
            PatchTool::Diff,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PatchError::Snapshot { .. }));
    }
}

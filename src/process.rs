use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info};

use crate::attrs::{AttrError, AttributeSnapshot};
use crate::ledger::{FileRecord, Ledger, LedgerError};
use crate::patch_gen::{self, PatchError};
use crate::patch_tool::PatchTool;
use crate::remux::{self, RemuxSettings, TransformError};

/// File extensions accepted for processing, compared case-insensitively.
pub const MOVIE_EXTENSIONS: [&str; 4] = ["mp4", "mkv", "avi", "mov"];

/// Per-file options shared across the run.
#[derive(Debug, Clone, Default)]
pub struct ProcessorConfig {
    /// Only files owned by this group id are processed when set.
    pub target_gid: Option<u32>,
    /// Process files even when the ledger already lists them.
    pub force: bool,
    pub remux: RemuxSettings,
}

/// Terminal state of one file.
#[derive(Debug)]
pub enum Outcome {
    /// Transformed, patched, swapped and recorded.
    Processed(FileRecord),
    /// Deliberately not processed; logged.
    Skipped(SkipReason),
    /// Not a movie file; silently ignored.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyProcessed,
    GroupMismatch { actual: u32, expected: u32 },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::AlreadyProcessed => write!(f, "already processed"),
            SkipReason::GroupMismatch { actual, expected } => {
                write!(f, "gid {actual} does not match target {expected}")
            }
        }
    }
}

/// What went wrong during the swap, after the patch already existed. The
/// original file sits at its aside path until the ledger write succeeds, so
/// every variant here is recoverable by hand even when automatic rollback is
/// impossible.
#[derive(Error, Debug)]
pub enum SwapFailure {
    #[error("renaming original aside: {0}")]
    SetAside(io::Error),

    #[error("moving transformed file into place: {0}")]
    MoveIn(io::Error),

    #[error("restoring attributes: {0}")]
    Attr(#[from] AttrError),

    #[error("persisting ledger: {0}")]
    Ledger(#[from] LedgerError),
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to stat {path}: {source}")]
    Stat { path: PathBuf, source: io::Error },

    #[error("transform failed: {0}")]
    Transform(#[from] TransformError),

    #[error("patch generation failed: {0}")]
    Patch(#[from] PatchError),

    #[error("swap failed for {path}: {source}")]
    Swap {
        path: PathBuf,
        #[source]
        source: SwapFailure,
    },
}

/// Drives one file at a time through eligibility checks, the external
/// re-mux, patch generation, the swap and the ledger write.
///
/// Any failure before the swap leaves the filesystem untouched; the swap
/// itself keeps the original at an aside path until the ledger write
/// succeeds, then removes it.
#[derive(Debug)]
pub struct FileProcessor {
    config: ProcessorConfig,
    tool: PatchTool,
    ledger: Ledger,
}

impl FileProcessor {
    pub fn new(config: ProcessorConfig, tool: PatchTool, ledger: Ledger) -> Self {
        Self {
            config,
            tool,
            ledger,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Process a single candidate file to a terminal state.
    pub async fn process(&mut self, path: &Path) -> Result<Outcome, ProcessError> {
        if !has_movie_extension(path) {
            return Ok(Outcome::Ignored);
        }

        // Ledger keys are absolute paths; resolve before the lookup so the
        // same file reached through different spellings still skips.
        let path = path.canonicalize().map_err(|source| ProcessError::Stat {
            path: path.to_path_buf(),
            source,
        })?;

        if !self.config.force && self.ledger.contains(&path) {
            let reason = SkipReason::AlreadyProcessed;
            info!("Skipping {}: {}", path.display(), reason);
            return Ok(Outcome::Skipped(reason));
        }

        let snapshot =
            AttributeSnapshot::capture(&path).map_err(|source| ProcessError::Stat {
                path: path.clone(),
                source,
            })?;

        if let Some(expected) = self.config.target_gid {
            if snapshot.gid != expected {
                let reason = SkipReason::GroupMismatch {
                    actual: snapshot.gid,
                    expected,
                };
                info!("Skipping {}: {}", path.display(), reason);
                return Ok(Outcome::Skipped(reason));
            }
        }

        info!("Starting processing of: {}", path.display());

        let transformed = transformed_name(&path);
        if let Err(e) = remux::remux(&self.config.remux, &path, &transformed).await {
            discard(&transformed);
            return Err(e.into());
        }

        // The patch must exist before the original is touched, so a failure
        // from here back still leaves the tree exactly as it was.
        let patch_path = match patch_gen::generate(&path, &transformed, self.tool).await {
            Ok(p) => p,
            Err(e) => {
                discard(&transformed);
                return Err(e.into());
            }
        };

        let record = FileRecord {
            original_path: path.display().to_string(),
            patch_path: patch_path.display().to_string(),
            patch_tool: self.tool,
            processed_at: Utc::now(),
        };
        self.swap_and_record(&path, &transformed, &patch_path, &snapshot, record.clone())
            .map_err(|source| ProcessError::Swap {
                path: path.clone(),
                source,
            })?;

        info!("Successfully processed and replaced: {}", path.display());
        Ok(Outcome::Processed(record))
    }

    /// Three-step swap: the original is renamed aside, the transformed file
    /// renamed into place, and the aside copy deleted only after the ledger
    /// write succeeds. A crash at any point leaves either the original or
    /// its aside copy on disk.
    fn swap_and_record(
        &mut self,
        path: &Path,
        transformed: &Path,
        patch_path: &Path,
        snapshot: &AttributeSnapshot,
        record: FileRecord,
    ) -> Result<(), SwapFailure> {
        let aside = aside_name(path);

        if let Err(e) = fs::rename(path, &aside) {
            discard(transformed);
            discard(patch_path);
            return Err(SwapFailure::SetAside(e));
        }

        if let Err(e) = fs::rename(transformed, path) {
            let _ = fs::rename(&aside, path);
            discard(transformed);
            discard(patch_path);
            return Err(SwapFailure::MoveIn(e));
        }

        if let Err(e) = snapshot.apply(path) {
            // Undo the swap so the original keeps its exact content and
            // attributes.
            discard(path);
            let _ = fs::rename(&aside, path);
            discard(patch_path);
            return Err(e.into());
        }

        if let Err(e) = self.ledger.record(record) {
            // The swap already happened but the run's bookkeeping did not.
            // Keep the swapped file, the patch and the aside copy so the
            // operator can reconcile; this is the one failure that leaves
            // extra state behind.
            error!(
                "Ledger write failed after swapping {}; original retained at {}",
                path.display(),
                aside.display()
            );
            return Err(e.into());
        }

        discard(&aside);
        Ok(())
    }
}

pub fn has_movie_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            MOVIE_EXTENSIONS.iter().any(|m| *m == e)
        })
        .unwrap_or(false)
}

/// `movie.mp4` → `movie.patched.mp4`, in the same directory.
fn transformed_name(path: &Path) -> PathBuf {
    let mut name: OsString = path.file_stem().map(|s| s.to_os_string()).unwrap_or_default();
    name.push(".patched");
    if let Some(ext) = path.extension() {
        name.push(".");
        name.push(ext);
    }
    path.with_file_name(name)
}

/// `movie.mp4` → `movie.mp4.orig`, holding the original during the swap.
fn aside_name(path: &Path) -> PathBuf {
    let mut name: OsString = path.file_name().map(|s| s.to_os_string()).unwrap_or_default();
    name.push(".orig");
    path.with_file_name(name)
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

use std::ffi::OsStr;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
#[error("no patch tool available: none of bsdiff, xdelta3, diff found on the search path")]
pub struct NoPatchToolAvailable;

/// External tool used to produce reversible patches.
///
/// Selected once at startup and reused for the whole run. Binary-diff tools
/// are preferred over line-oriented `diff` for robustness against binary
/// content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchTool {
    Bsdiff,
    Xdelta3,
    Diff,
}

impl PatchTool {
    /// Probe order: bsdiff > xdelta3 > diff.
    pub const PRIORITY: [PatchTool; 3] = [PatchTool::Bsdiff, PatchTool::Xdelta3, PatchTool::Diff];

    /// Executable name on the search path.
    pub fn program(self) -> &'static str {
        match self {
            PatchTool::Bsdiff => "bsdiff",
            PatchTool::Xdelta3 => "xdelta3",
            PatchTool::Diff => "diff",
        }
    }

    /// Extension (including the dot) appended to patch artifact names.
    pub fn extension(self) -> &'static str {
        match self {
            PatchTool::Bsdiff | PatchTool::Xdelta3 => ".patch",
            PatchTool::Diff => ".diff",
        }
    }

    /// Select the highest-priority tool resolvable on the process search path.
    pub fn select() -> Result<PatchTool, NoPatchToolAvailable> {
        for tool in Self::PRIORITY {
            if which::which(tool.program()).is_ok() {
                info!("Using {} for patch generation", tool);
                return Ok(tool);
            }
        }
        Err(NoPatchToolAvailable)
    }

    /// Select using an explicit search path instead of the process environment.
    pub fn select_in<P: AsRef<OsStr>>(paths: P) -> Result<PatchTool, NoPatchToolAvailable> {
        for tool in Self::PRIORITY {
            if which::which_in(tool.program(), Some(paths.as_ref()), ".").is_ok() {
                info!("Using {} for patch generation", tool);
                return Ok(tool);
            }
        }
        Err(NoPatchToolAvailable)
    }
}

impl fmt::Display for PatchTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

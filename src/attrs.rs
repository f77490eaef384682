use std::fs;
use std::io;
use std::os::unix::fs::{chown, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// Read/write bits for owner, group and other. Execute and special bits are
/// deliberately dropped when attributes are restored.
pub const RW_MASK: u32 = 0o666;

#[derive(Error, Debug)]
pub enum AttrError {
    #[error("permission denied setting attributes on {path}: {source}")]
    PermissionDenied { path: PathBuf, source: io::Error },

    #[error("failed to set attributes on {path}: {source}")]
    Os { path: PathBuf, source: io::Error },
}

/// Ownership and permission bits captured from a file before it is mutated,
/// so they can be reapplied to whatever replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeSnapshot {
    pub uid: u32,
    pub gid: u32,
    /// Permission bits, already masked down to [`RW_MASK`].
    pub mode: u32,
}

impl AttributeSnapshot {
    /// Capture ownership and read/write permission bits from `path`.
    pub fn capture(path: &Path) -> io::Result<Self> {
        let meta = fs::metadata(path)?;
        Ok(Self {
            uid: meta.uid(),
            gid: meta.gid(),
            mode: meta.mode() & RW_MASK,
        })
    }

    /// Apply the captured ownership and permission bits to `path`.
    ///
    /// Permission errors propagate: silently mismatched ownership would
    /// violate the preservation contract, so the caller must see them.
    pub fn apply(&self, path: &Path) -> Result<(), AttrError> {
        chown(path, Some(self.uid), Some(self.gid)).map_err(|e| classify(path, e))?;
        fs::set_permissions(path, fs::Permissions::from_mode(self.mode))
            .map_err(|e| classify(path, e))?;
        debug!(
            "Set attributes on {}: uid={}, gid={}, mode={:o}",
            path.display(),
            self.uid,
            self.gid,
            self.mode
        );
        Ok(())
    }
}

fn classify(path: &Path, source: io::Error) -> AttrError {
    if source.kind() == io::ErrorKind::PermissionDenied {
        AttrError::PermissionDenied {
            path: path.to_path_buf(),
            source,
        }
    } else {
        AttrError::Os {
            path: path.to_path_buf(),
            source,
        }
    }
}

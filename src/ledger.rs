use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::patch_tool::PatchTool;

/// Ledger entry for one successfully processed file.
///
/// Presence of a record means the content at `original_path` was, at
/// `processed_at`, the re-muxed version, and that `patch_path` holds a patch
/// which reverses it back to the pre-processing bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRecord {
    pub original_path: String,
    pub patch_path: String,
    pub patch_tool: PatchTool,
    pub processed_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("failed to serialize ledger: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write ledger to {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// Durable record of processed files, keyed by absolute path.
///
/// The backing store is a single human-inspectable JSON document. Every
/// insert rewrites the whole file synchronously; throughput does not matter
/// here because one external re-mux invocation dominates each entry, and the
/// ledger must reflect a file's success before that file counts as done.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    entries: BTreeMap<String, FileRecord>,
}

impl Ledger {
    /// Load the ledger from `path`.
    ///
    /// Fails soft: a missing or corrupted backing file yields an empty
    /// ledger. Corruption is logged but never aborts startup.
    pub fn load(path: &Path) -> Self {
        let entries = match fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    error!(
                        "Ledger at {} is corrupted, starting empty: {}",
                        path.display(),
                        e
                    );
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No ledger at {}, starting empty", path.display());
                BTreeMap::new()
            }
            Err(e) => {
                error!(
                    "Failed to read ledger at {}, starting empty: {}",
                    path.display(),
                    e
                );
                BTreeMap::new()
            }
        };
        Self {
            path: path.to_path_buf(),
            entries,
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(&path.display().to_string())
    }

    pub fn get(&self, path: &Path) -> Option<&FileRecord> {
        self.entries.get(&path.display().to_string())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a record and immediately persist the whole ledger.
    ///
    /// The write goes to a sibling temporary file which is fsynced and then
    /// renamed over the ledger path, so a crash mid-write cannot corrupt the
    /// previous contents.
    pub fn record(&mut self, record: FileRecord) -> Result<(), LedgerError> {
        self.entries.insert(record.original_path.clone(), record);
        self.persist()
    }

    fn persist(&self) -> Result<(), LedgerError> {
        let encoded = serde_json::to_string_pretty(&self.entries)?;

        let tmp = tmp_name(&self.path);
        let write = |tmp: &Path| -> io::Result<()> {
            let mut file = fs::File::create(tmp)?;
            file.write_all(encoded.as_bytes())?;
            file.sync_all()?;
            fs::rename(tmp, &self.path)
        };
        write(&tmp).map_err(|source| LedgerError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

fn tmp_name(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

//! Batch re-muxing of movie files for fast seeking.
//!
//! For each eligible file in a directory tree, `moviefix` runs ffmpeg in
//! stream-copy mode to rewrite the container with a fast-start layout,
//! records a reversible binary patch capturing the exact byte-level change,
//! swaps the processed file into place while preserving its ownership and
//! read/write permission bits, and records the file in a durable JSON ledger
//! so reruns skip already-handled files.
//!
//! Patches are produced by the first available of `bsdiff`, `xdelta3` and
//! `diff`, and are generated before the original file is touched, so any
//! failure up to the final swap leaves the filesystem exactly as it was.

pub mod attrs;
pub mod ledger;
pub mod patch_gen;
pub mod patch_tool;
pub mod process;
pub mod remux;
pub mod walk;

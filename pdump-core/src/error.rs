//! Error kinds and the ambient error stack.
//!
//! `PdumpError` is the internal, richly-typed failure surface the writer
//! and loader build up while they work; `LoadStatus` is the coarser,
//! caller-facing status `load()` returns.

use std::path::PathBuf;

use thiserror::Error;

/// Writer and loader failures, with enough structure to render a useful
/// diagnostic (a root-to-object path for `UnsupportedObject`, the
/// offending offset for integrity violations).
#[derive(Debug, Error)]
pub enum PdumpError {
    /// An object of a type the writer cannot serialize: frames, processes
    /// outside the whitelist, oversized fonts, overlays anchored in a
    /// non-empty buffer-overlay tree.
    #[error("unsupported object type in dump: {type_name}{}", referrer_path.as_ref().map(|p| format!("\n{p}")).unwrap_or_default())]
    UnsupportedObject {
        type_name: String,
        /// Root-to-object path, rendered only when `track_referrers` was
        /// requested.
        referrer_path: Option<String>,
    },

    /// An assertion that would indicate a writer bug: misaligned offset,
    /// fixup out of range, relocation length overflow, duplicate-offset
    /// relocation, use of the buffer outside an object, etc.
    #[error("dump writer integrity violation: {what}")]
    IntegrityViolation { what: String },

    /// Failure to open or write the output file. The partially-written
    /// file is left with its magic byte inverted and is unloadable.
    #[error("I/O failure writing dump {path}: {source}")]
    IoFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Caller-visible result of [`crate::loader::load`].
///
/// Deliberately does not carry the full `PdumpError` payload: a failed
/// load must never partially initialize process state, so the status is
/// a closed set the caller can match exhaustively.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LoadStatus {
    #[error("dump file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("not a dump file (bad magic): {0}")]
    BadFileType(PathBuf),

    #[error("dump was produced by a different binary (fingerprint mismatch)")]
    VersionMismatch,

    #[error("dump file is incomplete (writer never finalized it)")]
    FailedDump,

    #[error("out of memory mapping dump")]
    Oom,

    #[error("dump too large or too small to be valid")]
    Malformed,

    #[error("i/o error loading dump: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for LoadStatus {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            // Caller fills in the path where it has it; this conversion
            // exists for `?`-propagation sites that don't.
            LoadStatus::Io(e)
        } else {
            LoadStatus::Io(e)
        }
    }
}

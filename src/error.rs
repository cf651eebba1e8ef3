// swifota/src/error.rs

use std::io;

use thiserror::Error;

/// Result kinds surfaced by every public operation of the crate.
///
/// The variants mirror the numeric result codes of the original platform
/// adaptor API one-to-one, so callers can map them back onto a small
/// integer taxonomy if they need to.
#[derive(Debug, Error)]
pub enum Error {
    #[error("bad parameter: {0}")]
    BadParameter(&'static str),

    #[error("fault: {0}")]
    Fault(&'static str),

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("out of range: {0}")]
    OutOfRange(&'static str),

    /// A logical erase block with no physical block behind it.
    #[error("not permitted: {0}")]
    NotPermitted(&'static str),

    /// Flash I/O failed; the affected block is suspect.
    #[error("flash i/o error")]
    Io(#[from] io::Error),

    /// An on-flash structure is missing or invalid.
    #[error("format error: {0}")]
    Format(&'static str),

    #[error("busy: {0}")]
    Busy(&'static str),

    #[error("duplicate: {0}")]
    Duplicate(&'static str),

    #[error("out of memory: {0}")]
    NoMemory(&'static str),

    #[error("not found: {0}")]
    NotFound(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True when the error reveals a suspect flash block that the caller
    /// may retry once on a fresh mapping.
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}

/// Coarse state of an update session, mirrored as a diagnostic label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    Idle,
    DownloadInProgress,
    DownloadComplete,
    DownloadFailed,
    DownloadTimeout,
    /// Recovery scan found nothing to resume.
    NoBadImageFound,
}

impl UpdateStatus {
    pub fn label(&self) -> &'static str {
        match self {
            UpdateStatus::Idle => "Ready",
            UpdateStatus::DownloadInProgress => "Download in progress",
            UpdateStatus::DownloadComplete => "Download complete",
            UpdateStatus::DownloadFailed => "Download failed",
            UpdateStatus::DownloadTimeout => "Download timeout",
            UpdateStatus::NoBadImageFound => "No bad image found",
        }
    }
}

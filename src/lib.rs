// swifota/src/lib.rs
//
// Streaming CWE firmware-update engine for raw NAND modems: a flash
// abstraction with bad-block handling, a UBI container engine (including
// containers at arbitrary byte offsets), a CWE package parser, the
// staging-partition writer, delta-patch application and a durable resume
// context.

pub use crate::cwe::{CweHeader, ImageType};
pub use crate::engine::{UbiVolumeSpec, UpdateEngine};
pub use crate::error::{Error, Result, UpdateStatus};
pub use crate::flash::{
    EccStats, FileNand, FlashBackend, FlashDevice, FlashGeometry, OpenFlags, SimNand,
};
pub use crate::partition::{PartitionTable, SWIFOTA_PARTITION};
pub use crate::resume::{ResumeCtx, ResumeStore};
pub use crate::ubi::{UbiVolumeInfo, VolType};
pub use crate::writer::PartitionWriter;

pub mod cwe;
pub mod delta;
pub mod engine;
pub mod error;
pub mod flash;
pub mod partition;
pub mod resume;
pub mod ubi;
mod utils;
pub mod writer;

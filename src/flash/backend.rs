// swifota/src/flash/backend.rs

use crate::error::{Error, Result};

/// Geometry of a raw NAND partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashGeometry {
    /// Total partition size in bytes.
    pub size: u64,
    /// NAND page size; every program operation must be a multiple of this.
    pub write_size: u32,
    /// Physical erase block size.
    pub erase_size: u32,
    /// Number of physical erase blocks in the partition.
    pub nb_blk: u32,
}

impl FlashGeometry {
    pub fn new(write_size: u32, erase_size: u32, nb_blk: u32) -> Self {
        FlashGeometry {
            size: erase_size as u64 * nb_blk as u64,
            write_size,
            erase_size,
            nb_blk,
        }
    }

    /// Pages per erase block.
    pub fn pages_per_blk(&self) -> u32 {
        self.erase_size / self.write_size
    }

    /// Checks the invariants every backend must provide: `size = nb_blk *
    /// erase_size` and `write_size` dividing `erase_size`.
    pub fn validate(&self) -> Result<()> {
        if self.write_size == 0 || self.erase_size == 0 || self.nb_blk == 0 {
            return Err(Error::BadParameter("zero flash geometry field"));
        }
        if self.erase_size % self.write_size != 0 {
            return Err(Error::BadParameter("write size does not divide erase size"));
        }
        if self.size != self.erase_size as u64 * self.nb_blk as u64 {
            return Err(Error::BadParameter("partition size is not a whole number of blocks"));
        }
        Ok(())
    }
}

/// ECC counters as reported by the flash driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EccStats {
    pub corrected: u32,
    pub failed: u32,
    pub bad_blocks: u32,
}

/// Raw access to one NAND partition.
///
/// The production system talks to an MTD character device; tests drive the
/// deterministic in-memory [`crate::flash::SimNand`]. Offsets are absolute
/// bytes within the partition; `program_at` expects the target range to be
/// in the erased state.
pub trait FlashBackend {
    fn geometry(&self) -> FlashGeometry;

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn program_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    fn erase_peb(&mut self, peb: u32) -> Result<()>;

    fn is_bad(&mut self, peb: u32) -> Result<bool>;

    fn mark_bad(&mut self, peb: u32) -> Result<()>;

    fn ecc_stats(&mut self) -> Result<EccStats>;
}

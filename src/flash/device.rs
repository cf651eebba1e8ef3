// swifota/src/flash/device.rs

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::flash::backend::{EccStats, FlashBackend, FlashGeometry};
use crate::ubi::volume::UbiState;

/// Sentinel for a logical erase block with no physical block behind it.
pub const INVALID_PEB: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// Which slice of the physical partition a descriptor covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Half {
    Whole,
    /// First half of a physical partition split in two.
    Logical,
    /// Second half.
    LogicalDual,
}

/// Options for [`FlashDevice::open`].
#[derive(Debug, Clone, Copy)]
pub struct OpenFlags {
    access: Access,
    half: Half,
    ubi: bool,
    mark_bad_on_erase: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        OpenFlags { access: Access::ReadOnly, half: Half::Whole, ubi: false, mark_bad_on_erase: false }
    }

    pub fn write_only() -> Self {
        OpenFlags { access: Access::WriteOnly, ..OpenFlags::read_only() }
    }

    pub fn read_write() -> Self {
        OpenFlags { access: Access::ReadWrite, ..OpenFlags::read_only() }
    }

    /// Restrict the descriptor to the first half of the partition.
    pub fn logical(mut self) -> Self {
        self.half = Half::Logical;
        self
    }

    /// Restrict the descriptor to the second half of the partition.
    pub fn logical_dual(mut self) -> Self {
        self.half = Half::LogicalDual;
        self
    }

    /// The partition is expected to hold UBI structures; the open scans it
    /// so block indexes are logical from the start.
    pub fn ubi(mut self) -> Self {
        self.ubi = true;
        self
    }

    /// Mark a block bad (and rescan) when erasing it fails with an I/O
    /// error.
    pub fn mark_bad_on_erase(mut self) -> Self {
        self.mark_bad_on_erase = true;
        self
    }
}

/// Partition facts reported without opening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub size: u64,
    pub write_size: u32,
    pub erase_size: u32,
    pub nb_blk: u32,
    pub start_offset: u64,
    pub name: String,
}

/// An open flash partition: geometry, access cursor, optional LEB map and
/// optional UBI container state. All higher layers funnel their I/O
/// through this descriptor.
pub struct FlashDevice {
    backend: Box<dyn FlashBackend>,
    geom: FlashGeometry,
    base_peb: u32,
    flags: OpenFlags,
    name: String,
    cursor: u64,
    leb_to_peb: Vec<u32>,
    scan_done: bool,
    scan_generation: u64,
    scratch: Vec<u8>,
    pub(crate) ubi: Option<UbiState>,
}

impl FlashDevice {
    pub fn open(name: &str, backend: Box<dyn FlashBackend>, flags: OpenFlags) -> Result<Self> {
        let phys = backend.geometry();
        phys.validate()?;

        let (geom, base_peb) = match flags.half {
            Half::Whole => (phys, 0),
            Half::Logical | Half::LogicalDual => {
                if phys.nb_blk < 2 {
                    return Err(Error::Unsupported("partition too small to split"));
                }
                let nb = phys.nb_blk / 2;
                let geom = FlashGeometry::new(phys.write_size, phys.erase_size, nb);
                let base = if flags.half == Half::Logical { 0 } else { nb };
                (geom, base)
            }
        };

        let mut dev = FlashDevice {
            scratch: vec![0xFF; geom.write_size as usize],
            backend,
            geom,
            base_peb,
            flags,
            name: name.to_string(),
            cursor: 0,
            leb_to_peb: Vec::new(),
            scan_done: false,
            scan_generation: 0,
            ubi: None,
        };
        if flags.ubi {
            dev.scan()?;
        }
        Ok(dev)
    }

    /// Reports the partition facts without building a descriptor.
    pub fn info(name: &str, backend: &dyn FlashBackend) -> PartitionInfo {
        let geom = backend.geometry();
        PartitionInfo {
            size: geom.size,
            write_size: geom.write_size,
            erase_size: geom.erase_size,
            nb_blk: geom.nb_blk,
            start_offset: 0,
            name: name.to_string(),
        }
    }

    pub fn geometry(&self) -> FlashGeometry {
        self.geom
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_scanned(&self) -> bool {
        self.scan_done
    }

    pub fn nb_leb(&self) -> u32 {
        self.leb_to_peb.len() as u32
    }

    /// Number of addressable blocks: LEBs after a scan, PEBs before.
    pub fn block_count(&self) -> u32 {
        if self.scan_done { self.nb_leb() } else { self.geom.nb_blk }
    }

    /// Builds the LEB→PEB map over the good blocks. Afterwards every
    /// block index handed to this descriptor is a logical erase block.
    pub fn scan(&mut self) -> Result<()> {
        let mut map = Vec::with_capacity(self.geom.nb_blk as usize);
        for peb in 0..self.geom.nb_blk {
            if !self.backend.is_bad(self.base_peb + peb)? {
                map.push(peb);
            }
        }
        if map.is_empty() {
            return Err(Error::Format("no good blocks in partition"));
        }
        debug!("{}: scan found {} good of {} blocks", self.name, map.len(), self.geom.nb_blk);
        self.leb_to_peb = map;
        self.scan_done = true;
        self.scan_generation += 1;
        Ok(())
    }

    /// Monotonic counter bumped by every (re)scan; lets the UBI layer
    /// notice that the LEB map changed under it.
    pub(crate) fn scan_generation(&self) -> u64 {
        self.scan_generation
    }

    /// Drops the LEB map; block indexes are physical again.
    pub fn unscan(&mut self) {
        self.leb_to_peb.clear();
        self.scan_done = false;
        self.cursor = 0;
        self.ubi = None;
    }

    /// Translates a block index to the physical block it currently maps
    /// to (identity before a scan).
    pub fn peb_of(&self, block: u32) -> Result<u32> {
        if self.scan_done {
            match self.leb_to_peb.get(block as usize) {
                Some(&peb) if peb != INVALID_PEB => Ok(peb),
                Some(_) => Err(Error::NotPermitted("LEB has no physical block")),
                None => Err(Error::OutOfRange("LEB past end of map")),
            }
        } else if block < self.geom.nb_blk {
            Ok(block)
        } else {
            Err(Error::OutOfRange("block past end of partition"))
        }
    }

    fn backend_offset(&self, peb: u32) -> u64 {
        (self.base_peb + peb) as u64 * self.geom.erase_size as u64
    }

    pub fn seek_at_offset(&mut self, offset: u64) -> Result<()> {
        let limit = self.block_count() as u64 * self.geom.erase_size as u64;
        if offset > limit {
            return Err(Error::OutOfRange("seek past end of partition"));
        }
        self.cursor = offset;
        Ok(())
    }

    pub fn seek_at_block(&mut self, block: u32) -> Result<()> {
        self.seek_at_offset(block as u64 * self.geom.erase_size as u64)
    }

    pub fn current_offset(&self) -> u64 {
        self.cursor
    }

    /// Reads `buf.len()` bytes at the cursor, translating each touched
    /// block through the LEB map.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.flags.access == Access::WriteOnly {
            return Err(Error::NotPermitted("descriptor is write-only"));
        }
        let erase = self.geom.erase_size as u64;
        let mut pos = 0usize;
        while pos < buf.len() {
            let block = (self.cursor / erase) as u32;
            let in_blk = self.cursor % erase;
            let n = ((buf.len() - pos) as u64).min(erase - in_blk) as usize;
            let peb = self.peb_of(block)?;
            let abs = self.backend_offset(peb) + in_blk;
            self.backend.read_at(abs, &mut buf[pos..pos + n])?;
            self.cursor += n as u64;
            pos += n;
        }
        Ok(())
    }

    /// Writes `data` at the cursor. The cursor must be page-aligned and
    /// `data` must fit one erase block; a trailing partial page is padded
    /// to the page boundary with `0xFF` through the scratch page. Before
    /// touching a fresh block in physical mode, bad blocks are skipped.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.flags.access == Access::ReadOnly {
            return Err(Error::NotPermitted("descriptor is read-only"));
        }
        let write_size = self.geom.write_size as usize;
        let erase = self.geom.erase_size as u64;
        if data.len() as u64 > erase {
            return Err(Error::BadParameter("write larger than one erase block"));
        }
        if self.cursor % self.geom.write_size as u64 != 0 {
            return Err(Error::BadParameter("write cursor is not page-aligned"));
        }

        let mut pos = 0usize;
        while pos < data.len() {
            if !self.scan_done && self.cursor % erase == 0 {
                self.skip_bad_blocks()?;
            }
            let block = (self.cursor / erase) as u32;
            let in_blk = self.cursor % erase;
            let n = ((data.len() - pos) as u64).min(erase - in_blk) as usize;
            let peb = self.peb_of(block)?;
            let abs = self.backend_offset(peb) + in_blk;

            let full = n - n % write_size;
            if full > 0 {
                self.backend.program_at(abs, &data[pos..pos + full])?;
            }
            let tail = n - full;
            if tail > 0 {
                self.scratch.fill(0xFF);
                self.scratch[..tail].copy_from_slice(&data[pos + full..pos + n]);
                self.backend.program_at(abs + full as u64, &self.scratch)?;
                self.cursor += (full + write_size) as u64;
            } else {
                self.cursor += n as u64;
            }
            pos += n;
        }
        Ok(())
    }

    fn skip_bad_blocks(&mut self) -> Result<()> {
        let erase = self.geom.erase_size as u64;
        loop {
            let block = (self.cursor / erase) as u32;
            if block >= self.geom.nb_blk {
                return Err(Error::OutOfRange("no good blocks remain"));
            }
            if !self.backend.is_bad(self.base_peb + block)? {
                return Ok(());
            }
            debug!("{}: skipping bad PEB {}", self.name, self.base_peb + block);
            self.cursor = (block as u64 + 1) * erase;
        }
    }

    /// Erases one block. On an I/O error with `mark_bad_on_erase`, the
    /// block is marked bad and the LEB map rebuilt, and the error is still
    /// returned so the caller can retry once on the new mapping.
    pub fn erase_block(&mut self, block: u32) -> Result<()> {
        if self.flags.access == Access::ReadOnly {
            return Err(Error::NotPermitted("descriptor is read-only"));
        }
        let peb = self.peb_of(block)?;
        let abs_peb = self.base_peb + peb;
        match self.backend.erase_peb(abs_peb) {
            Ok(()) => Ok(()),
            Err(err) if err.is_io() => {
                if self.flags.mark_bad_on_erase {
                    warn!("{}: erase failed on PEB {abs_peb}, marking bad", self.name);
                    self.backend.mark_bad(abs_peb)?;
                    if self.scan_done {
                        self.scan()?;
                    }
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Erases a block, retrying on the rebuilt map whenever the failure
    /// was recovered by marking the block bad. Every retry has consumed
    /// one more good block, so the loop terminates: eventually the erase
    /// succeeds or the map runs out and the translation fails.
    pub fn erase_block_retry(&mut self, block: u32) -> Result<()> {
        loop {
            match self.erase_block(block) {
                Err(err) if err.is_io() && self.flags.mark_bad_on_erase => {
                    debug!("{}: retrying erase of block {block} on the rebuilt map", self.name);
                }
                other => return other,
            }
        }
    }

    pub fn check_bad_block(&mut self, block: u32) -> Result<bool> {
        let peb = self.peb_of(block)?;
        self.backend.is_bad(self.base_peb + peb)
    }

    pub fn mark_bad_block(&mut self, block: u32) -> Result<()> {
        let peb = self.peb_of(block)?;
        self.backend.mark_bad(self.base_peb + peb)?;
        if self.scan_done {
            self.scan()?;
        }
        Ok(())
    }

    pub fn ecc_stats(&mut self) -> Result<EccStats> {
        self.backend.ecc_stats()
    }

    /// Convenience: read `len` bytes starting at `offset` without
    /// disturbing a caller-visible cursor contract.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.seek_at_offset(offset)?;
        self.read(buf)
    }

    /// Convenience: position and write in one call.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.seek_at_offset(offset)?;
        self.write(data)
    }

    /// Releases the backend, e.g. to reopen the partition under
    /// different flags.
    pub fn into_backend(self) -> Box<dyn FlashBackend> {
        self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::sim::SimNand;

    fn small_geom() -> FlashGeometry {
        FlashGeometry::new(128, 1024, 16)
    }

    #[test]
    fn scan_skips_bad_blocks() -> Result<()> {
        let sim = SimNand::new(small_geom()).with_bad_mask(0b0110);
        let mut dev = FlashDevice::open("test0", Box::new(sim), OpenFlags::read_write())?;
        dev.scan()?;
        assert_eq!(dev.nb_leb(), 14);
        assert_eq!(dev.peb_of(0)?, 0);
        assert_eq!(dev.peb_of(1)?, 3);
        Ok(())
    }

    #[test]
    fn write_pads_partial_page_with_erased_bytes() -> Result<()> {
        let sim = SimNand::new(small_geom());
        let mut dev = FlashDevice::open("test0", Box::new(sim), OpenFlags::read_write())?;
        dev.erase_block(0)?;
        dev.seek_at_offset(0)?;
        dev.write(&[0xAB; 100])?;
        assert_eq!(dev.current_offset(), 128, "cursor advances to the page boundary");

        let mut back = [0u8; 128];
        dev.read_at(0, &mut back)?;
        assert_eq!(&back[..100], &[0xAB; 100][..]);
        assert_eq!(&back[100..], &[0xFF; 28][..]);
        Ok(())
    }

    #[test]
    fn unaligned_write_is_rejected() -> Result<()> {
        let sim = SimNand::new(small_geom());
        let mut dev = FlashDevice::open("test0", Box::new(sim), OpenFlags::read_write())?;
        dev.seek_at_offset(3)?;
        assert!(matches!(dev.write(&[0u8; 8]), Err(Error::BadParameter(_))));
        Ok(())
    }

    #[test]
    fn logical_halves_split_the_partition() -> Result<()> {
        let sim = SimNand::new(small_geom());
        let dev = FlashDevice::open("test0", Box::new(sim), OpenFlags::read_write().logical_dual())?;
        assert_eq!(dev.geometry().nb_blk, 8);
        Ok(())
    }

    #[test]
    fn erase_failure_marks_bad_and_rescans() -> Result<()> {
        let sim = SimNand::new(small_geom()).with_erase_failures(1 << 2);
        let mut dev =
            FlashDevice::open("test0", Box::new(sim), OpenFlags::read_write().mark_bad_on_erase())?;
        dev.scan()?;
        assert_eq!(dev.nb_leb(), 16);
        let err = dev.erase_block(2).unwrap_err();
        assert!(err.is_io());
        assert_eq!(dev.nb_leb(), 15);
        // The same LEB index now resolves to the next good physical block.
        assert_eq!(dev.peb_of(2)?, 3);
        dev.erase_block(2)?;
        Ok(())
    }
}

//! Deterministic in-memory NAND used by the test suite.
//!
//! The simulator keeps the whole partition in a `Vec<u8>` initialised to
//! the erased state, tracks per-block erase counters, and supports two
//! failure models driven by block bitmasks: blocks that are bad from the
//! start, and blocks whose next erase fails with an I/O error (after which
//! the device layer may mark them bad and rescan).

use log::debug;

use crate::error::{Error, Result};
use crate::flash::backend::{EccStats, FlashBackend, FlashGeometry};

pub struct SimNand {
    geom: FlashGeometry,
    data: Vec<u8>,
    bad: Vec<bool>,
    erase_counters: Vec<u32>,
    /// Bitmask of blocks whose next erase returns an I/O error.
    fail_on_erase: u64,
    ecc: EccStats,
}

impl SimNand {
    pub fn new(geom: FlashGeometry) -> Self {
        SimNand {
            data: vec![0xFF; geom.size as usize],
            bad: vec![false; geom.nb_blk as usize],
            erase_counters: vec![0; geom.nb_blk as usize],
            fail_on_erase: 0,
            ecc: EccStats::default(),
            geom,
        }
    }

    /// Marks every block whose bit is set in `mask` as factory-bad.
    pub fn with_bad_mask(mut self, mask: u64) -> Self {
        for peb in 0..self.geom.nb_blk.min(64) {
            if mask & (1u64 << peb) != 0 {
                self.bad[peb as usize] = true;
                self.ecc.bad_blocks += 1;
            }
        }
        self
    }

    /// Arms an erase failure on every block whose bit is set in `mask`.
    /// The failure fires once per block, at the next erase attempt.
    pub fn with_erase_failures(mut self, mask: u64) -> Self {
        self.fail_on_erase = mask;
        self
    }

    pub fn erase_counter(&self, peb: u32) -> u32 {
        self.erase_counters[peb as usize]
    }

    /// Raw view of the partition contents, for test assertions.
    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        if offset + len as u64 > self.geom.size {
            return Err(Error::OutOfRange("access past end of partition"));
        }
        Ok(())
    }
}

impl FlashBackend for SimNand {
    fn geometry(&self) -> FlashGeometry {
        self.geom
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn program_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        let start = offset as usize;
        // NAND programming can only clear bits.
        for (dst, src) in self.data[start..start + data.len()].iter_mut().zip(data) {
            *dst &= *src;
        }
        Ok(())
    }

    fn erase_peb(&mut self, peb: u32) -> Result<()> {
        if peb >= self.geom.nb_blk {
            return Err(Error::OutOfRange("erase past end of partition"));
        }
        if peb < 64 && self.fail_on_erase & (1u64 << peb) != 0 {
            self.fail_on_erase &= !(1u64 << peb);
            debug!("sim: injected erase failure on PEB {peb}");
            return Err(Error::Io(std::io::Error::other("simulated erase failure")));
        }
        let start = peb as usize * self.geom.erase_size as usize;
        self.data[start..start + self.geom.erase_size as usize].fill(0xFF);
        self.erase_counters[peb as usize] += 1;
        Ok(())
    }

    fn is_bad(&mut self, peb: u32) -> Result<bool> {
        if peb >= self.geom.nb_blk {
            return Err(Error::OutOfRange("bad-block query past end of partition"));
        }
        Ok(self.bad[peb as usize])
    }

    fn mark_bad(&mut self, peb: u32) -> Result<()> {
        if peb >= self.geom.nb_blk {
            return Err(Error::OutOfRange("bad-block mark past end of partition"));
        }
        if !self.bad[peb as usize] {
            self.bad[peb as usize] = true;
            self.ecc.bad_blocks += 1;
        }
        Ok(())
    }

    fn ecc_stats(&mut self) -> Result<EccStats> {
        Ok(self.ecc)
    }
}

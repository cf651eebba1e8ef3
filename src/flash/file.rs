// swifota/src/flash/file.rs

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::warn;

use crate::error::{Error, Result};
use crate::flash::backend::{EccStats, FlashBackend, FlashGeometry};

/// A NAND partition backed by a regular file.
///
/// The image file holds the raw partition contents; erase rewrites the
/// block with `0xFF`. Bad-block marks survive reopening through a sidecar
/// file (`<image>.bbt`) holding one decimal PEB index per line, since a
/// plain file has no out-of-band area to carry them.
pub struct FileNand {
    file: File,
    bbt_path: PathBuf,
    geom: FlashGeometry,
    bad: Vec<bool>,
    ecc: EccStats,
}

impl FileNand {
    /// Opens (or creates) the image at `path` with the given geometry.
    /// A shorter existing image is extended to full size in the erased
    /// state.
    pub fn open(path: &Path, geom: FlashGeometry) -> Result<Self> {
        geom.validate()?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        if len < geom.size {
            file.seek(SeekFrom::Start(len))?;
            let mut remaining = geom.size - len;
            let blank = vec![0xFFu8; geom.write_size as usize];
            while remaining > 0 {
                let n = (blank.len() as u64).min(remaining) as usize;
                file.write_all(&blank[..n])?;
                remaining -= n as u64;
            }
        }

        let bbt_path = path.with_extension("bbt");
        let mut bad = vec![false; geom.nb_blk as usize];
        let mut bad_blocks = 0;
        if bbt_path.exists() {
            let mut text = String::new();
            File::open(&bbt_path)?.read_to_string(&mut text)?;
            for line in text.lines() {
                match line.trim().parse::<u32>() {
                    Ok(peb) if peb < geom.nb_blk => {
                        bad[peb as usize] = true;
                        bad_blocks += 1;
                    }
                    _ => warn!("ignoring bad-block table entry {:?}", line),
                }
            }
        }

        Ok(FileNand {
            file,
            bbt_path,
            geom,
            bad,
            ecc: EccStats { bad_blocks, ..EccStats::default() },
        })
    }

    fn save_bbt(&self) -> Result<()> {
        let mut out = String::new();
        for (peb, bad) in self.bad.iter().enumerate() {
            if *bad {
                out.push_str(&format!("{peb}\n"));
            }
        }
        std::fs::write(&self.bbt_path, out)?;
        Ok(())
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        if offset + len as u64 > self.geom.size {
            return Err(Error::OutOfRange("access past end of partition"));
        }
        Ok(())
    }
}

impl FlashBackend for FileNand {
    fn geometry(&self) -> FlashGeometry {
        self.geom
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn program_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn erase_peb(&mut self, peb: u32) -> Result<()> {
        if peb >= self.geom.nb_blk {
            return Err(Error::OutOfRange("erase past end of partition"));
        }
        let offset = peb as u64 * self.geom.erase_size as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        let blank = vec![0xFFu8; self.geom.write_size as usize];
        for _ in 0..self.geom.pages_per_blk() {
            self.file.write_all(&blank)?;
        }
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
            self.save_bbt()?;
        }
        Ok(())
    }

    fn ecc_stats(&mut self) -> Result<EccStats> {
        Ok(self.ecc)
    }
}

// swifota/src/resume.rs
//
// The durable resume context. One record mirrors the whole download
// state; it is persisted to two files in alternation so that a crash in
// the middle of a store always leaves at least one intact copy. On load
// the valid copy with the higher counter wins.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::utils::{ByteReader, CRC32_INIT, crc32_extend};

const CTX_MAGIC: u32 = 0x5357_4358; // "SWCX"
const CTX_VERSION: u32 = 1;

/// Snapshot of an in-flight download, updated after every durable step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeCtx {
    pub ctx_counter: u32,
    /// Tag of the inner image being transferred, zeroed between images.
    pub image_type: [u8; 4],
    pub image_size: u32,
    pub image_crc: u32,
    pub current_image_crc: u32,
    pub global_crc: u32,
    pub current_global_crc: u32,
    pub total_read: u64,
    pub current_offset: u64,
    pub full_image_length: u64,
    pub misc_opts: u8,
    pub flags: u32,
    /// Raw patch meta of the image in progress, when it is a delta.
    pub patch_meta: Vec<u8>,
    /// Raw CWE header of the image in progress.
    pub patch_hdr: Vec<u8>,
    /// Opaque staging-writer snapshot.
    pub internals: Vec<u8>,
}

impl ResumeCtx {
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&CTX_MAGIC.to_be_bytes());
        out.extend_from_slice(&CTX_VERSION.to_be_bytes());
        out.extend_from_slice(&self.ctx_counter.to_be_bytes());
        out.extend_from_slice(&self.image_type);
        out.extend_from_slice(&self.image_size.to_be_bytes());
        out.extend_from_slice(&self.image_crc.to_be_bytes());
        out.extend_from_slice(&self.current_image_crc.to_be_bytes());
        out.extend_from_slice(&self.global_crc.to_be_bytes());
        out.extend_from_slice(&self.current_global_crc.to_be_bytes());
        out.extend_from_slice(&self.total_read.to_be_bytes());
        out.extend_from_slice(&self.current_offset.to_be_bytes());
        out.extend_from_slice(&self.full_image_length.to_be_bytes());
        out.push(self.misc_opts);
        out.extend_from_slice(&self.flags.to_be_bytes());
        out.extend_from_slice(&(self.patch_meta.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.patch_meta);
        out.extend_from_slice(&(self.patch_hdr.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.patch_hdr);
        out.extend_from_slice(&(self.internals.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.internals);
        let crc = crc32_extend(CRC32_INIT, &out);
        out.extend_from_slice(&crc.to_be_bytes());
        out
    }

    fn parse(bytes: &[u8]) -> Result<Self> {
        let body_len = bytes.len().checked_sub(4).ok_or(Error::Format("context too short"))?;
        let stored = u32::from_be_bytes(
            bytes[body_len..].try_into().map_err(|_| Error::Format("context too short"))?,
        );
        if stored != crc32_extend(CRC32_INIT, &bytes[..body_len]) {
            return Err(Error::Format("context CRC mismatch"));
        }
        let mut r = ByteReader::new(bytes);
        if r.u32()? != CTX_MAGIC {
            return Err(Error::Format("context magic mismatch"));
        }
        if r.u32()? != CTX_VERSION {
            return Err(Error::Unsupported("context version mismatch"));
        }
        let ctx_counter = r.u32()?;
        let image_type: [u8; 4] = r.bytes(4)?.try_into().unwrap();
        let image_size = r.u32()?;
        let image_crc = r.u32()?;
        let current_image_crc = r.u32()?;
        let global_crc = r.u32()?;
        let current_global_crc = r.u32()?;
        let total_read = r.u64()?;
        let current_offset = r.u64()?;
        let full_image_length = r.u64()?;
        let misc_opts = r.u8()?;
        let flags = r.u32()?;
        let n = r.u32()? as usize;
        let patch_meta = r.bytes(n)?.to_vec();
        let n = r.u32()? as usize;
        let patch_hdr = r.bytes(n)?.to_vec();
        let n = r.u32()? as usize;
        let internals = r.bytes(n)?.to_vec();
        Ok(ResumeCtx {
            ctx_counter,
            image_type,
            image_size,
            image_crc,
            current_image_crc,
            global_crc,
            current_global_crc,
            total_read,
            current_offset,
            full_image_length,
            misc_opts,
            flags,
            patch_meta,
            patch_hdr,
            internals,
        })
    }
}

/// The two mirror files backing the resume context.
pub struct ResumeStore {
    paths: [PathBuf; 2],
    /// Mirror the last load or store used; the next store goes to the
    /// other one.
    last_used: usize,
}

impl ResumeStore {
    /// Uses `<dir>/fwupdate_ctx.0` and `<dir>/fwupdate_ctx.1`.
    pub fn new(dir: &Path) -> Self {
        ResumeStore {
            paths: [dir.join("fwupdate_ctx.0"), dir.join("fwupdate_ctx.1")],
            last_used: 1,
        }
    }

    /// Loads the newest valid copy, if any.
    pub fn load(&mut self) -> Result<Option<ResumeCtx>> {
        let mut best: Option<(usize, ResumeCtx)> = None;
        for (i, path) in self.paths.iter().enumerate() {
            let Ok(bytes) = fs::read(path) else { continue };
            match ResumeCtx::parse(&bytes) {
                Ok(ctx) => {
                    let newer =
                        best.as_ref().map(|(_, b)| ctx.ctx_counter > b.ctx_counter).unwrap_or(true);
                    if newer {
                        best = Some((i, ctx));
                    }
                }
                Err(err) => warn!("resume mirror {} is invalid: {err}", path.display()),
            }
        }
        Ok(match best {
            Some((i, ctx)) => {
                self.last_used = i;
                info!("resume context loaded (counter {})", ctx.ctx_counter);
                Some(ctx)
            }
            None => None,
        })
    }

    /// Bumps the counter and stores the record into the mirror that was
    /// not used last, leaving the previous copy untouched.
    pub fn save(&mut self, ctx: &mut ResumeCtx) -> Result<()> {
        ctx.ctx_counter += 1;
        let target = 1 - self.last_used;
        let path = &self.paths[target];
        let mut file = File::create(path)?;
        file.write_all(&ctx.to_bytes())?;
        file.sync_all()?;
        self.last_used = target;
        debug!("resume context stored to {} (counter {})", path.display(), ctx.ctx_counter);
        Ok(())
    }

    /// Removes both mirrors (successful completion or explicit abort).
    pub fn clear(&mut self) -> Result<()> {
        for path in &self.paths {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        info!("resume context destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> ResumeCtx {
        ResumeCtx {
            image_type: *b"USER",
            image_size: 160_000,
            current_offset: 60_800,
            total_read: 61_200,
            internals: vec![1, 2, 3, 4],
            ..ResumeCtx::default()
        }
    }

    #[test]
    fn record_round_trip() -> Result<()> {
        let ctx = sample();
        assert_eq!(ResumeCtx::parse(&ctx.to_bytes())?, ctx);
        Ok(())
    }

    #[test]
    fn alternating_mirrors_and_newest_copy_wins() -> Result<()> {
        let dir = tempdir()?;
        let mut store = ResumeStore::new(dir.path());
        let mut ctx = sample();
        store.save(&mut ctx)?;
        store.save(&mut ctx)?;
        store.save(&mut ctx)?;
        assert_eq!(ctx.ctx_counter, 3);

        let mut fresh = ResumeStore::new(dir.path());
        let loaded = fresh.load()?.expect("a copy must load");
        assert_eq!(loaded.ctx_counter, 3);
        Ok(())
    }

    #[test]
    fn corrupt_mirror_falls_back_to_the_other() -> Result<()> {
        let dir = tempdir()?;
        let mut store = ResumeStore::new(dir.path());
        let mut ctx = sample();
        store.save(&mut ctx)?;
        store.save(&mut ctx)?;

        // Trash the newer mirror; the older one must still load.
        let newer = dir.path().join("fwupdate_ctx.1");
        let mut bytes = fs::read(&newer)?;
        let len = bytes.len();
        bytes[len / 2] ^= 0xFF;
        fs::write(&newer, bytes)?;

        let mut fresh = ResumeStore::new(dir.path());
        let loaded = fresh.load()?.expect("the intact mirror must load");
        assert_eq!(loaded.ctx_counter, 1);
        Ok(())
    }

    #[test]
    fn clear_removes_both_mirrors() -> Result<()> {
        let dir = tempdir()?;
        let mut store = ResumeStore::new(dir.path());
        let mut ctx = sample();
        store.save(&mut ctx)?;
        store.clear()?;
        assert!(ResumeStore::new(dir.path()).load()?.is_none());
        Ok(())
    }
}

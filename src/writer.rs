// swifota/src/writer.rs
//
// The staging-partition writer. Bytes stream in at an absolute offset in
// LEB space; the writer gathers them into whole erase blocks and commits
// each block with an erase-then-program cycle, so a block is either fully
// staged or still pending in memory. Nested UBI images are built through
// the volume engine at the current cursor, straddling block boundaries
// when the cursor is not block-aligned.

use log::{debug, info};

use crate::error::{Error, Result};
use crate::utils::{ByteReader, CRC32_INIT, crc32_extend};
use crate::flash::device::FlashDevice;
use crate::ubi::headers::VolType;

const INTERNALS_MAGIC: u32 = 0x5357_494E; // "SWIN"
const INTERNALS_VERSION: u32 = 1;

/// State of a nested UBI volume being streamed.
struct UbiStream {
    abs_offset: u64,
    image_seq: u32,
    vol_id: u32,
    vol_type: VolType,
    vol_open: bool,
    /// Next volume LEB to commit.
    lnum: u32,
    /// Payload bytes already committed to volume LEBs.
    written: u64,
    /// Declared volume size; `None` grows with the data.
    declared: Option<u64>,
    leb_fill: Vec<u8>,
}

/// Streaming writer over the staging ("swifota") partition.
pub struct PartitionWriter {
    dev: FlashDevice,
    /// Absolute byte cursor: committed bytes plus the pending block tail.
    offset: u64,
    leb_index: u32,
    leb_buf: Vec<u8>,
    /// Pending bytes differ from what is on flash.
    dirty: bool,
    image_crc: u32,
    image_len: u64,
    global_crc: u32,
    global_len: u64,
    ubi: Option<UbiStream>,
}

impl PartitionWriter {
    /// Wraps an opened staging partition and positions the cursor at
    /// `resume_offset`. The partition is scanned if it was not already;
    /// bytes before the cursor inside the current block are read back so
    /// a later commit preserves them.
    pub fn open(mut dev: FlashDevice, resume_offset: u64) -> Result<Self> {
        if !dev.is_scanned() {
            dev.scan()?;
        }
        let mut writer = PartitionWriter {
            dev,
            offset: 0,
            leb_index: 0,
            leb_buf: Vec::new(),
            dirty: false,
            image_crc: CRC32_INIT,
            image_len: 0,
            global_crc: CRC32_INIT,
            global_len: 0,
            ubi: None,
        };
        writer.seek_to(resume_offset)?;
        Ok(writer)
    }

    pub fn device(&mut self) -> &mut FlashDevice {
        &mut self.dev
    }

    /// Releases the descriptor, e.g. to hand the partition to the
    /// install step.
    pub fn into_device(self) -> FlashDevice {
        self.dev
    }

    pub fn get_offset(&self) -> u64 {
        self.offset
    }

    pub fn image_crc(&self) -> u32 {
        self.image_crc
    }

    pub fn image_len(&self) -> u64 {
        self.image_len
    }

    pub fn global_crc(&self) -> u32 {
        self.global_crc
    }

    /// Starts accounting a new inner image at the current position.
    pub fn start_image(&mut self) {
        self.image_crc = CRC32_INIT;
        self.image_len = 0;
    }

    fn erase_size(&self) -> usize {
        self.dev.geometry().erase_size as usize
    }

    /// Repositions the cursor, reloading the already-staged prefix of the
    /// target block so the next commit rewrites it unchanged.
    fn seek_to(&mut self, offset: u64) -> Result<()> {
        let erase = self.erase_size() as u64;
        self.leb_index = (offset / erase) as u32;
        let prefix = (offset % erase) as usize;
        self.leb_buf.clear();
        if prefix > 0 {
            let mut buf = vec![0u8; prefix];
            self.dev.read_at(self.leb_index as u64 * erase, &mut buf)?;
            self.leb_buf = buf;
        }
        self.offset = offset;
        self.dirty = false;
        Ok(())
    }

    /// Commits the pending block: erase, then program the gathered bytes.
    /// The pending buffer is kept, so the commit may run again after more
    /// bytes arrive.
    fn commit_block(&mut self) -> Result<()> {
        if self.leb_buf.is_empty() || !self.dirty {
            return Ok(());
        }
        self.dev.erase_block_retry(self.leb_index)?;
        self.dev.seek_at_block(self.leb_index)?;
        self.dev.write(&self.leb_buf)?;
        self.dirty = false;
        Ok(())
    }

    /// Accepts an arbitrary-length buffer of package bytes. `is_patch`
    /// marks bytes produced by delta apply: they count into the running
    /// image CRC (the destination image is what the inner header's CRC
    /// covers) but not into the raw package CRC.
    pub fn write(&mut self, buf: &[u8], is_patch: bool) -> Result<()> {
        if self.ubi.is_some() {
            return Err(Error::Busy("a nested UBI stream is open"));
        }
        self.account(buf, is_patch);
        let erase = self.erase_size();
        let mut pos = 0usize;
        while pos < buf.len() {
            let room = erase - self.leb_buf.len();
            let n = room.min(buf.len() - pos);
            self.leb_buf.extend_from_slice(&buf[pos..pos + n]);
            self.dirty = true;
            pos += n;
            if self.leb_buf.len() == erase {
                self.commit_block()?;
                self.leb_index += 1;
                self.leb_buf.clear();
            }
        }
        self.offset += buf.len() as u64;
        Ok(())
    }

    fn account(&mut self, buf: &[u8], is_patch: bool) {
        self.image_crc = crc32_extend(self.image_crc, buf);
        self.image_len += buf.len() as u64;
        if !is_patch {
            self.global_crc = crc32_extend(self.global_crc, buf);
            self.global_len += buf.len() as u64;
        }
    }

    /// Opens a nested UBI container at the current cursor: an empty one
    /// (`force_create` or `is_empty`) or an existing one left by an
    /// interrupted session.
    pub fn open_ubi(&mut self, image_seq: u32, force_create: bool, is_empty: bool) -> Result<()> {
        if let Some(stream) = &self.ubi {
            // Idempotent on resume: the restored stream already knows its
            // container base.
            let abs = stream.abs_offset;
            if !self.dev.ubi_is_attached() {
                self.dev.ubi_attach(abs)?;
            }
            return Ok(());
        }
        // The pending block must reach the flash before the volume engine
        // starts read-modify-writing it.
        self.commit_block()?;
        let abs = self.offset;
        if force_create || is_empty {
            self.dev.ubi_create_container(abs, image_seq)?;
        } else {
            self.dev.ubi_attach(abs)?;
        }
        self.ubi = Some(UbiStream {
            abs_offset: abs,
            image_seq,
            vol_id: 0,
            vol_type: VolType::Dynamic,
            vol_open: false,
            lnum: 0,
            written: 0,
            declared: None,
            leb_fill: Vec::new(),
        });
        Ok(())
    }

    /// Opens one volume of the nested container. `size` below zero means
    /// the volume grows with the data. With `create` the volume is added
    /// to the container; otherwise it must already exist (resume).
    pub fn open_ubi_volume(
        &mut self,
        vol_id: u32,
        vol_type: VolType,
        size: i64,
        name: &str,
        create: bool,
    ) -> Result<()> {
        let stream = self.ubi.as_mut().ok_or(Error::BadParameter("no nested UBI is open"))?;
        if stream.vol_open && stream.vol_id == vol_id {
            // Resume path: the stream state was restored, reselect only.
            self.dev.ubi_select_volume(vol_id)?;
            return Ok(());
        }
        if stream.vol_open {
            return Err(Error::Busy("another UBI volume is open"));
        }
        let declared = (size >= 0).then_some(size as u64);
        if create {
            self.dev.ubi_create_volume(vol_id, name, vol_type, declared)?;
        } else {
            self.dev.ubi_select_volume(vol_id)?;
        }
        stream.vol_id = vol_id;
        stream.vol_type = vol_type;
        stream.vol_open = true;
        stream.lnum = 0;
        stream.written = 0;
        stream.declared = declared;
        stream.leb_fill.clear();
        info!("staging: UBI volume {vol_id} ({name:?}) open");
        Ok(())
    }

    /// Streams payload bytes into the open volume, committing whole LEBs
    /// as they fill. With `is_last` the trailing partial LEB is committed
    /// too.
    pub fn write_ubi(&mut self, buf: &[u8], is_last: bool) -> Result<()> {
        match &self.ubi {
            Some(stream) if stream.vol_open => {}
            Some(_) => return Err(Error::BadParameter("no UBI volume is open")),
            None => return Err(Error::BadParameter("no nested UBI is open")),
        }
        self.account(buf, false);
        let stream = match self.ubi.as_mut() {
            Some(stream) => stream,
            None => return Err(Error::Fault("UBI stream state lost")),
        };
        let usable = self.dev.ubi_leb_size() as usize;
        let mut pos = 0usize;
        while pos < buf.len() {
            let room = usable - stream.leb_fill.len();
            let n = room.min(buf.len() - pos);
            stream.leb_fill.extend_from_slice(&buf[pos..pos + n]);
            pos += n;
            if stream.leb_fill.len() == usable {
                self.dev.ubi_write_leb(stream.lnum, &stream.leb_fill, true)?;
                stream.lnum += 1;
                stream.written += stream.leb_fill.len() as u64;
                stream.leb_fill.clear();
            }
        }
        if is_last && !stream.leb_fill.is_empty() {
            self.dev.ubi_write_leb(stream.lnum, &stream.leb_fill, true)?;
            stream.lnum += 1;
            stream.written += stream.leb_fill.len() as u64;
            stream.leb_fill.clear();
        }
        Ok(())
    }

    /// Closes the open volume. Unless aborted, trailing bytes are
    /// committed and the reservation is trimmed to `final_size` (or to
    /// the written length when `final_size` is negative).
    pub fn close_ubi_volume(&mut self, final_size: i64, aborted: bool) -> Result<()> {
        let stream = self.ubi.as_mut().ok_or(Error::BadParameter("no nested UBI is open"))?;
        if !stream.vol_open {
            return Err(Error::BadParameter("no UBI volume is open"));
        }
        if !aborted {
            if !stream.leb_fill.is_empty() {
                self.dev.ubi_write_leb(stream.lnum, &stream.leb_fill, true)?;
                stream.lnum += 1;
                stream.written += stream.leb_fill.len() as u64;
                stream.leb_fill.clear();
            }
            let target = if final_size >= 0 { final_size as u64 } else { stream.written };
            if target > 0 {
                self.dev.ubi_adjust_volume_size(target)?;
            }
            debug!(
                "staging: UBI volume {} closed at {} bytes",
                stream.vol_id, stream.written
            );
        }
        stream.vol_open = false;
        stream.leb_fill.clear();
        Ok(())
    }

    /// Closes the nested container and moves the cursor past the blocks
    /// it consumed, so the outer stream continues right behind it.
    pub fn close_ubi(&mut self, aborted: bool) -> Result<()> {
        let stream = self.ubi.take().ok_or(Error::BadParameter("no nested UBI is open"))?;
        let consumed = if aborted { 0 } else { self.dev.ubi_consumed_pebs()? };
        self.dev.ubi_detach();
        if !aborted {
            let end =
                stream.abs_offset + consumed as u64 * self.dev.geometry().erase_size as u64;
            self.seek_to(end)?;
            info!(
                "staging: UBI container closed, {consumed} blocks, cursor at {end}"
            );
        }
        Ok(())
    }

    /// Re-reads `length` staged bytes starting at `offset` and returns
    /// their CRC-32. The pending block is committed first so the
    /// read-back sees every byte.
    pub fn compute_crc32(&mut self, offset: u64, length: u64) -> Result<u32> {
        self.commit_block()?;
        let mut crc = CRC32_INIT;
        let mut chunk = vec![0u8; 64 * 1024];
        let mut pos = offset;
        let end = offset + length;
        while pos < end {
            let n = ((end - pos) as usize).min(chunk.len());
            self.dev.read_at(pos, &mut chunk[..n])?;
            crc = crc32_extend(crc, &chunk[..n]);
            pos += n as u64;
        }
        Ok(crc)
    }

    /// Finishes the session. Unless aborted, the pending block is
    /// committed; an abort leaves the partition recoverable through the
    /// resume context instead.
    pub fn close(&mut self, aborted: bool) -> Result<()> {
        if aborted {
            self.ubi = None;
            self.dev.ubi_detach();
            return Ok(());
        }
        if let Some(stream) = &self.ubi {
            if stream.vol_open {
                return Err(Error::Busy("a nested UBI volume is still open"));
            }
            self.close_ubi(false)?;
        }
        self.commit_block()
    }

    /// Serialises the writer state (cursor, CRCs, pending bytes, nested
    /// UBI stream) into an opaque CRC-sealed record.
    pub fn get_internals(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&INTERNALS_MAGIC.to_be_bytes());
        out.extend_from_slice(&INTERNALS_VERSION.to_be_bytes());
        out.extend_from_slice(&self.offset.to_be_bytes());
        out.extend_from_slice(&self.image_crc.to_be_bytes());
        out.extend_from_slice(&self.image_len.to_be_bytes());
        out.extend_from_slice(&self.global_crc.to_be_bytes());
        out.extend_from_slice(&self.global_len.to_be_bytes());
        out.extend_from_slice(&(self.leb_buf.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.leb_buf);
        match &self.ubi {
            None => out.push(0),
            Some(stream) => {
                out.push(1);
                out.extend_from_slice(&stream.abs_offset.to_be_bytes());
                out.extend_from_slice(&stream.image_seq.to_be_bytes());
                out.extend_from_slice(&stream.vol_id.to_be_bytes());
                out.push(u8::from(stream.vol_type));
                out.push(stream.vol_open as u8);
                out.extend_from_slice(&stream.lnum.to_be_bytes());
                out.extend_from_slice(&stream.written.to_be_bytes());
                match stream.declared {
                    Some(size) => {
                        out.push(1);
                        out.extend_from_slice(&size.to_be_bytes());
                    }
                    None => {
                        out.push(0);
                        out.extend_from_slice(&0u64.to_be_bytes());
                    }
                }
                out.extend_from_slice(&(stream.leb_fill.len() as u32).to_be_bytes());
                out.extend_from_slice(&stream.leb_fill);
            }
        }
        let crc = crc32_extend(CRC32_INIT, &out);
        out.extend_from_slice(&crc.to_be_bytes());
        out
    }

    /// Restores a snapshot taken by [`Self::get_internals`]. The write
    /// cursor, CRCs and pending bytes come back exactly as persisted.
    pub fn set_internals(&mut self, bytes: &[u8]) -> Result<()> {
        let mut r = ByteReader::new(bytes);
        let body_len = bytes.len().checked_sub(4).ok_or(Error::Format("snapshot too short"))?;
        let stored = u32::from_be_bytes(
            bytes[body_len..].try_into().map_err(|_| Error::Format("snapshot too short"))?,
        );
        if stored != crc32_extend(CRC32_INIT, &bytes[..body_len]) {
            return Err(Error::Format("snapshot CRC mismatch"));
        }
        if r.u32()? != INTERNALS_MAGIC {
            return Err(Error::Format("snapshot magic mismatch"));
        }
        if r.u32()? != INTERNALS_VERSION {
            return Err(Error::Unsupported("snapshot version mismatch"));
        }
        let offset = r.u64()?;
        let image_crc = r.u32()?;
        let image_len = r.u64()?;
        let global_crc = r.u32()?;
        let global_len = r.u64()?;
        let n = r.u32()? as usize;
        let leb_buf = r.bytes(n)?.to_vec();
        let ubi = match r.u8()? {
            0 => None,
            _ => {
                let abs_offset = r.u64()?;
                let image_seq = r.u32()?;
                let vol_id = r.u32()?;
                let vol_type = VolType::try_from(r.u8()?)?;
                let vol_open = r.u8()? != 0;
                let lnum = r.u32()?;
                let written = r.u64()?;
                let has_declared = r.u8()? != 0;
                let declared_raw = r.u64()?;
                let n = r.u32()? as usize;
                let leb_fill = r.bytes(n)?.to_vec();
                Some(UbiStream {
                    abs_offset,
                    image_seq,
                    vol_id,
                    vol_type,
                    vol_open,
                    lnum,
                    written,
                    declared: has_declared.then_some(declared_raw),
                    leb_fill,
                })
            }
        };

        self.offset = offset;
        self.leb_index = (offset / self.erase_size() as u64) as u32;
        self.image_crc = image_crc;
        self.image_len = image_len;
        self.global_crc = global_crc;
        self.global_len = global_len;
        // The snapshot cannot tell whether the pending bytes reached the
        // flash before the interruption; commit them again to be sure.
        self.dirty = !leb_buf.is_empty();
        self.leb_buf = leb_buf;
        self.ubi = ubi;
        debug!("staging: internals restored, cursor at {offset}");
        Ok(())
    }
}

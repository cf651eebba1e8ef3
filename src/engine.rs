// swifota/src/engine.rs
//
// The package state machine. A single caller pumps downloaded bytes in;
// the engine frames CWE headers, stages everything through the partition
// writer, routes patch-bearing payloads through delta apply, verifies
// image and package CRCs, and checkpoints the resume context at every
// image boundary. Recovery after a power cut restarts from the last
// checkpointed boundary; the host re-sends from `total_read`.

use log::{debug, info, warn};

use crate::cwe::{CWE_HEADER_SIZE, CweHeader};
use crate::delta::{BPATCH_MAGIC, IMGDIFF2_MAGIC, PatchRunner, PatchStream, SourceReader};
use crate::error::{Error, Result, UpdateStatus};
use crate::resume::{ResumeCtx, ResumeStore};
use crate::ubi::UBI_IMAGE_SEQ_BASE;
use crate::ubi::headers::VolType;
use crate::utils::{CRC32_INIT, crc32_extend};
use crate::writer::PartitionWriter;

/// Where an inner image should be staged as a nested UBI volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UbiVolumeSpec {
    pub vol_id: u32,
    pub vol_type: VolType,
    /// Negative means "grow with the data".
    pub size: i64,
    pub name: String,
}

/// Decides per inner image whether it is staged raw or as a nested UBI
/// volume (the board knows which target partitions are UBI-formatted).
pub type UbiPolicy = dyn FnMut(&CweHeader) -> Option<UbiVolumeSpec>;

enum EngineState {
    OuterHeader,
    InnerHeader,
    /// First payload bytes gathered to sniff a patch magic.
    Probe(Vec<u8>),
    Payload,
    PatchPayload(Box<PatchStream>),
    UbiPayload,
    Complete,
}

impl EngineState {
    fn flag(&self) -> u32 {
        match self {
            EngineState::OuterHeader => 0,
            EngineState::InnerHeader => 1,
            EngineState::Probe(_) => 2,
            EngineState::Payload => 3,
            EngineState::PatchPayload(_) => 4,
            EngineState::UbiPayload => 5,
            EngineState::Complete => 6,
        }
    }
}

/// Default collaborators for packages without delta images.
struct NoSource;

impl SourceReader for NoSource {
    fn read(&mut self, _vol: Option<u32>, _offset: u64, _buf: &mut [u8]) -> Result<()> {
        Err(Error::Unsupported("no patch source configured"))
    }
}

struct NoRunner;

impl PatchRunner for NoRunner {
    fn bspatch(&mut self, _src: &[u8], _patch: &[u8]) -> Result<Vec<u8>> {
        Err(Error::Unsupported("no patch runner configured"))
    }
}

pub struct UpdateEngine {
    writer: PartitionWriter,
    resume: ResumeStore,
    source: Box<dyn SourceReader>,
    runner: Box<dyn PatchRunner>,
    ubi_policy: Box<UbiPolicy>,
    state: EngineState,
    hdr_buf: Vec<u8>,
    current: Option<CweHeader>,
    image_remaining: u64,
    /// Received bytes of the current image payload and their CRC.
    current_image_crc: u32,
    /// Declared outer CRC and payload length, once the outer header is in.
    outer_declared: Option<(u32, u64)>,
    outer_remaining: u64,
    current_global_crc: u32,
    total_read: u64,
    status: UpdateStatus,
}

impl UpdateEngine {
    pub fn new(writer: PartitionWriter, resume: ResumeStore) -> Self {
        UpdateEngine {
            writer,
            resume,
            source: Box::new(NoSource),
            runner: Box::new(NoRunner),
            ubi_policy: Box::new(|_| None),
            state: EngineState::OuterHeader,
            hdr_buf: Vec::new(),
            current: None,
            image_remaining: 0,
            current_image_crc: CRC32_INIT,
            outer_declared: None,
            outer_remaining: 0,
            current_global_crc: CRC32_INIT,
            total_read: 0,
            status: UpdateStatus::Idle,
        }
    }

    /// Installs the collaborators needed by delta images: the reference
    /// reader and the BSDIFF runner.
    pub fn with_patch_support(
        mut self,
        source: Box<dyn SourceReader>,
        runner: Box<dyn PatchRunner>,
    ) -> Self {
        self.source = source;
        self.runner = runner;
        self
    }

    /// Installs the per-image nested-UBI staging policy.
    pub fn with_ubi_policy(mut self, policy: Box<UbiPolicy>) -> Self {
        self.ubi_policy = policy;
        self
    }

    /// Reloads a checkpoint left by an interrupted session. Returns the
    /// byte count the host must re-send from, or `None` for a fresh
    /// start.
    pub fn resume(&mut self) -> Result<Option<u64>> {
        let Some(ctx) = self.resume.load()? else {
            self.status = UpdateStatus::NoBadImageFound;
            return Ok(None);
        };
        self.writer.set_internals(&ctx.internals)?;
        self.total_read = ctx.total_read;
        self.current_global_crc = ctx.current_global_crc;
        self.outer_declared =
            (ctx.full_image_length > 0).then_some((ctx.global_crc, ctx.full_image_length));
        self.outer_remaining = ctx.full_image_length.saturating_sub(
            ctx.total_read.saturating_sub(CWE_HEADER_SIZE as u64),
        );
        self.state = if ctx.flags == EngineState::Complete.flag() {
            EngineState::Complete
        } else if self.outer_declared.is_some() {
            EngineState::InnerHeader
        } else {
            EngineState::OuterHeader
        };
        self.status = UpdateStatus::DownloadInProgress;
        info!("resuming download at byte {}", self.total_read);
        Ok(Some(self.total_read))
    }

    pub fn status(&self) -> UpdateStatus {
        self.status
    }

    pub fn status_label(&self) -> &'static str {
        self.status.label()
    }

    pub fn total_read(&self) -> u64 {
        self.total_read
    }

    pub fn writer(&mut self) -> &mut PartitionWriter {
        &mut self.writer
    }

    /// Releases the staging writer, e.g. after a power cut to reopen the
    /// partition for recovery.
    pub fn into_writer(self) -> PartitionWriter {
        self.writer
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, EngineState::Complete)
    }

    /// Pumps a chunk of downloaded bytes through the state machine.
    pub fn feed(&mut self, data: &[u8]) -> Result<()> {
        match self.feed_inner(data) {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!("download failed: {err}");
                self.status = UpdateStatus::DownloadFailed;
                Err(err)
            }
        }
    }

    fn feed_inner(&mut self, data: &[u8]) -> Result<()> {
        let mut pos = 0usize;
        self.status = UpdateStatus::DownloadInProgress;
        while pos < data.len() {
            let n = match &self.state {
                EngineState::OuterHeader => self.consume_outer_header(&data[pos..])?,
                EngineState::InnerHeader => self.consume_inner_header(&data[pos..])?,
                EngineState::Probe(_) => self.consume_probe(&data[pos..])?,
                EngineState::Payload => self.consume_raw(&data[pos..])?,
                EngineState::PatchPayload(_) => self.consume_patch(&data[pos..])?,
                EngineState::UbiPayload => self.consume_ubi(&data[pos..])?,
                EngineState::Complete => {
                    return Err(Error::BadParameter("data past the end of the package"));
                }
            };
            pos += n;
        }
        Ok(())
    }

    fn consume_outer_header(&mut self, data: &[u8]) -> Result<usize> {
        let want = CWE_HEADER_SIZE - self.hdr_buf.len();
        let n = want.min(data.len());
        self.hdr_buf.extend_from_slice(&data[..n]);
        self.total_read += n as u64;
        if self.hdr_buf.len() < CWE_HEADER_SIZE {
            return Ok(n);
        }
        let hdr_bytes = std::mem::take(&mut self.hdr_buf);
        let hdr = CweHeader::parse(&hdr_bytes)?;
        self.writer.write(&hdr_bytes, false)?;
        if hdr.image_type.is_container() {
            info!(
                "package opened: {} bytes of {:?} content",
                hdr.image_size, hdr.image_type
            );
            self.outer_declared = Some((hdr.crc32, hdr.image_size as u64));
            self.outer_remaining = hdr.image_size as u64;
            self.state = EngineState::InnerHeader;
            self.checkpoint()?;
        } else {
            // A bare single-image package: the header we just read is the
            // image header itself.
            self.begin_image(hdr)?;
        }
        Ok(n)
    }

    fn consume_inner_header(&mut self, data: &[u8]) -> Result<usize> {
        let want = CWE_HEADER_SIZE - self.hdr_buf.len();
        let n = want.min(data.len()).min(self.outer_remaining as usize);
        self.hdr_buf.extend_from_slice(&data[..n]);
        self.total_read += n as u64;
        self.outer_remaining -= n as u64;
        self.current_global_crc = crc32_extend(self.current_global_crc, &data[..n]);
        if self.hdr_buf.len() < CWE_HEADER_SIZE {
            return Ok(n);
        }
        let hdr_bytes = std::mem::take(&mut self.hdr_buf);
        let hdr = CweHeader::parse(&hdr_bytes)?;
        self.writer.write(&hdr_bytes, false)?;
        self.begin_image(hdr)?;
        Ok(n)
    }

    fn begin_image(&mut self, hdr: CweHeader) -> Result<()> {
        debug!(
            "image {:?}: {} bytes (crc {:#010x})",
            hdr.image_type, hdr.image_size, hdr.crc32
        );
        self.image_remaining = hdr.image_size as u64;
        self.current_image_crc = CRC32_INIT;
        self.writer.start_image();

        if let Some(spec) = (self.ubi_policy)(&hdr) {
            self.current = Some(hdr);
            self.writer.open_ubi(UBI_IMAGE_SEQ_BASE, true, true)?;
            self.writer.open_ubi_volume(
                spec.vol_id,
                spec.vol_type,
                spec.size,
                &spec.name,
                true,
            )?;
            self.state = EngineState::UbiPayload;
        } else {
            self.current = Some(hdr);
            self.state = EngineState::Probe(Vec::new());
        }
        if self.image_remaining == 0 {
            if matches!(self.state, EngineState::UbiPayload) {
                self.writer.close_ubi_volume(-1, false)?;
                self.writer.close_ubi(false)?;
            }
            return self.finish_image();
        }
        Ok(())
    }

    fn consume_probe(&mut self, data: &[u8]) -> Result<usize> {
        let EngineState::Probe(probe) = &mut self.state else {
            return Err(Error::Fault("probe state lost"));
        };
        let sniff = 8usize.min(self.image_remaining as usize);
        let want = sniff - probe.len();
        let n = want.min(data.len());
        probe.extend_from_slice(&data[..n]);
        self.total_read += n as u64;
        if probe.len() < sniff {
            return Ok(n);
        }
        let probe = std::mem::take(probe);
        let is_patch =
            probe.len() == 8 && (probe.as_slice() == BPATCH_MAGIC || probe.as_slice() == IMGDIFF2_MAGIC);
        if is_patch {
            let hdr = self.current.as_ref().ok_or(Error::Fault("image header missing"))?;
            let mut stream = Box::new(PatchStream::new(hdr.image_size as u64));
            let consumed =
                stream.feed(&probe, self.source.as_mut(), self.runner.as_mut(), &mut self.writer)?;
            if consumed != probe.len() {
                return Err(Error::Fault("patch stream refused the probe bytes"));
            }
            self.account_payload(&probe);
            self.state = EngineState::PatchPayload(stream);
        } else {
            self.writer.write(&probe, false)?;
            self.account_payload(&probe);
            self.state = EngineState::Payload;
        }
        if self.image_remaining == 0 {
            self.finish_image()?;
        }
        Ok(n)
    }

    fn account_payload(&mut self, bytes: &[u8]) {
        self.current_image_crc = crc32_extend(self.current_image_crc, bytes);
        self.current_global_crc = crc32_extend(self.current_global_crc, bytes);
        self.image_remaining -= bytes.len() as u64;
        self.outer_remaining = self.outer_remaining.saturating_sub(bytes.len() as u64);
    }

    fn consume_raw(&mut self, data: &[u8]) -> Result<usize> {
        let n = (self.image_remaining as usize).min(data.len());
        self.writer.write(&data[..n], false)?;
        self.total_read += n as u64;
        self.account_payload(&data[..n]);
        if self.image_remaining == 0 {
            self.finish_image()?;
        }
        Ok(n)
    }

    fn consume_patch(&mut self, data: &[u8]) -> Result<usize> {
        let EngineState::PatchPayload(stream) = &mut self.state else {
            return Err(Error::Fault("patch state lost"));
        };
        let n = (self.image_remaining as usize).min(data.len());
        let consumed =
            stream.feed(&data[..n], self.source.as_mut(), self.runner.as_mut(), &mut self.writer)?;
        let finished = stream.finished();
        if consumed == 0 && n > 0 {
            return Err(Error::Format("patch stream ended before the image did"));
        }
        self.total_read += consumed as u64;
        self.account_payload(&data[..consumed]);
        if self.image_remaining == 0 {
            if !finished {
                return Err(Error::Format("patch stream ended mid-chunk"));
            }
            self.finish_image()?;
        }
        Ok(consumed)
    }

    fn consume_ubi(&mut self, data: &[u8]) -> Result<usize> {
        let n = (self.image_remaining as usize).min(data.len());
        let is_last = self.image_remaining == n as u64;
        self.writer.write_ubi(&data[..n], is_last)?;
        self.total_read += n as u64;
        self.account_payload(&data[..n]);
        if self.image_remaining == 0 {
            self.writer.close_ubi_volume(-1, false)?;
            self.writer.close_ubi(false)?;
            self.finish_image()?;
        }
        Ok(n)
    }

    /// Verifies the finished image and moves to the next boundary.
    fn finish_image(&mut self) -> Result<()> {
        let hdr = self.current.take().ok_or(Error::Fault("image header missing"))?;
        let was_patch = matches!(self.state, EngineState::PatchPayload(_));
        if hdr.has_valid_crc() {
            // For a delta image the declared CRC covers the destination
            // bytes the writer staged, not the patch stream itself.
            let got = if was_patch { self.writer.image_crc() } else { self.current_image_crc };
            if got != hdr.crc32 {
                warn!(
                    "image {:?} CRC mismatch: expected {:#010x}, got {got:#010x}",
                    hdr.image_type, hdr.crc32
                );
                return Err(Error::Fault("image CRC mismatch"));
            }
        }
        info!("image {:?} complete", hdr.image_type);

        match self.outer_declared {
            Some((outer_crc, _)) if self.outer_remaining == 0 => {
                if self.current_global_crc != outer_crc {
                    return Err(Error::Fault("package CRC mismatch"));
                }
                self.complete()?;
            }
            Some(_) => {
                self.state = EngineState::InnerHeader;
                self.checkpoint_image(&hdr)?;
            }
            None => self.complete()?,
        }
        Ok(())
    }

    fn complete(&mut self) -> Result<()> {
        self.state = EngineState::Complete;
        self.writer.close(false)?;
        self.resume.clear()?;
        self.status = UpdateStatus::DownloadComplete;
        info!("package complete: {} bytes staged", self.writer.get_offset());
        Ok(())
    }

    fn checkpoint_image(&mut self, hdr: &CweHeader) -> Result<()> {
        let mut ctx = self.build_ctx();
        ctx.image_type = *hdr.image_type.tag();
        ctx.image_size = hdr.image_size;
        ctx.image_crc = hdr.crc32;
        ctx.misc_opts = hdr.misc_opts;
        ctx.patch_hdr = hdr.to_bytes().to_vec();
        self.resume.save(&mut ctx)
    }

    fn checkpoint(&mut self) -> Result<()> {
        let mut ctx = self.build_ctx();
        self.resume.save(&mut ctx)
    }

    fn build_ctx(&self) -> ResumeCtx {
        let (global_crc, full_len) = self.outer_declared.unwrap_or((0, 0));
        ResumeCtx {
            current_image_crc: self.current_image_crc,
            global_crc,
            current_global_crc: self.current_global_crc,
            total_read: self.total_read,
            current_offset: self.writer.get_offset(),
            full_image_length: full_len,
            flags: self.state.flag(),
            internals: self.writer.get_internals(),
            ..ResumeCtx::default()
        }
    }

    /// Graceful abort: the staging stream is closed as aborted and the
    /// resume context destroyed; the next open starts fresh.
    pub fn abort(&mut self) -> Result<()> {
        self.writer.close(true)?;
        self.resume.clear()?;
        self.status = UpdateStatus::DownloadFailed;
        Ok(())
    }

    /// Marks the session as timed out (the transport gave up); the
    /// resume context stays so the download can continue later.
    pub fn mark_timeout(&mut self) {
        self.status = UpdateStatus::DownloadTimeout;
    }
}

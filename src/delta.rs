// swifota/src/delta.rs
//
// Delta-patch application. A patch image's payload is a patch meta header
// followed by chunk records; every chunk turns a byte range of a source
// partition (or UBI volume) into destination bytes fed to the staging
// writer. The BSDIFF transform itself is an external collaborator behind
// [`PatchRunner`]; this module owns the stream framing, the source reads,
// the CRC bookkeeping and the deflate re-compression.

use std::io::{Read, Write};

use flate2::Compression;
use log::debug;

use crate::utils::{CRC32_INIT, crc32_extend};
use crate::error::{Error, Result};
use crate::writer::PartitionWriter;

pub const BPATCH_MAGIC: &[u8; 8] = b"BPATCH  ";
pub const IMGDIFF2_MAGIC: &[u8; 8] = b"IMGDIFF2";

/// Patch meta header: magic plus seven big-endian words.
pub const PATCH_META_SIZE: usize = 36;

pub const CHUNK_TYPE_NORMAL: u32 = 0;
pub const CHUNK_TYPE_COPY: u32 = 1;
pub const CHUNK_TYPE_RAW: u32 = 2;
pub const CHUNK_TYPE_DEFLATE: u32 = 3;

pub const CHUNK_META_NORMAL_SIZE: usize = 12;
pub const CHUNK_META_COPY_SIZE: usize = 8;
pub const CHUNK_META_RAW_SIZE: usize = 4;
pub const CHUNK_META_DEFLATE_SIZE: usize = 40;

/// Reads byte ranges of the reference image a patch is applied against:
/// either a raw partition or one volume of a UBI container.
pub trait SourceReader {
    fn read(&mut self, ubi_vol_id: Option<u32>, offset: u64, buf: &mut [u8]) -> Result<()>;
}

/// The external BSDIFF collaborator: given a source window and a patch
/// blob, produce the destination bytes.
pub trait PatchRunner {
    fn bspatch(&mut self, src: &[u8], patch: &[u8]) -> Result<Vec<u8>>;
}

/// Per-image patch description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchMeta {
    /// Legacy whole-image patch (`BPATCH  `) instead of chunked
    /// (`IMGDIFF2`).
    pub legacy: bool,
    pub segment_size: u32,
    pub num_chunks: u32,
    /// Volume holding the source image, or `None` for a raw partition.
    pub ubi_vol_id: Option<u32>,
    pub src_size: u32,
    pub src_crc: u32,
    pub dst_size: u32,
    pub dst_crc: u32,
}

impl PatchMeta {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < PATCH_META_SIZE {
            return Err(Error::BadParameter("patch meta buffer too short"));
        }
        let legacy = match &buf[..8] {
            m if m == BPATCH_MAGIC => true,
            m if m == IMGDIFF2_MAGIC => false,
            _ => return Err(Error::Format("unknown patch magic")),
        };
        let be32 = |off: usize| u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
        let vol = be32(16) as i32;
        Ok(PatchMeta {
            legacy,
            segment_size: be32(8),
            num_chunks: be32(12),
            ubi_vol_id: (vol >= 0).then_some(vol as u32),
            src_size: be32(20),
            src_crc: be32(24),
            dst_size: be32(28),
            dst_crc: be32(32),
        })
    }

    pub fn to_bytes(&self) -> [u8; PATCH_META_SIZE] {
        let mut buf = [0u8; PATCH_META_SIZE];
        buf[..8].copy_from_slice(if self.legacy { BPATCH_MAGIC } else { IMGDIFF2_MAGIC });
        buf[8..12].copy_from_slice(&self.segment_size.to_be_bytes());
        buf[12..16].copy_from_slice(&self.num_chunks.to_be_bytes());
        let vol = self.ubi_vol_id.map(|v| v as i32).unwrap_or(-1);
        buf[16..20].copy_from_slice(&vol.to_be_bytes());
        buf[20..24].copy_from_slice(&self.src_size.to_be_bytes());
        buf[24..28].copy_from_slice(&self.src_crc.to_be_bytes());
        buf[28..32].copy_from_slice(&self.dst_size.to_be_bytes());
        buf[32..36].copy_from_slice(&self.dst_crc.to_be_bytes());
        buf
    }
}

/// Gzip parameters stored with a deflate chunk so the destination can be
/// re-compressed the way the source was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GzipParams {
    pub level: u32,
    pub method: u32,
    pub window_bits: i32,
    pub mem_level: u32,
    pub strategy: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkMeta {
    Normal { src_start: u32, src_len: u32, patch_len: u32 },
    Copy { src_start: u32, src_len: u32 },
    Raw { tgt_len: u32 },
    Deflate {
        src_start: u32,
        src_len: u32,
        src_expand_len: u32,
        tgt_expand_len: u32,
        patch_len: u32,
        gzip: GzipParams,
    },
}

impl ChunkMeta {
    pub fn meta_size(kind: u32) -> Result<usize> {
        match kind {
            CHUNK_TYPE_NORMAL => Ok(CHUNK_META_NORMAL_SIZE),
            CHUNK_TYPE_COPY => Ok(CHUNK_META_COPY_SIZE),
            CHUNK_TYPE_RAW => Ok(CHUNK_META_RAW_SIZE),
            CHUNK_TYPE_DEFLATE => Ok(CHUNK_META_DEFLATE_SIZE),
            _ => Err(Error::Format("unknown patch chunk type")),
        }
    }

    pub fn parse(kind: u32, buf: &[u8]) -> Result<Self> {
        let be32 = |off: usize| u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
        match kind {
            CHUNK_TYPE_NORMAL => Ok(ChunkMeta::Normal {
                src_start: be32(0),
                src_len: be32(4),
                patch_len: be32(8),
            }),
            CHUNK_TYPE_COPY => Ok(ChunkMeta::Copy { src_start: be32(0), src_len: be32(4) }),
            CHUNK_TYPE_RAW => Ok(ChunkMeta::Raw { tgt_len: be32(0) }),
            CHUNK_TYPE_DEFLATE => Ok(ChunkMeta::Deflate {
                src_start: be32(0),
                src_len: be32(4),
                src_expand_len: be32(8),
                tgt_expand_len: be32(12),
                patch_len: be32(16),
                gzip: GzipParams {
                    level: be32(20),
                    method: be32(24),
                    window_bits: be32(28) as i32,
                    mem_level: be32(32),
                    strategy: be32(36),
                },
            }),
            _ => Err(Error::Format("unknown patch chunk type")),
        }
    }

    /// Patch-stream bytes this chunk still needs after its meta record.
    fn patch_bytes(&self) -> usize {
        match self {
            ChunkMeta::Normal { patch_len, .. } => *patch_len as usize,
            ChunkMeta::Copy { .. } => 0,
            ChunkMeta::Raw { tgt_len } => *tgt_len as usize,
            ChunkMeta::Deflate { patch_len, .. } => *patch_len as usize,
        }
    }
}

enum PatchState {
    ReadHeader,
    ReadType,
    ReadMeta(u32),
    ReadPatch(ChunkMeta),
    Done,
}

/// Streaming patch application over one image payload.
pub struct PatchStream {
    state: PatchState,
    meta: Option<PatchMeta>,
    chunks_done: u32,
    buf: Vec<u8>,
    needed: usize,
    /// Patch payload bytes not yet consumed (from the CWE image size).
    image_remaining: u64,
    dst_crc: u32,
    dst_written: u64,
}

impl PatchStream {
    pub fn new(image_size: u64) -> Self {
        PatchStream {
            state: PatchState::ReadHeader,
            meta: None,
            chunks_done: 0,
            buf: Vec::new(),
            needed: PATCH_META_SIZE,
            image_remaining: image_size,
            dst_crc: CRC32_INIT,
            dst_written: 0,
        }
    }

    pub fn meta(&self) -> Option<&PatchMeta> {
        self.meta.as_ref()
    }

    pub fn finished(&self) -> bool {
        matches!(self.state, PatchState::Done)
    }

    /// How many patch-stream bytes the caller should feed next.
    pub fn patch_len_to_read(&self) -> usize {
        (self.needed - self.buf.len()).min(self.image_remaining as usize)
    }

    /// Consumes bytes from the incoming stream, applying chunks as they
    /// complete. Destination bytes go to `out` tagged as patch output.
    /// Returns how many input bytes were consumed.
    pub fn feed(
        &mut self,
        data: &[u8],
        src: &mut dyn SourceReader,
        runner: &mut dyn PatchRunner,
        out: &mut PartitionWriter,
    ) -> Result<usize> {
        let mut consumed = 0usize;
        while consumed < data.len() && !self.finished() {
            let want = self.needed - self.buf.len();
            let n = want.min(data.len() - consumed);
            self.buf.extend_from_slice(&data[consumed..consumed + n]);
            consumed += n;
            self.image_remaining = self.image_remaining.saturating_sub(n as u64);
            if self.buf.len() == self.needed {
                self.step(src, runner, out)?;
            }
        }
        Ok(consumed)
    }

    fn step(
        &mut self,
        src: &mut dyn SourceReader,
        runner: &mut dyn PatchRunner,
        out: &mut PartitionWriter,
    ) -> Result<()> {
        let buf = std::mem::take(&mut self.buf);
        match std::mem::replace(&mut self.state, PatchState::Done) {
            PatchState::ReadHeader => {
                let meta = PatchMeta::parse(&buf)?;
                debug!(
                    "patch: {} chunks, src {} bytes, dst {} bytes",
                    meta.num_chunks, meta.src_size, meta.dst_size
                );
                verify_source(src, &meta)?;
                if meta.legacy {
                    // One whole-image BSDIFF slice; the remaining payload
                    // is the patch blob.
                    let chunk = ChunkMeta::Normal {
                        src_start: 0,
                        src_len: meta.src_size,
                        patch_len: self.image_remaining as u32,
                    };
                    self.needed = chunk.patch_bytes();
                    self.state = PatchState::ReadPatch(chunk);
                } else if meta.num_chunks == 0 {
                    self.state = PatchState::Done;
                } else {
                    self.needed = 4;
                    self.state = PatchState::ReadType;
                }
                self.meta = Some(meta);
            }
            PatchState::ReadType => {
                let kind = u32::from_be_bytes(buf[..4].try_into().unwrap());
                self.needed = ChunkMeta::meta_size(kind)?;
                self.state = PatchState::ReadMeta(kind);
            }
            PatchState::ReadMeta(kind) => {
                let chunk = ChunkMeta::parse(kind, &buf)?;
                self.needed = chunk.patch_bytes();
                if self.needed == 0 {
                    self.apply(chunk, &[], src, runner, out)?;
                } else {
                    self.state = PatchState::ReadPatch(chunk);
                }
            }
            PatchState::ReadPatch(chunk) => {
                self.apply(chunk, &buf, src, runner, out)?;
            }
            PatchState::Done => {}
        }
        Ok(())
    }

    /// Runs one chunk and advances to the next, finishing the stream
    /// after the last one.
    fn apply(
        &mut self,
        chunk: ChunkMeta,
        patch: &[u8],
        src: &mut dyn SourceReader,
        runner: &mut dyn PatchRunner,
        out: &mut PartitionWriter,
    ) -> Result<()> {
        let meta = self.meta.clone().ok_or(Error::Fault("patch meta missing"))?;
        let produced = match chunk {
            ChunkMeta::Normal { src_start, src_len, .. } => {
                let source = read_source(src, &meta, src_start, src_len)?;
                runner.bspatch(&source, patch)?
            }
            ChunkMeta::Copy { src_start, src_len } => read_source(src, &meta, src_start, src_len)?,
            ChunkMeta::Raw { .. } => patch.to_vec(),
            ChunkMeta::Deflate {
                src_start,
                src_len,
                src_expand_len,
                tgt_expand_len,
                gzip,
                ..
            } => {
                let source = read_source(src, &meta, src_start, src_len)?;
                let expanded = inflate(&source, gzip.window_bits, src_expand_len as usize)?;
                let transformed = runner.bspatch(&expanded, patch)?;
                if transformed.len() != tgt_expand_len as usize {
                    return Err(Error::Fault("deflate chunk expanded to the wrong size"));
                }
                deflate(&transformed, &gzip)?
            }
        };

        self.dst_crc = crc32_extend(self.dst_crc, &produced);
        self.dst_written += produced.len() as u64;
        out.write(&produced, true)?;

        self.chunks_done += 1;
        let total = if meta.legacy { 1 } else { meta.num_chunks };
        if self.chunks_done >= total {
            if self.dst_written != meta.dst_size as u64 {
                return Err(Error::Fault("patch produced the wrong destination size"));
            }
            if self.dst_crc != meta.dst_crc {
                return Err(Error::Fault("patch destination CRC mismatch"));
            }
            self.state = PatchState::Done;
            self.needed = 0;
        } else {
            self.needed = 4;
            self.state = PatchState::ReadType;
        }
        Ok(())
    }
}

fn read_source(
    src: &mut dyn SourceReader,
    meta: &PatchMeta,
    start: u32,
    len: u32,
) -> Result<Vec<u8>> {
    if start.checked_add(len).map(|end| end > meta.src_size).unwrap_or(true) {
        return Err(Error::OutOfRange("patch chunk reads past the source image"));
    }
    let mut buf = vec![0u8; len as usize];
    src.read(meta.ubi_vol_id, start as u64, &mut buf)?;
    Ok(buf)
}

/// Checks the declared CRC of the whole source image before any chunk
/// touches it.
fn verify_source(src: &mut dyn SourceReader, meta: &PatchMeta) -> Result<()> {
    let mut crc = CRC32_INIT;
    let mut chunk = vec![0u8; 64 * 1024];
    let mut pos = 0u64;
    while pos < meta.src_size as u64 {
        let n = ((meta.src_size as u64 - pos) as usize).min(chunk.len());
        src.read(meta.ubi_vol_id, pos, &mut chunk[..n])?;
        crc = crc32_extend(crc, &chunk[..n]);
        pos += n as u64;
    }
    if crc != meta.src_crc {
        return Err(Error::Fault("patch source CRC mismatch"));
    }
    Ok(())
}

/// Decompresses `data`; negative window bits mean a raw deflate stream,
/// more than 15 a gzip wrapper, anything else zlib.
fn inflate(data: &[u8], window_bits: i32, expected: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected);
    let n = if window_bits < 0 {
        flate2::read::DeflateDecoder::new(data).read_to_end(&mut out)?
    } else if window_bits > 15 {
        flate2::read::GzDecoder::new(data).read_to_end(&mut out)?
    } else {
        flate2::read::ZlibDecoder::new(data).read_to_end(&mut out)?
    };
    if n != expected {
        return Err(Error::Fault("deflate chunk inflated to the wrong size"));
    }
    Ok(out)
}

/// Re-compresses destination bytes with the parameters stored in the
/// chunk. The byte-exact result can depend on the deflate
/// implementation; the destination CRC declared by the surrounding image
/// stays authoritative.
fn deflate(data: &[u8], params: &GzipParams) -> Result<Vec<u8>> {
    let level = Compression::new(params.level.min(9));
    let mut out = Vec::new();
    if params.window_bits < 0 {
        let mut enc = flate2::write::DeflateEncoder::new(&mut out, level);
        enc.write_all(data)?;
        enc.finish()?;
    } else if params.window_bits > 15 {
        let mut enc = flate2::write::GzEncoder::new(&mut out, level);
        enc.write_all(data)?;
        enc.finish()?;
    } else {
        let mut enc = flate2::write::ZlibEncoder::new(&mut out, level);
        enc.write_all(data)?;
        enc.finish()?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_meta_round_trip() -> Result<()> {
        let meta = PatchMeta {
            legacy: false,
            segment_size: 65536,
            num_chunks: 3,
            ubi_vol_id: Some(1),
            src_size: 100,
            src_crc: 0x11111111,
            dst_size: 120,
            dst_crc: 0x22222222,
        };
        assert_eq!(PatchMeta::parse(&meta.to_bytes())?, meta);

        let raw = PatchMeta { ubi_vol_id: None, legacy: true, ..meta };
        assert_eq!(PatchMeta::parse(&raw.to_bytes())?, raw);
        Ok(())
    }

    #[test]
    fn chunk_meta_sizes_are_fixed() {
        assert_eq!(ChunkMeta::meta_size(CHUNK_TYPE_NORMAL).unwrap(), 12);
        assert_eq!(ChunkMeta::meta_size(CHUNK_TYPE_COPY).unwrap(), 8);
        assert_eq!(ChunkMeta::meta_size(CHUNK_TYPE_RAW).unwrap(), 4);
        assert_eq!(ChunkMeta::meta_size(CHUNK_TYPE_DEFLATE).unwrap(), 40);
        assert!(ChunkMeta::meta_size(9).is_err());
    }

    #[test]
    fn inflate_rejects_wrong_expansion() {
        let compressed = deflate(
            b"hello world",
            &GzipParams { level: 6, method: 8, window_bits: -15, mem_level: 8, strategy: 0 },
        )
        .unwrap();
        assert!(inflate(&compressed, -15, 11).is_ok());
        assert!(inflate(&compressed, -15, 10).is_err());
    }
}

// tests/delta_apply.rs
//
// Delta packages through the engine: chunked IMGDIFF2 payloads with
// copy/raw/normal/deflate chunks, and the legacy whole-image BPATCH
// form. The BSDIFF collaborator is a stub whose "patch" simply carries
// the destination bytes, which keeps every transform checkable.

mod common;

use std::io::Write;

use common::*;
use swifota::delta::{
    CHUNK_TYPE_COPY, CHUNK_TYPE_DEFLATE, CHUNK_TYPE_NORMAL, CHUNK_TYPE_RAW, IMGDIFF2_MAGIC,
    PatchMeta, PatchRunner, SourceReader,
};
use swifota::error::Result;
use swifota::{ImageType, PartitionWriter, ResumeStore, SimNand, UpdateEngine};
use tempfile::tempdir;

/// Reference image held in memory.
struct MemSource(Vec<u8>);

impl SourceReader for MemSource {
    fn read(&mut self, ubi_vol_id: Option<u32>, offset: u64, buf: &mut [u8]) -> Result<()> {
        assert_eq!(ubi_vol_id, None, "these patches target a raw partition");
        let start = offset as usize;
        buf.copy_from_slice(&self.0[start..start + buf.len()]);
        Ok(())
    }
}

/// A BSDIFF stand-in: the patch blob is the destination window.
struct IdentityRunner;

impl PatchRunner for IdentityRunner {
    fn bspatch(&mut self, _src: &[u8], patch: &[u8]) -> Result<Vec<u8>> {
        Ok(patch.to_vec())
    }
}

fn raw_deflate(data: &[u8]) -> Vec<u8> {
    let mut enc =
        flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::new(6));
    enc.write_all(data).expect("deflate");
    enc.finish().expect("deflate finish")
}

fn be32(v: u32) -> [u8; 4] {
    v.to_be_bytes()
}

#[test]
fn imgdiff2_chunks_produce_the_destination_image() {
    // Source: 10000 bytes kept, 8000 bytes patched over, and a
    // deflate-compressed region.
    let kept: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let patched_over: Vec<u8> = vec![0x33; 8_000];
    let old_expanded: Vec<u8> = (0..12_000u32).map(|i| (i % 13) as u8).collect();
    let old_compressed = raw_deflate(&old_expanded);

    let mut source = Vec::new();
    source.extend_from_slice(&kept);
    source.extend_from_slice(&patched_over);
    source.extend_from_slice(&old_compressed);

    // Destination pieces.
    let raw_piece: Vec<u8> = vec![0x44; 5_000];
    let normal_piece: Vec<u8> = (0..6_000u32).map(|i| (i % 7) as u8).collect();
    let new_expanded: Vec<u8> = (0..7_000u32).map(|i| (i % 11) as u8).collect();
    let new_compressed = raw_deflate(&new_expanded);

    let mut dest = Vec::new();
    dest.extend_from_slice(&kept);
    dest.extend_from_slice(&raw_piece);
    dest.extend_from_slice(&normal_piece);
    dest.extend_from_slice(&new_compressed);

    // Chunk records: copy, raw, normal, deflate.
    let mut chunks = Vec::new();
    chunks.extend_from_slice(&be32(CHUNK_TYPE_COPY));
    chunks.extend_from_slice(&be32(0));
    chunks.extend_from_slice(&be32(kept.len() as u32));

    chunks.extend_from_slice(&be32(CHUNK_TYPE_RAW));
    chunks.extend_from_slice(&be32(raw_piece.len() as u32));
    chunks.extend_from_slice(&raw_piece);

    chunks.extend_from_slice(&be32(CHUNK_TYPE_NORMAL));
    chunks.extend_from_slice(&be32(kept.len() as u32));
    chunks.extend_from_slice(&be32(patched_over.len() as u32));
    chunks.extend_from_slice(&be32(normal_piece.len() as u32));
    chunks.extend_from_slice(&normal_piece);

    chunks.extend_from_slice(&be32(CHUNK_TYPE_DEFLATE));
    chunks.extend_from_slice(&be32((kept.len() + patched_over.len()) as u32));
    chunks.extend_from_slice(&be32(old_compressed.len() as u32));
    chunks.extend_from_slice(&be32(old_expanded.len() as u32));
    chunks.extend_from_slice(&be32(new_expanded.len() as u32));
    chunks.extend_from_slice(&be32(new_expanded.len() as u32)); // patch_len
    chunks.extend_from_slice(&be32(6)); // level
    chunks.extend_from_slice(&be32(8)); // method
    chunks.extend_from_slice(&((-15i32) as u32).to_be_bytes()); // window_bits
    chunks.extend_from_slice(&be32(8)); // mem_level
    chunks.extend_from_slice(&be32(0)); // strategy
    chunks.extend_from_slice(&new_expanded);

    let meta = PatchMeta {
        legacy: false,
        segment_size: 64 * 1024,
        num_chunks: 4,
        ubi_vol_id: None,
        src_size: source.len() as u32,
        src_crc: crc32fast::hash(&source),
        dst_size: dest.len() as u32,
        dst_crc: crc32fast::hash(&dest),
    };
    let mut patch_payload = meta.to_bytes().to_vec();
    patch_payload.extend_from_slice(&chunks);
    assert_eq!(&patch_payload[..8], IMGDIFF2_MAGIC);

    // The inner header declares the *destination* CRC.
    let mut inner = swifota::CweHeader::new(
        ImageType::Dsp1,
        PRODUCT,
        patch_payload.len() as u32,
        crc32fast::hash(&dest),
    )
    .to_bytes()
    .to_vec();
    inner.extend_from_slice(&patch_payload);
    let pkg = appl_package(&[inner]);

    let tmp = tempdir().expect("tempdir");
    let writer =
        PartitionWriter::open(open_staging(SimNand::new(staging_geom())), 0).expect("writer");
    let mut engine = UpdateEngine::new(writer, ResumeStore::new(tmp.path()))
        .with_patch_support(Box::new(MemSource(source)), Box::new(IdentityRunner));
    for chunk in pkg.chunks(1000) {
        engine.feed(chunk).expect("feed must succeed");
    }
    assert!(engine.is_complete());

    // The staged bytes after the two headers are the destination image.
    let staged = engine
        .writer()
        .compute_crc32(2 * CWE_HDR as u64, dest.len() as u64)
        .expect("re-read");
    assert_eq!(staged, crc32fast::hash(&dest));
}

#[test]
fn legacy_bpatch_is_a_single_whole_image_slice() {
    let source: Vec<u8> = (0..30_000u32).map(|i| (i % 201) as u8).collect();
    let dest: Vec<u8> = (0..25_000u32).map(|i| (i % 101) as u8).collect();

    let meta = PatchMeta {
        legacy: true,
        segment_size: 64 * 1024,
        num_chunks: 1,
        ubi_vol_id: None,
        src_size: source.len() as u32,
        src_crc: crc32fast::hash(&source),
        dst_size: dest.len() as u32,
        dst_crc: crc32fast::hash(&dest),
    };
    let mut patch_payload = meta.to_bytes().to_vec();
    patch_payload.extend_from_slice(&dest);

    let mut inner = swifota::CweHeader::new(
        ImageType::Modm,
        PRODUCT,
        patch_payload.len() as u32,
        crc32fast::hash(&dest),
    )
    .to_bytes()
    .to_vec();
    inner.extend_from_slice(&patch_payload);
    let pkg = appl_package(&[inner]);

    let tmp = tempdir().expect("tempdir");
    let writer =
        PartitionWriter::open(open_staging(SimNand::new(staging_geom())), 0).expect("writer");
    let mut engine = UpdateEngine::new(writer, ResumeStore::new(tmp.path()))
        .with_patch_support(Box::new(MemSource(source)), Box::new(IdentityRunner));
    for chunk in pkg.chunks(4096) {
        engine.feed(chunk).expect("feed must succeed");
    }
    assert!(engine.is_complete());

    let staged = engine
        .writer()
        .compute_crc32(2 * CWE_HDR as u64, dest.len() as u64)
        .expect("re-read");
    assert_eq!(staged, crc32fast::hash(&dest));
}

#[test]
fn source_crc_mismatch_is_fatal_to_the_image() {
    let source: Vec<u8> = vec![0x77; 1_000];
    let meta = PatchMeta {
        legacy: true,
        segment_size: 64 * 1024,
        num_chunks: 1,
        ubi_vol_id: None,
        src_size: source.len() as u32,
        src_crc: 0x1234_5678, // wrong on purpose
        dst_size: 10,
        dst_crc: 0,
    };
    let mut patch_payload = meta.to_bytes().to_vec();
    patch_payload.extend_from_slice(&[0u8; 10]);

    let mut inner = swifota::CweHeader::new(
        ImageType::Modm,
        PRODUCT,
        patch_payload.len() as u32,
        0,
    )
    .to_bytes()
    .to_vec();
    inner.extend_from_slice(&patch_payload);
    let pkg = appl_package(&[inner]);

    let tmp = tempdir().expect("tempdir");
    let writer =
        PartitionWriter::open(open_staging(SimNand::new(staging_geom())), 0).expect("writer");
    let mut engine = UpdateEngine::new(writer, ResumeStore::new(tmp.path()))
        .with_patch_support(Box::new(MemSource(source)), Box::new(IdentityRunner));

    let mut failed = false;
    for chunk in pkg.chunks(4096) {
        if engine.feed(chunk).is_err() {
            failed = true;
            break;
        }
    }
    assert!(failed, "a source CRC mismatch must fail the image");
    assert_eq!(engine.status_label(), "Download failed");
}

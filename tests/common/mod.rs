// tests/common/mod.rs
#![allow(dead_code)]

use swifota::cwe::{CWE_HEADER_SIZE, CweHeader};
use swifota::{FlashDevice, FlashGeometry, ImageType, OpenFlags, PartitionWriter, SimNand};

/// A product id from the compiled allow-list.
pub const PRODUCT: [u8; 4] = *b"9X07";

/// Scenario chunks are 20000 bytes each.
pub const CHUNK: usize = 20000;

pub const CWE_HDR: usize = CWE_HEADER_SIZE;

/// Small-page geometry so scenario payloads span many erase blocks:
/// 512-byte pages, 16 KiB blocks, 128 blocks.
pub fn staging_geom() -> FlashGeometry {
    FlashGeometry::new(512, 16 * 1024, 128)
}

pub fn open_staging(sim: SimNand) -> FlashDevice {
    FlashDevice::open(
        "swifota",
        Box::new(sim),
        OpenFlags::read_write().mark_bad_on_erase(),
    )
    .expect("staging partition must open")
}

pub fn open_writer(sim: SimNand) -> PartitionWriter {
    PartitionWriter::open(open_staging(sim), 0).expect("staging writer must open")
}

/// `count` chunks of `CHUNK` bytes with the repeating fill pattern
/// `base, base + 0x10, base + 0x20, ...`.
pub fn pattern_chunks(count: usize, base: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(count * CHUNK);
    for i in 0..count {
        out.extend(std::iter::repeat_n(base.wrapping_add(0x10 * i as u8), CHUNK));
    }
    out
}

/// One inner image: header plus payload, CRC filled in.
pub fn cwe_image(image_type: ImageType, payload: &[u8]) -> Vec<u8> {
    let hdr = CweHeader::new(
        image_type,
        PRODUCT,
        payload.len() as u32,
        crc32fast::hash(payload),
    );
    let mut out = hdr.to_bytes().to_vec();
    out.extend_from_slice(payload);
    out
}

/// Wraps already-framed inner images into an outer `APPL` container.
pub fn appl_package(images: &[Vec<u8>]) -> Vec<u8> {
    let payload: Vec<u8> = images.concat();
    let outer = CweHeader::new(
        ImageType::Appl,
        PRODUCT,
        payload.len() as u32,
        crc32fast::hash(&payload),
    );
    let mut out = outer.to_bytes().to_vec();
    out.extend_from_slice(&payload);
    out
}

/// Reads a volume of the attached container back as one byte vector.
pub fn read_volume(dev: &mut FlashDevice, vol_id: u32, len: usize) -> Vec<u8> {
    dev.ubi_select_volume(vol_id).expect("volume must select");
    let leb = dev.ubi_leb_size() as usize;
    let mut out = Vec::new();
    let mut lnum = 0;
    while out.len() < len {
        let mut buf = vec![0u8; leb];
        let n = dev.ubi_read_leb(lnum, &mut buf).expect("LEB must read");
        assert!(n > 0, "volume ended before {len} bytes");
        out.extend_from_slice(&buf[..n]);
        lnum += 1;
    }
    out.truncate(len);
    out
}

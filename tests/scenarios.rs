// tests/scenarios.rs
//
// End-to-end staging scenarios: a full package through the update
// engine, interrupted sessions resumed byte-accurately, and adversarial
// bad-block masks applied at erase time.

mod common;

use common::*;
use rand::{Rng, SeedableRng, rngs::StdRng};
use swifota::ubi::headers::VolType;
use swifota::{
    FlashDevice, ImageType, OpenFlags, PartitionWriter, ResumeStore, SimNand, UbiVolumeSpec,
    UpdateEngine,
};
use tempfile::tempdir;

fn ubi_policy_for_s2(hdr: &swifota::CweHeader) -> Option<UbiVolumeSpec> {
    match hdr.image_type {
        ImageType::Syst => Some(UbiVolumeSpec {
            vol_id: 0,
            vol_type: VolType::Static,
            size: (4 * CHUNK) as i64,
            name: "volume0".to_string(),
        }),
        ImageType::User => Some(UbiVolumeSpec {
            vol_id: 1,
            vol_type: VolType::Dynamic,
            size: -1,
            name: "volume1".to_string(),
        }),
        _ => None,
    }
}

fn run_package(sim: SimNand, pkg: &[u8]) -> UpdateEngine {
    let tmp = tempdir().expect("tempdir");
    let writer = PartitionWriter::open(open_staging(sim), 0).expect("writer");
    let mut engine = UpdateEngine::new(writer, ResumeStore::new(tmp.path()));
    for chunk in pkg.chunks(4096) {
        engine.feed(chunk).expect("feed must succeed");
    }
    assert!(engine.is_complete(), "package must complete");
    engine
}

// S1: a single USER image of eight 20000-byte chunks inside an APPL
// container; the staged bytes after the outer header must carry the
// outer header's CRC.
#[test]
fn s1_single_user_image() {
    let payload = pattern_chunks(8, 0x07);
    let pkg = appl_package(&[cwe_image(ImageType::User, &payload)]);

    let mut engine = run_package(SimNand::new(staging_geom()), &pkg);
    assert_eq!(engine.status_label(), "Download complete");

    let expected = crc32fast::hash(&pkg[CWE_HDR..]);
    let staged = engine
        .writer()
        .compute_crc32(CWE_HDR as u64, (8 * CHUNK + CWE_HDR) as u64)
        .expect("re-read");
    assert_eq!(staged, expected, "staged content CRC must match the outer header");
}

// S2: BOOT raw, SYST as a static nested UBI volume, USER as a dynamic
// one. Both nested containers must parse and read back; the engine
// verifies the outer CRC on close.
#[test]
fn s2_mixed_raw_and_nested_ubi() {
    let boot = pattern_chunks(8, 0x0A);
    let syst = pattern_chunks(4, 0x0B);
    let user = pattern_chunks(5, 0x0C);
    let pkg = appl_package(&[
        cwe_image(ImageType::Boot, &boot),
        cwe_image(ImageType::Syst, &syst),
        cwe_image(ImageType::User, &user),
    ]);

    let tmp = tempdir().expect("tempdir");
    let writer = PartitionWriter::open(open_staging(SimNand::new(staging_geom())), 0)
        .expect("writer");
    let mut engine = UpdateEngine::new(writer, ResumeStore::new(tmp.path()))
        .with_ubi_policy(Box::new(ubi_policy_for_s2));
    for chunk in pkg.chunks(4096) {
        engine.feed(chunk).expect("feed must succeed");
    }
    assert!(engine.is_complete());

    // BOOT stays raw right after the two headers.
    let boot_crc = engine
        .writer()
        .compute_crc32(2 * CWE_HDR as u64, boot.len() as u64)
        .expect("re-read");
    assert_eq!(boot_crc, crc32fast::hash(&boot));

    // First container starts after outer + BOOT image + SYST header.
    let dev = engine.writer().device();
    let erase = dev.geometry().erase_size as u64;
    let base_a = (3 * CWE_HDR + boot.len()) as u64;
    dev.ubi_attach(base_a).expect("container A must attach");
    assert_eq!(read_volume(dev, 0, syst.len()), syst);
    let info = dev.ubi_volume_info().expect("volume info");
    assert_eq!(info.vol_type, VolType::Static);
    assert_eq!(info.name, "volume0");

    let consumed_a = dev.ubi_consumed_pebs().expect("consumed") as u64;
    let base_b = base_a + consumed_a * erase + CWE_HDR as u64;
    dev.ubi_attach(base_b).expect("container B must attach");
    assert_eq!(read_volume(dev, 1, user.len()), user);
    let info = dev.ubi_volume_info().expect("volume info");
    assert_eq!(info.vol_type, VolType::Dynamic);
    assert_eq!(info.name, "volume1");
}

// S3: S1 interrupted after three data chunks at the writer level;
// snapshotting internals and completing after a reopen yields the same
// flash CRCs as the uninterrupted run.
#[test]
fn s3_interrupted_raw_write_resumes_byte_accurate() {
    let payload = pattern_chunks(8, 0x07);
    let pkg = appl_package(&[cwe_image(ImageType::User, &payload)]);

    let mut whole = open_writer(SimNand::new(staging_geom()));
    whole.write(&pkg, false).expect("write");
    whole.close(false).expect("close");
    let expected = whole.compute_crc32(0, pkg.len() as u64).expect("re-read");

    let cut = 2 * CWE_HDR + 3 * CHUNK;
    let mut first = open_writer(SimNand::new(staging_geom()));
    first.write(&pkg[..cut], false).expect("write");
    let snapshot = first.get_internals();
    let offset = first.get_offset();
    assert_eq!(offset, cut as u64);

    // Power loss: drop the writer without closing, keep the flash.
    let backend = first.into_device().into_backend();
    let dev = FlashDevice::open(
        "swifota",
        backend,
        OpenFlags::read_write().mark_bad_on_erase(),
    )
    .expect("reopen");
    let mut second = PartitionWriter::open(dev, offset).expect("reopen writer");
    second.set_internals(&snapshot).expect("restore");
    second.write(&pkg[cut..], false).expect("write rest");
    second.close(false).expect("close");

    assert_eq!(second.compute_crc32(0, pkg.len() as u64).expect("re-read"), expected);
    assert_eq!(second.global_crc(), crc32fast::hash(&pkg));
}

// S4: a session interrupted inside a dynamic nested UBI volume resumes
// through openUbi + openUbiVolume and finishes identical to the
// uninterrupted twin.
#[test]
fn s4_interrupted_nested_ubi_resumes() {
    let syst = pattern_chunks(4, 0x0B);
    let user = pattern_chunks(5, 0x0C);

    let drive_until_cut = |w: &mut PartitionWriter| {
        w.write(&[0x5A; CWE_HDR], false).expect("header");
        w.open_ubi(0x01020304, true, true).expect("container");
        w.open_ubi_volume(0, VolType::Static, (4 * CHUNK) as i64, "volume0", true)
            .expect("volume0");
        w.write_ubi(&syst, true).expect("volume0 data");
        w.close_ubi_volume((4 * CHUNK) as i64, false).expect("close volume0");
        w.close_ubi(false).expect("close container");
        w.write(&[0xA5; CWE_HDR], false).expect("header");
        w.open_ubi(0x01020304, true, true).expect("container");
        w.open_ubi_volume(1, VolType::Dynamic, -1, "volume1", true).expect("volume1");
        w.write_ubi(&user[..2 * CHUNK], false).expect("partial volume1");
    };
    let finish = |w: &mut PartitionWriter| {
        w.write_ubi(&user[2 * CHUNK..], true).expect("rest of volume1");
        w.close_ubi_volume(-1, false).expect("close volume1");
        w.close_ubi(false).expect("close container");
        w.close(false).expect("close");
    };

    let mut whole = open_writer(SimNand::new(staging_geom()));
    drive_until_cut(&mut whole);
    finish(&mut whole);
    let expected_crc = whole.global_crc();
    let expected_end = whole.get_offset();

    let mut first = open_writer(SimNand::new(staging_geom()));
    drive_until_cut(&mut first);
    let snapshot = first.get_internals();
    let offset = first.get_offset();

    let backend = first.into_device().into_backend();
    let dev = FlashDevice::open(
        "swifota",
        backend,
        OpenFlags::read_write().mark_bad_on_erase(),
    )
    .expect("reopen");
    let mut second = PartitionWriter::open(dev, offset).expect("reopen writer");
    second.set_internals(&snapshot).expect("restore");
    second.open_ubi(0, false, false).expect("reattach container");
    second
        .open_ubi_volume(1, VolType::Dynamic, -1, "volume1", false)
        .expect("reselect volume1");
    finish(&mut second);

    assert_eq!(second.global_crc(), expected_crc);
    assert_eq!(second.get_offset(), expected_end);

    // Both volumes must read back from the resumed flash.
    let dev = second.device();
    let base_a = CWE_HDR as u64;
    dev.ubi_attach(base_a).expect("container A");
    assert_eq!(read_volume(dev, 0, syst.len()), syst);
    let erase = dev.geometry().erase_size as u64;
    let consumed_a = dev.ubi_consumed_pebs().expect("consumed") as u64;
    let base_b = base_a + consumed_a * erase + CWE_HDR as u64;
    dev.ubi_attach(base_b).expect("container B");
    assert_eq!(read_volume(dev, 1, user.len()), user);
}

// S5: the S1 flow with an adversarial erase-failure mask; the download
// still completes, the CRC still matches, and at least one block got
// marked bad.
#[test]
fn s5_bad_block_mask_during_s1() {
    let payload = pattern_chunks(8, 0x07);
    let pkg = appl_package(&[cwe_image(ImageType::User, &payload)]);

    let sim = SimNand::new(staging_geom()).with_erase_failures(0x11182 | (1 << 59));
    let mut engine = run_package(sim, &pkg);

    let expected = crc32fast::hash(&pkg[CWE_HDR..]);
    let staged = engine
        .writer()
        .compute_crc32(CWE_HDR as u64, (8 * CHUNK + CWE_HDR) as u64)
        .expect("re-read");
    assert_eq!(staged, expected);

    let stats = engine.writer().device().ecc_stats().expect("ecc stats");
    assert!(stats.bad_blocks >= 1, "at least one block must be marked bad");
}

// Property 1: any write trace re-read through the staging volume hashes
// to the CRC of the bytes written.
#[test]
fn round_trip_crc_over_arbitrary_write_trace() {
    let mut rng = StdRng::seed_from_u64(0x5757);
    let mut writer = open_writer(SimNand::new(staging_geom()));
    let mut all = Vec::new();
    for len in [1usize, 511, 512, 4096, 20000, 33333, 7] {
        let chunk: Vec<u8> = (0..len).map(|_| rng.random()).collect();
        writer.write(&chunk, false).expect("write");
        all.extend_from_slice(&chunk);
    }
    writer.close(false).expect("close");
    let staged = writer.compute_crc32(0, all.len() as u64).expect("re-read");
    assert_eq!(staged, crc32fast::hash(&all));
}

// Property 3: the full round-trip runs once per adversarial mask.
#[test]
fn bad_block_masks_do_not_corrupt_the_stream() {
    let payload = pattern_chunks(8, 0x07);
    let pkg = appl_package(&[cwe_image(ImageType::User, &payload)]);
    let expected = crc32fast::hash(&pkg[CWE_HDR..]);

    for mask in [0u64, 0x11182, 0xFF0] {
        let sim = SimNand::new(staging_geom()).with_erase_failures(mask);
        let mut engine = run_package(sim, &pkg);
        let staged = engine
            .writer()
            .compute_crc32(CWE_HDR as u64, (8 * CHUNK + CWE_HDR) as u64)
            .expect("re-read");
        assert_eq!(staged, expected, "mask {mask:#x} must not corrupt the stream");
    }
}

// A resumed engine restarts from the last image boundary and finishes
// the package.
#[test]
fn engine_resumes_from_checkpoint() {
    let boot = pattern_chunks(2, 0x0A);
    let user = pattern_chunks(2, 0x0C);
    let pkg = appl_package(&[
        cwe_image(ImageType::Boot, &boot),
        cwe_image(ImageType::User, &user),
    ]);

    let tmp = tempdir().expect("tempdir");
    let writer = PartitionWriter::open(open_staging(SimNand::new(staging_geom())), 0)
        .expect("writer");
    let mut engine = UpdateEngine::new(writer, ResumeStore::new(tmp.path()));

    // Stop right after the first image completed (one header + payload).
    let stop = 2 * CWE_HDR + boot.len();
    engine.feed(&pkg[..stop]).expect("first half");
    assert!(!engine.is_complete());

    // Power loss: recover flash + context, re-send from total_read.
    let backend = engine.into_writer().into_device().into_backend();
    let dev = FlashDevice::open(
        "swifota",
        backend,
        OpenFlags::read_write().mark_bad_on_erase(),
    )
    .expect("reopen");
    let writer = PartitionWriter::open(dev, 0).expect("writer");
    let mut engine = UpdateEngine::new(writer, ResumeStore::new(tmp.path()));
    let resend_from = engine.resume().expect("resume").expect("context must exist");
    assert_eq!(resend_from, stop as u64);
    engine.feed(&pkg[stop..]).expect("second half");
    assert!(engine.is_complete());

    let expected = crc32fast::hash(&pkg[CWE_HDR..]);
    let staged = engine
        .writer()
        .compute_crc32(CWE_HDR as u64, (pkg.len() - CWE_HDR) as u64)
        .expect("re-read");
    assert_eq!(staged, expected);
}

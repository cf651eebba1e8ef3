// swifota/src/ubi/mod.rs

pub mod headers;
pub mod volume;

pub use headers::{EcHdr, VidHdr, VolType, VtblRecord};
pub use volume::UbiVolumeInfo;

/// EC header magic, `UBI#`.
pub const UBI_EC_HDR_MAGIC: u32 = 0x5542_4923;
/// VID header magic, `UBI!`.
pub const UBI_VID_HDR_MAGIC: u32 = 0x5542_4921;
/// On-flash format version implemented here.
pub const UBI_VERSION: u8 = 1;
/// Volume id of the layout volume hosting the volume table.
pub const UBI_LAYOUT_VOLUME_ID: u32 = 0x7FFF_FEFF;
/// Image sequence stamped into fresh containers.
pub const UBI_IMAGE_SEQ_BASE: u32 = 0x0102_0304;
/// Number of records in a volume table.
pub const UBI_MAX_VOLUMES: usize = 128;
/// Longest volume name, excluding the terminator.
pub const UBI_VOL_NAME_MAX: usize = 127;
/// Erase counters saturate here instead of wrapping.
pub const UBI_MAX_ERASECOUNTER: u64 = 0x7FFF_FFFF;
/// Reserved bad-block budget per 1024 PEBs.
pub const UBI_BEB_LIMIT: u32 = 20;

pub const UBI_EC_HDR_SIZE: usize = 64;
pub const UBI_VID_HDR_SIZE: usize = 64;
pub const UBI_VTBL_RECORD_SIZE: usize = 172;

/// Bad-block budget for a partition of `nb_blk` blocks.
pub fn beb_limit(nb_blk: u32) -> u32 {
    UBI_BEB_LIMIT.max(nb_blk / 1024 * UBI_BEB_LIMIT)
}

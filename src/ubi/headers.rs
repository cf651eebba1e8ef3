// swifota/src/ubi/headers.rs

use crc::{CRC_32_JAMCRC, Crc};

use crate::error::{Error, Result};
use crate::ubi::{
    UBI_EC_HDR_MAGIC, UBI_EC_HDR_SIZE, UBI_MAX_ERASECOUNTER, UBI_VERSION, UBI_VID_HDR_MAGIC,
    UBI_VID_HDR_SIZE, UBI_VOL_NAME_MAX, UBI_VTBL_RECORD_SIZE,
};

/// The UBI on-flash checksum: CRC-32 seeded with `0xFFFFFFFF` and not
/// post-inverted.
pub const UBI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);

pub fn ubi_crc32(data: &[u8]) -> u32 {
    UBI_CRC.checksum(data)
}

fn is_erased(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0xFF)
}

/// Classifies a raw header region per the on-flash rules: fully erased,
/// wrong magic, wrong version, bad CRC, or good.
fn check_header(buf: &[u8], magic: u32, crc_offset: usize) -> Result<()> {
    if is_erased(buf) {
        return Err(Error::Format("erased block"));
    }
    if u32::from_be_bytes(buf[0..4].try_into().unwrap()) != magic {
        return Err(Error::Unsupported("not a UBI header"));
    }
    if buf[4] != UBI_VERSION {
        return Err(Error::Fault("unknown UBI version"));
    }
    let stored = u32::from_be_bytes(buf[crc_offset..crc_offset + 4].try_into().unwrap());
    if stored != ubi_crc32(&buf[..crc_offset]) {
        return Err(Error::Fault("UBI header CRC mismatch"));
    }
    Ok(())
}

/// Erase-count header, first page of every PEB in a UBI container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcHdr {
    pub ec: u64,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,
    pub image_seq: u32,
}

impl EcHdr {
    pub fn new(write_size: u32, image_seq: u32) -> Self {
        EcHdr {
            ec: 0,
            vid_hdr_offset: write_size,
            data_offset: 2 * write_size,
            image_seq,
        }
    }

    /// Bump the monotonic erase counter, saturating at the on-flash cap.
    pub fn incremented(mut self) -> Self {
        if self.ec < UBI_MAX_ERASECOUNTER {
            self.ec += 1;
        }
        self
    }

    pub fn to_bytes(&self) -> [u8; UBI_EC_HDR_SIZE] {
        let mut buf = [0u8; UBI_EC_HDR_SIZE];
        buf[0..4].copy_from_slice(&UBI_EC_HDR_MAGIC.to_be_bytes());
        buf[4] = UBI_VERSION;
        // Bytes 5-7: padding
        buf[8..16].copy_from_slice(&self.ec.to_be_bytes());
        buf[16..20].copy_from_slice(&self.vid_hdr_offset.to_be_bytes());
        buf[20..24].copy_from_slice(&self.data_offset.to_be_bytes());
        buf[24..28].copy_from_slice(&self.image_seq.to_be_bytes());
        // Bytes 28-59: padding
        let crc = ubi_crc32(&buf[..60]);
        buf[60..64].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < UBI_EC_HDR_SIZE {
            return Err(Error::BadParameter("EC header buffer too short"));
        }
        let buf = &buf[..UBI_EC_HDR_SIZE];
        check_header(buf, UBI_EC_HDR_MAGIC, 60)?;
        Ok(EcHdr {
            ec: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
            vid_hdr_offset: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
            data_offset: u32::from_be_bytes(buf[20..24].try_into().unwrap()),
            image_seq: u32::from_be_bytes(buf[24..28].try_into().unwrap()),
        })
    }
}

/// UBI volume types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolType {
    /// Readable and writable in any LEB order.
    Dynamic,
    /// Written once, sized by `data_size` per LEB.
    Static,
}

impl From<VolType> for u8 {
    fn from(value: VolType) -> u8 {
        match value {
            VolType::Dynamic => 1,
            VolType::Static => 2,
        }
    }
}

impl TryFrom<u8> for VolType {
    type Error = Error;

    fn try_from(value: u8) -> Result<VolType> {
        match value {
            1 => Ok(VolType::Dynamic),
            2 => Ok(VolType::Static),
            _ => Err(Error::Format("unknown UBI volume type")),
        }
    }
}

/// Volume-identifier header, second page of every mapped PEB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VidHdr {
    pub vol_type: VolType,
    pub copy_flag: u8,
    pub compat: u8,
    pub vol_id: u32,
    pub lnum: u32,
    pub data_size: u32,
    pub used_ebs: u32,
    pub data_pad: u32,
    pub data_crc: u32,
    pub sqnum: u64,
}

impl VidHdr {
    /// A fresh header for `(vol_id, lnum)`. Static volumes carry the data
    /// size and CRC of the LEB plus the volume's total LEB count.
    pub fn new(vol_type: VolType, vol_id: u32, lnum: u32, sqnum: u64) -> Self {
        VidHdr {
            vol_type,
            copy_flag: 0,
            compat: 0,
            vol_id,
            lnum,
            data_size: 0,
            used_ebs: 0,
            data_pad: 0,
            data_crc: 0,
            sqnum,
        }
    }

    pub fn to_bytes(&self) -> [u8; UBI_VID_HDR_SIZE] {
        let mut buf = [0u8; UBI_VID_HDR_SIZE];
        buf[0..4].copy_from_slice(&UBI_VID_HDR_MAGIC.to_be_bytes());
        buf[4] = UBI_VERSION;
        buf[5] = self.vol_type.into();
        buf[6] = self.copy_flag;
        buf[7] = self.compat;
        buf[8..12].copy_from_slice(&self.vol_id.to_be_bytes());
        buf[12..16].copy_from_slice(&self.lnum.to_be_bytes());
        // Bytes 16-19: padding
        buf[20..24].copy_from_slice(&self.data_size.to_be_bytes());
        buf[24..28].copy_from_slice(&self.used_ebs.to_be_bytes());
        buf[28..32].copy_from_slice(&self.data_pad.to_be_bytes());
        buf[32..36].copy_from_slice(&self.data_crc.to_be_bytes());
        // Bytes 36-39: padding
        buf[40..48].copy_from_slice(&self.sqnum.to_be_bytes());
        // Bytes 48-59: padding
        let crc = ubi_crc32(&buf[..60]);
        buf[60..64].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < UBI_VID_HDR_SIZE {
            return Err(Error::BadParameter("VID header buffer too short"));
        }
        let buf = &buf[..UBI_VID_HDR_SIZE];
        check_header(buf, UBI_VID_HDR_MAGIC, 60)?;
        Ok(VidHdr {
            vol_type: VolType::try_from(buf[5])?,
            copy_flag: buf[6],
            compat: buf[7],
            vol_id: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            lnum: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
            data_size: u32::from_be_bytes(buf[20..24].try_into().unwrap()),
            used_ebs: u32::from_be_bytes(buf[24..28].try_into().unwrap()),
            data_pad: u32::from_be_bytes(buf[28..32].try_into().unwrap()),
            data_crc: u32::from_be_bytes(buf[32..36].try_into().unwrap()),
            sqnum: u64::from_be_bytes(buf[40..48].try_into().unwrap()),
        })
    }
}

/// One record of the volume table.
///
/// An inactive slot is all zeroes with a valid CRC; `reserved_pebs` of
/// `0xFFFFFFFF` means the slot was never programmed and is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VtblRecord {
    pub reserved_pebs: u32,
    pub alignment: u32,
    pub data_pad: u32,
    pub vol_type: u8,
    pub upd_marker: u8,
    pub name: String,
    pub flags: u8,
}

impl VtblRecord {
    pub fn free() -> Self {
        VtblRecord {
            reserved_pebs: 0,
            alignment: 0,
            data_pad: 0,
            vol_type: 0,
            upd_marker: 0,
            name: String::new(),
            flags: 0,
        }
    }

    pub fn new(vol_type: VolType, name: &str, reserved_pebs: u32) -> Result<Self> {
        if name.len() > UBI_VOL_NAME_MAX {
            return Err(Error::BadParameter("volume name too long"));
        }
        Ok(VtblRecord {
            reserved_pebs,
            alignment: 1,
            data_pad: 0,
            vol_type: vol_type.into(),
            upd_marker: 0,
            name: name.to_string(),
            flags: 0,
        })
    }

    /// An active record describes a live volume.
    pub fn is_active(&self) -> bool {
        self.reserved_pebs > 0 && self.reserved_pebs != 0xFFFF_FFFF
    }

    pub fn volume_type(&self) -> Result<VolType> {
        VolType::try_from(self.vol_type)
    }

    pub fn to_bytes(&self) -> [u8; UBI_VTBL_RECORD_SIZE] {
        let mut buf = [0u8; UBI_VTBL_RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.reserved_pebs.to_be_bytes());
        buf[4..8].copy_from_slice(&self.alignment.to_be_bytes());
        buf[8..12].copy_from_slice(&self.data_pad.to_be_bytes());
        buf[12] = self.vol_type;
        buf[13] = self.upd_marker;
        buf[14..16].copy_from_slice(&(self.name.len() as u16).to_be_bytes());
        buf[16..16 + self.name.len()].copy_from_slice(self.name.as_bytes());
        buf[144] = self.flags;
        // Bytes 145-167: padding
        let crc = ubi_crc32(&buf[..168]);
        buf[168..172].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < UBI_VTBL_RECORD_SIZE {
            return Err(Error::BadParameter("VTBL record buffer too short"));
        }
        let buf = &buf[..UBI_VTBL_RECORD_SIZE];
        let stored = u32::from_be_bytes(buf[168..172].try_into().unwrap());
        if stored != ubi_crc32(&buf[..168]) {
            return Err(Error::Fault("VTBL record CRC mismatch"));
        }
        let name_len = u16::from_be_bytes(buf[14..16].try_into().unwrap()) as usize;
        if name_len > UBI_VOL_NAME_MAX {
            return Err(Error::Format("VTBL record name length out of range"));
        }
        let name = std::str::from_utf8(&buf[16..16 + name_len])
            .map_err(|_| Error::Format("VTBL record name is not UTF-8"))?
            .to_string();
        Ok(VtblRecord {
            reserved_pebs: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            alignment: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            data_pad: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            vol_type: buf[12],
            upd_marker: buf[13],
            name,
            flags: buf[144],
        })
    }
}

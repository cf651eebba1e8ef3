// swifota/src/cwe.rs

use crate::error::{Error, Result};

/// Size of every CWE header on the wire.
pub const CWE_HEADER_SIZE: usize = 400;
/// Oldest header revision this engine accepts.
pub const CWE_CURRENT_HDR_REV: u32 = 3;
/// Mandatory signature of application (outer) containers.
pub const CWE_APPL_SIGNATURE: u32 = 0x5753_5751;
/// `misc_opts` bit 0: payload is compressed (refused here).
pub const CWE_MISC_OPT_COMPRESSED: u8 = 0x01;
/// `crc_indicator` value meaning the `crc32` field is populated.
pub const CWE_CRC_VALID: u32 = 0x0000_0000;
/// `crc_indicator` value meaning the `crc32` field is unset.
pub const CWE_CRC_NOT_SET: u32 = 0xFFFF_FFFF;

/// Fixed header field offsets. The product-specific block occupies bytes
/// 0..256 and is covered by `crc_prod_buf`.
pub const CWE_PSB_SIZE: usize = 256;
pub const CWE_HDR_REV_OFFSET: usize = 256;
pub const CWE_IMAGE_TYPE_OFFSET: usize = 260;
pub const CWE_PROD_ID_OFFSET: usize = 264;
pub const CWE_IMAGE_SIZE_OFFSET: usize = 268;
pub const CWE_CRC32_OFFSET: usize = 272;
pub const CWE_VERSION_OFFSET: usize = 276;
pub const CWE_VERSION_SIZE: usize = 84;
pub const CWE_DATE_OFFSET: usize = 360;
pub const CWE_DATE_SIZE: usize = 8;
pub const CWE_COMPAT_OFFSET: usize = 368;
pub const CWE_MISC_OPTS_OFFSET: usize = 372;
pub const CWE_STOR_ADDR_OFFSET: usize = 376;
pub const CWE_PROG_ADDR_OFFSET: usize = 380;
pub const CWE_ENTRY_PT_OFFSET: usize = 384;
pub const CWE_SIGNATURE_OFFSET: usize = 388;
pub const CWE_CRC_PROD_BUF_OFFSET: usize = 392;
pub const CWE_CRC_IND_OFFSET: usize = 396;

/// Product identifiers this build accepts.
pub const CWE_PRODUCT_IDS: &[[u8; 4]] =
    &[*b"9X07", *b"9X28", *b"9X40", *b"9X55", *b"AR75", *b"AR86", *b"WP76", *b"WP77"];

macro_rules! image_types {
    ($($variant:ident => $tag:literal,)*) => {
        /// The image kind carried in a CWE header, a 4-character tag on
        /// the wire.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum ImageType {
            $($variant,)*
        }

        impl ImageType {
            pub fn tag(&self) -> &'static [u8; 4] {
                match self {
                    $(ImageType::$variant => $tag,)*
                }
            }

            pub fn from_tag(tag: &[u8; 4]) -> Option<ImageType> {
                match tag {
                    $($tag => Some(ImageType::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

image_types! {
    Qpar => b"QPAR",
    Sbl1 => b"SBL1",
    Sbl2 => b"SBL2",
    Dsp1 => b"DSP1",
    Dsp2 => b"DSP2",
    Dsp3 => b"DSP3",
    Qrpm => b"QRPM",
    Boot => b"BOOT",
    Appl => b"APPL",
    Osbl => b"OSBL",
    Amss => b"AMSS",
    Apps => b"APPS",
    Apbl => b"APBL",
    Nvbf => b"NVBF",
    Nvbo => b"NVBO",
    Nvbu => b"NVBU",
    Exec => b"EXEC",
    Swoc => b"SWOC",
    Foto => b"FOTO",
    File => b"FILE",
    Spkg => b"SPKG",
    Modm => b"MODM",
    Syst => b"SYST",
    User => b"USER",
    Hdat => b"HDAT",
    Nvbc => b"NVBC",
    Spla => b"SPLA",
    Nvup => b"NVUP",
    Qmba => b"QMBA",
    Tzon => b"TZON",
    Qsdi => b"QSDI",
    Arch => b"ARCH",
    Uapp => b"UAPP",
    Lram => b"LRAM",
    Cus0 => b"CUS0",
    Cus1 => b"CUS1",
    Cus2 => b"CUS2",
    Hash => b"HASH",
    Meta => b"META",
    Cusg => b"CUSG",
}

impl ImageType {
    /// Containers whose payload is a sequence of further CWE images.
    pub fn is_container(&self) -> bool {
        matches!(self, ImageType::Appl)
    }
}

/// One parsed CWE header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CweHeader {
    pub psb: Vec<u8>,
    pub hdr_rev: u32,
    pub image_type: ImageType,
    pub prod_id: [u8; 4],
    pub image_size: u32,
    pub crc32: u32,
    pub version: String,
    pub date: String,
    pub compat: u32,
    pub misc_opts: u8,
    pub stor_addr: u32,
    pub prog_addr: u32,
    pub entry_pt: u32,
    pub signature: u32,
    pub crc_indicator: u32,
}

impl CweHeader {
    /// A header with the fields every image needs; the image CRC is
    /// declared valid and must be filled in by the caller.
    pub fn new(image_type: ImageType, prod_id: [u8; 4], image_size: u32, crc32: u32) -> Self {
        CweHeader {
            psb: vec![0; CWE_PSB_SIZE],
            hdr_rev: CWE_CURRENT_HDR_REV,
            image_type,
            prod_id,
            image_size,
            crc32,
            version: String::new(),
            date: String::new(),
            compat: 0,
            misc_opts: 0,
            stor_addr: 0,
            prog_addr: 0,
            entry_pt: 0,
            signature: if image_type.is_container() { CWE_APPL_SIGNATURE } else { 0 },
            crc_indicator: CWE_CRC_VALID,
        }
    }

    pub fn to_bytes(&self) -> [u8; CWE_HEADER_SIZE] {
        let mut buf = [0u8; CWE_HEADER_SIZE];
        let n = self.psb.len().min(CWE_PSB_SIZE);
        buf[..n].copy_from_slice(&self.psb[..n]);
        buf[CWE_HDR_REV_OFFSET..CWE_HDR_REV_OFFSET + 4].copy_from_slice(&self.hdr_rev.to_be_bytes());
        buf[CWE_IMAGE_TYPE_OFFSET..CWE_IMAGE_TYPE_OFFSET + 4].copy_from_slice(self.image_type.tag());
        buf[CWE_PROD_ID_OFFSET..CWE_PROD_ID_OFFSET + 4].copy_from_slice(&self.prod_id);
        buf[CWE_IMAGE_SIZE_OFFSET..CWE_IMAGE_SIZE_OFFSET + 4]
            .copy_from_slice(&self.image_size.to_be_bytes());
        buf[CWE_CRC32_OFFSET..CWE_CRC32_OFFSET + 4].copy_from_slice(&self.crc32.to_be_bytes());
        let v = self.version.as_bytes();
        let n = v.len().min(CWE_VERSION_SIZE);
        buf[CWE_VERSION_OFFSET..CWE_VERSION_OFFSET + n].copy_from_slice(&v[..n]);
        let d = self.date.as_bytes();
        let n = d.len().min(CWE_DATE_SIZE);
        buf[CWE_DATE_OFFSET..CWE_DATE_OFFSET + n].copy_from_slice(&d[..n]);
        buf[CWE_COMPAT_OFFSET..CWE_COMPAT_OFFSET + 4].copy_from_slice(&self.compat.to_be_bytes());
        buf[CWE_MISC_OPTS_OFFSET] = self.misc_opts;
        buf[CWE_STOR_ADDR_OFFSET..CWE_STOR_ADDR_OFFSET + 4]
            .copy_from_slice(&self.stor_addr.to_be_bytes());
        buf[CWE_PROG_ADDR_OFFSET..CWE_PROG_ADDR_OFFSET + 4]
            .copy_from_slice(&self.prog_addr.to_be_bytes());
        buf[CWE_ENTRY_PT_OFFSET..CWE_ENTRY_PT_OFFSET + 4]
            .copy_from_slice(&self.entry_pt.to_be_bytes());
        buf[CWE_SIGNATURE_OFFSET..CWE_SIGNATURE_OFFSET + 4]
            .copy_from_slice(&self.signature.to_be_bytes());
        let psb_crc = crc32fast::hash(&buf[..CWE_PSB_SIZE]);
        buf[CWE_CRC_PROD_BUF_OFFSET..CWE_CRC_PROD_BUF_OFFSET + 4]
            .copy_from_slice(&psb_crc.to_be_bytes());
        buf[CWE_CRC_IND_OFFSET..CWE_CRC_IND_OFFSET + 4]
            .copy_from_slice(&self.crc_indicator.to_be_bytes());
        buf
    }

    /// Decodes and validates one header. The checks run in a fixed
    /// order: revision, image-type token, product allow-list,
    /// compression flag, product-block CRC, container signature.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < CWE_HEADER_SIZE {
            return Err(Error::BadParameter("CWE header buffer too short"));
        }
        let be32 =
            |off: usize| u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());

        let hdr_rev = be32(CWE_HDR_REV_OFFSET);
        if hdr_rev < CWE_CURRENT_HDR_REV {
            return Err(Error::Format("CWE header revision too old"));
        }
        let tag: [u8; 4] = buf[CWE_IMAGE_TYPE_OFFSET..CWE_IMAGE_TYPE_OFFSET + 4]
            .try_into()
            .unwrap();
        let image_type =
            ImageType::from_tag(&tag).ok_or(Error::Format("unknown CWE image type"))?;
        let prod_id: [u8; 4] =
            buf[CWE_PROD_ID_OFFSET..CWE_PROD_ID_OFFSET + 4].try_into().unwrap();
        if !CWE_PRODUCT_IDS.contains(&prod_id) {
            return Err(Error::Format("CWE product id not in the allow-list"));
        }
        let misc_opts = buf[CWE_MISC_OPTS_OFFSET];
        if misc_opts & CWE_MISC_OPT_COMPRESSED != 0 {
            return Err(Error::Unsupported("compressed CWE images are not supported"));
        }
        let psb_crc = be32(CWE_CRC_PROD_BUF_OFFSET);
        if psb_crc != crc32fast::hash(&buf[..CWE_PSB_SIZE]) {
            return Err(Error::Format("CWE product block CRC mismatch"));
        }
        let signature = be32(CWE_SIGNATURE_OFFSET);
        if image_type.is_container() && signature != CWE_APPL_SIGNATURE {
            return Err(Error::Format("CWE container signature mismatch"));
        }
        let crc_indicator = be32(CWE_CRC_IND_OFFSET);
        if crc_indicator != CWE_CRC_VALID && crc_indicator != CWE_CRC_NOT_SET {
            return Err(Error::Format("CWE CRC indicator out of range"));
        }

        let text = |off: usize, len: usize| {
            let raw = &buf[off..off + len];
            let end = raw.iter().position(|&b| b == 0).unwrap_or(len);
            String::from_utf8_lossy(&raw[..end]).into_owned()
        };

        Ok(CweHeader {
            psb: buf[..CWE_PSB_SIZE].to_vec(),
            hdr_rev,
            image_type,
            prod_id,
            image_size: be32(CWE_IMAGE_SIZE_OFFSET),
            crc32: be32(CWE_CRC32_OFFSET),
            version: text(CWE_VERSION_OFFSET, CWE_VERSION_SIZE),
            date: text(CWE_DATE_OFFSET, CWE_DATE_SIZE),
            compat: be32(CWE_COMPAT_OFFSET),
            misc_opts,
            stor_addr: be32(CWE_STOR_ADDR_OFFSET),
            prog_addr: be32(CWE_PROG_ADDR_OFFSET),
            entry_pt: be32(CWE_ENTRY_PT_OFFSET),
            signature,
            crc_indicator,
        })
    }

    /// Whether the `crc32` field carries a checksum to enforce.
    pub fn has_valid_crc(&self) -> bool {
        self.crc_indicator == CWE_CRC_VALID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() -> Result<()> {
        let mut hdr = CweHeader::new(ImageType::User, *b"9X07", 160_000, 0x1234_5678);
        hdr.version = "SWI9X07Y_02.28.03.05".to_string();
        hdr.date = "07/24/25".to_string();
        let parsed = CweHeader::parse(&hdr.to_bytes())?;
        assert_eq!(parsed, hdr);
        Ok(())
    }

    #[test]
    fn compressed_images_are_refused() {
        let mut hdr = CweHeader::new(ImageType::User, *b"9X07", 100, 0);
        hdr.misc_opts = CWE_MISC_OPT_COMPRESSED;
        assert!(matches!(CweHeader::parse(&hdr.to_bytes()), Err(Error::Unsupported(_))));
    }

    #[test]
    fn container_requires_signature() {
        let mut hdr = CweHeader::new(ImageType::Appl, *b"9X07", 100, 0);
        hdr.signature = 0;
        assert!(matches!(CweHeader::parse(&hdr.to_bytes()), Err(Error::Format(_))));
    }

    #[test]
    fn unknown_product_is_refused() {
        let hdr = CweHeader::new(ImageType::User, *b"ZZ99", 100, 0);
        assert!(matches!(CweHeader::parse(&hdr.to_bytes()), Err(Error::Format(_))));
    }

    #[test]
    fn corrupt_product_block_is_refused() {
        let hdr = CweHeader::new(ImageType::User, *b"9X07", 100, 0);
        let mut bytes = hdr.to_bytes();
        bytes[10] ^= 0xA5;
        assert!(matches!(CweHeader::parse(&bytes), Err(Error::Format(_))));
    }

    #[test]
    fn every_tag_round_trips() {
        for tag in [b"QPAR", b"BOOT", b"APPL", b"SYST", b"USER", b"CUS2", b"META", b"CUSG"] {
            let ty = ImageType::from_tag(tag).expect("token must be known");
            assert_eq!(ty.tag(), tag);
        }
        assert!(ImageType::from_tag(b"ZZZZ").is_none());
    }
}

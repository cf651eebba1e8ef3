// swifota/src/ubi/volume.rs
//
// The UBI volume engine. All operations run against an opened, scanned
// FlashDevice; the container state lives inside the descriptor and every
// block index below is a "vleb": the index of a virtual UBI erase block
// counted from the container base. When the container starts at a byte
// offset that is not block-aligned, a vleb straddles two logical erase
// blocks and every mutation goes through read-modify-write of both.

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::flash::device::{FlashDevice, INVALID_PEB};
use crate::ubi::headers::{EcHdr, VidHdr, VolType, VtblRecord, ubi_crc32};
use crate::ubi::{
    UBI_EC_HDR_SIZE, UBI_LAYOUT_VOLUME_ID, UBI_MAX_VOLUMES, UBI_VID_HDR_SIZE, UBI_VTBL_RECORD_SIZE,
    beb_limit,
};

/// Occupancy of one virtual UBI block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VlebState {
    Free,
    /// Hosts one of the two volume-table copies.
    Vtbl,
    /// Mapped into the volume with this id.
    Data(u32),
}

/// Per-container state carried by the flash descriptor.
pub(crate) struct UbiState {
    pub(crate) abs_offset: u64,
    base_leb: u32,
    offset_in_peb: u32,
    image_seq: u32,
    generation: u64,
    vtbl_lebs: [u32; 2],
    vtbl: Vec<VtblRecord>,
    states: Vec<VlebState>,
    ec_cache: Vec<u64>,
    vids: Vec<Option<VidHdr>>,
    sqnum: u64,
    active: Option<ActiveVolume>,
}

struct ActiveVolume {
    vol_id: u32,
    vol_type: VolType,
    /// lnum → vleb.
    leb_map: Vec<u32>,
}

/// Facts about the selected volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UbiVolumeInfo {
    pub vol_id: u32,
    pub vol_type: VolType,
    pub name: String,
    pub reserved_pebs: u32,
    pub mapped_lebs: u32,
    pub size: u64,
    pub free_pebs: u32,
}

impl UbiState {
    fn free_count(&self) -> u32 {
        self.states.iter().filter(|s| **s == VlebState::Free).count() as u32
    }

    fn next_sqnum(&mut self) -> u64 {
        self.sqnum += 1;
        self.sqnum
    }

    /// Blocks consumed by the container: the table copies plus every
    /// reservation in the volume table.
    fn consumed_pebs(&self) -> u32 {
        2 + self.vtbl.iter().filter(|r| r.is_active()).map(|r| r.reserved_pebs).sum::<u32>()
    }
}

impl FlashDevice {
    pub fn ubi_is_attached(&self) -> bool {
        self.ubi.is_some()
    }

    /// Byte capacity of one volume LEB.
    pub fn ubi_leb_size(&self) -> u32 {
        self.geometry().erase_size - 2 * self.geometry().write_size
    }

    pub fn ubi_free_pebs(&self) -> Result<u32> {
        Ok(self.ubi_ref()?.free_count())
    }

    /// Blocks consumed by the attached container, table copies included.
    pub fn ubi_consumed_pebs(&self) -> Result<u32> {
        Ok(self.ubi_ref()?.consumed_pebs())
    }

    pub fn ubi_absolute_offset(&self) -> Result<u64> {
        Ok(self.ubi_ref()?.abs_offset)
    }

    fn ubi_ref(&self) -> Result<&UbiState> {
        self.ubi.as_ref().ok_or(Error::BadParameter("no UBI container attached"))
    }

    /// Scans an existing UBI container starting at `abs_offset` and caches
    /// its volume table. No volume is selected yet.
    pub fn ubi_attach(&mut self, abs_offset: u64) -> Result<()> {
        let st = attach_inner(self, abs_offset)?;
        self.ubi = Some(st);
        Ok(())
    }

    pub fn ubi_detach(&mut self) {
        self.ubi = None;
    }

    /// Formats a fresh (empty) UBI container at `abs_offset`: every vleb
    /// gets an erase-count header (preserving intact counters), and the
    /// first two vlebs host the layout volume with an empty table.
    pub fn ubi_create_container(&mut self, abs_offset: u64, image_seq: u32) -> Result<()> {
        if !self.is_scanned() {
            return Err(Error::BadParameter("UBI requires a scanned partition"));
        }
        // Any byte offset works: a container that is not block-aligned is
        // maintained through split read-modify-write cycles.
        let geom = self.geometry();
        let base_leb = (abs_offset / geom.erase_size as u64) as u32;
        let offset_in_peb = (abs_offset % geom.erase_size as u64) as u32;
        let nvleb = vleb_count_for(self, base_leb, offset_in_peb);
        if nvleb < 2 + 4 {
            return Err(Error::OutOfRange("partition too small for a UBI container"));
        }

        info!(
            "{}: creating UBI container at offset {abs_offset} ({nvleb} blocks)",
            self.name()
        );
        let mut st = UbiState {
            abs_offset,
            base_leb,
            offset_in_peb,
            image_seq,
            generation: self.scan_generation(),
            vtbl_lebs: [0, 1],
            vtbl: vec![VtblRecord::free(); vtbl_slots(self)],
            states: vec![VlebState::Free; nvleb as usize],
            ec_cache: vec![0; nvleb as usize],
            vids: vec![None; nvleb as usize],
            sqnum: 0,
            active: None,
        };

        for vleb in 0..nvleb {
            let ec = match read_ec(self, &st, vleb) {
                Ok(hdr) => {
                    st.ec_cache[vleb as usize] = hdr.ec;
                    EcHdr { ec: hdr.ec, ..EcHdr::new(geom.write_size, image_seq) }
                }
                Err(_) => EcHdr::new(geom.write_size, image_seq),
            }
            .incremented();
            st.ec_cache[vleb as usize] = ec.ec;

            if vleb < 2 {
                let sqnum = st.next_sqnum();
                write_vtbl_copy(self, &mut st, vleb, ec, sqnum)?;
                st.states[vleb as usize] = VlebState::Vtbl;
            } else {
                vleb_write(self, &st, vleb, &ec.to_bytes())?;
            }
        }
        self.ubi = Some(st);
        Ok(())
    }

    /// Selects volume `vol_id` of the attached container, building its
    /// LEB map from the VID headers seen at attach time.
    pub fn ubi_select_volume(&mut self, vol_id: u32) -> Result<()> {
        let mut st = self.take_ubi()?;
        let res = select_volume_inner(&mut st, vol_id);
        self.ubi = Some(st);
        res
    }

    /// Creates a volume and selects it. `size` is the byte capacity to
    /// reserve for dynamic volumes; pass `None` to start with a single
    /// block and grow on demand.
    pub fn ubi_create_volume(
        &mut self,
        vol_id: u32,
        name: &str,
        vol_type: VolType,
        size: Option<u64>,
    ) -> Result<()> {
        let mut st = self.take_ubi()?;
        let res = create_volume_inner(self, &mut st, vol_id, name, vol_type, size);
        self.ubi = Some(st);
        res
    }

    /// Erases every block of the volume, rewrites their erase-count
    /// headers, and clears the table record.
    pub fn ubi_delete_volume(&mut self, vol_id: u32) -> Result<()> {
        let mut st = self.take_ubi()?;
        let res = delete_volume_inner(self, &mut st, vol_id);
        self.ubi = Some(st);
        res
    }

    /// Writes one LEB of the selected volume. With `extend`, writing one
    /// LEB past the reservation grows the volume by a block first.
    pub fn ubi_write_leb(&mut self, lnum: u32, data: &[u8], extend: bool) -> Result<()> {
        let mut st = self.take_ubi()?;
        let res = write_leb_inner(self, &mut st, lnum, data, extend);
        self.ubi = Some(st);
        res
    }

    /// Reads the data area of one LEB; returns the number of bytes read.
    pub fn ubi_read_leb(&mut self, lnum: u32, buf: &mut [u8]) -> Result<usize> {
        let mut st = self.take_ubi()?;
        let res = read_leb_inner(self, &mut st, lnum, buf);
        self.ubi = Some(st);
        res
    }

    /// Re-reserves the selected volume for `new_size` bytes, freeing (or
    /// claiming) trailing blocks and rewriting the table.
    pub fn ubi_adjust_volume_size(&mut self, new_size: u64) -> Result<()> {
        let mut st = self.take_ubi()?;
        let res = adjust_size_inner(self, &mut st, new_size);
        self.ubi = Some(st);
        res
    }

    pub fn ubi_volume_info(&self) -> Result<UbiVolumeInfo> {
        let st = self.ubi_ref()?;
        let active = st.active.as_ref().ok_or(Error::BadParameter("no volume selected"))?;
        let rec = &st.vtbl[active.vol_id as usize];
        let usable = self.ubi_leb_size() as u64;
        let size = match active.vol_type {
            VolType::Dynamic => rec.reserved_pebs as u64 * usable,
            VolType::Static => active
                .leb_map
                .iter()
                .filter(|&&v| v != INVALID_PEB)
                .filter_map(|&v| st.vids[v as usize])
                .map(|vid| vid.data_size as u64)
                .sum(),
        };
        Ok(UbiVolumeInfo {
            vol_id: active.vol_id,
            vol_type: active.vol_type,
            name: rec.name.clone(),
            reserved_pebs: rec.reserved_pebs,
            mapped_lebs: active.leb_map.iter().filter(|&&v| v != INVALID_PEB).count() as u32,
            size,
            free_pebs: st.free_count(),
        })
    }

    /// Looks a volume up by name in the attached container's table.
    pub fn ubi_find_volume(&self, name: &str) -> Result<Option<u32>> {
        let st = self.ubi_ref()?;
        Ok(st
            .vtbl
            .iter()
            .position(|r| r.is_active() && r.name == name)
            .map(|id| id as u32))
    }

    /// Takes the container state out, re-attaching first when a bad-block
    /// rescan invalidated the LEB map since the state was built.
    fn take_ubi(&mut self) -> Result<UbiState> {
        let st = self.ubi.take().ok_or(Error::BadParameter("no UBI container attached"))?;
        if st.generation == self.scan_generation() {
            return Ok(st);
        }
        warn!("{}: LEB map changed, re-scanning UBI container", self.name());
        let abs_offset = st.abs_offset;
        let active = st.active.as_ref().map(|a| a.vol_id);
        let mut fresh = attach_inner(self, abs_offset)?;
        if let Some(vol_id) = active {
            select_volume_inner(&mut fresh, vol_id)?;
        }
        Ok(fresh)
    }
}

fn vleb_count_for(dev: &FlashDevice, base_leb: u32, offset_in_peb: u32) -> u32 {
    let lebs = dev.block_count();
    let straddle = if offset_in_peb == 0 { 0 } else { 1 };
    lebs.saturating_sub(base_leb).saturating_sub(straddle)
}

/// Number of volume-table records: capped by what fits in one LEB.
fn vtbl_slots(dev: &FlashDevice) -> usize {
    (dev.ubi_leb_size() as usize / UBI_VTBL_RECORD_SIZE).min(UBI_MAX_VOLUMES)
}

/// Byte offset (in LEB space) where `vleb` starts.
fn vleb_start(st: &UbiState, dev: &FlashDevice, vleb: u32) -> u64 {
    (st.base_leb + vleb) as u64 * dev.geometry().erase_size as u64 + st.offset_in_peb as u64
}

fn read_ec(dev: &mut FlashDevice, st: &UbiState, vleb: u32) -> Result<EcHdr> {
    let mut buf = [0u8; UBI_EC_HDR_SIZE];
    let start = vleb_start(st, dev, vleb);
    dev.read_at(start, &mut buf)?;
    EcHdr::parse(&buf)
}

fn read_vid(dev: &mut FlashDevice, st: &UbiState, vleb: u32) -> Result<VidHdr> {
    let mut buf = [0u8; UBI_VID_HDR_SIZE];
    let start = vleb_start(st, dev, vleb) + dev.geometry().write_size as u64;
    dev.read_at(start, &mut buf)?;
    VidHdr::parse(&buf)
}

/// Rewrites the whole extent of a vleb: erase, then program `content`
/// from the vleb start. In offset mode both straddled blocks are read,
/// patched and rewritten so the surrounding bytes survive.
fn vleb_write(dev: &mut FlashDevice, st: &UbiState, vleb: u32, content: &[u8]) -> Result<()> {
    rewrite_vleb(dev, st, vleb, content, true)
}

/// Programs `content` at the start of a vleb that is already erased,
/// preserving the rest of the vleb window.
fn vleb_stamp(dev: &mut FlashDevice, st: &UbiState, vleb: u32, content: &[u8]) -> Result<()> {
    rewrite_vleb(dev, st, vleb, content, false)
}

fn rewrite_vleb(
    dev: &mut FlashDevice,
    st: &UbiState,
    vleb: u32,
    content: &[u8],
    clear_window: bool,
) -> Result<()> {
    let erase = dev.geometry().erase_size as usize;
    if content.len() > erase {
        return Err(Error::BadParameter("vleb content larger than one erase block"));
    }
    let lower = st.base_leb + vleb;
    let oip = st.offset_in_peb as usize;

    if oip == 0 {
        dev.erase_block_retry(lower)?;
        return dev.write_at(lower as u64 * erase as u64, content);
    }

    // Split vleb: read-modify-write of both straddled blocks, never a raw
    // erase, so the payload bytes around the window are preserved.
    let mut lo = vec![0u8; erase];
    dev.read_at(lower as u64 * erase as u64, &mut lo)?;
    let mut hi = vec![0u8; erase];
    dev.read_at((lower as u64 + 1) * erase as u64, &mut hi)?;

    if clear_window {
        lo[oip..].fill(0xFF);
        hi[..oip].fill(0xFF);
    }
    let first = content.len().min(erase - oip);
    lo[oip..oip + first].copy_from_slice(&content[..first]);
    hi[..content.len() - first].copy_from_slice(&content[first..]);

    dev.erase_block_retry(lower)?;
    dev.write_at(lower as u64 * erase as u64, &lo)?;
    dev.erase_block_retry(lower + 1)?;
    dev.write_at((lower as u64 + 1) * erase as u64, &hi)?;
    Ok(())
}

fn vtbl_bytes(st: &UbiState) -> Vec<u8> {
    let mut out = Vec::with_capacity(st.vtbl.len() * UBI_VTBL_RECORD_SIZE);
    for rec in &st.vtbl {
        out.extend_from_slice(&rec.to_bytes());
    }
    out
}

/// Writes one layout-volume copy: EC | layout VID | full volume table.
fn write_vtbl_copy(
    dev: &mut FlashDevice,
    st: &mut UbiState,
    vleb: u32,
    ec: EcHdr,
    sqnum: u64,
) -> Result<()> {
    let write_size = dev.geometry().write_size as usize;
    let mut vid = VidHdr::new(VolType::Dynamic, UBI_LAYOUT_VOLUME_ID, vleb, sqnum);
    vid.used_ebs = 0;

    let table = vtbl_bytes(st);
    let mut extent = vec![0xFFu8; 2 * write_size + table.len()];
    extent[..UBI_EC_HDR_SIZE].copy_from_slice(&ec.to_bytes());
    extent[write_size..write_size + UBI_VID_HDR_SIZE].copy_from_slice(&vid.to_bytes());
    extent[2 * write_size..].copy_from_slice(&table);
    vleb_write(dev, st, vleb, &extent)?;
    st.ec_cache[vleb as usize] = ec.ec;
    Ok(())
}

/// Rewrites both table copies; this is the commit point of every
/// volume-table mutation, and also repairs a copy that went corrupt.
fn commit_vtbl(dev: &mut FlashDevice, st: &mut UbiState) -> Result<()> {
    for i in 0..2 {
        let vleb = st.vtbl_lebs[i];
        let ec = EcHdr {
            ec: st.ec_cache[vleb as usize],
            ..EcHdr::new(dev.geometry().write_size, st.image_seq)
        }
        .incremented();
        let sqnum = st.next_sqnum();
        write_vtbl_copy(dev, st, vleb, ec, sqnum)?;
    }
    Ok(())
}

fn attach_inner(dev: &mut FlashDevice, abs_offset: u64) -> Result<UbiState> {
    if !dev.is_scanned() {
        return Err(Error::BadParameter("UBI requires a scanned partition"));
    }
    let geom = dev.geometry();
    let base_leb = (abs_offset / geom.erase_size as u64) as u32;
    let offset_in_peb = (abs_offset % geom.erase_size as u64) as u32;
    let nvleb = vleb_count_for(dev, base_leb, offset_in_peb);
    if nvleb < 2 {
        return Err(Error::Format("partition too small for a UBI container"));
    }

    let mut st = UbiState {
        abs_offset,
        base_leb,
        offset_in_peb,
        image_seq: 0,
        generation: dev.scan_generation(),
        vtbl_lebs: [INVALID_PEB, INVALID_PEB],
        vtbl: Vec::new(),
        states: vec![VlebState::Free; nvleb as usize],
        ec_cache: vec![0; nvleb as usize],
        vids: vec![None; nvleb as usize],
        sqnum: 0,
        active: None,
    };

    let mut layout_found = 0usize;
    let mut tables: Vec<Vec<VtblRecord>> = Vec::new();

    for vleb in 0..nvleb {
        match read_ec(dev, &st, vleb) {
            Ok(ec) => {
                st.ec_cache[vleb as usize] = ec.ec;
                st.image_seq = ec.image_seq;
            }
            Err(Error::Format(_)) => continue, // fully erased, stays free
            Err(err) => {
                // A corrupt EC header condemns the block to reallocation.
                debug!("vleb {vleb}: unreadable EC header ({err}), treating as free");
                continue;
            }
        }
        let vid = match read_vid(dev, &st, vleb) {
            Ok(vid) => vid,
            Err(Error::Format(_)) => continue, // EC only: free block
            Err(err) => {
                debug!("vleb {vleb}: unreadable VID header ({err}), treating as free");
                continue;
            }
        };
        st.sqnum = st.sqnum.max(vid.sqnum);

        if vid.vol_id == UBI_LAYOUT_VOLUME_ID {
            if layout_found < 2 {
                st.vtbl_lebs[layout_found] = vleb;
            }
            layout_found += 1;
            st.states[vleb as usize] = VlebState::Vtbl;
            if let Some(table) = read_vtbl_table(dev, &st, vleb) {
                tables.push(table);
            }
        } else {
            st.states[vleb as usize] = VlebState::Data(vid.vol_id);
            st.vids[vleb as usize] = Some(vid);
        }
    }

    if layout_found < 2 {
        return Err(Error::Format("UBI volume table copies missing"));
    }
    let table = tables.into_iter().next().ok_or(Error::Format("no valid UBI volume table"))?;
    st.vtbl = table;
    debug!(
        "{}: attached UBI at offset {abs_offset}: {} free of {nvleb} blocks",
        dev.name(),
        st.free_count()
    );
    Ok(st)
}

/// Reads and validates one on-flash table copy; `None` when any
/// programmed record fails its CRC.
fn read_vtbl_table(dev: &mut FlashDevice, st: &UbiState, vleb: u32) -> Option<Vec<VtblRecord>> {
    let write_size = dev.geometry().write_size as u64;
    let slots = vtbl_slots(dev);
    let mut raw = vec![0u8; slots * UBI_VTBL_RECORD_SIZE];
    let start = vleb_start(st, dev, vleb) + 2 * write_size;
    if dev.read_at(start, &mut raw).is_err() {
        return None;
    }
    let mut table = Vec::with_capacity(slots);
    for chunk in raw.chunks_exact(UBI_VTBL_RECORD_SIZE) {
        if chunk.iter().all(|&b| b == 0xFF) {
            table.push(VtblRecord::free());
            continue;
        }
        match VtblRecord::parse(chunk) {
            Ok(rec) => table.push(rec),
            Err(_) => {
                warn!("{}: volume table copy on vleb {vleb} is corrupt", dev.name());
                return None;
            }
        }
    }
    Some(table)
}

fn select_volume_inner(st: &mut UbiState, vol_id: u32) -> Result<()> {
    if vol_id as usize >= st.vtbl.len() {
        return Err(Error::BadParameter("volume id out of range"));
    }
    let rec = &st.vtbl[vol_id as usize];
    if !rec.is_active() {
        return Err(Error::Format("volume is not in the table"));
    }
    let vol_type = rec.volume_type()?;

    let mut leb_map = vec![INVALID_PEB; rec.reserved_pebs as usize];
    for (vleb, vid) in st.vids.iter().enumerate() {
        let Some(vid) = vid else { continue };
        if vid.vol_id != vol_id {
            continue;
        }
        if (vid.lnum as usize) >= leb_map.len() {
            leb_map.resize(vid.lnum as usize + 1, INVALID_PEB);
        }
        // An interrupted copy-on-write can leave two blocks claiming the
        // same LEB; the higher sequence number wins.
        let newer = match leb_map[vid.lnum as usize] {
            INVALID_PEB => true,
            prev => st.vids[prev as usize].map(|p| vid.sqnum > p.sqnum).unwrap_or(true),
        };
        if newer {
            leb_map[vid.lnum as usize] = vleb as u32;
        }
    }
    st.active = Some(ActiveVolume { vol_id, vol_type, leb_map });
    Ok(())
}

fn create_volume_inner(
    dev: &mut FlashDevice,
    st: &mut UbiState,
    vol_id: u32,
    name: &str,
    vol_type: VolType,
    size: Option<u64>,
) -> Result<()> {
    if vol_id as usize >= st.vtbl.len() {
        return Err(Error::BadParameter("volume id out of range"));
    }
    if st.vtbl[vol_id as usize].is_active() {
        return Err(Error::Duplicate("volume id already in use"));
    }
    if st.vtbl.iter().any(|r| r.is_active() && r.name == name) {
        return Err(Error::Duplicate("volume name already in use"));
    }

    let usable = dev.ubi_leb_size() as u64;
    let vol_pebs = match vol_type {
        VolType::Static => 1,
        VolType::Dynamic => match size {
            Some(bytes) if bytes > 0 => bytes.div_ceil(usable) as u32,
            _ => 1,
        },
    };
    let reserve = vol_pebs + 2 * beb_limit(dev.geometry().nb_blk) + 4;
    if st.free_count() < reserve {
        return Err(Error::OutOfRange("not enough free blocks for volume"));
    }

    info!(
        "{}: creating {:?} volume {vol_id} ({name:?}, {vol_pebs} PEBs)",
        dev.name(),
        vol_type
    );
    let vleb = get_new_block(st)?;
    let ec = EcHdr {
        ec: st.ec_cache[vleb as usize],
        ..EcHdr::new(dev.geometry().write_size, st.image_seq)
    };
    match vol_type {
        VolType::Static => {
            let write_size = dev.geometry().write_size as usize;
            let mut vid = VidHdr::new(VolType::Static, vol_id, 0, st.next_sqnum());
            vid.used_ebs = 1;
            let mut extent = vec![0xFFu8; write_size + UBI_VID_HDR_SIZE];
            extent[..UBI_EC_HDR_SIZE].copy_from_slice(&ec.to_bytes());
            extent[write_size..write_size + UBI_VID_HDR_SIZE].copy_from_slice(&vid.to_bytes());
            vleb_stamp(dev, st, vleb, &extent)?;
            st.states[vleb as usize] = VlebState::Data(vol_id);
            st.vids[vleb as usize] = Some(vid);
        }
        VolType::Dynamic => {
            // The block keeps only its erase-count header until data
            // arrives; it stays allocatable.
            vleb_stamp(dev, st, vleb, &ec.to_bytes())?;
        }
    }

    st.vtbl[vol_id as usize] = VtblRecord::new(vol_type, name, vol_pebs)?;
    commit_vtbl(dev, st)?;
    select_volume_inner(st, vol_id)
}

fn delete_volume_inner(dev: &mut FlashDevice, st: &mut UbiState, vol_id: u32) -> Result<()> {
    if !st.vtbl.get(vol_id as usize).map(|r| r.is_active()).unwrap_or(false) {
        return Err(Error::NotFound("volume is not in the table"));
    }
    info!("{}: deleting volume {vol_id}", dev.name());
    for vleb in 0..st.states.len() as u32 {
        if st.states[vleb as usize] != VlebState::Data(vol_id) {
            continue;
        }
        free_vleb(dev, st, vleb)?;
    }
    st.vtbl[vol_id as usize] = VtblRecord::free();
    commit_vtbl(dev, st)?;
    if st.active.as_ref().map(|a| a.vol_id) == Some(vol_id) {
        st.active = None;
    }
    Ok(())
}

/// Erase a data block back to the free state: its erase-count header is
/// the only thing rewritten.
fn free_vleb(dev: &mut FlashDevice, st: &mut UbiState, vleb: u32) -> Result<()> {
    let ec = EcHdr {
        ec: st.ec_cache[vleb as usize],
        ..EcHdr::new(dev.geometry().write_size, st.image_seq)
    }
    .incremented();
    vleb_write(dev, st, vleb, &ec.to_bytes())?;
    st.ec_cache[vleb as usize] = ec.ec;
    st.states[vleb as usize] = VlebState::Free;
    st.vids[vleb as usize] = None;
    Ok(())
}

/// Wear-level-aware allocation: the free block with the lowest erase
/// counter wins, ties broken by the lowest index.
fn get_new_block(st: &UbiState) -> Result<u32> {
    st.states
        .iter()
        .enumerate()
        .filter(|(_, s)| **s == VlebState::Free)
        .min_by_key(|(vleb, _)| (st.ec_cache[*vleb], *vleb))
        .map(|(vleb, _)| vleb as u32)
        .ok_or(Error::OutOfRange("no free block available"))
}

fn write_leb_inner(
    dev: &mut FlashDevice,
    st: &mut UbiState,
    lnum: u32,
    data: &[u8],
    extend: bool,
) -> Result<()> {
    if data.len() as u64 > dev.ubi_leb_size() as u64 {
        return Err(Error::BadParameter("LEB data larger than the LEB size"));
    }
    let (vol_id, vol_type) = {
        let active = st.active.as_ref().ok_or(Error::BadParameter("no volume selected"))?;
        (active.vol_id, active.vol_type)
    };
    let reserved = st.vtbl[vol_id as usize].reserved_pebs;

    if lnum > reserved || (lnum == reserved && !extend) {
        return Err(Error::OutOfRange("LEB past the volume reservation"));
    }
    if lnum == reserved {
        grow_volume(dev, st, vol_id, vol_type, reserved + 1)?;
    }
    let reserved = st.vtbl[vol_id as usize].reserved_pebs;

    let new_vleb = get_new_block(st)?;
    let old_vleb = st
        .active
        .as_ref()
        .and_then(|a| a.leb_map.get(lnum as usize).copied())
        .filter(|&v| v != INVALID_PEB);

    let write_size = dev.geometry().write_size as usize;
    let ec = EcHdr {
        ec: st.ec_cache[new_vleb as usize],
        ..EcHdr::new(dev.geometry().write_size, st.image_seq)
    }
    .incremented();
    let mut vid = VidHdr::new(vol_type, vol_id, lnum, st.next_sqnum());
    if vol_type == VolType::Static {
        vid.data_size = data.len() as u32;
        vid.data_crc = ubi_crc32(data);
        vid.used_ebs = reserved;
    }

    let mut extent = vec![0xFFu8; 2 * write_size + data.len()];
    extent[..UBI_EC_HDR_SIZE].copy_from_slice(&ec.to_bytes());
    extent[write_size..write_size + UBI_VID_HDR_SIZE].copy_from_slice(&vid.to_bytes());
    extent[2 * write_size..].copy_from_slice(data);
    vleb_write(dev, st, new_vleb, &extent)?;

    st.ec_cache[new_vleb as usize] = ec.ec;
    st.states[new_vleb as usize] = VlebState::Data(vol_id);
    st.vids[new_vleb as usize] = Some(vid);
    if let Some(active) = st.active.as_mut() {
        if active.leb_map.len() <= lnum as usize {
            active.leb_map.resize(lnum as usize + 1, INVALID_PEB);
        }
        active.leb_map[lnum as usize] = new_vleb;
    }

    // The displaced block is erased after the new one is in place, so an
    // interruption leaves at least one complete copy on flash.
    if let Some(old) = old_vleb {
        free_vleb(dev, st, old)?;
    }
    Ok(())
}

/// Grows the reservation by one block: static volumes first restate
/// `used_ebs` in every already-written VID header.
fn grow_volume(
    dev: &mut FlashDevice,
    st: &mut UbiState,
    vol_id: u32,
    vol_type: VolType,
    new_reserved: u32,
) -> Result<()> {
    if st.free_count() == 0 {
        return Err(Error::OutOfRange("no free block to grow the volume"));
    }
    if vol_type == VolType::Static {
        let mapped: Vec<(u32, u32)> = st
            .active
            .as_ref()
            .map(|a| {
                a.leb_map
                    .iter()
                    .enumerate()
                    .filter(|&(_, &v)| v != INVALID_PEB)
                    .map(|(l, &v)| (l as u32, v))
                    .collect()
            })
            .unwrap_or_default();
        for (_, vleb) in mapped {
            rewrite_vid(dev, st, vleb, |vid| vid.used_ebs = new_reserved)?;
        }
    }
    st.vtbl[vol_id as usize].reserved_pebs = new_reserved;
    commit_vtbl(dev, st)
}

/// Reads a mapped block back, patches its VID header and rewrites the
/// whole extent (the erase counter moves on by one).
fn rewrite_vid(
    dev: &mut FlashDevice,
    st: &mut UbiState,
    vleb: u32,
    patch: impl FnOnce(&mut VidHdr),
) -> Result<()> {
    let geom = dev.geometry();
    let write_size = geom.write_size as usize;
    let mut vid = st.vids[vleb as usize].ok_or(Error::Fault("mapped block without VID header"))?;
    patch(&mut vid);
    vid.sqnum = st.next_sqnum();

    let data_len = match vid.vol_type {
        VolType::Static => vid.data_size as usize,
        VolType::Dynamic => dev.ubi_leb_size() as usize,
    };
    let mut extent = vec![0xFFu8; 2 * write_size + data_len];
    dev.read_at(vleb_start(st, dev, vleb) + 2 * write_size as u64, &mut extent[2 * write_size..])?;

    let ec = EcHdr { ec: st.ec_cache[vleb as usize], ..EcHdr::new(geom.write_size, st.image_seq) }
        .incremented();
    extent[..UBI_EC_HDR_SIZE].copy_from_slice(&ec.to_bytes());
    extent[write_size..write_size + UBI_VID_HDR_SIZE].copy_from_slice(&vid.to_bytes());
    vleb_write(dev, st, vleb, &extent)?;
    st.ec_cache[vleb as usize] = ec.ec;
    st.vids[vleb as usize] = Some(vid);
    Ok(())
}

fn read_leb_inner(
    dev: &mut FlashDevice,
    st: &mut UbiState,
    lnum: u32,
    buf: &mut [u8],
) -> Result<usize> {
    let active = st.active.as_ref().ok_or(Error::BadParameter("no volume selected"))?;
    let vleb = active
        .leb_map
        .get(lnum as usize)
        .copied()
        .filter(|&v| v != INVALID_PEB)
        .ok_or(Error::NotPermitted("LEB has no physical block"))?;
    let capacity = match active.vol_type {
        VolType::Static => st.vids[vleb as usize].map(|v| v.data_size as usize).unwrap_or(0),
        VolType::Dynamic => dev.ubi_leb_size() as usize,
    };
    let n = buf.len().min(capacity);
    let start = vleb_start(st, dev, vleb) + 2 * dev.geometry().write_size as u64;
    dev.read_at(start, &mut buf[..n])?;
    Ok(n)
}

fn adjust_size_inner(dev: &mut FlashDevice, st: &mut UbiState, new_size: u64) -> Result<()> {
    let (vol_id, vol_type) = {
        let active = st.active.as_ref().ok_or(Error::BadParameter("no volume selected"))?;
        (active.vol_id, active.vol_type)
    };
    let usable = dev.ubi_leb_size() as u64;
    let new_reserved = new_size.div_ceil(usable).max(1) as u32;
    let cur_reserved = st.vtbl[vol_id as usize].reserved_pebs;

    if new_reserved < cur_reserved {
        debug!(
            "{}: shrinking volume {vol_id} from {cur_reserved} to {new_reserved} PEBs",
            dev.name()
        );
        let tail = new_size - (new_reserved as u64 - 1) * usable;
        if vol_type == VolType::Static && tail < usable {
            let last = st
                .active
                .as_ref()
                .and_then(|a| a.leb_map.get(new_reserved as usize - 1).copied())
                .filter(|&v| v != INVALID_PEB);
            if let Some(vleb) = last {
                let mut data = vec![0u8; tail as usize];
                let start = vleb_start(st, dev, vleb) + 2 * dev.geometry().write_size as u64;
                dev.read_at(start, &mut data)?;
                let crc = ubi_crc32(&data);
                rewrite_vid(dev, st, vleb, |vid| {
                    vid.data_size = tail as u32;
                    vid.data_crc = crc;
                    vid.used_ebs = new_reserved;
                })?;
            }
        }
        let trailing: Vec<u32> = st
            .active
            .as_ref()
            .map(|a| {
                a.leb_map
                    .iter()
                    .skip(new_reserved as usize)
                    .copied()
                    .filter(|&v| v != INVALID_PEB)
                    .collect()
            })
            .unwrap_or_default();
        for vleb in trailing {
            free_vleb(dev, st, vleb)?;
        }
        if let Some(active) = st.active.as_mut() {
            active.leb_map.truncate(new_reserved as usize);
        }
    } else if new_reserved > cur_reserved && st.free_count() < new_reserved - cur_reserved {
        return Err(Error::OutOfRange("not enough free blocks to grow the volume"));
    }

    st.vtbl[vol_id as usize].reserved_pebs = new_reserved;
    commit_vtbl(dev, st)
}

//! C6: the object map. Every virtual oid a B-tree's internal nodes point at
//! (the volume's fs root, the catalog root) is resolved through here to a
//! physical block number, picking the newest transaction's mapping.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek};

use crate::btree::{self, QueryFlags, Table};
use crate::error::{ApfsError, Result};
use crate::key::OmapKey;
use crate::object::{Device, ObjectHeader};

const OMAP_KEY_SIZE: u32 = 16;
const OMAP_VAL_SIZE: u32 = 16;

/// Read the `omap_phys_t` structure at `omap_block` and open its B-tree
/// root, ready to be passed to `omap_lookup`.
pub fn read_omap_root<R: Read + Seek>(device: &mut Device<R>, omap_block: u64) -> Result<Table> {
    let (_, buffer) = device.read_object(omap_block)?;

    // omap_phys_t, after the 32-byte obj_phys_t header:
    //   om_flags: u32, om_snap_count: u32, om_tree_type: u32,
    //   om_snapshot_tree_type: u32, om_tree_oid: u64 (physical block of the
    //   B-tree root; omaps are always physical trees).
    let mut cursor = Cursor::new(&buffer.as_slice()[ObjectHeader::SIZE..]);
    let _om_flags = cursor.read_u32::<LittleEndian>()?;
    let _om_snap_count = cursor.read_u32::<LittleEndian>()?;
    let _om_tree_type = cursor.read_u32::<LittleEndian>()?;
    let _om_snapshot_tree_type = cursor.read_u32::<LittleEndian>()?;
    let om_tree_oid = cursor.read_u64::<LittleEndian>()?;

    Table::open(device, om_tree_oid)
}

/// Resolve a virtual oid to the physical block of its most recent mapping.
pub fn omap_lookup<R: Read + Seek>(
    device: &mut Device<R>,
    omap_root: &Table,
    target_oid: u64,
) -> Result<u64> {
    let result = btree::query(
        device,
        omap_root,
        OMAP_KEY_SIZE,
        OMAP_VAL_SIZE,
        &OmapKey::newest_version_cmp(target_oid),
        QueryFlags::Le,
        None,
    )?;

    let found = OmapKey::decode(result.key())?;
    if found.oid != target_oid {
        log::error!("omap has no mapping for oid {target_oid}");
        return Err(ApfsError::CorruptedData(format!(
            "omap lookup: oid {target_oid} not found"
        )));
    }

    parse_omap_val(result.value())
}

/// Resolve a virtual oid through `omap_root` and open the resulting block as
/// a `Table` — the common case of following a virtual child pointer (the
/// volume's catalog root) all the way to a usable node.
pub fn omap_read_table<R: Read + Seek>(
    device: &mut Device<R>,
    omap_root: &Table,
    oid: u64,
) -> Result<Table> {
    let block = omap_lookup(device, omap_root, oid)?;
    Table::open(device, block)
}

fn parse_omap_val(val: &[u8]) -> Result<u64> {
    if val.len() < OMAP_VAL_SIZE as usize {
        return Err(ApfsError::InvalidBTree("omap value too short".into()));
    }
    Ok(u64::from_le_bytes(val[8..16].try_into().unwrap()))
}

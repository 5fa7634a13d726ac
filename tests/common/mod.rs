//! Synthetic in-memory APFS images for the end-to-end mount tests.
//!
//! Everything here fabricates checksummed blocks by hand rather than going
//! through the library's writers (there are none — this is a read-only
//! crate), laying bytes out exactly the way `object.rs`/`btree.rs`/
//! `superblock.rs`/`catalog.rs` expect to parse them.

use apfs::fletcher::fletcher64;
use apfs::object::{OBJECT_TYPE_BTREE_NODE, OBJECT_TYPE_FS, OBJECT_TYPE_NX_SUPERBLOCK, OBJECT_TYPE_OMAP};
use apfs::superblock::{APSB_MAGIC, NX_MAGIC};
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::{Cursor, Write};

pub const BLOCK_SIZE: u32 = 4096;
pub const VOLUME_OID: u64 = 0x0402;
pub const VOLUME2_OID: u64 = 0x0403;
pub const CATALOG_ROOT_OID: u64 = 1024;
pub const ROOT_DIR_OID: u64 = 2; // apfs::catalog::ROOT_DIR_RECORD
pub const REGULAR_FILE_OID: u64 = 3;
pub const HOLE_FILE_OID: u64 = 4;
pub const CORRUPT_FILE_OID: u64 = 5;

pub const REGULAR_FILE_DATA_START: u64 = 7;
pub const REGULAR_FILE_LEN: u64 = 65536; // 16 blocks
pub const HOLE_FILE_LEN: u64 = 8192; // 2 blocks
pub const CORRUPT_EXTENT_LEN: u64 = 4095; // not a multiple of BLOCK_SIZE
pub const CORRUPT_EXTENT_PHYS: u64 = 700; // never actually read

const DT_REG: u16 = 8;

const BTNODE_ROOT: u16 = 0x0001;
const BTNODE_LEAF: u16 = 0x0002;
const BTNODE_FIXED_KV_SIZE: u16 = 0x0004;

fn new_block() -> Vec<u8> {
    vec![0u8; BLOCK_SIZE as usize]
}

fn checksum_block(block: &mut [u8]) {
    let sum = fletcher64(&block[8..]);
    block[0..8].copy_from_slice(&sum.to_le_bytes());
}

fn write_object_header(block: &mut [u8], oid: u64, xid: u64, object_type: u32, subtype: u32) {
    let mut c = Cursor::new(&mut block[0..32]);
    c.write_u64::<LittleEndian>(0).unwrap(); // checksum placeholder
    c.write_u64::<LittleEndian>(oid).unwrap();
    c.write_u64::<LittleEndian>(xid).unwrap();
    c.write_u32::<LittleEndian>(object_type).unwrap();
    c.write_u32::<LittleEndian>(subtype).unwrap();
}

/// Build and checksum the container superblock (block 0).
fn build_nxsb(omap_wrapper_block: u64, fs_oids: &[u64], block_count: u64) -> Vec<u8> {
    let mut block = new_block();
    write_object_header(&mut block, 0, 1, OBJECT_TYPE_NX_SUPERBLOCK, 0);

    let mut c = Cursor::new(&mut block[32..]);
    c.write_u32::<LittleEndian>(NX_MAGIC).unwrap();
    c.write_u32::<LittleEndian>(BLOCK_SIZE).unwrap();
    c.write_u64::<LittleEndian>(block_count).unwrap();
    c.write_u64::<LittleEndian>(0).unwrap(); // features
    c.write_u64::<LittleEndian>(0).unwrap(); // ro features
    c.write_u64::<LittleEndian>(0).unwrap(); // incompat features
    c.write_all(&[0u8; 16]).unwrap(); // uuid
    c.write_u64::<LittleEndian>(100).unwrap(); // next_oid
    c.write_u64::<LittleEndian>(1).unwrap(); // next_xid
    c.write_u32::<LittleEndian>(0).unwrap(); // xp_desc_blocks: no checkpoint area
    c.write_u32::<LittleEndian>(0).unwrap(); // xp_data_blocks
    c.write_u64::<LittleEndian>(0).unwrap(); // xp_desc_base
    c.write_u64::<LittleEndian>(0).unwrap(); // xp_data_base
    c.write_u32::<LittleEndian>(0).unwrap(); // xp_desc_next
    c.write_u32::<LittleEndian>(0).unwrap(); // xp_data_next
    c.write_u32::<LittleEndian>(0).unwrap(); // xp_desc_index
    c.write_u32::<LittleEndian>(0).unwrap(); // xp_desc_len
    c.write_u32::<LittleEndian>(0).unwrap(); // xp_data_index
    c.write_u32::<LittleEndian>(0).unwrap(); // xp_data_len
    c.write_u64::<LittleEndian>(0).unwrap(); // spaceman_oid
    c.write_u64::<LittleEndian>(omap_wrapper_block).unwrap();
    c.write_u64::<LittleEndian>(0).unwrap(); // reaper_oid
    c.write_u32::<LittleEndian>(0).unwrap(); // test_type
    c.write_u32::<LittleEndian>(fs_oids.len() as u32).unwrap();
    for oid in fs_oids {
        c.write_u64::<LittleEndian>(*oid).unwrap();
    }

    checksum_block(&mut block);
    block
}

/// Build and checksum a volume superblock (APSB).
#[allow(clippy::too_many_arguments)]
fn build_apsb(
    vol_omap_wrapper_block: u64,
    root_tree_oid: u64,
    fs_alloc_count: u64,
    num_files: u64,
    num_directories: u64,
    uuid_seed: u8,
    name: &str,
) -> Vec<u8> {
    let mut block = new_block();
    write_object_header(&mut block, VOLUME_OID, 1, OBJECT_TYPE_FS, 0);

    let mut c = Cursor::new(&mut block[32..]);
    c.write_u32::<LittleEndian>(APSB_MAGIC).unwrap();
    c.write_u32::<LittleEndian>(0).unwrap(); // fs_index
    c.write_u64::<LittleEndian>(0).unwrap(); // features
    c.write_u64::<LittleEndian>(0).unwrap(); // ro features
    c.write_u64::<LittleEndian>(0).unwrap(); // incompat features
    c.write_u64::<LittleEndian>(0).unwrap(); // unmount_time
    c.write_u64::<LittleEndian>(0).unwrap(); // fs_reserve_block_count
    c.write_u64::<LittleEndian>(0).unwrap(); // fs_quota_block_count
    c.write_u64::<LittleEndian>(fs_alloc_count).unwrap();
    c.write_all(&[0u8; 20]).unwrap(); // wrapped meta crypto state
    c.write_u32::<LittleEndian>(0).unwrap(); // root_tree_type
    c.write_u32::<LittleEndian>(0).unwrap(); // extentref_tree_type
    c.write_u32::<LittleEndian>(0).unwrap(); // snap_meta_tree_type
    c.write_u64::<LittleEndian>(vol_omap_wrapper_block).unwrap();
    c.write_u64::<LittleEndian>(root_tree_oid).unwrap();
    c.write_u64::<LittleEndian>(0).unwrap(); // extentref_tree_oid
    c.write_u64::<LittleEndian>(0).unwrap(); // snap_meta_tree_oid
    c.write_u64::<LittleEndian>(0).unwrap(); // revert_to_xid
    c.write_u64::<LittleEndian>(0).unwrap(); // revert_to_sblock_oid
    c.write_u64::<LittleEndian>(1000).unwrap(); // next_obj_id
    c.write_u64::<LittleEndian>(num_files).unwrap();
    c.write_u64::<LittleEndian>(num_directories).unwrap();
    c.write_u64::<LittleEndian>(0).unwrap(); // num_symlinks
    c.write_u64::<LittleEndian>(0).unwrap(); // num_other_fsobjects
    c.write_u64::<LittleEndian>(0).unwrap(); // num_snapshots
    c.write_u64::<LittleEndian>(0).unwrap(); // total_blocks_alloced
    c.write_u64::<LittleEndian>(0).unwrap(); // total_blocks_freed
    c.write_all(&[uuid_seed; 16]).unwrap();
    c.write_u64::<LittleEndian>(0).unwrap(); // last_mod_time
    c.write_u64::<LittleEndian>(0).unwrap(); // fs_flags
    c.write_all(&[0u8; 48]).unwrap(); // formatted_by
    for _ in 0..8 {
        c.write_all(&[0u8; 48]).unwrap(); // modified_by[8]
    }
    let mut name_buf = [0u8; 256];
    name_buf[..name.len()].copy_from_slice(name.as_bytes());
    c.write_all(&name_buf).unwrap();

    checksum_block(&mut block);
    block
}

/// Build and checksum an `omap_phys_t` wrapper pointing at `tree_root_block`.
fn build_omap_wrapper(tree_root_block: u64) -> Vec<u8> {
    let mut block = new_block();
    write_object_header(&mut block, 0, 1, OBJECT_TYPE_OMAP, 0);

    let mut c = Cursor::new(&mut block[32..]);
    c.write_u32::<LittleEndian>(0).unwrap(); // om_flags
    c.write_u32::<LittleEndian>(0).unwrap(); // om_snap_count
    c.write_u32::<LittleEndian>(0).unwrap(); // om_tree_type
    c.write_u32::<LittleEndian>(0).unwrap(); // om_snapshot_tree_type
    c.write_u64::<LittleEndian>(tree_root_block).unwrap();

    checksum_block(&mut block);
    block
}

/// Build a single root+leaf B-tree node holding `entries` (already in
/// ascending key order), laying keys out forward from the table of
/// contents and values backward from the footer.
fn build_node(fixed_kv: bool, fixed_key_size: u32, fixed_val_size: u32, entries: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
    let mut block = new_block();
    write_object_header(&mut block, 0, 1, OBJECT_TYPE_BTREE_NODE, 0);

    let nkeys = entries.len();
    let toc_entry_size = if fixed_kv { 4 } else { 8 };
    let table_space_len = nkeys * toc_entry_size;

    let toc_start = 32 + 24;
    let key_area_off = toc_start + table_space_len;
    let val_area_end = BLOCK_SIZE as usize - 40;

    let mut key_cursor = key_area_off;
    let mut val_cum = 0usize;
    let mut toc: Vec<(u16, u16, u16, u16)> = Vec::with_capacity(nkeys);
    let mut key_writes: Vec<(usize, &[u8])> = Vec::with_capacity(nkeys);
    let mut val_writes: Vec<(usize, &[u8])> = Vec::with_capacity(nkeys);

    for (k, v) in entries {
        let key_rel_off = (key_cursor - key_area_off) as u16;
        key_writes.push((key_cursor, k.as_slice()));
        key_cursor += k.len();

        val_cum += v.len();
        let val_off = val_cum as u16;
        let val_start = val_area_end - val_cum;
        val_writes.push((val_start, v.as_slice()));

        toc.push((key_rel_off, k.len() as u16, val_off, v.len() as u16));
    }

    assert!(key_cursor <= val_area_end - val_cum, "synthetic node: key/value areas overlap");

    {
        let mut c = Cursor::new(&mut block[32..32 + 24]);
        let flags = BTNODE_ROOT | BTNODE_LEAF | if fixed_kv { BTNODE_FIXED_KV_SIZE } else { 0 };
        c.write_u16::<LittleEndian>(flags).unwrap();
        c.write_u16::<LittleEndian>(0).unwrap(); // btn_level
        c.write_u32::<LittleEndian>(nkeys as u32).unwrap();
        c.write_u16::<LittleEndian>(0).unwrap(); // btn_table_space_off
        c.write_u16::<LittleEndian>(table_space_len as u16).unwrap();
        c.write_u16::<LittleEndian>(0).unwrap(); // btn_free_space_off
        c.write_u16::<LittleEndian>(0).unwrap(); // btn_free_space_len
        c.write_u16::<LittleEndian>(0).unwrap(); // btn_free_list_off
        c.write_u16::<LittleEndian>(0).unwrap(); // btn_free_list_len
        c.write_u16::<LittleEndian>(0).unwrap(); // btn_key_free_list_off
        c.write_u16::<LittleEndian>(0).unwrap(); // btn_key_free_list_len
        c.write_u16::<LittleEndian>(0).unwrap(); // btn_val_free_list_off
        c.write_u16::<LittleEndian>(0).unwrap(); // btn_val_free_list_len
    }

    {
        let mut c = Cursor::new(&mut block[toc_start..key_area_off]);
        for (key_off, key_len, val_off, val_len) in &toc {
            c.write_u16::<LittleEndian>(*key_off).unwrap();
            if !fixed_kv {
                c.write_u16::<LittleEndian>(*key_len).unwrap();
            }
            c.write_u16::<LittleEndian>(*val_off).unwrap();
            if !fixed_kv {
                c.write_u16::<LittleEndian>(*val_len).unwrap();
            }
        }
    }

    for (pos, bytes) in &key_writes {
        block[*pos..*pos + bytes.len()].copy_from_slice(bytes);
    }
    for (pos, bytes) in &val_writes {
        block[*pos..*pos + bytes.len()].copy_from_slice(bytes);
    }

    {
        let footer_start = BLOCK_SIZE as usize - 40;
        let mut c = Cursor::new(&mut block[footer_start..]);
        c.write_u32::<LittleEndian>(0).unwrap(); // bt_flags
        c.write_u32::<LittleEndian>(BLOCK_SIZE).unwrap(); // bt_node_size
        c.write_u32::<LittleEndian>(if fixed_kv { fixed_key_size } else { 0 }).unwrap();
        c.write_u32::<LittleEndian>(if fixed_kv { fixed_val_size } else { 0 }).unwrap();
        c.write_u32::<LittleEndian>(64).unwrap(); // bt_longest_key
        c.write_u32::<LittleEndian>(64).unwrap(); // bt_longest_val
        c.write_u64::<LittleEndian>(nkeys as u64).unwrap();
        c.write_u64::<LittleEndian>(1).unwrap(); // bt_node_count
    }

    checksum_block(&mut block);
    block
}

fn catalog_key(oid: u64, record_type: u8, secondary: &[u8]) -> Vec<u8> {
    let word = (oid & 0x0FFF_FFFF_FFFF_FFFF) | ((record_type as u64) << 60);
    let mut out = word.to_le_bytes().to_vec();
    out.extend_from_slice(secondary);
    out
}

fn inode_key(oid: u64) -> Vec<u8> {
    catalog_key(oid, 3 /* J_TYPE_INODE */, &[])
}

fn drec_key(parent_oid: u64, name: &str) -> Vec<u8> {
    let mut name_bytes = name.as_bytes().to_vec();
    name_bytes.push(0);
    let mut secondary = (name_bytes.len() as u32).to_le_bytes().to_vec();
    secondary.extend_from_slice(&name_bytes);
    catalog_key(parent_oid, 9 /* J_TYPE_DIR_REC */, &secondary)
}

fn xattr_key(oid: u64, name: &str) -> Vec<u8> {
    let mut name_bytes = name.as_bytes().to_vec();
    name_bytes.push(0);
    let mut secondary = (name_bytes.len() as u16).to_le_bytes().to_vec();
    secondary.extend_from_slice(&name_bytes);
    catalog_key(oid, 4 /* J_TYPE_XATTR */, &secondary)
}

fn file_extent_key(oid: u64, logical_addr: u64) -> Vec<u8> {
    catalog_key(oid, 8 /* J_TYPE_FILE_EXTENT */, &logical_addr.to_le_bytes())
}

fn inode_val(parent_id: u64, private_id: u64, mode: u16, nlink: i32, size: u64) -> Vec<u8> {
    let mut v = Vec::new();
    v.write_u64::<LittleEndian>(parent_id).unwrap();
    v.write_u64::<LittleEndian>(private_id).unwrap();
    v.write_i64::<LittleEndian>(0).unwrap(); // create_time
    v.write_i64::<LittleEndian>(0).unwrap(); // modify_time
    v.write_i64::<LittleEndian>(0).unwrap(); // change_time
    v.write_i64::<LittleEndian>(0).unwrap(); // access_time
    v.write_u64::<LittleEndian>(0).unwrap(); // internal_flags
    v.write_i32::<LittleEndian>(nlink).unwrap();
    v.write_u32::<LittleEndian>(0).unwrap(); // default_protection_class
    v.write_u32::<LittleEndian>(0).unwrap(); // write_generation_counter
    v.write_u32::<LittleEndian>(0).unwrap(); // bsd_flags
    v.write_u32::<LittleEndian>(0).unwrap(); // uid
    v.write_u32::<LittleEndian>(0).unwrap(); // gid
    v.write_u16::<LittleEndian>(mode).unwrap();
    v.write_u16::<LittleEndian>(0).unwrap(); // pad1
    v.write_u64::<LittleEndian>(size).unwrap(); // uncompressed_size
    v
}

fn drec_val(file_id: u64, dt_type: u16) -> Vec<u8> {
    let mut v = Vec::new();
    v.write_u64::<LittleEndian>(file_id).unwrap();
    v.write_i64::<LittleEndian>(0).unwrap(); // date_added
    v.write_u16::<LittleEndian>(dt_type).unwrap(); // flags
    v
}

fn file_extent_val(phys_block_num: u64, len: u64) -> Vec<u8> {
    let mut v = Vec::new();
    v.write_u64::<LittleEndian>(len & 0x00FF_FFFF_FFFF_FFFF).unwrap(); // flags_and_length
    v.write_u64::<LittleEndian>(phys_block_num).unwrap();
    v.write_u64::<LittleEndian>(0).unwrap(); // crypto_id
    v
}

fn omap_key(oid: u64, xid: u64) -> Vec<u8> {
    let mut v = Vec::new();
    v.write_u64::<LittleEndian>(oid).unwrap();
    v.write_u64::<LittleEndian>(xid).unwrap();
    v
}

fn omap_val(paddr: u64) -> Vec<u8> {
    let mut v = Vec::new();
    v.write_u32::<LittleEndian>(0).unwrap(); // om_val flags
    v.write_u32::<LittleEndian>(0).unwrap(); // size
    v.write_u64::<LittleEndian>(paddr).unwrap();
    v
}

fn pattern_block(seed: u8) -> Vec<u8> {
    let mut block = new_block();
    block.fill(seed);
    block
}

/// Block layout:
/// 0 NXSB, 1 container omap wrapper, 2 container omap btree, 3 APSB,
/// 4 volume omap wrapper, 5 volume omap btree, 6 catalog root,
/// 7..23 regular file's 16 data blocks.
///
/// "/file.txt" is a 16-block regular file, "/hole.txt" is a 2-block file
/// whose single extent is a hole, "/bad.txt" carries a misaligned extent
/// length that must surface as corruption.
pub fn build_basic_image() -> Vec<u8> {
    let catalog_entries = vec![
        (inode_key(ROOT_DIR_OID), inode_val(1, ROOT_DIR_OID, 0o040755, 3, 0)),
        (drec_key(ROOT_DIR_OID, "file.txt"), drec_val(REGULAR_FILE_OID, DT_REG)),
        (drec_key(ROOT_DIR_OID, "hole.txt"), drec_val(HOLE_FILE_OID, DT_REG)),
        (drec_key(ROOT_DIR_OID, "bad.txt"), drec_val(CORRUPT_FILE_OID, DT_REG)),
        (inode_key(REGULAR_FILE_OID), inode_val(ROOT_DIR_OID, REGULAR_FILE_OID, 0o100644, 1, REGULAR_FILE_LEN)),
        (xattr_key(REGULAR_FILE_OID, "com.test.attr"), b"hello world".to_vec()),
        (file_extent_key(REGULAR_FILE_OID, 0), file_extent_val(REGULAR_FILE_DATA_START, REGULAR_FILE_LEN)),
        (inode_key(HOLE_FILE_OID), inode_val(ROOT_DIR_OID, HOLE_FILE_OID, 0o100644, 1, HOLE_FILE_LEN)),
        (file_extent_key(HOLE_FILE_OID, 0), file_extent_val(0, HOLE_FILE_LEN)),
        (inode_key(CORRUPT_FILE_OID), inode_val(ROOT_DIR_OID, CORRUPT_FILE_OID, 0o100644, 1, CORRUPT_EXTENT_LEN)),
        (file_extent_key(CORRUPT_FILE_OID, 0), file_extent_val(CORRUPT_EXTENT_PHYS, CORRUPT_EXTENT_LEN)),
    ];

    let catalog_root = build_node(false, 0, 0, &catalog_entries);

    let vol_omap_entries = vec![(omap_key(CATALOG_ROOT_OID, 1), omap_val(6))];
    let vol_omap_btree = build_node(true, 16, 16, &vol_omap_entries);
    let vol_omap_wrapper = build_omap_wrapper(5);

    let apsb = build_apsb(4, CATALOG_ROOT_OID, 0, 1, 1, 0xAB, "test-volume");

    let container_omap_entries = vec![(omap_key(VOLUME_OID, 1), omap_val(3))];
    let container_omap_btree = build_node(true, 16, 16, &container_omap_entries);
    let container_omap_wrapper = build_omap_wrapper(2);

    let nxsb = build_nxsb(1, &[VOLUME_OID], (7 + REGULAR_FILE_LEN / BLOCK_SIZE as u64) as u64);

    let mut blocks = vec![
        nxsb,                   // 0
        container_omap_wrapper, // 1
        container_omap_btree,   // 2
        apsb,                   // 3
        vol_omap_wrapper,       // 4
        vol_omap_btree,         // 5
        catalog_root,           // 6
    ];

    for i in 0..(REGULAR_FILE_LEN / BLOCK_SIZE as u64) {
        blocks.push(pattern_block(i as u8));
    }

    blocks.concat()
}

/// Two volumes sharing one container: volume 0 mounts normally (matching
/// `build_basic_image`'s catalog/omap setup, minus the file content), volume
/// 1 is only ever read as a superblock during `statfs`'s container-omap walk.
pub fn build_two_volume_image(vol0_alloc_count: u64, vol1_alloc_count: u64, block_count: u64) -> Vec<u8> {
    let catalog_entries = vec![(inode_key(ROOT_DIR_OID), inode_val(1, ROOT_DIR_OID, 0o040755, 2, 0))];
    let catalog_root = build_node(false, 0, 0, &catalog_entries);

    let vol_omap_entries = vec![(omap_key(CATALOG_ROOT_OID, 1), omap_val(6))];
    let vol_omap_btree = build_node(true, 16, 16, &vol_omap_entries);
    let vol_omap_wrapper = build_omap_wrapper(5);

    let apsb0 = build_apsb(4, CATALOG_ROOT_OID, vol0_alloc_count, 0, 1, 0xCD, "volume-0");
    let apsb1 = build_apsb(0, 0, vol1_alloc_count, 2, 1, 0xEF, "volume-1");

    let container_omap_entries =
        vec![(omap_key(VOLUME_OID, 1), omap_val(3)), (omap_key(VOLUME2_OID, 1), omap_val(7))];
    let container_omap_btree = build_node(true, 16, 16, &container_omap_entries);
    let container_omap_wrapper = build_omap_wrapper(2);

    let nxsb = build_nxsb(1, &[VOLUME_OID], block_count);

    let blocks = vec![
        nxsb,                   // 0
        container_omap_wrapper, // 1
        container_omap_btree,   // 2
        apsb0,                  // 3
        vol_omap_wrapper,       // 4
        vol_omap_btree,         // 5
        catalog_root,           // 6
        apsb1,                  // 7
    ];

    blocks.concat()
}

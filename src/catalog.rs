//! Catalog record types and the directory/inode/extent/xattr lookups built
//! on top of the generic B-tree query/scan engine (`btree`) and the catalog
//! key codec (`key`).

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek};

use crate::btree::{self, QueryFlags, Table};
use crate::error::{ApfsError, Result};
use crate::key::{CatalogKey, Secondary, J_TYPE_DIR_REC, J_TYPE_FILE_EXTENT, J_TYPE_INODE, J_TYPE_XATTR};
use crate::object::Device;
use crate::{DirEntry, EntryKind};

// Well-known OIDs
pub const ROOT_DIR_PARENT: u64 = 1; // Parent OID of root directory
pub const ROOT_DIR_RECORD: u64 = 2; // OID of the root directory inode

// Inode types (from BSD mode)
pub const INODE_DIR_TYPE: u16 = 0o040000; // S_IFDIR
pub const INODE_FILE_TYPE: u16 = 0o100000; // S_IFREG
pub const INODE_SYMLINK_TYPE: u16 = 0o120000; // S_IFLNK

// Extended field types (INO_EXT_TYPE_*)
const INO_EXT_TYPE_DSTREAM: u8 = 8;

// DT_* constants for directory entry types
pub const DT_REG: u16 = 8; // Regular file
pub const DT_DIR: u16 = 4; // Directory
pub const DT_LNK: u16 = 10; // Symbolic link

/// Parsed inode value from a catalog record.
#[derive(Debug, Clone)]
pub struct InodeVal {
    pub parent_id: u64,
    pub private_id: u64,
    pub create_time: i64,
    pub modify_time: i64,
    pub change_time: i64,
    pub access_time: i64,
    pub internal_flags: u64,
    pub nchildren_or_nlink: i32,
    pub default_protection_class: u32,
    pub write_generation_counter: u32,
    pub bsd_flags: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u16,
    pub pad1: u16,
    pub uncompressed_size: u64,
    /// Logical file size from the dstream xfield (if present).
    pub dstream_size: Option<u64>,
}

impl InodeVal {
    /// Fixed size of j_inode_val_t before xfields
    const FIXED_SIZE: usize = 92;

    /// Parse from raw catalog value bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::FIXED_SIZE {
            return Err(ApfsError::CorruptedData(format!(
                "inode value too short: {} bytes",
                data.len()
            )));
        }
        let mut cursor = Cursor::new(data);
        let parent_id = cursor.read_u64::<LittleEndian>()?;
        let private_id = cursor.read_u64::<LittleEndian>()?;
        let create_time = cursor.read_i64::<LittleEndian>()?;
        let modify_time = cursor.read_i64::<LittleEndian>()?;
        let change_time = cursor.read_i64::<LittleEndian>()?;
        let access_time = cursor.read_i64::<LittleEndian>()?;
        let internal_flags = cursor.read_u64::<LittleEndian>()?;
        let nchildren_or_nlink = cursor.read_i32::<LittleEndian>()?;
        let default_protection_class = cursor.read_u32::<LittleEndian>()?;
        let write_generation_counter = cursor.read_u32::<LittleEndian>()?;
        let bsd_flags = cursor.read_u32::<LittleEndian>()?;
        let uid = cursor.read_u32::<LittleEndian>()?;
        let gid = cursor.read_u32::<LittleEndian>()?;
        let mode = cursor.read_u16::<LittleEndian>()?;
        let pad1 = cursor.read_u16::<LittleEndian>()?;
        let uncompressed_size = cursor.read_u64::<LittleEndian>()?;

        let dstream_size = Self::parse_dstream_size(&data[Self::FIXED_SIZE..]);

        Ok(InodeVal {
            parent_id,
            private_id,
            create_time,
            modify_time,
            change_time,
            access_time,
            internal_flags,
            nchildren_or_nlink,
            default_protection_class,
            write_generation_counter,
            bsd_flags,
            uid,
            gid,
            mode,
            pad1,
            uncompressed_size,
            dstream_size,
        })
    }

    /// Parse xfields to extract dstream size.
    /// Layout: xf_blob_t { xf_num_exts: u16, xf_used_data: u16 }
    /// followed by x_field_t[xf_num_exts] { x_type: u8, x_flags: u8, x_size: u16 }
    /// followed by the actual field data values (each padded to 8-byte alignment).
    fn parse_dstream_size(xfield_data: &[u8]) -> Option<u64> {
        if xfield_data.len() < 4 {
            return None;
        }
        let xf_num_exts = u16::from_le_bytes([xfield_data[0], xfield_data[1]]) as usize;
        if xf_num_exts == 0 {
            return None;
        }

        let entries_start = 4;
        let entries_end = entries_start + xf_num_exts * 4;
        if entries_end > xfield_data.len() {
            return None;
        }

        let mut data_offset = entries_end;

        for i in 0..xf_num_exts {
            let entry_off = entries_start + i * 4;
            let x_type = xfield_data[entry_off];
            let x_size =
                u16::from_le_bytes([xfield_data[entry_off + 2], xfield_data[entry_off + 3]]) as usize;

            if x_type == INO_EXT_TYPE_DSTREAM && x_size >= 8 && data_offset + 8 <= xfield_data.len() {
                let size = u64::from_le_bytes(
                    xfield_data[data_offset..data_offset + 8].try_into().unwrap(),
                );
                return Some(size);
            }

            let padded_size = (x_size + 7) & !7;
            data_offset += padded_size;
        }

        None
    }

    /// Get the file type from the mode field
    pub fn kind(&self) -> u16 {
        self.mode & 0o170000
    }

    /// Get the logical file size.
    /// Prefers dstream size from xfields; falls back to uncompressed_size.
    pub fn size(&self) -> u64 {
        self.dstream_size.unwrap_or(self.uncompressed_size)
    }

    pub fn nlink(&self) -> u32 {
        self.nchildren_or_nlink as u32
    }
}

/// Directory record value (j_drec_val_t)
#[derive(Debug, Clone)]
pub struct DrecVal {
    pub file_id: u64,
    pub date_added: i64,
    pub flags: u16,
}

impl DrecVal {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 18 {
            return Err(ApfsError::CorruptedData(format!(
                "drec value too short: {} bytes",
                data.len()
            )));
        }
        let mut cursor = Cursor::new(data);
        let file_id = cursor.read_u64::<LittleEndian>()?;
        let date_added = cursor.read_i64::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;

        Ok(DrecVal { file_id, date_added, flags })
    }

    /// Get the file type from the flags field (DT_* from dirent.h)
    pub fn file_type(&self) -> u16 {
        self.flags & 0x000F
    }
}

/// File extent value (j_file_extent_val_t)
#[derive(Debug, Clone)]
pub struct FileExtentVal {
    pub flags_and_length: u64,
    pub phys_block_num: u64,
    pub crypto_id: u64,
}

impl FileExtentVal {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 24 {
            return Err(ApfsError::CorruptedData(format!(
                "file extent value too short: {} bytes",
                data.len()
            )));
        }
        let mut cursor = Cursor::new(data);
        let flags_and_length = cursor.read_u64::<LittleEndian>()?;
        let phys_block_num = cursor.read_u64::<LittleEndian>()?;
        let crypto_id = cursor.read_u64::<LittleEndian>()?;

        Ok(FileExtentVal { flags_and_length, phys_block_num, crypto_id })
    }

    /// Get the logical length in bytes (lower 56 bits)
    pub fn length(&self) -> u64 {
        self.flags_and_length & 0x00FF_FFFF_FFFF_FFFF
    }
}

/// Extract the name from a directory record key (j_drec_hashed_key_t).
/// After the 8-byte obj_id_and_type, there's a 4-byte name_len_and_hash
/// (lower 10 bits are the length) followed by a NUL-terminated UTF-8 name.
fn decode_drec_name(key_bytes: &[u8]) -> Result<String> {
    if key_bytes.len() < 12 {
        return Err(ApfsError::InvalidBTree("drec key too short for name".into()));
    }

    let name_len_and_hash = u32::from_le_bytes(key_bytes[8..12].try_into().unwrap());
    let name_len = (name_len_and_hash & 0x0000_03FF) as usize;

    let name_start = 12;
    let name_end = name_start + name_len;
    if name_end > key_bytes.len() {
        return Err(ApfsError::InvalidBTree(format!(
            "drec name extends beyond key: name_end={name_end}, key_len={}",
            key_bytes.len()
        )));
    }

    let name_bytes = &key_bytes[name_start..name_end];
    let nul_pos = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
    Ok(String::from_utf8_lossy(&name_bytes[..nul_pos]).to_string())
}

/// Extract the name from an xattr key (j_xattr_key_t): 8-byte header, a
/// 2-byte name_len (unhashed, unlike the directory record key), then the
/// NUL-terminated UTF-8 name.
fn decode_xattr_name(key_bytes: &[u8]) -> Result<String> {
    if key_bytes.len() < 10 {
        return Err(ApfsError::InvalidBTree("xattr key too short for name".into()));
    }
    let name_len = u16::from_le_bytes(key_bytes[8..10].try_into().unwrap()) as usize;
    let name_start = 10;
    let name_end = name_start + name_len;
    if name_end > key_bytes.len() {
        return Err(ApfsError::InvalidBTree(format!(
            "xattr name extends beyond key: name_end={name_end}, key_len={}",
            key_bytes.len()
        )));
    }
    let name_bytes = &key_bytes[name_start..name_end];
    let nul_pos = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
    Ok(String::from_utf8_lossy(&name_bytes[..nul_pos]).to_string())
}

/// List directory entries for a given parent OID.
pub fn list_directory<R: Read + Seek>(
    device: &mut Device<R>,
    catalog_root: &Table,
    omap_root: &Table,
    parent_oid: u64,
) -> Result<Vec<DirEntry>> {
    let entries = btree::scan(
        device,
        catalog_root,
        0,
        0,
        &CatalogKey::bucket_classify(parent_oid, J_TYPE_DIR_REC),
        Some(omap_root),
    )?;

    let mut dir_entries = Vec::new();
    for (key, val) in &entries {
        let name = match decode_drec_name(key) {
            Ok(n) => n,
            Err(_) => continue,
        };

        let drec = match DrecVal::parse(val) {
            Ok(d) => d,
            Err(_) => continue,
        };

        let kind = match drec.file_type() {
            DT_DIR => EntryKind::Directory,
            DT_LNK => EntryKind::Symlink,
            _ => EntryKind::File,
        };

        let (size, create_time, modify_time) =
            match lookup_inode(device, catalog_root, omap_root, drec.file_id) {
                Ok(inode) => (inode.size(), inode.create_time, inode.modify_time),
                Err(_) => (0, 0, 0),
            };

        dir_entries.push(DirEntry {
            name,
            oid: drec.file_id,
            kind,
            size,
            create_time,
            modify_time,
        });
    }

    Ok(dir_entries)
}

/// Look up an inode record in the catalog B-tree.
pub fn lookup_inode<R: Read + Seek>(
    device: &mut Device<R>,
    catalog_root: &Table,
    omap_root: &Table,
    oid: u64,
) -> Result<InodeVal> {
    let result = btree::query(
        device,
        catalog_root,
        0,
        0,
        &CatalogKey::exact_cmp(oid, J_TYPE_INODE),
        QueryFlags::Exact,
        Some(omap_root),
    )
    .map_err(|_| ApfsError::FileNotFound(format!("inode OID {oid}")))?;

    InodeVal::parse(result.value())
}

/// Find the extent covering `logical_addr` in `file_oid`'s extent set: the
/// greatest `FILE_EXTENT` key at or below `logical_addr`. Returns the
/// extent's own starting logical address alongside its value so the caller
/// can compute the offset within it.
pub fn lookup_extent_at<R: Read + Seek>(
    device: &mut Device<R>,
    catalog_root: &Table,
    omap_root: &Table,
    file_oid: u64,
    logical_addr: u64,
) -> Result<Option<(u64, FileExtentVal)>> {
    let result = match btree::query(
        device,
        catalog_root,
        0,
        0,
        &CatalogKey::le_extent_cmp(file_oid, logical_addr),
        QueryFlags::Le,
        Some(omap_root),
    ) {
        Ok(r) => r,
        Err(ApfsError::NotFound) => return Ok(None),
        Err(e) => return Err(e),
    };

    let key = CatalogKey::decode(result.key())?;
    if key.oid != file_oid || key.record_type != J_TYPE_FILE_EXTENT {
        return Ok(None);
    }
    let start = match key.secondary {
        Secondary::LogicalAddr(addr) => addr,
        _ => return Ok(None),
    };

    Ok(Some((start, FileExtentVal::parse(result.value())?)))
}

/// Look up the raw (undecoded) value bytes of a named extended attribute.
pub fn lookup_xattr_raw<R: Read + Seek>(
    device: &mut Device<R>,
    catalog_root: &Table,
    omap_root: &Table,
    oid: u64,
    name: &str,
) -> Result<Vec<u8>> {
    let entries = btree::scan(
        device,
        catalog_root,
        0,
        0,
        &CatalogKey::bucket_classify(oid, J_TYPE_XATTR),
        Some(omap_root),
    )?;

    for (key, val) in &entries {
        if let Ok(entry_name) = decode_xattr_name(key) {
            if entry_name == name {
                return Ok(val.clone());
            }
        }
    }

    Err(ApfsError::NotFound)
}

/// Resolve a path like "/Applications/Upscayl.app/Contents/Info.plist" to its (OID, InodeVal).
pub fn resolve_path<R: Read + Seek>(
    device: &mut Device<R>,
    catalog_root: &Table,
    omap_root: &Table,
    path: &str,
) -> Result<(u64, InodeVal)> {
    let path = path.trim_matches('/');

    if path.is_empty() {
        let inode = lookup_inode(device, catalog_root, omap_root, ROOT_DIR_RECORD)?;
        return Ok((ROOT_DIR_RECORD, inode));
    }

    let components: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let mut current_parent = ROOT_DIR_RECORD;

    for (i, component) in components.iter().enumerate() {
        let drec = lookup_drec(device, catalog_root, omap_root, current_parent, component)?;

        if i == components.len() - 1 {
            let inode = lookup_inode(device, catalog_root, omap_root, drec.file_id)?;
            return Ok((drec.file_id, inode));
        }

        if drec.file_type() != DT_DIR {
            return Err(ApfsError::NotADirectory(components[..=i].join("/")));
        }

        current_parent = drec.file_id;
    }

    unreachable!()
}

/// Look up a specific directory record by name under a parent OID.
fn lookup_drec<R: Read + Seek>(
    device: &mut Device<R>,
    catalog_root: &Table,
    omap_root: &Table,
    parent_oid: u64,
    name: &str,
) -> Result<DrecVal> {
    let entries = btree::scan(
        device,
        catalog_root,
        0,
        0,
        &CatalogKey::bucket_classify(parent_oid, J_TYPE_DIR_REC),
        Some(omap_root),
    )?;

    for (key, val) in &entries {
        if let Ok(entry_name) = decode_drec_name(key) {
            if entry_name == name {
                return DrecVal::parse(val);
            }
        }
    }

    Err(ApfsError::FileNotFound(name.to_string()))
}

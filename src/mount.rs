//! C7: mount bootstrap, teardown, and space accounting.
//!
//! `Mount::open` walks the container superblock, the mount's chosen volume,
//! and the two object maps needed to reach the catalog root, in the order
//! the on-disk structures actually depend on each other. `Mount`'s fields
//! are declared in the reverse of that order so that Rust's declared-field
//! drop order tears them down correctly: catalog root, then volume omap,
//! then volume/container superblocks.

use std::io::{Read, Seek};
use std::sync::{Arc, Mutex};

use crate::btree::{self, ScanSignal, Table};
use crate::catalog::{self, InodeVal};
use crate::error::{ApfsError, Result};
use crate::object::Device;
use crate::omap;
use crate::superblock::{self, ApfsSuperblock, NxSuperblock, NX_SUPERBLOCK_FIXED_SIZE};

/// Parsed `vol=`/`uid=`/`gid=` mount options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    /// Index into the container's `fs_oids` array. Defaults to 0.
    pub vol_index: u32,
    pub uid_override: Option<u32>,
    pub gid_override: Option<u32>,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions { vol_index: 0, uid_override: None, gid_override: None }
    }
}

impl MountOptions {
    /// Parse a comma-separated option string. An unrecognized key, a
    /// key with no `=value`, or a value that doesn't parse as the expected
    /// integer type is `InvalidOptions`.
    pub fn parse(options: &str) -> Result<Self> {
        let mut parsed = MountOptions::default();

        for pair in options.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ApfsError::InvalidOptions(pair.to_string()))?;

            let as_u32 = || value.parse::<u32>().map_err(|_| ApfsError::InvalidOptions(pair.to_string()));

            match key {
                "vol" => parsed.vol_index = as_u32()?,
                "uid" => parsed.uid_override = Some(as_u32()?),
                "gid" => parsed.gid_override = Some(as_u32()?),
                other => return Err(ApfsError::InvalidOptions(other.to_string())),
            }
        }

        Ok(parsed)
    }
}

/// Filesystem type magic reported by `Mount::statfs`, the APFS counterpart
/// of the `f_type` field other filesystems fill in from their own magic.
pub const SUPER_MAGIC: u32 = 0x5346_5041;

/// Space accounting result for `Mount::statfs`.
#[derive(Debug, Clone, Copy)]
pub struct StatFs {
    pub block_size: u32,
    pub blocks_total: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files_total: u64,
    /// Unset: APFS has no fixed inode table to report a free count against.
    pub files_free: Option<u64>,
    pub filesystem_id: u64,
    pub filesystem_type: u32,
}

/// A mounted APFS volume: the container and volume superblocks plus the two
/// object maps and the catalog root needed to resolve any path.
///
/// Field order is load-bearing — see the module doc comment.
pub struct Mount<R: Read + Seek> {
    catalog_root: Table,
    omap_root: Table,
    volume_sb: ApfsSuperblock,
    container_sb: NxSuperblock,
    device: Arc<Mutex<Device<R>>>,
    options: MountOptions,
}

impl<R: Read + Seek> Mount<R> {
    /// Mount the first volume (`vol=0`) with no uid/gid overrides.
    pub fn open(reader: R) -> Result<Self> {
        Self::open_with_options(reader, "")
    }

    /// Mount with a comma-separated option string (see `MountOptions::parse`).
    pub fn open_with_options(reader: R, options_str: &str) -> Result<Self> {
        let options = MountOptions::parse(options_str)?;

        // Phase 1: map the container superblock (default 4096, re-read at
        // the authoritative block size if different), then take the
        // newest checkpoint if the descriptor area holds one.
        let mut device = Device::new(reader, crate::object::NX_DEFAULT_BLOCK_SIZE);
        let nxsb = superblock::read_nxsb(&mut device)?;
        let container_sb = superblock::find_latest_nxsb(&mut device, &nxsb)?;

        // Phase 3: bounds-check vol_index against the block that actually
        // holds fs_oids, then map the volume superblock.
        let vol_index = options.vol_index as usize;
        let fs_oid_end = NX_SUPERBLOCK_FIXED_SIZE as u64 + 8 * (vol_index as u64 + 1);
        if fs_oid_end > container_sb.block_size as u64 {
            return Err(ApfsError::InvalidOptions(format!(
                "vol index {vol_index} out of range for block size {}",
                container_sb.block_size
            )));
        }
        let vol_oid = container_sb.fs_oids.get(vol_index).copied().unwrap_or(0);
        if vol_oid == 0 {
            log::error!("no volume at index {vol_index}");
            return Err(ApfsError::InvalidOptions(format!("no such volume: vol={vol_index}")));
        }

        let container_omap_root = omap::read_omap_root(&mut device, container_sb.omap_oid)?;
        let vol_block = omap::omap_lookup(&mut device, &container_omap_root, vol_oid)?;
        let (_, vol_buffer) = device.read_object(vol_block)?;
        let volume_sb = ApfsSuperblock::parse(&vol_buffer)?;

        // Phase 4: load the volume's own omap root.
        let omap_root = omap::read_omap_root(&mut device, volume_sb.omap_oid)?;

        // Phase 5: resolve the virtual catalog root through it.
        let catalog_root = omap::omap_read_table(&mut device, &omap_root, volume_sb.root_tree_oid)?;

        // Phase 6: install the root directory inode — a sanity query that
        // every other entry point assumes succeeded.
        catalog::lookup_inode(&mut device, &catalog_root, &omap_root, catalog::ROOT_DIR_RECORD)?;

        Ok(Mount {
            catalog_root,
            omap_root,
            volume_sb,
            container_sb,
            device: Arc::new(Mutex::new(device)),
            options,
        })
    }

    pub fn container_superblock(&self) -> &NxSuperblock {
        &self.container_sb
    }

    pub fn volume_superblock(&self) -> &ApfsSuperblock {
        &self.volume_sb
    }

    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    pub fn block_size(&self) -> u32 {
        self.container_sb.block_size
    }

    pub(crate) fn catalog_root(&self) -> &Table {
        &self.catalog_root
    }

    pub(crate) fn omap_root(&self) -> &Table {
        &self.omap_root
    }

    pub(crate) fn device(&self) -> Arc<Mutex<Device<R>>> {
        self.device.clone()
    }

    /// Metadata for the volume's root directory.
    pub fn root(&self) -> Result<InodeVal> {
        let mut device = self.device.lock().unwrap();
        catalog::lookup_inode(&mut device, &self.catalog_root, &self.omap_root, catalog::ROOT_DIR_RECORD)
    }

    /// Non-default mount options, formatted the way they were supplied.
    pub fn show_options(&self) -> String {
        let mut parts = Vec::new();
        if self.options.vol_index != 0 {
            parts.push(format!("vol={}", self.options.vol_index));
        }
        if let Some(uid) = self.options.uid_override {
            parts.push(format!("uid={uid}"));
        }
        if let Some(gid) = self.options.gid_override {
            parts.push(format!("gid={gid}"));
        }
        parts.join(",")
    }

    /// Walk the container's object map, summing `apfs_fs_alloc_count` across
    /// every volume superblock it resolves to.
    pub fn statfs(&self) -> Result<StatFs> {
        let mut device = self.device.lock().unwrap();

        let container_omap_root = omap::read_omap_root(&mut device, self.container_sb.omap_oid)?;
        let records = btree::scan(&mut device, &container_omap_root, 16, 16, &|_key| ScanSignal::Take, None)?;

        let mut used_blocks = 0u64;
        for (_key, val) in &records {
            if val.len() != 16 {
                return Err(ApfsError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "container omap record is not 16 bytes",
                )));
            }
            let block_no = u64::from_le_bytes(val[8..16].try_into().unwrap());
            let block = match device.read_block(block_no) {
                Ok(b) => b,
                Err(_) => continue,
            };
            if let Ok(sb) = ApfsSuperblock::parse(&block) {
                used_blocks += sb.fs_alloc_count;
            }
        }

        let blocks_total = self.container_sb.block_count;
        let blocks_free = blocks_total.saturating_sub(used_blocks);
        let files_total = self.volume_sb.num_files
            + self.volume_sb.num_directories
            + self.volume_sb.num_symlinks
            + self.volume_sb.num_other_fsobjects;

        Ok(StatFs {
            block_size: self.container_sb.block_size,
            blocks_total,
            blocks_free,
            blocks_available: blocks_free,
            files_total,
            files_free: None,
            filesystem_id: fold_uuid(&self.volume_sb.uuid),
            filesystem_type: SUPER_MAGIC,
        })
    }
}

/// XOR-fold a 16-byte UUID's two 64-bit halves into a single filesystem
/// identifier.
fn fold_uuid(uuid: &[u8; 16]) -> u64 {
    let high = u64::from_le_bytes(uuid[0..8].try_into().unwrap());
    let low = u64::from_le_bytes(uuid[8..16].try_into().unwrap());
    high ^ low
}

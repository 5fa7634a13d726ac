pub mod btree;
pub mod catalog;
pub mod error;
pub mod extents;
pub mod fletcher;
pub mod key;
pub mod mount;
pub mod object;
pub mod omap;
pub mod superblock;

pub use error::{ApfsError, Result};
pub use mount::{Mount, MountOptions, StatFs, SUPER_MAGIC};

use std::io::{Read, Seek, Write};

use object::Device;

/// Entry kind in the filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// A directory entry returned by `Mount::list_directory`.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub oid: u64,
    pub kind: EntryKind,
    pub size: u64,
    pub create_time: i64,
    pub modify_time: i64,
}

/// Detailed file/directory metadata.
#[derive(Debug, Clone)]
pub struct FileStat {
    pub oid: u64,
    pub kind: EntryKind,
    pub size: u64,
    pub create_time: i64,
    pub modify_time: i64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u16,
    pub nlink: u32,
}

/// Entry from `Mount::walk` — includes the full path.
#[derive(Debug, Clone)]
pub struct WalkEntry {
    pub path: String,
    pub entry: DirEntry,
}

/// Summary volume metadata.
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub name: String,
    pub block_size: u32,
    pub num_files: u64,
    pub num_directories: u64,
    pub num_symlinks: u64,
}

fn kind_of(inode: &catalog::InodeVal) -> EntryKind {
    match inode.kind() {
        catalog::INODE_DIR_TYPE => EntryKind::Directory,
        catalog::INODE_SYMLINK_TYPE => EntryKind::Symlink,
        _ => EntryKind::File,
    }
}

/// Host-facing path/directory/file operations, built on top of `Mount`'s
/// bootstrap state (`mount.rs`) and the catalog/extent modules.
impl<R: Read + Seek> Mount<R> {
    fn with_device<T>(&self, f: impl FnOnce(&mut Device<R>) -> Result<T>) -> Result<T> {
        let device = self.device();
        let mut guard = device.lock().unwrap();
        f(&mut guard)
    }

    fn inode_handle(&self, private_id: u64) -> extents::Inode<R> {
        extents::Inode::new(
            self.device(),
            self.catalog_root().clone(),
            self.omap_root().clone(),
            self.block_size(),
            private_id,
        )
    }

    /// Summary metadata for the mounted volume.
    pub fn volume_info(&self) -> VolumeInfo {
        let sb = self.volume_superblock();
        VolumeInfo {
            name: sb.volume_name.clone(),
            block_size: self.block_size(),
            num_files: sb.num_files,
            num_directories: sb.num_directories,
            num_symlinks: sb.num_symlinks,
        }
    }

    fn resolve_dir_oid(&self, path: &str) -> Result<u64> {
        if path == "/" || path.is_empty() {
            return Ok(catalog::ROOT_DIR_RECORD);
        }
        let (oid, inode) = self
            .with_device(|device| catalog::resolve_path(device, self.catalog_root(), self.omap_root(), path))?;
        if inode.kind() != catalog::INODE_DIR_TYPE {
            return Err(ApfsError::NotADirectory(path.to_string()));
        }
        Ok(oid)
    }

    /// List entries in a directory by path.
    pub fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>> {
        let parent_oid = self.resolve_dir_oid(path)?;
        self.with_device(|device| catalog::list_directory(device, self.catalog_root(), self.omap_root(), parent_oid))
    }

    /// Get metadata for a file or directory.
    pub fn stat(&self, path: &str) -> Result<FileStat> {
        let (oid, inode) = self
            .with_device(|device| catalog::resolve_path(device, self.catalog_root(), self.omap_root(), path))?;

        Ok(FileStat {
            oid,
            kind: kind_of(&inode),
            size: inode.size(),
            create_time: inode.create_time,
            modify_time: inode.modify_time,
            uid: inode.uid,
            gid: inode.gid,
            mode: inode.mode,
            nlink: inode.nlink(),
        })
    }

    /// Check whether a path exists.
    pub fn exists(&self, path: &str) -> Result<bool> {
        match self.with_device(|device| catalog::resolve_path(device, self.catalog_root(), self.omap_root(), path)) {
            Ok(_) => Ok(true),
            Err(ApfsError::FileNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Open a file for streaming `Read + Seek` access.
    pub fn open_file(&self, path: &str) -> Result<extents::ApfsForkReader<R>> {
        let (_oid, inode) = self
            .with_device(|device| catalog::resolve_path(device, self.catalog_root(), self.omap_root(), path))?;
        Ok(extents::ApfsForkReader::new(self.inode_handle(inode.private_id), inode.size()))
    }

    /// Read an entire file into memory.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.read_file_to(path, &mut buf)?;
        Ok(buf)
    }

    /// Stream a file's contents to a writer.
    pub fn read_file_to<W: Write>(&self, path: &str, writer: &mut W) -> Result<u64> {
        let (_oid, inode) = self
            .with_device(|device| catalog::resolve_path(device, self.catalog_root(), self.omap_root(), path))?;
        extents::read_file_data(&self.inode_handle(inode.private_id), inode.size(), writer)
    }

    /// Look up a named extended attribute's raw value.
    pub fn read_xattr(&self, path: &str, name: &str) -> Result<Vec<u8>> {
        let (oid, _inode) = self
            .with_device(|device| catalog::resolve_path(device, self.catalog_root(), self.omap_root(), path))?;
        self.with_device(|device| catalog::lookup_xattr_raw(device, self.catalog_root(), self.omap_root(), oid, name))
    }

    /// Recursively walk every entry in the volume.
    pub fn walk(&self) -> Result<Vec<WalkEntry>> {
        let mut entries = Vec::new();
        self.walk_recursive(catalog::ROOT_DIR_RECORD, "", &mut entries)?;
        Ok(entries)
    }

    fn walk_recursive(&self, parent_oid: u64, parent_path: &str, entries: &mut Vec<WalkEntry>) -> Result<()> {
        let dir_entries =
            self.with_device(|device| catalog::list_directory(device, self.catalog_root(), self.omap_root(), parent_oid))?;

        for entry in dir_entries {
            let full_path = if parent_path.is_empty() {
                format!("/{}", entry.name)
            } else {
                format!("{parent_path}/{}", entry.name)
            };

            let is_dir = entry.kind == EntryKind::Directory;
            let oid = entry.oid;

            entries.push(WalkEntry { path: full_path.clone(), entry });

            if is_dir {
                self.walk_recursive(oid, &full_path, entries)?;
            }
        }

        Ok(())
    }
}
